use std::path::PathBuf;

use clap::{ArgAction, Parser};
use hex_literal::hex;
use tracing::{Level, debug, info, warn};

use presto_bridge::bridge::Bridge;
use presto_bridge::codec::BitCodec;
use presto_bridge::config::{BridgeConfig, PinOverride};
use presto_bridge::frame::Direction;
use presto_bridge::intercept::{InterceptionPolicy, Passthrough, Remap};
use presto_bridge::logging::{setup_logging_file, setup_logging_stdio};
use presto_bridge::relay::RelayStats;

/// How long a stalled keyboard holds its lines before giving up.
const STALL_HOLD: u64 = 5_000;

/// Presto keyboard bridge
/// Relays keystrokes from a legacy keyboard to the Presto Machine and host
/// commands back, with an optional byte remapping hook
#[derive(Parser)]
#[command(name = "presto-bridge")]
#[command(about = "A man-in-the-middle keyboard bridge for the Presto Machine")]
struct Args {
    /// Keyboard framing, e.g. lsb,falling,odd,stop
    #[arg(long, value_name = "CODEC")]
    keyboard_codec: BitCodec,

    /// Host bus framing, e.g. msb,rising,none
    #[arg(long, value_name = "CODEC")]
    host_codec: BitCodec,

    /// Link framing between the two boards
    #[arg(long, value_name = "CODEC")]
    link_codec: Option<BitCodec>,

    /// Bytes the keyboard sends, parsed as hex
    #[arg(long, num_args = 1.., value_parser = parse_hex, value_name = "HEX")]
    send: Vec<u8>,

    /// Commands the host sends to the keyboard, parsed as hex
    #[arg(long, num_args = 1.., value_parser = parse_hex, value_name = "HEX")]
    command: Vec<u8>,

    /// Rewrite a keyboard byte on its way to the host, repeatable
    #[arg(long, value_parser = parse_remap, value_name = "FROM=TO")]
    remap: Vec<(u8, u8)>,

    /// Drop keyboard bytes on their way to the host
    #[arg(long, num_args = 1.., value_parser = parse_hex, value_name = "HEX")]
    suppress: Vec<u8>,

    /// Address table, comma separated hex
    #[arg(long, value_delimiter = ',', value_parser = parse_hex, value_name = "HEX,...")]
    addresses: Vec<u8>,

    /// Address table entry to select before relaying
    #[arg(long, value_name = "INDEX")]
    select: Option<usize>,

    /// Keystrokes the feeder injects toward the host, parsed as hex
    #[arg(long, num_args = 1.., value_parser = parse_hex, value_name = "HEX")]
    inject: Vec<u8>,

    /// Stall the keyboard's first frame after this many bits
    #[arg(long, value_name = "BITS")]
    stall_after: Option<usize>,

    /// Rebind a pin, e.g. feeder:status-out=13, repeatable
    #[arg(long = "pin", value_name = "BOARD:ROLE=PIN")]
    pins: Vec<PinOverride>,

    /// Write the log here instead of stdout
    #[arg(long, value_name = "PATH")]
    log_file: Option<PathBuf>,

    /// Enable verbose output (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

fn parse_hex(s: &str) -> Result<u8, Box<dyn std::error::Error + Send + Sync>> {
    let s = s.trim();
    let s = s.strip_prefix("0x").unwrap_or(s);
    Ok(u8::from_str_radix(s, 16)?)
}

fn parse_remap(s: &str) -> Result<(u8, u8), Box<dyn std::error::Error + Send + Sync>> {
    let (from, to) = s.split_once('=').ok_or("expected FROM=TO")?;
    Ok((parse_hex(from)?, parse_hex(to)?))
}

fn report(name: &str, stats: &RelayStats) {
    info!(
        "{name}: received {} forwarded {} modified {} suppressed {} injected {} acknowledged {}",
        stats.received,
        stats.forwarded,
        stats.modified,
        stats.suppressed,
        stats.injected,
        stats.acknowledged
    );
    if stats.yielded > 0 {
        debug!("{name}: gave way {} times on a shared line", stats.yielded);
    }
    let faults = stats.timeouts
        + stats.ack_timeouts
        + stats.violations
        + stats.contentions
        + stats.rejected;
    if faults > 0 || stats.dropped > 0 {
        warn!(
            "{name}: dropped {} timeouts {} ack timeouts {} violations {} contentions {} rejected {}",
            stats.dropped,
            stats.timeouts,
            stats.ack_timeouts,
            stats.violations,
            stats.contentions,
            stats.rejected
        );
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let level = match args.verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    match &args.log_file {
        Some(path) => setup_logging_file(level, path)?,
        None => setup_logging_stdio(level),
    }

    let config = BridgeConfig::from_args(
        args.keyboard_codec,
        args.host_codec,
        args.link_codec,
        &args.addresses,
        &args.pins,
    )?;
    info!(
        "Keyboard {}, link {}, host {}",
        config.keyboard.codec, config.link.codec, config.host.codec
    );
    info!("Address table {:?}", config.addresses);

    let mut remap = Remap::new();
    for &(from, to) in &args.remap {
        remap = remap.map(Direction::KeyboardToHost, from, to);
    }
    for &byte in &args.suppress {
        remap = remap.suppress(Direction::KeyboardToHost, byte);
    }
    let policy: Box<dyn InterceptionPolicy> = if remap.is_empty() {
        Box::new(Passthrough)
    } else {
        Box::new(remap)
    };

    let mut bridge = Bridge::new(&config, policy)?;
    if let Some(index) = args.select {
        bridge.select_address(index)?;
    }
    if let Some(bits) = args.stall_after {
        bridge.stall_keyboard_after(bits, STALL_HOLD);
    }

    let mut send = args.send;
    if send.is_empty() && args.command.is_empty() && args.inject.is_empty() {
        info!("Nothing to send, typing a demo sequence");
        send = hex!("50 52 45 53 54 4F").to_vec();
    }
    bridge.keyboard_send(&send);
    bridge.host_send(&args.command);
    for byte in args.inject {
        bridge.inject(byte);
    }

    let end = bridge.run_until_idle();
    info!("Idle at {end}us");

    for &(byte, at) in bridge.host_received() {
        info!("Host received {byte:02X} at {at}us");
    }
    for &(byte, at) in bridge.keyboard_received() {
        info!("Keyboard received {byte:02X} at {at}us");
    }
    report("Keyboard processor", bridge.upstream().stats());
    report("Machine feeder", bridge.downstream().stats());
    info!(
        "Isolator handoffs {}, peak drivers {}",
        bridge.isolator().handoffs(),
        bridge.peak_isolator_drivers()
    );

    Ok(())
}
