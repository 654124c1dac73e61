//! # Presto keyboard bridge
//!
//! A two-stage man-in-the-middle relay between a legacy keyboard and the
//! Presto Machine. The keyboard processor ([`engine::UpstreamEngine`])
//! decodes keyboard frames and forwards them across an isolated link; the
//! machine feeder ([`engine::DownstreamEngine`]) replays them to the host
//! bus after passing each byte through an [`intercept::InterceptionPolicy`].
//! Host commands travel the same path in reverse.
//!
//! [`bridge::Bridge`] runs both engines against a simulated keyboard and host
//! on a deterministic single-threaded event loop.

pub mod address;
pub mod bridge;
pub mod codec;
pub mod config;
pub mod engine;
pub mod error;
pub mod frame;
pub mod intercept;
pub mod isolator;
pub mod logging;
pub mod pins;
pub mod relay;
pub mod signal;
pub mod sim;
pub mod timing;
