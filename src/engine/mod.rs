pub mod downstream;
pub mod upstream;

pub use downstream::DownstreamEngine;
pub use upstream::UpstreamEngine;
