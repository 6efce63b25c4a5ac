// FanCast Models
// Data structures for the relay core

mod config;
mod destination;
mod stream_stats;

pub use config::*;
pub use destination::*;
pub use stream_stats::*;
