mod health;
mod mev;
mod stats;
mod ws;

pub use health::*;
pub use mev::*;
pub use stats::*;
pub use ws::*;
