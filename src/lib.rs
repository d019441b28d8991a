mod barrier;
mod bbfile;
mod counters;
mod emitter;
mod key;
mod region;
mod registry;
mod scheduler;
mod session;
mod trace;
mod utils;

pub use barrier::*;
pub use bbfile::*;
pub use counters::*;
pub use emitter::*;
pub use key::*;
pub use region::*;
pub use registry::*;
pub use scheduler::*;
pub use session::*;
pub use trace::*;
pub use utils::*;
