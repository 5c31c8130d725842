//! The hybrid log: an append-only record log whose tail lives in memory.

mod hybrid_log;

pub use hybrid_log::{Allocation, HybridLog, LogStats};
