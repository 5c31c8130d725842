//! Epoch-based protection for safe memory reclamation.

mod light_epoch;

pub use light_epoch::{EpochGuard, LightEpoch, UNPROTECTED};
