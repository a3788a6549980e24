//! Re-exports all logging macros from the `log` crate so call sites can
//! simply say:
//!
//! ```ignore
//! use crate::log::*;
//! ```

pub use log::{log, trace, debug, info, warn, error};
