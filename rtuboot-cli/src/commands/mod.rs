//! Command implementations.
//!
//! Each mode is implemented in its own module.

pub(crate) mod completions;
pub(crate) mod ports;
pub(crate) mod transfer;
