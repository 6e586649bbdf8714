//! Task time tracker built around a background daemon. The daemon owns the timer, the shared
//! selection and the record store, and survives crashes through checkpoints; terminal surfaces
//! talk to it over local IPC.
//!

pub mod cli;
pub mod daemon;
pub mod fs;
pub mod surface;
pub mod utils;
