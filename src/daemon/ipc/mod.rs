//! Local IPC between the daemon and its surfaces: newline-delimited JSON over a Unix socket or a
//! named pipe.

pub mod protocol;
pub mod server;
pub mod transport;
