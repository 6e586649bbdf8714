//! Everything a process needs to act as a surface of a running daemon: the connection and the
//! surface side of the flush protocol.

pub mod autosave;
pub mod client;
