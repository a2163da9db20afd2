//! Protocol decisions that don't touch sockets are organized in this module
//! and its submodules, so they can be tested in isolation.

pub mod handshake;
pub mod pingpong;
