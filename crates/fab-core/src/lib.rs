//! Core library for fab: supervise coding-agent CLIs and serve their
//! event streams to clients over a local socket.

pub mod backend;
pub mod ipc;
pub mod message;
pub mod ring;
pub mod stream;
pub mod supervisor;
