//! Local IPC layer.
//!
//! Provides a named pipe (Windows) or Unix domain socket (Linux/macOS)
//! server that accepts JSON-line commands and streams agent output back on
//! the same connection.

pub mod server;

pub use server::{spawn_ipc_server, ConnectionSender, IpcState};
