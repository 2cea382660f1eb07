//! Git toolchain integration.
//!
//! All operations shell out to the `git` binary through the injectable
//! [`runner::ProcessRunner`] capability.  This module also owns the
//! packet-line framing used by the smart-HTTP protocol.

pub mod commands;
pub mod pktline;
pub mod runner;
pub mod service;

#[cfg(test)]
pub mod testing;

pub use commands::{Signature, TreeEntry};
pub use runner::{CommandSpec, ProcessRunner, Subprocess, TokioRunner};
pub use service::Service;
