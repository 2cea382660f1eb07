//! HTTP layer of the gateway.
//!
//! Serves the git smart-HTTP protocol for hosted repositories, plus the
//! JSON management API used to create, mirror, generate and browse them.

pub mod handler;
pub mod manage;
pub mod smart;
pub mod stream;

#[cfg(test)]
pub(crate) mod testing;
