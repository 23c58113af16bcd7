//! Core logic for the credbridge credential relay
//!
//! This crate provides:
//! - Registry address normalization to canonical lookup keys
//! - Resolution and invocation of `docker-credential-*` helpers on the host
//! - The line-oriented bridge wire protocol
//! - The bridge listener lifecycle (unix socket, named pipe, loopback TCP)
//! - The client used from inside the VM

mod backend;
mod client;
mod error;
mod invoker;
mod login;
mod protocol;
mod registry;
mod resolver;
mod server;
mod translator;
mod transport;

pub use backend::*;
pub use client::*;
pub use error::*;
pub use invoker::*;
pub use login::*;
pub use protocol::*;
pub use registry::*;
pub use resolver::*;
pub use server::*;
pub use translator::*;
pub use transport::*;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
