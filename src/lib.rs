#![allow(unused_doc_comments)]
/**
 * This style of comments threw out warnings.
 * This allow statement fixes that
 */

/**
 * lib.rs
 */

pub mod config;
pub mod logging;
pub mod nat_traversal;
pub mod protocol;
pub mod rendezvous;

pub use config::Config;
pub use nat_traversal::{DialConfig, DialError, HolePunchDialer};
pub use protocol::{DialRequest, DialResponse};
pub use rendezvous::{RendezvousServer, ServerConfig};
