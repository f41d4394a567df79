//! Common types and abstractions
//!
//! - Stream: unified async I/O abstraction
//! - Address / Destination: where traffic goes
//! - Packet / Link: the dispatcher-facing data plane
//! - RequestScope: per-connection context and cancellation

mod address;
pub mod buffer;
mod destination;
pub mod link;
mod scope;
mod stream;

pub use address::{Address, Host};
pub use buffer::{MultiBuffer, Packet};
pub use destination::{Destination, Network};
pub use link::{Link, LinkReader, LinkWriter};
pub use scope::RequestScope;
pub use stream::{IntoStream, Stream};

// Re-export error types from crate root
pub use crate::error::{Error, Result};
