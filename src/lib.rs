//! relaycore - transport and relay core of a V2Ray-style proxy
//!
//! # Architecture
//!
//! ```text
//! Listener (TCP / UDP hub)
//! → Door (destination, activity timer, two copy directions)
//! → Dispatcher (Link pair)
//! → Transport dialer (tcp / http / grpc / quic, pooled)
//! ```
//!
//! ## Core Principles
//!
//! - Each layer does ONE thing
//! - Layers meet at traits: `InboundHandler`, `Dispatcher`, `TransportDialer`
//! - Data flows as batches of packets over a `Link`
//! - Expensive connections are cached per `DestinationKey`
//!
//! ## Module Structure
//!
//! ```text
//! src/
//! ├── common/          # Core types: Stream, Address, Destination, Link, RequestScope
//! ├── transport/       # Dialers, pool, multiplexer, socket options, UDP hub
//! ├── protocol/        # Link adapters, plain shadowsocks inbound
//! └── app/             # Door, ActivityTimer, Dispatcher, Runtime
//! ```

// Core types
pub mod common;
pub mod error;

// Layered architecture
pub mod transport;
pub mod protocol;
pub mod app;

// Supporting modules
pub mod config;

// Re-exports for convenience
pub use common::{Address, Destination, Link, Network, RequestScope, Stream};
pub use error::{Error, Result};
pub use config::Config;

// Architecture re-exports
pub use app::{Dispatcher, Door, InboundHandler, Runtime};
pub use transport::{DialerRegistry, TransportDialer};
