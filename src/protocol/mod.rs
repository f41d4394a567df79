//! Endpoint Protocol Glue
//!
//! Proxy protocol handlers speak byte streams and packet connections; the
//! pipeline speaks Links. `adapter` converts between the two, `shadowsocks`
//! is the one endpoint protocol served on top of it.

pub mod adapter;
pub mod shadowsocks;

pub use adapter::{return_error, to_address, to_destination, LinkPacketConn, LinkStream};
pub use shadowsocks::ShadowsocksInbound;
