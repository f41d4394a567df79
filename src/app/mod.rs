//! Application Layer
//!
//! This module contains:
//! - Door: the relay pipeline run once per accepted connection
//! - ActivityTimer: idle timeout shared by both copy directions
//! - Policy: per-level timeouts and buffer sizes
//! - UdpFanoutWriter: forged-source replies for redirected UDP
//! - Dispatcher: destination → Link, bridged to an outbound transport
//! - Runtime: configuration-driven construction and listeners

pub mod activity;
mod dispatcher;
pub mod door;
pub mod policy;
mod runtime;
pub mod udp_fanout;

pub use activity::ActivityTimer;
pub use dispatcher::{DirectDispatcher, Dispatcher};
pub use door::{ConnectionIo, Door, DoorConfig, InboundConnection, InboundHandler};
pub use policy::{LevelPolicy, Policy, PolicyManager, StaticPolicyManager, Timeouts};
pub use runtime::Runtime;
pub use udp_fanout::{ForgedSocket, TransparentForger, UdpFanoutWriter, UdpForger};
