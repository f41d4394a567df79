//! RequestScope - per-connection context passed explicitly down the stack
//!
//! Carries the values an inbound listener knows about a connection plus the
//! cancellation token that bounds every task working on it.

use std::net::SocketAddr;

use tokio_util::sync::CancellationToken;

use super::destination::Destination;

/// Per-request values and cancellation handle.
#[derive(Debug, Clone)]
pub struct RequestScope {
    /// Cancelled when the connection must stop (idle timeout, shutdown)
    pub cancel: CancellationToken,
    /// Tag of the inbound that accepted the connection
    pub inbound_tag: String,
    /// Client address
    pub source: Option<SocketAddr>,
    /// Original destination recovered by a redirecting listener
    pub redirect_target: Option<Destination>,
    /// User level the policy is looked up with
    pub user_level: u32,
    /// Per-connection buffer size hint in bytes
    pub buffer_size: usize,
}

impl RequestScope {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            inbound_tag: String::new(),
            source: None,
            redirect_target: None,
            user_level: 0,
            buffer_size: 32 * 1024,
        }
    }

    /// Builder: set inbound tag
    pub fn with_inbound_tag(mut self, tag: impl Into<String>) -> Self {
        self.inbound_tag = tag.into();
        self
    }

    /// Builder: set source address
    pub fn with_source(mut self, source: SocketAddr) -> Self {
        self.source = Some(source);
        self
    }

    /// Builder: set the redirect target
    pub fn with_redirect_target(mut self, target: Destination) -> Self {
        self.redirect_target = Some(target);
        self
    }

    /// A scope with the same values whose token is a child of this one.
    pub fn child(&self) -> Self {
        Self {
            cancel: self.cancel.child_token(),
            ..self.clone()
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Default for RequestScope {
    fn default() -> Self {
        Self::new(CancellationToken::new())
    }
}
