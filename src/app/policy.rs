//! Per-user-level connection policy

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Timeouts applied to one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Bound on dispatching a new connection, zero means unbounded
    pub handshake: Duration,
    /// Idle budget while both directions are open
    pub connection_idle: Duration,
    /// Idle budget once the response direction finished
    pub uplink_only: Duration,
    /// Idle budget once the request direction finished
    pub downlink_only: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            handshake: Duration::from_secs(4),
            connection_idle: Duration::from_secs(300),
            uplink_only: Duration::from_secs(1),
            downlink_only: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Policy {
    pub timeouts: Timeouts,
    /// Per-connection buffer size in bytes
    pub buffer_size: usize,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            timeouts: Timeouts::default(),
            buffer_size: 32 * 1024,
        }
    }
}

/// Policy for one user level as written in the configuration. Unset fields
/// keep their defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LevelPolicy {
    pub handshake: Option<u32>,
    pub conn_idle: Option<u32>,
    pub uplink_only: Option<u32>,
    pub downlink_only: Option<u32>,
    /// Buffer size in KiB
    pub buffer_size: Option<u32>,
}

impl LevelPolicy {
    pub fn to_policy(&self) -> Policy {
        let mut policy = Policy::default();
        let secs = |v: u32| Duration::from_secs(u64::from(v));

        if let Some(v) = self.handshake {
            policy.timeouts.handshake = secs(v);
        }
        if let Some(v) = self.conn_idle {
            policy.timeouts.connection_idle = secs(v);
        }
        if let Some(v) = self.uplink_only {
            policy.timeouts.uplink_only = secs(v);
        }
        if let Some(v) = self.downlink_only {
            policy.timeouts.downlink_only = secs(v);
        }
        if let Some(v) = self.buffer_size {
            policy.buffer_size = v as usize * 1024;
        }
        policy
    }
}

/// Looks up the policy of a user level
pub trait PolicyManager: Send + Sync {
    fn for_level(&self, level: u32) -> Policy;
}

/// Fixed table of level policies
#[derive(Debug, Clone, Default)]
pub struct StaticPolicyManager {
    levels: HashMap<u32, Policy>,
    fallback: Policy,
}

impl StaticPolicyManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_levels(levels: &HashMap<u32, LevelPolicy>) -> Self {
        Self {
            levels: levels.iter().map(|(level, p)| (*level, p.to_policy())).collect(),
            fallback: Policy::default(),
        }
    }

    pub fn with_level(mut self, level: u32, policy: Policy) -> Self {
        self.levels.insert(level, policy);
        self
    }
}

impl PolicyManager for StaticPolicyManager {
    fn for_level(&self, level: u32) -> Policy {
        self.levels.get(&level).copied().unwrap_or(self.fallback)
    }
}
