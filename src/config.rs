//! Configuration module for relaycore
//!
//! JSON configuration in the V2Ray layout: inbounds with per-protocol
//! `settings`, one outbound with `streamSettings`, and a per-level policy.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;

use crate::app::{DoorConfig, LevelPolicy};
use crate::common::{Address, Network};
use crate::error::{Error, Result};
use crate::protocol::shadowsocks::check_server;
use crate::transport::{SocketConfig, StreamSettings};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Log configuration
    #[serde(default)]
    pub log: LogConfig,

    /// Per-level connection policy
    #[serde(default)]
    pub policy: PolicyConfig,

    /// Inbound configurations
    #[serde(default)]
    pub inbounds: Vec<InboundConfig>,

    /// Outbound every inbound dispatches to
    #[serde(default)]
    pub outbound: OutboundConfig,
}

impl Config {
    /// Load configuration from a JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;
        Self::from_json(&content)
    }

    /// Parse configuration from JSON string
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Check every section without starting anything.
    pub fn validate(&self) -> Result<()> {
        if self.inbounds.is_empty() {
            return Err(Error::Config("No inbound configured".into()));
        }

        for inbound in &self.inbounds {
            match inbound.settings()? {
                InboundSettings::Door(door) => {
                    if door.networks.is_empty() {
                        return Err(Error::Config(format!("[{}] {}", inbound.tag, Error::NoNetworkConfigured)));
                    }
                }
                InboundSettings::Shadowsocks(ss) => {
                    check_server(&ss.build()?)?;
                }
            }
        }

        match self.outbound.settings()? {
            OutboundSettings::Freedom(freedom) => {
                freedom.redirect_destination()?;
            }
            OutboundSettings::Shadowsocks(ss) => {
                ss.build()?;
                return Err(shadowsocks_outbound_unsupported(&self.outbound.tag));
            }
        }
        Ok(())
    }

    /// A door forwarding local port 5353 to a public resolver.
    pub fn default_example() -> Self {
        let door = DoorConfig {
            address: Some("1.1.1.1".to_string()),
            port: 53,
            networks: vec![Network::Tcp, Network::Udp],
            ..Default::default()
        };

        Config {
            log: LogConfig::default(),
            policy: PolicyConfig::default(),
            inbounds: vec![InboundConfig {
                tag: "door-in".to_string(),
                protocol: InboundProtocol::Door,
                listen: SocketAddr::from(([127, 0, 0, 1], 5353)),
                settings: serde_json::to_value(door).unwrap_or_default(),
                sockopt: SocketConfig::default(),
            }],
            outbound: OutboundConfig::default(),
        }
    }
}

/// Log configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Policy per user level, keyed by level
    #[serde(default)]
    pub levels: HashMap<u32, LevelPolicy>,
}

/// Inbound configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundConfig {
    /// Unique tag for this inbound
    pub tag: String,

    /// Protocol type
    pub protocol: InboundProtocol,

    /// Listen address
    pub listen: SocketAddr,

    /// Protocol-specific settings, interpreted per `protocol`
    #[serde(default)]
    pub settings: serde_json::Value,

    /// Listener socket options (TPROXY, mark)
    #[serde(default)]
    pub sockopt: SocketConfig,
}

impl InboundConfig {
    pub fn settings(&self) -> Result<InboundSettings> {
        match self.protocol {
            InboundProtocol::Door => parse_settings(&self.tag, &self.settings).map(InboundSettings::Door),
            InboundProtocol::Shadowsocks => {
                parse_settings(&self.tag, &self.settings).map(InboundSettings::Shadowsocks)
            }
        }
    }
}

/// Inbound protocol types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InboundProtocol {
    #[serde(alias = "dokodemo-door")]
    Door,
    Shadowsocks,
}

#[derive(Debug, Clone)]
pub enum InboundSettings {
    Door(DoorConfig),
    Shadowsocks(ShadowsocksServerSettings),
}

/// Outbound configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundConfig {
    /// Unique tag for this outbound
    #[serde(default = "default_outbound_tag")]
    pub tag: String,

    #[serde(default)]
    pub protocol: OutboundProtocol,

    #[serde(default)]
    pub settings: serde_json::Value,

    /// How outbound streams are carried
    #[serde(default)]
    pub stream_settings: StreamSettings,
}

fn default_outbound_tag() -> String {
    "direct".to_string()
}

impl Default for OutboundConfig {
    fn default() -> Self {
        Self {
            tag: default_outbound_tag(),
            protocol: OutboundProtocol::Freedom,
            settings: serde_json::Value::Null,
            stream_settings: StreamSettings::default(),
        }
    }
}

impl OutboundConfig {
    pub fn settings(&self) -> Result<OutboundSettings> {
        match self.protocol {
            OutboundProtocol::Freedom => parse_settings(&self.tag, &self.settings).map(OutboundSettings::Freedom),
            OutboundProtocol::Shadowsocks => {
                parse_settings(&self.tag, &self.settings).map(OutboundSettings::Shadowsocks)
            }
        }
    }
}

/// Outbound protocol types
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutboundProtocol {
    #[default]
    Freedom,
    Shadowsocks,
}

#[derive(Debug, Clone)]
pub enum OutboundSettings {
    Freedom(FreedomSettings),
    Shadowsocks(ShadowsocksClientSettings),
}

/// Direct outbound settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FreedomSettings {
    /// Send every TCP flow to this `host:port` instead
    pub redirect: Option<String>,
}

impl FreedomSettings {
    pub fn redirect_destination(&self) -> Result<Option<Address>> {
        match self.redirect.as_deref() {
            None | Some("") => Ok(None),
            Some(s) => Address::parse(s)
                .map(Some)
                .ok_or_else(|| Error::Config(format!("Invalid redirect address: {}", s))),
        }
    }
}

/// Null settings parse as the protocol's defaults.
fn parse_settings<T>(tag: &str, value: &serde_json::Value) -> Result<T>
where
    T: serde::de::DeserializeOwned + Default,
{
    if value.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(value.clone())
        .map_err(|e| Error::Config(format!("[{}] invalid settings: {}", tag, e)))
}

// ============================================================================
// Shadowsocks
// ============================================================================

const SS2022_PREFIX: &str = "2022-blake3-";

/// Classic AEAD ciphers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherType {
    Aes128Gcm,
    Aes256Gcm,
    Chacha20Poly1305,
    None,
}

impl CipherType {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "aes-128-gcm" | "aead_aes_128_gcm" => Some(CipherType::Aes128Gcm),
            "aes-256-gcm" | "aead_aes_256_gcm" => Some(CipherType::Aes256Gcm),
            "chacha20-poly1305" | "aead_chacha20_poly1305" | "chacha20-ietf-poly1305" => {
                Some(CipherType::Chacha20Poly1305)
            }
            "none" | "plain" => Some(CipherType::None),
            _ => None,
        }
    }
}

/// Shadowsocks inbound settings as written
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ShadowsocksServerSettings {
    pub method: String,
    pub password: String,
    pub udp: bool,
    pub level: u32,
    pub email: String,
    pub network: Vec<Network>,
    pub iv_check: bool,
}

/// Validated shadowsocks inbound
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShadowsocksServer {
    Aead2022 {
        method: String,
        key: String,
        level: u32,
        email: String,
        networks: Vec<Network>,
    },
    Classic {
        cipher: CipherType,
        password: String,
        udp: bool,
        level: u32,
        email: String,
        networks: Vec<Network>,
        iv_check: bool,
    },
}

impl ShadowsocksServerSettings {
    pub fn build(&self) -> Result<ShadowsocksServer> {
        if self.method.starts_with(SS2022_PREFIX) {
            return Ok(ShadowsocksServer::Aead2022 {
                method: self.method.clone(),
                key: self.password.clone(),
                level: self.level,
                email: self.email.clone(),
                networks: self.network.clone(),
            });
        }

        if self.password.is_empty() {
            return Err(Error::Config("Shadowsocks password is not specified".into()));
        }
        let cipher = CipherType::parse(&self.method)
            .ok_or_else(|| Error::Config(format!("unknown cipher method: {}", self.method)))?;

        Ok(ShadowsocksServer::Classic {
            cipher,
            password: self.password.clone(),
            udp: self.udp,
            level: self.level,
            email: self.email.clone(),
            networks: self.network.clone(),
            iv_check: self.iv_check,
        })
    }
}

/// Shadowsocks outbounds are parsed and checked but never served.
pub fn shadowsocks_outbound_unsupported(tag: &str) -> Error {
    Error::Unsupported(format!("[{}] shadowsocks outbound is not supported", tag))
}

/// One server of a shadowsocks outbound
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ShadowsocksServerTarget {
    pub address: Option<String>,
    pub port: u16,
    pub method: String,
    pub password: String,
    pub email: String,
    pub level: u32,
    pub iv_check: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ShadowsocksClientSettings {
    pub servers: Vec<ShadowsocksServerTarget>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShadowsocksEndpoint {
    pub address: Address,
    pub cipher: CipherType,
    pub password: String,
    pub level: u32,
    pub email: String,
    pub iv_check: bool,
}

/// Validated shadowsocks outbound
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShadowsocksClient {
    Aead2022 { address: Address, method: String, key: String },
    Classic { servers: Vec<ShadowsocksEndpoint> },
}

impl ShadowsocksServerTarget {
    fn checked_address(&self) -> Result<Address> {
        let host = self
            .address
            .as_deref()
            .filter(|a| !a.is_empty())
            .ok_or_else(|| Error::Config("Shadowsocks server address is not set".into()))?;
        if self.port == 0 {
            return Err(Error::Config("Invalid Shadowsocks port".into()));
        }
        if self.password.is_empty() {
            return Err(Error::Config("Shadowsocks password is not specified".into()));
        }
        Ok(Address::from((host, self.port)))
    }
}

impl ShadowsocksClientSettings {
    pub fn build(&self) -> Result<ShadowsocksClient> {
        if self.servers.is_empty() {
            return Err(Error::Config("0 Shadowsocks server configured".into()));
        }

        if let [server] = self.servers.as_slice() {
            let address = server.checked_address()?;
            if server.method.starts_with(SS2022_PREFIX) {
                return Ok(ShadowsocksClient::Aead2022 {
                    address,
                    method: server.method.clone(),
                    key: server.password.clone(),
                });
            }
        }

        let mut servers = Vec::with_capacity(self.servers.len());
        for server in &self.servers {
            if server.method.starts_with(SS2022_PREFIX) {
                return Err(Error::Config("Shadowsocks 2022 accept no multi servers".into()));
            }
            let address = server.checked_address()?;
            let cipher = CipherType::parse(&server.method)
                .ok_or_else(|| Error::Config(format!("unknown cipher method: {}", server.method)))?;

            servers.push(ShadowsocksEndpoint {
                address,
                cipher,
                password: server.password.clone(),
                level: server.level,
                email: server.email.clone(),
                iv_check: server.iv_check,
            });
        }
        Ok(ShadowsocksClient::Classic { servers })
    }
}
