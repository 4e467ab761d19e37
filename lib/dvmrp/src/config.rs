// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Engine and vif configuration.
//!
//! ```toml
//! [engine]
//! cache_lifetime = 300
//! prune_lifetime = 7200
//!
//! [[vif]]
//! name = "lan0"
//! local_addr = "10.0.0.1"
//! subnet = "10.0.0.0/24"
//! boundaries = ["239.255.0.0/16"]
//!
//! [[vif]]
//! name = "tun0"
//! local_addr = "192.168.5.1"
//! remote_addr = "192.168.9.1"
//! metric = 3
//! threshold = 16
//! ```

use dvmrp_api::DEFAULT_CACHE_LIFETIME;
use dvmrp_api::DEFAULT_METRIC;
use dvmrp_api::DEFAULT_PRUNE_LIFETIME;
use dvmrp_api::DEFAULT_THRESHOLD;
use dvmrp_api::MAX_VIFS;
use dvmrp_api::MIN_PRUNE_LIFE;
use dvmrp_api::UNREACHABLE;
use ipnetwork::Ipv4Network;
use serde::Deserialize;
use serde::Serialize;
use std::net::Ipv4Addr;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default, rename = "vif")]
    pub vifs: Vec<VifConfig>,
}

/// Tunables of the routing and pruning engine.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Base lifetime of a forwarding cache entry, in seconds.
    pub cache_lifetime: u32,

    /// Base lifetime of the prunes we send, in seconds.
    pub prune_lifetime: u32,

    /// Send prunes at all. Without them we behave as a non-pruning
    /// router and upstream keeps flooding to us.
    pub pruning: bool,

    /// Forward administratively scoped groups even when they arrive
    /// over a vif that is itself a boundary for the group.
    pub allow_scoped_transit: bool,

    /// Seed for prune and cache lifetime jitter. When unset the seed
    /// comes from the OS.
    pub rng_seed: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache_lifetime: DEFAULT_CACHE_LIFETIME,
            prune_lifetime: DEFAULT_PRUNE_LIFETIME,
            pruning: true,
            allow_scoped_transit: false,
            rng_seed: None,
        }
    }
}

fn default_metric() -> u8 {
    DEFAULT_METRIC
}

fn default_threshold() -> u8 {
    DEFAULT_THRESHOLD
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct VifConfig {
    pub name: String,
    pub local_addr: Ipv4Addr,

    /// The directly attached subnet of a LAN vif.
    #[serde(default)]
    pub subnet: Option<Ipv4Network>,

    /// The far end of a tunnel.
    #[serde(default)]
    pub remote_addr: Option<Ipv4Addr>,

    #[serde(default = "default_metric")]
    pub metric: u8,

    #[serde(default = "default_threshold")]
    pub threshold: u8,

    #[serde(default)]
    pub prune_lifetime: Option<u32>,

    #[serde(default)]
    pub noflood: bool,

    /// Retransmit prunes sent over this vif. Defaults to on for
    /// multi-access vifs and off for tunnels.
    #[serde(default)]
    pub rexmit_prunes: Option<bool>,

    #[serde(default)]
    pub disabled: bool,

    #[serde(default)]
    pub leaf: bool,

    /// Group ranges that may not cross this vif.
    #[serde(default)]
    pub boundaries: Vec<Ipv4Network>,
}

impl Config {
    pub fn from_toml(s: &str) -> Result<Self, ConfigError> {
        let cfg: Config = toml::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::from_toml(&std::fs::read_to_string(path)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.vifs.len() > MAX_VIFS {
            return Err(ConfigError::Invalid(format!(
                "{} vifs configured, at most {MAX_VIFS} supported",
                self.vifs.len()
            )));
        }

        if self.engine.prune_lifetime < MIN_PRUNE_LIFE {
            return Err(ConfigError::Invalid(format!(
                "prune lifetime {} is below {MIN_PRUNE_LIFE}",
                self.engine.prune_lifetime
            )));
        }

        if self.engine.cache_lifetime == 0 {
            return Err(ConfigError::Invalid(
                "cache lifetime must be positive".into(),
            ));
        }

        for v in &self.vifs {
            if v.metric == 0 || v.metric >= UNREACHABLE {
                return Err(ConfigError::Invalid(format!(
                    "vif {}: metric {} out of range 1..{UNREACHABLE}",
                    v.name, v.metric
                )));
            }

            if v.threshold == 0 {
                return Err(ConfigError::Invalid(format!(
                    "vif {}: threshold must be positive",
                    v.name
                )));
            }

            if v.prune_lifetime.is_some_and(|l| l < MIN_PRUNE_LIFE) {
                return Err(ConfigError::Invalid(format!(
                    "vif {}: prune lifetime below {MIN_PRUNE_LIFE}",
                    v.name
                )));
            }

            if v.subnet.is_none() && v.remote_addr.is_none() {
                return Err(ConfigError::Invalid(format!(
                    "vif {}: needs a subnet or a remote_addr",
                    v.name
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = Config::from_toml(
            r#"
            [[vif]]
            name = "lan0"
            local_addr = "10.0.0.1"
            subnet = "10.0.0.0/24"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.engine.cache_lifetime, DEFAULT_CACHE_LIFETIME);
        assert!(cfg.engine.pruning);
        assert_eq!(cfg.vifs[0].metric, DEFAULT_METRIC);
        assert_eq!(cfg.vifs[0].threshold, DEFAULT_THRESHOLD);
        assert!(cfg.vifs[0].boundaries.is_empty());
    }

    #[test]
    fn rejects_bad_metric() {
        let res = Config::from_toml(
            r#"
            [[vif]]
            name = "lan0"
            local_addr = "10.0.0.1"
            subnet = "10.0.0.0/24"
            metric = 32
            "#,
        );
        assert!(matches!(res, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn rejects_unknown_keys() {
        let res = Config::from_toml(
            r#"
            [engine]
            prune_lifetim = 60
            "#,
        );
        assert!(matches!(res, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn rejects_vif_without_address_family() {
        let res = Config::from_toml(
            r#"
            [[vif]]
            name = "lan0"
            local_addr = "10.0.0.1"
            "#,
        );
        assert!(matches!(res, Err(ConfigError::Invalid(_))));
    }
}
