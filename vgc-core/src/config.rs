//! Protocol settings shared by every host: role, timeouts, relay and mapping behaviour.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Role this process plays in the topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    /// Originates control input (peripheral).
    Source,
    /// Consumes control input (central).
    Sink,
    /// Bridges any number of sources to one sink.
    Relay,
    /// Relay that bridges exactly one source and refuses others.
    RelayExclusive,
}

impl Role {
    pub fn is_relay(self) -> bool {
        matches!(self, Role::Relay | Role::RelayExclusive)
    }

    /// Roles that accept inbound links from sources.
    pub fn accepts_peripherals(self) -> bool {
        matches!(self, Role::Sink | Role::Relay | Role::RelayExclusive)
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "source" | "peripheral" => Ok(Role::Source),
            "sink" | "central" => Ok(Role::Sink),
            "relay" | "bridge" => Ok(Role::Relay),
            "relay-exclusive" => Ok(Role::RelayExclusive),
            other => Err(format!("unknown role {other:?}")),
        }
    }
}

/// What a relay does with frames from its peripherals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RelayDispatch {
    /// Forward upstream and update the local registry.
    ForwardAndDispatch,
    /// Forward upstream only; no local dispatch at all.
    RelayOnly,
    /// Handle locally; nothing is forwarded.
    LocalOnly,
}

/// Whether a mapped element is sent instead of, or as well as, its source element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MappingMode {
    Replace,
    Additional,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CoreConfig {
    pub role: Role,
    /// Application identifier used in service type strings.
    pub app_id: String,
    pub pairing_timeout_ms: u64,
    pub descriptor_timeout_ms: u64,
    pub relay_dispatch: RelayDispatch,
    /// Consecutive failed forwards before a relay drops its upstream link.
    pub relay_failure_threshold: u32,
    /// Stamp binary frames with a send time.
    pub latency_logging: bool,
    pub mapping_mode: MappingMode,
}

impl CoreConfig {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            ..Self::default()
        }
    }

    pub fn pairing_timeout(&self) -> Duration {
        Duration::from_millis(self.pairing_timeout_ms)
    }

    pub fn descriptor_timeout(&self) -> Duration {
        Duration::from_millis(self.descriptor_timeout_ms)
    }
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            role: Role::Source,
            app_id: "vgc".to_string(),
            pairing_timeout_ms: 3_000,
            descriptor_timeout_ms: 10_000,
            relay_dispatch: RelayDispatch::ForwardAndDispatch,
            relay_failure_threshold: 5,
            latency_logging: false,
            mapping_mode: MappingMode::Additional,
        }
    }
}
