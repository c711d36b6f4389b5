//! Discovery policy: role-qualified service types, endpoint table, browse rules.
//! The network side (DNS-SD or anything else) is a `DiscoveryBackend` supplied by the host;
//! it reports what it sees through `DiscoveryEvent`s fed back into `Discovery::on_event`.

use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;

use tracing::{debug, info, warn};

use crate::config::Role;

/// Role a peer advertises. Sources never advertise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ServiceRole {
    Sink,
    Relay,
}

impl ServiceRole {
    fn label(self) -> &'static str {
        match self {
            ServiceRole::Sink => "sink",
            ServiceRole::Relay => "relay",
        }
    }
}

/// `_<app>_<role>._tcp.`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceType {
    app_id: String,
    role: ServiceRole,
}

impl ServiceType {
    pub fn new(app_id: &str, role: ServiceRole) -> Result<Self, DiscoveryError> {
        // DNS-SD service names are at most 15 characters after the leading underscore.
        let valid = !app_id.is_empty()
            && app_id.chars().all(|c| c.is_ascii_alphanumeric())
            && app_id.len() + 1 + role.label().len() <= 15;
        if !valid {
            return Err(DiscoveryError::InvalidAppId(app_id.to_string()));
        }
        Ok(Self {
            app_id: app_id.to_string(),
            role,
        })
    }

    pub fn role(&self) -> ServiceRole {
        self.role
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    /// Service type as used on the wire, e.g. `_vgc_sink._tcp.`.
    pub fn as_string(&self) -> String {
        format!("_{}_{}._tcp.", self.app_id, self.role.label())
    }

    /// Fully qualified for multicast DNS, e.g. `_vgc_sink._tcp.local.`.
    pub fn mdns_domain(&self) -> String {
        format!("{}local.", self.as_string())
    }

    /// Parse either form produced above.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.strip_suffix("local.").unwrap_or(s);
        let name = s.strip_suffix("._tcp.")?.strip_prefix('_')?;
        let (app, role) = name.rsplit_once('_')?;
        let role = match role {
            "sink" => ServiceRole::Sink,
            "relay" => ServiceRole::Relay,
            _ => return None,
        };
        Self::new(app, role).ok()
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_string())
    }
}

/// A reachable peer found by browsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Human readable instance name.
    pub name: String,
    /// Unique key: instance name qualified by service type.
    pub full_name: String,
    pub role: ServiceRole,
    /// Opaque network handle.
    pub addresses: Vec<SocketAddr>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    Found(Endpoint),
    Lost { full_name: String },
}

/// Network side of discovery.
pub trait DiscoveryBackend {
    fn advertise(&mut self, service: &ServiceType, name: &str) -> Result<(), DiscoveryError>;
    fn stop_advertising(&mut self);
    fn browse(&mut self, services: &[ServiceType]) -> Result<(), DiscoveryError>;
    fn stop_browsing(&mut self);
}

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("invalid application identifier {0:?}")]
    InvalidAppId(String),
    #[error("role {0:?} does not advertise a service")]
    NothingToAdvertise(Role),
    #[error("discovery backend: {0}")]
    Backend(String),
}

/// Service role this role advertises.
pub fn advertised_role(role: Role) -> Option<ServiceRole> {
    match role {
        Role::Sink => Some(ServiceRole::Sink),
        Role::Relay | Role::RelayExclusive => Some(ServiceRole::Relay),
        Role::Source => None,
    }
}

/// Service roles this role browses for. A relay never browses for other relays.
pub fn browse_targets(role: Role) -> Vec<ServiceRole> {
    match role {
        Role::Source => vec![ServiceRole::Sink, ServiceRole::Relay],
        Role::Relay | Role::RelayExclusive => vec![ServiceRole::Sink],
        Role::Sink => vec![],
    }
}

pub struct Discovery<B> {
    backend: B,
    app_id: String,
    role: Role,
    advertised_as: Option<String>,
    browsing: bool,
    endpoints: BTreeMap<String, Endpoint>,
}

impl<B: DiscoveryBackend> Discovery<B> {
    pub fn new(backend: B, app_id: impl Into<String>, role: Role) -> Self {
        Self {
            backend,
            app_id: app_id.into(),
            role,
            advertised_as: None,
            browsing: false,
            endpoints: BTreeMap::new(),
        }
    }

    pub fn advertise(&mut self, name: &str) -> Result<(), DiscoveryError> {
        if self.advertised_as.is_some() {
            warn!(name, "already advertising");
            return Ok(());
        }
        let role = advertised_role(self.role).ok_or(DiscoveryError::NothingToAdvertise(self.role))?;
        let service = ServiceType::new(&self.app_id, role)?;
        self.backend.advertise(&service, name)?;
        info!(name, service = %service, "advertising");
        self.advertised_as = Some(name.to_string());
        Ok(())
    }

    pub fn stop_advertising(&mut self) {
        if self.advertised_as.take().is_some() {
            self.backend.stop_advertising();
            info!("stopped advertising");
        }
    }

    /// Start a browse cycle. The endpoint table starts empty.
    pub fn browse(&mut self) -> Result<(), DiscoveryError> {
        if self.browsing {
            warn!("browse requested while already browsing");
            return Ok(());
        }
        let services = browse_targets(self.role)
            .into_iter()
            .map(|r| ServiceType::new(&self.app_id, r))
            .collect::<Result<Vec<_>, _>>()?;
        if services.is_empty() {
            warn!(role = ?self.role, "role does not browse");
            return Ok(());
        }
        self.endpoints.clear();
        self.backend.browse(&services)?;
        self.browsing = true;
        info!(?services, "browsing");
        Ok(())
    }

    pub fn stop_browsing(&mut self) {
        if self.browsing {
            self.backend.stop_browsing();
            self.browsing = false;
            info!("stopped browsing");
        }
        self.endpoints.clear();
    }

    /// Apply a backend report. Returns the event to surface upward, if any.
    pub fn on_event(&mut self, event: DiscoveryEvent) -> Option<DiscoveryEvent> {
        if !self.browsing {
            return None;
        }
        match event {
            DiscoveryEvent::Found(endpoint) => {
                if !browse_targets(self.role).contains(&endpoint.role) {
                    return None;
                }
                let known = self
                    .endpoints
                    .insert(endpoint.full_name.clone(), endpoint.clone())
                    .is_some();
                if known {
                    debug!(endpoint = %endpoint.full_name, "endpoint refreshed");
                    return None;
                }
                info!(endpoint = %endpoint.full_name, "endpoint found");
                Some(DiscoveryEvent::Found(endpoint))
            }
            DiscoveryEvent::Lost { full_name } => {
                self.endpoints.remove(&full_name)?;
                info!(endpoint = %full_name, "endpoint lost");
                Some(DiscoveryEvent::Lost { full_name })
            }
        }
    }

    pub fn endpoint(&self, full_name: &str) -> Option<&Endpoint> {
        self.endpoints.get(full_name)
    }

    /// Look up by full name, falling back to the instance name.
    pub fn find(&self, name: &str) -> Option<&Endpoint> {
        self.endpoints
            .get(name)
            .or_else(|| self.endpoints.values().find(|e| e.name == name))
    }

    pub fn endpoints(&self) -> impl Iterator<Item = &Endpoint> {
        self.endpoints.values()
    }

    pub fn is_browsing(&self) -> bool {
        self.browsing
    }

    pub fn is_advertising(&self) -> bool {
        self.advertised_as.is_some()
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }
}
