//! DNS-SD backend over multicast DNS: registers our service and browses peer service types,
//! reporting what it resolves as `DiscoveryEvent`s on a channel read by the event loop.

use std::collections::HashMap;
use std::net::SocketAddr;

use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use vgc_core::{DiscoveryBackend, DiscoveryError, DiscoveryEvent, Endpoint, ServiceType};

pub struct MdnsBackend {
    daemon: ServiceDaemon,
    port: u16,
    events: mpsc::UnboundedSender<DiscoveryEvent>,
    registered: Option<String>,
    browsing: Vec<String>,
}

impl MdnsBackend {
    pub fn new(port: u16, events: mpsc::UnboundedSender<DiscoveryEvent>) -> anyhow::Result<Self> {
        let daemon = ServiceDaemon::new()?;
        Ok(Self {
            daemon,
            port,
            events,
            registered: None,
            browsing: Vec::new(),
        })
    }

    pub fn shutdown(&self) {
        if let Err(e) = self.daemon.shutdown() {
            warn!("mDNS shutdown error: {}", e);
        }
    }
}

fn backend_error(e: mdns_sd::Error) -> DiscoveryError {
    DiscoveryError::Backend(e.to_string())
}

/// Host label for our A records: the instance name reduced to DNS-safe characters.
fn host_name(name: &str) -> String {
    let label: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
        .collect();
    let label = label.trim_matches('-');
    format!("{}.local.", if label.is_empty() { "vgc" } else { label })
}

impl DiscoveryBackend for MdnsBackend {
    fn advertise(&mut self, service: &ServiceType, name: &str) -> Result<(), DiscoveryError> {
        let mut properties = HashMap::new();
        properties.insert("protocol".to_string(), "1".to_string());
        let info = ServiceInfo::new(
            &service.mdns_domain(),
            name,
            &host_name(name),
            "",
            self.port,
            properties,
        )
        .map_err(backend_error)?
        .enable_addr_auto();
        let fullname = info.get_fullname().to_string();
        self.daemon.register(info).map_err(backend_error)?;
        info!(%fullname, port = self.port, "mDNS service registered");
        self.registered = Some(fullname);
        Ok(())
    }

    fn stop_advertising(&mut self) {
        if let Some(fullname) = self.registered.take() {
            if let Err(e) = self.daemon.unregister(&fullname) {
                warn!(%fullname, "mDNS unregister failed: {}", e);
            }
        }
    }

    fn browse(&mut self, services: &[ServiceType]) -> Result<(), DiscoveryError> {
        for service in services {
            let domain = service.mdns_domain();
            let receiver = self.daemon.browse(&domain).map_err(backend_error)?;
            self.browsing.push(domain.clone());
            let events = self.events.clone();
            tokio::task::spawn_blocking(move || {
                while let Ok(event) = receiver.recv() {
                    let report = match event {
                        ServiceEvent::ServiceResolved(info) => match endpoint_from(&info) {
                            Some(endpoint) => DiscoveryEvent::Found(endpoint),
                            None => {
                                debug!(fullname = info.get_fullname(), "resolved service has no usable address");
                                continue;
                            }
                        },
                        ServiceEvent::ServiceRemoved(_, fullname) => {
                            DiscoveryEvent::Lost { full_name: fullname }
                        }
                        ServiceEvent::SearchStopped(_) => break,
                        _ => continue,
                    };
                    if events.send(report).is_err() {
                        break;
                    }
                }
                debug!(%domain, "mDNS browse ended");
            });
        }
        Ok(())
    }

    fn stop_browsing(&mut self) {
        for domain in self.browsing.drain(..) {
            if let Err(e) = self.daemon.stop_browse(&domain) {
                warn!(%domain, "mDNS stop browse failed: {}", e);
            }
        }
    }
}

/// Turn a resolved record into an endpoint. Records of foreign service types or without
/// addresses are skipped.
fn endpoint_from(info: &ServiceInfo) -> Option<Endpoint> {
    let service = ServiceType::parse(info.get_type())?;
    let fullname = info.get_fullname();
    let name = fullname
        .strip_suffix(info.get_type())
        .and_then(|n| n.strip_suffix('.'))
        .unwrap_or(fullname)
        .to_string();
    let mut addresses: Vec<SocketAddr> = info
        .get_addresses()
        .iter()
        .map(|ip| SocketAddr::new(*ip, info.get_port()))
        .collect();
    if addresses.is_empty() {
        return None;
    }
    addresses.sort_by_key(|a| (!a.is_ipv4(), *a));
    Some(Endpoint {
        name,
        full_name: fullname.to_string(),
        role: service.role(),
        addresses,
    })
}
