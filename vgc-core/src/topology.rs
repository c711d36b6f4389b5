//! Topology controller: role behaviour on top of links, pairing and discovery.
//!
//! Host-driven like the rest of the crate. The host reports stream and discovery activity through
//! the `on_*` methods, calls `tick` periodically, and drains `ControllerEvent`s with `poll_event`.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::codec::CodecMetrics;
use crate::config::{CoreConfig, MappingMode, RelayDispatch, Role};
use crate::descriptor::DeviceDescriptor;
use crate::discovery::{
    Discovery, DiscoveryBackend, DiscoveryError, DiscoveryEvent, Endpoint, ServiceRole,
};
use crate::element::{
    ElementId, ElementRegistry, ElementValue, SystemMessage, DEVICE_INFO, SYSTEM_MESSAGE,
};
use crate::link::{Channel, ChannelKind, DisconnectReason, Link, LinkEvent, LinkId, Preamble, SendError};
use crate::pairing::{PairingOutcome, StreamPairingManager};

/// Bytes buffered for a stream that arrived before its pair.
const MAX_EARLY_BYTES: usize = 64 * 1024;
/// Minimum gap between a relay's attempts to win back its upstream link.
const RELAY_RECONNECT_INTERVAL: Duration = Duration::from_secs(2);

/// Host-assigned identifier of one stream; unique across inbound and outbound streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub u64);

/// The two write channels of an outbound link, as opened by the host.
pub struct StreamPair<C> {
    pub small_id: StreamId,
    pub small: C,
    pub large_id: StreamId,
    pub large: C,
}

/// Opens outbound streams. The host starts both connections, writes the preamble with the given
/// token on each, and later reports `on_stream_opened` or `on_stream_closed` per stream.
pub trait Connector {
    type Channel: Channel;

    fn open_streams(
        &mut self,
        endpoint: &Endpoint,
        token: Uuid,
    ) -> Result<StreamPair<Self::Channel>, ConnectError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("no endpoint named {0:?}")]
    UnknownEndpoint(String),
    #[error("role {0:?} does not open links")]
    RoleCannotConnect(Role),
    #[error("transport: {0}")]
    Transport(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum FailureReason {
    /// Paired streams but no device descriptor in time.
    DescriptorTimeout,
    /// A stream failed before the peer was connected.
    StreamFailed(DisconnectReason),
    /// The peer asked to disconnect before it was connected.
    RemoteClosed,
    /// Exclusive relay already bridges a peripheral.
    RelayBusy,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ControllerEvent {
    EndpointFound(Endpoint),
    EndpointLost { full_name: String },
    /// For inbound peers, carries the descriptor they announced.
    Connected {
        link: LinkId,
        descriptor: Option<DeviceDescriptor>,
    },
    ConnectionFailed { link: LinkId, reason: FailureReason },
    Disconnected { link: LinkId },
    ElementValueChanged {
        link: LinkId,
        id: ElementId,
        value: ElementValue,
    },
    InvalidMessage { link: LinkId, reported_by_peer: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    /// We opened it: source or relay towards a sink.
    Outbound,
    /// A peripheral connected to us.
    Inbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Connecting,
    /// Outbound, open, descriptor not sent yet (relay waiting for a peripheral).
    Opened,
    AwaitingAck,
    AwaitingDescriptor { deadline: Instant },
    Connected,
}

/// Why a peer is being removed; decides the event raised.
#[derive(Debug)]
enum EndCause {
    Local,
    DescriptorTimeout,
    StreamFailed(DisconnectReason),
    RemoteRequest,
    RelayFailures,
}

struct Peer<C> {
    link: Link<C>,
    direction: Direction,
    phase: Phase,
    endpoint: Option<String>,
    descriptor: Option<DeviceDescriptor>,
}

/// Snapshot of one link for status displays.
#[derive(Debug, Clone)]
pub struct LinkSummary {
    pub id: LinkId,
    pub inbound: bool,
    pub connected: bool,
    pub endpoint: Option<String>,
    pub descriptor: Option<DeviceDescriptor>,
    pub metrics: CodecMetrics,
    pub sent: u64,
    pub dropped: u64,
}

pub struct TopologyController<B, N: Connector> {
    config: CoreConfig,
    registry: Arc<ElementRegistry>,
    descriptor: DeviceDescriptor,
    discovery: Discovery<B>,
    connector: N,
    pairing: StreamPairingManager<Uuid, (StreamId, N::Channel)>,
    /// Inbound streams cached by the pairing manager, by token.
    pending_streams: HashMap<StreamId, Uuid>,
    early_bytes: HashMap<StreamId, Vec<u8>>,
    peers: BTreeMap<LinkId, Peer<N::Channel>>,
    routes: HashMap<StreamId, (LinkId, ChannelKind)>,
    upstream: Option<LinkId>,
    /// Inbound link whose descriptor a relay announces upstream in place of its own.
    relayed: Option<LinkId>,
    /// A relay lost its upstream link and should connect to a known sink again.
    reconnect_pending: bool,
    last_reconnect: Option<Instant>,
    mapping: HashMap<ElementId, ElementId>,
    mapping_active: bool,
    relay_failures: u32,
    next_link: u64,
    events: VecDeque<ControllerEvent>,
}

impl<B: DiscoveryBackend, N: Connector> TopologyController<B, N> {
    pub fn new(
        config: CoreConfig,
        registry: Arc<ElementRegistry>,
        descriptor: DeviceDescriptor,
        backend: B,
        connector: N,
    ) -> Self {
        let discovery = Discovery::new(backend, config.app_id.clone(), config.role);
        let pairing = StreamPairingManager::new(config.pairing_timeout());
        Self {
            config,
            registry,
            descriptor,
            discovery,
            connector,
            pairing,
            pending_streams: HashMap::new(),
            early_bytes: HashMap::new(),
            peers: BTreeMap::new(),
            routes: HashMap::new(),
            upstream: None,
            relayed: None,
            reconnect_pending: false,
            last_reconnect: None,
            mapping: HashMap::new(),
            mapping_active: false,
            relay_failures: 0,
            next_link: 1,
            events: VecDeque::new(),
        }
    }

    pub fn role(&self) -> Role {
        self.config.role
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ElementRegistry> {
        &self.registry
    }

    pub fn discovery(&self) -> &Discovery<B> {
        &self.discovery
    }

    pub fn connector_mut(&mut self) -> &mut N {
        &mut self.connector
    }

    pub fn poll_event(&mut self) -> Option<ControllerEvent> {
        self.events.pop_front()
    }

    // ---- discovery ----

    pub fn advertise(&mut self, name: &str) -> Result<(), DiscoveryError> {
        self.discovery.advertise(name)
    }

    pub fn stop_advertising(&mut self) {
        self.discovery.stop_advertising();
    }

    pub fn browse(&mut self) -> Result<(), DiscoveryError> {
        self.discovery.browse()
    }

    pub fn stop_browsing(&mut self) {
        self.discovery.stop_browsing();
    }

    /// Feed a backend report. Relays connect to the first sink they find.
    pub fn on_discovery_event(&mut self, event: DiscoveryEvent) {
        match self.discovery.on_event(event) {
            Some(DiscoveryEvent::Found(endpoint)) => {
                let auto_connect = self.config.role.is_relay()
                    && endpoint.role == ServiceRole::Sink
                    && self.upstream.is_none();
                self.events
                    .push_back(ControllerEvent::EndpointFound(endpoint.clone()));
                if auto_connect {
                    if let Err(e) = self.connect_to(endpoint) {
                        warn!(error = %e, "relay could not connect to sink");
                    }
                }
            }
            Some(DiscoveryEvent::Lost { full_name }) => {
                self.events
                    .push_back(ControllerEvent::EndpointLost { full_name });
            }
            None => {}
        }
    }

    // ---- connection management ----

    /// Connect to a discovered endpoint by full or instance name.
    pub fn connect(&mut self, name: &str) -> Result<LinkId, ConnectError> {
        let endpoint = self
            .discovery
            .find(name)
            .cloned()
            .ok_or_else(|| ConnectError::UnknownEndpoint(name.to_string()))?;
        self.connect_to(endpoint)
    }

    /// Open the upstream link. Only one upstream link exists at a time; asking again returns it.
    pub fn connect_to(&mut self, endpoint: Endpoint) -> Result<LinkId, ConnectError> {
        if self.config.role == Role::Sink {
            return Err(ConnectError::RoleCannotConnect(self.config.role));
        }
        if let Some(existing) = self.upstream {
            warn!(link = %existing, "already connected upstream");
            return Ok(existing);
        }
        let token = Uuid::new_v4();
        let pair = self.connector.open_streams(&endpoint, token)?;
        let id = self.allocate_link_id();
        let mut link = Link::new(
            id,
            token,
            pair.small,
            pair.large,
            self.registry.clone(),
            self.config.latency_logging,
        );
        link.schedule();
        self.routes.insert(pair.small_id, (id, ChannelKind::Small));
        self.routes.insert(pair.large_id, (id, ChannelKind::Large));
        info!(link = %id, endpoint = %endpoint.full_name, "connecting");
        self.peers.insert(
            id,
            Peer {
                link,
                direction: Direction::Outbound,
                phase: Phase::Connecting,
                endpoint: Some(endpoint.full_name),
                descriptor: None,
            },
        );
        self.upstream = Some(id);
        self.relay_failures = 0;
        self.reconnect_pending = false;
        Ok(id)
    }

    /// Close every link and forget pending streams. Safe to call repeatedly.
    pub fn disconnect(&mut self) {
        let ids: Vec<LinkId> = self.peers.keys().copied().collect();
        for id in ids {
            self.end_peer(id, EndCause::Local);
        }
        for (_, mut channel) in self.pairing.clear() {
            channel.close();
        }
        self.pending_streams.clear();
        self.early_bytes.clear();
        self.relay_failures = 0;
    }

    pub fn disconnect_link(&mut self, id: LinkId) {
        if !self.peers.contains_key(&id) {
            debug!(link = %id, "disconnect of unknown link");
            return;
        }
        self.end_peer(id, EndCause::Local);
    }

    pub fn links(&self) -> Vec<LinkSummary> {
        self.peers
            .iter()
            .map(|(id, peer)| LinkSummary {
                id: *id,
                inbound: peer.direction == Direction::Inbound,
                connected: peer.phase == Phase::Connected,
                endpoint: peer.endpoint.clone(),
                descriptor: peer.descriptor.clone(),
                metrics: peer.link.metrics(),
                sent: peer.link.sent(),
                dropped: peer.link.dropped(),
            })
            .collect()
    }

    // ---- sending ----

    pub fn set_mapping(&mut self, mapping: HashMap<ElementId, ElementId>) {
        self.mapping = mapping;
    }

    /// Send the current registry value of `id` to the peer(s) this role talks to.
    pub fn send(&mut self, id: ElementId) {
        let Some(element) = self.registry.get(id) else {
            warn!(element = id, "send of unknown element");
            return;
        };
        let value = element.value();
        let clears = element.clears_after_send();

        if let Some(&mapped) = self.mapping.get(&id) {
            if !self.mapping_active {
                self.mapping_active = true;
                match self.registry.set(mapped, value.clone()) {
                    Ok(()) => self.send(mapped),
                    Err(e) => warn!(element = id, mapped, error = %e, "mapped element rejected value"),
                }
                self.mapping_active = false;
                if self.config.mapping_mode == MappingMode::Replace {
                    if clears {
                        self.registry.clear(id);
                    }
                    return;
                }
            }
        }

        self.transmit(id, &value);
        if clears {
            self.registry.clear(id);
        }
    }

    fn transmit(&mut self, id: ElementId, value: &ElementValue) {
        let targets: Vec<LinkId> = if self.config.role == Role::Sink {
            self.peers
                .iter()
                .filter(|(_, p)| p.phase == Phase::Connected)
                .map(|(id, _)| *id)
                .collect()
        } else {
            self.upstream.into_iter().collect()
        };
        let mut open = 0;
        for target in targets {
            if let Some(peer) = self.peers.get_mut(&target) {
                if peer.link.is_open() {
                    open += 1;
                    // Failures are logged and counted by the link.
                    let _ = peer.link.send(id, value);
                }
            }
        }
        if open == 0 {
            warn!(element = id, "send with no open link");
        }
    }

    // ---- stream events from the host ----

    /// A peer opened a stream to us and its preamble has been read.
    pub fn on_inbound_stream(
        &mut self,
        stream: StreamId,
        preamble: Preamble,
        mut channel: N::Channel,
        now: Instant,
    ) {
        if !self.config.role.accepts_peripherals() {
            warn!(role = ?self.config.role, "inbound stream refused");
            channel.close();
            return;
        }
        self.pending_streams.insert(stream, preamble.token);
        match self
            .pairing
            .on_stream_open(preamble.token, preamble.kind, (stream, channel), now)
        {
            PairingOutcome::Waiting => {}
            PairingOutcome::Replaced {
                stale: (stale_id, mut stale),
            }
            | PairingOutcome::Expired {
                stale: (stale_id, mut stale),
            } => {
                stale.close();
                self.pending_streams.remove(&stale_id);
                self.early_bytes.remove(&stale_id);
            }
            PairingOutcome::Paired {
                small: (small_id, small),
                large: (large_id, large),
            } => {
                self.pending_streams.remove(&small_id);
                self.pending_streams.remove(&large_id);
                self.accept_link(preamble.token, (small_id, small), (large_id, large), now);
            }
        }
    }

    fn accept_link(
        &mut self,
        token: Uuid,
        (small_id, mut small): (StreamId, N::Channel),
        (large_id, mut large): (StreamId, N::Channel),
        now: Instant,
    ) {
        let id = self.allocate_link_id();
        let bridging = self
            .peers
            .values()
            .any(|p| p.direction == Direction::Inbound);
        if self.config.role == Role::RelayExclusive && bridging {
            warn!(link = %id, "exclusive relay already bridges a peripheral");
            small.close();
            large.close();
            self.early_bytes.remove(&small_id);
            self.early_bytes.remove(&large_id);
            self.events.push_back(ControllerEvent::ConnectionFailed {
                link: id,
                reason: FailureReason::RelayBusy,
            });
            return;
        }

        let mut link = Link::new(
            id,
            token,
            small,
            large,
            self.registry.clone(),
            self.config.latency_logging,
        );
        link.on_stream_opened(ChannelKind::Small);
        link.on_stream_opened(ChannelKind::Large);
        for (stream, kind) in [(small_id, ChannelKind::Small), (large_id, ChannelKind::Large)] {
            if let Some(bytes) = self.early_bytes.remove(&stream) {
                link.on_bytes(kind, &bytes);
            }
            self.routes.insert(stream, (id, kind));
        }
        info!(link = %id, "peripheral link paired");
        self.peers.insert(
            id,
            Peer {
                link,
                direction: Direction::Inbound,
                phase: Phase::Connecting,
                endpoint: None,
                descriptor: None,
            },
        );
        self.process_link(id, now);
    }

    /// An outbound stream finished connecting and wrote its preamble.
    pub fn on_stream_opened(&mut self, stream: StreamId, now: Instant) {
        let Some(&(id, kind)) = self.routes.get(&stream) else {
            debug!(?stream, "open for unknown stream");
            return;
        };
        if let Some(peer) = self.peers.get_mut(&id) {
            peer.link.on_stream_opened(kind);
        }
        self.process_link(id, now);
    }

    pub fn on_stream_bytes(&mut self, stream: StreamId, bytes: &[u8], now: Instant) {
        if let Some(&(id, kind)) = self.routes.get(&stream) {
            if let Some(peer) = self.peers.get_mut(&id) {
                peer.link.on_bytes(kind, bytes);
            }
            self.process_link(id, now);
            return;
        }
        if self.pending_streams.contains_key(&stream) {
            let buffer = self.early_bytes.entry(stream).or_default();
            if buffer.len() + bytes.len() > MAX_EARLY_BYTES {
                warn!(?stream, "too much data before pairing; dropped");
                return;
            }
            buffer.extend_from_slice(bytes);
            return;
        }
        trace!(?stream, len = bytes.len(), "bytes for unknown stream dropped");
    }

    /// A stream ended. `error` is `None` for a clean end of stream.
    pub fn on_stream_closed(&mut self, stream: StreamId, error: Option<String>, now: Instant) {
        if let Some(&(id, kind)) = self.routes.get(&stream) {
            if let Some(peer) = self.peers.get_mut(&id) {
                match error {
                    Some(e) => peer.link.on_stream_error(kind, e),
                    None => peer.link.on_end_of_stream(kind),
                }
            }
            self.process_link(id, now);
            return;
        }
        if let Some(token) = self.pending_streams.remove(&stream) {
            debug!(?stream, "stream closed before pairing");
            if let Some((_, mut channel)) = self.pairing.remove(&token) {
                channel.close();
            }
            self.early_bytes.remove(&stream);
        }
    }

    /// Drive pairing expiry, descriptor deadlines and relay reconnection.
    pub fn tick(&mut self, now: Instant) {
        for (token, (stream, mut channel)) in self.pairing.expire(now) {
            debug!(%token, "unpaired stream timed out");
            channel.close();
            self.pending_streams.remove(&stream);
            self.early_bytes.remove(&stream);
        }
        let expired: Vec<LinkId> = self
            .peers
            .iter()
            .filter(|(_, p)| matches!(p.phase, Phase::AwaitingDescriptor { deadline } if deadline <= now))
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            warn!(link = %id, "no device descriptor in time");
            self.end_peer(id, EndCause::DescriptorTimeout);
        }
        let retry_due = self
            .last_reconnect
            .map_or(true, |at| now >= at + RELAY_RECONNECT_INTERVAL);
        if self.reconnect_pending && self.upstream.is_none() && retry_due {
            self.last_reconnect = Some(now);
            self.reconnect_upstream();
        }
    }

    /// Relay only: connect to the first known sink after the upstream link was lost.
    fn reconnect_upstream(&mut self) {
        let Some(sink) = self
            .discovery
            .endpoints()
            .find(|e| e.role == ServiceRole::Sink)
            .cloned()
        else {
            trace!("no known sink to reconnect to");
            return;
        };
        info!(endpoint = %sink.full_name, "relay reconnecting upstream");
        if let Err(e) = self.connect_to(sink) {
            warn!(error = %e, "relay reconnect failed");
        }
    }

    // ---- link events ----

    fn process_link(&mut self, id: LinkId, now: Instant) {
        while let Some(event) = self.peers.get_mut(&id).and_then(|p| p.link.poll_event()) {
            match event {
                LinkEvent::Opened => self.on_link_opened(id, now),
                LinkEvent::Text(frame) => {
                    if frame.id == SYSTEM_MESSAGE {
                        self.on_system_message(id, &frame.value);
                    } else {
                        self.on_element(id, frame.id, frame.value, Some(frame.raw_value));
                    }
                }
                LinkEvent::Binary(frame) => {
                    if frame.id == DEVICE_INFO {
                        self.on_descriptor(id, &frame.payload);
                    } else {
                        self.on_element(id, frame.id, ElementValue::Bytes(frame.payload), None);
                    }
                }
                LinkEvent::InvalidMessage(error) => {
                    debug!(link = %id, %error, "invalid message");
                    self.events.push_back(ControllerEvent::InvalidMessage {
                        link: id,
                        reported_by_peer: false,
                    });
                    if let Some(peer) = self.peers.get_mut(&id) {
                        if peer.direction == Direction::Inbound {
                            let _ = peer
                                .link
                                .send(SYSTEM_MESSAGE, &SystemMessage::ReceivedInvalidMessage.value());
                        }
                    }
                }
                LinkEvent::UnknownElement(element) => {
                    debug!(link = %id, element, "frame for unknown element");
                }
                LinkEvent::Disconnected(reason) => {
                    info!(link = %id, ?reason, "link lost");
                    self.end_peer(id, EndCause::StreamFailed(reason));
                }
            }
        }
    }

    fn on_link_opened(&mut self, id: LinkId, now: Instant) {
        let Some(peer) = self.peers.get_mut(&id) else {
            return;
        };
        match peer.direction {
            Direction::Inbound => {
                peer.phase = Phase::AwaitingDescriptor {
                    deadline: now + self.config.descriptor_timeout(),
                };
            }
            Direction::Outbound => {
                peer.phase = Phase::Opened;
                self.announce_upstream(id);
            }
        }
    }

    /// Descriptor of the peripheral a relay currently bridges.
    fn relayed_descriptor(&self) -> Option<DeviceDescriptor> {
        self.relayed
            .and_then(|id| self.peers.get(&id))
            .and_then(|p| p.descriptor.clone())
    }

    /// Send the descriptor on an open outbound link. A link that already announced one gets the
    /// new descriptor without going back to waiting for an acknowledgement.
    fn announce_upstream(&mut self, id: LinkId) {
        let descriptor = if self.config.role.is_relay() {
            match self.relayed_descriptor() {
                Some(d) => d,
                None => {
                    debug!(link = %id, "upstream open; waiting for a peripheral to relay");
                    return;
                }
            }
        } else {
            self.descriptor.clone()
        };
        let payload = match descriptor.encode() {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "descriptor encode failed");
                return;
            }
        };
        let Some(peer) = self.peers.get_mut(&id) else {
            return;
        };
        match peer.phase {
            Phase::Opened => {
                if peer.link.send_binary(DEVICE_INFO, &payload).is_ok() {
                    peer.phase = Phase::AwaitingAck;
                }
            }
            Phase::AwaitingAck | Phase::Connected => {
                debug!(link = %id, vendor = %descriptor.vendor_name, "relayed device changed");
                let _ = peer.link.send_binary(DEVICE_INFO, &payload);
            }
            Phase::Connecting | Phase::AwaitingDescriptor { .. } => {}
        }
    }

    /// Relay only: announce the current relayed peripheral on the upstream link, if any.
    fn refresh_upstream(&mut self) {
        if let Some(up) = self.upstream {
            self.announce_upstream(up);
        }
    }

    fn on_system_message(&mut self, id: LinkId, value: &ElementValue) {
        match SystemMessage::from_value(value) {
            Some(SystemMessage::ConnectionAcknowledgement) => {
                let Some(peer) = self.peers.get_mut(&id) else {
                    return;
                };
                if peer.direction == Direction::Outbound && peer.phase == Phase::AwaitingAck {
                    peer.phase = Phase::Connected;
                    info!(link = %id, "connected");
                    self.events.push_back(ControllerEvent::Connected {
                        link: id,
                        descriptor: None,
                    });
                }
            }
            Some(SystemMessage::ReceivedInvalidMessage) => {
                self.events.push_back(ControllerEvent::InvalidMessage {
                    link: id,
                    reported_by_peer: true,
                });
            }
            Some(SystemMessage::DisconnectRequest) => {
                info!(link = %id, "peer requested disconnect");
                self.end_peer(id, EndCause::RemoteRequest);
            }
            None => warn!(link = %id, %value, "unknown system message"),
        }
    }

    fn on_descriptor(&mut self, id: LinkId, payload: &[u8]) {
        let descriptor = match DeviceDescriptor::decode(payload) {
            Ok(d) => d,
            Err(e) => {
                warn!(link = %id, error = %e, "bad device descriptor");
                self.events.push_back(ControllerEvent::InvalidMessage {
                    link: id,
                    reported_by_peer: false,
                });
                return;
            }
        };
        let Some(peer) = self.peers.get_mut(&id) else {
            return;
        };
        if peer.direction != Direction::Inbound {
            debug!(link = %id, "descriptor from upstream ignored");
            return;
        }
        peer.descriptor = Some(descriptor.clone());
        if !matches!(peer.phase, Phase::AwaitingDescriptor { .. }) {
            debug!(link = %id, "descriptor refreshed");
            if self.config.role.is_relay() && self.relayed == Some(id) {
                self.refresh_upstream();
            }
            return;
        }
        peer.phase = Phase::Connected;
        let _ = peer
            .link
            .send(SYSTEM_MESSAGE, &SystemMessage::ConnectionAcknowledgement.value());
        info!(link = %id, vendor = %descriptor.vendor_name, "peripheral connected");
        self.events.push_back(ControllerEvent::Connected {
            link: id,
            descriptor: Some(descriptor.clone()),
        });

        if self.config.role.is_relay() && self.relayed.is_none() {
            self.relayed = Some(id);
            self.refresh_upstream();
        }
    }

    /// Element frame from a peer. `raw` is the text value as received, for verbatim forwarding.
    fn on_element(&mut self, id: LinkId, element: ElementId, value: ElementValue, raw: Option<String>) {
        let Some(peer) = self.peers.get(&id) else {
            return;
        };
        let inbound = peer.direction == Direction::Inbound;
        if inbound && peer.phase != Phase::Connected {
            debug!(link = %id, element, "frame before device descriptor dropped");
            return;
        }
        if inbound && self.config.role.is_relay() {
            let dispatch = self.config.relay_dispatch;
            if dispatch != RelayDispatch::LocalOnly {
                self.forward(|link| match &raw {
                    Some(raw) => link.send_raw_text(element, value.kind(), raw),
                    None => link.send(element, &value),
                });
            }
            if dispatch == RelayDispatch::RelayOnly {
                return;
            }
        }
        match self.registry.set(element, value.clone()) {
            Ok(()) => self.events.push_back(ControllerEvent::ElementValueChanged {
                link: id,
                id: element,
                value,
            }),
            Err(e) => warn!(link = %id, error = %e, "value rejected"),
        }
    }

    fn forward<F>(&mut self, send: F)
    where
        F: FnOnce(&mut Link<N::Channel>) -> Result<(), SendError>,
    {
        let Some(up) = self.upstream else {
            trace!("no upstream link; frame not forwarded");
            return;
        };
        let Some(peer) = self.peers.get_mut(&up) else {
            return;
        };
        if !peer.link.is_open() {
            trace!(link = %up, "upstream not open yet; frame not forwarded");
            return;
        }
        if send(&mut peer.link).is_ok() {
            self.relay_failures = 0;
            return;
        }
        self.relay_failures += 1;
        if self.relay_failures >= self.config.relay_failure_threshold {
            warn!(link = %up, failures = self.relay_failures, "upstream keeps failing; dropping it");
            self.end_peer(up, EndCause::RelayFailures);
        }
    }

    fn end_peer(&mut self, id: LinkId, cause: EndCause) {
        let Some(mut peer) = self.peers.remove(&id) else {
            return;
        };
        peer.link.close();
        self.routes.retain(|_, (link, _)| *link != id);
        if self.upstream == Some(id) {
            self.upstream = None;
            self.relay_failures = 0;
            if self.config.role.is_relay() && !matches!(cause, EndCause::Local) {
                self.reconnect_pending = true;
            }
        }
        if self.relayed == Some(id) {
            self.relayed = self
                .peers
                .iter()
                .find(|(_, p)| p.direction == Direction::Inbound && p.phase == Phase::Connected)
                .map(|(id, _)| *id);
            match self.relayed {
                Some(next) => {
                    info!(link = %next, "relaying next peripheral");
                    self.refresh_upstream();
                }
                None => debug!(link = %id, "relayed peripheral left"),
            }
        }
        let connected = peer.phase == Phase::Connected;
        let event = match cause {
            EndCause::Local => connected.then_some(ControllerEvent::Disconnected { link: id }),
            EndCause::RelayFailures => Some(ControllerEvent::Disconnected { link: id }),
            EndCause::DescriptorTimeout => Some(ControllerEvent::ConnectionFailed {
                link: id,
                reason: FailureReason::DescriptorTimeout,
            }),
            EndCause::StreamFailed(reason) if !connected => Some(ControllerEvent::ConnectionFailed {
                link: id,
                reason: FailureReason::StreamFailed(reason),
            }),
            EndCause::RemoteRequest if !connected => Some(ControllerEvent::ConnectionFailed {
                link: id,
                reason: FailureReason::RemoteClosed,
            }),
            EndCause::StreamFailed(_) | EndCause::RemoteRequest => {
                Some(ControllerEvent::Disconnected { link: id })
            }
        };
        self.events.extend(event);
    }

    fn allocate_link_id(&mut self) -> LinkId {
        let id = LinkId(self.next_link);
        self.next_link += 1;
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{encode_binary, encode_text};
    use crate::descriptor::Profile;
    use crate::discovery::tests::{endpoint, MockBackend};
    use crate::element::{ElementSpec, ValueKind, BUTTON_A, BUTTON_B, IMAGE, RIGHT_TRIGGER};
    use crate::link::tests::MockChannel;
    use std::time::Duration;

    #[derive(Default)]
    struct MockConnector {
        opened: Vec<Opened>,
        refuse: bool,
    }

    struct Opened {
        endpoint: String,
        small_id: StreamId,
        small: MockChannel,
        large_id: StreamId,
        large: MockChannel,
    }

    impl Connector for MockConnector {
        type Channel = MockChannel;

        fn open_streams(
            &mut self,
            endpoint: &Endpoint,
            _token: Uuid,
        ) -> Result<StreamPair<MockChannel>, ConnectError> {
            if self.refuse {
                return Err(ConnectError::Transport("connection refused".into()));
            }
            let n = self.opened.len() as u64;
            let opened = Opened {
                endpoint: endpoint.full_name.clone(),
                small_id: StreamId(1000 + 2 * n),
                small: MockChannel::default(),
                large_id: StreamId(1001 + 2 * n),
                large: MockChannel::default(),
            };
            let pair = StreamPair {
                small_id: opened.small_id,
                small: opened.small.clone(),
                large_id: opened.large_id,
                large: opened.large.clone(),
            };
            self.opened.push(opened);
            Ok(pair)
        }
    }

    type Controller = TopologyController<MockBackend, MockConnector>;

    fn controller(config: CoreConfig) -> Controller {
        let registry = ElementRegistry::builder()
            .custom(ElementSpec::new(200, "rumble", ValueKind::Float))
            .unwrap()
            .custom(ElementSpec::new(201, "tap", ValueKind::Float).clear_after_send())
            .unwrap()
            .build();
        TopologyController::new(
            config,
            Arc::new(registry),
            DeviceDescriptor::new("Test Pad", Profile::Extended),
            MockBackend::default(),
            MockConnector::default(),
        )
    }

    fn drain(c: &mut Controller) -> Vec<ControllerEvent> {
        std::iter::from_fn(|| c.poll_event()).collect()
    }

    /// An inbound peripheral as seen by a sink or relay.
    struct Peripheral {
        small_id: StreamId,
        small: MockChannel,
        large_id: StreamId,
        large: MockChannel,
    }

    fn attach(c: &mut Controller, base: u64, now: Instant) -> Peripheral {
        let token = Uuid::new_v4();
        let p = Peripheral {
            small_id: StreamId(base),
            small: MockChannel::default(),
            large_id: StreamId(base + 1),
            large: MockChannel::default(),
        };
        c.on_inbound_stream(
            p.small_id,
            Preamble {
                kind: ChannelKind::Small,
                token,
            },
            p.small.clone(),
            now,
        );
        c.on_inbound_stream(
            p.large_id,
            Preamble {
                kind: ChannelKind::Large,
                token,
            },
            p.large.clone(),
            now,
        );
        p
    }

    fn descriptor_frame(vendor: &str) -> Vec<u8> {
        let d = DeviceDescriptor::new(vendor, Profile::Standard);
        encode_binary(DEVICE_INFO, &d.encode().unwrap(), None).unwrap()
    }

    fn register(c: &mut Controller, p: &Peripheral, vendor: &str, now: Instant) {
        c.on_stream_bytes(p.large_id, &descriptor_frame(vendor), now);
    }

    fn text(id: ElementId, value: ElementValue) -> Vec<u8> {
        encode_text(id, &value).unwrap()
    }

    fn ack() -> Vec<u8> {
        text(SYSTEM_MESSAGE, SystemMessage::ConnectionAcknowledgement.value())
    }

    fn open_upstream(c: &mut Controller, now: Instant) -> LinkId {
        let link = c.connect_to(endpoint("tv", ServiceRole::Sink)).unwrap();
        let (small_id, large_id) = {
            let o = c.connector_mut().opened.last().unwrap();
            (o.small_id, o.large_id)
        };
        c.on_stream_opened(small_id, now);
        c.on_stream_opened(large_id, now);
        link
    }

    #[test]
    fn sink_connects_peripheral_after_descriptor() {
        let now = Instant::now();
        let mut sink = controller(CoreConfig::new(Role::Sink));
        let p = attach(&mut sink, 1, now);
        assert!(drain(&mut sink).is_empty());

        register(&mut sink, &p, "Pad", now);
        let events = drain(&mut sink);
        assert_eq!(events.len(), 1);
        match &events[0] {
            ControllerEvent::Connected {
                descriptor: Some(d),
                ..
            } => assert_eq!(d.vendor_name, "Pad"),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(p.small.written(), vec![ack()]);
        assert!(sink.links()[0].connected);
    }

    #[test]
    fn sink_descriptor_timeout_fails_exactly_once() {
        let now = Instant::now();
        let mut sink = controller(CoreConfig::new(Role::Sink));
        let p = attach(&mut sink, 1, now);

        sink.tick(now + Duration::from_secs(9));
        assert!(drain(&mut sink).is_empty());

        sink.tick(now + Duration::from_secs(10));
        let events = drain(&mut sink);
        assert_eq!(events.len(), 1);
        assert!(matches!(
            events[0],
            ControllerEvent::ConnectionFailed {
                reason: FailureReason::DescriptorTimeout,
                ..
            }
        ));
        assert!(p.small.is_closed() && p.large.is_closed());

        // Late activity on the torn-down streams raises nothing.
        sink.on_stream_closed(p.small_id, None, now + Duration::from_secs(11));
        register(&mut sink, &p, "Pad", now + Duration::from_secs(11));
        sink.tick(now + Duration::from_secs(30));
        assert!(drain(&mut sink).is_empty());
        assert!(sink.links().is_empty());
    }

    #[test]
    fn sink_drops_frames_before_descriptor_then_dispatches() {
        let now = Instant::now();
        let mut sink = controller(CoreConfig::new(Role::Sink));
        let p = attach(&mut sink, 1, now);
        sink.on_stream_bytes(p.small_id, &text(RIGHT_TRIGGER, ElementValue::Float(0.5)), now);
        assert!(drain(&mut sink).is_empty());

        register(&mut sink, &p, "Pad", now);
        drain(&mut sink);
        sink.on_stream_bytes(p.small_id, b"19.75:12:0.75\n", now);
        let events = drain(&mut sink);
        assert!(matches!(
            &events[..],
            [ControllerEvent::ElementValueChanged { id: RIGHT_TRIGGER, value: ElementValue::Float(v), .. }] if *v == 0.75
        ));
        assert_eq!(
            sink.registry().value(RIGHT_TRIGGER),
            Some(ElementValue::Float(0.75))
        );
    }

    #[test]
    fn sink_reports_checksum_failure_to_peer() {
        let now = Instant::now();
        let mut sink = controller(CoreConfig::new(Role::Sink));
        let p = attach(&mut sink, 1, now);
        register(&mut sink, &p, "Pad", now);
        drain(&mut sink);

        sink.on_stream_bytes(p.small_id, b"20:12:0.75\n", now);
        assert_eq!(
            drain(&mut sink),
            vec![ControllerEvent::InvalidMessage {
                link: LinkId(1),
                reported_by_peer: false
            }]
        );
        let written = p.small.written();
        assert_eq!(
            written.last().unwrap(),
            &text(SYSTEM_MESSAGE, SystemMessage::ReceivedInvalidMessage.value())
        );
    }

    #[test]
    fn bytes_before_pairing_are_replayed() {
        let now = Instant::now();
        let mut sink = controller(CoreConfig::new(Role::Sink));
        let token = Uuid::new_v4();
        let large = MockChannel::default();
        sink.on_inbound_stream(
            StreamId(2),
            Preamble {
                kind: ChannelKind::Large,
                token,
            },
            large.clone(),
            now,
        );
        sink.on_stream_bytes(StreamId(2), &descriptor_frame("Early"), now);
        assert!(drain(&mut sink).is_empty());

        sink.on_inbound_stream(
            StreamId(1),
            Preamble {
                kind: ChannelKind::Small,
                token,
            },
            MockChannel::default(),
            now + Duration::from_secs(1),
        );
        assert!(matches!(
            &drain(&mut sink)[..],
            [ControllerEvent::Connected { descriptor: Some(d), .. }] if d.vendor_name == "Early"
        ));
    }

    #[test]
    fn unpaired_stream_expires_on_tick() {
        let now = Instant::now();
        let mut sink = controller(CoreConfig::new(Role::Sink));
        let small = MockChannel::default();
        sink.on_inbound_stream(
            StreamId(1),
            Preamble {
                kind: ChannelKind::Small,
                token: Uuid::new_v4(),
            },
            small.clone(),
            now,
        );
        sink.tick(now + Duration::from_secs(3));
        assert!(small.is_closed());
        assert!(drain(&mut sink).is_empty());
    }

    #[test]
    fn source_announces_once_and_connects_on_ack() {
        let now = Instant::now();
        let mut source = controller(CoreConfig::new(Role::Source));
        let link = open_upstream(&mut source, now);
        let (small_id, large) = {
            let o = &source.connector_mut().opened[0];
            (o.small_id, o.large.clone())
        };
        let written = large.written();
        assert_eq!(written.len(), 1);
        let (decoded, _) = crate::codec::decode_binary(&written[0], false).unwrap();
        assert_eq!(decoded.id, DEVICE_INFO);
        let d = DeviceDescriptor::decode(&decoded.payload).unwrap();
        assert_eq!(d.vendor_name, "Test Pad");
        assert!(drain(&mut source).is_empty());

        source.on_stream_bytes(small_id, &ack(), now);
        source.on_stream_bytes(small_id, &ack(), now);
        assert_eq!(
            drain(&mut source),
            vec![ControllerEvent::Connected {
                link,
                descriptor: None
            }]
        );
        assert_eq!(large.written().len(), 1);
    }

    #[test]
    fn source_sends_and_receives_values() {
        let now = Instant::now();
        let mut source = controller(CoreConfig::new(Role::Source));
        open_upstream(&mut source, now);
        let (small_id, small) = {
            let o = &source.connector_mut().opened[0];
            (o.small_id, o.small.clone())
        };
        source.registry().set(RIGHT_TRIGGER, ElementValue::Float(0.75)).unwrap();
        source.send(RIGHT_TRIGGER);
        assert_eq!(small.written(), vec![b"19.75:12:0.75\n".to_vec()]);

        source.on_stream_bytes(small_id, &text(200, ElementValue::Float(1.0)), now);
        assert!(matches!(
            &drain(&mut source)[..],
            [ControllerEvent::ElementValueChanged { id: 200, .. }]
        ));
    }

    #[test]
    fn send_without_link_is_a_noop() {
        let mut source = controller(CoreConfig::new(Role::Source));
        source.registry().set(BUTTON_A, ElementValue::Float(1.0)).unwrap();
        source.send(BUTTON_A);
        source.send(250);
        assert!(drain(&mut source).is_empty());
    }

    #[test]
    fn sink_cannot_connect() {
        let mut sink = controller(CoreConfig::new(Role::Sink));
        assert!(matches!(
            sink.connect_to(endpoint("x", ServiceRole::Sink)),
            Err(ConnectError::RoleCannotConnect(Role::Sink))
        ));
        assert!(matches!(
            sink.connect("nobody"),
            Err(ConnectError::UnknownEndpoint(_))
        ));
    }

    #[test]
    fn mapping_sends_in_addition_or_instead() {
        let now = Instant::now();
        let mut source = controller(CoreConfig::new(Role::Source));
        open_upstream(&mut source, now);
        let small = source.connector_mut().opened[0].small.clone();
        source.set_mapping(HashMap::from([(BUTTON_A, BUTTON_B)]));
        source.registry().set(BUTTON_A, ElementValue::Float(1.0)).unwrap();
        source.send(BUTTON_A);
        assert_eq!(
            small.written(),
            vec![
                text(BUTTON_B, ElementValue::Float(1.0)),
                text(BUTTON_A, ElementValue::Float(1.0))
            ]
        );

        let mut config = CoreConfig::new(Role::Source);
        config.mapping_mode = MappingMode::Replace;
        let mut source = controller(config);
        open_upstream(&mut source, now);
        let small = source.connector_mut().opened[0].small.clone();
        source.set_mapping(HashMap::from([(BUTTON_A, BUTTON_B)]));
        source.registry().set(BUTTON_A, ElementValue::Float(1.0)).unwrap();
        source.send(BUTTON_A);
        assert_eq!(small.written(), vec![text(BUTTON_B, ElementValue::Float(1.0))]);
    }

    #[test]
    fn replaced_element_still_clears_after_send() {
        let now = Instant::now();
        let mut config = CoreConfig::new(Role::Source);
        config.mapping_mode = MappingMode::Replace;
        let mut source = controller(config);
        open_upstream(&mut source, now);
        let small = source.connector_mut().opened[0].small.clone();
        source.set_mapping(HashMap::from([(201, BUTTON_B)]));
        source.registry().set(201, ElementValue::Float(1.0)).unwrap();
        source.send(201);
        assert_eq!(small.written(), vec![text(BUTTON_B, ElementValue::Float(1.0))]);
        assert_eq!(source.registry().value(201), Some(ElementValue::Float(0.0)));
    }

    #[test]
    fn cyclic_mapping_terminates() {
        let now = Instant::now();
        let mut source = controller(CoreConfig::new(Role::Source));
        open_upstream(&mut source, now);
        let small = source.connector_mut().opened[0].small.clone();
        source.set_mapping(HashMap::from([(BUTTON_A, BUTTON_B), (BUTTON_B, BUTTON_A)]));
        source.registry().set(BUTTON_A, ElementValue::Float(0.5)).unwrap();
        source.send(BUTTON_A);
        assert_eq!(small.written().len(), 2);
    }

    #[test]
    fn clear_after_send_resets_value() {
        let now = Instant::now();
        let mut source = controller(CoreConfig::new(Role::Source));
        open_upstream(&mut source, now);
        let large = source.connector_mut().opened[0].large.clone();
        source.registry().set(IMAGE, ElementValue::Bytes(vec![9; 32])).unwrap();
        source.send(IMAGE);
        assert_eq!(large.written().len(), 2);
        assert_eq!(source.registry().value(IMAGE), Some(ElementValue::Bytes(vec![])));
    }

    #[test]
    fn remote_disconnect_request_closes_link() {
        let now = Instant::now();
        let mut sink = controller(CoreConfig::new(Role::Sink));
        let p = attach(&mut sink, 1, now);
        register(&mut sink, &p, "Pad", now);
        drain(&mut sink);
        sink.on_stream_bytes(
            p.small_id,
            &text(SYSTEM_MESSAGE, SystemMessage::DisconnectRequest.value()),
            now,
        );
        assert_eq!(
            drain(&mut sink),
            vec![ControllerEvent::Disconnected { link: LinkId(1) }]
        );
        assert!(p.small.is_closed());
    }

    #[test]
    fn peer_reported_invalid_message_is_surfaced() {
        let now = Instant::now();
        let mut source = controller(CoreConfig::new(Role::Source));
        let link = open_upstream(&mut source, now);
        let small_id = source.connector_mut().opened[0].small_id;
        source.on_stream_bytes(
            small_id,
            &text(SYSTEM_MESSAGE, SystemMessage::ReceivedInvalidMessage.value()),
            now,
        );
        assert_eq!(
            drain(&mut source),
            vec![ControllerEvent::InvalidMessage {
                link,
                reported_by_peer: true
            }]
        );
    }

    #[test]
    fn stream_failure_before_and_after_connect() {
        let now = Instant::now();
        let mut source = controller(CoreConfig::new(Role::Source));
        let link = source.connect_to(endpoint("tv", ServiceRole::Sink)).unwrap();
        let small_id = source.connector_mut().opened[0].small_id;
        source.on_stream_closed(small_id, Some("refused".into()), now);
        assert!(matches!(
            &drain(&mut source)[..],
            [ControllerEvent::ConnectionFailed { link: l, reason: FailureReason::StreamFailed(_) }] if *l == link
        ));

        let link = open_upstream(&mut source, now);
        let (small_id, large_id) = {
            let o = &source.connector_mut().opened[1];
            (o.small_id, o.large_id)
        };
        source.on_stream_bytes(small_id, &ack(), now);
        drain(&mut source);
        source.on_stream_closed(large_id, None, now);
        source.on_stream_closed(small_id, None, now);
        assert_eq!(drain(&mut source), vec![ControllerEvent::Disconnected { link }]);
    }

    #[test]
    fn disconnect_is_idempotent() {
        let now = Instant::now();
        let mut sink = controller(CoreConfig::new(Role::Sink));
        let a = attach(&mut sink, 1, now);
        register(&mut sink, &a, "A", now);
        let b = attach(&mut sink, 3, now);
        let pending = MockChannel::default();
        sink.on_inbound_stream(
            StreamId(9),
            Preamble {
                kind: ChannelKind::Small,
                token: Uuid::new_v4(),
            },
            pending.clone(),
            now,
        );
        drain(&mut sink);

        sink.disconnect();
        assert_eq!(
            drain(&mut sink),
            vec![ControllerEvent::Disconnected { link: LinkId(1) }]
        );
        assert!(a.small.is_closed() && b.large.is_closed() && pending.is_closed());
        sink.disconnect();
        sink.tick(now + Duration::from_secs(60));
        assert!(drain(&mut sink).is_empty());
    }

    #[test]
    fn disconnect_single_link() {
        let now = Instant::now();
        let mut sink = controller(CoreConfig::new(Role::Sink));
        let a = attach(&mut sink, 1, now);
        register(&mut sink, &a, "A", now);
        let b = attach(&mut sink, 3, now);
        register(&mut sink, &b, "B", now);
        drain(&mut sink);
        sink.disconnect_link(LinkId(2));
        sink.disconnect_link(LinkId(2));
        assert_eq!(
            drain(&mut sink),
            vec![ControllerEvent::Disconnected { link: LinkId(2) }]
        );
        assert!(!a.small.is_closed());
        assert_eq!(sink.links().len(), 1);
    }

    #[test]
    fn relay_only_forwards_interleaved_frames_in_order() {
        let now = Instant::now();
        let mut config = CoreConfig::new(Role::Relay);
        config.relay_dispatch = RelayDispatch::RelayOnly;
        let mut relay = controller(config);
        open_upstream(&mut relay, now);
        let (up_small, up_large) = {
            let o = &relay.connector_mut().opened[0];
            (o.small.clone(), o.large.clone())
        };
        assert!(up_large.written().is_empty());

        let a = attach(&mut relay, 1, now);
        register(&mut relay, &a, "A", now);
        let b = attach(&mut relay, 3, now);
        register(&mut relay, &b, "B", now);
        drain(&mut relay);
        // The first peripheral's identity is announced upstream, once.
        assert_eq!(up_large.written().len(), 1);

        let frames = [
            (&a, "0.1"),
            (&b, "0.2"),
            (&a, "0.3"),
            (&b, "0.4"),
        ];
        for (p, v) in frames {
            let bytes = crate::codec::encode_text_raw(RIGHT_TRIGGER, ValueKind::Float, v).unwrap();
            relay.on_stream_bytes(p.small_id, &bytes, now);
        }
        let forwarded: Vec<Vec<u8>> = frames
            .iter()
            .map(|(_, v)| crate::codec::encode_text_raw(RIGHT_TRIGGER, ValueKind::Float, v).unwrap())
            .collect();
        assert_eq!(up_small.written(), forwarded);
        assert!(drain(&mut relay).is_empty());
        assert_eq!(relay.registry().value(RIGHT_TRIGGER), Some(ElementValue::Float(0.0)));
    }

    #[test]
    fn relay_forward_and_dispatch_updates_locally() {
        let now = Instant::now();
        let mut relay = controller(CoreConfig::new(Role::Relay));
        open_upstream(&mut relay, now);
        let up_small = relay.connector_mut().opened[0].small.clone();
        let a = attach(&mut relay, 1, now);
        register(&mut relay, &a, "A", now);
        drain(&mut relay);

        relay.on_stream_bytes(a.small_id, b"19.75:12:0.75\n", now);
        assert_eq!(up_small.written(), vec![b"19.75:12:0.75\n".to_vec()]);
        assert!(matches!(
            &drain(&mut relay)[..],
            [ControllerEvent::ElementValueChanged { id: RIGHT_TRIGGER, .. }]
        ));
    }

    #[test]
    fn relay_local_only_does_not_forward() {
        let now = Instant::now();
        let mut config = CoreConfig::new(Role::Relay);
        config.relay_dispatch = RelayDispatch::LocalOnly;
        let mut relay = controller(config);
        open_upstream(&mut relay, now);
        let up_small = relay.connector_mut().opened[0].small.clone();
        let a = attach(&mut relay, 1, now);
        register(&mut relay, &a, "A", now);
        drain(&mut relay);

        relay.on_stream_bytes(a.small_id, b"19.75:12:0.75\n", now);
        assert!(up_small.written().is_empty());
        assert_eq!(drain(&mut relay).len(), 1);
    }

    #[test]
    fn relay_announces_peripheral_when_upstream_opens_later() {
        let now = Instant::now();
        let mut relay = controller(CoreConfig::new(Role::Relay));
        let a = attach(&mut relay, 1, now);
        register(&mut relay, &a, "Pad A", now);
        open_upstream(&mut relay, now);
        let up_large = relay.connector_mut().opened[0].large.clone();
        let written = up_large.written();
        let (decoded, _) = crate::codec::decode_binary(&written[0], false).unwrap();
        assert_eq!(
            DeviceDescriptor::decode(&decoded.payload).unwrap().vendor_name,
            "Pad A"
        );
    }

    fn announced_vendor(large: &MockChannel, index: usize) -> String {
        let written = large.written();
        let (frame, _) = crate::codec::decode_binary(&written[index], false).unwrap();
        assert_eq!(frame.id, DEVICE_INFO);
        DeviceDescriptor::decode(&frame.payload).unwrap().vendor_name
    }

    #[test]
    fn relay_announces_next_peripheral_after_first_leaves() {
        let now = Instant::now();
        let mut relay = controller(CoreConfig::new(Role::RelayExclusive));
        let a = attach(&mut relay, 1, now);
        register(&mut relay, &a, "Pad A", now);
        relay.on_stream_closed(a.small_id, None, now);
        let b = attach(&mut relay, 3, now);
        register(&mut relay, &b, "Pad B", now);
        drain(&mut relay);

        open_upstream(&mut relay, now);
        let up_large = relay.connector_mut().opened[0].large.clone();
        assert_eq!(up_large.written().len(), 1);
        assert_eq!(announced_vendor(&up_large, 0), "Pad B");
    }

    #[test]
    fn relay_updates_live_upstream_when_relayed_peripheral_leaves() {
        let now = Instant::now();
        let mut relay = controller(CoreConfig::new(Role::Relay));
        let a = attach(&mut relay, 1, now);
        register(&mut relay, &a, "Pad A", now);
        let b = attach(&mut relay, 3, now);
        register(&mut relay, &b, "Pad B", now);
        open_upstream(&mut relay, now);
        let up_large = relay.connector_mut().opened[0].large.clone();
        assert_eq!(announced_vendor(&up_large, 0), "Pad A");

        // The other peripheral leaving changes nothing upstream.
        let c = attach(&mut relay, 5, now);
        register(&mut relay, &c, "Pad C", now);
        relay.on_stream_closed(c.large_id, None, now);
        assert_eq!(up_large.written().len(), 1);

        relay.on_stream_closed(a.small_id, Some("reset".into()), now);
        assert_eq!(up_large.written().len(), 2);
        assert_eq!(announced_vendor(&up_large, 1), "Pad B");

        relay.on_stream_closed(b.small_id, None, now);
        assert_eq!(up_large.written().len(), 2);
    }

    #[test]
    fn relay_reconnects_after_losing_upstream() {
        let now = Instant::now();
        let mut relay = controller(CoreConfig::new(Role::Relay));
        relay.browse().unwrap();
        relay.on_discovery_event(DiscoveryEvent::Found(endpoint("tv", ServiceRole::Sink)));
        let (small_id, large_id) = {
            let o = &relay.connector_mut().opened[0];
            (o.small_id, o.large_id)
        };
        relay.on_stream_opened(small_id, now);
        relay.on_stream_opened(large_id, now);
        relay.on_stream_closed(small_id, Some("reset".into()), now);
        assert!(relay.links().is_empty());

        // A repeated announcement of a known sink is not news to discovery.
        relay.on_discovery_event(DiscoveryEvent::Found(endpoint("tv", ServiceRole::Sink)));
        assert_eq!(relay.connector_mut().opened.len(), 1);

        relay.connector_mut().refuse = true;
        relay.tick(now);
        assert_eq!(relay.connector_mut().opened.len(), 1);
        relay.connector_mut().refuse = false;
        relay.tick(now + Duration::from_secs(1));
        assert_eq!(relay.connector_mut().opened.len(), 1);
        relay.tick(now + Duration::from_secs(2));
        let opened = &relay.connector_mut().opened;
        assert_eq!(opened.len(), 2);
        assert!(opened[1].endpoint.starts_with("tv."));

        // A local disconnect is not undone.
        let up = relay.links()[0].id;
        relay.disconnect_link(up);
        relay.tick(now + Duration::from_secs(10));
        assert_eq!(relay.connector_mut().opened.len(), 2);
    }

    #[test]
    fn relay_drops_upstream_after_repeated_failures() {
        let now = Instant::now();
        let mut relay = controller(CoreConfig::new(Role::Relay));
        let up = open_upstream(&mut relay, now);
        let up_small = relay.connector_mut().opened[0].small.clone();
        let a = attach(&mut relay, 1, now);
        register(&mut relay, &a, "A", now);
        drain(&mut relay);

        up_small.set_full(true);
        for _ in 0..4 {
            relay.on_stream_bytes(a.small_id, b"19.75:12:0.75\n", now);
        }
        let events = drain(&mut relay);
        assert!(!events.contains(&ControllerEvent::Disconnected { link: up }));

        relay.on_stream_bytes(a.small_id, b"19.75:12:0.75\n", now);
        let events = drain(&mut relay);
        assert!(events.contains(&ControllerEvent::Disconnected { link: up }));
        assert!(up_small.is_closed());
        // Peripherals stay attached.
        assert!(!a.small.is_closed());
    }

    #[test]
    fn relay_auto_connects_to_first_sink() {
        let mut relay = controller(CoreConfig::new(Role::Relay));
        relay.browse().unwrap();
        relay.on_discovery_event(DiscoveryEvent::Found(endpoint("tv", ServiceRole::Sink)));
        relay.on_discovery_event(DiscoveryEvent::Found(endpoint("den", ServiceRole::Sink)));
        relay.on_discovery_event(DiscoveryEvent::Found(endpoint("r2", ServiceRole::Relay)));
        let opened = &relay.connector_mut().opened;
        assert_eq!(opened.len(), 1);
        assert!(opened[0].endpoint.starts_with("tv."));
        assert_eq!(drain(&mut relay).len(), 2);
    }

    #[test]
    fn source_surfaces_discovery_without_connecting() {
        let mut source = controller(CoreConfig::new(Role::Source));
        source.browse().unwrap();
        let tv = endpoint("tv", ServiceRole::Sink);
        source.on_discovery_event(DiscoveryEvent::Found(tv.clone()));
        source.on_discovery_event(DiscoveryEvent::Lost {
            full_name: tv.full_name.clone(),
        });
        assert!(source.connector_mut().opened.is_empty());
        assert_eq!(
            drain(&mut source),
            vec![
                ControllerEvent::EndpointFound(tv.clone()),
                ControllerEvent::EndpointLost {
                    full_name: tv.full_name
                }
            ]
        );
    }

    #[test]
    fn connect_by_name_and_transport_refusal() {
        let mut source = controller(CoreConfig::new(Role::Source));
        source.browse().unwrap();
        source.on_discovery_event(DiscoveryEvent::Found(endpoint("tv", ServiceRole::Sink)));
        source.connector_mut().refuse = true;
        assert!(matches!(source.connect("tv"), Err(ConnectError::Transport(_))));
        source.connector_mut().refuse = false;
        let link = source.connect("tv").unwrap();
        assert_eq!(source.connect("tv").unwrap(), link);
        assert_eq!(source.connector_mut().opened.len(), 1);
    }

    #[test]
    fn exclusive_relay_rejects_second_peripheral() {
        let now = Instant::now();
        let mut relay = controller(CoreConfig::new(Role::RelayExclusive));
        let a = attach(&mut relay, 1, now);
        register(&mut relay, &a, "A", now);
        drain(&mut relay);
        let b = attach(&mut relay, 3, now);
        assert!(matches!(
            &drain(&mut relay)[..],
            [ControllerEvent::ConnectionFailed {
                reason: FailureReason::RelayBusy,
                ..
            }]
        ));
        assert!(b.small.is_closed() && b.large.is_closed());
        assert!(!a.small.is_closed());
    }

    #[test]
    fn source_refuses_inbound_streams() {
        let mut source = controller(CoreConfig::new(Role::Source));
        let channel = MockChannel::default();
        source.on_inbound_stream(
            StreamId(1),
            Preamble {
                kind: ChannelKind::Small,
                token: Uuid::new_v4(),
            },
            channel.clone(),
            Instant::now(),
        );
        assert!(channel.is_closed());
    }
}
