//! Virtual game controller transport.
//! Host-driven: no I/O; the host owns sockets and discovery, feeds events in and drains
//! `ControllerEvent`s out.

pub mod codec;
pub mod config;
pub mod descriptor;
pub mod discovery;
pub mod element;
pub mod link;
pub mod pairing;
pub mod topology;

pub use codec::{BinaryDecoder, CodecMetrics, EncodeError, FrameError, TextDecoder};
pub use config::{CoreConfig, MappingMode, RelayDispatch, Role};
pub use descriptor::{DeviceDescriptor, Profile};
pub use discovery::{
    Discovery, DiscoveryBackend, DiscoveryError, DiscoveryEvent, Endpoint, ServiceRole,
    ServiceType,
};
pub use element::{ElementId, ElementRegistry, ElementSpec, ElementValue, SystemMessage, ValueKind};
pub use link::{Channel, ChannelError, ChannelKind, Link, LinkId, Preamble, PREAMBLE_LEN};
pub use topology::{
    ConnectError, Connector, ControllerEvent, FailureReason, LinkSummary, StreamId, StreamPair,
    TopologyController,
};
