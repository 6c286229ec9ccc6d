//! IntAirAct core: devices, capabilities, routing, actions and object mapping.
//! No I/O; the node crate drives discovery and transport and feeds events in.

pub mod action;
pub mod capability;
pub mod device;
pub mod mapping;
pub mod protocol;
pub mod registry;
pub mod request;
pub mod response;
pub mod route;
pub mod router;
pub mod wire;

pub use action::{Action, ActionError, ActionHandler, ActionTable, Parameter};
pub use capability::Capability;
pub use device::{Device, DeviceId};
pub use mapping::{MappingError, MappingResult, ObjectMapper, Serializer};
pub use protocol::{Announcement, AnnouncementError, Message, PROTOCOL_VERSION};
pub use registry::{DeviceRegistry, Generation, SubscriptionToken};
pub use request::{Method, Request};
pub use response::{Response, StatusCode};
pub use route::{PathPattern, Route, RouteError};
pub use router::{Handler, HandlerFault, Router};
pub use wire::{decode_datagram, encode_datagram, DatagramDecodeError, DatagramEncodeError};
