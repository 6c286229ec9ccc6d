//! IntAirAct node: HTTP transport, LAN discovery and the engine that ties them to the core.

pub mod config;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod manager;
pub mod transport;

pub use config::Config;
pub use discovery::{Discovery, DiscoveryError, DiscoveryEvent, ManualDiscovery, MulticastDiscovery};
pub use engine::{IntAirAct, Lifecycle};
pub use error::Error;
pub use manager::ObjectManager;
pub use transport::{HttpClient, HttpServer, TransportError};
