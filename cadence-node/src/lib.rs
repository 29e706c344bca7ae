//! Cadence Node - the validator process around the consensus application
//!
//! Configuration loading, the HTTP/JSON-RPC transport, HTTP clients for peers
//! and the consensus engine, a local block driver for development networks and
//! the wiring that starts it all.

pub mod config;
pub mod driver;
pub mod error;
pub mod http;
pub mod node;
pub mod peer_client;
pub mod service;

pub use config::{Environment, NodeConfig};
pub use error::{NodeError, NodeResult};
pub use node::Node;
pub use service::TxService;
