//! # dslink-core
//!
//! Shared value types for the DSA link/broker session layer:
//!
//! - [`ids`]: session identifiers
//! - [`stream`]: response stream lifecycle
//! - [`wire`]: request/response envelopes as they travel over the transport
//! - [`errors`]: error taxonomy shared by the link and broker crates
//! - [`handshake`]: local identity and negotiated session parameters
//! - [`node`]: the in-memory node tree and the path resolver contract

pub mod errors;
pub mod handshake;
pub mod ids;
pub mod node;
pub mod stream;
pub mod wire;

pub use errors::{HandshakeError, PathResolutionError, RequestError, TransportError};
pub use handshake::{HandshakeRequest, LocalHandshake, RemoteHandshake, MAX_UPDATE_INTERVAL_SECS};
pub use ids::SessionId;
pub use node::{Node, NodeResolver, NodeTree, ResolvedPath};
pub use stream::StreamState;
pub use wire::{Envelope, Request, Response, ResponseError};
