//! # dslink-link
//!
//! Runtime for a DSA link: per-session state, the responder and requester
//! roles, handshake negotiation, WebSocket transport and the connection
//! manager that keeps it all connected.
//!
//! The broker reuses [`Link`], [`Client`] and the responder machinery for
//! each connected peer.

#![deny(unsafe_code)]

pub mod backoff;
pub mod client;
pub mod connector;
pub mod data_handler;
pub mod handshake;
pub mod link;
pub mod manager;
pub mod methods;
pub mod requester;
pub mod responder;
pub mod tracker;

pub use backoff::Backoff;
pub use client::{Client, Subscription};
pub use connector::{Connector, ConnectorEvent, ConnectorFactory, WebSocketConnector, WebSocketConnectorFactory};
pub use data_handler::DataHandler;
pub use handshake::{load_local_handshake, load_or_create_key, HttpNegotiator, Negotiator};
pub use link::Link;
pub use manager::{ClientConnected, ConnectedCallback, ConnectionManager, ConnectionState, PreInitHook};
pub use methods::{Method, MethodContext, MethodOutput};
pub use requester::Requester;
pub use responder::Responder;
pub use tracker::ResponseTracker;
