//! # dslink-broker
//!
//! A minimal DSA broker. Links negotiate at `POST /conn`, open their
//! WebSocket at `/ws`, and are mounted under `/conns/<dsId>` for as long as
//! the transport stays up. Each connected link is served by the same
//! responder/requester machinery the link runtime uses. When a Prometheus
//! recorder is installed, `/metrics` serves it.

#![deny(unsafe_code)]

pub mod metrics;
pub mod server;

pub use server::{build_router, start, AppState, Broker, BrokerConfig, BrokerHandle};
