//! Built-in request methods and the trait every method implements.

use std::sync::Arc;

use dslink_core::{NodeResolver, Request, RequestError, ResolvedPath, StreamState};
use serde_json::Value;

use crate::client::Client;

mod close;
mod invoke;
mod list;
mod remove;
mod set;
mod subscribe;

pub use close::CloseMethod;
pub use invoke::InvokeMethod;
pub use list::ListMethod;
pub use remove::RemoveMethod;
pub use set::SetMethod;
pub use subscribe::{SubscribeMethod, UnsubscribeMethod, SUBSCRIPTION_RID};

/// Everything a method may touch while handling one request.
pub struct MethodContext<'a> {
    pub client: &'a Arc<Client>,
    pub rid: i64,
    /// Resolved `path` of the request, if it carried one.
    pub target: Option<&'a ResolvedPath>,
    pub resolver: &'a dyn NodeResolver,
}

impl<'a> MethodContext<'a> {
    /// The resolved request path, or a protocol error when none was sent.
    pub fn target(&self) -> Result<&'a ResolvedPath, RequestError> {
        self.target
            .ok_or_else(|| RequestError::protocol("Missing path"))
    }
}

/// Result of a method invocation.
///
/// `state` is mandatory for a well-behaved method; leaving it unset is
/// reported as an internal error by the responder.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MethodOutput {
    pub updates: Vec<Value>,
    pub state: Option<StreamState>,
}

impl MethodOutput {
    pub fn closed() -> Self {
        Self {
            updates: Vec::new(),
            state: Some(StreamState::Closed),
        }
    }

    pub fn open(updates: Vec<Value>) -> Self {
        Self {
            updates,
            state: Some(StreamState::Open),
        }
    }

    pub fn with_updates(mut self, updates: Vec<Value>) -> Self {
        self.updates = updates;
        self
    }
}

/// A stateless request handler, shared by every session.
pub trait Method: Send + Sync {
    fn invoke(&self, ctx: &MethodContext<'_>, request: &Request) -> Result<MethodOutput, RequestError>;
}

/// The methods every responder starts with.
pub fn builtins() -> Vec<(&'static str, Arc<dyn Method>)> {
    vec![
        ("list", Arc::new(ListMethod)),
        ("set", Arc::new(SetMethod)),
        ("remove", Arc::new(RemoveMethod)),
        ("invoke", Arc::new(InvokeMethod)),
        ("subscribe", Arc::new(SubscribeMethod)),
        ("unsubscribe", Arc::new(UnsubscribeMethod)),
        ("close", Arc::new(CloseMethod)),
    ]
}
