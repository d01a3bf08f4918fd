//! Request dispatch for the responder side of a session.

use std::collections::HashMap;
use std::sync::Arc;

use dslink_core::wire::raw_rid;
use dslink_core::{NodeResolver, Request, RequestError, ResolvedPath, Response};
use metrics::counter;
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::client::Client;
use crate::methods::{self, Method, MethodContext};

/// Turns inbound request objects into responses.
///
/// Holds the method registry and the node resolver; both are shared by every
/// session, while all per-session state lives on the [`Client`].
pub struct Responder {
    resolver: Arc<dyn NodeResolver>,
    methods: HashMap<String, Arc<dyn Method>>,
}

impl Responder {
    /// Responder with the built-in methods registered.
    pub fn new(resolver: Arc<dyn NodeResolver>) -> Self {
        let mut responder = Self {
            resolver,
            methods: HashMap::new(),
        };
        for (name, method) in methods::builtins() {
            let _ = responder.methods.insert(name.to_owned(), method);
        }
        responder
    }

    /// Register (or replace) a method.
    pub fn register(&mut self, name: &str, method: impl Method + 'static) {
        let _ = self.methods.insert(name.to_owned(), Arc::new(method));
    }

    /// Registered method names, sorted.
    pub fn methods(&self) -> Vec<String> {
        let mut names: Vec<String> = self.methods.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn has_method(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    /// Handle a batch of requests for one session.
    ///
    /// Produces exactly one response per request, in order. Each response is
    /// written to the session as soon as it is built and the batch is
    /// returned as well. A failing request never affects its siblings.
    /// Calls for the same session are serialized.
    ///
    /// # Panics
    ///
    /// In debug builds, when a method returns no stream state. Release
    /// builds answer with a generic error response instead.
    pub async fn parse(&self, client: &Arc<Client>, requests: Vec<Value>) -> Vec<Response> {
        let _lane = client.lock_lane().await;
        let mut responses = Vec::with_capacity(requests.len());
        for raw in requests {
            let rid = raw_rid(&raw);
            let response = match self.try_handle(client, raw) {
                Ok(response) => response,
                Err(err) => {
                    counter!("dslink_request_errors_total", "kind" => err.kind()).increment(1);
                    match &err {
                        RequestError::IllegalState(_) => {
                            error!(rid, session_id = %client.id(), error = %err, "method broke its contract");
                            if cfg!(debug_assertions) {
                                panic!("method broke its contract on rid {rid}: {err}");
                            }
                        }
                        _ => debug!(rid, session_id = %client.id(), error = %err, "request failed"),
                    }
                    Response::failure(rid, &err)
                }
            };
            if !client.write_responses(std::slice::from_ref(&response)) {
                warn!(rid, session_id = %client.id(), "session gone, response dropped");
            }
            responses.push(response);
        }
        responses
    }

    fn try_handle(&self, client: &Arc<Client>, raw: Value) -> Result<Response, RequestError> {
        let request = Request::from_value(raw)?;
        counter!("dslink_requests_total", "method" => request.method.clone()).increment(1);

        let target: Option<ResolvedPath> = request
            .path
            .as_deref()
            .map(|path| self.resolver.resolve(path))
            .transpose()?;

        let method = self
            .methods
            .get(&request.method)
            .ok_or_else(|| RequestError::protocol("Unknown method"))?;

        let ctx = MethodContext {
            client,
            rid: request.rid,
            target: target.as_ref(),
            resolver: self.resolver.as_ref(),
        };
        let output = method.invoke(&ctx, &request)?;
        let state = output
            .state
            .ok_or(RequestError::IllegalState("method returned no stream state"))?;

        if state.is_live() {
            client.tracker().track(request.rid);
        }
        Ok(Response::new(request.rid, state).with_updates(output.updates))
    }

    /// Close a stream from the responder side.
    ///
    /// Writes `{rid, stream: "closed"}` if `rid` was tracked and returns
    /// whether it was. Closing an untracked rid does nothing.
    pub fn close_stream(&self, client: &Client, rid: i64) -> bool {
        if !client.end_stream(rid) {
            return false;
        }
        if !client.write_responses(&[Response::closed(rid)]) {
            warn!(rid, session_id = %client.id(), "session gone, close not delivered");
        }
        true
    }
}
