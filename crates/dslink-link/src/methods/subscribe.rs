use std::sync::{Arc, Weak};

use chrono::SecondsFormat;
use dslink_core::node::ValueUpdate;
use dslink_core::{Request, RequestError, Response, StreamState};
use serde_json::{json, Value};

use super::{Method, MethodContext, MethodOutput};
use crate::client::{Client, Subscription};

/// Rid that carries every subscription update.
pub const SUBSCRIPTION_RID: i64 = 0;

/// Registers value subscriptions for `paths: [{path, sid}]`.
///
/// Updates are delivered on rid 0 as `[sid, value, ts]` rows, starting with
/// the current value when the node has one. The request itself closes
/// immediately.
pub struct SubscribeMethod;

impl Method for SubscribeMethod {
    fn invoke(&self, ctx: &MethodContext<'_>, request: &Request) -> Result<MethodOutput, RequestError> {
        let paths = request
            .require("paths")?
            .as_array()
            .ok_or_else(|| RequestError::protocol("paths must be an array"))?;

        // Nothing is registered unless every entry resolves.
        let mut targets = Vec::with_capacity(paths.len());
        for entry in paths {
            let path = entry
                .get("path")
                .and_then(Value::as_str)
                .ok_or_else(|| RequestError::protocol("subscription entry is missing path"))?;
            let sid = entry
                .get("sid")
                .and_then(Value::as_i64)
                .ok_or_else(|| RequestError::protocol("subscription entry is missing sid"))?;

            let resolved = ctx.resolver.resolve(path)?;
            if resolved.trailing.is_some() {
                return Err(RequestError::protocol(format!("cannot subscribe to {path}")));
            }
            targets.push((path, sid, resolved.node));
        }

        for (path, sid, node) in targets {
            let weak = Arc::downgrade(ctx.client);
            let listener_id = node.on_value_update(Arc::new(move |update| push_update(&weak, sid, update)));
            ctx.client.add_subscription(
                sid,
                Subscription {
                    path: path.to_owned(),
                    node: Arc::downgrade(&node),
                    listener_id,
                },
            );

            if let Some(current) = node.value() {
                let _ = ctx.client.write_responses(&[update_response(sid, &current)]);
            }
        }
        Ok(MethodOutput::closed())
    }
}

/// Cancels the subscriptions named in `sids`. Unknown sids are ignored.
pub struct UnsubscribeMethod;

impl Method for UnsubscribeMethod {
    fn invoke(&self, ctx: &MethodContext<'_>, request: &Request) -> Result<MethodOutput, RequestError> {
        let sids = request
            .require("sids")?
            .as_array()
            .ok_or_else(|| RequestError::protocol("sids must be an array"))?;
        for sid in sids {
            let sid = sid
                .as_i64()
                .ok_or_else(|| RequestError::protocol("sid must be an integer"))?;
            let _ = ctx.client.remove_subscription(sid);
        }
        Ok(MethodOutput::closed())
    }
}

fn update_response(sid: i64, update: &ValueUpdate) -> Response {
    let ts = update.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true);
    Response::new(SUBSCRIPTION_RID, StreamState::Open)
        .with_updates(vec![json!([sid, update.value, ts])])
}

fn push_update(client: &Weak<Client>, sid: i64, update: &ValueUpdate) -> bool {
    match client.upgrade() {
        Some(client) if client.has_subscription(sid) => client.write_responses(&[update_response(sid, update)]),
        _ => false,
    }
}
