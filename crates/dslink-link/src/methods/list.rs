use std::sync::{Arc, Weak};

use dslink_core::node::{ChildEvent, Node};
use dslink_core::{Request, RequestError, Response, StreamState};
use serde_json::{json, Map, Value};

use super::{Method, MethodContext, MethodOutput};
use crate::client::{Client, Subscription};

/// Streams a node's metadata and children.
///
/// The initial response enumerates `$is`, the remaining configs, the
/// attributes and one summary per child. The stream stays open and reports
/// child additions and removals until the rid is closed.
pub struct ListMethod;

impl Method for ListMethod {
    fn invoke(&self, ctx: &MethodContext<'_>, _request: &Request) -> Result<MethodOutput, RequestError> {
        let target = ctx.target()?;
        if target.trailing.is_some() {
            return Err(RequestError::protocol("list expects a node path"));
        }
        let node = &target.node;

        // The listener checks the tracker, so the rid must be live before it
        // can fire.
        ctx.client.tracker().track(ctx.rid);
        let client = Arc::downgrade(ctx.client);
        let rid = ctx.rid;
        let listener_id = node.on_child_event(Arc::new(move |event| stream_child_event(&client, rid, event)));
        ctx.client.attach_list_stream(
            rid,
            Subscription {
                path: node.path().to_owned(),
                node: Arc::downgrade(node),
                listener_id,
            },
        );

        Ok(MethodOutput::open(snapshot(node)))
    }
}

fn snapshot(node: &Node) -> Vec<Value> {
    let mut updates = vec![json!(["$is", node.config("is").unwrap_or_else(|| json!("node"))])];
    updates.extend(
        node.configs()
            .into_iter()
            .filter(|(name, _)| name != "is")
            .map(|(name, value)| json!([format!("${name}"), value])),
    );
    updates.extend(
        node.attributes()
            .into_iter()
            .map(|(name, value)| json!([format!("@{name}"), value])),
    );
    updates.extend(
        node.children()
            .iter()
            .map(|child| json!([child.name(), child_summary(child)])),
    );
    updates
}

fn child_summary(child: &Node) -> Value {
    let mut summary = Map::new();
    let _ = summary.insert(
        "$is".into(),
        child.config("is").unwrap_or_else(|| json!("node")),
    );
    if let Some(invokable) = child.config("invokable") {
        let _ = summary.insert("$invokable".into(), invokable);
    }
    Value::Object(summary)
}

/// Returns `false` once the stream is gone so the node drops the listener.
fn stream_child_event(client: &Weak<Client>, rid: i64, event: &ChildEvent) -> bool {
    let Some(client) = client.upgrade() else {
        return false;
    };
    if !client.tracker().is_tracking(rid) {
        return false;
    }
    let update = match event {
        ChildEvent::Added(child) => json!([child.name(), child_summary(child)]),
        ChildEvent::Removed(name) => json!({"name": name, "change": "remove"}),
    };
    client.write_responses(&[Response::new(rid, StreamState::Open).with_updates(vec![update])])
}
