//! In-memory node tree and the path resolver contract.
//!
//! The tree synchronizes itself: each node guards its state with its own
//! `RwLock`, so it can be shared by every session's processing lane. Listeners
//! run after the lock is released and may read or mutate the tree. A listener
//! returns `false` to unregister itself.
//!
//! Read-modify-write sequences spanning several calls (e.g. read a value and
//! set a new one) are not atomic; callers that need that must coordinate
//! themselves.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::Value;

use crate::errors::PathResolutionError;

/// Action bound to an invokable node. Receives the request `params` and
/// returns result rows.
pub type Action = Arc<dyn Fn(&Value) -> Result<Vec<Value>, String> + Send + Sync>;

pub type ChildListener = Arc<dyn Fn(&ChildEvent) -> bool + Send + Sync>;
pub type ValueListener = Arc<dyn Fn(&ValueUpdate) -> bool + Send + Sync>;

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

/// Change to a node's set of children.
#[derive(Clone, Debug)]
pub enum ChildEvent {
    Added(Arc<Node>),
    Removed(String),
}

/// A node value together with the time it was written.
#[derive(Clone, Debug, PartialEq)]
pub struct ValueUpdate {
    pub value: Value,
    pub timestamp: DateTime<Utc>,
}

/// Non-node tail of a path: `@attribute` or `$config`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Trailing {
    Attribute(String),
    Config(String),
}

impl Trailing {
    fn parse(segment: &str) -> Option<Self> {
        if let Some(name) = segment.strip_prefix('@') {
            Some(Self::Attribute(name.to_owned()))
        } else {
            segment
                .strip_prefix('$')
                .map(|name| Self::Config(name.to_owned()))
        }
    }
}

#[derive(Default)]
struct NodeState {
    value: Option<ValueUpdate>,
    configs: BTreeMap<String, Value>,
    attributes: BTreeMap<String, Value>,
    children: BTreeMap<String, Arc<Node>>,
    action: Option<Action>,
    child_listeners: Vec<(u64, ChildListener)>,
    value_listeners: Vec<(u64, ValueListener)>,
}

pub struct Node {
    name: String,
    path: String,
    parent: Option<Weak<Node>>,
    state: RwLock<NodeState>,
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node").field("path", &self.path).finish()
    }
}

impl Node {
    fn root() -> Arc<Self> {
        Arc::new(Self::with_parent(String::new(), "/".to_owned(), None))
    }

    fn with_parent(name: String, path: String, parent: Option<Weak<Node>>) -> Self {
        let mut state = NodeState::default();
        let _ = state.configs.insert("is".into(), Value::String("node".into()));
        Self {
            name,
            path,
            parent,
            state: RwLock::new(state),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    // ── children ────────────────────────────────────────────────────

    /// Get or create a child. Listeners are notified only on creation.
    pub fn create_child(self: &Arc<Self>, name: &str) -> Result<Arc<Node>, PathResolutionError> {
        if name.is_empty() || name.contains('/') || Trailing::parse(name).is_some() {
            return Err(PathResolutionError::Invalid(format!("bad node name: {name:?}")));
        }
        let child = {
            let mut state = self.state.write();
            if let Some(existing) = state.children.get(name) {
                return Ok(existing.clone());
            }
            let path = if self.is_root() {
                format!("/{name}")
            } else {
                format!("{}/{name}", self.path)
            };
            let child = Arc::new(Self::with_parent(
                name.to_owned(),
                path,
                Some(Arc::downgrade(self)),
            ));
            let _ = state.children.insert(name.to_owned(), child.clone());
            child
        };
        self.notify_children(&ChildEvent::Added(child.clone()));
        Ok(child)
    }

    pub fn child(&self, name: &str) -> Option<Arc<Node>> {
        self.state.read().children.get(name).cloned()
    }

    pub fn children(&self) -> Vec<Arc<Node>> {
        self.state.read().children.values().cloned().collect()
    }

    pub fn remove_child(&self, name: &str) -> Option<Arc<Node>> {
        let removed = self.state.write().children.remove(name);
        if removed.is_some() {
            self.notify_children(&ChildEvent::Removed(name.to_owned()));
        }
        removed
    }

    /// Detach this node from its parent. The root cannot be removed.
    pub fn remove_from_parent(&self) -> bool {
        self.parent
            .as_ref()
            .and_then(Weak::upgrade)
            .is_some_and(|parent| parent.remove_child(&self.name).is_some())
    }

    // ── value ───────────────────────────────────────────────────────

    pub fn value(&self) -> Option<ValueUpdate> {
        self.state.read().value.clone()
    }

    pub fn set_value(&self, value: Value) {
        let update = ValueUpdate {
            value,
            timestamp: Utc::now(),
        };
        self.state.write().value = Some(update.clone());
        self.notify_value(&update);
    }

    // ── configs ($) and attributes (@) ──────────────────────────────

    pub fn config(&self, name: &str) -> Option<Value> {
        self.state.read().configs.get(name).cloned()
    }

    pub fn set_config(&self, name: &str, value: Value) {
        let _ = self.state.write().configs.insert(name.to_owned(), value);
    }

    pub fn remove_config(&self, name: &str) -> Option<Value> {
        self.state.write().configs.remove(name)
    }

    pub fn configs(&self) -> Vec<(String, Value)> {
        let state = self.state.read();
        state.configs.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }

    pub fn attribute(&self, name: &str) -> Option<Value> {
        self.state.read().attributes.get(name).cloned()
    }

    pub fn set_attribute(&self, name: &str, value: Value) {
        let _ = self.state.write().attributes.insert(name.to_owned(), value);
    }

    pub fn remove_attribute(&self, name: &str) -> Option<Value> {
        self.state.write().attributes.remove(name)
    }

    pub fn attributes(&self) -> Vec<(String, Value)> {
        let state = self.state.read();
        state.attributes.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }

    // ── actions ─────────────────────────────────────────────────────

    /// Bind an action; the node advertises itself as invokable.
    pub fn set_action(&self, action: Action) {
        let mut state = self.state.write();
        state.action = Some(action);
        let _ = state
            .configs
            .insert("invokable".into(), Value::String("write".into()));
    }

    pub fn action(&self) -> Option<Action> {
        self.state.read().action.clone()
    }

    // ── listeners ───────────────────────────────────────────────────

    pub fn on_child_event(&self, listener: ChildListener) -> u64 {
        let id = NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed);
        self.state.write().child_listeners.push((id, listener));
        id
    }

    pub fn on_value_update(&self, listener: ValueListener) -> u64 {
        let id = NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed);
        self.state.write().value_listeners.push((id, listener));
        id
    }

    pub fn remove_listener(&self, id: u64) {
        let mut state = self.state.write();
        state.child_listeners.retain(|(lid, _)| *lid != id);
        state.value_listeners.retain(|(lid, _)| *lid != id);
    }

    pub fn listener_count(&self) -> usize {
        let state = self.state.read();
        state.child_listeners.len() + state.value_listeners.len()
    }

    fn notify_children(&self, event: &ChildEvent) {
        let listeners = self.state.read().child_listeners.clone();
        let finished: Vec<u64> = listeners
            .iter()
            .filter(|(_, listener)| !listener(event))
            .map(|(id, _)| *id)
            .collect();
        if !finished.is_empty() {
            self.state
                .write()
                .child_listeners
                .retain(|(id, _)| !finished.contains(id));
        }
    }

    fn notify_value(&self, update: &ValueUpdate) {
        let listeners = self.state.read().value_listeners.clone();
        let finished: Vec<u64> = listeners
            .iter()
            .filter(|(_, listener)| !listener(update))
            .map(|(id, _)| *id)
            .collect();
        if !finished.is_empty() {
            self.state
                .write()
                .value_listeners
                .retain(|(id, _)| !finished.contains(id));
        }
    }
}

/// A path lookup result: the node plus an optional attribute/config tail.
#[derive(Clone, Debug)]
pub struct ResolvedPath {
    pub node: Arc<Node>,
    pub trailing: Option<Trailing>,
}

/// Maps request paths onto nodes. Must be callable from any session lane.
pub trait NodeResolver: Send + Sync {
    fn resolve(&self, path: &str) -> Result<ResolvedPath, PathResolutionError>;
}

fn split_path(path: &str) -> Result<Vec<&str>, PathResolutionError> {
    let Some(rest) = path.strip_prefix('/') else {
        return Err(PathResolutionError::Invalid(path.to_owned()));
    };
    Ok(rest.split('/').filter(|s| !s.is_empty()).collect())
}

/// Thread-safe node tree rooted at `/`.
#[derive(Clone)]
pub struct NodeTree {
    root: Arc<Node>,
}

impl Default for NodeTree {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeTree {
    pub fn new() -> Self {
        Self { root: Node::root() }
    }

    pub fn root(&self) -> &Arc<Node> {
        &self.root
    }

    /// Create every missing node along `path` and return the last one.
    pub fn create_path(&self, path: &str) -> Result<Arc<Node>, PathResolutionError> {
        split_path(path)?
            .into_iter()
            .try_fold(self.root.clone(), |node, segment| node.create_child(segment))
    }

    /// Look up a node (no attribute/config tail allowed).
    pub fn get(&self, path: &str) -> Option<Arc<Node>> {
        match self.resolve(path) {
            Ok(ResolvedPath {
                node,
                trailing: None,
            }) => Some(node),
            _ => None,
        }
    }
}

impl NodeResolver for NodeTree {
    fn resolve(&self, path: &str) -> Result<ResolvedPath, PathResolutionError> {
        let segments = split_path(path)?;
        let mut node = self.root.clone();
        for (i, segment) in segments.iter().enumerate() {
            if let Some(trailing) = Trailing::parse(segment) {
                if i + 1 != segments.len() {
                    return Err(PathResolutionError::Invalid(path.to_owned()));
                }
                return Ok(ResolvedPath {
                    node,
                    trailing: Some(trailing),
                });
            }
            node = node
                .child(segment)
                .ok_or_else(|| PathResolutionError::NotFound(path.to_owned()))?;
        }
        Ok(ResolvedPath {
            node,
            trailing: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn create_path_builds_intermediate_nodes() {
        let tree = NodeTree::new();
        let leaf = tree.create_path("/a/b/c").unwrap();
        assert_eq!(leaf.path(), "/a/b/c");
        assert_eq!(tree.get("/a/b").unwrap().children().len(), 1);
    }

    #[test]
    fn resolve_root() {
        let tree = NodeTree::new();
        let resolved = tree.resolve("/").unwrap();
        assert!(resolved.node.is_root());
        assert!(resolved.trailing.is_none());
    }

    #[test]
    fn resolve_missing_node_is_not_found() {
        let tree = NodeTree::new();
        let _ = tree.create_path("/a").unwrap();
        let err = tree.resolve("/a/missing").unwrap_err();
        assert_eq!(err, PathResolutionError::NotFound("/a/missing".into()));
    }

    #[test]
    fn resolve_relative_path_is_invalid() {
        let tree = NodeTree::new();
        assert!(matches!(
            tree.resolve("a/b"),
            Err(PathResolutionError::Invalid(_))
        ));
    }

    #[test]
    fn resolve_attribute_tail() {
        let tree = NodeTree::new();
        let _ = tree.create_path("/a").unwrap();
        let resolved = tree.resolve("/a/@color").unwrap();
        assert_eq!(resolved.node.path(), "/a");
        assert_eq!(resolved.trailing, Some(Trailing::Attribute("color".into())));

        let resolved = tree.resolve("/a/$type").unwrap();
        assert_eq!(resolved.trailing, Some(Trailing::Config("type".into())));
    }

    #[test]
    fn tail_must_be_last_segment() {
        let tree = NodeTree::new();
        let _ = tree.create_path("/a/b").unwrap();
        assert!(matches!(
            tree.resolve("/a/@x/b"),
            Err(PathResolutionError::Invalid(_))
        ));
    }

    #[test]
    fn new_nodes_default_to_is_node() {
        let tree = NodeTree::new();
        let node = tree.create_path("/a").unwrap();
        assert_eq!(node.config("is"), Some(json!("node")));
    }

    #[test]
    fn child_listener_sees_add_and_remove() {
        let tree = NodeTree::new();
        let parent = tree.create_path("/p").unwrap();
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _ = parent.on_child_event(Arc::new(move |event| {
            sink.lock().push(match event {
                ChildEvent::Added(node) => format!("+{}", node.name()),
                ChildEvent::Removed(name) => format!("-{name}"),
            });
            true
        }));

        let _ = parent.create_child("x").unwrap();
        let _ = parent.create_child("x").unwrap();
        assert!(parent.remove_child("x").is_some());
        assert_eq!(*seen.lock(), vec!["+x".to_owned(), "-x".to_owned()]);
    }

    #[test]
    fn listener_returning_false_is_dropped() {
        let tree = NodeTree::new();
        let node = tree.create_path("/v").unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let _ = node.on_value_update(Arc::new(move |_| {
            let _ = counter.fetch_add(1, Ordering::SeqCst);
            false
        }));

        node.set_value(json!(1));
        node.set_value(json!(2));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(node.listener_count(), 0);
    }

    #[test]
    fn listener_may_read_node_during_notification() {
        let tree = NodeTree::new();
        let node = tree.create_path("/v").unwrap();
        let reader = node.clone();
        let _ = node.on_value_update(Arc::new(move |update| {
            assert_eq!(reader.value().map(|v| v.value), Some(update.value.clone()));
            true
        }));
        node.set_value(json!("hi"));
    }

    #[test]
    fn remove_from_parent_detaches() {
        let tree = NodeTree::new();
        let node = tree.create_path("/a/b").unwrap();
        assert!(node.remove_from_parent());
        assert!(tree.get("/a/b").is_none());
        assert!(!tree.root().remove_from_parent());
    }

    #[test]
    fn invalid_child_names_rejected() {
        let tree = NodeTree::new();
        assert!(tree.root().create_child("@attr").is_err());
        assert!(tree.root().create_child("").is_err());
    }

    #[test]
    fn set_action_marks_invokable() {
        let tree = NodeTree::new();
        let node = tree.create_path("/act").unwrap();
        node.set_action(Arc::new(|_| Ok(vec![json!([1])])));
        assert_eq!(node.config("invokable"), Some(json!("write")));
        let rows = node.action().unwrap()(&json!({})).unwrap();
        assert_eq!(rows, vec![json!([1])]);
    }
}
