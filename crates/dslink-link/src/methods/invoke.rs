use dslink_core::{Request, RequestError};
use serde_json::{json, Value};

use super::{Method, MethodContext, MethodOutput};

/// Runs a node's action with the request `params`; result rows become
/// updates.
pub struct InvokeMethod;

impl Method for InvokeMethod {
    fn invoke(&self, ctx: &MethodContext<'_>, request: &Request) -> Result<MethodOutput, RequestError> {
        let target = ctx.target()?;
        if target.trailing.is_some() {
            return Err(RequestError::protocol("invoke expects a node path"));
        }
        let action = target
            .node
            .action()
            .ok_or_else(|| RequestError::protocol(format!("Node is not invokable: {}", target.node.path())))?;

        let params = request.param("params").cloned().unwrap_or_else(|| json!({}));
        let rows: Vec<Value> = action(&params).map_err(RequestError::invocation)?;
        Ok(MethodOutput::closed().with_updates(rows))
    }
}
