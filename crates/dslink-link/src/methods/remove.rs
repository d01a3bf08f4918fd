use dslink_core::node::Trailing;
use dslink_core::{Request, RequestError};

use super::{Method, MethodContext, MethodOutput};

/// Deletes an `@attribute`, a `$config`, or the node itself.
pub struct RemoveMethod;

impl Method for RemoveMethod {
    fn invoke(&self, ctx: &MethodContext<'_>, _request: &Request) -> Result<MethodOutput, RequestError> {
        let target = ctx.target()?;
        match &target.trailing {
            Some(Trailing::Attribute(name)) => {
                let _ = target.node.remove_attribute(name);
            }
            Some(Trailing::Config(name)) => {
                let _ = target.node.remove_config(name);
            }
            None => {
                if target.node.is_root() {
                    return Err(RequestError::protocol("Cannot remove the root node"));
                }
                let _ = target.node.remove_from_parent();
            }
        }
        Ok(MethodOutput::closed())
    }
}
