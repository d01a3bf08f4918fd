use dslink_core::node::Trailing;
use dslink_core::{Request, RequestError};

use super::{Method, MethodContext, MethodOutput};

/// Writes `value` to a node, an `@attribute` or a `$config`.
pub struct SetMethod;

impl Method for SetMethod {
    fn invoke(&self, ctx: &MethodContext<'_>, request: &Request) -> Result<MethodOutput, RequestError> {
        let target = ctx.target()?;
        let value = request.require("value")?.clone();
        match &target.trailing {
            None => target.node.set_value(value),
            Some(Trailing::Attribute(name)) => target.node.set_attribute(name, value),
            Some(Trailing::Config(name)) => target.node.set_config(name, value),
        }
        Ok(MethodOutput::closed())
    }
}
