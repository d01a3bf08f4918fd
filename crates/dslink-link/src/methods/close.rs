use dslink_core::{Request, RequestError};

use super::{Method, MethodContext, MethodOutput};

/// Closes the stream opened under the same rid. The closed response doubles
/// as the close notification.
pub struct CloseMethod;

impl Method for CloseMethod {
    fn invoke(&self, ctx: &MethodContext<'_>, _request: &Request) -> Result<MethodOutput, RequestError> {
        if ctx.client.end_stream(ctx.rid) {
            tracing::debug!(rid = ctx.rid, session_id = %ctx.client.id(), "stream closed by peer");
        }
        Ok(MethodOutput::closed())
    }
}
