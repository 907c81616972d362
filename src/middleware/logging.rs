use async_trait::async_trait;

use crate::{
    context::RequestContext,
    error::GatewayResult,
    middleware::{ControlFlow, GatewayMiddleware},
};

pub struct RequestLoggingMiddleware;

#[async_trait]
impl GatewayMiddleware for RequestLoggingMiddleware {
    fn name(&self) -> &'static str {
        "request-logging"
    }

    async fn on_request(&self, ctx: &mut RequestContext) -> GatewayResult<ControlFlow> {
        tracing::info!(
            request_id = %ctx.request_id,
            method = %ctx.method,
            path = %ctx.path(),
            target = %ctx.uri,
            client_ip = ?ctx.client_ip,
            "incoming request"
        );
        Ok(ControlFlow::Continue)
    }

    async fn on_response(
        &self,
        ctx: &RequestContext,
        response: &mut axum::response::Response,
    ) -> GatewayResult<()> {
        let latency_ms = ctx.started_at.elapsed().as_millis();
        let gate = ctx.gate.as_ref();
        tracing::info!(
            request_id = %ctx.request_id,
            method = %ctx.method,
            path = %ctx.path(),
            status = %response.status(),
            route_class = gate.map(|g| g.class.as_str()),
            decision = gate.map(|g| g.decision),
            reason = gate.and_then(|g| g.reason).map(|r| r.as_str()),
            role = gate.and_then(|g| g.role.as_ref()).map(|r| r.as_str()),
            upstream = ?ctx.chosen_upstream,
            latency_ms = latency_ms,
            "request completed"
        );
        Ok(())
    }
}
