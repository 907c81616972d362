use std::sync::Arc;

use async_trait::async_trait;
use axum::response::IntoResponse;
use chrono::Utc;

use crate::{
    context::{GateOutcome, RequestContext},
    decision::{DecisionEngine, GatewayDecision},
    error::{GatewayError, GatewayResult},
    middleware::{ControlFlow, GatewayMiddleware, redirect},
    session::SessionCookieStore,
};

/// Runs every request through the decision engine and applies the outcome.
pub struct SessionGateMiddleware {
    engine: Arc<DecisionEngine>,
    cookies: SessionCookieStore,
}

impl SessionGateMiddleware {
    pub fn new(engine: Arc<DecisionEngine>, cookies: SessionCookieStore) -> Self {
        Self { engine, cookies }
    }
}

#[async_trait]
impl GatewayMiddleware for SessionGateMiddleware {
    fn name(&self) -> &'static str {
        "session-gate"
    }

    async fn on_request(&self, ctx: &mut RequestContext) -> GatewayResult<ControlFlow> {
        let credential = self.cookies.credential(&ctx.headers);
        let verdict = self.engine.evaluate(
            credential.as_deref(),
            ctx.path(),
            Utc::now().timestamp(),
        );

        ctx.gate = Some(GateOutcome::from(&verdict));

        match verdict.decision {
            GatewayDecision::Continue { inject } => {
                for (name, value) in inject {
                    ctx.headers.insert(name, value);
                }
                Ok(ControlFlow::Continue)
            }
            GatewayDecision::RedirectTo(location) => {
                Ok(ControlFlow::ShortCircuit(redirect(&location)))
            }
            GatewayDecision::Reject { status, body } => Ok(ControlFlow::ShortCircuit(
                GatewayError::Rejected {
                    status,
                    message: body,
                }
                .into_response(),
            )),
        }
    }
}
