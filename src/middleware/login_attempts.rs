use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Method, StatusCode},
    response::{IntoResponse, Response},
};
use chrono::Utc;

use crate::{
    config::LoginAttemptsConfig,
    context::RequestContext,
    error::{GatewayError, GatewayResult},
    middleware::{ControlFlow, GatewayMiddleware},
    policy::path_matches,
    session::SessionCookieStore,
};

/// Counts outcomes of the credential exchange in the attempts cookie and
/// refuses further attempts once the threshold is reached. Client-advisory:
/// the count lives with the client and resets when cookies are cleared.
pub struct LoginAttemptsMiddleware {
    cfg: LoginAttemptsConfig,
    cookies: SessionCookieStore,
}

impl LoginAttemptsMiddleware {
    pub fn new(cfg: LoginAttemptsConfig, cookies: SessionCookieStore) -> Self {
        Self { cfg, cookies }
    }

    fn applies(&self, ctx: &RequestContext) -> bool {
        ctx.method == Method::POST && path_matches(&self.cfg.exchange_path, ctx.path())
    }
}

#[async_trait]
impl GatewayMiddleware for LoginAttemptsMiddleware {
    fn name(&self) -> &'static str {
        "login-attempts"
    }

    async fn on_request(&self, ctx: &mut RequestContext) -> GatewayResult<ControlFlow> {
        if !self.applies(ctx) {
            return Ok(ControlFlow::Continue);
        }

        let record = self.cookies.attempts(&ctx.headers);
        if !record.is_locked(self.cfg.max_attempts) {
            return Ok(ControlFlow::Continue);
        }

        let retry_after_secs =
            record.seconds_until_reset(self.cookies.attempts_ttl_secs(), Utc::now());
        tracing::warn!(
            request_id = %ctx.request_id,
            attempts = record.attempts,
            retry_after_secs,
            "login attempt refused; too many failures"
        );
        Ok(ControlFlow::ShortCircuit(
            GatewayError::LoginLocked { retry_after_secs }.into_response(),
        ))
    }

    async fn on_response(
        &self,
        ctx: &RequestContext,
        response: &mut Response<Body>,
    ) -> GatewayResult<()> {
        if !self.applies(ctx) {
            return Ok(());
        }

        let status = response.status();
        if status.is_success() {
            self.cookies.clear_attempts(response.headers_mut())
        } else if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
            let record = self.cookies.attempts(&ctx.headers).failed_at(Utc::now());
            tracing::info!(
                request_id = %ctx.request_id,
                attempts = record.attempts,
                "login attempt failed"
            );
            self.cookies.set_attempts(
                response.headers_mut(),
                &record,
                self.cookies.attempts_ttl_secs(),
            )
        } else {
            Ok(())
        }
    }
}
