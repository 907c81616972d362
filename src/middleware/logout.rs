use async_trait::async_trait;

use crate::{
    context::RequestContext,
    error::GatewayResult,
    middleware::{ControlFlow, GatewayMiddleware, redirect},
    session::SessionCookieStore,
};

/// Answers the logout path locally: expires the credential cookie and sends
/// the visitor to the login page, carrying over the `msg` code.
pub struct LogoutMiddleware {
    logout_path: String,
    login_path: String,
    cookies: SessionCookieStore,
}

impl LogoutMiddleware {
    pub fn new(logout_path: String, login_path: String, cookies: SessionCookieStore) -> Self {
        Self {
            logout_path,
            login_path,
            cookies,
        }
    }

    fn login_target(&self, query: Option<&str>) -> String {
        let code = query
            .unwrap_or_default()
            .split('&')
            .filter_map(|pair| pair.split_once('='))
            .find(|(key, _)| *key == "msg")
            .map(|(_, value)| value)
            .filter(|v| !v.is_empty() && v.bytes().all(|b| b.is_ascii_alphanumeric()));

        match code {
            Some(code) => format!("{}?msg={code}", self.login_path),
            None => self.login_path.clone(),
        }
    }
}

#[async_trait]
impl GatewayMiddleware for LogoutMiddleware {
    fn name(&self) -> &'static str {
        "logout"
    }

    async fn on_request(&self, ctx: &mut RequestContext) -> GatewayResult<ControlFlow> {
        if ctx.path() != self.logout_path {
            return Ok(ControlFlow::Continue);
        }

        let mut response = redirect(&self.login_target(ctx.uri.query()));
        self.cookies.clear_credential(response.headers_mut())?;

        tracing::info!(
            request_id = %ctx.request_id,
            client_ip = ?ctx.client_ip,
            "credential cookie cleared"
        );
        Ok(ControlFlow::ShortCircuit(response))
    }
}
