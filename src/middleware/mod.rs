pub mod auth;
pub mod logging;
pub mod login_attempts;
pub mod logout;

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};

use crate::{
    context::RequestContext,
    error::{GatewayError, GatewayResult},
};

/// Result of a request hook: keep going, or answer now with this response.
pub enum ControlFlow {
    Continue,
    ShortCircuit(Response<Body>),
}

#[async_trait]
pub trait GatewayMiddleware: Send + Sync {
    fn name(&self) -> &'static str;

    async fn on_request(&self, ctx: &mut RequestContext) -> GatewayResult<ControlFlow>;

    async fn on_response(
        &self,
        _ctx: &RequestContext,
        _response: &mut Response<Body>,
    ) -> GatewayResult<()> {
        Ok(())
    }
}

/// 303 to `location`. Locations come from validated configuration, so the
/// fallback should not be reachable.
pub fn redirect(location: &str) -> Response<Body> {
    match HeaderValue::from_str(location) {
        Ok(value) => {
            let mut response = StatusCode::SEE_OTHER.into_response();
            response.headers_mut().insert(header::LOCATION, value);
            response.headers_mut().insert(
                header::CACHE_CONTROL,
                HeaderValue::from_static("no-store"),
            );
            response
        }
        Err(_) => GatewayError::Internal(format!("invalid redirect target: {location}"))
            .into_response(),
    }
}

#[cfg(test)]
pub(crate) fn test_context(method: &str, uri: &str, cookie: Option<&str>) -> RequestContext {
    let mut headers = axum::http::HeaderMap::new();
    if let Some(cookie) = cookie {
        headers.insert(header::COOKIE, HeaderValue::from_str(cookie).unwrap());
    }
    RequestContext::new(
        "req-test".to_string(),
        method.parse().unwrap(),
        uri.parse().unwrap(),
        headers,
        bytes::Bytes::new(),
        None,
    )
    .unwrap()
}
