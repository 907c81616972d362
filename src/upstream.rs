use axum::{
    body::Body,
    response::Response,
};
use http::header::HeaderName;
use std::{
    collections::HashMap,
    time::Duration,
};

use crate::{
    config::UpstreamConfig,
    context::RequestContext,
    error::{GatewayError, GatewayResult},
};

/// Named downstream services requests are proxied to once the gate lets them
/// through.
#[derive(Clone)]
pub struct UpstreamPool {
    client: reqwest::Client,
    services: HashMap<String, UpstreamConfig>,
}

impl UpstreamPool {
    pub fn new(upstreams: Vec<UpstreamConfig>) -> GatewayResult<Self> {
        let services = upstreams
            .into_iter()
            .map(|upstream| (upstream.name.clone(), upstream))
            .collect();

        let client = reqwest::Client::builder()
            .pool_idle_timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(32)
            .tcp_nodelay(true)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| GatewayError::Internal(e.to_string()))?;

        Ok(Self { client, services })
    }

    pub fn get(&self, name: &str) -> Option<&UpstreamConfig> {
        self.services.get(name)
    }

    pub async fn forward(
        &self,
        ctx: &RequestContext,
        upstream: &UpstreamConfig,
    ) -> GatewayResult<Response<Body>> {
        let target_url = format!(
            "{}{}",
            upstream.base_url.trim_end_matches('/'),
            ctx.upstream_target()
        );

        let mut request = self
            .client
            .request(ctx.method.clone(), &target_url)
            .body(ctx.body.clone());

        for (name, value) in &ctx.headers {
            if should_forward_header(name) {
                request = request.header(name, value);
            }
        }

        request = request.header("x-request-id", ctx.request_id.clone());
        if let Some(client_ip) = ctx.client_ip {
            request = request.header("x-forwarded-for", client_ip.to_string());
        }

        let upstream_response = request
            .timeout(Duration::from_millis(upstream.timeout_ms))
            .send()
            .await?;

        let status = upstream_response.status();
        let headers = upstream_response.headers().clone();
        let body = upstream_response.bytes().await?;

        let mut builder = Response::builder().status(status);
        for (name, value) in &headers {
            if should_forward_header(name) {
                builder = builder.header(name, value);
            }
        }

        builder
            .body(Body::from(body))
            .map_err(|e| GatewayError::Internal(e.to_string()))
    }
}

fn should_forward_header(name: &HeaderName) -> bool {
    !matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
            | "host"
            | "content-length"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_hop_by_hop_but_keeps_credentials() {
        assert!(!should_forward_header(&HeaderName::from_static("connection")));
        assert!(!should_forward_header(&HeaderName::from_static("host")));
        assert!(should_forward_header(&HeaderName::from_static("authorization")));
        assert!(should_forward_header(&HeaderName::from_static("set-cookie")));
    }
}
