use std::{
    net::IpAddr,
    sync::Arc,
};

use axum::{
    body::{
        Body,
        to_bytes,
    },
    http::{
        HeaderName,
        HeaderValue,
        Request,
        StatusCode,
    },
    response::{
        IntoResponse,
        Response,
    },
};
use uuid::Uuid;

use crate::{
    classifier::RequestClassifier,
    config::{
        GatewayConfig,
        RouteConfig,
        TokenVerificationConfig,
    },
    context::RequestContext,
    decision::{DecisionEngine, RedirectTargets},
    error::{GatewayError, GatewayResult},
    middleware::{
        ControlFlow,
        GatewayMiddleware,
        auth::SessionGateMiddleware,
        logging::RequestLoggingMiddleware,
        login_attempts::LoginAttemptsMiddleware,
        logout::LogoutMiddleware,
    },
    policy::{AccessPolicy, path_matches},
    session::SessionCookieStore,
    token::{HmacSha256Verifier, TokenCodec},
    upstream::UpstreamPool,
};

pub struct Gateway {
    middlewares: Vec<Arc<dyn GatewayMiddleware>>,
    routes: Vec<RouteConfig>,
    upstream_pool: UpstreamPool,
    max_body_bytes: usize,
}

impl Gateway {
    pub fn from_config(config: GatewayConfig) -> GatewayResult<Self> {
        let codec = match &config.auth.verification {
            TokenVerificationConfig::None => {
                tracing::warn!("credential signatures are not verified; claims are trusted as decoded");
                TokenCodec::unverified()
            }
            TokenVerificationConfig::HmacSha256 { secret } => {
                TokenCodec::new(Arc::new(HmacSha256Verifier::new(secret.as_bytes())))
            }
        };

        let policy = AccessPolicy::new(config.auth.policy.clone());
        for row in &config.auth.policy {
            tracing::debug!(
                role = %row.role,
                prefixes = ?policy.allowed_prefixes(&row.role),
                default_page = ?policy.default_page(&row.role).ok(),
                "role policy"
            );
        }
        for role in policy.roles_without_default_page() {
            tracing::warn!(role = %role, "role has no default page; its users will be logged out when redirected");
        }
        tracing::info!(
            roles = policy.role_count(),
            verifier = codec.verifier_name(),
            "access policy loaded"
        );

        let classifier = RequestClassifier::new(
            config.auth.public_prefixes.clone(),
            config.auth.login_path.clone(),
            config.auth.api_prefix.clone(),
        );
        let engine = Arc::new(DecisionEngine::new(
            codec,
            Arc::new(policy),
            classifier,
            RedirectTargets {
                login_path: config.auth.login_path.clone(),
                logout_path: config.auth.logout_path.clone(),
                codes: config.auth.logout_codes.clone(),
            },
        ));
        let cookies = SessionCookieStore::new(config.session.clone());

        let middlewares: Vec<Arc<dyn GatewayMiddleware>> = vec![
            Arc::new(RequestLoggingMiddleware),
            Arc::new(LogoutMiddleware::new(
                config.auth.logout_path.clone(),
                config.auth.login_path.clone(),
                cookies.clone(),
            )),
            Arc::new(SessionGateMiddleware::new(engine, cookies.clone())),
            Arc::new(LoginAttemptsMiddleware::new(
                config.login_attempts.clone(),
                cookies,
            )),
        ];

        Ok(Self {
            middlewares,
            routes: config.routes,
            upstream_pool: UpstreamPool::new(config.upstreams)?,
            max_body_bytes: config.max_body_bytes,
        })
    }

    pub async fn handle_http(
        &self,
        request: Request<Body>,
        client_ip: Option<IpAddr>,
    ) -> Response<Body> {
        let (parts, body) = request.into_parts();
        let max_capture = self.max_body_bytes.saturating_add(1);
        let body = match to_bytes(body, max_capture).await {
            Ok(body) if body.len() <= self.max_body_bytes => body,
            _ => {
                let mut response = GatewayError::PayloadTooLarge.into_response();
                self.attach_hardening_headers("unknown", &mut response);
                return response;
            }
        };

        let request_id = parts
            .headers
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
            .map(ToString::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut ctx = match RequestContext::new(
            request_id.clone(),
            parts.method,
            parts.uri,
            parts.headers,
            body,
            client_ip,
        ) {
            Ok(ctx) => ctx,
            Err(err) => {
                tracing::warn!(request_id = %request_id, error = %err, "refusing request path");
                let mut response = GatewayError::Rejected {
                    status: StatusCode::BAD_REQUEST,
                    message: err.to_string(),
                }
                .into_response();
                self.attach_hardening_headers(&request_id, &mut response);
                return response;
            }
        };

        let mut executed = Vec::new();

        for (idx, middleware) in self.middlewares.iter().enumerate() {
            match middleware.on_request(&mut ctx).await {
                Ok(ControlFlow::Continue) => executed.push(idx),
                Ok(ControlFlow::ShortCircuit(response)) => {
                    return self.finish(&executed, &ctx, response).await;
                }
                Err(err) => {
                    tracing::warn!(
                        request_id = %ctx.request_id,
                        middleware = middleware.name(),
                        error = %err.message(),
                        "middleware rejected request"
                    );
                    return self.finish(&executed, &ctx, err.into_response()).await;
                }
            }
        }

        let response = match self.proxy(&mut ctx).await {
            Ok(response) => response,
            Err(err) => {
                tracing::warn!(
                    request_id = %ctx.request_id,
                    upstream = ?ctx.chosen_upstream,
                    error = %err.message(),
                    "upstream call failed"
                );
                err.into_response()
            }
        };
        self.finish(&executed, &ctx, response).await
    }

    async fn proxy(&self, ctx: &mut RequestContext) -> GatewayResult<Response<Body>> {
        let route = self
            .resolve_route(ctx.path())
            .ok_or(GatewayError::RouteNotFound)?;
        let upstream = self
            .upstream_pool
            .get(&route.upstream)
            .ok_or(GatewayError::UpstreamUnavailable)?;

        ctx.chosen_upstream = Some(upstream.name.clone());
        self.upstream_pool.forward(ctx, upstream).await
    }

    fn resolve_route(&self, path: &str) -> Option<&RouteConfig> {
        self.routes
            .iter()
            .filter(|route| path_matches(&route.path_prefix, path))
            .max_by_key(|route| route.path_prefix.len())
    }

    async fn finish(
        &self,
        executed: &[usize],
        ctx: &RequestContext,
        mut response: Response<Body>,
    ) -> Response<Body> {
        self.apply_response_middlewares(executed, ctx, &mut response)
            .await;
        self.attach_hardening_headers(&ctx.request_id, &mut response);
        response
    }

    async fn apply_response_middlewares(
        &self,
        executed: &[usize],
        ctx: &RequestContext,
        response: &mut Response<Body>,
    ) {
        for idx in executed.iter().rev() {
            let middleware = &self.middlewares[*idx];
            if let Err(err) = middleware.on_response(ctx, response).await {
                tracing::warn!(
                    request_id = %ctx.request_id,
                    middleware = middleware.name(),
                    error = %err.message(),
                    "middleware post-response hook failed"
                );
            }
        }
    }

    fn attach_hardening_headers(&self, request_id: &str, response: &mut Response<Body>) {
        if let Ok(value) = HeaderValue::from_str(request_id) {
            response
                .headers_mut()
                .insert(HeaderName::from_static("x-request-id"), value);
        }

        response.headers_mut().insert(
            HeaderName::from_static("x-content-type-options"),
            HeaderValue::from_static("nosniff"),
        );
        response.headers_mut().insert(
            HeaderName::from_static("x-frame-options"),
            HeaderValue::from_static("DENY"),
        );
        response.headers_mut().insert(
            HeaderName::from_static("referrer-policy"),
            HeaderValue::from_static("no-referrer"),
        );
    }
}
