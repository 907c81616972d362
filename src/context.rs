use bytes::Bytes;
use http::{HeaderMap, Method, Uri};
use std::{
    net::IpAddr,
    time::Instant,
};

use crate::{
    classifier::RouteClass,
    decision::{DenyReason, Verdict},
    policy::{Role, UnsafePath, canonical_path},
};

/// What the session gate concluded, kept for the completion log line.
#[derive(Debug, Clone, PartialEq)]
pub struct GateOutcome {
    pub class: RouteClass,
    pub decision: &'static str,
    pub reason: Option<DenyReason>,
    pub role: Option<Role>,
}

impl From<&Verdict> for GateOutcome {
    fn from(verdict: &Verdict) -> Self {
        Self {
            class: verdict.class,
            decision: verdict.decision.kind(),
            reason: verdict.reason,
            role: verdict.role.clone(),
        }
    }
}

/// Per-request state threaded through the middleware chain.
///
/// The path is canonicalised once here; every hook and the upstream call see
/// the same form. The raw request target stays on `uri`.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub method: Method,
    pub uri: Uri,
    path: String,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub client_ip: Option<IpAddr>,
    pub started_at: Instant,
    pub chosen_upstream: Option<String>,
    pub gate: Option<GateOutcome>,
}

impl RequestContext {
    pub fn new(
        request_id: String,
        method: Method,
        uri: Uri,
        headers: HeaderMap,
        body: Bytes,
        client_ip: Option<IpAddr>,
    ) -> Result<Self, UnsafePath> {
        let path = canonical_path(uri.path())?;
        Ok(Self {
            request_id,
            method,
            uri,
            path,
            headers,
            body,
            client_ip,
            started_at: Instant::now(),
            chosen_upstream: None,
            gate: None,
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Canonical path plus the original query string.
    pub fn upstream_target(&self) -> String {
        match self.uri.query() {
            Some(query) => format!("{}?{query}", self.path),
            None => self.path.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(uri: &str) -> Result<RequestContext, UnsafePath> {
        RequestContext::new(
            "req-1".into(),
            Method::GET,
            uri.parse().unwrap(),
            HeaderMap::new(),
            Bytes::new(),
            None,
        )
    }

    #[test]
    fn upstream_sees_the_checked_path() {
        let ctx = context("/account/%2e%2e/dashboard?tab=2").unwrap();
        assert_eq!(ctx.path(), "/dashboard");
        assert_eq!(ctx.upstream_target(), "/dashboard?tab=2");
        assert_eq!(ctx.uri.path(), "/account/%2e%2e/dashboard");

        let ctx = context("/api//portfolio").unwrap();
        assert_eq!(ctx.upstream_target(), "/api/portfolio");
    }

    #[test]
    fn unsafe_targets_do_not_build_a_context() {
        assert_eq!(
            context("/account/..%2fdashboard").unwrap_err(),
            UnsafePath::EncodedSeparator
        );
        assert_eq!(context("/../etc/passwd").unwrap_err(), UnsafePath::AboveRoot);
    }
}
