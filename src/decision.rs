use std::{fmt, sync::Arc};

use http::{HeaderName, HeaderValue, StatusCode, header::AUTHORIZATION};

use crate::{
    classifier::{RequestClassifier, RouteClass},
    policy::{AccessPolicy, Role, canonical_path},
    token::{DecodeError, TokenCodec, is_expired},
};

/// Outcome of the gateway for one request. Callers must handle every case.
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayDecision {
    Continue {
        inject: Vec<(HeaderName, HeaderValue)>,
    },
    RedirectTo(String),
    Reject {
        status: StatusCode,
        body: String,
    },
}

impl GatewayDecision {
    pub fn pass() -> Self {
        Self::Continue { inject: Vec::new() }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Continue { .. } => "continue",
            Self::RedirectTo(_) => "redirect",
            Self::Reject { .. } => "reject",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    NoCredential,
    MalformedCredential,
    ExpiredCredential,
    InsufficientRole,
    MissingPolicyConfig,
    UnsafePath,
}

impl DenyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoCredential => "no_credential",
            Self::MalformedCredential => "malformed_credential",
            Self::ExpiredCredential => "expired_credential",
            Self::InsufficientRole => "insufficient_role",
            Self::MissingPolicyConfig => "missing_policy_config",
            Self::UnsafePath => "unsafe_path",
        }
    }
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `msg` codes appended to the logout redirect.
#[derive(Debug, Clone)]
pub struct LogoutCodes {
    pub expired: String,
    pub malformed: String,
    pub misconfigured: String,
}

impl Default for LogoutCodes {
    fn default() -> Self {
        Self {
            expired: "100304".to_string(),
            malformed: "100301".to_string(),
            misconfigured: "100305".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RedirectTargets {
    pub login_path: String,
    pub logout_path: String,
    pub codes: LogoutCodes,
}

/// A decision plus what led to it, for logging.
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub class: RouteClass,
    pub decision: GatewayDecision,
    pub reason: Option<DenyReason>,
    pub role: Option<Role>,
}

pub struct DecisionEngine {
    codec: TokenCodec,
    policy: Arc<AccessPolicy>,
    classifier: RequestClassifier,
    targets: RedirectTargets,
}

impl DecisionEngine {
    pub fn new(
        codec: TokenCodec,
        policy: Arc<AccessPolicy>,
        classifier: RequestClassifier,
        targets: RedirectTargets,
    ) -> Self {
        Self {
            codec,
            policy,
            classifier,
            targets,
        }
    }

    pub fn decide(&self, credential: Option<&str>, path: &str, now: i64) -> GatewayDecision {
        self.evaluate(credential, path, now).decision
    }

    /// `path` is canonicalised before classification; a path that cannot be
    /// is rejected whatever the credential.
    pub fn evaluate(&self, credential: Option<&str>, path: &str, now: i64) -> Verdict {
        let verdict = match canonical_path(path) {
            Ok(canonical) => self.route(credential, &canonical, now),
            Err(err) => Verdict::new(
                RouteClass::ProtectedAppRoute,
                GatewayDecision::Reject {
                    status: StatusCode::BAD_REQUEST,
                    body: err.to_string(),
                },
            )
            .because(DenyReason::UnsafePath),
        };

        tracing::debug!(
            path = %path,
            route_class = %verdict.class,
            decision = verdict.decision.kind(),
            reason = verdict.reason.map(|r| r.as_str()),
            role = verdict.role.as_ref().map(Role::as_str),
            "gateway decision"
        );

        verdict
    }

    fn route(&self, credential: Option<&str>, path: &str, now: i64) -> Verdict {
        let class = self.classifier.classify(path);
        match class {
            RouteClass::PublicRoute => Verdict::new(class, GatewayDecision::pass()),
            RouteClass::ApiRoute => self.forward_api(class, credential),
            RouteClass::LoginRoute => match self.authenticate(credential, now) {
                Ok(role) => self.landing(class, role, path),
                Err(DenyReason::NoCredential) => Verdict::new(class, GatewayDecision::pass())
                    .because(DenyReason::NoCredential),
                Err(reason) => self.force_logout(class, reason, None),
            },
            RouteClass::ProtectedAppRoute => match self.authenticate(credential, now) {
                Ok(role) if self.policy.is_allowed(&role, path) => {
                    Verdict::new(class, GatewayDecision::pass()).with_role(role)
                }
                Ok(role) => self.landing(class, role, path),
                Err(DenyReason::NoCredential) => Verdict::new(
                    class,
                    GatewayDecision::RedirectTo(self.targets.login_path.clone()),
                )
                .because(DenyReason::NoCredential),
                Err(reason) => self.force_logout(class, reason, None),
            },
        }
    }

    fn authenticate(&self, credential: Option<&str>, now: i64) -> Result<Role, DenyReason> {
        let claims = self.codec.decode(credential).map_err(|err| match err {
            DecodeError::NoCredential => DenyReason::NoCredential,
            DecodeError::Malformed(_) | DecodeError::BadSignature => {
                DenyReason::MalformedCredential
            }
        })?;

        if is_expired(&claims, now) {
            return Err(DenyReason::ExpiredCredential);
        }
        Ok(claims.role)
    }

    /// API calls are forwarded, not gatekept: the credential rides along as a
    /// bearer header whatever its validity.
    fn forward_api(&self, class: RouteClass, credential: Option<&str>) -> Verdict {
        let Some(token) = credential.map(str::trim).filter(|c| !c.is_empty()) else {
            return Verdict::new(class, GatewayDecision::pass()).because(DenyReason::NoCredential);
        };

        match HeaderValue::from_str(&format!("Bearer {token}")) {
            Ok(mut value) => {
                value.set_sensitive(true);
                Verdict::new(
                    class,
                    GatewayDecision::Continue {
                        inject: vec![(AUTHORIZATION, value)],
                    },
                )
            }
            Err(_) => Verdict::new(
                class,
                GatewayDecision::Reject {
                    status: StatusCode::BAD_REQUEST,
                    body: "credential cookie is not a valid header value".to_string(),
                },
            )
            .because(DenyReason::MalformedCredential),
        }
    }

    /// Bounce an authenticated user to their landing page, away from the login
    /// page or from a protected `path` their role was refused.
    fn landing(&self, class: RouteClass, role: Role, path: &str) -> Verdict {
        let reason =
            (class == RouteClass::ProtectedAppRoute).then_some(DenyReason::InsufficientRole);
        match self.policy.default_page(&role) {
            Ok(page) if !self.lands_where_it_started(class, page, path) => {
                let verdict = Verdict::new(class, GatewayDecision::RedirectTo(page.to_string()))
                    .with_role(role);
                match reason {
                    Some(reason) => verdict.because(reason),
                    None => verdict,
                }
            }
            Ok(_) | Err(_) => self.force_logout(class, DenyReason::MissingPolicyConfig, Some(role)),
        }
    }

    /// A landing page that is the refused path, or that is itself a login
    /// route, would redirect forever.
    fn lands_where_it_started(&self, class: RouteClass, page: &str, path: &str) -> bool {
        page == path
            || (class == RouteClass::LoginRoute
                && self.classifier.classify(page) == RouteClass::LoginRoute)
    }

    fn force_logout(&self, class: RouteClass, reason: DenyReason, role: Option<Role>) -> Verdict {
        let code = match reason {
            DenyReason::ExpiredCredential => &self.targets.codes.expired,
            DenyReason::MissingPolicyConfig => &self.targets.codes.misconfigured,
            _ => &self.targets.codes.malformed,
        };
        let verdict = Verdict::new(
            class,
            GatewayDecision::RedirectTo(format!("{}?msg={code}", self.targets.logout_path)),
        )
        .because(reason);

        match role {
            Some(role) => verdict.with_role(role),
            None => verdict,
        }
    }
}

impl Verdict {
    fn new(class: RouteClass, decision: GatewayDecision) -> Self {
        Self {
            class,
            decision,
            reason: None,
            role: None,
        }
    }

    fn because(mut self, reason: DenyReason) -> Self {
        self.reason = Some(reason);
        self
    }

    fn with_role(mut self, role: Role) -> Self {
        self.role = Some(role);
        self
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{
        classifier::tests::classifier,
        policy::{
            RolePolicy,
            tests::{role, sample_policy},
        },
        token::tests::{encode, token},
    };

    const NOW: i64 = 1_750_000_000;

    fn engine_with(policy: AccessPolicy) -> DecisionEngine {
        DecisionEngine::new(
            TokenCodec::unverified(),
            Arc::new(policy),
            classifier(),
            RedirectTargets {
                login_path: "/login".into(),
                logout_path: "/logout".into(),
                codes: LogoutCodes::default(),
            },
        )
    }

    pub(crate) fn engine() -> DecisionEngine {
        engine_with(sample_policy())
    }

    fn redirect(path: &str) -> GatewayDecision {
        GatewayDecision::RedirectTo(path.to_string())
    }

    fn bearer(raw: &str) -> GatewayDecision {
        GatewayDecision::Continue {
            inject: vec![(
                AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {raw}")).unwrap(),
            )],
        }
    }

    #[test]
    fn anonymous_visitor_is_sent_to_login() {
        assert_eq!(engine().decide(None, "/dashboard", NOW), redirect("/login"));
    }

    #[test]
    fn expired_credential_forces_logout() {
        let raw = token("PORTFOLIO", NOW - 10);
        assert_eq!(
            engine().decide(Some(&raw), "/portfolio", NOW),
            redirect("/logout?msg=100304")
        );
    }

    #[test]
    fn role_without_access_lands_on_its_default_page() {
        let raw = token("ACCOUNT", NOW + 3600);
        let verdict = engine().evaluate(Some(&raw), "/dashboard", NOW);

        assert_eq!(verdict.decision, redirect("/account"));
        assert_eq!(verdict.reason, Some(DenyReason::InsufficientRole));
        assert_eq!(verdict.role.as_ref().map(Role::as_str), Some("ACCOUNT"));
    }

    #[test]
    fn authenticated_user_is_bounced_off_login() {
        let raw = token("adminuser", NOW + 3600);
        assert_eq!(engine().decide(Some(&raw), "/login", NOW), redirect("/dashboard"));
    }

    #[test]
    fn public_api_login_never_gets_a_header() {
        let raw = token("ADMINUSER", NOW + 3600);
        let engine = engine();
        assert_eq!(engine.decide(None, "/api/login", NOW), GatewayDecision::pass());
        assert_eq!(engine.decide(Some(&raw), "/api/login", NOW), GatewayDecision::pass());
        assert_eq!(engine.decide(Some("junk"), "/api/login", NOW), GatewayDecision::pass());
    }

    #[test]
    fn api_routes_forward_the_credential() {
        let raw = token("PORTFOLIO", NOW + 3600);
        let engine = engine();
        assert_eq!(engine.decide(Some(&raw), "/api/portfolio/add", NOW), bearer(&raw));

        let expired = token("PORTFOLIO", NOW - 1);
        assert_eq!(engine.decide(Some(&expired), "/api/portfolio", NOW), bearer(&expired));
        assert_eq!(engine.decide(Some("not-a-jwt"), "/api/x", NOW), bearer("not-a-jwt"));
        assert_eq!(engine.decide(None, "/api/portfolio", NOW), GatewayDecision::pass());
    }

    #[test]
    fn unrepresentable_api_credential_is_rejected() {
        let decision = engine().decide(Some("bad\ntoken"), "/api/portfolio", NOW);
        assert!(matches!(
            decision,
            GatewayDecision::Reject { status: StatusCode::BAD_REQUEST, .. }
        ));
    }

    #[test]
    fn login_route_table() {
        let engine = engine();
        assert_eq!(engine.decide(None, "/login", NOW), GatewayDecision::pass());
        assert_eq!(
            engine.decide(Some("x.y.z"), "/login", NOW),
            redirect("/logout?msg=100301")
        );
        let expired = token("ACCOUNT", NOW);
        assert_eq!(
            engine.decide(Some(&expired), "/login", NOW),
            redirect("/logout?msg=100304")
        );
    }

    #[test]
    fn protected_route_table() {
        let engine = engine();
        let valid = token("ACCOUNT", NOW + 1);
        assert_eq!(
            engine.decide(Some(&valid), "/account/profile", NOW),
            GatewayDecision::pass()
        );

        let no_role = format!("e30.{}.s", encode(&serde_json::json!({ "exp": NOW + 60 })));
        assert_eq!(
            engine.decide(Some(&no_role), "/account", NOW),
            redirect("/logout?msg=100301")
        );
    }

    #[test]
    fn missing_landing_page_forces_logout_instead_of_blank_redirect() {
        let engine = engine();
        let orphan = token("ORPHAN", NOW + 60);
        let verdict = engine.evaluate(Some(&orphan), "/dashboard", NOW);
        assert_eq!(verdict.decision, redirect("/logout?msg=100305"));
        assert_eq!(verdict.reason, Some(DenyReason::MissingPolicyConfig));

        let ghost = token("GHOST", NOW + 60);
        assert_eq!(
            engine.decide(Some(&ghost), "/login", NOW),
            redirect("/logout?msg=100305")
        );
        assert_eq!(
            engine.decide(Some(&ghost), "/anything", NOW),
            redirect("/logout?msg=100305")
        );
    }

    #[test]
    fn every_class_and_credential_state_yields_a_decision() {
        let engine = engine();
        let credentials = [
            None,
            Some(String::new()),
            Some("garbage".to_string()),
            Some(token("ACCOUNT", NOW - 1)),
            Some(token("ACCOUNT", NOW + 60)),
            Some(token("ADMINUSER", NOW + 60)),
            Some(token("GHOST", NOW + 60)),
        ];
        let paths = [
            "/api/login",
            "/login",
            "/api/things",
            "/dashboard",
            "/account",
            "/",
            "//dashboard",
            "/api/../dashboard",
            "/account/%2e%2e/dashboard",
            "/account/..%2fdashboard",
        ];

        for credential in &credentials {
            for path in paths {
                let verdict = engine.evaluate(credential.as_deref(), path, NOW);
                if let GatewayDecision::RedirectTo(target) = &verdict.decision {
                    assert!(!target.is_empty(), "{path} -> empty redirect");
                    assert_ne!(target, path, "{path} redirects to itself");
                }
            }
        }
    }

    #[test]
    fn anonymous_dot_segments_cannot_pose_as_api_calls() {
        let verdict = engine().evaluate(None, "/api/../dashboard", NOW);
        assert_eq!(verdict.class, RouteClass::ProtectedAppRoute);
        assert_eq!(verdict.decision, redirect("/login"));
    }

    #[test]
    fn dot_segments_do_not_widen_a_role() {
        let engine = engine();
        let account = token("ACCOUNT", NOW + 3600);
        for path in [
            "/account/../dashboard",
            "/account/%2e%2e/dashboard",
            "/account/%2E%2E/dashboard",
            "/account/./../dashboard",
        ] {
            let verdict = engine.evaluate(Some(&account), path, NOW);
            assert_eq!(verdict.decision, redirect("/account"), "{path}");
            assert_eq!(verdict.reason, Some(DenyReason::InsufficientRole), "{path}");
        }
    }

    #[test]
    fn hostile_paths_decide_like_their_canonical_form() {
        let engine = engine();
        let credentials = [
            None,
            Some("garbage".to_string()),
            Some(token("ACCOUNT", NOW + 60)),
            Some(token("ADMINUSER", NOW + 60)),
            Some(token("ADMINUSER", NOW - 60)),
        ];
        let shapes = [
            ("//dashboard", "/dashboard"),
            ("/./dashboard", "/dashboard"),
            ("/api/../dashboard", "/dashboard"),
            ("/api/%2e%2e/login", "/login"),
            ("/account//../users", "/users"),
            ("/account/profile/%2e", "/account/profile/"),
            ("/login/../api/login", "/api/login"),
            ("/public/../api/x", "/api/x"),
        ];

        for credential in &credentials {
            for (hostile, canonical) in shapes {
                assert_eq!(
                    engine.evaluate(credential.as_deref(), hostile, NOW),
                    engine.evaluate(credential.as_deref(), canonical, NOW),
                    "{hostile} vs {canonical}"
                );
            }
        }
    }

    #[test]
    fn unresolvable_paths_are_rejected_for_everyone() {
        let engine = engine();
        let admin = token("ADMINUSER", NOW + 60);
        for path in [
            "/..",
            "/api/../../dashboard",
            "/account/..%2fdashboard",
            "/account/%5c..%5cdashboard",
            "/account\\..\\dashboard",
            "dashboard",
        ] {
            for credential in [None, Some(admin.as_str())] {
                let verdict = engine.evaluate(credential, path, NOW);
                assert!(
                    matches!(
                        verdict.decision,
                        GatewayDecision::Reject { status: StatusCode::BAD_REQUEST, .. }
                    ),
                    "{path}"
                );
                assert_eq!(verdict.reason, Some(DenyReason::UnsafePath));
            }
        }
    }

    #[test]
    fn login_page_never_lands_on_itself() {
        let engine = engine_with(AccessPolicy::new([RolePolicy {
            role: role("GREETER"),
            prefixes: vec!["/welcome".into()],
            default_page: Some("/login".into()),
        }]));
        let greeter = token("GREETER", NOW + 60);

        for path in ["/login", "/login/otp"] {
            let verdict = engine.evaluate(Some(&greeter), path, NOW);
            assert_eq!(verdict.decision, redirect("/logout?msg=100305"), "{path}");
            assert_eq!(verdict.reason, Some(DenyReason::MissingPolicyConfig));
        }
        assert_eq!(
            engine.decide(Some(&greeter), "/welcome", NOW),
            GatewayDecision::pass()
        );
    }

    #[test]
    fn login_prefix_stops_at_a_segment_boundary() {
        let engine = engine();
        assert_eq!(engine.decide(None, "/login/otp", NOW), GatewayDecision::pass());
        assert_eq!(engine.decide(None, "/loginx", NOW), redirect("/login"));
    }
}
