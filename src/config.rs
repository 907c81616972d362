use anyhow::{Context, Result, anyhow, bail};
use std::{
    env,
    fmt,
    net::SocketAddr,
};

use crate::{
    decision::LogoutCodes,
    policy::{Role, RolePolicy, canonical_path, path_matches},
};

const DEFAULT_ACCESS_POLICY: &str = "ADMINUSER=/dashboard|/users|/roles|/settings@/dashboard,\
     ACCOUNT=/account@/account,\
     PORTFOLIO=/portfolio@/portfolio,\
     WORKFLOW=/workflow@/workflow,\
     INQUIRY=/inquiry@/inquiry";

const DEFAULT_PUBLIC_PREFIXES: &str =
    "/api/login,/api/auth/refresh,/api/register,/api/password,/logout,/health";

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bind_addr: SocketAddr,
    pub max_body_bytes: usize,
    pub auth: AuthConfig,
    pub session: SessionConfig,
    pub login_attempts: LoginAttemptsConfig,
    pub upstreams: Vec<UpstreamConfig>,
    pub routes: Vec<RouteConfig>,
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub public_prefixes: Vec<String>,
    pub login_path: String,
    pub logout_path: String,
    pub api_prefix: String,
    pub logout_codes: LogoutCodes,
    pub verification: TokenVerificationConfig,
    pub policy: Vec<RolePolicy>,
}

#[derive(Clone)]
pub enum TokenVerificationConfig {
    None,
    HmacSha256 { secret: String },
}

impl fmt::Debug for TokenVerificationConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::HmacSha256 { .. } => f.write_str("HmacSha256 { secret: <redacted> }"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub auth_cookie: String,
    pub attempts_cookie: String,
    pub attempts_ttl_secs: u64,
    pub secure: bool,
}

#[derive(Debug, Clone)]
pub struct LoginAttemptsConfig {
    pub exchange_path: String,
    /// Zero disables the lockout check; attempts are still counted.
    pub max_attempts: u32,
}

#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub name: String,
    pub base_url: String,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone)]
pub struct RouteConfig {
    pub path_prefix: String,
    pub upstream: String,
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self> {
        let bind_addr = env::var("BIND_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:8080".to_string())
            .parse::<SocketAddr>()
            .context("invalid BIND_ADDR")?;

        let verification = match env::var("TOKEN_VERIFICATION")
            .unwrap_or_else(|_| "none".to_string())
            .to_ascii_lowercase()
            .as_str()
        {
            "none" | "unverified" => TokenVerificationConfig::None,
            "hmac-sha256" | "hs256" => {
                let secret = env::var("TOKEN_SECRET")
                    .ok()
                    .filter(|s| !s.is_empty())
                    .ok_or_else(|| anyhow!("TOKEN_SECRET is required for hmac-sha256"))?;
                TokenVerificationConfig::HmacSha256 { secret }
            }
            other => return Err(anyhow!("unsupported TOKEN_VERIFICATION: {other}")),
        };

        let defaults = LogoutCodes::default();
        let auth = AuthConfig {
            public_prefixes: parse_csv("PUBLIC_PREFIXES", DEFAULT_PUBLIC_PREFIXES),
            login_path: path_env("LOGIN_PATH", "/login")?,
            logout_path: path_env("LOGOUT_PATH", "/logout")?,
            api_prefix: path_env("API_PREFIX", "/api/")?,
            logout_codes: LogoutCodes {
                expired: code_env("LOGOUT_MSG_EXPIRED", &defaults.expired)?,
                malformed: code_env("LOGOUT_MSG_INVALID", &defaults.malformed)?,
                misconfigured: code_env("LOGOUT_MSG_MISCONFIGURED", &defaults.misconfigured)?,
            },
            verification,
            policy: parse_policy(
                &env::var("ACCESS_POLICY").unwrap_or_else(|_| DEFAULT_ACCESS_POLICY.into()),
            )?,
        };

        check_landing_pages(&auth.policy, &auth.login_path)?;

        let session = SessionConfig {
            auth_cookie: env::var("AUTH_COOKIE").unwrap_or_else(|_| "auth_token".to_string()),
            attempts_cookie: env::var("ATTEMPTS_COOKIE")
                .unwrap_or_else(|_| "login_attempts".to_string()),
            attempts_ttl_secs: parse_env("ATTEMPTS_TTL_SECONDS", 1_800u64),
            secure: parse_env("COOKIE_SECURE", true),
        };

        let login_attempts = LoginAttemptsConfig {
            exchange_path: path_env("LOGIN_EXCHANGE_PATH", "/api/login")?,
            max_attempts: parse_env("LOGIN_MAX_ATTEMPTS", 5u32),
        };

        let upstreams = parse_upstreams(&env::var("UPSTREAMS").unwrap_or_else(|_| {
            "app=http://127.0.0.1:3000,api=http://127.0.0.1:4000".into()
        }))?;

        let routes = parse_routes(&env::var("ROUTES").unwrap_or_else(|_| "/=app,/api=api".into()))?;
        for route in &routes {
            if !upstreams.iter().any(|u| u.name == route.upstream) {
                bail!(
                    "route {} references unknown upstream {}",
                    route.path_prefix,
                    route.upstream
                );
            }
        }

        Ok(Self {
            bind_addr,
            max_body_bytes: parse_env("MAX_BODY_BYTES", 1_048_576usize),
            auth,
            session,
            login_attempts,
            upstreams,
            routes,
        })
    }
}

/// `ROLE=/prefix|/prefix[@/default],...`
fn parse_policy(raw: &str) -> Result<Vec<RolePolicy>> {
    let mut out = Vec::new();
    for chunk in raw.split(',').filter(|c| !c.trim().is_empty()) {
        let (role, rhs) = chunk
            .split_once('=')
            .ok_or_else(|| anyhow!("invalid policy entry: {chunk}"))?;
        let role = Role::parse(role).ok_or_else(|| anyhow!("policy entry has no role: {chunk}"))?;

        let (prefixes, default_page) = match rhs.split_once('@') {
            Some((prefixes, page)) => (prefixes, Some(page.trim())),
            None => (rhs, None),
        };

        let prefixes = prefixes
            .split('|')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|p| validate_path(p).map(|_| p.to_string()))
            .collect::<Result<Vec<_>>>()?;
        if prefixes.is_empty() {
            return Err(anyhow!("role {role} has no allowed prefixes"));
        }

        let default_page = default_page
            .filter(|p| !p.is_empty())
            .map(|p| validate_path(p).map(|_| p.to_string()))
            .transpose()?;

        out.push(RolePolicy {
            role,
            prefixes,
            default_page,
        });
    }

    if out.is_empty() {
        return Err(anyhow!("access policy is empty"));
    }
    Ok(out)
}

/// `name=url[@timeout_ms],...`
fn parse_upstreams(raw: &str) -> Result<Vec<UpstreamConfig>> {
    let mut out = Vec::new();
    for chunk in raw.split(',').filter(|c| !c.trim().is_empty()) {
        let mut parts = chunk.splitn(2, '=');
        let name = parts
            .next()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| anyhow!("invalid upstream entry: {chunk}"))?
            .to_string();
        let rhs = parts
            .next()
            .map(str::trim)
            .ok_or_else(|| anyhow!("invalid upstream entry: {chunk}"))?;

        let (url, timeout) = match rhs.split_once('@') {
            Some((url, timeout)) => (url, Some(timeout)),
            None => (rhs, None),
        };
        let base_url = Some(url.trim().trim_end_matches('/').to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| anyhow!("invalid upstream URL for {name}"))?;
        let timeout_ms = timeout
            .map(|s| s.trim().parse::<u64>().context("invalid upstream timeout"))
            .transpose()?
            .unwrap_or(10_000)
            .max(100);

        out.push(UpstreamConfig {
            name,
            base_url,
            timeout_ms,
        });
    }

    if out.is_empty() {
        return Err(anyhow!("no upstreams configured"));
    }
    Ok(out)
}

/// `/prefix=upstream,...`
fn parse_routes(raw: &str) -> Result<Vec<RouteConfig>> {
    let mut out = Vec::new();
    for chunk in raw.split(',').filter(|c| !c.trim().is_empty()) {
        let (path_prefix, upstream) = chunk
            .split_once('=')
            .map(|(p, u)| (p.trim(), u.trim()))
            .filter(|(p, u)| p.starts_with('/') && !u.is_empty())
            .ok_or_else(|| anyhow!("invalid route entry: {chunk}"))?;

        out.push(RouteConfig {
            path_prefix: path_prefix.to_string(),
            upstream: upstream.to_string(),
        });
    }

    if out.is_empty() {
        return Err(anyhow!("no routes configured"));
    }
    Ok(out)
}

/// Paths end up in `Location` headers, so they must be absolute and
/// header-safe. Requests are matched in canonical form, so configured paths
/// must already be canonical.
fn validate_path(path: &str) -> Result<()> {
    if !path.starts_with('/') {
        bail!("path must start with '/': {path}");
    }
    if !path.bytes().all(|b| b.is_ascii_graphic()) {
        bail!("path contains characters not allowed in a header: {path}");
    }
    match canonical_path(path) {
        Ok(canonical) if canonical == path => Ok(()),
        _ => bail!("path is not in canonical form: {path}"),
    }
}

/// A role landing on the login page would be bounced straight back.
fn check_landing_pages(policy: &[RolePolicy], login_path: &str) -> Result<()> {
    for row in policy {
        if let Some(page) = &row.default_page
            && path_matches(login_path, page)
        {
            bail!("default page {page} of role {} is under the login path", row.role);
        }
    }
    Ok(())
}

fn path_env(key: &str, default: &str) -> Result<String> {
    let value = env::var(key).unwrap_or_else(|_| default.to_string());
    validate_path(&value).with_context(|| format!("invalid {key}"))?;
    Ok(value)
}

fn code_env(key: &str, default: &str) -> Result<String> {
    let value = env::var(key).unwrap_or_else(|_| default.to_string());
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_alphanumeric()) {
        bail!("{key} must be alphanumeric");
    }
    Ok(value)
}

fn parse_csv(key: &str, default: &str) -> Vec<String> {
    env::var(key)
        .unwrap_or_else(|_| default.to_string())
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect()
}

fn parse_env<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr,
{
    env::var(key)
        .ok()
        .and_then(|s| s.parse::<T>().ok())
        .unwrap_or(default)
}
