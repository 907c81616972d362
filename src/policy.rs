use std::{
    collections::{BTreeSet, HashMap},
    fmt,
};

use percent_encoding::percent_decode_str;
use thiserror::Error;

/// Role identifier. Case-insensitive; stored uppercased so policy lookups
/// never depend on how the issuer spelled it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Role(String);

impl Role {
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return None;
        }
        Some(Self(trimmed.to_ascii_uppercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("no default page configured for role {0}")]
pub struct NotConfigured(pub Role);

/// One row of the policy table as it comes out of configuration.
#[derive(Debug, Clone)]
pub struct RolePolicy {
    pub role: Role,
    pub prefixes: Vec<String>,
    pub default_page: Option<String>,
}

/// Role → allowed path prefixes and role → landing page. Built once and
/// shared read-only.
#[derive(Debug, Clone, Default)]
pub struct AccessPolicy {
    allowed: HashMap<Role, BTreeSet<String>>,
    default_pages: HashMap<Role, String>,
}

impl AccessPolicy {
    pub fn new(rows: impl IntoIterator<Item = RolePolicy>) -> Self {
        let mut policy = Self::default();
        for row in rows {
            policy
                .allowed
                .entry(row.role.clone())
                .or_default()
                .extend(row.prefixes);
            if let Some(page) = row.default_page.filter(|p| !p.trim().is_empty()) {
                policy.default_pages.insert(row.role, page);
            }
        }
        policy
    }

    /// Empty for roles the table does not know.
    pub fn allowed_prefixes(&self, role: &Role) -> BTreeSet<String> {
        self.allowed.get(role).cloned().unwrap_or_default()
    }

    pub fn is_allowed(&self, role: &Role, path: &str) -> bool {
        self.allowed
            .get(role)
            .is_some_and(|prefixes| prefixes.iter().any(|p| path_matches(p, path)))
    }

    pub fn default_page(&self, role: &Role) -> Result<&str, NotConfigured> {
        self.default_pages
            .get(role)
            .map(String::as_str)
            .ok_or_else(|| NotConfigured(role.clone()))
    }

    /// Roles that grant paths but have nowhere to land.
    pub fn roles_without_default_page(&self) -> Vec<&Role> {
        let mut missing = self
            .allowed
            .keys()
            .filter(|role| !self.default_pages.contains_key(*role))
            .collect::<Vec<_>>();
        missing.sort();
        missing
    }

    pub fn role_count(&self) -> usize {
        self.allowed.len()
    }
}

/// Segment-boundary prefix match: `/account` covers `/account` and
/// `/account/...` but not `/accountx`. A prefix ending in `/` matches as a
/// plain string prefix.
pub fn path_matches(prefix: &str, path: &str) -> bool {
    if prefix.ends_with('/') {
        return path.starts_with(prefix);
    }
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum UnsafePath {
    #[error("request path must be absolute")]
    Relative,
    #[error("request path encodes a path separator")]
    EncodedSeparator,
    #[error("request path climbs above the root")]
    AboveRoot,
}

/// Resolves `.` and `..` segments (percent-encoded dots included) and drops
/// empty segments. Classification, policy checks and the forwarded URL all use
/// this form, so the upstream never sees a path the policy did not.
///
/// Backslashes and encoded `/` or `\` are refused outright: upstreams disagree
/// on whether they separate segments.
pub fn canonical_path(raw: &str) -> Result<String, UnsafePath> {
    let rest = raw.strip_prefix('/').ok_or(UnsafePath::Relative)?;
    if rest.contains('\\') {
        return Err(UnsafePath::EncodedSeparator);
    }

    let mut segments: Vec<&str> = Vec::new();
    let mut trailing_slash = false;
    for segment in rest.split('/') {
        let decoded = percent_decode_str(segment).decode_utf8_lossy();
        if decoded.contains(['/', '\\']) {
            return Err(UnsafePath::EncodedSeparator);
        }
        trailing_slash = true;
        match decoded.as_ref() {
            "" | "." => {}
            ".." => {
                segments.pop().ok_or(UnsafePath::AboveRoot)?;
            }
            _ => {
                segments.push(segment);
                trailing_slash = false;
            }
        }
    }

    let mut path = String::with_capacity(raw.len());
    for segment in &segments {
        path.push('/');
        path.push_str(segment);
    }
    if trailing_slash || segments.is_empty() {
        path.push('/');
    }
    Ok(path)
}
