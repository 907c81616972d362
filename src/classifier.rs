use std::fmt;

use crate::policy::path_matches;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteClass {
    PublicRoute,
    LoginRoute,
    ApiRoute,
    ProtectedAppRoute,
}

impl RouteClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PublicRoute => "public",
            Self::LoginRoute => "login",
            Self::ApiRoute => "api",
            Self::ProtectedAppRoute => "protected",
        }
    }
}

impl fmt::Display for RouteClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct RequestClassifier {
    public_prefixes: Vec<String>,
    login_path: String,
    api_prefix: String,
}

impl RequestClassifier {
    pub fn new(public_prefixes: Vec<String>, login_path: String, api_prefix: String) -> Self {
        Self {
            public_prefixes,
            login_path,
            api_prefix,
        }
    }

    /// Anything not explicitly public, login or API is protected.
    pub fn classify(&self, path: &str) -> RouteClass {
        if self
            .public_prefixes
            .iter()
            .any(|prefix| path_matches(prefix, path))
        {
            RouteClass::PublicRoute
        } else if path_matches(&self.login_path, path) {
            RouteClass::LoginRoute
        } else if path.starts_with(self.api_prefix.as_str()) {
            RouteClass::ApiRoute
        } else {
            RouteClass::ProtectedAppRoute
        }
    }
}
