use chrono::{DateTime, Utc};
use http::{
    HeaderMap, HeaderValue,
    header::{COOKIE, SET_COOKIE},
};
use percent_encoding::{AsciiSet, CONTROLS, percent_decode_str, utf8_percent_encode};
use serde::{Deserialize, Serialize};

use crate::{
    config::SessionConfig,
    error::{GatewayError, GatewayResult},
};

/// Bytes that may not appear raw in a cookie value.
const COOKIE_VALUE: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'%')
    .add(b',')
    .add(b';')
    .add(b'\\');

/// Login attempt bookkeeping kept in its own cookie.
///
/// This is client-advisory only: a visitor who clears cookies resets the
/// counter, so it cannot be the sole defence against credential stuffing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoginAttemptRecord {
    pub attempts: u32,
    /// Written by the credential issuer's login flow, if at all. The gateway
    /// clears the whole cookie on success, so it only carries this forward.
    pub last_successful_login: Option<DateTime<Utc>>,
    pub last_failed_attempt: Option<DateTime<Utc>>,
}

impl LoginAttemptRecord {
    pub fn failed_at(mut self, now: DateTime<Utc>) -> Self {
        self.attempts = self.attempts.saturating_add(1);
        self.last_failed_attempt = Some(now);
        self
    }

    pub fn is_locked(&self, max_attempts: u32) -> bool {
        max_attempts > 0 && self.attempts >= max_attempts
    }

    /// Seconds until the cookie holding this record lapses.
    pub fn seconds_until_reset(&self, ttl_secs: u64, now: DateTime<Utc>) -> u64 {
        let Some(last) = self.last_failed_attempt else {
            return ttl_secs;
        };
        let elapsed = (now - last).num_seconds().max(0) as u64;
        ttl_secs.saturating_sub(elapsed).max(1)
    }
}

/// The only place that reads or writes cookies.
#[derive(Debug, Clone)]
pub struct SessionCookieStore {
    cfg: SessionConfig,
}

impl SessionCookieStore {
    pub fn new(cfg: SessionConfig) -> Self {
        Self { cfg }
    }

    pub fn attempts_ttl_secs(&self) -> u64 {
        self.cfg.attempts_ttl_secs
    }

    pub fn credential(&self, headers: &HeaderMap) -> Option<String> {
        read_cookie(headers, &self.cfg.auth_cookie)
    }

    /// A missing or unreadable cookie reads as the zero record.
    pub fn attempts(&self, headers: &HeaderMap) -> LoginAttemptRecord {
        let Some(raw) = read_cookie(headers, &self.cfg.attempts_cookie) else {
            return LoginAttemptRecord::default();
        };

        let parsed = percent_decode_str(&raw)
            .decode_utf8()
            .ok()
            .and_then(|json| serde_json::from_str::<LoginAttemptRecord>(&json).ok());

        parsed.unwrap_or_else(|| {
            tracing::debug!(cookie = %self.cfg.attempts_cookie, "discarding unreadable attempts cookie");
            LoginAttemptRecord::default()
        })
    }

    pub fn set_attempts(
        &self,
        response_headers: &mut HeaderMap,
        record: &LoginAttemptRecord,
        ttl_secs: u64,
    ) -> GatewayResult<()> {
        let json = serde_json::to_string(record)
            .map_err(|e| GatewayError::Internal(format!("attempts cookie encode failed: {e}")))?;
        let value = utf8_percent_encode(&json, COOKIE_VALUE).to_string();
        self.write_cookie(
            response_headers,
            &self.cfg.attempts_cookie,
            &value,
            ttl_secs,
            false,
        )
    }

    pub fn clear_attempts(&self, response_headers: &mut HeaderMap) -> GatewayResult<()> {
        self.set_attempts(response_headers, &LoginAttemptRecord::default(), 0)
    }

    pub fn clear_credential(&self, response_headers: &mut HeaderMap) -> GatewayResult<()> {
        self.write_cookie(response_headers, &self.cfg.auth_cookie, "", 0, true)
    }

    fn write_cookie(
        &self,
        response_headers: &mut HeaderMap,
        name: &str,
        value: &str,
        ttl_secs: u64,
        http_only: bool,
    ) -> GatewayResult<()> {
        let mut cookie = format!("{name}={value}; Path=/; Max-Age={ttl_secs}; SameSite=Lax");
        if http_only {
            cookie.push_str("; HttpOnly");
        }
        if self.cfg.secure {
            cookie.push_str("; Secure");
        }

        let header = HeaderValue::from_str(&cookie)
            .map_err(|e| GatewayError::Internal(format!("invalid cookie {name}: {e}")))?;
        response_headers.append(SET_COOKIE, header);
        Ok(())
    }
}

fn read_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|line| line.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| key.trim() == name)
        .map(|(_, value)| value.trim().trim_matches('"').to_string())
        .filter(|value| !value.is_empty())
}
