use std::sync::Arc;

use base64::{
    Engine,
    alphabet,
    engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig},
};
use hmac::{Hmac, Mac};
use serde_json::{Map, Value};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

use crate::policy::Role;

type HmacSha256 = Hmac<Sha256>;

/// Accepts base64url with or without padding. Standard-alphabet input is
/// mapped onto the url-safe alphabet before decoding.
const SEGMENT_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new()
        .with_encode_padding(false)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// No credential was presented. Expected for anonymous visitors.
    #[error("no credential presented")]
    NoCredential,
    #[error("malformed credential: {0}")]
    Malformed(&'static str),
    #[error("credential signature rejected")]
    BadSignature,
}

/// Claims carried in the middle segment of a credential.
///
/// Only `role` and `exp` are interpreted; everything else is kept in `extra`
/// for downstream consumers.
#[derive(Debug, Clone, PartialEq)]
pub struct Claims {
    pub role: Role,
    pub expires_at: i64,
    pub extra: Map<String, Value>,
}

/// Checked before any claim is trusted.
pub trait TokenVerifier: Send + Sync {
    fn name(&self) -> &'static str;

    /// `signed` is `header.payload` exactly as presented; `signature` is the
    /// third segment, if any.
    fn verify(&self, signed: &str, signature: Option<&str>) -> Result<(), DecodeError>;
}

/// Trusts decoded claims as-is. Matches the behaviour of the credential
/// issuer's existing clients, which never sign-check.
pub struct Unverified;

impl TokenVerifier for Unverified {
    fn name(&self) -> &'static str {
        "unverified"
    }

    fn verify(&self, _signed: &str, _signature: Option<&str>) -> Result<(), DecodeError> {
        Ok(())
    }
}

pub struct HmacSha256Verifier {
    secret: Vec<u8>,
}

impl HmacSha256Verifier {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    #[cfg(test)]
    pub fn sign(&self, signed: &str) -> Result<String, DecodeError> {
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).map_err(|_| DecodeError::BadSignature)?;
        mac.update(signed.as_bytes());
        Ok(SEGMENT_ENGINE.encode(mac.finalize().into_bytes()))
    }
}

impl TokenVerifier for HmacSha256Verifier {
    fn name(&self) -> &'static str {
        "hmac-sha256"
    }

    fn verify(&self, signed: &str, signature: Option<&str>) -> Result<(), DecodeError> {
        let provided = signature
            .filter(|s| !s.is_empty())
            .ok_or(DecodeError::Malformed("missing signature segment"))?;
        let provided = decode_segment(provided)?;

        let mut mac =
            HmacSha256::new_from_slice(&self.secret).map_err(|_| DecodeError::BadSignature)?;
        mac.update(signed.as_bytes());
        let expected = mac.finalize().into_bytes();

        if bool::from(expected.as_slice().ct_eq(provided.as_slice())) {
            Ok(())
        } else {
            Err(DecodeError::BadSignature)
        }
    }
}

#[derive(Clone)]
pub struct TokenCodec {
    verifier: Arc<dyn TokenVerifier>,
}

impl TokenCodec {
    pub fn new(verifier: Arc<dyn TokenVerifier>) -> Self {
        Self { verifier }
    }

    pub fn unverified() -> Self {
        Self::new(Arc::new(Unverified))
    }

    pub fn verifier_name(&self) -> &'static str {
        self.verifier.name()
    }

    pub fn decode(&self, credential: Option<&str>) -> Result<Claims, DecodeError> {
        let credential = credential
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .ok_or(DecodeError::NoCredential)?;

        let segments: Vec<&str> = credential.split('.').collect();
        if segments.len() < 2 {
            return Err(DecodeError::Malformed("expected at least two segments"));
        }

        let signed_len = segments[0].len() + 1 + segments[1].len();
        self.verifier
            .verify(&credential[..signed_len], segments.get(2).copied())?;

        let payload = decode_segment(segments[1])?;
        let value: Value = serde_json::from_slice(&payload)
            .map_err(|_| DecodeError::Malformed("claims segment is not JSON"))?;
        let Value::Object(mut fields) = value else {
            return Err(DecodeError::Malformed("claims segment is not an object"));
        };

        let role = fields
            .remove("role")
            .and_then(|v| v.as_str().and_then(Role::parse))
            .ok_or(DecodeError::Malformed("role claim missing or empty"))?;

        let expires_at = fields
            .remove("exp")
            .or_else(|| fields.remove("expiresAt"))
            .as_ref()
            .and_then(numeric_seconds)
            .ok_or(DecodeError::Malformed("exp claim missing or not a number"))?;

        Ok(Claims {
            role,
            expires_at,
            extra: fields,
        })
    }
}

/// A credential expires *at* `exp`: it is no longer valid at that instant.
pub fn is_expired(claims: &Claims, now: i64) -> bool {
    now >= claims.expires_at
}

fn decode_segment(segment: &str) -> Result<Vec<u8>, DecodeError> {
    let normalized = segment.replace('+', "-").replace('/', "_");
    SEGMENT_ENGINE
        .decode(normalized.as_bytes())
        .map_err(|_| DecodeError::Malformed("segment is not base64"))
}

fn numeric_seconds(value: &Value) -> Option<i64> {
    let n = value.as_number()?;
    n.as_i64().or_else(|| n.as_f64().map(|f| f.floor() as i64))
}

#[cfg(test)]
pub(crate) mod tests {
    use base64::Engine;
    use serde_json::json;

    use super::*;

    pub(crate) fn encode(value: &Value) -> String {
        SEGMENT_ENGINE.encode(value.to_string())
    }

    pub(crate) fn token(role: &str, exp: i64) -> String {
        format!(
            "{}.{}.sig",
            encode(&json!({ "alg": "HS256", "typ": "JWT" })),
            encode(&json!({ "role": role, "exp": exp, "sub": "u-42" }))
        )
    }

    #[test]
    fn absent_and_blank_credentials_are_distinct_from_malformed() {
        let codec = TokenCodec::unverified();
        assert_eq!(codec.decode(None), Err(DecodeError::NoCredential));
        assert_eq!(codec.decode(Some("")), Err(DecodeError::NoCredential));
        assert_eq!(codec.decode(Some("   ")), Err(DecodeError::NoCredential));
        assert!(matches!(
            codec.decode(Some("garbage")),
            Err(DecodeError::Malformed(_))
        ));
    }

    #[test]
    fn decodes_role_expiry_and_extra_fields() {
        let claims = TokenCodec::unverified()
            .decode(Some(&token("account", 1_900_000_000)))
            .unwrap();

        assert_eq!(claims.role.as_str(), "ACCOUNT");
        assert_eq!(claims.expires_at, 1_900_000_000);
        assert_eq!(claims.extra.get("sub"), Some(&json!("u-42")));
        assert!(!claims.extra.contains_key("role"));
    }

    #[test]
    fn decode_is_pure() {
        let codec = TokenCodec::unverified();
        let raw = token("PORTFOLIO", 1_800_000_000);
        assert_eq!(codec.decode(Some(&raw)), codec.decode(Some(&raw)));
    }

    #[test]
    fn accepts_padded_standard_alphabet_and_two_segments() {
        let payload = base64::engine::general_purpose::STANDARD
            .encode(json!({ "role": "WORKFLOW", "expiresAt": 1_700_000_000.7 }).to_string());
        let claims = TokenCodec::unverified()
            .decode(Some(&format!("e30.{payload}")))
            .unwrap();

        assert_eq!(claims.role.as_str(), "WORKFLOW");
        assert_eq!(claims.expires_at, 1_700_000_000);
    }

    #[test]
    fn rejects_structurally_invalid_claims() {
        let codec = TokenCodec::unverified();
        let header = encode(&json!({}));
        let cases = [
            json!({ "exp": 1 }),
            json!({ "role": "", "exp": 1 }),
            json!({ "role": 7, "exp": 1 }),
            json!({ "role": "ACCOUNT" }),
            json!({ "role": "ACCOUNT", "exp": "soon" }),
            json!(["ACCOUNT", 1]),
        ];

        for claims in cases {
            let raw = format!("{header}.{}.x", encode(&claims));
            assert!(
                matches!(codec.decode(Some(&raw)), Err(DecodeError::Malformed(_))),
                "accepted {claims}"
            );
        }

        assert!(matches!(
            codec.decode(Some("a.!!!.c")),
            Err(DecodeError::Malformed(_))
        ));
    }

    #[test]
    fn expiry_boundary_is_inclusive() {
        let claims = TokenCodec::unverified()
            .decode(Some(&token("ACCOUNT", 1_000)))
            .unwrap();

        assert!(is_expired(&claims, 1_000));
        assert!(is_expired(&claims, 1_001));
        assert!(!is_expired(&claims, 999));
    }

    #[test]
    fn hmac_verifier_accepts_only_matching_signatures() {
        let verifier = HmacSha256Verifier::new("shared-secret");
        let signed = format!(
            "{}.{}",
            encode(&json!({ "alg": "HS256" })),
            encode(&json!({ "role": "INQUIRY", "exp": 2_000_000_000 }))
        );
        let good = format!("{signed}.{}", verifier.sign(&signed).unwrap());
        let codec = TokenCodec::new(Arc::new(verifier));

        assert_eq!(codec.verifier_name(), "hmac-sha256");
        assert_eq!(codec.decode(Some(&good)).unwrap().role.as_str(), "INQUIRY");

        let forged = format!("{signed}.{}", SEGMENT_ENGINE.encode(b"not-the-mac"));
        assert_eq!(codec.decode(Some(&forged)), Err(DecodeError::BadSignature));
        assert!(matches!(
            codec.decode(Some(&signed)),
            Err(DecodeError::Malformed(_))
        ));
    }
}
