//! Restore unlock tokens.
//!
//! A token is `base64url(payload) "." base64url(HMAC-SHA256(payload))`
//! where the payload is a small JSON document carrying the issue and expiry
//! times. Holding a current token is the second factor, after operator
//! authorization, for a destructive restore.

use crate::config::UnlockConfig;
use crate::utils::errors::{Result, TransferError};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, TimeZone, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fmt;

type HmacSha256 = Hmac<Sha256>;

/// Clock skew tolerated by [`verify`]
pub const DEFAULT_MAX_CLOCK_SKEW_SECS: i64 = 300;

/// Name of the cookie that carries the token
pub const UNLOCK_COOKIE: &str = "restore_unlock";

/// Server-held signing key.
#[derive(Clone)]
pub struct UnlockSecret(Vec<u8>);

impl UnlockSecret {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Result<Self> {
        let bytes = bytes.into();
        if bytes.len() < 16 {
            return Err(TransferError::Config(
                "restore unlock secret must be at least 16 bytes".into(),
            ));
        }
        Ok(Self(bytes))
    }

    /// Random per-process secret; tokens do not survive a restart.
    pub fn generate() -> Self {
        let mut bytes = Vec::with_capacity(32);
        bytes.extend_from_slice(uuid::Uuid::new_v4().as_bytes());
        bytes.extend_from_slice(uuid::Uuid::new_v4().as_bytes());
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for UnlockSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("UnlockSecret(<redacted>)")
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct UnlockPayload {
    iat: i64,
    exp: i64,
    nonce: String,
}

/// Proof that a current unlock token was presented.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnlockClaim {
    issued_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl UnlockClaim {
    pub fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }
}

/// A freshly signed token and when it stops working.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// Sign a new token valid for `ttl` from `now`.
pub fn issue(secret: &[u8], now: DateTime<Utc>, ttl: Duration) -> Result<IssuedToken> {
    let expires_at = now + ttl;
    let payload = UnlockPayload {
        iat: now.timestamp(),
        exp: expires_at.timestamp(),
        nonce: uuid::Uuid::new_v4().to_string(),
    };
    let encoded = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&payload)?);

    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|e| TransferError::Config(format!("unusable unlock secret: {}", e)))?;
    mac.update(encoded.as_bytes());
    let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());

    Ok(IssuedToken {
        token: format!("{}.{}", encoded, signature),
        expires_at,
    })
}

/// Verify `token` against `secret` at time `now`.
///
/// Missing pieces, bad encodings, a wrong signature and expiry all yield
/// `None`: an absent claim is the normal locked state.
pub fn verify(secret: &[u8], token: &str, now: DateTime<Utc>) -> Option<UnlockClaim> {
    verify_with_skew(secret, token, now, DEFAULT_MAX_CLOCK_SKEW_SECS)
}

fn verify_with_skew(
    secret: &[u8],
    token: &str,
    now: DateTime<Utc>,
    max_skew_secs: i64,
) -> Option<UnlockClaim> {
    let (encoded, signature) = token.trim().split_once('.')?;
    let signature = URL_SAFE_NO_PAD.decode(signature).ok()?;

    let mut mac = HmacSha256::new_from_slice(secret).ok()?;
    mac.update(encoded.as_bytes());
    if mac.verify_slice(&signature).is_err() {
        tracing::debug!("[Unlock] Token rejected: invalid signature");
        return None;
    }

    let payload: UnlockPayload = serde_json::from_slice(&URL_SAFE_NO_PAD.decode(encoded).ok()?).ok()?;
    let now_ts = now.timestamp();
    if payload.iat - now_ts > max_skew_secs {
        tracing::debug!("[Unlock] Token rejected: issued in the future");
        return None;
    }
    if now_ts >= payload.exp {
        tracing::debug!(expired_secs = now_ts - payload.exp, "[Unlock] Token rejected: expired");
        return None;
    }

    Some(UnlockClaim {
        issued_at: Utc.timestamp_opt(payload.iat, 0).single()?,
        expires_at: Utc.timestamp_opt(payload.exp, 0).single()?,
    })
}

/// Issues and checks tokens with the configured secret and lifetime.
#[derive(Debug, Clone)]
pub struct UnlockVerifier {
    secret: UnlockSecret,
    config: UnlockConfig,
}

impl UnlockVerifier {
    pub fn new(secret: UnlockSecret, config: UnlockConfig) -> Self {
        Self { secret, config }
    }

    pub fn ttl(&self) -> Duration {
        Duration::seconds(self.config.ttl_secs)
    }

    pub fn issue(&self, now: DateTime<Utc>) -> Result<IssuedToken> {
        issue(self.secret.as_bytes(), now, self.ttl())
    }

    pub fn verify(&self, token: &str, now: DateTime<Utc>) -> Option<UnlockClaim> {
        verify_with_skew(
            self.secret.as_bytes(),
            token,
            now,
            self.config.max_clock_skew_secs,
        )
    }

    /// Like [`UnlockVerifier::verify`] for callers that must refuse to go on.
    pub fn require(&self, token: Option<&str>, now: DateTime<Utc>) -> Result<UnlockClaim> {
        token
            .and_then(|t| self.verify(t, now))
            .ok_or(TransferError::TokenInvalidOrExpired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const S1: &[u8] = b"first-secret-0123456789";
    const S2: &[u8] = b"second-secret-0123456789";

    #[test]
    fn test_issued_token_verifies() -> Result<()> {
        let now = Utc::now();
        let issued = issue(S1, now, Duration::minutes(10))?;

        let claim = verify(S1, &issued.token, now + Duration::minutes(1)).expect("valid claim");
        assert_eq!(claim.expires_at().timestamp(), issued.expires_at.timestamp());
        assert!(claim.issued_at() <= claim.expires_at());
        Ok(())
    }

    #[test]
    fn test_other_secret_fails() -> Result<()> {
        let now = Utc::now();
        let issued = issue(S1, now, Duration::minutes(10))?;
        assert!(verify(S2, &issued.token, now).is_none());
        Ok(())
    }

    #[test]
    fn test_expired_token_fails() -> Result<()> {
        let now = Utc::now();
        let issued = issue(S1, now, Duration::minutes(10))?;
        assert!(verify(S1, &issued.token, now + Duration::minutes(10)).is_none());
        assert!(verify(S1, &issued.token, now + Duration::hours(1)).is_none());
        Ok(())
    }

    #[test]
    fn test_future_issue_time_fails() -> Result<()> {
        let now = Utc::now();
        let issued = issue(S1, now + Duration::hours(2), Duration::minutes(10))?;
        assert!(verify(S1, &issued.token, now).is_none());
        Ok(())
    }

    #[test]
    fn test_garbage_tokens_are_locked_not_errors() {
        let now = Utc::now();
        for token in ["", ".", "abc", "abc.def", "!!!.???", "a.b.c"] {
            assert!(verify(S1, token, now).is_none(), "{token:?}");
        }
    }

    #[test]
    fn test_tampered_payload_fails() -> Result<()> {
        let now = Utc::now();
        let issued = issue(S1, now, Duration::minutes(10))?;
        let (_, signature) = issued.token.split_once('.').unwrap();

        let forged_payload = URL_SAFE_NO_PAD.encode(
            serde_json::to_vec(&UnlockPayload {
                iat: now.timestamp(),
                exp: now.timestamp() + 86_400,
                nonce: "forged".into(),
            })
            .unwrap(),
        );
        let forged = format!("{}.{}", forged_payload, signature);
        assert!(verify(S1, &forged, now).is_none());
        Ok(())
    }

    #[test]
    fn test_require_maps_to_error() -> Result<()> {
        let verifier = UnlockVerifier::new(UnlockSecret::new(S1)?, UnlockConfig::default());
        let now = Utc::now();

        assert!(matches!(
            verifier.require(None, now),
            Err(TransferError::TokenInvalidOrExpired)
        ));
        let issued = verifier.issue(now)?;
        assert!(verifier.require(Some(&issued.token), now).is_ok());
        Ok(())
    }

    #[test]
    fn test_short_secret_rejected() {
        assert!(UnlockSecret::new(b"short".to_vec()).is_err());
        assert_eq!(UnlockSecret::generate().as_bytes().len(), 32);
    }
}
