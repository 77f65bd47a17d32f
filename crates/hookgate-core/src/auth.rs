//! Inbound request authentication.
//!
//! Fails closed: with no mode or no secret configured, every request is
//! rejected with `auth_not_configured`. HMAC signatures are verified over
//! the raw body bytes exactly as received, before any JSON parsing.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use subtle::ConstantTimeEq;

use crate::error::{GateError, Result};
use crate::types::{AuthMode, Lane};

type HmacSha256 = Hmac<Sha256>;

pub const AUTHORIZATION_HEADER: &str = "authorization";
pub const SIGNATURE_HEADER: &str = "x-hookgate-signature";
pub const TIMESTAMP_HEADER: &str = "x-hookgate-timestamp";
pub const NONCE_HEADER: &str = "x-hookgate-nonce";

// ---------------------------------------------------------------------------
// Credential
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayPolicy {
    #[serde(default)]
    pub required: bool,
    #[serde(default = "default_skew")]
    pub skew_seconds: i64,
    #[serde(default = "default_nonce_ttl")]
    pub nonce_ttl_seconds: i64,
}

fn default_skew() -> i64 {
    300
}

fn default_nonce_ttl() -> i64 {
    600
}

impl Default for ReplayPolicy {
    fn default() -> Self {
        Self {
            required: false,
            skew_seconds: default_skew(),
            nonce_ttl_seconds: default_nonce_ttl(),
        }
    }
}

/// Auth mode plus resolved secret material. Loaded once from configuration.
#[derive(Clone, Default)]
pub struct Credential {
    pub mode: Option<AuthMode>,
    secret: Option<String>,
    pub replay: ReplayPolicy,
}

impl Credential {
    pub fn new(mode: Option<AuthMode>, secret: Option<String>, replay: ReplayPolicy) -> Self {
        Self {
            mode,
            secret: secret.filter(|s| !s.is_empty()),
            replay,
        }
    }

    pub fn is_configured(&self) -> bool {
        self.mode.is_some() && self.secret.is_some()
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("mode", &self.mode)
            .field("secret", &self.secret.as_ref().map(|_| "<redacted>"))
            .field("replay", &self.replay)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// One inbound request as received. Never persisted.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub lane: Lane,
    headers: HashMap<String, String>,
    pub body: Bytes,
    /// Mapping profile requested by the caller, if any.
    pub mapping: Option<String>,
}

impl Envelope {
    pub fn new(lane: Lane, body: impl Into<Bytes>) -> Self {
        Self {
            lane,
            headers: HashMap::new(),
            body: body.into(),
            mapping: None,
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.insert_header(name, value);
        self
    }

    pub fn with_mapping(mut self, mapping: Option<String>) -> Self {
        self.mapping = mapping;
        self
    }

    pub fn insert_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}

// ---------------------------------------------------------------------------
// Nonce cache
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Seen {
    expiry: HashMap<String, i64>,
    order: VecDeque<(i64, String)>,
}

/// Live nonces held before new ones are refused.
pub const DEFAULT_NONCE_CAPACITY: usize = 100_000;

/// Short-TTL set of nonces already accepted. Shared across config reloads.
pub struct NonceCache {
    seen: Mutex<Seen>,
    capacity: usize,
}

impl Default for NonceCache {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_NONCE_CAPACITY)
    }
}

impl NonceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            seen: Mutex::new(Seen::default()),
            capacity,
        }
    }

    /// Record `nonce` until `now + ttl`. Returns false when it is already
    /// held and not yet expired. A full cache refuses every new nonce with
    /// `ReplayDetected` until entries expire.
    pub fn check_and_insert(&self, nonce: &str, now: i64, ttl: i64) -> Result<bool> {
        let mut seen = self
            .seen
            .lock()
            .map_err(|_| GateError::Internal("nonce cache lock poisoned".into()))?;

        while let Some((exp, _)) = seen.order.front() {
            if *exp > now {
                break;
            }
            if let Some((exp, key)) = seen.order.pop_front() {
                if seen.expiry.get(&key) == Some(&exp) {
                    seen.expiry.remove(&key);
                }
            }
        }

        if let Some(exp) = seen.expiry.get(nonce) {
            if *exp > now {
                return Ok(false);
            }
        }
        if seen.expiry.len() >= self.capacity {
            tracing::warn!(capacity = self.capacity, "nonce cache full, refusing new nonces");
            return Err(GateError::ReplayDetected("nonce cache is full".into()));
        }
        let exp = now + ttl;
        seen.expiry.insert(nonce.to_string(), exp);
        seen.order.push_back((exp, nonce.to_string()));
        Ok(true)
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.seen.lock().map(|s| s.expiry.len()).unwrap_or(0)
    }

    #[cfg(test)]
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ---------------------------------------------------------------------------
// Authenticator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authenticated {
    /// The mechanism that actually matched (`bearer` or `hmac`).
    pub method: AuthMode,
    pub nonce: Option<String>,
}

pub struct Authenticator {
    credential: Credential,
    nonces: std::sync::Arc<NonceCache>,
}

impl Authenticator {
    pub fn new(credential: Credential, nonces: std::sync::Arc<NonceCache>) -> Self {
        Self { credential, nonces }
    }

    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    pub fn authenticate(&self, env: &Envelope, now: DateTime<Utc>) -> Result<Authenticated> {
        let (mode, secret) = match (self.credential.mode, self.credential.secret.as_deref()) {
            (Some(mode), Some(secret)) => (mode, secret),
            _ => return Err(GateError::AuthNotConfigured),
        };

        let method = match mode {
            AuthMode::Bearer => {
                check_bearer(env, secret)?;
                AuthMode::Bearer
            }
            AuthMode::Hmac => {
                check_hmac(env, secret)?;
                AuthMode::Hmac
            }
            AuthMode::BearerOrHmac => {
                if env.header(AUTHORIZATION_HEADER).is_some() && check_bearer(env, secret).is_ok() {
                    AuthMode::Bearer
                } else if env.header(SIGNATURE_HEADER).is_some() {
                    check_hmac(env, secret)?;
                    AuthMode::Hmac
                } else if env.header(AUTHORIZATION_HEADER).is_some() {
                    return Err(GateError::Unauthorized("bearer token mismatch".into()));
                } else {
                    return Err(GateError::Unauthorized("missing credentials".into()));
                }
            }
        };

        let nonce = if self.credential.replay.required {
            Some(self.check_replay(env, now)?)
        } else {
            None
        };

        Ok(Authenticated { method, nonce })
    }

    fn check_replay(&self, env: &Envelope, now: DateTime<Utc>) -> Result<String> {
        let policy = &self.credential.replay;
        let ts = env
            .header(TIMESTAMP_HEADER)
            .ok_or_else(|| GateError::ReplayDetected("missing timestamp header".into()))?;
        let nonce = env
            .header(NONCE_HEADER)
            .filter(|n| !n.is_empty())
            .ok_or_else(|| GateError::ReplayDetected("missing nonce header".into()))?;
        let ts: i64 = ts
            .trim()
            .parse()
            .map_err(|_| GateError::ReplayDetected("malformed timestamp".into()))?;

        let now = now.timestamp();
        if (now - ts).abs() > policy.skew_seconds {
            return Err(GateError::ReplayDetected(
                "timestamp outside the allowed skew".into(),
            ));
        }
        if !self
            .nonces
            .check_and_insert(nonce, now, policy.nonce_ttl_seconds)?
        {
            return Err(GateError::ReplayDetected("nonce already used".into()));
        }
        Ok(nonce.to_string())
    }
}

/// The credential of an `Authorization: Bearer <token>` value. The scheme
/// name is case-insensitive.
pub fn bearer_token(header: &str) -> Option<&str> {
    let (scheme, token) = header.trim_start().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

fn check_bearer(env: &Envelope, secret: &str) -> Result<()> {
    let header = env
        .header(AUTHORIZATION_HEADER)
        .ok_or_else(|| GateError::Unauthorized("missing bearer token".into()))?;
    let token = bearer_token(header)
        .ok_or_else(|| GateError::Unauthorized("authorization is not a bearer token".into()))?;
    if bool::from(token.as_bytes().ct_eq(secret.as_bytes())) {
        Ok(())
    } else {
        Err(GateError::Unauthorized("bearer token mismatch".into()))
    }
}

fn check_hmac(env: &Envelope, secret: &str) -> Result<()> {
    let header = env
        .header(SIGNATURE_HEADER)
        .ok_or_else(|| GateError::Unauthorized("missing signature".into()))?;
    let hex_digest = header.trim();
    let hex_digest = hex_digest.strip_prefix("sha256=").unwrap_or(hex_digest);
    let presented = hex::decode(hex_digest)
        .map_err(|_| GateError::Unauthorized("malformed signature".into()))?;

    let expected = sign(secret.as_bytes(), &env.body)?;
    if bool::from(expected.as_slice().ct_eq(presented.as_slice())) {
        Ok(())
    } else {
        Err(GateError::Unauthorized("signature mismatch".into()))
    }
}

/// HMAC-SHA256 of `body` under `secret`.
pub fn sign(secret: &[u8], body: &[u8]) -> Result<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|e| GateError::Internal(format!("hmac key rejected: {e}")))?;
    mac.update(body);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// `sha256=<hex>` header value for `body`, as a sender would produce it.
pub fn signature_header(secret: &[u8], body: &[u8]) -> Result<String> {
    Ok(format!("sha256={}", hex::encode(sign(secret, body)?)))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const SECRET: &str = "s3cr3t-value";
    const BODY: &[u8] = br#"{"template_id":"portrait_v1","profile_id":"SDXL-v1"}"#;

    fn auth(mode: Option<AuthMode>, replay: ReplayPolicy) -> Authenticator {
        Authenticator::new(
            Credential::new(mode, Some(SECRET.into()), replay),
            Arc::new(NonceCache::new()),
        )
    }

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn signed(body: &[u8]) -> Envelope {
        Envelope::new(Lane::Webhook, body.to_vec()).with_header(
            "X-Hookgate-Signature",
            signature_header(SECRET.as_bytes(), body).unwrap(),
        )
    }

    #[test]
    fn no_mode_fails_closed() {
        let a = auth(None, ReplayPolicy::default());
        let env = Envelope::new(Lane::Webhook, BODY)
            .with_header("authorization", format!("Bearer {SECRET}"));
        assert!(matches!(
            a.authenticate(&env, now()),
            Err(GateError::AuthNotConfigured)
        ));
    }

    #[test]
    fn empty_secret_fails_closed() {
        let a = Authenticator::new(
            Credential::new(Some(AuthMode::Bearer), Some(String::new()), ReplayPolicy::default()),
            Arc::new(NonceCache::new()),
        );
        let env = Envelope::new(Lane::Webhook, BODY).with_header("authorization", "Bearer ");
        assert!(matches!(
            a.authenticate(&env, now()),
            Err(GateError::AuthNotConfigured)
        ));
    }

    #[test]
    fn bearer_accepts_matching_token_only() {
        let a = auth(Some(AuthMode::Bearer), ReplayPolicy::default());
        let good = Envelope::new(Lane::Webhook, BODY)
            .with_header("Authorization", format!("Bearer {SECRET}"));
        assert_eq!(a.authenticate(&good, now()).unwrap().method, AuthMode::Bearer);

        let bad = Envelope::new(Lane::Webhook, BODY).with_header("authorization", "Bearer nope");
        assert!(matches!(
            a.authenticate(&bad, now()),
            Err(GateError::Unauthorized(_))
        ));

        let missing = Envelope::new(Lane::Webhook, BODY);
        assert!(matches!(
            a.authenticate(&missing, now()),
            Err(GateError::Unauthorized(_))
        ));
    }

    #[test]
    fn hmac_accepts_prefixed_and_bare_hex() {
        let a = auth(Some(AuthMode::Hmac), ReplayPolicy::default());
        assert!(a.authenticate(&signed(BODY), now()).is_ok());

        let bare = hex::encode(sign(SECRET.as_bytes(), BODY).unwrap());
        let env = Envelope::new(Lane::Webhook, BODY).with_header(SIGNATURE_HEADER, bare);
        assert!(a.authenticate(&env, now()).is_ok());
    }

    #[test]
    fn any_single_bit_flip_in_body_is_rejected() {
        let a = auth(Some(AuthMode::Hmac), ReplayPolicy::default());
        let header = signature_header(SECRET.as_bytes(), BODY).unwrap();
        for byte in 0..BODY.len() {
            for bit in 0..8 {
                let mut body = BODY.to_vec();
                body[byte] ^= 1 << bit;
                let env = Envelope::new(Lane::Webhook, body).with_header(SIGNATURE_HEADER, header.clone());
                assert!(
                    matches!(a.authenticate(&env, now()), Err(GateError::Unauthorized(_))),
                    "flip at byte {byte} bit {bit} was accepted"
                );
            }
        }
    }

    #[test]
    fn hmac_is_over_raw_bytes_not_parsed_json() {
        let a = auth(Some(AuthMode::Hmac), ReplayPolicy::default());
        let reformatted = br#"{ "template_id": "portrait_v1", "profile_id": "SDXL-v1" }"#;
        let env = Envelope::new(Lane::Webhook, reformatted.to_vec())
            .with_header(SIGNATURE_HEADER, signature_header(SECRET.as_bytes(), BODY).unwrap());
        assert!(a.authenticate(&env, now()).is_err());
    }

    #[test]
    fn malformed_signature_is_unauthorized() {
        let a = auth(Some(AuthMode::Hmac), ReplayPolicy::default());
        let env = Envelope::new(Lane::Webhook, BODY).with_header(SIGNATURE_HEADER, "sha256=zz");
        assert!(matches!(
            a.authenticate(&env, now()),
            Err(GateError::Unauthorized(_))
        ));
    }

    #[test]
    fn bearer_or_hmac_accepts_either() {
        let a = auth(Some(AuthMode::BearerOrHmac), ReplayPolicy::default());
        let bearer = Envelope::new(Lane::Trigger, BODY)
            .with_header("authorization", format!("Bearer {SECRET}"));
        assert_eq!(a.authenticate(&bearer, now()).unwrap().method, AuthMode::Bearer);
        assert_eq!(a.authenticate(&signed(BODY), now()).unwrap().method, AuthMode::Hmac);

        let wrong = Envelope::new(Lane::Trigger, BODY).with_header("authorization", "Bearer x");
        assert!(a.authenticate(&wrong, now()).is_err());
        assert!(a.authenticate(&Envelope::new(Lane::Trigger, BODY), now()).is_err());
    }

    fn replay_policy() -> ReplayPolicy {
        ReplayPolicy {
            required: true,
            skew_seconds: 300,
            nonce_ttl_seconds: 600,
        }
    }

    fn with_replay(env: Envelope, ts: i64, nonce: &str) -> Envelope {
        env.with_header(TIMESTAMP_HEADER, ts.to_string())
            .with_header(NONCE_HEADER, nonce)
    }

    #[test]
    fn repeated_nonce_is_replay() {
        let a = auth(Some(AuthMode::Hmac), replay_policy());
        let t = now().timestamp();
        let env = with_replay(signed(BODY), t, "n-1");
        assert_eq!(a.authenticate(&env, now()).unwrap().nonce.as_deref(), Some("n-1"));
        assert!(matches!(
            a.authenticate(&env, now()),
            Err(GateError::ReplayDetected(_))
        ));
    }

    #[test]
    fn nonce_after_ttl_is_a_new_request() {
        let a = auth(Some(AuthMode::Hmac), replay_policy());
        let first = now();
        let env = with_replay(signed(BODY), first.timestamp(), "n-2");
        a.authenticate(&env, first).unwrap();

        let later = first + chrono::Duration::seconds(601);
        let env = with_replay(signed(BODY), later.timestamp(), "n-2");
        assert!(a.authenticate(&env, later).is_ok());
    }

    #[test]
    fn stale_timestamp_is_rejected() {
        let a = auth(Some(AuthMode::Hmac), replay_policy());
        let env = with_replay(signed(BODY), now().timestamp() - 301, "n-3");
        assert!(matches!(
            a.authenticate(&env, now()),
            Err(GateError::ReplayDetected(_))
        ));
    }

    #[test]
    fn missing_replay_headers_do_not_downgrade() {
        let a = auth(Some(AuthMode::Hmac), replay_policy());
        assert!(matches!(
            a.authenticate(&signed(BODY), now()),
            Err(GateError::ReplayDetected(_))
        ));
        let only_ts = signed(BODY).with_header(TIMESTAMP_HEADER, now().timestamp().to_string());
        assert!(a.authenticate(&only_ts, now()).is_err());
    }

    #[test]
    fn bad_credentials_do_not_consume_nonces() {
        let nonces = Arc::new(NonceCache::new());
        let a = Authenticator::new(
            Credential::new(Some(AuthMode::Bearer), Some(SECRET.into()), replay_policy()),
            Arc::clone(&nonces),
        );
        let env = with_replay(
            Envelope::new(Lane::Webhook, BODY).with_header("authorization", "Bearer wrong"),
            now().timestamp(),
            "n-4",
        );
        assert!(a.authenticate(&env, now()).is_err());
        assert!(nonces.is_empty());
    }

    #[test]
    fn nonce_cache_purges_expired_entries() {
        let cache = NonceCache::new();
        assert!(cache.check_and_insert("a", 0, 10).unwrap());
        assert!(cache.check_and_insert("b", 5, 10).unwrap());
        assert!(!cache.check_and_insert("a", 9, 10).unwrap());
        assert!(cache.check_and_insert("c", 12, 10).unwrap());
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn full_nonce_cache_fails_closed_until_entries_expire() {
        let cache = NonceCache::with_capacity(2);
        assert!(cache.check_and_insert("a", 0, 10).unwrap());
        assert!(cache.check_and_insert("b", 0, 10).unwrap());
        assert!(matches!(
            cache.check_and_insert("c", 1, 10),
            Err(GateError::ReplayDetected(_))
        ));
        // A held nonce is still reported as a replay, not as overflow.
        assert!(!cache.check_and_insert("a", 1, 10).unwrap());
        assert!(cache.check_and_insert("c", 10, 10).unwrap());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn bearer_scheme_is_case_insensitive() {
        assert_eq!(bearer_token("Bearer abc"), Some("abc"));
        assert_eq!(bearer_token("bearer abc"), Some("abc"));
        assert_eq!(bearer_token("BEARER  abc "), Some("abc"));
        assert_eq!(bearer_token("Basic abc"), None);
        assert_eq!(bearer_token("Bearer"), None);
        assert_eq!(bearer_token("Bearer   "), None);

        let a = auth(Some(AuthMode::Bearer), ReplayPolicy::default());
        let env = Envelope::new(Lane::Webhook, BODY).with_header("authorization", format!("BEARER {SECRET}"));
        assert!(a.authenticate(&env, now()).is_ok());
    }

    #[test]
    fn debug_redacts_secret() {
        let c = Credential::new(Some(AuthMode::Bearer), Some(SECRET.into()), ReplayPolicy::default());
        let dbg = format!("{c:?}");
        assert!(!dbg.contains(SECRET));
        assert!(dbg.contains("<redacted>"));
    }
}
