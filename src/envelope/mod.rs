//! Signed envelope codec for the relay tunnel.
//!
//! Every post-handshake frame between agent and relay is wrapped in a signed
//! envelope `{v, t, n, p, h}`:
//! - `v` = envelope version (1)
//! - `t` = sender timestamp (unix ms)
//! - `n` = random nonce (16 bytes hex = 32 chars)
//! - `p` = base64-encoded payload
//! - `h` = hex HMAC-SHA256 over `"1|t|n|p"` keyed by the session key
//!
//! Integrity comes from the HMAC, replay protection from the nonce cache plus
//! the ±30s timestamp window. The session key itself is derived from the
//! agent token and a relay-provided nonce, so it is never transmitted.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Accepted clock skew between sender and receiver.
pub const TIMESTAMP_TOLERANCE_MS: i64 = 30_000;

/// Nonce retention window, twice the timestamp tolerance.
pub const NONCE_TTL_MS: i64 = 60_000;

/// Hard cap on tracked nonces.
pub const MAX_NONCE_CACHE: usize = 2_000;

const NONCE_BYTES: usize = 16;

/// Context string mixed into session-key derivation. Must match the relay.
const KEY_CONTEXT: &str = "obs-agent-v1|";

/// Time source for envelope timestamps and nonce expiry.
///
/// Injected so tests can drive the timestamp window and TTL eviction
/// deterministically.
pub trait Clock: Send + Sync {
    /// Current time as unix milliseconds.
    fn now_millis(&self) -> i64;
}

/// Wall-clock [`Clock`] used in production.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }
}

#[derive(Debug, Serialize)]
struct Envelope {
    v: i64,
    t: i64,
    n: String,
    p: String,
    h: String,
}

/// Incoming envelopes deserialize through optional fields so that missing
/// keys classify as `bad_fields`/`bad_version` rather than a parse error.
#[derive(Debug, Deserialize)]
struct RawEnvelope {
    #[serde(default)]
    v: Option<i64>,
    #[serde(default)]
    t: Option<i64>,
    #[serde(default)]
    n: Option<String>,
    #[serde(default)]
    p: Option<String>,
    #[serde(default)]
    h: Option<String>,
}

/// Why [`Codec::open`] rejected an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    NotJson,
    BadVersion,
    BadFields,
    BadNonce,
    BadHmac,
    TimestampExpired,
    Replay,
    BadPayload,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotJson => "not_json",
            Self::BadVersion => "bad_version",
            Self::BadFields => "bad_fields",
            Self::BadNonce => "bad_nonce",
            Self::BadHmac => "bad_hmac",
            Self::TimestampExpired => "timestamp_expired",
            Self::Replay => "replay",
            Self::BadPayload => "bad_payload",
        }
    }
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors from [`Codec::seal`].
#[derive(Debug, thiserror::Error)]
pub enum SealError {
    #[error("nonce generation failed: {0}")]
    Rng(#[from] getrandom::Error),
    #[error("envelope encode failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Tracks recently-seen nonces for replay protection with TTL eviction.
///
/// Mutated only while opening relay frames, but eviction walks the map, so
/// all access goes through the internal mutex.
#[derive(Debug, Default)]
pub struct NonceCache {
    nonces: Mutex<HashMap<String, i64>>,
}

impl NonceCache {
    pub fn new() -> Self {
        Self {
            nonces: Mutex::new(HashMap::with_capacity(MAX_NONCE_CACHE)),
        }
    }

    /// Admit a nonce at time `now_ms`. Returns `false` if the nonce was seen
    /// within the TTL window. Expired entries are evicted first; if the cache
    /// is over capacity after insertion, the oldest entry by timestamp goes.
    pub fn admit(&self, nonce: &str, now_ms: i64) -> bool {
        let mut nonces = self.nonces.lock();

        nonces.retain(|_, ts| now_ms - *ts <= NONCE_TTL_MS);

        if nonces.contains_key(nonce) {
            return false;
        }

        nonces.insert(nonce.to_string(), now_ms);

        if nonces.len() > MAX_NONCE_CACHE {
            if let Some(oldest) = nonces
                .iter()
                .min_by_key(|(_, ts)| **ts)
                .map(|(k, _)| k.clone())
            {
                nonces.remove(&oldest);
            }
        }

        true
    }

    pub fn len(&self) -> usize {
        self.nonces.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nonces.lock().is_empty()
    }
}

/// Derive the per-session key from the agent token and the relay-provided
/// session nonce. Both peers compute this independently; the key never
/// crosses the wire.
pub fn derive_session_key(token: &str, session_nonce: &str) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(token.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(KEY_CONTEXT.as_bytes());
    mac.update(session_nonce.as_bytes());
    mac.finalize().into_bytes().to_vec()
}

fn signature_input(t: i64, n: &str, p: &str) -> String {
    format!("1|{}|{}|{}", t, n, p)
}

/// Seals and opens signed envelopes against an injected clock.
#[derive(Clone)]
pub struct Codec {
    clock: Arc<dyn Clock>,
}

impl Codec {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    /// Wrap `payload` in a signed envelope, returned as compact JSON text.
    /// Two seals of the same payload are never byte-identical (fresh nonce
    /// each call).
    pub fn seal(&self, session_key: &[u8], payload: &[u8]) -> Result<String, SealError> {
        let t = self.clock.now_millis();

        let mut nonce = [0u8; NONCE_BYTES];
        getrandom::fill(&mut nonce)?;
        let n = hex::encode(nonce);

        let p = BASE64.encode(payload);

        let mut mac = HmacSha256::new_from_slice(session_key)
            .expect("HMAC accepts keys of any length");
        mac.update(signature_input(t, &n, &p).as_bytes());
        let h = hex::encode(mac.finalize().into_bytes());

        let env = Envelope { v: 1, t, n, p, h };
        Ok(serde_json::to_string(&env)?)
    }

    /// Verify and unwrap a signed envelope.
    ///
    /// The HMAC is verified before the timestamp window so a forged envelope
    /// and an expired-but-authentic one are not distinguishable by timing.
    pub fn open(
        &self,
        session_key: &[u8],
        raw: &[u8],
        cache: &NonceCache,
    ) -> Result<Vec<u8>, RejectReason> {
        let env: RawEnvelope = match serde_json::from_slice(raw) {
            Ok(env) => env,
            Err(_) => return Err(RejectReason::NotJson),
        };

        if env.v.unwrap_or(0) != 1 {
            return Err(RejectReason::BadVersion);
        }

        let t = env.t.unwrap_or(0);
        let (n, p, h) = match (env.n, env.p, env.h) {
            (Some(n), Some(p), Some(h)) if !n.is_empty() && !p.is_empty() && !h.is_empty() => {
                (n, p, h)
            }
            _ => return Err(RejectReason::BadFields),
        };

        // Nonce format: 32 hex chars = 16 bytes
        if n.len() != 32 || hex::decode(&n).is_err() {
            return Err(RejectReason::BadNonce);
        }

        // HMAC first (constant-time), before the timestamp check
        let actual = match hex::decode(&h) {
            Ok(actual) => actual,
            Err(_) => return Err(RejectReason::BadHmac),
        };
        let mut mac = HmacSha256::new_from_slice(session_key)
            .expect("HMAC accepts keys of any length");
        mac.update(signature_input(t, &n, &p).as_bytes());
        if mac.verify_slice(&actual).is_err() {
            return Err(RejectReason::BadHmac);
        }

        let now = self.clock.now_millis();
        if (now - t).abs() > TIMESTAMP_TOLERANCE_MS {
            return Err(RejectReason::TimestampExpired);
        }

        if !cache.admit(&n, now) {
            return Err(RejectReason::Replay);
        }

        match BASE64.decode(&p) {
            Ok(payload) => Ok(payload),
            Err(_) => Err(RejectReason::BadPayload),
        }
    }
}
