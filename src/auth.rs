//! Session and service tokens.
//!
//! Tokens are self-contained: `base64url(JSON claims) "." base64url(HMAC-SHA256)`.
//! Nothing is stored server-side, so every request is checked from the token bytes
//! alone. Each token carries a [`TokenScope`] naming the one kind of operation it
//! was minted for.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

use crate::messages::FailureReason;

type HmacSha256 = Hmac<Sha256>;

/// Subject used for tokens minted by the catalog server for its own background work
pub const SYSTEM_SUBJECT: &str = "system";

/// What a token is allowed to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenScope {
    /// End-user session issued on signup/login
    Session,
    /// Long-lived catalog token used for liveness probes
    System,
    /// Replica existence probe
    Verify,
    /// Instructs a node to relay a blob to a peer
    RelaySource,
    /// Lets a peer push a relayed blob
    RelayIngest,
}

impl fmt::Display for TokenScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TokenScope::Session => "session",
            TokenScope::System => "system",
            TokenScope::Verify => "verify",
            TokenScope::RelaySource => "relay_source",
            TokenScope::RelayIngest => "relay_ingest",
        };
        f.write_str(name)
    }
}

/// Signed token contents. Times are Unix seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    pub subject: String,
    pub scope: TokenScope,
    pub issued_at: u64,
    /// `None` only for unbounded system tokens
    pub expires_at: Option<u64>,
}

/// Errors that can occur during token handling
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Signing secret must not be empty")]
    EmptySecret,

    #[error("Malformed token: {reason}")]
    Malformed { reason: String },

    #[error("Invalid token signature")]
    InvalidSignature,

    #[error("Token expired at {expired_at} (now {now})")]
    Expired { expired_at: u64, now: u64 },

    #[error("Token scope {actual} is not allowed here")]
    WrongScope { actual: TokenScope },

    #[error("Failed to encode claims: {0}")]
    Encoding(#[from] serde_json::Error),
}

impl AuthError {
    /// Reason reported to end users of the catalog server
    pub fn failure_reason(&self) -> FailureReason {
        match self {
            AuthError::Expired { .. } => FailureReason::TokenExpired,
            _ => FailureReason::InvalidToken,
        }
    }
}

/// Result type for token operations
pub type AuthResult<T> = Result<T, AuthError>;

/// Source of the current time for expiry checks
pub trait Clock: Send + Sync + fmt::Debug {
    fn now_secs(&self) -> u64;
}

/// Wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_secs(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }
}

/// Clock that only moves when told to
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(now_secs: u64) -> Self {
        Self {
            now: AtomicU64::new(now_secs),
        }
    }

    pub fn set(&self, now_secs: u64) {
        self.now.store(now_secs, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(by.as_secs(), Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_secs(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Mints and checks tokens with a shared secret.
///
/// Cheap to clone; the catalog server, the background loops and every storage
/// node each hold their own copy built from the same secret.
#[derive(Clone)]
pub struct TokenIssuer {
    mac: HmacSha256,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for TokenIssuer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenIssuer")
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

impl TokenIssuer {
    pub fn new(secret: &str) -> AuthResult<Self> {
        Self::with_clock(secret, Arc::new(SystemClock))
    }

    pub fn with_clock(secret: &str, clock: Arc<dyn Clock>) -> AuthResult<Self> {
        if secret.is_empty() {
            return Err(AuthError::EmptySecret);
        }
        let mac = HmacSha256::new_from_slice(secret.as_bytes()).map_err(|e| {
            AuthError::Malformed {
                reason: e.to_string(),
            }
        })?;
        Ok(Self { mac, clock })
    }

    pub fn now_secs(&self) -> u64 {
        self.clock.now_secs()
    }

    /// Issue a token that expires `ttl` from now
    pub fn issue(&self, subject: &str, scope: TokenScope, ttl: Duration) -> AuthResult<String> {
        let now = self.now_secs();
        self.sign(&TokenClaims {
            subject: subject.to_string(),
            scope,
            issued_at: now,
            expires_at: Some(now.saturating_add(ttl.as_secs())),
        })
    }

    /// Issue a token with no expiry
    pub fn issue_unbounded(&self, subject: &str, scope: TokenScope) -> AuthResult<String> {
        self.sign(&TokenClaims {
            subject: subject.to_string(),
            scope,
            issued_at: self.now_secs(),
            expires_at: None,
        })
    }

    /// Check signature and expiry, returning the claims
    pub fn verify(&self, token: &str) -> AuthResult<TokenClaims> {
        let (payload_b64, signature_b64) =
            token.split_once('.').ok_or_else(|| AuthError::Malformed {
                reason: "missing signature separator".to_string(),
            })?;

        let payload = URL_SAFE_NO_PAD
            .decode(payload_b64)
            .map_err(|e| AuthError::Malformed {
                reason: e.to_string(),
            })?;
        let signature = URL_SAFE_NO_PAD
            .decode(signature_b64)
            .map_err(|e| AuthError::Malformed {
                reason: e.to_string(),
            })?;

        let mut mac = self.mac.clone();
        mac.update(&payload);
        mac.verify_slice(&signature)
            .map_err(|_| AuthError::InvalidSignature)?;

        let claims: TokenClaims =
            serde_json::from_slice(&payload).map_err(|e| AuthError::Malformed {
                reason: e.to_string(),
            })?;

        if let Some(expires_at) = claims.expires_at {
            let now = self.now_secs();
            if now >= expires_at {
                return Err(AuthError::Expired {
                    expired_at: expires_at,
                    now,
                });
            }
        }

        Ok(claims)
    }

    /// Verify and require one of `allowed` scopes
    pub fn authorize(&self, token: &str, allowed: &[TokenScope]) -> AuthResult<TokenClaims> {
        let claims = self.verify(token)?;
        if !allowed.contains(&claims.scope) {
            return Err(AuthError::WrongScope {
                actual: claims.scope,
            });
        }
        Ok(claims)
    }

    fn sign(&self, claims: &TokenClaims) -> AuthResult<String> {
        let payload = serde_json::to_vec(claims)?;
        let mut mac = self.mac.clone();
        mac.update(&payload);
        let signature = mac.finalize().into_bytes();

        Ok(format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(&payload),
            URL_SAFE_NO_PAD.encode(signature)
        ))
    }
}
