// Security token lifecycle: issue, renewal overlap, and validation.

use std::time::{Duration, Instant};

use thiserror::Error;

// Renewal is requested once three quarters of the revised lifetime elapsed.
const RENEWAL_NUM: u32 = 3;
const RENEWAL_DEN: u32 = 4;

// An expired current token stays acceptable for a quarter of its lifetime, so
// messages already in flight when renewal completes remain verifiable.
const EXPIRED_GRACE_DEN: u32 = 4;

/// Token validation error, fatal to the owning channel.
#[derive(Debug, Error)]
pub enum TokenError {
    /// The token identifier matches neither the current nor the previous token.
    #[error("unknown security token {0}")]
    TokenUnknown(u32),
    /// The token is known but no longer within its validity window.
    #[error("security token {0} expired")]
    TokenExpired(u32),
}

/// Negotiated symmetric security context for one channel. Key material is held
/// by the security-policy provider; the core tracks identity and lifetime.
#[derive(Debug, Clone)]
pub struct SecurityToken {
    /// Token identifier, unique within the owning channel.
    pub token_id: u32,
    /// Owning channel identifier.
    pub channel_id: u32,
    /// Instant the token was issued or installed.
    pub issued_at: Instant,
    /// Negotiated lifetime after clamping.
    pub revised_lifetime: Duration,
}

impl SecurityToken {
    /// Instant after which the token is expired.
    pub fn expires_at(&self) -> Instant {
        self.issued_at + self.revised_lifetime
    }

    /// Hard deadline including the expired-token grace window.
    fn grace_deadline(&self) -> Instant {
        self.expires_at() + self.revised_lifetime / EXPIRED_GRACE_DEN
    }
}

/// The at-most-two tokens a connection holds: the current one and, during the
/// renewal overlap window, its predecessor.
#[derive(Debug)]
pub struct TokenSet {
    channel_id: u32,
    next_token_id: u32,
    current: Option<SecurityToken>,
    previous: Option<SecurityToken>,
}

impl TokenSet {
    /// Creates an empty token set for the given channel.
    pub fn new(channel_id: u32) -> Self {
        Self {
            channel_id,
            next_token_id: 1,
            current: None,
            previous: None,
        }
    }

    /// Returns the current token, if one was issued.
    pub fn current(&self) -> Option<&SecurityToken> {
        self.current.as_ref()
    }

    /// Returns the previous token while the overlap window is open.
    pub fn previous(&self) -> Option<&SecurityToken> {
        self.previous.as_ref()
    }

    /// Issues a fresh token with a locally assigned identifier, clamping the
    /// requested lifetime to the configured minimum. The current token, if
    /// any, becomes the previous one.
    pub fn issue(
        &mut self,
        requested_lifetime: Duration,
        minimum_lifetime: Duration,
        now: Instant,
    ) -> &SecurityToken {
        let token_id = self.next_token_id;
        self.next_token_id = self.next_token_id.checked_add(1).unwrap_or(1);
        let revised = requested_lifetime.max(minimum_lifetime);
        self.install(token_id, revised, now)
    }

    /// Installs a token whose identifier and revised lifetime were assigned by
    /// the peer (initiator side of an open-secure-channel response).
    pub fn install(
        &mut self,
        token_id: u32,
        revised_lifetime: Duration,
        now: Instant,
    ) -> &SecurityToken {
        let token = SecurityToken {
            token_id,
            channel_id: self.channel_id,
            issued_at: now,
            revised_lifetime,
        };
        self.previous = self.current.take();
        self.current = Some(token);
        self.current.as_ref().expect("token just installed")
    }

    /// Accepts the current token (including its grace window) or, until its
    /// own expiry, the previous token. Any other identifier is fatal.
    pub fn validate(&self, token_id: u32, now: Instant) -> Result<(), TokenError> {
        if let Some(current) = &self.current {
            if current.token_id == token_id {
                if now <= current.grace_deadline() {
                    return Ok(());
                }
                return Err(TokenError::TokenExpired(token_id));
            }
        }
        if let Some(previous) = &self.previous {
            if previous.token_id == token_id {
                if now <= previous.expires_at() {
                    return Ok(());
                }
                return Err(TokenError::TokenExpired(token_id));
            }
        }
        Err(TokenError::TokenUnknown(token_id))
    }

    /// True once renewal should be requested for the current token.
    pub fn renewal_due(&self, now: Instant) -> bool {
        match &self.current {
            Some(token) => {
                let due_at = token.issued_at + token.revised_lifetime * RENEWAL_NUM / RENEWAL_DEN;
                now >= due_at
            }
            None => false,
        }
    }

    /// True when the current token (grace included) is gone entirely.
    pub fn current_defunct(&self, now: Instant) -> bool {
        match &self.current {
            Some(token) => now > token.grace_deadline(),
            None => false,
        }
    }

    /// Drops the previous token once it reached its own expiry. Returns `true`
    /// when a token was discarded.
    pub fn sweep(&mut self, now: Instant) -> bool {
        match &self.previous {
            Some(previous) if now > previous.expires_at() => {
                self.previous = None;
                true
            }
            _ => false,
        }
    }
}
