#![cfg(feature = "stack-api")]

// Public stack API exposed to integrators: byte-stream endpoints, the opaque
// security-policy provider, user authentication, and shared channel types.
use std::{fmt, sync::Arc, time::Duration};

use bytes::Bytes;
use thiserror::Error;

/// Message security mode requested for a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SecurityMode {
    /// No signing or encryption.
    None,
    /// Messages are signed but not encrypted.
    Sign,
    /// Messages are signed and encrypted.
    SignAndEncrypt,
}

impl fmt::Display for SecurityMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SecurityMode::None => "none",
            SecurityMode::Sign => "sign",
            SecurityMode::SignAndEncrypt => "sign_encrypt",
        };
        f.write_str(label)
    }
}

/// Role the local endpoint plays during channel establishment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Sends the hello and the open-secure-channel request.
    Initiator,
    /// Answers hellos and issues security tokens.
    Acceptor,
}

/// Immutable description of one channel's intent. One config may be reused to
/// open multiple sequential connections.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Local role for the handshake.
    pub role: Role,
    /// Target endpoint address (opaque to the core; the socket layer dials it).
    pub endpoint: String,
    /// Requested security policy identifier.
    pub policy_id: String,
    /// Requested message security mode.
    pub mode: SecurityMode,
    /// Requested security token lifetime.
    pub requested_token_lifetime: Duration,
    /// Local certificate material (opaque handle).
    pub local_certificate: Option<Bytes>,
    /// Expected peer certificate material (opaque handle).
    pub peer_certificate: Option<Bytes>,
    /// Reverse connection: the acceptor dials and sends a reverse-hello,
    /// swapping the usual TCP connect direction.
    pub reverse: bool,
}

impl ConnectionConfig {
    /// Creates a config with the given role and endpoint, no security, and a
    /// one hour requested token lifetime.
    pub fn new(role: Role, endpoint: impl Into<String>) -> Self {
        Self {
            role,
            endpoint: endpoint.into(),
            policy_id: "None".to_string(),
            mode: SecurityMode::None,
            requested_token_lifetime: Duration::from_secs(3600),
            local_certificate: None,
            peer_certificate: None,
            reverse: false,
        }
    }

    /// Sets the security policy identifier and mode.
    pub fn with_security(mut self, policy_id: impl Into<String>, mode: SecurityMode) -> Self {
        self.policy_id = policy_id.into();
        self.mode = mode;
        self
    }

    /// Sets the requested token lifetime.
    pub fn with_token_lifetime(mut self, lifetime: Duration) -> Self {
        self.requested_token_lifetime = lifetime;
        self
    }

    /// Marks the connection as reverse (acceptor dials).
    pub fn reversed(mut self) -> Self {
        self.reverse = true;
        self
    }
}

/// User credentials presented during session activation.
#[derive(Debug, Clone)]
pub enum Credentials {
    /// No identity; accepted only when the authenticator allows it.
    Anonymous,
    /// User name and secret.
    UserName {
        /// Account name.
        user: String,
        /// Secret compared by the authenticator.
        secret: Bytes,
    },
    /// Certificate-based identity (opaque handle).
    Certificate(Bytes),
}

/// Reason code attached to every forced transition and cascade close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Explicit close requested by the owner.
    Requested,
    /// The owning channel was lost.
    ChannelLost,
    /// The transport endpoint failed or reached end of stream.
    TransportFailed,
    /// Channel establishment exceeded the configured timeout.
    ConnectionTimeout,
    /// The open-secure-channel exchange was rejected.
    NegotiationFailed,
    /// Sequence or size integrity was violated; not locally repairable.
    ProtocolViolation,
    /// No valid security token remains on the channel.
    TokenExpired,
    /// The session's revised timeout elapsed since last activity.
    SessionTimeout,
    /// Too many consecutive authentication failures.
    AuthLockout,
    /// The entry was reclaimed to make room for a new one.
    Reclaimed,
    /// The process is shutting down.
    Shutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CloseReason::Requested => "requested",
            CloseReason::ChannelLost => "channel_lost",
            CloseReason::TransportFailed => "transport_failed",
            CloseReason::ConnectionTimeout => "connection_timeout",
            CloseReason::NegotiationFailed => "negotiation_failed",
            CloseReason::ProtocolViolation => "protocol_violation",
            CloseReason::TokenExpired => "token_expired",
            CloseReason::SessionTimeout => "session_timeout",
            CloseReason::AuthLockout => "auth_lockout",
            CloseReason::Reclaimed => "reclaimed",
            CloseReason::Shutdown => "shutdown",
        };
        f.write_str(label)
    }
}

/// Outcome of a non-blocking read from a byte-stream endpoint.
#[derive(Debug, Clone)]
pub enum ReadOutcome {
    /// Bytes arrived from the peer.
    Bytes(Bytes),
    /// Nothing available right now.
    Empty,
    /// The peer closed the stream.
    EndOfStream,
}

/// Byte-stream endpoint consumed from the socket layer. The core never owns
/// sockets; it reads and writes opaque byte runs through this trait.
pub trait ByteStream: Send {
    /// Error type returned by the endpoint.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Polls for inbound bytes without blocking.
    fn read(&mut self) -> Result<ReadOutcome, Self::Error>;

    /// Writes bytes to the peer.
    fn write(&mut self, bytes: Bytes) -> Result<(), Self::Error>;
}

/// Security parameters offered by a peer during negotiation.
#[derive(Debug, Clone)]
pub struct PolicyOffer {
    /// Offered policy identifier.
    pub policy_id: String,
    /// Offered message security mode.
    pub mode: SecurityMode,
    /// Peer certificate material, when the mode requires one.
    pub certificate: Option<Bytes>,
}

/// Errors surfaced by a security-policy provider.
#[derive(Debug, Error)]
pub enum PolicyError {
    /// The peer's offer is incompatible with the local policy.
    #[error("policy offer rejected: {offered}")]
    Rejected {
        /// Policy identifier the peer offered.
        offered: String,
    },
    /// Signature verification failed.
    #[error("signature verification failed")]
    Verification,
    /// The provider does not support the requested operation.
    #[error("operation unsupported by policy: {0}")]
    Unsupported(&'static str),
}

/// Opaque security-policy provider. Long-running cryptographic work may run on
/// a separate worker pool; the channel engine never blocks on it.
pub trait SecurityPolicy: Send + Sync {
    /// Policy identifier advertised during negotiation.
    fn id(&self) -> &str;

    /// Security mode this policy provides.
    fn mode(&self) -> SecurityMode;

    /// Signature length appended by [`SecurityPolicy::sign`], in bytes.
    fn signature_len(&self) -> usize;

    /// Checks a peer offer against the local policy.
    fn negotiate(&self, peer_offer: &PolicyOffer) -> Result<(), PolicyError>;

    /// Signs the provided bytes under the given token's key material.
    fn sign(&self, data: &[u8], token_id: u32) -> Result<Bytes, PolicyError>;

    /// Verifies a signature produced by the peer under the given token.
    fn verify(&self, data: &[u8], signature: &[u8], token_id: u32) -> Result<(), PolicyError>;

    /// Encrypts the provided bytes under the given token.
    fn encrypt(&self, data: &[u8], token_id: u32) -> Result<Bytes, PolicyError>;

    /// Decrypts bytes received from the peer under the given token.
    fn decrypt(&self, data: &[u8], token_id: u32) -> Result<Bytes, PolicyError>;
}

/// Validates user credentials during session activation.
pub trait Authenticator: Send + Sync {
    /// Returns `true` when the credentials identify a valid user.
    fn authenticate(&self, credentials: &Credentials) -> bool;
}

impl<F> Authenticator for F
where
    F: Fn(&Credentials) -> bool + Send + Sync,
{
    fn authenticate(&self, credentials: &Credentials) -> bool {
        self(credentials)
    }
}

impl<A: Authenticator + ?Sized> Authenticator for Arc<A> {
    fn authenticate(&self, credentials: &Credentials) -> bool {
        self.as_ref().authenticate(credentials)
    }
}
