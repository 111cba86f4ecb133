// Opcport secure channel public library surface.

pub mod config;

pub mod chunk;

pub mod token;

pub mod metrics;

#[cfg(feature = "stack-api")]
pub mod api;

#[cfg(feature = "stack-api")]
pub mod policy;

#[cfg(feature = "stack-api")]
pub mod pending;

#[cfg(feature = "stack-api")]
pub mod slots;

#[cfg(feature = "stack-api")]
pub mod session;

#[cfg(feature = "stack-api")]
pub mod engine;

#[cfg(feature = "stack-api")]
pub mod runtime;

pub use config::{
    ChannelConfig, Config, ConfigError, RequestConfig, SessionConfig, TransportConfig,
};

pub use chunk::{
    encode_abort, encode_message, split_frame, Accepted, ChunkAssembly, ChunkError, ChunkHeader,
    ChunkKind, ChunkLimits, FrameBuffer, Message, MessageKind, Sequencer, CHUNK_HDR_LEN,
};

pub use token::{SecurityToken, TokenError, TokenSet};

pub use metrics::{Metrics, MetricsError};

#[cfg(feature = "stack-api")]
pub use api::{
    Authenticator, ByteStream, CloseReason, ConnectionConfig, Credentials, PolicyError,
    PolicyOffer, ReadOutcome, Role, SecurityMode, SecurityPolicy,
};

#[cfg(feature = "stack-api")]
pub use policy::{HmacSha256Policy, NullPolicy, StaticUserAuthenticator};

#[cfg(feature = "stack-api")]
pub use pending::{PendingError, PendingTracker, RequestOutcome, ResponseSlot};

#[cfg(feature = "stack-api")]
pub use slots::{
    Acknowledge, ConnEvent, ConnState, ConnectionHandle, Hello, OpenError, OpenRequest,
    OpenResponse, ReverseHello, StaleHandle,
};

#[cfg(feature = "stack-api")]
pub use session::{Activation, ClosedSession, SessionError, SessionId, SessionState};

#[cfg(feature = "stack-api")]
pub use engine::{ChannelEngine, EngineError, HandshakeOut, Notification, Output};

#[cfg(feature = "stack-api")]
pub use runtime::{
    spawn_stack, spawn_stack_with_config, HandleError, RuntimeConfig, StackEvent, StackHandle,
    StopReason,
};
