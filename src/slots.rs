#![cfg(feature = "stack-api")]

// Connection slot pool and the per-connection handshake state machine.
//
// The table owns a fixed arena of slots sized at the configured connection
// cap plus a buffered margin that absorbs connections draining toward close.
// Transport and socket concerns stay outside; the machine consumes typed
// events and emits typed actions for the engine to carry out.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    api::{CloseReason, ConnectionConfig, PolicyOffer, Role},
    chunk::{ChunkAssembly, ChunkLimits, FrameBuffer, Sequencer, CHUNK_HDR_LEN},
    config::Config,
    pending::PendingTracker,
    token::TokenSet,
};

/// Errors returned while opening a connection slot.
#[derive(Debug, Error)]
pub enum OpenError {
    /// Every primary slot is occupied by a live connection.
    #[error("connection slots exhausted (max {max})")]
    SlotsExhausted {
        /// Configured primary slot count.
        max: u32,
    },
    /// The transport endpoint failed before the channel was established.
    #[error("transport failed during establishment")]
    TransportFailed,
    /// The peer rejected the open-secure-channel exchange.
    #[error("secure channel negotiation failed")]
    NegotiationFailed,
    /// Establishment did not finish within the configured deadline.
    #[error("connection establishment timed out")]
    Timeout,
}

/// The referenced slot is free or was reused since the handle was issued.
#[derive(Debug, Error)]
#[error("stale connection handle")]
pub struct StaleHandle;

/// Lifecycle state of one connection slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Transport-level contact is being set up.
    Connecting,
    /// Limits were agreed; the open-secure-channel exchange is in flight.
    Negotiating,
    /// A valid security token exists; application traffic may flow.
    Established,
    /// A token renewal request is outstanding; traffic continues.
    Renewing,
    /// Teardown in progress; the slot only absorbs stray events.
    Closing,
}

/// Stable reference to a slot. The generation guards against a handle
/// outliving its connection and touching a reused slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionHandle {
    slot: u32,
    generation: u32,
}

impl ConnectionHandle {
    /// Slot index within the table.
    pub fn slot(&self) -> u32 {
        self.slot
    }
}

/// Transport limit announcement opening the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    /// Largest chunk the sender accepts, header included.
    pub max_chunk_size: u32,
    /// Largest chunk count per message the sender accepts.
    pub max_chunk_count: u32,
    /// Largest reassembled message the sender accepts.
    pub max_message_size: u32,
}

/// Acceptor's reply carrying the revised (negotiated) limits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Acknowledge {
    /// Revised chunk size bound.
    pub max_chunk_size: u32,
    /// Revised chunk count bound.
    pub max_chunk_count: u32,
    /// Revised message size bound.
    pub max_message_size: u32,
}

/// Sent by a reverse-connecting acceptor to invite the hello.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReverseHello {
    /// Endpoint the acceptor answers for.
    pub endpoint: String,
}

/// Open-secure-channel request, for first issue or renewal.
#[derive(Debug, Clone)]
pub struct OpenRequest {
    /// Security parameters offered by the initiator.
    pub offer: PolicyOffer,
    /// Requested token lifetime; the acceptor clamps it.
    pub requested_lifetime: Duration,
    /// True for renewal of an existing channel.
    pub renew: bool,
}

/// Open-secure-channel response issuing a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenResponse {
    /// Channel identifier assigned by the acceptor.
    pub channel_id: u32,
    /// Freshly issued token identifier.
    pub token_id: u32,
    /// Token lifetime after clamping.
    pub revised_lifetime: Duration,
}

/// Inbound events fed to the connection state machine.
#[derive(Debug, Clone)]
pub enum ConnEvent {
    /// The transport endpoint reported contact with the peer.
    TransportConnected,
    /// A hello announcement arrived.
    HelloReceived(Hello),
    /// An acknowledge reply arrived.
    AcknowledgeReceived(Acknowledge),
    /// A reverse-hello invitation arrived.
    ReverseHelloReceived(ReverseHello),
    /// An open-secure-channel request arrived.
    OpenRequestReceived(OpenRequest),
    /// An open-secure-channel response arrived.
    OpenResponseReceived(OpenResponse),
    /// The transport endpoint closed or failed.
    TransportClosed,
}

/// Actions the engine must carry out after an event or tick.
#[derive(Debug, Clone)]
pub enum ConnAction {
    /// Transmit a hello announcement.
    SendHello(Hello),
    /// Transmit an acknowledge reply.
    SendAcknowledge(Acknowledge),
    /// Transmit a reverse-hello invitation.
    SendReverseHello(ReverseHello),
    /// Transmit an open-secure-channel request.
    SendOpenRequest(OpenRequest),
    /// Transmit an open-secure-channel response.
    SendOpenResponse(OpenResponse),
    /// The channel reached the established state.
    Established {
        /// Assigned channel identifier.
        channel_id: u32,
    },
    /// A renewal completed; the new token is active.
    TokenRenewed {
        /// Identifier of the fresh token.
        token_id: u32,
    },
    /// The connection is finished. The caller cascades dependent state and
    /// completes the close.
    Close {
        /// Reason propagated to sessions and pending requests.
        reason: CloseReason,
    },
}

/// One secured connection and everything scoped to it.
#[derive(Debug)]
pub struct SecureConnection {
    handle: ConnectionHandle,
    state: ConnState,
    pub(crate) config: Arc<ConnectionConfig>,
    pub(crate) channel_id: u32,
    pub(crate) tokens: TokenSet,
    pub(crate) limits: ChunkLimits,
    pub(crate) send_seq: Sequencer,
    pub(crate) assembly: ChunkAssembly,
    pub(crate) frames: FrameBuffer,
    pub(crate) pending: PendingTracker,
    pub(crate) lockout_until: Option<Instant>,
    // Set once the engine has failed this connection's dependents, so a later
    // release does not cascade or notify a second time.
    pub(crate) cascaded: bool,
    created_at: Instant,
    state_entered_at: Instant,
    pub(crate) last_activity: Instant,
}

impl SecureConnection {
    fn new(
        handle: ConnectionHandle,
        config: Arc<ConnectionConfig>,
        channel_id: u32,
        limits: ChunkLimits,
        max_pending: u32,
        now: Instant,
    ) -> Self {
        Self {
            handle,
            state: ConnState::Connecting,
            config,
            channel_id,
            tokens: TokenSet::new(channel_id),
            limits,
            send_seq: Sequencer::new(),
            assembly: ChunkAssembly::new(),
            frames: FrameBuffer::new(limits.max_chunk_size),
            pending: PendingTracker::new(max_pending),
            lockout_until: None,
            cascaded: false,
            created_at: now,
            state_entered_at: now,
            last_activity: now,
        }
    }

    /// Handle this connection is addressed by.
    pub fn handle(&self) -> ConnectionHandle {
        self.handle
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnState {
        self.state
    }

    /// Assigned channel identifier; zero until established on the initiator.
    pub fn channel_id(&self) -> u32 {
        self.channel_id
    }

    /// True once application traffic may flow.
    pub fn is_established(&self) -> bool {
        matches!(self.state, ConnState::Established | ConnState::Renewing)
    }

    /// Instant the slot was claimed.
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    fn enter(&mut self, state: ConnState, now: Instant) {
        debug!(
            slot = self.handle.slot,
            channel_id = self.channel_id,
            from = ?self.state,
            to = ?state,
            "connection state change"
        );
        self.state = state;
        self.state_entered_at = now;
    }

    fn adopt_limits(&mut self, negotiated: ChunkLimits) {
        self.limits = negotiated;
        self.frames.set_max_chunk_size(negotiated.max_chunk_size);
    }

    fn announce(&self) -> Hello {
        Hello {
            max_chunk_size: self.limits.max_chunk_size as u32,
            max_chunk_count: self.limits.max_chunk_count,
            max_message_size: self.limits.max_message_size as u32,
        }
    }

    fn open_request(&self, renew: bool) -> OpenRequest {
        OpenRequest {
            offer: PolicyOffer {
                policy_id: self.config.policy_id.clone(),
                mode: self.config.mode,
                certificate: self.config.local_certificate.clone(),
            },
            requested_lifetime: self.config.requested_token_lifetime,
            renew,
        }
    }
}

/// Result of opening a slot.
#[derive(Debug)]
pub struct Opened {
    /// Handle of the new connection.
    pub handle: ConnectionHandle,
    /// A stalled connection evicted to make room, if any. Its dependent state
    /// still needs to be failed by the caller.
    pub evicted: Option<SecureConnection>,
}

/// Result of starting a close.
#[derive(Debug)]
pub struct CloseOutcome {
    /// A close-channel notice must be transmitted before teardown.
    pub notice: bool,
    /// The removed connection when the slot was freed immediately; `None`
    /// while the connection drains in place.
    pub removed: Option<SecureConnection>,
}

/// Actions and releases produced by one periodic tick.
#[derive(Debug, Default)]
pub struct TickOutcome {
    /// Actions to carry out, per connection.
    pub actions: Vec<(ConnectionHandle, ConnAction)>,
    /// Closing connections whose drain deadline passed; their slots are free.
    pub released: Vec<SecureConnection>,
}

// Zero means "no preference"; any other announcement must leave payload room
// after the fixed header, or every later encode would be unable to make
// progress.
fn usable_chunk_size(announced: usize) -> bool {
    announced == 0 || announced > CHUNK_HDR_LEN
}

/// Bounded arena of connection slots.
#[derive(Debug)]
pub struct SlotTable {
    slots: Vec<Option<SecureConnection>>,
    generations: Vec<u32>,
    primary: u32,
    connection_timeout: Duration,
    min_token_lifetime: Duration,
    limits: ChunkLimits,
    max_pending: u32,
    next_channel_id: u32,
}

impl SlotTable {
    /// Builds the table from the validated configuration.
    pub fn new(config: &Config) -> Self {
        let primary = config.channels.max_connections;
        let capacity = (primary + config.channels.buffered_slots()) as usize;
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            generations: vec![0; capacity],
            primary,
            connection_timeout: config.channels.connection_timeout(),
            min_token_lifetime: config.channels.min_token_lifetime(),
            limits: config.chunk_limits(),
            max_pending: config.requests.max_pending,
            // Start at a random point so identifiers do not restart at 1
            // across process restarts.
            next_channel_id: rand::random::<u32>() | 1,
        }
    }

    /// Connections not yet draining toward close.
    pub fn live(&self) -> u32 {
        self.slots
            .iter()
            .flatten()
            .filter(|conn| conn.state != ConnState::Closing)
            .count() as u32
    }

    /// Handles of every occupied slot.
    pub fn handles(&self) -> Vec<ConnectionHandle> {
        self.slots
            .iter()
            .flatten()
            .map(|conn| conn.handle)
            .collect()
    }

    /// Resolves a handle, rejecting stale generations.
    pub fn get(&self, handle: ConnectionHandle) -> Result<&SecureConnection, StaleHandle> {
        self.slots
            .get(handle.slot as usize)
            .and_then(|slot| slot.as_ref())
            .filter(|conn| conn.handle.generation == handle.generation)
            .ok_or(StaleHandle)
    }

    /// Mutable counterpart of [`SlotTable::get`].
    pub fn get_mut(
        &mut self,
        handle: ConnectionHandle,
    ) -> Result<&mut SecureConnection, StaleHandle> {
        self.slots
            .get_mut(handle.slot as usize)
            .and_then(|slot| slot.as_mut())
            .filter(|conn| conn.handle.generation == handle.generation)
            .ok_or(StaleHandle)
    }

    /// Claims a slot for a new connection. When the primary allocation is full
    /// a connection stuck in establishment past its deadline may be evicted to
    /// make room; otherwise the open is refused.
    pub fn open(&mut self, config: Arc<ConnectionConfig>, now: Instant) -> Result<Opened, OpenError> {
        let mut evicted = None;
        if self.live() >= self.primary {
            match self.take_overdue_establishment(now) {
                Some(victim) => {
                    warn!(
                        channel_id = victim.channel_id,
                        "evicting stalled connection to admit a new one"
                    );
                    evicted = Some(victim);
                }
                None => return Err(OpenError::SlotsExhausted { max: self.primary }),
            }
        }

        let Some(index) = self.free_index() else {
            return Err(OpenError::SlotsExhausted { max: self.primary });
        };

        let handle = ConnectionHandle {
            slot: index as u32,
            generation: self.generations[index],
        };
        // Acceptors assign the channel identifier up front; initiators learn
        // theirs from the open response.
        let channel_id = match config.role {
            Role::Acceptor => self.allocate_channel_id(),
            Role::Initiator => 0,
        };
        let conn = SecureConnection::new(
            handle,
            config,
            channel_id,
            self.limits,
            self.max_pending,
            now,
        );
        self.slots[index] = Some(conn);
        Ok(Opened { handle, evicted })
    }

    fn free_index(&mut self) -> Option<usize> {
        if let Some(index) = self.slots.iter().position(Option::is_none) {
            return Some(index);
        }
        // All physical slots occupied: drop the longest-draining connection.
        let index = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| {
                slot.as_ref()
                    .is_some_and(|conn| conn.state == ConnState::Closing)
            })
            .min_by_key(|(_, slot)| slot.as_ref().map(|conn| conn.state_entered_at))?
            .0;
        self.slots[index] = None;
        self.generations[index] = self.generations[index].wrapping_add(1);
        Some(index)
    }

    // Removes the connection longest past its establishment deadline, if any.
    fn take_overdue_establishment(&mut self, now: Instant) -> Option<SecureConnection> {
        let deadline = self.connection_timeout;
        let index = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| {
                slot.as_ref().is_some_and(|conn| {
                    matches!(conn.state, ConnState::Connecting | ConnState::Negotiating)
                        && now.duration_since(conn.state_entered_at) >= deadline
                })
            })
            .min_by_key(|(_, slot)| slot.as_ref().map(|conn| conn.state_entered_at))?
            .0;
        let conn = self.slots[index].take();
        self.generations[index] = self.generations[index].wrapping_add(1);
        conn
    }

    fn allocate_channel_id(&mut self) -> u32 {
        loop {
            let id = self.next_channel_id;
            self.next_channel_id = self.next_channel_id.checked_add(1).unwrap_or(1);
            let in_use = self
                .slots
                .iter()
                .flatten()
                .any(|conn| conn.channel_id == id);
            if id != 0 && !in_use {
                return id;
            }
        }
    }

    /// Feeds one event to a connection's state machine.
    pub fn handle_event(
        &mut self,
        handle: ConnectionHandle,
        event: ConnEvent,
        now: Instant,
    ) -> Result<Vec<ConnAction>, StaleHandle> {
        let min_lifetime = self.min_token_lifetime;
        let conn = self.get_mut(handle)?;
        conn.last_activity = now;

        let actions = match (conn.state, event) {
            // Establishment: the side that dialed speaks first.
            (ConnState::Connecting, ConnEvent::TransportConnected) => {
                match (conn.config.role, conn.config.reverse) {
                    (Role::Initiator, false) => vec![ConnAction::SendHello(conn.announce())],
                    (Role::Acceptor, true) => {
                        vec![ConnAction::SendReverseHello(ReverseHello {
                            endpoint: conn.config.endpoint.clone(),
                        })]
                    }
                    // Waiting for the peer's hello or reverse-hello.
                    (Role::Acceptor, false) | (Role::Initiator, true) => vec![],
                }
            }
            (ConnState::Connecting, ConnEvent::ReverseHelloReceived(_))
                if conn.config.role == Role::Initiator && conn.config.reverse =>
            {
                vec![ConnAction::SendHello(conn.announce())]
            }
            (ConnState::Connecting, ConnEvent::HelloReceived(hello))
                if conn.config.role == Role::Acceptor =>
            {
                let peer = ChunkLimits {
                    max_chunk_size: hello.max_chunk_size as usize,
                    max_chunk_count: hello.max_chunk_count,
                    max_message_size: hello.max_message_size as usize,
                };
                if !usable_chunk_size(peer.max_chunk_size) {
                    warn!(
                        channel_id = conn.channel_id,
                        announced = peer.max_chunk_size,
                        "peer announced an unusable chunk size"
                    );
                    vec![ConnAction::Close {
                        reason: CloseReason::ProtocolViolation,
                    }]
                } else {
                    conn.adopt_limits(conn.limits.negotiate(&peer));
                    conn.enter(ConnState::Negotiating, now);
                    vec![ConnAction::SendAcknowledge(Acknowledge {
                        max_chunk_size: conn.limits.max_chunk_size as u32,
                        max_chunk_count: conn.limits.max_chunk_count,
                        max_message_size: conn.limits.max_message_size as u32,
                    })]
                }
            }
            (ConnState::Connecting, ConnEvent::AcknowledgeReceived(ack))
                if conn.config.role == Role::Initiator =>
            {
                let revised = ChunkLimits {
                    max_chunk_size: ack.max_chunk_size as usize,
                    max_chunk_count: ack.max_chunk_count,
                    max_message_size: ack.max_message_size as usize,
                };
                if !usable_chunk_size(revised.max_chunk_size) {
                    warn!(
                        channel_id = conn.channel_id,
                        announced = revised.max_chunk_size,
                        "peer announced an unusable chunk size"
                    );
                    vec![ConnAction::Close {
                        reason: CloseReason::ProtocolViolation,
                    }]
                } else {
                    conn.adopt_limits(conn.limits.negotiate(&revised));
                    conn.enter(ConnState::Negotiating, now);
                    vec![ConnAction::SendOpenRequest(conn.open_request(false))]
                }
            }

            // Token issue: acceptor answers the first open request.
            (ConnState::Negotiating, ConnEvent::OpenRequestReceived(request))
                if conn.config.role == Role::Acceptor && !request.renew =>
            {
                let token = conn
                    .tokens
                    .issue(request.requested_lifetime, min_lifetime, now);
                let response = OpenResponse {
                    channel_id: conn.channel_id,
                    token_id: token.token_id,
                    revised_lifetime: token.revised_lifetime,
                };
                conn.enter(ConnState::Established, now);
                vec![
                    ConnAction::SendOpenResponse(response),
                    ConnAction::Established {
                        channel_id: conn.channel_id,
                    },
                ]
            }
            (ConnState::Negotiating, ConnEvent::OpenResponseReceived(response))
                if conn.config.role == Role::Initiator =>
            {
                conn.channel_id = response.channel_id;
                conn.tokens = TokenSet::new(response.channel_id);
                conn.tokens
                    .install(response.token_id, response.revised_lifetime, now);
                conn.enter(ConnState::Established, now);
                vec![ConnAction::Established {
                    channel_id: response.channel_id,
                }]
            }

            // Renewal: acceptor side answers in place, initiator side waits in
            // Renewing after the tick issued its request.
            (ConnState::Established, ConnEvent::OpenRequestReceived(request))
                if conn.config.role == Role::Acceptor && request.renew =>
            {
                let token = conn
                    .tokens
                    .issue(request.requested_lifetime, min_lifetime, now);
                let response = OpenResponse {
                    channel_id: conn.channel_id,
                    token_id: token.token_id,
                    revised_lifetime: token.revised_lifetime,
                };
                vec![
                    ConnAction::SendOpenResponse(response),
                    ConnAction::TokenRenewed {
                        token_id: response.token_id,
                    },
                ]
            }
            (ConnState::Renewing, ConnEvent::OpenResponseReceived(response))
                if conn.config.role == Role::Initiator =>
            {
                conn.tokens
                    .install(response.token_id, response.revised_lifetime, now);
                conn.enter(ConnState::Established, now);
                vec![ConnAction::TokenRenewed {
                    token_id: response.token_id,
                }]
            }

            // Transport loss ends the channel from any state.
            (ConnState::Closing, ConnEvent::TransportClosed) => {
                vec![ConnAction::Close {
                    reason: CloseReason::Requested,
                }]
            }
            (ConnState::Connecting | ConnState::Negotiating, ConnEvent::TransportClosed) => {
                vec![ConnAction::Close {
                    reason: CloseReason::TransportFailed,
                }]
            }
            (_, ConnEvent::TransportClosed) => {
                vec![ConnAction::Close {
                    reason: CloseReason::ChannelLost,
                }]
            }

            // A draining connection absorbs stray events silently.
            (ConnState::Closing, event) => {
                debug!(channel_id = conn.channel_id, ?event, "event after close");
                vec![]
            }

            // Everything else is a handshake ordering violation.
            (state, event) => {
                warn!(
                    channel_id = conn.channel_id,
                    ?state,
                    ?event,
                    "protocol violation: unexpected handshake event"
                );
                vec![ConnAction::Close {
                    reason: CloseReason::ProtocolViolation,
                }]
            }
        };
        Ok(actions)
    }

    /// Starts teardown. An established initiator closing on request sends a
    /// close-channel notice first and drains in place, occupying a buffered
    /// slot until the transport confirms or the drain deadline passes; every
    /// other close frees the slot immediately. Closing a draining connection
    /// is a no-op.
    pub fn close(
        &mut self,
        handle: ConnectionHandle,
        reason: CloseReason,
        now: Instant,
    ) -> Result<CloseOutcome, StaleHandle> {
        let conn = self.get_mut(handle)?;
        if conn.state == ConnState::Closing {
            return Ok(CloseOutcome {
                notice: false,
                removed: None,
            });
        }

        let graceful = conn.is_established()
            && conn.config.role == Role::Initiator
            && reason == CloseReason::Requested;
        if graceful {
            conn.enter(ConnState::Closing, now);
            Ok(CloseOutcome {
                notice: true,
                removed: None,
            })
        } else {
            Ok(CloseOutcome {
                notice: false,
                removed: self.release(handle),
            })
        }
    }

    /// Frees a slot and invalidates outstanding handles to it. Returns the
    /// removed connection so the caller can fail its dependents.
    pub fn release(&mut self, handle: ConnectionHandle) -> Option<SecureConnection> {
        let index = handle.slot as usize;
        let occupied = self.slots.get(index)?.as_ref()?;
        if occupied.handle.generation != handle.generation {
            return None;
        }
        self.generations[index] = self.generations[index].wrapping_add(1);
        self.slots[index].take()
    }

    /// Drives every time-dependent transition from a single clock reading.
    pub fn tick(&mut self, now: Instant) -> TickOutcome {
        let mut outcome = TickOutcome::default();
        let deadline = self.connection_timeout;

        for index in 0..self.slots.len() {
            let Some(conn) = self.slots[index].as_mut() else {
                continue;
            };
            let handle = conn.handle;
            match conn.state {
                ConnState::Connecting | ConnState::Negotiating => {
                    if now.duration_since(conn.state_entered_at) >= deadline {
                        outcome.actions.push((
                            handle,
                            ConnAction::Close {
                                reason: CloseReason::ConnectionTimeout,
                            },
                        ));
                    }
                }
                ConnState::Established | ConnState::Renewing => {
                    conn.tokens.sweep(now);
                    if conn.tokens.current_defunct(now) {
                        outcome.actions.push((
                            handle,
                            ConnAction::Close {
                                reason: CloseReason::TokenExpired,
                            },
                        ));
                    } else if conn.state == ConnState::Established
                        && conn.config.role == Role::Initiator
                        && conn.tokens.renewal_due(now)
                    {
                        conn.enter(ConnState::Renewing, now);
                        let request = conn.open_request(true);
                        outcome
                            .actions
                            .push((handle, ConnAction::SendOpenRequest(request)));
                    }
                }
                ConnState::Closing => {
                    if now.duration_since(conn.state_entered_at) >= deadline {
                        if let Some(conn) = self.release(handle) {
                            outcome.released.push(conn);
                        }
                    }
                }
            }
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::SecurityMode;

    fn table(toml: &str) -> SlotTable {
        SlotTable::new(&Config::from_toml_str(toml).unwrap())
    }

    fn initiator() -> Arc<ConnectionConfig> {
        Arc::new(ConnectionConfig::new(Role::Initiator, "opc.tcp://peer:4840"))
    }

    fn acceptor() -> Arc<ConnectionConfig> {
        Arc::new(ConnectionConfig::new(Role::Acceptor, "opc.tcp://local:4840"))
    }

    #[test]
    fn capacity_refusal_and_recovery() {
        let mut table = table("[channels]\nmax_connections = 2\noveralloc_percent = 0\n");
        let now = Instant::now();

        let a = table.open(initiator(), now).unwrap().handle;
        let _b = table.open(initiator(), now).unwrap().handle;
        assert!(matches!(
            table.open(initiator(), now),
            Err(OpenError::SlotsExhausted { max: 2 })
        ));

        // An unestablished connection frees its slot synchronously on close.
        let outcome = table.close(a, CloseReason::Requested, now).unwrap();
        assert!(outcome.removed.is_some());
        assert!(!outcome.notice);
        assert!(table.open(initiator(), now).is_ok());
    }

    #[test]
    fn overdue_establishment_is_evicted_for_a_new_open() {
        let mut table =
            table("[channels]\nmax_connections = 1\nconnection_timeout_ms = 10000\n");
        let t0 = Instant::now();
        let _stuck = table.open(initiator(), t0).unwrap();

        // Before the deadline the open is refused outright.
        let early = t0 + Duration::from_millis(9_999);
        assert!(matches!(
            table.open(initiator(), early),
            Err(OpenError::SlotsExhausted { .. })
        ));

        let late = t0 + Duration::from_millis(10_000);
        let opened = table.open(initiator(), late).unwrap();
        assert!(opened.evicted.is_some());
        assert_eq!(table.live(), 1);
    }

    #[test]
    fn initiator_handshake_and_renewal() {
        let mut table = table("");
        let t0 = Instant::now();
        let h = table.open(initiator(), t0).unwrap().handle;

        let actions = table
            .handle_event(h, ConnEvent::TransportConnected, t0)
            .unwrap();
        assert!(matches!(actions[..], [ConnAction::SendHello(_)]));

        let ack = Acknowledge {
            max_chunk_size: 4096,
            max_chunk_count: 4,
            max_message_size: 8192,
        };
        let actions = table
            .handle_event(h, ConnEvent::AcknowledgeReceived(ack), t0)
            .unwrap();
        assert!(matches!(actions[..], [ConnAction::SendOpenRequest(_)]));
        assert_eq!(table.get(h).unwrap().state(), ConnState::Negotiating);
        assert_eq!(table.get(h).unwrap().limits.max_chunk_size, 4096);

        let response = OpenResponse {
            channel_id: 77,
            token_id: 5,
            revised_lifetime: Duration::from_millis(10_000),
        };
        let actions = table
            .handle_event(h, ConnEvent::OpenResponseReceived(response), t0)
            .unwrap();
        assert!(matches!(
            actions[..],
            [ConnAction::Established { channel_id: 77 }]
        ));
        assert_eq!(table.get(h).unwrap().channel_id(), 77);

        // Renewal fires at three quarters of the token lifetime.
        let renew_at = t0 + Duration::from_millis(7_500);
        let outcome = table.tick(renew_at);
        assert_eq!(outcome.actions.len(), 1);
        assert!(matches!(
            outcome.actions[0].1,
            ConnAction::SendOpenRequest(OpenRequest { renew: true, .. })
        ));
        assert_eq!(table.get(h).unwrap().state(), ConnState::Renewing);

        let renewed = OpenResponse {
            channel_id: 77,
            token_id: 6,
            revised_lifetime: Duration::from_millis(10_000),
        };
        let actions = table
            .handle_event(h, ConnEvent::OpenResponseReceived(renewed), renew_at)
            .unwrap();
        assert!(matches!(
            actions[..],
            [ConnAction::TokenRenewed { token_id: 6 }]
        ));
        assert_eq!(table.get(h).unwrap().state(), ConnState::Established);
        // Both tokens verify during the overlap window.
        let tokens = &table.get(h).unwrap().tokens;
        assert!(tokens.validate(5, renew_at).is_ok());
        assert!(tokens.validate(6, renew_at).is_ok());
    }

    #[test]
    fn undersized_limit_announcement_closes_the_handshake() {
        let mut table = table("");
        let t0 = Instant::now();

        // Acceptor side: a hello whose chunk size cannot carry any payload.
        let h = table.open(acceptor(), t0).unwrap().handle;
        table
            .handle_event(h, ConnEvent::TransportConnected, t0)
            .unwrap();
        let hello = Hello {
            max_chunk_size: 10,
            max_chunk_count: 0,
            max_message_size: 0,
        };
        let actions = table
            .handle_event(h, ConnEvent::HelloReceived(hello), t0)
            .unwrap();
        assert!(matches!(
            actions[..],
            [ConnAction::Close {
                reason: CloseReason::ProtocolViolation
            }]
        ));

        // Initiator side: the same bound arriving in an acknowledge.
        let h = table.open(initiator(), t0).unwrap().handle;
        table
            .handle_event(h, ConnEvent::TransportConnected, t0)
            .unwrap();
        let ack = Acknowledge {
            max_chunk_size: 10,
            max_chunk_count: 0,
            max_message_size: 0,
        };
        let actions = table
            .handle_event(h, ConnEvent::AcknowledgeReceived(ack), t0)
            .unwrap();
        assert!(matches!(
            actions[..],
            [ConnAction::Close {
                reason: CloseReason::ProtocolViolation
            }]
        ));
    }

    #[test]
    fn acceptor_handshake_issues_token() {
        let mut table = table("");
        let t0 = Instant::now();
        let h = table.open(acceptor(), t0).unwrap().handle;
        let channel_id = table.get(h).unwrap().channel_id();
        assert_ne!(channel_id, 0);

        table
            .handle_event(h, ConnEvent::TransportConnected, t0)
            .unwrap();
        let hello = Hello {
            max_chunk_size: 4096,
            max_chunk_count: 0, // no preference
            max_message_size: 8192,
        };
        let actions = table
            .handle_event(h, ConnEvent::HelloReceived(hello), t0)
            .unwrap();
        match &actions[..] {
            [ConnAction::SendAcknowledge(ack)] => {
                assert_eq!(ack.max_chunk_size, 4096);
                assert_eq!(ack.max_chunk_count, 12); // local default kept
            }
            other => panic!("unexpected {other:?}"),
        }

        let request = OpenRequest {
            offer: PolicyOffer {
                policy_id: "None".into(),
                mode: SecurityMode::None,
                certificate: None,
            },
            requested_lifetime: Duration::from_millis(1),
            renew: false,
        };
        let actions = table
            .handle_event(h, ConnEvent::OpenRequestReceived(request), t0)
            .unwrap();
        match &actions[..] {
            [ConnAction::SendOpenResponse(response), ConnAction::Established { .. }] => {
                assert_eq!(response.channel_id, channel_id);
                // Requested lifetime clamped to the configured floor.
                assert_eq!(response.revised_lifetime, Duration::from_millis(10_000));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(table.get(h).unwrap().is_established());
    }

    #[test]
    fn out_of_order_handshake_is_a_protocol_violation() {
        let mut table = table("");
        let now = Instant::now();
        let h = table.open(initiator(), now).unwrap().handle;

        let request = OpenRequest {
            offer: PolicyOffer {
                policy_id: "None".into(),
                mode: SecurityMode::None,
                certificate: None,
            },
            requested_lifetime: Duration::from_secs(600),
            renew: false,
        };
        let actions = table
            .handle_event(h, ConnEvent::OpenRequestReceived(request), now)
            .unwrap();
        assert!(matches!(
            actions[..],
            [ConnAction::Close {
                reason: CloseReason::ProtocolViolation
            }]
        ));
    }

    #[test]
    fn establishment_deadline_enforced_by_tick() {
        let mut table = table("[channels]\nconnection_timeout_ms = 10000\n");
        let t0 = Instant::now();
        let h = table.open(initiator(), t0).unwrap().handle;

        assert!(table.tick(t0 + Duration::from_millis(9_999)).actions.is_empty());
        let outcome = table.tick(t0 + Duration::from_millis(10_000));
        assert!(matches!(
            outcome.actions[..],
            [(
                got,
                ConnAction::Close {
                    reason: CloseReason::ConnectionTimeout
                }
            )] if got == h
        ));
    }

    #[test]
    fn graceful_close_drains_in_place() {
        let mut table = table("[channels]\nconnection_timeout_ms = 10000\n");
        let t0 = Instant::now();
        let h = table.open(initiator(), t0).unwrap().handle;
        table
            .handle_event(h, ConnEvent::TransportConnected, t0)
            .unwrap();
        table
            .handle_event(
                h,
                ConnEvent::AcknowledgeReceived(Acknowledge {
                    max_chunk_size: 0,
                    max_chunk_count: 0,
                    max_message_size: 0,
                }),
                t0,
            )
            .unwrap();
        let response = OpenResponse {
            channel_id: 5,
            token_id: 1,
            revised_lifetime: Duration::from_secs(3600),
        };
        table
            .handle_event(h, ConnEvent::OpenResponseReceived(response), t0)
            .unwrap();

        let outcome = table.close(h, CloseReason::Requested, t0).unwrap();
        assert!(outcome.notice);
        assert!(outcome.removed.is_none());
        assert_eq!(table.get(h).unwrap().state(), ConnState::Closing);
        assert_eq!(table.live(), 0);

        // Transport confirmation finishes the drain.
        let actions = table
            .handle_event(h, ConnEvent::TransportClosed, t0)
            .unwrap();
        assert!(matches!(
            actions[..],
            [ConnAction::Close {
                reason: CloseReason::Requested
            }]
        ));

        // Without confirmation the drain deadline frees the slot instead.
        let released = table.tick(t0 + Duration::from_millis(10_000)).released;
        assert_eq!(released.len(), 1);
        assert!(table.get(h).is_err());
    }

    #[test]
    fn released_handle_goes_stale() {
        let mut table = table("");
        let now = Instant::now();
        let h = table.open(initiator(), now).unwrap().handle;
        assert!(table.release(h).is_some());
        assert!(table.get(h).is_err());
        assert!(table.release(h).is_none());

        // A new connection in the same slot does not answer to the old handle.
        let h2 = table.open(initiator(), now).unwrap().handle;
        assert_eq!(h.slot(), h2.slot());
        assert!(table.get(h).is_err());
        assert!(table.get(h2).is_ok());
    }
}
