#![cfg(feature = "stack-api")]

// Channel engine: the single-owner core tying the slot table, token store,
// chunk codec, pending tracker, and session table together. Every operation
// and the periodic tick run on one logical worker; callers interact through
// typed inputs and carry out the returned outputs (frames to transmit,
// handshake messages, notifications).

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    api::{
        Authenticator, CloseReason, ConnectionConfig, Credentials, PolicyError, Role,
        SecurityMode, SecurityPolicy,
    },
    chunk::{self, Accepted, ChunkError, Message, MessageKind},
    config::Config,
    metrics::{Metrics, MetricsError},
    pending::{PendingError, ResponseSlot},
    session::{Activation, SessionError, SessionId, SessionTable},
    slots::{
        Acknowledge, ConnAction, ConnEvent, ConnState, ConnectionHandle, Hello, OpenError,
        OpenRequest, OpenResponse, ReverseHello, SlotTable, StaleHandle,
    },
    token::TokenError,
};

/// Errors surfaced by engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Open(#[from] OpenError),
    #[error(transparent)]
    Chunk(#[from] ChunkError),
    #[error(transparent)]
    Token(#[from] TokenError),
    #[error(transparent)]
    Pending(#[from] PendingError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Policy(#[from] PolicyError),
    #[error(transparent)]
    Stale(#[from] StaleHandle),
    /// The operation needs an established channel.
    #[error("channel not established")]
    NotEstablished,
}

/// Typed handshake message for the integrator's transport layer to deliver.
/// The handshake wire encoding is owned by that layer, not the engine.
#[derive(Debug, Clone)]
pub enum HandshakeOut {
    /// Limit announcement.
    Hello(Hello),
    /// Revised limits reply.
    Acknowledge(Acknowledge),
    /// Reverse-connection invitation.
    ReverseHello(ReverseHello),
    /// Open-secure-channel request.
    OpenRequest(OpenRequest),
    /// Open-secure-channel response.
    OpenResponse(OpenResponse),
    /// Close-channel notice; the peer should drop the transport.
    CloseChannel,
}

/// State changes surfaced to the session/service layer.
#[derive(Debug, Clone)]
pub enum Notification {
    /// A channel finished its handshake.
    ChannelEstablished {
        /// Handle of the connection.
        handle: ConnectionHandle,
        /// Assigned channel identifier.
        channel_id: u32,
    },
    /// A channel closed; dependents were already cascaded.
    ChannelClosed {
        /// Handle of the connection (now stale).
        handle: ConnectionHandle,
        /// Channel identifier it carried.
        channel_id: u32,
        /// Reason for the close.
        reason: CloseReason,
    },
    /// No live connection remains (client mode only).
    LastConnectionLost,
    /// A token renewal completed.
    TokenRenewed {
        /// Handle of the connection.
        handle: ConnectionHandle,
        /// Identifier of the fresh token.
        token_id: u32,
    },
    /// A complete inbound message that matched no pending request, delivered
    /// on acceptor channels for the service layer to answer.
    MessageReceived {
        /// Handle of the connection.
        handle: ConnectionHandle,
        /// Reassembled message.
        message: Message,
    },
    /// A session left the table.
    SessionClosed(crate::session::ClosedSession),
    /// A closing session released its subscription to the external
    /// subscription collaborator.
    SubscriptionReleased {
        /// Owning session.
        session: SessionId,
        /// Released subscription identifier.
        subscription: u32,
    },
    /// A reverse connection should be re-dialed with this config.
    ReverseRetry {
        /// Config of the lost reverse connection.
        config: Arc<ConnectionConfig>,
    },
}

/// Work produced by one engine operation, in order.
#[derive(Debug, Clone)]
pub enum Output {
    /// Chunk frames to write to the connection's transport.
    Transmit {
        /// Target connection.
        handle: ConnectionHandle,
        /// Frames in transmission order.
        frames: Vec<Bytes>,
    },
    /// Handshake message to deliver out of band.
    Handshake {
        /// Target connection.
        handle: ConnectionHandle,
        /// The message.
        message: HandshakeOut,
    },
    /// Notification for the session/service layer.
    Notify(Notification),
}

/// The channel-management core. One instance owns all mutable stack state.
pub struct ChannelEngine {
    config: Arc<Config>,
    slots: SlotTable,
    sessions: SessionTable,
    policy: Arc<dyn SecurityPolicy>,
    auth: Arc<dyn Authenticator>,
    metrics: Metrics,
    client_only: bool,
    reverse_retries: Vec<(Arc<ConnectionConfig>, Instant)>,
}

impl ChannelEngine {
    /// Builds an engine from a validated configuration, a security-policy
    /// provider, and an authenticator.
    pub fn new(
        config: Arc<Config>,
        policy: Arc<dyn SecurityPolicy>,
        auth: Arc<dyn Authenticator>,
    ) -> Result<Self, MetricsError> {
        Ok(Self {
            slots: SlotTable::new(&config),
            sessions: SessionTable::new(&config.sessions),
            policy,
            auth,
            metrics: Metrics::new()?,
            config,
            client_only: false,
            reverse_retries: Vec::new(),
        })
    }

    /// Marks this endpoint as client-only: losing the last live connection
    /// emits [`Notification::LastConnectionLost`].
    pub fn client_only(mut self) -> Self {
        self.client_only = true;
        self
    }

    /// Stack metrics registry.
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Connections not yet draining toward close.
    pub fn live_connections(&self) -> u32 {
        self.slots.live()
    }

    /// Claims a connection slot. The transport layer dials (or accepts) and
    /// reports back through [`ChannelEngine::connection_event`]; establishment
    /// failures surface as [`Notification::ChannelClosed`].
    pub fn open_channel(
        &mut self,
        config: Arc<ConnectionConfig>,
        now: Instant,
    ) -> Result<(ConnectionHandle, Vec<Output>), EngineError> {
        let opened = self.slots.open(config, now)?;
        self.metrics.connections_opened.inc();

        let mut outputs = Vec::new();
        if let Some(mut evicted) = opened.evicted {
            self.metrics.connections_evicted.inc();
            self.metrics.connections_closed.inc();
            let failed = evicted.pending.fail_all(CloseReason::Reclaimed);
            self.metrics.pending_requests.sub(failed as i64);
            self.cascade_sessions(evicted.channel_id(), &mut outputs);
            outputs.push(Output::Notify(Notification::ChannelClosed {
                handle: evicted.handle(),
                channel_id: evicted.channel_id(),
                reason: CloseReason::Reclaimed,
            }));
        }
        self.metrics.connections_live.set(self.slots.live() as i64);
        Ok((opened.handle, outputs))
    }

    /// Feeds one connection-level event to the handshake state machine.
    pub fn connection_event(
        &mut self,
        handle: ConnectionHandle,
        event: ConnEvent,
        now: Instant,
    ) -> Result<Vec<Output>, EngineError> {
        let mut outputs = Vec::new();

        // Policy compatibility is checked before the state machine sees the
        // request; an incompatible offer closes the channel.
        if let ConnEvent::OpenRequestReceived(request) = &event {
            if let Err(err) = self.policy.negotiate(&request.offer) {
                self.slots.get(handle)?;
                warn!(%err, offered = %request.offer.policy_id, "security policy rejected");
                self.shutdown(handle, CloseReason::NegotiationFailed, now, &mut outputs);
                return Ok(outputs);
            }
        }

        let actions = self.slots.handle_event(handle, event, now)?;
        self.apply_actions(handle, actions, now, &mut outputs);
        Ok(outputs)
    }

    /// Closes a channel, cancelling its pending requests and sessions
    /// synchronously within this call.
    pub fn close_channel(
        &mut self,
        handle: ConnectionHandle,
        reason: CloseReason,
        now: Instant,
    ) -> Result<Vec<Output>, EngineError> {
        // Closing an already-draining channel is a no-op; drain completion
        // comes from the transport or the tick deadline.
        if self.slots.get(handle)?.state() == ConnState::Closing {
            return Ok(vec![]);
        }
        let mut outputs = Vec::new();
        self.shutdown(handle, reason, now, &mut outputs);
        Ok(outputs)
    }

    /// Consumes raw transport bytes: frames are delimited, chunks verified and
    /// reassembled, and complete messages routed to pending requests or the
    /// service layer. Any codec violation closes the channel.
    pub fn bytes_received(
        &mut self,
        handle: ConnectionHandle,
        bytes: &[u8],
        now: Instant,
    ) -> Result<Vec<Output>, EngineError> {
        let mut outputs = Vec::new();
        let mut completed: Vec<(Message, u32)> = Vec::new();
        let mut fatal = None;

        let conn = self.slots.get_mut(handle)?;
        if conn.state() == ConnState::Closing {
            // In-flight bytes racing the close notice must not cut the drain
            // short; the slot machine likewise absorbs stray events here.
            debug!(channel_id = conn.channel_id(), "bytes while draining discarded");
            return Ok(outputs);
        }
        if !conn.is_established() {
            warn!(channel_id = conn.channel_id(), "bytes before establishment");
            self.shutdown(handle, CloseReason::ProtocolViolation, now, &mut outputs);
            return Ok(outputs);
        }
        conn.last_activity = now;
        conn.frames.push(bytes);

        loop {
            let frame = match conn.frames.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(err) => {
                    warn!(%err, "framing violation");
                    fatal = Some(CloseReason::ProtocolViolation);
                    break;
                }
            };
            let (header, body) = match chunk::split_frame(&frame) {
                Ok(parts) => parts,
                Err(err) => {
                    warn!(%err, "malformed chunk");
                    fatal = Some(CloseReason::ProtocolViolation);
                    break;
                }
            };
            if header.kind != MessageKind::Message {
                warn!(kind = ?header.kind, "unexpected chunk kind on established channel");
                fatal = Some(CloseReason::ProtocolViolation);
                break;
            }
            if let Err(err) = conn.tokens.validate(header.token_id, now) {
                self.metrics.token_validation_failures.inc();
                warn!(%err, "chunk rejected");
                fatal = Some(match err {
                    TokenError::TokenExpired(_) => CloseReason::TokenExpired,
                    TokenError::TokenUnknown(_) => CloseReason::ProtocolViolation,
                });
                break;
            }
            match conn.assembly.accept(&header, body, &conn.limits) {
                Ok(Accepted::Complete(message)) => {
                    self.metrics.messages_reassembled.inc();
                    completed.push((message, header.token_id));
                }
                Ok(Accepted::Incomplete) => {}
                Ok(Accepted::Aborted { request_id }) => {
                    debug!(request_id, "peer aborted in-progress message");
                }
                Err(err) => {
                    if matches!(err, ChunkError::SequenceGap { .. }) {
                        self.metrics.sequence_gaps.inc();
                    }
                    warn!(%err, "chunk rejected");
                    fatal = Some(CloseReason::ProtocolViolation);
                    break;
                }
            }
        }

        if let Some(reason) = fatal {
            self.shutdown(handle, reason, now, &mut outputs);
            return Ok(outputs);
        }

        for (message, token_id) in completed {
            let message = match self.unsecure(message, token_id) {
                Ok(message) => message,
                Err(err) => {
                    warn!(%err, "message security check failed");
                    self.shutdown(handle, CloseReason::ProtocolViolation, now, &mut outputs);
                    return Ok(outputs);
                }
            };
            let conn = self.slots.get_mut(handle)?;
            if conn.pending.contains(message.request_id) {
                conn.pending.complete(message.request_id, message);
                self.metrics.pending_requests.sub(1);
            } else if conn.config.role == Role::Acceptor {
                outputs.push(Output::Notify(Notification::MessageReceived { handle, message }));
            } else {
                self.metrics.unmatched_responses.inc();
                debug!(request_id = message.request_id, "unmatched response dropped");
            }
        }
        Ok(outputs)
    }

    /// Sends a request on an established channel and returns its id together
    /// with the slot the response (or timeout) resolves into.
    pub fn send_request(
        &mut self,
        handle: ConnectionHandle,
        payload: Bytes,
        now: Instant,
    ) -> Result<(u32, ResponseSlot, Vec<Output>), EngineError> {
        let timeout = self.config.requests.timeout();
        let token_id = self.current_token(handle)?;
        let secured = self.secure(&payload, token_id)?;

        let conn = self.slots.get_mut(handle)?;
        let (request_id, slot) = conn.pending.begin(now, timeout)?;
        let frames = match chunk::encode_message(
            &mut conn.send_seq,
            MessageKind::Message,
            conn.channel_id,
            token_id,
            request_id,
            &secured,
            &conn.limits,
        ) {
            Ok(frames) => frames,
            Err(err) => {
                conn.pending.cancel(request_id);
                return Err(err.into());
            }
        };
        conn.last_activity = now;
        self.metrics.chunks_sent.inc_by(frames.len() as u64);
        self.metrics.pending_requests.add(1);
        Ok((request_id, slot, vec![Output::Transmit { handle, frames }]))
    }

    /// Sends a response correlated to a previously received request, without
    /// registering a pending entry.
    pub fn send_response(
        &mut self,
        handle: ConnectionHandle,
        request_id: u32,
        payload: Bytes,
        now: Instant,
    ) -> Result<Vec<Output>, EngineError> {
        let token_id = self.current_token(handle)?;
        let secured = self.secure(&payload, token_id)?;

        let conn = self.slots.get_mut(handle)?;
        let frames = chunk::encode_message(
            &mut conn.send_seq,
            MessageKind::Message,
            conn.channel_id,
            token_id,
            request_id,
            &secured,
            &conn.limits,
        )?;
        conn.last_activity = now;
        self.metrics.chunks_sent.inc_by(frames.len() as u64);
        Ok(vec![Output::Transmit { handle, frames }])
    }

    /// Creates a session on an established channel, honoring the channel's
    /// authentication lockout.
    pub fn create_session(
        &mut self,
        handle: ConnectionHandle,
        requested_timeout: Option<Duration>,
        now: Instant,
    ) -> Result<(SessionId, Vec<Output>), EngineError> {
        let conn = self.slots.get_mut(handle)?;
        if !conn.is_established() {
            return Err(EngineError::NotEstablished);
        }
        if let Some(until) = conn.lockout_until {
            if now < until {
                return Err(SessionError::AuthLockedOut.into());
            }
            conn.lockout_until = None;
        }
        let channel_id = conn.channel_id;

        let (id, reclaimed) = self.sessions.create(channel_id, requested_timeout, now)?;
        self.metrics.sessions_created.inc();
        self.metrics.sessions_active.set(self.sessions.len() as i64);

        let mut outputs = Vec::new();
        if let Some(record) = reclaimed {
            if let Some(subscription) = record.subscription {
                outputs.push(Output::Notify(Notification::SubscriptionReleased {
                    session: record.id,
                    subscription,
                }));
            }
            outputs.push(Output::Notify(Notification::SessionClosed(record)));
        }
        Ok((id, outputs))
    }

    /// Applies one activation attempt against the configured authenticator.
    /// Exhausting the failure budget closes the session and locks the channel.
    pub fn activate_session(
        &mut self,
        handle: ConnectionHandle,
        session: SessionId,
        credentials: &Credentials,
        now: Instant,
    ) -> Result<(Activation, Vec<Output>), EngineError> {
        let conn = self.slots.get_mut(handle)?;
        if !conn.is_established() {
            return Err(EngineError::NotEstablished);
        }
        if let Some(until) = conn.lockout_until {
            if now < until {
                return Err(SessionError::AuthLockedOut.into());
            }
            conn.lockout_until = None;
        }
        let channel_id = conn.channel_id();
        if self.sessions.get(session)?.channel_id != channel_id {
            return Err(SessionError::UnknownSession(session).into());
        }

        let authenticated = self.auth.authenticate(credentials);
        if !authenticated {
            self.metrics.auth_failures.inc();
        }
        let activation = self.sessions.activate(session, authenticated, now)?;

        let mut outputs = Vec::new();
        if let Activation::LockedOut { closed } = &activation {
            if let Ok(conn) = self.slots.get_mut(handle) {
                conn.lockout_until = Some(now + self.config.sessions.lockout());
            }
            self.metrics.session_lockouts.inc();
            self.metrics.sessions_active.set(self.sessions.len() as i64);
            warn!(channel_id, session = %closed.id, "channel under session creation lockout");
            if let Some(subscription) = closed.subscription {
                outputs.push(Output::Notify(Notification::SubscriptionReleased {
                    session: closed.id,
                    subscription,
                }));
            }
            outputs.push(Output::Notify(Notification::SessionClosed(*closed)));
        }
        Ok((activation, outputs))
    }

    /// Closes one session explicitly.
    pub fn close_session(
        &mut self,
        session: SessionId,
        reason: CloseReason,
    ) -> Result<Vec<Output>, EngineError> {
        let record = self.sessions.close(session, reason)?;
        self.metrics.sessions_active.set(self.sessions.len() as i64);
        let mut outputs = Vec::new();
        if let Some(subscription) = record.subscription {
            outputs.push(Output::Notify(Notification::SubscriptionReleased {
                session: record.id,
                subscription,
            }));
        }
        outputs.push(Output::Notify(Notification::SessionClosed(record)));
        Ok(outputs)
    }

    /// Records activity on a session, deferring its expiry.
    pub fn touch_session(&mut self, session: SessionId, now: Instant) -> Result<(), EngineError> {
        Ok(self.sessions.touch(session, now)?)
    }

    /// Attaches a subscription to a session; each owns at most one.
    pub fn attach_subscription(
        &mut self,
        session: SessionId,
        subscription: u32,
    ) -> Result<(), EngineError> {
        Ok(self.sessions.attach_subscription(session, subscription)?)
    }

    /// Drives every deadline from one clock reading: establishment timeouts,
    /// token renewal and expiry, request timeouts, session expiry, and
    /// reverse-connection retries.
    pub fn tick(&mut self, now: Instant) -> Vec<Output> {
        let mut outputs = Vec::new();

        let outcome = self.slots.tick(now);
        for conn in outcome.released {
            debug!(channel_id = conn.channel_id(), "drained connection released");
        }
        for (handle, action) in outcome.actions {
            self.apply_actions(handle, vec![action], now, &mut outputs);
        }

        for handle in self.slots.handles() {
            if let Ok(conn) = self.slots.get_mut(handle) {
                let timed_out = conn.pending.sweep(now);
                if timed_out > 0 {
                    self.metrics.requests_timed_out.inc_by(timed_out as u64);
                    self.metrics.pending_requests.sub(timed_out as i64);
                }
            }
        }

        for record in self.sessions.expire_sweep(now) {
            self.metrics.sessions_expired.inc();
            if let Some(subscription) = record.subscription {
                outputs.push(Output::Notify(Notification::SubscriptionReleased {
                    session: record.id,
                    subscription,
                }));
            }
            outputs.push(Output::Notify(Notification::SessionClosed(record)));
        }

        let live: Vec<u32> = self
            .slots
            .handles()
            .into_iter()
            .filter_map(|handle| self.slots.get(handle).ok())
            .filter(|conn| conn.is_established())
            .map(|conn| conn.channel_id())
            .collect();
        for record in self.sessions.close_orphans(|channel_id| live.contains(&channel_id)) {
            if let Some(subscription) = record.subscription {
                outputs.push(Output::Notify(Notification::SubscriptionReleased {
                    session: record.id,
                    subscription,
                }));
            }
            outputs.push(Output::Notify(Notification::SessionClosed(record)));
        }
        self.metrics.sessions_active.set(self.sessions.len() as i64);

        let mut due = Vec::new();
        self.reverse_retries.retain(|(config, at)| {
            if *at <= now {
                due.push(config.clone());
                false
            } else {
                true
            }
        });
        for config in due {
            outputs.push(Output::Notify(Notification::ReverseRetry { config }));
        }
        outputs
    }

    fn current_token(&self, handle: ConnectionHandle) -> Result<u32, EngineError> {
        let conn = self.slots.get(handle)?;
        if !conn.is_established() {
            return Err(EngineError::NotEstablished);
        }
        conn.tokens
            .current()
            .map(|token| token.token_id)
            .ok_or(EngineError::NotEstablished)
    }

    // Message-level securing: sign over the clear payload, append the
    // signature, then encrypt the whole when the mode requires it.
    fn secure(&self, payload: &Bytes, token_id: u32) -> Result<Bytes, PolicyError> {
        match self.policy.mode() {
            SecurityMode::None => Ok(payload.clone()),
            SecurityMode::Sign => Ok(self.append_signature(payload, token_id)?),
            SecurityMode::SignAndEncrypt => {
                let signed = self.append_signature(payload, token_id)?;
                self.policy.encrypt(&signed, token_id)
            }
        }
    }

    fn append_signature(&self, payload: &Bytes, token_id: u32) -> Result<Bytes, PolicyError> {
        let signature = self.policy.sign(payload, token_id)?;
        let mut buf = BytesMut::with_capacity(payload.len() + signature.len());
        buf.extend_from_slice(payload);
        buf.extend_from_slice(&signature);
        Ok(buf.freeze())
    }

    fn unsecure(&self, message: Message, token_id: u32) -> Result<Message, PolicyError> {
        match self.policy.mode() {
            SecurityMode::None => Ok(message),
            SecurityMode::Sign => self.strip_signature(message, token_id),
            SecurityMode::SignAndEncrypt => {
                let clear = self.policy.decrypt(&message.payload, token_id)?;
                self.strip_signature(
                    Message {
                        payload: clear,
                        ..message
                    },
                    token_id,
                )
            }
        }
    }

    fn strip_signature(&self, message: Message, token_id: u32) -> Result<Message, PolicyError> {
        let signature_len = self.policy.signature_len();
        let mut payload = message.payload;
        if payload.len() < signature_len {
            return Err(PolicyError::Verification);
        }
        let signature = payload.split_off(payload.len() - signature_len);
        self.policy.verify(&payload, &signature, token_id)?;
        Ok(Message { payload, ..message })
    }

    fn apply_actions(
        &mut self,
        handle: ConnectionHandle,
        actions: Vec<ConnAction>,
        now: Instant,
        outputs: &mut Vec<Output>,
    ) {
        for action in actions {
            match action {
                ConnAction::SendHello(hello) => outputs.push(Output::Handshake {
                    handle,
                    message: HandshakeOut::Hello(hello),
                }),
                ConnAction::SendAcknowledge(ack) => outputs.push(Output::Handshake {
                    handle,
                    message: HandshakeOut::Acknowledge(ack),
                }),
                ConnAction::SendReverseHello(reverse) => outputs.push(Output::Handshake {
                    handle,
                    message: HandshakeOut::ReverseHello(reverse),
                }),
                ConnAction::SendOpenRequest(request) => outputs.push(Output::Handshake {
                    handle,
                    message: HandshakeOut::OpenRequest(request),
                }),
                ConnAction::SendOpenResponse(response) => outputs.push(Output::Handshake {
                    handle,
                    message: HandshakeOut::OpenResponse(response),
                }),
                ConnAction::Established { channel_id } => {
                    info!(channel_id, "secure channel established");
                    self.metrics.connections_live.set(self.slots.live() as i64);
                    outputs.push(Output::Notify(Notification::ChannelEstablished {
                        handle,
                        channel_id,
                    }));
                }
                ConnAction::TokenRenewed { token_id } => {
                    self.metrics.token_renewals.inc();
                    outputs.push(Output::Notify(Notification::TokenRenewed {
                        handle,
                        token_id,
                    }));
                }
                ConnAction::Close { reason } => self.shutdown(handle, reason, now, outputs),
            }
        }
    }

    // Single close path: cancel dependents synchronously, then free the slot
    // (or leave it draining behind a close-channel notice).
    fn shutdown(
        &mut self,
        handle: ConnectionHandle,
        reason: CloseReason,
        now: Instant,
        outputs: &mut Vec<Output>,
    ) {
        let Ok(conn) = self.slots.get_mut(handle) else {
            return;
        };
        if conn.cascaded {
            // Dependents were already failed; this is drain completion.
            self.slots.release(handle);
            self.metrics.connections_live.set(self.slots.live() as i64);
            return;
        }
        conn.cascaded = true;
        let channel_id = conn.channel_id;
        let config = conn.config.clone();
        let failed = conn.pending.fail_all(reason);
        self.metrics.pending_requests.sub(failed as i64);

        let Ok(outcome) = self.slots.close(handle, reason, now) else {
            return;
        };
        if outcome.notice {
            outputs.push(Output::Handshake {
                handle,
                message: HandshakeOut::CloseChannel,
            });
        }

        self.cascade_sessions(channel_id, outputs);
        self.metrics.connections_closed.inc();
        if reason == CloseReason::ProtocolViolation {
            self.metrics.protocol_violations.inc();
        }
        info!(channel_id, %reason, "channel closed");
        outputs.push(Output::Notify(Notification::ChannelClosed {
            handle,
            channel_id,
            reason,
        }));

        if config.reverse
            && matches!(
                reason,
                CloseReason::TransportFailed
                    | CloseReason::ConnectionTimeout
                    | CloseReason::NegotiationFailed
            )
        {
            let at = now + self.config.channels.reverse_retry_delay();
            self.reverse_retries.push((config, at));
        }

        self.metrics.connections_live.set(self.slots.live() as i64);
        if self.client_only && self.slots.live() == 0 {
            outputs.push(Output::Notify(Notification::LastConnectionLost));
        }
    }

    fn cascade_sessions(&mut self, channel_id: u32, outputs: &mut Vec<Output>) {
        for record in self
            .sessions
            .close_channel(channel_id, CloseReason::ChannelLost)
        {
            if let Some(subscription) = record.subscription {
                outputs.push(Output::Notify(Notification::SubscriptionReleased {
                    session: record.id,
                    subscription,
                }));
            }
            outputs.push(Output::Notify(Notification::SessionClosed(record)));
        }
        self.metrics.sessions_active.set(self.sessions.len() as i64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        pending::RequestOutcome,
        policy::{NullPolicy, StaticUserAuthenticator},
    };

    fn engine() -> ChannelEngine {
        ChannelEngine::new(
            Arc::new(Config::default()),
            Arc::new(NullPolicy),
            Arc::new(
                StaticUserAuthenticator::new()
                    .allow_anonymous()
                    .with_user("operator", &b"secret"[..]),
            ),
        )
        .unwrap()
    }

    fn handshake_out(outputs: &[Output]) -> HandshakeOut {
        outputs
            .iter()
            .find_map(|output| match output {
                Output::Handshake { message, .. } => Some(message.clone()),
                _ => None,
            })
            .expect("handshake output")
    }

    fn transmit_frames(outputs: &[Output]) -> Vec<Bytes> {
        outputs
            .iter()
            .find_map(|output| match output {
                Output::Transmit { frames, .. } => Some(frames.clone()),
                _ => None,
            })
            .expect("transmit output")
    }

    // Runs the typed handshake between a fresh initiator and acceptor pair.
    fn established_pair(
        now: Instant,
    ) -> (ChannelEngine, ChannelEngine, ConnectionHandle, ConnectionHandle) {
        let mut client = engine().client_only();
        let mut server = engine();

        let (ch, _) = client
            .open_channel(
                Arc::new(ConnectionConfig::new(Role::Initiator, "opc.tcp://peer:4840")),
                now,
            )
            .unwrap();
        let (sh, _) = server
            .open_channel(
                Arc::new(ConnectionConfig::new(Role::Acceptor, "opc.tcp://local:4840")),
                now,
            )
            .unwrap();
        server
            .connection_event(sh, ConnEvent::TransportConnected, now)
            .unwrap();

        let out = client
            .connection_event(ch, ConnEvent::TransportConnected, now)
            .unwrap();
        let HandshakeOut::Hello(hello) = handshake_out(&out) else {
            panic!("expected hello");
        };
        let out = server
            .connection_event(sh, ConnEvent::HelloReceived(hello), now)
            .unwrap();
        let HandshakeOut::Acknowledge(ack) = handshake_out(&out) else {
            panic!("expected acknowledge");
        };
        let out = client
            .connection_event(ch, ConnEvent::AcknowledgeReceived(ack), now)
            .unwrap();
        let HandshakeOut::OpenRequest(request) = handshake_out(&out) else {
            panic!("expected open request");
        };
        let out = server
            .connection_event(sh, ConnEvent::OpenRequestReceived(request), now)
            .unwrap();
        let HandshakeOut::OpenResponse(response) = handshake_out(&out) else {
            panic!("expected open response");
        };
        let out = client
            .connection_event(ch, ConnEvent::OpenResponseReceived(response), now)
            .unwrap();
        assert!(out.iter().any(|output| matches!(
            output,
            Output::Notify(Notification::ChannelEstablished { .. })
        )));
        (client, server, ch, sh)
    }

    #[test]
    fn request_response_round_trip() {
        let now = Instant::now();
        let (mut client, mut server, ch, sh) = established_pair(now);

        let (request_id, mut slot, out) = client
            .send_request(ch, Bytes::from_static(b"read temperature"), now)
            .unwrap();
        let mut inbound = Vec::new();
        for frame in transmit_frames(&out) {
            inbound.extend(server.bytes_received(sh, &frame, now).unwrap());
        }
        let message = inbound
            .iter()
            .find_map(|output| match output {
                Output::Notify(Notification::MessageReceived { message, .. }) => {
                    Some(message.clone())
                }
                _ => None,
            })
            .expect("request delivered to service layer");
        assert_eq!(&message.payload[..], b"read temperature");
        assert_eq!(message.request_id, request_id);

        let out = server
            .send_response(sh, message.request_id, Bytes::from_static(b"21.5"), now)
            .unwrap();
        for frame in transmit_frames(&out) {
            client.bytes_received(ch, &frame, now).unwrap();
        }
        match slot.try_take().unwrap() {
            Some(RequestOutcome::Response(response)) => {
                assert_eq!(&response.payload[..], b"21.5");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn negotiation_rejection_closes_channel() {
        let mut server = engine();
        let now = Instant::now();
        let (sh, _) = server
            .open_channel(
                Arc::new(ConnectionConfig::new(Role::Acceptor, "opc.tcp://local:4840")),
                now,
            )
            .unwrap();
        server
            .connection_event(sh, ConnEvent::TransportConnected, now)
            .unwrap();
        server
            .connection_event(
                sh,
                ConnEvent::HelloReceived(Hello {
                    max_chunk_size: 0,
                    max_chunk_count: 0,
                    max_message_size: 0,
                }),
                now,
            )
            .unwrap();

        let request = OpenRequest {
            offer: crate::api::PolicyOffer {
                policy_id: "Hmac-Sha256-Sign".into(),
                mode: SecurityMode::Sign,
                certificate: None,
            },
            requested_lifetime: Duration::from_secs(600),
            renew: false,
        };
        let out = server
            .connection_event(sh, ConnEvent::OpenRequestReceived(request), now)
            .unwrap();
        assert!(out.iter().any(|output| matches!(
            output,
            Output::Notify(Notification::ChannelClosed {
                reason: CloseReason::NegotiationFailed,
                ..
            })
        )));
        assert!(server.slots.get(sh).is_err());
    }

    #[test]
    fn close_cascades_sessions_and_pending() {
        let now = Instant::now();
        let (mut client, _server, ch, _sh) = established_pair(now);

        let (_, mut pending_slot, _) = client
            .send_request(ch, Bytes::from_static(b"in flight"), now)
            .unwrap();
        let (session, _) = client.create_session(ch, None, now).unwrap();
        client.attach_subscription(session, 8).unwrap();

        let out = client
            .close_channel(ch, CloseReason::Requested, now)
            .unwrap();

        // Established initiator sends the close notice and drains.
        assert!(matches!(handshake_out(&out), HandshakeOut::CloseChannel));
        assert!(out.iter().any(|output| matches!(
            output,
            Output::Notify(Notification::SubscriptionReleased { subscription: 8, .. })
        )));
        assert!(out.iter().any(|output| matches!(
            output,
            Output::Notify(Notification::SessionClosed(record))
                if record.reason == CloseReason::ChannelLost
        )));
        assert!(out.iter().any(|output| matches!(
            output,
            Output::Notify(Notification::ChannelClosed {
                reason: CloseReason::Requested,
                ..
            })
        )));
        assert!(out
            .iter()
            .any(|output| matches!(output, Output::Notify(Notification::LastConnectionLost))));
        assert!(matches!(
            pending_slot.try_take().unwrap(),
            Some(RequestOutcome::ChannelLost(CloseReason::Requested))
        ));

        // Closing again is a no-op, and drain completion frees the slot.
        assert!(client.close_channel(ch, CloseReason::Requested, now).unwrap().is_empty());
        client
            .connection_event(ch, ConnEvent::TransportClosed, now)
            .unwrap();
        assert!(client.slots.get(ch).is_err());
    }

    #[test]
    fn session_lockout_then_recovery() {
        let t0 = Instant::now();
        let (_client, mut server, _ch, sh) = established_pair(t0);

        let (session, _) = server.create_session(sh, None, t0).unwrap();
        let bad = Credentials::UserName {
            user: "operator".into(),
            secret: Bytes::from_static(b"wrong"),
        };
        for _ in 0..2 {
            let (activation, _) = server.activate_session(sh, session, &bad, t0).unwrap();
            assert!(matches!(activation, Activation::Failed { .. }));
        }
        let (activation, out) = server.activate_session(sh, session, &bad, t0).unwrap();
        assert!(matches!(activation, Activation::LockedOut { .. }));
        assert!(out.iter().any(|output| matches!(
            output,
            Output::Notify(Notification::SessionClosed(record))
                if record.reason == CloseReason::AuthLockout
        )));

        // Creation refused during the lockout, allowed after it elapses.
        assert!(matches!(
            server.create_session(sh, None, t0),
            Err(EngineError::Session(SessionError::AuthLockedOut))
        ));
        let after = t0 + Duration::from_millis(60_000);
        let (session, _) = server.create_session(sh, None, after).unwrap();
        let good = Credentials::UserName {
            user: "operator".into(),
            secret: Bytes::from_static(b"secret"),
        };
        let (activation, _) = server.activate_session(sh, session, &good, after).unwrap();
        assert!(matches!(activation, Activation::Active));
    }

    #[test]
    fn lockout_covers_every_session_on_the_channel() {
        let t0 = Instant::now();
        let (_client, mut server, _ch, sh) = established_pair(t0);

        let (first, _) = server.create_session(sh, None, t0).unwrap();
        let (second, _) = server.create_session(sh, None, t0).unwrap();
        let bad = Credentials::UserName {
            user: "operator".into(),
            secret: Bytes::from_static(b"wrong"),
        };
        for _ in 0..2 {
            server.activate_session(sh, first, &bad, t0).unwrap();
        }
        let (activation, _) = server.activate_session(sh, first, &bad, t0).unwrap();
        assert!(matches!(activation, Activation::LockedOut { .. }));

        // Valid credentials on a sibling session are refused while locked.
        assert!(matches!(
            server.activate_session(sh, second, &Credentials::Anonymous, t0),
            Err(EngineError::Session(SessionError::AuthLockedOut))
        ));

        let after = t0 + Duration::from_millis(60_000);
        let (activation, _) = server
            .activate_session(sh, second, &Credentials::Anonymous, after)
            .unwrap();
        assert!(matches!(activation, Activation::Active));
    }

    #[test]
    fn draining_channel_discards_late_bytes() {
        let now = Instant::now();
        let (mut client, mut server, ch, sh) = established_pair(now);

        let (request_id, _slot, out) = client
            .send_request(ch, Bytes::from_static(b"ping"), now)
            .unwrap();
        for frame in transmit_frames(&out) {
            server.bytes_received(sh, &frame, now).unwrap();
        }
        let out = server
            .send_response(sh, request_id, Bytes::from_static(b"pong"), now)
            .unwrap();
        let response_frames = transmit_frames(&out);

        client.close_channel(ch, CloseReason::Requested, now).unwrap();

        // A response racing the close notice must not cut the drain short.
        for frame in &response_frames {
            assert!(client.bytes_received(ch, frame, now).unwrap().is_empty());
        }
        assert_eq!(client.slots.get(ch).unwrap().state(), ConnState::Closing);
    }

    #[test]
    fn oversized_request_is_rejected_without_pending_entry() {
        let now = Instant::now();
        let (mut client, _server, ch, _sh) = established_pair(now);

        let payload = Bytes::from(vec![0u8; 262_145]);
        assert!(matches!(
            client.send_request(ch, payload, now),
            Err(EngineError::Chunk(ChunkError::MessageTooLarge { .. }))
        ));

        // No timeout can fire for a request that was never registered.
        client.tick(now + Duration::from_millis(10_000));
        assert_eq!(client.metrics().requests_timed_out.get(), 0);
    }

    #[test]
    fn request_timeout_resolved_by_tick() {
        let t0 = Instant::now();
        let (mut client, _server, ch, _sh) = established_pair(t0);

        let (_, mut slot, _) = client
            .send_request(ch, Bytes::from_static(b"slow"), t0)
            .unwrap();
        client.tick(t0 + Duration::from_millis(4_999));
        assert!(slot.try_take().unwrap().is_none());

        client.tick(t0 + Duration::from_millis(5_000));
        assert!(matches!(
            slot.try_take().unwrap(),
            Some(RequestOutcome::Timeout)
        ));
        assert_eq!(client.metrics().requests_timed_out.get(), 1);
    }

    #[test]
    fn malformed_bytes_close_the_channel() {
        let now = Instant::now();
        let (_client, mut server, _ch, sh) = established_pair(now);

        // Unknown message kind in an otherwise well-formed frame.
        let mut frame = [0u8; 24];
        frame[0] = b'X';
        frame[1] = b'F';
        frame[4..8].copy_from_slice(&24u32.to_be_bytes());
        let out = server.bytes_received(sh, &frame, now).unwrap();
        assert!(out.iter().any(|output| matches!(
            output,
            Output::Notify(Notification::ChannelClosed {
                reason: CloseReason::ProtocolViolation,
                ..
            })
        )));
        assert_eq!(server.metrics().protocol_violations.get(), 1);
    }

    #[test]
    fn unmatched_response_dropped_on_initiator() {
        let now = Instant::now();
        let (mut client, mut server, ch, sh) = established_pair(now);

        // A response for a request id the client never issued.
        let out = server
            .send_response(sh, 4242, Bytes::from_static(b"stray"), now)
            .unwrap();
        for frame in transmit_frames(&out) {
            client.bytes_received(ch, &frame, now).unwrap();
        }
        assert_eq!(client.metrics().unmatched_responses.get(), 1);
        assert!(client.slots.get(ch).is_ok());
    }
}
