#![cfg(feature = "stack-api")]

//! Tokio-based runtime scaffolding for driving a [`ChannelEngine`] actor.
//!
//! This module provides a small executor wrapper around
//! [`ChannelEngine`](crate::ChannelEngine) that owns the engine on a dedicated
//! task, applies commands from a [`StackHandle`], drives every deadline through
//! a fixed-interval tick, and surfaces engine outputs through an asynchronous
//! channel. `spawn_stack` is the entry-point for launching that task.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use bytes::Bytes;
use thiserror::Error;
use tokio::{
    sync::{
        mpsc::{self, error::TrySendError, Receiver, Sender},
        oneshot,
    },
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};
use tracing::{debug, warn};

use crate::{
    api::{CloseReason, ConnectionConfig, Credentials},
    engine::{ChannelEngine, EngineError, Output},
    pending::ResponseSlot,
    session::{Activation, SessionId},
    slots::{ConnEvent, ConnectionHandle},
};

/// Configuration parameters controlling how the stack actor is driven.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Interval used to call [`ChannelEngine::tick`].
    pub tick: Duration,
    /// Capacity of the command channel between the handle and actor task.
    pub command_buffer: usize,
    /// Capacity of the output channel surfaced to the caller.
    pub event_buffer: usize,
    /// Grace period allowed for the actor task to stop during
    /// [`StackHandle::shutdown`].
    pub shutdown_grace: Duration,
}

impl RuntimeConfig {
    /// Creates a new configuration with the provided tick interval and default
    /// values for the remaining parameters.
    pub fn new(tick: Duration) -> Self {
        Self {
            tick,
            ..Self::default()
        }
    }

    /// Sets the command channel capacity.
    pub fn with_command_buffer(mut self, capacity: usize) -> Self {
        self.command_buffer = capacity.max(1);
        self
    }

    /// Sets the output channel capacity.
    pub fn with_event_buffer(mut self, capacity: usize) -> Self {
        self.event_buffer = capacity.max(1);
        self
    }

    /// Sets the grace period used when shutting down the actor task.
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    fn normalize(&mut self) {
        if self.command_buffer == 0 {
            self.command_buffer = 1;
        }
        if self.event_buffer == 0 {
            self.event_buffer = 1;
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(50),
            command_buffer: 512,
            event_buffer: 1024,
            shutdown_grace: Duration::from_secs(1),
        }
    }
}

/// Reason why the stack actor task stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The actor shut down after an explicit [`StackHandle::shutdown`].
    Shutdown,
    /// The handle dropped the command channel without a shutdown request.
    CommandChannelClosed,
    /// The output channel was dropped by the consumer.
    EventChannelClosed,
}

/// Events emitted by the running stack task.
#[derive(Debug)]
pub enum StackEvent {
    /// An engine output: frames to transmit, a handshake message, or a
    /// notification.
    Output(Output),
    /// A fire-and-forget command failed inside the engine.
    CommandFailed(EngineError),
    /// The actor task finished execution.
    Stopped(StopReason),
}

/// Errors returned by [`StackHandle`].
#[derive(Debug, Error)]
pub enum HandleError {
    /// The runtime task has already exited and the command channel is closed.
    #[error("stack runtime channel closed")]
    ChannelClosed,
    /// The runtime command queue is full.
    #[error("stack runtime command channel is full")]
    CommandQueueFull,
    /// The actor stopped before responding to a request.
    #[error("stack runtime stopped unexpectedly")]
    ActorStopped,
    /// Joining the underlying task failed.
    #[error("stack runtime join error: {0}")]
    Join(tokio::task::JoinError),
    /// The actor did not stop within the configured grace window.
    #[error("stack runtime shutdown timed out")]
    ShutdownTimeout,
}

enum StackCommand {
    Open {
        config: Arc<ConnectionConfig>,
        reply: oneshot::Sender<Result<ConnectionHandle, EngineError>>,
    },
    Connection {
        handle: ConnectionHandle,
        event: ConnEvent,
    },
    Close {
        handle: ConnectionHandle,
        reason: CloseReason,
    },
    Bytes {
        handle: ConnectionHandle,
        bytes: Bytes,
    },
    SendRequest {
        handle: ConnectionHandle,
        payload: Bytes,
        reply: oneshot::Sender<Result<(u32, ResponseSlot), EngineError>>,
    },
    SendResponse {
        handle: ConnectionHandle,
        request_id: u32,
        payload: Bytes,
    },
    CreateSession {
        handle: ConnectionHandle,
        requested_timeout: Option<Duration>,
        reply: oneshot::Sender<Result<SessionId, EngineError>>,
    },
    ActivateSession {
        handle: ConnectionHandle,
        session: SessionId,
        credentials: Credentials,
        reply: oneshot::Sender<Result<Activation, EngineError>>,
    },
    CloseSession {
        session: SessionId,
        reason: CloseReason,
    },
    TouchSession {
        session: SessionId,
    },
    AttachSubscription {
        session: SessionId,
        subscription: u32,
    },
    Shutdown,
}

/// Handle used to interact with a spawned stack actor.
#[derive(Debug)]
pub struct StackHandle {
    commands: Sender<StackCommand>,
    join: JoinHandle<()>,
    config: Arc<RuntimeConfig>,
}

impl StackHandle {
    /// Returns a reference to the runtime configuration driving the actor.
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Claims a connection slot and awaits the assigned handle.
    pub async fn open_channel(
        &self,
        config: Arc<ConnectionConfig>,
    ) -> Result<Result<ConnectionHandle, EngineError>, HandleError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(StackCommand::Open { config, reply: tx })
            .await
            .map_err(|_| HandleError::ChannelClosed)?;
        rx.await.map_err(|_| HandleError::ActorStopped)
    }

    /// Reports a transport-level event for a connection.
    pub fn connection_event(
        &self,
        handle: ConnectionHandle,
        event: ConnEvent,
    ) -> Result<(), HandleError> {
        self.try_command(StackCommand::Connection { handle, event })
    }

    /// Requests an orderly close of a channel.
    pub fn close_channel(
        &self,
        handle: ConnectionHandle,
        reason: CloseReason,
    ) -> Result<(), HandleError> {
        self.try_command(StackCommand::Close { handle, reason })
    }

    /// Feeds raw bytes read from a connection's transport.
    pub fn bytes_received<B>(&self, handle: ConnectionHandle, bytes: B) -> Result<(), HandleError>
    where
        B: Into<Bytes>,
    {
        self.try_command(StackCommand::Bytes {
            handle,
            bytes: bytes.into(),
        })
    }

    /// Submits a request on an established channel and awaits its id and
    /// response slot. Frames reach the caller as [`StackEvent::Output`].
    pub async fn send_request<B>(
        &self,
        handle: ConnectionHandle,
        payload: B,
    ) -> Result<Result<(u32, ResponseSlot), EngineError>, HandleError>
    where
        B: Into<Bytes>,
    {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(StackCommand::SendRequest {
                handle,
                payload: payload.into(),
                reply: tx,
            })
            .await
            .map_err(|_| HandleError::ChannelClosed)?;
        rx.await.map_err(|_| HandleError::ActorStopped)
    }

    /// Queues a response to a previously received request.
    pub fn send_response<B>(
        &self,
        handle: ConnectionHandle,
        request_id: u32,
        payload: B,
    ) -> Result<(), HandleError>
    where
        B: Into<Bytes>,
    {
        self.try_command(StackCommand::SendResponse {
            handle,
            request_id,
            payload: payload.into(),
        })
    }

    /// Creates a session bound to the channel and awaits its identifier.
    pub async fn create_session(
        &self,
        handle: ConnectionHandle,
        requested_timeout: Option<Duration>,
    ) -> Result<Result<SessionId, EngineError>, HandleError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(StackCommand::CreateSession {
                handle,
                requested_timeout,
                reply: tx,
            })
            .await
            .map_err(|_| HandleError::ChannelClosed)?;
        rx.await.map_err(|_| HandleError::ActorStopped)
    }

    /// Attempts to activate a session and awaits the attempt outcome.
    pub async fn activate_session(
        &self,
        handle: ConnectionHandle,
        session: SessionId,
        credentials: Credentials,
    ) -> Result<Result<Activation, EngineError>, HandleError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(StackCommand::ActivateSession {
                handle,
                session,
                credentials,
                reply: tx,
            })
            .await
            .map_err(|_| HandleError::ChannelClosed)?;
        rx.await.map_err(|_| HandleError::ActorStopped)
    }

    /// Closes a session.
    pub fn close_session(&self, session: SessionId, reason: CloseReason) -> Result<(), HandleError> {
        self.try_command(StackCommand::CloseSession { session, reason })
    }

    /// Records session activity, pushing its expiry deadline out.
    pub fn touch_session(&self, session: SessionId) -> Result<(), HandleError> {
        self.try_command(StackCommand::TouchSession { session })
    }

    /// Attaches a subscription to a session.
    pub fn attach_subscription(
        &self,
        session: SessionId,
        subscription: u32,
    ) -> Result<(), HandleError> {
        self.try_command(StackCommand::AttachSubscription {
            session,
            subscription,
        })
    }

    /// Signals the stack actor to terminate and waits for the join handle.
    pub async fn shutdown(self) -> Result<(), HandleError> {
        let StackHandle {
            commands,
            join,
            config,
        } = self;

        commands
            .send(StackCommand::Shutdown)
            .await
            .map_err(|_| HandleError::ChannelClosed)?;

        if config.shutdown_grace.is_zero() {
            join.await.map_err(HandleError::Join)?;
            return Ok(());
        }

        match time::timeout(config.shutdown_grace, join).await {
            Ok(result) => result.map_err(HandleError::Join),
            Err(_) => Err(HandleError::ShutdownTimeout),
        }
    }

    fn try_command(&self, command: StackCommand) -> Result<(), HandleError> {
        self.commands.try_send(command).map_err(|err| match err {
            TrySendError::Closed(_) => HandleError::ChannelClosed,
            TrySendError::Full(_) => HandleError::CommandQueueFull,
        })
    }
}

/// Spawns a Tokio task that owns and continuously drives the provided engine.
///
/// The returned [`StackHandle`] applies commands to the engine; outputs and
/// notifications are forwarded over the returned
/// [`tokio::sync::mpsc::Receiver`].
pub fn spawn_stack(engine: ChannelEngine, tick: Duration) -> (StackHandle, Receiver<StackEvent>) {
    spawn_stack_with_config(engine, RuntimeConfig::new(tick))
}

/// Spawns a Tokio task using an explicit [`RuntimeConfig`].
pub fn spawn_stack_with_config(
    engine: ChannelEngine,
    mut config: RuntimeConfig,
) -> (StackHandle, Receiver<StackEvent>) {
    config.normalize();
    let command_capacity = config.command_buffer;
    let event_capacity = config.event_buffer;
    let config = Arc::new(config);
    let (command_tx, command_rx) = mpsc::channel(command_capacity);
    let (event_tx, event_rx) = mpsc::channel(event_capacity);

    let join = tokio::spawn(run_stack(engine, Arc::clone(&config), command_rx, event_tx));
    let handle = StackHandle {
        commands: command_tx,
        join,
        config,
    };
    (handle, event_rx)
}

async fn run_stack(
    mut engine: ChannelEngine,
    config: Arc<RuntimeConfig>,
    mut commands: Receiver<StackCommand>,
    events: Sender<StackEvent>,
) {
    let mut ticker = time::interval(config.tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let exit_reason = loop {
        let control = tokio::select! {
            biased;
            maybe_cmd = commands.recv() => {
                match maybe_cmd {
                    Some(cmd) => handle_command(&mut engine, cmd, &events).await,
                    None => LoopControl::Break(StopReason::CommandChannelClosed),
                }
            }
            _ = ticker.tick() => {
                let outputs = engine.tick(Instant::now());
                push_outputs(&events, outputs).await
            }
        };

        if let LoopControl::Break(reason) = control {
            break reason;
        }
    };

    if let Err(reason) = push_event(&events, StackEvent::Stopped(exit_reason)).await {
        debug!(
            ?exit_reason,
            suppressed = ?reason,
            "failed to deliver final stop event for stack runtime"
        );
    }
}

enum LoopControl {
    Continue,
    Break(StopReason),
}

async fn handle_command(
    engine: &mut ChannelEngine,
    command: StackCommand,
    events: &Sender<StackEvent>,
) -> LoopControl {
    let now = Instant::now();
    let result = match command {
        StackCommand::Open { config, reply } => {
            let (response, outputs) = match engine.open_channel(config, now) {
                Ok((handle, outputs)) => (Ok(handle), outputs),
                Err(err) => (Err(err), Vec::new()),
            };
            let _ = reply.send(response);
            Ok(outputs)
        }
        StackCommand::Connection { handle, event } => engine.connection_event(handle, event, now),
        StackCommand::Close { handle, reason } => engine.close_channel(handle, reason, now),
        StackCommand::Bytes { handle, bytes } => engine.bytes_received(handle, &bytes, now),
        StackCommand::SendRequest {
            handle,
            payload,
            reply,
        } => {
            let (response, outputs) = match engine.send_request(handle, payload, now) {
                Ok((request_id, slot, outputs)) => (Ok((request_id, slot)), outputs),
                Err(err) => (Err(err), Vec::new()),
            };
            let _ = reply.send(response);
            Ok(outputs)
        }
        StackCommand::SendResponse {
            handle,
            request_id,
            payload,
        } => engine.send_response(handle, request_id, payload, now),
        StackCommand::CreateSession {
            handle,
            requested_timeout,
            reply,
        } => {
            let (response, outputs) = match engine.create_session(handle, requested_timeout, now) {
                Ok((session, outputs)) => (Ok(session), outputs),
                Err(err) => (Err(err), Vec::new()),
            };
            let _ = reply.send(response);
            Ok(outputs)
        }
        StackCommand::ActivateSession {
            handle,
            session,
            credentials,
            reply,
        } => {
            let (response, outputs) =
                match engine.activate_session(handle, session, &credentials, now) {
                    Ok((activation, outputs)) => (Ok(activation), outputs),
                    Err(err) => (Err(err), Vec::new()),
                };
            let _ = reply.send(response);
            Ok(outputs)
        }
        StackCommand::CloseSession { session, reason } => engine.close_session(session, reason),
        StackCommand::TouchSession { session } => {
            engine.touch_session(session, now).map(|()| Vec::new())
        }
        StackCommand::AttachSubscription {
            session,
            subscription,
        } => engine
            .attach_subscription(session, subscription)
            .map(|()| Vec::new()),
        StackCommand::Shutdown => return LoopControl::Break(StopReason::Shutdown),
    };

    match result {
        Ok(outputs) => push_outputs(events, outputs).await,
        Err(err) => match push_event(events, StackEvent::CommandFailed(err)).await {
            Ok(()) => LoopControl::Continue,
            Err(reason) => LoopControl::Break(reason),
        },
    }
}

async fn push_outputs(events: &Sender<StackEvent>, outputs: Vec<Output>) -> LoopControl {
    for output in outputs {
        if let Err(reason) = push_event(events, StackEvent::Output(output)).await {
            return LoopControl::Break(reason);
        }
    }
    LoopControl::Continue
}

async fn push_event(events: &Sender<StackEvent>, event: StackEvent) -> Result<(), StopReason> {
    match events.try_send(event) {
        Ok(()) => Ok(()),
        Err(TrySendError::Full(event)) => {
            warn!("stack runtime event channel full; applying backpressure");
            events
                .send(event)
                .await
                .map_err(|_| StopReason::EventChannelClosed)
        }
        Err(TrySendError::Closed(_)) => Err(StopReason::EventChannelClosed),
    }
}
