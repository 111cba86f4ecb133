#![cfg(feature = "stack-api")]

// Session lifecycle: creation against caps, credential activation with
// attempt counting, timeout expiry, and cascade close on channel loss.

use std::time::{Duration, Instant};

use ahash::AHashMap;
use thiserror::Error;
use tracing::{debug, info};

use crate::{api::CloseReason, config::SessionConfig};

/// Session identifier, unique per process while the session lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub u32);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Errors surfaced by session operations.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The global session cap is reached and nothing could be reclaimed.
    #[error("too many sessions (max {max})")]
    TooManySessions {
        /// Configured global cap.
        max: u32,
    },
    /// The per-channel session cap is reached.
    #[error("too many sessions on channel (max {max})")]
    TooManySessionsOnChannel {
        /// Configured per-channel cap.
        max: u32,
    },
    /// The owning channel refuses session creation after repeated
    /// authentication failures.
    #[error("session creation locked out")]
    AuthLockedOut,
    /// Authentication failed; the session stays unactivated.
    #[error("authentication failed")]
    AuthFailed,
    /// The identifier matches no live session.
    #[error("unknown session {0}")]
    UnknownSession(SessionId),
    /// The session already owns a subscription.
    #[error("session {0} already owns a subscription")]
    SubscriptionHeld(SessionId),
}

/// Lifecycle state of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created but not yet activated with credentials.
    Created,
    /// An activation attempt is being evaluated.
    Activating,
    /// Activated; application services may be used.
    Active,
    /// Being torn down.
    Closing,
    /// Removed from the table.
    Closed,
}

/// One application session bound to a channel.
#[derive(Debug)]
pub struct Session {
    /// Identifier handed to the caller.
    pub id: SessionId,
    /// Opaque authentication token bound to the owning channel.
    pub auth_token: [u8; 32],
    /// Owning channel identifier.
    pub channel_id: u32,
    /// Lifecycle state.
    pub state: SessionState,
    /// Inactivity timeout after clamping.
    pub revised_timeout: Duration,
    /// Last time the session carried traffic or was touched.
    pub last_activity: Instant,
    /// Creation instant, used for unactivated-session reclamation.
    pub created_at: Instant,
    /// Consecutive failed activation attempts.
    pub auth_failures: u32,
    /// At most one subscription owned by this session.
    pub subscription: Option<u32>,
}

/// Record of a session that left the table, carried to the notification path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClosedSession {
    /// Identifier of the closed session.
    pub id: SessionId,
    /// Channel it belonged to.
    pub channel_id: u32,
    /// Why it closed.
    pub reason: CloseReason,
    /// Subscription released by the close, if the session owned one.
    pub subscription: Option<u32>,
}

/// Outcome of one activation attempt.
#[derive(Debug)]
pub enum Activation {
    /// Credentials accepted; the session is active.
    Active,
    /// Credentials rejected; the session stays unactivated.
    Failed {
        /// Consecutive failures so far.
        failures: u32,
        /// Attempts left before lockout.
        remaining: u32,
    },
    /// The failure budget is spent; the session closed and the owning channel
    /// must be placed under a creation lockout by the caller.
    LockedOut {
        /// The session removed by the lockout.
        closed: ClosedSession,
    },
}

/// Bounded arena of sessions across all channels.
#[derive(Debug)]
pub struct SessionTable {
    entries: Vec<Option<Session>>,
    per_channel: AHashMap<u32, u32>,
    next_id: u32,
    max_per_channel: u32,
    timeout_min: Duration,
    timeout_max: Duration,
    timeout_default: Duration,
    max_auth_failures: u32,
    min_activation_delay: Duration,
}

impl SessionTable {
    /// Builds the table from the validated configuration.
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            entries: (0..config.max_global).map(|_| None).collect(),
            per_channel: AHashMap::new(),
            next_id: rand::random::<u32>() | 1,
            max_per_channel: config.max_per_channel,
            timeout_min: config.timeout_min(),
            timeout_max: config.timeout_max(),
            timeout_default: config.timeout_default(),
            max_auth_failures: config.max_auth_failures,
            min_activation_delay: config.min_activation_delay(),
        }
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.entries.iter().flatten().count()
    }

    /// True when no session lives in the table.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolves a session identifier.
    pub fn get(&self, id: SessionId) -> Result<&Session, SessionError> {
        self.entries
            .iter()
            .flatten()
            .find(|session| session.id == id)
            .ok_or(SessionError::UnknownSession(id))
    }

    fn get_mut(&mut self, id: SessionId) -> Result<&mut Session, SessionError> {
        self.entries
            .iter_mut()
            .flatten()
            .find(|session| session.id == id)
            .ok_or(SessionError::UnknownSession(id))
    }

    /// Creates a session on the given channel, clamping the requested timeout
    /// into the configured bounds. When the table is full an unactivated
    /// session past the minimum activation delay may be reclaimed; the caller
    /// must surface the reclaimed session.
    pub fn create(
        &mut self,
        channel_id: u32,
        requested_timeout: Option<Duration>,
        now: Instant,
    ) -> Result<(SessionId, Option<ClosedSession>), SessionError> {
        let on_channel = self.per_channel.get(&channel_id).copied().unwrap_or(0);
        if on_channel >= self.max_per_channel {
            return Err(SessionError::TooManySessionsOnChannel {
                max: self.max_per_channel,
            });
        }

        let mut reclaimed = None;
        let index = match self.entries.iter().position(Option::is_none) {
            Some(index) => index,
            None => match self.reclaim_unactivated(now) {
                Some((index, closed)) => {
                    reclaimed = Some(closed);
                    index
                }
                None => {
                    return Err(SessionError::TooManySessions {
                        max: self.entries.len() as u32,
                    })
                }
            },
        };

        let revised_timeout = requested_timeout
            .unwrap_or(self.timeout_default)
            .clamp(self.timeout_min, self.timeout_max);
        let id = self.allocate_id();
        self.entries[index] = Some(Session {
            id,
            auth_token: rand::random(),
            channel_id,
            state: SessionState::Created,
            revised_timeout,
            last_activity: now,
            created_at: now,
            auth_failures: 0,
            subscription: None,
        });
        *self.per_channel.entry(channel_id).or_insert(0) += 1;
        debug!(%id, channel_id, ?revised_timeout, "session created");
        Ok((id, reclaimed))
    }

    fn allocate_id(&mut self) -> SessionId {
        loop {
            let id = self.next_id;
            self.next_id = self.next_id.checked_add(1).unwrap_or(1);
            let in_use = self.entries.iter().flatten().any(|s| s.id.0 == id);
            if id != 0 && !in_use {
                return SessionId(id);
            }
        }
    }

    // Reclaims the oldest session still waiting for activation, provided it
    // sat unactivated at least the minimum activation delay.
    fn reclaim_unactivated(&mut self, now: Instant) -> Option<(usize, ClosedSession)> {
        let index = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, slot)| {
                slot.as_ref().is_some_and(|session| {
                    session.state == SessionState::Created
                        && now.duration_since(session.created_at) >= self.min_activation_delay
                })
            })
            .min_by_key(|(_, slot)| slot.as_ref().map(|session| session.created_at))?
            .0;
        let closed = self.remove(index, CloseReason::Reclaimed)?;
        info!(id = %closed.id, channel_id = closed.channel_id, "unactivated session reclaimed");
        Some((index, closed))
    }

    /// Applies one activation attempt. `authenticated` is the verdict of the
    /// credential check, performed by the caller's authenticator.
    pub fn activate(
        &mut self,
        id: SessionId,
        authenticated: bool,
        now: Instant,
    ) -> Result<Activation, SessionError> {
        let max_failures = self.max_auth_failures;
        let session = self.get_mut(id)?;
        session.state = SessionState::Activating;

        if authenticated {
            session.state = SessionState::Active;
            session.auth_failures = 0;
            session.last_activity = now;
            debug!(%id, channel_id = session.channel_id, "session activated");
            return Ok(Activation::Active);
        }

        session.auth_failures += 1;
        let failures = session.auth_failures;
        if failures >= max_failures {
            let index = self.index_of(id)?;
            let closed = self
                .remove(index, CloseReason::AuthLockout)
                .ok_or(SessionError::UnknownSession(id))?;
            info!(%id, channel_id = closed.channel_id, failures, "session locked out");
            return Ok(Activation::LockedOut { closed });
        }

        // Back to Created: the caller may retry with new credentials.
        session.state = SessionState::Created;
        Ok(Activation::Failed {
            failures,
            remaining: max_failures - failures,
        })
    }

    /// Records activity on an active session, deferring its expiry.
    pub fn touch(&mut self, id: SessionId, now: Instant) -> Result<(), SessionError> {
        let session = self.get_mut(id)?;
        session.last_activity = now;
        Ok(())
    }

    /// Attaches a subscription to the session. Each session owns at most one.
    pub fn attach_subscription(
        &mut self,
        id: SessionId,
        subscription: u32,
    ) -> Result<(), SessionError> {
        let session = self.get_mut(id)?;
        if session.subscription.is_some() {
            return Err(SessionError::SubscriptionHeld(id));
        }
        session.subscription = Some(subscription);
        Ok(())
    }

    /// Closes one session, releasing its subscription ownership.
    pub fn close(&mut self, id: SessionId, reason: CloseReason) -> Result<ClosedSession, SessionError> {
        let index = self.index_of(id)?;
        self.remove(index, reason)
            .ok_or(SessionError::UnknownSession(id))
    }

    /// Closes every session owned by the given channel. Runs synchronously
    /// within the channel close step.
    pub fn close_channel(&mut self, channel_id: u32, reason: CloseReason) -> Vec<ClosedSession> {
        let mut closed = Vec::new();
        for index in 0..self.entries.len() {
            let owned = self.entries[index]
                .as_ref()
                .is_some_and(|session| session.channel_id == channel_id);
            if owned {
                if let Some(record) = self.remove(index, reason) {
                    closed.push(record);
                }
            }
        }
        closed
    }

    /// Closes every session whose owning channel is no longer live. Cascade
    /// closes run synchronously, so this is a safety sweep for the invariant
    /// rather than the primary cleanup path.
    pub fn close_orphans(&mut self, is_live: impl Fn(u32) -> bool) -> Vec<ClosedSession> {
        let mut closed = Vec::new();
        for index in 0..self.entries.len() {
            let orphan = self.entries[index]
                .as_ref()
                .is_some_and(|session| !is_live(session.channel_id));
            if orphan {
                if let Some(record) = self.remove(index, CloseReason::ChannelLost) {
                    closed.push(record);
                }
            }
        }
        closed
    }

    /// Closes every session whose revised timeout elapsed since last activity.
    pub fn expire_sweep(&mut self, now: Instant) -> Vec<ClosedSession> {
        let mut closed = Vec::new();
        for index in 0..self.entries.len() {
            let expired = self.entries[index].as_ref().is_some_and(|session| {
                now.duration_since(session.last_activity) >= session.revised_timeout
            });
            if expired {
                if let Some(record) = self.remove(index, CloseReason::SessionTimeout) {
                    info!(id = %record.id, channel_id = record.channel_id, "session expired");
                    closed.push(record);
                }
            }
        }
        closed
    }

    fn index_of(&self, id: SessionId) -> Result<usize, SessionError> {
        self.entries
            .iter()
            .position(|slot| slot.as_ref().is_some_and(|session| session.id == id))
            .ok_or(SessionError::UnknownSession(id))
    }

    fn remove(&mut self, index: usize, reason: CloseReason) -> Option<ClosedSession> {
        let mut session = self.entries[index].take()?;
        if let Some(count) = self.per_channel.get_mut(&session.channel_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.per_channel.remove(&session.channel_id);
            }
        }
        session.state = SessionState::Closed;
        Some(ClosedSession {
            id: session.id,
            channel_id: session.channel_id,
            reason,
            subscription: session.subscription,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(config: SessionConfig) -> SessionTable {
        SessionTable::new(&config)
    }

    fn small_config() -> SessionConfig {
        SessionConfig {
            max_global: 3,
            max_per_channel: 2,
            ..SessionConfig::default()
        }
    }

    #[test]
    fn timeout_clamped_into_bounds() {
        let mut table = table(SessionConfig::default());
        let now = Instant::now();

        let (id, _) = table
            .create(1, Some(Duration::from_millis(1)), now)
            .unwrap();
        assert_eq!(
            table.get(id).unwrap().revised_timeout,
            Duration::from_millis(10_000)
        );

        let (id, _) = table.create(1, None, now).unwrap();
        assert_eq!(
            table.get(id).unwrap().revised_timeout,
            Duration::from_millis(60_000)
        );
    }

    #[test]
    fn per_channel_and_global_caps() {
        let mut table = table(small_config());
        let now = Instant::now();

        table.create(1, None, now).unwrap();
        table.create(1, None, now).unwrap();
        assert!(matches!(
            table.create(1, None, now),
            Err(SessionError::TooManySessionsOnChannel { max: 2 })
        ));

        table.create(2, None, now).unwrap();
        assert!(matches!(
            table.create(3, None, now),
            Err(SessionError::TooManySessions { max: 3 })
        ));
    }

    #[test]
    fn full_table_reclaims_stale_unactivated_session() {
        let mut table = table(small_config());
        let t0 = Instant::now();
        let (oldest, _) = table.create(1, None, t0).unwrap();
        table.create(2, None, t0).unwrap();
        table.create(3, None, t0).unwrap();

        // Within the minimum activation delay nothing is reclaimed.
        let early = t0 + Duration::from_millis(999);
        assert!(table.create(4, None, early).is_err());

        let late = t0 + Duration::from_millis(1_000);
        let (_, reclaimed) = table.create(4, None, late).unwrap();
        let reclaimed = reclaimed.unwrap();
        assert_eq!(reclaimed.id, oldest);
        assert_eq!(reclaimed.reason, CloseReason::Reclaimed);
        assert!(table.get(oldest).is_err());
    }

    #[test]
    fn activated_sessions_are_not_reclaimed() {
        let mut table = table(SessionConfig {
            max_global: 1,
            ..SessionConfig::default()
        });
        let t0 = Instant::now();
        let (id, _) = table.create(1, None, t0).unwrap();
        table.activate(id, true, t0).unwrap();

        let late = t0 + Duration::from_millis(5_000);
        assert!(matches!(
            table.create(2, None, late),
            Err(SessionError::TooManySessions { max: 1 })
        ));
    }

    #[test]
    fn lockout_after_max_consecutive_failures() {
        let mut table = table(SessionConfig::default());
        let now = Instant::now();
        let (id, _) = table.create(7, None, now).unwrap();

        for expected in 1..3 {
            match table.activate(id, false, now).unwrap() {
                Activation::Failed {
                    failures,
                    remaining,
                } => {
                    assert_eq!(failures, expected);
                    assert_eq!(remaining, 3 - expected);
                }
                other => panic!("unexpected {other:?}"),
            }
        }

        match table.activate(id, false, now).unwrap() {
            Activation::LockedOut { closed } => {
                assert_eq!(closed.id, id);
                assert_eq!(closed.channel_id, 7);
                assert_eq!(closed.reason, CloseReason::AuthLockout);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(table.get(id).is_err());
    }

    #[test]
    fn success_resets_failure_count() {
        let mut table = table(SessionConfig::default());
        let now = Instant::now();
        let (id, _) = table.create(1, None, now).unwrap();

        table.activate(id, false, now).unwrap();
        table.activate(id, false, now).unwrap();
        assert!(matches!(
            table.activate(id, true, now).unwrap(),
            Activation::Active
        ));
        assert_eq!(table.get(id).unwrap().auth_failures, 0);
    }

    #[test]
    fn expire_sweep_honors_touch() {
        let mut table = table(SessionConfig::default());
        let t0 = Instant::now();
        let (quiet, _) = table
            .create(1, Some(Duration::from_millis(10_000)), t0)
            .unwrap();
        let (busy, _) = table
            .create(1, Some(Duration::from_millis(10_000)), t0)
            .unwrap();
        table.activate(quiet, true, t0).unwrap();
        table.activate(busy, true, t0).unwrap();

        let mid = t0 + Duration::from_millis(6_000);
        table.touch(busy, mid).unwrap();

        let closed = table.expire_sweep(t0 + Duration::from_millis(10_000));
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].id, quiet);
        assert_eq!(closed[0].reason, CloseReason::SessionTimeout);
        assert!(table.get(busy).is_ok());
    }

    #[test]
    fn channel_close_cascades_and_releases_subscriptions() {
        let mut table = table(SessionConfig::default());
        let now = Instant::now();
        let (a, _) = table.create(9, None, now).unwrap();
        let (b, _) = table.create(9, None, now).unwrap();
        let (other, _) = table.create(10, None, now).unwrap();
        table.attach_subscription(a, 41).unwrap();
        assert!(matches!(
            table.attach_subscription(a, 42),
            Err(SessionError::SubscriptionHeld(_))
        ));

        let closed = table.close_channel(9, CloseReason::ChannelLost);
        assert_eq!(closed.len(), 2);
        let for_a = closed.iter().find(|c| c.id == a).unwrap();
        assert_eq!(for_a.subscription, Some(41));
        assert!(closed.iter().all(|c| c.reason == CloseReason::ChannelLost));
        assert!(table.get(b).is_err());
        assert!(table.get(other).is_ok());

        // The channel's creation budget is fully released.
        for _ in 0..SessionConfig::default().max_per_channel {
            table.create(9, None, now).unwrap();
        }
    }
}
