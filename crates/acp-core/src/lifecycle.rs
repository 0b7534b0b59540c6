use crate::contracts::{AgentStatus, LifecycleState};
use crate::error::AgentApiError;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Lifecycle state and connection bookkeeping for one agent.
#[derive(Debug, Clone)]
pub struct LifecycleTracker {
    state: LifecycleState,
    changed_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
    first_connected_at: Option<DateTime<Utc>>,
    last_connected_at: Option<DateTime<Utc>>,
    disconnected_at: Option<DateTime<Utc>>,
}

impl LifecycleTracker {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            state: LifecycleState::Created,
            changed_at: now,
            created_at: now,
            first_connected_at: None,
            last_connected_at: None,
            disconnected_at: None,
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn changed_at(&self) -> DateTime<Utc> {
        self.changed_at
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn first_connected_at(&self) -> Option<DateTime<Utc>> {
        self.first_connected_at
    }

    pub fn last_connected_at(&self) -> Option<DateTime<Utc>> {
        self.last_connected_at
    }

    pub fn disconnected_at(&self) -> Option<DateTime<Utc>> {
        self.disconnected_at
    }

    /// Applies an agent-reported state token. Any known state may follow any
    /// other; unknown or empty tokens are rejected and leave the state as is.
    pub fn transition(
        &mut self,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<LifecycleState, AgentApiError> {
        let next = token
            .parse::<LifecycleState>()
            .map_err(|_| AgentApiError::InvalidState(token.to_string()))?;
        self.set(next, now);
        Ok(next)
    }

    pub fn set(&mut self, next: LifecycleState, now: DateTime<Utc>) {
        self.state = next;
        self.changed_at = now;
    }

    /// Moves a still-starting agent to `StartTimeout`. Returns whether the
    /// state changed.
    pub fn expire_start(&mut self, now: DateTime<Utc>) -> bool {
        if !self.state.is_starting() {
            return false;
        }
        self.set(LifecycleState::StartTimeout, now);
        true
    }

    pub fn mark_connected(&mut self, now: DateTime<Utc>) {
        if self.first_connected_at.is_none() {
            self.first_connected_at = Some(now);
        }
        self.last_connected_at = Some(now);
    }

    /// Records liveness from any authenticated agent call.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        let reconnected = match (self.last_connected_at, self.disconnected_at) {
            (Some(last), Some(gone)) => gone >= last,
            (None, _) => true,
            _ => false,
        };
        if reconnected {
            self.disconnected_at = None;
        }
        self.mark_connected(now);
    }

    pub fn mark_disconnected(&mut self, now: DateTime<Utc>) {
        self.disconnected_at = Some(now);
    }

    pub fn status(
        &self,
        now: DateTime<Utc>,
        connection_timeout: Duration,
        inactivity: Duration,
    ) -> AgentStatus {
        let Some(last) = self.last_connected_at else {
            if connection_timeout.is_zero() {
                return AgentStatus::Connecting;
            }
            let waited = (now - self.created_at).to_std().unwrap_or_default();
            return if waited >= connection_timeout {
                AgentStatus::Timeout
            } else {
                AgentStatus::Connecting
            };
        };
        if matches!(self.disconnected_at, Some(gone) if gone >= last) {
            return AgentStatus::Disconnected;
        }
        let idle = (now - last).to_std().unwrap_or_default();
        if idle > inactivity {
            AgentStatus::Disconnected
        } else {
            AgentStatus::Connected
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    const INACTIVITY: Duration = Duration::from_secs(30);

    #[test]
    fn accepts_every_known_state_and_rejects_the_rest() {
        let now = Utc::now();
        let mut tracker = LifecycleTracker::new(now);
        for state in LifecycleState::ALL {
            assert_eq!(tracker.transition(state.as_str(), now), Ok(state));
            assert_eq!(tracker.state(), state);
        }

        for bad in ["nonexistent_state", ""] {
            let err = tracker.transition(bad, now).expect_err("invalid token");
            assert!(matches!(err, AgentApiError::InvalidState(_)));
        }
        assert_eq!(tracker.state(), LifecycleState::Off);
    }

    #[test]
    fn expire_start_only_applies_while_starting() {
        let now = Utc::now();
        let mut tracker = LifecycleTracker::new(now);
        assert!(tracker.expire_start(now));
        assert_eq!(tracker.state(), LifecycleState::StartTimeout);

        tracker.set(LifecycleState::Ready, now);
        assert!(!tracker.expire_start(now));
        assert_eq!(tracker.state(), LifecycleState::Ready);
    }

    #[test]
    fn never_connected_agent_times_out() {
        let created = Utc::now();
        let tracker = LifecycleTracker::new(created);
        let timeout = Duration::from_secs(1);

        assert_eq!(
            tracker.status(created, timeout, INACTIVITY),
            AgentStatus::Connecting
        );
        assert_eq!(
            tracker.status(created + ChronoDuration::seconds(2), timeout, INACTIVITY),
            AgentStatus::Timeout
        );
        assert_eq!(
            tracker.status(created + ChronoDuration::hours(1), Duration::ZERO, INACTIVITY),
            AgentStatus::Connecting
        );
    }

    #[test]
    fn connection_status_follows_activity() {
        let created = Utc::now();
        let mut tracker = LifecycleTracker::new(created);
        tracker.mark_connected(created);
        assert_eq!(
            tracker.status(created, Duration::ZERO, INACTIVITY),
            AgentStatus::Connected
        );
        assert_eq!(
            tracker.status(created + ChronoDuration::seconds(31), Duration::ZERO, INACTIVITY),
            AgentStatus::Disconnected
        );

        let later = created + ChronoDuration::seconds(5);
        tracker.mark_disconnected(later);
        assert_eq!(
            tracker.status(later, Duration::ZERO, INACTIVITY),
            AgentStatus::Disconnected
        );

        let back = later + ChronoDuration::seconds(1);
        tracker.touch(back);
        assert_eq!(
            tracker.status(back, Duration::ZERO, INACTIVITY),
            AgentStatus::Connected
        );
        assert_eq!(tracker.first_connected_at(), Some(created));
        assert_eq!(tracker.last_connected_at(), Some(back));
        assert!(tracker.disconnected_at().is_none());
    }
}
