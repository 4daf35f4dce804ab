//! Outage detector.
//!
//! Per-endpoint state machine with two states:
//!
//! ```text
//! Healthy   -> Unhealthy: failure streak reaches the debounce threshold
//! Unhealthy -> Healthy:   one `up` check
//! ```
//!
//! The threshold is `down_threshold` when the streak contains a `down`
//! check and `degraded_threshold` for degraded-only streaks. The outage row
//! is the persisted form of `Unhealthy`; cached state is rebuilt from the
//! store the first time an endpoint is seen after a restart.

use crate::db::{CheckStatus, DbError, HealthCheckResult, Outage, Store};

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Checks loaded when rebuilding a failure streak after restart.
const RECOVERY_WINDOW: u32 = 100;

/// Consecutive-failure thresholds for opening an outage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebounceConfig {
    pub down_threshold: u32,
    pub degraded_threshold: u32,
}

impl Default for DebounceConfig {
    fn default() -> Self {
        Self {
            down_threshold: 1,
            degraded_threshold: 3,
        }
    }
}

/// Failing checks not yet promoted to an outage.
#[derive(Debug, Clone, PartialEq)]
pub struct Streak {
    pub started_at: DateTime<Utc>,
    pub len: i64,
    pub saw_down: bool,
}

impl Streak {
    fn extend(streak: Option<&Streak>, status: CheckStatus, at: DateTime<Utc>) -> Streak {
        let is_down = status == CheckStatus::Down;
        match streak {
            Some(s) => Streak {
                started_at: s.started_at,
                len: s.len + 1,
                saw_down: s.saw_down || is_down,
            },
            None => Streak {
                started_at: at,
                len: 1,
                saw_down: is_down,
            },
        }
    }

    fn reaches(&self, config: &DebounceConfig) -> bool {
        let threshold = if self.saw_down {
            config.down_threshold
        } else {
            config.degraded_threshold
        };
        self.len >= i64::from(threshold.max(1))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum HealthState {
    Healthy { streak: Option<Streak> },
    Unhealthy { outage_id: i64 },
}

/// Result of feeding one check to a state.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// No store write; replace the state.
    Stay(HealthState),
    Open(Streak),
    Extend { outage_id: i64 },
    Resolve { outage_id: i64, ended_at: DateTime<Utc> },
}

impl HealthState {
    pub fn next(&self, status: CheckStatus, at: DateTime<Utc>, config: &DebounceConfig) -> Transition {
        match (self, status.is_failure()) {
            (HealthState::Healthy { .. }, false) => Transition::Stay(HealthState::Healthy { streak: None }),
            (HealthState::Healthy { streak }, true) => {
                let streak = Streak::extend(streak.as_ref(), status, at);
                if streak.reaches(config) {
                    Transition::Open(streak)
                } else {
                    Transition::Stay(HealthState::Healthy {
                        streak: Some(streak),
                    })
                }
            }
            (HealthState::Unhealthy { outage_id }, true) => Transition::Extend {
                outage_id: *outage_id,
            },
            (HealthState::Unhealthy { outage_id }, false) => Transition::Resolve {
                outage_id: *outage_id,
                ended_at: at,
            },
        }
    }
}

/// What an observed check did to the outage record.
#[derive(Debug, Clone, PartialEq)]
pub enum DetectorEvent {
    Unchanged,
    Opened(Outage),
    Extended { outage_id: i64 },
    Resolved(Outage),
}

/// Store-backed outage detector shared by all probe recorders.
pub struct OutageDetector {
    store: Arc<Store>,
    config: DebounceConfig,
    states: Mutex<HashMap<i64, HealthState>>,
}

impl OutageDetector {
    pub fn new(store: Arc<Store>, config: DebounceConfig) -> Self {
        Self {
            store,
            config,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Feed one health check. Checks of one endpoint must arrive in probe order.
    pub fn observe(&self, check: &HealthCheckResult) -> Result<DetectorEvent, DbError> {
        let mut states = self.states.lock().map_err(|_| DbError::Poisoned)?;
        let state = match states.remove(&check.endpoint_id) {
            Some(state) => state,
            None => self.recover(check)?,
        };

        let (next_state, result) = self.apply(state, check);
        if let Some(next_state) = next_state {
            states.insert(check.endpoint_id, next_state);
        }
        result
    }

    /// Drop cached state, e.g. after the endpoint stops being probed.
    pub fn forget(&self, endpoint_id: i64) {
        if let Ok(mut states) = self.states.lock() {
            states.remove(&endpoint_id);
        }
    }

    fn apply(
        &self,
        state: HealthState,
        check: &HealthCheckResult,
    ) -> (Option<HealthState>, Result<DetectorEvent, DbError>) {
        match state.next(check.status, check.checked_at, &self.config) {
            Transition::Stay(next) => (Some(next), Ok(DetectorEvent::Unchanged)),
            Transition::Open(streak) => {
                match self.store.open_outage(
                    &check.tenant_id,
                    check.endpoint_id,
                    streak.started_at,
                    streak.len,
                ) {
                    Ok((outage, created)) => {
                        if created {
                            tracing::warn!(
                                tenant = %check.tenant_id,
                                endpoint_id = check.endpoint_id,
                                failures = outage.failure_count,
                                "OUTAGE DETECTED since {}",
                                outage.started_at
                            );
                        } else {
                            tracing::info!(
                                endpoint_id = check.endpoint_id,
                                outage_id = outage.id,
                                "Reusing ongoing outage opened elsewhere"
                            );
                        }
                        (
                            Some(HealthState::Unhealthy { outage_id: outage.id }),
                            Ok(DetectorEvent::Opened(outage)),
                        )
                    }
                    // Keep the streak so the next failing check retries the open.
                    Err(e) => (Some(HealthState::Healthy { streak: Some(streak) }), Err(e)),
                }
            }
            Transition::Extend { outage_id } => match self.store.increment_outage_failures(&check.tenant_id, outage_id) {
                Ok(()) => (
                    Some(HealthState::Unhealthy { outage_id }),
                    Ok(DetectorEvent::Extended { outage_id }),
                ),
                // Resolved elsewhere or write failed: rebuild from the store next time.
                Err(e) => (None, Err(e)),
            },
            Transition::Resolve { outage_id, ended_at } => match self.store.resolve_outage(&check.tenant_id, outage_id, ended_at) {
                Ok(outage) => {
                    tracing::info!(
                        tenant = %check.tenant_id,
                        endpoint_id = check.endpoint_id,
                        duration_secs = outage.duration_secs.unwrap_or_default(),
                        "OUTAGE RESOLVED"
                    );
                    (
                        Some(HealthState::Healthy { streak: None }),
                        Ok(DetectorEvent::Resolved(outage)),
                    )
                }
                Err(DbError::NotFound) => (
                    Some(HealthState::Healthy { streak: None }),
                    Ok(DetectorEvent::Unchanged),
                ),
                Err(e) => (Some(HealthState::Unhealthy { outage_id }), Err(e)),
            },
        }
    }

    /// Rebuild state from persisted rows, excluding `current` itself.
    fn recover(&self, current: &HealthCheckResult) -> Result<HealthState, DbError> {
        if let Some(outage) = self
            .store
            .ongoing_outage(&current.tenant_id, current.endpoint_id)?
        {
            return Ok(HealthState::Unhealthy { outage_id: outage.id });
        }

        let history = self.store.recent_health_checks(
            &current.tenant_id,
            current.endpoint_id,
            RECOVERY_WINDOW,
        )?;
        let streak = history
            .iter()
            .filter(|c| current.id == 0 || c.id < current.id)
            .fold(None, |streak: Option<Streak>, c| {
                if c.status.is_failure() {
                    Some(Streak::extend(streak.as_ref(), c.status, c.checked_at))
                } else {
                    None
                }
            });
        Ok(HealthState::Healthy { streak })
    }
}
