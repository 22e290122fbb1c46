//! Scope lifecycle state machine and retry timing.
//!
//! ```text
//! never-synced ─┐
//! synced-*  ────┼─ Triggered ─▶ syncing ─┬─ Completed{0}  ─▶ synced-in-sync
//! error ────────┘                        ├─ Completed{n}  ─▶ synced-drifted
//!                                        └─ Failed        ─▶ error
//! ```
//!
//! State is derived only from the outcome of the most recent attempt; the
//! bookkeeping on [`Scope`] never consults wall-clock age to pick a state.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::types::{Scope, ScopeError, ScopeErrorKind};

/// Consecutive authorization failures before a scope is flagged for an operator.
pub const DEFAULT_ATTENTION_THRESHOLD: u32 = 3;

/// Extra multiplier applied to authorization-failure backoff.
const AUTHORIZATION_BACKOFF_FACTOR: i64 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ScopeState {
    #[default]
    NeverSynced,
    Syncing,
    SyncedInSync,
    SyncedDrifted,
    Error,
}

impl fmt::Display for ScopeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ScopeState::NeverSynced => "never-synced",
            ScopeState::Syncing => "syncing",
            ScopeState::SyncedInSync => "synced-in-sync",
            ScopeState::SyncedDrifted => "synced-drifted",
            ScopeState::Error => "error",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScopeEvent {
    /// A scheduled, watcher, or manual trigger started a run.
    Triggered,
    /// The run finished; `unresolved` counts conflicts and held operations.
    Completed { unresolved: usize },
    /// The run hit a scope-level error.
    Failed,
}

impl fmt::Display for ScopeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScopeEvent::Triggered => f.write_str("triggered"),
            ScopeEvent::Completed { unresolved } => write!(f, "completed({unresolved})"),
            ScopeEvent::Failed => f.write_str("failed"),
        }
    }
}

impl ScopeState {
    pub fn apply(self, event: &ScopeEvent) -> Result<ScopeState, CoreError> {
        use ScopeState::*;
        let next = match (self, event) {
            (Syncing, ScopeEvent::Triggered) => None,
            (_, ScopeEvent::Triggered) => Some(Syncing),
            (Syncing, ScopeEvent::Completed { unresolved: 0 }) => Some(SyncedInSync),
            (Syncing, ScopeEvent::Completed { .. }) => Some(SyncedDrifted),
            (Syncing, ScopeEvent::Failed) => Some(Error),
            _ => None,
        };
        next.ok_or_else(|| CoreError::InvalidTransition {
            from: self,
            event: event.to_string(),
        })
    }

    pub fn is_syncing(self) -> bool {
        matches!(self, ScopeState::Syncing)
    }
}

/// Delay before the next attempt after `failures` consecutive failures.
///
/// `interval * 2^(failures-1)`, multiplied for authorization failures, and
/// capped at `max_backoff_secs`.
pub fn backoff_delay(
    interval_secs: u64,
    max_backoff_secs: u64,
    failures: u32,
    kind: ScopeErrorKind,
) -> Duration {
    let interval = i64::try_from(interval_secs).unwrap_or(i64::MAX);
    let cap = i64::try_from(max_backoff_secs).unwrap_or(i64::MAX);
    let exponent = failures.saturating_sub(1).min(32);
    let mut secs = interval.saturating_mul(1_i64 << exponent);
    if kind == ScopeErrorKind::Authorization {
        secs = secs.saturating_mul(AUTHORIZATION_BACKOFF_FACTOR);
    }
    Duration::seconds(secs.min(cap))
}

impl Scope {
    /// Enter `syncing`. Fails if a run is already recorded as in flight.
    pub fn begin_run(&mut self, now: DateTime<Utc>) -> Result<(), CoreError> {
        self.state = self.state.apply(&ScopeEvent::Triggered)?;
        self.last_run = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// Leave `syncing` after a run that reached the end of its plan.
    pub fn finish_success(
        &mut self,
        now: DateTime<Utc>,
        unresolved: usize,
        conflicts: usize,
    ) -> Result<(), CoreError> {
        self.state = self.state.apply(&ScopeEvent::Completed { unresolved })?;
        self.consecutive_failures = 0;
        self.needs_attention = false;
        self.last_error = None;
        self.pending_conflicts = conflicts;
        let target = if unresolved == 0 { 1.0 } else { 0.5 };
        self.health = (self.health + target) / 2.0;
        let anchor = self.last_run.unwrap_or(now);
        self.next_eligible_at = Some(anchor + interval(self));
        self.updated_at = now;
        Ok(())
    }

    /// Leave `syncing` after a scope-level error and schedule a backed-off retry.
    pub fn finish_failure(
        &mut self,
        now: DateTime<Utc>,
        kind: ScopeErrorKind,
        message: impl Into<String>,
        attention_threshold: u32,
    ) -> Result<(), CoreError> {
        self.state = self.state.apply(&ScopeEvent::Failed)?;
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        if kind == ScopeErrorKind::Authorization
            && self.consecutive_failures >= attention_threshold
        {
            self.needs_attention = true;
        }
        self.last_error = Some(ScopeError {
            kind,
            message: message.into(),
            at: now,
        });
        self.health /= 2.0;
        let delay = backoff_delay(
            self.config.interval_secs,
            self.config.max_backoff_secs,
            self.consecutive_failures,
            kind,
        );
        self.next_eligible_at = Some(now + delay);
        self.updated_at = now;
        Ok(())
    }

    /// A record still saying `syncing` at startup belongs to a run that died
    /// with the previous process. Returns `true` if the record was changed.
    pub fn recover_interrupted(&mut self, now: DateTime<Utc>) -> bool {
        if !self.state.is_syncing() {
            return false;
        }
        self.state = ScopeState::Error;
        self.last_error = Some(ScopeError {
            kind: ScopeErrorKind::Internal,
            message: "run interrupted by process restart".to_string(),
            at: now,
        });
        self.next_eligible_at = Some(now);
        self.updated_at = now;
        true
    }

    /// End of the retry window after a failed run, while it is still open.
    pub fn backoff_until(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if self.state != ScopeState::Error {
            return None;
        }
        self.next_eligible_at.filter(|next| *next > now)
    }

    /// Schedule eligibility: enabled, not in flight, interval elapsed since
    /// the last run, and past any backoff window.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        if !self.config.enabled || self.state.is_syncing() {
            return false;
        }
        if let Some(next) = self.next_eligible_at {
            if now < next {
                return false;
            }
        }
        match self.last_run {
            None => true,
            Some(last) => now - last >= interval(self) || self.state == ScopeState::Error,
        }
    }
}

fn interval(scope: &Scope) -> Duration {
    Duration::seconds(i64::try_from(scope.config.interval_secs).unwrap_or(i64::MAX))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::types::{ScopeConfig, ScopeId};

    fn scope() -> Scope {
        Scope::new(
            ScopeId::from("fabric-1"),
            PathBuf::from("/srv/fabric-1"),
            ScopeConfig {
                interval_secs: 60,
                max_backoff_secs: 600,
                ..ScopeConfig::default()
            },
        )
    }

    #[test]
    fn happy_path_transitions() {
        use ScopeState::*;
        assert_eq!(NeverSynced.apply(&ScopeEvent::Triggered).unwrap(), Syncing);
        assert_eq!(
            Syncing
                .apply(&ScopeEvent::Completed { unresolved: 0 })
                .unwrap(),
            SyncedInSync
        );
        assert_eq!(
            Syncing
                .apply(&ScopeEvent::Completed { unresolved: 2 })
                .unwrap(),
            SyncedDrifted
        );
        assert_eq!(Syncing.apply(&ScopeEvent::Failed).unwrap(), Error);
        for from in [SyncedInSync, SyncedDrifted, Error] {
            assert_eq!(from.apply(&ScopeEvent::Triggered).unwrap(), Syncing);
        }
    }

    #[test]
    fn double_trigger_is_rejected() {
        let err = ScopeState::Syncing
            .apply(&ScopeEvent::Triggered)
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidTransition { .. }));
        assert!(err.to_string().contains("syncing"));
    }

    #[test]
    fn completion_outside_a_run_is_rejected() {
        assert!(ScopeState::SyncedInSync
            .apply(&ScopeEvent::Completed { unresolved: 0 })
            .is_err());
        assert!(ScopeState::NeverSynced.apply(&ScopeEvent::Failed).is_err());
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let kind = ScopeErrorKind::Connectivity;
        assert_eq!(backoff_delay(60, 600, 1, kind), Duration::seconds(60));
        assert_eq!(backoff_delay(60, 600, 2, kind), Duration::seconds(120));
        assert_eq!(backoff_delay(60, 600, 3, kind), Duration::seconds(240));
        assert_eq!(backoff_delay(60, 600, 9, kind), Duration::seconds(600));
        assert_eq!(backoff_delay(60, 600, 200, kind), Duration::seconds(600));
    }

    #[test]
    fn authorization_backoff_is_longer() {
        let conn = backoff_delay(60, 3600, 1, ScopeErrorKind::Connectivity);
        let auth = backoff_delay(60, 3600, 1, ScopeErrorKind::Authorization);
        assert!(auth > conn);
    }

    #[test]
    fn failure_schedules_backoff_and_flags_attention() {
        let mut s = scope();
        let t0 = Utc::now();
        for n in 1..=3 {
            s.begin_run(t0).unwrap();
            s.finish_failure(t0, ScopeErrorKind::Authorization, "denied", 3)
                .unwrap();
            assert_eq!(s.consecutive_failures, n);
        }
        assert!(s.needs_attention);
        assert_eq!(s.state, ScopeState::Error);
        assert!(s.next_eligible_at.unwrap() > t0);
        assert!(!s.is_due(t0));

        s.begin_run(t0).unwrap();
        s.finish_success(t0, 0, 0).unwrap();
        assert_eq!(s.consecutive_failures, 0);
        assert!(!s.needs_attention);
        assert!(s.last_error.is_none());
    }

    #[test]
    fn due_after_interval_only() {
        let mut s = scope();
        let t0 = Utc::now();
        assert!(s.is_due(t0), "never-run scope is due immediately");
        s.begin_run(t0).unwrap();
        assert!(!s.is_due(t0 + Duration::seconds(3600)), "in flight");
        s.finish_success(t0, 0, 0).unwrap();
        assert!(!s.is_due(t0 + Duration::seconds(59)));
        assert!(s.is_due(t0 + Duration::seconds(60)));

        s.config.enabled = false;
        assert!(!s.is_due(t0 + Duration::seconds(3600)));
    }

    #[test]
    fn backoff_window_only_follows_a_failure() {
        let mut s = scope();
        let t0 = Utc::now();
        s.begin_run(t0).unwrap();
        s.finish_success(t0, 0, 0).unwrap();
        assert_eq!(s.backoff_until(t0), None, "next interval is not a backoff");

        s.begin_run(t0).unwrap();
        s.finish_failure(t0, ScopeErrorKind::Connectivity, "down", 3).unwrap();
        let until = s.backoff_until(t0).expect("in backoff");
        assert_eq!(until, t0 + Duration::seconds(60));
        assert_eq!(s.backoff_until(until), None);
    }

    #[test]
    fn health_moves_with_outcomes() {
        let mut s = scope();
        let t0 = Utc::now();
        s.begin_run(t0).unwrap();
        s.finish_failure(t0, ScopeErrorKind::Timeout, "slow", 3).unwrap();
        assert!((s.health - 0.5).abs() < f64::EPSILON);
        s.begin_run(t0).unwrap();
        s.finish_success(t0, 0, 0).unwrap();
        assert!((s.health - 0.75).abs() < f64::EPSILON);
        assert!((0.0..=1.0).contains(&s.health));
    }

    #[test]
    fn recover_interrupted_only_touches_syncing() {
        let mut s = scope();
        let now = Utc::now();
        assert!(!s.recover_interrupted(now));
        s.begin_run(now).unwrap();
        assert!(s.recover_interrupted(now));
        assert_eq!(s.state, ScopeState::Error);
        assert!(s.is_due(now));
    }
}
