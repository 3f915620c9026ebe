//! Readiness gate
//!
//! Polling wait over the coordination store. A dependent pipeline never talks
//! to its upstream pipelines; it waits here until their records show up or
//! its deadline passes.

use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use tradeswarm_storage::{CoordinationStore, OutputKind, OutputRecord, RecordStatus, SessionId};

use crate::config::{GateConfig, PollBackoff};
use crate::error::{OrchestratorError, Result};

/// Floor for the poll interval; zero would spin until the deadline
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Timing for one wait
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GateOptions {
    pub poll_interval: Duration,
    pub deadline: Duration,
    pub backoff: PollBackoff,
}

impl GateOptions {
    pub fn new(poll_interval: Duration, deadline: Duration) -> Self {
        Self {
            poll_interval: poll_interval.max(MIN_POLL_INTERVAL),
            deadline,
            backoff: PollBackoff::Fixed,
        }
    }

    pub fn with_backoff(mut self, backoff: PollBackoff) -> Self {
        self.backoff = backoff;
        self
    }
}

impl Default for GateOptions {
    fn default() -> Self {
        Self::from(&GateConfig::default())
    }
}

impl From<&GateConfig> for GateOptions {
    fn from(config: &GateConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            deadline: config.deadline(),
            backoff: config.backoff,
        }
    }
}

/// Latest record per output kind for one session, as seen by a single poll
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionSnapshot {
    records: BTreeMap<OutputKind, OutputRecord>,
}

impl SessionSnapshot {
    pub fn from_records(records: impl IntoIterator<Item = OutputRecord>) -> Self {
        let mut map: BTreeMap<OutputKind, OutputRecord> = BTreeMap::new();
        for record in records {
            let newer = map
                .get(&record.output_kind)
                .map_or(true, |existing| existing.sequence_no < record.sequence_no);
            if newer {
                map.insert(record.output_kind, record);
            }
        }
        Self { records: map }
    }

    pub fn get(&self, kind: OutputKind) -> Option<&OutputRecord> {
        self.records.get(&kind)
    }

    /// The record for `kind` if it is complete
    pub fn complete(&self, kind: OutputKind) -> Option<&OutputRecord> {
        self.get(kind).filter(|r| r.status == RecordStatus::Complete)
    }

    pub fn is_complete(&self, kind: OutputKind) -> bool {
        self.complete(kind).is_some()
    }

    /// Complete or failed
    pub fn is_resolved(&self, kind: OutputKind) -> bool {
        self.get(kind).map_or(false, |r| r.status.is_terminal())
    }

    /// Kinds among `kinds` without a complete record
    pub fn missing(&self, kinds: &[OutputKind]) -> Vec<OutputKind> {
        kinds
            .iter()
            .copied()
            .filter(|k| !self.is_complete(*k))
            .collect()
    }

    /// Kinds among `kinds` whose latest record is failed
    pub fn failed(&self, kinds: &[OutputKind]) -> Vec<OutputKind> {
        kinds
            .iter()
            .copied()
            .filter(|k| {
                self.get(*k)
                    .map_or(false, |r| r.status == RecordStatus::Failed)
            })
            .collect()
    }

    /// Payloads of every complete record
    pub fn payloads(&self) -> BTreeMap<OutputKind, Value> {
        self.records
            .values()
            .filter(|r| r.is_complete())
            .map(|r| (r.output_kind, r.payload.clone()))
            .collect()
    }

    /// Payloads of the complete records among `kinds`
    pub fn payloads_for(&self, kinds: &[OutputKind]) -> BTreeMap<OutputKind, Value> {
        kinds
            .iter()
            .filter_map(|k| self.complete(*k).map(|r| (*k, r.payload.clone())))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Polling readiness primitive
///
/// Holds nothing but the store handle, so any number of pipelines can wait on
/// the same or overlapping predicates at once.
#[derive(Clone)]
pub struct ReadinessGate {
    store: Arc<dyn CoordinationStore>,
}

impl ReadinessGate {
    pub fn new(store: Arc<dyn CoordinationStore>) -> Self {
        Self { store }
    }

    /// Poll until `predicate` holds, the deadline passes, or `cancel` fires.
    ///
    /// The first poll happens immediately. Sleeps are clamped to the time left,
    /// so the final poll runs at the deadline and the timeout is never early.
    pub async fn await_ready<P>(
        &self,
        session_id: &SessionId,
        predicate: P,
        options: &GateOptions,
        cancel: &CancellationToken,
    ) -> Result<SessionSnapshot>
    where
        P: Fn(&SessionSnapshot) -> bool,
    {
        let started = Instant::now();
        let deadline = started + options.deadline;
        let mut interval = options.poll_interval.max(MIN_POLL_INTERVAL);
        let mut polls: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(OrchestratorError::cancelled(format!(
                    "readiness wait for session {} abandoned",
                    session_id
                )));
            }

            polls += 1;
            match self.store.query_all(session_id).await {
                Ok(records) => {
                    let snapshot = SessionSnapshot::from_records(records);
                    if predicate(&snapshot) {
                        debug!(
                            session_id = %session_id,
                            polls,
                            waited_ms = started.elapsed().as_millis() as u64,
                            "inputs ready"
                        );
                        return Ok(snapshot);
                    }
                }
                Err(e) => {
                    warn!(session_id = %session_id, error = %e, "readiness poll failed; retrying");
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(OrchestratorError::Timeout(format!(
                    "session {} not ready after {}ms ({} polls)",
                    session_id,
                    options.deadline.as_millis(),
                    polls
                )));
            }

            let sleep_for = interval.min(deadline - now);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(OrchestratorError::cancelled(format!(
                        "readiness wait for session {} abandoned",
                        session_id
                    )));
                }
                _ = tokio::time::sleep(sleep_for) => {}
            }
            interval = options.backoff.next_interval(interval);
        }
    }

    /// Wait until every kind in `kinds` has a complete or failed record
    ///
    /// Callers inspect [`SessionSnapshot::failed`] to see which inputs failed.
    pub async fn await_kinds(
        &self,
        session_id: &SessionId,
        kinds: &[OutputKind],
        options: &GateOptions,
        cancel: &CancellationToken,
    ) -> Result<SessionSnapshot> {
        self.await_ready(
            session_id,
            |snapshot| kinds.iter().all(|k| snapshot.is_resolved(*k)),
            options,
            cancel,
        )
        .await
    }

    /// One read of the current session state; empty on read failure
    pub async fn snapshot(&self, session_id: &SessionId) -> SessionSnapshot {
        match self.store.query_all(session_id).await {
            Ok(records) => SessionSnapshot::from_records(records),
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "snapshot read failed");
                SessionSnapshot::default()
            }
        }
    }
}
