use std::collections::{BTreeMap, HashSet, VecDeque};

use tracing::{debug, info, warn};

use tributary_types::{new_id, Result, Token, TributaryError};

use super::merge::merge_rows;
use super::state::{
    Arrival, ArrivalSnapshot, CoalesceCheckpointState, CompletedKey, PendingCoalesce,
    PendingSnapshot, COALESCE_STATE_VERSION,
};
use super::{
    AcceptResult, AnomalyKind, ArrivalAnomaly, CoalesceMetadata, CoalesceOutcome,
    ResolutionTrigger,
};
use crate::canonical::finite_f64;
use crate::clock::SharedClock;
use crate::events::{AuditEvent, EventEmitter};
use crate::settings::{CoalescePolicy, CoalesceSettings};

/// How many resolved groups are remembered for late-arrival detection.
pub const DEFAULT_COMPLETED_KEY_CAPACITY: usize = 10_000;

/// (coalesce point, correlation key)
type GroupKey = (String, String);

/// Buffers branch tokens and resolves them under each point's policy.
///
/// Not thread-safe: the orchestrator drives it from a single loop. There is
/// no background timer; timeouts are evaluated only when
/// [`check_timeouts`](Self::check_timeouts) is called.
pub struct CoalesceExecutor {
    clock: SharedClock,
    emitter: EventEmitter,
    points: BTreeMap<String, CoalesceSettings>,
    pending: BTreeMap<GroupKey, PendingCoalesce>,
    completed: VecDeque<GroupKey>,
    completed_index: HashSet<GroupKey>,
    completed_capacity: usize,
}

impl CoalesceExecutor {
    pub fn new(clock: SharedClock, emitter: EventEmitter) -> Self {
        Self {
            clock,
            emitter,
            points: BTreeMap::new(),
            pending: BTreeMap::new(),
            completed: VecDeque::new(),
            completed_index: HashSet::new(),
            completed_capacity: DEFAULT_COMPLETED_KEY_CAPACITY,
        }
    }

    /// Bound the memory of resolved groups. Late arrivals for groups evicted
    /// from this memory open a new group instead of being reported.
    pub fn with_completed_capacity(mut self, capacity: usize) -> Self {
        self.completed_capacity = capacity.max(1);
        self
    }

    pub fn register_point(&mut self, settings: CoalesceSettings) -> Result<()> {
        settings.validate()?;
        if self.points.contains_key(&settings.name) {
            return Err(TributaryError::ValidationError(format!(
                "coalesce point '{}' is already registered",
                settings.name
            )));
        }
        for (field, branches) in settings.union_field_collisions() {
            warn!(
                coalesce = %settings.name,
                field = %field,
                branches = ?branches,
                "Union merge branches declare the same field; on conflicting values the last declared branch wins"
            );
        }
        debug!(coalesce = %settings.name, policy = ?settings.policy, merge = ?settings.merge, "Registered coalesce point");
        self.points.insert(settings.name.clone(), settings);
        Ok(())
    }

    pub fn point(&self, name: &str) -> Option<&CoalesceSettings> {
        self.points.get(name)
    }

    /// Number of groups still waiting for branches.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Buffer one branch token and resolve its group if the policy is met.
    ///
    /// Errors only on configuration defects: an unknown point, a token with
    /// no branch, or a branch the point does not expect. Late and duplicate
    /// arrivals are reported through [`AcceptResult::anomaly`].
    pub fn accept(
        &mut self,
        token: Token,
        coalesce_name: &str,
        correlation_key: &str,
    ) -> Result<AcceptResult> {
        let settings = self
            .points
            .get(coalesce_name)
            .ok_or_else(|| TributaryError::UnknownCoalescePoint(coalesce_name.to_string()))?;
        let Some(branch) = token.branch_name.clone() else {
            return Err(TributaryError::MissingBranchName {
                coalesce: coalesce_name.to_string(),
                token_id: token.token_id.clone(),
            });
        };
        if !settings.has_branch(&branch) {
            return Err(TributaryError::InvalidBranch {
                coalesce: coalesce_name.to_string(),
                branch,
                expected: settings.branches.clone(),
            });
        }

        let key: GroupKey = (coalesce_name.to_string(), correlation_key.to_string());
        if self.completed_index.contains(&key) {
            return Ok(self.record_anomaly(AnomalyKind::LateArrival, key, branch, token));
        }

        let now = self.clock.now();
        let group = self
            .pending
            .entry(key.clone())
            .or_insert_with(|| PendingCoalesce::new(now));
        if group.arrivals.contains_key(&branch) {
            return Ok(self.record_anomaly(AnomalyKind::DuplicateBranch, key, branch, token));
        }

        debug!(
            coalesce = %coalesce_name,
            key = %correlation_key,
            branch = %branch,
            token = %token.token_id,
            "Branch token arrived"
        );
        group.arrivals.insert(
            branch,
            Arrival {
                token,
                arrived_at: now,
            },
        );

        match resolution_trigger(settings, group.arrivals.len()) {
            Some(trigger) => Ok(self
                .close(&key, trigger, now)
                .map(AcceptResult::resolved)
                .unwrap_or_else(AcceptResult::held)),
            None => Ok(AcceptResult::held()),
        }
    }

    /// Resolve every group whose point has a timeout that has expired at `now`.
    ///
    /// `now` must not go backwards between calls.
    pub fn check_timeouts(&mut self, now: f64) -> Vec<CoalesceOutcome> {
        let expired: Vec<GroupKey> = self
            .pending
            .iter()
            .filter(|(key, group)| {
                self.points
                    .get(&key.0)
                    .and_then(|s| s.timeout_seconds)
                    .is_some_and(|timeout| group.age(now) >= timeout)
            })
            .map(|(key, _)| key.clone())
            .collect();

        expired
            .iter()
            .filter_map(|key| self.close(key, ResolutionTrigger::Timeout, now))
            .collect()
    }

    /// [`check_timeouts`](Self::check_timeouts) at the injected clock's current time.
    pub fn check_timeouts_now(&mut self) -> Vec<CoalesceOutcome> {
        let now = self.clock.now();
        self.check_timeouts(now)
    }

    /// Resolve all pending groups because the source is exhausted.
    pub fn flush_pending(&mut self) -> Vec<CoalesceOutcome> {
        let now = self.clock.now();
        let keys: Vec<GroupKey> = self.pending.keys().cloned().collect();
        keys.iter()
            .filter_map(|key| self.close(key, ResolutionTrigger::EndOfSource, now))
            .collect()
    }

    fn close(&mut self, key: &GroupKey, trigger: ResolutionTrigger, now: f64) -> Option<CoalesceOutcome> {
        let group = self.pending.remove(key)?;
        let Some(settings) = self.points.get(&key.0) else {
            warn!(coalesce = %key.0, key = %key.1, "Dropping pending group for unregistered coalesce point");
            return None;
        };
        let outcome = resolve_group(settings, &self.emitter, key, group, trigger, now);
        self.mark_completed(key.clone());
        Some(outcome)
    }

    fn mark_completed(&mut self, key: GroupKey) {
        if !self.completed_index.insert(key.clone()) {
            return;
        }
        self.completed.push_back(key);
        while self.completed.len() > self.completed_capacity {
            if let Some(evicted) = self.completed.pop_front() {
                self.completed_index.remove(&evicted);
            }
        }
    }

    fn record_anomaly(
        &self,
        kind: AnomalyKind,
        key: GroupKey,
        branch: String,
        token: Token,
    ) -> AcceptResult {
        let (coalesce_name, correlation_key) = key;
        warn!(
            coalesce = %coalesce_name,
            key = %correlation_key,
            branch = %branch,
            token = %token.token_id,
            kind = ?kind,
            "Branch token not buffered"
        );
        self.emitter.emit(AuditEvent::ArrivalAnomaly {
            coalesce: coalesce_name.clone(),
            correlation_key: correlation_key.clone(),
            kind,
            branch: branch.clone(),
            token_id: token.token_id.clone(),
        });
        AcceptResult::anomaly(ArrivalAnomaly {
            kind,
            coalesce_name,
            correlation_key,
            branch,
            token,
        })
    }

    // -----------------------------------------------------------------------
    // Checkpoint
    // -----------------------------------------------------------------------

    pub fn checkpoint_state(&self) -> Result<CoalesceCheckpointState> {
        let now = self.clock.now();
        let pending = self
            .pending
            .iter()
            .map(|((name, key), group)| {
                let arrivals = group
                    .arrivals
                    .iter()
                    .map(|(branch, arrival)| {
                        Ok(ArrivalSnapshot {
                            branch: branch.clone(),
                            token: arrival.token.clone(),
                            offset_seconds: finite_f64(
                                "coalesce arrival offset",
                                arrival.arrived_at - group.created_at,
                            )?,
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok(PendingSnapshot {
                    coalesce_name: name.clone(),
                    correlation_key: key.clone(),
                    elapsed_age_seconds: finite_f64("coalesce group age", group.age(now))?,
                    arrivals,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let completed = self
            .completed
            .iter()
            .map(|(name, key)| CompletedKey {
                coalesce_name: name.clone(),
                correlation_key: key.clone(),
            })
            .collect();
        Ok(CoalesceCheckpointState {
            version: Some(COALESCE_STATE_VERSION.to_string()),
            pending,
            completed,
        })
    }

    /// Serialized pending groups and resolved-group memory.
    pub fn get_checkpoint_state(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self.checkpoint_state()?)?)
    }

    /// Replace all buffered state with a checkpoint blob.
    ///
    /// Fails with [`TributaryError::IncompatibleCheckpoint`] unless the blob's
    /// `_version` equals [`COALESCE_STATE_VERSION`]. Group ages continue from
    /// where they were at capture, measured against this executor's clock.
    pub fn restore_from_checkpoint(&mut self, state: &serde_json::Value) -> Result<()> {
        let state = CoalesceCheckpointState::from_value(state)?;
        let now = self.clock.now();

        let mut pending = BTreeMap::new();
        for snapshot in state.pending {
            let settings = self
                .points
                .get(&snapshot.coalesce_name)
                .ok_or_else(|| TributaryError::UnknownCoalescePoint(snapshot.coalesce_name.clone()))?;
            let age = finite_f64("restored coalesce group age", snapshot.elapsed_age_seconds)?;
            let mut group = PendingCoalesce::new(now - age);
            for arrival in snapshot.arrivals {
                if !settings.has_branch(&arrival.branch) {
                    return Err(TributaryError::InvalidBranch {
                        coalesce: snapshot.coalesce_name.clone(),
                        branch: arrival.branch,
                        expected: settings.branches.clone(),
                    });
                }
                let offset = finite_f64("restored coalesce arrival offset", arrival.offset_seconds)?;
                let arrived_at = group.created_at + offset;
                group.arrivals.insert(
                    arrival.branch,
                    Arrival {
                        token: arrival.token,
                        arrived_at,
                    },
                );
            }
            pending.insert((snapshot.coalesce_name, snapshot.correlation_key), group);
        }

        self.pending = pending;
        self.completed.clear();
        self.completed_index.clear();
        for done in state.completed {
            self.mark_completed((done.coalesce_name, done.correlation_key));
        }

        info!(
            pending = self.pending.len(),
            completed = self.completed.len(),
            "Restored coalesce state from checkpoint"
        );
        Ok(())
    }
}

impl std::fmt::Debug for CoalesceExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoalesceExecutor")
            .field("points", &self.points.keys().collect::<Vec<_>>())
            .field("pending", &self.pending.len())
            .field("completed", &self.completed.len())
            .finish()
    }
}

/// Whether a group holding `arrived` distinct branches resolves on arrival.
fn resolution_trigger(settings: &CoalesceSettings, arrived: usize) -> Option<ResolutionTrigger> {
    match settings.policy {
        CoalescePolicy::First => Some(ResolutionTrigger::FirstArrived),
        CoalescePolicy::Quorum => {
            let needed = settings.quorum_count.unwrap_or(settings.branches.len());
            (arrived >= needed).then_some(ResolutionTrigger::QuorumMet)
        }
        CoalescePolicy::RequireAll | CoalescePolicy::BestEffort => {
            (arrived >= settings.branches.len()).then_some(ResolutionTrigger::AllArrived)
        }
    }
}

fn resolve_group(
    settings: &CoalesceSettings,
    emitter: &EventEmitter,
    key: &GroupKey,
    mut group: PendingCoalesce,
    trigger: ResolutionTrigger,
    now: f64,
) -> CoalesceOutcome {
    let mut present = Vec::new();
    let mut missing = Vec::new();
    let mut tokens = Vec::new();
    let mut arrival_offsets = BTreeMap::new();
    for branch in &settings.branches {
        match group.arrivals.remove(branch) {
            Some(arrival) => {
                arrival_offsets.insert(branch.clone(), arrival.arrived_at - group.created_at);
                present.push(branch.clone());
                tokens.push(arrival.token);
            }
            None => missing.push(branch.clone()),
        }
    }

    let mut metadata = CoalesceMetadata {
        coalesce_name: settings.name.clone(),
        correlation_key: key.1.clone(),
        policy: settings.policy,
        merge: settings.merge,
        trigger,
        branches_present: present,
        branches_missing: missing,
        parent_token_ids: tokens.iter().map(|t| t.token_id.clone()).collect(),
        consumed_tokens: Vec::new(),
        arrival_offsets,
        wait_seconds: group.age(now),
        resolved_at: now,
        union_collisions: Vec::new(),
    };

    let quorum = settings.quorum_count.unwrap_or(settings.branches.len());
    let outcome = match settings.policy {
        CoalescePolicy::RequireAll if !metadata.branches_missing.is_empty() => {
            metadata.consumed_tokens = tokens;
            CoalesceOutcome::IncompleteBranches { metadata }
        }
        CoalescePolicy::Quorum if metadata.branches_present.len() < quorum => {
            metadata.consumed_tokens = tokens;
            CoalesceOutcome::QuorumNotMet {
                quorum_count: quorum,
                metadata,
            }
        }
        _ => {
            let rows: Vec<(&str, &tributary_types::RowData)> = metadata
                .branches_present
                .iter()
                .map(String::as_str)
                .zip(tokens.iter().map(|t| &t.row_data))
                .collect();
            match merge_rows(settings.merge, settings.select_branch.as_deref(), &rows) {
                Some(merged) => {
                    let row_id = tokens
                        .first()
                        .map(|t| t.row_id.clone())
                        .unwrap_or_else(|| key.1.clone());
                    let token = Token::joined(row_id, merged.data, new_id());
                    metadata.union_collisions = merged.collisions;
                    metadata.consumed_tokens = tokens;
                    CoalesceOutcome::Merged { token, metadata }
                }
                None => {
                    metadata.consumed_tokens = tokens;
                    CoalesceOutcome::MissingSelectedBranch {
                        select_branch: settings.select_branch.clone().unwrap_or_default(),
                        metadata,
                    }
                }
            }
        }
    };

    record_resolution(emitter, &outcome);
    outcome
}

fn record_resolution(emitter: &EventEmitter, outcome: &CoalesceOutcome) {
    let m = outcome.metadata();
    match outcome {
        CoalesceOutcome::Merged { token, metadata } => {
            for collision in &metadata.union_collisions {
                warn!(
                    coalesce = %metadata.coalesce_name,
                    key = %metadata.correlation_key,
                    field = %collision.field,
                    winner = %collision.winner,
                    "Union merge overwrote a conflicting field value"
                );
            }
            info!(
                coalesce = %metadata.coalesce_name,
                key = %metadata.correlation_key,
                trigger = ?metadata.trigger,
                present = ?metadata.branches_present,
                missing = ?metadata.branches_missing,
                token = %token.token_id,
                "Coalesce group merged"
            );
            emitter.emit(AuditEvent::CoalesceResolved {
                coalesce: metadata.coalesce_name.clone(),
                correlation_key: metadata.correlation_key.clone(),
                trigger: metadata.trigger,
                merged_token_id: token.token_id.clone(),
                branches_present: metadata.branches_present.clone(),
                branches_missing: metadata.branches_missing.clone(),
                parent_token_ids: metadata.parent_token_ids.clone(),
                union_collisions: metadata.union_collisions.clone(),
            });
        }
        _ => {
            let Some(failure) = outcome.failure() else {
                return;
            };
            warn!(
                coalesce = %m.coalesce_name,
                key = %m.correlation_key,
                trigger = ?m.trigger,
                failure = failure.as_str(),
                present = ?m.branches_present,
                missing = ?m.branches_missing,
                "Coalesce group failed"
            );
            emitter.emit(AuditEvent::CoalesceFailed {
                coalesce: m.coalesce_name.clone(),
                correlation_key: m.correlation_key.clone(),
                trigger: m.trigger,
                failure,
                branches_present: m.branches_present.clone(),
                branches_missing: m.branches_missing.clone(),
                parent_token_ids: m.parent_token_ids.clone(),
            });
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
