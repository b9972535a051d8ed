//! In-memory implementation of the coordination store.
//!
//! Mirrors the semantics of the Postgres batch function (lease discipline,
//! dedup, event persistence, perspective auto-creation, monotone checkpoints
//! and the per-(stream, perspective) claim restriction) behind a single
//! mutex. The explicit clock in [`WorkBatchOptions`] drives lease expiry, so
//! tests control time without sleeping.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use uuid::Uuid;

use crate::associations::{fuzzy_match, AssociationType, MessageAssociation};
use crate::batch::{
    FailureReport, StateTransitions, WorkBatchOptions, WorkBatchReply, WorkBatchRequest,
};
use crate::error::StoreResult;
use crate::status::{inbox as inbox_status, work, CheckpointStatus};
use crate::types::{
    EventRecord, InboxMessageRow, InboxWork, InstanceIdentity, NewInboxMessage, NewOutboxMessage,
    OutboxMessageRow, OutboxWork, PerspectiveCheckpoint, PerspectiveEventRow, PerspectiveWork,
};
use crate::WorkStore;

#[derive(Default)]
struct State {
    instances: HashMap<Uuid, (InstanceIdentity, DateTime<Utc>)>,
    outbox: Vec<OutboxMessageRow>,
    inbox: Vec<InboxMessageRow>,
    events: Vec<EventRecord>,
    next_sequence: i64,
    associations: Vec<MessageAssociation>,
    checkpoints: HashMap<(Uuid, String), PerspectiveCheckpoint>,
    perspective_events: Vec<PerspectiveEventRow>,
    dedup: HashMap<Uuid, (DateTime<Utc>, String)>,
    receptor_log: HashMap<(Uuid, String), Option<String>>,
}

impl State {
    fn next_version(&self, stream_id: Uuid) -> i64 {
        self.events
            .iter()
            .filter(|e| e.stream_id == stream_id)
            .map(|e| e.version)
            .max()
            .unwrap_or(0)
            + 1
    }

    fn sequence_of(&self, event_id: Uuid) -> Option<i64> {
        self.events
            .iter()
            .find(|e| e.event_id == event_id)
            .map(|e| e.sequence_number)
    }

    fn has_event(&self, event_id: Uuid) -> bool {
        self.events.iter().any(|e| e.event_id == event_id)
    }

    fn store_event(
        &mut self,
        event_id: Uuid,
        stream_id: Uuid,
        aggregate_type: String,
        event_type: String,
        event_data: serde_json::Value,
        metadata: serde_json::Value,
        scope: Option<serde_json::Value>,
        now: DateTime<Utc>,
    ) -> (Uuid, Uuid, String) {
        self.next_sequence += 1;
        let version = self.next_version(stream_id);
        self.events.push(EventRecord {
            event_id,
            stream_id,
            aggregate_type,
            event_type: event_type.clone(),
            event_data,
            metadata,
            scope,
            sequence_number: self.next_sequence,
            version,
            created_at: now,
        });
        (event_id, stream_id, event_type)
    }
}

/// In-process [`WorkStore`] with full batch semantics.
#[derive(Default)]
pub struct MemoryWorkStore {
    state: Mutex<State>,
}

impl MemoryWorkStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset a failed (stream, perspective) pair for redelivery: clears the
    /// checkpoint error and returns failed work rows to the claimable pool.
    pub fn clear_perspective_failure(&self, stream_id: Uuid, perspective_name: &str) {
        let mut state = self.state.lock();
        if let Some(checkpoint) = state
            .checkpoints
            .get_mut(&(stream_id, perspective_name.to_string()))
        {
            if checkpoint.status == CheckpointStatus::Failed {
                checkpoint.status = if checkpoint.last_event_id.is_some() {
                    CheckpointStatus::Completed
                } else {
                    CheckpointStatus::None
                };
                checkpoint.error = None;
            }
        }
        for row in state
            .perspective_events
            .iter_mut()
            .filter(|r| r.stream_id == stream_id && r.perspective_name == perspective_name)
        {
            if row.status & work::FAILED != 0 {
                row.status &= !work::FAILED;
                row.last_error = None;
            }
        }
    }

    fn apply_heartbeat(state: &mut State, request: &WorkBatchRequest) {
        state.instances.insert(
            request.instance.instance_id,
            (request.instance.clone(), request.options.now),
        );
    }

    fn recover_leases(state: &mut State, now: DateTime<Utc>) {
        for row in state.outbox.iter_mut() {
            if row.lease_expiry.map_or(false, |l| l < now) && row.status & 28 == 0 {
                row.status &= !work::LEASE_BITS;
                row.instance_id = None;
                row.lease_expiry = None;
            }
        }
        for row in state.inbox.iter_mut() {
            if row.lease_expiry.map_or(false, |l| l < now) && row.status & 6 == 0 {
                row.status &= !inbox_status::CLAIMED;
                row.instance_id = None;
                row.lease_expiry = None;
            }
        }
        for row in state.perspective_events.iter_mut() {
            if row.lease_expiry.map_or(false, |l| l < now) && row.status & 28 == 0 {
                row.status &= !work::LEASE_BITS;
                row.instance_id = None;
                row.lease_expiry = None;
            }
        }
    }

    fn apply_transitions(state: &mut State, transitions: &StateTransitions, now: DateTime<Utc>) {
        for id in &transitions.outbox_completions {
            if let Some(row) = state.outbox.iter_mut().find(|r| r.message_id == *id) {
                row.status = (row.status | work::COMPLETED) & !work::LEASE_BITS;
                row.instance_id = None;
                row.lease_expiry = None;
            }
        }
        for failure in &transitions.outbox_failures {
            if let Some(row) = state.outbox.iter_mut().find(|r| r.message_id == failure.id) {
                if row.status & work::COMPLETED != 0 {
                    continue;
                }
                apply_work_failure(&mut row.status, failure);
                row.last_error = Some(failure.error.clone());
                row.instance_id = None;
                row.lease_expiry = None;
            }
        }
        for id in &transitions.inbox_completions {
            if let Some(row) = state.inbox.iter_mut().find(|r| r.message_id == *id) {
                row.status = (row.status | inbox_status::PROCESSED) & !inbox_status::CLAIMED;
                row.instance_id = None;
                row.lease_expiry = None;
            }
        }
        for failure in &transitions.inbox_failures {
            if let Some(row) = state.inbox.iter_mut().find(|r| r.message_id == failure.id) {
                if row.status & inbox_status::PROCESSED != 0 {
                    continue;
                }
                row.status = (row.status & !inbox_status::CLAIMED) | inbox_status::FAILED;
                row.last_error = Some(failure.error.clone());
                row.instance_id = None;
                row.lease_expiry = None;
            }
        }
        for id in &transitions.perspective_event_completions {
            if let Some(row) = state
                .perspective_events
                .iter_mut()
                .find(|r| r.event_work_id == *id)
            {
                row.status = (row.status | work::COMPLETED) & !work::LEASE_BITS;
                row.instance_id = None;
                row.lease_expiry = None;
                row.processed_at = Some(now);
            }
        }
        for failure in &transitions.perspective_event_failures {
            if let Some(row) = state
                .perspective_events
                .iter_mut()
                .find(|r| r.event_work_id == failure.id)
            {
                if row.status & work::COMPLETED != 0 {
                    continue;
                }
                apply_work_failure(&mut row.status, failure);
                row.last_error = Some(failure.error.clone());
                row.instance_id = None;
                row.lease_expiry = None;
            }
        }
    }

    fn insert_new_messages(
        state: &mut State,
        request: &WorkBatchRequest,
        working_set: &mut Vec<(Uuid, Uuid, String)>,
    ) {
        let now = request.options.now;
        for msg in &request.new_messages.outbox {
            if state.outbox.iter().any(|r| r.message_id == msg.message_id) {
                continue;
            }
            state.outbox.push(new_outbox_row(msg, now));
        }
        for msg in &request.new_messages.inbox {
            if state.dedup.contains_key(&msg.message_id) {
                continue;
            }
            state
                .dedup
                .insert(msg.message_id, (now, msg.source.clone()));
            state.inbox.push(new_inbox_row(msg, now));
            if let Some(event) = &msg.event {
                if !state.has_event(msg.message_id) {
                    let stored = state.store_event(
                        msg.message_id,
                        msg.stream_id,
                        event.aggregate_type.clone(),
                        event.event_type.clone(),
                        event.event_data.clone(),
                        event.metadata.clone(),
                        event.scope.clone(),
                        now,
                    );
                    working_set.push(stored);
                }
            }
        }
    }

    fn persist_outbox_events(
        state: &mut State,
        instance_id: Uuid,
        completions: &[Uuid],
        now: DateTime<Utc>,
        working_set: &mut Vec<(Uuid, Uuid, String)>,
    ) {
        let mut pending: Vec<usize> = state
            .outbox
            .iter()
            .enumerate()
            .filter(|(_, r)| {
                r.is_event
                    && !state.has_event(r.message_id)
                    && ((r.instance_id == Some(instance_id) && r.status & work::CLAIMED != 0)
                        || completions.contains(&r.message_id))
            })
            .map(|(i, _)| i)
            .collect();
        pending.sort_by_key(|&i| (state.outbox[i].created_at, state.outbox[i].message_id));

        for index in pending {
            let row = state.outbox[index].clone();
            let aggregate_type = row
                .metadata
                .get("aggregate_type")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string();
            let event_data = row
                .envelope
                .get("Payload")
                .cloned()
                .unwrap_or_else(|| row.envelope.clone());
            let scope = row.metadata.get("scope").filter(|v| !v.is_null()).cloned();
            let stored = state.store_event(
                row.message_id,
                row.stream_id,
                aggregate_type,
                row.event_type.clone(),
                event_data,
                row.metadata.clone(),
                scope,
                now,
            );
            working_set.push(stored);
        }
    }

    fn auto_create_perspective_work(
        state: &mut State,
        working_set: &[(Uuid, Uuid, String)],
        now: DateTime<Utc>,
    ) {
        for (event_id, stream_id, event_type) in working_set {
            let targets: Vec<String> = state
                .associations
                .iter()
                .filter(|a| a.association_type == AssociationType::Perspective)
                .filter(|a| fuzzy_match(&a.message_type, event_type))
                .map(|a| a.target_name.clone())
                .collect();
            let sequence_number = match state.sequence_of(*event_id) {
                Some(seq) => seq,
                None => continue,
            };
            for target in targets {
                state
                    .checkpoints
                    .entry((*stream_id, target.clone()))
                    .or_insert_with(|| PerspectiveCheckpoint {
                        stream_id: *stream_id,
                        perspective_name: target.clone(),
                        last_event_id: None,
                        status: CheckpointStatus::None,
                        error: None,
                        processed_at: now,
                    });
                let exists = state
                    .perspective_events
                    .iter()
                    .any(|r| r.event_id == *event_id && r.perspective_name == target);
                if exists {
                    continue;
                }
                state.perspective_events.push(PerspectiveEventRow {
                    event_work_id: Uuid::now_v7(),
                    stream_id: *stream_id,
                    perspective_name: target,
                    event_id: *event_id,
                    sequence_number,
                    status: 0,
                    attempts: 0,
                    last_error: None,
                    instance_id: None,
                    lease_expiry: None,
                    processed_at: None,
                    created_at: now,
                });
            }
        }
    }

    fn apply_perspective_reports(
        state: &mut State,
        transitions: &StateTransitions,
        now: DateTime<Utc>,
    ) {
        for report in &transitions.perspective_completions {
            let new_seq = report
                .last_event_id
                .and_then(|id| state.sequence_of(id))
                .unwrap_or(0);
            let current_seq = state
                .checkpoints
                .get(&(report.stream_id, report.perspective_name.clone()))
                .and_then(|c| c.last_event_id)
                .and_then(|id| state.sequence_of(id))
                .unwrap_or(0);
            if new_seq < current_seq {
                continue;
            }
            if let Some(checkpoint) = state
                .checkpoints
                .get_mut(&(report.stream_id, report.perspective_name.clone()))
            {
                checkpoint.last_event_id = report.last_event_id;
                checkpoint.status = CheckpointStatus::Completed;
                checkpoint.error = None;
                checkpoint.processed_at = now;
            }
        }
        for report in &transitions.perspective_failures {
            if let Some(checkpoint) = state
                .checkpoints
                .get_mut(&(report.stream_id, report.perspective_name.clone()))
            {
                checkpoint.status = CheckpointStatus::Failed;
                checkpoint.error = report.error.clone();
                checkpoint.processed_at = now;
            }
        }
    }

    fn claim_work(
        state: &mut State,
        request: &WorkBatchRequest,
    ) -> (Vec<OutboxWork>, Vec<InboxWork>, Vec<PerspectiveWork>) {
        let options = &request.options;
        let now = options.now;
        let expiry = now
            + chrono::Duration::from_std(options.lease_duration)
                .unwrap_or_else(|_| chrono::Duration::seconds(30));
        let instance_id = request.instance.instance_id;
        let batch_size = options.batch_size.max(0) as usize;

        // Outbox.
        let mut outbox_indices: Vec<usize> = state
            .outbox
            .iter()
            .enumerate()
            .filter(|(_, r)| {
                r.status & work::UNCLAIMABLE == 0
                    && r.lease_expiry.map_or(true, |l| l < now)
                    && options
                        .partitions
                        .as_ref()
                        .map_or(true, |p| p.contains(&r.partition_number))
            })
            .map(|(i, _)| i)
            .collect();
        outbox_indices.sort_by_key(|&i| (state.outbox[i].created_at, state.outbox[i].message_id));
        outbox_indices.truncate(batch_size);

        let mut outbox_work = Vec::with_capacity(outbox_indices.len());
        for index in outbox_indices {
            let row = &mut state.outbox[index];
            row.status |= work::CLAIMED | work::IN_FLIGHT;
            row.instance_id = Some(instance_id);
            row.lease_expiry = Some(expiry);
            row.attempts += 1;
            outbox_work.push(OutboxWork {
                message_id: row.message_id,
                destination: row.destination.clone(),
                event_type: row.event_type.clone(),
                envelope_type: row.envelope_type.clone(),
                envelope: row.envelope.clone(),
                metadata: row.metadata.clone(),
                stream_id: row.stream_id,
                partition_number: row.partition_number,
                is_event: row.is_event,
                attempts: row.attempts,
                created_at: row.created_at,
            });
        }

        // Inbox.
        let mut inbox_indices: Vec<usize> = state
            .inbox
            .iter()
            .enumerate()
            .filter(|(_, r)| {
                r.status & inbox_status::UNCLAIMABLE == 0
                    && r.lease_expiry.map_or(true, |l| l < now)
            })
            .map(|(i, _)| i)
            .collect();
        inbox_indices.sort_by_key(|&i| (state.inbox[i].received_at, state.inbox[i].message_id));
        inbox_indices.truncate(batch_size);

        let mut inbox_work = Vec::with_capacity(inbox_indices.len());
        for index in inbox_indices {
            let row = &mut state.inbox[index];
            row.status |= inbox_status::CLAIMED;
            row.instance_id = Some(instance_id);
            row.lease_expiry = Some(expiry);
            row.attempts += 1;
            inbox_work.push(InboxWork {
                message_id: row.message_id,
                source: row.source.clone(),
                envelope: row.envelope.clone(),
                stream_id: row.stream_id,
                attempts: row.attempts,
                received_at: row.received_at,
            });
        }

        // Perspective events: the earliest unfinished row per pair, only when
        // the pair has no outstanding claim and has not fail-stopped.
        let mut pairs: Vec<(Uuid, String)> = state
            .perspective_events
            .iter()
            .map(|r| (r.stream_id, r.perspective_name.clone()))
            .collect();
        pairs.sort();
        pairs.dedup();

        let mut head_indices: Vec<usize> = Vec::new();
        for (stream_id, perspective_name) in pairs {
            let halted = state
                .checkpoints
                .get(&(stream_id, perspective_name.clone()))
                .map_or(false, |c| c.status.halts_delivery());
            if halted {
                continue;
            }
            let outstanding = state.perspective_events.iter().any(|r| {
                r.stream_id == stream_id
                    && r.perspective_name == perspective_name
                    && r.status & work::CLAIMED != 0
                    && r.lease_expiry.map_or(false, |l| l >= now)
            });
            if outstanding {
                continue;
            }
            let head = state
                .perspective_events
                .iter()
                .enumerate()
                .filter(|(_, r)| {
                    r.stream_id == stream_id
                        && r.perspective_name == perspective_name
                        && r.status & work::COMPLETED == 0
                })
                .min_by_key(|(_, r)| r.sequence_number);
            if let Some((index, row)) = head {
                let claimable = row.status & work::UNCLAIMABLE == 0
                    && row.lease_expiry.map_or(true, |l| l < now);
                if claimable {
                    head_indices.push(index);
                }
            }
        }
        head_indices.sort_by_key(|&i| state.perspective_events[i].sequence_number);
        head_indices.truncate(batch_size);

        let mut perspective_work = Vec::with_capacity(head_indices.len());
        for index in head_indices {
            let (event_type, event_data, metadata, version) = {
                let row = &state.perspective_events[index];
                match state.events.iter().find(|e| e.event_id == row.event_id) {
                    Some(event) => (
                        event.event_type.clone(),
                        event.event_data.clone(),
                        event.metadata.clone(),
                        event.version,
                    ),
                    None => continue,
                }
            };
            let row = &mut state.perspective_events[index];
            row.status |= work::CLAIMED | work::IN_FLIGHT;
            row.instance_id = Some(instance_id);
            row.lease_expiry = Some(expiry);
            row.attempts += 1;
            perspective_work.push(PerspectiveWork {
                event_work_id: row.event_work_id,
                stream_id: row.stream_id,
                perspective_name: row.perspective_name.clone(),
                event_id: row.event_id,
                sequence_number: row.sequence_number,
                attempts: row.attempts,
                event_type,
                event_data,
                metadata,
                version,
            });
        }
        perspective_work.sort_by_key(|w| w.sequence_number);

        (outbox_work, inbox_work, perspective_work)
    }
}

fn apply_work_failure(status: &mut i32, failure: &FailureReport) {
    *status = (*status & !work::LEASE_BITS)
        | if failure.poison {
            work::POISON
        } else {
            work::FAILED
        };
}

fn new_outbox_row(msg: &NewOutboxMessage, now: DateTime<Utc>) -> OutboxMessageRow {
    OutboxMessageRow {
        message_id: msg.message_id,
        destination: msg.destination.clone(),
        event_type: msg.event_type.clone(),
        envelope_type: msg.envelope_type.clone(),
        envelope: msg.envelope.clone(),
        metadata: msg.metadata.clone(),
        stream_id: msg.stream_id,
        partition_number: msg.partition_number,
        is_event: msg.is_event,
        status: 0,
        attempts: 0,
        last_error: None,
        instance_id: None,
        lease_expiry: None,
        created_at: now,
    }
}

fn new_inbox_row(msg: &NewInboxMessage, now: DateTime<Utc>) -> InboxMessageRow {
    InboxMessageRow {
        message_id: msg.message_id,
        source: msg.source.clone(),
        envelope: msg.envelope.clone(),
        stream_id: msg.stream_id,
        status: 0,
        attempts: 0,
        last_error: None,
        instance_id: None,
        lease_expiry: None,
        received_at: now,
    }
}

#[async_trait::async_trait]
impl WorkStore for MemoryWorkStore {
    async fn process_batch(&self, request: WorkBatchRequest) -> StoreResult<WorkBatchReply> {
        let mut state = self.state.lock();
        let now = request.options.now;
        let mut working_set: Vec<(Uuid, Uuid, String)> = Vec::new();

        Self::apply_heartbeat(&mut state, &request);
        Self::recover_leases(&mut state, now);
        // Events persist before completions apply, so a row completed this
        // cycle is stored first.
        Self::persist_outbox_events(
            &mut state,
            request.instance.instance_id,
            &request.transitions.outbox_completions,
            now,
            &mut working_set,
        );
        Self::apply_transitions(&mut state, &request.transitions, now);
        Self::insert_new_messages(&mut state, &request, &mut working_set);
        Self::auto_create_perspective_work(&mut state, &working_set, now);
        Self::apply_perspective_reports(&mut state, &request.transitions, now);

        let (outbox_work, inbox_work, perspective_work) = Self::claim_work(&mut state, &request);

        Ok(WorkBatchReply {
            outbox_work,
            inbox_work,
            perspective_work,
        })
    }

    async fn register_associations(
        &self,
        associations: &[MessageAssociation],
    ) -> StoreResult<()> {
        let mut state = self.state.lock();
        for association in associations {
            let key = (
                association.message_type.clone(),
                association.association_type,
                association.target_name.clone(),
            );
            if let Some(existing) = state.associations.iter_mut().find(|a| {
                (a.message_type.clone(), a.association_type, a.target_name.clone()) == key
            }) {
                existing.service_name = association.service_name.clone();
            } else {
                state.associations.push(association.clone());
            }
        }
        Ok(())
    }

    async fn record_receptor_processing(
        &self,
        event_id: Uuid,
        receptor_name: &str,
        error: Option<&str>,
    ) -> StoreResult<bool> {
        let mut state = self.state.lock();
        let key = (event_id, receptor_name.to_string());
        if state.receptor_log.contains_key(&key) {
            return Ok(false);
        }
        state.receptor_log.insert(key, error.map(str::to_string));
        Ok(true)
    }

    async fn load_events(&self, stream_id: Uuid) -> StoreResult<Vec<EventRecord>> {
        let state = self.state.lock();
        let mut events: Vec<EventRecord> = state
            .events
            .iter()
            .filter(|e| e.stream_id == stream_id)
            .cloned()
            .collect();
        events.sort_by_key(|e| e.version);
        Ok(events)
    }

    async fn checkpoint(
        &self,
        stream_id: Uuid,
        perspective_name: &str,
    ) -> StoreResult<Option<PerspectiveCheckpoint>> {
        let state = self.state.lock();
        Ok(state
            .checkpoints
            .get(&(stream_id, perspective_name.to_string()))
            .cloned())
    }

    async fn perspective_events(
        &self,
        stream_id: Uuid,
        perspective_name: &str,
    ) -> StoreResult<Vec<PerspectiveEventRow>> {
        let state = self.state.lock();
        let mut rows: Vec<PerspectiveEventRow> = state
            .perspective_events
            .iter()
            .filter(|r| r.stream_id == stream_id && r.perspective_name == perspective_name)
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.sequence_number);
        Ok(rows)
    }

    async fn outbox_message(&self, message_id: Uuid) -> StoreResult<Option<OutboxMessageRow>> {
        let state = self.state.lock();
        Ok(state
            .outbox
            .iter()
            .find(|r| r.message_id == message_id)
            .cloned())
    }

    async fn inbox_message(&self, message_id: Uuid) -> StoreResult<Option<InboxMessageRow>> {
        let state = self.state.lock();
        Ok(state
            .inbox
            .iter()
            .find(|r| r.message_id == message_id)
            .cloned())
    }
}
