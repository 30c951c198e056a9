// Copyright (c) 2025 - Cowboy AI, Inc.
//! In-process change log
//!
//! A partitioned, append-only, replayable log with consumer groups. It
//! stands in for the CDC transport in tests and single-process setups and
//! follows the same rules:
//!
//! - Entries are partitioned by aggregate, so one aggregate's events keep
//!   their commit order.
//! - Each group has one committed position per partition. A new member (or
//!   a restarted one) starts reading from there.
//! - Acknowledgments may arrive out of order; the committed position only
//!   moves over a contiguous run of acknowledged offsets. A failed offset
//!   therefore pins the position until it is acknowledged by a redelivery.
//! - Partitions are spread over the live members of a group; different
//!   groups are independent and each sees every entry.
//! - A member serves its partitions round-robin, so a busy partition does
//!   not hold back the others.

use async_trait::async_trait;
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeSet, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::changelog::{
    Acknowledger, CapturedEvent, ChangeLogEntry, ChangeLogSource, DeadLetter, StreamPosition,
};
use crate::config::RelayGroup;
use crate::errors::{OutboxError, OutboxResult};

struct GroupState {
    /// Join order; partition `p` belongs to `members[p % members.len()]`
    members: Vec<u64>,
    /// Next offset to hand out after a restart, per partition
    committed: Vec<u64>,
    /// Acknowledged offsets above `committed`, per partition
    acked: Vec<BTreeSet<u64>>,
    /// Read cursors of live members
    cursors: HashMap<u64, HashMap<u32, u64>>,
    /// Index into a member's assigned partitions where its next scan starts
    next_start: HashMap<u64, usize>,
    /// Times each unacknowledged (partition, offset) has been handed out
    deliveries: HashMap<(u32, u64), u64>,
}

impl GroupState {
    fn new(partitions: usize) -> Self {
        Self {
            members: Vec::new(),
            committed: vec![0; partitions],
            acked: vec![BTreeSet::new(); partitions],
            cursors: HashMap::new(),
            next_start: HashMap::new(),
            deliveries: HashMap::new(),
        }
    }

    fn owner_of(&self, partition: u32) -> Option<u64> {
        if self.members.is_empty() {
            return None;
        }
        let index = partition as usize % self.members.len();
        Some(self.members[index])
    }
}

struct LogState {
    partitions: Vec<Vec<ChangeLogEntry>>,
    groups: HashMap<RelayGroup, GroupState>,
    dead_letters: Vec<(RelayGroup, DeadLetter)>,
    next_member: u64,
}

struct LogInner {
    state: Mutex<LogState>,
    appended: Notify,
}

/// Partitioned in-process change log
#[derive(Clone)]
pub struct InMemoryChangeLog {
    inner: Arc<LogInner>,
}

impl InMemoryChangeLog {
    /// Create a log with `partitions` partitions (at least one)
    pub fn new(partitions: u32) -> Self {
        let partitions = partitions.max(1) as usize;
        Self {
            inner: Arc::new(LogInner {
                state: Mutex::new(LogState {
                    partitions: vec![Vec::new(); partitions],
                    groups: HashMap::new(),
                    dead_letters: Vec::new(),
                    next_member: 0,
                }),
                appended: Notify::new(),
            }),
        }
    }

    pub fn partition_count(&self) -> u32 {
        self.lock().partitions.len() as u32
    }

    /// Partition an entry with this key lands in
    pub fn partition_for(&self, partition_key: &str) -> u32 {
        let mut hasher = DefaultHasher::new();
        partition_key.hash(&mut hasher);
        (hasher.finish() % u64::from(self.partition_count())) as u32
    }

    /// Append an entry, returning its position
    pub fn append(&self, entry: ChangeLogEntry) -> (u32, u64) {
        let partition = self.partition_for(&entry.partition_key);
        let offset = {
            let mut state = self.lock();
            let log = &mut state.partitions[partition as usize];
            log.push(entry);
            (log.len() - 1) as u64
        };
        self.inner.appended.notify_waiters();
        (partition, offset)
    }

    /// Join `group` as a new member
    pub fn subscribe(&self, group: RelayGroup) -> InMemoryChangeLogSource {
        let member = {
            let mut state = self.lock();
            let member = state.next_member;
            state.next_member += 1;
            let partitions = state.partitions.len();
            state
                .groups
                .entry(group.clone())
                .or_insert_with(|| GroupState::new(partitions))
                .members
                .push(member);
            member
        };
        debug!(group = %group, member, "Joined change log group");

        InMemoryChangeLogSource {
            log: self.clone(),
            group,
            member,
        }
    }

    /// Committed position of `group` in `partition` (0 if the group is unknown)
    pub fn committed_position(&self, group: &RelayGroup, partition: u32) -> u64 {
        self.lock()
            .groups
            .get(group)
            .and_then(|g| g.committed.get(partition as usize).copied())
            .unwrap_or(0)
    }

    /// Sum of committed positions over all partitions
    pub fn total_committed(&self, group: &RelayGroup) -> u64 {
        self.lock()
            .groups
            .get(group)
            .map(|g| g.committed.iter().sum())
            .unwrap_or(0)
    }

    /// Number of entries in the log
    pub fn len(&self) -> usize {
        self.lock().partitions.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Items `group` sent to the dead-letter path, oldest first
    pub fn dead_letters(&self, group: &RelayGroup) -> Vec<DeadLetter> {
        self.lock()
            .dead_letters
            .iter()
            .filter(|(g, _)| g == group)
            .map(|(_, d)| d.clone())
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, LogState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_for(&self, group: &RelayGroup, member: u64) -> OutboxResult<Option<CapturedEvent>> {
        let mut state = self.lock();
        let LogState {
            partitions, groups, ..
        } = &mut *state;
        let group_state = groups.get_mut(group).ok_or_else(|| {
            OutboxError::fatal(format!("consumer group {} no longer exists", group))
        })?;
        if !group_state.members.contains(&member) {
            return Err(OutboxError::fatal(format!(
                "member {} has left group {}",
                member, group
            )));
        }

        let assigned: Vec<u32> = (0..partitions.len() as u32)
            .filter(|p| group_state.owner_of(*p) == Some(member))
            .collect();

        let cursors = group_state.cursors.entry(member).or_default();
        // Partitions moved to another member are re-read by their new owner
        cursors.retain(|p, _| assigned.contains(p));

        let start = group_state.next_start.get(&member).copied().unwrap_or(0);
        for step in 0..assigned.len() {
            let index = (start + step) % assigned.len();
            let partition = assigned[index];
            let p = partition as usize;
            let cursor = cursors.entry(partition).or_insert_with(|| {
                // New owner replays everything above the committed position
                group_state.acked[p].clear();
                group_state.committed[p]
            });
            let Some(entry) = partitions[p].get(*cursor as usize) else {
                continue;
            };

            let offset = *cursor;
            *cursor += 1;
            let entry = entry.clone();
            group_state.next_start.insert(member, index + 1);

            let attempts = group_state
                .deliveries
                .entry((partition, offset))
                .or_insert(0);
            *attempts += 1;

            let position = StreamPosition {
                partition,
                offset,
                delivery_attempt: *attempts,
            };
            let acknowledger = MemoryAcknowledger {
                log: self.clone(),
                group: group.clone(),
                partition,
                offset,
            };
            return Ok(Some(CapturedEvent::new(
                entry,
                position,
                Box::new(acknowledger),
            )));
        }

        Ok(None)
    }

    fn acknowledge(&self, group: &RelayGroup, partition: u32, offset: u64) -> OutboxResult<()> {
        let mut state = self.lock();
        let group_state = state.groups.get_mut(group).ok_or_else(|| {
            OutboxError::Acknowledge(format!("consumer group {} no longer exists", group))
        })?;

        let p = partition as usize;
        if offset < group_state.committed[p] {
            // Redelivered item that was already committed
            return Ok(());
        }
        group_state.deliveries.remove(&(partition, offset));
        group_state.acked[p].insert(offset);
        while group_state.acked[p].remove(&group_state.committed[p]) {
            group_state.committed[p] += 1;
        }
        let committed = group_state.committed[p];
        group_state
            .deliveries
            .retain(|(q, o), _| *q != partition || *o >= committed);
        Ok(())
    }

    fn leave(&self, group: &RelayGroup, member: u64) {
        let mut state = self.lock();
        if let Some(group_state) = state.groups.get_mut(group) {
            group_state.members.retain(|m| *m != member);
            group_state.cursors.remove(&member);
            group_state.next_start.remove(&member);
        }
    }
}

impl Default for InMemoryChangeLog {
    fn default() -> Self {
        Self::new(1)
    }
}

/// One member of a consumer group on an [`InMemoryChangeLog`]
///
/// Dropping the source leaves the group; unacknowledged items go back to
/// whoever owns their partition next, starting at the committed position.
pub struct InMemoryChangeLogSource {
    log: InMemoryChangeLog,
    group: RelayGroup,
    member: u64,
}

#[async_trait]
impl ChangeLogSource for InMemoryChangeLogSource {
    async fn consume_next(&self, timeout: Duration) -> OutboxResult<Option<CapturedEvent>> {
        let deadline = Instant::now() + timeout;
        loop {
            // Register interest before looking so an append in between is not missed
            let appended = self.log.inner.appended.notified();

            if let Some(event) = self.log.next_for(&self.group, self.member)? {
                return Ok(Some(event));
            }

            if tokio::time::timeout_at(deadline, appended).await.is_err() {
                return Ok(None);
            }
        }
    }

    fn group(&self) -> &RelayGroup {
        &self.group
    }
}

impl Drop for InMemoryChangeLogSource {
    fn drop(&mut self) {
        self.log.leave(&self.group, self.member);
        debug!(group = %self.group, member = self.member, "Left change log group");
    }
}

struct MemoryAcknowledger {
    log: InMemoryChangeLog,
    group: RelayGroup,
    partition: u32,
    offset: u64,
}

#[async_trait]
impl Acknowledger for MemoryAcknowledger {
    async fn acknowledge(&self) -> OutboxResult<()> {
        self.log.acknowledge(&self.group, self.partition, self.offset)
    }

    async fn fail(&self, dead_letter: DeadLetter) -> OutboxResult<()> {
        warn!(
            group = %self.group,
            partition = self.partition,
            offset = self.offset,
            record_id = %dead_letter.record_id,
            reason = %dead_letter.reason,
            "Change log item failed, position held"
        );
        self.log
            .lock()
            .dead_letters
            .push((self.group.clone(), dead_letter));
        Ok(())
    }
}
