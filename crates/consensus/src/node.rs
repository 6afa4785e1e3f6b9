//! Raft node state machine
//!
//! [`RaftNode`] is pure: it owns term, vote, log and replication progress,
//! turns inbound messages into responses, and never touches the clock, the
//! network or the disk. The driver in [`crate::replicated_log`] feeds it
//! messages and timer events, persists [`RaftNode::take_persist_ops`] before
//! sending anything, and applies [`RaftNode::get_entries_to_apply`].
//!
//! Membership is read from the log: the latest configuration entry wins,
//! then the membership recorded with the last compaction, then the
//! bootstrap list the node was started with. A node that is not in its own
//! membership never campaigns.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

use vdb_core::NodeId;

use crate::config::RaftConfig;
use crate::error::ConsensusError;
use crate::log::{EntryPayload, LogChanges, LogEntry, RaftLog, RaftMember};
use crate::message::RaftMessage;

/// The three possible states a Raft node can be in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum NodeState {
    /// Passive state - listens for heartbeats, votes when asked
    #[default]
    Follower,
    /// Transitional state - requesting votes to become leader
    Candidate,
    /// Active state - manages log replication, sends heartbeats
    Leader,
}

/// Term and vote, persisted before any response that depends on them
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HardState {
    /// Latest term seen
    pub term: u64,
    /// Candidate voted for in `term`
    pub voted_for: Option<NodeId>,
}

/// Compaction point plus the membership in force there
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SnapshotMeta {
    /// Last compacted index
    pub index: u64,
    /// Term of `index`
    pub term: u64,
    /// Membership as of `index`
    pub members: Vec<RaftMember>,
}

/// Everything a node needs to restart
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PersistedState {
    /// Term and vote
    pub hard_state: HardState,
    /// Compaction point, if the log was ever compacted
    pub snapshot: Option<SnapshotMeta>,
    /// Retained entries in index order
    pub entries: Vec<LogEntry>,
}

/// Writes the driver must make durable before sending messages
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PersistOps {
    /// New term/vote
    pub hard_state: Option<HardState>,
    /// Log delta
    pub log: LogChanges,
    /// New compaction point (the log must be rewritten from scratch)
    pub snapshot: Option<SnapshotMeta>,
}

impl PersistOps {
    /// True if nothing needs persisting
    pub fn is_empty(&self) -> bool {
        self.hard_state.is_none() && self.log.is_empty() && self.snapshot.is_none()
    }
}

/// A snapshot accepted from the leader, to be restored into the state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotInstall {
    /// Last index covered
    pub index: u64,
    /// Term of `index`
    pub term: u64,
    /// Opaque state machine blob
    pub data: Vec<u8>,
}

/// A single Raft node in the cluster
#[derive(Debug)]
pub struct RaftNode {
    /// Unique identifier for this node
    pub id: NodeId,
    /// This node's listening endpoint
    pub endpoint: String,
    /// Current state (Follower, Candidate, or Leader)
    pub state: NodeState,
    /// Current term number
    pub current_term: u64,
    /// Node that received our vote in the current term
    pub voted_for: Option<NodeId>,
    /// Replicated log
    pub log: RaftLog,
    /// Highest index known committed
    pub commit_index: u64,
    /// Highest index handed out by get_entries_to_apply
    pub last_applied: u64,
    /// Leader of the current term, if known
    pub leader_id: Option<NodeId>,
    /// Votes collected as candidate
    pub votes_received: BTreeSet<NodeId>,
    /// Leader only: next index to send per peer
    pub next_index: HashMap<NodeId, u64>,
    /// Leader only: highest index known replicated per peer
    pub match_index: HashMap<NodeId, u64>,
    /// Timing and retention parameters
    pub config: RaftConfig,
    initial_members: Vec<RaftMember>,
    snapshot_members: Vec<RaftMember>,
    /// Follower only: snapshot slices received so far
    incoming_snapshot: Option<SnapshotInstall>,
    persisted_hard: HardState,
    rolled_back: Vec<LogEntry>,
}

impl RaftNode {
    /// Create a fresh follower
    ///
    /// `initial_members` is the bootstrap membership; pass an empty list for
    /// a node that will be added to an existing cluster.
    pub fn new(
        id: NodeId,
        endpoint: impl Into<String>,
        initial_members: Vec<RaftMember>,
        config: RaftConfig,
    ) -> Self {
        RaftNode {
            id,
            endpoint: endpoint.into(),
            state: NodeState::Follower,
            current_term: 0,
            voted_for: None,
            log: RaftLog::new(),
            commit_index: 0,
            last_applied: 0,
            leader_id: None,
            votes_received: BTreeSet::new(),
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            config,
            initial_members,
            snapshot_members: Vec::new(),
            incoming_snapshot: None,
            persisted_hard: HardState::default(),
            rolled_back: Vec::new(),
        }
    }

    /// Restart from persisted state
    ///
    /// Commit and apply positions restart at the compaction point; entries
    /// after it are redelivered once a leader confirms them.
    pub fn restore(
        id: NodeId,
        endpoint: impl Into<String>,
        initial_members: Vec<RaftMember>,
        config: RaftConfig,
        persisted: PersistedState,
    ) -> Self {
        let mut node = RaftNode::new(id, endpoint, initial_members, config);
        let snapshot = persisted.snapshot.unwrap_or_default();
        node.current_term = persisted.hard_state.term;
        node.voted_for = persisted.hard_state.voted_for;
        node.persisted_hard = persisted.hard_state;
        node.log = RaftLog::restore(snapshot.index, snapshot.term, persisted.entries);
        node.commit_index = snapshot.index;
        node.last_applied = snapshot.index;
        node.snapshot_members = snapshot.members;
        node
    }

    // ========================================================================
    // Membership
    // ========================================================================

    /// Current voting members, sorted by id
    pub fn members(&self) -> Vec<RaftMember> {
        let mut members = match self.log.latest_config().and_then(|e| e.config_members()) {
            Some(m) => m.to_vec(),
            None if !self.snapshot_members.is_empty() => self.snapshot_members.clone(),
            None => self.initial_members.clone(),
        };
        members.sort();
        members.dedup_by_key(|m| m.id);
        members
    }

    /// Voting members in force at `index`
    pub fn members_at(&self, index: u64) -> Vec<RaftMember> {
        match self.log.config_at(index).and_then(|e| e.config_members()) {
            Some(m) => m.to_vec(),
            None if !self.snapshot_members.is_empty() => self.snapshot_members.clone(),
            None => self.initial_members.clone(),
        }
    }

    /// Members other than this node
    pub fn peers(&self) -> Vec<RaftMember> {
        self.members()
            .into_iter()
            .filter(|m| m.id != self.id)
            .collect()
    }

    /// True if `id` is a voting member
    pub fn is_member(&self, id: NodeId) -> bool {
        self.members().iter().any(|m| m.id == id)
    }

    /// Only members may start elections
    pub fn can_campaign(&self) -> bool {
        self.is_member(self.id)
    }

    /// Votes (or replicas) needed for a majority
    pub fn quorum_size(&self) -> usize {
        self.members().len() / 2 + 1
    }

    /// True if the candidate holds a majority of votes
    pub fn has_quorum(&self) -> bool {
        let members = self.members();
        let votes = self
            .votes_received
            .iter()
            .filter(|id| members.iter().any(|m| m.id == **id))
            .count();
        votes >= members.len() / 2 + 1
    }

    /// True if a configuration entry is appended but not yet committed
    pub fn config_change_pending(&self) -> bool {
        self.log
            .latest_config()
            .map(|e| e.index > self.commit_index)
            .unwrap_or(false)
    }

    /// True if this node is leader
    pub fn is_leader(&self) -> bool {
        self.state == NodeState::Leader
    }

    // ========================================================================
    // Log helpers
    // ========================================================================

    /// Index of the last log entry
    pub fn last_log_index(&self) -> u64 {
        self.log.last_index()
    }

    /// Term of the last log entry
    pub fn last_log_term(&self) -> u64 {
        self.log.last_term()
    }

    /// Term at `index`, 0 if unknown
    pub fn get_term_at(&self, index: u64) -> u64 {
        self.log.term_at(index).unwrap_or(0)
    }

    // ========================================================================
    // Elections
    // ========================================================================

    /// Become candidate for the next term and vote for self
    ///
    /// Returns the vote request to broadcast, or `None` if this node is not
    /// a member. A single-member cluster wins immediately.
    pub fn start_election(&mut self) -> Option<RaftMessage> {
        if !self.can_campaign() {
            return None;
        }
        self.current_term += 1;
        self.state = NodeState::Candidate;
        self.voted_for = Some(self.id);
        self.leader_id = None;
        self.votes_received.clear();
        self.votes_received.insert(self.id);

        let request = RaftMessage::VoteRequest {
            term: self.current_term,
            candidate_id: self.id,
            last_log_index: self.last_log_index(),
            last_log_term: self.last_log_term(),
        };
        if self.has_quorum() {
            self.become_leader();
        }
        Some(request)
    }

    /// Answer a vote request; the flag says whether to reset the election timer
    pub fn handle_vote_request(
        &mut self,
        term: u64,
        candidate_id: NodeId,
        last_log_index: u64,
        last_log_term: u64,
    ) -> (RaftMessage, bool) {
        if term > self.current_term {
            self.become_follower(term);
        }

        let log_ok = last_log_term > self.last_log_term()
            || (last_log_term == self.last_log_term() && last_log_index >= self.last_log_index());
        let vote_free = self.voted_for.is_none() || self.voted_for == Some(candidate_id);
        let granted = term == self.current_term && vote_free && log_ok;
        if granted {
            self.voted_for = Some(candidate_id);
        }

        (
            RaftMessage::VoteResponse {
                term: self.current_term,
                vote_granted: granted,
            },
            granted,
        )
    }

    /// Count a vote; returns true if this node just became leader
    pub fn handle_vote_response(&mut self, term: u64, vote_granted: bool, from: NodeId) -> bool {
        if term > self.current_term {
            self.become_follower(term);
            return false;
        }
        if self.state != NodeState::Candidate || term != self.current_term || !vote_granted {
            return false;
        }
        self.votes_received.insert(from);
        if self.has_quorum() {
            self.become_leader();
            return true;
        }
        false
    }

    /// Take leadership of the current term
    pub fn become_leader(&mut self) {
        self.state = NodeState::Leader;
        self.leader_id = Some(self.id);
        self.votes_received.clear();

        let next = self.last_log_index() + 1;
        self.next_index.clear();
        self.match_index.clear();
        for peer in self.peers() {
            self.next_index.insert(peer.id, next);
            self.match_index.insert(peer.id, 0);
        }

        if self.log.latest_config().is_none() && self.snapshot_members.is_empty() {
            let members = self.initial_members.clone();
            self.push_entry(EntryPayload::Config { members });
        }
        self.push_entry(EntryPayload::Noop);
        self.advance_commit();

        tracing::info!(
            target: "vdb::raft",
            node_id = self.id,
            term = self.current_term,
            last_log_index = self.last_log_index(),
            "became leader"
        );
    }

    /// Step down; a higher term also clears the vote
    pub fn become_follower(&mut self, term: u64) {
        if term > self.current_term {
            self.current_term = term;
            self.voted_for = None;
            self.leader_id = None;
        }
        if self.state == NodeState::Leader {
            tracing::info!(target: "vdb::raft", node_id = self.id, term, "stepping down");
        }
        self.state = NodeState::Follower;
        self.votes_received.clear();
        self.next_index.clear();
        self.match_index.clear();
    }

    // ========================================================================
    // Leader: proposals and replication
    // ========================================================================

    fn push_entry(&mut self, payload: EntryPayload) -> u64 {
        let index = self.last_log_index() + 1;
        self.log
            .append(LogEntry::with_payload(self.current_term, index, payload));
        index
    }

    /// Append a command as leader; returns its index
    pub fn append_entry(&mut self, command: Vec<u8>) -> Option<u64> {
        if !self.is_leader() {
            return None;
        }
        let index = self.push_entry(EntryPayload::Command(command));
        self.advance_commit();
        Some(index)
    }

    /// Append a full-membership configuration entry as leader
    pub fn propose_config(&mut self, members: Vec<RaftMember>) -> Result<u64, ConsensusError> {
        if !self.is_leader() {
            return Err(ConsensusError::NotLeader {
                leader: self.leader_id,
            });
        }
        if self.config_change_pending() {
            return Err(ConsensusError::MembershipChangeInProgress);
        }
        let index = self.push_entry(EntryPayload::Config { members });
        let next = self.last_log_index() + 1;
        for peer in self.peers() {
            self.next_index.entry(peer.id).or_insert(next);
            self.match_index.entry(peer.id).or_insert(0);
        }
        self.advance_commit();
        Ok(index)
    }

    /// True if `peer` needs entries that were compacted away
    pub fn needs_snapshot(&self, peer: NodeId) -> bool {
        self.is_leader() && self.peer_next_index(peer) <= self.log.snapshot_index()
    }

    fn peer_next_index(&self, peer: NodeId) -> u64 {
        self.next_index
            .get(&peer)
            .copied()
            .unwrap_or(self.last_log_index() + 1)
            .max(1)
    }

    /// AppendEntries for `peer` from its next index (a heartbeat when it is
    /// caught up); `None` if not leader or the peer needs a snapshot
    pub fn create_append_entries(&self, peer: NodeId) -> Option<RaftMessage> {
        if !self.is_leader() || self.needs_snapshot(peer) {
            return None;
        }
        let next = self.peer_next_index(peer);
        let prev_log_index = next - 1;
        let prev_log_term = self.log.term_at(prev_log_index)?;
        Some(RaftMessage::AppendEntries {
            term: self.current_term,
            leader_id: self.id,
            prev_log_index,
            prev_log_term,
            entries: self.log.entries_from(next, self.config.max_entries_per_append),
            leader_commit: self.commit_index,
        })
    }

    /// Empty AppendEntries
    pub fn create_heartbeat(&self) -> Option<RaftMessage> {
        if !self.is_leader() {
            return None;
        }
        let prev_log_index = self.last_log_index();
        Some(RaftMessage::AppendEntries {
            term: self.current_term,
            leader_id: self.id,
            prev_log_index,
            prev_log_term: self.last_log_term(),
            entries: Vec::new(),
            leader_commit: self.commit_index,
        })
    }

    /// InstallSnapshot carrying the slice of a state machine blob taken at
    /// `index` that starts at `offset`; `done` marks the last slice
    pub fn create_install_snapshot(
        &self,
        index: u64,
        offset: u64,
        data: Vec<u8>,
        done: bool,
    ) -> Option<RaftMessage> {
        if !self.is_leader() {
            return None;
        }
        let last_included_term = self.log.term_at(index)?;
        Some(RaftMessage::InstallSnapshot {
            term: self.current_term,
            leader_id: self.id,
            last_included_index: index,
            last_included_term,
            members: self.members_at(index),
            offset,
            data,
            done,
        })
    }

    /// Record a follower's answer; returns true if the commit index moved
    pub fn handle_append_entries_response(
        &mut self,
        term: u64,
        success: bool,
        from: NodeId,
        match_index: u64,
    ) -> bool {
        if term > self.current_term {
            self.become_follower(term);
            return false;
        }
        if !self.is_leader() || term != self.current_term {
            return false;
        }

        if success {
            let prior = self.match_index.get(&from).copied().unwrap_or(0);
            let matched = prior.max(match_index.min(self.last_log_index()));
            self.match_index.insert(from, matched);
            let next = (matched + 1).max(self.peer_next_index(from));
            self.next_index.insert(from, next);
            self.advance_commit()
        } else {
            let current = self.peer_next_index(from);
            let retry = current.saturating_sub(1).min(match_index + 1).max(1);
            self.next_index.insert(from, retry);
            false
        }
    }

    /// Record a follower's snapshot install; returns true if the commit index moved
    pub fn handle_install_snapshot_response(
        &mut self,
        term: u64,
        from: NodeId,
        match_index: u64,
    ) -> bool {
        self.handle_append_entries_response(term, true, from, match_index)
    }

    /// Move the commit index to the highest current-term entry stored on a
    /// majority; returns true if it moved
    pub fn advance_commit(&mut self) -> bool {
        if !self.is_leader() {
            return false;
        }
        let members = self.members();
        let quorum = members.len() / 2 + 1;
        let last = self.last_log_index();

        let mut n = last;
        while n > self.commit_index {
            match self.log.term_at(n) {
                Some(t) if t == self.current_term => {}
                _ => break,
            }
            let replicas = members
                .iter()
                .filter(|m| {
                    m.id == self.id || self.match_index.get(&m.id).copied().unwrap_or(0) >= n
                })
                .count();
            if replicas >= quorum {
                tracing::debug!(target: "vdb::raft", commit_index = n, "commit advanced");
                self.commit_index = n;
                return true;
            }
            n -= 1;
        }
        false
    }

    // ========================================================================
    // Follower: replication
    // ========================================================================

    /// Process AppendEntries; the flag says whether to reset the election timer
    pub fn handle_append_entries(
        &mut self,
        term: u64,
        leader_id: NodeId,
        prev_log_index: u64,
        prev_log_term: u64,
        entries: Vec<LogEntry>,
        leader_commit: u64,
    ) -> (RaftMessage, bool) {
        if term < self.current_term {
            return (self.append_response(false, 0), false);
        }
        if term > self.current_term || self.state != NodeState::Follower {
            self.become_follower(term);
        }
        self.leader_id = Some(leader_id);

        let snapshot_index = self.log.snapshot_index();
        let (prev_log_index, prev_log_term, entries) = if prev_log_index < snapshot_index {
            // the compacted prefix is committed and therefore matches
            let entries: Vec<LogEntry> = entries
                .into_iter()
                .filter(|e| e.index > snapshot_index)
                .collect();
            (snapshot_index, self.log.snapshot_term(), entries)
        } else {
            (prev_log_index, prev_log_term, entries)
        };

        if prev_log_index > self.last_log_index() {
            return (self.append_response(false, self.last_log_index()), true);
        }
        if self.log.term_at(prev_log_index) != Some(prev_log_term) {
            let hint = prev_log_index.saturating_sub(1).max(self.commit_index);
            return (self.append_response(false, hint), true);
        }

        let last_new_index = prev_log_index + entries.len() as u64;
        for entry in entries {
            match self.log.term_at(entry.index) {
                Some(t) if t == entry.term => continue,
                Some(_) => {
                    if entry.index <= self.commit_index {
                        tracing::error!(
                            target: "vdb::raft",
                            index = entry.index,
                            commit_index = self.commit_index,
                            "leader sent a conflicting committed entry; ignoring"
                        );
                        continue;
                    }
                    let removed = self.log.truncate_from(entry.index);
                    self.rolled_back.extend(removed);
                    self.log.append(entry);
                }
                None => self.log.append(entry),
            }
        }

        if leader_commit > self.commit_index {
            self.commit_index = self.commit_index.max(leader_commit.min(last_new_index));
        }
        (self.append_response(true, last_new_index), true)
    }

    fn append_response(&self, success: bool, match_index: u64) -> RaftMessage {
        RaftMessage::AppendEntriesResponse {
            term: self.current_term,
            success,
            match_index,
        }
    }

    /// Process one InstallSnapshot slice; returns the response and, once the
    /// last slice of a snapshot newer than local state arrives, the blob to
    /// restore into the state machine
    ///
    /// Slices must arrive in order. A slice that does not continue the held
    /// bytes is dropped and the response tells the leader where to resume.
    #[allow(clippy::too_many_arguments)]
    pub fn handle_install_snapshot(
        &mut self,
        term: u64,
        leader_id: NodeId,
        last_included_index: u64,
        last_included_term: u64,
        members: Vec<RaftMember>,
        offset: u64,
        data: Vec<u8>,
        done: bool,
    ) -> (RaftMessage, Option<SnapshotInstall>) {
        if term < self.current_term {
            return (
                RaftMessage::InstallSnapshotResponse {
                    term: self.current_term,
                    match_index: 0,
                    next_offset: None,
                },
                None,
            );
        }
        if term > self.current_term || self.state != NodeState::Follower {
            self.become_follower(term);
        }
        self.leader_id = Some(leader_id);

        if last_included_index <= self.commit_index {
            self.incoming_snapshot = None;
            return (
                RaftMessage::InstallSnapshotResponse {
                    term: self.current_term,
                    match_index: last_included_index,
                    next_offset: None,
                },
                None,
            );
        }

        let continues = matches!(
            &self.incoming_snapshot,
            Some(held) if held.index == last_included_index && held.term == last_included_term
        );
        if !continues || offset == 0 {
            self.incoming_snapshot = Some(SnapshotInstall {
                index: last_included_index,
                term: last_included_term,
                data: Vec::new(),
            });
        }
        let held = self
            .incoming_snapshot
            .get_or_insert_with(|| SnapshotInstall {
                index: last_included_index,
                term: last_included_term,
                data: Vec::new(),
            });
        let received = held.data.len() as u64;
        if offset != received || !done {
            if offset == received {
                held.data.extend_from_slice(&data);
            }
            return (
                RaftMessage::InstallSnapshotResponse {
                    term: self.current_term,
                    match_index: self.commit_index,
                    next_offset: Some(held.data.len() as u64),
                },
                None,
            );
        }
        held.data.extend_from_slice(&data);
        let blob = std::mem::take(&mut held.data);
        self.incoming_snapshot = None;

        self.log
            .install_snapshot(last_included_index, last_included_term);
        self.snapshot_members = members;
        self.commit_index = last_included_index;
        self.last_applied = last_included_index;

        tracing::info!(
            target: "vdb::raft",
            node_id = self.id,
            index = last_included_index,
            term = last_included_term,
            bytes = blob.len(),
            "installing snapshot from leader"
        );
        (
            RaftMessage::InstallSnapshotResponse {
                term: self.current_term,
                match_index: last_included_index,
                next_offset: None,
            },
            Some(SnapshotInstall {
                index: last_included_index,
                term: last_included_term,
                data: blob,
            }),
        )
    }

    // ========================================================================
    // Apply, compaction, persistence
    // ========================================================================

    /// Committed entries not yet handed out, in index order
    pub fn get_entries_to_apply(&mut self) -> Vec<LogEntry> {
        let mut out = Vec::new();
        while self.last_applied < self.commit_index {
            let next = self.last_applied + 1;
            if next <= self.log.snapshot_index() {
                self.last_applied = self.log.snapshot_index();
                continue;
            }
            match self.log.get(next) {
                Some(entry) => out.push(entry.clone()),
                None => break,
            }
            self.last_applied = next;
        }
        out
    }

    /// Compact the log through `index` (at most `last_applied`)
    pub fn compact(&mut self, index: u64) -> bool {
        if index > self.last_applied || index <= self.log.snapshot_index() {
            return false;
        }
        let members = self.members_at(index);
        if self.log.compact_to(index) {
            self.snapshot_members = members;
            tracing::info!(target: "vdb::raft", node_id = self.id, index, "log compacted");
            true
        } else {
            false
        }
    }

    /// Drain what must be made durable before the next send
    pub fn take_persist_ops(&mut self) -> PersistOps {
        let hard = HardState {
            term: self.current_term,
            voted_for: self.voted_for,
        };
        let hard_state = if hard != self.persisted_hard {
            self.persisted_hard = hard;
            Some(hard)
        } else {
            None
        };
        let log = self.log.take_changes();
        let snapshot = log.snapshot_moved.then(|| SnapshotMeta {
            index: self.log.snapshot_index(),
            term: self.log.snapshot_term(),
            members: self.snapshot_members.clone(),
        });
        PersistOps {
            hard_state,
            log,
            snapshot,
        }
    }

    /// Uncommitted entries removed by log conflicts since the last call
    pub fn take_rolled_back(&mut self) -> Vec<LogEntry> {
        std::mem::take(&mut self.rolled_back)
    }
}
