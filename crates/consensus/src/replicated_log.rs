//! Threaded Raft driver
//!
//! [`ReplicatedLog`] owns a [`RaftNode`] behind a mutex and a driver thread
//! that does everything time- or network-related:
//!
//! 1. wait for an inbound message, a wake-up or the next timer deadline
//! 2. feed the node, collecting outbound envelopes
//! 3. persist the node's pending writes, then send
//! 4. apply newly committed entries to the [`StateMachine`] outside the lock
//! 5. resolve waiting proposals and compact the log if configured
//!
//! Proposals are appended by the calling thread, which then blocks on a
//! condition variable until its index is applied locally, superseded by a
//! different entry, or the proposal timeout elapses.

use parking_lot::{Condvar, Mutex};
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use vdb_core::{ClusterMember, MemberRole, NodeId};

use crate::config::RaftConfig;
use crate::error::{ConsensusError, Result};
use crate::log::{EntryPayload, RaftMember};
use crate::message::{Envelope, RaftMessage};
use crate::node::{RaftNode, SnapshotInstall};
use crate::state_machine::StateMachine;
use crate::storage::{persist_ops, RaftStorage};
use crate::transport::{Inbound, Inbox, Transport};

enum Outcome {
    Pending { term: u64 },
    Done(Result<u64>),
}

struct Shared {
    node: Mutex<RaftNode>,
    storage: Mutex<Box<dyn RaftStorage>>,
    transport: Arc<dyn Transport>,
    state_machine: Arc<dyn StateMachine>,
    outcomes: Mutex<HashMap<u64, Outcome>>,
    applied: Condvar,
    last_ack: Mutex<HashMap<NodeId, Instant>>,
    election_bounds: Mutex<(Duration, Duration)>,
    shutdown: AtomicBool,
}

impl Shared {
    /// Persist under the node lock; on failure nothing may be sent
    fn persist(&self, node: &mut RaftNode) -> Result<()> {
        let ops = node.take_persist_ops();
        if ops.is_empty() {
            return Ok(());
        }
        let mut storage = self.storage.lock();
        persist_ops(storage.as_mut(), &ops, node.log.entries()).map_err(|e| {
            tracing::error!(target: "vdb::raft", node_id = node.id, error = %e, "failed to persist raft state");
            ConsensusError::from(e)
        })
    }

    fn random_election_timeout(&self) -> Duration {
        let (min, max) = *self.election_bounds.lock();
        if max <= min {
            return min;
        }
        let ms = rand::thread_rng().gen_range(min.as_millis()..=max.as_millis());
        Duration::from_millis(ms as u64)
    }

    fn record_outcome(&self, index: u64, term: u64, result: Option<Result<u64>>) {
        let mut outcomes = self.outcomes.lock();
        if let Some(Outcome::Pending { term: proposed }) = outcomes.get(&index) {
            let outcome = if *proposed != term {
                Err(ConsensusError::Superseded { index })
            } else {
                result.unwrap_or(Ok(index))
            };
            outcomes.insert(index, Outcome::Done(outcome));
            self.applied.notify_all();
        }
    }
}

/// A Raft-replicated log driving a [`StateMachine`]
pub struct ReplicatedLog {
    shared: Arc<Shared>,
    wake: Sender<Inbound>,
    node_id: NodeId,
    propose_timeout: Duration,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl ReplicatedLog {
    /// Restore persisted state and start the driver thread
    ///
    /// `initial_members` bootstraps a new cluster; a node joining an
    /// existing cluster passes an empty list and waits to be added.
    #[allow(clippy::too_many_arguments)]
    pub fn start(
        node_id: NodeId,
        endpoint: impl Into<String>,
        initial_members: Vec<RaftMember>,
        config: RaftConfig,
        storage: Box<dyn RaftStorage>,
        transport: Arc<dyn Transport>,
        state_machine: Arc<dyn StateMachine>,
        inbox: Inbox,
    ) -> Result<Self> {
        config.validate()?;
        let persisted = storage.load()?;
        let node = RaftNode::restore(
            node_id,
            endpoint,
            initial_members,
            config.clone(),
            persisted,
        );
        tracing::info!(
            target: "vdb::raft",
            node_id,
            term = node.current_term,
            last_log_index = node.last_log_index(),
            snapshot_index = node.log.snapshot_index(),
            members = node.members().len(),
            "starting replicated log"
        );
        transport.update_peers(&node.members());

        let shared = Arc::new(Shared {
            node: Mutex::new(node),
            storage: Mutex::new(storage),
            transport,
            state_machine,
            outcomes: Mutex::new(HashMap::new()),
            applied: Condvar::new(),
            last_ack: Mutex::new(HashMap::new()),
            election_bounds: Mutex::new((
                Duration::from_millis(config.election_timeout_min_ms),
                Duration::from_millis(config.election_timeout_max_ms),
            )),
            shutdown: AtomicBool::new(false),
        });

        let wake = inbox.sender();
        let mut driver = Driver::new(Arc::clone(&shared), inbox.rx, config.clone());
        let handle = thread::Builder::new()
            .name(format!("vdb-raft-{}", node_id))
            .spawn(move || driver.run())
            .map_err(|e| ConsensusError::Config(format!("failed to spawn raft driver: {}", e)))?;

        Ok(ReplicatedLog {
            shared,
            wake,
            node_id,
            propose_timeout: config.propose_timeout(),
            driver: Mutex::new(Some(handle)),
        })
    }

    /// Replicate `command` and wait until it is applied locally
    ///
    /// Returns the state machine's result for the entry.
    pub fn propose(&self, command: Vec<u8>) -> Result<u64> {
        let index = {
            let mut node = self.shared.node.lock();
            if !node.is_leader() {
                return Err(ConsensusError::NotLeader {
                    leader: node.leader_id,
                });
            }
            let next = node.last_log_index() + 1;
            self.shared
                .state_machine
                .pre_commit(next, &command)
                .map_err(ConsensusError::StateMachine)?;
            let index = node.append_entry(command).ok_or(ConsensusError::NotLeader {
                leader: node.leader_id,
            })?;
            self.shared.outcomes.lock().insert(
                index,
                Outcome::Pending {
                    term: node.current_term,
                },
            );
            if let Err(e) = self.shared.persist(&mut node) {
                self.shared.outcomes.lock().remove(&index);
                return Err(e);
            }
            index
        };
        let _ = self.wake.send(Inbound::Wake);
        self.wait_applied(index)
    }

    /// Add a voting member and wait for the configuration to commit
    pub fn add_member(&self, id: NodeId, endpoint: impl Into<String>) -> Result<u64> {
        let endpoint = endpoint.into();
        let index = {
            let mut node = self.shared.node.lock();
            if !node.is_leader() {
                return Err(ConsensusError::NotLeader {
                    leader: node.leader_id,
                });
            }
            if node.is_member(id) {
                return Err(ConsensusError::AlreadyMember(id));
            }
            let mut members = node.members();
            members.push(RaftMember::new(id, endpoint.clone()));
            let index = node.propose_config(members)?;
            // grace period so check-quorum does not count the joiner as lost
            self.shared.last_ack.lock().insert(id, Instant::now());
            self.shared.outcomes.lock().insert(
                index,
                Outcome::Pending {
                    term: node.current_term,
                },
            );
            if let Err(e) = self.shared.persist(&mut node) {
                self.shared.outcomes.lock().remove(&index);
                return Err(e);
            }
            index
        };
        tracing::info!(target: "vdb::raft", node_id = self.node_id, new_member = id, %endpoint, index, "membership change proposed");
        let _ = self.wake.send(Inbound::Wake);
        self.wait_applied(index)
    }

    fn wait_applied(&self, index: u64) -> Result<u64> {
        let deadline = Instant::now() + self.propose_timeout;
        let mut outcomes = self.shared.outcomes.lock();
        loop {
            if let Some(Outcome::Done(_)) = outcomes.get(&index) {
                if let Some(Outcome::Done(result)) = outcomes.remove(&index) {
                    return result;
                }
            }
            if self.shared.shutdown.load(Ordering::SeqCst) {
                outcomes.remove(&index);
                return Err(ConsensusError::Shutdown);
            }
            if self
                .shared
                .applied
                .wait_until(&mut outcomes, deadline)
                .timed_out()
            {
                outcomes.remove(&index);
                return Err(ConsensusError::Timeout {
                    index,
                    timeout_ms: self.propose_timeout.as_millis() as u64,
                });
            }
        }
    }

    /// This node's id
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// True if this node currently believes it is leader
    pub fn is_leader(&self) -> bool {
        self.shared.node.lock().is_leader()
    }

    /// Leader of the current term, if known
    pub fn leader_id(&self) -> Option<NodeId> {
        self.shared.node.lock().leader_id
    }

    /// Current term
    pub fn current_term(&self) -> u64 {
        self.shared.node.lock().current_term
    }

    /// Highest committed index
    pub fn commit_index(&self) -> u64 {
        self.shared.node.lock().commit_index
    }

    /// Highest index handed to the state machine
    pub fn last_applied_index(&self) -> u64 {
        self.shared.node.lock().last_applied
    }

    /// Index of the last log entry
    pub fn last_log_index(&self) -> u64 {
        self.shared.node.lock().last_log_index()
    }

    /// Voting members as the raft layer sees them
    pub fn raft_members(&self) -> Vec<RaftMember> {
        self.shared.node.lock().members()
    }

    /// Membership view with replication progress
    ///
    /// The leader reports each follower's match index and the time since its
    /// last response; other nodes only know their own log index.
    pub fn members(&self) -> Vec<ClusterMember> {
        let node = self.shared.node.lock();
        let last_ack = self.shared.last_ack.lock();
        let now = Instant::now();
        node.members()
            .into_iter()
            .map(|m| {
                let role = if node.leader_id == Some(m.id) {
                    MemberRole::Leader
                } else {
                    MemberRole::Follower
                };
                let (last_log_idx, last_success_response_us) = if m.id == node.id {
                    (node.last_log_index(), 0)
                } else if node.is_leader() {
                    let us = last_ack
                        .get(&m.id)
                        .map(|t| now.saturating_duration_since(*t).as_micros() as u64)
                        .unwrap_or(0);
                    (node.match_index.get(&m.id).copied().unwrap_or(0), us)
                } else {
                    (0, 0)
                };
                ClusterMember {
                    node_id: m.id,
                    endpoint: m.endpoint,
                    role,
                    last_log_idx,
                    last_success_response_us,
                }
            })
            .collect()
    }

    /// Change the randomized election timeout window
    pub fn set_election_timeout_bounds(&self, min: Duration, max: Duration) {
        *self.shared.election_bounds.lock() = (min, max.max(min));
    }

    /// Stop the driver; waiting proposals fail with `Shutdown`
    pub fn shutdown(&self) {
        if self.shared.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.wake.send(Inbound::Shutdown);
        if let Some(handle) = self.driver.lock().take() {
            let _ = handle.join();
        }
        let _guard = self.shared.outcomes.lock();
        self.shared.applied.notify_all();
        tracing::info!(target: "vdb::raft", node_id = self.node_id, "replicated log stopped");
    }
}

impl Drop for ReplicatedLog {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ============================================================================
// Driver
// ============================================================================

struct Driver {
    shared: Arc<Shared>,
    rx: Receiver<Inbound>,
    config: RaftConfig,
    election_deadline: Instant,
    next_heartbeat: Instant,
    outbox: Vec<Envelope>,
    pending_install: Option<SnapshotInstall>,
    snapshot_transfers: HashMap<NodeId, SnapshotTransfer>,
    known_members: Vec<RaftMember>,
}

/// Leader-side progress of sending one snapshot blob to one follower
struct SnapshotTransfer {
    index: u64,
    blob: Vec<u8>,
    offset: usize,
    sent: Instant,
}

impl Driver {
    fn new(shared: Arc<Shared>, rx: Receiver<Inbound>, config: RaftConfig) -> Self {
        let now = Instant::now();
        let election_deadline = now + shared.random_election_timeout();
        let known_members = shared.node.lock().members();
        Driver {
            shared,
            rx,
            config,
            election_deadline,
            next_heartbeat: now,
            outbox: Vec::new(),
            pending_install: None,
            snapshot_transfers: HashMap::new(),
            known_members,
        }
    }

    fn run(&mut self) {
        loop {
            let now = Instant::now();
            let is_leader = self.shared.node.lock().is_leader();
            let deadline = if is_leader {
                self.next_heartbeat
            } else {
                self.election_deadline
            };
            let wait = deadline.saturating_duration_since(now);

            match self.rx.recv_timeout(wait) {
                Ok(Inbound::Message(envelope)) => self.cycle(Some(envelope)),
                Ok(Inbound::Wake) | Err(RecvTimeoutError::Timeout) => self.cycle(None),
                Ok(Inbound::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            }
            if self.shared.shutdown.load(Ordering::SeqCst) {
                break;
            }
        }
    }

    fn cycle(&mut self, envelope: Option<Envelope>) {
        let shared = Arc::clone(&self.shared);
        {
            let mut node = shared.node.lock();
            if let Some(envelope) = envelope {
                if envelope.to == node.id && self.on_message(&mut node, envelope) {
                    self.reset_election_deadline();
                }
            }
            self.on_timers(&mut node);
            if node.is_leader() {
                // push freshly proposed entries without waiting for the heartbeat
                let lagging: Vec<NodeId> = node
                    .peers()
                    .iter()
                    .map(|p| p.id)
                    .filter(|id| {
                        node.next_index.get(id).copied().unwrap_or(0) <= node.last_log_index()
                    })
                    .collect();
                for peer in lagging {
                    self.replicate_to(&mut node, peer);
                }
            }
            if shared.persist(&mut node).is_err() {
                self.outbox.clear();
            }
        }
        self.refresh_peers();
        for envelope in self.outbox.drain(..) {
            shared.transport.send(envelope);
        }
        self.apply_committed();
        self.maybe_compact();
    }

    fn reset_election_deadline(&mut self) {
        self.election_deadline = Instant::now() + self.shared.random_election_timeout();
    }

    fn envelope(&self, node: &RaftNode, to: NodeId, msg: RaftMessage) -> Envelope {
        Envelope {
            from: node.id,
            from_endpoint: node.endpoint.clone(),
            to,
            msg,
        }
    }

    fn broadcast(&mut self, node: &RaftNode, msg: RaftMessage) {
        for peer in node.peers() {
            let envelope = self.envelope(node, peer.id, msg.clone());
            self.outbox.push(envelope);
        }
    }

    fn on_timers(&mut self, node: &mut RaftNode) {
        let now = Instant::now();
        if node.is_leader() {
            if now < self.next_heartbeat {
                return;
            }
            if !self.leader_has_quorum_contact(node, now) {
                tracing::warn!(
                    target: "vdb::raft",
                    node_id = node.id,
                    term = node.current_term,
                    "lost contact with a majority; stepping down"
                );
                let term = node.current_term;
                node.become_follower(term);
                self.reset_election_deadline();
                return;
            }
            for peer in node.peers() {
                self.replicate_to(node, peer.id);
            }
            self.next_heartbeat = now + self.config.heartbeat_interval();
        } else if now >= self.election_deadline {
            self.reset_election_deadline();
            if let Some(request) = node.start_election() {
                tracing::info!(
                    target: "vdb::raft",
                    node_id = node.id,
                    term = node.current_term,
                    "election timeout; starting election"
                );
                self.broadcast(node, request);
                if node.is_leader() {
                    self.on_became_leader(node);
                }
            }
        }
    }

    fn leader_has_quorum_contact(&self, node: &RaftNode, now: Instant) -> bool {
        let members = node.members();
        if members.len() <= 1 {
            return true;
        }
        let window = self.shared.election_bounds.lock().1;
        let last_ack = self.shared.last_ack.lock();
        let live = members
            .iter()
            .filter(|m| {
                m.id == node.id
                    || last_ack
                        .get(&m.id)
                        .map(|t| now.saturating_duration_since(*t) <= window)
                        .unwrap_or(false)
            })
            .count();
        live >= node.quorum_size()
    }

    fn on_became_leader(&mut self, node: &mut RaftNode) {
        let now = Instant::now();
        {
            let mut last_ack = self.shared.last_ack.lock();
            for peer in node.peers() {
                last_ack.insert(peer.id, now);
            }
        }
        self.snapshot_transfers.clear();
        for peer in node.peers() {
            self.replicate_to(node, peer.id);
        }
        self.next_heartbeat = now + self.config.heartbeat_interval();
    }

    fn replicate_to(&mut self, node: &mut RaftNode, peer: NodeId) {
        if node.needs_snapshot(peer) {
            // a transfer with no answer for an election timeout starts over
            let resend_after = self.shared.election_bounds.lock().1;
            if let Some(transfer) = self.snapshot_transfers.get(&peer) {
                if transfer.sent.elapsed() < resend_after {
                    return;
                }
            }
            let index = node.last_applied;
            let blob = match self.shared.state_machine.snapshot_blob() {
                Ok(blob) => blob,
                Err(e) => {
                    tracing::error!(target: "vdb::raft", peer, error = %e, "failed to build snapshot for follower");
                    return;
                }
            };
            tracing::info!(
                target: "vdb::raft",
                node_id = node.id,
                peer,
                index,
                bytes = blob.len(),
                chunk_bytes = self.config.snapshot_chunk_bytes,
                "sending snapshot to lagging follower"
            );
            self.snapshot_transfers.insert(
                peer,
                SnapshotTransfer {
                    index,
                    blob,
                    offset: 0,
                    sent: Instant::now(),
                },
            );
            self.send_snapshot_chunk(node, peer);
            return;
        }
        if let Some(msg) = node.create_append_entries(peer) {
            if let RaftMessage::AppendEntries { entries, .. } = &msg {
                if let Some(last) = entries.last() {
                    node.next_index.insert(peer, last.index + 1);
                }
            }
            let envelope = self.envelope(node, peer, msg);
            self.outbox.push(envelope);
        }
    }

    /// Send the slice of `peer`'s transfer that starts at its current offset
    fn send_snapshot_chunk(&mut self, node: &RaftNode, peer: NodeId) {
        let chunk = self.config.snapshot_chunk_bytes.max(1);
        let Some(transfer) = self.snapshot_transfers.get_mut(&peer) else {
            return;
        };
        let start = transfer.offset.min(transfer.blob.len());
        let end = (start + chunk).min(transfer.blob.len());
        let data = transfer.blob[start..end].to_vec();
        let done = end == transfer.blob.len();
        let index = transfer.index;
        transfer.sent = Instant::now();

        match node.create_install_snapshot(index, start as u64, data, done) {
            Some(msg) => {
                tracing::debug!(target: "vdb::raft", peer, index, offset = start, done, "snapshot chunk");
                let envelope = self.envelope(node, peer, msg);
                self.outbox.push(envelope);
            }
            // compacted past the snapshot point; the next round builds a fresh one
            None => {
                self.snapshot_transfers.remove(&peer);
            }
        }
    }

    fn note_ack(&self, node: &RaftNode, from: NodeId, term: u64) {
        if node.is_leader() && term == node.current_term {
            self.shared.last_ack.lock().insert(from, Instant::now());
        }
    }

    /// Returns true if the election timer should be reset
    fn on_message(&mut self, node: &mut RaftNode, envelope: Envelope) -> bool {
        let from = envelope.from;
        tracing::trace!(target: "vdb::raft", node_id = node.id, from, kind = envelope.msg.kind(), "message");
        match envelope.msg {
            RaftMessage::VoteRequest {
                term,
                candidate_id,
                last_log_index,
                last_log_term,
            } => {
                let (resp, granted) =
                    node.handle_vote_request(term, candidate_id, last_log_index, last_log_term);
                let envelope = self.envelope(node, from, resp);
                self.outbox.push(envelope);
                granted
            }
            RaftMessage::VoteResponse { term, vote_granted } => {
                if node.handle_vote_response(term, vote_granted, from) {
                    self.on_became_leader(node);
                }
                false
            }
            RaftMessage::AppendEntries {
                term,
                leader_id,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit,
            } => {
                let (resp, reset) = node.handle_append_entries(
                    term,
                    leader_id,
                    prev_log_index,
                    prev_log_term,
                    entries,
                    leader_commit,
                );
                let envelope = self.envelope(node, from, resp);
                self.outbox.push(envelope);
                reset
            }
            RaftMessage::AppendEntriesResponse {
                term,
                success,
                match_index,
            } => {
                self.note_ack(node, from, term);
                node.handle_append_entries_response(term, success, from, match_index);
                if node.is_leader() && (!success || match_index < node.last_log_index()) {
                    self.replicate_to(node, from);
                }
                false
            }
            RaftMessage::InstallSnapshot {
                term,
                leader_id,
                last_included_index,
                last_included_term,
                members,
                offset,
                data,
                done,
            } => {
                let (resp, install) = node.handle_install_snapshot(
                    term,
                    leader_id,
                    last_included_index,
                    last_included_term,
                    members,
                    offset,
                    data,
                    done,
                );
                if install.is_some() {
                    self.pending_install = install;
                }
                let envelope = self.envelope(node, from, resp);
                self.outbox.push(envelope);
                term >= node.current_term
            }
            RaftMessage::InstallSnapshotResponse {
                term,
                match_index,
                next_offset,
            } => {
                self.note_ack(node, from, term);
                match next_offset {
                    Some(offset) => {
                        if node.is_leader() && term == node.current_term {
                            if let Some(transfer) = self.snapshot_transfers.get_mut(&from) {
                                transfer.offset = offset as usize;
                            }
                            self.send_snapshot_chunk(node, from);
                        }
                    }
                    None => {
                        self.snapshot_transfers.remove(&from);
                        node.handle_install_snapshot_response(term, from, match_index);
                        if node.is_leader() && match_index < node.last_log_index() {
                            self.replicate_to(node, from);
                        }
                    }
                }
                false
            }
        }
    }

    fn apply_committed(&mut self) {
        let (entries, rolled_back) = {
            let mut node = self.shared.node.lock();
            (node.get_entries_to_apply(), node.take_rolled_back())
        };
        let sm = &self.shared.state_machine;

        for entry in rolled_back {
            if let EntryPayload::Command(command) = &entry.payload {
                tracing::debug!(target: "vdb::raft", index = entry.index, "rolling back uncommitted entry");
                sm.rollback(entry.index, command);
            }
        }

        if let Some(install) = self.pending_install.take() {
            if let Err(e) = sm.restore_blob(install.index, &install.data) {
                tracing::error!(target: "vdb::raft", index = install.index, error = %e, "failed to restore snapshot");
            }
        }

        for entry in entries {
            let result = match &entry.payload {
                EntryPayload::Noop => None,
                EntryPayload::Config { members } => {
                    tracing::info!(target: "vdb::raft", index = entry.index, members = members.len(), "membership committed");
                    sm.commit_config(entry.index, members);
                    None
                }
                EntryPayload::Command(command) => {
                    let result = sm.commit(entry.index, command);
                    if let Err(e) = &result {
                        tracing::warn!(target: "vdb::raft", index = entry.index, error = %e, "state machine rejected committed entry");
                    }
                    Some(result.map_err(ConsensusError::StateMachine))
                }
            };
            self.shared.record_outcome(entry.index, entry.term, result);
        }
    }

    fn maybe_compact(&mut self) {
        let distance = self.config.snapshot_distance;
        if distance == 0 {
            return;
        }
        let shared = Arc::clone(&self.shared);
        let mut node = shared.node.lock();
        let target = node
            .last_applied
            .saturating_sub(self.config.reserved_log_entries);
        if target > node.log.snapshot_index() && target - node.log.snapshot_index() >= distance {
            node.compact(target);
            let _ = shared.persist(&mut node);
        }
    }

    fn refresh_peers(&mut self) {
        let members = self.shared.node.lock().members();
        if members != self.known_members {
            self.shared.transport.update_peers(&members);
            self.known_members = members;
        }
    }
}
