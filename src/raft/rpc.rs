//! Peer RPC messages and their receiver-side handling.

use crate::error::{RaftError, Result};
use crate::raft::core::RaftCore;
use crate::raft::snapshot::{ChunkOutcome, SnapshotChunk};
use crate::raft::state::{GroupState, LogEntry, LogIndex, NodeId, RaftRole, Term};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestVoteRequest {
    pub target_node: NodeId,
    pub source_node: NodeId,
    pub prevote: bool,
    /// For pre-votes, the term the candidate would campaign in.
    pub term: Term,
    pub candidate_id: NodeId,
    pub last_log_idx: LogIndex,
    pub last_log_term: Term,
    /// Set when the election was triggered by a leadership transfer.
    pub transfer_leader: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestVoteResponse {
    pub term: Term,
    pub vote_granted: bool,
    pub prevote: bool,
    /// Echo of the request term, to discard answers to an earlier round.
    pub request_term: Term,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendEntriesRequest {
    pub target_node: NodeId,
    pub source_node: NodeId,
    pub term: Term,
    pub leader_id: NodeId,
    pub msg_id: u64,
    pub prev_log_idx: LogIndex,
    pub prev_log_term: Term,
    pub leader_commit: LogIndex,
    pub entries: Vec<LogEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendEntriesResponse {
    pub term: Term,
    pub success: bool,
    /// On success the index of the last entry covered by the request, on
    /// failure the receiver's hint for where the leader should retry from.
    pub current_idx: LogIndex,
    /// Index of the first entry carried by the request (0 for heartbeats).
    pub first_idx: LogIndex,
    pub msg_id: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallSnapshotRequest {
    pub target_node: NodeId,
    pub source_node: NodeId,
    pub term: Term,
    pub leader_id: NodeId,
    pub msg_id: u64,
    pub snapshot_index: LogIndex,
    pub snapshot_term: Term,
    pub chunk: SnapshotChunk,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallSnapshotResponse {
    pub term: Term,
    pub msg_id: u64,
    /// The offset the receiver expects next.
    pub offset: u64,
    pub success: bool,
    pub last_chunk: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeoutNowRequest {
    pub target_node: NodeId,
    pub source_node: NodeId,
    pub term: Term,
}

/// Sent by the leader to a node whose removal it committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeShutdownRequest {
    pub target_node: NodeId,
    pub source_node: NodeId,
    pub term: Term,
}

impl AppendEntriesRequest {
    /// Rejects requests no correct leader would send.
    pub fn validate(&self) -> Result<()> {
        if self.prev_log_idx == 0 && self.prev_log_term != 0 {
            return Err(RaftError::Malformed(format!(
                "prev_log_term {} given for index 0",
                self.prev_log_term
            )));
        }
        for (offset, entry) in self.entries.iter().enumerate() {
            let expected = (offset as u64)
                .checked_add(1)
                .and_then(|n| self.prev_log_idx.checked_add(n));
            if Some(entry.index) != expected {
                return Err(RaftError::Malformed(format!(
                    "entry index {} does not follow prev_log_idx {}",
                    entry.index, self.prev_log_idx
                )));
            }
            if entry.term > self.term {
                return Err(RaftError::Malformed(format!(
                    "entry {} has term {} above request term {}",
                    entry.index, entry.term, self.term
                )));
            }
        }
        Ok(())
    }
}

impl RaftCore {
    /// Handle incoming RequestVote (real or pre-vote).
    pub fn handle_request_vote(&mut self, req: &RequestVoteRequest) -> Result<RequestVoteResponse> {
        self.check_target(req.target_node)?;

        let (last_idx, last_term) = (self.log().last_index(), self.log().last_term());
        let up_to_date =
            GroupState::is_log_up_to_date(last_idx, last_term, req.last_log_idx, req.last_log_term);
        let member = self.membership().contains(req.candidate_id);
        let disruptive = !req.transfer_leader && self.leader_is_active();

        if req.prevote {
            // Would we vote in the next term? Nothing is persisted.
            let granted =
                req.term > self.state().current_term && up_to_date && member && !disruptive;
            tracing::debug!(
                node_id = self.id(),
                candidate = req.candidate_id,
                term = req.term,
                granted,
                "Pre-vote request"
            );
            return Ok(self.vote_response(req, granted));
        }

        if req.term < self.state().current_term {
            return Ok(self.vote_response(req, false));
        }

        if req.term > self.state().current_term {
            if disruptive {
                tracing::debug!(
                    node_id = self.id(),
                    candidate = req.candidate_id,
                    term = req.term,
                    "Ignoring vote request while leader is active"
                );
                return Ok(self.vote_response(req, false));
            }
            self.step_down(req.term, None)?;
        }

        let can_vote = self
            .state()
            .voted_for
            .map_or(true, |id| id == req.candidate_id);
        let granted = can_vote && up_to_date && member;
        if granted {
            self.record_vote(req.candidate_id)?;
        }

        tracing::debug!(
            node_id = self.id(),
            candidate = req.candidate_id,
            term = req.term,
            granted,
            "Vote request"
        );
        Ok(self.vote_response(req, granted))
    }

    fn vote_response(&self, req: &RequestVoteRequest, granted: bool) -> RequestVoteResponse {
        RequestVoteResponse {
            term: self.state().current_term,
            vote_granted: granted,
            prevote: req.prevote,
            request_term: req.term,
        }
    }

    /// Handle incoming AppendEntries.
    pub fn handle_append_entries(
        &mut self,
        req: &AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        self.check_target(req.target_node)?;
        req.validate()?;

        let reject = |core: &RaftCore, hint: LogIndex| AppendEntriesResponse {
            term: core.state().current_term,
            success: false,
            current_idx: hint,
            first_idx: 0,
            msg_id: req.msg_id,
        };

        if req.term < self.state().current_term {
            return Ok(reject(self, self.log().last_index()));
        }
        self.accept_leader(req.term, req.leader_id)?;

        let base_index = self.log().first_index() - 1;
        let mut entries: &[LogEntry] = &req.entries;
        if req.prev_log_idx < base_index {
            // Everything up to the base is committed and already in our snapshot.
            let covered = (base_index - req.prev_log_idx) as usize;
            entries = entries.get(covered..).unwrap_or(&[]);
        } else if req.prev_log_idx > self.log().last_index() {
            tracing::debug!(
                node_id = self.id(),
                prev_log_idx = req.prev_log_idx,
                last_index = self.log().last_index(),
                "AppendEntries beyond end of log"
            );
            return Ok(reject(self, self.log().last_index()));
        } else if self.log().term_at(req.prev_log_idx) != Some(req.prev_log_term) {
            tracing::debug!(
                node_id = self.id(),
                prev_log_idx = req.prev_log_idx,
                prev_log_term = req.prev_log_term,
                "AppendEntries term mismatch"
            );
            return Ok(reject(self, req.prev_log_idx.saturating_sub(1)));
        }

        self.append_from_leader(entries)?;

        let last_new = req.prev_log_idx + req.entries.len() as u64;
        if req.leader_commit > self.state().commit_index {
            let commit = req.leader_commit.min(last_new).min(self.log().last_index());
            self.advance_commit(commit);
        }

        tracing::trace!(
            node_id = self.id(),
            leader = req.leader_id,
            entries = req.entries.len(),
            commit_index = self.state().commit_index,
            "Accepted AppendEntries"
        );
        Ok(AppendEntriesResponse {
            term: self.state().current_term,
            success: true,
            current_idx: last_new,
            first_idx: req.entries.first().map_or(0, |e| e.index),
            msg_id: req.msg_id,
        })
    }

    /// Handle one InstallSnapshot chunk.
    pub fn handle_install_snapshot(
        &mut self,
        req: &InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        self.check_target(req.target_node)?;

        let next_offset = req.chunk.offset + req.chunk.data.len() as u64;
        let respond = |core: &RaftCore, success: bool, offset: u64, last_chunk: bool| {
            InstallSnapshotResponse {
                term: core.state().current_term,
                msg_id: req.msg_id,
                offset,
                success,
                last_chunk,
            }
        };

        if req.term < self.state().current_term {
            return Ok(respond(self, false, req.chunk.offset, false));
        }
        self.accept_leader(req.term, req.leader_id)?;

        // Already have everything this snapshot covers (for example a
        // redelivered final chunk): acknowledge without touching state.
        let (snapshot_index, _) = self.snapshots().last_included();
        if req.snapshot_index <= snapshot_index.max(self.state().last_applied) {
            return Ok(respond(self, true, next_offset, true));
        }

        if self.snapshots().in_progress() {
            // A local snapshot is still being written; the leader retries later.
            return Ok(respond(self, false, req.chunk.offset, false));
        }

        let outcome =
            self.snapshots_mut()
                .receive_chunk(req.snapshot_index, req.snapshot_term, req.chunk.clone());
        let response = match outcome {
            ChunkOutcome::Accepted { next_offset } | ChunkOutcome::Duplicate { next_offset } => {
                respond(self, true, next_offset, false)
            }
            ChunkOutcome::Rejected { expected_offset } => {
                tracing::debug!(
                    node_id = self.id(),
                    offset = req.chunk.offset,
                    expected_offset,
                    "Rejected snapshot chunk"
                );
                respond(self, false, expected_offset, false)
            }
            ChunkOutcome::Corrupt(reason) => {
                tracing::warn!(
                    node_id = self.id(),
                    snapshot_index = req.snapshot_index,
                    reason = %reason,
                    "Discarding corrupt snapshot, restarting transfer"
                );
                respond(self, false, 0, false)
            }
            ChunkOutcome::Complete(image) => {
                self.install_snapshot_image(*image)?;
                respond(self, true, next_offset, true)
            }
        };
        Ok(response)
    }

    /// Handle TimeoutNow: campaign immediately, skipping pre-vote.
    pub fn handle_timeout_now(&mut self, req: &TimeoutNowRequest) -> Result<()> {
        self.check_target(req.target_node)?;
        if req.term < self.state().current_term || self.state().role == RaftRole::Leader {
            return Ok(());
        }
        if !self.can_campaign() {
            tracing::warn!(node_id = self.id(), "Ignoring TimeoutNow, not a voting member");
            return Ok(());
        }
        tracing::info!(
            node_id = self.id(),
            from = req.source_node,
            "Received TimeoutNow, starting election"
        );
        self.start_election(true)
    }

    /// Handle NodeShutdown: the leader committed our removal.
    ///
    /// A committed removal is final and node ids are never reused, so the
    /// request is honored whatever its term.
    pub fn handle_node_shutdown(&mut self, req: &NodeShutdownRequest) -> Result<()> {
        self.check_target(req.target_node)?;
        tracing::info!(
            node_id = self.id(),
            source = req.source_node,
            term = req.term,
            "Received NodeShutdown, leaving the cluster"
        );
        self.mark_removed()
    }
}
