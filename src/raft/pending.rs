//! Callers waiting on the outcome of a log entry.
//!
//! Every request that appends an entry registers a waiter keyed by the entry
//! index. When the entry at that index is applied the waiter is resolved,
//! either with the apply outcome (same term) or with `Discarded` (the entry
//! was replaced by a later leader). Each waiter resolves at most once.

use std::collections::BTreeMap;

use tokio::sync::oneshot;

use crate::error::{RaftError, Result};
use crate::raft::core::ApplyOutcome;
use crate::raft::state::{LogIndex, NodeId, Term};

/// Identifies one in-flight call, for cancellation.
pub type CorrelationId = u64;

/// Connection that issued a call, for bulk cancellation on disconnect.
pub type ClientId = u64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddNodeReply {
    pub node_id: NodeId,
    pub dbid: String,
}

/// The typed response channel of a waiting call.
#[derive(Debug)]
pub enum Completion {
    Submit(oneshot::Sender<Result<Vec<Vec<u8>>>>),
    AddNode {
        dbid: String,
        response_tx: oneshot::Sender<Result<AddNodeReply>>,
    },
    Done(oneshot::Sender<Result<()>>),
}

impl Completion {
    /// Resolves with the outcome of the applied entry.
    fn resolve(self, outcome: ApplyOutcome) {
        match (self, outcome) {
            (Completion::Submit(tx), ApplyOutcome::Command(replies)) => {
                let _ = tx.send(Ok(replies));
            }
            (Completion::AddNode { dbid, response_tx }, ApplyOutcome::NodeAdded { node_id, .. }) => {
                let _ = response_tx.send(Ok(AddNodeReply { node_id, dbid }));
            }
            (Completion::Done(tx), ApplyOutcome::NodeRemoved { .. } | ApplyOutcome::NoOp) => {
                let _ = tx.send(Ok(()));
            }
            (Completion::Done(tx), ApplyOutcome::ShardGroup(result)) => {
                let _ = tx.send(result);
            }
            (completion, ApplyOutcome::Invalid(reason)) => {
                completion.fail(RaftError::Malformed(reason));
            }
            (completion, _) => completion.fail(RaftError::Discarded),
        }
    }

    pub fn fail(self, err: RaftError) {
        match self {
            Completion::Submit(tx) => {
                let _ = tx.send(Err(err));
            }
            Completion::AddNode { response_tx, .. } => {
                let _ = response_tx.send(Err(err));
            }
            Completion::Done(tx) => {
                let _ = tx.send(Err(err));
            }
        }
    }
}

#[derive(Debug)]
struct Waiter {
    term: Term,
    correlation_id: CorrelationId,
    client_id: Option<ClientId>,
    completion: Completion,
}

#[derive(Debug, Default)]
pub struct PendingRequests {
    by_index: BTreeMap<LogIndex, Waiter>,
    by_correlation: BTreeMap<CorrelationId, LogIndex>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.by_index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_index.is_empty()
    }

    pub fn insert(
        &mut self,
        index: LogIndex,
        term: Term,
        correlation_id: CorrelationId,
        client_id: Option<ClientId>,
        completion: Completion,
    ) {
        // An index is only ever reused after the entry it named was discarded.
        if let Some(previous) = self.by_index.remove(&index) {
            self.by_correlation.remove(&previous.correlation_id);
            previous.completion.fail(RaftError::Discarded);
        }
        self.by_correlation.insert(correlation_id, index);
        self.by_index.insert(
            index,
            Waiter {
                term,
                correlation_id,
                client_id,
                completion,
            },
        );
    }

    /// Resolves the waiter for an applied entry, if any.
    pub fn resolve(&mut self, index: LogIndex, term: Term, outcome: ApplyOutcome) {
        let Some(waiter) = self.by_index.remove(&index) else {
            return;
        };
        self.by_correlation.remove(&waiter.correlation_id);
        if waiter.term == term {
            waiter.completion.resolve(outcome);
        } else {
            waiter.completion.fail(RaftError::Discarded);
        }
    }

    /// Stops waiting for one call. The entry itself is unaffected.
    pub fn cancel(&mut self, correlation_id: CorrelationId) -> bool {
        let Some(index) = self.by_correlation.remove(&correlation_id) else {
            return false;
        };
        self.by_index.remove(&index).is_some()
    }

    /// Drops every waiter owned by a disconnected client.
    pub fn cancel_client(&mut self, client_id: ClientId) -> usize {
        let indexes: Vec<LogIndex> = self
            .by_index
            .iter()
            .filter(|(_, w)| w.client_id == Some(client_id))
            .map(|(index, _)| *index)
            .collect();
        for index in &indexes {
            if let Some(waiter) = self.by_index.remove(index) {
                self.by_correlation.remove(&waiter.correlation_id);
            }
        }
        indexes.len()
    }

    /// Fails every waiter, for example on shutdown or a fatal error.
    pub fn fail_all(&mut self, err: &RaftError) {
        self.by_correlation.clear();
        for (_, waiter) in std::mem::take(&mut self.by_index) {
            waiter.completion.fail(err.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_matching_term() {
        let mut pending = PendingRequests::new();
        let (tx, mut rx) = oneshot::channel();
        pending.insert(5, 2, 1, None, Completion::Submit(tx));

        pending.resolve(5, 2, ApplyOutcome::Command(vec![b"OK".to_vec()]));
        assert_eq!(rx.try_recv().unwrap(), Ok(vec![b"OK".to_vec()]));
        assert!(pending.is_empty());
    }

    #[test]
    fn test_resolve_other_term_is_discarded() {
        let mut pending = PendingRequests::new();
        let (tx, mut rx) = oneshot::channel();
        pending.insert(5, 2, 1, None, Completion::Submit(tx));

        pending.resolve(5, 3, ApplyOutcome::NoOp);
        assert_eq!(rx.try_recv().unwrap(), Err(RaftError::Discarded));
    }

    #[test]
    fn test_add_node_reply_carries_dbid() {
        let mut pending = PendingRequests::new();
        let (tx, mut rx) = oneshot::channel();
        pending.insert(
            3,
            1,
            7,
            None,
            Completion::AddNode {
                dbid: "abc".to_string(),
                response_tx: tx,
            },
        );
        pending.resolve(
            3,
            1,
            ApplyOutcome::NodeAdded {
                node_id: 9,
                voting: false,
            },
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            Ok(AddNodeReply {
                node_id: 9,
                dbid: "abc".to_string()
            })
        );
    }

    #[test]
    fn test_cancel_drops_waiter_only() {
        let mut pending = PendingRequests::new();
        let (tx, mut rx) = oneshot::channel();
        pending.insert(4, 1, 11, None, Completion::Done(tx));

        assert!(pending.cancel(11));
        assert!(!pending.cancel(11));
        assert!(pending.is_empty());
        // Sender dropped without a value
        assert!(rx.try_recv().is_err());

        // Applying the entry later is harmless
        pending.resolve(4, 1, ApplyOutcome::NoOp);
    }

    #[test]
    fn test_cancel_client() {
        let mut pending = PendingRequests::new();
        let (tx1, _rx1) = oneshot::channel();
        let (tx2, _rx2) = oneshot::channel();
        let (tx3, _rx3) = oneshot::channel();
        pending.insert(1, 1, 1, Some(100), Completion::Submit(tx1));
        pending.insert(2, 1, 2, Some(200), Completion::Submit(tx2));
        pending.insert(3, 1, 3, Some(100), Completion::Submit(tx3));

        assert_eq!(pending.cancel_client(100), 2);
        assert_eq!(pending.len(), 1);
        assert!(!pending.cancel(1));
        assert!(pending.cancel(2));
    }

    #[test]
    fn test_fail_all() {
        let mut pending = PendingRequests::new();
        let (tx, mut rx) = oneshot::channel();
        pending.insert(1, 1, 1, None, Completion::Done(tx));
        pending.fail_all(&RaftError::Shutdown);
        assert_eq!(rx.try_recv().unwrap(), Err(RaftError::Shutdown));
        assert!(pending.is_empty());
    }
}
