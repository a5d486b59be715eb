//! Raft state machine — the single replicated value plus the
//! committed-entry stream.
//!
//! The state machine holds the latest applied payload in memory and
//! forwards the bytes of every committed `Normal` entry, in commit
//! order, to the committed-entry channel the orchestrator's
//! convergence loop consumes. Snapshots round-trip the latest payload
//! so that a freshly added node also converges.

use std::io::Cursor;
use std::sync::{Arc, Mutex};

use openraft::storage::{RaftSnapshotBuilder, RaftStateMachine};
use openraft::{
    Entry, EntryPayload, LogId, Snapshot, SnapshotMeta, StorageError, StoredMembership,
};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::typ::{Response, TypeConfig};

#[derive(Default)]
struct Inner {
    applied: Option<LogId<u64>>,
    membership: StoredMembership<u64, openraft::BasicNode>,
    /// Latest applied payload; carried by snapshots.
    last_payload: Option<Vec<u8>>,
}

/// In-memory raft state machine.
pub struct StateMachine {
    inner: Arc<Mutex<Inner>>,
    commits: mpsc::UnboundedSender<Vec<u8>>,
}

/// Snapshot builder over the current state machine contents.
pub struct SmSnapshotBuilder {
    inner: Arc<Mutex<Inner>>,
}

impl StateMachine {
    /// Create a state machine and the receiving end of the
    /// committed-entry channel.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                inner: Arc::new(Mutex::new(Inner::default())),
                commits: tx,
            },
            rx,
        )
    }
}

impl RaftStateMachine<TypeConfig> for StateMachine {
    type SnapshotBuilder = SmSnapshotBuilder;

    async fn applied_state(
        &mut self,
    ) -> Result<
        (
            Option<LogId<u64>>,
            StoredMembership<u64, openraft::BasicNode>,
        ),
        StorageError<u64>,
    > {
        let inner = self.inner.lock().expect("state machine lock");
        Ok((inner.applied, inner.membership.clone()))
    }

    async fn apply<I>(&mut self, entries: I) -> Result<Vec<Response>, StorageError<u64>>
    where
        I: IntoIterator<Item = Entry<TypeConfig>> + Send,
        I::IntoIter: Send,
    {
        let mut responses = Vec::new();

        for entry in entries {
            let log_id = entry.log_id;

            match entry.payload {
                EntryPayload::Blank => {
                    responses.push(Response { success: true });
                }
                EntryPayload::Normal(req) => {
                    debug!(index = log_id.index, "applying committed entry");
                    {
                        let mut inner = self.inner.lock().expect("state machine lock");
                        inner.last_payload = Some(req.data.clone());
                    }
                    // The receiver side is the convergence loop; if it
                    // is gone the process is already going down.
                    let _ = self.commits.send(req.data);
                    responses.push(Response { success: true });
                }
                EntryPayload::Membership(membership) => {
                    let mut inner = self.inner.lock().expect("state machine lock");
                    inner.membership = StoredMembership::new(Some(log_id), membership);
                    responses.push(Response { success: true });
                }
            }

            let mut inner = self.inner.lock().expect("state machine lock");
            inner.applied = Some(log_id);
        }

        Ok(responses)
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        SmSnapshotBuilder {
            inner: Arc::clone(&self.inner),
        }
    }

    async fn begin_receiving_snapshot(
        &mut self,
    ) -> Result<Box<Cursor<Vec<u8>>>, StorageError<u64>> {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    async fn install_snapshot(
        &mut self,
        meta: &SnapshotMeta<u64, openraft::BasicNode>,
        snapshot: Box<Cursor<Vec<u8>>>,
    ) -> Result<(), StorageError<u64>> {
        let payload: Option<Vec<u8>> = serde_json::from_slice(&snapshot.into_inner())
            .map_err(|e| {
                StorageError::from_io_error(
                    openraft::ErrorSubject::Snapshot(Some(meta.signature())),
                    openraft::ErrorVerb::Read,
                    std::io::Error::other(e.to_string()),
                )
            })?;

        {
            let mut inner = self.inner.lock().expect("state machine lock");
            inner.applied = meta.last_log_id;
            inner.membership = meta.last_membership.clone();
            inner.last_payload = payload.clone();
        }

        // A node brought in via snapshot still has to converge on the
        // carried configuration.
        if let Some(data) = payload {
            let _ = self.commits.send(data);
        }

        info!(snapshot_id = %meta.snapshot_id, "installed snapshot");
        Ok(())
    }

    async fn get_current_snapshot(
        &mut self,
    ) -> Result<Option<Snapshot<TypeConfig>>, StorageError<u64>> {
        let applied = {
            let inner = self.inner.lock().expect("state machine lock");
            inner.applied
        };
        if applied.is_none() {
            return Ok(None);
        }

        let mut builder = SmSnapshotBuilder {
            inner: Arc::clone(&self.inner),
        };
        Ok(Some(builder.build_snapshot().await?))
    }
}

impl RaftSnapshotBuilder<TypeConfig> for SmSnapshotBuilder {
    async fn build_snapshot(&mut self) -> Result<Snapshot<TypeConfig>, StorageError<u64>> {
        let (applied, membership, payload) = {
            let inner = self.inner.lock().expect("state machine lock");
            (
                inner.applied,
                inner.membership.clone(),
                inner.last_payload.clone(),
            )
        };

        let data = serde_json::to_vec(&payload).map_err(|e| {
            StorageError::from_io_error(
                openraft::ErrorSubject::Snapshot(None),
                openraft::ErrorVerb::Write,
                std::io::Error::other(e.to_string()),
            )
        })?;

        let snapshot_id = format!("snap-{}", applied.map_or(0, |l| l.index));

        Ok(Snapshot {
            meta: SnapshotMeta {
                last_log_id: applied,
                last_membership: membership,
                snapshot_id,
            },
            snapshot: Box::new(Cursor::new(data)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::typ::Request;
    use openraft::CommittedLeaderId;

    fn normal_entry(index: u64, data: &[u8]) -> Entry<TypeConfig> {
        Entry {
            log_id: LogId::new(CommittedLeaderId::new(1, 1), index),
            payload: EntryPayload::Normal(Request {
                data: data.to_vec(),
            }),
        }
    }

    #[tokio::test]
    async fn empty_state_machine() {
        let (mut sm, _rx) = StateMachine::new();
        let (applied, _membership) = sm.applied_state().await.unwrap();
        assert!(applied.is_none());
    }

    #[tokio::test]
    async fn apply_forwards_payloads_in_commit_order() {
        let (mut sm, mut rx) = StateMachine::new();

        sm.apply([normal_entry(1, b"first"), normal_entry(2, b"second")])
            .await
            .unwrap();

        assert_eq!(rx.recv().await.unwrap(), b"first");
        assert_eq!(rx.recv().await.unwrap(), b"second");
        assert!(rx.try_recv().is_err());

        let (applied, _) = sm.applied_state().await.unwrap();
        assert_eq!(applied.unwrap().index, 2);
    }

    #[tokio::test]
    async fn blank_entries_are_not_forwarded() {
        let (mut sm, mut rx) = StateMachine::new();

        let blank = Entry::<TypeConfig> {
            log_id: LogId::new(CommittedLeaderId::new(1, 1), 1),
            payload: EntryPayload::Blank,
        };
        sm.apply([blank]).await.unwrap();

        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn snapshot_roundtrip_redelivers_payload() {
        let (mut sm, _rx) = StateMachine::new();
        sm.apply([normal_entry(3, b"state")]).await.unwrap();

        let snapshot = sm.get_current_snapshot().await.unwrap().unwrap();
        assert_eq!(snapshot.meta.snapshot_id, "snap-3");

        let (mut sm2, mut rx2) = StateMachine::new();
        sm2.install_snapshot(&snapshot.meta, snapshot.snapshot)
            .await
            .unwrap();

        assert_eq!(rx2.recv().await.unwrap(), b"state");
        let (applied, _) = sm2.applied_state().await.unwrap();
        assert_eq!(applied.unwrap().index, 3);
    }

    #[tokio::test]
    async fn snapshot_of_empty_machine_is_none() {
        let (mut sm, _rx) = StateMachine::new();
        assert!(sm.get_current_snapshot().await.unwrap().is_none());
    }
}
