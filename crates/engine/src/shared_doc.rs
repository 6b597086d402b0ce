// One shared document and the connections attached to it.
//
// The state splits into three thread-safe pieces: the CRDT `Doc`, the
// connection table, and a plain-data presence table tracking the last
// awareness entry per client. Every applied update is re-encoded from
// the transaction that applied it and pushed onto an unbounded channel;
// the registry's fan-out task drains that channel and broadcasts each
// delta to every attached connection, originator included — CRDT
// application is idempotent, so the echo is harmless and keeps the
// fan-out uniform.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use quillstream_transport::{Connection, ConnectionId, Message};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};
use yrs::sync::awareness::AwarenessUpdateEntry;
use yrs::sync::{AwarenessUpdate, Message as ProtoMessage, SyncMessage};
use yrs::updates::decoder::Decode;
use yrs::{Doc, ReadTxn, StateVector, Transact, Update};

use crate::error::EngineError;
use crate::protocol;

/// Payload a client sends to withdraw an awareness state.
const NULL_STATE: &str = "null";

struct ConnEntry {
    conn: Arc<dyn Connection>,
    /// Awareness client ids this connection controls. Withdrawn from
    /// the presence table when the connection goes away.
    client_ids: HashSet<u64>,
}

/// Last known awareness entry for one client. `data` of `None` means
/// the client withdrew; the clock is kept so stale updates stay stale.
struct PresenceEntry {
    clock: u32,
    data: Option<Arc<str>>,
}

#[derive(Default)]
struct PresenceTable {
    clients: HashMap<u64, PresenceEntry>,
}

#[derive(Default)]
struct PresenceSummary {
    added: Vec<u64>,
    updated: Vec<u64>,
    removed: Vec<u64>,
}

impl PresenceSummary {
    fn all_changes(&self) -> Vec<u64> {
        let mut changes =
            Vec::with_capacity(self.added.len() + self.updated.len() + self.removed.len());
        changes.extend_from_slice(&self.added);
        changes.extend_from_slice(&self.updated);
        changes.extend_from_slice(&self.removed);
        changes
    }
}

impl PresenceTable {
    /// Awareness clock rules: an entry wins when its clock is ahead, or
    /// when it withdraws the state we hold at the same clock. Entries
    /// for withdrawn clients stay in the table so their clocks keep
    /// rejecting stale updates.
    fn apply(&mut self, update: &AwarenessUpdate) -> PresenceSummary {
        let mut summary = PresenceSummary::default();
        for (&client_id, entry) in &update.clients {
            let incoming = if entry.json.as_ref() == NULL_STATE {
                None
            } else {
                Some(Arc::clone(&entry.json))
            };
            match self.clients.get_mut(&client_id) {
                Some(state) => {
                    let withdraws =
                        entry.clock == state.clock && incoming.is_none() && state.data.is_some();
                    if state.clock < entry.clock || withdraws {
                        state.clock = entry.clock;
                        match incoming {
                            Some(json) => {
                                state.data = Some(json);
                                summary.updated.push(client_id);
                            }
                            None => {
                                if state.data.take().is_some() {
                                    summary.removed.push(client_id);
                                }
                            }
                        }
                    }
                }
                None => {
                    let live = incoming.is_some();
                    self.clients
                        .insert(client_id, PresenceEntry { clock: entry.clock, data: incoming });
                    if live {
                        summary.added.push(client_id);
                    }
                }
            }
        }
        summary
    }

    /// Withdraw a client's state server-side, bumping its clock so the
    /// removal outranks the entry it replaces. Returns false when there
    /// was nothing to withdraw.
    fn remove(&mut self, client_id: u64) -> bool {
        match self.clients.get_mut(&client_id) {
            Some(state) if state.data.is_some() => {
                state.data = None;
                state.clock += 1;
                true
            }
            _ => false,
        }
    }

    /// Encode the entries for `clients`; withdrawn clients encode as
    /// the null state. Unknown ids are skipped.
    fn encode(&self, clients: &[u64]) -> AwarenessUpdate {
        let clients = clients
            .iter()
            .filter_map(|client_id| {
                self.clients.get(client_id).map(|state| {
                    let entry = AwarenessUpdateEntry {
                        clock: state.clock,
                        json: state.data.clone().unwrap_or_else(|| Arc::from(NULL_STATE)),
                    };
                    (*client_id, entry)
                })
            })
            .collect();
        AwarenessUpdate { clients }
    }

    fn live_clients(&self) -> Vec<u64> {
        self.clients
            .iter()
            .filter(|(_, state)| state.data.is_some())
            .map(|(client_id, _)| *client_id)
            .collect()
    }

    /// Everything a newly attached connection needs to know.
    fn snapshot(&self) -> AwarenessUpdate {
        self.encode(&self.live_clients())
    }
}

pub struct SharedDoc {
    name: String,
    doc: Doc,
    conns: RwLock<HashMap<ConnectionId, ConnEntry>>,
    presence: Mutex<PresenceTable>,
    updates: mpsc::UnboundedSender<Vec<u8>>,
}

impl SharedDoc {
    /// Create the doc and the channel its applied updates feed. The
    /// receiver must be drained (the registry spawns a fan-out task for
    /// it) or updates will queue unboundedly.
    pub fn new(name: impl Into<String>) -> (Arc<Self>, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (updates, update_rx) = mpsc::unbounded_channel();
        let doc = Arc::new(Self {
            name: name.into(),
            doc: Doc::new(),
            conns: RwLock::new(HashMap::new()),
            presence: Mutex::new(PresenceTable::default()),
            updates,
        });
        (doc, update_rx)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn doc(&self) -> &Doc {
        &self.doc
    }

    pub async fn connection_count(&self) -> usize {
        self.conns.read().await.len()
    }

    pub fn state_vector(&self) -> StateVector {
        self.doc.transact().state_vector()
    }

    /// Full document state as a single update against the empty state.
    pub fn encode_state(&self) -> Vec<u8> {
        self.doc.transact().encode_diff_v1(&StateVector::default())
    }

    /// Awareness client ids that currently hold a state.
    pub fn live_presence(&self) -> Vec<u64> {
        self.lock_presence().live_clients()
    }

    /// Register a connection and start the sync handshake: step-1 with
    /// our state vector, then the current awareness states if any exist.
    pub async fn add_connection(&self, conn: Arc<dyn Connection>) -> Result<(), EngineError> {
        self.conns.write().await.insert(
            conn.id(),
            ConnEntry { conn: Arc::clone(&conn), client_ids: HashSet::new() },
        );

        conn.send(Message::binary(protocol::encode_sync_step1(self.state_vector()))).await?;

        let snapshot = self.lock_presence().snapshot();
        if !snapshot.clients.is_empty() {
            conn.send(Message::binary(protocol::encode_awareness(snapshot))).await?;
        }

        debug!(doc = %self.name, conn_id = %conn.id(), "connection attached");
        Ok(())
    }

    /// Drop a connection's entry and withdraw the awareness client ids
    /// it controlled, broadcasting the removal to remaining peers.
    /// Returns the number of connections still attached and the ids of
    /// peers the removal broadcast could not reach; the caller detaches
    /// those in turn.
    pub async fn remove_connection(&self, conn_id: ConnectionId) -> (usize, Vec<ConnectionId>) {
        let (entry, remaining) = {
            let mut conns = self.conns.write().await;
            let entry = conns.remove(&conn_id);
            (entry, conns.len())
        };

        let mut dead = Vec::new();
        if let Some(entry) = entry {
            let withdrawn: Vec<u64> = {
                let mut presence = self.lock_presence();
                entry.client_ids.iter().copied().filter(|id| presence.remove(*id)).collect()
            };
            if !withdrawn.is_empty() {
                let removal = self.lock_presence().encode(&withdrawn);
                dead = self.broadcast(protocol::encode_awareness(removal)).await;
            }
            debug!(doc = %self.name, conn_id = %conn_id, remaining, "connection detached");
        }
        (remaining, dead)
    }

    /// Handle one inbound protocol frame from `conn`.
    ///
    /// Only sync-step-1 and awareness-query get a direct reply; applied
    /// updates are acknowledged by nothing and reach peers through the
    /// update fan-out instead. Returns the ids of connections whose
    /// send failed during a broadcast this frame triggered.
    pub async fn handle_message(
        &self,
        conn: &Arc<dyn Connection>,
        frame: &[u8],
    ) -> Result<Vec<ConnectionId>, EngineError> {
        let message = protocol::decode_message(frame)
            .map_err(|error| EngineError::protocol(&self.name, error))?;

        match message {
            ProtoMessage::Sync(SyncMessage::SyncStep1(state_vector)) => {
                let diff = self.doc.transact().encode_diff_v1(&state_vector);
                conn.send(Message::binary(protocol::encode_sync_step2(diff))).await?;
                Ok(Vec::new())
            }
            ProtoMessage::Sync(SyncMessage::SyncStep2(update))
            | ProtoMessage::Sync(SyncMessage::Update(update)) => {
                self.apply_update_bytes(&update)?;
                Ok(Vec::new())
            }
            ProtoMessage::Awareness(update) => self.apply_awareness(conn, update).await,
            ProtoMessage::AwarenessQuery => {
                let snapshot = self.lock_presence().snapshot();
                conn.send(Message::binary(protocol::encode_awareness(snapshot))).await?;
                Ok(Vec::new())
            }
            ProtoMessage::Auth(_) | ProtoMessage::Custom(_, _) => {
                debug!(doc = %self.name, "ignoring unsupported protocol message");
                Ok(Vec::new())
            }
        }
    }

    /// Decode and apply a document update. Peers learn about it through
    /// the fan-out channel, never from this call directly; an update the
    /// doc already knew produces the empty delta and is not forwarded.
    pub fn apply_update_bytes(&self, update: &[u8]) -> Result<(), EngineError> {
        let decoded =
            Update::decode_v1(update).map_err(|error| EngineError::protocol(&self.name, error))?;
        let delta = {
            let mut txn = self.doc.transact_mut();
            txn.apply_update(decoded).map_err(|error| EngineError::update(&self.name, error))?;
            txn.encode_update_v1()
        };
        // The empty delta is two zero bytes: no structs, no deletions.
        if delta.len() > 2 {
            let _ = self.updates.send(delta);
        }
        Ok(())
    }

    async fn apply_awareness(
        &self,
        conn: &Arc<dyn Connection>,
        update: AwarenessUpdate,
    ) -> Result<Vec<ConnectionId>, EngineError> {
        let summary = self.lock_presence().apply(&update);

        if !summary.added.is_empty() {
            if let Some(entry) = self.conns.write().await.get_mut(&conn.id()) {
                entry.client_ids.extend(summary.added.iter().copied());
            }
        }

        let changed = summary.all_changes();
        if changed.is_empty() {
            return Ok(Vec::new());
        }

        let rebroadcast = self.lock_presence().encode(&changed);
        Ok(self.broadcast(protocol::encode_awareness(rebroadcast)).await)
    }

    /// Send a frame to every attached connection. A failed send marks
    /// that connection dead without aborting delivery to the rest;
    /// the returned ids are for the caller to detach.
    pub async fn broadcast(&self, frame: Vec<u8>) -> Vec<ConnectionId> {
        let targets: Vec<Arc<dyn Connection>> =
            self.conns.read().await.values().map(|entry| Arc::clone(&entry.conn)).collect();

        let mut dead = Vec::new();
        for conn in targets {
            if let Err(error) = conn.send(Message::binary(frame.clone())).await {
                warn!(doc = %self.name, conn_id = %conn.id(), %error, "send failed during broadcast");
                dead.push(conn.id());
            }
        }
        dead
    }

    /// Awareness client ids currently attributed to `conn_id`.
    pub async fn client_ids_of(&self, conn_id: ConnectionId) -> HashSet<u64> {
        self.conns
            .read()
            .await
            .get(&conn_id)
            .map(|entry| entry.client_ids.clone())
            .unwrap_or_default()
    }

    fn lock_presence(&self) -> MutexGuard<'_, PresenceTable> {
        self.presence.lock().expect("presence lock should not be poisoned")
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use yrs::sync::awareness::AwarenessUpdateEntry;
    use yrs::sync::AwarenessUpdate;

    use super::{PresenceTable, SharedDoc};

    fn update_for(client_id: u64, clock: u32, json: &str) -> AwarenessUpdate {
        let mut update = AwarenessUpdate { clients: Default::default() };
        update
            .clients
            .insert(client_id, AwarenessUpdateEntry { clock, json: Arc::from(json) });
        update
    }

    #[test]
    fn shared_doc_can_be_held_across_tasks() {
        fn assert_shareable<T: Send + Sync>() {}
        assert_shareable::<SharedDoc>();
    }

    #[test]
    fn stale_presence_update_is_ignored() {
        let mut table = PresenceTable::default();
        let added = table.apply(&update_for(7, 2, r#"{"user":"ada"}"#));
        assert_eq!(added.added, vec![7]);

        let stale = table.apply(&update_for(7, 1, r#"{"user":"eve"}"#));
        assert!(stale.all_changes().is_empty());
        assert_eq!(table.live_clients(), vec![7]);
    }

    #[test]
    fn withdrawal_at_same_clock_removes_the_state() {
        let mut table = PresenceTable::default();
        table.apply(&update_for(7, 2, r#"{"user":"ada"}"#));

        let summary = table.apply(&update_for(7, 2, "null"));
        assert_eq!(summary.removed, vec![7]);
        assert!(table.live_clients().is_empty());

        // A re-announcement at a newer clock revives the client.
        let revived = table.apply(&update_for(7, 3, r#"{"user":"ada"}"#));
        assert_eq!(revived.updated, vec![7]);
        assert_eq!(table.live_clients(), vec![7]);
    }

    #[test]
    fn server_side_removal_outranks_the_stored_clock() {
        let mut table = PresenceTable::default();
        table.apply(&update_for(7, 2, r#"{"user":"ada"}"#));
        assert!(table.remove(7));
        assert!(!table.remove(7), "a withdrawn client has nothing left to remove");

        let removal = table.encode(&[7]);
        let entry = removal.clients.get(&7).expect("removal must cover the client");
        assert_eq!(entry.clock, 3);
        assert_eq!(entry.json.as_ref(), "null");
    }
}
