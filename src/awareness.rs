//! Per-client ephemeral presence state ("awareness").
//!
//! Awareness carries the short-lived data that does not need CRDT
//! guarantees: cursors, selections, user metadata. It is a map from a
//! client id to an opaque JSON value, with a monotonically increasing clock
//! per client so that stale updates lose against fresh ones regardless of
//! arrival order.
//!
//! Change notifications go out as [`AwarenessEvent`]s over a broadcast
//! channel; every event says which clients were added, updated or removed
//! and where the change came from (local mutation, reliable stream, or
//! unreliable datagram).
//!
//! The wire codec encodes a chosen subset of clients as a list of
//! `(client_id, clock, state)` entries. Applying an update keeps an entry
//! only when its clock advances the recorded one; a removal wins a clock
//! tie, so "client left" is never shadowed by an equally-old state.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::broadcast;

/// Awareness client identifier.
pub type ClientId = u32;

/// Where an awareness change came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AwarenessOrigin {
    /// A mutation of the local state.
    Local,
    /// An update applied from the reliable control stream.
    RemoteStream,
    /// A state applied from an unreliable datagram.
    RemoteDatagram,
}

impl std::fmt::Display for AwarenessOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AwarenessOrigin::Local => write!(f, "local"),
            AwarenessOrigin::RemoteStream => write!(f, "remote-stream"),
            AwarenessOrigin::RemoteDatagram => write!(f, "remote-datagram"),
        }
    }
}

/// A single awareness change notification.
#[derive(Debug, Clone)]
pub struct AwarenessEvent {
    pub added: Vec<ClientId>,
    pub updated: Vec<ClientId>,
    pub removed: Vec<ClientId>,
    pub origin: AwarenessOrigin,
}

impl AwarenessEvent {
    /// Whether the change set contains the given client.
    pub fn touches(&self, client_id: ClientId) -> bool {
        self.added.contains(&client_id)
            || self.updated.contains(&client_id)
            || self.removed.contains(&client_id)
    }
}

/// One client's entry in an encoded awareness update.
///
/// `state: None` encodes removal. The state itself travels as JSON text,
/// opaque to the protocol and round-trippable on the peer side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AwarenessEntry {
    pub client_id: ClientId,
    pub clock: u32,
    pub state: Option<String>,
}

struct AwarenessState {
    states: HashMap<ClientId, Value>,
    clocks: HashMap<ClientId, u32>,
}

/// The awareness datatype: client states, per-client clocks, change events.
pub struct Awareness {
    client_id: ClientId,
    inner: RwLock<AwarenessState>,
    event_tx: broadcast::Sender<AwarenessEvent>,
}

impl Awareness {
    /// Create an awareness instance for the given local client id.
    pub fn new(client_id: ClientId) -> Self {
        let (event_tx, _) = broadcast::channel(100);
        Self {
            client_id,
            inner: RwLock::new(AwarenessState {
                states: HashMap::new(),
                clocks: HashMap::new(),
            }),
            event_tx,
        }
    }

    /// Create an awareness instance with a fresh random client id.
    pub fn with_random_id() -> Self {
        Self::new(rand::random::<ClientId>())
    }

    /// The local client id.
    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    /// The local client's state, if set.
    pub fn local_state(&self) -> Option<Value> {
        self.inner.read().states.get(&self.client_id).cloned()
    }

    /// Replace the local state and notify subscribers.
    pub fn set_local_state(&self, state: Value) {
        let added = {
            let mut inner = self.inner.write();
            *inner.clocks.entry(self.client_id).or_insert(0) += 1;
            inner.states.insert(self.client_id, state).is_none()
        };
        let (mut added_ids, mut updated_ids) = (Vec::new(), Vec::new());
        if added {
            added_ids.push(self.client_id);
        } else {
            updated_ids.push(self.client_id);
        }
        self.emit(added_ids, updated_ids, Vec::new(), AwarenessOrigin::Local);
    }

    /// Set a single field of the local state, treating it as a JSON object.
    pub fn set_local_state_field(&self, field: &str, value: Value) {
        let mut state = self.local_state().unwrap_or_else(|| Value::Object(Default::default()));
        if !state.is_object() {
            state = Value::Object(Default::default());
        }
        if let Some(map) = state.as_object_mut() {
            map.insert(field.to_string(), value);
        }
        self.set_local_state(state);
    }

    /// Clear the local state (announces "client left" to peers).
    pub fn clear_local_state(&self) {
        let removed = {
            let mut inner = self.inner.write();
            *inner.clocks.entry(self.client_id).or_insert(0) += 1;
            inner.states.remove(&self.client_id).is_some()
        };
        if removed {
            self.emit(Vec::new(), Vec::new(), vec![self.client_id], AwarenessOrigin::Local);
        }
    }

    /// Snapshot of all known client states, local included.
    pub fn states(&self) -> HashMap<ClientId, Value> {
        self.inner.read().states.clone()
    }

    /// The recorded clock for a client (0 if never seen).
    pub fn clock(&self, client_id: ClientId) -> u32 {
        self.inner.read().clocks.get(&client_id).copied().unwrap_or(0)
    }

    /// Subscribe to change events.
    pub fn subscribe(&self) -> broadcast::Receiver<AwarenessEvent> {
        self.event_tx.subscribe()
    }

    /// Encode an update covering the given clients.
    ///
    /// Clients without a recorded state are encoded as removals so the peer
    /// forgets them too.
    pub fn encode_update(&self, clients: &[ClientId]) -> Vec<u8> {
        let inner = self.inner.read();
        let entries: Vec<AwarenessEntry> = clients
            .iter()
            .map(|id| AwarenessEntry {
                client_id: *id,
                clock: inner.clocks.get(id).copied().unwrap_or(0),
                state: inner.states.get(id).map(|v| v.to_string()),
            })
            .collect();
        bincode::serde::encode_to_vec(&entries, bincode::config::standard()).unwrap_or_default()
    }

    /// Apply an encoded update, keeping entries whose clock advances the
    /// recorded one (removal wins a tie). Emits one change event covering
    /// everything that actually changed.
    pub fn apply_update(&self, data: &[u8], origin: AwarenessOrigin) -> Result<(), String> {
        let (entries, _): (Vec<AwarenessEntry>, usize) =
            bincode::serde::decode_from_slice(data, bincode::config::standard())
                .map_err(|e| e.to_string())?;

        let mut added = Vec::new();
        let mut updated = Vec::new();
        let mut removed = Vec::new();
        {
            let mut inner = self.inner.write();
            for entry in entries {
                let recorded = inner.clocks.get(&entry.client_id).copied();
                let fresh = match recorded {
                    None => true,
                    Some(clock) => {
                        entry.clock > clock || (entry.clock == clock && entry.state.is_none())
                    }
                };
                if !fresh {
                    continue;
                }
                inner.clocks.insert(entry.client_id, entry.clock);
                match entry.state {
                    Some(json) => match serde_json::from_str::<Value>(&json) {
                        Ok(value) => {
                            if inner.states.insert(entry.client_id, value).is_some() {
                                updated.push(entry.client_id);
                            } else {
                                added.push(entry.client_id);
                            }
                        }
                        Err(e) => {
                            log::warn!(
                                "discarding awareness entry for client {} with malformed state: {e}",
                                entry.client_id
                            );
                        }
                    },
                    None => {
                        if inner.states.remove(&entry.client_id).is_some() {
                            removed.push(entry.client_id);
                        }
                    }
                }
            }
        }
        if !added.is_empty() || !updated.is_empty() || !removed.is_empty() {
            self.emit(added, updated, removed, origin);
        }
        Ok(())
    }

    /// Apply a state received over the datagram channel for a remote client.
    ///
    /// Datagram freshness is already decided by the caller's remote-clock
    /// table, so this unconditionally installs the state and emits the
    /// synthetic `updated` event for the sender.
    pub(crate) fn apply_remote_state(&self, client_id: ClientId, state: Value) {
        {
            let mut inner = self.inner.write();
            *inner.clocks.entry(client_id).or_insert(0) += 1;
            inner.states.insert(client_id, state);
        }
        self.emit(Vec::new(), vec![client_id], Vec::new(), AwarenessOrigin::RemoteDatagram);
    }

    /// Forget the given clients entirely (stale eviction).
    pub(crate) fn remove_states(&self, clients: &[ClientId], origin: AwarenessOrigin) {
        let mut removed = Vec::new();
        {
            let mut inner = self.inner.write();
            for id in clients {
                if inner.states.remove(id).is_some() {
                    removed.push(*id);
                }
                inner.clocks.remove(id);
            }
        }
        if !removed.is_empty() {
            self.emit(Vec::new(), Vec::new(), removed, origin);
        }
    }

    fn emit(
        &self,
        added: Vec<ClientId>,
        updated: Vec<ClientId>,
        removed: Vec<ClientId>,
        origin: AwarenessOrigin,
    ) {
        let _ = self.event_tx.send(AwarenessEvent { added, updated, removed, origin });
    }
}

impl std::fmt::Debug for Awareness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Awareness")
            .field("client_id", &self.client_id)
            .field("known_clients", &self.inner.read().states.len())
            .finish_non_exhaustive()
    }
}
