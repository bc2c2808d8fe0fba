//! The collaboration provider: binds a `yrs` document and an awareness
//! instance to a relay room over the QUIC connection manager.
//!
//! ```text
//! yrs::Doc ──observe──┐                   ┌──────────────────┐
//!                       ▼                 │ ConnectionManager │
//!                 CollabProvider ◄──────► │  control stream   │ ◄──► relay
//!                       ▲                 │  datagrams        │
//! Awareness ◄── PresencePipeline ◄────────┴──────────────────┘
//! ```
//!
//! On every `connected` transition the provider starts a fresh presence
//! pipeline and opens the two-phase sync handshake: it sends its state
//! vector (`0x00`), answers a remote state vector with the missing updates
//! (`0x01`), and applies whatever the peer sends. The first applied
//! sync-step-2 flips the `synced` flag. Incremental local edits go out as
//! `0x02` frames, except edits produced by applying remote messages: those
//! are recognized by the provider's transaction origin and never echoed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, Origin, ReadTxn, StateVector, Transact, Update};

use crate::awareness::{Awareness, ClientId};
use crate::connection::{
    CollabError, ConnectOptions, ConnectionEvent, ConnectionManager, ConnectionState,
    CertificateHash, ReconnectConfig,
};
use crate::framing::tag;
use crate::presence::{PresenceOptions, PresencePipeline};

/// A yrs v1 update that carries no structs and no deletes.
const EMPTY_UPDATE_V1: [u8; 2] = [0, 0];

/// Events emitted by the provider.
#[derive(Debug, Clone)]
pub enum ProviderEvent {
    /// Connection lifecycle transition.
    Status(ConnectionState),
    /// The synced flag changed.
    Synced(bool),
    /// Legacy alias: emitted once per synced transition, always `true`.
    Sync(bool),
    /// A transport failure; reconnection is already underway.
    ConnectionError(String),
    /// The relay closed the transport.
    ConnectionClose { code: u32, reason: String },
}

/// Provider configuration.
#[derive(Debug, Clone)]
pub struct ProviderOptions {
    /// Awareness instance to bind; a fresh one is created when absent.
    pub awareness: Option<Arc<Awareness>>,
    /// Connect during construction.
    pub connect: bool,
    /// Pinned server certificate hashes (self-signed deployments).
    pub server_certificate_hashes: Vec<CertificateHash>,
    /// Route presence over unreliable datagrams.
    pub use_unreliable_awareness: bool,
    /// Datagram broadcast period.
    pub awareness_update_interval: Duration,
    pub max_reconnect_attempts: u32,
    pub reconnect_base_delay: Duration,
    pub reconnect_max_delay: Duration,
    /// Period for re-sending sync-step-1; zero disables.
    pub resync_interval: Duration,
    /// Query params appended to the endpoint path verbatim.
    pub params: Vec<(String, String)>,
}

impl Default for ProviderOptions {
    fn default() -> Self {
        let reconnect = ReconnectConfig::default();
        Self {
            awareness: None,
            connect: true,
            server_certificate_hashes: Vec::new(),
            use_unreliable_awareness: true,
            awareness_update_interval: Duration::from_millis(50),
            max_reconnect_attempts: reconnect.max_attempts,
            reconnect_base_delay: reconnect.base_delay,
            reconnect_max_delay: reconnect.max_delay,
            resync_interval: Duration::ZERO,
            params: Vec::new(),
        }
    }
}

struct ProviderShared {
    doc: Doc,
    awareness: Arc<Awareness>,
    origin: Origin,
    manager: ConnectionManager,
    connected: AtomicBool,
    synced: AtomicBool,
    destroyed: AtomicBool,
    event_tx: mpsc::Sender<ProviderEvent>,
    pipeline: parking_lot::Mutex<Option<PresencePipeline>>,
    stream_outbox: mpsc::Sender<Vec<u8>>,
    datagram_outbox: mpsc::Sender<Vec<u8>>,
    use_datagrams: bool,
    broadcast_interval: Duration,
}

/// Binds a document replica to a named room on a remote relay.
pub struct CollabProvider {
    shared: Arc<ProviderShared>,
    event_rx: Option<mpsc::Receiver<ProviderEvent>>,
    doc_subscription: Option<yrs::Subscription>,
    tasks: Vec<JoinHandle<()>>,
}

impl CollabProvider {
    /// Create a provider for `${server_url}/collab/${room_name}` and, unless
    /// `options.connect` is false, start connecting in the background.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        server_url: impl Into<String>,
        room_name: impl Into<String>,
        doc: Doc,
        options: ProviderOptions,
    ) -> Result<Self, CollabError> {
        let awareness = options
            .awareness
            .unwrap_or_else(|| Arc::new(Awareness::with_random_id()));
        let manager = ConnectionManager::new(
            server_url,
            room_name,
            ConnectOptions {
                server_certificate_hashes: options.server_certificate_hashes,
                reconnect: ReconnectConfig {
                    max_attempts: options.max_reconnect_attempts,
                    base_delay: options.reconnect_base_delay,
                    max_delay: options.reconnect_max_delay,
                },
                params: options.params,
            },
        );
        let conn_rx = manager
            .take_event_rx()
            .ok_or_else(|| CollabError::Transport("connection events already taken".to_string()))?;

        let token = format!("quicsync:{}", uuid::Uuid::new_v4());
        let origin = Origin::from(token.as_str());
        let (doc_tx, doc_rx) = mpsc::unbounded_channel();
        let doc_subscription = register_update_forwarder(&doc, origin.clone(), doc_tx)?;

        let (event_tx, event_rx) = mpsc::channel(256);
        let (stream_outbox, stream_outbox_rx) = mpsc::channel(64);
        let (datagram_outbox, datagram_outbox_rx) = mpsc::channel(256);

        let shared = Arc::new(ProviderShared {
            doc,
            awareness,
            origin,
            manager: manager.clone(),
            connected: AtomicBool::new(false),
            synced: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            event_tx,
            pipeline: parking_lot::Mutex::new(None),
            stream_outbox,
            datagram_outbox,
            use_datagrams: options.use_unreliable_awareness,
            broadcast_interval: options.awareness_update_interval,
        });

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(dispatch(shared.clone(), conn_rx, doc_rx)));
        tasks.push(tokio::spawn(forward_outboxes(
            manager.clone(),
            stream_outbox_rx,
            datagram_outbox_rx,
        )));
        if options.resync_interval > Duration::ZERO {
            tasks.push(tokio::spawn(resync_loop(shared.clone(), options.resync_interval)));
        }
        if options.connect {
            let manager = manager.clone();
            tokio::spawn(async move {
                if let Err(e) = manager.connect().await {
                    log::debug!("initial connect failed: {e}");
                }
            });
        }

        Ok(Self { shared, event_rx: Some(event_rx), doc_subscription: Some(doc_subscription), tasks })
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<ProviderEvent>> {
        self.event_rx.take()
    }

    pub async fn connect(&self) -> Result<(), CollabError> {
        if self.shared.destroyed.load(Ordering::SeqCst) {
            return Err(CollabError::Destroyed);
        }
        self.shared.manager.connect().await
    }

    pub async fn disconnect(&self) {
        self.shared.manager.disconnect().await;
    }

    /// Tear everything down. Idempotent; no callbacks fire afterwards.
    pub async fn destroy(&mut self) {
        if self.shared.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.doc_subscription.take();
        self.shared.awareness.clear_local_state();
        if let Some(mut pipeline) = self.shared.pipeline.lock().take() {
            pipeline.destroy();
        }
        self.shared.manager.destroy().await;
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }

    pub fn server_url(&self) -> &str {
        self.shared.manager.server_url()
    }

    pub fn room_name(&self) -> &str {
        self.shared.manager.room_name()
    }

    pub fn doc(&self) -> &Doc {
        &self.shared.doc
    }

    pub fn awareness(&self) -> Arc<Awareness> {
        self.shared.awareness.clone()
    }

    /// Whether the control stream is currently open.
    pub fn connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Whether the initial handshake since the last connect has completed.
    pub fn synced(&self) -> bool {
        self.shared.synced.load(Ordering::SeqCst)
    }

    /// Evict remote peers whose presence has gone silent past the stale
    /// timeout. The live pipeline also sweeps on its own; this forwards to
    /// it for on-demand eviction. Returns the evicted client ids.
    pub fn evict_stale_peers(&self) -> Vec<ClientId> {
        self.shared
            .pipeline
            .lock()
            .as_ref()
            .map(|pipeline| pipeline.evict_stale())
            .unwrap_or_default()
    }
}

/// Forward every local doc update except those the provider itself applied,
/// recognized by transaction origin: applying a remote message must not
/// echo it back.
fn register_update_forwarder(
    doc: &Doc,
    origin: Origin,
    tx: mpsc::UnboundedSender<Vec<u8>>,
) -> Result<yrs::Subscription, CollabError> {
    doc.observe_update_v1(move |txn, event| {
        if txn.origin() == Some(&origin) {
            return;
        }
        let _ = tx.send(event.update.clone());
    })
    .map_err(|e| CollabError::Crdt(e.to_string()))
}

async fn dispatch(
    shared: Arc<ProviderShared>,
    mut conn_rx: mpsc::Receiver<ConnectionEvent>,
    mut doc_rx: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    let mut doc_open = true;
    loop {
        tokio::select! {
            event = conn_rx.recv() => match event {
                Some(event) => handle_connection_event(&shared, event).await,
                None => break,
            },
            update = doc_rx.recv(), if doc_open => match update {
                Some(update) => handle_local_update(&shared, update).await,
                None => doc_open = false,
            },
        }
    }
}

async fn handle_connection_event(shared: &Arc<ProviderShared>, event: ConnectionEvent) {
    match event {
        ConnectionEvent::Status(state) => {
            match state {
                ConnectionState::Connected => {
                    shared.connected.store(true, Ordering::SeqCst);
                    start_pipeline(shared);
                    emit(shared, ProviderEvent::Status(state)).await;
                    send_sync_step1(shared).await;
                    return;
                }
                ConnectionState::Disconnected => {
                    shared.connected.store(false, Ordering::SeqCst);
                    if shared.synced.swap(false, Ordering::SeqCst) {
                        emit(shared, ProviderEvent::Status(state)).await;
                        emit(shared, ProviderEvent::Synced(false)).await;
                        return;
                    }
                }
                ConnectionState::Connecting | ConnectionState::Reconnecting => {
                    shared.connected.store(false, Ordering::SeqCst);
                }
            }
            emit(shared, ProviderEvent::Status(state)).await;
        }
        ConnectionEvent::StreamFrame(frame) => handle_frame(shared, &frame).await,
        ConnectionEvent::Datagram(data) => {
            let pipeline = shared.pipeline.lock();
            if let Some(p) = pipeline.as_ref() {
                p.handle_datagram(&data);
            }
        }
        ConnectionEvent::Closed { code, reason } => {
            emit(shared, ProviderEvent::ConnectionClose { code, reason }).await;
        }
        ConnectionEvent::TransportError(e) => {
            emit(shared, ProviderEvent::ConnectionError(e)).await;
        }
    }
}

async fn handle_frame(shared: &Arc<ProviderShared>, frame: &[u8]) {
    let Some((&tag_byte, payload)) = frame.split_first() else {
        log::debug!("discarding empty frame");
        return;
    };
    match tag_byte {
        tag::SYNC_STEP1 => match StateVector::decode_v1(payload) {
            Ok(remote_sv) => {
                let diff = shared.doc.transact().encode_diff_v1(&remote_sv);
                if diff.as_slice() != EMPTY_UPDATE_V1 {
                    send_tagged(shared, tag::SYNC_STEP2, &diff).await;
                }
                // Run the handshake symmetrically until the first step-2
                // lands, so a relay-initiated handshake also converges.
                if !shared.synced.load(Ordering::SeqCst) {
                    send_sync_step1(shared).await;
                }
            }
            Err(e) => log::warn!("discarding sync-step-1 with malformed state vector: {e}"),
        },
        tag::SYNC_STEP2 => {
            apply_remote_update(shared, payload);
            if !shared.synced.swap(true, Ordering::SeqCst) {
                emit(shared, ProviderEvent::Synced(true)).await;
                emit(shared, ProviderEvent::Sync(true)).await;
            }
        }
        tag::UPDATE => apply_remote_update(shared, payload),
        tag::AWARENESS => {
            let pipeline = shared.pipeline.lock();
            if let Some(p) = pipeline.as_ref() {
                p.handle_stream_frame(frame);
            }
        }
        other => log::debug!("discarding message with unknown tag {other:#04x}"),
    }
}

fn apply_remote_update(shared: &ProviderShared, payload: &[u8]) {
    match Update::decode_v1(payload) {
        Ok(update) => {
            let mut txn = shared.doc.transact_mut_with(shared.origin.clone());
            if let Err(e) = txn.apply_update(update) {
                log::warn!("failed to apply remote update: {e}");
            }
        }
        Err(e) => log::warn!("discarding malformed remote update: {e}"),
    }
}

async fn handle_local_update(shared: &Arc<ProviderShared>, update: Vec<u8>) {
    if !shared.connected.load(Ordering::SeqCst) {
        // The handshake on the next connect reconciles the divergence.
        log::debug!("dropping local update while disconnected ({} bytes)", update.len());
        return;
    }
    send_tagged(shared, tag::UPDATE, &update).await;
}

async fn send_sync_step1(shared: &Arc<ProviderShared>) {
    let sv = shared.doc.transact().state_vector().encode_v1();
    send_tagged(shared, tag::SYNC_STEP1, &sv).await;
}

async fn send_tagged(shared: &Arc<ProviderShared>, tag_byte: u8, body: &[u8]) {
    let mut message = Vec::with_capacity(1 + body.len());
    message.push(tag_byte);
    message.extend_from_slice(body);
    if let Err(e) = shared.manager.send_sync_message(&message).await {
        log::warn!("failed to send sync message: {e}");
    }
}

fn start_pipeline(shared: &Arc<ProviderShared>) {
    let mut slot = shared.pipeline.lock();
    if let Some(mut old) = slot.take() {
        old.destroy();
    }
    let mut pipeline = PresencePipeline::new(
        shared.awareness.clone(),
        shared.stream_outbox.clone(),
        shared.datagram_outbox.clone(),
        PresenceOptions {
            use_datagrams: shared.use_datagrams,
            broadcast_interval: shared.broadcast_interval,
            ..PresenceOptions::default()
        },
    );
    pipeline.start();
    *slot = Some(pipeline);
}

async fn forward_outboxes(
    manager: ConnectionManager,
    mut stream_rx: mpsc::Receiver<Vec<u8>>,
    mut datagram_rx: mpsc::Receiver<Vec<u8>>,
) {
    loop {
        tokio::select! {
            frame = stream_rx.recv() => match frame {
                Some(payload) => {
                    if let Err(e) = manager.send_sync_message(&payload).await {
                        log::debug!("presence frame dropped: {e}");
                    }
                }
                None => break,
            },
            datagram = datagram_rx.recv() => match datagram {
                Some(payload) => manager.send_datagram(payload).await,
                None => break,
            },
        }
    }
}

async fn resync_loop(shared: Arc<ProviderShared>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await; // the first tick fires immediately
    loop {
        ticker.tick().await;
        if shared.destroyed.load(Ordering::SeqCst) {
            break;
        }
        if shared.connected.load(Ordering::SeqCst) {
            send_sync_step1(&shared).await;
        }
    }
}

async fn emit(shared: &Arc<ProviderShared>, event: ProviderEvent) {
    let _ = shared.event_tx.send(event).await;
}
