//! Presence pipeline: routes awareness between the local datatype and the
//! wire.
//!
//! Outbound, two paths:
//! - every local awareness change is pushed immediately as a datagram (or as
//!   a reliable `0x03` frame when datagrams are disabled);
//! - a periodic task re-broadcasts the local state every
//!   `broadcast_interval` to refresh presence against datagram loss.
//!
//! On start the pipeline also emits one reliable full-state awareness frame
//! so a newly-connected peer learns pre-existing presence even over a lossy
//! datagram channel.
//!
//! Inbound, datagrams carry a per-client logical clock: the pipeline keeps
//! the highest clock accepted per sender and drops anything at or below it,
//! which turns the unordered channel into latest-wins per sender. Fresh
//! states are applied through the awareness datatype keyed by the real
//! remote client id. Peers that stay silent past the stale timeout are
//! evicted from both the clock table and the awareness mirror.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::awareness::{Awareness, AwarenessOrigin, ClientId};
use crate::framing::{self, tag};

/// Pipeline tuning.
#[derive(Debug, Clone)]
pub struct PresenceOptions {
    /// Route local presence over unreliable datagrams.
    pub use_datagrams: bool,
    /// Period of the local-state datagram refresh.
    pub broadcast_interval: Duration,
    /// Silence threshold for evicting remote peers.
    pub stale_timeout: Duration,
}

impl Default for PresenceOptions {
    fn default() -> Self {
        Self {
            use_datagrams: true,
            broadcast_interval: Duration::from_millis(50),
            stale_timeout: Duration::from_secs(10),
        }
    }
}

struct RemoteClock {
    clock: u32,
    last_seen: Instant,
}

/// Binds an [`Awareness`] instance to the stream and datagram send paths.
pub struct PresencePipeline {
    awareness: Arc<Awareness>,
    stream_tx: mpsc::Sender<Vec<u8>>,
    datagram_tx: mpsc::Sender<Vec<u8>>,
    options: PresenceOptions,
    local_clock: Arc<AtomicU32>,
    remote_clocks: Arc<Mutex<HashMap<ClientId, RemoteClock>>>,
    tasks: Vec<JoinHandle<()>>,
}

impl PresencePipeline {
    /// Create a pipeline. `stream_tx` and `datagram_tx` are the outboxes the
    /// orchestrator forwards to the connection's send primitives.
    pub fn new(
        awareness: Arc<Awareness>,
        stream_tx: mpsc::Sender<Vec<u8>>,
        datagram_tx: mpsc::Sender<Vec<u8>>,
        options: PresenceOptions,
    ) -> Self {
        Self {
            awareness,
            stream_tx,
            datagram_tx,
            options,
            local_clock: Arc::new(AtomicU32::new(0)),
            remote_clocks: Arc::new(Mutex::new(HashMap::new())),
            tasks: Vec::new(),
        }
    }

    /// Send the reliable full-state snapshot, subscribe to local changes and
    /// arm the periodic datagram refresh.
    pub fn start(&mut self) {
        self.send_snapshot();

        // Local change → wire.
        let awareness = self.awareness.clone();
        let stream_tx = self.stream_tx.clone();
        let datagram_tx = self.datagram_tx.clone();
        let local_clock = self.local_clock.clone();
        let use_datagrams = self.options.use_datagrams;
        let mut events = self.awareness.subscribe();
        self.tasks.push(tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        if event.origin != AwarenessOrigin::Local
                            || !event.touches(awareness.client_id())
                        {
                            continue;
                        }
                        if use_datagrams {
                            send_local_datagram(&awareness, &local_clock, &datagram_tx).await;
                        } else {
                            let mut changed: Vec<ClientId> = Vec::new();
                            changed.extend(&event.added);
                            changed.extend(&event.updated);
                            changed.extend(&event.removed);
                            let mut frame = vec![tag::AWARENESS];
                            frame.extend(awareness.encode_update(&changed));
                            if stream_tx.send(frame).await.is_err() {
                                break;
                            }
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        log::debug!("presence listener lagged by {n} events");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        }));

        // Periodic refresh against datagram loss.
        if self.options.use_datagrams {
            let awareness = self.awareness.clone();
            let datagram_tx = self.datagram_tx.clone();
            let local_clock = self.local_clock.clone();
            let period = self.options.broadcast_interval;
            self.tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                loop {
                    ticker.tick().await;
                    send_local_datagram(&awareness, &local_clock, &datagram_tx).await;
                }
            }));
        }

        // Stale-peer sweep: peers that stop sending are forgotten.
        let awareness = self.awareness.clone();
        let remote_clocks = self.remote_clocks.clone();
        let threshold = self.options.stale_timeout;
        self.tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(threshold);
            ticker.tick().await; // the first tick fires immediately
            loop {
                ticker.tick().await;
                let evicted = sweep_stale(&remote_clocks, &awareness, threshold);
                if !evicted.is_empty() {
                    log::debug!("evicted {} silent presence peers", evicted.len());
                }
            }
        }));
    }

    /// Apply a reliable awareness frame (tag byte included).
    pub fn handle_stream_frame(&self, frame: &[u8]) {
        let Some((_, payload)) = frame.split_first() else {
            return;
        };
        if let Err(e) = self.awareness.apply_update(payload, AwarenessOrigin::RemoteStream) {
            log::warn!("discarding malformed awareness frame: {e}");
        }
    }

    /// Apply a presence datagram: self-echo and stale clocks are dropped,
    /// fresh states land in the awareness mirror.
    pub fn handle_datagram(&self, data: &[u8]) {
        let (client_id, clock, state) = match framing::decode_awareness_datagram(data) {
            Ok(decoded) => decoded,
            Err(e) => {
                log::warn!("discarding datagram: {e}");
                return;
            }
        };
        if client_id == self.awareness.client_id() {
            return;
        }
        {
            let mut table = self.remote_clocks.lock();
            let fresh = match table.get(&client_id) {
                Some(entry) => clock > entry.clock,
                None => true,
            };
            if !fresh {
                return;
            }
            table.insert(client_id, RemoteClock { clock, last_seen: Instant::now() });
        }
        match serde_json::from_slice(state) {
            Ok(value) => self.awareness.apply_remote_state(client_id, value),
            Err(e) => {
                log::warn!("discarding malformed presence state from client {client_id}: {e}")
            }
        }
    }

    /// Evict peers silent for longer than the stale timeout. Runs
    /// periodically once the pipeline is started; callable on demand too.
    /// Returns the evicted client ids.
    pub fn evict_stale(&self) -> Vec<ClientId> {
        sweep_stale(&self.remote_clocks, &self.awareness, self.options.stale_timeout)
    }

    /// The highest datagram clock accepted from a client, if any.
    pub fn remote_clock(&self, client_id: ClientId) -> Option<u32> {
        self.remote_clocks.lock().get(&client_id).map(|e| e.clock)
    }

    /// Cancel the periodic refresh and the change listener.
    pub fn stop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }

    /// Stop and clear the remote-clock table.
    pub fn destroy(&mut self) {
        self.stop();
        self.remote_clocks.lock().clear();
    }

    fn send_snapshot(&self) {
        let clients: Vec<ClientId> = self.awareness.states().keys().copied().collect();
        if clients.is_empty() {
            return;
        }
        let mut frame = vec![tag::AWARENESS];
        frame.extend(self.awareness.encode_update(&clients));
        if self.stream_tx.try_send(frame).is_err() {
            log::debug!("awareness snapshot dropped: stream outbox full or closed");
        }
    }
}

impl Drop for PresencePipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Drop every remote-clock entry older than `threshold` and remove those
/// clients from the awareness mirror.
fn sweep_stale(
    remote_clocks: &Mutex<HashMap<ClientId, RemoteClock>>,
    awareness: &Awareness,
    threshold: Duration,
) -> Vec<ClientId> {
    let stale: Vec<ClientId> = {
        let mut table = remote_clocks.lock();
        let stale: Vec<ClientId> = table
            .iter()
            .filter(|(_, entry)| entry.last_seen.elapsed() > threshold)
            .map(|(id, _)| *id)
            .collect();
        for id in &stale {
            table.remove(id);
        }
        stale
    };
    if !stale.is_empty() {
        awareness.remove_states(&stale, AwarenessOrigin::RemoteDatagram);
    }
    stale
}

/// Emit one datagram carrying the local state. Skipped while the local
/// state is absent (cleared).
async fn send_local_datagram(
    awareness: &Awareness,
    local_clock: &AtomicU32,
    datagram_tx: &mpsc::Sender<Vec<u8>>,
) {
    let Some(state) = awareness.local_state() else {
        return;
    };
    let payload = match serde_json::to_vec(&state) {
        Ok(bytes) => bytes,
        Err(e) => {
            log::warn!("failed to encode local presence state: {e}");
            return;
        }
    };
    let clock = local_clock.fetch_add(1, Ordering::SeqCst) + 1;
    let datagram = framing::encode_awareness_datagram(awareness.client_id(), clock, &payload);
    let _ = datagram_tx.send(datagram).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pipeline_with_rx(
        awareness: Arc<Awareness>,
        options: PresenceOptions,
    ) -> (PresencePipeline, mpsc::Receiver<Vec<u8>>, mpsc::Receiver<Vec<u8>>) {
        let (stream_tx, stream_rx) = mpsc::channel(64);
        let (datagram_tx, datagram_rx) = mpsc::channel(256);
        let pipeline = PresencePipeline::new(awareness, stream_tx, datagram_tx, options);
        (pipeline, stream_rx, datagram_rx)
    }

    fn datagram_for(client_id: ClientId, clock: u32, value: serde_json::Value) -> Vec<u8> {
        framing::encode_awareness_datagram(client_id, clock, &serde_json::to_vec(&value).unwrap())
    }

    #[tokio::test]
    async fn test_out_of_order_datagrams_latest_wins() {
        let awareness = Arc::new(Awareness::new(1));
        let (pipeline, _stream_rx, _datagram_rx) =
            pipeline_with_rx(awareness.clone(), PresenceOptions::default());

        for clock in [3u32, 1, 2, 4] {
            pipeline.handle_datagram(&datagram_for(7, clock, json!({"clock": clock})));
        }

        assert_eq!(awareness.states().get(&7).unwrap()["clock"], 4);
        assert_eq!(pipeline.remote_clock(7), Some(4));
    }

    #[tokio::test]
    async fn test_duplicate_datagram_suppressed() {
        let awareness = Arc::new(Awareness::new(1));
        let (pipeline, _stream_rx, _datagram_rx) =
            pipeline_with_rx(awareness.clone(), PresenceOptions::default());

        pipeline.handle_datagram(&datagram_for(7, 5, json!({"v": "first"})));
        let mut events = awareness.subscribe();

        pipeline.handle_datagram(&datagram_for(7, 5, json!({"v": "dup"})));
        pipeline.handle_datagram(&datagram_for(7, 4, json!({"v": "old"})));

        assert!(events.try_recv().is_err(), "stale datagrams must not emit events");
        assert_eq!(awareness.states().get(&7).unwrap()["v"], "first");
        assert_eq!(pipeline.remote_clock(7), Some(5));
    }

    #[tokio::test]
    async fn test_self_echo_dropped() {
        let awareness = Arc::new(Awareness::new(42));
        let (pipeline, _stream_rx, _datagram_rx) =
            pipeline_with_rx(awareness.clone(), PresenceOptions::default());

        pipeline.handle_datagram(&datagram_for(42, 99, json!({"echo": true})));

        assert!(awareness.states().is_empty());
        assert_eq!(pipeline.remote_clock(42), None);
    }

    #[tokio::test]
    async fn test_malformed_datagram_discarded() {
        let awareness = Arc::new(Awareness::new(1));
        let (pipeline, _stream_rx, _datagram_rx) =
            pipeline_with_rx(awareness.clone(), PresenceOptions::default());

        pipeline.handle_datagram(&[1, 2, 3]); // shorter than the header
        let bad_json = framing::encode_awareness_datagram(7, 1, b"{not json");
        pipeline.handle_datagram(&bad_json);

        assert!(awareness.states().is_empty());
    }

    #[tokio::test]
    async fn test_local_change_emits_immediate_datagram() {
        let awareness = Arc::new(Awareness::new(9));
        let (mut pipeline, _stream_rx, mut datagram_rx) = pipeline_with_rx(
            awareness.clone(),
            PresenceOptions {
                use_datagrams: true,
                // Long period so only the change-driven datagram shows up.
                broadcast_interval: Duration::from_secs(60),
                ..PresenceOptions::default()
            },
        );
        pipeline.start();
        // The interval task fires once immediately; drain it.
        let _ = tokio::time::timeout(Duration::from_millis(200), datagram_rx.recv()).await;

        awareness.set_local_state(json!({"cursor": [1, 2]}));
        let datagram = tokio::time::timeout(Duration::from_millis(500), datagram_rx.recv())
            .await
            .expect("datagram expected")
            .unwrap();

        let (client_id, clock, state) = framing::decode_awareness_datagram(&datagram).unwrap();
        assert_eq!(client_id, 9);
        assert!(clock >= 1);
        let value: serde_json::Value = serde_json::from_slice(state).unwrap();
        assert_eq!(value["cursor"][0], 1);
        pipeline.destroy();
    }

    #[tokio::test]
    async fn test_stream_fallback_when_datagrams_disabled() {
        let awareness = Arc::new(Awareness::new(9));
        let (mut pipeline, mut stream_rx, mut datagram_rx) = pipeline_with_rx(
            awareness.clone(),
            PresenceOptions { use_datagrams: false, ..PresenceOptions::default() },
        );
        pipeline.start();

        awareness.set_local_state(json!({"name": "bob"}));
        let frame = tokio::time::timeout(Duration::from_millis(500), stream_rx.recv())
            .await
            .expect("stream frame expected")
            .unwrap();

        assert_eq!(frame[0], tag::AWARENESS);
        let peer = Awareness::new(1);
        peer.apply_update(&frame[1..], AwarenessOrigin::RemoteStream).unwrap();
        assert_eq!(peer.states().get(&9).unwrap()["name"], "bob");

        assert!(datagram_rx.try_recv().is_err(), "no datagrams when disabled");
        pipeline.destroy();
    }

    #[tokio::test]
    async fn test_snapshot_sent_on_start() {
        let awareness = Arc::new(Awareness::new(9));
        awareness.set_local_state(json!({"name": "alice"}));
        let (mut pipeline, mut stream_rx, _datagram_rx) =
            pipeline_with_rx(awareness.clone(), PresenceOptions::default());
        pipeline.start();

        let frame = stream_rx.try_recv().expect("snapshot frame on start");
        assert_eq!(frame[0], tag::AWARENESS);
        let peer = Awareness::new(1);
        peer.apply_update(&frame[1..], AwarenessOrigin::RemoteStream).unwrap();
        assert_eq!(peer.states().get(&9).unwrap()["name"], "alice");
        pipeline.destroy();
    }

    #[tokio::test]
    async fn test_no_snapshot_when_nothing_known() {
        let awareness = Arc::new(Awareness::new(9));
        let (mut pipeline, mut stream_rx, _datagram_rx) =
            pipeline_with_rx(awareness, PresenceOptions::default());
        pipeline.start();
        assert!(stream_rx.try_recv().is_err());
        pipeline.destroy();
    }

    #[tokio::test]
    async fn test_periodic_broadcast_rate() {
        let awareness = Arc::new(Awareness::new(9));
        awareness.set_local_state(json!({"cursor": 0}));
        let (mut pipeline, _stream_rx, mut datagram_rx) = pipeline_with_rx(
            awareness,
            PresenceOptions {
                broadcast_interval: Duration::from_millis(50),
                ..PresenceOptions::default()
            },
        );
        pipeline.start();

        let deadline = Instant::now() + Duration::from_secs(1);
        let mut count = 0usize;
        while Instant::now() < deadline {
            match tokio::time::timeout(Duration::from_millis(100), datagram_rx.recv()).await {
                Ok(Some(_)) => count += 1,
                _ => break,
            }
        }
        pipeline.destroy();

        assert!(
            (18..=22).contains(&count),
            "expected 18..=22 datagrams in 1s at 50ms interval, got {count}"
        );
    }

    #[tokio::test]
    async fn test_no_broadcast_without_local_state() {
        let awareness = Arc::new(Awareness::new(9));
        let (mut pipeline, _stream_rx, mut datagram_rx) = pipeline_with_rx(
            awareness,
            PresenceOptions {
                broadcast_interval: Duration::from_millis(10),
                ..PresenceOptions::default()
            },
        );
        pipeline.start();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(datagram_rx.try_recv().is_err());
        pipeline.destroy();
    }

    #[tokio::test]
    async fn test_stale_eviction() {
        let awareness = Arc::new(Awareness::new(1));
        let (pipeline, _stream_rx, _datagram_rx) = pipeline_with_rx(
            awareness.clone(),
            PresenceOptions { stale_timeout: Duration::from_millis(50), ..PresenceOptions::default() },
        );

        pipeline.handle_datagram(&datagram_for(7, 1, json!({"here": true})));
        assert!(awareness.states().contains_key(&7));

        tokio::time::sleep(Duration::from_millis(80)).await;
        // A fresh peer arrives after the old one went silent.
        pipeline.handle_datagram(&datagram_for(8, 1, json!({"here": true})));

        let evicted = pipeline.evict_stale();
        assert_eq!(evicted, vec![7]);
        assert!(!awareness.states().contains_key(&7));
        assert!(awareness.states().contains_key(&8));
        assert_eq!(pipeline.remote_clock(7), None);
    }

    #[tokio::test]
    async fn test_periodic_sweep_evicts_silent_peers() {
        let awareness = Arc::new(Awareness::new(1));
        let (mut pipeline, _stream_rx, _datagram_rx) = pipeline_with_rx(
            awareness.clone(),
            PresenceOptions {
                use_datagrams: false,
                stale_timeout: Duration::from_millis(50),
                ..PresenceOptions::default()
            },
        );
        pipeline.start();

        pipeline.handle_datagram(&datagram_for(7, 1, json!({"here": true})));
        assert!(awareness.states().contains_key(&7));

        // The sweep task runs on its own; no explicit evict_stale() call.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(
            !awareness.states().contains_key(&7),
            "silent peer survived the periodic sweep"
        );
        assert_eq!(pipeline.remote_clock(7), None);
        pipeline.destroy();
    }

    #[tokio::test]
    async fn test_destroy_clears_clock_table() {
        let awareness = Arc::new(Awareness::new(1));
        let (mut pipeline, _stream_rx, _datagram_rx) =
            pipeline_with_rx(awareness, PresenceOptions::default());
        pipeline.handle_datagram(&datagram_for(7, 3, json!({})));
        assert_eq!(pipeline.remote_clock(7), Some(3));

        pipeline.destroy();
        assert_eq!(pipeline.remote_clock(7), None);
    }
}
