//! In-process QUIC relay for integration tests.
//!
//! Speaks the provider's wire contract: stream-type marker, a room header
//! frame, then length-prefixed application frames. Each room keeps an
//! authoritative yrs doc; sync traffic is applied to it and fanned out to
//! every other client, datagrams are fanned out verbatim. The relay answers
//! a sync-step-1 with the missing updates plus its own state vector, so
//! clients end up reconciled through the room doc.

#![allow(dead_code)]

use quicsync::framing::{self, tag};
use quicsync::CertificateHash;
use quinn::{Connection, Endpoint, VarInt};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, GetString, ReadTxn, StateVector, Text, Transact, Update, WriteTxn};

pub struct TestRelay {
    endpoint: Endpoint,
    shared: Arc<RelayShared>,
    pub port: u16,
    cert_hash: Vec<u8>,
}

struct RelayShared {
    rooms: Mutex<HashMap<String, Arc<Room>>>,
    next_client: AtomicU64,
}

struct Room {
    doc: Doc,
    clients: Mutex<HashMap<u64, ClientHandle>>,
}

struct ClientHandle {
    frames: mpsc::Sender<Vec<u8>>,
    connection: Connection,
}

impl TestRelay {
    /// Bind a relay on an ephemeral localhost port with a self-signed cert.
    pub async fn start() -> TestRelay {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let cert_der = CertificateDer::from(cert.cert.der().clone());
        let key = PrivateKeyDer::try_from(cert.key_pair.serialize_der()).unwrap();
        let cert_hash = Sha256::digest(cert_der.as_ref()).to_vec();

        let server_config = quinn::ServerConfig::with_single_cert(vec![cert_der], key).unwrap();
        let endpoint =
            Endpoint::server(server_config, SocketAddr::from((Ipv4Addr::LOCALHOST, 0))).unwrap();
        let port = endpoint.local_addr().unwrap().port();

        let shared = Arc::new(RelayShared {
            rooms: Mutex::new(HashMap::new()),
            next_client: AtomicU64::new(1),
        });

        let accept_endpoint = endpoint.clone();
        let accept_shared = shared.clone();
        tokio::spawn(async move {
            while let Some(incoming) = accept_endpoint.accept().await {
                let shared = accept_shared.clone();
                tokio::spawn(async move {
                    if let Ok(connection) = incoming.await {
                        handle_connection(shared, connection).await;
                    }
                });
            }
        });

        TestRelay { endpoint, shared, port, cert_hash }
    }

    pub fn url(&self) -> String {
        format!("https://127.0.0.1:{}", self.port)
    }

    pub fn certificate_hash(&self) -> CertificateHash {
        CertificateHash::sha256(self.cert_hash.clone())
    }

    /// Pre-populate a room's doc before any client connects.
    pub async fn seed_text(&self, room_name: &str, content: &str) {
        let room = self.shared.room(room_name).await;
        let mut txn = room.doc.transact_mut();
        let text = txn.get_or_insert_text("content");
        text.insert(&mut txn, 0, content);
    }

    /// The room doc's "content" text, as the relay currently sees it.
    pub async fn room_text(&self, room_name: &str) -> String {
        let room = self.shared.room(room_name).await;
        let txn = room.doc.transact();
        txn.get_text("content")
            .map(|text| text.get_string(&txn))
            .unwrap_or_default()
    }

    pub async fn client_count(&self, room_name: &str) -> usize {
        self.shared.room(room_name).await.clients.lock().await.len()
    }

    /// Close every client connection with the given application code.
    pub async fn close_all(&self, code: u32, reason: &[u8]) {
        let rooms = self.shared.rooms.lock().await;
        for room in rooms.values() {
            let clients = room.clients.lock().await;
            for handle in clients.values() {
                handle.connection.close(VarInt::from_u32(code), reason);
            }
        }
    }

    pub fn shutdown(&self) {
        self.endpoint.close(VarInt::from_u32(0), b"shutdown");
    }
}

impl RelayShared {
    async fn room(&self, name: &str) -> Arc<Room> {
        let mut rooms = self.rooms.lock().await;
        rooms
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(Room { doc: Doc::new(), clients: Mutex::new(HashMap::new()) })
            })
            .clone()
    }
}

async fn handle_connection(shared: Arc<RelayShared>, connection: Connection) {
    let Ok((send, mut recv)) = connection.accept_bi().await else {
        return;
    };
    let client_id = shared.next_client.fetch_add(1, Ordering::SeqCst);

    // Per-client frame writer.
    let (frames_tx, mut frames_rx) = mpsc::channel::<Vec<u8>>(256);
    let mut send = send;
    tokio::spawn(async move {
        while let Some(payload) = frames_rx.recv().await {
            let Ok(framed) = framing::encode_frame(&payload) else {
                continue;
            };
            if send.write_all(&framed).await.is_err() {
                break;
            }
        }
    });

    let mut room: Option<Arc<Room>> = None;
    let mut pending: Vec<u8> = Vec::new();
    let mut chunk = vec![0u8; 4096];
    let mut saw_marker = false;

    loop {
        match recv.read(&mut chunk).await {
            Ok(Some(n)) => {
                pending.extend_from_slice(&chunk[..n]);
                if !saw_marker {
                    if pending.is_empty() {
                        continue;
                    }
                    assert_eq!(pending[0], framing::STREAM_TYPE_SYNC, "unexpected stream type");
                    pending.remove(0);
                    saw_marker = true;
                }
                let (frames, tail) = framing::decode_frames(&pending);
                pending = tail;
                for frame in frames {
                    if room.is_none() {
                        // First frame routes the connection: "/collab/{room}".
                        let path = String::from_utf8_lossy(&frame).to_string();
                        let name = path
                            .strip_prefix("/collab/")
                            .unwrap_or(&path)
                            .split('?')
                            .next()
                            .unwrap_or("")
                            .to_string();
                        let joined = shared.room(&name).await;
                        joined.clients.lock().await.insert(
                            client_id,
                            ClientHandle {
                                frames: frames_tx.clone(),
                                connection: connection.clone(),
                            },
                        );
                        spawn_datagram_fanout(joined.clone(), client_id, connection.clone());
                        room = Some(joined);
                        continue;
                    }
                    let joined = room.as_ref().unwrap().clone();
                    handle_frame(&joined, client_id, &frame).await;
                }
            }
            Ok(None) | Err(_) => break,
        }
    }

    if let Some(joined) = room {
        joined.clients.lock().await.remove(&client_id);
    }
}

async fn handle_frame(room: &Arc<Room>, sender: u64, frame: &[u8]) {
    let Some((&tag_byte, payload)) = frame.split_first() else {
        return;
    };
    match tag_byte {
        tag::SYNC_STEP1 => {
            let Ok(sv) = StateVector::decode_v1(payload) else {
                return;
            };
            let (diff, own_sv) = {
                let txn = room.doc.transact();
                (txn.encode_diff_v1(&sv), txn.state_vector().encode_v1())
            };
            let clients = room.clients.lock().await;
            if let Some(handle) = clients.get(&sender) {
                let mut reply = vec![tag::SYNC_STEP2];
                reply.extend(diff);
                let _ = handle.frames.send(reply).await;
                // Ask the client for whatever the room is missing.
                let mut step1 = vec![tag::SYNC_STEP1];
                step1.extend(own_sv);
                let _ = handle.frames.send(step1).await;
            }
        }
        tag::SYNC_STEP2 | tag::UPDATE => {
            if let Ok(update) = Update::decode_v1(payload) {
                let mut txn = room.doc.transact_mut();
                let _ = txn.apply_update(update);
            }
            broadcast(room, sender, frame).await;
        }
        tag::AWARENESS => broadcast(room, sender, frame).await,
        _ => {}
    }
}

async fn broadcast(room: &Arc<Room>, sender: u64, frame: &[u8]) {
    let clients = room.clients.lock().await;
    for (id, handle) in clients.iter() {
        if *id != sender {
            let _ = handle.frames.send(frame.to_vec()).await;
        }
    }
}

fn spawn_datagram_fanout(room: Arc<Room>, client_id: u64, connection: Connection) {
    tokio::spawn(async move {
        loop {
            match connection.read_datagram().await {
                Ok(datagram) => {
                    let clients = room.clients.lock().await;
                    for (id, handle) in clients.iter() {
                        if *id != client_id {
                            let _ = handle.connection.send_datagram(datagram.clone());
                        }
                    }
                }
                Err(_) => break,
            }
        }
    });
}
