//! CaptureGateway - inbound capture-side TCP endpoint
//!
//! Camera-side capture software connects here and streams protocol frames.
//! The first Control frame on a connection carries the camera id as a UTF-8
//! payload; until it arrives, media frames are dropped. After identification,
//! Video and Audio payloads fan out to every subscriber registered for that
//! camera. Fan-out is fire-and-forget over unbounded channels; there is no
//! slow-subscriber policy beyond OS socket buffering.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};

use crate::packet_codec::{self, PacketType, ProtocolPacket, PACKET_MAGIC};

/// Read chunk size for the connection reassembly buffer
const READ_CHUNK: usize = 16 * 1024;

#[derive(Default)]
pub struct CaptureGateway {
    subscribers: RwLock<HashMap<String, Vec<mpsc::UnboundedSender<ProtocolPacket>>>>,
    /// Last heartbeat per identified connection
    heartbeats: RwLock<HashMap<String, DateTime<Utc>>>,
}

impl CaptureGateway {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a relay-side subscriber for a camera's media frames.
    /// Dropping the receiver unsubscribes on the next dispatch.
    pub async fn subscribe(&self, camera_id: &str) -> mpsc::UnboundedReceiver<ProtocolPacket> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .write()
            .await
            .entry(camera_id.to_string())
            .or_default()
            .push(tx);
        rx
    }

    pub async fn subscriber_count(&self, camera_id: &str) -> usize {
        self.subscribers
            .read()
            .await
            .get(camera_id)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Last heartbeat seen from an identified capture connection
    pub async fn last_heartbeat(&self, camera_id: &str) -> Option<DateTime<Utc>> {
        self.heartbeats.read().await.get(camera_id).copied()
    }

    /// Accept loop. Runs until the listener errors.
    pub async fn run(self: Arc<Self>, listener: TcpListener) {
        if let Ok(addr) = listener.local_addr() {
            tracing::info!(addr = %addr, "Capture gateway listening");
        }
        loop {
            match listener.accept().await {
                Ok((socket, peer)) => {
                    tracing::debug!(peer = %peer, "Capture connection accepted");
                    let gateway = self.clone();
                    tokio::spawn(async move {
                        gateway.handle_connection(socket).await;
                    });
                }
                Err(e) => {
                    tracing::error!(error = %e, "Capture accept failed");
                    break;
                }
            }
        }
    }

    async fn handle_connection(&self, mut socket: TcpStream) {
        let mut buf: Vec<u8> = Vec::with_capacity(READ_CHUNK);
        let mut chunk = [0u8; READ_CHUNK];
        let mut camera_id: Option<String> = None;

        loop {
            let n = match socket.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    tracing::debug!(error = %e, "Capture connection read error");
                    break;
                }
            };
            buf.extend_from_slice(&chunk[..n]);

            loop {
                match packet_codec::frame_len(&buf) {
                    Ok(None) => break,
                    Ok(Some(total)) => {
                        if buf.len() < total {
                            break;
                        }
                        match packet_codec::decode(&buf[..total]) {
                            Ok(packet) => self.dispatch(&mut camera_id, packet).await,
                            Err(e) => {
                                // bad frame body; the framing itself was
                                // sound, so skip it and keep the connection
                                tracing::warn!(error = %e, "Dropping malformed capture frame");
                            }
                        }
                        buf.drain(..total);
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Capture stream desynchronized, resyncing");
                        resync(&mut buf);
                    }
                }
            }
        }

        if let Some(id) = &camera_id {
            tracing::info!(camera_id = %id, "Capture connection closed");
        }
    }

    async fn dispatch(&self, camera_id: &mut Option<String>, packet: ProtocolPacket) {
        let Some(id) = camera_id.clone() else {
            // hello handshake: first Control payload names the camera
            if packet.packet_type == PacketType::Control {
                match String::from_utf8(packet.payload) {
                    Ok(id) if !id.trim().is_empty() => {
                        let id = id.trim().to_string();
                        tracing::info!(camera_id = %id, "Capture connection identified");
                        self.heartbeats.write().await.insert(id.clone(), Utc::now());
                        *camera_id = Some(id);
                    }
                    _ => {
                        tracing::warn!("Capture hello with invalid camera id, ignoring");
                    }
                }
            } else {
                tracing::warn!(
                    packet_type = ?packet.packet_type,
                    "Frame before identification, dropping"
                );
            }
            return;
        };

        match packet.packet_type {
            PacketType::Video | PacketType::Audio => {
                self.fan_out(&id, packet).await;
            }
            PacketType::Heartbeat => {
                self.heartbeats.write().await.insert(id, Utc::now());
            }
            PacketType::Control => {
                tracing::debug!(camera_id = %id, len = packet.payload.len(), "Control frame");
            }
            PacketType::Unknown(b) => {
                tracing::debug!(camera_id = %id, type_byte = b, "Unknown frame type, dropping");
            }
        }
    }

    async fn fan_out(&self, camera_id: &str, packet: ProtocolPacket) {
        let mut subscribers = self.subscribers.write().await;
        let Some(list) = subscribers.get_mut(camera_id) else {
            return;
        };
        // prune subscribers whose receiver is gone
        list.retain(|tx| tx.send(packet.clone()).is_ok());
        if list.is_empty() {
            subscribers.remove(camera_id);
        }
    }
}

/// Discard bytes up to the next magic candidate so framing can recover
/// after garbage on the wire
fn resync(buf: &mut Vec<u8>) {
    let next = buf[1..].iter().position(|&b| b == PACKET_MAGIC[0]);
    match next {
        Some(pos) => {
            buf.drain(..pos + 1);
        }
        None => buf.clear(),
    }
}
