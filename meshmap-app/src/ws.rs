//! WebSocket broadcaster.
//!
//! A background accept loop independent of the HTTP handler. Every frame is
//! a single JSON object; new clients are first replayed the bounded history
//! buffer, then receive live traffic. The history append and the live
//! fan-out happen under one mutex, and client subscription snapshots the
//! history under that same mutex, so a connecting client can neither miss
//! nor double-receive a frame.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, watch};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

/// Frames replayed to newly-connected clients.
pub const DEFAULT_HISTORY_SIZE: usize = 50;

/// Adjacent ports tried when the preferred port is taken.
const PORT_FALLBACK_RANGE: u16 = 5;

pub struct WsBroadcaster {
    history: Mutex<VecDeque<String>>,
    history_size: usize,
    live: broadcast::Sender<String>,
    clients: AtomicUsize,
    total_connections: AtomicU64,
    total_messages_sent: AtomicU64,
    bound_port: AtomicUsize,
}

impl WsBroadcaster {
    pub fn new(history_size: usize) -> Arc<Self> {
        let (live, _) = broadcast::channel(1024);
        Arc::new(Self {
            history: Mutex::new(VecDeque::with_capacity(history_size)),
            history_size,
            live,
            clients: AtomicUsize::new(0),
            total_connections: AtomicU64::new(0),
            total_messages_sent: AtomicU64::new(0),
            bound_port: AtomicUsize::new(0),
        })
    }

    /// Bind and serve, trying up to five adjacent ports. Returns the bound
    /// port, or `None` when every candidate failed.
    pub async fn start(
        self: &Arc<Self>,
        host: &str,
        base_port: u16,
        shutdown: watch::Receiver<bool>,
    ) -> Option<u16> {
        let mut listener = None;
        for offset in 0..PORT_FALLBACK_RANGE {
            let Some(port) = base_port.checked_add(offset) else {
                break;
            };
            match TcpListener::bind((host, port)).await {
                Ok(bound) => {
                    if offset > 0 {
                        warn!(wanted = base_port, bound = port, "WebSocket port busy, using fallback");
                    }
                    listener = Some((bound, port));
                    break;
                }
                Err(e) => debug!(port, error = %e, "WebSocket port unavailable"),
            }
        }
        let (listener, port) = listener?;
        self.bound_port.store(port as usize, Ordering::Relaxed);
        info!(host, port, "WebSocket broadcaster listening");

        let broadcaster = self.clone();
        tokio::spawn(async move {
            broadcaster.accept_loop(listener, shutdown).await;
        });
        Some(port)
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
        loop {
            let stream = tokio::select! {
                // Dropping the listener when shutdown fires closes the socket
                // before the task loop unwinds.
                _ = shutdown.changed() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => stream,
                    Err(e) => {
                        warn!(error = %e, "WebSocket accept failed");
                        continue;
                    }
                },
            };

            let broadcaster = self.clone();
            let client_shutdown = shutdown.clone();
            tokio::spawn(async move {
                broadcaster.serve_client(stream, client_shutdown).await;
            });
        }
        drop(listener);
        info!("WebSocket broadcaster stopped");
    }

    async fn serve_client(
        self: Arc<Self>,
        stream: tokio::net::TcpStream,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let peer = stream.peer_addr().ok();
        let ws = match tokio_tungstenite::accept_async(stream).await {
            Ok(ws) => ws,
            Err(e) => {
                debug!(error = %e, "WebSocket handshake failed");
                return;
            }
        };
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        let count = self.clients.fetch_add(1, Ordering::Relaxed) + 1;
        info!(peer = ?peer, clients = count, "WebSocket client connected");

        let (mut sink, mut source) = ws.split();

        // Subscribe and snapshot the history under the broadcast mutex so
        // the replay set and the live stream join without a gap.
        let (replay, mut live) = {
            let history = self.history.lock();
            let live = self.live.subscribe();
            (history.iter().cloned().collect::<Vec<_>>(), live)
        };

        for frame in replay {
            if sink.send(Message::Text(frame)).await.is_err() {
                self.drop_client(peer);
                return;
            }
            self.total_messages_sent.fetch_add(1, Ordering::Relaxed);
        }

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                frame = live.recv() => match frame {
                    Ok(text) => {
                        if sink.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                        self.total_messages_sent.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "slow WebSocket client lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                // Clients do not need to send anything; the read half only
                // detects disconnection.
                inbound = source.next() => match inbound {
                    Some(Ok(_)) => {}
                    _ => break,
                },
            }
        }
        let _ = sink.send(Message::Close(None)).await;
        self.drop_client(peer);
    }

    fn drop_client(&self, peer: Option<std::net::SocketAddr>) {
        let count = self.clients.fetch_sub(1, Ordering::Relaxed) - 1;
        info!(peer = ?peer, clients = count, "WebSocket client disconnected");
    }

    /// Send a JSON frame to every connected client. Thread-safe; the history
    /// append and live send share the mutex.
    pub fn broadcast(&self, message: &Value) {
        let text = message.to_string();
        let mut history = self.history.lock();
        history.push_back(text.clone());
        while history.len() > self.history_size {
            history.pop_front();
        }
        let _ = self.live.send(text);
    }

    pub fn client_count(&self) -> usize {
        self.clients.load(Ordering::Relaxed)
    }

    pub fn port(&self) -> u16 {
        self.bound_port.load(Ordering::Relaxed) as u16
    }

    pub fn stats(&self) -> Value {
        json!({
            "port": self.port(),
            "clients_connected": self.client_count(),
            "total_connections": self.total_connections.load(Ordering::Relaxed),
            "total_messages_sent": self.total_messages_sent.load(Ordering::Relaxed),
            "history_size": self.history.lock().len(),
        })
    }
}

/// Shape an event-bus event into the documented WebSocket frame.
pub fn event_frame(event: &meshmap_core::event_bus::Event) -> Value {
    use meshmap_core::event_bus::EventType;
    match event.event_type {
        EventType::NodePosition => json!({
            "type": "node.position",
            "node_id": event.node_id,
            "lat": event.lat,
            "lon": event.lon,
            "ts": event.timestamp,
        }),
        EventType::NodeInfo => json!({
            "type": "node.info",
            "node_id": event.node_id,
            "name": event.data.get("name"),
            "short_name": event.data.get("short_name"),
        }),
        EventType::NodeTelemetry => json!({
            "type": "node.telemetry",
            "node_id": event.node_id,
            "metrics": event.data,
        }),
        EventType::NodeTopology => json!({
            "type": "node.topology",
            "node_id": event.node_id,
            "neighbors": event.data.get("neighbors").cloned()
                .unwrap_or_else(|| json!(event.data.get("neighbor_count"))),
        }),
        EventType::AlertFired => json!({
            "type": "alert.fired",
            "data": event.data,
        }),
        EventType::ServiceUp => json!({
            "type": "service",
            "source": event.source,
            "state": "up",
        }),
        EventType::ServiceDown => json!({
            "type": "service",
            "source": event.source,
            "state": "down",
        }),
        EventType::ServiceDegraded => json!({
            "type": "service",
            "source": event.source,
            "state": "degraded",
        }),
        EventType::DataRefreshed => json!({
            "type": "data.refreshed",
            "ts": event.timestamp,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshmap_core::event_bus::Event;

    #[test]
    fn test_history_bounded_in_order() {
        let broadcaster = WsBroadcaster::new(3);
        for i in 0..5 {
            broadcaster.broadcast(&json!({"seq": i}));
        }
        let history: Vec<String> = broadcaster.history.lock().iter().cloned().collect();
        assert_eq!(history.len(), 3);
        assert!(history[0].contains("\"seq\":2"));
        assert!(history[2].contains("\"seq\":4"));
    }

    #[test]
    fn test_event_frames_match_documented_shapes() {
        let frame = event_frame(&Event::position("!aa", 40.0, -105.0, "mqtt"));
        assert_eq!(frame["type"], "node.position");
        assert_eq!(frame["lat"], 40.0);

        let mut data = serde_json::Map::new();
        data.insert("battery".into(), json!(80));
        let frame = event_frame(&Event::telemetry("!aa", "mqtt", data));
        assert_eq!(frame["type"], "node.telemetry");
        assert_eq!(frame["metrics"]["battery"], 80);

        let frame = event_frame(&Event::service_down("aredn", "collection failed"));
        assert_eq!(frame["type"], "service");
        assert_eq!(frame["state"], "down");
    }

    #[tokio::test]
    async fn test_port_fallback() {
        let (tx, rx) = watch::channel(false);
        // Occupy a port, then ask the broadcaster to start on it.
        let blocker = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let taken = blocker.local_addr().unwrap().port();

        let broadcaster = WsBroadcaster::new(10);
        let bound = broadcaster.start("127.0.0.1", taken, rx).await;
        // Either a fallback port bound, or (if the whole range is busy) none.
        if let Some(port) = bound {
            assert_ne!(port, taken);
            assert_eq!(broadcaster.port(), port);
        }
        drop(tx);
    }
}
