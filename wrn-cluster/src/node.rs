use crate::transport::{
    encode_request, read_frame, Frame, RequestFrame, Status,
};
use crate::ROUTE_NODE_PING;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use wrn_core::{NodeId, NodeRole, Result, WrenError};

/// A peer declared at bootstrap.
#[derive(Debug, Clone)]
pub struct NodeDescriptor {
    pub id: NodeId,
    pub addr: String,
    pub role: NodeRole,
}

struct Outbound {
    route: String,
    body: Bytes,
    resp: oneshot::Sender<(Status, Bytes)>,
}

struct Peer {
    desc: NodeDescriptor,
    conn: tokio::sync::Mutex<Option<mpsc::Sender<Outbound>>>,
    /// Heartbeat rounds without a pong.
    missed_ticks: AtomicU64,
}

/// Peer connection bookkeeping and the request/response client side.
///
/// Connections are lazy and cached; a broken connection fails its in-flight
/// requests, and the next request reconnects. Liveness is tracked by
/// heartbeat tick accounting ([`NodeManager::ping_peers`]).
pub struct NodeManager {
    self_id: NodeId,
    req_timeout: Duration,
    peers: RwLock<HashMap<NodeId, Arc<Peer>>>,
}

impl NodeManager {
    #[must_use]
    pub fn new(self_id: NodeId, req_timeout: Duration) -> Self {
        Self {
            self_id,
            req_timeout,
            peers: RwLock::new(HashMap::new()),
        }
    }

    #[inline]
    #[must_use]
    pub fn self_id(&self) -> NodeId {
        self.self_id
    }

    pub fn add_node(&self, desc: NodeDescriptor) {
        if desc.id == self.self_id {
            return;
        }
        if let Ok(mut peers) = self.peers.write() {
            peers.entry(desc.id).or_insert_with(|| {
                Arc::new(Peer {
                    desc,
                    conn: tokio::sync::Mutex::new(None),
                    missed_ticks: AtomicU64::new(0),
                })
            });
        }
    }

    #[must_use]
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.peers
            .read()
            .map(|peers| peers.keys().copied().collect())
            .unwrap_or_default()
    }

    fn peer(&self, node: NodeId) -> Result<Arc<Peer>> {
        self.peers
            .read()
            .ok()
            .and_then(|peers| peers.get(&node).cloned())
            .ok_or(WrenError::NodeUnreachable(node))
    }

    /// Issue a request and await the typed response, reconnecting once on
    /// a broken cached connection.
    pub async fn request(
        &self,
        node: NodeId,
        route: &str,
        body: Bytes,
    ) -> Result<(Status, Bytes)> {
        let peer = self.peer(node)?;
        for _attempt in 0..2 {
            let tx = match self.ensure_conn(&peer).await {
                Ok(tx) => tx,
                Err(e) => {
                    tracing::debug!(
                        target: "wren::cluster",
                        node,
                        error = %e,
                        "peer connect failed"
                    );
                    continue;
                },
            };
            let (resp_tx, resp_rx) = oneshot::channel();
            let outbound = Outbound {
                route: route.to_string(),
                body: body.clone(),
                resp: resp_tx,
            };
            if tx.send(outbound).await.is_err() {
                self.clear_conn(&peer).await;
                continue;
            }
            match tokio::time::timeout(self.req_timeout, resp_rx).await {
                Ok(Ok(resp)) => return Ok(resp),
                Ok(Err(_)) => {
                    // Connection died under the request.
                    self.clear_conn(&peer).await;
                    continue;
                },
                Err(_) => return Err(WrenError::Timeout("cluster request")),
            }
        }
        Err(WrenError::NodeUnreachable(node))
    }

    async fn ensure_conn(&self, peer: &Arc<Peer>) -> Result<mpsc::Sender<Outbound>> {
        let mut guard = peer.conn.lock().await;
        if let Some(tx) = guard.as_ref() {
            if !tx.is_closed() {
                return Ok(tx.clone());
            }
        }
        let stream = TcpStream::connect(&peer.desc.addr).await?;
        stream.set_nodelay(true)?;
        let tx = spawn_conn(self.self_id, peer.desc.id, stream);
        *guard = Some(tx.clone());
        Ok(tx)
    }

    async fn clear_conn(&self, peer: &Arc<Peer>) {
        let mut guard = peer.conn.lock().await;
        *guard = None;
    }

    /// One heartbeat round: ping every peer, account misses.
    pub async fn ping_peers(&self) {
        let peers: Vec<Arc<Peer>> = self
            .peers
            .read()
            .map(|peers| peers.values().cloned().collect())
            .unwrap_or_default();
        for peer in peers {
            let node = peer.desc.id;
            match self.request(node, ROUTE_NODE_PING, Bytes::new()).await {
                Ok((Status::Ok, _)) => {
                    peer.missed_ticks.store(0, Ordering::Relaxed);
                },
                _ => {
                    let missed = peer.missed_ticks.fetch_add(1, Ordering::Relaxed) + 1;
                    tracing::debug!(
                        target: "wren::cluster",
                        node,
                        missed,
                        "peer heartbeat missed"
                    );
                },
            }
        }
    }

    /// Liveness by heartbeat accounting.
    #[must_use]
    pub fn alive(&self, node: NodeId, pong_max_tick: u64) -> bool {
        if node == self.self_id {
            return true;
        }
        self.peer(node)
            .map(|peer| peer.missed_ticks.load(Ordering::Relaxed) < pong_max_tick)
            .unwrap_or(false)
    }
}

/// Spawn reader+writer tasks for one peer connection. The returned sender
/// enqueues requests; dropped response channels signal a dead connection.
fn spawn_conn(self_id: NodeId, node: NodeId, stream: TcpStream) -> mpsc::Sender<Outbound> {
    let (tx, mut rx) = mpsc::channel::<Outbound>(1024);
    let (read_half, mut write_half) = stream.into_split();
    let pending: Arc<tokio::sync::Mutex<HashMap<u64, oneshot::Sender<(Status, Bytes)>>>> =
        Arc::new(tokio::sync::Mutex::new(HashMap::new()));

    let reader_pending = Arc::clone(&pending);
    tokio::spawn(async move {
        let mut read_half = read_half;
        loop {
            match read_frame(&mut read_half).await {
                Ok(Some(Frame::Response(resp))) => {
                    let waiter = reader_pending.lock().await.remove(&resp.id);
                    if let Some(waiter) = waiter {
                        let _ = waiter.send((resp.status, resp.body));
                    }
                },
                Ok(Some(Frame::Request(_))) => {
                    // Outbound connections are client-only.
                },
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(
                        target: "wren::cluster",
                        node,
                        error = %e,
                        "peer read failed"
                    );
                    break;
                },
            }
        }
        // Dropping the map fails all in-flight requests.
        reader_pending.lock().await.clear();
    });

    tokio::spawn(async move {
        let mut next_id: u64 = 1;
        while let Some(outbound) = rx.recv().await {
            let id = next_id;
            next_id += 1;
            pending.lock().await.insert(id, outbound.resp);
            let frame = encode_request(&RequestFrame {
                id,
                from: self_id,
                route: outbound.route,
                body: outbound.body,
            });
            if let Err(e) = write_half.write_all(&frame).await {
                tracing::debug!(
                    target: "wren::cluster",
                    node,
                    error = %e,
                    "peer write failed"
                );
                pending.lock().await.remove(&id);
                break;
            }
        }
    });

    tx
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::transport::{Router, RpcServer};

    #[tokio::test]
    async fn test_request_response_between_nodes() {
        let router = Arc::new(Router::new());
        router.route(
            "/wk/echo",
            Arc::new(|from, body| {
                assert_eq!(from, 1);
                (Status::Ok, body)
            }),
        );
        let addr = RpcServer::start("127.0.0.1:0".parse().unwrap(), router)
            .await
            .unwrap();

        let nodes = NodeManager::new(1, Duration::from_secs(2));
        nodes.add_node(NodeDescriptor {
            id: 2,
            addr: addr.to_string(),
            role: NodeRole::Replica,
        });

        let (status, body) = nodes
            .request(2, "/wk/echo", Bytes::from_static(b"hello"))
            .await
            .unwrap();
        assert_eq!(status, Status::Ok);
        assert_eq!(body, Bytes::from_static(b"hello"));

        // Second request reuses the cached connection.
        let (status, _) = nodes
            .request(2, "/wk/echo", Bytes::from_static(b"again"))
            .await
            .unwrap();
        assert_eq!(status, Status::Ok);
    }

    #[tokio::test]
    async fn test_unknown_node_is_unreachable() {
        let nodes = NodeManager::new(1, Duration::from_millis(100));
        assert!(matches!(
            nodes.request(9, "/wk/echo", Bytes::new()).await,
            Err(WrenError::NodeUnreachable(9))
        ));
    }

    #[tokio::test]
    async fn test_heartbeat_accounting() {
        let router = Arc::new(Router::new());
        router.route(ROUTE_NODE_PING, Arc::new(|_, _| (Status::Ok, Bytes::new())));
        let addr = RpcServer::start("127.0.0.1:0".parse().unwrap(), router)
            .await
            .unwrap();

        let nodes = NodeManager::new(1, Duration::from_secs(2));
        nodes.add_node(NodeDescriptor {
            id: 2,
            addr: addr.to_string(),
            role: NodeRole::Replica,
        });
        nodes.add_node(NodeDescriptor {
            id: 3,
            addr: "127.0.0.1:1".to_string(),
            role: NodeRole::Replica,
        });

        nodes.ping_peers().await;
        assert!(nodes.alive(2, 1));
        assert!(!nodes.alive(3, 1));
        assert!(nodes.alive(1, 1));
    }

    #[test]
    fn test_self_is_never_a_peer() {
        let nodes = NodeManager::new(2, Duration::from_secs(1));
        nodes.add_node(NodeDescriptor {
            id: 2,
            addr: "a".into(),
            role: NodeRole::Replica,
        });
        assert!(nodes.node_ids().is_empty());
    }
}
