//! Server assembly: shared context, bootstrap order, cluster routes and
//! shutdown.

pub mod auth;
pub mod connection;
pub mod routes;

use crate::channel::{ChannelEvent, ChannelHandler};
use crate::config::Config;
use crate::delivery::{DeliveryPool, DeliveryTask};
use crate::retry::RetryManager;
use crate::slot::{slot_key, SlotEvent, SlotHandler};
use crate::user::{UserEvent, UserHandler};
use auth::{AuthPool, AuthTask};
use bytes::Bytes;
use connection::ConnRegistry;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use wrn_cluster::{NodeDescriptor, NodeManager, Router, RpcServer, SlotManager, Status, UserMessage};
use wrn_core::{Decoder, Encoder, NodeId, NodeRole, Result, WrenError};
use wrn_reactor::Reactor;
use wrn_replica::Message as ReplicaMsg;

/// Seconds since the epoch.
#[must_use]
pub fn unix_ts() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Shared server context handed to every processor and pool.
///
/// Reactors and pools are created after the context (they need it), so
/// they live in `OnceLock`s set exactly once during bootstrap.
pub struct Ctx {
    pub opts: Arc<Config>,
    pub store: Arc<wrn_store::Store>,
    pub nodes: Arc<NodeManager>,
    pub slots: Arc<SlotManager>,
    pub conns: Arc<ConnRegistry>,
    pub retry: Arc<RetryManager>,
    pub runtime: tokio::runtime::Handle,
    pub user_reactor: OnceLock<Arc<Reactor<UserHandler>>>,
    pub channel_reactor: OnceLock<Arc<Reactor<ChannelHandler>>>,
    pub slot_reactor: OnceLock<Arc<Reactor<SlotHandler>>>,
    delivery: OnceLock<DeliveryPool>,
    auth: OnceLock<AuthPool>,
    message_counter: AtomicU64,
}

impl Ctx {
    #[inline]
    #[must_use]
    pub fn self_id(&self) -> NodeId {
        self.opts.node_id
    }

    /// Cluster-unique message id: node id in the top bits, a local
    /// counter below.
    #[must_use]
    pub fn next_message_id(&self) -> i64 {
        let count = self.message_counter.fetch_add(1, Ordering::Relaxed);
        ((self.opts.node_id << 48) | (count & 0xFFFF_FFFF_FFFF)) as i64
    }

    pub fn user_step(&self, uid: &str, event: UserEvent) {
        if let Some(reactor) = self.user_reactor.get() {
            reactor.step(uid, event);
        }
    }

    /// Blocking variant for the delivery path, which must not drop.
    pub fn user_step_wait(&self, uid: &str, event: UserEvent) {
        if let Some(reactor) = self.user_reactor.get() {
            reactor.step_wait(uid, event);
        }
    }

    pub fn channel_step(&self, key: &str, event: ChannelEvent) {
        if let Some(reactor) = self.channel_reactor.get() {
            reactor.step(key, event);
        }
    }

    pub fn slot_step(&self, key: &str, event: SlotEvent) {
        if let Some(reactor) = self.slot_reactor.get() {
            reactor.step(key, event);
        }
    }

    pub fn deliver(&self, task: DeliveryTask) {
        if let Some(pool) = self.delivery.get() {
            pool.submit(task);
        }
    }

    pub fn auth_submit(&self, uid: &str, messages: Vec<UserMessage>, index: u64) {
        if let Some(pool) = self.auth.get() {
            pool.submit(AuthTask {
                uid: uid.to_string(),
                messages,
                index,
            });
        }
    }

    /// Fire an RPC and hand the typed result to `done` on completion.
    pub fn rpc<F>(&self, node: NodeId, route: &'static str, body: Bytes, done: F)
    where
        F: FnOnce(Result<(Status, Bytes)>) + Send + 'static,
    {
        let nodes = Arc::clone(&self.nodes);
        self.runtime.spawn(async move {
            let result = nodes.request(node, route, body).await;
            done(result);
        });
    }

    /// Fire-and-forget RPC; failures are logged only.
    pub fn rpc_ff(&self, node: NodeId, route: &'static str, body: Bytes) {
        self.rpc(node, route, body, move |result| {
            if let Err(e) = result {
                tracing::debug!(
                    target: "wren::server",
                    node,
                    route,
                    error = %e,
                    "rpc failed"
                );
            }
        });
    }
}

/// Replication envelope on `/wk/replica`: group kind (1 = slot,
/// 2 = channel), group key, message.
#[must_use]
pub fn encode_replica_envelope(group_kind: u8, key: &str, msg: &ReplicaMsg) -> Bytes {
    let mut enc = Encoder::with_capacity(32);
    enc.put_u8(group_kind);
    enc.put_str(key);
    enc.put_bytes(&msg.encode());
    enc.freeze()
}

pub fn decode_replica_envelope(body: &[u8]) -> Result<(u8, String, ReplicaMsg)> {
    let mut dec = Decoder::new(body);
    let group_kind = dec.u8()?;
    let key = dec.str()?;
    let raw = dec.bytes()?;
    Ok((group_kind, key, ReplicaMsg::decode(&raw)?))
}

pub struct Server {
    pub ctx: Arc<Ctx>,
    pub client_addr: std::net::SocketAddr,
    pub cluster_addr: std::net::SocketAddr,
}

impl Server {
    pub async fn start(config: Config) -> Result<Self> {
        config.validate()?;
        let opts = Arc::new(config);

        let store = Arc::new(wrn_store::Store::open(
            &opts.data_dir,
            opts.shard_num,
            opts.slot_shard_num,
        )?);
        if !store.is_migrated() {
            // Fresh data dir: there is no legacy data to import.
            store.mark_migrated()?;
        }

        let nodes = Arc::new(NodeManager::new(opts.node_id, opts.req_timeout()));
        let mut replica_nodes: Vec<NodeId> = Vec::new();
        if opts.node_role() == NodeRole::Replica {
            replica_nodes.push(opts.node_id);
        }
        for decl in &opts.peers {
            let (id, addr, role) = Config::parse_peer(decl)?;
            if id == opts.node_id {
                return Err(WrenError::Config(format!(
                    "peer declaration {decl} clashes with own node id"
                )));
            }
            if role == NodeRole::Replica {
                replica_nodes.push(id);
            }
            nodes.add_node(NodeDescriptor { id, addr, role });
        }
        if replica_nodes.is_empty() {
            return Err(WrenError::Config(
                "cluster has no replica-role nodes".into(),
            ));
        }
        replica_nodes.sort_unstable();

        let slots = Arc::new(SlotManager::new(
            opts.slot_count,
            &replica_nodes,
            opts.slot_replica_count,
        ));
        let conns = Arc::new(ConnRegistry::new());
        let retry = Arc::new(RetryManager::new(opts.message_retry_max_count));

        let ctx = Arc::new(Ctx {
            opts: Arc::clone(&opts),
            store,
            nodes,
            slots,
            conns,
            retry: Arc::clone(&retry),
            runtime: tokio::runtime::Handle::current(),
            user_reactor: OnceLock::new(),
            channel_reactor: OnceLock::new(),
            slot_reactor: OnceLock::new(),
            delivery: OnceLock::new(),
            auth: OnceLock::new(),
            message_counter: AtomicU64::new(1),
        });

        let _ = ctx.user_reactor.set(crate::user::start_reactor(Arc::clone(&ctx)));
        let _ = ctx
            .channel_reactor
            .set(crate::channel::start_reactor(Arc::clone(&ctx)));
        let _ = ctx.slot_reactor.set(crate::slot::start_reactor(Arc::clone(&ctx)));
        let _ = ctx
            .delivery
            .set(DeliveryPool::start(Arc::clone(&ctx), opts.deliver_count));
        let _ = ctx
            .auth
            .set(AuthPool::start(Arc::clone(&ctx), opts.auth_pool_size));
        retry.start_scanner(Arc::clone(&ctx));

        let router = Arc::new(Router::new());
        routes::register(&router, Arc::clone(&ctx));
        let cluster_addr = RpcServer::start(opts.cluster_addr, router).await?;
        let client_addr = connection::start_listener(Arc::clone(&ctx)).await?;

        // Node heartbeats: liveness by tick accounting.
        let hb_ctx = Arc::clone(&ctx);
        let hb_interval = opts
            .tick_interval()
            .saturating_mul(opts.heartbeat_interval_tick.max(1) as u32)
            .max(std::time::Duration::from_millis(500));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(hb_interval);
            loop {
                ticker.tick().await;
                hb_ctx.nodes.ping_peers().await;
            }
        });

        // Bring up the slot groups this node replicates.
        for slot in 0..opts.slot_count {
            if ctx.slots.replicas_of(slot).contains(&opts.node_id) {
                ctx.slot_step(&slot_key(slot), SlotEvent::Start);
            }
        }

        tracing::info!(
            target: "wren::server",
            node_id = opts.node_id,
            client = %client_addr,
            cluster = %cluster_addr,
            slots = opts.slot_count,
            "wren node started"
        );

        Ok(Self {
            ctx,
            client_addr,
            cluster_addr,
        })
    }

    /// Stop the sub-reactor threads. Socket tasks die with the runtime.
    pub fn shutdown(&self) {
        if let Some(reactor) = self.ctx.user_reactor.get() {
            reactor.stop();
        }
        if let Some(reactor) = self.ctx.channel_reactor.get() {
            reactor.stop();
        }
        if let Some(reactor) = self.ctx.slot_reactor.get() {
            reactor.stop();
        }
        tracing::info!(target: "wren::server", node_id = self.ctx.self_id(), "wren node stopped");
    }
}
