// Copyright 2023 The Metronome Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The TSO proxy: multiplexes client streams onto one upstream stream per
//! (keyspace group, DC), toward the group's current primary.
//!
//! Each dispatcher keeps a FIFO of in-flight forwards; because the upstream
//! preserves ordering, every upstream response belongs to the FIFO head. A
//! canceled client simply drops its reply slot, so its response is discarded
//! without disturbing anyone else. On upstream failure or primary change,
//! every in-flight forward fails retriable and the dispatcher reconnects.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, RwLock};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use hashbrown::HashMap;
use thiserror::Error;
use tokio::select;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_stream::wrappers::{ReceiverStream, UnboundedReceiverStream};
use tonic::{Request, Response, Status, Streaming};

use crate::keyspace::KeyspaceGroupManager;
use crate::mds::{LoopWatcher, MetaStore, WatcherHandle};
use crate::protos::{
    Error as PbError,
    GetMembersRequest,
    GetMembersResponse,
    Member,
    ResponseHeader,
    Tso,
    TsoClient,
    TsoRequest,
    TsoResponse,
    GLOBAL_DC_LOCATION,
};
use crate::utils::{self, Retirement};

/// Forwards queued per dispatcher before client sends block.
pub const DEFAULT_DISPATCH_QUEUE_SIZE: usize = 10_000;

const TSO_ELECTION_PREFIX: &str = "/tso/";

#[derive(Clone, Debug, Error)]
enum ForwardError {
    #[error("no primary known for keyspace group {0}")]
    NoPrimary(u32),
    #[error("forward to keyspace group {0} failed, retry: {1}")]
    Retriable(u32, String),
}

/// Primary addresses of every (group, DC) allocator, observed from the
/// election records.
pub struct PrimaryRoster {
    shared: Arc<RosterShared>,
    watcher: WatcherHandle,
}

struct RosterShared {
    primaries: RwLock<HashMap<(u32, String), Member>>,
    updates: watch::Sender<u64>,
}

fn parse_primary_key(key: &str) -> Option<(u32, String)> {
    let mut parts = key.strip_prefix(TSO_ELECTION_PREFIX)?.split('/');
    let group = parts.next()?.parse().ok()?;
    let dc = parts.next()?.to_string();
    match (parts.next()?, parts.next()) {
        ("primary", None) => Some((group, dc)),
        _ => None,
    }
}

impl PrimaryRoster {
    pub async fn start(store: Arc<dyn MetaStore>) -> Result<Self> {
        let (updates, _) = watch::channel(0);
        let shared = Arc::new(RosterShared { primaries: RwLock::new(HashMap::new()), updates });
        let puts = shared.clone();
        let deletes = shared.clone();
        let posts = shared.clone();
        let mut watcher = LoopWatcher::new(
            "tso-primaries",
            store,
            TSO_ELECTION_PREFIX.as_bytes().to_vec(),
            Box::new(move |kv| {
                if let Some(at) = parse_primary_key(kv.key_str()?) {
                    let member: Member = serde_json::from_slice(&kv.value)?;
                    puts.primaries.write().unwrap().insert(at, member);
                }
                Ok(())
            }),
            Box::new(move |kv| {
                if let Some(at) = parse_primary_key(kv.key_str()?) {
                    deletes.primaries.write().unwrap().remove(&at);
                }
                Ok(())
            }),
            Box::new(move || {
                posts.updates.send_modify(|version| *version += 1);
                Ok(())
            }),
        )
        .start();
        watcher.wait_load().await?;
        Ok(Self { shared, watcher })
    }

    pub fn primary(&self, group: u32, dc: &str) -> Option<Member> {
        self.shared.primaries.read().unwrap().get(&(group, dc.to_string())).cloned()
    }

    pub fn primaries(&self) -> HashMap<(u32, String), Member> {
        self.shared.primaries.read().unwrap().clone()
    }

    pub fn updates(&self) -> watch::Receiver<u64> {
        self.shared.updates.subscribe()
    }

    pub fn force_load(&self) {
        self.watcher.force_load();
    }
}

struct PendingForward {
    request: TsoRequest,
    reply: oneshot::Sender<Result<TsoResponse, ForwardError>>,
}

#[derive(Clone)]
struct Dispatcher {
    queue: mpsc::Sender<PendingForward>,
}

/// Serves the Tso RPC on an API node, fanning client streams into the
/// per-group dispatchers.
pub struct TsoProxy {
    state: Arc<ProxyState>,
    _retirer: utils::Retirer,
}

struct ProxyState {
    cluster_id: u64,
    member: Member,
    keyspace: Arc<KeyspaceGroupManager>,
    roster: Arc<PrimaryRoster>,
    dispatchers: Mutex<HashMap<(u32, String), Dispatcher>>,
    retirement: Retirement,
}

impl TsoProxy {
    pub fn new(
        cluster_id: u64,
        member: Member,
        keyspace: Arc<KeyspaceGroupManager>,
        roster: Arc<PrimaryRoster>,
    ) -> Self {
        let (retirer, retirement) = utils::retirement("tso-proxy");
        let state = Arc::new(ProxyState {
            cluster_id,
            member,
            keyspace,
            roster,
            dispatchers: Mutex::new(HashMap::new()),
            retirement,
        });
        Self { state, _retirer: retirer }
    }
}

impl ProxyState {
    fn dispatcher(&self, group: u32, dc: &str) -> Dispatcher {
        let mut dispatchers = self.dispatchers.lock().unwrap();
        if let Some(dispatcher) = dispatchers.get(&(group, dc.to_string())) {
            return dispatcher.clone();
        }
        let (queue, backlog) = mpsc::channel(DEFAULT_DISPATCH_QUEUE_SIZE);
        let dispatcher = Dispatcher { queue };
        dispatchers.insert((group, dc.to_string()), dispatcher.clone());
        tokio::spawn(dispatch(group, dc.to_string(), self.roster.clone(), backlog, self.retirement.clone()));
        dispatcher
    }

    async fn forward(&self, group: u32, dc: &str, request: TsoRequest) -> Result<TsoResponse, ForwardError> {
        let dispatcher = self.dispatcher(group, dc);
        let (reply, response) = oneshot::channel();
        dispatcher
            .queue
            .send(PendingForward { request, reply })
            .await
            .map_err(|_| ForwardError::Retriable(group, "dispatcher gone".to_string()))?;
        response.await.map_err(|_| ForwardError::Retriable(group, "dispatcher reset".to_string()))?
    }

    async fn handle(&self, request: TsoRequest) -> Result<TsoResponse, ForwardError> {
        let header = request.header.clone().unwrap_or_default();
        if header.cluster_id != self.cluster_id {
            let error = PbError::cluster_id_mismatch(self.cluster_id, header.cluster_id);
            return Ok(TsoResponse {
                header: Some(ResponseHeader::failed(self.cluster_id, error)),
                count: 0,
                timestamp: None,
            });
        }
        let group = match header.keyspace_group_id {
            0 => self.keyspace.group_for_keyspace(header.keyspace_id),
            id => id,
        };
        let dc =
            if request.dc_location.is_empty() { GLOBAL_DC_LOCATION.to_string() } else { request.dc_location.clone() };
        self.forward(group, &dc, request).await
    }
}

/// One dispatcher per (group, DC): owns the upstream stream and the
/// in-flight FIFO, lazily (re)connecting to the observed primary.
async fn dispatch(
    group: u32,
    dc: String,
    roster: Arc<PrimaryRoster>,
    mut backlog: mpsc::Receiver<PendingForward>,
    mut retirement: Retirement,
) {
    let mut primaries = roster.updates();
    'reconnect: loop {
        let first = select! {
            _ = retirement.retired() => return,
            pending = backlog.recv() => match pending {
                None => return,
                Some(pending) => pending,
            },
        };
        let Some(primary) = roster.primary(group, &dc) else {
            roster.force_load();
            first.reply.send(Err(ForwardError::NoPrimary(group))).ok();
            continue;
        };
        let address = primary.address().to_string();
        let mut upstream = match open_upstream(&address).await {
            Ok(upstream) => upstream,
            Err(err) => {
                tracing::warn!("proxy of group {group} dc {dc} cannot reach {address}: {err:?}");
                roster.force_load();
                first.reply.send(Err(ForwardError::Retriable(group, err.to_string()))).ok();
                continue;
            },
        };
        tracing::info!("proxy of group {group} dc {dc} connected to {address}");

        let mut inflight: VecDeque<oneshot::Sender<Result<TsoResponse, ForwardError>>> = VecDeque::new();
        if upstream.requests.send(first.request).await.is_err() {
            first.reply.send(Err(ForwardError::Retriable(group, "upstream reset".to_string()))).ok();
            continue;
        }
        inflight.push_back(first.reply);

        loop {
            select! {
                _ = retirement.retired() => {
                    fail_inflight(&mut inflight, group, "proxy shutting down");
                    return;
                },
                _ = primaries.changed() => {
                    let current = roster.primary(group, &dc).map(|member| member.address().to_string());
                    if current.as_deref() != Some(address.as_str()) {
                        tracing::info!("primary of group {group} dc {dc} moved away from {address}");
                        fail_inflight(&mut inflight, group, "primary changed");
                        continue 'reconnect;
                    }
                },
                pending = backlog.recv() => {
                    let Some(pending) = pending else {
                        fail_inflight(&mut inflight, group, "proxy shutting down");
                        return;
                    };
                    if upstream.requests.send(pending.request).await.is_err() {
                        pending.reply.send(Err(ForwardError::Retriable(group, "upstream reset".to_string()))).ok();
                        fail_inflight(&mut inflight, group, "upstream reset");
                        continue 'reconnect;
                    }
                    inflight.push_back(pending.reply);
                },
                message = upstream.responses.message() => {
                    match message {
                        Ok(Some(response)) => {
                            let failed = response.header.as_ref().map(|h| h.error.is_some()).unwrap_or(false);
                            match inflight.pop_front() {
                                // A closed reply slot is a canceled client;
                                // its response is dropped on the floor.
                                Some(reply) => {
                                    reply.send(Ok(response)).ok();
                                },
                                None => tracing::warn!("group {group} dc {dc} response without pending forward"),
                            }
                            if failed {
                                roster.force_load();
                            }
                        },
                        Ok(None) | Err(_) => {
                            fail_inflight(&mut inflight, group, "upstream closed");
                            roster.force_load();
                            continue 'reconnect;
                        },
                    }
                },
            }
        }
    }
}

fn fail_inflight(
    inflight: &mut VecDeque<oneshot::Sender<Result<TsoResponse, ForwardError>>>,
    group: u32,
    reason: &str,
) {
    for reply in inflight.drain(..) {
        reply.send(Err(ForwardError::Retriable(group, reason.to_string()))).ok();
    }
}

struct Upstream {
    requests: mpsc::Sender<TsoRequest>,
    responses: Streaming<TsoResponse>,
}

async fn open_upstream(address: &str) -> Result<Upstream> {
    let mut client = TsoClient::connect(address.to_string()).await?;
    let (requests, outbound) = mpsc::channel(DEFAULT_DISPATCH_QUEUE_SIZE);
    let responses = client
        .tso(ReceiverStream::new(outbound))
        .await
        .map_err(|status| anyhow!("open tso stream to {address}: {status}"))?
        .into_inner();
    Ok(Upstream { requests, responses })
}

#[async_trait]
impl Tso for TsoProxy {
    type TsoStream = UnboundedReceiverStream<Result<TsoResponse, Status>>;

    async fn tso(&self, request: Request<Streaming<TsoRequest>>) -> Result<Response<Self::TsoStream>, Status> {
        let mut requests = request.into_inner();
        let (sender, responses) = mpsc::unbounded_channel();
        let state = self.state.clone();
        tokio::spawn(async move {
            loop {
                let request = match requests.message().await {
                    Ok(Some(request)) => request,
                    Ok(None) | Err(_) => break,
                };
                match state.handle(request).await {
                    Ok(response) => {
                        let failed = response.header.as_ref().map(|h| h.error.is_some()).unwrap_or(false);
                        if sender.send(Ok(response)).is_err() || failed {
                            break;
                        }
                    },
                    Err(err) => {
                        sender.send(Err(Status::unavailable(err.to_string()))).ok();
                        break;
                    },
                }
            }
        });
        Ok(Response::new(UnboundedReceiverStream::new(responses)))
    }

    async fn get_members(
        &self,
        request: Request<GetMembersRequest>,
    ) -> Result<Response<GetMembersResponse>, Status> {
        let request = request.into_inner();
        let cluster_id = self.state.cluster_id;
        if let Some(header) = &request.header {
            if header.cluster_id != 0 && header.cluster_id != cluster_id {
                let error = PbError::cluster_id_mismatch(cluster_id, header.cluster_id);
                let header = ResponseHeader::failed(cluster_id, error);
                return Ok(Response::new(GetMembersResponse { header: Some(header), ..Default::default() }));
            }
        }
        let mut tso_allocator_primaries = std::collections::HashMap::new();
        for ((group, dc), member) in self.state.roster.primaries() {
            if group == crate::protos::DEFAULT_KEYSPACE_GROUP_ID {
                tso_allocator_primaries.insert(dc, member);
            }
        }
        let response = GetMembersResponse {
            header: Some(ResponseHeader::ok(cluster_id)),
            members: vec![self.state.member.clone()],
            leader: Some(self.state.member.clone()),
            tso_allocator_primaries,
        };
        Ok(Response::new(response))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use assertor::*;
    use tokio::net::TcpListener;
    use tokio::time::timeout;
    use tokio_stream::wrappers::TcpListenerStream;

    use super::*;
    use crate::cluster;
    use crate::mds::{MemStore, MetaStore};
    use crate::protos::TsoServer;
    use crate::timestamp::{self, first_in_batch};
    use crate::tso::service::tests::{start_tso_node, tso_request, wait_default_primary};

    struct TestProxy {
        address: String,
        _retirer: utils::Retirer,
    }

    async fn start_proxy(store: Arc<dyn MetaStore>, cluster_id: u64) -> TestProxy {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let address = format!("http://{}", listener.local_addr().unwrap());
        let keyspace = Arc::new(KeyspaceGroupManager::start(store.clone(), 2).await.unwrap());
        let roster = Arc::new(PrimaryRoster::start(store.clone()).await.unwrap());
        let member = cluster::new_member(address.clone(), address.clone(), GLOBAL_DC_LOCATION);
        let proxy = TsoProxy::new(cluster_id, member, keyspace, roster);
        let (retirer, mut retirement) = utils::retirement("test-server");
        tokio::spawn(async move {
            tonic::transport::Server::builder()
                .add_service(TsoServer::new(proxy))
                .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async move {
                    retirement.retired().await
                })
                .await
                .unwrap();
        });
        TestProxy { address, _retirer: retirer }
    }

    async fn open_stream(
        address: &str,
    ) -> (mpsc::UnboundedSender<TsoRequest>, Streaming<TsoResponse>) {
        let mut client = TsoClient::connect(address.to_string()).await.unwrap();
        let (sender, requests) = mpsc::unbounded_channel();
        let responses = client.tso(UnboundedReceiverStream::new(requests)).await.unwrap().into_inner();
        (sender, responses)
    }

    #[tokio::test]
    async fn test_proxy_preserves_per_stream_order() {
        let store: Arc<dyn MetaStore> = Arc::new(MemStore::new());
        let cluster_id = cluster::init_cluster_id(&store).await.unwrap();
        let node = start_tso_node(store.clone(), cluster_id).await;
        wait_default_primary(&node.manager).await;
        let proxy = start_proxy(store.clone(), cluster_id).await;

        let (sender, mut responses) = open_stream(&proxy.address).await;
        let mut last = (0i64, 0i64);
        for i in 0..100u32 {
            let count = i % 7 + 1;
            sender.send(tso_request(cluster_id, count)).unwrap();
            let response = responses.message().await.unwrap().unwrap();
            assert_that!(response.count).is_equal_to(count);
            let ts = response.timestamp.unwrap();
            let first = first_in_batch(&ts, count);
            assert_that!(timestamp::ts_less_eq(ts.physical, first, last.0, last.1)).is_false();
            last = (ts.physical, ts.logical);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_proxy_many_clients() {
        let store: Arc<dyn MetaStore> = Arc::new(MemStore::new());
        let cluster_id = cluster::init_cluster_id(&store).await.unwrap();
        let node = start_tso_node(store.clone(), cluster_id).await;
        wait_default_primary(&node.manager).await;
        let proxy = start_proxy(store.clone(), cluster_id).await;

        const CLIENTS: usize = 200;
        const REQUESTS: u32 = 100;
        let mut tasks = Vec::with_capacity(CLIENTS);
        for client in 0..CLIENTS {
            let address = proxy.address.clone();
            tasks.push(tokio::spawn(async move {
                let (sender, mut responses) = open_stream(&address).await;
                let mut received = 0u32;
                let mut last = (0i64, 0i64);
                for i in 0..REQUESTS {
                    let count = (client as u32 + i) % 100 + 1;
                    sender.send(tso_request(cluster_id, count)).unwrap();
                    let response = responses.message().await.unwrap().unwrap();
                    assert_eq!(response.count, count);
                    let ts = response.timestamp.unwrap();
                    let first = first_in_batch(&ts, count);
                    assert!(!timestamp::ts_less_eq(ts.physical, first, last.0, last.1));
                    last = (ts.physical, ts.logical);
                    received += 1;
                }
                received
            }));
        }
        let mut total = 0u32;
        for task in tasks {
            total += timeout(Duration::from_secs(60), task).await.unwrap().unwrap();
        }
        assert_that!(total).is_equal_to(CLIENTS as u32 * REQUESTS);
    }

    #[tokio::test]
    async fn test_proxy_cancellation_leaves_others_running() {
        let store: Arc<dyn MetaStore> = Arc::new(MemStore::new());
        let cluster_id = cluster::init_cluster_id(&store).await.unwrap();
        let node = start_tso_node(store.clone(), cluster_id).await;
        wait_default_primary(&node.manager).await;
        let proxy = start_proxy(store.clone(), cluster_id).await;

        let (canceled_sender, canceled_responses) = open_stream(&proxy.address).await;
        canceled_sender.send(tso_request(cluster_id, 1)).unwrap();
        drop(canceled_responses);
        drop(canceled_sender);

        let (sender, mut responses) = open_stream(&proxy.address).await;
        for _ in 0..10 {
            sender.send(tso_request(cluster_id, 1)).unwrap();
            let response = responses.message().await.unwrap().unwrap();
            assert_that!(response.header.unwrap().error.is_none()).is_true();
        }
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn test_proxy_failover_to_new_primary() {
        let store: Arc<dyn MetaStore> = Arc::new(MemStore::new());
        let cluster_id = cluster::init_cluster_id(&store).await.unwrap();
        let node1 = start_tso_node(store.clone(), cluster_id).await;
        wait_default_primary(&node1.manager).await;
        let node2 = start_tso_node(store.clone(), cluster_id).await;
        timeout(Duration::from_secs(5), async {
            let mut updates = node1.keyspace.updates();
            while node1.keyspace.registered_nodes().len() < 2 {
                updates.changed().await.unwrap();
            }
        })
        .await
        .unwrap();
        node1
            .keyspace
            .set_nodes(0, vec![node1.address.clone(), node2.address.clone()])
            .await
            .unwrap();
        let proxy = start_proxy(store.clone(), cluster_id).await;

        let (sender, mut responses) = open_stream(&proxy.address).await;
        sender.send(tso_request(cluster_id, 1)).unwrap();
        let response = responses.message().await.unwrap().unwrap();
        let issued = response.timestamp.unwrap();

        // Kill the serving primary; the standby takes the group over.
        let node1_primary = node1
            .manager
            .allocator(0)
            .map(|allocator| allocator.oracle.is_serving())
            .unwrap_or(false);
        let (dead, survivor) = if node1_primary { (node1, node2) } else { (node2, node1) };
        drop(dead);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        let recovered = loop {
            let (sender, mut responses) = open_stream(&proxy.address).await;
            sender.send(tso_request(cluster_id, 1)).unwrap();
            match responses.message().await {
                Ok(Some(response)) if response.header.as_ref().unwrap().error.is_none() => {
                    break response.timestamp.unwrap();
                },
                _ => {},
            }
            assert_that!(tokio::time::Instant::now() < deadline).is_true();
            tokio::time::sleep(Duration::from_millis(100)).await;
        };
        assert_that!(timestamp::ts_less_eq(
            recovered.physical,
            first_in_batch(&recovered, 1),
            issued.physical,
            issued.logical
        ))
        .is_false();
        drop(survivor);
    }
}
