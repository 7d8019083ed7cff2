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

use std::collections::BTreeSet;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use hashbrown::HashMap;
use tokio::select;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tonic::{Request, Response, Status, Streaming};

use super::allocator::{TimestampOracle, TsoError, DEFAULT_UPDATE_PHYSICAL_INTERVAL};
use crate::election::{primary_key, Election, PrimaryState};
use crate::keyspace::KeyspaceGroupManager;
use crate::mds::MetaStore;
use crate::protos::{
    Error,
    ErrorType,
    GetMembersRequest,
    GetMembersResponse,
    Member,
    RequestHeader,
    ResponseHeader,
    Tso,
    TsoRequest,
    TsoResponse,
    GLOBAL_DC_LOCATION,
};
use crate::utils::{self, Retirement};

/// Runs one election plus one oracle per keyspace group this node is
/// assigned to, tracking catalog changes.
pub struct AllocatorManager {
    shared: Arc<ManagerShared>,
    _retirer: utils::Retirer,
}

struct ManagerShared {
    store: Arc<dyn MetaStore>,
    keyspace: Arc<KeyspaceGroupManager>,
    member: Member,
    dc: String,
    suffix_bits: u32,
    lease_ttl: Duration,
    allocators: RwLock<HashMap<u32, Arc<AllocatorNode>>>,
}

pub struct AllocatorNode {
    pub election: Election,
    pub oracle: Arc<TimestampOracle>,
    retirer: utils::Retirer,
}

impl AllocatorManager {
    pub fn start(
        store: Arc<dyn MetaStore>,
        keyspace: Arc<KeyspaceGroupManager>,
        member: Member,
        dc: impl Into<String>,
        suffix_bits: u32,
        lease_ttl: Duration,
    ) -> Arc<Self> {
        let shared = Arc::new(ManagerShared {
            store,
            keyspace,
            member,
            dc: dc.into(),
            suffix_bits,
            lease_ttl,
            allocators: RwLock::new(HashMap::new()),
        });
        let (retirer, retirement) = utils::retirement("allocator-manager");
        tokio::spawn(Self::reconcile_loop(shared.clone(), retirement));
        Arc::new(Self { shared, _retirer: retirer })
    }

    pub fn member(&self) -> &Member {
        &self.shared.member
    }

    pub fn dc(&self) -> &str {
        &self.shared.dc
    }

    pub fn allocator(&self, group: u32) -> Option<Arc<AllocatorNode>> {
        self.shared.allocators.read().unwrap().get(&group).cloned()
    }

    /// dc-location -> primary of that DC's allocator of the default group,
    /// as far as this node observes it.
    pub fn allocator_primaries(&self) -> std::collections::HashMap<String, Member> {
        let mut primaries = std::collections::HashMap::new();
        if let Some(node) = self.allocator(crate::protos::DEFAULT_KEYSPACE_GROUP_ID) {
            if let Some(primary) = node.election.state().primary {
                primaries.insert(self.shared.dc.clone(), primary);
            }
        }
        primaries
    }

    async fn reconcile_loop(shared: Arc<ManagerShared>, mut retirement: Retirement) {
        let mut updates = shared.keyspace.updates();
        loop {
            Self::reconcile(&shared);
            select! {
                _ = retirement.retired() => break,
                changed = updates.changed() => {
                    if changed.is_err() {
                        break;
                    }
                },
            }
        }
    }

    fn reconcile(shared: &Arc<ManagerShared>) {
        let address = shared.member.address().to_string();
        let assigned: HashMap<u32, _> =
            shared.keyspace.groups_for_node(&address).into_iter().map(|group| (group.id, group)).collect();
        {
            let mut allocators = shared.allocators.write().unwrap();
            allocators.retain(|group, node| {
                let keep = assigned.contains_key(group);
                if !keep {
                    tracing::info!("unassigned from keyspace group {group}, allocator retires");
                    node.oracle.stop_serving();
                    // Stop the serve task now; the election and its lease go
                    // with the node itself.
                    node.retirer.retire();
                }
                keep
            });
            for group in assigned.keys() {
                if !allocators.contains_key(group) {
                    tracing::info!("assigned to keyspace group {group}, allocator starts");
                    allocators.insert(*group, Arc::new(Self::start_allocator(shared, *group)));
                }
            }
        }

        // The highest-priority live member should hold the primary seat;
        // an outranked primary resigns and loses the ensuing re-election
        // to the faster challenger.
        let live: BTreeSet<String> = shared.keyspace.registered_nodes().into_iter().collect();
        let allocators = shared.allocators.read().unwrap();
        for (group_id, node) in allocators.iter() {
            let Some(group) = assigned.get(group_id) else { continue };
            if !node.election.is_primary() {
                continue;
            }
            let own = group.member(&address).map(|member| member.priority).unwrap_or(0);
            let outranked = group
                .members
                .iter()
                .any(|member| member.priority > own && live.contains(&member.address));
            if outranked {
                tracing::info!("outranked in keyspace group {group_id}, resigning primary");
                node.election.resign();
            }
        }
    }

    fn start_allocator(shared: &Arc<ManagerShared>, group: u32) -> AllocatorNode {
        let election = Election::start(
            shared.store.clone(),
            group,
            &shared.dc,
            shared.member.clone(),
            shared.lease_ttl,
        );
        let guard_key = primary_key(group, &shared.dc).into_bytes();
        let guard_value = serde_json::to_vec(&shared.member).expect("member is always serializable");
        let oracle = Arc::new(TimestampOracle::new(
            shared.store.clone(),
            group,
            shared.dc.clone(),
            guard_key,
            guard_value,
            shared.suffix_bits,
        ));
        let (retirer, retirement) = utils::retirement("allocator");
        tokio::spawn(Self::serve_allocator(election.subscribe(), oracle.clone(), retirement));
        AllocatorNode { election, oracle, retirer }
    }

    /// Follows one election: initializes the oracle on primary acquisition,
    /// drives its physical clock while serving, stops it on step-down.
    async fn serve_allocator(
        mut state: watch::Receiver<PrimaryState>,
        oracle: Arc<TimestampOracle>,
        mut retirement: Retirement,
    ) {
        loop {
            while !state.borrow_and_update().is_self {
                select! {
                    _ = retirement.retired() => return,
                    changed = state.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    },
                }
            }
            if let Err(err) = oracle.initialize().await {
                tracing::warn!(
                    "allocator of group {} dc {} failed to initialize: {:?}",
                    oracle.group(),
                    oracle.dc(),
                    err
                );
                select! {
                    _ = retirement.retired() => return,
                    _ = tokio::time::sleep(Duration::from_millis(500)) => {},
                }
                continue;
            }
            tracing::info!("allocator of group {} dc {} starts serving", oracle.group(), oracle.dc());
            let mut tick = tokio::time::interval(DEFAULT_UPDATE_PHYSICAL_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                select! {
                    _ = retirement.retired() => {
                        oracle.stop_serving();
                        return;
                    },
                    changed = state.changed() => {
                        if changed.is_err() || !state.borrow_and_update().is_self {
                            break;
                        }
                    },
                    _ = tick.tick() => oracle.update_physical().await,
                }
            }
            oracle.stop_serving();
            tracing::info!("allocator of group {} dc {} stops serving", oracle.group(), oracle.dc());
        }
    }
}

/// The streaming RPC front of the allocators on a TSO node.
pub struct TsoServiceImpl {
    state: Arc<TsoServiceState>,
}

struct TsoServiceState {
    cluster_id: u64,
    keyspace: Arc<KeyspaceGroupManager>,
    manager: Arc<AllocatorManager>,
}

impl TsoServiceImpl {
    pub fn new(cluster_id: u64, keyspace: Arc<KeyspaceGroupManager>, manager: Arc<AllocatorManager>) -> Self {
        Self { state: Arc::new(TsoServiceState { cluster_id, keyspace, manager }) }
    }
}

impl TsoServiceState {
    fn fail(&self, error: Error) -> TsoResponse {
        TsoResponse { header: Some(ResponseHeader::failed(self.cluster_id, error)), count: 0, timestamp: None }
    }

    fn check_header(&self, header: Option<&RequestHeader>) -> Result<RequestHeader, Error> {
        let Some(header) = header else {
            return Err(Error::invalid_argument("missing request header"));
        };
        if header.cluster_id != self.cluster_id {
            return Err(Error::cluster_id_mismatch(self.cluster_id, header.cluster_id));
        }
        Ok(header.clone())
    }

    async fn handle_tso(&self, request: TsoRequest) -> TsoResponse {
        let header = match self.check_header(request.header.as_ref()) {
            Ok(header) => header,
            Err(error) => return self.fail(error),
        };
        let dc = if request.dc_location.is_empty() { GLOBAL_DC_LOCATION } else { request.dc_location.as_str() };
        if dc != self.manager.dc() {
            return self.fail(Error::invalid_argument(format!("dc-location {dc} not served here")));
        }
        let group = match header.keyspace_group_id {
            0 => self.keyspace.group_for_keyspace(header.keyspace_id),
            id => id,
        };
        let Some(node) = self.manager.allocator(group) else {
            return self.fail(Error::not_primary(group, dc, ""));
        };
        match node.oracle.get_timestamp(request.count).await {
            Ok(timestamp) => TsoResponse {
                header: Some(ResponseHeader::ok(self.cluster_id)),
                count: request.count,
                timestamp: Some(timestamp),
            },
            Err(TsoError::NotPrimary { group, dc }) => {
                let hint = node
                    .election
                    .state()
                    .primary
                    .map(|primary| primary.address().to_string())
                    .unwrap_or_default();
                self.fail(Error::not_primary(group, &dc, hint))
            },
            Err(TsoError::Unsynced { message }) => self.fail(Error::unsynced(message)),
            Err(TsoError::InvalidCount { count }) => {
                self.fail(Error::invalid_argument(format!("invalid timestamp count {count}")))
            },
            Err(TsoError::Store(err)) => self.fail(Error::new(ErrorType::Unknown, format!("{err:?}"))),
        }
    }

    fn members(&self) -> GetMembersResponse {
        let members = self
            .keyspace
            .registered_nodes()
            .into_iter()
            .map(|address| Member {
                member_id: 0,
                name: address.clone(),
                client_urls: vec![address],
                peer_urls: Vec::new(),
                dc_location: self.manager.dc().to_string(),
            })
            .collect();
        let leader = self
            .manager
            .allocator(crate::protos::DEFAULT_KEYSPACE_GROUP_ID)
            .and_then(|node| node.election.state().primary);
        GetMembersResponse {
            header: Some(ResponseHeader::ok(self.cluster_id)),
            members,
            leader,
            tso_allocator_primaries: self.manager.allocator_primaries(),
        }
    }
}

#[async_trait]
impl Tso for TsoServiceImpl {
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
                let response = state.handle_tso(request).await;
                let failed = response.header.as_ref().map(|h| h.error.is_some()).unwrap_or(false);
                if sender.send(Ok(response)).is_err() || failed {
                    // The error goes out on this recv; the stream closes
                    // right after.
                    break;
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
        // Cluster id zero is a client that does not know the cluster yet;
        // the response header teaches it.
        let claimed = request.header.as_ref().map(|header| header.cluster_id).unwrap_or_default();
        if claimed != 0 && claimed != self.state.cluster_id {
            let error = Error::cluster_id_mismatch(self.state.cluster_id, claimed);
            let header = ResponseHeader::failed(self.state.cluster_id, error);
            return Ok(Response::new(GetMembersResponse { header: Some(header), ..Default::default() }));
        }
        Ok(Response::new(self.state.members()))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use assertor::*;
    use tokio::net::TcpListener;
    use tokio::time::timeout;
    use tokio_stream::wrappers::TcpListenerStream;

    use super::*;
    use crate::cluster;
    use crate::mds::{MemStore, MetaLease};
    use crate::protos::{TsoClient, TsoServer};
    use crate::timestamp::{self, first_in_batch};

    pub(crate) struct TestTsoNode {
        pub address: String,
        pub manager: Arc<AllocatorManager>,
        pub keyspace: Arc<KeyspaceGroupManager>,
        _node_lease: MetaLease,
        _server: utils::Retirer,
    }

    pub(crate) async fn start_tso_node(store: Arc<dyn MetaStore>, cluster_id: u64) -> TestTsoNode {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let address = format!("http://{}", listener.local_addr().unwrap());
        let node_lease = cluster::register_tso_node(&store, &address).await.unwrap();
        let keyspace = Arc::new(KeyspaceGroupManager::start(store.clone(), 2).await.unwrap());
        let member = cluster::new_member(address.clone(), address.clone(), GLOBAL_DC_LOCATION);
        let manager = AllocatorManager::start(
            store.clone(),
            keyspace.clone(),
            member,
            GLOBAL_DC_LOCATION,
            0,
            Duration::from_millis(300),
        );
        let service = TsoServiceImpl::new(cluster_id, keyspace.clone(), manager.clone());
        let (retirer, mut retirement) = utils::retirement("test-server");
        tokio::spawn(async move {
            tonic::transport::Server::builder()
                .add_service(TsoServer::new(service))
                .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async move {
                    retirement.retired().await
                })
                .await
                .unwrap();
        });
        TestTsoNode { address, manager, keyspace, _node_lease: node_lease, _server: retirer }
    }

    pub(crate) async fn wait_default_primary(manager: &Arc<AllocatorManager>) {
        timeout(Duration::from_secs(10), async {
            loop {
                if let Some(node) = manager.allocator(crate::protos::DEFAULT_KEYSPACE_GROUP_ID) {
                    if node.oracle.is_serving() {
                        return;
                    }
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap()
    }

    pub(crate) fn tso_request(cluster_id: u64, count: u32) -> TsoRequest {
        TsoRequest {
            header: Some(RequestHeader::new(cluster_id)),
            count,
            dc_location: String::new(),
        }
    }

    #[tokio::test]
    async fn test_single_stream_monotonic() {
        let store: Arc<dyn MetaStore> = Arc::new(MemStore::new());
        let cluster_id = cluster::init_cluster_id(&store).await.unwrap();
        let node = start_tso_node(store.clone(), cluster_id).await;
        wait_default_primary(&node.manager).await;

        let mut client = TsoClient::connect(node.address.clone()).await.unwrap();
        let (sender, requests) = mpsc::unbounded_channel();
        let mut responses =
            client.tso(UnboundedReceiverStream::new(requests)).await.unwrap().into_inner();

        let mut last = (0i64, 0i64);
        for _ in 0..100 {
            sender.send(tso_request(cluster_id, 1)).unwrap();
            let response = responses.message().await.unwrap().unwrap();
            assert_that!(response.header.unwrap().error.is_none()).is_true();
            assert_that!(response.count).is_equal_to(1);
            let ts = response.timestamp.unwrap();
            let first = first_in_batch(&ts, 1);
            assert_that!(timestamp::ts_less_eq(ts.physical, first, last.0, last.1)).is_false();
            last = (ts.physical, ts.logical);
        }
    }

    #[tokio::test]
    async fn test_batch_counts_respected() {
        let store: Arc<dyn MetaStore> = Arc::new(MemStore::new());
        let cluster_id = cluster::init_cluster_id(&store).await.unwrap();
        let node = start_tso_node(store.clone(), cluster_id).await;
        wait_default_primary(&node.manager).await;

        let mut client = TsoClient::connect(node.address.clone()).await.unwrap();
        let (sender, requests) = mpsc::unbounded_channel();
        let mut responses =
            client.tso(UnboundedReceiverStream::new(requests)).await.unwrap().into_inner();

        let mut last = (0i64, 0i64);
        for count in 1u32..=100 {
            sender.send(tso_request(cluster_id, count)).unwrap();
            let response = responses.message().await.unwrap().unwrap();
            assert_that!(response.count).is_equal_to(count);
            let ts = response.timestamp.unwrap();
            let first = first_in_batch(&ts, count);
            assert_that!(timestamp::ts_less_eq(ts.physical, first, last.0, last.1)).is_false();
            last = (ts.physical, ts.logical);
        }
    }

    #[tokio::test]
    async fn test_cluster_id_mismatch_closes_stream() {
        let store: Arc<dyn MetaStore> = Arc::new(MemStore::new());
        let cluster_id = cluster::init_cluster_id(&store).await.unwrap();
        let node = start_tso_node(store.clone(), cluster_id).await;
        wait_default_primary(&node.manager).await;

        let mut client = TsoClient::connect(node.address.clone()).await.unwrap();
        let (sender, requests) = mpsc::unbounded_channel();
        let mut responses =
            client.tso(UnboundedReceiverStream::new(requests)).await.unwrap().into_inner();

        sender.send(tso_request(cluster_id + 1, 1)).unwrap();
        let response = responses.message().await.unwrap().unwrap();
        let header = response.header.unwrap();
        assert_that!(header.error_type()).is_equal_to(ErrorType::ClusterIdMismatch);
        assert_that!(responses.message().await.unwrap().is_none()).is_true();
    }

    #[tokio::test]
    async fn test_get_members_reports_primary() {
        let store: Arc<dyn MetaStore> = Arc::new(MemStore::new());
        let cluster_id = cluster::init_cluster_id(&store).await.unwrap();
        let node = start_tso_node(store.clone(), cluster_id).await;
        wait_default_primary(&node.manager).await;

        let mut client = TsoClient::connect(node.address.clone()).await.unwrap();
        let request = GetMembersRequest { header: Some(RequestHeader::new(cluster_id)) };
        let response = client.get_members(request).await.unwrap().into_inner();
        assert_that!(response.members.len()).is_equal_to(1);
        let leader = response.leader.unwrap();
        assert_that!(leader.address().to_string()).is_equal_to(node.address.clone());
        let primary = response.tso_allocator_primaries.get(GLOBAL_DC_LOCATION).unwrap();
        assert_that!(primary.address().to_string()).is_equal_to(node.address.clone());
    }
}
