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

//! The keyspace-group administration RPCs served on API nodes.

use std::sync::Arc;

use async_trait::async_trait;
use tonic::{Request, Response, Status};

use crate::keyspace::{KeyspaceError, KeyspaceGroupManager};
use crate::protos::{
    CreateGroupRequest,
    CreateGroupResponse,
    FinishMergeRequest,
    FinishMergeResponse,
    FinishSplitRequest,
    FinishSplitResponse,
    GetGroupRequest,
    GetGroupResponse,
    KeyspaceAdmin,
    ListGroupsRequest,
    ListGroupsResponse,
    MergeGroupsRequest,
    MergeGroupsResponse,
    ResponseHeader,
    SetNodesRequest,
    SetNodesResponse,
    SetPriorityRequest,
    SetPriorityResponse,
    SplitGroupRequest,
    SplitGroupResponse,
};

pub struct KeyspaceAdminImpl {
    cluster_id: u64,
    keyspace: Arc<KeyspaceGroupManager>,
}

impl KeyspaceAdminImpl {
    pub fn new(cluster_id: u64, keyspace: Arc<KeyspaceGroupManager>) -> Self {
        Self { cluster_id, keyspace }
    }

    fn header(&self) -> Option<ResponseHeader> {
        Some(ResponseHeader::ok(self.cluster_id))
    }
}

fn status(err: KeyspaceError) -> Status {
    let message = err.to_string();
    match err {
        KeyspaceError::GroupNotFound(_) => Status::not_found(message),
        KeyspaceError::GroupExists(_) | KeyspaceError::KeyspaceOwned { .. } => Status::already_exists(message),
        KeyspaceError::GroupBusy(_) | KeyspaceError::Conflict(_) => Status::failed_precondition(message),
        KeyspaceError::KeyspaceNotInGroup { .. }
        | KeyspaceError::InvalidNodeCount
        | KeyspaceError::BadNodeAddress
        | KeyspaceError::NodeNotFound => Status::invalid_argument(message),
        KeyspaceError::Store(_) => Status::unavailable(message),
    }
}

#[async_trait]
impl KeyspaceAdmin for KeyspaceAdminImpl {
    async fn get_group(&self, request: Request<GetGroupRequest>) -> Result<Response<GetGroupResponse>, Status> {
        let request = request.into_inner();
        let group = self.keyspace.group(request.id).await.map_err(status)?;
        Ok(Response::new(GetGroupResponse { header: self.header(), group: Some(group) }))
    }

    async fn list_groups(&self, request: Request<ListGroupsRequest>) -> Result<Response<ListGroupsResponse>, Status> {
        let request = request.into_inner();
        let state = match request.state.as_str() {
            "" => None,
            state => Some(state),
        };
        let groups = self.keyspace.groups(state).await.map_err(status)?;
        Ok(Response::new(ListGroupsResponse { header: self.header(), groups }))
    }

    async fn create_group(
        &self,
        request: Request<CreateGroupRequest>,
    ) -> Result<Response<CreateGroupResponse>, Status> {
        let request = request.into_inner();
        let group = request.group.ok_or_else(|| Status::invalid_argument("missing keyspace group"))?;
        self.keyspace.create(group).await.map_err(status)?;
        Ok(Response::new(CreateGroupResponse { header: self.header() }))
    }

    async fn split_group(&self, request: Request<SplitGroupRequest>) -> Result<Response<SplitGroupResponse>, Status> {
        let request = request.into_inner();
        self.keyspace.split(request.source_id, request.target_id, request.keyspaces).await.map_err(status)?;
        Ok(Response::new(SplitGroupResponse { header: self.header() }))
    }

    async fn finish_split(
        &self,
        request: Request<FinishSplitRequest>,
    ) -> Result<Response<FinishSplitResponse>, Status> {
        let request = request.into_inner();
        self.keyspace.finish_split(request.id).await.map_err(status)?;
        Ok(Response::new(FinishSplitResponse { header: self.header() }))
    }

    async fn merge_groups(
        &self,
        request: Request<MergeGroupsRequest>,
    ) -> Result<Response<MergeGroupsResponse>, Status> {
        let request = request.into_inner();
        self.keyspace.merge(request.target_id, request.source_ids).await.map_err(status)?;
        Ok(Response::new(MergeGroupsResponse { header: self.header() }))
    }

    async fn finish_merge(
        &self,
        request: Request<FinishMergeRequest>,
    ) -> Result<Response<FinishMergeResponse>, Status> {
        let request = request.into_inner();
        self.keyspace.finish_merge(request.id).await.map_err(status)?;
        Ok(Response::new(FinishMergeResponse { header: self.header() }))
    }

    async fn set_nodes(&self, request: Request<SetNodesRequest>) -> Result<Response<SetNodesResponse>, Status> {
        let request = request.into_inner();
        self.keyspace.set_nodes(request.id, request.addresses).await.map_err(status)?;
        Ok(Response::new(SetNodesResponse { header: self.header() }))
    }

    async fn set_priority(
        &self,
        request: Request<SetPriorityRequest>,
    ) -> Result<Response<SetPriorityResponse>, Status> {
        let request = request.into_inner();
        self.keyspace.set_priority(request.id, &request.address, request.priority).await.map_err(status)?;
        Ok(Response::new(SetPriorityResponse { header: self.header() }))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use assertor::*;
    use tokio::net::TcpListener;
    use tokio_stream::wrappers::TcpListenerStream;

    use super::*;
    use crate::cluster;
    use crate::mds::{MemStore, MetaStore};
    use crate::protos::{KeyspaceAdminClient, KeyspaceAdminServer, KeyspaceGroup};
    use crate::utils;

    async fn start_admin(store: Arc<dyn MetaStore>) -> (String, utils::Retirer) {
        let cluster_id = cluster::init_cluster_id(&store).await.unwrap();
        let keyspace = Arc::new(KeyspaceGroupManager::start(store.clone(), 2).await.unwrap());
        let admin = KeyspaceAdminImpl::new(cluster_id, keyspace);
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let address = format!("http://{}", listener.local_addr().unwrap());
        let (retirer, mut retirement) = utils::retirement("test-server");
        tokio::spawn(async move {
            tonic::transport::Server::builder()
                .add_service(KeyspaceAdminServer::new(admin))
                .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async move {
                    retirement.retired().await
                })
                .await
                .unwrap();
        });
        (address, retirer)
    }

    #[tokio::test]
    async fn test_admin_split_lifecycle() {
        let store: Arc<dyn MetaStore> = Arc::new(MemStore::new());
        let (address, _server) = start_admin(store).await;
        let mut client = KeyspaceAdminClient::connect(address).await.unwrap();

        let group = KeyspaceGroup { id: 1, keyspaces: vec![111, 222, 333], ..Default::default() };
        client
            .create_group(CreateGroupRequest { header: None, group: Some(group) })
            .await
            .unwrap();
        client
            .split_group(SplitGroupRequest { header: None, source_id: 1, target_id: 2, keyspaces: vec![222, 333] })
            .await
            .unwrap();
        client.finish_split(FinishSplitRequest { header: None, id: 2 }).await.unwrap();

        let source = client
            .get_group(GetGroupRequest { header: None, id: 1 })
            .await
            .unwrap()
            .into_inner()
            .group
            .unwrap();
        let target = client
            .get_group(GetGroupRequest { header: None, id: 2 })
            .await
            .unwrap()
            .into_inner()
            .group
            .unwrap();
        assert_that!(source.keyspaces).is_equal_to(vec![111]);
        assert_that!(target.keyspaces).is_equal_to(vec![222, 333]);

        let listed = client
            .list_groups(ListGroupsRequest { header: None, state: "split".to_string() })
            .await
            .unwrap()
            .into_inner();
        assert_that!(listed.groups.is_empty()).is_true();
    }

    #[tokio::test]
    async fn test_admin_set_nodes_error_texts() {
        let store: Arc<dyn MetaStore> = Arc::new(MemStore::new());
        let node = "http://127.0.0.1:3379";
        let _node_lease = cluster::register_tso_node(&store, node).await.unwrap();
        let (address, _server) = start_admin(store.clone()).await;
        let mut client = KeyspaceAdminClient::connect(address).await.unwrap();

        let status = client
            .set_nodes(SetNodesRequest { header: None, id: 0, addresses: vec![node.to_string()] })
            .await
            .unwrap_err();
        assert_that!(status.message().to_string()).is_equal_to("invalid num of nodes".to_string());

        let status = client
            .set_nodes(SetNodesRequest {
                header: None,
                id: 0,
                addresses: vec![node.to_string(), "http://pingcap.com".to_string()],
            })
            .await
            .unwrap_err();
        assert_that!(status.message().to_string()).is_equal_to("node does not exist".to_string());
    }
}
