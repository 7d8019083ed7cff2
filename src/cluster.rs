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

//! Cluster identity and TSO node registration.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use rand::Rng;

use crate::mds::{MetaCompare, MetaLease, MetaOp, MetaStore, MetaTxn};
use crate::protos::Member;

/// Root of every cluster-scoped key.
pub const CLUSTER_ROOT: &str = "/pd/";

pub const TSO_NODE_PREFIX: &str = "/tso_node/";

pub const NODE_LEASE_DURATION: Duration = Duration::from_secs(20);

const CLUSTER_ID_SUFFIX: &str = "/cluster_id";

pub fn cluster_id_key(cluster_id: u64) -> String {
    format!("{CLUSTER_ROOT}{cluster_id}{CLUSTER_ID_SUFFIX}")
}

pub fn tso_node_key(address: &str) -> String {
    format!("{TSO_NODE_PREFIX}{address}")
}

fn decode_cluster_id(value: &[u8]) -> Result<u64> {
    let bytes: [u8; 8] = value.try_into().map_err(|_| anyhow!("malformed cluster id: {value:?}"))?;
    Ok(u64::from_be_bytes(bytes))
}

async fn find_cluster_id(store: &Arc<dyn MetaStore>) -> Result<Option<u64>> {
    let mut from = CLUSTER_ROOT.as_bytes().to_vec();
    loop {
        let result = store.range(CLUSTER_ROOT.as_bytes(), &from, 16).await?;
        for kv in result.kvs.iter() {
            if kv.key_str()?.ends_with(CLUSTER_ID_SUFFIX) {
                return Ok(Some(decode_cluster_id(&kv.value)?));
            }
        }
        if !result.more {
            return Ok(None);
        }
        let last = result.kvs.last().ok_or_else(|| anyhow!("more data but empty page"))?;
        from = crate::mds::next_key(&last.key);
    }
}

/// Establishes the cluster id, generating and claiming one with a
/// create-once transaction if the cluster is pristine. Concurrent claimers
/// converge on whichever commit won.
pub async fn init_cluster_id(store: &Arc<dyn MetaStore>) -> Result<u64> {
    loop {
        if let Some(cluster_id) = find_cluster_id(store).await? {
            return Ok(cluster_id);
        }
        let seconds = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let cluster_id = (seconds << 32) | u64::from(rand::thread_rng().gen::<u32>());
        let key = cluster_id_key(cluster_id);
        let txn = MetaTxn::new()
            .when([MetaCompare::Missing(key.clone().into_bytes())])
            .and_then([MetaOp::put(key, cluster_id.to_be_bytes(), None)]);
        if store.txn(txn).await?.succeeded {
            tracing::info!("initialized cluster id {cluster_id}");
            return Ok(cluster_id);
        }
        // Lost the race; rescan for the winner's id.
    }
}

/// Registers a TSO node under a kept-alive lease; deregistration is the
/// lease expiring.
pub async fn register_tso_node(store: &Arc<dyn MetaStore>, address: &str) -> Result<MetaLease> {
    let lease = store.grant(NODE_LEASE_DURATION).await?;
    let key = tso_node_key(address);
    store.put(key.into_bytes(), address.as_bytes().to_vec(), Some(lease.id())).await?;
    tracing::info!("registered tso node {address}");
    Ok(lease)
}

pub fn new_member(name: impl Into<String>, address: impl Into<String>, dc_location: impl Into<String>) -> Member {
    Member {
        member_id: rand::thread_rng().gen(),
        name: name.into(),
        client_urls: vec![address.into()],
        peer_urls: Vec::new(),
        dc_location: dc_location.into(),
    }
}

#[cfg(test)]
mod tests {
    use assertor::*;

    use super::*;
    use crate::mds::MemStore;

    #[tokio::test]
    async fn test_init_cluster_id_once() {
        let store: Arc<dyn MetaStore> = Arc::new(MemStore::new());
        let first = init_cluster_id(&store).await.unwrap();
        let second = init_cluster_id(&store).await.unwrap();
        assert_that!(second).is_equal_to(first);

        let kv = store.get(cluster_id_key(first).as_bytes()).await.unwrap().unwrap();
        assert_that!(kv.value).is_equal_to(first.to_be_bytes().to_vec());
    }

    #[tokio::test]
    async fn test_register_tso_node() {
        let store: Arc<dyn MetaStore> = Arc::new(MemStore::new());
        let address = "http://127.0.0.1:3379";
        let lease = register_tso_node(&store, address).await.unwrap();
        let kv = store.get(tso_node_key(address).as_bytes()).await.unwrap().unwrap();
        assert_that!(kv.value).is_equal_to(address.as_bytes().to_vec());

        drop(lease);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_that!(store.get(tso_node_key(address).as_bytes()).await.unwrap().is_none()).is_true();
    }
}
