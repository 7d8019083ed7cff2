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

//! Keyspace-group catalog: creation, split and merge lifecycle, node
//! placement and priorities.
//!
//! Writers commit guarded transactions against the metadata store; the
//! in-memory catalog is fed exclusively by watch events, so every node
//! converges on the same view.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock};

use anyhow::{anyhow, Context, Result};
use thiserror::Error;
use tokio::sync::watch;

use crate::endpoint::parse_node_address;
use crate::mds::{
    LoopWatcher,
    MetaCompare,
    MetaKeyValue,
    MetaOp,
    MetaStore,
    MetaTxn,
    Revision,
    WatcherHandle,
    MAX_TXN_OPS,
};
use crate::protos::{
    KeyspaceGroup,
    KeyspaceGroupMember,
    MergeState,
    SplitState,
    DEFAULT_KEYSPACE_GROUP_ID,
    DEFAULT_KEYSPACE_ID,
};

pub const KEYSPACE_GROUP_PREFIX: &str = "/keyspace_group/";

pub const DEFAULT_REPLICA_COUNT: usize = 2;

pub const DEFAULT_USER_KIND: &str = "basic";

pub fn keyspace_group_key(id: u32) -> String {
    format!("{KEYSPACE_GROUP_PREFIX}{id}")
}

#[derive(Debug, Error)]
pub enum KeyspaceError {
    #[error("keyspace group {0} not found")]
    GroupNotFound(u32),
    #[error("keyspace group {0} already exists")]
    GroupExists(u32),
    #[error("keyspace group {0} is splitting or merging")]
    GroupBusy(u32),
    #[error("keyspace {keyspace} does not belong to keyspace group {group}")]
    KeyspaceNotInGroup { keyspace: u32, group: u32 },
    #[error("keyspace {keyspace} already belongs to keyspace group {group}")]
    KeyspaceOwned { keyspace: u32, group: u32 },
    #[error("invalid num of nodes")]
    InvalidNodeCount,
    #[error("Failed to parse the tso node address")]
    BadNodeAddress,
    #[error("node does not exist")]
    NodeNotFound,
    #[error("keyspace group {0} changed concurrently")]
    Conflict(u32),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

struct Shared {
    store: Arc<dyn MetaStore>,
    replica_count: usize,
    groups: RwLock<BTreeMap<u32, KeyspaceGroup>>,
    nodes: RwLock<BTreeSet<String>>,
    updates: watch::Sender<u64>,
}

impl Shared {
    fn bump(&self) {
        self.updates.send_modify(|version| *version += 1);
    }
}

/// Catalog of keyspace groups plus the registered TSO node pool.
pub struct KeyspaceGroupManager {
    shared: Arc<Shared>,
    _group_watcher: WatcherHandle,
    _node_watcher: WatcherHandle,
}

impl KeyspaceGroupManager {
    pub async fn start(store: Arc<dyn MetaStore>, replica_count: usize) -> Result<Self> {
        let (updates, _) = watch::channel(0);
        let shared = Arc::new(Shared {
            store: store.clone(),
            replica_count: replica_count.max(1),
            groups: RwLock::new(BTreeMap::new()),
            nodes: RwLock::new(BTreeSet::new()),
            updates,
        });

        let groups = shared.clone();
        let groups_deleted = shared.clone();
        let groups_post = shared.clone();
        let mut group_watcher = LoopWatcher::new(
            "keyspace-groups",
            store.clone(),
            KEYSPACE_GROUP_PREFIX.as_bytes().to_vec(),
            Box::new(move |kv| {
                let group = decode_group(&kv)?;
                groups.groups.write().unwrap().insert(group.id, group);
                Ok(())
            }),
            Box::new(move |kv| {
                let id = decode_group_id(&kv.key)?;
                groups_deleted.groups.write().unwrap().remove(&id);
                Ok(())
            }),
            Box::new(move || {
                groups_post.bump();
                Ok(())
            }),
        )
        .start();

        let nodes = shared.clone();
        let nodes_deleted = shared.clone();
        let nodes_post = shared.clone();
        let mut node_watcher = LoopWatcher::new(
            "tso-nodes",
            store.clone(),
            crate::cluster::TSO_NODE_PREFIX.as_bytes().to_vec(),
            Box::new(move |kv| {
                nodes.nodes.write().unwrap().insert(kv.value_str()?.to_string());
                Ok(())
            }),
            Box::new(move |kv| {
                let address = kv
                    .key_str()?
                    .strip_prefix(crate::cluster::TSO_NODE_PREFIX)
                    .ok_or_else(|| anyhow!("unexpected tso node key"))?;
                nodes_deleted.nodes.write().unwrap().remove(address);
                Ok(())
            }),
            Box::new(move || {
                nodes_post.bump();
                Ok(())
            }),
        )
        .start();

        group_watcher.wait_load().await.context("load keyspace groups")?;
        node_watcher.wait_load().await.context("load tso nodes")?;

        let manager = Self { shared, _group_watcher: group_watcher, _node_watcher: node_watcher };
        manager.bootstrap_default_group().await?;
        Ok(manager)
    }

    /// Creates the default group holding the default keyspace on first boot.
    async fn bootstrap_default_group(&self) -> Result<()> {
        let key = keyspace_group_key(DEFAULT_KEYSPACE_GROUP_ID);
        if self.shared.store.get(key.as_bytes()).await?.is_some() {
            return Ok(());
        }
        let group = KeyspaceGroup {
            id: DEFAULT_KEYSPACE_GROUP_ID,
            user_kind: DEFAULT_USER_KIND.to_string(),
            members: self.allocate_members(),
            keyspaces: vec![DEFAULT_KEYSPACE_ID],
            split_state: None,
            merge_state: None,
        };
        let txn = MetaTxn::new()
            .when([MetaCompare::Missing(key.clone().into_bytes())])
            .and_then([MetaOp::put(key, serde_json::to_vec(&group)?, None)]);
        // A lost race means a peer bootstrapped it.
        self.shared.store.txn(txn).await?;
        Ok(())
    }

    fn allocate_members(&self) -> Vec<KeyspaceGroupMember> {
        let nodes = self.shared.nodes.read().unwrap();
        nodes
            .iter()
            .take(self.shared.replica_count)
            .map(|address| KeyspaceGroupMember { address: address.clone(), priority: 0 })
            .collect()
    }

    pub fn replica_count(&self) -> usize {
        self.shared.replica_count
    }

    /// Version counter bumped on every applied catalog or node-pool change.
    pub fn updates(&self) -> watch::Receiver<u64> {
        self.shared.updates.subscribe()
    }

    pub fn registered_nodes(&self) -> Vec<String> {
        self.shared.nodes.read().unwrap().iter().cloned().collect()
    }

    pub fn cached_group(&self, id: u32) -> Option<KeyspaceGroup> {
        self.shared.groups.read().unwrap().get(&id).cloned()
    }

    pub fn cached_groups(&self) -> Vec<KeyspaceGroup> {
        self.shared.groups.read().unwrap().values().cloned().collect()
    }

    /// Groups the given node currently serves in.
    pub fn groups_for_node(&self, address: &str) -> Vec<KeyspaceGroup> {
        let groups = self.shared.groups.read().unwrap();
        groups.values().filter(|group| group.is_member(address)).cloned().collect()
    }

    /// Resolves the group owning a keyspace. A keyspace sitting in a split
    /// target keeps routing to the split source until finish-split.
    pub fn group_for_keyspace(&self, keyspace_id: u32) -> u32 {
        let groups = self.shared.groups.read().unwrap();
        for group in groups.values() {
            if group.contains_keyspace(keyspace_id) {
                if let Some(state) = &group.split_state {
                    if group.id == state.target_id {
                        return state.source_id;
                    }
                }
                return group.id;
            }
        }
        DEFAULT_KEYSPACE_GROUP_ID
    }

    async fn load_group(&self, id: u32) -> Result<Option<(KeyspaceGroup, Revision)>, KeyspaceError> {
        let key = keyspace_group_key(id);
        match self.shared.store.get(key.as_bytes()).await? {
            None => Ok(None),
            Some(kv) => {
                let group = decode_group(&kv)?;
                Ok(Some((group, kv.mod_revision)))
            },
        }
    }

    async fn require_group(&self, id: u32) -> Result<(KeyspaceGroup, Revision), KeyspaceError> {
        self.load_group(id).await?.ok_or(KeyspaceError::GroupNotFound(id))
    }

    /// Whether a group is a merge source of some other group.
    fn frozen_by_merge(&self, id: u32) -> bool {
        let groups = self.shared.groups.read().unwrap();
        groups.values().any(|group| {
            group.merge_state.as_ref().map(|state| state.merge_list.contains(&id)).unwrap_or(false)
        })
    }

    fn put_group(group: &KeyspaceGroup) -> Result<MetaOp> {
        Ok(MetaOp::put(keyspace_group_key(group.id), serde_json::to_vec(group)?, None))
    }

    /// Fresh read of one group from the store.
    pub async fn group(&self, id: u32) -> Result<KeyspaceGroup, KeyspaceError> {
        Ok(self.require_group(id).await?.0)
    }

    /// Fresh scan of the catalog, optionally filtered by lifecycle state.
    pub async fn groups(&self, state: Option<&str>) -> Result<Vec<KeyspaceGroup>, KeyspaceError> {
        let prefix = KEYSPACE_GROUP_PREFIX.as_bytes();
        let mut from = prefix.to_vec();
        let mut groups = Vec::new();
        loop {
            let result = self.shared.store.range(prefix, &from, MAX_TXN_OPS as i64).await?;
            for kv in result.kvs.iter() {
                groups.push(decode_group(kv)?);
            }
            if !result.more {
                break;
            }
            let last = result.kvs.last().ok_or_else(|| anyhow!("more data but empty page"))?;
            from = crate::mds::next_key(&last.key);
        }
        groups.sort_by_key(|group| group.id);
        let groups = match state {
            None => groups,
            Some("split") => groups.into_iter().filter(KeyspaceGroup::in_split_state).collect(),
            Some("merge") => groups.into_iter().filter(KeyspaceGroup::in_merge_state).collect(),
            Some(state) => return Err(anyhow!("unknown keyspace group state {state:?}").into()),
        };
        Ok(groups)
    }

    pub async fn create(&self, mut group: KeyspaceGroup) -> Result<(), KeyspaceError> {
        if self.load_group(group.id).await?.is_some() {
            return Err(KeyspaceError::GroupExists(group.id));
        }
        group.keyspaces.sort_unstable();
        group.keyspaces.dedup();
        {
            let groups = self.shared.groups.read().unwrap();
            for keyspace in group.keyspaces.iter() {
                if let Some(owner) = groups.values().find(|other| other.contains_keyspace(*keyspace)) {
                    return Err(KeyspaceError::KeyspaceOwned { keyspace: *keyspace, group: owner.id });
                }
            }
        }
        if group.user_kind.is_empty() {
            group.user_kind = DEFAULT_USER_KIND.to_string();
        }
        if group.members.is_empty() {
            group.members = self.allocate_members();
        }
        let key = keyspace_group_key(group.id);
        let txn = MetaTxn::new()
            .when([MetaCompare::Missing(key.into_bytes())])
            .and_then([Self::put_group(&group)?]);
        if !self.shared.store.txn(txn).await?.succeeded {
            return Err(KeyspaceError::GroupExists(group.id));
        }
        Ok(())
    }

    /// Assigns keyspaces to a group. The hook for the external keyspace
    /// manager provisioning tenants.
    pub async fn assign_keyspaces(&self, id: u32, keyspaces: Vec<u32>) -> Result<(), KeyspaceError> {
        for chunk in keyspaces.chunks(MAX_TXN_OPS) {
            let (mut group, revision) = self.require_group(id).await?;
            group.add_keyspaces(chunk.iter().copied());
            let txn = MetaTxn::new()
                .when([MetaCompare::ModRevision(keyspace_group_key(id).into_bytes(), revision)])
                .and_then([Self::put_group(&group)?]);
            if !self.shared.store.txn(txn).await?.succeeded {
                return Err(KeyspaceError::Conflict(id));
            }
        }
        Ok(())
    }

    /// Starts a split: marks both records in one transaction, then migrates
    /// the keyspace list in idempotent chunks. Moved keyspaces keep routing
    /// to the source until [finish_split](Self::finish_split).
    pub async fn split(
        &self,
        source_id: u32,
        target_id: u32,
        keyspaces: Vec<u32>,
    ) -> Result<(), KeyspaceError> {
        if source_id == target_id || keyspaces.is_empty() {
            return Err(anyhow!("nothing to split").into());
        }
        let (mut source, revision) = self.require_group(source_id).await?;
        if !source.quiescent() || self.frozen_by_merge(source_id) {
            return Err(KeyspaceError::GroupBusy(source_id));
        }
        if self.load_group(target_id).await?.is_some() {
            return Err(KeyspaceError::GroupExists(target_id));
        }
        for keyspace in keyspaces.iter() {
            if !source.contains_keyspace(*keyspace) {
                return Err(KeyspaceError::KeyspaceNotInGroup { keyspace: *keyspace, group: source_id });
            }
        }

        let state = SplitState::new(source_id, target_id);
        source.split_state = Some(state);
        let target = KeyspaceGroup {
            id: target_id,
            user_kind: source.user_kind.clone(),
            members: source.members.clone(),
            keyspaces: Vec::new(),
            split_state: Some(state),
            merge_state: None,
        };
        let txn = MetaTxn::new()
            .when([
                MetaCompare::ModRevision(keyspace_group_key(source_id).into_bytes(), revision),
                MetaCompare::Missing(keyspace_group_key(target_id).into_bytes()),
            ])
            .and_then([Self::put_group(&source)?, Self::put_group(&target)?]);
        if !self.shared.store.txn(txn).await?.succeeded {
            return Err(KeyspaceError::Conflict(source_id));
        }

        self.migrate_keyspaces(source_id, target_id, &keyspaces).await
    }

    /// Moves `keyspaces` from `source_id` to `target_id` in chunks bounded
    /// by the transaction op limit. Re-applying an already-moved chunk is a
    /// no-op, so interrupted migrations resume cleanly.
    async fn migrate_keyspaces(
        &self,
        source_id: u32,
        target_id: u32,
        keyspaces: &[u32],
    ) -> Result<(), KeyspaceError> {
        let mut misses = 0;
        loop {
            let (mut source, source_revision) = self.require_group(source_id).await?;
            let (mut target, target_revision) = self.require_group(target_id).await?;
            let remaining: Vec<u32> =
                keyspaces.iter().copied().filter(|keyspace| source.contains_keyspace(*keyspace)).collect();
            if remaining.is_empty() {
                return Ok(());
            }
            let chunk = &remaining[..remaining.len().min(MAX_TXN_OPS)];
            source.remove_keyspaces(chunk);
            target.add_keyspaces(chunk.iter().copied());
            let txn = MetaTxn::new()
                .when([
                    MetaCompare::ModRevision(keyspace_group_key(source_id).into_bytes(), source_revision),
                    MetaCompare::ModRevision(keyspace_group_key(target_id).into_bytes(), target_revision),
                ])
                .and_then([Self::put_group(&source)?, Self::put_group(&target)?]);
            if self.shared.store.txn(txn).await?.succeeded {
                misses = 0;
                continue;
            }
            // One refresh-and-retry per chunk; a repeated miss surfaces as
            // a conflict to the caller.
            misses += 1;
            if misses > 1 {
                return Err(KeyspaceError::Conflict(source_id));
            }
        }
    }

    /// Clears the split state of both groups atomically. Finishing an
    /// already-finished split is a no-op.
    pub async fn finish_split(&self, target_id: u32) -> Result<(), KeyspaceError> {
        let (mut target, target_revision) = self.require_group(target_id).await?;
        let Some(state) = target.split_state.take() else {
            return Ok(());
        };
        if state.target_id != target_id {
            return Err(anyhow!("keyspace group {target_id} is a split source, not a target").into());
        }
        let mut compares = vec![MetaCompare::ModRevision(keyspace_group_key(target_id).into_bytes(), target_revision)];
        let mut ops = vec![Self::put_group(&target)?];
        if let Some((mut source, source_revision)) = self.load_group(state.source_id).await? {
            source.split_state = None;
            compares.push(MetaCompare::ModRevision(
                keyspace_group_key(state.source_id).into_bytes(),
                source_revision,
            ));
            ops.push(Self::put_group(&source)?);
        }
        let txn = MetaTxn::new().when(compares).and_then(ops);
        if !self.shared.store.txn(txn).await?.succeeded {
            return Err(KeyspaceError::Conflict(target_id));
        }
        Ok(())
    }

    /// Starts a merge: records the merge list on the target, freezing the
    /// sources, then drains their keyspaces into the target.
    pub async fn merge(&self, target_id: u32, source_ids: Vec<u32>) -> Result<(), KeyspaceError> {
        if source_ids.is_empty() || source_ids.contains(&target_id) {
            return Err(anyhow!("nothing to merge").into());
        }
        let (mut target, revision) = self.require_group(target_id).await?;
        if !target.quiescent() || self.frozen_by_merge(target_id) {
            return Err(KeyspaceError::GroupBusy(target_id));
        }
        for source_id in source_ids.iter() {
            let (source, _) = self.require_group(*source_id).await?;
            if !source.quiescent() || self.frozen_by_merge(*source_id) {
                return Err(KeyspaceError::GroupBusy(*source_id));
            }
        }
        target.merge_state = Some(MergeState { merge_list: source_ids.clone() });
        let txn = MetaTxn::new()
            .when([MetaCompare::ModRevision(keyspace_group_key(target_id).into_bytes(), revision)])
            .and_then([Self::put_group(&target)?]);
        if !self.shared.store.txn(txn).await?.succeeded {
            return Err(KeyspaceError::Conflict(target_id));
        }

        for source_id in source_ids {
            let (source, _) = self.require_group(source_id).await?;
            self.migrate_keyspaces(source_id, target_id, &source.keyspaces.clone()).await?;
        }
        Ok(())
    }

    /// Deletes the drained source groups and clears the merge state.
    /// Finishing an already-finished merge is a no-op.
    pub async fn finish_merge(&self, target_id: u32) -> Result<(), KeyspaceError> {
        let (mut target, revision) = self.require_group(target_id).await?;
        let Some(state) = target.merge_state.take() else {
            return Ok(());
        };
        // Source deletions are idempotent; commit them in bounded chunks
        // before the final state clear.
        let mut sources = state.merge_list.clone();
        while sources.len() + 1 > MAX_TXN_OPS {
            let rest = sources.split_off(MAX_TXN_OPS - 1);
            let ops: Vec<_> =
                sources.iter().map(|id| MetaOp::delete(keyspace_group_key(*id).into_bytes())).collect();
            self.shared.store.txn(MetaTxn::new().and_then(ops)).await?;
            sources = rest;
        }
        let mut ops: Vec<_> =
            sources.iter().map(|id| MetaOp::delete(keyspace_group_key(*id).into_bytes())).collect();
        ops.push(Self::put_group(&target)?);
        let txn = MetaTxn::new()
            .when([MetaCompare::ModRevision(keyspace_group_key(target_id).into_bytes(), revision)])
            .and_then(ops);
        if !self.shared.store.txn(txn).await?.succeeded {
            return Err(KeyspaceError::Conflict(target_id));
        }
        Ok(())
    }

    /// Replaces the member set. The count must match the configured replica
    /// count and every address must be a registered TSO node. Priorities of
    /// retained members survive.
    pub async fn set_nodes(&self, id: u32, addresses: Vec<String>) -> Result<(), KeyspaceError> {
        if addresses.len() != self.shared.replica_count {
            return Err(KeyspaceError::InvalidNodeCount);
        }
        for address in addresses.iter() {
            parse_node_address(address).map_err(|_| KeyspaceError::BadNodeAddress)?;
        }
        {
            let nodes = self.shared.nodes.read().unwrap();
            for address in addresses.iter() {
                if !nodes.contains(address) {
                    return Err(KeyspaceError::NodeNotFound);
                }
            }
        }
        let (mut group, revision) = self.require_group(id).await?;
        group.members = addresses
            .into_iter()
            .map(|address| {
                let priority = group.member(&address).map(|member| member.priority).unwrap_or(0);
                KeyspaceGroupMember { address, priority }
            })
            .collect();
        let txn = MetaTxn::new()
            .when([MetaCompare::ModRevision(keyspace_group_key(id).into_bytes(), revision)])
            .and_then([Self::put_group(&group)?]);
        if !self.shared.store.txn(txn).await?.succeeded {
            return Err(KeyspaceError::Conflict(id));
        }
        Ok(())
    }

    /// Sets the election priority of one member; the highest-priority live
    /// member wins re-election.
    pub async fn set_priority(&self, id: u32, address: &str, priority: i32) -> Result<(), KeyspaceError> {
        parse_node_address(address).map_err(|_| KeyspaceError::BadNodeAddress)?;
        let (mut group, revision) = self.require_group(id).await?;
        let Some(member) = group.members.iter_mut().find(|member| member.address == address) else {
            return Err(KeyspaceError::NodeNotFound);
        };
        member.priority = priority;
        let txn = MetaTxn::new()
            .when([MetaCompare::ModRevision(keyspace_group_key(id).into_bytes(), revision)])
            .and_then([Self::put_group(&group)?]);
        if !self.shared.store.txn(txn).await?.succeeded {
            return Err(KeyspaceError::Conflict(id));
        }
        Ok(())
    }
}

fn decode_group_id(key: &[u8]) -> Result<u32> {
    let key = std::str::from_utf8(key)?;
    let id = key.strip_prefix(KEYSPACE_GROUP_PREFIX).ok_or_else(|| anyhow!("unexpected group key {key}"))?;
    Ok(id.parse()?)
}

fn decode_group(kv: &MetaKeyValue) -> Result<KeyspaceGroup> {
    let group: KeyspaceGroup =
        serde_json::from_slice(&kv.value).with_context(|| format!("decode keyspace group {:?}", kv.key_str()))?;
    Ok(group)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use assertor::*;
    use tokio::time::timeout;

    use super::*;
    use crate::mds::MemStore;

    async fn manager(store: &Arc<dyn MetaStore>) -> KeyspaceGroupManager {
        KeyspaceGroupManager::start(store.clone(), DEFAULT_REPLICA_COUNT).await.unwrap()
    }

    async fn wait_catalog(manager: &KeyspaceGroupManager, predicate: impl Fn(&KeyspaceGroupManager) -> bool) {
        let mut updates = manager.updates();
        timeout(Duration::from_secs(5), async {
            loop {
                if predicate(manager) {
                    return;
                }
                updates.changed().await.unwrap();
            }
        })
        .await
        .unwrap()
    }

    fn group(id: u32, keyspaces: Vec<u32>) -> KeyspaceGroup {
        KeyspaceGroup { id, user_kind: DEFAULT_USER_KIND.to_string(), keyspaces, ..Default::default() }
    }

    #[tokio::test]
    async fn test_bootstrap_default_group() {
        let store: Arc<dyn MetaStore> = Arc::new(MemStore::new());
        let manager = manager(&store).await;
        let default = manager.group(DEFAULT_KEYSPACE_GROUP_ID).await.unwrap();
        assert_that!(default.keyspaces).is_equal_to(vec![DEFAULT_KEYSPACE_ID]);
    }

    #[tokio::test]
    async fn test_create_rejects_owned_keyspace() {
        let store: Arc<dyn MetaStore> = Arc::new(MemStore::new());
        let manager = manager(&store).await;
        manager.create(group(1, vec![111, 222, 333])).await.unwrap();
        wait_catalog(&manager, |m| m.cached_group(1).is_some()).await;

        let err = manager.create(group(2, vec![222])).await.unwrap_err();
        assert_that!(matches!(err, KeyspaceError::KeyspaceOwned { keyspace: 222, group: 1 })).is_true();
        let err = manager.create(group(1, vec![999])).await.unwrap_err();
        assert_that!(matches!(err, KeyspaceError::GroupExists(1))).is_true();
    }

    #[tokio::test]
    async fn test_split_moves_keyspaces() {
        let store: Arc<dyn MetaStore> = Arc::new(MemStore::new());
        let manager = manager(&store).await;
        manager.create(group(1, vec![111, 222, 333])).await.unwrap();
        wait_catalog(&manager, |m| m.cached_group(1).is_some()).await;

        manager.split(1, 2, vec![222, 333]).await.unwrap();
        let source = manager.group(1).await.unwrap();
        let target = manager.group(2).await.unwrap();
        assert_that!(source.keyspaces).is_equal_to(vec![111]);
        assert_that!(target.keyspaces).is_equal_to(vec![222, 333]);
        assert_that!(source.in_split_state()).is_true();
        assert_that!(target.in_split_state()).is_true();

        // Another split of either half is rejected while the first one is
        // still pending.
        let err = manager.split(1, 3, vec![111]).await.unwrap_err();
        assert_that!(matches!(err, KeyspaceError::GroupBusy(1))).is_true();

        // Moved keyspaces route to the source until the split finishes.
        wait_catalog(&manager, |m| m.cached_group(2).map(|g| !g.keyspaces.is_empty()).unwrap_or(false)).await;
        assert_that!(manager.group_for_keyspace(222)).is_equal_to(1);

        manager.finish_split(2).await.unwrap();
        let source = manager.group(1).await.unwrap();
        let target = manager.group(2).await.unwrap();
        assert_that!(source.in_split_state()).is_false();
        assert_that!(target.in_split_state()).is_false();
        wait_catalog(&manager, |m| m.cached_group(2).map(|g| !g.in_split_state()).unwrap_or(false)).await;
        assert_that!(manager.group_for_keyspace(222)).is_equal_to(2);

        // Finishing again changes nothing.
        manager.finish_split(2).await.unwrap();
        assert_that!(manager.group(2).await.unwrap()).is_equal_to(target);
    }

    #[tokio::test]
    async fn test_split_beyond_txn_limit() {
        let store: Arc<dyn MetaStore> = Arc::new(MemStore::new());
        let manager = manager(&store).await;
        let keyspaces: Vec<u32> = (1..=129).collect();
        manager.assign_keyspaces(DEFAULT_KEYSPACE_GROUP_ID, keyspaces).await.unwrap();
        let default = manager.group(DEFAULT_KEYSPACE_GROUP_ID).await.unwrap();
        assert_that!(default.keyspaces.len()).is_equal_to(130);

        manager.split(0, 1, vec![2]).await.unwrap();
        manager.finish_split(1).await.unwrap();
        let groups = manager.groups(None).await.unwrap();
        assert_that!(groups.len()).is_equal_to(2);
        assert_that!(groups[0].id).is_equal_to(0);
        assert_that!(groups[1].id).is_equal_to(1);
        assert_that!(groups[1].keyspaces).is_equal_to(vec![2]);
    }

    #[tokio::test]
    async fn test_merge_after_split() {
        let store: Arc<dyn MetaStore> = Arc::new(MemStore::new());
        let manager = manager(&store).await;
        let keyspaces: Vec<u32> = (1..=129).collect();
        manager.assign_keyspaces(DEFAULT_KEYSPACE_GROUP_ID, keyspaces).await.unwrap();
        manager.split(0, 1, vec![2]).await.unwrap();
        manager.finish_split(1).await.unwrap();
        wait_catalog(&manager, |m| {
            m.cached_group(1).map(|g| !g.in_split_state()).unwrap_or(false)
                && m.cached_group(0).map(|g| !g.in_split_state()).unwrap_or(false)
        })
        .await;

        manager.merge(0, vec![1]).await.unwrap();
        let target = manager.group(0).await.unwrap();
        assert_that!(target.in_merge_state()).is_true();
        assert_that!(target.keyspaces.len()).is_equal_to(130);

        manager.finish_merge(0).await.unwrap();
        let target = manager.group(0).await.unwrap();
        assert_that!(target.in_merge_state()).is_false();
        assert_that!(target.keyspaces.len()).is_equal_to(130);
        assert_that!(manager.group(1).await.is_err()).is_true();

        // Finishing again changes nothing.
        manager.finish_merge(0).await.unwrap();
    }

    #[tokio::test]
    async fn test_set_nodes_and_priority() {
        let store: Arc<dyn MetaStore> = Arc::new(MemStore::new());
        let s1 = "http://127.0.0.1:3379";
        let s2 = "http://127.0.0.1:3380";
        let _lease1 = crate::cluster::register_tso_node(&store, s1).await.unwrap();
        let manager = manager(&store).await;
        let lease2 = crate::cluster::register_tso_node(&store, s2).await.unwrap();
        wait_catalog(&manager, |m| m.registered_nodes().len() == 2).await;

        manager.set_nodes(0, vec![s1.to_string(), s2.to_string()]).await.unwrap();
        manager.set_priority(0, s1, 200).await.unwrap();
        let group = manager.group(0).await.unwrap();
        assert_that!(group.members.len()).is_equal_to(2);
        assert_that!(group.member(s1).unwrap().priority).is_equal_to(200);
        assert_that!(group.member(s2).unwrap().priority).is_equal_to(0);

        // Priorities of retained members survive set-node.
        manager.set_nodes(0, vec![s2.to_string(), s1.to_string()]).await.unwrap();
        let group = manager.group(0).await.unwrap();
        assert_that!(group.member(s1).unwrap().priority).is_equal_to(200);

        let err = manager.set_nodes(0, vec![s1.to_string()]).await.unwrap_err();
        assert_that!(err.to_string()).is_equal_to("invalid num of nodes".to_string());
        let err = manager.set_nodes(0, vec![s1.to_string(), String::new()]).await.unwrap_err();
        assert_that!(err.to_string()).is_equal_to("Failed to parse the tso node address".to_string());
        let err = manager.set_nodes(0, vec![s1.to_string(), "http://pingcap.com".to_string()]).await.unwrap_err();
        assert_that!(err.to_string()).is_equal_to("node does not exist".to_string());
        let err = manager.set_priority(0, "http://unknown:1", 1).await.unwrap_err();
        assert_that!(err.to_string()).is_equal_to("node does not exist".to_string());

        drop(lease2);
    }
}
