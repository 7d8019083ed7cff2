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

//! In-process metadata store with the same revision, lease and watch
//! semantics as the replicated one. Backs tests and `memory://` deployments.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use ignore_result::Ignore;
use tokio::sync::{mpsc, watch};

use super::{
    prefix_end,
    EventBatch,
    LeaseId,
    MetaCompare,
    MetaEvent,
    MetaKeyValue,
    MetaLease,
    MetaOp,
    MetaStore,
    MetaTxn,
    MetaTxnResponse,
    MetaTxnResult,
    MetaWatcher,
    RangeResult,
    Revision,
};
use crate::utils;

#[derive(Clone, Default)]
pub struct MemStore {
    state: Arc<State>,
}

#[derive(Default)]
struct State {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    revision: Revision,
    keys: BTreeMap<Vec<u8>, Entry>,
    history: Vec<EventBatch>,
    watchers: Vec<StoreWatcher>,
    leases: HashMap<LeaseId, LeaseEntry>,
    next_lease: LeaseId,
}

#[derive(Clone)]
struct Entry {
    value: Vec<u8>,
    mod_revision: Revision,
    lease: LeaseId,
}

struct StoreWatcher {
    prefix: Vec<u8>,
    sender: mpsc::UnboundedSender<EventBatch>,
}

struct LeaseEntry {
    keys: HashSet<Vec<u8>>,
    lost: watch::Sender<bool>,
}

impl Inner {
    fn evaluate(&self, compare: &MetaCompare) -> bool {
        match compare {
            MetaCompare::Missing(key) => !self.keys.contains_key(key),
            MetaCompare::Exists(key) => self.keys.contains_key(key),
            MetaCompare::ValueEquals(key, value) => {
                self.keys.get(key).map(|entry| entry.value == *value).unwrap_or(false)
            },
            MetaCompare::ModRevision(key, revision) => {
                self.keys.get(key).map(|entry| entry.mod_revision).unwrap_or(0) == *revision
            },
        }
    }

    fn put(&mut self, revision: Revision, key: Vec<u8>, value: Vec<u8>, lease: LeaseId, events: &mut Vec<MetaEvent>) {
        if let Some(old) = self.keys.get(&key) {
            if old.lease != 0 && old.lease != lease {
                if let Some(entry) = self.leases.get_mut(&old.lease) {
                    entry.keys.remove(&key);
                }
            }
        }
        if lease != 0 {
            if let Some(entry) = self.leases.get_mut(&lease) {
                entry.keys.insert(key.clone());
            }
        }
        self.keys.insert(key.clone(), Entry { value: value.clone(), mod_revision: revision, lease });
        events.push(MetaEvent::Put(MetaKeyValue { key, value, mod_revision: revision }));
    }

    fn delete(&mut self, revision: Revision, key: &[u8], events: &mut Vec<MetaEvent>) {
        let Some(entry) = self.keys.remove(key) else {
            return;
        };
        if entry.lease != 0 {
            if let Some(lease) = self.leases.get_mut(&entry.lease) {
                lease.keys.remove(key);
            }
        }
        events.push(MetaEvent::Delete(MetaKeyValue {
            key: key.to_vec(),
            value: entry.value,
            mod_revision: revision,
        }));
    }

    fn publish(&mut self, events: Vec<MetaEvent>) {
        if events.is_empty() {
            return;
        }
        let batch = EventBatch { events, revision: self.revision, compact_revision: None };
        self.history.push(batch.clone());
        self.watchers.retain(|watcher| {
            let matched: Vec<_> =
                batch.events.iter().filter(|event| event.key().starts_with(&watcher.prefix)).cloned().collect();
            if matched.is_empty() {
                !watcher.sender.is_closed()
            } else {
                let filtered = EventBatch { events: matched, revision: batch.revision, compact_revision: None };
                watcher.sender.send(filtered).is_ok()
            }
        });
    }

    fn check_lease(&self, lease: Option<LeaseId>) -> Result<LeaseId> {
        match lease {
            None => Ok(0),
            Some(id) => match self.leases.contains_key(&id) {
                true => Ok(id),
                false => Err(anyhow!("lease {id} not found")),
            },
        }
    }
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn revoke(state: &State, lease_id: LeaseId) {
        let mut inner = state.inner.lock().unwrap();
        let Some(lease) = inner.leases.remove(&lease_id) else {
            return;
        };
        lease.lost.send(true).ignore();
        if lease.keys.is_empty() {
            return;
        }
        inner.revision += 1;
        let revision = inner.revision;
        let mut events = Vec::with_capacity(lease.keys.len());
        for key in lease.keys {
            inner.delete(revision, &key, &mut events);
        }
        inner.publish(events);
    }
}

#[async_trait]
impl MetaStore for MemStore {
    async fn get(&self, key: &[u8]) -> Result<Option<MetaKeyValue>> {
        let inner = self.state.inner.lock().unwrap();
        Ok(inner.keys.get(key).map(|entry| MetaKeyValue {
            key: key.to_vec(),
            value: entry.value.clone(),
            mod_revision: entry.mod_revision,
        }))
    }

    async fn range(&self, prefix: &[u8], from: &[u8], limit: i64) -> Result<RangeResult> {
        let inner = self.state.inner.lock().unwrap();
        let end = prefix_end(prefix);
        let start = from.max(prefix).to_vec();
        if start >= end {
            return Ok(RangeResult { kvs: Vec::new(), more: false, revision: inner.revision });
        }
        let mut kvs = Vec::new();
        let mut more = false;
        for (key, entry) in inner.keys.range(start..end) {
            if limit > 0 && kvs.len() >= limit as usize {
                more = true;
                break;
            }
            kvs.push(MetaKeyValue { key: key.clone(), value: entry.value.clone(), mod_revision: entry.mod_revision });
        }
        Ok(RangeResult { kvs, more, revision: inner.revision })
    }

    async fn put(&self, key: Vec<u8>, value: Vec<u8>, lease: Option<LeaseId>) -> Result<Revision> {
        let mut inner = self.state.inner.lock().unwrap();
        let lease = inner.check_lease(lease)?;
        inner.revision += 1;
        let revision = inner.revision;
        let mut events = Vec::with_capacity(1);
        inner.put(revision, key, value, lease, &mut events);
        inner.publish(events);
        Ok(revision)
    }

    async fn delete(&self, key: &[u8]) -> Result<Revision> {
        let mut inner = self.state.inner.lock().unwrap();
        if !inner.keys.contains_key(key) {
            return Ok(inner.revision);
        }
        inner.revision += 1;
        let revision = inner.revision;
        let mut events = Vec::with_capacity(1);
        inner.delete(revision, key, &mut events);
        inner.publish(events);
        Ok(revision)
    }

    async fn txn(&self, txn: MetaTxn) -> Result<MetaTxnResponse> {
        let mut inner = self.state.inner.lock().unwrap();
        let succeeded = txn.compares.iter().all(|compare| inner.evaluate(compare));
        let ops = if succeeded { txn.success } else { txn.failure };
        let writes = ops.iter().any(|op| !matches!(op, MetaOp::Get { .. }));
        if writes {
            inner.revision += 1;
        }
        let revision = inner.revision;
        let mut events = Vec::new();
        let mut results = Vec::with_capacity(ops.len());
        for op in ops {
            match op {
                MetaOp::Put { key, value, lease } => {
                    let lease = inner.check_lease(lease)?;
                    inner.put(revision, key, value, lease, &mut events);
                    results.push(MetaTxnResult::Put);
                },
                MetaOp::Delete { key } => {
                    inner.delete(revision, &key, &mut events);
                    results.push(MetaTxnResult::Delete);
                },
                MetaOp::Get { key } => {
                    let kv = inner.keys.get(&key).map(|entry| MetaKeyValue {
                        key: key.clone(),
                        value: entry.value.clone(),
                        mod_revision: entry.mod_revision,
                    });
                    results.push(MetaTxnResult::Get(kv));
                },
            }
        }
        inner.publish(events);
        Ok(MetaTxnResponse { succeeded, revision, results })
    }

    async fn grant(&self, ttl: Duration) -> Result<MetaLease> {
        let (lost_sender, lost) = watch::channel(false);
        let lease_id = {
            let mut inner = self.state.inner.lock().unwrap();
            inner.next_lease += 1;
            let lease_id = inner.next_lease;
            inner.leases.insert(lease_id, LeaseEntry { keys: HashSet::new(), lost: lost_sender });
            lease_id
        };
        let (retirer, mut retirement) = utils::retirement("lease");
        let state = self.state.clone();
        tokio::spawn(async move {
            retirement.retired().await;
            MemStore::revoke(&state, lease_id);
        });
        Ok(MetaLease::new(lease_id, ttl, lost, retirer))
    }

    async fn watch(&self, prefix: &[u8], from_revision: Revision) -> Result<MetaWatcher> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut inner = self.state.inner.lock().unwrap();
        if from_revision > 0 {
            for batch in inner.history.iter().filter(|batch| batch.revision >= from_revision) {
                let matched: Vec<_> =
                    batch.events.iter().filter(|event| event.key().starts_with(prefix)).cloned().collect();
                if !matched.is_empty() {
                    let filtered =
                        EventBatch { events: matched, revision: batch.revision, compact_revision: None };
                    sender.send(filtered).ignore();
                }
            }
        }
        inner.watchers.push(StoreWatcher { prefix: prefix.to_vec(), sender });
        let (retirer, _) = utils::retirement("mds-watch");
        Ok(MetaWatcher::new(receiver, retirer))
    }
}

#[cfg(test)]
mod tests {
    use assertor::*;

    use super::*;

    #[tokio::test]
    async fn test_put_get_delete() {
        let store = MemStore::new();
        let r1 = store.put(b"/a".to_vec(), b"1".to_vec(), None).await.unwrap();
        let kv = store.get(b"/a").await.unwrap().unwrap();
        assert_that!(kv.value).is_equal_to(b"1".to_vec());
        assert_that!(kv.mod_revision).is_equal_to(r1);

        let r2 = store.put(b"/a".to_vec(), b"2".to_vec(), None).await.unwrap();
        assert_that!(r2).is_greater_than(r1);

        store.delete(b"/a").await.unwrap();
        assert_that!(store.get(b"/a").await.unwrap().is_none()).is_true();
    }

    #[tokio::test]
    async fn test_range_pagination() {
        let store = MemStore::new();
        for i in 0..5 {
            store.put(format!("/k/{i}").into_bytes(), vec![i], None).await.unwrap();
        }
        store.put(b"/other".to_vec(), b"x".to_vec(), None).await.unwrap();

        let page = store.range(b"/k/", b"/k/", 2).await.unwrap();
        assert_that!(page.kvs.len()).is_equal_to(2);
        assert_that!(page.more).is_true();

        let next = super::super::next_key(&page.kvs.last().unwrap().key);
        let rest = store.range(b"/k/", &next, 10).await.unwrap();
        assert_that!(rest.kvs.len()).is_equal_to(3);
        assert_that!(rest.more).is_false();
    }

    #[tokio::test]
    async fn test_txn_compare() {
        let store = MemStore::new();
        let txn = MetaTxn::new()
            .when([MetaCompare::Missing(b"/a".to_vec())])
            .and_then([MetaOp::put(b"/a", b"1", None)])
            .or_else([MetaOp::get(b"/a")]);
        let response = store.txn(txn.clone()).await.unwrap();
        assert_that!(response.succeeded).is_true();

        let response = store.txn(txn).await.unwrap();
        assert_that!(response.succeeded).is_false();
        let kv = response.take_get().unwrap();
        assert_that!(kv.value).is_equal_to(b"1".to_vec());
    }

    #[tokio::test]
    async fn test_watch_replay_and_live() {
        let store = MemStore::new();
        let r1 = store.put(b"/w/a".to_vec(), b"1".to_vec(), None).await.unwrap();
        let mut watcher = store.watch(b"/w/", r1).await.unwrap();

        let batch = watcher.message().await.unwrap();
        assert_that!(batch.revision).is_equal_to(r1);
        assert_that!(batch.events.len()).is_equal_to(1);

        store.put(b"/w/b".to_vec(), b"2".to_vec(), None).await.unwrap();
        store.put(b"/x/c".to_vec(), b"3".to_vec(), None).await.unwrap();
        let batch = watcher.message().await.unwrap();
        match &batch.events[0] {
            MetaEvent::Put(kv) => assert_that!(kv.key).is_equal_to(b"/w/b".to_vec()),
            event => panic!("unexpected event {event:?}"),
        }
    }

    #[tokio::test]
    async fn test_lease_revoked_on_drop() {
        let store = MemStore::new();
        let mut lease = store.grant(Duration::from_secs(5)).await.unwrap();
        store.put(b"/leased".to_vec(), b"v".to_vec(), Some(lease.id())).await.unwrap();

        let mut watcher = store.watch(b"/leased", 0).await.unwrap();
        let lost = tokio::spawn(async move {
            lease.lost().await;
        });
        MemStore::revoke(&store.state, 1);
        lost.await.unwrap();

        let batch = watcher.message().await.unwrap();
        assert_that!(matches!(batch.events[0], MetaEvent::Delete(_))).is_true();
        assert_that!(store.get(b"/leased").await.unwrap().is_none()).is_true();
    }
}
