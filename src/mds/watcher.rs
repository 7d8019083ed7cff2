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

//! Snapshot-then-watch primitive keeping an in-memory cache consistent with
//! a metadata store prefix.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Result};
use ignore_result::Ignore;
use tokio::select;
use tokio::sync::{mpsc, oneshot};

use super::{next_key, MetaEvent, MetaKeyValue, MetaStore, Revision};
use crate::utils::{self, Retirement};

const DEFAULT_LOAD_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_LOAD_RETRY_INTERVAL: Duration = Duration::from_millis(200);
const DEFAULT_LOAD_RETRY_TIMES: usize = 150;
const DEFAULT_LOAD_BATCH_SIZE: i64 = 400;
const DEFAULT_WATCH_RETRY_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_FORCE_LOAD_MIN_INTERVAL: Duration = Duration::from_millis(200);

pub type EventFn = Box<dyn FnMut(MetaKeyValue) -> Result<()> + Send>;
pub type PostEventFn = Box<dyn FnMut() -> Result<()> + Send>;

/// Loads a key prefix and then follows it through watches.
///
/// Every put and delete under the prefix is delivered exactly once per
/// revision per session; a reload starts a new session. `post_event` runs
/// after each applied batch. Transient failures are retried internally and
/// surface only through the initial-load signal.
pub struct LoopWatcher {
    name: String,
    store: Arc<dyn MetaStore>,
    prefix: Vec<u8>,
    on_put: EventFn,
    on_delete: EventFn,
    post_event: PostEventFn,
    load_timeout: Duration,
    load_retry_interval: Duration,
    load_retry_times: usize,
    load_batch_size: i64,
    watch_retry_interval: Duration,
}

impl LoopWatcher {
    pub fn new(
        name: impl Into<String>,
        store: Arc<dyn MetaStore>,
        prefix: impl Into<Vec<u8>>,
        on_put: EventFn,
        on_delete: EventFn,
        post_event: PostEventFn,
    ) -> Self {
        Self {
            name: name.into(),
            store,
            prefix: prefix.into(),
            on_put,
            on_delete,
            post_event,
            load_timeout: DEFAULT_LOAD_TIMEOUT,
            load_retry_interval: DEFAULT_LOAD_RETRY_INTERVAL,
            load_retry_times: DEFAULT_LOAD_RETRY_TIMES,
            load_batch_size: DEFAULT_LOAD_BATCH_SIZE,
            watch_retry_interval: DEFAULT_WATCH_RETRY_INTERVAL,
        }
    }

    pub fn with_load_retry(mut self, times: usize, interval: Duration) -> Self {
        self.load_retry_times = times;
        self.load_retry_interval = interval;
        self
    }

    pub fn with_load_batch_size(mut self, size: i64) -> Self {
        self.load_batch_size = size;
        self
    }

    pub fn start(self) -> WatcherHandle {
        let (loaded_sender, loaded) = oneshot::channel();
        let (force_sender, force_receiver) = mpsc::channel(1);
        let (retirer, retirement) = utils::retirement("watch-loop");
        let force = Arc::new(ForceLoad { slot: force_sender, last: Mutex::new(Instant::now()) });
        tokio::spawn(self.run(loaded_sender, force_receiver, retirement));
        WatcherHandle { loaded: Some(loaded), force, _retirer: retirer }
    }

    async fn run(
        mut self,
        loaded: oneshot::Sender<Result<()>>,
        mut force: mpsc::Receiver<()>,
        mut retirement: Retirement,
    ) {
        let mut revision = select! {
            _ = retirement.retired() => return,
            revision = self.initial_load(loaded) => revision,
        };
        tracing::info!("watch loop started: {} {:?}", self.name, String::from_utf8_lossy(&self.prefix));
        loop {
            let result = select! {
                _ = retirement.retired() => return,
                result = self.watch(&mut revision, &mut force) => result,
            };
            match result {
                // Compacted; resume immediately from the compact revision.
                Ok(()) => continue,
                Err(err) => {
                    tracing::warn!(
                        "watch loop canceled, retry in {:?}: {} {:?}: {:?}",
                        self.watch_retry_interval,
                        self.name,
                        String::from_utf8_lossy(&self.prefix),
                        err
                    );
                    select! {
                        _ = retirement.retired() => return,
                        _ = tokio::time::sleep(self.watch_retry_interval) => {},
                    }
                },
            }
        }
    }

    async fn initial_load(&mut self, loaded: oneshot::Sender<Result<()>>) -> Revision {
        let deadline = Instant::now() + self.load_timeout;
        let mut revision = 0;
        let mut result = Ok(());
        for _ in 0..self.load_retry_times {
            match self.load().await {
                Ok(next) => {
                    revision = next;
                    result = Ok(());
                    break;
                },
                Err(err) => {
                    if Instant::now() >= deadline {
                        result = Err(err.context("load timed out"));
                        break;
                    }
                    result = Err(err);
                },
            }
            tokio::time::sleep(self.load_retry_interval).await;
        }
        match &result {
            Ok(()) => tracing::info!("load finished in watch loop: {}", self.name),
            Err(err) => tracing::warn!("load failed in watch loop: {}: {:?}", self.name, err),
        }
        loaded.send(result).ignore();
        revision
    }

    /// One paginated snapshot pass. Returns the revision to watch from.
    async fn load(&mut self) -> Result<Revision> {
        let mut start = self.prefix.clone();
        loop {
            let result = self.store.range(&self.prefix, &start, self.load_batch_size).await?;
            for kv in result.kvs.iter() {
                if let Err(err) = (self.on_put)(kv.clone()) {
                    tracing::error!("put failed in watch loop when loading: {}: {:?}", self.name, err);
                }
            }
            if !result.more {
                if let Err(err) = (self.post_event)() {
                    tracing::error!("post event failed in watch loop: {}: {:?}", self.name, err);
                }
                return Ok(result.revision + 1);
            }
            let last = result.kvs.last().ok_or_else(|| anyhow!("more data but empty page"))?;
            start = next_key(&last.key);
        }
    }

    async fn watch(&mut self, revision: &mut Revision, force: &mut mpsc::Receiver<()>) -> Result<()> {
        let mut watcher = self.store.watch(&self.prefix, *revision).await?;
        loop {
            select! {
                Some(_) = force.recv() => {
                    match self.load().await {
                        Ok(next) => {
                            *revision = next;
                            // Session restarted; watch from the fresh snapshot.
                            return Ok(());
                        },
                        Err(err) => {
                            tracing::warn!("force load failed in watch loop: {}: {:?}", self.name, err);
                        },
                    }
                },
                message = watcher.message() => {
                    let Some(batch) = message else {
                        bail!("watch stream closed");
                    };
                    if let Some(compacted) = batch.compact_revision {
                        tracing::warn!(
                            "revision {} compacted to {} in watch loop: {}",
                            revision,
                            compacted,
                            self.name
                        );
                        *revision = compacted;
                        return Ok(());
                    }
                    for event in batch.events {
                        let result = match event {
                            MetaEvent::Put(kv) => (self.on_put)(kv),
                            MetaEvent::Delete(kv) => (self.on_delete)(kv),
                        };
                        if let Err(err) = result {
                            tracing::error!("event failed in watch loop: {}: {:?}", self.name, err);
                        }
                    }
                    if let Err(err) = (self.post_event)() {
                        tracing::error!("post event failed in watch loop: {}: {:?}", self.name, err);
                    }
                    *revision = batch.revision + 1;
                },
            }
        }
    }
}

struct ForceLoad {
    slot: mpsc::Sender<()>,
    last: Mutex<Instant>,
}

pub struct WatcherHandle {
    loaded: Option<oneshot::Receiver<Result<()>>>,
    force: Arc<ForceLoad>,
    _retirer: utils::Retirer,
}

impl WatcherHandle {
    /// Waits for the initial snapshot, reporting its error if any. Later
    /// calls return immediately.
    pub async fn wait_load(&mut self) -> Result<()> {
        match self.loaded.take() {
            None => Ok(()),
            Some(loaded) => loaded.await.unwrap_or_else(|_| Err(anyhow!("watch loop gone before load"))),
        }
    }

    /// Requests a fresh snapshot. Requests are coalesced and rate limited;
    /// bursts after a primary change collapse into one reload.
    pub fn force_load(&self) {
        {
            let mut last = self.force.last.lock().unwrap();
            if last.elapsed() < DEFAULT_FORCE_LOAD_MIN_INTERVAL {
                return;
            }
            *last = Instant::now();
        }
        self.force.slot.try_send(()).ignore();
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::{Arc, Mutex};

    use assertor::*;

    use super::*;
    use crate::mds::{MemStore, MetaStore};

    fn cache_watcher(
        store: Arc<dyn MetaStore>,
        prefix: &str,
        cache: Arc<Mutex<BTreeMap<Vec<u8>, Vec<u8>>>>,
        posts: Arc<Mutex<usize>>,
    ) -> LoopWatcher {
        let puts = cache.clone();
        let deletes = cache;
        LoopWatcher::new(
            "test",
            store,
            prefix.as_bytes().to_vec(),
            Box::new(move |kv| {
                puts.lock().unwrap().insert(kv.key, kv.value);
                Ok(())
            }),
            Box::new(move |kv| {
                deletes.lock().unwrap().remove(&kv.key);
                Ok(())
            }),
            Box::new(move || {
                *posts.lock().unwrap() += 1;
                Ok(())
            }),
        )
    }

    #[tokio::test]
    async fn test_load_then_watch() {
        let store = Arc::new(MemStore::new());
        for i in 0..10 {
            store.put(format!("/cache/{i:02}").into_bytes(), vec![i], None).await.unwrap();
        }

        let cache = Arc::new(Mutex::new(BTreeMap::new()));
        let posts = Arc::new(Mutex::new(0));
        let watcher = cache_watcher(store.clone(), "/cache/", cache.clone(), posts.clone())
            .with_load_batch_size(3);
        let mut handle = watcher.start();
        handle.wait_load().await.unwrap();
        assert_that!(cache.lock().unwrap().len()).is_equal_to(10);
        assert_that!(*posts.lock().unwrap()).is_equal_to(1);

        store.put(b"/cache/new".to_vec(), b"v".to_vec(), None).await.unwrap();
        store.delete(b"/cache/00").await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                {
                    let cache = cache.lock().unwrap();
                    if cache.len() == 10 && cache.contains_key(b"/cache/new".as_slice()) {
                        break;
                    }
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_force_load_coalesced() {
        let store = Arc::new(MemStore::new());
        store.put(b"/f/a".to_vec(), b"1".to_vec(), None).await.unwrap();

        let cache = Arc::new(Mutex::new(BTreeMap::new()));
        let posts = Arc::new(Mutex::new(0));
        let mut handle = cache_watcher(store.clone(), "/f/", cache.clone(), posts.clone()).start();
        handle.wait_load().await.unwrap();

        for _ in 0..100 {
            handle.force_load();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        // The burst collapses: at most the initial load plus one forced one.
        assert_that!(*posts.lock().unwrap()).is_at_most(2);
        assert_that!(cache.lock().unwrap().len()).is_equal_to(1);
    }
}
