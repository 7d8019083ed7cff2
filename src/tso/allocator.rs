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

//! Monotonic timestamp allocation for one keyspace group and DC location,
//! anchored in the metadata store.
//!
//! The oracle persists a high-water physical time with a lookahead window.
//! Every issued timestamp stays strictly below that saved ceiling, so a
//! successor primary reading it starts above everything its predecessor
//! could have handed out.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use spin::Mutex;
use static_assertions::assert_impl_all;
use thiserror::Error;

use crate::mds::{MetaCompare, MetaOp, MetaStore, MetaTxn};
use crate::timestamp::{self, Timestamp, MAX_LOGICAL};

pub const DEFAULT_SAVE_INTERVAL: Duration = Duration::from_secs(3);
pub const DEFAULT_UPDATE_PHYSICAL_INTERVAL: Duration = Duration::from_millis(50);

/// Resync this many milliseconds before the saved window runs out.
const SAVE_GUARD_MS: i64 = 1_000;

/// Wall-clock gap treated as a clock jump.
const JUMP_THRESHOLD_MS: i64 = 1_000;

const LOGICAL_FULL_RETRIES: usize = 3;
const LOGICAL_FULL_WAIT: Duration = Duration::from_micros(500);

pub fn timestamp_key(group: u32, dc: &str) -> String {
    format!("/tso/{group}/{dc}/timestamp")
}

#[derive(Debug, Error)]
pub enum TsoError {
    #[error("not primary of keyspace group {group} in dc {dc}")]
    NotPrimary { group: u32, dc: String },
    #[error("timestamp oracle unsynced: {message}")]
    Unsynced { message: String },
    #[error("invalid timestamp count {count}")]
    InvalidCount { count: u32 },
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

#[derive(Default)]
struct OracleState {
    /// High-water physical time persisted in the metadata store. Issued
    /// physical time never reaches it.
    last_saved: i64,
    physical: i64,
    logical: i64,
    synced: bool,
}

pub struct TimestampOracle {
    store: Arc<dyn MetaStore>,
    group: u32,
    dc: String,
    key: Vec<u8>,
    guard_key: Vec<u8>,
    guard_value: Vec<u8>,
    suffix_bits: u32,
    save_interval: Duration,
    serving: AtomicBool,
    state: Mutex<OracleState>,
}

assert_impl_all!(TimestampOracle: Send, Sync);

impl TimestampOracle {
    /// `guard_key`/`guard_value` is the primary election record; every save
    /// is fenced on it so a deposed primary cannot move the ceiling.
    pub fn new(
        store: Arc<dyn MetaStore>,
        group: u32,
        dc: impl Into<String>,
        guard_key: Vec<u8>,
        guard_value: Vec<u8>,
        suffix_bits: u32,
    ) -> Self {
        let dc = dc.into();
        Self {
            key: timestamp_key(group, &dc).into_bytes(),
            store,
            group,
            dc,
            guard_key,
            guard_value,
            suffix_bits,
            save_interval: DEFAULT_SAVE_INTERVAL,
            serving: AtomicBool::new(false),
            state: Mutex::new(OracleState::default()),
        }
    }

    pub fn group(&self) -> u32 {
        self.group
    }

    pub fn dc(&self) -> &str {
        &self.dc
    }

    pub fn is_serving(&self) -> bool {
        self.serving.load(Ordering::Acquire)
    }

    /// Runs on primary acquisition: anchors the oracle above the previous
    /// primary's saved ceiling and opens issuance.
    pub async fn initialize(&self) -> anyhow::Result<()> {
        self.sync().await?;
        self.serving.store(true, Ordering::Release);
        Ok(())
    }

    pub fn stop_serving(&self) {
        self.serving.store(false, Ordering::Release);
        let mut state = self.state.lock();
        state.synced = false;
    }

    /// Extends the saved ceiling: `max(now, stored) + save_interval`,
    /// fenced on the primary record and on the stored revision.
    pub async fn sync(&self) -> anyhow::Result<()> {
        let now = timestamp::now_millis();
        let saved = self.store.get(&self.key).await?;
        let (stored, compare) = match &saved {
            None => (0, MetaCompare::Missing(self.key.clone())),
            Some(kv) => {
                let bytes: [u8; 8] =
                    kv.value.as_slice().try_into().map_err(|_| anyhow::anyhow!("malformed saved timestamp"))?;
                (i64::from_be_bytes(bytes), MetaCompare::ModRevision(self.key.clone(), kv.mod_revision))
            },
        };
        let target = now.max(stored) + self.save_interval.as_millis() as i64;
        let txn = MetaTxn::new()
            .when([compare, MetaCompare::ValueEquals(self.guard_key.clone(), self.guard_value.clone())])
            .and_then([MetaOp::put(self.key.clone(), target.to_be_bytes(), None)]);
        let response = self.store.txn(txn).await?;
        if !response.succeeded {
            bail!("lost saved-timestamp race for group {} dc {}", self.group, self.dc);
        }
        let mut state = self.state.lock();
        state.last_saved = target;
        if !state.synced {
            // Fresh acquisition: start strictly above whatever the previous
            // primary could have issued below `stored`.
            state.physical = now.max(stored);
            state.logical = 0;
            state.synced = true;
        }
        Ok(())
    }

    /// Periodic physical-clock maintenance. Resyncs ahead of window
    /// exhaustion; a failed resync stops issuance until one succeeds.
    pub async fn update_physical(&self) {
        let now = timestamp::now_millis();
        let need_sync = {
            let mut state = self.state.lock();
            if now.saturating_sub(state.physical) > JUMP_THRESHOLD_MS {
                tracing::warn!(
                    "physical clock jumps from {} to {} for group {} dc {}",
                    state.physical,
                    now,
                    self.group,
                    self.dc
                );
                state.physical = now;
                state.logical = 0;
            } else if now > state.physical {
                state.physical = now;
            }
            !state.synced || state.physical >= state.last_saved - SAVE_GUARD_MS
        };
        if need_sync {
            if let Err(err) = self.sync().await {
                tracing::error!("sync failed for group {} dc {}, issuance stops: {:?}", self.group, self.dc, err);
                self.state.lock().synced = false;
            }
        }
    }

    /// Hands out a batch of `count` consecutive logical ids ending at the
    /// returned timestamp.
    pub async fn get_timestamp(&self, count: u32) -> Result<Timestamp, TsoError> {
        if count == 0 {
            return Err(TsoError::InvalidCount { count });
        }
        if !self.is_serving() {
            return Err(TsoError::NotPrimary { group: self.group, dc: self.dc.clone() });
        }
        let count = i64::from(count);
        for attempt in 0..=LOGICAL_FULL_RETRIES {
            {
                let mut state = self.state.lock();
                if !state.synced {
                    return Err(TsoError::Unsynced { message: "awaiting successful sync".to_string() });
                }
                if state.physical >= state.last_saved {
                    return Err(TsoError::Unsynced { message: "saved timestamp window exhausted".to_string() });
                }
                if state.logical + count < MAX_LOGICAL {
                    state.logical += count;
                    return Ok(Timestamp {
                        physical: state.physical,
                        logical: state.logical,
                        suffix_bits: self.suffix_bits,
                    });
                }
                if attempt == LOGICAL_FULL_RETRIES {
                    // Logical space stays full; borrow the next millisecond.
                    if state.physical + 1 >= state.last_saved {
                        return Err(TsoError::Unsynced { message: "saved timestamp window exhausted".to_string() });
                    }
                    state.physical += 1;
                    state.logical = count;
                    return Ok(Timestamp {
                        physical: state.physical,
                        logical: state.logical,
                        suffix_bits: self.suffix_bits,
                    });
                }
            }
            tokio::time::sleep(LOGICAL_FULL_WAIT).await;
        }
        unreachable!("logical overflow loop always returns")
    }
}

#[cfg(test)]
mod tests {
    use assertor::*;

    use super::*;
    use crate::mds::MemStore;
    use crate::timestamp::first_in_batch;

    fn oracle(store: &Arc<dyn MetaStore>) -> TimestampOracle {
        TimestampOracle::new(store.clone(), 0, "global", b"/tso/0/global/primary".to_vec(), b"me".to_vec(), 0)
    }

    async fn seed_guard(store: &Arc<dyn MetaStore>) {
        store.put(b"/tso/0/global/primary".to_vec(), b"me".to_vec(), None).await.unwrap();
    }

    #[tokio::test]
    async fn test_not_primary_until_initialized() {
        let store: Arc<dyn MetaStore> = Arc::new(MemStore::new());
        seed_guard(&store).await;
        let oracle = oracle(&store);
        assert_that!(matches!(oracle.get_timestamp(1).await, Err(TsoError::NotPrimary { .. }))).is_true();

        oracle.initialize().await.unwrap();
        let ts = oracle.get_timestamp(1).await.unwrap();
        assert_that!(ts.physical).is_greater_than(0);

        oracle.stop_serving();
        assert_that!(matches!(oracle.get_timestamp(1).await, Err(TsoError::NotPrimary { .. }))).is_true();
    }

    #[tokio::test]
    async fn test_batches_are_monotonic() {
        let store: Arc<dyn MetaStore> = Arc::new(MemStore::new());
        seed_guard(&store).await;
        let oracle = oracle(&store);
        oracle.initialize().await.unwrap();

        let mut last = oracle.get_timestamp(1).await.unwrap();
        for count in [1u32, 7, 100, 1] {
            let ts = oracle.get_timestamp(count).await.unwrap();
            let first = first_in_batch(&ts, count);
            assert_that!(timestamp::ts_less_eq(ts.physical, first, last.physical, last.logical)).is_false();
            last = ts;
        }
    }

    #[tokio::test]
    async fn test_logical_overflow_borrows_millisecond() {
        let store: Arc<dyn MetaStore> = Arc::new(MemStore::new());
        seed_guard(&store).await;
        let oracle = oracle(&store);
        oracle.initialize().await.unwrap();

        let before = oracle.get_timestamp(1).await.unwrap();
        {
            let mut state = oracle.state.lock();
            state.logical = MAX_LOGICAL - 1;
        }
        let ts = oracle.get_timestamp(2).await.unwrap();
        assert_that!(ts.physical).is_greater_than(before.physical);
        assert_that!(ts.logical).is_equal_to(2);
    }

    #[tokio::test]
    async fn test_rejects_zero_count() {
        let store: Arc<dyn MetaStore> = Arc::new(MemStore::new());
        seed_guard(&store).await;
        let oracle = oracle(&store);
        oracle.initialize().await.unwrap();
        assert_that!(matches!(oracle.get_timestamp(0).await, Err(TsoError::InvalidCount { .. }))).is_true();
    }

    #[tokio::test]
    async fn test_fail_stop_when_guard_lost() {
        let store: Arc<dyn MetaStore> = Arc::new(MemStore::new());
        seed_guard(&store).await;
        let oracle = oracle(&store);
        oracle.initialize().await.unwrap();

        // A new primary took over the election record; the next sync must
        // fail and issuance must stop rather than regress.
        store.put(b"/tso/0/global/primary".to_vec(), b"other".to_vec(), None).await.unwrap();
        assert_that!(oracle.sync().await.is_err()).is_true();
        oracle.state.lock().synced = false;
        assert_that!(matches!(oracle.get_timestamp(1).await, Err(TsoError::Unsynced { .. }))).is_true();
    }

    #[tokio::test]
    async fn test_successor_starts_above_predecessor() {
        let store: Arc<dyn MetaStore> = Arc::new(MemStore::new());
        seed_guard(&store).await;
        let first = oracle(&store);
        first.initialize().await.unwrap();
        let issued = first.get_timestamp(10).await.unwrap();
        first.stop_serving();

        let second = oracle(&store);
        second.initialize().await.unwrap();
        let resumed = second.get_timestamp(1).await.unwrap();
        let first_id = first_in_batch(&resumed, 1);
        assert_that!(timestamp::ts_less_eq(resumed.physical, first_id, issued.physical, issued.logical)).is_false();
    }
}
