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

//! Hybrid timestamp arithmetic: physical wall-clock milliseconds paired with
//! an 18-bit logical counter whose low `suffix_bits` distinguish per-DC
//! allocators.

use std::cmp::Ordering;
use std::time::{SystemTime, UNIX_EPOCH};

pub use crate::protos::Timestamp;

pub const MAX_LOGICAL_BITS: u32 = 18;
pub const MAX_LOGICAL: i64 = 1 << MAX_LOGICAL_BITS;
pub const MAX_SUFFIX_BITS: u32 = 4;

/// Wall clock in milliseconds since the unix epoch.
pub fn now_millis() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as i64
}

/// Advances a logical counter by `delta` allocation steps. One step spans
/// `1 << suffix_bits` raw logical ids.
pub fn add_logical(logical: i64, delta: i64, suffix_bits: u32) -> i64 {
    logical + (delta << suffix_bits)
}

/// Adds `delta` steps to a timestamp, carrying logical overflow into the
/// physical part.
pub fn add(ts: Timestamp, delta: i64, suffix_bits: u32) -> Timestamp {
    let logical = add_logical(ts.logical, delta, suffix_bits);
    Timestamp {
        physical: ts.physical + logical.div_euclid(MAX_LOGICAL),
        logical: logical.rem_euclid(MAX_LOGICAL),
        suffix_bits: ts.suffix_bits,
    }
}

fn aligned_logical(ts: &Timestamp) -> i64 {
    ts.logical << (MAX_SUFFIX_BITS - ts.suffix_bits.min(MAX_SUFFIX_BITS))
}

/// Total order over timestamps, aligning logical ids of allocators with
/// different suffix widths.
pub fn compare(a: &Timestamp, b: &Timestamp) -> Ordering {
    (a.physical, aligned_logical(a)).cmp(&(b.physical, aligned_logical(b)))
}

/// `(physical, logical) <= (other_physical, other_logical)` for timestamps
/// of the same allocator.
pub fn ts_less_eq(physical: i64, logical: i64, other_physical: i64, other_logical: i64) -> bool {
    (physical, logical) <= (other_physical, other_logical)
}

/// First logical id of a batch of `count` ids ending at `ts`.
pub fn first_in_batch(ts: &Timestamp, count: u32) -> i64 {
    add_logical(ts.logical, -i64::from(count) + 1, ts.suffix_bits)
}

/// Packs a timestamp into one ordered integer.
pub fn encode(ts: &Timestamp) -> u64 {
    ((ts.physical as u64) << MAX_LOGICAL_BITS) | (ts.logical as u64 & (MAX_LOGICAL as u64 - 1))
}

pub fn decode(ts: u64) -> Timestamp {
    Timestamp {
        physical: (ts >> MAX_LOGICAL_BITS) as i64,
        logical: (ts & (MAX_LOGICAL as u64 - 1)) as i64,
        suffix_bits: 0,
    }
}

#[cfg(test)]
mod tests {
    use assertor::*;

    use super::*;

    fn ts(physical: i64, logical: i64, suffix_bits: u32) -> Timestamp {
        Timestamp { physical, logical, suffix_bits }
    }

    #[test]
    fn test_add_logical() {
        assert_that!(add_logical(5, 3, 0)).is_equal_to(8);
        assert_that!(add_logical(5, 3, 2)).is_equal_to(17);
        assert_that!(add_logical(17, -3, 2)).is_equal_to(5);
    }

    #[test]
    fn test_add_carries_into_physical() {
        let near_full = ts(10, MAX_LOGICAL - 1, 0);
        let bumped = add(near_full, 2, 0);
        assert_that!(bumped.physical).is_equal_to(11);
        assert_that!(bumped.logical).is_equal_to(1);

        let back = add(bumped, -2, 0);
        assert_that!(back.physical).is_equal_to(10);
        assert_that!(back.logical).is_equal_to(MAX_LOGICAL - 1);
    }

    #[test]
    fn test_compare() {
        assert_that!(compare(&ts(1, 0, 0), &ts(2, 0, 0))).is_equal_to(std::cmp::Ordering::Less);
        assert_that!(compare(&ts(2, 5, 0), &ts(2, 6, 0))).is_equal_to(std::cmp::Ordering::Less);
        assert_that!(compare(&ts(2, 5, 0), &ts(2, 5, 0))).is_equal_to(std::cmp::Ordering::Equal);
        // A narrow-suffix logical id aligns above a wide-suffix one.
        assert_that!(compare(&ts(2, 1, 0), &ts(2, 1, MAX_SUFFIX_BITS))).is_equal_to(std::cmp::Ordering::Greater);
    }

    #[test]
    fn test_first_in_batch() {
        let last = ts(7, 10, 0);
        assert_that!(first_in_batch(&last, 4)).is_equal_to(7);
        let last = ts(7, 12, 2);
        assert_that!(first_in_batch(&last, 2)).is_equal_to(8);
    }

    #[test]
    fn test_encode_decode() {
        let original = ts(1_690_000_000_000, 4242, 0);
        let decoded = decode(encode(&original));
        assert_that!(decoded.physical).is_equal_to(original.physical);
        assert_that!(decoded.logical).is_equal_to(original.logical);

        let smaller = encode(&ts(1_690_000_000_000, 4241, 0));
        assert_that!(encode(&original)).is_greater_than(smaller);
    }

    #[test]
    fn test_now_millis_progresses() {
        let a = now_millis();
        let b = now_millis();
        assert_that!(b).is_at_least(a);
    }
}
