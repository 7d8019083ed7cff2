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

//! Generated code for protobuf message and rpc.

mod generated;

use std::fmt::{Display, Formatter};

pub use self::generated::*;
pub use self::keyspace_admin_client::KeyspaceAdminClient;
pub use self::keyspace_admin_server::{KeyspaceAdmin, KeyspaceAdminServer};
pub use self::tso_client::TsoClient;
pub use self::tso_server::{Tso, TsoServer};

/// Keyspace group every keyspace belongs to until assigned elsewhere.
pub const DEFAULT_KEYSPACE_GROUP_ID: u32 = 0;

/// The keyspace provisioned at cluster bootstrap.
pub const DEFAULT_KEYSPACE_ID: u32 = 0;

/// The dc-location of the cross-DC allocator.
pub const GLOBAL_DC_LOCATION: &str = "global";

impl Display for Timestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.physical, self.logical)
    }
}

impl RequestHeader {
    pub fn new(cluster_id: u64) -> Self {
        Self { cluster_id, ..Default::default() }
    }
}

impl ResponseHeader {
    pub fn ok(cluster_id: u64) -> Self {
        Self { cluster_id, error: None }
    }

    pub fn failed(cluster_id: u64, error: Error) -> Self {
        Self { cluster_id, error: Some(error) }
    }

    pub fn error_type(&self) -> ErrorType {
        match &self.error {
            None => ErrorType::Ok,
            Some(error) => ErrorType::try_from(error.r#type).unwrap_or(ErrorType::Unknown),
        }
    }
}

impl Error {
    pub fn new(r#type: ErrorType, message: impl Into<String>) -> Self {
        Self { r#type: r#type as i32, message: message.into(), redirect_hint: Default::default() }
    }

    pub fn cluster_id_mismatch(expect: u64, got: u64) -> Self {
        Self::new(ErrorType::ClusterIdMismatch, format!("cluster id mismatch, expect {expect}, got {got}"))
    }

    pub fn not_primary(group: u32, dc: &str, redirect_hint: impl Into<String>) -> Self {
        let mut error =
            Self::new(ErrorType::NotPrimary, format!("not primary of keyspace group {group} in dc {dc}"));
        error.redirect_hint = redirect_hint.into();
        error
    }

    pub fn unsynced(message: impl Into<String>) -> Self {
        Self::new(ErrorType::Unsynced, message)
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(ErrorType::InvalidArgument, message)
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let r#type = ErrorType::try_from(self.r#type).unwrap_or(ErrorType::Unknown);
        write!(f, "{}: {}", r#type.as_str_name(), self.message)
    }
}

impl std::error::Error for Error {}

impl Member {
    pub fn address(&self) -> &str {
        self.client_urls.first().map(String::as_str).unwrap_or_default()
    }
}

impl SplitState {
    pub fn new(source_id: u32, target_id: u32) -> Self {
        Self { source_id, target_id }
    }
}

impl KeyspaceGroup {
    pub fn in_split_state(&self) -> bool {
        self.split_state.is_some()
    }

    pub fn in_merge_state(&self) -> bool {
        self.merge_state.is_some()
    }

    /// Whether this group can start a new split or merge.
    pub fn quiescent(&self) -> bool {
        !self.in_split_state() && !self.in_merge_state()
    }

    pub fn contains_keyspace(&self, keyspace_id: u32) -> bool {
        self.keyspaces.binary_search(&keyspace_id).is_ok()
    }

    pub fn member(&self, address: &str) -> Option<&KeyspaceGroupMember> {
        self.members.iter().find(|m| m.address == address)
    }

    pub fn is_member(&self, address: &str) -> bool {
        self.member(address).is_some()
    }

    /// Inserts keyspaces keeping the list sorted and deduplicated.
    pub fn add_keyspaces(&mut self, keyspaces: impl IntoIterator<Item = u32>) {
        for keyspace in keyspaces {
            if let Err(i) = self.keyspaces.binary_search(&keyspace) {
                self.keyspaces.insert(i, keyspace);
            }
        }
    }

    pub fn remove_keyspaces(&mut self, keyspaces: &[u32]) {
        self.keyspaces.retain(|id| !keyspaces.contains(id));
    }
}

#[cfg(test)]
mod tests {
    use assertor::*;

    use super::*;

    #[test]
    fn test_keyspace_group_keyspaces() {
        let mut group = KeyspaceGroup { id: 1, keyspaces: vec![111, 333], ..Default::default() };
        group.add_keyspaces([222, 333, 444]);
        assert_that!(group.keyspaces).is_equal_to(vec![111, 222, 333, 444]);
        assert_that!(group.contains_keyspace(222)).is_true();
        group.remove_keyspaces(&[222, 444]);
        assert_that!(group.keyspaces).is_equal_to(vec![111, 333]);
        assert_that!(group.contains_keyspace(222)).is_false();
    }

    #[test]
    fn test_keyspace_group_json() {
        let group = KeyspaceGroup {
            id: 2,
            user_kind: "standard".to_string(),
            members: vec![KeyspaceGroupMember { address: "http://127.0.0.1:3379".to_string(), priority: 200 }],
            keyspaces: vec![222, 333],
            split_state: Some(SplitState::new(1, 2)),
            merge_state: None,
        };
        let json = serde_json::to_string(&group).unwrap();
        assert_that!(json.contains("\"userKind\":\"standard\"")).is_true();
        assert_that!(json.contains("\"splitState\"")).is_true();
        assert_that!(json.contains("mergeState")).is_false();
        let decoded: KeyspaceGroup = serde_json::from_str(&json).unwrap();
        assert_that!(decoded).is_equal_to(group);
    }
}
