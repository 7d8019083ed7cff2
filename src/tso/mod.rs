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

//! The timestamp oracle service: per-group allocators behind primary
//! election, fronted by the streaming RPC.

mod allocator;
pub(crate) mod service;

pub use self::allocator::{
    timestamp_key,
    TimestampOracle,
    TsoError,
    DEFAULT_SAVE_INTERVAL,
    DEFAULT_UPDATE_PHYSICAL_INTERVAL,
};
pub use self::service::{AllocatorManager, AllocatorNode, TsoServiceImpl};
