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

//! Retirement scopes for background tasks.
//!
//! Every component here spawns tasks that must not outlive it: election
//! campaigns, lease keep-alives, watch loops, proxy dispatchers, the
//! allocator update ticker. Each task holds a [Retirement] of its owner's
//! scope and unwinds once the scope retires, whether explicitly or because
//! the owning [Retirer] was dropped.

use tokio::sync::watch;

/// Owner side of a named task scope. Dropping it retires the scope.
#[derive(Debug)]
pub struct Retirer {
    scope: &'static str,
    retired: watch::Sender<bool>,
}

/// Task side of a scope; resolves once the scope retires.
#[derive(Clone, Debug)]
pub struct Retirement {
    scope: &'static str,
    retired: watch::Receiver<bool>,
}

pub fn retirement(scope: &'static str) -> (Retirer, Retirement) {
    let (sender, receiver) = watch::channel(false);
    (Retirer { scope, retired: sender }, Retirement { scope, retired: receiver })
}

impl Retirer {
    pub fn scope(&self) -> &'static str {
        self.scope
    }

    /// Retires the scope ahead of drop, e.g. when an allocator is taken out
    /// of service while its owner lives on.
    pub fn retire(&self) {
        if !self.retired.send_replace(true) {
            tracing::trace!("scope {} retired", self.scope);
        }
    }
}

impl Drop for Retirer {
    fn drop(&mut self) {
        self.retire();
    }
}

impl Retirement {
    pub fn scope(&self) -> &'static str {
        self.scope
    }

    pub fn is_retired(&self) -> bool {
        *self.retired.borrow()
    }

    /// Waits out the rest of the scope's life.
    pub async fn retired(&mut self) {
        while !*self.retired.borrow_and_update() {
            if self.retired.changed().await.is_err() {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_retires_on_drop() {
        let (retirer, mut retirement) = retirement("test");
        let mut cloned = retirement.clone();
        assert!(!retirement.is_retired());
        tokio::select! {
            _ = retirement.retired() => panic!("scope still alive"),
            _ = tokio::time::sleep(Duration::from_millis(20)) => {},
        }
        drop(retirer);
        retirement.retired().await;
        cloned.retired().await;
        assert!(cloned.is_retired());
    }

    #[tokio::test]
    async fn test_explicit_retire() {
        let (retirer, mut retirement) = retirement("test");
        retirer.retire();
        retirement.retired().await;
        assert!(retirement.is_retired());
        // The owner is still around; retiring again is a no-op.
        retirer.retire();
        assert_eq!(retirer.scope(), "test");
    }
}
