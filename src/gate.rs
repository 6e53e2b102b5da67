// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topology Readiness Gate
//!
//! Tracks whether the topology has been successfully asserted. The gate
//! starts closed, opens exactly once, and never regresses. Publishes issued
//! before the gate opens are buffered by the publisher; consumer-group
//! registration awaits the gate before opening any consumption channel, so
//! nothing is consumed before the shared topology exists.

use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::watch;

pub(crate) struct ReadinessGate {
    asserted: AtomicBool,
    ready: watch::Sender<bool>,
}

impl ReadinessGate {
    pub(crate) fn new() -> ReadinessGate {
        let (ready, _) = watch::channel(false);

        ReadinessGate {
            asserted: AtomicBool::new(false),
            ready,
        }
    }

    /// Whether the topology has been asserted.
    pub(crate) fn is_ready(&self) -> bool {
        self.asserted.load(Ordering::SeqCst)
    }

    /// Opens the gate. Idempotent; only the first call notifies waiters.
    pub(crate) fn mark_ready(&self) {
        if !self.asserted.swap(true, Ordering::SeqCst) {
            let _ = self.ready.send(true);
        }
    }

    /// Resolves once the gate is open; immediately if it already is.
    pub(crate) async fn wait_ready(&self) {
        let mut ready = self.ready.subscribe();
        // The sender lives as long as self, so this cannot error.
        let _ = ready.wait_for(|open| *open).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::Arc, time::Duration};

    #[tokio::test]
    async fn opens_exactly_once() {
        let gate = ReadinessGate::new();
        assert!(!gate.is_ready());

        gate.mark_ready();
        assert!(gate.is_ready());
        gate.wait_ready().await;

        // A second open is a no-op.
        gate.mark_ready();
        assert!(gate.is_ready());
    }

    #[tokio::test]
    async fn waiters_resolve_when_the_gate_opens() {
        let gate = Arc::new(ReadinessGate::new());

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.wait_ready().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        gate.mark_ready();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should resolve")
            .unwrap();
    }
}
