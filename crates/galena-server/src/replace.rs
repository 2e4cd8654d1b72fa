//! The rebalance ("replace") state machine.
//!
//! A manager reacts to membership changes by pushing a new seed with
//! `ReplaceCopyStart`. The node installs the seed as its write view,
//! scans its store, and streams every key that gained a new owner to
//! that owner over the offer channel. Each offered key increments the
//! state's waiting counter; each delivery acknowledgment decrements it.
//! When the counter drains for the current rebalance, the node reports
//! `ReplaceCopyEnd`. Once the manager has collected those from every
//! node it pushes `ReplaceDeleteStart`, which promotes the seed to the
//! read view and drops the keys this node no longer owns.
//!
//! A newer rebalance supersedes an unfinished one: `reset` rebinds the
//! state to the new clocktime and stray acknowledgments from the old
//! copy phase no longer match.

use std::sync::Mutex;

use tracing::{debug, error, info, warn};

use galena_hashspace::{HashSpace, HsSeed};
use galena_types::{ClockTime, NodeId, stdhash};
use galena_wire::{Request, Response};

use crate::node::{Reply, ServerNode};
use crate::stream::{OfferStorage, send_offer};

#[derive(Debug, Default)]
struct ReplaceInner {
    mgr: Option<NodeId>,
    clocktime: ClockTime,
    push_waiting: u64,
    /// Set once `ReplaceCopyEnd` has been claimed for this clocktime.
    reported: bool,
}

/// Per-node rebalance bookkeeping, guarded by one mutex.
#[derive(Debug, Default)]
pub struct ReplaceState {
    inner: Mutex<ReplaceInner>,
}

impl ReplaceState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds the state to a fresh rebalance.
    pub fn reset(&self, mgr: Option<NodeId>, ct: ClockTime) {
        let mut inner = self.inner.lock().expect("replace state lock poisoned");
        inner.mgr = mgr;
        inner.clocktime = ct;
        inner.push_waiting = 0;
        inner.reported = false;
    }

    /// Records one offered key. Ignored when `ct` is not the current
    /// rebalance (a newer one took over mid-scan).
    pub fn pushed(&self, ct: ClockTime) {
        let mut inner = self.inner.lock().expect("replace state lock poisoned");
        if inner.clocktime == ct {
            inner.push_waiting += 1;
        }
    }

    /// Records one acknowledged key.
    pub fn push_returned(&self, ct: ClockTime) {
        let mut inner = self.inner.lock().expect("replace state lock poisoned");
        if inner.clocktime == ct {
            inner.push_waiting = inner.push_waiting.saturating_sub(1);
        }
    }

    /// True only when `ct` is the current rebalance and nothing is waiting.
    pub fn is_finished(&self, ct: ClockTime) -> bool {
        let inner = self.inner.lock().expect("replace state lock poisoned");
        inner.clocktime == ct && inner.push_waiting == 0
    }

    /// Forces the state terminal; pending acknowledgments become stray.
    pub fn invalidate(&self) {
        let mut inner = self.inner.lock().expect("replace state lock poisoned");
        inner.clocktime = ClockTime::ZERO;
        inner.push_waiting = 0;
        inner.reported = true;
    }

    pub fn mgr_addr(&self) -> Option<NodeId> {
        self.inner
            .lock()
            .expect("replace state lock poisoned")
            .mgr
    }

    /// Claims the finish transition exactly once, returning the manager
    /// to notify. Subsequent calls for the same rebalance return `None`.
    fn claim_finish(&self, ct: ClockTime) -> Option<Option<NodeId>> {
        let mut inner = self.inner.lock().expect("replace state lock poisoned");
        if inner.clocktime == ct && inner.push_waiting == 0 && !inner.reported {
            inner.reported = true;
            Some(inner.mgr)
        } else {
            None
        }
    }
}

impl ServerNode {
    /// The manager that receives copy/delete end notifications.
    fn manager(&self) -> Option<NodeId> {
        self.config.manager1.or(self.config.manager2)
    }

    pub(crate) fn handle_replace_copy_start(
        &self,
        hsseed: &HsSeed,
        adjust_clock: u32,
        full: bool,
        reply: Reply,
    ) {
        self.clock.merge(adjust_clock);
        info!(clocktime = %hsseed.clocktime, full, "replace copy phase starting");

        // Accept before the scan; the manager only needs to know the
        // node took the job.
        reply.send(Response::ReplaceCopyStart { accepted: true });

        let hs = HashSpace::from_seed(hsseed);
        self.spaces.install_whs(hs.clone());
        self.replace_copy(&hs, full);
    }

    /// The copy phase: offer every key whose ownership changed.
    fn replace_copy(&self, hs: &HashSpace, full: bool) {
        let ct = hs.clocktime();
        let old = self.spaces.rhs().clone();
        self.replace.reset(self.manager(), ct);

        let mut offers = match OfferStorage::new(&self.config.offer_tmpdir, ct) {
            Ok(offers) => offers,
            Err(e) => {
                error!(error = %e, "cannot open offer spill storage");
                return;
            }
        };

        for (key, value, stamp) in self.store.snapshot_live() {
            let h = stdhash(&key);
            for target in hs.replicators_for(h, self.config.replication) {
                if target == self.node {
                    continue;
                }
                // Keys the target already held are skipped unless the
                // manager asked for a full sweep.
                if !full && old.test_replicator_assign(h, target, self.config.replication) {
                    continue;
                }
                if let Err(e) = offers.add(target, &key, &value, stamp) {
                    error!(target = %target, error = %e, "offer spill failed");
                    continue;
                }
                self.replace.pushed(ct);
            }
        }

        for (target, mut file) in offers.into_files() {
            let count = file.count();
            debug!(target = %target, count, "streaming offers");

            // Announce, then push the spill over the stream channel.
            let announce = Request::ReplaceOffer { addr: self.node };
            if let Err(e) = self.bus.notify(target, announce) {
                debug!(target = %target, error = %e, "offer announcement failed");
            }

            let stream_addr = target.with_port(self.config.stream_port);
            match send_offer(stream_addr, &mut file, ct, self.config.rpc_timeout) {
                Ok(received) => {
                    if received != count {
                        warn!(target = %target, count, received, "short offer acknowledgment");
                    }
                    for _ in 0..received {
                        self.replace.push_returned(ct);
                    }
                }
                Err(e) => {
                    // The waiting counter stays up; this rebalance will
                    // not report completion and the manager retries it.
                    error!(target = %target, error = %e, "offer stream failed");
                }
            }
            self.finish_replace_copy(ct);
        }

        // No offers at all: the phase is already complete.
        self.finish_replace_copy(ct);
    }

    /// Reports `ReplaceCopyEnd` once the waiting counter drains.
    fn finish_replace_copy(&self, ct: ClockTime) {
        let Some(mgr) = self.replace.claim_finish(ct) else {
            return;
        };
        info!(clocktime = %ct, "replace copy phase finished");
        let Some(mgr) = mgr else { return };
        let request = Request::ReplaceCopyEnd {
            clocktime: ct,
            adjust_clock: self.clock.tick(),
        };
        if let Err(e) = self.notify_manager(mgr, request) {
            warn!(manager = %mgr, error = %e, "replace copy end notification failed");
        }
    }

    pub(crate) fn handle_replace_delete_start(
        &self,
        hsseed: &HsSeed,
        adjust_clock: u32,
        reply: Reply,
    ) {
        self.clock.merge(adjust_clock);
        info!(clocktime = %hsseed.clocktime, "replace delete phase starting");
        reply.send(Response::ReplaceDeleteStart { accepted: true });

        let hs = HashSpace::from_seed(hsseed);
        let ct = hs.clocktime();
        self.spaces.install_rhs(hs.clone());

        let mut dropped = 0u64;
        for (key, _, _) in self.store.snapshot_live() {
            let h = stdhash(&key);
            if hs.test_replicator_assign(h, self.node, self.config.replication) {
                continue;
            }
            match self.store.remove(&key, self.clock.stamp()) {
                Ok(_) => dropped += 1,
                Err(e) => error!(error = %e, "dropping migrated key failed"),
            }
        }
        info!(dropped, "replace delete phase finished");

        if let Some(mgr) = self.manager() {
            let request = Request::ReplaceDeleteEnd {
                clocktime: ct,
                adjust_clock: self.clock.tick(),
            };
            if let Err(e) = self.notify_manager(mgr, request) {
                warn!(manager = %mgr, error = %e, "replace delete end notification failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ct(c: u32) -> ClockTime {
        ClockTime::new(100, c)
    }

    fn mgr() -> NodeId {
        "127.0.0.1:19700".parse().unwrap()
    }

    #[test]
    fn fresh_state_is_finished_for_zero_only() {
        let state = ReplaceState::new();
        assert!(state.is_finished(ClockTime::ZERO));
        assert!(!state.is_finished(ct(1)));
    }

    #[test]
    fn push_pop_drains_to_finished() {
        let state = ReplaceState::new();
        state.reset(Some(mgr()), ct(1));
        assert!(state.is_finished(ct(1)), "no offers yet, already drained");

        state.pushed(ct(1));
        state.pushed(ct(1));
        assert!(!state.is_finished(ct(1)));

        state.push_returned(ct(1));
        assert!(!state.is_finished(ct(1)));
        state.push_returned(ct(1));
        assert!(state.is_finished(ct(1)));
    }

    #[test]
    fn mismatched_clocktime_is_ignored() {
        let state = ReplaceState::new();
        state.reset(Some(mgr()), ct(2));

        // Pushes and pops from a stale rebalance do not touch the counter.
        state.pushed(ct(1));
        assert!(state.is_finished(ct(2)));
        state.pushed(ct(2));
        state.push_returned(ct(1));
        assert!(!state.is_finished(ct(2)));
    }

    #[test]
    fn newer_reset_supersedes_unfinished_copy() {
        let state = ReplaceState::new();
        state.reset(Some(mgr()), ct(1));
        state.pushed(ct(1));

        state.reset(Some(mgr()), ct(2));
        assert!(!state.is_finished(ct(1)));
        assert!(state.is_finished(ct(2)));

        // The stale acknowledgment arriving late changes nothing.
        state.push_returned(ct(1));
        assert!(state.is_finished(ct(2)));
    }

    #[test]
    fn invalidate_is_terminal() {
        let state = ReplaceState::new();
        state.reset(Some(mgr()), ct(3));
        state.pushed(ct(3));
        state.invalidate();
        assert!(!state.is_finished(ct(3)));
        assert_eq!(state.claim_finish(ct(3)), None);
    }

    #[test]
    fn claim_finish_fires_once() {
        let state = ReplaceState::new();
        state.reset(Some(mgr()), ct(1));
        assert_eq!(state.claim_finish(ct(1)), Some(Some(mgr())));
        assert_eq!(state.claim_finish(ct(1)), None);

        // A new rebalance arms it again.
        state.reset(None, ct(2));
        assert_eq!(state.claim_finish(ct(2)), Some(None));
    }

    #[test]
    fn claim_finish_waits_for_drain() {
        let state = ReplaceState::new();
        state.reset(Some(mgr()), ct(1));
        state.pushed(ct(1));
        assert_eq!(state.claim_finish(ct(1)), None);
        state.push_returned(ct(1));
        assert_eq!(state.claim_finish(ct(1)), Some(Some(mgr())));
    }

    mod copy_phase {
        use std::sync::{Arc, Mutex};

        use bytes::Bytes;
        use tempfile::tempdir;

        use galena_hashspace::SeedNode;
        use galena_storage::Store;
        use galena_wire::{Bus, WireResult};

        use super::*;
        use crate::config::ServerConfig;
        use crate::node::Reply;
        use crate::stream::StreamListener;

        struct RecordingBus {
            calls: Mutex<Vec<(NodeId, Request)>>,
        }

        impl RecordingBus {
            fn new() -> Self {
                Self {
                    calls: Mutex::new(Vec::new()),
                }
            }

            fn calls(&self) -> Vec<(NodeId, Request)> {
                self.calls.lock().unwrap().clone()
            }
        }

        impl Bus for RecordingBus {
            fn call(&self, node: NodeId, request: Request) -> WireResult<Response> {
                self.calls.lock().unwrap().push((node, request));
                Ok(Response::ReplaceCopyEnd { accepted: true })
            }

            fn notify(&self, node: NodeId, request: Request) -> WireResult<()> {
                self.calls.lock().unwrap().push((node, request));
                Ok(())
            }
        }

        fn make_node(
            dir: &std::path::Path,
            listen: &str,
            stream_port: u16,
            manager: Option<NodeId>,
        ) -> (Arc<ServerNode>, Arc<RecordingBus>) {
            let mut config = ServerConfig::new(listen.parse().unwrap(), dir.join("db"))
                .with_offer_tmpdir(dir)
                .with_stream_port(stream_port);
            config.manager1 = manager;
            let store = Arc::new(Store::open(config.store_path.clone()).unwrap());
            let bus = Arc::new(RecordingBus::new());
            let node = Arc::new(ServerNode::new(config, store, bus.clone()));
            (node, bus)
        }

        #[test]
        fn copy_start_moves_keys_and_reports_end() {
            let dir_a = tempdir().unwrap();
            let dir_b = tempdir().unwrap();

            // Receiver first, on an ephemeral stream port.
            let (node_b, _bus_b) = make_node(dir_b.path(), "127.0.0.1:29901", 0, None);
            let mut listener =
                StreamListener::spawn(Arc::clone(&node_b), "127.0.0.1:0".parse().unwrap())
                    .unwrap();
            let stream_port = listener.local_addr().port();

            // Sender, configured so the receiver's stream port is found.
            let (node_a, bus_a) =
                make_node(dir_a.path(), "127.0.0.1:29900", stream_port, Some(mgr()));

            node_a
                .store()
                .set(b"k1", b"v1", ClockTime::new(1, 1))
                .unwrap();
            node_a
                .store()
                .set(b"k2", b"v2", ClockTime::new(1, 2))
                .unwrap();

            // The manager pushes a view that adds node B.
            let seed = HsSeed {
                nodes: vec![
                    SeedNode {
                        node: node_a.id(),
                        incarnation: 0,
                        active: true,
                    },
                    SeedNode {
                        node: node_b.id(),
                        incarnation: 0,
                        active: true,
                    },
                ],
                clocktime: ClockTime::new(5, 0),
            };

            node_a.handle_replace_copy_start(&seed, 1, false, Reply::discard());

            // Both keys gained node B as a replica and were streamed over.
            assert_eq!(
                node_b.store().get(b"k1").unwrap().1,
                Bytes::from_static(b"v1")
            );
            assert_eq!(
                node_b.store().get(b"k2").unwrap().1,
                Bytes::from_static(b"v2")
            );

            // The copy phase drained and the manager heard about it.
            assert!(node_a.replace.is_finished(ClockTime::new(5, 0)));
            let calls = bus_a.calls();
            assert!(
                calls
                    .iter()
                    .any(|(n, r)| *n == node_b.id() && matches!(r, Request::ReplaceOffer { .. })),
                "target should be announced to"
            );
            assert!(
                calls.iter().any(|(n, r)| *n == mgr()
                    && matches!(
                        r,
                        Request::ReplaceCopyEnd { clocktime, .. } if *clocktime == ClockTime::new(5, 0)
                    )),
                "manager should receive the copy end"
            );

            listener.stop();
        }

        #[test]
        fn delete_start_drops_migrated_keys_only() {
            let dir = tempdir().unwrap();
            let other: NodeId = "127.0.0.1:29911".parse().unwrap();
            let (node, bus) = make_node(dir.path(), "127.0.0.1:29910", 0, Some(mgr()));
            // Single replica per key so ownership is exclusive.
            let mut config = node.config.clone();
            config.replication = 1;
            let store = Arc::new(Store::open(dir.path().join("db2")).unwrap());
            let node = Arc::new(ServerNode::new(config, store, bus.clone()));

            let seed = HsSeed {
                nodes: vec![
                    SeedNode {
                        node: node.id(),
                        incarnation: 0,
                        active: true,
                    },
                    SeedNode {
                        node: other,
                        incarnation: 0,
                        active: true,
                    },
                ],
                clocktime: ClockTime::new(6, 0),
            };
            let hs = HashSpace::from_seed(&seed);

            // Seed the store with keys on both sides of the split.
            let mut kept = None;
            let mut dropped = None;
            for i in 0..200u32 {
                let key = format!("key-{i}").into_bytes();
                let owner = hs.coordinator_for(stdhash(&key)).unwrap();
                node.store()
                    .set(&key, b"v", ClockTime::new(1, i))
                    .unwrap();
                if owner == node.id() {
                    kept.get_or_insert(key);
                } else {
                    dropped.get_or_insert(key);
                }
            }
            let kept = kept.expect("some key stays");
            let dropped = dropped.expect("some key moves");

            node.handle_replace_delete_start(&seed, 1, Reply::discard());

            assert!(node.store().get(&kept).is_some());
            assert!(node.store().get(&dropped).is_none());
            assert!(
                bus.calls()
                    .iter()
                    .any(|(n, r)| *n == mgr() && matches!(r, Request::ReplaceDeleteEnd { .. }))
            );
        }
    }
}
