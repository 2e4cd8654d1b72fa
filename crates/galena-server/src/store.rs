//! The store RPC state machine.
//!
//! Reads are local. Writes run the coordinator protocol: stamp, commit
//! locally, fan `ReplicateSet`/`ReplicateDelete` out to the other write
//! replicas, and reply once every required ack is in. Each fan-out leg
//! carries its own retry envelope; a replica that refuses because the
//! hash space says it is not assigned counts as acked (it would refuse
//! forever), while transport failures burn retries.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, error, warn};

use galena_types::{ClockTime, KeyHash, NodeId, ReplicateFlags, StoreFlags, stdhash};
use galena_wire::{IfModified, Record, Request, Response};

use crate::error::ServerResult;
use crate::node::{Reply, ServerNode};

/// Pause between retry attempts of one fan-out leg.
const RETRY_PAUSE: Duration = Duration::from_millis(10);

/// One leg of a replication fan-out.
#[derive(Debug, Clone, Copy)]
struct FanOutLeg {
    target: NodeId,
    flags: ReplicateFlags,
}

impl ServerNode {
    pub(crate) fn handle_get(&self, key: &[u8]) -> Response {
        self.metrics.count_get();
        Response::Get(
            self.store
                .get(key)
                .map(|(clocktime, value)| Record { value, clocktime }),
        )
    }

    pub(crate) fn handle_get_if_modified(&self, key: &[u8], if_time: ClockTime) -> Response {
        self.metrics.count_get();
        match self.store.get(key) {
            Some((clocktime, value)) if clocktime > if_time => {
                Response::GetIfModified(IfModified::Modified(Record { value, clocktime }))
            }
            Some(_) => Response::GetIfModified(IfModified::NotModified),
            None => Response::GetIfModified(IfModified::NotFound),
        }
    }

    /// Coordinator write path.
    pub(crate) fn handle_set(&self, flags: StoreFlags, key: &[u8], value: &[u8], reply: Reply) {
        self.metrics.count_set();
        let h = stdhash(key);

        if !self.spaces.whs().check_coordinator_assign(h, self.node) {
            warn!(%h, "set addressed to a non-coordinator, view is stale somewhere");
            reply.send(Response::Set(None));
            return;
        }

        let clocktime = self.clock.stamp();
        if let Err(e) = self.store.set(key, value, clocktime) {
            error!(error = %e, "local commit failed");
            reply.send(Response::Set(None));
            return;
        }

        let legs = self.replica_legs(h);
        let key = Bytes::copy_from_slice(key);
        let value = Bytes::copy_from_slice(value);

        if flags.is_async() {
            // Reply after local commit; the fan-out continues on this
            // worker thread in the background of the client's view.
            reply.send(Response::Set(Some(clocktime)));
            let outstanding = self.fan_out_set(&legs, clocktime, &key, &value);
            if outstanding > 0 {
                warn!(outstanding, "async replication incomplete");
            }
            return;
        }

        let outstanding = self.fan_out_set(&legs, clocktime, &key, &value);
        if outstanding == 0 {
            reply.send(Response::Set(Some(clocktime)));
        } else {
            warn!(outstanding, "replication failed, reporting write failure");
            reply.send(Response::Set(None));
        }
    }

    /// Coordinator delete path.
    pub(crate) fn handle_delete(&self, flags: StoreFlags, key: &[u8], reply: Reply) {
        self.metrics.count_delete();
        let h = stdhash(key);

        if !self.spaces.whs().check_coordinator_assign(h, self.node) {
            warn!(%h, "delete addressed to a non-coordinator, view is stale somewhere");
            reply.send(Response::Delete(None));
            return;
        }

        if self.store.get(key).is_none() {
            reply.send(Response::Delete(Some(false)));
            return;
        }

        let clocktime = self.clock.stamp();
        if let Err(e) = self.store.remove(key, clocktime) {
            error!(error = %e, "local tombstone failed");
            reply.send(Response::Delete(None));
            return;
        }

        let legs = self.replica_legs(h);
        let key = Bytes::copy_from_slice(key);

        if flags.is_async() {
            reply.send(Response::Delete(Some(true)));
            let outstanding = self.fan_out_delete(&legs, clocktime, &key);
            if outstanding > 0 {
                warn!(outstanding, "async delete replication incomplete");
            }
            return;
        }

        let outstanding = self.fan_out_delete(&legs, clocktime, &key);
        if outstanding == 0 {
            reply.send(Response::Delete(Some(true)));
        } else {
            warn!(outstanding, "delete replication failed");
            reply.send(Response::Delete(None));
        }
    }

    /// Replica write path.
    ///
    /// An `Err` return means local storage failed; the caller drops the
    /// reply so the coordinator retries against a healthy node.
    pub(crate) fn handle_replicate_set(
        &self,
        adjust_clock: u32,
        flags: ReplicateFlags,
        clocktime: ClockTime,
        key: &[u8],
        value: &[u8],
    ) -> ServerResult<bool> {
        self.clock.merge(adjust_clock);
        self.clock.observe(clocktime);

        let h = stdhash(key);
        if !self.replica_assigned(h, flags) {
            debug!(%h, "refusing replicate-set, not assigned under this view");
            return Ok(false);
        }

        // Applied or already newer: both are success for the coordinator.
        self.store.set_if_newer(key, value, clocktime)?;
        Ok(true)
    }

    /// Replica delete path.
    pub(crate) fn handle_replicate_delete(
        &self,
        adjust_clock: u32,
        flags: ReplicateFlags,
        clocktime: ClockTime,
        key: &[u8],
    ) -> ServerResult<bool> {
        self.clock.merge(adjust_clock);
        self.clock.observe(clocktime);

        let h = stdhash(key);
        if !self.replica_assigned(h, flags) {
            debug!(%h, "refusing replicate-delete, not assigned under this view");
            return Ok(false);
        }

        self.store.remove_if_newer(key, clocktime)?;
        Ok(true)
    }

    fn replica_assigned(&self, h: KeyHash, flags: ReplicateFlags) -> bool {
        if flags.is_rhs() {
            self.spaces.rhs().check_replicator_assign(h, self.node, self.config.replication)
        } else {
            self.spaces.whs().check_replicator_assign(h, self.node, self.config.replication)
        }
    }

    /// Every node that must observe a write to `h`, this node excluded.
    ///
    /// Write-view replicas come first. During rebalance the read view
    /// may still name old owners; they serve reads until the copy phase
    /// ends, so they get the write too, flagged `by_rhs` so they verify
    /// against the view that actually assigns them.
    fn replica_legs(&self, h: KeyHash) -> Vec<FanOutLeg> {
        let mut legs: Vec<FanOutLeg> = Vec::new();
        for target in self
            .spaces
            .whs()
            .replicators_for(h, self.config.replication)
        {
            if target != self.node {
                legs.push(FanOutLeg {
                    target,
                    flags: ReplicateFlags::none(),
                });
            }
        }
        for target in self
            .spaces
            .rhs()
            .replicators_for(h, self.config.replication)
        {
            if target != self.node && !legs.iter().any(|l| l.target == target) {
                legs.push(FanOutLeg {
                    target,
                    flags: ReplicateFlags::by_rhs(),
                });
            }
        }
        legs
    }

    fn fan_out_set(&self, legs: &[FanOutLeg], clocktime: ClockTime, key: &Bytes, value: &Bytes) -> usize {
        let h = stdhash(key);
        self.fan_out(legs, self.config.replicate_set_retry, h, |node, leg| {
            Request::ReplicateSet {
                adjust_clock: node.clock.tick(),
                flags: leg.flags,
                clocktime,
                key: key.clone(),
                value: value.clone(),
            }
        })
    }

    fn fan_out_delete(&self, legs: &[FanOutLeg], clocktime: ClockTime, key: &Bytes) -> usize {
        let h = stdhash(key);
        self.fan_out(legs, self.config.replicate_delete_retry, h, |node, leg| {
            Request::ReplicateDelete {
                adjust_clock: node.clock.tick(),
                flags: leg.flags,
                clocktime,
                key: key.clone(),
            }
        })
    }

    /// Runs every leg to completion and returns the number of required
    /// acks still outstanding.
    ///
    /// Legs run in parallel; each decrements the shared counter exactly
    /// once when its ack arrives (or when the leg becomes moot). A leg
    /// whose retries are exhausted leaves its ack outstanding.
    fn fan_out(
        &self,
        legs: &[FanOutLeg],
        retry_limit: u32,
        h: KeyHash,
        make_request: impl Fn(&ServerNode, &FanOutLeg) -> Request + Sync,
    ) -> usize {
        if legs.is_empty() {
            return 0;
        }
        let copy_required = AtomicUsize::new(legs.len());

        thread::scope(|scope| {
            for leg in legs {
                let copy_required = &copy_required;
                let make_request = &make_request;
                scope.spawn(move || {
                    if self.run_leg(leg, retry_limit, h, make_request) {
                        copy_required.fetch_sub(1, Ordering::SeqCst);
                    }
                });
            }
        });

        copy_required.load(Ordering::SeqCst)
    }

    /// One leg's retry envelope. Returns true when the leg is settled
    /// (acked, refused, or no longer assigned).
    fn run_leg(
        &self,
        leg: &FanOutLeg,
        retry_limit: u32,
        h: KeyHash,
        make_request: &(impl Fn(&ServerNode, &FanOutLeg) -> Request + Sync),
    ) -> bool {
        let mut attempts = 0u32;
        loop {
            attempts += 1;

            // The view may have moved underneath a retry; a target that
            // is no longer assigned would refuse anyway.
            let still_assigned = if leg.flags.is_rhs() {
                self.spaces.rhs().test_replicator_assign(h, leg.target, self.config.replication)
            } else {
                self.spaces.whs().test_replicator_assign(h, leg.target, self.config.replication)
            };
            if !still_assigned {
                debug!(target = %leg.target, "leg target left the replica set, settling");
                return true;
            }

            match self.bus.call(leg.target, make_request(self, leg)) {
                Ok(Response::ReplicateSet { applied } | Response::ReplicateDelete { applied }) => {
                    if !applied {
                        debug!(target = %leg.target, "replica refused, counting as acked");
                    }
                    return true;
                }
                Ok(other) => {
                    warn!(target = %leg.target, tag = other.tag(), "unexpected reply on fan-out leg");
                }
                Err(e) => {
                    debug!(target = %leg.target, attempts, error = %e, "fan-out leg failed");
                }
            }

            if attempts > retry_limit {
                warn!(target = %leg.target, attempts, "fan-out leg out of retries");
                return false;
            }
            thread::sleep(RETRY_PAUSE);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::sync::{Arc, Mutex};

    use tempfile::tempdir;

    use galena_storage::Store;
    use galena_wire::{Bus, WireError, WireResult};

    use crate::config::ServerConfig;

    type Behavior = Box<dyn Fn(NodeId, &Request) -> WireResult<Response> + Send + Sync>;

    struct FakeBus {
        calls: Mutex<Vec<(NodeId, Request)>>,
        behavior: Behavior,
    }

    impl FakeBus {
        fn new(behavior: Behavior) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                behavior,
            }
        }

        fn acking() -> Self {
            Self::new(Box::new(|_, request| {
                Ok(match request {
                    Request::ReplicateSet { .. } => Response::ReplicateSet { applied: true },
                    Request::ReplicateDelete { .. } => Response::ReplicateDelete { applied: true },
                    _ => Response::KeepAlive,
                })
            }))
        }

        fn unreachable() -> Self {
            Self::new(Box::new(|_, _| Err(WireError::ConnectionClosed)))
        }

        fn calls(&self) -> Vec<(NodeId, Request)> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl Bus for FakeBus {
        fn call(&self, node: NodeId, request: Request) -> WireResult<Response> {
            self.calls.lock().unwrap().push((node, request.clone()));
            (self.behavior)(node, &request)
        }

        fn notify(&self, node: NodeId, request: Request) -> WireResult<()> {
            self.calls.lock().unwrap().push((node, request));
            Ok(())
        }
    }

    struct Fixture {
        node: Arc<ServerNode>,
        bus: Arc<FakeBus>,
        _dir: tempfile::TempDir,
    }

    /// A node in a cluster of `peers + 1`, with fast retry limits.
    fn fixture(peers: usize, bus: FakeBus) -> Fixture {
        let dir = tempdir().unwrap();
        let listen = "127.0.0.1:19800".parse().unwrap();
        let nodes: Vec<NodeId> = (0..=peers)
            .map(|i| format!("127.0.0.1:{}", 19800 + i).parse().unwrap())
            .collect();
        let config = ServerConfig::new(listen, dir.path().join("db"))
            .with_nodes(nodes)
            .with_retry_limits(2, 2);
        let store = Arc::new(Store::open(config.store_path.clone()).unwrap());
        let bus = Arc::new(bus);
        let node = Arc::new(ServerNode::new(config, store, bus.clone()));
        Fixture {
            node,
            bus,
            _dir: dir,
        }
    }

    /// Finds a key this node coordinates.
    fn coordinated_key(node: &ServerNode) -> Bytes {
        for i in 0..10_000u32 {
            let key = format!("key-{i}").into_bytes();
            if node
                .spaces
                .whs()
                .check_coordinator_assign(stdhash(&key), node.id())
            {
                return Bytes::from(key);
            }
        }
        panic!("no coordinated key found");
    }

    /// Finds a key some other node coordinates.
    fn foreign_key(node: &ServerNode) -> Bytes {
        for i in 0..10_000u32 {
            let key = format!("key-{i}").into_bytes();
            if !node
                .spaces
                .whs()
                .check_coordinator_assign(stdhash(&key), node.id())
            {
                return Bytes::from(key);
            }
        }
        panic!("no foreign key found");
    }

    fn sent(node: &Arc<ServerNode>, f: impl FnOnce(Reply)) -> Response {
        let (tx, rx) = mpsc::channel();
        f(Reply::new(move |response| tx.send(response).unwrap()));
        rx.recv().unwrap()
    }

    #[test]
    fn single_node_set_then_get() {
        let fx = fixture(0, FakeBus::acking());
        let key = coordinated_key(&fx.node);

        let response = sent(&fx.node, |reply| {
            fx.node
                .handle_set(StoreFlags::none(), &key, b"hello", reply);
        });
        let Response::Set(Some(ct)) = response else {
            panic!("expected successful set, got {response:?}");
        };

        match fx.node.handle_get(&key) {
            Response::Get(Some(record)) => {
                assert_eq!(record.value, Bytes::from_static(b"hello"));
                assert_eq!(record.clocktime, ct);
            }
            other => panic!("expected hit, got {other:?}"),
        }
        // No peers, so nothing went out on the bus.
        assert!(fx.bus.calls().is_empty());
    }

    #[test]
    fn set_fans_out_to_write_replicas() {
        let fx = fixture(2, FakeBus::acking());
        let key = coordinated_key(&fx.node);

        let response = sent(&fx.node, |reply| {
            fx.node.handle_set(StoreFlags::none(), &key, b"v", reply);
        });
        assert!(matches!(response, Response::Set(Some(_))));

        let calls = fx.bus.calls();
        assert_eq!(calls.len(), 2, "one replicate per other replica");
        for (target, request) in calls {
            assert_ne!(target, fx.node.id());
            assert!(matches!(request, Request::ReplicateSet { .. }));
        }
    }

    #[test]
    fn refused_replicate_still_counts_as_acked() {
        let bus = FakeBus::new(Box::new(|_, _| {
            Ok(Response::ReplicateSet { applied: false })
        }));
        let fx = fixture(2, bus);
        let key = coordinated_key(&fx.node);

        let response = sent(&fx.node, |reply| {
            fx.node.handle_set(StoreFlags::none(), &key, b"v", reply);
        });
        assert!(matches!(response, Response::Set(Some(_))));
    }

    #[test]
    fn unreachable_replicas_fail_the_write() {
        let fx = fixture(2, FakeBus::unreachable());
        let key = coordinated_key(&fx.node);

        let response = sent(&fx.node, |reply| {
            fx.node.handle_set(StoreFlags::none(), &key, b"v", reply);
        });
        assert!(matches!(response, Response::Set(None)));

        // Each leg tried once plus the configured retries.
        let per_leg = fx
            .bus
            .calls()
            .iter()
            .filter(|(t, _)| *t == fx.bus.calls()[0].0)
            .count();
        assert_eq!(per_leg as u32, 2 + 1);
    }

    #[test]
    fn async_set_succeeds_despite_unreachable_replicas() {
        let fx = fixture(2, FakeBus::unreachable());
        let key = coordinated_key(&fx.node);

        let response = sent(&fx.node, |reply| {
            fx.node
                .handle_set(StoreFlags::from(0x01), &key, b"v", reply);
        });
        assert!(matches!(response, Response::Set(Some(_))));
        // The value is committed locally regardless.
        assert!(matches!(fx.node.handle_get(&key), Response::Get(Some(_))));
    }

    #[test]
    fn misrouted_set_is_refused() {
        let fx = fixture(2, FakeBus::acking());
        let key = foreign_key(&fx.node);

        let response = sent(&fx.node, |reply| {
            fx.node.handle_set(StoreFlags::none(), &key, b"v", reply);
        });
        assert!(matches!(response, Response::Set(None)));
        assert!(fx.bus.calls().is_empty());
    }

    #[test]
    fn two_sets_last_writer_wins() {
        let fx = fixture(0, FakeBus::acking());
        let key = coordinated_key(&fx.node);

        let first = sent(&fx.node, |reply| {
            fx.node.handle_set(StoreFlags::none(), &key, b"v1", reply);
        });
        let second = sent(&fx.node, |reply| {
            fx.node.handle_set(StoreFlags::none(), &key, b"v2", reply);
        });
        let (Response::Set(Some(ct1)), Response::Set(Some(ct2))) = (first, second) else {
            panic!("both sets should succeed");
        };
        assert!(ct2 > ct1);

        match fx.node.handle_get(&key) {
            Response::Get(Some(record)) => assert_eq!(record.value, Bytes::from_static(b"v2")),
            other => panic!("expected hit, got {other:?}"),
        }
    }

    #[test]
    fn delete_roundtrip() {
        let fx = fixture(0, FakeBus::acking());
        let key = coordinated_key(&fx.node);

        sent(&fx.node, |reply| {
            fx.node.handle_set(StoreFlags::none(), &key, b"v", reply);
        });

        let deleted = sent(&fx.node, |reply| {
            fx.node.handle_delete(StoreFlags::none(), &key, reply);
        });
        assert_eq!(deleted, Response::Delete(Some(true)));

        let again = sent(&fx.node, |reply| {
            fx.node.handle_delete(StoreFlags::none(), &key, reply);
        });
        assert_eq!(again, Response::Delete(Some(false)));
        assert!(matches!(fx.node.handle_get(&key), Response::Get(None)));
    }

    #[test]
    fn delete_of_missing_key_does_not_fan_out() {
        let fx = fixture(2, FakeBus::acking());
        let key = coordinated_key(&fx.node);

        let response = sent(&fx.node, |reply| {
            fx.node.handle_delete(StoreFlags::none(), &key, reply);
        });
        assert_eq!(response, Response::Delete(Some(false)));
        assert!(fx.bus.calls().is_empty());
    }

    #[test]
    fn replicate_set_applies_when_assigned() {
        let fx = fixture(0, FakeBus::acking());
        // Single-node cluster: this node is assigned for every key.
        let key = coordinated_key(&fx.node);
        let ct = ClockTime::new(100, 1);

        let applied = fx
            .node
            .handle_replicate_set(5, ReplicateFlags::none(), ct, &key, b"v")
            .unwrap();
        assert!(applied);
        assert_eq!(fx.node.store().get(&key).unwrap().0, ct);

        // Replaying the same replicate is an idempotent ack.
        let replay = fx
            .node
            .handle_replicate_set(6, ReplicateFlags::none(), ct, &key, b"other")
            .unwrap();
        assert!(replay);
        assert_eq!(
            fx.node.store().get(&key).unwrap().1,
            Bytes::from_static(b"v")
        );
    }

    #[test]
    fn replicate_set_rejects_older_stamp() {
        let fx = fixture(0, FakeBus::acking());
        let key = coordinated_key(&fx.node);

        fx.node
            .handle_replicate_set(1, ReplicateFlags::none(), ClockTime::new(10, 0), &key, b"new")
            .unwrap();
        let acked = fx
            .node
            .handle_replicate_set(2, ReplicateFlags::none(), ClockTime::new(9, 9), &key, b"old")
            .unwrap();
        // Acked for the coordinator, but the newer value stays.
        assert!(acked);
        assert_eq!(
            fx.node.store().get(&key).unwrap().1,
            Bytes::from_static(b"new")
        );
    }

    #[test]
    fn replicate_set_refused_when_not_assigned() {
        // Large cluster: some keys are not this node's responsibility.
        let fx = fixture(6, FakeBus::acking());
        let key = (0..10_000u32)
            .map(|i| format!("key-{i}").into_bytes())
            .find(|k| {
                !fx.node
                    .spaces
                    .whs()
                    .check_replicator_assign(stdhash(k), fx.node.id(), 3)
            })
            .expect("some key must not be assigned here");

        let applied = fx
            .node
            .handle_replicate_set(1, ReplicateFlags::none(), ClockTime::new(1, 1), &key, b"v")
            .unwrap();
        assert!(!applied);
        assert!(fx.node.store().get(&key).is_none());
    }

    #[test]
    fn replicate_delete_requires_newer_stamp() {
        let fx = fixture(0, FakeBus::acking());
        let key = coordinated_key(&fx.node);

        fx.node
            .handle_replicate_set(1, ReplicateFlags::none(), ClockTime::new(10, 0), &key, b"v")
            .unwrap();

        // Older delete: acked but the value survives.
        assert!(
            fx.node
                .handle_replicate_delete(2, ReplicateFlags::none(), ClockTime::new(9, 0), &key)
                .unwrap()
        );
        assert!(fx.node.store().get(&key).is_some());

        // Newer delete tombstones.
        assert!(
            fx.node
                .handle_replicate_delete(3, ReplicateFlags::none(), ClockTime::new(11, 0), &key)
                .unwrap()
        );
        assert!(fx.node.store().get(&key).is_none());
    }

    #[test]
    fn get_if_modified_semantics() {
        let fx = fixture(0, FakeBus::acking());
        let key = coordinated_key(&fx.node);
        let ct = ClockTime::new(100, 5);
        fx.node
            .handle_replicate_set(1, ReplicateFlags::none(), ct, &key, b"v")
            .unwrap();

        // Strictly older watermark: modified.
        assert!(matches!(
            fx.node.handle_get_if_modified(&key, ClockTime::new(100, 4)),
            Response::GetIfModified(IfModified::Modified(_))
        ));
        // Equal watermark: not modified.
        assert!(matches!(
            fx.node.handle_get_if_modified(&key, ct),
            Response::GetIfModified(IfModified::NotModified)
        ));
        // Absent key: not found.
        assert!(matches!(
            fx.node.handle_get_if_modified(b"no-such-key", ct),
            Response::GetIfModified(IfModified::NotFound)
        ));
    }

    #[test]
    fn metrics_count_operations() {
        let fx = fixture(0, FakeBus::acking());
        let key = coordinated_key(&fx.node);

        fx.node.handle_get(&key);
        sent(&fx.node, |reply| {
            fx.node.handle_set(StoreFlags::none(), &key, b"v", reply);
        });
        sent(&fx.node, |reply| {
            fx.node.handle_delete(StoreFlags::none(), &key, reply);
        });

        assert_eq!(fx.node.metrics().cmd_get(), 1);
        assert_eq!(fx.node.metrics().cmd_set(), 1);
        assert_eq!(fx.node.metrics().cmd_delete(), 1);
    }
}
