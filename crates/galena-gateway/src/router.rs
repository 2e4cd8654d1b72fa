//! Routes client operations onto the cluster.
//!
//! The gateway keeps its own copies of the write and read hash spaces,
//! bootstrapped from the configured server list and refreshed by
//! polling `GetStatus(WHS/RHS)`. Reads walk the read-replica list until
//! one answers; writes go to the coordinator with a small retry budget.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, warn};

use galena_hashspace::{HashSpace, HsSeed, SeedOrder};
use galena_types::{ClockTime, NodeId, StatusKind, StoreFlags, stdhash};
use galena_wire::{Bus, Record, Request, Response, StatusValue};

use crate::error::{GatewayError, GatewayResult};

/// Pause between write attempts.
const WRITE_RETRY_PAUSE: Duration = Duration::from_millis(20);

/// The cluster-facing half of the gateway.
pub struct Router {
    whs: RwLock<HashSpace>,
    rhs: RwLock<HashSpace>,
    bus: Arc<dyn Bus>,
    replication: usize,
    write_retry: u32,
}

impl Router {
    pub fn new(nodes: Vec<NodeId>, replication: usize, write_retry: u32, bus: Arc<dyn Bus>) -> Self {
        let seed = HsSeed::bootstrap(nodes);
        Self {
            whs: RwLock::new(HashSpace::from_seed(&seed)),
            rhs: RwLock::new(HashSpace::from_seed(&seed)),
            bus,
            replication,
            write_retry,
        }
    }

    /// Fetches a key, falling back down the read-replica list.
    pub fn get(&self, key: &Bytes) -> GatewayResult<Option<Record>> {
        let h = stdhash(key);
        let replicas = self
            .rhs
            .read()
            .expect("rhs lock poisoned")
            .replicators_for(h, self.replication);
        if replicas.is_empty() {
            return Err(GatewayError::NoNodes);
        }

        let tried = replicas.len();
        for node in replicas {
            match self.bus.call(node, Request::Get { key: key.clone() }) {
                Ok(Response::Get(record)) => return Ok(record),
                Ok(other) => warn!(%node, tag = other.tag(), "unexpected reply to get"),
                Err(e) => debug!(%node, error = %e, "get failed, trying next replica"),
            }
        }
        Err(GatewayError::GetFailed { tried })
    }

    /// Stores a key through its write coordinator.
    pub fn set(&self, key: &Bytes, value: &Bytes) -> GatewayResult<ClockTime> {
        let h = stdhash(key);
        let mut attempts = 0u32;
        while attempts < self.write_retry {
            attempts += 1;
            let coordinator = self
                .whs
                .read()
                .expect("whs lock poisoned")
                .coordinator_for(h)
                .ok_or(GatewayError::NoNodes)?;
            let request = Request::Set {
                flags: StoreFlags::none(),
                key: key.clone(),
                value: value.clone(),
            };
            match self.bus.call(coordinator, request) {
                Ok(Response::Set(Some(clocktime))) => return Ok(clocktime),
                Ok(Response::Set(None)) => {
                    debug!(%coordinator, attempts, "coordinator refused the write");
                }
                Ok(other) => warn!(%coordinator, tag = other.tag(), "unexpected reply to set"),
                Err(e) => debug!(%coordinator, attempts, error = %e, "set failed"),
            }
            std::thread::sleep(WRITE_RETRY_PAUSE);
        }
        Err(GatewayError::StoreFailed { attempts })
    }

    /// Deletes a key through its write coordinator.
    ///
    /// Returns whether the key existed.
    pub fn delete(&self, key: &Bytes) -> GatewayResult<bool> {
        let h = stdhash(key);
        let mut attempts = 0u32;
        while attempts < self.write_retry {
            attempts += 1;
            let coordinator = self
                .whs
                .read()
                .expect("whs lock poisoned")
                .coordinator_for(h)
                .ok_or(GatewayError::NoNodes)?;
            let request = Request::Delete {
                flags: StoreFlags::none(),
                key: key.clone(),
            };
            match self.bus.call(coordinator, request) {
                Ok(Response::Delete(Some(deleted))) => return Ok(deleted),
                Ok(Response::Delete(None)) => {
                    debug!(%coordinator, attempts, "coordinator refused the delete");
                }
                Ok(other) => warn!(%coordinator, tag = other.tag(), "unexpected reply to delete"),
                Err(e) => debug!(%coordinator, attempts, error = %e, "delete failed"),
            }
            std::thread::sleep(WRITE_RETRY_PAUSE);
        }
        Err(GatewayError::DeleteFailed { attempts })
    }

    /// Polls the cluster for newer hash-space seeds.
    ///
    /// Asks each known node in turn until one answers; strictly newer
    /// seeds replace the local views, anything else is kept.
    pub fn refresh(&self) {
        let nodes: Vec<NodeId> = self
            .whs
            .read()
            .expect("whs lock poisoned")
            .active_nodes()
            .collect();
        for node in nodes {
            let wseed = match self.status_seed(node, StatusKind::Whs) {
                Some(seed) => seed,
                None => continue,
            };
            let rseed = self.status_seed(node, StatusKind::Rhs);

            self.adopt(&self.whs, &wseed);
            if let Some(rseed) = rseed {
                self.adopt(&self.rhs, &rseed);
            }
            return;
        }
        debug!("hash-space refresh found no responsive node");
    }

    fn status_seed(&self, node: NodeId, command: StatusKind) -> Option<HsSeed> {
        match self.bus.call(node, Request::GetStatus { command }) {
            Ok(Response::GetStatus(StatusValue::Seed(seed))) => Some(seed),
            Ok(other) => {
                warn!(%node, tag = other.tag(), "unexpected reply to status probe");
                None
            }
            Err(e) => {
                debug!(%node, error = %e, "status probe failed");
                None
            }
        }
    }

    fn adopt(&self, slot: &RwLock<HashSpace>, seed: &HsSeed) {
        let mut hs = slot.write().expect("hash space lock poisoned");
        if hs.seed().compare(seed) == SeedOrder::Newer {
            debug!(clocktime = %seed.clocktime, "adopting refreshed hash space");
            *hs = HashSpace::from_seed(seed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use galena_wire::WireResult;

    type Behavior = Box<dyn Fn(NodeId, &Request) -> WireResult<Response> + Send + Sync>;

    struct FakeBus {
        calls: Mutex<Vec<(NodeId, Request)>>,
        behavior: Behavior,
    }

    impl FakeBus {
        fn new(behavior: Behavior) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                behavior,
            })
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

    fn nodes(count: usize) -> Vec<NodeId> {
        (0..count)
            .map(|i| format!("127.0.0.1:{}", 19800 + i).parse().unwrap())
            .collect()
    }

    #[test]
    fn get_returns_first_answer() {
        let record = Record {
            value: Bytes::from_static(b"v"),
            clocktime: ClockTime::new(1, 1),
        };
        let expected = record.clone();
        let bus = FakeBus::new(Box::new(move |_, _| Ok(Response::Get(Some(record.clone())))));
        let router = Router::new(nodes(3), 3, 3, bus.clone());

        let got = router.get(&Bytes::from_static(b"k")).unwrap();
        assert_eq!(got, Some(expected));
        assert_eq!(bus.calls().len(), 1);
    }

    #[test]
    fn get_falls_back_across_replicas() {
        let flaky = FakeBus::new(Box::new(|node, _| {
            // Only one specific node answers; the rest are down.
            if node.addr().port() == 19801 {
                Ok(Response::Get(None))
            } else {
                Err(galena_wire::WireError::ConnectionClosed)
            }
        }));
        let router = Router::new(nodes(3), 3, 3, flaky.clone());

        // Whatever the replica order, the answering node is reached.
        let got = router.get(&Bytes::from_static(b"k")).unwrap();
        assert_eq!(got, None);
    }

    #[test]
    fn get_exhausting_replicas_is_an_error() {
        let bus = FakeBus::new(Box::new(|_, _| {
            Err(galena_wire::WireError::ConnectionClosed)
        }));
        let router = Router::new(nodes(2), 3, 3, bus);
        assert!(matches!(
            router.get(&Bytes::from_static(b"k")),
            Err(GatewayError::GetFailed { tried: 2 })
        ));
    }

    #[test]
    fn set_goes_to_the_coordinator() {
        let ct = ClockTime::new(2, 2);
        let bus = FakeBus::new(Box::new(move |_, request| {
            assert!(matches!(request, Request::Set { .. }));
            Ok(Response::Set(Some(ct)))
        }));
        let router = Router::new(nodes(3), 3, 3, bus.clone());

        let got = router
            .set(&Bytes::from_static(b"k"), &Bytes::from_static(b"v"))
            .unwrap();
        assert_eq!(got, ct);
        assert_eq!(bus.calls().len(), 1);
    }

    #[test]
    fn set_retries_then_fails() {
        let bus = FakeBus::new(Box::new(|_, _| Ok(Response::Set(None))));
        let router = Router::new(nodes(2), 3, 3, bus.clone());

        assert!(matches!(
            router.set(&Bytes::from_static(b"k"), &Bytes::from_static(b"v")),
            Err(GatewayError::StoreFailed { attempts: 3 })
        ));
        assert_eq!(bus.calls().len(), 3);
    }

    #[test]
    fn delete_maps_existence() {
        let bus = FakeBus::new(Box::new(|_, _| Ok(Response::Delete(Some(false)))));
        let router = Router::new(nodes(1), 3, 3, bus);
        assert!(!router.delete(&Bytes::from_static(b"k")).unwrap());
    }

    #[test]
    fn empty_cluster_is_an_error() {
        let bus = FakeBus::new(Box::new(|_, _| Ok(Response::KeepAlive)));
        let router = Router::new(Vec::new(), 3, 3, bus);
        assert!(matches!(
            router.get(&Bytes::from_static(b"k")),
            Err(GatewayError::NoNodes)
        ));
        assert!(matches!(
            router.set(&Bytes::from_static(b"k"), &Bytes::from_static(b"v")),
            Err(GatewayError::NoNodes)
        ));
    }

    #[test]
    fn refresh_adopts_strictly_newer_seeds_only() {
        let newer = {
            let mut seed = HsSeed::bootstrap(nodes(4));
            seed.clocktime = ClockTime::new(9, 9);
            seed
        };
        let reply_seed = newer.clone();
        let bus = FakeBus::new(Box::new(move |_, request| match request {
            Request::GetStatus { .. } => {
                Ok(Response::GetStatus(StatusValue::Seed(reply_seed.clone())))
            }
            _ => Ok(Response::KeepAlive),
        }));
        let router = Router::new(nodes(2), 3, 3, bus.clone());

        router.refresh();
        assert_eq!(
            router.whs.read().unwrap().seed().clocktime,
            ClockTime::new(9, 9)
        );
        assert_eq!(
            router
                .whs
                .read()
                .unwrap()
                .active_nodes()
                .count(),
            4
        );

        // A second refresh with the same clocktime changes nothing.
        router.refresh();
        assert_eq!(router.whs.read().unwrap().seed(), newer);
    }
}
