//! # galena-types: Core types for `Galena`
//!
//! This crate contains shared types used across the `Galena` system:
//! - Logical time ([`ClockTime`], [`LogicalClock`])
//! - Key fingerprints ([`KeyHash`], [`stdhash`])
//! - Node identity ([`NodeId`])
//! - Operation flag bitfields ([`StoreFlags`], [`ReplicateFlags`])
//! - Control-surface enums ([`StatusKind`], [`ConfigKind`])

use std::fmt::{self, Debug, Display};
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// Logical time
// ============================================================================

/// A 64-bit logical timestamp stamped on every write.
///
/// The high 32 bits carry wall-clock seconds, the low 32 bits the node's
/// logical clock at stamp time. Comparing two `ClockTime`s therefore
/// prefers wall time and falls back to the logical clock to break ties,
/// giving a total order that resolves last-writer-wins everywhere.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct ClockTime(u64);

impl ClockTime {
    pub const ZERO: ClockTime = ClockTime(0);

    /// Combines wall-clock seconds and a logical clock value.
    pub fn new(secs: u32, clock: u32) -> Self {
        Self((u64::from(secs) << 32) | u64::from(clock))
    }

    /// Returns the wall-clock half (seconds).
    pub fn secs(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Returns the logical-clock half.
    pub fn clock(self) -> u32 {
        (self.0 & 0xFFFF_FFFF) as u32
    }

    /// Returns the raw 64-bit value.
    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// The current wall clock combined with the given logical clock.
    pub fn now(clock: u32) -> Self {
        Self::new(unix_secs(), clock)
    }
}

impl Display for ClockTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.secs(), self.clock())
    }
}

impl From<u64> for ClockTime {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<ClockTime> for u64 {
    fn from(ct: ClockTime) -> Self {
        ct.0
    }
}

/// The node-local logical clock.
///
/// Every outgoing cluster message carries `tick()` as its `adjust_clock`;
/// every incoming message merges the remote value with `merge()`. The
/// clock only moves forward.
///
/// `stamp()` issues write timestamps and additionally guarantees strict
/// monotonicity across calls on the same node, even when the wall clock
/// does not advance between two writes.
#[derive(Debug, Default)]
pub struct LogicalClock {
    clock: AtomicU32,
    last_issued: AtomicU64,
}

impl LogicalClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advances the logical clock and returns the pre-increment value.
    pub fn tick(&self) -> u32 {
        self.clock.fetch_add(1, Ordering::SeqCst)
    }

    /// Returns the current logical clock without advancing it.
    pub fn get(&self) -> u32 {
        self.clock.load(Ordering::SeqCst)
    }

    /// Merges a remote clock value observed on an incoming message.
    pub fn merge(&self, remote: u32) {
        self.clock.fetch_max(remote, Ordering::SeqCst);
    }

    /// Issues a write timestamp strictly greater than any previously issued.
    pub fn stamp(&self) -> ClockTime {
        let candidate = ClockTime::new(unix_secs(), self.tick()).as_u64();
        let mut last = self.last_issued.load(Ordering::SeqCst);
        loop {
            let next = candidate.max(last + 1);
            match self.last_issued.compare_exchange_weak(
                last,
                next,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return ClockTime::from(next),
                Err(observed) => last = observed,
            }
        }
    }

    /// Records an externally observed timestamp so future stamps sort after it.
    pub fn observe(&self, ct: ClockTime) {
        self.last_issued.fetch_max(ct.as_u64(), Ordering::SeqCst);
        self.merge(ct.clock());
    }
}

fn unix_secs() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs() as u32)
}

// ============================================================================
// Key fingerprints
// ============================================================================

/// The 64-bit fingerprint of a client key.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct KeyHash(u64);

impl KeyHash {
    pub fn new(h: u64) -> Self {
        Self(h)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl Display for KeyHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl From<u64> for KeyHash {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Maps a key to its 64-bit fingerprint.
///
/// Equal byte sequences map to equal hashes on every node, across runs
/// and across architectures. All partitioning decisions key off this
/// value, so it must never change once a cluster is deployed.
pub fn stdhash(key: &[u8]) -> KeyHash {
    KeyHash(rapidhash::rapidhash(key))
}

// ============================================================================
// Node identity
// ============================================================================

/// Identity of a cluster node: its RPC listen address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(SocketAddr);

impl NodeId {
    pub fn new(addr: SocketAddr) -> Self {
        Self(addr)
    }

    pub fn addr(self) -> SocketAddr {
        self.0
    }

    /// Returns the same host with a different port.
    ///
    /// Used to derive the offer-stream address from the RPC address.
    pub fn with_port(self, port: u16) -> Self {
        let mut addr = self.0;
        addr.set_port(port);
        Self(addr)
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<SocketAddr> for NodeId {
    fn from(addr: SocketAddr) -> Self {
        Self(addr)
    }
}

impl FromStr for NodeId {
    type Err = std::net::AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<SocketAddr>().map(NodeId)
    }
}

// ============================================================================
// Operation flags
// ============================================================================

/// Flags carried on client-facing `Set`/`Delete` operations.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default,
)]
pub struct StoreFlags(u16);

impl StoreFlags {
    /// The write returns after local commit, before replica acks.
    pub const ASYNC: StoreFlags = StoreFlags(0x01);

    pub fn none() -> Self {
        Self(0)
    }

    pub fn is_async(self) -> bool {
        self.0 & Self::ASYNC.0 != 0
    }

    pub fn bits(self) -> u16 {
        self.0
    }
}

impl From<u16> for StoreFlags {
    fn from(bits: u16) -> Self {
        Self(bits)
    }
}

/// Flags carried on `ReplicateSet`/`ReplicateDelete`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default,
)]
pub struct ReplicateFlags(u8);

impl ReplicateFlags {
    /// The replication was computed against the read view.
    pub const BY_RHS: ReplicateFlags = ReplicateFlags(0x01);

    pub fn none() -> Self {
        Self(0)
    }

    pub fn by_rhs() -> Self {
        Self::BY_RHS
    }

    pub fn is_rhs(self) -> bool {
        self.0 & Self::BY_RHS.0 != 0
    }

    pub fn bits(self) -> u8 {
        self.0
    }
}

impl From<u8> for ReplicateFlags {
    fn from(bits: u8) -> Self {
        Self(bits)
    }
}

// ============================================================================
// Control surface
// ============================================================================

/// Unknown numeric code received on the control surface.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown control code: {0}")]
pub struct UnknownCode(pub u32);

/// Status item selector for `GetStatus`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u32", try_from = "u32")]
pub enum StatusKind {
    Pid = 0,
    Uptime = 1,
    Time = 2,
    Version = 3,
    CmdGet = 4,
    CmdSet = 5,
    CmdDelete = 6,
    DbItems = 7,
    ClockTime = 8,
    Rhs = 9,
    Whs = 10,
}

impl From<StatusKind> for u32 {
    fn from(kind: StatusKind) -> Self {
        kind as u32
    }
}

impl TryFrom<u32> for StatusKind {
    type Error = UnknownCode;

    fn try_from(code: u32) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(Self::Pid),
            1 => Ok(Self::Uptime),
            2 => Ok(Self::Time),
            3 => Ok(Self::Version),
            4 => Ok(Self::CmdGet),
            5 => Ok(Self::CmdSet),
            6 => Ok(Self::CmdDelete),
            7 => Ok(Self::DbItems),
            8 => Ok(Self::ClockTime),
            9 => Ok(Self::Rhs),
            10 => Ok(Self::Whs),
            other => Err(UnknownCode(other)),
        }
    }
}

/// Runtime tunable selector for `SetConfig`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u32", try_from = "u32")]
pub enum ConfigKind {
    TcpNodelay = 0,
}

impl From<ConfigKind> for u32 {
    fn from(kind: ConfigKind) -> Self {
        kind as u32
    }
}

impl TryFrom<u32> for ConfigKind {
    type Error = UnknownCode;

    fn try_from(code: u32) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(Self::TcpNodelay),
            other => Err(UnknownCode(other)),
        }
    }
}
