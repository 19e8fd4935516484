//! Networking utilities for the proxy.
//!
//! This library provides:
//! - Port ranges (`[min, max)`) parsed from `"min-max"` notation
//! - A concurrent port allocator handing out unclaimed ports of a range

use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rand::Rng;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

/// Networking errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PortError {
    /// Every port of the range is claimed.
    #[error("port range {0} exhausted")]
    Exhausted(PortRange),

    /// Invalid port range.
    #[error("invalid port range: {0}")]
    InvalidRange(String),

    /// The allocation worker is no longer running.
    #[error("port allocator stopped")]
    Stopped,
}

// ============================================================================
// Port ranges
// ============================================================================

/// A half-open port range `[min, max)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortRange {
    min: u16,
    max: u16,
}

impl PortRange {
    /// Range proxy ports are leased from unless configured otherwise.
    pub const DEFAULT: PortRange = PortRange {
        min: 2000,
        max: 3000,
    };

    /// Create a new range. `min` must be below `max`.
    pub fn new(min: u16, max: u16) -> Result<Self, PortError> {
        if min >= max {
            return Err(PortError::InvalidRange(format!(
                "{}-{} is empty (min must be below max)",
                min, max
            )));
        }
        Ok(Self { min, max })
    }

    /// First port of the range.
    pub fn min(&self) -> u16 {
        self.min
    }

    /// First port past the end of the range.
    pub fn max(&self) -> u16 {
        self.max
    }

    /// Number of ports in the range.
    pub fn len(&self) -> usize {
        usize::from(self.max - self.min)
    }

    /// Always false, a constructed range holds at least one port.
    pub fn is_empty(&self) -> bool {
        self.min >= self.max
    }

    /// Check if a port is within this range.
    pub fn contains(&self, port: u16) -> bool {
        (self.min..self.max).contains(&port)
    }
}

impl FromStr for PortRange {
    type Err = PortError;

    /// Parse from `min-max` notation (e.g., "2000-3000").
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((min_str, max_str)) = s.trim().split_once('-') else {
            return Err(PortError::InvalidRange(format!("missing '-' in {}", s)));
        };

        let min = min_str
            .trim()
            .parse::<u16>()
            .map_err(|_| PortError::InvalidRange(min_str.to_string()))?;
        let max = max_str
            .trim()
            .parse::<u16>()
            .map_err(|_| PortError::InvalidRange(max_str.to_string()))?;

        Self::new(min, max)
    }
}

impl std::fmt::Display for PortRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.min, self.max)
    }
}

// ============================================================================
// Claim bitset
// ============================================================================

/// One bit per offset of a range, set means claimed.
#[derive(Debug)]
struct ClaimSet {
    words: Vec<u64>,
    len: usize,
    count: usize,
}

impl ClaimSet {
    fn new(len: usize) -> Self {
        Self {
            words: vec![0; len.div_ceil(64)],
            len,
            count: 0,
        }
    }

    fn is_set(&self, offset: usize) -> bool {
        self.words[offset / 64] & (1u64 << (offset % 64)) != 0
    }

    fn set(&mut self, offset: usize) {
        if !self.is_set(offset) {
            self.words[offset / 64] |= 1u64 << (offset % 64);
            self.count += 1;
        }
    }

    fn clear(&mut self, offset: usize) {
        if self.is_set(offset) {
            self.words[offset / 64] &= !(1u64 << (offset % 64));
            self.count -= 1;
        }
    }

    /// Claim the first free offset, starting at `start` and wrapping around.
    fn claim_from(&mut self, start: usize) -> Option<usize> {
        let offset = (start..self.len)
            .chain(0..start)
            .find(|&offset| !self.is_set(offset))?;
        self.set(offset);
        Some(offset)
    }
}

// ============================================================================
// Port allocator
// ============================================================================

type AssignRequest = oneshot::Sender<Option<u16>>;

/// Hands out unclaimed ports of a range.
///
/// A single worker task owns the "find a free port and claim it" step, and
/// callers are served through its request channel one at a time. The claim
/// bitset has its own lock so [`PortAllocator::release`] never waits on the
/// worker.
///
/// Must be created inside a tokio runtime. The worker stops once the
/// allocator is dropped.
#[derive(Debug)]
pub struct PortAllocator {
    range: PortRange,
    claimed: Arc<Mutex<ClaimSet>>,
    requests: mpsc::Sender<AssignRequest>,
}

impl PortAllocator {
    /// Create an allocator for `range` and start its worker.
    pub fn new(range: PortRange) -> Self {
        let claimed = Arc::new(Mutex::new(ClaimSet::new(range.len())));
        let (requests, rx) = mpsc::channel(1);

        tokio::spawn(run_worker(range, Arc::clone(&claimed), rx));

        Self {
            range,
            claimed,
            requests,
        }
    }

    /// Claim the next free port, waiting for the worker to pick one.
    pub async fn assign_next(&self) -> Result<u16, PortError> {
        let (reply, answer) = oneshot::channel();
        self.requests
            .send(reply)
            .await
            .map_err(|_| PortError::Stopped)?;

        match answer.await {
            Ok(Some(port)) => Ok(port),
            Ok(None) => Err(PortError::Exhausted(self.range)),
            Err(_) => Err(PortError::Stopped),
        }
    }

    /// Return a port to the pool. Ports outside the range are ignored.
    pub fn release(&self, port: u16) {
        release_port(&self.range, &self.claimed, port);
    }

    /// Get the range being allocated from.
    pub fn range(&self) -> PortRange {
        self.range
    }

    /// Number of ports currently claimed.
    pub fn claimed_count(&self) -> usize {
        lock(&self.claimed).count
    }

    /// Check if a port is currently claimed.
    pub fn is_claimed(&self, port: u16) -> bool {
        self.range.contains(port) && lock(&self.claimed).is_set(offset_of(&self.range, port))
    }
}

fn lock(claimed: &Mutex<ClaimSet>) -> MutexGuard<'_, ClaimSet> {
    claimed.lock().unwrap_or_else(PoisonError::into_inner)
}

fn offset_of(range: &PortRange, port: u16) -> usize {
    usize::from(port - range.min)
}

fn release_port(range: &PortRange, claimed: &Mutex<ClaimSet>, port: u16) {
    if !range.contains(port) {
        return;
    }
    lock(claimed).clear(offset_of(range, port));
}

/// Pick a random start offset and claim the first free port from there.
fn next_port(range: &PortRange, claimed: &Mutex<ClaimSet>) -> Option<u16> {
    let start = rand::rng().random_range(0..range.len());
    let offset = lock(claimed).claim_from(start)?;
    // offset < range.len() <= u16::MAX - min
    Some(range.min + offset as u16)
}

async fn run_worker(
    range: PortRange,
    claimed: Arc<Mutex<ClaimSet>>,
    mut requests: mpsc::Receiver<AssignRequest>,
) {
    while let Some(reply) = requests.recv().await {
        let port = next_port(&range, &claimed);
        if let Err(Some(port)) = reply.send(port) {
            // Caller gave up before receiving; the claim must not leak.
            debug!(port, "Port assignment abandoned, releasing");
            release_port(&range, &claimed, port);
        }
    }
    debug!(range = %range, "Port allocator worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_port_range_parse() {
        let range: PortRange = "2000-3000".parse().unwrap();
        assert_eq!(range.min(), 2000);
        assert_eq!(range.max(), 3000);
        assert_eq!(range, PortRange::DEFAULT);
        assert_eq!(range.len(), 1000);
        assert!(range.contains(2000));
        assert!(!range.contains(3000));

        assert!("3000-2000".parse::<PortRange>().is_err());
        assert!("2000".parse::<PortRange>().is_err());
        assert!("a-b".parse::<PortRange>().is_err());
        assert!("2000-2000".parse::<PortRange>().is_err());
    }

    #[test]
    fn test_claim_set_wraps_around() {
        let mut set = ClaimSet::new(4);
        set.set(2);
        set.set(3);
        assert_eq!(set.claim_from(2), Some(0));
        assert_eq!(set.claim_from(3), Some(1));
        assert_eq!(set.claim_from(0), None);
        assert_eq!(set.count, 4);

        set.clear(1);
        set.clear(1);
        assert_eq!(set.count, 3);
        assert_eq!(set.claim_from(3), Some(1));
    }

    /// Claim `n` ports from concurrent tasks; every claim must succeed.
    async fn claim_concurrently(allocator: &Arc<PortAllocator>, n: usize) -> HashSet<u16> {
        let mut handles = Vec::new();
        for _ in 0..n {
            let allocator = Arc::clone(allocator);
            handles.push(tokio::spawn(async move { allocator.assign_next().await }));
        }

        let mut ports = HashSet::new();
        for handle in handles {
            let port = handle.await.unwrap().unwrap();
            assert!(allocator.range().contains(port));
            assert!(ports.insert(port), "port {} handed out twice", port);
        }
        ports
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_assign_full_range() {
        let allocator = Arc::new(PortAllocator::new(PortRange::new(2000, 3000).unwrap()));

        let ports = claim_concurrently(&allocator, 1000).await;
        assert_eq!(ports.len(), 1000);
        assert_eq!(allocator.claimed_count(), 1000);

        assert_eq!(
            allocator.assign_next().await,
            Err(PortError::Exhausted(allocator.range()))
        );

        for port in &ports {
            allocator.release(*port);
        }
        assert_eq!(allocator.claimed_count(), 0);

        let again = claim_concurrently(&allocator, 1000).await;
        assert_eq!(again.len(), 1000);
        assert_eq!(allocator.claimed_count(), 1000);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_assign_all_release_all() {
        let allocator = Arc::new(PortAllocator::new(PortRange::new(2000, 2500).unwrap()));

        let mut handles = Vec::new();
        for _ in 0..500 {
            let allocator = Arc::clone(&allocator);
            handles.push(tokio::spawn(async move { allocator.assign_next().await }));
        }
        for handle in handles {
            let port = handle.await.unwrap().unwrap();
            allocator.release(port);
        }
        assert_eq!(allocator.claimed_count(), 0);

        let port = allocator.assign_next().await.unwrap();
        assert!(allocator.is_claimed(port));
    }

    #[tokio::test]
    async fn test_release_outside_range_is_noop() {
        let allocator = PortAllocator::new(PortRange::new(2000, 2002).unwrap());
        let a = allocator.assign_next().await.unwrap();
        let b = allocator.assign_next().await.unwrap();
        assert_ne!(a, b);

        allocator.release(1999);
        allocator.release(2002);
        assert_eq!(allocator.claimed_count(), 2);
        assert!(!allocator.is_claimed(2002));

        allocator.release(a);
        assert_eq!(allocator.assign_next().await, Ok(a));
    }
}
