//! Runtime configuration.
//!
//! Every protocol constant lives here rather than as a hard-coded value so that
//! deployments (and tests) can tune bucket size, parallelism and timing.

use std::time::Duration;

use crate::error::{DhtError, Result};
use crate::identity::NodeId;

/// Default Kademlia replication factor (bucket size).
pub const DEFAULT_K: usize = 20;

/// Default lookup parallelism.
pub const DEFAULT_ALPHA: usize = 3;

/// Default replacement cache size per bucket.
pub const DEFAULT_CACHE_SIZE: usize = 20;

/// Buckets not covering the local node stop splitting when their depth is a
/// multiple of this value.
pub const DEFAULT_DEPTH_LIMIT: usize = 4;

#[derive(Clone, Debug)]
pub struct DhtConfig {
    /// Fixed node id. When `None`, the id is derived from the keypair.
    pub node_id: Option<NodeId>,
    pub k: usize,
    pub alpha: usize,
    pub cache_size: usize,
    pub depth_limit: usize,

    /// Time to wait for a single response before resending.
    pub request_timeout: Duration,
    /// Resends after the first attempt.
    pub max_retries: u32,
    /// Failed RPCs after which a contact is declared dead.
    pub max_node_failures: u32,
    /// Beyond this many failures in a row the local node assumes it is offline
    /// and stops penalizing contacts.
    pub max_consecutive_failures: u32,

    pub lookup_timeout: Duration,
    pub boost_interval: Duration,
    pub boost_timeout: Duration,

    pub refresh_interval: Duration,
    pub bucket_stale_after: Duration,
    pub contact_stale_after: Duration,
    pub max_refresh_pings: usize,

    pub record_ttl: Duration,
    pub cleaner_interval: Duration,
    pub max_records: usize,

    /// Re-store a found value at the closest node that did not have it.
    pub cache_at_nonholder: bool,
    /// Network master key. When set, only records published under it are accepted.
    pub trusted_publisher: Option<[u8; 32]>,
    /// Shutdown notices go to `shutdown_multiplier * k` live contacts.
    pub shutdown_multiplier: usize,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            node_id: None,
            k: DEFAULT_K,
            alpha: DEFAULT_ALPHA,
            cache_size: DEFAULT_CACHE_SIZE,
            depth_limit: DEFAULT_DEPTH_LIMIT,
            request_timeout: Duration::from_secs(5),
            max_retries: 1,
            max_node_failures: 3,
            max_consecutive_failures: 100,
            lookup_timeout: Duration::from_secs(30),
            boost_interval: Duration::from_secs(1),
            boost_timeout: Duration::from_secs(3),
            refresh_interval: Duration::from_secs(5 * 60),
            bucket_stale_after: Duration::from_secs(30 * 60),
            contact_stale_after: Duration::from_secs(15 * 60),
            max_refresh_pings: 10,
            record_ttl: Duration::from_secs(60 * 60),
            cleaner_interval: Duration::from_secs(5 * 60),
            max_records: 10_000,
            cache_at_nonholder: true,
            trusted_publisher: None,
            shutdown_multiplier: 2,
        }
    }
}

impl DhtConfig {
    pub fn validate(&self) -> Result<()> {
        if self.k == 0 {
            return Err(DhtError::Config("k must be at least 1".into()));
        }
        if self.alpha == 0 {
            return Err(DhtError::Config("alpha must be at least 1".into()));
        }
        if self.depth_limit == 0 {
            return Err(DhtError::Config("depth_limit must be at least 1".into()));
        }
        if self.max_node_failures == 0 {
            return Err(DhtError::Config("max_node_failures must be at least 1".into()));
        }
        if self.request_timeout.is_zero() {
            return Err(DhtError::Config("request_timeout must be non-zero".into()));
        }
        if self.refresh_interval.is_zero() || self.cleaner_interval.is_zero() {
            return Err(DhtError::Config("maintenance intervals must be non-zero".into()));
        }
        if self.max_records == 0 {
            return Err(DhtError::Config("max_records must be at least 1".into()));
        }
        Ok(())
    }
}
