//! Periodic bucket maintenance.
//!
//! Each pass pings contacts that have been quiet for `contact_stale_after`,
//! then runs a node lookup for a random id inside every bucket that has not
//! been touched for `bucket_stale_after`. Only one pass runs at a time; a
//! timer tick that lands while a pass is still running is skipped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace};

use crate::dht::DhtNode;
use crate::lookup::LookupKind;
use crate::protocols::DhtNodeRpc;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RefreshReport {
    pub pinged: usize,
    pub unresponsive: usize,
    pub buckets_refreshed: usize,
    pub elapsed: Duration,
    /// Another pass was already running.
    pub skipped: bool,
}

impl RefreshReport {
    fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }
}

struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct BucketRefresher<N: DhtNodeRpc> {
    dht: DhtNode<N>,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl<N: DhtNodeRpc> BucketRefresher<N> {
    pub fn new(dht: DhtNode<N>) -> Self {
        Self {
            dht,
            running: Arc::new(AtomicBool::new(false)),
            handle: None,
        }
    }

    /// Run a pass every `refresh_interval`. Restarting replaces the old timer.
    pub fn start(&mut self) {
        self.stop();
        let dht = self.dht.clone();
        let running = Arc::clone(&self.running);
        let period = dht.config().refresh_interval;
        self.handle = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval.tick().await;
            loop {
                interval.tick().await;
                let report = refresh_pass(&dht, &running).await;
                if !report.skipped {
                    debug!(
                        pinged = report.pinged,
                        unresponsive = report.unresponsive,
                        buckets = report.buckets_refreshed,
                        "bucket refresh finished"
                    );
                }
            }
        }));
    }

    pub fn is_started(&self) -> bool {
        self.handle.as_ref().map_or(false, |h| !h.is_finished())
    }

    pub async fn refresh_once(&self) -> RefreshReport {
        refresh_pass(&self.dht, &self.running).await
    }

    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

impl<N: DhtNodeRpc> Drop for BucketRefresher<N> {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn refresh_pass<N: DhtNodeRpc>(dht: &DhtNode<N>, running: &AtomicBool) -> RefreshReport {
    if running
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        trace!("refresh already in progress");
        return RefreshReport::skipped();
    }
    let _guard = RunningGuard(running);
    let started = Instant::now();
    let config = dht.config();

    let stale = dht
        .stale_contacts(config.contact_stale_after, config.max_refresh_pings)
        .await;
    let mut report = RefreshReport::default();
    for contact in &stale {
        report.pinged += 1;
        if dht.ping_contact(contact).await.is_err() {
            report.unresponsive += 1;
        }
    }

    for id in dht.refresh_ids(false).await {
        match dht.lookup(id, LookupKind::Node, config.lookup_timeout).await {
            Ok(_) => report.buckets_refreshed += 1,
            Err(e) => trace!(bucket = %id.short(), error = %e, "refresh lookup failed"),
        }
        dht.mark_refreshed(id).await;
    }

    report.elapsed = started.elapsed();
    report
}
