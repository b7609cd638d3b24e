//! # Periodic Scheduler
//!
//! Ripete i confronti di performance (prima/dopo l'ottimizzazione) per i siti
//! registrati, a intervallo fisso. L'ultimo risultato per sito resta
//! consultabile.

use crate::error::OptimizeError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceComparison {
    pub site_id: String,
    /// Score of the original site, 0-100
    pub baseline_score: f64,
    /// Score of the optimized deploy, 0-100
    pub optimized_score: f64,
    pub measured_at: DateTime<Utc>,
}

impl PerformanceComparison {
    pub fn improvement(&self) -> f64 {
        self.optimized_score - self.baseline_score
    }
}

#[async_trait]
pub trait PerformanceComparer: Send + Sync {
    async fn compare(&self, site_id: &str) -> Result<PerformanceComparison, OptimizeError>;
}

struct SchedulerInner {
    comparer: Arc<dyn PerformanceComparer>,
    sites: RwLock<BTreeSet<String>>,
    latest: RwLock<HashMap<String, PerformanceComparison>>,
}

impl SchedulerInner {
    async fn run_once(&self) -> Vec<PerformanceComparison> {
        let sites: Vec<String> = self.sites.read().await.iter().cloned().collect();
        let mut results = Vec::new();
        for site_id in sites {
            match self.comparer.compare(&site_id).await {
                Ok(comparison) => {
                    debug!("📊 {} improved by {:.1} points", site_id, comparison.improvement());
                    self.latest.write().await.insert(site_id, comparison.clone());
                    results.push(comparison);
                }
                Err(e) => warn!("⚠️  Performance comparison for {} failed: {}", site_id, e),
            }
        }
        results
    }
}

pub struct PeriodicScheduler {
    inner: Arc<SchedulerInner>,
    period: Duration,
    shutdown: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl PeriodicScheduler {
    pub fn new(comparer: Arc<dyn PerformanceComparer>, period: Duration) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(SchedulerInner {
                comparer,
                sites: RwLock::new(BTreeSet::new()),
                latest: RwLock::new(HashMap::new()),
            }),
            period,
            shutdown,
            handle: Mutex::new(None),
        }
    }

    pub async fn watch_site(&self, site_id: &str) {
        self.inner.sites.write().await.insert(site_id.to_string());
    }

    pub async fn unwatch_site(&self, site_id: &str) {
        self.inner.sites.write().await.remove(site_id);
        self.inner.latest.write().await.remove(site_id);
    }

    pub async fn latest(&self, site_id: &str) -> Option<PerformanceComparison> {
        self.inner.latest.read().await.get(site_id).cloned()
    }

    /// Compare every watched site now
    pub async fn run_once(&self) -> Vec<PerformanceComparison> {
        self.inner.run_once().await
    }

    /// First run after one full period
    pub fn start(&self) {
        let mut handle = self.handle.lock().unwrap_or_else(|e| e.into_inner());
        if handle.is_some() {
            return;
        }
        let inner = self.inner.clone();
        let period = self.period;
        let mut shutdown = self.shutdown.subscribe();
        *handle = Some(tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let results = inner.run_once().await;
                        debug!("Scheduled comparison round finished with {} results", results.len());
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        }));
        info!("⏱️  Performance comparisons every {:?}", period);
    }

    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        let handle = self.handle.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("⚠️  Scheduler task ended abnormally: {}", e);
            }
        }
    }
}
