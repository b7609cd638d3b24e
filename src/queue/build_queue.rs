//! # Build Queue
//!
//! Coda delle build in attesa di un worker.
//!
//! ## Responsabilità:
//! - FIFO, ma un job il cui sito ha il workspace occupato resta in coda
//! - Lock a tempo per ogni job in esecuzione, rinnovato dagli heartbeat
//! - Canale di cancellazione creato insieme al claim, quindi segnalabile da subito
//! - Lock scaduto = job in stallo: torna in coda fino a `max_attempts`
//! - Rimozione dei job non ancora partiti quando un sito viene cancellato

use crate::config::Config;
use crate::pipeline::collaborators::Site;
use crate::pipeline::orchestrator::{CancelReason, CancelReceiver};
use crate::pipeline::workspace::{WorkspaceLease, WorkspaceManager};
use crate::queue::QueueError;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct Job {
    pub id: Uuid,
    pub build_id: Uuid,
    pub site: Site,
    /// Claims so far
    pub attempts: u32,
    pub enqueued_at: DateTime<Utc>,
    not_before: Option<Instant>,
}

impl Job {
    fn new(build_id: Uuid, site: Site) -> Self {
        Self {
            id: Uuid::new_v4(),
            build_id,
            site,
            attempts: 0,
            enqueued_at: Utc::now(),
            not_before: None,
        }
    }

    fn is_ready(&self, now: Instant) -> bool {
        self.not_before.map_or(true, |t| t <= now)
    }
}

/// What the reaper did with an expired job
#[derive(Debug, Clone)]
pub enum ReapOutcome {
    /// Out of the active set; goes back to pending through `requeue`
    Retry(Job),
    Exhausted(Job),
}

/// A claimed job with everything its worker needs to run it
pub struct Claim {
    pub job: Job,
    pub lease: WorkspaceLease,
    pub cancel: CancelReceiver,
}

struct ActiveJob {
    job: Job,
    worker: usize,
    expires_at: Instant,
    cancel: watch::Sender<Option<CancelReason>>,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Job>,
    active: HashMap<Uuid, ActiveJob>,
    closed: bool,
}

pub struct BuildQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    lock_timeout: Duration,
    max_attempts: u32,
}

impl BuildQueue {
    pub fn new(lock_timeout: Duration, max_attempts: u32) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            lock_timeout,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.lock_timeout(), config.max_attempts)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn enqueue(&self, build_id: Uuid, site: Site) -> Result<Job, QueueError> {
        let job = Job::new(build_id, site);
        {
            let mut state = self.state();
            if state.closed {
                return Err(QueueError::Closed);
            }
            state.pending.push_back(job.clone());
        }
        debug!("📥 Job {} enqueued for build {}", job.id, build_id);
        self.notify.notify_one();
        Ok(job)
    }

    /// First ready job whose site workspace is free, with the workspace lease
    pub fn claim(&self, worker: usize, workspaces: &WorkspaceManager) -> Option<Claim> {
        let mut state = self.state();
        if state.closed {
            return None;
        }
        let now = Instant::now();
        let (index, lease) = state.pending.iter().enumerate().find_map(|(index, job)| {
            if !job.is_ready(now) {
                return None;
            }
            workspaces.try_acquire(&job.site.id).map(|lease| (index, lease))
        })?;

        let mut job = state.pending.remove(index)?;
        job.attempts += 1;
        job.not_before = None;
        let (cancel_tx, cancel) = watch::channel(None);
        state.active.insert(
            job.id,
            ActiveJob {
                job: job.clone(),
                worker,
                expires_at: now + self.lock_timeout,
                cancel: cancel_tx,
            },
        );
        debug!("🔒 Worker {} claimed job {} (attempt {})", worker, job.id, job.attempts);
        Some(Claim { job, lease, cancel })
    }

    /// Whether `worker` still holds the lock of `job_id`
    pub fn holds(&self, job_id: Uuid, worker: usize) -> bool {
        self.state().active.get(&job_id).map_or(false, |active| active.worker == worker)
    }

    /// Signal every active job of `build_id`; false when none is active
    pub fn cancel(&self, build_id: Uuid, reason: CancelReason) -> bool {
        let state = self.state();
        let mut signalled = false;
        for active in state.active.values().filter(|active| active.job.build_id == build_id) {
            signalled |= active.cancel.send(Some(reason)).is_ok();
        }
        signalled
    }

    /// Renew the lock of a running job
    pub fn heartbeat(&self, job_id: Uuid, worker: usize) -> Result<(), QueueError> {
        let mut state = self.state();
        let active = state.active.get_mut(&job_id).ok_or(QueueError::UnknownJob(job_id))?;
        if active.worker != worker {
            return Err(QueueError::LockLost { job: job_id, holder: active.worker });
        }
        active.expires_at = Instant::now() + self.lock_timeout;
        Ok(())
    }

    /// Drop a finished job; ignored when the lock went to someone else
    pub fn complete(&self, job_id: Uuid, worker: usize) -> bool {
        let mut state = self.state();
        match state.active.get(&job_id) {
            Some(active) if active.worker == worker => {
                state.active.remove(&job_id);
                true
            }
            _ => false,
        }
    }

    /// Put an active job back with a delay, unless it is out of attempts
    pub fn retry_later(&self, job_id: Uuid, worker: usize, delay: Duration) -> Result<Job, QueueError> {
        let mut state = self.state();
        match state.active.get(&job_id) {
            Some(active) if active.worker == worker => {}
            Some(active) => return Err(QueueError::LockLost { job: job_id, holder: active.worker }),
            None => return Err(QueueError::UnknownJob(job_id)),
        }
        let Some(ActiveJob { mut job, .. }) = state.active.remove(&job_id) else {
            return Err(QueueError::UnknownJob(job_id));
        };
        if job.attempts >= self.max_attempts {
            return Err(QueueError::Exhausted { job: job_id, attempts: job.attempts });
        }
        job.not_before = Some(Instant::now() + delay);
        state.pending.push_back(job.clone());
        drop(state);
        self.notify.notify_one();
        Ok(job)
    }

    /// Release every job whose lock expired, deciding retry or give up
    pub fn reap_expired(&self) -> Vec<ReapOutcome> {
        let mut state = self.state();
        let now = Instant::now();
        let expired: Vec<Uuid> = state
            .active
            .iter()
            .filter(|(_, active)| active.expires_at <= now)
            .map(|(id, _)| *id)
            .collect();

        let mut outcomes = Vec::new();
        for id in expired {
            let Some(active) = state.active.remove(&id) else {
                continue;
            };
            let job = active.job;
            if job.attempts < self.max_attempts {
                warn!("⏰ Job {} stalled on worker {}, will retry", job.id, active.worker);
                outcomes.push(ReapOutcome::Retry(job));
            } else {
                warn!("⏰ Job {} stalled after {} attempts, giving up", job.id, job.attempts);
                outcomes.push(ReapOutcome::Exhausted(job));
            }
        }
        outcomes
    }

    /// Put a reaped job at the front of the queue
    pub fn requeue(&self, job: Job) -> Result<(), QueueError> {
        {
            let mut state = self.state();
            if state.closed {
                return Err(QueueError::Closed);
            }
            state.pending.push_front(job);
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Jobs of a site that never started
    pub fn remove_pending_for_site(&self, site_id: &str) -> Vec<Job> {
        let mut state = self.state();
        let (removed, kept): (Vec<Job>, Vec<Job>) = state.pending.drain(..).partition(|job| job.site.id == site_id);
        state.pending = kept.into();
        if !removed.is_empty() {
            info!("🗑️  Removed {} pending jobs for {}", removed.len(), site_id);
        }
        removed
    }

    pub fn remove_pending_build(&self, build_id: Uuid) -> Option<Job> {
        let mut state = self.state();
        let index = state.pending.iter().position(|job| job.build_id == build_id)?;
        state.pending.remove(index)
    }

    pub fn active_builds(&self) -> Vec<Uuid> {
        self.state().active.values().map(|active| active.job.build_id).collect()
    }

    pub fn active_builds_for_site(&self, site_id: &str) -> Vec<Uuid> {
        self.state()
            .active
            .values()
            .filter(|active| active.job.site.id == site_id)
            .map(|active| active.job.build_id)
            .collect()
    }

    /// Active jobs held by `worker`
    pub fn jobs_of(&self, worker: usize) -> Vec<Uuid> {
        self.state()
            .active
            .iter()
            .filter(|(_, active)| active.worker == worker)
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn pending_len(&self) -> usize {
        self.state().pending.len()
    }

    pub fn active_len(&self) -> usize {
        self.state().active.len()
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    /// Resolves on enqueue, requeue or close
    pub async fn notified(&self) {
        self.notify.notified().await
    }

    pub fn close(&self) {
        self.state().closed = true;
        self.notify.notify_waiters();
    }
}
