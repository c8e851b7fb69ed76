//! Named periodic maintenance jobs
//!
//! The registry guarantees at most one live task per job name. Registering a
//! name that is already taken aborts the earlier task before the new one runs.

use chrono::{DateTime, Duration as ChronoDuration, NaiveTime, Utc};
use dashmap::DashMap;
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Name of the daily Docker prune job
pub const DOCKER_CLEANUP_JOB: &str = "docker-cleanup";

/// When a job fires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    /// Once a day at the given UTC wall-clock time
    DailyAt(NaiveTime),
    /// At a fixed interval, first run one interval after registration
    Every(Duration),
}

impl Schedule {
    /// Midnight UTC, every day
    pub fn daily_midnight() -> Self {
        Schedule::DailyAt(NaiveTime::MIN)
    }

    /// Instant of the next run strictly after `now`
    pub fn next_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match *self {
            Schedule::DailyAt(time) => {
                let today = now.date_naive().and_time(time).and_utc();
                if today > now {
                    today
                } else {
                    today + ChronoDuration::days(1)
                }
            }
            Schedule::Every(interval) => ChronoDuration::from_std(interval)
                .ok()
                .and_then(|step| now.checked_add_signed(step))
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }

    /// How long to sleep from `now` until the next run
    pub fn delay_from(&self, now: DateTime<Utc>) -> Duration {
        match *self {
            Schedule::Every(interval) => interval,
            Schedule::DailyAt(_) => (self.next_after(now) - now).to_std().unwrap_or(Duration::ZERO),
        }
    }
}

/// Process-wide registry of scheduled jobs keyed by name
#[derive(Default)]
pub struct JobRegistry {
    jobs: DashMap<String, JoinHandle<()>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `job` under `name`, replacing any job already registered there.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn register<F, Fut>(&self, name: &str, schedule: Schedule, job: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let job_name = name.to_string();
        let handle = tokio::spawn(async move {
            loop {
                let delay = schedule.delay_from(Utc::now());
                debug!(job = %job_name, delay_secs = delay.as_secs(), "Waiting for next run");
                tokio::time::sleep(delay).await;
                info!(job = %job_name, "Running scheduled job");
                job().await;
            }
        });

        if let Some(previous) = self.jobs.insert(name.to_string(), handle) {
            previous.abort();
            info!(job = name, "Replaced scheduled job");
        } else {
            info!(job = name, ?schedule, "Registered scheduled job");
        }
    }

    /// Stop and forget the job. Returns whether one was registered.
    pub fn cancel(&self, name: &str) -> bool {
        match self.jobs.remove(name) {
            Some((_, handle)) => {
                handle.abort();
                info!(job = name, "Cancelled scheduled job");
                true
            }
            None => false,
        }
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.jobs.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Abort every job
    pub fn shutdown(&self) {
        for entry in self.jobs.iter() {
            entry.value().abort();
        }
        self.jobs.clear();
    }
}

impl Drop for JobRegistry {
    fn drop(&mut self) {
        self.shutdown();
    }
}
