// ABOUTME: Supervisor of periodic replication tasks, one per table and direction plus cleanup
// ABOUTME: Ticks skip while paused or still running; shutdown lets in-flight ticks finish

use anyhow::Result;
use futures::future::BoxFuture;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::Instrument;

use super::flight::BusyFlags;

/// Work run on every tick. Each call produces a fresh future.
pub type TickFn = Arc<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Snapshot of one scheduled task.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskStatus {
    pub key: String,
    pub table: Option<String>,
    pub interval_secs: u64,
    pub busy: bool,
    pub paused: bool,
}

struct ScheduledTask {
    table: Option<String>,
    interval: Duration,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

type PausedTables = Arc<Mutex<HashSet<String>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Default)]
pub struct Supervisor {
    busy: BusyFlags,
    paused: PausedTables,
    tasks: Mutex<BTreeMap<String, ScheduledTask>>,
}

impl Supervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flags shared with manual operations that must not overlap a tick.
    pub fn busy_flags(&self) -> &BusyFlags {
        &self.busy
    }

    /// Start ticking `key` every `interval`, replacing any task with the same key.
    pub fn schedule(&self, key: &str, table: Option<&str>, interval: Duration, tick: TickFn) {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let span = tracing::info_span!("task", key = %key);
        let handle = tokio::spawn(
            run_periodic(
                key.to_string(),
                table.map(str::to_string),
                interval,
                tick,
                self.busy.clone(),
                Arc::clone(&self.paused),
                shutdown_rx,
            )
            .instrument(span),
        );

        let previous = lock(&self.tasks).insert(
            key.to_string(),
            ScheduledTask {
                table: table.map(str::to_string),
                interval,
                shutdown,
                handle,
            },
        );
        if let Some(previous) = previous {
            tracing::debug!("Replacing scheduled task {}", key);
            let _ = previous.shutdown.send(true);
        }
    }

    /// Stop one task after its current tick, if any.
    pub fn unschedule(&self, key: &str) -> bool {
        match lock(&self.tasks).remove(key) {
            Some(task) => {
                let _ = task.shutdown.send(true);
                true
            }
            None => false,
        }
    }

    /// Returns false when the table was already paused.
    pub fn pause_table(&self, table: &str) -> bool {
        lock(&self.paused).insert(table.to_string())
    }

    /// Returns false when the table was not paused.
    pub fn resume_table(&self, table: &str) -> bool {
        lock(&self.paused).remove(table)
    }

    pub fn is_paused(&self, table: &str) -> bool {
        lock(&self.paused).contains(table)
    }

    pub fn paused_tables(&self) -> Vec<String> {
        let mut tables: Vec<String> = lock(&self.paused).iter().cloned().collect();
        tables.sort();
        tables
    }

    /// Keys of scheduled tasks attached to a table.
    pub fn keys_for_table(&self, table: &str) -> Vec<String> {
        lock(&self.tasks)
            .iter()
            .filter(|(_, task)| task.table.as_deref() == Some(table))
            .map(|(key, _)| key.clone())
            .collect()
    }

    pub fn task_count(&self) -> usize {
        lock(&self.tasks).len()
    }

    pub fn status(&self) -> Vec<TaskStatus> {
        let paused = lock(&self.paused).clone();
        lock(&self.tasks)
            .iter()
            .map(|(key, task)| TaskStatus {
                key: key.clone(),
                table: task.table.clone(),
                interval_secs: task.interval.as_secs(),
                busy: self.busy.is_busy(key),
                paused: task
                    .table
                    .as_ref()
                    .map(|t| paused.contains(t))
                    .unwrap_or(false),
            })
            .collect()
    }

    /// Stop every task, wait for running ticks to finish and clear all flags.
    pub async fn shutdown(&self) {
        let tasks: Vec<(String, ScheduledTask)> =
            std::mem::take(&mut *lock(&self.tasks)).into_iter().collect();
        for (_, task) in &tasks {
            let _ = task.shutdown.send(true);
        }
        for (key, task) in tasks {
            if let Err(e) = task.handle.await {
                tracing::warn!("Task {} ended abnormally: {}", key, e);
            }
        }
        self.busy.clear();
        lock(&self.paused).clear();
        tracing::info!("All replication tasks stopped");
    }
}

async fn run_periodic(
    key: String,
    table: Option<String>,
    interval: Duration,
    tick: TickFn,
    busy: BusyFlags,
    paused: PausedTables,
    mut shutdown: watch::Receiver<bool>,
) {
    // A stop sent before the first poll is already marked seen after this, so
    // `changed()` alone would never report it.
    if *shutdown.borrow_and_update() {
        tracing::debug!("Task {} stopped before its first tick", key);
        return;
    }
    let mut timer = tokio::time::interval(interval);
    timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;

            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
            _ = timer.tick() => {}
        }

        if let Some(table) = &table {
            if lock(&paused).contains(table) {
                tracing::trace!("{} is paused, skipping tick", table);
                continue;
            }
        }

        let Some(guard) = busy.try_acquire(&key) else {
            tracing::debug!("Previous run of {} still active, skipping tick", key);
            continue;
        };

        // Run the tick in its own task so a panic is contained.
        let outcome = tokio::spawn(tick()).await;
        drop(guard);

        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!("Task {} failed: {:?}", key, e),
            Err(e) if e.is_panic() => tracing::error!("Task {} panicked", key),
            Err(e) => tracing::warn!("Task {} was cancelled: {}", key, e),
        }
    }

    tracing::debug!("Task {} stopped", key);
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_tick(counter: Arc<AtomicUsize>) -> TickFn {
        Arc::new(move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            .boxed()
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_run_periodically() {
        let supervisor = Supervisor::new();
        let counter = Arc::new(AtomicUsize::new(0));
        supervisor.schedule(
            "LeaderToFollower_orders",
            Some("orders"),
            Duration::from_secs(1),
            counting_tick(Arc::clone(&counter)),
        );

        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert!(counter.load(Ordering::SeqCst) >= 3);

        let status = supervisor.status();
        assert_eq!(status.len(), 1);
        assert_eq!(status[0].key, "LeaderToFollower_orders");
        assert_eq!(status[0].interval_secs, 1);
        assert!(!status[0].paused);

        supervisor.shutdown().await;
        assert_eq!(supervisor.task_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_paused_table_skips_ticks() {
        let supervisor = Supervisor::new();
        let counter = Arc::new(AtomicUsize::new(0));
        assert!(supervisor.pause_table("orders"));
        assert!(!supervisor.pause_table("orders"));
        supervisor.schedule(
            "LeaderToFollower_orders",
            Some("orders"),
            Duration::from_secs(1),
            counting_tick(Arc::clone(&counter)),
        );

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert!(supervisor.status()[0].paused);

        assert!(supervisor.resume_table("orders"));
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(counter.load(Ordering::SeqCst) >= 1);
        supervisor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_tick_does_not_stop_task() {
        let supervisor = Supervisor::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let tick_calls = Arc::clone(&calls);
        let tick: TickFn = Arc::new(move || {
            let calls = Arc::clone(&tick_calls);
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    panic!("first tick fails");
                }
                Ok(())
            }
            .boxed()
        });
        supervisor.schedule("cleanup", None, Duration::from_secs(1), tick);

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert!(calls.load(Ordering::SeqCst) >= 2);
        assert!(!supervisor.busy_flags().is_busy("cleanup"));
        supervisor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_key_skips_tick() {
        let supervisor = Supervisor::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let held = supervisor.busy_flags().try_acquire("cleanup").unwrap();
        supervisor.schedule(
            "cleanup",
            None,
            Duration::from_secs(1),
            counting_tick(Arc::clone(&counter)),
        );

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        drop(held);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(counter.load(Ordering::SeqCst) >= 1);
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_right_after_schedule_returns() {
        let supervisor = Supervisor::new();
        let counter = Arc::new(AtomicUsize::new(0));
        for key in ["LeaderToFollower_orders", "FollowerToLeader_orders", "cleanup"] {
            supervisor.schedule(
                key,
                Some("orders"),
                Duration::from_secs(60),
                counting_tick(Arc::clone(&counter)),
            );
        }

        tokio::time::timeout(Duration::from_secs(5), supervisor.shutdown())
            .await
            .expect("shutdown must not wait on tasks that never started");
        assert_eq!(supervisor.task_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unschedule() {
        let supervisor = Supervisor::new();
        let counter = Arc::new(AtomicUsize::new(0));
        supervisor.schedule("cleanup", None, Duration::from_secs(1), counting_tick(counter));
        assert!(supervisor.unschedule("cleanup"));
        assert!(!supervisor.unschedule("cleanup"));
        assert_eq!(supervisor.task_count(), 0);
    }
}
