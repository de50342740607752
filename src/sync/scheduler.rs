//! Tenant scheduler.
//!
//! Runs for one tenant are serialized through a claim set, and every run
//! also takes the registry sync lock so runs started by other processes are
//! refused too. Runs for different tenants proceed on their own threads. The scheduler loop wakes
//! on every tick, starts incremental runs for tenants that are due, and also
//! accepts manual triggers over a channel.

use chrono::{Local, NaiveDateTime};
use crossbeam_channel::{unbounded, RecvTimeoutError, Sender};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::sync::error::SyncError;
use crate::sync::executor::{SyncExecutor, SyncMode, SyncReport, SyncRequest};
use crate::tenant::Tenant;

/// Actor recorded for runs the scheduler starts on its own.
pub const SCHEDULER_ACTOR: &str = "scheduler";

type Running = Arc<Mutex<HashSet<String>>>;

/// Releases a tenant claim when the run ends, however it ends.
#[derive(Debug)]
pub struct RunGuard {
    running: Running,
    tenant: String,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        match self.running.lock() {
            Ok(mut running) => {
                running.remove(&self.tenant);
            }
            Err(poisoned) => {
                poisoned.into_inner().remove(&self.tenant);
            }
        }
    }
}

pub enum SchedulerCommand {
    Trigger(SyncRequest),
    Shutdown,
}

pub struct TenantScheduler {
    executor: Arc<SyncExecutor>,
    running: Running,
    tick: Duration,
}

impl TenantScheduler {
    pub fn new(executor: Arc<SyncExecutor>, tick: Duration) -> Self {
        Self {
            executor,
            running: Arc::new(Mutex::new(HashSet::new())),
            tick,
        }
    }

    /// Claim `tenant` for one run.
    ///
    /// # Errors
    ///
    /// `TenantSerializationConflict` if a run for the tenant is in progress.
    pub fn claim(&self, tenant: &str) -> Result<RunGuard, SyncError> {
        let mut running = self
            .running
            .lock()
            .map_err(|_| SyncError::Internal("scheduler claim set poisoned".to_string()))?;
        if !running.insert(tenant.to_string()) {
            return Err(SyncError::TenantSerializationConflict {
                tenant: tenant.to_string(),
            });
        }
        Ok(RunGuard {
            running: Arc::clone(&self.running),
            tenant: tenant.to_string(),
        })
    }

    pub fn is_running(&self, tenant: &str) -> bool {
        self.running
            .lock()
            .map(|running| running.contains(tenant))
            .unwrap_or(false)
    }

    /// Run on the calling thread.
    ///
    /// # Errors
    ///
    /// `TenantSerializationConflict` when the tenant is busy, otherwise
    /// whatever the run returns.
    pub fn try_run(&self, request: &SyncRequest) -> Result<SyncReport, SyncError> {
        let _guard = self.claim(&request.tenant_code)?;
        self.executor.run(request)
    }

    /// Run on a new thread. The claim is taken before the thread starts, so
    /// a conflict is reported to the caller immediately.
    ///
    /// # Errors
    ///
    /// `TenantSerializationConflict`, or `Internal` if the thread cannot start.
    pub fn spawn_run(&self, request: SyncRequest) -> Result<JoinHandle<Result<SyncReport, SyncError>>, SyncError> {
        let guard = self.claim(&request.tenant_code)?;
        let executor = Arc::clone(&self.executor);
        thread::Builder::new()
            .name(format!("sync-{}", request.tenant_code))
            .spawn(move || {
                let _guard = guard;
                executor.run(&request)
            })
            .map_err(|e| SyncError::Internal(format!("cannot start sync thread: {e}")))
    }

    /// Tenants with a positive interval whose last sync is older than it.
    ///
    /// # Errors
    ///
    /// `Registry` if the tenant list cannot be read.
    pub fn due_tenants(&self, now: NaiveDateTime) -> Result<Vec<Tenant>, SyncError> {
        Ok(self
            .executor
            .tenants()
            .list_tenants()
            .map_err(SyncError::Registry)?
            .into_iter()
            .filter(|t| t.is_due(now))
            .collect())
    }

    /// Start incremental runs for every due tenant that is not already running.
    pub fn tick(&self, now: NaiveDateTime) -> Vec<JoinHandle<Result<SyncReport, SyncError>>> {
        let due = match self.due_tenants(now) {
            Ok(due) => due,
            Err(e) => {
                log::error!("scheduler tick skipped: {e}");
                return Vec::new();
            }
        };

        let mut started = Vec::new();
        for tenant in due {
            let request = SyncRequest::new(&tenant.company_code, SyncMode::Incremental, SCHEDULER_ACTOR);
            match self.spawn_run(request) {
                Ok(handle) => {
                    log::debug!("scheduled incremental sync for tenant {}", tenant.company_code);
                    started.push(handle);
                }
                Err(SyncError::TenantSerializationConflict { tenant }) => {
                    log::debug!("tenant {tenant} still syncing, skipping this tick");
                }
                Err(e) => log::error!("cannot schedule tenant {}: {e}", tenant.company_code),
            }
        }
        started
    }

    /// Start the scheduler loop on its own thread.
    ///
    /// # Errors
    ///
    /// `Internal` if the thread cannot start.
    pub fn start(self: Arc<Self>) -> Result<SchedulerHandle, SyncError> {
        let (sender, receiver) = unbounded::<SchedulerCommand>();
        let scheduler = Arc::clone(&self);
        let join = thread::Builder::new()
            .name("sync-scheduler".to_string())
            .spawn(move || {
                log::info!("sync scheduler started, tick {:?}", scheduler.tick);
                let mut runs: Vec<JoinHandle<Result<SyncReport, SyncError>>> = Vec::new();
                let mut next_tick = Instant::now() + scheduler.tick;
                loop {
                    match receiver.recv_timeout(next_tick.saturating_duration_since(Instant::now())) {
                        Ok(SchedulerCommand::Trigger(request)) => match scheduler.spawn_run(request) {
                            Ok(handle) => runs.push(handle),
                            Err(e) => log::warn!("manual sync refused: {e}"),
                        },
                        Ok(SchedulerCommand::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
                        Err(RecvTimeoutError::Timeout) => {}
                    }
                    // Checked after every command so triggers cannot hold off the tick.
                    if Instant::now() >= next_tick {
                        runs.extend(scheduler.tick(Local::now().naive_local()));
                        next_tick = Instant::now() + scheduler.tick;
                    }
                    runs = reap(runs);
                }
                log::info!("sync scheduler stopping, waiting for {} runs", runs.len());
                for run in runs {
                    log_run(run.join());
                }
            })
            .map_err(|e| SyncError::Internal(format!("cannot start scheduler thread: {e}")))?;

        Ok(SchedulerHandle {
            sender,
            join: Some(join),
        })
    }
}

type RunResult = thread::Result<Result<SyncReport, SyncError>>;

fn log_run(result: RunResult) {
    match result {
        Ok(Ok(report)) => log::debug!("{}", report.summary()),
        Ok(Err(e)) => log::warn!("sync run failed: {e}"),
        Err(_) => log::error!("sync run panicked"),
    }
}

fn reap(runs: Vec<JoinHandle<Result<SyncReport, SyncError>>>) -> Vec<JoinHandle<Result<SyncReport, SyncError>>> {
    let (finished, pending): (Vec<_>, Vec<_>) = runs.into_iter().partition(|h| h.is_finished());
    for run in finished {
        log_run(run.join());
    }
    pending
}

/// Control side of a running scheduler loop.
pub struct SchedulerHandle {
    sender: Sender<SchedulerCommand>,
    join: Option<JoinHandle<()>>,
}

impl SchedulerHandle {
    /// Queue a manual run in any mode.
    ///
    /// # Errors
    ///
    /// `Internal` if the loop has stopped.
    pub fn trigger(&self, request: SyncRequest) -> Result<(), SyncError> {
        self.sender
            .send(SchedulerCommand::Trigger(request))
            .map_err(|_| SyncError::Internal("scheduler is not running".to_string()))
    }

    /// Stop the loop and wait for in-flight runs.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let _ = self.sender.send(SchedulerCommand::Shutdown);
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                log::error!("sync scheduler thread panicked");
            }
        }
    }
}

impl Drop for SchedulerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::codec::UpstreamValue;
    use crate::sync::executor::WhitelistSource;
    use crate::sync::keys::KeyRegistry;
    use crate::sync::types::UpstreamColumn;
    use crate::sync::whitelist::TableWhitelist;
    use crate::test_helpers::{MemoryReplicaConnector, MemoryTenantStore, MemoryUpstream};
    use crate::tenant::TenantStore;
    use chrono::NaiveDate;

    fn tenant(code: &str, interval: u32) -> Tenant {
        Tenant {
            company_code: code.to_string(),
            company_name: format!("Company {code}"),
            upstream_database: format!("erp{code}"),
            local_database: format!("mes_{code}"),
            sync_tables: vec!["comCustomer".to_string()],
            last_sync_version: None,
            last_sync_time: None,
            sync_interval_minutes: interval,
        }
    }

    fn scheduler(tenants: Vec<Tenant>) -> (TenantScheduler, MemoryTenantStore) {
        let upstream = MemoryUpstream::new();
        for t in &tenants {
            upstream.create_table(
                &t.upstream_database,
                "comCustomer",
                vec![
                    UpstreamColumn::new("Flag", "char").with_length(1),
                    UpstreamColumn::new("ID", "nvarchar").with_length(10),
                ],
                &["Flag", "ID"],
            );
            upstream.upsert(
                &t.upstream_database,
                "comCustomer",
                vec![UpstreamValue::Text("T".into()), UpstreamValue::Text("C001".into())],
            );
        }
        let store = MemoryTenantStore::with_tenants(tenants);
        let executor = SyncExecutor::new(
            Arc::new(store.clone()),
            Arc::new(upstream),
            Arc::new(MemoryReplicaConnector::new()),
            WhitelistSource::Fixed(TableWhitelist::new(["comCustomer"])),
            KeyRegistry::new(),
        );
        (TenantScheduler::new(Arc::new(executor), Duration::from_millis(20)), store)
    }

    fn noon() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 5, 1).unwrap().and_hms_opt(12, 0, 0).unwrap()
    }

    #[test]
    fn test_second_claim_conflicts_until_released() {
        let (scheduler, _) = scheduler(vec![tenant("10", 5)]);
        let guard = scheduler.claim("10").unwrap();
        assert!(scheduler.is_running("10"));
        let err = scheduler.claim("10").unwrap_err();
        assert_eq!(err.kind(), "tenant_serialization_conflict");
        assert!(scheduler.claim("20").is_ok());

        drop(guard);
        assert!(!scheduler.is_running("10"));
        assert!(scheduler.claim("10").is_ok());
    }

    #[test]
    fn test_busy_tenant_is_refused() {
        let (scheduler, _) = scheduler(vec![tenant("10", 5)]);
        let _guard = scheduler.claim("10").unwrap();
        let request = SyncRequest::new("10", SyncMode::Full, "qa");
        assert!(matches!(
            scheduler.try_run(&request),
            Err(SyncError::TenantSerializationConflict { .. })
        ));
    }

    #[test]
    fn test_tenant_locked_elsewhere_is_refused() {
        let (scheduler, store) = scheduler(vec![tenant("10", 5)]);
        // Another process holds the registry lock.
        assert!(store.try_lock_tenant("10").unwrap());
        assert!(!scheduler.is_running("10"));

        let request = SyncRequest::new("10", SyncMode::Full, "qa");
        assert!(matches!(
            scheduler.try_run(&request),
            Err(SyncError::TenantSerializationConflict { .. })
        ));
        assert_eq!(store.tenant("10").unwrap().unwrap().last_sync_version, None);

        store.unlock_tenant("10").unwrap();
        let report = scheduler.try_run(&request).unwrap();
        assert!(report.watermark_advanced);
        assert!(!store.is_locked("10"));
    }

    #[test]
    fn test_due_tenants_skip_disabled_and_recent() {
        let mut recent = tenant("30", 60);
        recent.last_sync_time = Some(noon() - chrono::Duration::minutes(10));
        let (scheduler, _) = scheduler(vec![tenant("10", 5), tenant("20", 0), recent]);
        let due: Vec<String> = scheduler
            .due_tenants(noon())
            .unwrap()
            .into_iter()
            .map(|t| t.company_code)
            .collect();
        assert_eq!(due, vec!["10".to_string()]);
    }

    #[test]
    fn test_tick_runs_due_tenants_once() {
        let (scheduler, store) = scheduler(vec![tenant("10", 5)]);
        let runs = scheduler.tick(noon());
        assert_eq!(runs.len(), 1);
        for run in runs {
            let report = run.join().unwrap().unwrap();
            assert_eq!(report.tenant, "10");
            assert!(report.watermark_advanced);
        }
        assert!(!scheduler.is_running("10"));
        let saved = store.tenant("10").unwrap().unwrap();
        assert_eq!(saved.last_sync_version, Some(1));
    }

    #[test]
    fn test_loop_accepts_manual_trigger() {
        let (scheduler, store) = scheduler(vec![tenant("10", 0)]);
        let handle = Arc::new(scheduler).start().unwrap();
        handle.trigger(SyncRequest::new("10", SyncMode::Full, "qa")).unwrap();
        // Commands are handled in order and shutdown joins in-flight runs.
        handle.shutdown();
        assert_eq!(store.tenant("10").unwrap().unwrap().last_sync_version, Some(1));
    }

    #[test]
    fn test_steady_triggers_do_not_starve_the_tick() {
        let (scheduler, store) = scheduler(vec![tenant("10", 0), tenant("20", 5)]);
        let handle = Arc::new(scheduler).start().unwrap();
        // Triggers arrive faster than the 20ms tick for the whole window.
        for _ in 0..40 {
            handle.trigger(SyncRequest::new("10", SyncMode::Full, "qa")).unwrap();
            thread::sleep(Duration::from_millis(5));
        }
        handle.shutdown();
        assert_eq!(
            store.tenant("20").unwrap().unwrap().last_sync_version,
            Some(1),
            "due tenant was never scheduled"
        );
    }
}
