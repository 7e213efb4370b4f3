//! Bounded lifetime for provisioned environments.
//!
//! An [`EnvironmentLease`] is registered the moment the provisioner touches cloud
//! state. Releasing it tears the environment down; dropping it without a release
//! tears it down as well, so every exit path of a run ends in a teardown attempt.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::config::LifecycleSettings;
use crate::error::{StageError, StageResult};
use crate::provision::{CloudBackend, Environment, Slot};

/// How a bounded wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Wake {
    Elapsed,
    Cancelled,
}

/// Operator-triggered cancellation shared by the executor and the Ctrl-C handler.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        let (flag, signal) = &*self.inner;
        let mut cancelled = flag.lock().unwrap_or_else(|p| p.into_inner());
        *cancelled = true;
        signal.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        let (flag, _) = &*self.inner;
        *flag.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Block for `timeout` or until cancelled, whichever comes first.
    pub fn wait_timeout(&self, timeout: Duration) -> Wake {
        let (flag, signal) = &*self.inner;
        let guard = flag.lock().unwrap_or_else(|p| p.into_inner());
        let (guard, _) = signal
            .wait_timeout_while(guard, timeout, |cancelled| !*cancelled)
            .unwrap_or_else(|p| p.into_inner());
        if *guard { Wake::Cancelled } else { Wake::Elapsed }
    }
}

/// The only suspension point of a run. Swappable so tests never really sleep.
pub trait Sleeper: Send + Sync {
    fn sleep(&self, duration: Duration, cancel: &CancelToken) -> Wake;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration, cancel: &CancelToken) -> Wake {
        cancel.wait_timeout(duration)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LockRecord {
    run_id: String,
    slot: Slot,
    acquired_at: DateTime<Utc>,
}

/// Exclusive claim on a slot, backed by a lock file created with `create_new`.
///
/// Dropping the lock removes the file unless [`SlotLock::persist`] was called.
#[derive(Debug)]
pub struct SlotLock {
    path: PathBuf,
    run_id: String,
    armed: bool,
}

impl SlotLock {
    pub fn path_for(lock_dir: &Path, slot: &Slot) -> PathBuf {
        lock_dir.join(format!("{}.lock", slot.key()))
    }

    pub fn acquire(lock_dir: &Path, slot: &Slot, run_id: &str) -> StageResult<Self> {
        fs::create_dir_all(lock_dir).map_err(|err| {
            StageError::Deploy(format!(
                "failed to create lock directory {}: {err}",
                lock_dir.display()
            ))
        })?;
        let path = Self::path_for(lock_dir, slot);
        let record = LockRecord {
            run_id: run_id.to_string(),
            slot: slot.clone(),
            acquired_at: Utc::now(),
        };

        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                let body = serde_json::to_vec_pretty(&record)
                    .map_err(|err| StageError::Deploy(format!("failed to encode slot lock: {err}")))?;
                file.write_all(&body).map_err(|err| {
                    StageError::Deploy(format!("failed to write {}: {err}", path.display()))
                })?;
                info!(%slot, run_id, "Slot lock acquired");
                Ok(Self {
                    path,
                    run_id: run_id.to_string(),
                    armed: true,
                })
            }
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                let holder = Self::holder(&path).unwrap_or_else(|| "unknown".to_string());
                Err(StageError::SlotBusy {
                    slot: slot.to_string(),
                    holder,
                })
            }
            Err(err) => Err(StageError::Deploy(format!(
                "failed to create {}: {err}",
                path.display()
            ))),
        }
    }

    fn holder(path: &Path) -> Option<String> {
        let content = fs::read(path).ok()?;
        serde_json::from_slice::<LockRecord>(&content)
            .ok()
            .map(|record| record.run_id)
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Leave the lock file in place; the slot stays blocked until `destroy` clears it.
    pub fn persist(mut self) {
        self.armed = false;
        warn!(lock = %self.path.display(), "Slot lock kept for a pending teardown");
    }

    pub fn release(mut self) {
        self.remove();
    }

    fn remove(&mut self) {
        if !self.armed {
            return;
        }
        self.armed = false;
        if let Err(err) = fs::remove_file(&self.path)
            && err.kind() != ErrorKind::NotFound
        {
            warn!(lock = %self.path.display(), error = %err, "Failed to remove slot lock");
        }
    }

    /// Remove a lock left behind by an earlier run.
    pub fn force_release(lock_dir: &Path, slot: &Slot) -> Result<bool> {
        let path = Self::path_for(lock_dir, slot);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => {
                Err(err).with_context(|| format!("Failed to remove slot lock {}", path.display()))
            }
        }
    }
}

impl Drop for SlotLock {
    fn drop(&mut self) {
        self.remove();
    }
}

/// On-disk records of environments that still need a teardown.
#[derive(Debug, Clone)]
pub struct PendingTeardowns {
    dir: PathBuf,
}

impl PendingTeardowns {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, slot: &Slot) -> PathBuf {
        self.dir.join(format!("{}.json", slot.key()))
    }

    pub fn record(&self, env: &Environment) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create {}", self.dir.display()))?;
        let path = self.path_for(&env.slot);
        let body = serde_json::to_vec_pretty(env)?;
        fs::write(&path, body)
            .with_context(|| format!("Failed to write teardown record {}", path.display()))
    }

    pub fn remove(&self, slot: &Slot) -> Result<()> {
        let path = self.path_for(slot);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err)
                .with_context(|| format!("Failed to remove teardown record {}", path.display())),
        }
    }

    pub fn list(&self) -> Result<Vec<Environment>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut paths = Vec::new();
        for entry in fs::read_dir(&self.dir)
            .with_context(|| format!("Failed to list {}", self.dir.display()))?
        {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                paths.push(path);
            }
        }
        paths.sort();

        let mut envs = Vec::with_capacity(paths.len());
        for path in paths {
            let content = fs::read(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let env = serde_json::from_slice(&content)
                .with_context(|| format!("Malformed teardown record {}", path.display()))?;
            envs.push(env);
        }
        Ok(envs)
    }
}

/// What a teardown pass actually removed. All false on an already-clean slot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeardownReport {
    pub service_deleted: bool,
    pub public_access_revoked: bool,
    pub identity_deleted: bool,
    pub attempts: u32,
}

/// Idempotent teardown with bounded retries.
#[derive(Clone)]
pub struct Destroyer {
    backend: Arc<dyn CloudBackend>,
    sleeper: Arc<dyn Sleeper>,
    attempts: u32,
    backoff: Duration,
}

impl Destroyer {
    pub fn new(
        backend: Arc<dyn CloudBackend>,
        sleeper: Arc<dyn Sleeper>,
        settings: &LifecycleSettings,
    ) -> Self {
        Self {
            backend,
            sleeper,
            attempts: settings.destroy_attempts.max(1),
            backoff: settings.destroy_backoff(),
        }
    }

    pub fn teardown(&self, env: &Environment) -> StageResult<TeardownReport> {
        let mut report = TeardownReport::default();
        // Backoff waits ignore operator cancellation: teardown must finish.
        let never = CancelToken::new();
        let mut last_error = None;

        for attempt in 1..=self.attempts {
            report.attempts = attempt;
            match self.teardown_once(env, &mut report) {
                Ok(()) => {
                    info!(
                        slot = %env.slot,
                        attempt,
                        service_deleted = report.service_deleted,
                        identity_deleted = report.identity_deleted,
                        "Environment torn down"
                    );
                    return Ok(report);
                }
                Err(err) => {
                    warn!(slot = %env.slot, attempt, error = %format!("{err:#}"), "Teardown attempt failed");
                    last_error = Some(err);
                    if attempt < self.attempts {
                        self.sleeper.sleep(self.backoff * attempt, &never);
                    }
                }
            }
        }

        let detail = last_error
            .map(|err| StageError::chain(&err))
            .unwrap_or_default();
        Err(StageError::Destroy(format!(
            "{} still present after {} attempts: {detail}",
            env.slot, self.attempts
        )))
    }

    fn teardown_once(&self, env: &Environment, report: &mut TeardownReport) -> Result<()> {
        let slot = &env.slot;
        if self.backend.describe_service(slot)?.is_some() {
            if self.backend.public_access(slot)? {
                self.backend
                    .set_public_access(slot, false)
                    .with_context(|| format!("Failed to revoke public access on {slot}"))?;
                report.public_access_revoked = true;
            }
            self.backend
                .delete_service(slot)
                .with_context(|| format!("Failed to delete service {slot}"))?;
            report.service_deleted = true;
        }

        if env.identity_created {
            let email = env.identity_email();
            if self.backend.identity_exists(&slot.project, &email)? {
                self.backend
                    .delete_identity(&slot.project, &email)
                    .with_context(|| format!("Failed to delete identity {email}"))?;
                report.identity_deleted = true;
            }
        }
        Ok(())
    }
}

/// Scoped ownership of a provisioned environment.
pub struct EnvironmentLease {
    env: Environment,
    destroyer: Destroyer,
    records: PendingTeardowns,
    lock: Option<SlotLock>,
    released: bool,
}

impl EnvironmentLease {
    /// Take ownership of `env`; a teardown record is on disk before this returns.
    ///
    /// If the record cannot be written the environment is torn down on the spot. A
    /// `DestroyFailure` from here means resources are live with no record; the error
    /// carries the environment JSON.
    pub fn register(
        env: Environment,
        destroyer: Destroyer,
        records: PendingTeardowns,
        lock: Option<SlotLock>,
    ) -> StageResult<Self> {
        if let Err(record_err) = records.record(&env) {
            let record_err = StageError::chain(&record_err);
            return Err(match destroyer.teardown(&env) {
                Ok(_) => {
                    warn!(slot = %env.slot, error = %record_err, "Environment could not be recorded; torn down");
                    if let Some(lock) = lock {
                        lock.release();
                    }
                    StageError::Deploy(format!(
                        "could not record environment for {}: {record_err}; it was torn down",
                        env.slot
                    ))
                }
                Err(teardown_err) => {
                    let detail = match teardown_err {
                        StageError::Destroy(detail) => detail,
                        other => other.to_string(),
                    };
                    let json = environment_json(&env);
                    error!(slot = %env.slot, environment = %json, "Unrecorded environment left behind; remove it by hand");
                    if let Some(lock) = lock {
                        lock.persist();
                    }
                    StageError::Destroy(format!(
                        "could not record environment ({record_err}) and {detail}; environment: {json}"
                    ))
                }
            });
        }
        info!(slot = %env.slot, run_id = %env.run_id, "Environment lease registered");
        Ok(Self {
            env,
            destroyer,
            records,
            lock,
            released: false,
        })
    }

    pub fn environment(&self) -> &Environment {
        &self.env
    }

    pub fn release(mut self) -> StageResult<TeardownReport> {
        self.finish()
    }

    fn finish(&mut self) -> StageResult<TeardownReport> {
        self.released = true;
        match self.destroyer.teardown(&self.env) {
            Ok(report) => {
                if let Err(err) = self.records.remove(&self.env.slot) {
                    warn!(error = %format!("{err:#}"), "Teardown succeeded but its record could not be removed");
                }
                if let Some(lock) = self.lock.take() {
                    lock.release();
                }
                Ok(report)
            }
            Err(err) => {
                error!(
                    slot = %self.env.slot,
                    error = %err,
                    environment = %environment_json(&self.env),
                    "Environment left behind; run `ttl-deploy destroy` to retry"
                );
                if let Some(lock) = self.lock.take() {
                    lock.persist();
                }
                Err(err)
            }
        }
    }
}

fn environment_json(env: &Environment) -> String {
    serde_json::to_string(env).unwrap_or_else(|err| format!("<unserializable: {err}>"))
}

impl Drop for EnvironmentLease {
    fn drop(&mut self) {
        if !self.released {
            warn!(slot = %self.env.slot, "Lease dropped without release; tearing down");
            let _ = self.finish();
        }
    }
}

/// The bounded wait between deployment and teardown.
#[derive(Debug, Clone, Copy)]
pub struct LifecycleTimer {
    ttl: Duration,
    grace: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HoldOutcome {
    pub wake: Wake,
    pub planned: Duration,
}

impl LifecycleTimer {
    pub fn new(ttl: Duration, grace: Duration) -> Self {
        Self { ttl, grace }
    }

    pub fn from_settings(settings: &LifecycleSettings) -> Self {
        Self::new(settings.ttl(), settings.unconfirmed_grace())
    }

    /// Wait out the TTL. Without a health confirmation the grace period is served first.
    pub fn hold(&self, confirmed: bool, sleeper: &dyn Sleeper, cancel: &CancelToken) -> HoldOutcome {
        let mut planned = self.ttl;
        if !confirmed {
            planned += self.grace;
            info!(grace_secs = self.grace.as_secs(), "Environment unconfirmed; serving grace period");
            if sleeper.sleep(self.grace, cancel) == Wake::Cancelled {
                return HoldOutcome {
                    wake: Wake::Cancelled,
                    planned,
                };
            }
        }
        info!(ttl_secs = self.ttl.as_secs(), "Holding environment for its TTL");
        HoldOutcome {
            wake: sleeper.sleep(self.ttl, cancel),
            planned,
        }
    }
}
