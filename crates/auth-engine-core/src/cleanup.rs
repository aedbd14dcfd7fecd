// Copyright (c) 2025 Authforge Contributors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! The Cleanup Scheduler: a single process-wide background task runner
//! plugins register against for purging expired ephemeral artifacts.
//!
//! Grounded directly in this codebase's background job scheduler: a
//! `tokio::select!`-based per-task loop racing a timer against a
//! `broadcast` shutdown channel, the same exponential-backoff retry helper,
//! and the existing `HealthState::{Healthy, Degraded, Unhealthy}`
//! three-tier classification driven by consecutive-failure counts. Unlike
//! that scheduler's `Mutex`-guarded job map, per-task overlap guarding here
//! is an `AtomicBool` "running" flag checked-and-set before `runner()` is
//! invoked and cleared on every exit path including panics, via a drop
//! guard — a `Mutex` would serialize ticks instead of skipping them, and
//! skipping (not queuing) an overlapping tick is what the contract asks for.

use crate::data_access::{DataAccessPort, TableCounters};
use auth_engine_errors::EngineError;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

const BASE_RETRY_DELAY_SECS: u64 = 1;
const MAX_RETRY_DELAY_SECS: u64 = 60;
const RETRY_FACTOR: f64 = 2.0;
const MAX_RETRIES: u32 = 3;

/// Per-plugin configuration handed to a runner, schema-agnostic like the
/// data-access port itself — each runner downcasts or reads the keys it
/// expects.
pub type PluginConfig = HashMap<String, Value>;

#[derive(Debug, Clone, Default)]
pub struct CleanupReport {
	pub cleaned: u64,
    pub per_table_counters: TableCounters,
	pub errors: Vec<String>,
}

impl CleanupReport {
	pub fn merge(mut self, other: CleanupReport) -> Self {
		self.cleaned += other.cleaned;
		for (table, count) in other.per_table_counters {
			*self.per_table_counters.entry(table).or_insert(0) += count;
		}
		self.errors.extend(other.errors);
		self
	}
}

/// A registered runner's cleanup logic. MUST be idempotent (safe to run
/// twice back to back), bounded by `batch_size` (never an unbounded table
/// scan), and quiescence-friendly (small targeted deletes).
#[async_trait::async_trait]
pub trait CleanupRunner: Send + Sync {
	async fn run(
		&self,
		orm: &dyn DataAccessPort,
		config: &PluginConfig,
		batch_size: u64,
	) -> Result<CleanupReport, EngineError>;
}

struct RegisteredTask {
	name: String,
	plugin_name: String,
	interval: Duration,
	enabled: bool,
	batch_size: u64,
	runner: Arc<dyn CleanupRunner>,
	running: Arc<AtomicBool>,
	consecutive_failures: Arc<AtomicU32>,
	last_run: RwLock<Option<LastRunInfo>>,
}

#[derive(Debug, Clone)]
pub struct LastRunInfo {
	pub succeeded: bool,
	pub cleaned: u64,
	pub error: Option<String>,
	pub at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
	Healthy,
	Degraded,
	Unhealthy,
}

#[derive(Debug, Clone)]
pub struct TaskHealthStatus {
	pub name: String,
	pub plugin_name: String,
	pub status: HealthState,
	pub consecutive_failures: u32,
	pub last_run: Option<LastRunInfo>,
}

#[derive(Debug, Clone)]
pub struct SchedulerHealthStatus {
	pub status: HealthState,
	pub tasks: Vec<TaskHealthStatus>,
}

fn determine_health_state(consecutive_failures: u32) -> HealthState {
	if consecutive_failures >= 3 {
		HealthState::Unhealthy
	} else if consecutive_failures >= 1 {
		HealthState::Degraded
	} else {
		HealthState::Healthy
	}
}

fn calculate_backoff_delay(retry_count: u32) -> u64 {
	let delay = BASE_RETRY_DELAY_SECS as f64 * RETRY_FACTOR.powi(retry_count as i32 - 1);
	(delay as u64).min(MAX_RETRY_DELAY_SECS)
}

/// Applies ±10% jitter to an interval using `fastrand`, matching this
/// codebase's existing jitter/backoff use of that crate elsewhere.
fn jittered(interval: Duration) -> Duration {
	let millis = interval.as_millis() as i64;
	let jitter_range = millis / 10;
	if jitter_range == 0 {
		return interval;
	}
	let offset = fastrand::i64(-jitter_range..=jitter_range);
	Duration::from_millis((millis + offset).max(1) as u64)
}

/// Clears the per-task running flag on drop, including on an early return
/// from a panic unwind — the tokio task itself would still abort the
/// process-wide executor shutdown path, but within a single runner
/// invocation this guarantees the flag never gets stuck "true".
struct RunningGuard(Arc<AtomicBool>);

impl Drop for RunningGuard {
	fn drop(&mut self) {
		self.0.store(false, Ordering::SeqCst);
	}
}

pub struct CleanupScheduler {
	tasks: RwLock<HashMap<String, Arc<RegisteredTask>>>,
	orm: Arc<dyn DataAccessPort>,
	plugin_configs: RwLock<HashMap<String, PluginConfig>>,
	shutdown_tx: broadcast::Sender<()>,
	handles: Mutex<Vec<JoinHandle<()>>>,
}

impl CleanupScheduler {
	pub fn new(orm: Arc<dyn DataAccessPort>) -> Self {
		let (shutdown_tx, _) = broadcast::channel(1);
		Self {
			tasks: RwLock::new(HashMap::new()),
			orm,
			plugin_configs: RwLock::new(HashMap::new()),
			shutdown_tx,
			handles: Mutex::new(Vec::new()),
		}
	}

	/// Registers (or replaces, before `start()` is called) the config bag a
	/// plugin's runners read from.
	pub async fn set_plugin_config(&self, plugin_name: impl Into<String>, config: PluginConfig) {
		self.plugin_configs.write().await.insert(plugin_name.into(), config);
	}

	#[instrument(skip(self, runner))]
	pub async fn register_cleanup_task(
		&self,
		name: impl Into<String>,
		plugin_name: impl Into<String>,
		interval: Duration,
		enabled: bool,
		batch_size: u64,
		runner: Arc<dyn CleanupRunner>,
	) {
		let name = name.into();
		self.tasks.write().await.insert(
			name.clone(),
			Arc::new(RegisteredTask {
				name,
				plugin_name: plugin_name.into(),
				interval,
				enabled,
				batch_size,
				runner,
				running: Arc::new(AtomicBool::new(false)),
				consecutive_failures: Arc::new(AtomicU32::new(0)),
				last_run: RwLock::new(None),
			}),
		);
	}

	/// Spawns each enabled task's timer loop. Idempotent to call once;
	/// calling again after `shutdown()` restarts all tasks afresh.
	#[instrument(skip(self))]
	pub async fn start(&self) {
		let tasks = self.tasks.read().await;
		let mut handles = self.handles.lock().await;

		for task in tasks.values() {
			if !task.enabled {
				continue;
			}
			let task = Arc::clone(task);
			let orm = Arc::clone(&self.orm);
			let plugin_configs = self.plugin_configs.read().await.clone();
			let mut shutdown_rx = self.shutdown_tx.subscribe();

			let handle = tokio::spawn(async move {
				loop {
					tokio::select! {
						_ = tokio::time::sleep(jittered(task.interval)) => {
							run_task_with_retry(&task, orm.as_ref(), &plugin_configs).await;
						}
						_ = shutdown_rx.recv() => {
							info!(task = %task.name, "shutting down cleanup task");
							break;
						}
					}
				}
			});
			handles.push(handle);
		}

		info!(task_count = handles.len(), "cleanup scheduler started");
	}

	/// Administrative/test invocation of a single task, bypassing its timer.
	/// Still respects the overlap guard: a concurrently-running tick is
	/// skipped rather than queued.
	#[instrument(skip(self))]
	pub async fn run_once(&self, task_name: &str) -> Result<CleanupReport, EngineError> {
		let task = {
			let tasks = self.tasks.read().await;
			tasks
				.get(task_name)
				.cloned()
				.ok_or_else(|| EngineError::NotFound(format!("cleanup task `{task_name}` not registered")))?
		};
		let plugin_configs = self.plugin_configs.read().await.clone();
		run_task_with_retry(&task, self.orm.as_ref(), &plugin_configs)
			.await
			.ok_or_else(|| EngineError::Conflict(format!("cleanup task `{task_name}` already running")))?
	}

	pub async fn task_names(&self) -> Vec<String> {
		self.tasks.read().await.keys().cloned().collect()
	}

	#[instrument(skip(self))]
	pub async fn shutdown(&self) {
		let _ = self.shutdown_tx.send(());
		let mut handles = self.handles.lock().await;
		for handle in handles.drain(..) {
			let _ = handle.await;
		}
		info!("cleanup scheduler shut down");
	}

	pub async fn health_status(&self) -> SchedulerHealthStatus {
		let tasks = self.tasks.read().await;
		let mut statuses = Vec::new();
		let mut worst = HealthState::Healthy;

		for task in tasks.values() {
			let consecutive_failures = task.consecutive_failures.load(Ordering::SeqCst);
			let status = determine_health_state(consecutive_failures);
			if matches!(status, HealthState::Unhealthy) {
				worst = HealthState::Unhealthy;
			} else if matches!(status, HealthState::Degraded) && !matches!(worst, HealthState::Unhealthy) {
				worst = HealthState::Degraded;
			}
			statuses.push(TaskHealthStatus {
				name: task.name.clone(),
				plugin_name: task.plugin_name.clone(),
				status,
				consecutive_failures,
				last_run: task.last_run.read().await.clone(),
			});
		}

		SchedulerHealthStatus {
			status: worst,
			tasks: statuses,
		}
	}

	pub async fn task_status(&self, task_name: &str) -> Option<TaskHealthStatus> {
		let tasks = self.tasks.read().await;
		let task = tasks.get(task_name)?;
		let consecutive_failures = task.consecutive_failures.load(Ordering::SeqCst);
		Some(TaskHealthStatus {
			name: task.name.clone(),
			plugin_name: task.plugin_name.clone(),
			status: determine_health_state(consecutive_failures),
			consecutive_failures,
			last_run: task.last_run.read().await.clone(),
		})
	}
}

/// Runs one invocation with exponential-backoff retry, isolating the
/// runner's errors so a crashing task never takes down the scheduler. An
/// overlapping call (another tick or a concurrent `run_once`) returns
/// `None` immediately rather than waiting.
async fn run_task_with_retry(
	task: &Arc<RegisteredTask>,
	orm: &dyn DataAccessPort,
	plugin_configs: &HashMap<String, PluginConfig>,
) -> Option<Result<CleanupReport, EngineError>> {
	if task.running.swap(true, Ordering::SeqCst) {
		warn!(task = %task.name, "skipping tick, previous run still in flight");
		return None;
	}
	let _guard = RunningGuard(Arc::clone(&task.running));

	let empty_config = PluginConfig::new();
	let config = plugin_configs.get(&task.plugin_name).unwrap_or(&empty_config);

	let mut retry_count = 0u32;
	loop {
		match task.runner.run(orm, config, task.batch_size).await {
			Ok(report) => {
				task.consecutive_failures.store(0, Ordering::SeqCst);
				*task.last_run.write().await = Some(LastRunInfo {
					succeeded: true,
					cleaned: report.cleaned,
					error: None,
					at: chrono::Utc::now(),
				});
				info!(task = %task.name, cleaned = report.cleaned, "cleanup task completed");
				return Some(Ok(report));
			}
			Err(e) if retry_count < MAX_RETRIES => {
				retry_count += 1;
				let delay = calculate_backoff_delay(retry_count);
				warn!(task = %task.name, retry_count, delay_secs = delay, error = %e, "cleanup task failed, retrying");
				tokio::time::sleep(Duration::from_secs(delay)).await;
			}
			Err(e) => {
				let failures = task.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
				*task.last_run.write().await = Some(LastRunInfo {
					succeeded: false,
					cleaned: 0,
					error: Some(e.to_string()),
					at: chrono::Utc::now(),
				});
				warn!(task = %task.name, consecutive_failures = failures, error = %e, "cleanup task exhausted retries");
				return Some(Err(e));
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::data_access::SqliteDataAccessPort;
	use std::sync::atomic::AtomicU32 as StdAtomicU32;

	struct CountingRunner {
		calls: Arc<StdAtomicU32>,
		fail_first_n: u32,
	}

	#[async_trait::async_trait]
	impl CleanupRunner for CountingRunner {
		async fn run(&self, _orm: &dyn DataAccessPort, _config: &PluginConfig, _batch_size: u64) -> Result<CleanupReport, EngineError> {
			let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
			if call <= self.fail_first_n {
				return Err(EngineError::Internal("simulated failure".to_string()));
			}
			Ok(CleanupReport {
				cleaned: 1,
				..Default::default()
			})
		}
	}

	async fn scheduler() -> CleanupScheduler {
		let orm: Arc<dyn DataAccessPort> = Arc::new(SqliteDataAccessPort::in_memory().await.unwrap());
		CleanupScheduler::new(orm)
	}

	#[tokio::test]
	async fn run_once_invokes_a_registered_task() {
		let scheduler = scheduler().await;
		let calls = Arc::new(StdAtomicU32::new(0));
		scheduler
			.register_cleanup_task(
				"purge_codes",
				"email-password",
				Duration::from_secs(900),
				true,
				500,
				Arc::new(CountingRunner {
					calls: Arc::clone(&calls),
					fail_first_n: 0,
				}),
			)
			.await;

		let report = scheduler.run_once("purge_codes").await.unwrap();
		assert_eq!(report.cleaned, 1);
		assert_eq!(calls.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn unknown_task_name_is_not_found() {
		let scheduler = scheduler().await;
		let result = scheduler.run_once("does-not-exist").await;
		assert!(matches!(result, Err(EngineError::NotFound(_))));
	}

	#[tokio::test]
	async fn transient_failures_retry_then_succeed() {
		let scheduler = scheduler().await;
		let calls = Arc::new(StdAtomicU32::new(0));
		scheduler
			.register_cleanup_task(
				"flaky",
				"passwordless",
				Duration::from_secs(900),
				true,
				100,
				Arc::new(CountingRunner {
					calls: Arc::clone(&calls),
					fail_first_n: 2,
				}),
			)
			.await;

		let report = scheduler.run_once("flaky").await.unwrap();
		assert_eq!(report.cleaned, 1);
		assert_eq!(calls.load(Ordering::SeqCst), 3);
	}

	#[tokio::test]
	async fn health_status_reflects_consecutive_failures() {
		let scheduler = scheduler().await;
		let calls = Arc::new(StdAtomicU32::new(0));
		scheduler
			.register_cleanup_task(
				"always_fails",
				"anonymous",
				Duration::from_secs(900),
				true,
				100,
				Arc::new(CountingRunner {
					calls,
					fail_first_n: u32::MAX,
				}),
			)
			.await;

		let _ = scheduler.run_once("always_fails").await;
		let status = scheduler.task_status("always_fails").await.unwrap();
		assert!(matches!(status.status, HealthState::Degraded));
	}

	#[tokio::test]
	async fn overlapping_run_once_calls_skip_rather_than_queue() {
		struct SlowRunner;
		#[async_trait::async_trait]
		impl CleanupRunner for SlowRunner {
			async fn run(&self, _orm: &dyn DataAccessPort, _config: &PluginConfig, _batch_size: u64) -> Result<CleanupReport, EngineError> {
				tokio::time::sleep(Duration::from_millis(200)).await;
				Ok(CleanupReport::default())
			}
		}

		let scheduler = Arc::new(scheduler().await);
		scheduler
			.register_cleanup_task("slow", "api-key", Duration::from_secs(900), true, 100, Arc::new(SlowRunner))
			.await;

		let s1 = Arc::clone(&scheduler);
		let first = tokio::spawn(async move { s1.run_once("slow").await });
		tokio::time::sleep(Duration::from_millis(20)).await;
		let second = scheduler.run_once("slow").await;

		assert!(matches!(second, Err(EngineError::Conflict(_))));
		assert!(first.await.unwrap().is_ok());
	}
}
