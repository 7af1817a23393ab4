//! The supervisor loop: launch, health-check, restart and reconcile.

use std::{
    collections::{BTreeMap, BTreeSet},
    io,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use {
    chrono::Utc,
    tgrelay_config::{ChangeWatcher, StoragePaths, SupervisorConfig, WorkerDescriptor, load_config},
    tokio::time::{Instant, MissedTickBehavior, interval},
    tokio_util::sync::CancellationToken,
    tracing::{debug, error, info, warn},
};

use crate::{
    Result,
    error::Error,
    process::{WorkerExit, WorkerLauncher},
    slot::{WorkerSlot, WorkerStatus},
    status::{SupervisorStatus, WorkerStatusEntry, write_status},
};

type LockProbe = Box<dyn Fn(&Path) -> io::Result<bool> + Send + Sync>;

pub struct Supervisor {
    config: SupervisorConfig,
    paths: StoragePaths,
    launcher: Arc<dyn WorkerLauncher>,
    slots: BTreeMap<String, WorkerSlot>,
    lock_probe: LockProbe,
}

impl Supervisor {
    pub fn new(
        config: SupervisorConfig,
        paths: StoragePaths,
        launcher: Arc<dyn WorkerLauncher>,
    ) -> Self {
        Self {
            config,
            paths,
            launcher,
            slots: BTreeMap::new(),
            lock_probe: Box::new(tgrelay_engine::is_locked),
        }
    }

    /// Replace the session-lock check (tests).
    #[must_use]
    pub fn with_lock_probe(
        mut self,
        probe: impl Fn(&Path) -> io::Result<bool> + Send + Sync + 'static,
    ) -> Self {
        self.lock_probe = Box::new(probe);
        self
    }

    pub fn slot(&self, worker_id: &str) -> Option<&WorkerSlot> {
        self.slots.get(worker_id)
    }

    pub fn slots(&self) -> impl Iterator<Item = &WorkerSlot> {
        self.slots.values()
    }

    fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.config.stop_timeout_secs)
    }

    /// Bring the slot set in line with `descriptors`: start new workers,
    /// restart changed ones with fresh counters, stop removed ones.
    pub async fn reconcile(&mut self, descriptors: Vec<WorkerDescriptor>) {
        let timeout = self.stop_timeout();
        let wanted: BTreeSet<&str> = descriptors.iter().map(|d| d.worker_id.as_str()).collect();
        let removed: Vec<String> = self
            .slots
            .keys()
            .filter(|id| !wanted.contains(id.as_str()))
            .cloned()
            .collect();

        for worker_id in removed {
            if let Some(mut slot) = self.slots.remove(&worker_id) {
                info!(worker_id = %worker_id, "worker removed or disabled, stopping");
                stop_slot(&mut slot, timeout).await;
            }
        }

        for descriptor in descriptors {
            let fingerprint = descriptor.fingerprint();
            match self.slots.get_mut(&descriptor.worker_id) {
                Some(slot) if slot.fingerprint == fingerprint => {},
                Some(slot) => {
                    info!(worker_id = %descriptor.worker_id, "worker config changed, restarting");
                    stop_slot(slot, timeout).await;
                    *slot = WorkerSlot::new(descriptor);
                },
                None => {
                    info!(worker_id = %descriptor.worker_id, "new worker configured");
                    self.slots
                        .insert(descriptor.worker_id.clone(), WorkerSlot::new(descriptor));
                },
            }
        }
    }

    /// One health pass at `now`.
    pub async fn tick_at(&mut self, now: Instant) {
        let Self {
            config,
            paths,
            launcher,
            slots,
            lock_probe,
        } = self;
        for slot in slots.values_mut() {
            tick_slot(config, paths, &**launcher, lock_probe, slot, now).await;
        }
    }

    #[must_use]
    pub fn status(&self, now: Instant) -> SupervisorStatus {
        let workers = self
            .slots
            .iter()
            .map(|(id, slot)| {
                let uptime_secs = slot
                    .started_at
                    .filter(|_| slot.is_alive())
                    .map_or(0, |t| now.saturating_duration_since(t).as_secs());
                (id.clone(), WorkerStatusEntry {
                    alive: slot.is_alive(),
                    pid: slot.pid(),
                    uptime_secs,
                    restart_count: slot.restart_count,
                    status: slot.status,
                    detail: slot.detail.clone(),
                })
            })
            .collect();
        SupervisorStatus {
            updated_at: Utc::now(),
            supervisor_pid: std::process::id(),
            workers,
        }
    }

    pub fn write_status(&self) -> Result<()> {
        write_status(&self.paths.status_file(), &self.status(Instant::now()))
    }

    /// Stop every worker concurrently.
    pub async fn stop_all(&mut self) {
        let timeout = self.stop_timeout();
        futures::future::join_all(
            self.slots
                .values_mut()
                .map(|slot| stop_slot(slot, timeout)),
        )
        .await;
    }

    async fn reload(&mut self, config_path: &Path) -> bool {
        match load_config(config_path) {
            Ok(config) => {
                let previous = self.config.health_interval_secs;
                self.config = config.supervisor.clone();
                self.reconcile(config.materialize_all()).await;
                previous != self.config.health_interval_secs
            },
            Err(e) => {
                warn!(error = %format!("{e:#}"), "config reload failed, keeping current workers");
                false
            },
        }
    }

    fn health_interval(&self) -> tokio::time::Interval {
        let period = Duration::from_secs(self.config.health_interval_secs.max(1));
        let mut timer = interval(period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        timer
    }

    /// Run until `cancel` fires, then stop every worker.
    pub async fn run(mut self, config_path: PathBuf, cancel: CancellationToken) -> Result<()> {
        let config = load_config(&config_path)
            .map_err(|e| Error::message(format!("failed to load config: {e:#}")))?;
        self.config = config.supervisor.clone();
        let descriptors = config.materialize_all();
        if descriptors.is_empty() {
            warn!(config = %config_path.display(), "no enabled workers configured");
        }
        info!(workers = descriptors.len(), "supervisor starting");
        self.reconcile(descriptors).await;

        let mut watcher =
            ChangeWatcher::new([config_path.clone(), self.paths.reload_marker.clone()]);
        let mut health = self.health_interval();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = health.tick() => {
                    if watcher.poll_changed() {
                        info!("configuration change detected");
                        if self.reload(&config_path).await {
                            health = self.health_interval();
                        }
                    }
                    self.tick_at(Instant::now()).await;
                    if let Err(e) = self.write_status() {
                        warn!(error = %e, "failed to write status file");
                    }
                },
            }
        }

        info!("stopping all workers");
        self.stop_all().await;
        self.write_status()
    }
}

async fn stop_slot(slot: &mut WorkerSlot, timeout: Duration) {
    if let Some(mut process) = slot.process.take() {
        match process.stop(timeout).await {
            Ok(exit) => info!(worker_id = %slot.worker_id(), code = ?exit.code, "worker stopped"),
            Err(e) => warn!(worker_id = %slot.worker_id(), error = %e, "failed to stop worker"),
        }
    }
    slot.started_at = None;
    slot.restart_at = None;
    slot.status = WorkerStatus::Stopped;
}

async fn tick_slot(
    config: &SupervisorConfig,
    paths: &StoragePaths,
    launcher: &dyn WorkerLauncher,
    lock_probe: &LockProbe,
    slot: &mut WorkerSlot,
    now: Instant,
) {
    if let Some(process) = slot.process.as_mut() {
        match process.try_exit() {
            Ok(None) => {
                slot.status = WorkerStatus::Running;
                return;
            },
            Ok(Some(exit)) => handle_exit(config, slot, exit, now),
            Err(e) => {
                warn!(worker_id = %slot.worker_id(), error = %e, "health check failed");
                return;
            },
        }
    }

    match slot.status {
        WorkerStatus::CoolingDown if slot.restart_at.is_some_and(|t| now >= t) => {
            slot.status = WorkerStatus::Starting;
        },
        WorkerStatus::Starting | WorkerStatus::WaitingForSession => {},
        _ => return,
    }

    let lock_file = paths.session_lock_file(&slot.descriptor.credentials.session_name);
    match lock_probe(&lock_file) {
        Ok(true) => {
            let since = *slot.lock_wait_since.get_or_insert(now);
            let waited = now.saturating_duration_since(since);
            if waited >= Duration::from_secs(config.session_lock_wait_secs) {
                error!(
                    worker_id = %slot.worker_id(),
                    lock = %lock_file.display(),
                    waited_secs = waited.as_secs(),
                    "session still locked by another process, giving up"
                );
                slot.fail("session locked by another process");
            } else {
                debug!(worker_id = %slot.worker_id(), "session locked, waiting");
                slot.status = WorkerStatus::WaitingForSession;
            }
            return;
        },
        Ok(false) => {},
        Err(e) => {
            warn!(worker_id = %slot.worker_id(), error = %e, "session lock probe failed, launching anyway");
        },
    }
    slot.lock_wait_since = None;

    match launcher.launch(&slot.descriptor).await {
        Ok(process) => {
            slot.process = Some(process);
            slot.started_at = Some(now);
            slot.restart_at = None;
            slot.status = WorkerStatus::Running;
        },
        Err(e) => {
            error!(worker_id = %slot.worker_id(), error = %e, "failed to launch worker");
            schedule_restart(config, slot, now, false);
        },
    }
}

fn handle_exit(config: &SupervisorConfig, slot: &mut WorkerSlot, exit: WorkerExit, now: Instant) {
    slot.process = None;
    let ran = slot
        .started_at
        .take()
        .map(|t| now.saturating_duration_since(t));

    if exit.is_session_locked() {
        error!(
            worker_id = %slot.worker_id(),
            "worker could not acquire its session, not restarting"
        );
        slot.fail("session locked by another process");
        return;
    }

    let quick = ran.is_some_and(|d| d < Duration::from_secs(config.quick_exit_window_secs));
    warn!(
        worker_id = %slot.worker_id(),
        code = ?exit.code,
        ran_secs = ran.map(|d| d.as_secs()),
        restart_count = slot.restart_count,
        "worker exited"
    );
    schedule_restart(config, slot, now, quick);
}

/// Schedule a relaunch. Quick exits usually mean session contention and
/// cool down longer with every restart.
fn schedule_restart(config: &SupervisorConfig, slot: &mut WorkerSlot, now: Instant, quick: bool) {
    if slot.restart_count >= config.max_restarts {
        error!(
            worker_id = %slot.worker_id(),
            restart_count = slot.restart_count,
            "restart limit reached, operator action required"
        );
        slot.fail(format!(
            "gave up after {} restarts",
            slot.restart_count
        ));
        return;
    }

    slot.restart_count += 1;
    let delay = if quick {
        Duration::from_secs(config.quick_exit_cooldown_secs) * slot.restart_count
    } else {
        Duration::from_secs(config.restart_delay_secs)
    };
    info!(
        worker_id = %slot.worker_id(),
        restart_count = slot.restart_count,
        delay_secs = delay.as_secs(),
        quick,
        "restart scheduled"
    );
    slot.restart_at = Some(now + delay);
    slot.status = WorkerStatus::CoolingDown;
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::process::WorkerProcess,
        async_trait::async_trait,
        std::{
            collections::HashMap,
            sync::{
                Mutex,
                atomic::{AtomicBool, Ordering},
            },
        },
        tempfile::TempDir,
        tgrelay_common::EXIT_SESSION_LOCKED,
        tgrelay_config::ChannelPair,
    };

    type ExitCell = Arc<Mutex<Option<WorkerExit>>>;

    struct FakeProcess {
        pid: u32,
        exit: ExitCell,
        stops: Arc<Mutex<Vec<String>>>,
        worker_id: String,
    }

    #[async_trait]
    impl WorkerProcess for FakeProcess {
        fn pid(&self) -> Option<u32> {
            Some(self.pid)
        }

        fn try_exit(&mut self) -> Result<Option<WorkerExit>> {
            Ok(*self.exit.lock().unwrap())
        }

        async fn stop(&mut self, _timeout: Duration) -> Result<WorkerExit> {
            self.stops.lock().unwrap().push(self.worker_id.clone());
            let mut exit = self.exit.lock().unwrap();
            Ok(*exit.get_or_insert(WorkerExit { code: None }))
        }
    }

    #[derive(Default)]
    struct FakeLauncher {
        launched: Mutex<Vec<String>>,
        running: Mutex<HashMap<String, ExitCell>>,
        stops: Arc<Mutex<Vec<String>>>,
    }

    impl FakeLauncher {
        fn launches(&self, worker_id: &str) -> usize {
            self.launched
                .lock()
                .unwrap()
                .iter()
                .filter(|id| *id == worker_id)
                .count()
        }

        fn exit(&self, worker_id: &str, code: i32) {
            let running = self.running.lock().unwrap();
            *running[worker_id].lock().unwrap() = Some(WorkerExit::exited(code));
        }

        fn stops(&self) -> Vec<String> {
            self.stops.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl WorkerLauncher for FakeLauncher {
        async fn launch(&self, descriptor: &WorkerDescriptor) -> Result<Box<dyn WorkerProcess>> {
            let mut launched = self.launched.lock().unwrap();
            launched.push(descriptor.worker_id.clone());
            let exit = ExitCell::default();
            self.running
                .lock()
                .unwrap()
                .insert(descriptor.worker_id.clone(), exit.clone());
            Ok(Box::new(FakeProcess {
                pid: 1000 + u32::try_from(launched.len()).unwrap(),
                exit,
                stops: self.stops.clone(),
                worker_id: descriptor.worker_id.clone(),
            }))
        }
    }

    fn descriptor(worker_id: &str) -> WorkerDescriptor {
        let mut credentials = tgrelay_config::Credentials::default();
        credentials.session_name = worker_id.into();
        WorkerDescriptor {
            worker_id: worker_id.into(),
            credentials,
            channel_pairs: vec![ChannelPair {
                source: -1001,
                target: -1002,
                enabled: true,
                backfill_count: 0,
            }],
            replacement_rules: Vec::new(),
            filters: Default::default(),
            settings: Default::default(),
        }
    }

    fn paths(tmp: &TempDir) -> StoragePaths {
        StoragePaths {
            data_dir: tmp.path().to_path_buf(),
            sessions_dir: tmp.path().join("sessions"),
            reload_marker: tmp.path().join("trigger_reload.flag"),
        }
    }

    fn supervisor(tmp: &TempDir, launcher: &Arc<FakeLauncher>) -> Supervisor {
        Supervisor::new(SupervisorConfig::default(), paths(tmp), launcher.clone())
            .with_lock_probe(|_| Ok(false))
    }

    fn status(sup: &Supervisor, worker_id: &str) -> WorkerStatus {
        sup.slot(worker_id).unwrap().status
    }

    const SECOND: Duration = Duration::from_secs(1);

    #[tokio::test]
    async fn starts_every_configured_worker() {
        let tmp = TempDir::new().unwrap();
        let launcher = Arc::new(FakeLauncher::default());
        let mut sup = supervisor(&tmp, &launcher);

        sup.reconcile(vec![descriptor("alpha"), descriptor("beta")]).await;
        sup.tick_at(Instant::now()).await;

        assert_eq!(launcher.launches("alpha"), 1);
        assert_eq!(launcher.launches("beta"), 1);
        assert_eq!(status(&sup, "alpha"), WorkerStatus::Running);
    }

    #[tokio::test]
    async fn quick_exits_cool_down_longer_and_stop_at_ceiling() {
        let tmp = TempDir::new().unwrap();
        let launcher = Arc::new(FakeLauncher::default());
        let mut sup = supervisor(&tmp, &launcher);
        let mut now = Instant::now();

        sup.reconcile(vec![descriptor("alpha")]).await;
        sup.tick_at(now).await;

        for restart in 1..=5u32 {
            now += SECOND;
            launcher.exit("alpha", 1);
            sup.tick_at(now).await;
            let slot = sup.slot("alpha").unwrap();
            assert_eq!(slot.status, WorkerStatus::CoolingDown);
            assert_eq!(slot.restart_count, restart);

            let cooldown = Duration::from_secs(30) * restart;
            sup.tick_at(now + cooldown - SECOND).await;
            assert_eq!(launcher.launches("alpha"), restart as usize);

            now += cooldown;
            sup.tick_at(now).await;
            assert_eq!(status(&sup, "alpha"), WorkerStatus::Running);
            assert_eq!(launcher.launches("alpha"), restart as usize + 1);
        }

        now += SECOND;
        launcher.exit("alpha", 1);
        sup.tick_at(now).await;
        assert_eq!(status(&sup, "alpha"), WorkerStatus::Failed);

        sup.tick_at(now + Duration::from_secs(3600)).await;
        assert_eq!(launcher.launches("alpha"), 6);
    }

    #[tokio::test]
    async fn long_running_worker_restarts_after_short_delay() {
        let tmp = TempDir::new().unwrap();
        let launcher = Arc::new(FakeLauncher::default());
        let mut sup = supervisor(&tmp, &launcher);
        let start = Instant::now();

        sup.reconcile(vec![descriptor("alpha")]).await;
        sup.tick_at(start).await;

        let exited = start + Duration::from_secs(600);
        launcher.exit("alpha", 0);
        sup.tick_at(exited).await;
        assert_eq!(
            sup.slot("alpha").unwrap().restart_at,
            Some(exited + Duration::from_secs(2))
        );

        sup.tick_at(exited + SECOND).await;
        assert_eq!(launcher.launches("alpha"), 1);
        sup.tick_at(exited + 2 * SECOND).await;
        assert_eq!(launcher.launches("alpha"), 2);
    }

    #[tokio::test]
    async fn session_locked_exit_is_fatal() {
        let tmp = TempDir::new().unwrap();
        let launcher = Arc::new(FakeLauncher::default());
        let mut sup = supervisor(&tmp, &launcher);
        let now = Instant::now();

        sup.reconcile(vec![descriptor("alpha")]).await;
        sup.tick_at(now).await;
        launcher.exit("alpha", EXIT_SESSION_LOCKED);
        sup.tick_at(now + Duration::from_secs(40)).await;

        let slot = sup.slot("alpha").unwrap();
        assert_eq!(slot.status, WorkerStatus::Failed);
        assert_eq!(slot.restart_count, 0);
        assert!(slot.detail.as_deref().unwrap().contains("session"));
    }

    #[tokio::test]
    async fn held_session_lock_delays_then_fails_start() {
        let tmp = TempDir::new().unwrap();
        let launcher = Arc::new(FakeLauncher::default());
        let held = Arc::new(AtomicBool::new(true));
        let probe = held.clone();
        let mut sup = Supervisor::new(SupervisorConfig::default(), paths(&tmp), launcher.clone())
            .with_lock_probe(move |_| Ok(probe.load(Ordering::SeqCst)));
        let now = Instant::now();

        sup.reconcile(vec![descriptor("alpha"), descriptor("beta")]).await;
        sup.tick_at(now).await;
        assert_eq!(status(&sup, "alpha"), WorkerStatus::WaitingForSession);

        sup.tick_at(now + Duration::from_secs(29)).await;
        assert_eq!(status(&sup, "alpha"), WorkerStatus::WaitingForSession);
        sup.tick_at(now + Duration::from_secs(30)).await;
        assert_eq!(status(&sup, "alpha"), WorkerStatus::Failed);
        assert_eq!(launcher.launches("alpha"), 0);

        // A config change resets a failed worker.
        held.store(false, Ordering::SeqCst);
        let mut changed = descriptor("alpha");
        changed.channel_pairs[0].backfill_count = 10;
        sup.reconcile(vec![changed, descriptor("beta")]).await;
        sup.tick_at(now + Duration::from_secs(31)).await;
        assert_eq!(status(&sup, "alpha"), WorkerStatus::Running);
        assert_eq!(sup.slot("alpha").unwrap().restart_count, 0);
        // Unchanged workers stay failed.
        assert_eq!(status(&sup, "beta"), WorkerStatus::Failed);
    }

    #[tokio::test]
    async fn reconcile_restarts_changed_and_stops_removed() {
        let tmp = TempDir::new().unwrap();
        let launcher = Arc::new(FakeLauncher::default());
        let mut sup = supervisor(&tmp, &launcher);
        let now = Instant::now();

        sup.reconcile(vec![descriptor("alpha"), descriptor("beta")]).await;
        sup.tick_at(now).await;

        // Unchanged config: nothing happens.
        sup.reconcile(vec![descriptor("alpha"), descriptor("beta")]).await;
        assert!(launcher.stops().is_empty());

        let mut changed = descriptor("alpha");
        changed.settings.poll_interval_secs = 30;
        sup.reconcile(vec![changed]).await;
        sup.tick_at(now + SECOND).await;

        let mut stops = launcher.stops();
        stops.sort();
        assert_eq!(stops, vec!["alpha", "beta"]);
        assert!(sup.slot("beta").is_none());
        assert_eq!(launcher.launches("alpha"), 2);
        assert_eq!(sup.slot("alpha").unwrap().restart_count, 0);
    }

    #[tokio::test]
    async fn status_reports_live_workers() {
        let tmp = TempDir::new().unwrap();
        let launcher = Arc::new(FakeLauncher::default());
        let mut sup = supervisor(&tmp, &launcher);
        let now = Instant::now();

        sup.reconcile(vec![descriptor("alpha")]).await;
        sup.tick_at(now).await;

        let snapshot = sup.status(now + Duration::from_secs(90));
        let entry = &snapshot.workers["alpha"];
        assert!(entry.alive);
        assert_eq!(entry.pid, Some(1001));
        assert_eq!(entry.uptime_secs, 90);
        assert_eq!(entry.status, WorkerStatus::Running);

        sup.write_status().unwrap();
        assert!(tmp.path().join("supervisor_status.json").exists());

        sup.stop_all().await;
        let snapshot = sup.status(now);
        assert!(!snapshot.workers["alpha"].alive);
        assert_eq!(snapshot.workers["alpha"].status, WorkerStatus::Stopped);
    }
}
