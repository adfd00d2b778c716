use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::sync::Notify;

use crate::config::{Config, MAX_THREADS};
use crate::conflict::{ConflictResolver, Resolution};
use crate::credentials::CredentialResolver;
use crate::errors::{CloneError, Result};
use crate::git::{CancelFlag, CloneBackend, CloneRequest};
use crate::project::{CloneResult, CloneTask, Project};
use crate::report::{Manifest, ResultAggregator};
use crate::retry;

/// Injectable sleep so backoff behavior is testable without real time.
type SleepFn = Arc<dyn Fn(Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

fn tokio_sleep() -> SleepFn {
    Arc::new(|d| Box::pin(tokio::time::sleep(d)))
}

/// State shared by the worker tasks for one run.
struct Shared {
    queue: Mutex<VecDeque<CloneTask>>,
    /// Wakes idle workers when the queue gains a task or the run winds down.
    queue_notify: Notify,
    /// Projects without a terminal result yet. Workers exit at zero.
    remaining: AtomicUsize,
    /// Set by exit-on-error or the global timeout; dequeued tasks drain as
    /// skipped once set.
    halted: AtomicBool,
    halt_notify: Notify,
    /// Run-level cancel; parents every per-task flag.
    cancel: CancelFlag,
}

impl Shared {
    fn halt(&self) {
        self.halted.store(true, Ordering::SeqCst);
        self.halt_notify.notify_waiters();
        self.queue_notify.notify_waiters();
    }

    fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }
}

enum Exec {
    /// Existing up-to-date clone of the same remote; nothing to do.
    Skip,
    Done { relocated: Option<std::path::PathBuf> },
}

/// The bounded worker pool. Fans discovered projects out to `threads`
/// workers, drives conflict and credential resolution per task, bounds each
/// backend call with the clone timeout and applies the retry policy on
/// failure.
pub struct CloneScheduler {
    config: Arc<Config>,
    backend: Arc<dyn CloneBackend>,
    credentials: Arc<CredentialResolver>,
    conflicts: Arc<ConflictResolver>,
    sleeper: SleepFn,
}

impl CloneScheduler {
    pub fn new(
        config: Config,
        backend: Arc<dyn CloneBackend>,
        credentials: Arc<CredentialResolver>,
    ) -> Self {
        let conflicts = Arc::new(ConflictResolver::new(
            config.conflict_mode,
            config.output_root.clone(),
        ));
        CloneScheduler {
            config: Arc::new(config),
            backend,
            credentials,
            conflicts,
            sleeper: tokio_sleep(),
        }
    }

    #[cfg(test)]
    fn with_sleeper(mut self, sleeper: SleepFn) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Run every project to a terminal outcome. Per-task failures land in the
    /// manifest, never abort the run.
    pub async fn run(self: Arc<Self>, projects: Vec<Project>) -> Manifest {
        let total = projects.len();
        let aggregator = ResultAggregator::new(self.config.host.clone(), total);

        let queue: VecDeque<CloneTask> = projects
            .into_iter()
            .enumerate()
            .map(|(index, project)| {
                let target_path = project.target_path(&self.config.output_root);
                CloneTask {
                    project,
                    index,
                    target_path,
                    attempt: 0,
                }
            })
            .collect();

        let shared = Arc::new(Shared {
            queue: Mutex::new(queue),
            queue_notify: Notify::new(),
            remaining: AtomicUsize::new(total),
            halted: AtomicBool::new(false),
            halt_notify: Notify::new(),
            cancel: CancelFlag::new(),
        });

        let watchdog = self.config.global_timeout.map(|limit| {
            let shared = Arc::clone(&shared);
            tokio::spawn(async move {
                tokio::time::sleep(limit).await;
                log::warn!("global timeout of {:?} reached, cancelling run", limit);
                shared.cancel.cancel();
                shared.halt();
            })
        });

        let workers = self.config.threads.clamp(1, MAX_THREADS);
        let (tx, mut rx) = mpsc::channel::<(usize, CloneResult)>(workers.max(1));
        let mut handles = Vec::with_capacity(workers);
        for _ in 0..workers {
            let scheduler = Arc::clone(&self);
            let shared = Arc::clone(&shared);
            let tx = tx.clone();
            handles.push(tokio::spawn(async move {
                scheduler.worker_loop(shared, tx).await;
            }));
        }
        drop(tx);

        while let Some((index, result)) = rx.recv().await {
            aggregator.record(index, result);
        }
        for handle in handles {
            let _ = handle.await;
        }
        if let Some(watchdog) = watchdog {
            watchdog.abort();
        }

        aggregator.finalize()
    }

    async fn worker_loop(&self, shared: Arc<Shared>, tx: mpsc::Sender<(usize, CloneResult)>) {
        loop {
            let notified = shared.queue_notify.notified();
            tokio::pin!(notified);
            // Register before checking the queue so a push between the check
            // and the await cannot be missed.
            notified.as_mut().enable();

            let task = shared.queue.lock().unwrap().pop_front();
            match task {
                Some(task) => {
                    if shared.is_halted() {
                        let result = CloneResult::skipped(&task.project.name, task.attempt);
                        self.finish(&shared, &tx, task.index, result).await;
                        continue;
                    }
                    self.process(&shared, &tx, task).await;
                }
                None => {
                    if shared.remaining.load(Ordering::SeqCst) == 0 {
                        return;
                    }
                    notified.await;
                }
            }
        }
    }

    async fn process(
        &self,
        shared: &Arc<Shared>,
        tx: &mpsc::Sender<(usize, CloneResult)>,
        task: CloneTask,
    ) {
        let start = Instant::now();
        log::debug!(
            "cloning project={} attempt={} target={:?}",
            task.project.name,
            task.attempt,
            task.target_path
        );

        match self.execute(shared, &task).await {
            Ok(Exec::Skip) => {
                log::info!("up to date, skipping project={}", task.project.name);
                let result = CloneResult::skipped(&task.project.name, task.attempt);
                self.finish(shared, tx, task.index, result).await;
            }
            Ok(Exec::Done { relocated }) => {
                let result = CloneResult::succeeded(&task, start.elapsed(), relocated);
                self.finish(shared, tx, task.index, result).await;
            }
            Err(err) => {
                let retryable = retry::classify(&err) == retry::Classification::Retryable;
                let budget_left = task.attempt < self.config.retry_attempts;
                if retryable && budget_left && !shared.is_halted() {
                    let delay = retry::next_delay(
                        task.attempt,
                        self.config.retry_base_delay,
                        self.config.retry_factor,
                        self.config.retry_max_delay,
                    );
                    log::warn!(
                        "clone failed, retrying in {:?}: project={} attempt={} err={}",
                        delay,
                        task.project.name,
                        task.attempt,
                        err
                    );
                    self.schedule_retry(shared, task, delay);
                } else {
                    log::error!(
                        "clone failed terminally: project={} attempts={} err={}",
                        task.project.name,
                        task.attempt + 1,
                        err
                    );
                    let result = CloneResult::failed(&task, start.elapsed(), &err);
                    self.finish(shared, tx, task.index, result).await;
                }
            }
        }
    }

    /// Re-enqueue after the backoff delay without occupying this worker; a
    /// detached timer task does the waiting. A halt short-circuits the wait
    /// so draining is prompt.
    fn schedule_retry(&self, shared: &Arc<Shared>, mut task: CloneTask, delay: Duration) {
        task.attempt += 1;
        let shared = Arc::clone(shared);
        let sleep = (self.sleeper)(delay);
        tokio::spawn(async move {
            let halted = shared.halt_notify.notified();
            tokio::pin!(halted);
            halted.as_mut().enable();
            if !shared.is_halted() {
                tokio::select! {
                    _ = sleep => {}
                    _ = &mut halted => {}
                }
            }
            shared.queue.lock().unwrap().push_back(task);
            shared.queue_notify.notify_waiters();
        });
    }

    async fn execute(&self, shared: &Arc<Shared>, task: &CloneTask) -> Result<Exec> {
        let credentials = self.credentials.resolve(&self.config.host)?;
        let authenticated = credentials.is_authenticated();
        let url = task.project.url(&self.config, authenticated);

        // Check-and-relocate happens under the path-prefix lock; the clone
        // below runs without it.
        let resolution = self.conflicts.check(&task.target_path, &url).await?;
        let (update, relocated) = match resolution {
            Resolution::ExistingSameRemote if !self.config.update_existing => {
                return Ok(Exec::Skip);
            }
            Resolution::ExistingSameRemote => (true, None),
            Resolution::Proceed => (false, None),
            Resolution::ProceedRelocated(backup) => (false, Some(backup)),
        };

        let request = CloneRequest {
            host: self.config.host.clone(),
            url,
            target: task.target_path.clone(),
            mirror: self.config.mirror,
            update,
            credentials: authenticated.then_some(credentials),
        };

        let cancel = shared.cancel.child();
        let backend = Arc::clone(&self.backend);
        let task_cancel = cancel.clone();
        let mut handle =
            tokio::task::spawn_blocking(move || backend.perform(&request, &task_cancel));

        match tokio::time::timeout(self.config.clone_timeout, &mut handle).await {
            // An error out of a transfer the run-level flag aborted is a
            // cancellation, not a genuine git failure.
            Ok(Ok(Err(_))) if cancel.is_cancelled() => Err(CloneError::Cancelled),
            Ok(Ok(outcome)) => outcome.map(|_| Exec::Done { relocated }),
            Ok(Err(join_err)) => Err(CloneError::Git(format!("clone task panicked: {}", join_err))),
            Err(_) => {
                // Hard-cancel the transfer and wait for it to actually stop
                // so no orphaned operation keeps writing to the target.
                cancel.cancel();
                let _ = handle.await;
                Err(CloneError::Timeout {
                    seconds: self.config.clone_timeout.as_secs(),
                })
            }
        }
    }

    async fn finish(
        &self,
        shared: &Arc<Shared>,
        tx: &mpsc::Sender<(usize, CloneResult)>,
        index: usize,
        result: CloneResult,
    ) {
        if result.outcome == crate::project::Outcome::Failed && self.config.exit_on_error {
            log::warn!("halting new work after failure of {}", result.project);
            shared.halt();
        }
        shared.remaining.fetch_sub(1, Ordering::SeqCst);
        shared.queue_notify.notify_waiters();
        let _ = tx.send((index, result)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConflictMode;
    use crate::git::Performed;
    use crate::project::{Outcome, ProjectState};
    use std::collections::HashMap;

    fn project(name: &str) -> Project {
        Project {
            name: name.to_string(),
            state: ProjectState::Active,
            parent: None,
        }
    }

    /// Scripted stand-in for the clone collaborator. Outcomes pop per
    /// attempt; an exhausted or missing script means success.
    struct FakeBackend {
        plans: Mutex<HashMap<String, VecDeque<Result<Performed>>>>,
        delays: Mutex<HashMap<String, Duration>>,
        per_call_delay: Duration,
        current: AtomicUsize,
        max_seen: AtomicUsize,
        calls: AtomicUsize,
    }

    impl FakeBackend {
        fn new() -> Self {
            FakeBackend {
                plans: Mutex::new(HashMap::new()),
                delays: Mutex::new(HashMap::new()),
                per_call_delay: Duration::ZERO,
                current: AtomicUsize::new(0),
                max_seen: AtomicUsize::new(0),
                calls: AtomicUsize::new(0),
            }
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.per_call_delay = delay;
            self
        }

        /// Scripts and delays are keyed by the last path segment of the
        /// clone URL.
        fn plan(&self, project: &str, outcomes: Vec<Result<Performed>>) {
            self.plans
                .lock()
                .unwrap()
                .insert(project.to_string(), outcomes.into());
        }

        fn delay_for(&self, project: &str, delay: Duration) {
            self.delays
                .lock()
                .unwrap()
                .insert(project.to_string(), delay);
        }

        fn busy_wait(delay: Duration, cancel: &CancelFlag) {
            let deadline = std::time::Instant::now() + delay;
            while std::time::Instant::now() < deadline {
                if cancel.is_cancelled() {
                    return;
                }
                std::thread::sleep(Duration::from_millis(1));
            }
        }
    }

    impl CloneBackend for FakeBackend {
        fn perform(&self, request: &CloneRequest, cancel: &CancelFlag) -> Result<Performed> {
            let name = request
                .url
                .rsplit_once('/')
                .map(|(_, n)| n.to_string())
                .unwrap_or_else(|| request.url.clone());

            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_seen.fetch_max(now, Ordering::SeqCst);

            let delay = self
                .delays
                .lock()
                .unwrap()
                .get(&name)
                .copied()
                .unwrap_or(self.per_call_delay);
            if !delay.is_zero() {
                Self::busy_wait(delay, cancel);
            }

            self.current.fetch_sub(1, Ordering::SeqCst);
            if cancel.is_cancelled() {
                return Err(CloneError::Git("transfer cancelled".to_string()));
            }

            let planned = self.plans.lock().unwrap().get_mut(&name).and_then(|q| q.pop_front());
            planned.unwrap_or(Ok(Performed::Cloned))
        }
    }

    struct Harness {
        config: Config,
        backend: Arc<FakeBackend>,
        _output: tempfile::TempDir,
    }

    impl Harness {
        fn new() -> Self {
            let output = tempfile::tempdir().unwrap();
            let mut config = Config::for_tests();
            config.output_root = output.path().to_path_buf();
            // Backoff must not slow tests down; the sleeper is stubbed out
            // anyway in tests that retry.
            config.retry_base_delay = Duration::from_millis(1);
            config.retry_max_delay = Duration::from_millis(5);
            // Anonymous HTTPS throughout; no ambient ~/.netrc leaks in.
            config.netrc_mode = crate::config::NetrcMode::Disabled;
            Harness {
                config,
                backend: Arc::new(FakeBackend::new()),
                _output: output,
            }
        }

        fn scheduler(&self) -> Arc<CloneScheduler> {
            let credentials = Arc::new(CredentialResolver::new(self.config.clone()));
            Arc::new(CloneScheduler::new(
                self.config.clone(),
                Arc::clone(&self.backend) as Arc<dyn CloneBackend>,
                credentials,
            ))
        }

        fn scheduler_with_recorded_sleeps(
            &self,
        ) -> (Arc<CloneScheduler>, Arc<Mutex<Vec<Duration>>>) {
            let recorded: Arc<Mutex<Vec<Duration>>> = Arc::new(Mutex::new(Vec::new()));
            let recorded2 = Arc::clone(&recorded);
            let credentials = Arc::new(CredentialResolver::new(self.config.clone()));
            let scheduler = CloneScheduler::new(
                self.config.clone(),
                Arc::clone(&self.backend) as Arc<dyn CloneBackend>,
                credentials,
            )
            .with_sleeper(Arc::new(move |d| {
                recorded2.lock().unwrap().push(d);
                Box::pin(std::future::ready(()))
            }));
            (Arc::new(scheduler), recorded)
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn five_projects_two_threads_all_succeed() {
        let mut harness = Harness::new();
        harness.config.threads = 2;
        let projects: Vec<Project> =
            ["a", "b", "c", "d", "e"].iter().map(|n| project(n)).collect();

        let manifest = harness.scheduler().run(projects).await;

        assert_eq!(manifest.summary.total, 5);
        assert_eq!(manifest.summary.succeeded, 5);
        assert_eq!(manifest.summary.failed, 0);
        assert_eq!(manifest.summary.skipped, 0);
        assert!(manifest.is_success());
        assert_eq!(manifest.results.len(), 5);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn manifest_order_is_discovery_order_despite_completion_order() {
        let mut harness = Harness::new();
        harness.config.threads = 4;
        // Staggered delays force completion in reverse of discovery order.
        harness.backend.delay_for("p0", Duration::from_millis(80));
        harness.backend.delay_for("p1", Duration::from_millis(50));
        harness.backend.delay_for("p2", Duration::from_millis(20));
        harness.backend.delay_for("p3", Duration::from_millis(1));

        let projects: Vec<Project> = ["p0", "p1", "p2", "p3"].iter().map(|n| project(n)).collect();
        let manifest = harness.scheduler().run(projects).await;

        let names: Vec<&str> = manifest.results.iter().map(|r| r.project.as_str()).collect();
        assert_eq!(names, vec!["p0", "p1", "p2", "p3"]);
        assert_eq!(manifest.summary.succeeded, 4);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn never_more_than_threads_concurrent_clones() {
        let mut harness = Harness::new();
        harness.config.threads = 3;
        harness.backend = Arc::new(FakeBackend::new().with_delay(Duration::from_millis(20)));

        let projects: Vec<Project> = (0..12).map(|i| project(&format!("p{:02}", i))).collect();
        let backend = Arc::clone(&harness.backend);
        let manifest = harness.scheduler().run(projects).await;

        assert_eq!(manifest.summary.succeeded, 12);
        let max_seen = backend.max_seen.load(Ordering::SeqCst);
        assert!(max_seen <= 3, "saw {} concurrent clones", max_seen);
        assert!(max_seen >= 2, "pool never ran in parallel");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn fails_twice_then_succeeds_within_budget() {
        let mut harness = Harness::new();
        harness.config.retry_attempts = 3;
        harness.backend.plan(
            "flaky",
            vec![
                Err(CloneError::Network("reset".into())),
                Err(CloneError::Network("reset again".into())),
                Ok(Performed::Cloned),
            ],
        );

        let (scheduler, sleeps) = harness.scheduler_with_recorded_sleeps();
        let manifest = scheduler.run(vec![project("flaky")]).await;

        let result = &manifest.results[0];
        assert_eq!(result.outcome, Outcome::Succeeded);
        assert_eq!(result.attempts, 3);
        assert_eq!(sleeps.lock().unwrap().len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn retry_budget_is_bounded_and_backoff_monotone() {
        let mut harness = Harness::new();
        harness.config.retry_attempts = 3;
        harness.config.retry_base_delay = Duration::from_secs(2);
        harness.config.retry_factor = 2.0;
        harness.config.retry_max_delay = Duration::from_secs(5);
        harness.backend.plan(
            "dead",
            vec![
                Err(CloneError::Network("1".into())),
                Err(CloneError::Network("2".into())),
                Err(CloneError::Network("3".into())),
                Err(CloneError::Network("4".into())),
                Err(CloneError::Network("never reached".into())),
            ],
        );

        let (scheduler, sleeps) = harness.scheduler_with_recorded_sleeps();
        let manifest = scheduler.run(vec![project("dead")]).await;

        let result = &manifest.results[0];
        assert_eq!(result.outcome, Outcome::Failed);
        assert_eq!(result.attempts, 4); // retry_attempts + 1
        let backend_calls = harness.backend.calls.load(Ordering::SeqCst);
        assert_eq!(backend_calls, 4);

        let sleeps = sleeps.lock().unwrap();
        assert_eq!(sleeps.as_slice(), &[
            Duration::from_secs(2),
            Duration::from_secs(4),
            Duration::from_secs(5), // capped
        ]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn fatal_errors_never_retry() {
        let mut harness = Harness::new();
        harness.config.retry_attempts = 5;
        harness.backend.plan(
            "locked",
            vec![Err(CloneError::Auth {
                host: "gerrit.example.org".into(),
                message: "403".into(),
            })],
        );

        let backend = Arc::clone(&harness.backend);
        let manifest = harness.scheduler().run(vec![project("locked")]).await;

        let result = &manifest.results[0];
        assert_eq!(result.outcome, Outcome::Failed);
        assert_eq!(result.attempts, 1);
        assert_eq!(result.error_kind, Some(crate::project::ErrorKind::Auth));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn existing_same_remote_clone_is_skipped_without_backend_call() {
        let harness = Harness::new();
        let proj = project("already");
        let target = proj.target_path(&harness.config.output_root);
        std::fs::create_dir_all(&target).unwrap();
        let repo = git2::Repository::init(&target).unwrap();
        // Anonymous HTTPS run; resolver yields no credentials for this config.
        repo.remote("origin", "https://gerrit.example.org/already")
            .unwrap();

        let backend = Arc::clone(&harness.backend);
        let manifest = harness.scheduler().run(vec![proj]).await;

        assert_eq!(manifest.results[0].outcome, Outcome::Skipped);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn update_existing_fetches_instead_of_skipping() {
        let mut harness = Harness::new();
        harness.config.update_existing = true;
        let proj = project("already");
        let target = proj.target_path(&harness.config.output_root);
        std::fs::create_dir_all(&target).unwrap();
        let repo = git2::Repository::init(&target).unwrap();
        repo.remote("origin", "https://gerrit.example.org/already")
            .unwrap();

        let backend = Arc::clone(&harness.backend);
        let manifest = harness.scheduler().run(vec![proj]).await;

        assert_eq!(manifest.results[0].outcome, Outcome::Succeeded);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn conflicting_repo_fails_under_protect() {
        let harness = Harness::new();
        let proj = project("contested");
        let target = proj.target_path(&harness.config.output_root);
        std::fs::create_dir_all(&target).unwrap();
        let repo = git2::Repository::init(&target).unwrap();
        repo.remote("origin", "https://elsewhere.example.org/other")
            .unwrap();

        let manifest = harness.scheduler().run(vec![proj]).await;

        let result = &manifest.results[0];
        assert_eq!(result.outcome, Outcome::Failed);
        assert_eq!(result.error_kind, Some(crate::project::ErrorKind::Conflict));
        assert_eq!(result.attempts, 1, "conflicts are fatal, not retried");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn conflicting_repo_relocated_under_move_mode() {
        let mut harness = Harness::new();
        harness.config.conflict_mode = ConflictMode::Move;
        let proj = project("contested");
        let target = proj.target_path(&harness.config.output_root);
        std::fs::create_dir_all(&target).unwrap();
        let repo = git2::Repository::init(&target).unwrap();
        repo.remote("origin", "https://elsewhere.example.org/other")
            .unwrap();
        std::fs::write(target.join("keep.txt"), "survivor").unwrap();

        let manifest = harness.scheduler().run(vec![proj]).await;

        let result = &manifest.results[0];
        assert_eq!(result.outcome, Outcome::Succeeded);
        let backup = result.relocated_from.as_ref().expect("relocation recorded");
        assert_eq!(
            std::fs::read_to_string(backup.join("keep.txt")).unwrap(),
            "survivor"
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn exit_on_error_drains_remaining_as_skipped() {
        let mut harness = Harness::new();
        harness.config.threads = 1;
        harness.config.retry_attempts = 0;
        harness.config.exit_on_error = true;
        harness.backend.plan(
            "b",
            vec![Err(CloneError::Auth {
                host: "gerrit.example.org".into(),
                message: "403".into(),
            })],
        );

        let projects: Vec<Project> = ["a", "b", "c", "d"].iter().map(|n| project(n)).collect();
        let manifest = harness.scheduler().run(projects).await;

        assert_eq!(manifest.summary.total, 4);
        assert_eq!(manifest.summary.succeeded, 1); // "a" ran before the failure
        assert_eq!(manifest.summary.failed, 1);
        assert_eq!(manifest.summary.skipped, 2);
        assert_eq!(manifest.results[2].outcome, Outcome::Skipped);
        assert_eq!(manifest.results[3].outcome, Outcome::Skipped);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn per_task_timeout_cancels_the_transfer() {
        let mut harness = Harness::new();
        harness.config.retry_attempts = 0;
        harness.config.clone_timeout = Duration::from_millis(30);
        harness.backend = Arc::new(FakeBackend::new().with_delay(Duration::from_secs(10)));

        let start = Instant::now();
        let manifest = harness.scheduler().run(vec![project("slow")]).await;

        let result = &manifest.results[0];
        assert_eq!(result.outcome, Outcome::Failed);
        assert_eq!(result.error_kind, Some(crate::project::ErrorKind::Timeout));
        // The backend observed the cancel flag and stopped early.
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn global_timeout_skips_tasks_not_yet_started() {
        let mut harness = Harness::new();
        harness.config.threads = 1;
        harness.config.global_timeout = Some(Duration::from_millis(40));
        harness.backend = Arc::new(FakeBackend::new().with_delay(Duration::from_millis(30)));

        let projects: Vec<Project> = (0..6).map(|i| project(&format!("p{}", i))).collect();
        let manifest = harness.scheduler().run(projects).await;

        assert_eq!(manifest.summary.total, 6);
        assert!(manifest.summary.skipped >= 1, "queued tasks drain as skipped");
        assert_eq!(
            manifest.summary.succeeded + manifest.summary.failed + manifest.summary.skipped,
            6
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn global_timeout_reports_cancelled_transfer_as_timeout() {
        let mut harness = Harness::new();
        harness.config.threads = 1;
        harness.config.retry_attempts = 0;
        harness.config.global_timeout = Some(Duration::from_millis(50));
        harness.backend = Arc::new(FakeBackend::new().with_delay(Duration::from_millis(500)));

        let projects: Vec<Project> = ["p0", "p1", "p2"].iter().map(|n| project(n)).collect();
        let manifest = harness.scheduler().run(projects).await;

        // The in-flight transfer was force-cancelled mid-run; manifest
        // consumers must be able to tell that apart from a git failure.
        let first = &manifest.results[0];
        assert_eq!(first.outcome, Outcome::Failed);
        assert_eq!(first.error_kind, Some(crate::project::ErrorKind::Timeout));
        assert_eq!(manifest.results[1].outcome, Outcome::Skipped);
        assert_eq!(manifest.results[2].outcome, Outcome::Skipped);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn one_result_per_project_with_mixed_outcomes() {
        let mut harness = Harness::new();
        harness.config.threads = 3;
        harness.config.retry_attempts = 1;
        harness.backend.plan(
            "bad",
            vec![
                Err(CloneError::Network("r1".into())),
                Err(CloneError::Network("r2".into())),
            ],
        );

        let projects: Vec<Project> = ["bad", "good-one", "good-two"]
            .iter()
            .map(|n| project(n))
            .collect();
        let (scheduler, _) = harness.scheduler_with_recorded_sleeps();
        let manifest = scheduler.run(projects).await;

        assert_eq!(manifest.summary.total, 3);
        assert_eq!(manifest.summary.failed, 1);
        assert_eq!(manifest.summary.succeeded, 2);
        let names: Vec<&str> = manifest.results.iter().map(|r| r.project.as_str()).collect();
        assert_eq!(names, vec!["bad", "good-one", "good-two"]);
    }
}
