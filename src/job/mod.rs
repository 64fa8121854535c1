use std::fmt;
use std::fs::{self, File, Permissions};
use std::io::{self, Read};
use std::os::unix::prelude::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use nix::fcntl::OFlag;
use nix::sys::signal::Signal;
use nix::unistd::{self, Gid, Pid, Uid};
use scopeguard::ScopeGuard;
use tracing::{debug, error, info, warn};

pub mod cgroup;
mod logs;
pub(crate) mod ns;
pub(crate) mod proc;
mod state;

pub use logs::LogReader;
pub use proc::{ExitReason, OsDriver, ProcDriver, SpawnSpec};
pub use state::Status;

/// Default shim binary: the server re-executes itself.
pub const DEFAULT_SHIM_PATH: &str = "/proc/self/exe";
const DEFAULT_BASE_DIR: &str = "/tmp/jobs";

/// Opaque, time-ordered job identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobId(String);

impl JobId {
    fn generate() -> JobId {
        JobId(xid::new().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> JobId {
        JobId(s.to_string())
    }
}

/// User/group the payload runs as, and the owner of its working dir.
#[derive(Debug, Clone, Copy)]
pub struct ExecIdentity {
    pub uid: u32,
    pub gid: u32,
}

impl Default for ExecIdentity {
    fn default() -> ExecIdentity {
        ExecIdentity {
            uid: unistd::getuid().as_raw(),
            gid: unistd::getgid().as_raw(),
        }
    }
}

/// Per-job resource ceilings. Zero or negative means unlimited and maps
/// to the literal `max` in the cgroup files.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecLimits {
    pub cpu: f32,
    pub max_ram_bytes: i64,
    pub max_io_bytes_per_sec: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("cgroup2 controller is not mounted")]
    CgroupNotMounted,
    #[error("failed to {action}: {source}")]
    Setup {
        action: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("failed to start the process: {0:?}")]
    Shim(String),
    #[error("failed to signal the job process: {0}")]
    Signal(#[source] io::Error),
    #[error("failed to remove job artifacts: {0}")]
    Cleanup(#[source] io::Error),
    #[error("{0}")]
    State(&'static str),
}

fn setup(action: &'static str, source: io::Error) -> Error {
    Error::Setup { action, source }
}

/// Closed exactly once, by the waiter, after the job reaches a terminal
/// state. Anyone observing it closed may rely on the exit code.
struct DoneLatch {
    closed: Mutex<bool>,
    cv: Condvar,
}

impl DoneLatch {
    fn new() -> DoneLatch {
        DoneLatch {
            closed: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    fn close(&self) {
        let mut closed = self.closed.lock().unwrap();
        *closed = true;
        self.cv.notify_all();
    }

    fn wait(&self) {
        let mut closed = self.closed.lock().unwrap();
        while !*closed {
            closed = self.cv.wait(closed).unwrap();
        }
    }
}

/// Cancellable one-shot timer backing the graceful-stop escalation.
struct StopTimer {
    cancelled: Arc<(Mutex<bool>, Condvar)>,
}

impl StopTimer {
    /// After `after`, force-stop the job unless disarmed first. Both
    /// paths that disarm (exited, force_stop) hold the job mutex, so
    /// the timer body takes it only after dropping its own lock.
    fn arm(job: Arc<Job>, after: Duration) -> StopTimer {
        let cancelled = Arc::new((Mutex::new(false), Condvar::new()));
        let shared = Arc::clone(&cancelled);
        thread::spawn(move || {
            let (lock, cv) = &*shared;
            let deadline = Instant::now() + after;
            let mut cancelled = lock.lock().unwrap();
            loop {
                if *cancelled {
                    return;
                }
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                let (guard, _) = cv.wait_timeout(cancelled, deadline - now).unwrap();
                cancelled = guard;
            }
            drop(cancelled);
            debug!(id = %job.id, "graceful stop timed out, sending SIGKILL");
            let _ = job.force_stop();
        });
        StopTimer { cancelled }
    }

    fn disarm(&self) {
        let (lock, cv) = &*self.cancelled;
        *lock.lock().unwrap() = true;
        cv.notify_all();
    }
}

struct StateCell {
    status: Status,
    exit_code: Option<i32>,
    stop_timer: Option<StopTimer>,
}

/// One running (or finished) job. State transitions are serialized by
/// the state mutex; the fork, the child wait and the log file I/O all
/// happen outside it.
pub struct Job {
    id: JobId,
    command: String,
    args: Vec<String>,
    job_dir: PathBuf,
    out_path: PathBuf,
    cg: cgroup::JobCgroup,
    pid: Pid,
    driver: Arc<dyn ProcDriver>,
    state: Mutex<StateCell>,
    done: DoneLatch,
    readers: Arc<logs::ReaderGate>,
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("command", &self.command)
            .field("args", &self.args)
            .field("pid", &self.pid)
            .finish()
    }
}

impl Job {
    pub fn id(&self) -> &JobId {
        &self.id
    }

    pub fn command_line(&self) -> String {
        let mut rt = self.command.clone();
        for a in &self.args {
            rt.push(' ');
            rt.push_str(a);
        }
        rt
    }

    /// Current status plus the exit code once a terminal state is
    /// reached; before that the code is not meaningful and is withheld.
    pub fn status(&self) -> (Status, Option<i32>) {
        let cell = self.state.lock().unwrap();
        if cell.status.is_terminal() {
            (cell.status, cell.exit_code)
        } else {
            (cell.status, None)
        }
    }

    /// Whether the process is gone and no more output can appear.
    pub fn completed(&self) -> bool {
        let cell = self.state.lock().unwrap();
        !matches!(cell.status, Status::Active | Status::Stopping)
    }

    /// Graceful stop: SIGTERM now, SIGKILL when the timer fires.
    pub fn init_stop(self: &Arc<Self>, timeout: Duration) -> Result<(), Error> {
        let mut cell = self.state.lock().unwrap();
        match cell.status {
            Status::Active => {
                self.signal_stop(true)?;
                cell.stop_timer = Some(StopTimer::arm(Arc::clone(self), timeout));
                self.transition(&mut cell, Status::Stopping);
                Ok(())
            }
            Status::Stopping => Err(Error::State("job already stopping")),
            Status::Ended => Err(Error::State("job already ended")),
            Status::Stopped => Err(Error::State("job is already stopped")),
            Status::Removed => Err(Error::State("job is removed")),
        }
    }

    /// Immediate stop with SIGKILL. The state is STOPPED on return;
    /// the waiter later records the exit code without changing it.
    pub fn force_stop(&self) -> Result<(), Error> {
        let mut cell = self.state.lock().unwrap();
        match cell.status {
            Status::Active => {
                self.signal_stop(false)?;
                self.transition(&mut cell, Status::Stopped);
                Ok(())
            }
            Status::Stopping => {
                if let Some(timer) = cell.stop_timer.take() {
                    timer.disarm();
                }
                self.signal_stop(false)?;
                self.transition(&mut cell, Status::Stopped);
                Ok(())
            }
            Status::Ended => Err(Error::State("job already ended")),
            Status::Stopped => Err(Error::State("job is already stopped")),
            Status::Removed => Err(Error::State("job is removed")),
        }
    }

    /// Open a new independent output reader.
    pub fn logs(&self) -> Result<LogReader, Error> {
        let cell = self.state.lock().unwrap();
        if cell.status == Status::Removed {
            return Err(Error::State("job is removed"));
        }
        let reader = LogReader::open(&self.out_path, Arc::clone(&self.readers))
            .map_err(|e| setup("open job output", e))?;
        debug!(id = %self.id, total = self.readers.readers(), "log reader added");
        Ok(reader)
    }

    /// Purge the job's directory. Blocks until every log reader is
    /// closed, then removes `<base>/<id>` and marks the job removed.
    pub fn cleanup(&self) -> Result<(), Error> {
        let mut cell = self.state.lock().unwrap();
        if cell.status == Status::Removed {
            return Err(Error::State("job is removed"));
        }
        debug!(id = %self.id, total = self.readers.readers(), "cleanup: waiting for log readers");
        self.readers.wait_idle();
        fs::remove_dir_all(&self.job_dir).map_err(Error::Cleanup)?;
        self.transition(&mut cell, Status::Removed);
        info!(id = %self.id, "job artifacts removed");
        Ok(())
    }

    /// Block until the waiter has recorded the exit.
    pub fn wait_done(&self) {
        self.done.wait();
    }

    /// Waiter-side event: the shim exited with `code`. The outer cgroup
    /// can only be removed now that no process lives in it.
    fn exited(&self, code: i32) {
        let mut cell = self.state.lock().unwrap();
        if let Err(e) = self.cg.remove() {
            warn!(id = %self.id, error = %e, "failed to delete cgroup");
        }
        cell.exit_code = Some(code);
        if let Some(timer) = cell.stop_timer.take() {
            timer.disarm();
        }
        let next = match cell.status {
            Status::Active => Status::Ended,
            Status::Stopping => Status::Stopped,
            other => other,
        };
        self.transition(&mut cell, next);
        drop(cell);
        self.done.close();
    }

    fn transition(&self, cell: &mut StateCell, next: Status) {
        if cell.status != next {
            debug!(id = %self.id, "change job state {} -> {}", cell.status, next);
        }
        cell.status = next;
    }

    fn signal_stop(&self, graceful: bool) -> Result<(), Error> {
        let sig = if graceful {
            Signal::SIGTERM
        } else {
            Signal::SIGKILL
        };
        self.driver.signal(self.pid, sig).map_err(Error::Signal)
    }

    #[cfg(test)]
    fn has_stop_timer(&self) -> bool {
        self.state.lock().unwrap().stop_timer.is_some()
    }
}

/// Assembles and launches one job: directories, cgroup subtree, the
/// setup-error pipe, the shim spawn, and the exit waiter.
pub struct JobBuilder {
    command: String,
    args: Vec<String>,
    base_dir: PathBuf,
    shim_path: PathBuf,
    cgroup_root: Option<PathBuf>,
    identity: ExecIdentity,
    limits: ExecLimits,
    driver: Arc<dyn ProcDriver>,
}

impl JobBuilder {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> JobBuilder {
        JobBuilder {
            command: command.into(),
            args,
            base_dir: PathBuf::from(DEFAULT_BASE_DIR),
            shim_path: PathBuf::from(DEFAULT_SHIM_PATH),
            cgroup_root: None,
            identity: ExecIdentity::default(),
            limits: ExecLimits::default(),
            driver: Arc::new(OsDriver),
        }
    }

    pub fn base_dir(mut self, dir: impl Into<PathBuf>) -> JobBuilder {
        self.base_dir = dir.into();
        self
    }

    pub fn shim_path(mut self, path: impl Into<PathBuf>) -> JobBuilder {
        self.shim_path = path.into();
        self
    }

    /// Override the discovered cgroup2 mount point. The job subtree is
    /// still created as `<root>/job-<id>/inner`.
    pub fn cgroup_root(mut self, root: impl Into<PathBuf>) -> JobBuilder {
        self.cgroup_root = Some(root.into());
        self
    }

    pub fn identity(mut self, identity: ExecIdentity) -> JobBuilder {
        self.identity = identity;
        self
    }

    pub fn limits(mut self, limits: ExecLimits) -> JobBuilder {
        self.limits = limits;
        self
    }

    pub fn driver(mut self, driver: Arc<dyn ProcDriver>) -> JobBuilder {
        self.driver = driver;
        self
    }

    /// Build the job and start the shim. On any failure every resource
    /// created here (job dir, cgroup dirs) is undone before returning.
    pub fn start(self) -> Result<Arc<Job>, Error> {
        let id = JobId::generate();
        let job_dir = self.base_dir.join(id.as_str());
        let work_dir = job_dir.join("workDir");
        let out_dir = job_dir.join("out");
        let out_path = out_dir.join("output");

        self.init_job_dirs(&job_dir, &work_dir, &out_dir)?;
        let undo_dirs = scopeguard::guard(job_dir.clone(), |dir| {
            let _ = fs::remove_dir_all(dir);
        });

        let out_file = File::create(&out_path).map_err(|e| setup("create output file", e))?;

        let outer = match &self.cgroup_root {
            Some(root) => root.join(format!("job-{}", id)),
            None => cgroup::find_cgroup2_mount()
                .ok_or(Error::CgroupNotMounted)?
                .join(format!("job-{}", id)),
        };
        let cg = cgroup::JobCgroup::create(outer)?;
        let undo_cg = scopeguard::guard(cg, |cg| cg.unwind());

        let devices = if self.limits.max_io_bytes_per_sec > 0 {
            cgroup::list_block_devices().map_err(|e| setup("enlist block devices", e))?
        } else {
            Vec::new()
        };
        undo_cg.apply_limits(&self.limits, &devices)?;

        let (pipe_r, pipe_w) =
            unistd::pipe2(OFlag::O_CLOEXEC).map_err(|e| setup("create pipe", e.into()))?;

        let spec = SpawnSpec {
            argv: self.shim_argv(undo_cg.inner()),
            work_dir: work_dir.clone(),
            log_file: out_file,
            err_pipe: pipe_w,
        };
        info!(id = %id, "start proc for: {:?}", spec.argv);
        let pid = self
            .driver
            .start(spec)
            .map_err(|e| setup("start the shim process", e))?;

        // wait for the shim to close fd 3; bytes before the close are a
        // setup error. The read has no timeout, matching the contract
        // that a stuck shim blocks the starting caller.
        let mut msg = Vec::new();
        File::from(pipe_r)
            .read_to_end(&mut msg)
            .map_err(|e| setup("read shim status", e))?;
        if !msg.is_empty() {
            // the shim exits right after reporting, don't leave a zombie
            let _ = self.driver.wait(pid);
            return Err(Error::Shim(String::from_utf8_lossy(&msg).into_owned()));
        }

        let cg = ScopeGuard::into_inner(undo_cg);
        ScopeGuard::into_inner(undo_dirs);

        let job = Arc::new(Job {
            id: id.clone(),
            command: self.command,
            args: self.args,
            job_dir,
            out_path,
            cg,
            pid,
            driver: self.driver,
            state: Mutex::new(StateCell {
                status: Status::Active,
                exit_code: None,
                stop_timer: None,
            }),
            done: DoneLatch::new(),
            readers: Arc::new(logs::ReaderGate::new()),
        });

        let waiter_job = Arc::clone(&job);
        thread::spawn(move || {
            let code = match waiter_job.driver.wait(waiter_job.pid) {
                Ok(reason) => reason.exit_code(),
                Err(e) => {
                    error!(id = %waiter_job.id, error = %e, "failed to wait for the job process");
                    -1
                }
            };
            info!(id = %waiter_job.id, exit_code = code, "job ended");
            waiter_job.exited(code);
        });

        Ok(job)
    }

    fn init_job_dirs(&self, job_dir: &Path, work_dir: &Path, out_dir: &Path) -> Result<(), Error> {
        // purge leftovers if the directory already exists
        let _ = fs::remove_dir_all(job_dir);

        fs::create_dir_all(out_dir).map_err(|e| setup("create job directories", e))?;
        fs::set_permissions(job_dir, Permissions::from_mode(0o700))
            .map_err(|e| setup("create job directories", e))?;
        fs::set_permissions(out_dir, Permissions::from_mode(0o700))
            .map_err(|e| setup("create job directories", e))?;

        let undo = scopeguard::guard((), |_| {
            let _ = fs::remove_dir_all(job_dir);
        });
        fs::create_dir(work_dir).map_err(|e| setup("create working directory", e))?;

        // the payload works here after the shim drops privileges
        unistd::chown(
            work_dir,
            Some(Uid::from_raw(self.identity.uid)),
            Some(Gid::from_raw(self.identity.gid)),
        )
        .map_err(|e| setup("chown working directory", e.into()))?;

        ScopeGuard::into_inner(undo);
        Ok(())
    }

    /// The shim invocation contract: mode, payload binary, inner cgroup
    /// and identity, then the payload's own arguments after `--`.
    fn shim_argv(&self, inner: &Path) -> Vec<String> {
        let mut rt = vec![
            self.shim_path.display().to_string(),
            "--mode=shim".to_string(),
            format!("--cmd={}", self.command),
            format!("--cgroup={}", inner.display()),
            format!("--uid={}", self.identity.uid),
            format!("--gid={}", self.identity.gid),
        ];
        if !self.args.is_empty() {
            rt.push("--".to_string());
            rt.extend(self.args.iter().cloned());
        }
        rt
    }
}

#[cfg(test)]
mod tests {
    use super::proc::fake::FakeDriver;
    use super::*;
    use std::io::Write;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Fixture {
        _base: tempfile::TempDir,
        _cgroot: tempfile::TempDir,
        driver: Arc<FakeDriver>,
        job: Arc<Job>,
    }

    fn start_job(command: &str, args: &[&str]) -> Fixture {
        let base = tempfile::tempdir().unwrap();
        let cgroot = tempfile::tempdir().unwrap();
        let driver = Arc::new(FakeDriver::new());
        let job = JobBuilder::new(command, args.iter().map(|s| s.to_string()).collect())
            .base_dir(base.path())
            .cgroup_root(cgroot.path())
            .shim_path("/bin/shim")
            .driver(Arc::clone(&driver) as Arc<dyn ProcDriver>)
            .start()
            .unwrap();
        Fixture {
            _base: base,
            _cgroot: cgroot,
            driver,
            job,
        }
    }

    fn write_output(f: &Fixture, data: &[u8]) {
        let mut file = fs::OpenOptions::new()
            .append(true)
            .open(&f.job.out_path)
            .unwrap();
        file.write_all(data).unwrap();
    }

    #[test]
    fn shim_argv_contract() {
        let f = start_job("ls", &["/tmp", "/var"]);
        let identity = ExecIdentity::default();

        let spawns = f.driver.spawns.lock().unwrap();
        assert_eq!(spawns.len(), 1);
        assert_eq!(
            spawns[0].argv,
            vec![
                "/bin/shim".to_string(),
                "--mode=shim".to_string(),
                "--cmd=ls".to_string(),
                format!(
                    "--cgroup={}/job-{}/inner",
                    f._cgroot.path().display(),
                    f.job.id()
                ),
                format!("--uid={}", identity.uid),
                format!("--gid={}", identity.gid),
                "--".to_string(),
                "/tmp".to_string(),
                "/var".to_string(),
            ]
        );
        assert_eq!(
            spawns[0].work_dir,
            f._base.path().join(f.job.id().as_str()).join("workDir")
        );
    }

    #[test]
    fn shim_argv_without_args() {
        let f = start_job("true", &[]);
        let spawns = f.driver.spawns.lock().unwrap();
        assert!(!spawns[0].argv.contains(&"--".to_string()));
    }

    #[test]
    fn starts_active_without_exit_code() {
        let f = start_job("sleep", &["60"]);
        assert_eq!(f.job.status(), (Status::Active, None));
        assert!(!f.job.completed());
    }

    #[test]
    fn natural_exit_ends_the_job() {
        let f = start_job("true", &[]);
        f.driver.finish(f.driver.last_pid(), ExitReason::Code(0));
        f.job.wait_done();
        assert_eq!(f.job.status(), (Status::Ended, Some(0)));
        assert!(f.job.completed());
        assert!(f.driver.sent_signals().is_empty());
    }

    #[test]
    fn force_stop_kills_and_stays_stopped() {
        let f = start_job("sleep", &["60"]);
        f.job.force_stop().unwrap();
        assert_eq!(f.job.status(), (Status::Stopped, None));
        assert_eq!(f.driver.sent_signals(), vec![Signal::SIGKILL]);

        f.driver
            .finish(f.driver.last_pid(), ExitReason::Signaled(Signal::SIGKILL));
        f.job.wait_done();
        assert_eq!(f.job.status(), (Status::Stopped, Some(137)));
    }

    #[test]
    fn graceful_stop_then_natural_exit() {
        let f = start_job("sleep", &["60"]);
        f.job.init_stop(Duration::from_secs(3600)).unwrap();
        assert_eq!(f.job.status(), (Status::Stopping, None));
        assert_eq!(f.driver.sent_signals(), vec![Signal::SIGTERM]);
        assert!(f.job.has_stop_timer());

        f.driver.finish(f.driver.last_pid(), ExitReason::Code(0));
        f.job.wait_done();
        assert_eq!(f.job.status(), (Status::Stopped, Some(0)));
        assert!(!f.job.has_stop_timer());
        // the one-hour timer was disarmed, no SIGKILL followed
        assert_eq!(f.driver.sent_signals(), vec![Signal::SIGTERM]);
    }

    #[test]
    fn graceful_stop_escalates_to_sigkill() {
        let f = start_job("sleep", &["60"]);
        f.job.init_stop(Duration::from_millis(50)).unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while f.driver.sent_signals().len() < 2 {
            assert!(Instant::now() < deadline, "timer never fired");
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(
            f.driver.sent_signals(),
            vec![Signal::SIGTERM, Signal::SIGKILL]
        );
        assert_eq!(f.job.status().0, Status::Stopped);

        f.driver
            .finish(f.driver.last_pid(), ExitReason::Signaled(Signal::SIGKILL));
        f.job.wait_done();
        assert_eq!(f.job.status(), (Status::Stopped, Some(137)));
    }

    #[test]
    fn force_stop_during_stopping_disarms_timer() {
        let f = start_job("sleep", &["60"]);
        f.job.init_stop(Duration::from_secs(3600)).unwrap();
        f.job.force_stop().unwrap();
        assert!(!f.job.has_stop_timer());
        assert_eq!(
            f.driver.sent_signals(),
            vec![Signal::SIGTERM, Signal::SIGKILL]
        );
    }

    #[test]
    fn illegal_events_do_not_mutate_or_signal() {
        let f = start_job("true", &[]);
        f.driver.finish(f.driver.last_pid(), ExitReason::Code(3));
        f.job.wait_done();

        let err = f.job.init_stop(Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, Error::State("job already ended")));
        let err = f.job.force_stop().unwrap_err();
        assert!(matches!(err, Error::State("job already ended")));

        assert_eq!(f.job.status(), (Status::Ended, Some(3)));
        assert!(f.driver.sent_signals().is_empty());
    }

    #[test]
    fn double_graceful_stop_is_rejected() {
        let f = start_job("sleep", &["60"]);
        f.job.init_stop(Duration::from_secs(3600)).unwrap();
        let err = f.job.init_stop(Duration::from_secs(3600)).unwrap_err();
        assert!(matches!(err, Error::State("job already stopping")));
        assert_eq!(f.driver.sent_signals(), vec![Signal::SIGTERM]);
    }

    #[test]
    fn cleanup_blocks_until_readers_close() {
        let f = start_job("true", &[]);
        write_output(&f, b"some output\n");

        let first = f.job.logs().unwrap();
        let mut second = f.job.logs().unwrap();

        f.driver.finish(f.driver.last_pid(), ExitReason::Code(0));
        f.job.wait_done();

        let finished = Arc::new(AtomicBool::new(false));
        let cleaner = {
            let job = Arc::clone(&f.job);
            let finished = Arc::clone(&finished);
            thread::spawn(move || {
                job.cleanup().unwrap();
                finished.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(100));
        assert!(!finished.load(Ordering::SeqCst), "cleanup ran with live readers");

        drop(first);
        thread::sleep(Duration::from_millis(100));
        assert!(!finished.load(Ordering::SeqCst), "cleanup ran with one live reader");

        // the surviving reader still sees everything written so far
        let mut buf = String::new();
        second.read_to_string(&mut buf).unwrap();
        assert_eq!(buf, "some output\n");

        drop(second);
        cleaner.join().unwrap();
        assert!(!f.job.job_dir.exists());
        assert_eq!(f.job.status().0, Status::Removed);

        assert!(matches!(
            f.job.logs().unwrap_err(),
            Error::State("job is removed")
        ));
        assert!(matches!(
            f.job.cleanup().unwrap_err(),
            Error::State("job is removed")
        ));
    }

    #[test]
    fn shim_setup_error_fails_start_and_unwinds() {
        let base = tempfile::tempdir().unwrap();
        let cgroot = tempfile::tempdir().unwrap();
        let driver = Arc::new(FakeDriver::new());
        driver.fail_setup("failed to setup the process: no such cgroup");

        let err = JobBuilder::new("ls", vec![])
            .base_dir(base.path())
            .cgroup_root(cgroot.path())
            .driver(Arc::clone(&driver) as Arc<dyn ProcDriver>)
            .start()
            .unwrap_err();

        match err {
            Error::Shim(msg) => assert!(msg.contains("no such cgroup")),
            other => panic!("unexpected error: {other}"),
        }
        // the job directory was undone
        assert_eq!(fs::read_dir(base.path()).unwrap().count(), 0);
    }
}
