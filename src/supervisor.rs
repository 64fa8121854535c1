use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tracing::{info, warn};

use crate::job::{
    ExecIdentity, ExecLimits, Job, JobBuilder, JobId, LogReader, OsDriver, ProcDriver, Status,
};

/// Graceful-stop escalation timeout for client-initiated stops.
const STOP_TIMEOUT: Duration = Duration::from_secs(30);
/// Tighter timeout used when the whole server shuts down.
const SHUTDOWN_STOP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("job not found")]
    NotFound,
    #[error("job is not completed")]
    NotCompleted,
    #[error(transparent)]
    Job(#[from] crate::job::Error),
}

/// Snapshot returned by [`Supervisor::inspect`].
#[derive(Debug, Clone)]
pub struct JobDetails {
    pub command: String,
    pub status: Status,
    pub exit_code: Option<i32>,
}

/// Owns the full set of jobs. The map lock is never held across a
/// blocking job operation that can wait on external events: Remove
/// releases it before cleanup so a log-reader quiesce cannot stall
/// unrelated requests.
pub struct Supervisor {
    jobs: RwLock<HashMap<JobId, Arc<Job>>>,
    identity: ExecIdentity,
    base_dir: PathBuf,
    shim_path: PathBuf,
    cgroup_root: Option<PathBuf>,
    driver: Arc<dyn ProcDriver>,
}

impl Supervisor {
    pub fn new(identity: ExecIdentity, base_dir: impl Into<PathBuf>) -> Supervisor {
        Supervisor {
            jobs: RwLock::new(HashMap::new()),
            identity,
            base_dir: base_dir.into(),
            shim_path: PathBuf::from(crate::job::DEFAULT_SHIM_PATH),
            cgroup_root: None,
            driver: Arc::new(OsDriver),
        }
    }

    /// Test constructor: injected process driver, private cgroup root.
    #[cfg(test)]
    pub(crate) fn with_driver(
        identity: ExecIdentity,
        base_dir: impl Into<PathBuf>,
        cgroup_root: impl Into<PathBuf>,
        driver: Arc<dyn ProcDriver>,
    ) -> Supervisor {
        Supervisor {
            jobs: RwLock::new(HashMap::new()),
            identity,
            base_dir: base_dir.into(),
            shim_path: PathBuf::from("/bin/shim"),
            cgroup_root: Some(cgroup_root.into()),
            driver,
        }
    }

    /// Construct and launch a job; it becomes visible to every other
    /// operation once this returns.
    pub fn start(
        &self,
        command: String,
        args: Vec<String>,
        limits: ExecLimits,
    ) -> Result<JobId, Error> {
        let mut builder = JobBuilder::new(command.clone(), args)
            .base_dir(&self.base_dir)
            .shim_path(&self.shim_path)
            .identity(self.identity)
            .limits(limits)
            .driver(Arc::clone(&self.driver));
        if let Some(root) = &self.cgroup_root {
            builder = builder.cgroup_root(root);
        }

        let job = builder.start().map_err(|e| {
            warn!(cmd = %command, error = %e, "failed to start the job");
            e
        })?;

        let id = job.id().clone();
        self.jobs.write().unwrap().insert(id.clone(), job);
        Ok(id)
    }

    pub fn stop(&self, id: &str, graceful: bool) -> Result<(), Error> {
        let job = self.get(id)?;
        let rt = if graceful {
            job.init_stop(STOP_TIMEOUT)
        } else {
            job.force_stop()
        };
        rt.map_err(|e| {
            warn!(id, error = %e, "failed to stop the job");
            e.into()
        })
    }

    /// Delete a completed job and its artifacts. The id disappears from
    /// the map before cleanup runs; if cleanup fails the job is put
    /// back so nothing is silently orphaned.
    pub fn remove(&self, id: &str) -> Result<(), Error> {
        let jid = JobId::from(id);
        let job = {
            let mut jobs = self.jobs.write().unwrap();
            let job = jobs.get(&jid).ok_or(Error::NotFound)?;
            if !job.completed() {
                return Err(Error::NotCompleted);
            }
            let job = Arc::clone(job);
            jobs.remove(&jid);
            job
        };

        if let Err(e) = job.cleanup() {
            // cleanup failed, put the job back for a retry
            self.jobs.write().unwrap().insert(jid, job);
            return Err(e.into());
        }
        Ok(())
    }

    pub fn inspect(&self, id: &str) -> Result<JobDetails, Error> {
        let job = self.get(id)?;
        let (status, exit_code) = job.status();
        Ok(JobDetails {
            command: job.command_line(),
            status,
            exit_code,
        })
    }

    pub fn logs(&self, id: &str) -> Result<LogReader, Error> {
        let job = self.get(id)?;
        Ok(job.logs()?)
    }

    /// Whether the job can still produce output. Unknown ids count as
    /// inactive.
    pub fn active(&self, id: &str) -> bool {
        match self.get(id) {
            Ok(job) => !job.completed(),
            Err(_) => false,
        }
    }

    /// Shutdown path: graceful-stop everything, wait for every job's
    /// exit to be recorded, then purge them all.
    pub fn stop_all(&self) {
        let jobs: Vec<Arc<Job>> = self.jobs.read().unwrap().values().cloned().collect();
        info!(total = jobs.len(), "stopping all jobs");

        for job in &jobs {
            let _ = job.init_stop(SHUTDOWN_STOP_TIMEOUT);
        }
        for job in &jobs {
            job.wait_done();
        }
        for job in &jobs {
            if let Err(e) = job.cleanup() {
                warn!(id = %job.id(), error = %e, "failed to clean up job");
            }
        }
        self.jobs.write().unwrap().clear();
    }

    fn get(&self, id: &str) -> Result<Arc<Job>, Error> {
        self.jobs
            .read()
            .unwrap()
            .get(&JobId::from(id))
            .cloned()
            .ok_or(Error::NotFound)
    }
}
