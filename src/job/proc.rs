use std::convert::Infallible;
use std::ffi::CString;
use std::fs::File;
use std::io;
use std::os::fd::{OwnedFd, RawFd};
use std::path::PathBuf;

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{execvp, Pid};

use super::ns;

/// Fd number the shim inherits for setup-error reporting. The parent
/// reads it until EOF; any bytes before the close are an error message.
pub(crate) const SETUP_ERR_FD: RawFd = 3;

/// How the shim process ended.
#[derive(Debug, Clone, Copy)]
pub enum ExitReason {
    Code(i32),
    Signaled(Signal),
}

impl ExitReason {
    /// Shell convention: signal deaths map to 128 + signo.
    pub fn exit_code(self) -> i32 {
        match self {
            ExitReason::Code(c) => c,
            ExitReason::Signaled(sig) => 128 + sig as i32,
        }
    }
}

/// Everything the driver needs to launch one shim process.
pub struct SpawnSpec {
    /// full argv, argv[0] is the shim binary path
    pub argv: Vec<String>,
    /// payload cwd, already chowned to the job identity
    pub work_dir: PathBuf,
    /// becomes child fds 1 and 2
    pub log_file: File,
    /// write end of the setup-error pipe, becomes child fd 3
    pub err_pipe: OwnedFd,
}

/// Process operations behind the job engine. Production uses the
/// OS-backed driver; tests inject a fake to observe spawns and signals
/// and to script process exits.
pub trait ProcDriver: Send + Sync + 'static {
    fn start(&self, spec: SpawnSpec) -> io::Result<Pid>;
    fn wait(&self, pid: Pid) -> io::Result<ExitReason>;
    fn signal(&self, pid: Pid, sig: Signal) -> io::Result<()>;
    fn exec(&self, cmd: &str, args: &[String]) -> io::Result<Infallible>;
}

/// The real thing: clone3 into new namespaces, waitpid, kill, execvp.
pub struct OsDriver;

impl ProcDriver for OsDriver {
    fn start(&self, spec: SpawnSpec) -> io::Result<Pid> {
        ns::spawn(spec)
    }

    fn wait(&self, pid: Pid) -> io::Result<ExitReason> {
        wait_for_exit(pid)
    }

    fn signal(&self, pid: Pid, sig: Signal) -> io::Result<()> {
        kill(pid, sig).map_err(io::Error::from)
    }

    fn exec(&self, cmd: &str, args: &[String]) -> io::Result<Infallible> {
        let prog = CString::new(cmd)?;
        let mut argv = vec![prog.clone()];
        for a in args {
            argv.push(CString::new(a.as_str())?);
        }
        let never = execvp(&prog, &argv).map_err(io::Error::from)?;
        match never {}
    }
}

/// Block until pid exits, ignoring stop/continue events.
pub(crate) fn wait_for_exit(pid: Pid) -> io::Result<ExitReason> {
    loop {
        match waitpid(pid, None) {
            Ok(WaitStatus::Exited(_, code)) => return Ok(ExitReason::Code(code)),
            Ok(WaitStatus::Signaled(_, sig, _)) => return Ok(ExitReason::Signaled(sig)),
            Ok(_) => continue,
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e.into()),
        }
    }
}
