use std::fs::File;
use std::io::Write;
use std::os::fd::FromRawFd;
use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result};
use nix::sys::signal::{kill, Signal};
use nix::unistd::{self, ForkResult, Gid, Pid, Uid};
use signal_hook::iterator::Signals;

use crate::job::cgroup;
use crate::job::ns;
use crate::job::proc::{self, ProcDriver, SETUP_ERR_FD};
use crate::job::DEFAULT_SHIM_PATH;

/// Arguments of the reserved `--mode=shim` invocation.
pub struct ShimOpts {
    pub command: String,
    pub args: Vec<String>,
    pub cgroup: PathBuf,
    pub uid: u32,
    pub gid: u32,
}

/// Entry point of the second invocation of this binary: pid 1 of the
/// new PID namespace. Finishes the isolation the parent started, drops
/// privileges, runs the payload and reaps everything that re-parents
/// to it. Never returns.
///
/// Setup problems are reported through inherited fd 3; an empty
/// read on the parent side means everything below the fork went fine.
pub fn run(opts: ShimOpts) -> ! {
    // this mode only makes sense through the parent's re-exec
    if std::env::args().next().as_deref() != Some(DEFAULT_SHIM_PATH) {
        eprintln!("should not be called directly");
        process::exit(1);
    }

    let mut errpipe = unsafe { File::from_raw_fd(SETUP_ERR_FD) };

    match setup_and_spawn(&opts) {
        Ok(payload) => {
            // closing fd 3 signals "setup OK"
            drop(errpipe);
            process::exit(supervise(payload));
        }
        Err(e) => {
            let _ = write!(errpipe, "{:#}", e);
            process::exit(1);
        }
    }
}

fn setup_and_spawn(opts: &ShimOpts) -> Result<Pid> {
    ns::remount_proc().context("failed to remount /proc")?;

    cgroup::add_pid(&opts.cgroup, unistd::getpid())
        .context("failed to add the pid to the new cgroup")?;

    drop_privileges(opts.uid, opts.gid).context("failed to drop privileges")?;

    // die (SIGHUP below) if the server goes away
    set_parent_death_signal().context("failed to set parent death signal")?;

    // handlers must be installed before the payload exists
    let payload_pid = Arc::new(AtomicI32::new(0));
    let mut signals = Signals::new([signal_hook::consts::SIGHUP, signal_hook::consts::SIGTERM])
        .context("failed to install signal handlers")?;
    {
        let payload_pid = Arc::clone(&payload_pid);
        thread::spawn(move || {
            for signal in signals.forever() {
                match signal {
                    signal_hook::consts::SIGHUP => {
                        // parent died, take the namespace down with us
                        process::exit(1);
                    }
                    signal_hook::consts::SIGTERM => {
                        let pid = payload_pid.load(Ordering::SeqCst);
                        if pid > 0 {
                            let _ = kill(Pid::from_raw(pid), Signal::SIGTERM);
                        }
                    }
                    _ => {}
                }
            }
        });
    }

    match unsafe { unistd::fork() }.context("failed to fork the payload")? {
        ForkResult::Child => {
            // close fd 3 on exec so the parent's setup read also covers
            // a failing exec
            unsafe { libc::fcntl(SETUP_ERR_FD, libc::F_SETFD, libc::FD_CLOEXEC) };
            let err = match proc::OsDriver.exec(&opts.command, &opts.args) {
                Ok(never) => match never {},
                Err(e) => e,
            };
            let mut errpipe = unsafe { File::from_raw_fd(SETUP_ERR_FD) };
            let _ = write!(errpipe, "failed to exec the process: {}", err);
            process::exit(1);
        }
        ForkResult::Parent { child } => {
            payload_pid.store(child.as_raw(), Ordering::SeqCst);
            Ok(child)
        }
    }
}

/// Wait for the payload, then keep reaping until no children remain:
/// as pid 1 of the namespace we inherit every orphaned descendant, and
/// unreaped ones would stay zombies forever.
fn supervise(payload: Pid) -> i32 {
    let status = match proc::wait_for_exit(payload) {
        Ok(reason) => reason.exit_code(),
        Err(_) => 1,
    };

    loop {
        match nix::sys::wait::waitpid(None::<Pid>, None) {
            Ok(_) => continue,
            Err(nix::errno::Errno::EINTR) => continue,
            Err(_) => break,
        }
    }

    status
}

/// setgid before setgroups before setuid: once the uid drops, the
/// first two are no longer permitted.
fn drop_privileges(uid: u32, gid: u32) -> nix::Result<()> {
    let gid = Gid::from_raw(gid);
    let uid = Uid::from_raw(uid);
    unistd::setresgid(gid, gid, gid)?;
    unistd::setgroups(&[])?;
    unistd::setresuid(uid, uid, uid)?;
    Ok(())
}

fn set_parent_death_signal() -> std::io::Result<()> {
    let rt = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGHUP, 0, 0, 0) };
    if rt == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}
