use std::ffi::CString;
use std::fs::File;
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::ffi::OsStrExt;

use libc::c_char;
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::unistd::Pid;

use super::proc::{SpawnSpec, SETUP_ERR_FD};

/// Launch the shim in fresh PID and network namespaces via clone3; the
/// child half unshares a mount namespace before exec. Failures between
/// clone and exec are reported through the setup-error pipe.
pub(crate) fn spawn(spec: SpawnSpec) -> io::Result<Pid> {
    let mut argv_c = Vec::with_capacity(spec.argv.len());
    for a in &spec.argv {
        argv_c.push(CString::new(a.as_str())?);
    }
    let mut argv_ptrs: Vec<*const c_char> = argv_c.iter().map(|c| c.as_ptr()).collect();
    argv_ptrs.push(std::ptr::null());
    let workdir_c = CString::new(spec.work_dir.as_os_str().as_bytes())?;

    let devnull = File::open("/dev/null")?;
    let null_fd = devnull.as_raw_fd();
    let log_fd = spec.log_file.as_raw_fd();
    let err_fd = spec.err_pipe.as_raw_fd();

    let mut args: libc::clone_args = unsafe { mem::zeroed() };
    args.flags = (libc::CLONE_NEWPID | libc::CLONE_NEWNET) as u64;
    args.exit_signal = libc::SIGCHLD as u64;

    let ret = unsafe {
        libc::syscall(
            libc::SYS_clone3,
            &mut args as *mut libc::clone_args,
            mem::size_of::<libc::clone_args>(),
        )
    };
    match ret {
        0 => unsafe {
            // child: pid 1 of the new pid namespace until exec
            child_exec(
                null_fd,
                log_fd,
                err_fd,
                &workdir_c,
                argv_c[0].as_ptr(),
                argv_ptrs.as_ptr(),
            )
        },
        pid if pid > 0 => Ok(Pid::from_raw(pid as i32)),
        _ => Err(io::Error::last_os_error()),
    }
    // parent copies of the log file, pipe write end and /dev/null close here
}

/// Runs between clone3 and exec: only async-signal-safe calls, no
/// allocation. Any failure is written to the setup-error pipe followed
/// by _exit.
unsafe fn child_exec(
    null_fd: RawFd,
    log_fd: RawFd,
    err_fd: RawFd,
    workdir: &CString,
    prog: *const c_char,
    argv: *const *const c_char,
) -> ! {
    // wire the error pipe to fd 3 first so later failures can report
    if err_fd == SETUP_ERR_FD {
        // dup2 onto itself would keep O_CLOEXEC from pipe2
        if libc::fcntl(err_fd, libc::F_SETFD, 0) < 0 {
            libc::_exit(127);
        }
    } else if libc::dup2(err_fd, SETUP_ERR_FD) < 0 {
        libc::_exit(127);
    }

    if libc::dup2(null_fd, 0) < 0 {
        die(b"failed to set up stdin");
    }
    if libc::dup2(log_fd, 1) < 0 {
        die(b"failed to set up stdout");
    }
    if libc::dup2(log_fd, 2) < 0 {
        die(b"failed to set up stderr");
    }
    if libc::unshare(libc::CLONE_NEWNS) < 0 {
        die(b"failed to unshare mount namespace");
    }
    if libc::chdir(workdir.as_ptr()) < 0 {
        die(b"failed to enter working directory");
    }
    libc::execv(prog, argv);
    die(b"failed to exec the shim");
}

unsafe fn die(msg: &[u8]) -> ! {
    let errno = *libc::__errno_location();
    write_all(SETUP_ERR_FD, msg);
    write_all(SETUP_ERR_FD, b": errno ");
    let mut buf = [0u8; 12];
    write_all(SETUP_ERR_FD, format_decimal(errno, &mut buf));
    libc::_exit(127);
}

unsafe fn write_all(fd: RawFd, mut bytes: &[u8]) {
    while !bytes.is_empty() {
        let n = libc::write(fd, bytes.as_ptr() as *const libc::c_void, bytes.len());
        if n <= 0 {
            return;
        }
        bytes = &bytes[n as usize..];
    }
}

fn format_decimal(mut v: i32, buf: &mut [u8; 12]) -> &[u8] {
    if v < 0 {
        v = -v;
    }
    let mut i = buf.len();
    loop {
        i -= 1;
        buf[i] = b'0' + (v % 10) as u8;
        v /= 10;
        if v == 0 {
            break;
        }
    }
    &buf[i..]
}

/// Remount /proc so ps/top reflect the new PID namespace. Mount changes
/// are kept local to the namespace first.
pub(crate) fn remount_proc() -> nix::Result<()> {
    mount(
        Some("none"),
        "/",
        None::<&str>,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None::<&str>,
    )?;
    umount2("/proc", MntFlags::MNT_DETACH)?;
    mount(
        Some("proc"),
        "/proc",
        Some("proc"),
        MsFlags::empty(),
        None::<&str>,
    )?;
    Ok(())
}
