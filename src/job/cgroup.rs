use std::fs::{self, OpenOptions, Permissions};
use std::io::{self, Write};
use std::os::unix::prelude::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;

use nix::unistd::Pid;

use super::{Error, ExecLimits};

/// cpu.max is written as (period * cpu, period) in microseconds.
const CPU_PERIOD_USEC: f32 = 10_000.0;

/// Two-level cgroup v2 subtree for one job. Controllers are delegated
/// on the outer dir via cgroup.subtree_control and applied on the inner
/// one, where the shim places itself; the delegation would be rejected
/// if the controlled process sat directly in the outer dir.
pub struct JobCgroup {
    outer: PathBuf,
    inner: PathBuf,
    created_outer: bool,
    created_inner: bool,
}

impl JobCgroup {
    /// Create the outer/inner pair and enable the controllers. On
    /// failure only directories created by this call are removed.
    pub fn create(outer: PathBuf) -> Result<JobCgroup, Error> {
        let created_outer = make_dir(&outer)?;
        if created_outer {
            fs::set_permissions(&outer, Permissions::from_mode(0o700))
                .map_err(|e| setup("create cgroup", e))?;
        }

        let inner = outer.join("inner");
        let created_inner = match make_dir(&inner) {
            Ok(created) => created,
            Err(e) => {
                if created_outer {
                    let _ = fs::remove_dir(&outer);
                }
                return Err(e);
            }
        };

        let cg = JobCgroup {
            outer,
            inner,
            created_outer,
            created_inner,
        };

        if let Err(e) = append(&cg.outer.join("cgroup.subtree_control"), "+io +cpu +memory\n") {
            cg.unwind();
            return Err(setup("enable cgroup controllers", e));
        }

        Ok(cg)
    }

    pub fn inner(&self) -> &Path {
        &self.inner
    }

    /// Write the configured ceilings into the inner dir. `devices` is
    /// the block-device set for io.max; it is only consulted when an IO
    /// limit is set.
    pub fn apply_limits(&self, limits: &ExecLimits, devices: &[String]) -> Result<(), Error> {
        if limits.max_io_bytes_per_sec > 0 {
            let rate = fmt_limit(limits.max_io_bytes_per_sec);
            for dev in devices {
                let line = format!("{} rbps={} wbps={}\n", dev, rate, rate);
                append(&self.inner.join("io.max"), &line)
                    .map_err(|e| setup("configure IO limits", e))?;
            }
        }

        if limits.max_ram_bytes > 0 {
            let line = format!("{}\n", fmt_limit(limits.max_ram_bytes));
            append(&self.inner.join("memory.max"), &line)
                .map_err(|e| setup("configure RAM limits", e))?;
        }

        if limits.cpu > 0.0 {
            let line = format!("{:.4} {:.4}\n", CPU_PERIOD_USEC * limits.cpu, CPU_PERIOD_USEC);
            append(&self.inner.join("cpu.max"), &line)
                .map_err(|e| setup("configure CPU limits", e))?;
        }

        Ok(())
    }

    /// Remove the subtree. Only valid once no process is left in it,
    /// which is why the waiter calls this after observing exit.
    pub fn remove(&self) -> io::Result<()> {
        remove_dir_if_exists(&self.inner)?;
        remove_dir_if_exists(&self.outer)
    }

    /// Undo directories created by `create`; pre-existing ones are kept.
    pub(crate) fn unwind(&self) {
        if self.created_inner {
            let _ = fs::remove_dir(&self.inner);
        }
        if self.created_outer {
            let _ = fs::remove_dir(&self.outer);
        }
    }
}

/// Move a process into a cgroup dir. Used by the shim for itself.
pub fn add_pid(cgroup_dir: &Path, pid: Pid) -> io::Result<()> {
    append(&cgroup_dir.join("cgroup.procs"), &pid.as_raw().to_string())
}

/// Scan /proc/mounts for the cgroup2 filesystem mount point.
pub fn find_cgroup2_mount() -> Option<PathBuf> {
    let mounts = fs::read_to_string("/proc/mounts").ok()?;
    parse_cgroup2_mount(&mounts)
}

fn parse_cgroup2_mount(mounts: &str) -> Option<PathBuf> {
    for line in mounts.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 3 {
            continue;
        }
        if fields[2] == "cgroup2" {
            return Some(PathBuf::from(fields[1]));
        }
    }
    None
}

/// Block devices for io.max, as MAJ:MIN strings. Prefers `lsblk -d`;
/// falls back to scanning /sys/block on hosts without the tool.
pub fn list_block_devices() -> io::Result<Vec<String>> {
    match Command::new("lsblk").arg("-d").output() {
        Ok(out) if out.status.success() => {
            Ok(parse_lsblk(&String::from_utf8_lossy(&out.stdout)))
        }
        _ => sysfs_block_devices(),
    }
}

fn parse_lsblk(out: &str) -> Vec<String> {
    let mut rt = Vec::new();
    for line in out.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        // NAME MAJ:MIN RM SIZE RO TYPE ...
        if fields.len() >= 6 && fields[5] == "disk" {
            rt.push(fields[1].to_string());
        }
    }
    rt
}

fn sysfs_block_devices() -> io::Result<Vec<String>> {
    let mut rt = Vec::new();
    for entry in fs::read_dir("/sys/block")? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        // lsblk reports these as type loop/rom, not disk
        if name.starts_with("loop") || name.starts_with("ram") || name.starts_with("sr") {
            continue;
        }
        let dev = fs::read_to_string(entry.path().join("dev"))?;
        rt.push(dev.trim().to_string());
    }
    Ok(rt)
}

/// Values usable in cgroup interface files: positive numbers as-is,
/// anything else is the literal "max" (unlimited).
fn fmt_limit(v: i64) -> String {
    if v <= 0 {
        "max".to_string()
    } else {
        v.to_string()
    }
}

/// cgroup files are written by appending. O_CREAT is tolerated so test
/// environments can stub cgroupfs with a tmpfs directory.
fn append(path: &Path, text: &str) -> io::Result<()> {
    let mut f = OpenOptions::new()
        .append(true)
        .create(true)
        .open(path)?;
    f.write_all(text.as_bytes())
}

fn make_dir(path: &Path) -> Result<bool, Error> {
    match fs::create_dir(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(setup("create cgroup", e)),
    }
}

fn remove_dir_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_dir(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

fn setup(action: &'static str, source: io::Error) -> Error {
    Error::Setup { action, source }
}
