use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

use crate::job::ExecIdentity;

/// Server configuration, loaded from YAML. The file name is looked up
/// in the current directory, then $HOME, then /etc.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// listen address
    #[serde(default = "default_address")]
    pub address: String,
    /// root dir for all job directories
    #[serde(default = "default_workroot")]
    pub workroot: PathBuf,
    /// user/group to run job processes as; names or numeric ids
    #[serde(default)]
    pub ids: Ids,
    #[serde(default)]
    pub superusers: Superusers,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Ids {
    pub uid: String,
    pub gid: String,
}

impl Default for Ids {
    fn default() -> Ids {
        Ids {
            uid: "0".to_string(),
            gid: "0".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Superusers {
    #[serde(default)]
    pub full: Vec<String>,
    #[serde(default)]
    pub read: Vec<String>,
}

fn default_address() -> String {
    "127.0.0.1:7654".to_string()
}

fn default_workroot() -> PathBuf {
    PathBuf::from("/tmp/jobs")
}

impl Config {
    /// Resolve the configured uid/gid, accepting user and group names
    /// as well as numeric ids.
    pub fn resolve_identity(&self) -> Result<ExecIdentity> {
        let uid = match self.ids.uid.parse::<u32>() {
            Ok(n) => n,
            Err(_) => nix::unistd::User::from_name(&self.ids.uid)
                .context("failed to look up user")?
                .ok_or_else(|| anyhow!("invalid uid configured: {:?}", self.ids.uid))?
                .uid
                .as_raw(),
        };
        let gid = match self.ids.gid.parse::<u32>() {
            Ok(n) => n,
            Err(_) => nix::unistd::Group::from_name(&self.ids.gid)
                .context("failed to look up group")?
                .ok_or_else(|| anyhow!("invalid gid configured: {:?}", self.ids.gid))?
                .gid
                .as_raw(),
        };
        Ok(ExecIdentity { uid, gid })
    }
}

/// Find and parse the config file. An absolute path is used as-is.
pub fn find_config(name: &str) -> Result<Config> {
    for candidate in candidates(name) {
        if candidate.is_file() {
            let text = fs::read_to_string(&candidate)
                .with_context(|| format!("failed to read {}", candidate.display()))?;
            return parse(&text)
                .with_context(|| format!("failed to parse {}", candidate.display()));
        }
    }
    Err(anyhow!("config file {:?} not found", name))
}

fn candidates(name: &str) -> Vec<PathBuf> {
    let path = Path::new(name);
    if path.is_absolute() {
        return vec![path.to_path_buf()];
    }
    let mut rt = vec![PathBuf::from(name)];
    if let Some(home) = std::env::var_os("HOME") {
        rt.push(PathBuf::from(home).join(name));
    }
    rt.push(PathBuf::from("/etc").join(name));
    rt
}

fn parse(text: &str) -> Result<Config> {
    Ok(serde_yaml::from_str(text)?)
}
