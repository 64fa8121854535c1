use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::info;

use crate::acl::{AccessControl, AccessType};
use crate::supervisor::Supervisor;

mod acl;
mod config;
mod job;
mod server;
mod shim;
mod supervisor;

/// Remote job execution service. The same binary doubles as the shim:
/// jobs re-execute /proc/self/exe with --mode=shim to finish setting
/// up their namespaces before the payload runs.
#[derive(Parser, Debug)]
#[command(name = "jobd")]
struct Args {
    /// config file name, searched in ., $HOME and /etc
    #[arg(long, default_value = "jobd.yaml")]
    config: String,

    /// listen address, overrides the config file
    #[arg(long)]
    address: Option<String>,

    /// reserved: "shim" switches to the in-namespace setup mode
    #[arg(long)]
    mode: Option<String>,

    /// shim mode: payload binary
    #[arg(long)]
    cmd: Option<String>,

    /// shim mode: inner cgroup dir to enter
    #[arg(long)]
    cgroup: Option<PathBuf>,

    /// shim mode: uid to drop to
    #[arg(long)]
    uid: Option<u32>,

    /// shim mode: gid to drop to
    #[arg(long)]
    gid: Option<u32>,

    /// payload arguments, after --
    #[arg(last = true)]
    args: Vec<String>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    if args.mode.as_deref() == Some("shim") {
        let opts = shim::ShimOpts {
            command: args.cmd.context("--cmd is required in shim mode")?,
            args: args.args,
            cgroup: args.cgroup.context("--cgroup is required in shim mode")?,
            uid: args.uid.context("--uid is required in shim mode")?,
            gid: args.gid.context("--gid is required in shim mode")?,
        };
        // no tracing here: stdout/stderr are the job's log file
        shim::run(opts);
    }

    tracing_subscriber::fmt::init();
    serve(args)
}

#[tokio::main]
async fn serve(args: Args) -> Result<()> {
    if !nix::unistd::Uid::effective().is_root() {
        bail!("jobd must be run as root");
    }

    let cfg = config::find_config(&args.config)?;
    let identity = cfg.resolve_identity()?;

    let auth = Arc::new(AccessControl::new());
    auth.add_superusers(&cfg.superusers.full, AccessType::Full);
    auth.add_superusers(&cfg.superusers.read, AccessType::Read);

    let jobs = Arc::new(Supervisor::new(identity, cfg.workroot.clone()));
    let app = server::router(Arc::clone(&jobs), auth);

    let address = args.address.unwrap_or(cfg.address);
    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .with_context(|| format!("failed to listen on {}", address))?;
    info!("listening on {}", address);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("stopping the server ...");
    tokio::task::spawn_blocking(move || jobs.stop_all()).await?;
    info!("server stopped");

    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
