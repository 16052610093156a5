use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use fuser::MountOption;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use tracing_subscriber::EnvFilter;

use crfs::{Config, Crfs, CrfsFs};

#[derive(Debug, Parser)]
#[command(name = "crfs", version, about = "Mount stargz container layers read-only")]
struct Options {
    /// Where to mount.
    #[arg(default_value = "/crfs")]
    mount_point: PathBuf,

    /// Directory whose *.stargz files appear under layers/.
    #[arg(long, default_value = ".")]
    layers_dir: PathBuf,

    /// A layer file in the layers directory to also mount as rootfs/.
    #[arg(long)]
    rootfs: Option<String>,

    /// Let other users see the mount.
    #[arg(long)]
    allow_other: bool,

    /// Trace every filesystem operation.
    #[arg(long)]
    fuse_debug: bool,
}

fn run(opts: Options) -> anyhow::Result<()> {
    let crfs = Crfs::new(Config {
        layers_dir: opts.layers_dir.clone(),
        rootfs: opts.rootfs.clone(),
    })
    .context("could not build filesystem")?;

    let mut options = vec![
        MountOption::RO,
        MountOption::FSName("crfs".into()),
        MountOption::Subtype("crfs".into()),
    ];
    if opts.allow_other {
        options.push(MountOption::AllowOther);
    }

    let mut session = fuser::Session::new(CrfsFs::new(&crfs), &opts.mount_point, &options)
        .with_context(|| format!("could not mount {}", opts.mount_point.display()))?;
    tracing::info!(
        mount_point = %opts.mount_point.display(),
        layers_dir = %opts.layers_dir.display(),
        "crfs: mounted"
    );

    let mut unmounter = session.unmount_callable();
    let mut signals = Signals::new([SIGINT, SIGTERM]).context("could not install signal handler")?;
    std::thread::spawn(move || {
        if let Some(signal) = signals.forever().next() {
            tracing::info!(signal, "crfs: unmounting");
            if let Err(err) = unmounter.unmount() {
                tracing::error!(%err, "crfs: unmount failed");
            }
        }
    });

    session.run().context("filesystem session failed")?;
    tracing::info!("crfs: unmounted");
    Ok(())
}

fn main() -> ExitCode {
    let opts = Options::parse();

    let default = if opts.fuse_debug { "trace" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .init();

    match run(opts) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}
