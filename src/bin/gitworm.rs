use std::{
    ffi::OsString,
    fs::{self, File},
    path::{Path, PathBuf},
    process::ExitCode,
};

use anyhow::{Context, Result};
use clap::Parser;
use rustix::fd::OwnedFd;
use rustix::process::{getgid, getuid};

use jormungandr::{
    archive, paths, pipeline,
    sandbox::{self, SandboxDescription},
};

/// Stream a fresh `git archive` of a tree into the sandbox as its source
/// tree, then run the bsys over it.
#[derive(Parser)]
#[command(name = "gitworm", version, about)]
struct Args {
    /// Extract the source tree read-write
    #[arg(short = 'S')]
    rwsrcdir: bool,

    /// Mount or extract the sysroot read-write
    #[arg(short = 'U')]
    rwsysroot: bool,

    /// Become uid and gid 0 inside the sandbox
    #[arg(short = 'r')]
    asroot: bool,

    /// Run git-archive from this working tree
    #[arg(short = 'C', value_name = "PATH")]
    worktree: Option<PathBuf>,

    /// Toolchain image name
    #[arg(short = 't', env = "ORM_DEFAULT_TOOLCHAIN", default_value = "default")]
    toolchain: String,

    /// Build system name, or path when it contains a slash
    #[arg(short = 'b', env = "ORM_DEFAULT_BSYS", default_value = "default")]
    bsys: String,

    /// Sysroot: a directory to mount, or an archive to extract
    #[arg(short = 'u', env = "ORM_SYSROOT", default_value = "/")]
    sysroot: PathBuf,

    /// Tree or commit to archive
    treeish: String,

    /// Arguments forwarded to the bsys
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<OsString>,
}

fn run(args: Args) -> Result<()> {
    let (mut producer, srcfd) =
        pipeline::spawn_git_archive(args.worktree.as_deref(), &args.treeish)?;

    let mut description = SandboxDescription {
        asroot: args.asroot,
        ..Default::default()
    };

    // The sysroot argument is either a directory to bind or an archive to
    // open now, while the host filesystem is still in sight, and extract
    // once inside.
    let sysroot_archive = if fs::metadata(&args.sysroot)
        .with_context(|| format!("Unable to stat '{}'", args.sysroot.display()))?
        .is_dir()
    {
        description.sysroot = Some(args.sysroot.clone());
        description.rosysroot = !args.rwsysroot;
        None
    } else {
        let file = File::open(&args.sysroot)
            .with_context(|| format!("Unable to open '{}'", args.sysroot.display()))?;
        Some(OwnedFd::from(file))
    };

    description.root = paths::toolchain_path(&args.toolchain)
        .with_context(|| format!("Unable to find toolchain '{}'", args.toolchain))?;
    let (bsysdir, bsysname) = paths::bsys_location(&args.bsys)
        .with_context(|| format!("Unable to find bsys '{}'", args.bsys))?;
    description.bsysdir = Some(bsysdir);

    sandbox::enter(&description, getuid(), getgid()).context("Unable to enter sandbox")?;

    if let Some(fd) = sysroot_archive {
        archive::extract(Path::new(sandbox::SYSROOT_DIR), !args.rwsysroot, fd)
            .context("Unable to extract sysroot")?;
    }

    archive::extract(Path::new(sandbox::SRC_DIR), !args.rwsrcdir, srcfd)
        .context("Unable to extract source tree")?;

    // A dead producer must be reported before the bsys replaces us, and
    // must not linger as a zombie into it either.
    pipeline::wait_child("git-archive", &mut producer)?;

    Err(pipeline::exec_bsys(&bsysname, &args.args))
}

fn main() -> ExitCode {
    env_logger::init();

    match run(Args::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("gitworm: {err:#}");
            ExitCode::FAILURE
        }
    }
}
