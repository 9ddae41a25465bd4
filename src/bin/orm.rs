use std::{env, ffi::OsString, path::PathBuf, process::ExitCode};

use anyhow::{Context, Result, bail};
use clap::Parser;
use rustix::process::{getgid, getuid};

use jormungandr::{
    paths, pipeline,
    sandbox::{self, SandboxDescription},
    workdir,
};

const DEFAULT_SRCDIR_COMMAND: &str = "git rev-parse --show-toplevel";

/// Run a build system, or an interactive shell, inside a hermetic
/// toolchain sandbox.
#[derive(Parser)]
#[command(name = "orm", version, about)]
struct Args {
    /// Provision workdirs under the cache directory instead of the runtime directory
    #[arg(short = 'P')]
    persistent: bool,

    /// Mount the source directory read-write
    #[arg(short = 'S')]
    rwsrcdir: bool,

    /// Mount the sysroot read-write
    #[arg(short = 'U')]
    rwsysroot: bool,

    /// Run an interactive shell instead of the bsys
    #[arg(short = 'i')]
    interactive: bool,

    /// Become uid and gid 0 inside the sandbox
    #[arg(short = 'r')]
    asroot: bool,

    /// Toolchain image name
    #[arg(short = 't', env = "ORM_DEFAULT_TOOLCHAIN", default_value = "default")]
    toolchain: String,

    /// Build system name, or path when it contains a slash
    #[arg(short = 'b', env = "ORM_DEFAULT_BSYS", default_value = "default")]
    bsys: String,

    /// Workspace label for scratch directories (defaults to the srcdir's name)
    #[arg(short = 'w', env = "ORM_WORKSPACE")]
    workspace: Option<String>,

    /// Sysroot directory, mounted at /var/sysroot
    #[arg(short = 'u', env = "ORM_SYSROOT", default_value = "/")]
    sysroot: PathBuf,

    /// Install-output directory (defaults to the workspace's 'dest' workdir)
    #[arg(short = 'd')]
    destdir: Option<PathBuf>,

    /// Intermediate build directory (defaults to the workspace's 'obj' workdir)
    #[arg(short = 'o')]
    objdir: Option<PathBuf>,

    /// Source directory (defaults to the srcdir command's output)
    #[arg(short = 's')]
    srcdir: Option<PathBuf>,

    /// Print the absolute path of this workdir and exit
    #[arg(short = 'p', value_name = "WORKDIR")]
    workdir: Option<String>,

    /// Arguments forwarded to the bsys or the shell
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<OsString>,
}

fn resolve_srcdir(args: &Args) -> Result<PathBuf> {
    match &args.srcdir {
        Some(path) => path.canonicalize().context("Unable to lookup srcdir"),
        None => {
            let command = env::var("ORM_SRCDIR_COMMAND")
                .unwrap_or_else(|_| DEFAULT_SRCDIR_COMMAND.to_string());
            pipeline::cmdpath(&command).context("Unable to lookup srcdir")
        }
    }
}

fn run(args: Args) -> Result<()> {
    // The print synopsis with an explicit workspace never needs a source
    // tree, so it works outside of one.
    let srcdir = if args.workdir.is_none() || args.workspace.is_none() {
        Some(resolve_srcdir(&args)?)
    } else {
        None
    };

    let workspace = match args.workspace.clone().or_else(|| {
        srcdir
            .as_deref()
            .and_then(|path| path.file_name())
            .and_then(|name| name.to_str())
            .map(String::from)
    }) {
        Some(workspace) if paths::valid_name(&workspace) => workspace,
        _ => bail!("Unable to find out workspace name"),
    };

    if let Some(name) = &args.workdir {
        let path = workdir::workdir(&workspace, name, args.persistent)
            .with_context(|| format!("Unable to lookup workdir '{name}'"))?;
        println!("{}", path.display());
        return Ok(());
    }

    let objdir = match args.objdir.clone() {
        Some(objdir) => objdir,
        None => workdir::workdir(&workspace, "obj", args.persistent)
            .context("Unable to lookup objdir")?,
    };
    let destdir = match args.destdir.clone() {
        Some(destdir) => destdir,
        None => workdir::workdir(&workspace, "dest", args.persistent)
            .context("Unable to lookup destdir")?,
    };

    let root = paths::toolchain_path(&args.toolchain)
        .with_context(|| format!("Unable to find toolchain '{}'", args.toolchain))?;
    let (bsysdir, bsysname) = paths::bsys_location(&args.bsys)
        .with_context(|| format!("Unable to find bsys '{}'", args.bsys))?;

    let description = SandboxDescription {
        root,
        sysroot: Some(args.sysroot.clone()),
        bsysdir: Some(bsysdir),
        destdir: Some(destdir),
        objdir: Some(objdir),
        srcdir,
        asroot: args.asroot,
        rosysroot: !args.rwsysroot,
        rosrcdir: !args.rwsrcdir,
        tmpsz: None,
    };

    sandbox::enter(&description, getuid(), getgid()).context("Unable to enter sandbox")?;

    Err(if args.interactive {
        pipeline::exec_shell(&args.args)
    } else {
        pipeline::exec_bsys(&bsysname, &args.args)
    })
}

fn main() -> ExitCode {
    env_logger::init();

    match run(Args::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("orm: {err:#}");
            ExitCode::FAILURE
        }
    }
}
