use std::{
    env,
    ffi::{OsStr, OsString},
    fs::{self, File},
    path::{Path, PathBuf},
    process::ExitCode,
};

use anyhow::{Context, Result, anyhow, bail};
use clap::Parser;
use nix::unistd::{ForkResult, fork};
use rustix::fd::OwnedFd;
use rustix::process::{getgid, getuid};
use rustix::stdio::dup2_stdin;

use jormungandr::{
    archive, paths, pipeline,
    sandbox::{self, SandboxDescription},
};

const DEFAULT_SRCDIR_COMMAND: &str = "git rev-parse --show-toplevel";

/// Run the bsys over staged inputs, then package the install output (or
/// the intermediate build tree) as a compressed archive.
#[derive(Parser)]
#[command(name = "lndworm", version, about)]
struct Args {
    /// Package /var/obj instead of /var/dest
    #[arg(short = 'A')]
    pkgobj: bool,

    /// Mount or extract the source tree read-write
    #[arg(short = 'S')]
    rwsrcdir: bool,

    /// Mount or extract the sysroot read-write
    #[arg(short = 'U')]
    rwsysroot: bool,

    /// Become uid and gid 0 inside the sandbox
    #[arg(short = 'r')]
    asroot: bool,

    /// Sysroot archive format (inferred from the file name by default)
    #[arg(short = 'g', value_name = "FORMAT")]
    sysroot_format: Option<String>,

    /// Source archive format (inferred from the file name by default)
    #[arg(short = 'q', value_name = "FORMAT")]
    src_format: Option<String>,

    /// Output archive format (inferred from the file name by default)
    #[arg(short = 'f', value_name = "FORMAT")]
    output_format: Option<String>,

    /// Toolchain image name
    #[arg(short = 't', env = "ORM_DEFAULT_TOOLCHAIN", default_value = "default")]
    toolchain: String,

    /// Build system name, or path when it contains a slash
    #[arg(short = 'b', env = "ORM_DEFAULT_BSYS", default_value = "default")]
    bsys: String,

    /// Sysroot: a directory to mount, or an archive to extract
    #[arg(short = 'u', env = "ORM_SYSROOT", default_value = "/")]
    sysroot: PathBuf,

    /// Source tree: a directory to mount, or an archive to extract
    #[arg(short = 's')]
    src: Option<PathBuf>,

    /// Output archive path, deleted again if anything fails
    output: PathBuf,

    /// Arguments forwarded to the bsys
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<OsString>,
}

/// The fully resolved input/output commands.  An absent extract command
/// means the corresponding input is a directory to bind rather than an
/// archive to filter through `tar`.
struct Plan {
    sysroot: PathBuf,
    sysroot_extract: Option<String>,
    src: PathBuf,
    src_extract: Option<String>,
    create: String,
}

/// Picks the extraction command for an input: directories need none, and
/// archives take the explicit format, the environment override, or the
/// format inferred from their file name, in that order of preference.
fn extract_command(
    path: &Path,
    explicit: Option<&str>,
    from_env: Option<String>,
    what: &str,
) -> Result<Option<String>> {
    let metadata = fs::metadata(path)
        .with_context(|| format!("Unable to stat '{}'", path.display()))?;

    if metadata.is_dir() {
        if explicit.is_some() {
            bail!("Extraneous {what} format for directory '{}'", path.display());
        }
        return Ok(None);
    }

    if explicit.is_none() {
        if let Some(command) = from_env {
            return Ok(Some(command));
        }
    }

    let name = path.to_string_lossy();
    let extension = match explicit {
        Some(extension) => extension,
        None => archive::extension(&name)
            .ok_or_else(|| anyhow!("Unable to infer {what} format from '{name}'"))?,
    };

    let format = archive::format_for(extension)
        .ok_or_else(|| anyhow!("Invalid {what} format '{extension}'"))?;

    Ok(Some(format.extract_command.to_string()))
}

fn create_command(
    output: &Path,
    explicit: Option<&str>,
    from_env: Option<String>,
) -> Result<String> {
    if explicit.is_none() {
        if let Some(command) = from_env {
            return Ok(command);
        }
    }

    let name = output.to_string_lossy();
    let extension = match explicit {
        Some(extension) => extension,
        None => archive::extension(&name)
            .ok_or_else(|| anyhow!("Unable to infer output format from '{name}'"))?,
    };

    let format = archive::format_for(extension)
        .ok_or_else(|| anyhow!("Invalid output format '{extension}'"))?;

    Ok(format.create_command.to_string())
}

fn resolve_plan(args: &Args) -> Result<Plan> {
    let src = match &args.src {
        Some(path) => path.canonicalize().context("Unable to lookup src path")?,
        None => {
            let command = env::var("ORM_SRCDIR_COMMAND")
                .unwrap_or_else(|_| DEFAULT_SRCDIR_COMMAND.to_string());
            pipeline::cmdpath(&command).context("Unable to lookup src path")?
        }
    };

    Ok(Plan {
        sysroot_extract: extract_command(
            &args.sysroot,
            args.sysroot_format.as_deref(),
            env::var("ORM_SYSROOT_EXTRACT_COMMAND").ok(),
            "sysroot",
        )?,
        sysroot: args.sysroot.clone(),
        src_extract: extract_command(
            &src,
            args.src_format.as_deref(),
            env::var("ORM_SRCDIR_EXTRACT_COMMAND").ok(),
            "src",
        )?,
        src,
        create: create_command(
            &args.output,
            args.output_format.as_deref(),
            env::var("ORM_OUTPUT_CREATE_COMMAND").ok(),
        )?,
    })
}

fn stage_and_build(
    args: &Args,
    plan: &Plan,
    description: &SandboxDescription,
    sysroot_archive: Option<OwnedFd>,
    src_archive: Option<OwnedFd>,
    bsysname: &OsStr,
) -> Result<()> {
    sandbox::enter(description, getuid(), getgid()).context("Unable to enter sandbox")?;

    if let (Some(command), Some(fd)) = (&plan.sysroot_extract, sysroot_archive) {
        pipeline::extract_filter(command, sandbox::SYSROOT_DIR, !args.rwsysroot, fd)
            .context("Unable to extract sysroot")?;
    }

    if let (Some(command), Some(fd)) = (&plan.src_extract, src_archive) {
        pipeline::extract_filter(command, sandbox::SRC_DIR, !args.rwsrcdir, fd)
            .context("Unable to extract source tree")?;
    }

    pipeline::run_bsys(bsysname, &args.args)
}

/// The sandboxed half of the packaging topology; ends in the exec of the
/// archive creator, so it only ever returns an error.
fn sandboxed(
    args: &Args,
    plan: &Plan,
    description: &SandboxDescription,
    sysroot_archive: Option<OwnedFd>,
    src_archive: Option<OwnedFd>,
    output: File,
    bsysname: &OsStr,
) -> anyhow::Error {
    if let Err(err) = stage_and_build(
        args,
        plan,
        description,
        sysroot_archive,
        src_archive,
        bsysname,
    ) {
        return err;
    }

    let dir = if args.pkgobj {
        sandbox::OBJ_DIR
    } else {
        sandbox::DEST_DIR
    };

    pipeline::exec_create_filter(&plan.create, dir, output)
}

fn package(args: &Args, plan: &Plan, output: File) -> Result<()> {
    // Archive inputs are opened before sandbox entry; afterwards the host
    // paths they came from no longer resolve.
    let sysroot_archive = match plan.sysroot_extract {
        Some(_) => Some(OwnedFd::from(File::open(&plan.sysroot).with_context(
            || format!("Unable to open '{}'", plan.sysroot.display()),
        )?)),
        None => None,
    };
    let src_archive = match plan.src_extract {
        Some(_) => Some(OwnedFd::from(File::open(&plan.src).with_context(
            || format!("Unable to open '{}'", plan.src.display()),
        )?)),
        None => None,
    };

    let root = paths::toolchain_path(&args.toolchain)
        .with_context(|| format!("Unable to find toolchain '{}'", args.toolchain))?;
    let (bsysdir, bsysname) = paths::bsys_location(&args.bsys)
        .with_context(|| format!("Unable to find bsys '{}'", args.bsys))?;

    let mut description = SandboxDescription {
        root,
        bsysdir: Some(bsysdir),
        asroot: args.asroot,
        ..Default::default()
    };
    if plan.sysroot_extract.is_none() {
        description.sysroot = Some(plan.sysroot.clone());
        description.rosysroot = !args.rwsysroot;
    }
    if plan.src_extract.is_none() {
        description.srcdir = Some(plan.src.clone());
        description.rosrcdir = !args.rwsrcdir;
    }

    // The top-level process must stay out of the sandbox to keep the
    // right to delete a partial output file.
    match unsafe { fork() }.context("Unable to fork")? {
        ForkResult::Child => {
            let err = sandboxed(
                args,
                plan,
                &description,
                sysroot_archive,
                src_archive,
                output,
                &bsysname,
            );
            eprintln!("lndworm: {err:#}");
            std::process::exit(1);
        }
        ForkResult::Parent { child } => pipeline::wait_pid(child),
    }
}

fn run(args: &Args) -> Result<()> {
    let plan = resolve_plan(args)?;

    // Nothing downstream may block on the terminal.
    let null = File::open("/dev/null").context("Unable to open /dev/null")?;
    dup2_stdin(&null).context("Unable to redirect stdin")?;

    let output = File::create(&args.output)
        .with_context(|| format!("Unable to open '{}'", args.output.display()))?;

    package(args, &plan, output).inspect_err(|_| {
        let _ = fs::remove_file(&args.output);
    })
}

fn main() -> ExitCode {
    env_logger::init();

    match run(&Args::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("lndworm: {err:#}");
            ExitCode::FAILURE
        }
    }
}
