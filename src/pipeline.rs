//! The fork/exec plumbing around the sandbox: archive producers and
//! filters, wait-status diagnostics, and the final bsys or shell exec.

use std::{
    env,
    ffi::{OsStr, OsString},
    fs::File,
    os::unix::process::{CommandExt, ExitStatusExt},
    path::{Path, PathBuf},
    process::{Child, Command, ExitStatus, Stdio},
};

use anyhow::{Context, Result, anyhow, bail};
use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::Pid;
use rustix::{
    fd::OwnedFd,
    fs::{Access, access},
};

use crate::sandbox::{self, mount::remount_readonly};

const DEFAULT_GIT_EXEC_PATH: &str = "/usr/lib/git-core";

/// Turns a child's exit status into a diagnostic: exit code, fatal signal
/// and core dump are reported distinctly, anything non-zero is an error.
pub fn check_status(name: &str, status: ExitStatus) -> Result<()> {
    if status.success() {
        return Ok(());
    }

    if let Some(code) = status.code() {
        bail!("{name} exited with status {code}");
    }

    match status.signal() {
        Some(signal) if status.core_dumped() => {
            bail!("{name} killed by signal {signal} (core dumped)")
        }
        Some(signal) => bail!("{name} killed by signal {signal}"),
        None => bail!("{name} terminated abnormally"),
    }
}

/// Waits for a spawned child and applies the `check_status` diagnostics.
pub fn wait_child(name: &str, child: &mut Child) -> Result<()> {
    let status = child
        .wait()
        .with_context(|| format!("Unable to wait for {name}"))?;

    check_status(name, status)
}

/// Waits for a forked child, with the same decoding as `check_status`.
pub fn wait_pid(pid: Pid) -> Result<()> {
    match waitpid(pid, None).context("Unable to wait for child")? {
        WaitStatus::Exited(_, 0) => Ok(()),
        WaitStatus::Exited(pid, code) => bail!("Process {pid} exited with status {code}"),
        WaitStatus::Signaled(pid, signal, true) => {
            bail!("Process {pid} killed by signal {signal} (core dumped)")
        }
        WaitStatus::Signaled(pid, signal, false) => {
            bail!("Process {pid} killed by signal {signal}")
        }
        status => bail!("Process reported unexpected status {status:?}"),
    }
}

/// Spawns `git-archive --format=tar -- <treeish>`, optionally from another
/// working tree, and hands back the read side of its stdout.  The producer
/// always emits plain tar; compression is a packaging concern.
pub fn spawn_git_archive(worktree: Option<&Path>, treeish: &str) -> Result<(Child, OwnedFd)> {
    let exec_path =
        env::var("GIT_EXEC_PATH").unwrap_or_else(|_| DEFAULT_GIT_EXEC_PATH.to_string());

    let mut command = Command::new(Path::new(&exec_path).join("git-archive"));
    command.args(["--format=tar", "--", treeish]);
    command.stdout(Stdio::piped());
    if let Some(worktree) = worktree {
        command.current_dir(worktree);
    }

    log::debug!("spawning git-archive for {treeish}");
    let mut child = command.spawn().context("Unable to spawn git-archive")?;

    // We configured a pipe right above, so stdout is always there.
    let stdout = child.stdout.take().unwrap();
    Ok((child, OwnedFd::from(stdout)))
}

/// Runs one extraction command from the package-format table: the archive
/// fd becomes its stdin and the staging directory its working directory.
/// With `readonly`, the directory's mount is flipped read-only afterwards.
pub fn extract_filter(command: &str, dir: &str, readonly: bool, fd: OwnedFd) -> Result<()> {
    log::debug!("extracting into {dir} with '{command}'");
    let mut child = Command::new("sh")
        .args(["-c", command])
        .stdin(Stdio::from(File::from(fd)))
        .current_dir(dir)
        .spawn()
        .with_context(|| format!("Unable to spawn '{command}'"))?;

    wait_child(command, &mut child)?;

    if readonly {
        remount_readonly(Path::new(dir))?;
    }

    Ok(())
}

/// Replaces the process with one creation command from the package-format
/// table: working directory `dir`, archive written to `output` as stdout.
/// Only returns on failure.
pub fn exec_create_filter(command: &str, dir: &str, output: File) -> anyhow::Error {
    log::debug!("packaging {dir} with '{command}'");
    let err = Command::new("sh")
        .args(["-c", command])
        .current_dir(dir)
        .stdout(Stdio::from(output))
        .exec();

    anyhow!(err).context(format!("Unable to exec 'sh -c {command}'"))
}

fn bsys_program(name: &OsStr) -> PathBuf {
    let mut path = PathBuf::from(sandbox::BSYS_DIR);
    path.push(name);
    path
}

/// Replaces the process with `/var/bsys/<name>`.  Only returns on failure.
pub fn exec_bsys(name: &OsStr, args: &[OsString]) -> anyhow::Error {
    let program = bsys_program(name);
    let err = Command::new(&program).args(args).exec();

    anyhow!(err).context(format!("Unable to exec {}", program.display()))
}

/// Spawns `/var/bsys/<name>` and waits it out, for the topologies where
/// the sandboxed process still has packaging work to do afterwards.
pub fn run_bsys(name: &OsStr, args: &[OsString]) -> Result<()> {
    let program = bsys_program(name);
    let status = Command::new(&program)
        .args(args)
        .status()
        .with_context(|| format!("Unable to spawn {}", program.display()))?;

    check_status(&program.display().to_string(), status)
}

/// Replaces the process with an interactive shell: `$SHELL` when set and
/// executable, `/bin/sh` otherwise.  Only returns on failure.
pub fn exec_shell(args: &[OsString]) -> anyhow::Error {
    let shell = match env::var_os("SHELL") {
        Some(shell) if access(shell.as_os_str(), Access::EXEC_OK).is_ok() => {
            PathBuf::from(shell)
        }
        _ => PathBuf::from("/bin/sh"),
    };

    let err = Command::new(&shell).arg("-i").args(args).exec();

    anyhow!(err).context(format!("Unable to exec {}", shell.display()))
}

/// Runs a command through the shell and canonicalizes the first line of
/// its output, which is the contract of srcdir discovery commands such as
/// `git rev-parse --show-toplevel`.
pub fn cmdpath(command: &str) -> Result<PathBuf> {
    let output = Command::new("sh")
        .args(["-c", command])
        .stderr(Stdio::inherit())
        .output()
        .with_context(|| format!("Unable to run '{command}'"))?;

    check_status(command, output.status)?;

    let stdout = String::from_utf8(output.stdout)
        .with_context(|| format!("Output of '{command}' is not valid UTF-8"))?;
    let line = stdout.lines().next().unwrap_or("").trim_end();
    if line.is_empty() {
        bail!("'{command}' printed no path");
    }

    Path::new(line)
        .canonicalize()
        .with_context(|| format!("Unable to resolve {line:?}"))
}

#[cfg(test)]
mod tests {
    use std::process::Command;

    use super::*;

    fn shell_status(script: &str) -> ExitStatus {
        Command::new("sh").args(["-c", script]).status().unwrap()
    }

    #[test]
    fn zero_status_passes() {
        assert!(check_status("true", shell_status("exit 0")).is_ok());
    }

    #[test]
    fn exit_codes_are_reported() {
        let err = check_status("job", shell_status("exit 3")).unwrap_err();
        assert_eq!(err.to_string(), "job exited with status 3");
    }

    #[test]
    fn fatal_signals_are_reported() {
        let err = check_status("job", shell_status("kill -KILL $$")).unwrap_err();
        assert_eq!(err.to_string(), "job killed by signal 9");
    }

    #[test]
    fn cmdpath_trims_and_resolves() {
        let dir = tempfile::tempdir().unwrap();
        let command = format!("echo '{}   '", dir.path().display());

        assert_eq!(
            cmdpath(&command).unwrap(),
            dir.path().canonicalize().unwrap()
        );
    }

    #[test]
    fn cmdpath_rejects_empty_output() {
        assert!(cmdpath("true").is_err());
    }

    #[test]
    fn cmdpath_propagates_command_failure() {
        let err = cmdpath("exit 7").unwrap_err();
        assert!(err.to_string().contains("status 7"), "{err}");
    }
}
