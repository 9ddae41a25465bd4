//! The sandbox constructor: turns the calling process into a chrooted,
//! id-mapped build worker inside fresh user and mount namespaces.

pub(crate) mod mount;
mod passwd;

use std::{
    env,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use rustix::{
    fs::{Gid, Mode, OFlags, Uid, open},
    io::write,
    process::{chdir, chroot},
    thread::{UnshareFlags, unshare},
};

use self::passwd::find_user;

/// In-sandbox staging locations.  The toolchain image provides these
/// directories; the constructor only mounts over them.
pub const SYSROOT_DIR: &str = "/var/sysroot";
pub const BSYS_DIR: &str = "/var/bsys";
pub const DEST_DIR: &str = "/var/dest";
pub const OBJ_DIR: &str = "/var/obj";
pub const SRC_DIR: &str = "/var/src";

const SANDBOX_PATH: &str = "/usr/bin:/usr/sbin";

/// Everything needed to assemble a sandbox.  `root` is the toolchain image
/// on the host and becomes the new `/`.  An absent staging path means "a
/// fresh tmpfs", a present one "bind-mount this host path".  The read-only
/// flags apply to bind mounts; tmpfs staging starts read-write and is
/// flipped read-only by whoever populates it.
#[derive(Debug, Default)]
pub struct SandboxDescription {
    pub root: PathBuf,
    pub sysroot: Option<PathBuf>,
    pub bsysdir: Option<PathBuf>,
    pub destdir: Option<PathBuf>,
    pub objdir: Option<PathBuf>,
    pub srcdir: Option<PathBuf>,
    pub asroot: bool,
    pub rosysroot: bool,
    pub rosrcdir: bool,
    pub tmpsz: Option<u64>,
}

/// Computes a mount target below the toolchain root.  Raw concatenation on
/// the OsString level: `dst` is always one of the absolute in-sandbox
/// locations above, and `Path::join` would discard `root` for those.
fn staged(root: &Path, dst: &str) -> PathBuf {
    let mut path = root.as_os_str().to_os_string();
    path.push(dst);
    PathBuf::from(path)
}

fn mount_staging(
    root: &Path,
    dst: &str,
    src: Option<&Path>,
    readonly: bool,
    tmpfs_data: Option<&str>,
) -> Result<()> {
    let target = staged(root, dst);

    match src {
        Some(source) => {
            log::debug!("binding {} on {dst}", source.display());
            mount::bind(&target, source, readonly)
        }
        None => {
            log::debug!("mounting tmpfs on {dst}");
            mount::tmpfs(&target, tmpfs_data)
        }
    }
}

/// Writes a string to a procfs file.
fn write_to(filename: &str, content: &str) -> Result<()> {
    let fd = open(filename, OFlags::WRONLY, Mode::empty())
        .with_context(|| format!("Unable to open {filename} for writing"))?;

    write(fd, content.as_bytes())
        .with_context(|| format!("Unable to write {content:?} to {filename}"))?;

    Ok(())
}

fn write_id_map(path: &str, new: u32, old: u32) -> Result<()> {
    write_to(path, &format!("{new} {old} 1\n"))
}

fn tmpfs_option(tmpsz: Option<u64>) -> Option<String> {
    tmpsz.map(|size| format!("size={size}"))
}

/// Clears every inherited variable and rebuilds the environment from the
/// sandbox's own `/etc/passwd`, leaving HOME and friends unset when the
/// image does not know the uid.
fn setup_environment(uid: u32) -> Result<()> {
    let inherited: Vec<_> = env::vars_os().map(|(key, _)| key).collect();

    // enter() runs strictly before anything is spawned, while the process
    // is still single-threaded, which makes these calls sound.
    for key in inherited {
        unsafe { env::remove_var(&key) };
    }
    unsafe { env::set_var("PATH", SANDBOX_PATH) };

    if let Some(user) = find_user("/etc/passwd", uid)? {
        unsafe {
            env::set_var("HOME", &user.home);
            env::set_var("SHELL", &user.shell);
            env::set_var("LOGNAME", &user.name);
            env::set_var("USER", &user.name);
        }
    }

    Ok(())
}

/// Transitions the calling process into the sandbox.  The step order is
/// strict; on failure the mount and credential state is inconsistent and
/// the process is expected to exit, no rollback is attempted.
///
/// `olduid` and `oldgid` are the credentials to map from, captured by the
/// caller before this call since the pre-unshare ids are the ones the host
/// side of the mapping refers to.
pub fn enter(description: &SandboxDescription, olduid: Uid, oldgid: Gid) -> Result<()> {
    let tmpfs_data = tmpfs_option(description.tmpsz);
    let data = tmpfs_data.as_deref();
    let root = description.root.as_path();

    // One unshare for both namespaces: the user namespace grants
    // CAP_SYS_ADMIN over the mount namespace, and the mount namespace
    // keeps everything mounted below invisible to the host.
    unshare(UnshareFlags::NEWUSER | UnshareFlags::NEWNS)
        .context("Unable to create user and mount namespaces")?;

    log::debug!("remounting {} read-only", root.display());
    mount::bind(&staged(root, "/"), root, true)?;

    // The host's kernel interfaces stay shared with the sandbox.
    for dst in ["/dev", "/proc", "/sys"] {
        mount::bind(&staged(root, dst), Path::new(dst), false)?;
    }

    mount_staging(
        root,
        SYSROOT_DIR,
        description.sysroot.as_deref(),
        description.rosysroot,
        data,
    )?;
    mount_staging(root, BSYS_DIR, description.bsysdir.as_deref(), true, data)?;
    mount_staging(root, DEST_DIR, description.destdir.as_deref(), false, data)?;
    mount_staging(root, OBJ_DIR, description.objdir.as_deref(), false, data)?;
    mount_staging(
        root,
        SRC_DIR,
        description.srcdir.as_deref(),
        description.rosrcdir,
        data,
    )?;

    chroot(root).with_context(|| format!("Unable to chroot into {}", root.display()))?;

    mount::tmpfs(Path::new("/tmp"), data)?;

    let (newuid, newgid) = if description.asroot { (0, 0) } else { (100, 100) };

    // See user_namespaces(7): without CAP_SETGID in the parent namespace,
    // setgroups must be denied once the uid map is in place and before the
    // gid map can be written.
    log::debug!("mapping uid {} -> {newuid}", olduid.as_raw());
    write_id_map("/proc/self/uid_map", newuid, olduid.as_raw())?;
    write_to("/proc/self/setgroups", "deny")?;
    write_id_map("/proc/self/gid_map", newgid, oldgid.as_raw())?;

    setup_environment(newuid)?;

    match env::var_os("HOME") {
        Some(home) => {
            chdir(home.as_os_str()).context("Unable to change into the home directory")?;
        }
        None => chdir("/").context("Unable to change into /")?,
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn staged_concatenates_absolute_destinations() {
        let root = Path::new("/srv/toolchain");

        assert_eq!(staged(root, "/"), Path::new("/srv/toolchain/"));
        assert_eq!(staged(root, "/dev"), Path::new("/srv/toolchain/dev"));
        assert_eq!(
            staged(root, SYSROOT_DIR),
            Path::new("/srv/toolchain/var/sysroot")
        );
    }

    #[test]
    fn tmpfs_option_formats_the_size() {
        assert_eq!(tmpfs_option(None), None);
        assert_eq!(
            tmpfs_option(Some(16 << 20)),
            Some("size=16777216".to_string())
        );
    }
}
