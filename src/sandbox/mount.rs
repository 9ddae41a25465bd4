use std::ffi::CString;
use std::path::Path;

use anyhow::{Context, Result};
use rustix::mount::{
    MountFlags, MountPropagationFlags, mount, mount_bind_recursive, mount_change,
    mount_remount,
};

/// Recursively binds `source` onto `target`, optionally flipping the new
/// mount read-only.  The kernel refuses MS_RDONLY together with MS_BIND in
/// a single call, so the read-only variant is the bind, a propagation
/// change to private, then a remount carrying MS_RDONLY|MS_BIND.
pub(crate) fn bind(target: &Path, source: &Path, readonly: bool) -> Result<()> {
    mount_bind_recursive(source, target).with_context(|| {
        format!(
            "Unable to bind {} onto {}",
            source.display(),
            target.display()
        )
    })?;

    if readonly {
        mount_change(target, MountPropagationFlags::PRIVATE)
            .with_context(|| format!("Unable to make {} private", target.display()))?;
        remount_readonly(target)?;
    }

    Ok(())
}

/// Remounts an existing bind mount read-only in place.
pub(crate) fn remount_readonly(target: &Path) -> Result<()> {
    mount_remount(target, MountFlags::BIND | MountFlags::RDONLY, "")
        .with_context(|| format!("Unable to remount {} read-only", target.display()))
}

/// Mounts a fresh tmpfs, bounded by a `size=<n>` option when given.
pub(crate) fn tmpfs(target: &Path, data: Option<&str>) -> Result<()> {
    let data = data.map(CString::new).transpose().context("Invalid tmpfs mount data")?;
    mount(
        "tmpfs",
        target,
        "tmpfs",
        MountFlags::NOSUID | MountFlags::NODEV,
        data.as_deref(),
    )
    .with_context(|| format!("Unable to mount tmpfs on {}", target.display()))
}
