//! Per-workspace scratch directories under the XDG cache (persistent) or
//! runtime (ephemeral) base directory.

use std::{
    fs::DirBuilder,
    io::{Error, ErrorKind, Result},
    os::unix::fs::DirBuilderExt,
    path::{Path, PathBuf},
};

use crate::paths::valid_name;

const SCRATCH_PREFIX: &str = "jormungandr";
const SCRATCH_MODE: u32 = 0o700;

/// Creates (if needed) and canonicalizes the named work directory of a
/// workspace.  Persistent workdirs live under the cache directory and
/// survive reboots; ephemeral ones live under `XDG_RUNTIME_DIR`, which
/// must be set, there is no fallback for it.
pub fn workdir(workspace: &str, name: &str, persistent: bool) -> Result<PathBuf> {
    let base = if persistent {
        dirs::cache_dir().ok_or(ErrorKind::InvalidInput)?
    } else {
        dirs::runtime_dir().ok_or(ErrorKind::InvalidInput)?
    };

    workdir_in(&base, workspace, name)
}

fn workdir_in(base: &Path, workspace: &str, name: &str) -> Result<PathBuf> {
    if !valid_name(workspace) {
        return Err(Error::from(ErrorKind::InvalidInput));
    }

    let path = base.join(SCRATCH_PREFIX).join(workspace).join(name);
    DirBuilder::new()
        .recursive(true)
        .mode(SCRATCH_MODE)
        .create(&path)?;

    path.canonicalize()
}

#[cfg(test)]
mod tests {
    use std::{env, fs, os::unix::fs::PermissionsExt};

    use super::*;

    #[test]
    fn invalid_workspace_is_rejected() {
        let base = tempfile::tempdir().unwrap();

        for workspace in ["", ".", ".hidden", "a/b"] {
            let err = workdir_in(base.path(), workspace, "obj").unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidInput, "workspace {workspace:?}");
        }
    }

    #[test]
    fn creates_the_whole_chain_with_restricted_mode() {
        let base = tempfile::tempdir().unwrap();

        let path = workdir_in(base.path(), "ws1", "obj").unwrap();
        assert_eq!(
            path,
            base.path()
                .canonicalize()
                .unwrap()
                .join(SCRATCH_PREFIX)
                .join("ws1")
                .join("obj")
        );

        for dir in [
            base.path().join(SCRATCH_PREFIX),
            base.path().join(SCRATCH_PREFIX).join("ws1"),
            path.clone(),
        ] {
            let mode = fs::metadata(&dir).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o700, "{}", dir.display());
        }
    }

    #[test]
    fn provisioning_is_idempotent() {
        let base = tempfile::tempdir().unwrap();

        let first = workdir_in(base.path(), "ws1", "scratch").unwrap();
        let second = workdir_in(base.path(), "ws1", "scratch").unwrap();
        assert_eq!(first, second);

        let entries = fs::read_dir(base.path().join(SCRATCH_PREFIX).join("ws1"))
            .unwrap()
            .count();
        assert_eq!(entries, 1);
    }

    #[test]
    fn ephemeral_requires_a_runtime_dir() {
        let _guard = crate::env_lock();
        let saved = env::var_os("XDG_RUNTIME_DIR");
        unsafe { env::remove_var("XDG_RUNTIME_DIR") };

        let missing = workdir("ws1", "obj", false);

        let runtime = tempfile::tempdir().unwrap();
        unsafe { env::set_var("XDG_RUNTIME_DIR", runtime.path()) };

        let provisioned = workdir("ws1", "obj", false);

        unsafe {
            match saved {
                Some(value) => env::set_var("XDG_RUNTIME_DIR", value),
                None => env::remove_var("XDG_RUNTIME_DIR"),
            }
        }

        assert_eq!(missing.unwrap_err().kind(), ErrorKind::InvalidInput);
        assert_eq!(
            provisioned.unwrap(),
            runtime
                .path()
                .canonicalize()
                .unwrap()
                .join(SCRATCH_PREFIX)
                .join("ws1")
                .join("obj")
        );
    }
}
