//! Resolution of named toolchain and bsys assets under the XDG data
//! directories.

use std::{
    env,
    ffi::OsString,
    io::{Error, ErrorKind, Result},
    path::PathBuf,
};

const TOOLCHAIN_PREFIX: &str = "jormungandr/toolchain";
const BSYS_PREFIX: &str = "jormungandr/bsys";

/// A usable asset or workspace name: non-empty, no path separator, and no
/// leading dot (which also rules out `.` and `..`).
pub fn valid_name(name: &str) -> bool {
    !name.is_empty() && !name.starts_with('.') && !name.contains('/')
}

/// The data directories to search, most specific first.  The home entry is
/// mandatory: without a usable `XDG_DATA_HOME` or `HOME` there is nowhere
/// user assets could have been installed to.
fn data_dirs() -> Result<Vec<PathBuf>> {
    let mut dirs = vec![dirs::data_dir().ok_or(ErrorKind::InvalidInput)?];

    match env::var_os("XDG_DATA_DIRS") {
        Some(value) => dirs.extend(
            env::split_paths(&value).filter(|entry| !entry.as_os_str().is_empty()),
        ),
        None => dirs.extend([
            PathBuf::from("/usr/local/share"),
            PathBuf::from("/usr/share"),
        ]),
    }

    Ok(dirs)
}

/// Returns the canonical path of the first existing `<dir>/<prefix>/<name>`.
fn resolve_in(
    dirs: impl IntoIterator<Item = PathBuf>,
    prefix: &str,
    name: &str,
) -> Result<PathBuf> {
    for dir in dirs {
        if let Ok(path) = dir.join(prefix).join(name).canonicalize() {
            return Ok(path);
        }
    }

    Err(Error::from(ErrorKind::NotFound))
}

fn resolve(prefix: &str, name: &str) -> Result<PathBuf> {
    if !valid_name(name) {
        return Err(Error::from(ErrorKind::InvalidInput));
    }

    resolve_in(data_dirs()?, prefix, name)
}

/// Looks up the named toolchain image, a rootfs-shaped directory tree.
pub fn toolchain_path(toolchain: &str) -> Result<PathBuf> {
    resolve(TOOLCHAIN_PREFIX, toolchain)
}

/// Looks up the named bsys, an executable staged at `/var/bsys/<name>`
/// inside the sandbox.
pub fn bsys_path(bsys: &str) -> Result<PathBuf> {
    resolve(BSYS_PREFIX, bsys)
}

/// Splits a bsys argument into the directory to stage and the entry name
/// within it.  Arguments containing a slash are used as paths directly,
/// anything else goes through the data-directory search.
pub fn bsys_location(bsys: &str) -> Result<(PathBuf, OsString)> {
    let path = if bsys.contains('/') {
        PathBuf::from(bsys)
    } else {
        bsys_path(bsys)?
    };

    let name = path
        .file_name()
        .ok_or(ErrorKind::InvalidInput)?
        .to_os_string();
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };

    Ok((dir, name))
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    fn install(base: &std::path::Path, name: &str) -> PathBuf {
        let path = base.join(TOOLCHAIN_PREFIX).join(name);
        fs::create_dir_all(&path).unwrap();
        path
    }

    #[test]
    fn name_validation() {
        for name in ["", ".", "..", ".hidden", "a/b", "/x"] {
            assert!(!valid_name(name), "{name:?} should be rejected");
        }

        assert!(valid_name("default"));
        assert!(valid_name("gcc-14"));
    }

    #[test]
    fn invalid_names_fail_resolution() {
        for name in ["", ".", "a/b", "/x"] {
            assert_eq!(
                resolve(TOOLCHAIN_PREFIX, name).unwrap_err().kind(),
                ErrorKind::InvalidInput,
                "{name:?} should be an invalid argument",
            );
        }
    }

    #[test]
    fn first_hit_wins() {
        let home = tempfile::tempdir().unwrap();
        let system = tempfile::tempdir().unwrap();
        let expected = install(home.path(), "default");
        install(system.path(), "default");

        let found = resolve_in(
            [home.path().to_path_buf(), system.path().to_path_buf()],
            TOOLCHAIN_PREFIX,
            "default",
        )
        .unwrap();
        assert_eq!(found, expected.canonicalize().unwrap());
    }

    #[test]
    fn later_entries_are_searched() {
        let home = tempfile::tempdir().unwrap();
        let first = tempfile::tempdir().unwrap();
        let second = tempfile::tempdir().unwrap();
        let expected = install(second.path(), "cross");

        let found = resolve_in(
            [
                home.path().to_path_buf(),
                first.path().to_path_buf(),
                second.path().to_path_buf(),
            ],
            TOOLCHAIN_PREFIX,
            "cross",
        )
        .unwrap();
        assert_eq!(found, expected.canonicalize().unwrap());
    }

    #[test]
    fn exhausted_search_is_not_found() {
        let home = tempfile::tempdir().unwrap();

        let err = resolve_in([home.path().to_path_buf()], TOOLCHAIN_PREFIX, "missing")
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn symlinked_assets_canonicalize() {
        let data = tempfile::tempdir().unwrap();
        let target = install(data.path(), "real");
        std::os::unix::fs::symlink(&target, data.path().join(TOOLCHAIN_PREFIX).join("alias"))
            .unwrap();

        let found =
            resolve_in([data.path().to_path_buf()], TOOLCHAIN_PREFIX, "alias").unwrap();
        assert_eq!(found, target.canonicalize().unwrap());
    }

    #[test]
    fn bsys_location_splits_paths() {
        let (dir, name) = bsys_location("/opt/bsys/make").unwrap();
        assert_eq!(dir, PathBuf::from("/opt/bsys"));
        assert_eq!(name, "make");

        let (dir, name) = bsys_location("./local").unwrap();
        assert_eq!(dir, PathBuf::from("."));
        assert_eq!(name, "local");
    }

    #[test]
    fn data_home_is_preferred_over_data_dirs() {
        let _guard = crate::env_lock();
        let home = tempfile::tempdir().unwrap();
        let system = tempfile::tempdir().unwrap();
        let expected = install(home.path(), "default");
        install(system.path(), "default");

        let saved_home = env::var_os("XDG_DATA_HOME");
        let saved_dirs = env::var_os("XDG_DATA_DIRS");
        unsafe {
            env::set_var("XDG_DATA_HOME", home.path());
            env::set_var("XDG_DATA_DIRS", system.path());
        }

        let found = toolchain_path("default");

        unsafe {
            match saved_home {
                Some(value) => env::set_var("XDG_DATA_HOME", value),
                None => env::remove_var("XDG_DATA_HOME"),
            }
            match saved_dirs {
                Some(value) => env::set_var("XDG_DATA_DIRS", value),
                None => env::remove_var("XDG_DATA_DIRS"),
            }
        }

        assert_eq!(found.unwrap(), expected.canonicalize().unwrap());
    }
}
