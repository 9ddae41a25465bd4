use std::{
    fs::File,
    io::{BufRead, BufReader, ErrorKind},
    path::Path,
};

use anyhow::{Context, Result};

/// The fields of a passwd entry the sandbox environment is rebuilt from.
#[derive(Debug, Eq, PartialEq)]
pub(super) struct PasswdEntry {
    pub(super) name: String,
    pub(super) home: String,
    pub(super) shell: String,
}

/// Scans a passwd-format file for the entry matching `uid`.  A missing
/// file or a file without a match is not an error: the toolchain image
/// simply does not know the user.
pub(super) fn find_user(filename: impl AsRef<Path>, uid: u32) -> Result<Option<PasswdEntry>> {
    let filename = filename.as_ref();
    let file = match File::open(filename) {
        Ok(file) => file,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err).with_context(|| format!("Unable to open {}", filename.display()));
        }
    };

    for line in BufReader::new(file).lines() {
        let line =
            line.with_context(|| format!("Unable to read from {}", filename.display()))?;

        if let Some(entry) = match_line(&line, uid) {
            return Ok(Some(entry));
        }
    }

    Ok(None)
}

/// Parses one `name:passwd:uid:gid:gecos:home:shell` line, returning the
/// entry when it is well-formed and matches.  Malformed lines are skipped,
/// as the libc iterators do.
fn match_line(line: &str, uid: u32) -> Option<PasswdEntry> {
    let mut fields = line.split(':');

    let name = fields.next()?;
    let _passwd = fields.next()?;
    let entry_uid = fields.next()?.parse::<u32>().ok()?;
    let _gid = fields.next()?;
    let _gecos = fields.next()?;
    let home = fields.next()?;
    let shell = fields.next()?;

    (entry_uid == uid).then(|| PasswdEntry {
        name: name.to_string(),
        home: home.to_string(),
        shell: shell.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    const PASSWD: &str = "root:x:0:0:root:/root:/bin/sh\n\
        daemon:x:1:1:daemon:/usr/sbin:/usr/sbin/nologin\n\
        build:x:100:100::/home/build:/bin/sh\n";

    fn fixture() -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(PASSWD.as_bytes()).unwrap();
        file
    }

    #[test]
    fn finds_matching_uid() {
        let file = fixture();

        let entry = find_user(file.path(), 100).unwrap().unwrap();
        assert_eq!(
            entry,
            PasswdEntry {
                name: "build".to_string(),
                home: "/home/build".to_string(),
                shell: "/bin/sh".to_string(),
            }
        );

        let root = find_user(file.path(), 0).unwrap().unwrap();
        assert_eq!(root.name, "root");
    }

    #[test]
    fn unknown_uid_is_none() {
        let file = fixture();
        assert_eq!(find_user(file.path(), 4242).unwrap(), None);
    }

    #[test]
    fn missing_file_is_none() {
        assert_eq!(find_user("/nonexistent/passwd", 0).unwrap(), None);
    }

    #[test]
    fn malformed_lines_are_skipped() {
        assert_eq!(match_line("garbage", 0), None);
        assert_eq!(match_line("name:x:notanumber:0::/:/bin/sh", 0), None);
        assert_eq!(match_line("short:x:0", 0), None);
    }
}
