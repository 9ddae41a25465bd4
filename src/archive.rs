//! Archive plumbing: extraction of self-describing streams into staging
//! directories, and the package-format table shared by the front-ends.

use std::{
    ffi::OsStr,
    fs::{self, File},
    io::{BufReader, Cursor, Read, Write},
    os::unix::ffi::OsStrExt,
    path::Path,
};

use anyhow::{Context, Result, anyhow, bail};
use rustix::fd::OwnedFd;

use crate::sandbox::mount::remount_readonly;

/// The compression layer around a tar stream.  `External` formats have no
/// built-in codec and are only reachable through the `tar` command lines.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Codec {
    Plain,
    Gzip,
    Xz,
    Bzip2,
    External,
}

/// A supported package format: the file-name extension it is recognized
/// by, its codec, plus the in-sandbox `tar` command lines that extract an
/// archive from stdin or create one to stdout.
#[derive(Debug)]
pub struct PkgFormat {
    pub extension: &'static str,
    pub codec: Codec,
    pub extract_command: &'static str,
    pub create_command: &'static str,
}

pub const PKG_FORMATS: [PkgFormat; 5] = [
    PkgFormat {
        extension: "tar.gz",
        codec: Codec::Gzip,
        extract_command: "tar -xzf -",
        create_command: "tar -cz .",
    },
    PkgFormat {
        extension: "tar.xz",
        codec: Codec::Xz,
        extract_command: "tar -xJf -",
        create_command: "tar -cJ .",
    },
    PkgFormat {
        extension: "tar.bz2",
        codec: Codec::Bzip2,
        extract_command: "tar -xjf -",
        create_command: "tar -cj .",
    },
    PkgFormat {
        extension: "tar.comp",
        codec: Codec::External,
        extract_command: "tar -xZf -",
        create_command: "tar -cZ .",
    },
    PkgFormat {
        extension: "tar",
        codec: Codec::Plain,
        extract_command: "tar -xf -",
        create_command: "tar -c .",
    },
];

pub fn format_for(extension: &str) -> Option<&'static PkgFormat> {
    PKG_FORMATS
        .iter()
        .find(|format| format.extension == extension)
}

/// Infers a package extension from a file name, skipping embedded numeric
/// segments such as versions or dates: `liborm-0.3.tar.xz` gives `tar.xz`.
pub fn extension(path: &str) -> Option<&str> {
    let name = path.rsplit('/').next().unwrap_or(path);
    let mut ext = &name[name.find('.')?..];

    loop {
        let rest = &ext[1..];
        let digits = rest.bytes().take_while(u8::is_ascii_digit).count();

        if rest.as_bytes().get(digits) == Some(&b'.') {
            ext = &rest[digits..];
        } else {
            break;
        }
    }

    let ext = &ext[1..];
    (!ext.is_empty()).then_some(ext)
}

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const XZ_MAGIC: [u8; 6] = [0xfd, b'7', b'z', b'X', b'Z', 0x00];
const BZIP2_MAGIC: [u8; 3] = *b"BZh";
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];

/// Wraps the stream in the decompressor its magic number calls for.
/// Unrecognized data passes through as plain tar, which is also what the
/// `git archive` producer always emits.
fn decoder(mut reader: impl Read + 'static) -> Result<Box<dyn Read>> {
    let mut magic = [0u8; 6];
    let mut filled = 0;

    while filled < magic.len() {
        match reader
            .read(&mut magic[filled..])
            .context("Unable to read archive stream")?
        {
            0 => break,
            count => filled += count,
        }
    }

    let head = &magic[..filled];
    let reader = Cursor::new(head.to_vec()).chain(reader);

    Ok(if head.starts_with(&GZIP_MAGIC) {
        Box::new(flate2::read::GzDecoder::new(reader))
    } else if head.starts_with(&XZ_MAGIC) {
        Box::new(xz2::read::XzDecoder::new(reader))
    } else if head.starts_with(&BZIP2_MAGIC) {
        Box::new(bzip2::read::BzDecoder::new(reader))
    } else if head.starts_with(&ZSTD_MAGIC) {
        Box::new(
            zstd::stream::read::Decoder::new(reader)
                .context("Unable to initialize zstd decoder")?,
        )
    } else {
        Box::new(reader)
    })
}

/// Extracts an archive stream into `target`, rewriting every entry below
/// it: leading slashes are stripped from archived names so absolute
/// entries cannot escape.  Modes and timestamps are preserved.  With
/// `readonly`, the target mount is flipped read-only once every entry is
/// on disk.  The fd is consumed, and closed, either way.
pub fn extract(target: &Path, readonly: bool, fd: OwnedFd) -> Result<()> {
    let reader = decoder(BufReader::new(File::from(fd)))?;

    let mut archive = tar::Archive::new(reader);
    archive.set_preserve_permissions(true);
    archive.set_preserve_mtime(true);

    for entry in archive.entries().context("Unable to read archive")? {
        let mut entry = entry.context("Unable to read archive entry")?;

        let destination = {
            let bytes = entry.path_bytes();
            let mut name = bytes.as_ref();
            while let Some(rest) = name.strip_prefix(b"/") {
                name = rest;
            }
            target.join(Path::new(OsStr::from_bytes(name)))
        };

        // Entries are not guaranteed to be preceded by their directories.
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Unable to create {}", parent.display()))?;
        }

        entry
            .unpack(&destination)
            .with_context(|| format!("Unable to extract {}", destination.display()))?;
    }

    if readonly {
        remount_readonly(target)?;
    }

    Ok(())
}

fn pack_into<W: Write>(dir: &Path, writer: W) -> Result<W> {
    let mut builder = tar::Builder::new(writer);
    // A physical walk: symlinks are recorded as symlinks, never followed.
    builder.follow_symlinks(false);
    builder
        .append_dir_all(".", dir)
        .with_context(|| format!("Unable to archive {}", dir.display()))?;

    builder.into_inner().context("Unable to finish archive")
}

/// Archives a directory tree to `fd` in the named format, entry names
/// relative to the tree's root.  The symmetric counterpart of `extract`
/// for the formats with a built-in codec.
pub fn create(dir: &Path, extension: &str, fd: OwnedFd) -> Result<()> {
    let format = format_for(extension)
        .ok_or_else(|| anyhow!("Unknown package format '{extension}'"))?;
    let file = File::from(fd);

    match format.codec {
        Codec::Plain => {
            pack_into(dir, file)?;
        }
        Codec::Gzip => {
            pack_into(
                dir,
                flate2::write::GzEncoder::new(file, flate2::Compression::default()),
            )?
            .finish()
            .context("Unable to finish gzip stream")?;
        }
        Codec::Xz => {
            pack_into(dir, xz2::write::XzEncoder::new(file, 6))?
                .finish()
                .context("Unable to finish xz stream")?;
        }
        Codec::Bzip2 => {
            pack_into(
                dir,
                bzip2::write::BzEncoder::new(file, bzip2::Compression::default()),
            )?
            .finish()
            .context("Unable to finish bzip2 stream")?;
        }
        Codec::External => {
            bail!("No built-in codec for '{extension}' archives");
        }
    }

    Ok(())
}
