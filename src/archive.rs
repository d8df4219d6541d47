//! Gzip-compressed tar archives of a directory tree.

use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tar::{Builder, EntryType, Header};
use walkdir::WalkDir;

/// Archive `source_dir` recursively into `writer`.
///
/// Entry names are relative to the parent of `source_dir`, so an archive of
/// `/app/uploads` contains `uploads/`, `uploads/cv.pdf` and so on. Symlinks
/// are stored as links, never followed. Entries that cannot be read are
/// logged and left out. Returns the number of regular files written.
pub fn write_tar_gz<W: Write>(source_dir: &Path, writer: W) -> io::Result<usize> {
    let base = archive_root(source_dir)?;
    if !source_dir.is_dir() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("{} is not a directory", source_dir.display()),
        ));
    }
    let mut builder = Builder::new(GzEncoder::new(writer, Compression::default()));
    builder.follow_symlinks(false);
    let mut files = 0;

    for entry in WalkDir::new(source_dir).follow_links(false).sort_by_file_name() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                log::warn!("Skipping unreadable upload entry: {e}");
                continue;
            }
        };
        let relative = entry
            .path()
            .strip_prefix(source_dir)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let name = base.join(relative);

        match append_entry(&mut builder, &entry, &name) {
            Ok(true) => files += 1,
            Ok(false) => {}
            Err(e) => log::warn!("Skipping {}: {}", entry.path().display(), e),
        }
    }

    let mut writer = builder.into_inner()?.finish()?;
    writer.flush()?;
    Ok(files)
}

/// Append one walked entry. Returns whether it was a regular file.
fn append_entry<W: Write>(
    builder: &mut Builder<W>,
    entry: &walkdir::DirEntry,
    name: &Path,
) -> io::Result<bool> {
    let file_type = entry.file_type();
    if file_type.is_symlink() {
        let target = fs::read_link(entry.path())?;
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Symlink);
        header.set_size(0);
        header.set_mode(0o777);
        builder.append_link(&mut header, name, target)?;
        Ok(false)
    } else if file_type.is_dir() {
        builder.append_dir(name, entry.path())?;
        Ok(false)
    } else if file_type.is_file() {
        let mut file = File::open(entry.path())?;
        builder.append_file(name, &mut file)?;
        Ok(true)
    } else {
        Ok(false)
    }
}

fn archive_root(source_dir: &Path) -> io::Result<PathBuf> {
    source_dir
        .file_name()
        .map(PathBuf::from)
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("cannot archive {}: no directory name", source_dir.display()),
            )
        })
}
