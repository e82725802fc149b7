use std::borrow::Cow;
use std::fs::{self, File};
use std::io;

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};

/// Files with this suffix are work in progress and must never be read as
/// complete data. Whoever finds them after a restart may delete them.
pub const TEMP_FILE_SUFFIX: &str = "___temp";

/// Adds a suffix to the file(directory) name, either appending the suffix to the end of its extension,
/// or if there's no extension, creates one and puts a suffix there.
pub fn path_with_suffix_extension(original_path: impl AsRef<Utf8Path>, suffix: &str) -> Utf8PathBuf {
    let new_extension = match original_path.as_ref().extension() {
        Some(extension) => Cow::Owned(format!("{extension}.{suffix}")),
        None => Cow::Borrowed(suffix),
    };
    original_path.as_ref().with_extension(new_extension.as_ref())
}

pub fn is_temporary(path: &Utf8Path) -> bool {
    match path.file_name() {
        Some(name) => name.ends_with(TEMP_FILE_SUFFIX),
        None => false,
    }
}

pub fn fsync(path: &Utf8Path) -> anyhow::Result<()> {
    File::open(path)
        .context("Failed to open the file")
        .and_then(|file| file.sync_all().context("Failed to sync file metadata"))
        .with_context(|| format!("Failed to fsync file {path}"))
}

pub async fn fsync_async(path: impl AsRef<Utf8Path>) -> io::Result<()> {
    tokio::fs::File::open(path.as_ref()).await?.sync_all().await
}

/// Renames `old_path` onto `new_path` so that after a crash either the old or the new
/// state is observed, never a torn one.
///
/// The source file is fsynced before the rename, the parent directory of the target after it.
/// Both paths must be on the same filesystem.
pub async fn durable_rename(
    old_path: impl AsRef<Utf8Path>,
    new_path: impl AsRef<Utf8Path>,
    do_fsync: bool,
) -> io::Result<()> {
    let old_path = old_path.as_ref();
    let new_path = new_path.as_ref();

    if do_fsync {
        fsync_async(old_path).await?;
    }

    tokio::fs::rename(old_path, new_path).await?;

    if do_fsync {
        let parent = match new_path.parent() {
            Some(p) if !p.as_str().is_empty() => p,
            _ => Utf8Path::new("./"),
        };
        fsync_async(parent).await?;
    }

    Ok(())
}

/// Similar to [`std::fs::create_dir_all`], except we fsync all
/// newly created directories and the pre-existing parent.
pub fn create_dir_all(path: impl AsRef<Utf8Path>) -> anyhow::Result<()> {
    let mut path = path.as_ref();

    let mut dirs_to_create = Vec::new();

    // Figure out which directories we need to create.
    loop {
        match path.metadata() {
            Ok(metadata) if metadata.is_dir() => break,
            Ok(_) => anyhow::bail!("non-directory found in path: {path}"),
            Err(ref e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => anyhow::bail!("Error during path {path} metadata retrieval: {e}"),
        }

        dirs_to_create.push(path);

        match path.parent() {
            Some(parent) if !parent.as_str().is_empty() => path = parent,
            Some(_) => {
                path = Utf8Path::new(".");
                break;
            }
            None => anyhow::bail!("can't find parent of path '{path}'"),
        }
    }

    // Create directories from parent to child.
    for &dir in dirs_to_create.iter().rev() {
        match fs::create_dir(dir) {
            Ok(()) => {}
            // somebody else created it concurrently
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists && dir.is_dir() => {}
            Err(e) => return Err(e).with_context(|| format!("Failed to create directory {dir}")),
        }
    }

    // Fsync the created directories from child to parent.
    for &dir in dirs_to_create.iter() {
        fsync(dir)?;
    }

    // If we created any new directories, fsync the parent.
    if !dirs_to_create.is_empty() {
        fsync(path)?;
    }

    Ok(())
}
