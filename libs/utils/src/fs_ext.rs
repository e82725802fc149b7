/// Extensions to `std::fs` types.
use std::io;

use anyhow::Context;
use camino::Utf8Path;

pub async fn is_directory_empty(path: impl AsRef<Utf8Path>) -> anyhow::Result<bool> {
    let mut dir = tokio::fs::read_dir(path.as_ref())
        .await
        .context(format!("read_dir({})", path.as_ref()))?;
    Ok(dir.next_entry().await?.is_none())
}

/// Lists the file names of a directory, skipping names that are not valid UTF-8.
pub async fn list_dir(path: impl AsRef<Utf8Path>) -> anyhow::Result<Vec<String>> {
    let mut dir = tokio::fs::read_dir(path.as_ref())
        .await
        .context(format!("read_dir({})", path.as_ref()))?;

    let mut content = vec![];
    while let Some(next) = dir.next_entry().await? {
        if let Ok(file_name) = next.file_name().into_string() {
            content.push(file_name);
        }
    }

    Ok(content)
}

pub fn ignore_not_found(e: io::Error) -> io::Result<()> {
    if e.kind() == io::ErrorKind::NotFound {
        Ok(())
    } else {
        Err(e)
    }
}
