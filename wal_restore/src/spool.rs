//!
//! Local cache of WAL files that were fetched ahead of PostgreSQL asking for them.
//!
//! The spool is a single flat directory. An entry is named after its WAL file,
//! and anything under that name is a complete copy: fetchers write to a
//! `.___temp` staging file next to it and [`Spool::commit`] renames it into place.
//!
use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use tracing::{debug, warn};
use utils::crashsafe::{self, TEMP_FILE_SUFFIX, path_with_suffix_extension};
use utils::fs_ext::{ignore_not_found, list_dir};

use crate::segment::SegmentName;

#[derive(Debug, thiserror::Error)]
pub enum SpoolError {
    #[error("cannot initialize the WAL spool in {path}")]
    Init {
        path: Utf8PathBuf,
        #[source]
        source: anyhow::Error,
    },
    #[error("cannot move {segment} out of the spool into {destination}")]
    Claim {
        segment: SegmentName,
        destination: Utf8PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("cannot move fetched {segment} into the spool")]
    Commit {
        segment: SegmentName,
        #[source]
        source: io::Error,
    },
    #[error("cannot access {path}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Outcome of [`Spool::claim`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// The entry existed and now lives at the destination.
    Hit,
    /// No entry for this WAL file. Not an error.
    Miss,
}

#[derive(Debug, Clone)]
pub struct Spool {
    root: Utf8PathBuf,
}

impl Spool {
    /// Opens the spool in `root`, creating the directory if needed.
    ///
    /// Staging files left behind by an interrupted fetch are removed.
    pub async fn open(root: impl Into<Utf8PathBuf>) -> Result<Self, SpoolError> {
        let root = root.into();
        let init_error = |source| SpoolError::Init {
            path: root.clone(),
            source,
        };

        let dir = root.clone();
        tokio::task::spawn_blocking(move || crashsafe::create_dir_all(dir))
            .await
            .map_err(anyhow::Error::from)
            .and_then(|created| created)
            .map_err(init_error)?;

        for name in list_dir(&root).await.map_err(init_error)? {
            let path = root.join(&name);
            if crashsafe::is_temporary(&path) {
                warn!("removing leftover staging file {path}");
                tokio::fs::remove_file(&path)
                    .await
                    .or_else(ignore_not_found)
                    .map_err(|source| SpoolError::Io { path, source })?;
            }
        }

        Ok(Spool { root })
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// Where the spool entry for `segment` lives. Distinct names never share a path.
    pub fn path_for(&self, segment: &SegmentName) -> Utf8PathBuf {
        self.root.join(segment.as_str())
    }

    /// Where a fetcher should write `segment` before it is [committed](Spool::commit).
    pub fn staging_path_for(&self, segment: &SegmentName) -> Utf8PathBuf {
        path_with_suffix_extension(self.path_for(segment), TEMP_FILE_SUFFIX)
    }

    pub async fn contains(&self, segment: &SegmentName) -> Result<bool, SpoolError> {
        let path = self.path_for(segment);
        tokio::fs::try_exists(&path)
            .await
            .map_err(|source| SpoolError::Io { path, source })
    }

    /// Moves the entry for `segment` to `destination`, consuming it.
    ///
    /// A missing entry is reported as [`Claim::Miss`]. Any other failure, including a
    /// missing destination directory, is an error.
    pub async fn claim(
        &self,
        segment: &SegmentName,
        destination: &Utf8Path,
    ) -> Result<Claim, SpoolError> {
        let source = self.path_for(segment);
        let claim_error = |source| SpoolError::Claim {
            segment: segment.clone(),
            destination: destination.to_owned(),
            source,
        };

        match tokio::fs::rename(&source, destination).await {
            Ok(()) => {
                debug!("moved {segment} out of the spool into {destination}");
                Ok(Claim::Hit)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                // ENOENT is also what we get when the destination directory is gone
                match tokio::fs::try_exists(&source).await {
                    Ok(false) => Ok(Claim::Miss),
                    Ok(true) => Err(claim_error(e)),
                    Err(stat_error) => Err(claim_error(stat_error)),
                }
            }
            Err(e) if e.kind() == io::ErrorKind::CrossesDevices => {
                copy_across_devices(&source, destination)
                    .await
                    .map_err(claim_error)?;
                debug!("copied {segment} out of the spool into {destination}");
                Ok(Claim::Hit)
            }
            Err(e) => Err(claim_error(e)),
        }
    }

    /// Publishes a fully fetched staging file as the spool entry for `segment`.
    pub async fn commit(&self, segment: &SegmentName) -> Result<(), SpoolError> {
        crashsafe::durable_rename(
            self.staging_path_for(segment),
            self.path_for(segment),
            true,
        )
        .await
        .map_err(|source| SpoolError::Commit {
            segment: segment.clone(),
            source,
        })
    }

    /// Drops whatever a failed fetch left in the staging file for `segment`.
    pub async fn discard(&self, segment: &SegmentName) -> Result<(), SpoolError> {
        let path = self.staging_path_for(segment);
        tokio::fs::remove_file(&path)
            .await
            .or_else(ignore_not_found)
            .map_err(|source| SpoolError::Io { path, source })
    }

    /// Removes the entry for `segment`. Removing an absent entry succeeds.
    pub async fn remove(&self, segment: &SegmentName) -> Result<(), SpoolError> {
        let path = self.path_for(segment);
        tokio::fs::remove_file(&path)
            .await
            .or_else(ignore_not_found)
            .map_err(|source| SpoolError::Io { path, source })
    }
}

/// `rename` does not work across filesystems: copy next to the destination,
/// rename into place, then drop the spool entry.
///
/// Once the destination is in place the copy counts as done; a spool entry that
/// cannot be removed afterwards is only logged.
async fn copy_across_devices(source: &Utf8Path, destination: &Utf8Path) -> io::Result<()> {
    let staging = path_with_suffix_extension(destination, TEMP_FILE_SUFFIX);
    let copied = async {
        tokio::fs::copy(source, &staging).await?;
        crashsafe::durable_rename(&staging, destination, true).await
    }
    .await;
    if let Err(e) = copied {
        if let Err(cleanup_error) = tokio::fs::remove_file(&staging)
            .await
            .or_else(ignore_not_found)
        {
            debug!("cannot remove {staging}: {cleanup_error}");
        }
        return Err(e);
    }
    if let Err(e) = tokio::fs::remove_file(source).await.or_else(ignore_not_found) {
        warn!("leaving {source} in the spool after copying it to {destination}: {e}");
    }
    Ok(())
}
