//!
//! Runs the external tool that downloads one WAL file from the archive.
//!
//! Invocation contract: `<tool> [base options...] <wal name> <destination>`,
//! exit code 0 meaning the destination now holds the file. The tool gets
//! exactly the environment it was configured with, which is how archive
//! credentials and endpoints reach it.
//!
use std::ffi::OsString;
use std::io;
use std::process::{ExitStatus, Stdio};

use camino::{Utf8Path, Utf8PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info_span};

use crate::child_stdio_to_log::relay_process_output;
use crate::segment::SegmentName;

/// Tool used unless configured otherwise.
pub const BARMAN_CLOUD_WAL_RESTORE: &str = "barman-cloud-wal-restore";

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("unexpected failure invoking {tool}: cannot start process")]
    Spawn {
        tool: String,
        #[source]
        source: io::Error,
    },
    #[error("unexpected failure invoking {tool}: cannot wait for process")]
    Wait {
        tool: String,
        #[source]
        source: io::Error,
    },
    #[error("unexpected failure invoking {tool}: {status}")]
    Exit { tool: String, status: ExitStatus },
    #[error("{tool} was cancelled")]
    Cancelled { tool: String },
}

#[derive(Debug, Clone)]
pub struct WalFetcher {
    tool: Utf8PathBuf,
    env: Vec<(OsString, OsString)>,
}

/// `base_options + [wal name, destination]`
pub fn fetch_args(
    base_options: &[String],
    segment: &SegmentName,
    destination: &Utf8Path,
) -> Vec<String> {
    let mut args = Vec::with_capacity(base_options.len() + 2);
    args.extend_from_slice(base_options);
    args.push(segment.to_string());
    args.push(destination.to_string());
    args
}

impl WalFetcher {
    pub fn new<I, K, V>(tool: impl Into<Utf8PathBuf>, env: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<OsString>,
        V: Into<OsString>,
    {
        WalFetcher {
            tool: tool.into(),
            env: env.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }

    pub fn tool(&self) -> &Utf8Path {
        &self.tool
    }

    /// Short name of the tool, used to tag its log output.
    pub fn tool_name(&self) -> &str {
        self.tool.file_name().unwrap_or(self.tool.as_str())
    }

    /// Fetches `segment` into `destination`, streaming the tool's output to the log.
    ///
    /// There is no retry. If `cancel` fires while the tool runs, the process is killed.
    pub async fn fetch(
        &self,
        segment: &SegmentName,
        destination: &Utf8Path,
        base_options: &[String],
        cancel: &CancellationToken,
    ) -> Result<(), FetchError> {
        let tool = self.tool_name().to_owned();
        if cancel.is_cancelled() {
            return Err(FetchError::Cancelled { tool });
        }

        let args = fetch_args(base_options, segment, destination);
        debug!("running {} {}", self.tool, args.join(" "));

        let mut child = tokio::process::Command::new(&self.tool)
            .args(&args)
            .env_clear()
            .envs(self.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| FetchError::Spawn {
                tool: tool.clone(),
                source,
            })?;

        let relay = relay_process_output(child.stdout.take(), child.stderr.take())
            .instrument(info_span!("fetch_tool", tool = %tool, wal_name = %segment));
        let wait = async {
            let (status, ()) = tokio::join!(child.wait(), relay);
            status
        };

        let status = tokio::select! {
            status = wait => Some(status),
            _ = cancel.cancelled() => None,
        };
        let Some(status) = status else {
            // reap it here instead of leaving it to kill_on_drop
            if let Err(e) = child.kill().await {
                debug!("cannot kill cancelled {tool}: {e}");
            }
            return Err(FetchError::Cancelled { tool });
        };

        let status = status.map_err(|source| FetchError::Wait {
            tool: tool.clone(),
            source,
        })?;
        if status.success() {
            Ok(())
        } else {
            Err(FetchError::Exit { tool, status })
        }
    }
}
