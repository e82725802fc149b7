//! `restore_command` for PostgreSQL instances recovering from an object store archive.
//!
//! PostgreSQL calls it once per WAL file it needs:
//!
//! ```text
//! restore_command = 'wal_restore --spool-directory /controller/wal-restore-spool --max-parallel 4 %f %p -- --cloud-provider aws-s3 s3://backups/ cluster-example'
//! ```
//!
//! The file is served from the spool when an earlier invocation prefetched it.
//! Otherwise it is fetched with `barman-cloud-wal-restore` (or `--fetch-tool`),
//! together with the next `--max-parallel - 1` segments, which land in the spool
//! for the following invocations. Everything after `--` is passed to the fetch
//! tool ahead of the WAL name and destination.
//!
//! Exits with a non-zero code when the requested file could not be restored;
//! PostgreSQL takes that as "not available (yet)" and retries later.
//!
use std::num::NonZeroUsize;

use anyhow::Context;
use camino::Utf8PathBuf;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use utils::error::report_compact_sources;
use utils::logging::{self, LogFormat};
use wal_restore::config::{ClusterIdentity, RestoreConfig};
use wal_restore::restorer::{Demand, RestoreBatch, Restorer, demanded_result};
use wal_restore::segment::{DEFAULT_WAL_SEGMENT_SIZE, SegmentName, is_valid_wal_segment_size};

#[derive(clap::Parser)]
#[command(version, about = "Restore a WAL file from the archive, prefetching the next ones")]
struct Args {
    /// Name of the WAL file PostgreSQL asks for (`%f`)
    wal_name: String,
    /// Where PostgreSQL expects the file (`%p`)
    destination: Utf8PathBuf,

    /// JSON file with the restore settings. Flags below override it.
    #[clap(long, env = "WAL_RESTORE_CONFIG")]
    config: Option<Utf8PathBuf>,
    #[clap(long, env = "WAL_RESTORE_SPOOL_DIRECTORY")]
    spool_directory: Option<Utf8PathBuf>,
    #[clap(long, env = "WAL_RESTORE_FETCH_TOOL")]
    fetch_tool: Option<Utf8PathBuf>,
    #[clap(long, env = "CLUSTER_NAMESPACE")]
    cluster_namespace: Option<String>,
    #[clap(long, env = "CLUSTER_NAME")]
    cluster_name: Option<String>,

    /// How many WAL files to fetch per invocation, the requested one included
    #[clap(long, default_value = "1")]
    max_parallel: NonZeroUsize,
    /// Cap on fetch tools running at once. Unbounded by default.
    #[clap(long)]
    max_concurrent_fetches: Option<NonZeroUsize>,
    #[clap(long, default_value_t = DEFAULT_WAL_SEGMENT_SIZE, value_parser = parse_wal_segment_size)]
    wal_segment_size: u64,

    #[clap(long, default_value = "plain", value_parser = LogFormat::from_config)]
    log_format: LogFormat,

    /// Options passed verbatim to the fetch tool
    #[clap(last = true)]
    tool_options: Vec<String>,
}

fn parse_wal_segment_size(s: &str) -> anyhow::Result<u64> {
    let size: u64 = s.parse().context("parse WAL segment size")?;
    anyhow::ensure!(
        is_valid_wal_segment_size(size),
        "WAL segment size must be a power of two between 1MiB and 1GiB, got {size}"
    );
    Ok(size)
}

impl Args {
    fn restore_config(&self) -> anyhow::Result<RestoreConfig> {
        let mut config = match (&self.config, &self.spool_directory) {
            (Some(path), _) => RestoreConfig::from_json_file(path)?,
            (None, Some(spool_directory)) => RestoreConfig::new(spool_directory),
            (None, None) => {
                anyhow::bail!("either --config or --spool-directory must be specified")
            }
        };

        if let Some(spool_directory) = &self.spool_directory {
            config.spool_directory = spool_directory.clone();
        }
        if let Some(fetch_tool) = &self.fetch_tool {
            config.fetch_tool = fetch_tool.clone();
        }
        let ClusterIdentity { namespace, name } = &mut config.cluster;
        if let Some(cluster_namespace) = &self.cluster_namespace {
            *namespace = cluster_namespace.clone();
        }
        if let Some(cluster_name) = &self.cluster_name {
            *name = cluster_name.clone();
        }
        if self.max_concurrent_fetches.is_some() {
            config.max_concurrent_fetches = self.max_concurrent_fetches;
        }

        Ok(config)
    }
}

/// Fires `cancel` when PostgreSQL shuts down and signals us.
fn cancel_on_shutdown_signal(cancel: CancellationToken) -> anyhow::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = signal(SignalKind::terminate()).context("install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("install SIGINT handler")?;
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => warn!("received SIGTERM, cancelling WAL fetches"),
            _ = sigint.recv() => warn!("received SIGINT, cancelling WAL fetches"),
        }
        cancel.cancel();
    });
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // stdout belongs to PostgreSQL's log collector
    logging::init(args.log_format, "info")?;
    let _panic_hook_guard = logging::replace_panic_hook_with_tracing_panic_hook();

    let segment = SegmentName::parse(&args.wal_name)?;
    let config = args.restore_config()?;

    let cancel = CancellationToken::new();
    cancel_on_shutdown_signal(cancel.clone())?;

    let restorer = Restorer::new(&config, cancel).await?;

    if restorer
        .restore_from_spool(&segment, &args.destination)
        .await
        .context("while restoring WAL from the spool")?
    {
        info!(
            wal_name = %segment,
            destination = %args.destination,
            "Restored WAL file from the spool"
        );
        return Ok(());
    }

    let lookahead = segment.next_segments(args.max_parallel.get() - 1, args.wal_segment_size);
    let batch = RestoreBatch::new(segment, lookahead);
    let results = restorer
        .restore_list(&batch, &args.destination, &args.tool_options)
        .await;

    let prefetched = results
        .iter()
        .filter(|r| r.demand == Demand::Speculative && r.outcome.is_ok())
        .count();
    info!(
        cluster = %restorer.cluster(),
        requested = batch.len(),
        prefetched,
        "WAL restore batch finished"
    );

    let demanded = demanded_result(&results).context("no result for the requested WAL file")?;
    match &demanded.outcome {
        Ok(()) => Ok(()),
        Err(e) => Err(anyhow::anyhow!(
            "failed restoring WAL file {}: {}",
            demanded.segment,
            report_compact_sources(e)
        )),
    }
}
