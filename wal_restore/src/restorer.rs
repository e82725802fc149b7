//!
//! Restores WAL files requested by PostgreSQL, prefetching the ones it is
//! likely to ask for next.
//!
//! A request is served from the spool when a previous prefetch already brought
//! the file in. Otherwise the demanded file and a batch of look-ahead files
//! are fetched concurrently: the demanded one straight to the path PostgreSQL
//! reads, the others into the spool. Only the demanded file's failure matters
//! to the caller; a look-ahead file may simply not be archived yet.
//!
use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::Semaphore;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};
use utils::error::report_compact_sources;

use crate::config::{ClusterIdentity, RestoreConfig};
use crate::fetch::{FetchError, WalFetcher};
use crate::segment::SegmentName;
use crate::spool::{Claim, Spool, SpoolError};

/// Whether PostgreSQL is waiting for a WAL file or we only guess it will be.
/// Decided once, when the batch is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Demand {
    Demanded,
    Speculative,
}

/// Final state of one WAL file of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentState {
    Succeeded,
    /// A look-ahead file could not be fetched. Expected near the archive head.
    FailedSoft,
    /// The demanded file could not be fetched. PostgreSQL will retry.
    FailedHard,
}

#[derive(Debug, thiserror::Error)]
pub enum RestoreError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Spool(#[from] SpoolError),
    #[error("restore task for {segment} failed")]
    TaskFailed {
        segment: SegmentName,
        #[source]
        source: JoinError,
    },
}

/// WAL files to fetch in one go: the one PostgreSQL asked for, followed by
/// look-ahead candidates in archival order.
#[derive(Debug, Clone)]
pub struct RestoreBatch {
    demanded: SegmentName,
    lookahead: Vec<SegmentName>,
}

impl RestoreBatch {
    /// Look-ahead names equal to the demanded one or repeated are dropped, so that
    /// no two fetches of a batch ever target the same file.
    pub fn new(demanded: SegmentName, lookahead: impl IntoIterator<Item = SegmentName>) -> Self {
        let mut seen = HashSet::from([demanded.clone()]);
        let lookahead = lookahead
            .into_iter()
            .filter(|segment| seen.insert(segment.clone()))
            .collect();
        RestoreBatch {
            demanded,
            lookahead,
        }
    }

    pub fn demanded(&self) -> &SegmentName {
        &self.demanded
    }

    pub fn lookahead(&self) -> &[SegmentName] {
        &self.lookahead
    }

    pub fn len(&self) -> usize {
        1 + self.lookahead.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    /// All names, demanded first.
    pub fn segments(&self) -> impl Iterator<Item = &SegmentName> {
        std::iter::once(&self.demanded).chain(&self.lookahead)
    }
}

/// One unit of work of [`Restorer::restore_list`].
#[derive(Debug, Clone)]
enum WorkItem {
    Demanded {
        segment: SegmentName,
        destination: Utf8PathBuf,
    },
    Speculative {
        segment: SegmentName,
    },
}

impl WorkItem {
    fn segment(&self) -> &SegmentName {
        match self {
            WorkItem::Demanded { segment, .. } | WorkItem::Speculative { segment } => segment,
        }
    }

    fn demand(&self) -> Demand {
        match self {
            WorkItem::Demanded { .. } => Demand::Demanded,
            WorkItem::Speculative { .. } => Demand::Speculative,
        }
    }

    /// Where the file ends up once the work item succeeds.
    fn destination(&self, spool: &Spool) -> Utf8PathBuf {
        match self {
            WorkItem::Demanded { destination, .. } => destination.clone(),
            WorkItem::Speculative { segment } => spool.path_for(segment),
        }
    }
}

/// What happened to one WAL file of a batch.
#[derive(Debug)]
pub struct RestoreResult {
    pub segment: SegmentName,
    pub demand: Demand,
    /// For the demanded file the path PostgreSQL reads, for the others their spool entry.
    pub destination: Utf8PathBuf,
    pub outcome: Result<(), RestoreError>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

impl RestoreResult {
    pub fn elapsed(&self) -> TimeDelta {
        self.end_time - self.start_time
    }

    pub fn state(&self) -> SegmentState {
        match (&self.outcome, self.demand) {
            (Ok(()), _) => SegmentState::Succeeded,
            (Err(_), Demand::Demanded) => SegmentState::FailedHard,
            (Err(_), Demand::Speculative) => SegmentState::FailedSoft,
        }
    }
}

/// The result of the demanded WAL file, the only one a caller has to act upon.
pub fn demanded_result(results: &[RestoreResult]) -> Option<&RestoreResult> {
    results.iter().find(|r| r.demand == Demand::Demanded)
}

/// Restores WAL files for one recovery session.
pub struct Restorer {
    cluster: ClusterIdentity,
    spool: Spool,
    fetcher: Arc<WalFetcher>,
    fetch_permits: Option<Arc<Semaphore>>,
    cancel: CancellationToken,
}

impl Restorer {
    /// Opens the spool and prepares the fetch tool invocation.
    ///
    /// In-flight fetch tools are killed once `cancel` fires.
    pub async fn new(config: &RestoreConfig, cancel: CancellationToken) -> anyhow::Result<Self> {
        let spool = Spool::open(&config.spool_directory)
            .await
            .inspect_err(|_| {
                info!(
                    spool_directory = %config.spool_directory,
                    "Cannot initialize the WAL spool"
                )
            })
            .context("while creating spool directory")?;

        Ok(Restorer {
            cluster: config.cluster.clone(),
            spool,
            fetcher: Arc::new(WalFetcher::new(
                &config.fetch_tool,
                config.fetch_environment(),
            )),
            fetch_permits: config
                .max_concurrent_fetches
                .map(|n| Arc::new(Semaphore::new(n.get()))),
            cancel,
        })
    }

    pub fn cluster(&self) -> &ClusterIdentity {
        &self.cluster
    }

    pub fn spool(&self) -> &Spool {
        &self.spool
    }

    /// Moves `segment` from the spool to `destination` if a previous prefetch brought it in.
    ///
    /// `Ok(false)` means it was not there and should be fetched from the archive.
    /// Never runs the fetch tool.
    pub async fn restore_from_spool(
        &self,
        segment: &SegmentName,
        destination: &Utf8Path,
    ) -> Result<bool, SpoolError> {
        match self.spool.claim(segment, destination).await? {
            Claim::Hit => Ok(true),
            Claim::Miss => Ok(false),
        }
    }

    /// Fetches every file of `batch` concurrently and waits for all of them.
    ///
    /// The demanded file goes to `destination`, the look-ahead ones into the spool.
    /// Results come back in batch order, whatever order the fetches complete in.
    pub async fn restore_list(
        &self,
        batch: &RestoreBatch,
        destination: &Utf8Path,
        options: &[String],
    ) -> Vec<RestoreResult> {
        let options: Arc<[String]> = options.into();

        let work = std::iter::once(WorkItem::Demanded {
            segment: batch.demanded().clone(),
            destination: destination.to_owned(),
        })
        .chain(
            batch
                .lookahead()
                .iter()
                .map(|segment| WorkItem::Speculative {
                    segment: segment.clone(),
                }),
        );

        let mut pending = Vec::with_capacity(batch.len());
        for item in work {
            let worker = FetchWorker {
                spool: self.spool.clone(),
                fetcher: Arc::clone(&self.fetcher),
                permits: self.fetch_permits.clone(),
                options: Arc::clone(&options),
                cancel: self.cancel.clone(),
            };
            let placeholder = (
                item.segment().clone(),
                item.demand(),
                item.destination(&self.spool),
            );
            let span = info_span!("restore_wal", cluster = %self.cluster, wal_name = %item.segment());
            pending.push((placeholder, tokio::spawn(worker.run(item).instrument(span))));
        }

        let (placeholders, handles): (Vec<_>, Vec<_>) = pending.into_iter().unzip();
        futures::future::join_all(handles)
            .await
            .into_iter()
            .zip(placeholders)
            .map(|(joined, (segment, demand, destination))| {
                joined.unwrap_or_else(|source| {
                    let now = Utc::now();
                    RestoreResult {
                        outcome: Err(RestoreError::TaskFailed {
                            segment: segment.clone(),
                            source,
                        }),
                        segment,
                        demand,
                        destination,
                        start_time: now,
                        end_time: now,
                    }
                })
            })
            .collect()
    }

    /// Fetches a single WAL file from the archive into `destination`.
    pub async fn restore(
        &self,
        segment: &SegmentName,
        destination: &Utf8Path,
        options: &[String],
    ) -> Result<(), FetchError> {
        self.fetcher
            .fetch(segment, destination, options, &self.cancel)
            .await
    }
}

/// Everything a spawned fetch needs, owned.
struct FetchWorker {
    spool: Spool,
    fetcher: Arc<WalFetcher>,
    permits: Option<Arc<Semaphore>>,
    options: Arc<[String]>,
    cancel: CancellationToken,
}

impl FetchWorker {
    async fn run(self, item: WorkItem) -> RestoreResult {
        let _permit = match &self.permits {
            Some(permits) => Arc::clone(permits).acquire_owned().await.ok(),
            None => None,
        };

        let destination = item.destination(&self.spool);
        let start_time = Utc::now();
        let outcome = match &item {
            WorkItem::Demanded {
                segment,
                destination,
            } => self
                .fetcher
                .fetch(segment, destination, &self.options, &self.cancel)
                .await
                .map_err(RestoreError::from),
            WorkItem::Speculative { segment } => self.prefetch(segment).await,
        };
        let end_time = Utc::now();

        let result = RestoreResult {
            segment: item.segment().clone(),
            demand: item.demand(),
            destination,
            outcome,
            start_time,
            end_time,
        };
        self.log_result(&result);
        result
    }

    /// Fetches into the staging file and publishes it in the spool on success.
    async fn prefetch(&self, segment: &SegmentName) -> Result<(), RestoreError> {
        let staging = self.spool.staging_path_for(segment);
        match self
            .fetcher
            .fetch(segment, &staging, &self.options, &self.cancel)
            .await
        {
            Ok(()) => Ok(self.spool.commit(segment).await?),
            Err(e) => {
                if let Err(discard_error) = self.spool.discard(segment).await {
                    debug!("{}", report_compact_sources(&discard_error));
                }
                Err(e.into())
            }
        }
    }

    fn log_result(&self, result: &RestoreResult) {
        let elapsed_wal_time = result.elapsed();
        match (&result.outcome, result.state()) {
            (Ok(()), _) => info!(
                wal_name = %result.segment,
                start_time = %result.start_time,
                end_time = %result.end_time,
                elapsed_wal_time = %elapsed_wal_time,
                "Restored WAL file"
            ),
            (Err(e), SegmentState::FailedHard) => warn!(
                wal_name = %result.segment,
                options = ?self.options,
                start_time = %result.start_time,
                end_time = %result.end_time,
                elapsed_wal_time = %elapsed_wal_time,
                error = %report_compact_sources(e),
                "Failed restoring WAL: PostgreSQL will retry if needed"
            ),
            // a look-ahead file past the archive head is not an error
            (Err(e), _) => debug!(
                wal_name = %result.segment,
                elapsed_wal_time = %elapsed_wal_time,
                error = %report_compact_sources(e),
                "Could not prefetch WAL file"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use camino_tempfile::Utf8TempDir;
    use tracing_test::traced_test;

    use super::*;

    /// Serves `$FAKE_ARCHIVE/<wal name>`, failing like the real tool for absent files.
    const FAKE_FETCH_TOOL: &str = r#"
if [ ! -f "$FAKE_ARCHIVE/$1" ]; then
    echo "WAL file $1 not found in the archive" >&2
    exit 1
fi
/bin/cp "$FAKE_ARCHIVE/$1" "$2"
"#;

    struct Fixture {
        dir: Utf8TempDir,
        restorer: Restorer,
        /// The fake tool runs as `/bin/sh <script>`.
        options: Vec<String>,
    }

    impl Fixture {
        /// Each archived file holds its own name.
        async fn with_archive(archived: &[&str]) -> Self {
            let dir = camino_tempfile::tempdir().unwrap();
            let archive = dir.path().join("archive");
            std::fs::create_dir(&archive).unwrap();
            for name in archived {
                std::fs::write(archive.join(name), name.as_bytes()).unwrap();
            }
            let script = dir.path().join("fake-wal-restore.sh");
            std::fs::write(&script, FAKE_FETCH_TOOL).unwrap();

            let mut config = RestoreConfig::new(dir.path().join("spool"));
            config.fetch_tool = Utf8PathBuf::from("/bin/sh");
            config.inherit_env = false;
            config
                .env
                .insert("FAKE_ARCHIVE".to_owned(), archive.into_string());
            let restorer = Restorer::new(&config, CancellationToken::new())
                .await
                .unwrap();

            Fixture {
                dir,
                restorer,
                options: vec![script.into_string()],
            }
        }

        fn destination(&self) -> Utf8PathBuf {
            self.dir.path().join("RECOVERYXLOG")
        }

        async fn restore_list(&self, demanded: &str, lookahead: &[&str]) -> Vec<SegmentState> {
            let batch = RestoreBatch::new(
                segment(demanded),
                lookahead.iter().map(|name| segment(name)),
            );
            self.restorer
                .restore_list(&batch, &self.destination(), &self.options)
                .await
                .iter()
                .map(RestoreResult::state)
                .collect()
        }
    }

    fn segment(name: &str) -> SegmentName {
        SegmentName::parse(name).unwrap()
    }

    fn names<'a>(segments: impl Iterator<Item = &'a SegmentName>) -> Vec<&'a str> {
        segments.map(SegmentName::as_str).collect()
    }

    #[test]
    fn batch_keeps_order_and_drops_duplicates() {
        let batch = RestoreBatch::new(
            segment("00000001000000000000004A"),
            [
                segment("00000001000000000000004B"),
                segment("00000001000000000000004A"),
                segment("00000001000000000000004C"),
                segment("00000001000000000000004B"),
            ],
        );

        assert_eq!(batch.len(), 3);
        assert!(!batch.is_empty());
        assert_eq!(batch.demanded().as_str(), "00000001000000000000004A");
        assert_eq!(
            names(batch.segments()),
            [
                "00000001000000000000004A",
                "00000001000000000000004B",
                "00000001000000000000004C"
            ]
        );
    }

    #[test]
    fn state_depends_on_demand_only() {
        let now = Utc::now();
        let failed = |demand| RestoreResult {
            segment: segment("00000001000000000000004A"),
            demand,
            destination: Utf8PathBuf::from("/somewhere"),
            outcome: Err(RestoreError::Fetch(FetchError::Cancelled {
                tool: "barman-cloud-wal-restore".to_owned(),
            })),
            start_time: now,
            end_time: now + TimeDelta::milliseconds(1500),
        };

        let hard = failed(Demand::Demanded);
        assert_eq!(hard.state(), SegmentState::FailedHard);
        assert_eq!(hard.elapsed(), TimeDelta::milliseconds(1500));
        assert_eq!(failed(Demand::Speculative).state(), SegmentState::FailedSoft);

        let ok = RestoreResult {
            outcome: Ok(()),
            ..failed(Demand::Speculative)
        };
        assert_eq!(ok.state(), SegmentState::Succeeded);

        let results = [ok, hard];
        assert_eq!(
            demanded_result(&results).map(|r| r.demand),
            Some(Demand::Demanded)
        );
        assert!(demanded_result(&results[..1]).is_none());
    }

    #[tokio::test]
    async fn single_restore_skips_the_spool() {
        let f = Fixture::with_archive(&["00000001000000000000004A"]).await;
        let wal = segment("00000001000000000000004A");

        f.restorer
            .restore(&wal, &f.destination(), &f.options)
            .await
            .unwrap();
        assert_eq!(
            std::fs::read(f.destination()).unwrap(),
            b"00000001000000000000004A"
        );
        assert!(!f.restorer.spool().contains(&wal).await.unwrap());

        let err = f
            .restorer
            .restore(
                &segment("00000001000000000000004B"),
                &f.dir.path().join("RECOVERYXLOG.2"),
                &f.options,
            )
            .await
            .unwrap_err();
        match err {
            FetchError::Exit { status, .. } => assert_eq!(status.code(), Some(1)),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    #[traced_test]
    async fn lookahead_failure_is_not_warned_about() {
        let f = Fixture::with_archive(&["00000001000000000000004A"]).await;

        let states = f
            .restore_list("00000001000000000000004A", &["00000001000000000000004B"])
            .await;

        assert_eq!(states, [SegmentState::Succeeded, SegmentState::FailedSoft]);
        assert!(logs_contain("Restored WAL file"));
        assert!(logs_contain("Could not prefetch WAL file"));
        assert!(!logs_contain("Failed restoring WAL"));
    }

    #[tokio::test]
    #[traced_test]
    async fn demanded_failure_is_warned_about() {
        let f = Fixture::with_archive(&["00000001000000000000004B"]).await;

        let states = f
            .restore_list("00000001000000000000004A", &["00000001000000000000004B"])
            .await;

        assert_eq!(states, [SegmentState::FailedHard, SegmentState::Succeeded]);
        assert!(logs_contain(
            "Failed restoring WAL: PostgreSQL will retry if needed"
        ));
        assert!(!logs_contain("Could not prefetch WAL file"));
    }

    #[tokio::test]
    async fn repeated_lookahead_names_yield_one_result() {
        let f = Fixture::with_archive(&["00000001000000000000004A", "00000001000000000000004B"])
            .await;

        let states = f
            .restore_list(
                "00000001000000000000004A",
                &[
                    "00000001000000000000004B",
                    "00000001000000000000004B",
                    "00000001000000000000004A",
                ],
            )
            .await;

        assert_eq!(states, [SegmentState::Succeeded, SegmentState::Succeeded]);
    }
}
