//! Fault-tolerant scan executor.
//!
//! A [`Scanner`] walks the partitions intersecting its key range in key
//! order, pulling batches from one sub-scan at a time. The only authoritative
//! progress marker is the key of the last delivered row: after a partition or
//! replica failure the scanner re-resolves the partition and reopens a
//! sub-scan starting strictly after that key, so every row is delivered
//! exactly once and the row stream stays globally ordered.

use std::collections::{BTreeSet, VecDeque};
use std::fmt;
use std::sync::Arc;

use futures_util::stream::{self, Stream};
use tracing::{debug, info, info_span, warn, Instrument, Span};

use crate::backend::{with_timeout, PartitionBackend, PartitionLocation, ScanFragment};
use crate::batch::{ResultRow, RowBatch};
use crate::config::ScanEngineConfig;
use crate::error::{BackendError, Result, ScanError};
use crate::key::{immediate_successor, max_start_bound, KeyRange};
use crate::metrics::{ResourceMetrics, ScanStats};
use crate::read_mode::{ReadMode, ReplicaSelection, TimestampOracle};
use crate::row::KeyedRow;
use crate::schema::Schema;
use crate::spec::{ScanSpec, ScanSpecBuilder};

/// Lifecycle of one scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    Unopened,
    Opening,
    Streaming,
    Recovering,
    Exhausted,
    Failed,
}

impl fmt::Display for ScanState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unopened => "unopened",
            Self::Opening => "opening",
            Self::Streaming => "streaming",
            Self::Recovering => "recovering",
            Self::Exhausted => "exhausted",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Progress of the scan; owned by exactly one scanner.
#[derive(Debug, Default)]
struct ScanCursor {
    /// Key of the last row handed to the caller.
    last_key: Option<Vec<u8>>,
    /// Where the next partition resolution starts; `None` once every partition is done.
    next_start: Option<Vec<u8>>,
    partition_id: Option<u64>,
    batch_sequence: u64,
    snapshot_timestamp: Option<u64>,
    rows_delivered: usize,
}

impl ScanCursor {
    /// First key not yet delivered within a sub-scan starting at `start`.
    fn resume_key(&self, start: &[u8]) -> Vec<u8> {
        match &self.last_key {
            Some(last) => max_start_bound(start, &immediate_successor(last)),
            None => start.to_vec(),
        }
    }
}

/// The sub-scan currently being read.
#[derive(Debug)]
struct ActiveScan {
    location: PartitionLocation,
    server: u64,
    handle: u64,
    start: Vec<u8>,
}

/// Where a failure happened; fetch failures lose an open sub-scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailurePhase {
    Open,
    Fetch,
}

/// Executes one scan against a [`PartitionBackend`].
///
/// Configuration happens through [`Scanner::configure`] until [`Scanner::open`]
/// freezes it. A scanner is driven by one caller at a time.
pub struct Scanner {
    backend: Arc<dyn PartitionBackend>,
    config: ScanEngineConfig,
    oracle: TimestampOracle,
    builder: ScanSpecBuilder,
    spec: Option<ScanSpec>,
    state: ScanState,
    cursor: ScanCursor,
    active: Option<ActiveScan>,
    buffered: Option<RowBatch>,
    blacklist: BTreeSet<u64>,
    consecutive_failures: usize,
    snapshot_waits: usize,
    last_failed: Option<(u64, u64)>,
    failure: Option<ScanError>,
    metrics: ResourceMetrics,
    stats: ScanStats,
    span: Span,
}

impl fmt::Debug for Scanner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scanner")
            .field("table", &self.builder.table().table_name)
            .field("state", &self.state)
            .field("stats", &self.stats)
            .finish()
    }
}

impl Scanner {
    pub(crate) fn new(
        backend: Arc<dyn PartitionBackend>,
        config: ScanEngineConfig,
        oracle: TimestampOracle,
        builder: ScanSpecBuilder,
    ) -> Self {
        let span = info_span!("scan", table = %builder.table().table_name);
        Self {
            backend,
            config,
            oracle,
            builder,
            spec: None,
            state: ScanState::Unopened,
            cursor: ScanCursor::default(),
            active: None,
            buffered: None,
            blacklist: BTreeSet::new(),
            consecutive_failures: 0,
            snapshot_waits: 0,
            last_failed: None,
            failure: None,
            metrics: ResourceMetrics::new(),
            stats: ScanStats::default(),
            span,
        }
    }

    /// Gives access to the scan options; fails once the scanner has been opened.
    pub fn configure(&mut self) -> Result<&mut ScanSpecBuilder> {
        if self.state != ScanState::Unopened {
            return Err(ScanError::invalid_state(format!(
                "cannot change scan options of a {} scanner",
                self.state
            )));
        }
        Ok(&mut self.builder)
    }

    pub fn state(&self) -> ScanState {
        self.state
    }

    /// Counters accumulated from every fetched batch.
    pub fn resource_metrics(&self) -> &ResourceMetrics {
        &self.metrics
    }

    pub fn stats(&self) -> ScanStats {
        self.stats
    }

    /// Schema of emitted rows, in projection order.
    pub fn projection_schema(&self) -> Result<Arc<Schema>> {
        match &self.spec {
            Some(spec) => Ok(spec.projection_schema().clone()),
            None => Ok(self.builder.freeze()?.projection_schema().clone()),
        }
    }

    /// Timestamp every partition of this scan reads at, once pinned.
    pub fn snapshot_timestamp(&self) -> Option<u64> {
        self.cursor.snapshot_timestamp
    }

    /// Frozen spec; available after [`Scanner::open`].
    pub fn spec(&self) -> Option<&ScanSpec> {
        self.spec.as_ref()
    }

    /// Freezes the configuration and positions the scan on its first batch.
    pub async fn open(&mut self) -> Result<()> {
        if self.state != ScanState::Unopened {
            return Err(ScanError::invalid_state(format!(
                "scanner is already {}",
                self.state
            )));
        }
        let mut spec = self.builder.freeze()?;
        if spec.read_mode() == ReadMode::ReadYourWrites {
            let propagated = self.oracle.latest().max(spec.propagated_timestamp());
            self.builder.set_propagated_timestamp(propagated);
            spec = self.builder.freeze()?;
        }
        let span = self.span.clone();
        self.open_inner(spec).instrument(span).await
    }

    async fn open_inner(&mut self, spec: ScanSpec) -> Result<()> {
        self.state = ScanState::Opening;
        self.cursor.snapshot_timestamp = spec.snapshot_timestamp();
        self.cursor.next_start = if spec.key_range().is_empty() {
            None
        } else {
            Some(spec.key_range().start.clone())
        };
        debug!(
            key_range = %spec.key_range(),
            predicates = %spec.predicates(),
            read_mode = %spec.read_mode(),
            fault_tolerant = spec.fault_tolerant(),
            "opening scan"
        );
        self.spec = Some(spec);

        match self.fetch_next().await {
            Ok(Some(batch)) => {
                self.buffered = Some(batch);
                self.state = ScanState::Streaming;
                Ok(())
            }
            Ok(None) => {
                self.finish();
                Ok(())
            }
            Err(err) => Err(self.fail(err).await),
        }
    }

    /// Returns whether another call to [`Scanner::next_batch`] may yield rows.
    pub fn has_more_rows(&self) -> bool {
        match self.state {
            ScanState::Streaming | ScanState::Recovering => {
                self.buffered.is_some()
                    || ((self.active.is_some() || self.cursor.next_start.is_some())
                        && !self.limit_reached())
            }
            _ => false,
        }
    }

    /// Returns the next ordered batch; empty once the scan is exhausted.
    pub async fn next_batch(&mut self) -> Result<RowBatch> {
        match self.state {
            ScanState::Unopened | ScanState::Opening => {
                return Err(ScanError::invalid_state("scanner has not been opened"))
            }
            ScanState::Failed => {
                let reason = self
                    .failure
                    .as_ref()
                    .map(ToString::to_string)
                    .unwrap_or_default();
                return Err(ScanError::invalid_state(format!(
                    "scanner failed and cannot continue: {reason}"
                )));
            }
            ScanState::Exhausted => return Ok(self.empty_batch()),
            ScanState::Streaming | ScanState::Recovering => {}
        }
        if let Some(batch) = self.buffered.take() {
            if !self.has_more_rows() {
                self.complete().await;
            }
            return Ok(batch);
        }

        let span = self.span.clone();
        match self.fetch_next().instrument(span).await {
            Ok(Some(batch)) => {
                if !self.has_more_rows() {
                    self.complete().await;
                }
                Ok(batch)
            }
            Ok(None) => {
                self.finish();
                Ok(self.empty_batch())
            }
            Err(err) => Err(self.fail(err).await),
        }
    }

    /// Drains the scan, opening it first when needed.
    pub async fn read_all(&mut self) -> Result<Vec<ResultRow>> {
        if self.state == ScanState::Unopened {
            self.open().await?;
        }
        let mut rows = Vec::new();
        while self.has_more_rows() {
            rows.extend(self.next_batch().await?);
        }
        Ok(rows)
    }

    /// Turns the scanner into a lazy, forward-only stream of rows.
    pub fn into_rows(self) -> impl Stream<Item = Result<ResultRow>> {
        stream::try_unfold((self, VecDeque::new()), |(scanner, pending)| {
            next_streamed_row(scanner, pending)
        })
    }

    /// Releases the current sub-scan and ends the scan.
    pub async fn close(&mut self) {
        if let Some(active) = self.active.take() {
            self.close_sub_scan(&active).await;
        }
        self.buffered = None;
        self.cursor.next_start = None;
        if !matches!(self.state, ScanState::Failed | ScanState::Exhausted) {
            self.finish();
        }
    }

    fn empty_batch(&self) -> RowBatch {
        let schema = self
            .spec
            .as_ref()
            .map(|spec| spec.projection_schema().clone())
            .unwrap_or_else(|| Arc::new(self.builder.table().schema.projected(&[])));
        RowBatch::empty(schema)
    }

    fn limit_reached(&self) -> bool {
        matches!(
            self.spec.as_ref().and_then(ScanSpec::limit),
            Some(limit) if self.cursor.rows_delivered >= limit
        )
    }

    /// Ends the scan, releasing a sub-scan left open by the row limit.
    async fn complete(&mut self) {
        if let Some(active) = self.active.take() {
            self.close_sub_scan(&active).await;
        }
        self.finish();
    }

    fn finish(&mut self) {
        if self.state == ScanState::Exhausted {
            return;
        }
        self.state = ScanState::Exhausted;
        if let Some(ts) = self.cursor.snapshot_timestamp {
            self.oracle.observe(ts);
        }
        info!(
            rows = self.stats.rows_delivered,
            pages = self.stats.rpc_pages,
            partitions = self.stats.partitions_visited,
            retries = self.stats.retries,
            reroutes = self.stats.reroutes,
            duplicates = self.stats.duplicate_rows_skipped,
            bytes = self.stats.bytes_scanned,
            "scan finished"
        );
    }

    async fn fail(&mut self, err: ScanError) -> ScanError {
        if let Some(active) = self.active.take() {
            self.close_sub_scan(&active).await;
        }
        self.state = ScanState::Failed;
        self.buffered = None;
        self.failure = Some(err.clone());
        warn!(error = %err, "scan failed");
        err
    }

    fn spec_ref(&self) -> Result<&ScanSpec> {
        self.spec
            .as_ref()
            .ok_or_else(|| ScanError::invalid_state("scanner has not been opened"))
    }

    /// Pulls until a non-empty batch is delivered or the scan runs out.
    async fn fetch_next(&mut self) -> Result<Option<RowBatch>> {
        loop {
            if self.limit_reached() {
                if let Some(active) = self.active.take() {
                    self.close_sub_scan(&active).await;
                }
                self.cursor.next_start = None;
                return Ok(None);
            }

            let Some(active) = self.active.as_ref() else {
                let Some(start) = self.cursor.next_start.clone() else {
                    return Ok(None);
                };
                self.open_partition(start).await?;
                continue;
            };

            let server = active.server;
            let handle = active.handle;
            let timeout = self.spec_ref()?.timeout();
            let fetched = with_timeout(
                timeout,
                Some(server),
                self.backend.fetch_batch(server, handle),
            )
            .await;
            match fetched {
                Ok(batch) => {
                    self.consecutive_failures = 0;
                    self.state = ScanState::Streaming;
                    self.metrics.merge(&batch.metrics);
                    let rows = self.accept_rows(batch.rows)?;
                    if batch.last_batch {
                        self.finish_partition();
                    }
                    if !rows.is_empty() {
                        let schema = self.spec_ref()?.projection_schema().clone();
                        return Ok(Some(RowBatch::new(schema, rows)));
                    }
                }
                Err(err) => self.recover(err, FailurePhase::Fetch).await?,
            }
        }
    }

    /// Applies duplicate suppression, range clipping and the row limit.
    fn accept_rows(&mut self, rows: Vec<KeyedRow>) -> Result<Vec<KeyedRow>> {
        let spec = self.spec_ref()?;
        let range_end = spec.key_range().end.clone();
        let limit = spec.limit();
        self.cursor.batch_sequence += 1;
        self.stats.rpc_pages += 1;

        let mut accepted = Vec::with_capacity(rows.len());
        for row in rows {
            self.stats.rows_scanned += 1;
            self.stats.bytes_scanned = self
                .stats
                .bytes_scanned
                .saturating_add(row.estimated_size() as u64);
            if matches!(&self.cursor.last_key, Some(last) if row.key <= *last) {
                self.stats.duplicate_rows_skipped += 1;
                continue;
            }
            if !range_end.is_empty() && row.key >= range_end {
                continue;
            }
            if matches!(limit, Some(limit) if self.cursor.rows_delivered >= limit) {
                break;
            }
            self.cursor.last_key = Some(row.key.clone());
            self.cursor.rows_delivered += 1;
            self.stats.rows_delivered += 1;
            accepted.push(row);
        }

        debug!(
            sequence = self.cursor.batch_sequence,
            partition = ?self.cursor.partition_id,
            rows = accepted.len(),
            resume_after = %self
                .cursor
                .last_key
                .as_deref()
                .map(hex::encode)
                .unwrap_or_default(),
            "scan batch"
        );
        Ok(accepted)
    }

    /// Moves the cursor past the partition whose sub-scan just completed.
    fn finish_partition(&mut self) {
        let Some(active) = self.active.take() else {
            return;
        };
        let range_end = self
            .spec
            .as_ref()
            .map(|spec| spec.key_range().end.clone())
            .unwrap_or_default();
        let partition_end = active.location.key_range.end;
        let more = !partition_end.is_empty()
            && (range_end.is_empty() || partition_end.as_slice() < range_end.as_slice());
        self.cursor.next_start = more.then_some(partition_end);
        debug!(
            partition = active.location.partition_id,
            more_partitions = more,
            "partition complete"
        );
    }

    /// Resolves the partition serving `start` and opens a sub-scan on it.
    async fn open_partition(&mut self, start: Vec<u8>) -> Result<()> {
        let spec = self.spec_ref()?.clone();
        let table_name = spec.table().table_name.clone();
        let resolved = with_timeout(
            spec.timeout(),
            None,
            self.backend.resolve_partition(&table_name, &start),
        )
        .await;
        let location = match resolved {
            Ok(Some(location)) => location,
            Ok(None) => {
                self.cursor.next_start = None;
                return Ok(());
            }
            Err(err) => return self.recover(err, FailurePhase::Open).await,
        };

        let range_end = &spec.key_range().end;
        if !range_end.is_empty() && location.key_range.start >= *range_end {
            self.cursor.next_start = None;
            return Ok(());
        }
        let fragment_range = KeyRange::new(start, range_end.clone()).intersect(&location.key_range);
        if fragment_range.is_empty() {
            self.cursor.next_start =
                (!location.key_range.end.is_empty()).then(|| location.key_range.end.clone());
            return Ok(());
        }

        let Some(replica) = spec.selection().select(&location.replicas, &self.blacklist) else {
            let err = BackendError::PartitionMoved {
                partition: location.partition_id,
            };
            return self.recover(err, FailurePhase::Open).await;
        };
        let server = replica.server_id;
        let fragment = ScanFragment {
            table_id: spec.table().table_id,
            table_name,
            partition_id: location.partition_id,
            key_range: fragment_range.clone(),
            projection: spec.projected_column_names(),
            predicates: spec.predicates().to_vec(),
            leader_only: spec.selection() == ReplicaSelection::LeaderOnly,
            read_mode: spec.read_mode(),
            snapshot_timestamp: self.cursor.snapshot_timestamp,
            propagated_timestamp: spec.propagated_timestamp(),
            cache_blocks: spec.cache_blocks(),
            batch_size_bytes: spec.batch_size_bytes(),
        };

        let opened = with_timeout(
            spec.timeout(),
            Some(server),
            self.backend.open_scan(server, &fragment),
        )
        .await;
        match opened {
            Ok(opened) => {
                if spec.read_mode().pins_timestamp() && self.cursor.snapshot_timestamp.is_none() {
                    self.cursor.snapshot_timestamp = opened.snapshot_timestamp;
                }
                if let Some((failed_partition, failed_server)) = self.last_failed.take() {
                    if failed_partition != location.partition_id || failed_server != server {
                        self.stats.reroutes += 1;
                    }
                }
                if self.cursor.partition_id != Some(location.partition_id) {
                    self.stats.partitions_visited += 1;
                }
                self.snapshot_waits = 0;
                self.cursor.partition_id = Some(location.partition_id);
                debug!(
                    partition = location.partition_id,
                    server,
                    handle = opened.handle,
                    range = %fragment_range,
                    snapshot = ?self.cursor.snapshot_timestamp,
                    "opened partition scan"
                );
                self.active = Some(ActiveScan {
                    location,
                    server,
                    handle: opened.handle,
                    start: fragment_range.start,
                });
                Ok(())
            }
            Err(err) => {
                self.last_failed = Some((location.partition_id, server));
                self.recover(err, FailurePhase::Open).await
            }
        }
    }

    /// Decides whether a backend failure can be survived and prepares the resume.
    async fn recover(&mut self, err: BackendError, phase: FailurePhase) -> Result<()> {
        let spec = self.spec_ref()?.clone();
        let table = spec.table().table_name.clone();
        let partition = self
            .active
            .as_ref()
            .map(|active| active.location.partition_id)
            .or(self.cursor.partition_id)
            .map(|id| id.to_string())
            .unwrap_or_else(|| "unknown".to_string());

        if let BackendError::SnapshotUnavailable {
            partition: snapshot_partition,
            requested,
            ..
        } = &err
        {
            self.snapshot_waits += 1;
            self.stats.snapshot_waits += 1;
            if self.snapshot_waits > self.config.snapshot_wait_attempts {
                return Err(ScanError::Consistency {
                    partition: snapshot_partition.to_string(),
                    timestamp: *requested,
                    attempts: self.snapshot_waits,
                });
            }
            debug!(
                partition = snapshot_partition,
                requested,
                attempt = self.snapshot_waits,
                "waiting for snapshot to become safe"
            );
            self.abandon_active(phase).await;
            tokio::time::sleep(self.config.retry_backoff(self.snapshot_waits - 1)).await;
            return Ok(());
        }

        if !err.is_recoverable() {
            return Err(ScanError::ScanFailed {
                table,
                partition,
                reason: err.to_string(),
            });
        }
        if phase == FailurePhase::Fetch && !spec.fault_tolerant() {
            return Err(ScanError::ScanFailed {
                table,
                partition,
                reason: err.to_string(),
            });
        }

        self.consecutive_failures += 1;
        self.stats.retries += 1;
        if self.consecutive_failures > self.config.recovery_attempts {
            return Err(ScanError::PartitionUnavailable {
                partition,
                reason: format!(
                    "gave up after {} attempts: {err}",
                    self.consecutive_failures
                ),
            });
        }
        if matches!(
            err,
            BackendError::Timeout { .. } | BackendError::Unreachable { .. }
        ) {
            if let Some(server) = err.server() {
                self.blacklist.insert(server);
            }
        }

        self.state = ScanState::Recovering;
        warn!(
            attempt = self.consecutive_failures,
            partition = %partition,
            error = %err,
            resume_after = %self
                .cursor
                .last_key
                .as_deref()
                .map(hex::encode)
                .unwrap_or_default(),
            "scan recovering"
        );
        self.abandon_active(phase).await;
        tokio::time::sleep(self.config.retry_backoff(self.consecutive_failures - 1)).await;
        Ok(())
    }

    /// Drops the failed sub-scan and rewinds the cursor to the resume key.
    async fn abandon_active(&mut self, phase: FailurePhase) {
        let Some(active) = self.active.take() else {
            return;
        };
        if phase == FailurePhase::Fetch {
            self.last_failed = Some((active.location.partition_id, active.server));
        }
        self.cursor.next_start = Some(self.cursor.resume_key(&active.start));
        self.close_sub_scan(&active).await;
    }

    async fn close_sub_scan(&self, active: &ActiveScan) {
        let timeout = self
            .spec
            .as_ref()
            .map(ScanSpec::timeout)
            .unwrap_or(self.config.rpc_timeout);
        if let Err(err) = with_timeout(
            timeout,
            Some(active.server),
            self.backend.close_scan(active.server, active.handle),
        )
        .await
        {
            warn!(
                server = active.server,
                handle = active.handle,
                error = %err,
                "best-effort scan close failed"
            );
        }
    }
}

async fn next_streamed_row(
    mut scanner: Scanner,
    mut pending: VecDeque<ResultRow>,
) -> Result<Option<(ResultRow, (Scanner, VecDeque<ResultRow>))>> {
    loop {
        if let Some(row) = pending.pop_front() {
            return Ok(Some((row, (scanner, pending))));
        }
        if scanner.state() == ScanState::Unopened {
            scanner.open().await?;
        }
        if !scanner.has_more_rows() {
            return Ok(None);
        }
        pending.extend(scanner.next_batch().await?);
    }
}
