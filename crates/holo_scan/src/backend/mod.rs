//! The partitioned backend consumed by the scan engine.
//!
//! The engine never talks to storage directly. It resolves partitions, opens
//! per-partition sub-scans on a chosen replica, and pulls batches through
//! [`PartitionBackend`]. [`memory::MemoryCluster`] is the in-process
//! implementation.

pub mod memory;

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::BackendError;
use crate::key::KeyRange;
use crate::predicate::Predicate;
use crate::read_mode::ReadMode;
use crate::row::KeyedRow;
use crate::schema::TableMetadata;

/// One replica of a partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaInfo {
    pub server_id: u64,
    pub is_leader: bool,
    /// Hosted on the same machine as the client.
    pub is_local: bool,
}

/// Current serving location of one partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionLocation {
    pub partition_id: u64,
    pub key_range: KeyRange,
    pub replicas: Vec<ReplicaInfo>,
}

/// The part of a scan one partition sub-scan must serve.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanFragment {
    pub table_id: u64,
    pub table_name: String,
    pub partition_id: u64,
    /// Already clipped to the partition and to the resume position.
    pub key_range: KeyRange,
    /// Columns returned for each row, in emission order.
    pub projection: Vec<String>,
    pub predicates: Vec<Predicate>,
    /// Only the partition leader may serve the scan.
    pub leader_only: bool,
    pub read_mode: ReadMode,
    /// Timestamp to read at; `None` lets the replica choose.
    pub snapshot_timestamp: Option<u64>,
    /// Lower bound for a replica-chosen snapshot timestamp.
    pub propagated_timestamp: Option<u64>,
    pub cache_blocks: bool,
    pub batch_size_bytes: usize,
}

/// Result of opening a sub-scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenedScan {
    pub handle: u64,
    /// Timestamp the replica reads at; `None` for latest reads.
    pub snapshot_timestamp: Option<u64>,
}

/// One batch pulled from an open sub-scan.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchedBatch {
    /// Matching rows in ascending key order.
    pub rows: Vec<KeyedRow>,
    pub last_batch: bool,
    /// Resource counters spent producing this batch.
    pub metrics: BTreeMap<String, u64>,
}

/// Partitioned, replicated table store.
#[async_trait]
pub trait PartitionBackend: Send + Sync {
    /// Returns current metadata for `table`.
    async fn table_metadata(&self, table: &str) -> Result<TableMetadata, BackendError>;

    /// Returns the partition containing `key`, or the first one after it.
    ///
    /// `None` means no partition of the table starts at or after `key`.
    async fn resolve_partition(
        &self,
        table: &str,
        key: &[u8],
    ) -> Result<Option<PartitionLocation>, BackendError>;

    /// Opens a sub-scan on `server`.
    async fn open_scan(
        &self,
        server: u64,
        fragment: &ScanFragment,
    ) -> Result<OpenedScan, BackendError>;

    async fn fetch_batch(&self, server: u64, handle: u64) -> Result<FetchedBatch, BackendError>;

    /// Releases a sub-scan; callers treat failures as best-effort.
    async fn close_scan(&self, server: u64, handle: u64) -> Result<(), BackendError>;

    /// Current cluster timestamp, used to pick snapshot cuts ahead of execution.
    async fn current_timestamp(&self) -> Result<u64, BackendError>;
}

/// Runs `call` under the per-RPC deadline.
///
/// `server` is `None` for partition lookups, which contact no replica.
pub(crate) async fn with_timeout<T>(
    timeout: Duration,
    server: Option<u64>,
    call: impl Future<Output = Result<T, BackendError>>,
) -> Result<T, BackendError> {
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(match server {
            Some(server) => BackendError::Timeout {
                server,
                elapsed: timeout,
            },
            None => BackendError::ResolveTimeout { elapsed: timeout },
        }),
    }
}
