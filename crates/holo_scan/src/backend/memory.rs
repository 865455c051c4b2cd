//! In-process partitioned, replicated MVCC table store with fault injection.
//!
//! Every table keeps one versioned row map; partitions are key ranges over it
//! with a replica set spread across numbered servers. A logical clock stamps
//! every write, and snapshot reads at `t` see exactly the writes committed at
//! or before `t`.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Bound;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::backend::{
    FetchedBatch, OpenedScan, PartitionBackend, PartitionLocation, ReplicaInfo, ScanFragment,
};
use crate::error::{BackendError, ScanError};
use crate::key::{encode_key, KeyRange};
use crate::metrics::{BYTES_READ, CFILE_CACHE_HIT_BYTES, CFILE_CACHE_MISS_BYTES, ROWS_SCANNED};
use crate::predicate::{CompiledPredicates, PredicateSet};
use crate::read_mode::ReadMode;
use crate::row::{KeyedRow, PartialRow};
use crate::schema::{ColumnSchema, Schema, TableMetadata};
use crate::value::Value;

/// Failure returned by an injected fetch fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// The serving server drops the scan and reports itself unreachable.
    Unreachable,
    /// The server forgets the scan handle.
    ScannerExpired,
    /// The fetch hangs for the given duration before answering.
    Stall(Duration),
    /// A non-recoverable storage failure.
    Internal,
}

#[derive(Debug, Clone)]
struct FaultPlan {
    after_batches: u64,
    remaining: usize,
    kind: FaultKind,
}

#[derive(Debug, Clone)]
struct MemoryPartition {
    partition_id: u64,
    key_range: KeyRange,
    replicas: Vec<u64>,
    leader: u64,
    fetches_served: u64,
    fault: Option<FaultPlan>,
    /// Remaining opens that report the requested snapshot as not yet safe.
    snapshot_lag: usize,
}

/// One committed version; `None` marks a delete.
type Version = (u64, Option<BTreeMap<String, Value>>);

#[derive(Debug, Clone)]
struct MemoryTable {
    meta: TableMetadata,
    partitions: Vec<MemoryPartition>,
    rows: BTreeMap<Vec<u8>, Vec<Version>>,
    cached_keys: BTreeSet<Vec<u8>>,
}

impl MemoryTable {
    fn visible_row(&self, key: &[u8], read_ts: u64) -> Option<&BTreeMap<String, Value>> {
        self.rows
            .get(key)?
            .iter()
            .rev()
            .find(|(commit_ts, _)| *commit_ts <= read_ts)
            .and_then(|(_, row)| row.as_ref())
    }

    fn partition_mut(&mut self, partition_id: u64) -> Result<&mut MemoryPartition, BackendError> {
        self.partitions
            .iter_mut()
            .find(|partition| partition.partition_id == partition_id)
            .ok_or(BackendError::PartitionMoved {
                partition: partition_id,
            })
    }
}

#[derive(Debug, Clone)]
struct OpenScanState {
    table_name: String,
    table_id: u64,
    partition_id: u64,
    server: u64,
    schema: Schema,
    range: KeyRange,
    projection: Vec<usize>,
    predicates: CompiledPredicates,
    read_ts: u64,
    cache_blocks: bool,
    batch_size_bytes: usize,
    last_key: Option<Vec<u8>>,
}

#[derive(Debug)]
struct ClusterState {
    clock: u64,
    num_servers: u64,
    local_server: Option<u64>,
    next_table_id: u64,
    next_partition_id: u64,
    next_handle: u64,
    tables: BTreeMap<String, MemoryTable>,
    down: BTreeSet<u64>,
    scans: HashMap<u64, OpenScanState>,
    fetches_total: u64,
    /// Partition lookups still to be delayed, and by how long.
    lookup_stalls: (usize, Duration),
}

impl ClusterState {
    fn table(&self, name: &str) -> Result<&MemoryTable, BackendError> {
        self.tables
            .get(name)
            .ok_or_else(|| BackendError::TableNotFound {
                table: name.to_string(),
            })
    }

    fn table_mut(&mut self, name: &str) -> Result<&mut MemoryTable, BackendError> {
        self.tables
            .get_mut(name)
            .ok_or_else(|| BackendError::TableNotFound {
                table: name.to_string(),
            })
    }

    fn check_up(&self, server: u64) -> Result<(), BackendError> {
        if self.down.contains(&server) {
            return Err(BackendError::Unreachable { server });
        }
        Ok(())
    }

    fn new_partition(&mut self, key_range: KeyRange, ordinal: u64, replication: u64) -> MemoryPartition {
        let partition_id = self.next_partition_id;
        self.next_partition_id += 1;
        let replicas = (0..replication)
            .map(|r| (ordinal + r) % self.num_servers + 1)
            .collect::<Vec<_>>();
        let leader = replicas.first().copied().unwrap_or(1);
        MemoryPartition {
            partition_id,
            key_range,
            replicas,
            leader,
            fetches_served: 0,
            fault: None,
            snapshot_lag: 0,
        }
    }

    fn commit(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }
}

/// In-memory cluster implementing [`PartitionBackend`].
#[derive(Debug)]
pub struct MemoryCluster {
    state: Mutex<ClusterState>,
}

impl MemoryCluster {
    /// Creates a cluster with servers numbered `1..=num_servers`.
    pub fn new(num_servers: u64) -> Self {
        Self {
            state: Mutex::new(ClusterState {
                clock: 0,
                num_servers: num_servers.max(1),
                local_server: None,
                next_table_id: 1,
                next_partition_id: 1,
                next_handle: 1,
                tables: BTreeMap::new(),
                down: BTreeSet::new(),
                scans: HashMap::new(),
                fetches_total: 0,
                lookup_stalls: (0, Duration::ZERO),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ClusterState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Marks `server` as co-located with the client.
    pub fn set_local_server(&self, server: Option<u64>) {
        self.lock().local_server = server;
    }

    /// Creates a range-partitioned table split at `split_rows`.
    pub fn create_table(
        &self,
        name: &str,
        schema: Schema,
        split_rows: &[PartialRow],
        replication: u64,
    ) -> Result<TableMetadata, ScanError> {
        let mut splits = split_rows
            .iter()
            .map(|row| row.encode_as_key(name, &schema))
            .collect::<Result<Vec<_>, _>>()?;
        splits.sort();
        splits.dedup();
        splits.retain(|split| !split.is_empty());

        let mut state = self.lock();
        if state.tables.contains_key(name) {
            return Err(ScanError::invalid_argument(format!(
                "table '{name}' already exists"
            )));
        }
        let replication = replication.clamp(1, state.num_servers);
        let mut boundaries = vec![Vec::new()];
        boundaries.extend(splits);
        let mut partitions = Vec::with_capacity(boundaries.len());
        for (ordinal, start) in boundaries.iter().enumerate() {
            let end = boundaries.get(ordinal + 1).cloned().unwrap_or_default();
            let partition =
                state.new_partition(KeyRange::new(start.clone(), end), ordinal as u64, replication);
            partitions.push(partition);
        }

        let meta = TableMetadata {
            table_id: state.next_table_id,
            table_name: name.to_string(),
            schema,
            schema_version: 0,
        };
        state.next_table_id += 1;
        state.tables.insert(
            name.to_string(),
            MemoryTable {
                meta: meta.clone(),
                partitions,
                rows: BTreeMap::new(),
                cached_keys: BTreeSet::new(),
            },
        );
        debug!(table = name, table_id = meta.table_id, "created table");
        Ok(meta)
    }

    pub fn drop_table(&self, name: &str) -> Result<(), BackendError> {
        let mut state = self.lock();
        state
            .tables
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| BackendError::TableNotFound {
                table: name.to_string(),
            })
    }

    fn write_row(&self, table: &str, row: Vec<Value>, upsert: bool) -> Result<u64, ScanError> {
        let mut state = self.lock();
        let clock = state.clock;
        let entry = state.table(table)?;
        let schema = &entry.meta.schema;
        if row.len() != schema.len() {
            return Err(ScanError::invalid_argument(format!(
                "row has {} values, table '{table}' has {} columns",
                row.len(),
                schema.len()
            )));
        }
        let mut cells = BTreeMap::new();
        for (column, value) in schema.columns().iter().zip(row) {
            if value.is_null() {
                if !column.nullable {
                    return Err(ScanError::invalid_argument(format!(
                        "column '{}' is not nullable",
                        column.name
                    )));
                }
                continue;
            }
            cells.insert(column.name.clone(), value.coerce_for(column)?);
        }
        let key_values = schema
            .key_columns()
            .iter()
            .map(|column| cells.get(&column.name).cloned().unwrap_or(Value::Null))
            .collect::<Vec<_>>();
        let key = encode_key(schema, &key_values)?;
        if !upsert && entry.visible_row(&key, clock).is_some() {
            return Err(ScanError::invalid_argument(format!(
                "key {} already present in table '{table}'",
                hex::encode(&key)
            )));
        }

        let commit_ts = state.commit();
        let entry = state.table_mut(table)?;
        entry
            .rows
            .entry(key)
            .or_default()
            .push((commit_ts, Some(cells)));
        Ok(commit_ts)
    }

    /// Inserts a full row in table column order and returns its commit timestamp.
    pub fn insert(&self, table: &str, row: Vec<Value>) -> Result<u64, ScanError> {
        self.write_row(table, row, false)
    }

    pub fn upsert(&self, table: &str, row: Vec<Value>) -> Result<u64, ScanError> {
        self.write_row(table, row, true)
    }

    /// Deletes the row with the given primary key, returning the commit timestamp.
    pub fn delete(&self, table: &str, key_values: &[Value]) -> Result<u64, ScanError> {
        let mut state = self.lock();
        let clock = state.clock;
        let entry = state.table(table)?;
        let schema = &entry.meta.schema;
        let coerced = schema
            .key_columns()
            .iter()
            .zip(key_values)
            .map(|(column, value)| value.coerce_for(column))
            .collect::<Result<Vec<_>, _>>()?;
        let key = encode_key(schema, &coerced)?;
        if entry.visible_row(&key, clock).is_none() {
            return Err(ScanError::invalid_argument(format!(
                "key {} not found in table '{table}'",
                hex::encode(&key)
            )));
        }
        let commit_ts = state.commit();
        state
            .table_mut(table)?
            .rows
            .entry(key)
            .or_default()
            .push((commit_ts, None));
        Ok(commit_ts)
    }

    /// Partition ids of `table` in key order.
    pub fn partition_ids(&self, table: &str) -> Result<Vec<u64>, BackendError> {
        let state = self.lock();
        Ok(state
            .table(table)?
            .partitions
            .iter()
            .map(|partition| partition.partition_id)
            .collect())
    }

    /// Servers hosting a partition, leader first.
    pub fn partition_servers(&self, table: &str, partition_id: u64) -> Result<Vec<u64>, BackendError> {
        let mut state = self.lock();
        let partition = state.table_mut(table)?.partition_mut(partition_id)?;
        let mut servers = vec![partition.leader];
        servers.extend(
            partition
                .replicas
                .iter()
                .copied()
                .filter(|server| *server != partition.leader),
        );
        Ok(servers)
    }

    /// Fails the next `failures` fetches of a partition once `after_batches` fetches succeeded.
    pub fn inject_fetch_faults(
        &self,
        table: &str,
        partition_id: u64,
        after_batches: u64,
        failures: usize,
        kind: FaultKind,
    ) -> Result<(), BackendError> {
        let mut state = self.lock();
        let partition = state.table_mut(table)?.partition_mut(partition_id)?;
        partition.fault = Some(FaultPlan {
            after_batches: partition.fetches_served.saturating_add(after_batches),
            remaining: failures,
            kind,
        });
        Ok(())
    }

    /// Delays the next `lookups` partition resolutions by `delay`.
    pub fn stall_lookups(&self, lookups: usize, delay: Duration) {
        self.lock().lookup_stalls = (lookups, delay);
    }

    /// Makes the next `opens` snapshot opens of a partition report the timestamp as unsafe.
    pub fn delay_snapshot(&self, table: &str, partition_id: u64, opens: usize) -> Result<(), BackendError> {
        let mut state = self.lock();
        state.table_mut(table)?.partition_mut(partition_id)?.snapshot_lag = opens;
        Ok(())
    }

    /// Takes a server down or brings it back; going down drops its open scans.
    pub fn set_server_down(&self, server: u64, down: bool) {
        let mut state = self.lock();
        if down {
            state.down.insert(server);
            state.scans.retain(|_, scan| scan.server != server);
        } else {
            state.down.remove(&server);
        }
    }

    pub fn transfer_leadership(
        &self,
        table: &str,
        partition_id: u64,
        new_leader: u64,
    ) -> Result<(), BackendError> {
        let mut state = self.lock();
        let partition = state.table_mut(table)?.partition_mut(partition_id)?;
        if !partition.replicas.contains(&new_leader) {
            return Err(BackendError::Internal(format!(
                "server {new_leader} hosts no replica of partition {partition_id}"
            )));
        }
        partition.leader = new_leader;
        Ok(())
    }

    /// Splits the partition containing `split_row` into two new partitions.
    pub fn split_partition(&self, table: &str, split_row: &PartialRow) -> Result<(u64, u64), ScanError> {
        let mut state = self.lock();
        let schema = state.table(table)?.meta.schema.clone();
        let split_key = split_row.encode_as_key(table, &schema)?;
        let entry = state.table(table)?;
        let position = entry
            .partitions
            .iter()
            .position(|partition| partition.key_range.contains(&split_key))
            .ok_or_else(|| ScanError::invalid_argument("split key outside every partition"))?;
        let old = entry.partitions[position].clone();
        if old.key_range.start == split_key {
            return Err(ScanError::invalid_argument(
                "split key is already a partition boundary",
            ));
        }
        let replication = old.replicas.len() as u64;
        let ordinal = position as u64;
        let left = state.new_partition(
            KeyRange::new(old.key_range.start.clone(), split_key.clone()),
            ordinal,
            replication,
        );
        let right = state.new_partition(
            KeyRange::new(split_key, old.key_range.end.clone()),
            ordinal + 1,
            replication,
        );
        let ids = (left.partition_id, right.partition_id);
        let entry = state.table_mut(table)?;
        entry.partitions.splice(position..=position, [left, right]);
        debug!(table, old = old.partition_id, left = ids.0, right = ids.1, "split partition");
        Ok(ids)
    }

    /// Adds a trailing nullable column and bumps the schema version.
    pub fn add_column(&self, table: &str, column: ColumnSchema) -> Result<TableMetadata, ScanError> {
        let mut state = self.lock();
        let entry = state.table_mut(table)?;
        entry.meta.schema = entry.meta.schema.with_column(column)?;
        entry.meta.schema_version += 1;
        Ok(entry.meta.clone())
    }

    pub fn drop_column(&self, table: &str, name: &str) -> Result<TableMetadata, ScanError> {
        let mut state = self.lock();
        let entry = state.table_mut(table)?;
        entry.meta.schema = entry.meta.schema.without_column(name)?;
        entry.meta.schema_version += 1;
        for versions in entry.rows.values_mut() {
            for (_, row) in versions.iter_mut() {
                if let Some(cells) = row.as_mut() {
                    cells.remove(name);
                }
            }
        }
        Ok(entry.meta.clone())
    }

    /// Number of sub-scans the servers currently hold open.
    pub fn open_scan_count(&self) -> usize {
        self.lock().scans.len()
    }

    /// Successful fetches served since the cluster started.
    pub fn fetch_count(&self) -> u64 {
        self.lock().fetches_total
    }

    pub fn clock(&self) -> u64 {
        self.lock().clock
    }
}

fn fetch_rows(
    state: &mut ClusterState,
    handle: u64,
) -> Result<FetchedBatch, BackendError> {
    let scan = state
        .scans
        .get(&handle)
        .cloned()
        .ok_or(BackendError::ScannerExpired { handle })?;
    let entry = state
        .tables
        .get_mut(&scan.table_name)
        .filter(|entry| entry.meta.table_id == scan.table_id)
        .ok_or_else(|| BackendError::TableNotFound {
            table: scan.table_name.clone(),
        })?;

    let lower = match &scan.last_key {
        Some(last) => Bound::Excluded(last.clone()),
        None => Bound::Included(scan.range.start.clone()),
    };
    let mut rows = Vec::new();
    let mut batch_bytes = 0usize;
    let mut last_visited = None;
    let mut exhausted = true;
    let mut hit_bytes = 0u64;
    let mut miss_bytes = 0u64;
    let mut bytes_read = 0u64;
    let mut rows_scanned = 0u64;

    for (key, versions) in entry.rows.range((lower, Bound::Unbounded)) {
        if scan.range.is_past_end(key) {
            break;
        }
        if batch_bytes >= scan.batch_size_bytes {
            exhausted = false;
            break;
        }
        last_visited = Some(key.clone());
        let visible = versions
            .iter()
            .rev()
            .find(|(commit_ts, _)| *commit_ts <= scan.read_ts)
            .and_then(|(_, row)| row.as_ref());
        let Some(cells) = visible else {
            continue;
        };
        let full_row = scan
            .schema
            .columns()
            .iter()
            .map(|column| cells.get(&column.name).cloned().unwrap_or(Value::Null))
            .collect::<Vec<_>>();
        let size = full_row
            .iter()
            .map(Value::estimated_size)
            .sum::<usize>()
            .saturating_add(key.len()) as u64;
        rows_scanned += 1;
        bytes_read = bytes_read.saturating_add(size);
        if entry.cached_keys.contains(key) {
            hit_bytes = hit_bytes.saturating_add(size);
        } else {
            miss_bytes = miss_bytes.saturating_add(size);
            if scan.cache_blocks {
                entry.cached_keys.insert(key.clone());
            }
        }

        if !scan.predicates.matches(&full_row) {
            continue;
        }
        let values = scan
            .projection
            .iter()
            .map(|idx| full_row.get(*idx).cloned().unwrap_or(Value::Null))
            .collect::<Vec<_>>();
        let row = KeyedRow {
            key: key.clone(),
            values,
        };
        batch_bytes = batch_bytes.saturating_add(row.estimated_size());
        rows.push(row);
    }

    let metrics = BTreeMap::from([
        (CFILE_CACHE_HIT_BYTES.to_string(), hit_bytes),
        (CFILE_CACHE_MISS_BYTES.to_string(), miss_bytes),
        (BYTES_READ.to_string(), bytes_read),
        (ROWS_SCANNED.to_string(), rows_scanned),
    ]);
    if exhausted {
        state.scans.remove(&handle);
    } else if let Some(scan) = state.scans.get_mut(&handle) {
        scan.last_key = last_visited;
    }
    Ok(FetchedBatch {
        rows,
        last_batch: exhausted,
        metrics,
    })
}

#[async_trait]
impl PartitionBackend for MemoryCluster {
    async fn table_metadata(&self, table: &str) -> Result<TableMetadata, BackendError> {
        Ok(self.lock().table(table)?.meta.clone())
    }

    async fn resolve_partition(
        &self,
        table: &str,
        key: &[u8],
    ) -> Result<Option<PartitionLocation>, BackendError> {
        let stall = {
            let mut state = self.lock();
            let (remaining, delay) = state.lookup_stalls;
            (remaining > 0).then(|| {
                state.lookup_stalls.0 = remaining - 1;
                delay
            })
        };
        if let Some(delay) = stall {
            tokio::time::sleep(delay).await;
        }

        let state = self.lock();
        let entry = state.table(table)?;
        let found = entry.partitions.iter().find(|partition| {
            partition.key_range.contains(key)
                || (!key.is_empty() && partition.key_range.start.as_slice() > key)
        });
        Ok(found.map(|partition| PartitionLocation {
            partition_id: partition.partition_id,
            key_range: partition.key_range.clone(),
            replicas: partition
                .replicas
                .iter()
                .map(|server| ReplicaInfo {
                    server_id: *server,
                    is_leader: *server == partition.leader,
                    is_local: state.local_server == Some(*server),
                })
                .collect(),
        }))
    }

    async fn open_scan(
        &self,
        server: u64,
        fragment: &ScanFragment,
    ) -> Result<OpenedScan, BackendError> {
        let mut state = self.lock();
        state.check_up(server)?;
        let clock = state.clock;
        let entry = state
            .tables
            .get_mut(&fragment.table_name)
            .filter(|entry| entry.meta.table_id == fragment.table_id)
            .ok_or_else(|| BackendError::TableNotFound {
                table: fragment.table_name.clone(),
            })?;
        let schema = entry.meta.schema.clone();
        let table_name = entry.meta.table_name.clone();
        let partition = entry.partition_mut(fragment.partition_id)?;
        if !partition.replicas.contains(&server) {
            return Err(BackendError::PartitionMoved {
                partition: partition.partition_id,
            });
        }
        if fragment.leader_only && partition.leader != server {
            return Err(BackendError::NotLeader {
                server,
                partition: partition.partition_id,
            });
        }
        let within_start = fragment.key_range.start >= partition.key_range.start;
        let within_end = partition.key_range.end.is_empty()
            || (!fragment.key_range.end.is_empty()
                && fragment.key_range.end <= partition.key_range.end);
        if !within_start || !within_end {
            return Err(BackendError::PartitionMoved {
                partition: partition.partition_id,
            });
        }

        let (read_ts, snapshot_timestamp) = match fragment.read_mode {
            ReadMode::Latest => (clock, None),
            ReadMode::Snapshot | ReadMode::ReadYourWrites => {
                let requested = fragment
                    .snapshot_timestamp
                    .unwrap_or_else(|| clock.max(fragment.propagated_timestamp.unwrap_or(0)));
                if partition.snapshot_lag > 0 || requested > clock {
                    partition.snapshot_lag = partition.snapshot_lag.saturating_sub(1);
                    return Err(BackendError::SnapshotUnavailable {
                        partition: partition.partition_id,
                        requested,
                        safe_time: clock,
                    });
                }
                (requested, Some(requested))
            }
        };

        let bind_err = |err: ScanError| BackendError::Internal(err.to_string());
        let predicates = fragment
            .predicates
            .iter()
            .cloned()
            .collect::<PredicateSet>()
            .compile(&table_name, &schema)
            .map_err(bind_err)?;
        let projection = fragment
            .projection
            .iter()
            .map(|name| {
                schema.find_column(name).ok_or_else(|| {
                    BackendError::Internal(format!(
                        "unknown column '{name}' in table '{table_name}'"
                    ))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let handle = state.next_handle;
        state.next_handle += 1;
        state.scans.insert(
            handle,
            OpenScanState {
                table_name,
                table_id: fragment.table_id,
                partition_id: fragment.partition_id,
                server,
                schema,
                range: fragment.key_range.clone(),
                projection,
                predicates,
                read_ts,
                cache_blocks: fragment.cache_blocks,
                batch_size_bytes: fragment.batch_size_bytes.max(1),
                last_key: None,
            },
        );
        Ok(OpenedScan {
            handle,
            snapshot_timestamp,
        })
    }

    async fn fetch_batch(&self, server: u64, handle: u64) -> Result<FetchedBatch, BackendError> {
        let (stall, table_name, partition_id) = {
            let mut state = self.lock();
            state.check_up(server)?;
            let scan = state
                .scans
                .get(&handle)
                .cloned()
                .ok_or(BackendError::ScannerExpired { handle })?;
            let partition = state
                .tables
                .get_mut(&scan.table_name)
                .ok_or_else(|| BackendError::TableNotFound {
                    table: scan.table_name.clone(),
                })?
                .partition_mut(scan.partition_id);
            let partition = match partition {
                Ok(partition) => partition,
                Err(err) => {
                    state.scans.remove(&handle);
                    return Err(err);
                }
            };

            let mut stall = None;
            if let Some(plan) = partition.fault.as_mut() {
                if partition.fetches_served >= plan.after_batches && plan.remaining > 0 {
                    plan.remaining -= 1;
                    let kind = plan.kind;
                    match kind {
                        FaultKind::Stall(delay) => stall = Some(delay),
                        FaultKind::Unreachable => {
                            state.scans.remove(&handle);
                            return Err(BackendError::Unreachable { server });
                        }
                        FaultKind::ScannerExpired => {
                            state.scans.remove(&handle);
                            return Err(BackendError::ScannerExpired { handle });
                        }
                        FaultKind::Internal => {
                            return Err(BackendError::Internal(format!(
                                "injected storage failure on partition {}",
                                scan.partition_id
                            )));
                        }
                    }
                }
            }
            (stall, scan.table_name, scan.partition_id)
        };

        if let Some(delay) = stall {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.lock();
        state.check_up(server)?;
        let batch = fetch_rows(&mut state, handle)?;
        state.fetches_total += 1;
        if let Ok(partition) = state.table_mut(&table_name)?.partition_mut(partition_id) {
            partition.fetches_served += 1;
        }
        Ok(batch)
    }

    async fn close_scan(&self, server: u64, handle: u64) -> Result<(), BackendError> {
        let mut state = self.lock();
        state.check_up(server)?;
        state.scans.remove(&handle);
        Ok(())
    }

    async fn current_timestamp(&self) -> Result<u64, BackendError> {
        Ok(self.lock().clock)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ColumnType;

    fn cluster() -> (MemoryCluster, TableMetadata) {
        let cluster = MemoryCluster::new(3);
        let schema = Schema::builder()
            .add_column(ColumnSchema::new("key", ColumnType::Int32).primary_key())
            .add_column(ColumnSchema::new("v", ColumnType::String))
            .build()
            .expect("schema");
        let meta = cluster
            .create_table("t", schema, &[PartialRow::new().set("key", 10)], 3)
            .expect("table");
        (cluster, meta)
    }

    fn fragment(meta: &TableMetadata, partition_id: u64, range: KeyRange) -> ScanFragment {
        ScanFragment {
            table_id: meta.table_id,
            table_name: meta.table_name.clone(),
            partition_id,
            key_range: range,
            projection: vec!["key".to_string(), "v".to_string()],
            predicates: Vec::new(),
            leader_only: true,
            read_mode: ReadMode::Snapshot,
            snapshot_timestamp: None,
            propagated_timestamp: None,
            cache_blocks: true,
            batch_size_bytes: 1024,
        }
    }

    #[tokio::test]
    async fn snapshot_reads_see_only_earlier_commits() {
        let (cluster, meta) = cluster();
        let first = cluster
            .insert("t", vec![Value::Int32(1), Value::from("a")])
            .expect("insert");
        cluster
            .insert("t", vec![Value::Int32(2), Value::from("b")])
            .expect("insert");
        cluster.delete("t", &[Value::Int32(1)]).expect("delete");

        let location = cluster
            .resolve_partition("t", &[])
            .await
            .expect("resolve")
            .expect("partition");
        let mut at_first = fragment(&meta, location.partition_id, location.key_range.clone());
        at_first.snapshot_timestamp = Some(first);
        let opened = cluster.open_scan(1, &at_first).await.expect("open");
        let batch = cluster.fetch_batch(1, opened.handle).await.expect("fetch");
        assert_eq!(batch.rows.len(), 1);
        assert!(batch.last_batch);

        let latest = fragment(&meta, location.partition_id, location.key_range);
        let opened = cluster.open_scan(1, &latest).await.expect("open");
        assert_eq!(opened.snapshot_timestamp, Some(cluster.clock()));
        let batch = cluster.fetch_batch(1, opened.handle).await.expect("fetch");
        assert_eq!(batch.rows[0].values, vec![Value::Int32(2), Value::from("b")]);
    }

    #[tokio::test]
    async fn future_snapshots_are_unavailable() {
        let (cluster, meta) = cluster();
        let ids = cluster.partition_ids("t").expect("ids");
        let location = cluster
            .resolve_partition("t", &[])
            .await
            .expect("resolve")
            .expect("partition");
        let mut future = fragment(&meta, ids[0], location.key_range);
        future.snapshot_timestamp = Some(cluster.clock() + 5);
        let err = cluster.open_scan(1, &future).await.expect_err("unsafe");
        assert!(matches!(err, BackendError::SnapshotUnavailable { .. }));
    }

    #[tokio::test]
    async fn leader_only_opens_reject_followers_and_down_servers() {
        let (cluster, meta) = cluster();
        let ids = cluster.partition_ids("t").expect("ids");
        let servers = cluster.partition_servers("t", ids[0]).expect("servers");
        let location = cluster
            .resolve_partition("t", &[])
            .await
            .expect("resolve")
            .expect("partition");
        let frag = fragment(&meta, ids[0], location.key_range);
        let err = cluster.open_scan(servers[1], &frag).await.expect_err("follower");
        assert!(matches!(err, BackendError::NotLeader { .. }));

        cluster.set_server_down(servers[0], true);
        let err = cluster.open_scan(servers[0], &frag).await.expect_err("down");
        assert!(matches!(err, BackendError::Unreachable { .. }));
    }

    #[tokio::test]
    async fn split_moves_open_scans() {
        let (cluster, meta) = cluster();
        for key in 0..5 {
            cluster
                .insert("t", vec![Value::Int32(key), Value::Null])
                .expect("insert");
        }
        let location = cluster
            .resolve_partition("t", &[])
            .await
            .expect("resolve")
            .expect("partition");
        let mut frag = fragment(&meta, location.partition_id, location.key_range);
        frag.batch_size_bytes = 1;
        let opened = cluster.open_scan(1, &frag).await.expect("open");
        cluster.fetch_batch(1, opened.handle).await.expect("fetch");

        cluster
            .split_partition("t", &PartialRow::new().set("key", 3))
            .expect("split");
        let err = cluster
            .fetch_batch(1, opened.handle)
            .await
            .expect_err("moved");
        assert!(matches!(err, BackendError::PartitionMoved { .. }));
        assert_eq!(cluster.partition_ids("t").expect("ids").len(), 3);
        assert_eq!(cluster.open_scan_count(), 0);
    }
}
