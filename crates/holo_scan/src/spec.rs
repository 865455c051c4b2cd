//! Scan configuration surface and the frozen, immutable scan description.
//!
//! Every setter on [`ScanSpecBuilder`] validates its input against the table
//! schema and fails fast. [`ScanSpecBuilder::freeze`] performs the checks that
//! depend on several options together and produces a [`ScanSpec`] that never
//! changes afterwards.

use std::sync::Arc;
use std::time::Duration;

use crate::bound::ScanBounds;
use crate::config::ScanEngineConfig;
use crate::error::{Result, ScanError};
use crate::key::KeyRange;
use crate::predicate::{Predicate, PredicateSet};
use crate::read_mode::{ReadMode, ReplicaSelection};
use crate::row::PartialRow;
use crate::schema::{Schema, TableMetadata};

/// Requested output columns.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Projection {
    /// Every table column in declared order.
    #[default]
    All,
    Names(Vec<String>),
    Indexes(Vec<usize>),
}

impl Projection {
    /// Resolves the projection into table column indexes.
    pub fn resolve(&self, table: &TableMetadata) -> Result<Vec<usize>> {
        let schema = &table.schema;
        let indexes = match self {
            Self::All => (0..schema.len()).collect::<Vec<_>>(),
            Self::Names(names) => names
                .iter()
                .map(|name| {
                    schema
                        .find_column(name)
                        .ok_or_else(|| ScanError::UnknownColumn {
                            table: table.table_name.clone(),
                            column: name.clone(),
                        })
                })
                .collect::<Result<Vec<_>>>()?,
            Self::Indexes(indexes) => {
                if let Some(bad) = indexes.iter().find(|idx| **idx >= schema.len()) {
                    return Err(ScanError::invalid_projection(format!(
                        "column index {bad} out of range for {} columns",
                        schema.len()
                    )));
                }
                indexes.clone()
            }
        };
        for (pos, idx) in indexes.iter().enumerate() {
            if indexes[..pos].contains(idx) {
                let name = schema
                    .column(*idx)
                    .map(|column| column.name.as_str())
                    .unwrap_or_default();
                return Err(ScanError::invalid_projection(format!(
                    "column '{name}' projected more than once"
                )));
            }
        }
        Ok(indexes)
    }
}

/// Incremental scan configuration for one table.
#[derive(Debug, Clone)]
pub struct ScanSpecBuilder {
    table: Arc<TableMetadata>,
    predicates: PredicateSet,
    bounds: ScanBounds,
    projection: Projection,
    limit: Option<usize>,
    read_mode: ReadMode,
    snapshot_timestamp: Option<u64>,
    propagated_timestamp: Option<u64>,
    fault_tolerant: bool,
    selection: ReplicaSelection,
    cache_blocks: bool,
    batch_size_bytes: usize,
    timeout: Duration,
    partition: Option<(u64, KeyRange)>,
}

impl ScanSpecBuilder {
    pub(crate) fn new(table: Arc<TableMetadata>, config: &ScanEngineConfig) -> Self {
        Self {
            table,
            predicates: PredicateSet::new(),
            bounds: ScanBounds::new(),
            projection: Projection::All,
            limit: None,
            read_mode: ReadMode::Latest,
            snapshot_timestamp: None,
            propagated_timestamp: None,
            fault_tolerant: false,
            selection: ReplicaSelection::LeaderOnly,
            cache_blocks: true,
            batch_size_bytes: config.batch_size_bytes,
            timeout: config.rpc_timeout,
            partition: None,
        }
    }

    pub fn table(&self) -> &TableMetadata {
        &self.table
    }

    /// Adds one conjunctive predicate after checking it against the table schema.
    pub fn add_predicate(&mut self, predicate: Predicate) -> Result<&mut Self> {
        predicate.bind(&self.table.table_name, &self.table.schema)?;
        self.predicates = self.predicates.with(predicate);
        Ok(self)
    }

    /// Adds every predicate of a shared set; the set itself is left untouched.
    pub fn add_predicates(&mut self, predicates: &PredicateSet) -> Result<&mut Self> {
        predicates.compile(&self.table.table_name, &self.table.schema)?;
        for predicate in predicates.iter() {
            self.predicates = self.predicates.with(predicate.clone());
        }
        Ok(self)
    }

    /// Sets an inclusive lower bound from a partial primary-key row.
    pub fn set_lower_bound(&mut self, row: &PartialRow) -> Result<&mut Self> {
        let key = row.encode_as_key(&self.table.table_name, &self.table.schema)?;
        self.bounds.add_lower(key)?;
        Ok(self)
    }

    /// Sets an upper bound from a partial primary-key row.
    pub fn set_upper_bound(&mut self, row: &PartialRow, inclusive: bool) -> Result<&mut Self> {
        let key = row.encode_as_key(&self.table.table_name, &self.table.schema)?;
        self.bounds.add_upper(key, inclusive)?;
        Ok(self)
    }

    pub fn set_exclusive_upper_bound(&mut self, row: &PartialRow) -> Result<&mut Self> {
        self.set_upper_bound(row, false)
    }

    /// Sets bounds directly from encoded keys; empty keys leave a side open.
    pub fn set_encoded_bounds(&mut self, lower: &[u8], upper_exclusive: &[u8]) -> Result<&mut Self> {
        if !lower.is_empty() {
            self.bounds.add_lower(lower.to_vec())?;
        }
        if !upper_exclusive.is_empty() {
            self.bounds.add_upper(upper_exclusive.to_vec(), false)?;
        }
        Ok(self)
    }

    pub fn set_projected_column_names<I, S>(&mut self, names: I) -> Result<&mut Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let projection = Projection::Names(names.into_iter().map(Into::into).collect());
        projection.resolve(&self.table)?;
        self.projection = projection;
        Ok(self)
    }

    pub fn set_projected_column_indexes(&mut self, indexes: &[usize]) -> Result<&mut Self> {
        let projection = Projection::Indexes(indexes.to_vec());
        projection.resolve(&self.table)?;
        self.projection = projection;
        Ok(self)
    }

    pub fn set_read_mode(&mut self, read_mode: ReadMode) -> &mut Self {
        self.read_mode = read_mode;
        self
    }

    /// Pins a snapshot scan to `timestamp`; only valid with [`ReadMode::Snapshot`].
    pub fn set_snapshot_timestamp(&mut self, timestamp: u64) -> Result<&mut Self> {
        if timestamp == 0 {
            return Err(ScanError::invalid_argument(
                "snapshot timestamp must be positive",
            ));
        }
        self.snapshot_timestamp = Some(timestamp);
        Ok(self)
    }

    /// Caps total delivered rows across all partitions.
    pub fn set_limit(&mut self, limit: usize) -> &mut Self {
        self.limit = Some(limit);
        self
    }

    pub fn set_fault_tolerant(&mut self, fault_tolerant: bool) -> &mut Self {
        self.fault_tolerant = fault_tolerant;
        self
    }

    pub fn set_selection(&mut self, selection: ReplicaSelection) -> &mut Self {
        self.selection = selection;
        self
    }

    /// Backend caching hint; affects resource metrics only.
    pub fn set_cache_blocks(&mut self, cache_blocks: bool) -> &mut Self {
        self.cache_blocks = cache_blocks;
        self
    }

    pub fn set_batch_size_bytes(&mut self, batch_size_bytes: usize) -> Result<&mut Self> {
        if batch_size_bytes == 0 {
            return Err(ScanError::invalid_argument("batch size must be positive"));
        }
        self.batch_size_bytes = batch_size_bytes;
        Ok(self)
    }

    /// Per-RPC deadline.
    pub fn set_timeout(&mut self, timeout: Duration) -> Result<&mut Self> {
        if timeout.is_zero() {
            return Err(ScanError::invalid_argument("timeout must be positive"));
        }
        self.timeout = timeout;
        Ok(self)
    }

    /// Pins the snapshot cut chosen by the engine itself; a fresh cluster's cut is 0.
    pub(crate) fn pin_snapshot_timestamp(&mut self, timestamp: u64) -> &mut Self {
        self.snapshot_timestamp = Some(timestamp);
        self
    }

    pub(crate) fn set_propagated_timestamp(&mut self, timestamp: Option<u64>) -> &mut Self {
        self.propagated_timestamp = timestamp;
        self
    }

    /// Restricts the scan to one partition, as done for scan tokens.
    pub(crate) fn restrict_to_partition(&mut self, partition_id: u64, range: KeyRange) -> &mut Self {
        self.partition = Some((partition_id, range));
        self
    }

    /// Validates option combinations and produces the immutable spec.
    pub fn freeze(&self) -> Result<ScanSpec> {
        if self.snapshot_timestamp.is_some() && self.read_mode != ReadMode::Snapshot {
            return Err(ScanError::invalid_argument(format!(
                "a snapshot timestamp requires snapshot read mode, not {}",
                self.read_mode
            )));
        }
        // Fault-tolerant scans always resume on a pinned cut.
        let read_mode = if self.fault_tolerant && self.read_mode == ReadMode::Latest {
            ReadMode::Snapshot
        } else {
            self.read_mode
        };

        let projection = self.projection.resolve(&self.table)?;
        let projection_schema = Arc::new(self.table.schema.projected(&projection));
        self.predicates
            .compile(&self.table.table_name, &self.table.schema)?;

        let mut key_range = self
            .bounds
            .key_range()
            .intersect(&self.predicates.key_range(&self.table.schema)?);
        if let Some((_, partition_range)) = &self.partition {
            key_range = key_range.intersect(partition_range);
        }

        Ok(ScanSpec {
            table: self.table.clone(),
            predicates: self.predicates.clone(),
            bounds: self.bounds.clone(),
            key_range,
            projection,
            projection_schema,
            limit: self.limit,
            read_mode,
            snapshot_timestamp: self.snapshot_timestamp,
            propagated_timestamp: self.propagated_timestamp,
            fault_tolerant: self.fault_tolerant,
            selection: self.selection,
            cache_blocks: self.cache_blocks,
            batch_size_bytes: self.batch_size_bytes,
            timeout: self.timeout,
            partition_id: self.partition.as_ref().map(|(id, _)| *id),
        })
    }
}

/// Frozen scan configuration; shared read-only by an executor.
#[derive(Debug, Clone)]
pub struct ScanSpec {
    table: Arc<TableMetadata>,
    predicates: PredicateSet,
    bounds: ScanBounds,
    key_range: KeyRange,
    projection: Vec<usize>,
    projection_schema: Arc<Schema>,
    limit: Option<usize>,
    read_mode: ReadMode,
    snapshot_timestamp: Option<u64>,
    propagated_timestamp: Option<u64>,
    fault_tolerant: bool,
    selection: ReplicaSelection,
    cache_blocks: bool,
    batch_size_bytes: usize,
    timeout: Duration,
    partition_id: Option<u64>,
}

impl ScanSpec {
    pub fn table(&self) -> &TableMetadata {
        &self.table
    }

    pub fn predicates(&self) -> &PredicateSet {
        &self.predicates
    }

    pub fn bounds(&self) -> &ScanBounds {
        &self.bounds
    }

    /// Bounds intersected with the range implied by leading-key predicates.
    pub fn key_range(&self) -> &KeyRange {
        &self.key_range
    }

    /// Projected table column indexes, in emission order.
    pub fn projection(&self) -> &[usize] {
        &self.projection
    }

    pub fn projected_column_names(&self) -> Vec<String> {
        self.projection_schema
            .columns()
            .iter()
            .map(|column| column.name.clone())
            .collect()
    }

    pub fn projection_schema(&self) -> &Arc<Schema> {
        &self.projection_schema
    }

    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    pub fn read_mode(&self) -> ReadMode {
        self.read_mode
    }

    pub fn snapshot_timestamp(&self) -> Option<u64> {
        self.snapshot_timestamp
    }

    pub fn propagated_timestamp(&self) -> Option<u64> {
        self.propagated_timestamp
    }

    pub fn fault_tolerant(&self) -> bool {
        self.fault_tolerant
    }

    pub fn selection(&self) -> ReplicaSelection {
        self.selection
    }

    pub fn cache_blocks(&self) -> bool {
        self.cache_blocks
    }

    pub fn batch_size_bytes(&self) -> usize {
        self.batch_size_bytes
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Partition a token-derived scan is restricted to.
    pub fn partition_id(&self) -> Option<u64> {
        self.partition_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnSchema, ColumnType};

    fn builder() -> ScanSpecBuilder {
        let schema = Schema::builder()
            .add_column(ColumnSchema::new("key", ColumnType::Int32).primary_key())
            .add_column(ColumnSchema::new("int_val", ColumnType::Int32))
            .add_column(ColumnSchema::new("string_val", ColumnType::String))
            .build()
            .expect("schema");
        let table = Arc::new(TableMetadata {
            table_id: 1,
            table_name: "t".to_string(),
            schema,
            schema_version: 0,
        });
        ScanSpecBuilder::new(table, &ScanEngineConfig::default())
    }

    #[test]
    fn projection_validation_fails_fast() {
        let mut builder = builder();
        assert!(matches!(
            builder.set_projected_column_names(["missing"]),
            Err(ScanError::UnknownColumn { .. })
        ));
        assert!(matches!(
            builder.set_projected_column_indexes(&[0, 9]),
            Err(ScanError::InvalidProjection { .. })
        ));
        assert!(matches!(
            builder.set_projected_column_names(["key", "key"]),
            Err(ScanError::InvalidProjection { .. })
        ));
        builder
            .set_projected_column_names(["string_val", "key"])
            .expect("projection");
        let spec = builder.freeze().expect("spec");
        assert_eq!(spec.projection(), &[2, 0]);
        assert_eq!(spec.projected_column_names(), vec!["string_val", "key"]);
    }

    #[test]
    fn snapshot_timestamp_requires_snapshot_mode() {
        let mut builder = builder();
        builder.set_snapshot_timestamp(10).expect("timestamp");
        assert!(matches!(
            builder.freeze(),
            Err(ScanError::InvalidArgument { .. })
        ));
        builder.set_read_mode(ReadMode::Snapshot);
        assert_eq!(builder.freeze().expect("spec").snapshot_timestamp(), Some(10));
    }

    #[test]
    fn fault_tolerant_latest_upgrades_to_snapshot() {
        let mut builder = builder();
        builder.set_fault_tolerant(true);
        assert_eq!(builder.freeze().expect("spec").read_mode(), ReadMode::Snapshot);
    }

    #[test]
    fn bounds_reject_non_key_columns_and_inversion() {
        let mut builder = builder();
        assert!(matches!(
            builder.set_lower_bound(&PartialRow::new().set("int_val", 1)),
            Err(ScanError::InvalidBound { .. })
        ));
        builder
            .set_lower_bound(&PartialRow::new().set("key", 50))
            .expect("lower");
        assert!(matches!(
            builder.set_exclusive_upper_bound(&PartialRow::new().set("key", 10)),
            Err(ScanError::InvalidBound { .. })
        ));
    }

    #[test]
    fn predicates_from_other_tables_are_rejected() {
        let mut builder = builder();
        let foreign = ColumnSchema::new("other", ColumnType::Int64);
        let predicate = foreign.eq(1).expect("predicate");
        assert!(builder.add_predicate(predicate).is_err());
        assert!(builder.freeze().expect("spec").predicates().is_empty());
    }
}
