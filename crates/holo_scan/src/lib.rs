//! Distributed, predicate-pushdown, fault-tolerant table scans.
//!
//! A [`ScanClient`] wraps a [`backend::PartitionBackend`]. Tables opened
//! through it hand out [`Scanner`]s, which stream rows across partitions in
//! primary-key order and survive replica failures, and [`ScanTokenBuilder`]s,
//! which split one scan into per-partition [`ScanToken`]s that any worker can
//! execute.

pub mod backend;
pub mod batch;
pub mod bound;
pub mod client;
pub mod config;
pub mod error;
pub mod key;
pub mod metrics;
pub mod predicate;
pub mod read_mode;
pub mod row;
pub mod scanner;
pub mod schema;
pub mod spec;
pub mod token;
pub mod value;

pub use backend::memory::{FaultKind, MemoryCluster};
pub use backend::PartitionBackend;
pub use batch::{ResultRow, RowBatch};
pub use client::{ScanClient, Table};
pub use config::ScanEngineConfig;
pub use error::{BackendError, Result, ScanError};
pub use key::KeyRange;
pub use metrics::{ResourceMetrics, ScanStats};
pub use predicate::{ComparisonOp, Predicate, PredicateSet};
pub use read_mode::{ReadMode, ReplicaSelection, TimestampOracle};
pub use row::PartialRow;
pub use scanner::{ScanState, Scanner};
pub use schema::{ColumnSchema, ColumnType, Schema, TableMetadata};
pub use spec::{Projection, ScanSpec, ScanSpecBuilder};
pub use token::{ScanToken, ScanTokenBuilder};
pub use value::Value;
