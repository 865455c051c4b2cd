//! Client entry points: table handles, scanners, and token builders.

use std::sync::Arc;

use crate::backend::PartitionBackend;
use crate::config::ScanEngineConfig;
use crate::error::{Result, ScanError};
use crate::read_mode::TimestampOracle;
use crate::scanner::Scanner;
use crate::schema::{ColumnSchema, Schema, TableMetadata};
use crate::spec::ScanSpecBuilder;
use crate::token::{ScanToken, ScanTokenBuilder};

/// Shared handle to a partitioned backend.
///
/// Clones share the backend and the latest observed timestamp.
#[derive(Clone)]
pub struct ScanClient {
    backend: Arc<dyn PartitionBackend>,
    config: ScanEngineConfig,
    oracle: TimestampOracle,
}

impl std::fmt::Debug for ScanClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanClient")
            .field("config", &self.config)
            .field("latest_observed_timestamp", &self.oracle.latest())
            .finish()
    }
}

impl ScanClient {
    pub fn new(backend: Arc<dyn PartitionBackend>, config: ScanEngineConfig) -> Self {
        Self {
            backend,
            config,
            oracle: TimestampOracle::new(),
        }
    }

    pub fn config(&self) -> &ScanEngineConfig {
        &self.config
    }

    pub fn backend(&self) -> Arc<dyn PartitionBackend> {
        self.backend.clone()
    }

    pub fn oracle(&self) -> &TimestampOracle {
        &self.oracle
    }

    /// Latest timestamp this client has observed, from writes or completed scans.
    pub fn latest_observed_timestamp(&self) -> Option<u64> {
        self.oracle.latest()
    }

    /// Records a timestamp observed outside the client, typically a write acknowledgement.
    pub fn update_latest_observed_timestamp(&self, timestamp: u64) {
        self.oracle.observe(timestamp);
    }

    pub(crate) async fn table_metadata(&self, table: &str) -> Result<TableMetadata> {
        Ok(self.backend.table_metadata(table).await?)
    }

    /// Looks up a table and returns a handle bound to its current schema.
    pub async fn open_table(&self, name: &str) -> Result<Table> {
        let metadata = self.table_metadata(name).await?;
        Ok(Table {
            client: self.clone(),
            metadata: Arc::new(metadata),
        })
    }

    /// Decodes a serialized token and prepares it for execution.
    pub async fn deserialize_into_scanner(&self, bytes: &[u8]) -> Result<Scanner> {
        ScanToken::deserialize(bytes)?.into_scan(self).await
    }
}

/// A table as seen at the time it was opened.
#[derive(Debug, Clone)]
pub struct Table {
    client: ScanClient,
    metadata: Arc<TableMetadata>,
}

impl Table {
    pub fn name(&self) -> &str {
        &self.metadata.table_name
    }

    pub fn id(&self) -> u64 {
        self.metadata.table_id
    }

    pub fn schema(&self) -> &Schema {
        &self.metadata.schema
    }

    pub fn metadata(&self) -> &TableMetadata {
        &self.metadata
    }

    /// Column handle used to build predicates.
    pub fn column(&self, name: &str) -> Result<&ColumnSchema> {
        self.metadata
            .schema
            .column_by_name(name)
            .ok_or_else(|| ScanError::UnknownColumn {
                table: self.metadata.table_name.clone(),
                column: name.to_string(),
            })
    }

    /// Fresh scan options with the client's defaults.
    pub fn scan_spec_builder(&self) -> ScanSpecBuilder {
        ScanSpecBuilder::new(self.metadata.clone(), &self.client.config)
    }

    pub fn new_scanner(&self) -> Scanner {
        Scanner::new(
            self.client.backend(),
            self.client.config.clone(),
            self.client.oracle.clone(),
            self.scan_spec_builder(),
        )
    }

    /// Scanner with options prepared elsewhere; the builder must belong to this table.
    pub fn new_scanner_with(&self, builder: ScanSpecBuilder) -> Result<Scanner> {
        if builder.table().table_id != self.metadata.table_id {
            return Err(ScanError::invalid_argument(format!(
                "scan options were built for table '{}', not '{}'",
                builder.table().table_name,
                self.metadata.table_name
            )));
        }
        Ok(Scanner::new(
            self.client.backend(),
            self.client.config.clone(),
            self.client.oracle.clone(),
            builder,
        ))
    }

    pub fn new_scan_token_builder(&self) -> ScanTokenBuilder {
        ScanTokenBuilder::new(
            self.client.backend(),
            self.client.oracle.clone(),
            self.scan_spec_builder(),
        )
    }
}
