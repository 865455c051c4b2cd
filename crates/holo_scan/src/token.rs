//! Scan tokens: independently executable, serializable per-partition scans.
//!
//! A token captures everything a worker needs to run one partition's share of
//! a scan. The wire form is a versioned envelope around a JSON payload:
//!
//! ```text
//! "holo_scan.token:" | u16 format version (BE) | JSON payload | CRC32 of payload (BE)
//! ```

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::backend::{with_timeout, PartitionBackend};
use crate::bound::ScanBounds;
use crate::client::ScanClient;
use crate::config::ScanEngineConfig;
use crate::error::{Result, ScanError};
use crate::key::{decode_key, KeyRange};
use crate::predicate::Predicate;
use crate::read_mode::{ReadMode, ReplicaSelection, TimestampOracle};
use crate::scanner::Scanner;
use crate::schema::{ColumnSchema, Schema, TableMetadata};
use crate::spec::ScanSpecBuilder;

const TOKEN_MAGIC: &[u8] = b"holo_scan.token:";
const TOKEN_FORMAT_VERSION: u16 = 1;
const CHECKSUM_LEN: usize = 4;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct TokenPayload {
    table_id: u64,
    table_name: String,
    schema_version: u32,
    key_columns: Vec<ColumnSchema>,
    projected_columns: Vec<ColumnSchema>,
    predicates: Vec<Predicate>,
    bounds: ScanBounds,
    partition_id: u64,
    partition_range: KeyRange,
    /// Partition range clipped by bounds and key predicates.
    key_range: KeyRange,
    read_mode: ReadMode,
    snapshot_timestamp: Option<u64>,
    propagated_timestamp: Option<u64>,
    limit: Option<usize>,
    fault_tolerant: bool,
    selection: ReplicaSelection,
    cache_blocks: bool,
    batch_size_bytes: usize,
    timeout_ms: u64,
}

/// One partition's share of a scan.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanToken {
    payload: TokenPayload,
}

impl ScanToken {
    pub fn table_name(&self) -> &str {
        &self.payload.table_name
    }

    pub fn partition_id(&self) -> u64 {
        self.payload.partition_id
    }

    /// Key range this token scans: the partition clipped by bounds and predicates.
    pub fn key_range(&self) -> &KeyRange {
        &self.payload.key_range
    }

    pub fn read_mode(&self) -> ReadMode {
        self.payload.read_mode
    }

    pub fn snapshot_timestamp(&self) -> Option<u64> {
        self.payload.snapshot_timestamp
    }

    /// Encodes the token into its versioned, checksummed wire form.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let body = serde_json::to_vec(&self.payload).map_err(|err| {
            ScanError::invalid_argument(format!("failed to encode scan token: {err}"))
        })?;
        let mut out = Vec::with_capacity(TOKEN_MAGIC.len() + 2 + body.len() + CHECKSUM_LEN);
        out.extend_from_slice(TOKEN_MAGIC);
        out.extend_from_slice(&TOKEN_FORMAT_VERSION.to_be_bytes());
        out.extend_from_slice(&body);
        out.extend_from_slice(&crc32fast::hash(&body).to_be_bytes());
        Ok(out)
    }

    /// Decodes a token produced by [`ScanToken::serialize`].
    pub fn deserialize(bytes: &[u8]) -> Result<ScanToken> {
        let rest = bytes
            .strip_prefix(TOKEN_MAGIC)
            .ok_or_else(|| ScanError::incompatible_token("not a scan token"))?;
        if rest.len() < 2 + CHECKSUM_LEN {
            return Err(ScanError::incompatible_token("scan token is truncated"));
        }
        let (version, rest) = rest.split_at(2);
        let version = u16::from_be_bytes([version[0], version[1]]);
        if version != TOKEN_FORMAT_VERSION {
            return Err(ScanError::incompatible_token(format!(
                "unsupported scan token format version {version}, expected {TOKEN_FORMAT_VERSION}"
            )));
        }
        let (body, checksum) = rest.split_at(rest.len() - CHECKSUM_LEN);
        let expected = u32::from_be_bytes([checksum[0], checksum[1], checksum[2], checksum[3]]);
        if crc32fast::hash(body) != expected {
            return Err(ScanError::incompatible_token("scan token checksum mismatch"));
        }
        let payload: TokenPayload = serde_json::from_slice(body).map_err(|err| {
            ScanError::incompatible_token(format!("malformed scan token payload: {err}"))
        })?;
        Ok(ScanToken { payload })
    }

    /// Human readable summary with decoded key bounds.
    pub fn describe(&self) -> String {
        let key_schema = self
            .payload
            .key_columns
            .iter()
            .fold(Schema::builder(), |builder, column| {
                builder.add_column(column.clone().primary_key())
            })
            .build()
            .ok();
        let render = |key: &[u8], open: &str| -> String {
            if key.is_empty() {
                return open.to_string();
            }
            let decoded = key_schema
                .as_ref()
                .and_then(|schema| decode_key(schema, key).ok().map(|values| (schema, values)));
            match decoded {
                Some((schema, values)) => {
                    let parts = schema
                        .columns()
                        .iter()
                        .zip(values)
                        .map(|(column, value)| format!("{}={value}", column.name))
                        .collect::<Vec<_>>()
                        .join(", ");
                    format!("({parts})")
                }
                None => hex::encode(key),
            }
        };
        format!(
            "table={} partition={} range=[{}, {}) read_mode={}",
            self.payload.table_name,
            self.payload.partition_id,
            render(&self.payload.key_range.start, "<start>"),
            render(&self.payload.key_range.end, "<end>"),
            self.payload.read_mode,
        )
    }

    /// Rebuilds an executable scanner against the client's current table metadata.
    ///
    /// Fails with `IncompatibleToken` when the table was recreated or a column
    /// the token reads changed type or nullability.
    pub async fn into_scan(self, client: &ScanClient) -> Result<Scanner> {
        let table = client.table_metadata(&self.payload.table_name).await?;
        self.check_compatible(&table)?;
        if let Some(ts) = self
            .payload
            .propagated_timestamp
            .max(self.payload.snapshot_timestamp)
        {
            client.update_latest_observed_timestamp(ts);
        }
        let builder = self.rebuild_spec(Arc::new(table), client.config())?;
        Ok(Scanner::new(
            client.backend(),
            client.config().clone(),
            client.oracle().clone(),
            builder,
        ))
    }

    fn check_compatible(&self, table: &TableMetadata) -> Result<()> {
        if table.table_id != self.payload.table_id {
            return Err(ScanError::incompatible_token(format!(
                "table '{}' was recreated: token expects id {}, found {}",
                table.table_name, self.payload.table_id, table.table_id
            )));
        }
        let referenced = self
            .payload
            .key_columns
            .iter()
            .chain(self.payload.projected_columns.iter());
        for expected in referenced {
            let Some(current) = table.schema.column_by_name(&expected.name) else {
                return Err(ScanError::incompatible_token(format!(
                    "unknown column in scan token: {}",
                    expected.name
                )));
            };
            if current.column_type != expected.column_type {
                return Err(ScanError::incompatible_token(format!(
                    "invalid type {} for column '{}' in scan token, expected: {}",
                    current.column_type, expected.name, expected.column_type
                )));
            }
            if current.nullable != expected.nullable {
                let wanted = if expected.nullable {
                    "NULLABLE"
                } else {
                    "NOT NULL"
                };
                return Err(ScanError::incompatible_token(format!(
                    "invalid nullability for column '{}' in scan token, expected: {wanted}",
                    expected.name
                )));
            }
        }
        Ok(())
    }

    fn rebuild_spec(
        &self,
        table: Arc<TableMetadata>,
        config: &ScanEngineConfig,
    ) -> Result<ScanSpecBuilder> {
        let incompatible = |err: ScanError| ScanError::incompatible_token(err.to_string());
        let payload = &self.payload;
        let mut builder = ScanSpecBuilder::new(table, config);
        builder
            .set_projected_column_names(payload.projected_columns.iter().map(|c| c.name.clone()))
            .map_err(incompatible)?;
        for predicate in &payload.predicates {
            builder
                .add_predicate(predicate.clone())
                .map_err(incompatible)?;
        }
        builder
            .set_encoded_bounds(
                payload.bounds.lower().unwrap_or_default(),
                payload.bounds.upper_exclusive().unwrap_or_default(),
            )
            .map_err(incompatible)?;
        builder
            .restrict_to_partition(payload.partition_id, payload.partition_range.clone())
            .set_read_mode(payload.read_mode)
            .set_propagated_timestamp(payload.propagated_timestamp)
            .set_fault_tolerant(payload.fault_tolerant)
            .set_selection(payload.selection)
            .set_cache_blocks(payload.cache_blocks);
        if let Some(ts) = payload.snapshot_timestamp {
            builder.pin_snapshot_timestamp(ts);
        }
        if let Some(limit) = payload.limit {
            builder.set_limit(limit);
        }
        builder
            .set_batch_size_bytes(payload.batch_size_bytes)
            .map_err(incompatible)?;
        builder
            .set_timeout(Duration::from_millis(payload.timeout_ms.max(1)))
            .map_err(incompatible)?;
        Ok(builder)
    }
}

/// Splits one configured scan into per-partition tokens.
pub struct ScanTokenBuilder {
    backend: Arc<dyn PartitionBackend>,
    oracle: TimestampOracle,
    builder: ScanSpecBuilder,
}

impl ScanTokenBuilder {
    pub(crate) fn new(
        backend: Arc<dyn PartitionBackend>,
        oracle: TimestampOracle,
        builder: ScanSpecBuilder,
    ) -> Self {
        Self {
            backend,
            oracle,
            builder,
        }
    }

    /// Scan options shared by every produced token.
    pub fn configure(&mut self) -> &mut ScanSpecBuilder {
        &mut self.builder
    }

    /// Produces one token per partition intersecting the scan's key range.
    pub async fn build(&self) -> Result<Vec<ScanToken>> {
        let mut builder = self.builder.clone();
        let mut spec = builder.freeze()?;
        match spec.read_mode() {
            ReadMode::Snapshot if spec.snapshot_timestamp().is_none() => {
                // All tokens of one build read the same cut.
                let ts = self.backend.current_timestamp().await?;
                builder
                    .set_read_mode(ReadMode::Snapshot)
                    .pin_snapshot_timestamp(ts);
                spec = builder.freeze()?;
            }
            ReadMode::ReadYourWrites => {
                builder.set_propagated_timestamp(self.oracle.latest());
                spec = builder.freeze()?;
            }
            _ => {}
        }

        let table = spec.table();
        let range = spec.key_range().clone();
        if range.is_empty() {
            return Ok(Vec::new());
        }
        let key_columns = table.schema.key_columns().to_vec();
        let projected_columns = spec
            .projection()
            .iter()
            .filter_map(|idx| table.schema.column(*idx).cloned())
            .collect::<Vec<_>>();

        let mut tokens = Vec::new();
        let mut start = range.start.clone();
        loop {
            let Some(location) = with_timeout(
                spec.timeout(),
                None,
                self.backend.resolve_partition(&table.table_name, &start),
            )
            .await?
            else {
                break;
            };
            if !range.end.is_empty() && location.key_range.start >= range.end {
                break;
            }
            let clipped = KeyRange::new(start.clone(), range.end.clone()).intersect(&location.key_range);
            if !clipped.is_empty() {
                let payload = TokenPayload {
                    table_id: table.table_id,
                    table_name: table.table_name.clone(),
                    schema_version: table.schema_version,
                    key_columns: key_columns.clone(),
                    projected_columns: projected_columns.clone(),
                    predicates: spec.predicates().to_vec(),
                    bounds: spec.bounds().clone(),
                    partition_id: location.partition_id,
                    partition_range: location.key_range.clone(),
                    key_range: clipped,
                    read_mode: spec.read_mode(),
                    snapshot_timestamp: spec.snapshot_timestamp(),
                    propagated_timestamp: spec.propagated_timestamp(),
                    limit: spec.limit(),
                    fault_tolerant: spec.fault_tolerant(),
                    selection: spec.selection(),
                    cache_blocks: spec.cache_blocks(),
                    batch_size_bytes: spec.batch_size_bytes(),
                    timeout_ms: u64::try_from(spec.timeout().as_millis()).unwrap_or(u64::MAX),
                };
                tokens.push(ScanToken { payload });
            }
            let next = location.key_range.end;
            if next.is_empty() || (!range.end.is_empty() && next >= range.end) {
                break;
            }
            start = next;
        }
        debug!(
            table = %table.table_name,
            tokens = tokens.len(),
            range = %range,
            "built scan tokens"
        );
        Ok(tokens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ColumnType;

    fn token() -> ScanToken {
        let key = ColumnSchema::new("key", ColumnType::Int32).primary_key();
        ScanToken {
            payload: TokenPayload {
                table_id: 7,
                table_name: "t".to_string(),
                schema_version: 0,
                key_columns: vec![key.clone()],
                projected_columns: vec![key, ColumnSchema::new("a", ColumnType::String)],
                predicates: Vec::new(),
                bounds: ScanBounds::new(),
                partition_id: 3,
                partition_range: KeyRange::new(vec![0x80, 0, 0, 10], vec![0x80, 0, 0, 20]),
                key_range: KeyRange::new(vec![0x80, 0, 0, 10], vec![0x80, 0, 0, 20]),
                read_mode: ReadMode::Snapshot,
                snapshot_timestamp: Some(42),
                propagated_timestamp: None,
                limit: None,
                fault_tolerant: false,
                selection: ReplicaSelection::LeaderOnly,
                cache_blocks: true,
                batch_size_bytes: 1024,
                timeout_ms: 500,
            },
        }
    }

    #[test]
    fn wire_form_is_versioned_and_checksummed() {
        let bytes = token().serialize().expect("serialize");
        assert!(bytes.starts_with(TOKEN_MAGIC));
        assert_eq!(ScanToken::deserialize(&bytes).expect("deserialize"), token());

        let mut corrupted = bytes.clone();
        let idx = TOKEN_MAGIC.len() + 5;
        corrupted[idx] ^= 0x01;
        assert!(matches!(
            ScanToken::deserialize(&corrupted),
            Err(ScanError::IncompatibleToken { .. })
        ));

        let mut future = bytes.clone();
        future[TOKEN_MAGIC.len() + 1] = 9;
        assert!(matches!(
            ScanToken::deserialize(&future),
            Err(ScanError::IncompatibleToken { .. })
        ));

        assert!(ScanToken::deserialize(b"garbage").is_err());
    }

    #[test]
    fn describe_decodes_key_bounds() {
        assert_eq!(
            token().describe(),
            "table=t partition=3 range=[(key=10), (key=20)) read_mode=snapshot"
        );
    }

    #[test]
    fn compatibility_checks_report_the_offending_column() {
        let token = token();
        let table = |columns: Vec<ColumnSchema>, table_id: u64| TableMetadata {
            table_id,
            table_name: "t".to_string(),
            schema: columns
                .into_iter()
                .fold(Schema::builder(), |b, c| b.add_column(c))
                .build()
                .expect("schema"),
            schema_version: 1,
        };
        let key = ColumnSchema::new("key", ColumnType::Int32).primary_key();

        let missing = table(vec![key.clone()], 7);
        assert_eq!(
            token.check_compatible(&missing).expect_err("missing").to_string(),
            "incompatible scan token: unknown column in scan token: a"
        );

        let retyped = table(
            vec![key.clone(), ColumnSchema::new("a", ColumnType::Int64)],
            7,
        );
        assert_eq!(
            token.check_compatible(&retyped).expect_err("type").to_string(),
            "incompatible scan token: invalid type INT64 for column 'a' in scan token, expected: STRING"
        );

        let not_null = table(
            vec![
                key.clone(),
                ColumnSchema::new("a", ColumnType::String).nullable(false),
            ],
            7,
        );
        assert_eq!(
            token.check_compatible(&not_null).expect_err("nullability").to_string(),
            "incompatible scan token: invalid nullability for column 'a' in scan token, expected: NULLABLE"
        );

        let recreated = table(vec![key, ColumnSchema::new("a", ColumnType::String)], 8);
        assert!(token.check_compatible(&recreated).is_err());
    }
}
