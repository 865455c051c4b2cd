//! Shared helpers for integration tests.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use holo_scan::{
    ColumnSchema, ColumnType, MemoryCluster, PartialRow, ResultRow, ScanClient, ScanEngineConfig,
    Schema, Table, Value,
};

pub const TABLE: &str = "scan_test";
pub const NUM_ROWS: i32 = 100;
pub const NUM_PARTITIONS: i32 = 4;
pub const NUM_SERVERS: u64 = 3;

/// Fast retries so recovery paths finish quickly.
pub fn test_config() -> ScanEngineConfig {
    ScanEngineConfig {
        batch_size_bytes: 1024 * 1024,
        rpc_timeout: Duration::from_secs(2),
        recovery_attempts: 5,
        retry_delay: Duration::from_millis(1),
        snapshot_wait_attempts: 3,
    }
}

/// A cluster holding one seeded table and a client bound to it.
pub struct TestHarness {
    pub cluster: Arc<MemoryCluster>,
    pub client: ScanClient,
    pub table: Table,
    /// Commit timestamp of the last seeded row.
    pub last_write: u64,
}

impl TestHarness {
    /// Seeds `key = 0..100` across four partitions split at 25/50/75.
    ///
    /// `int_val = key * 2`; `string_val = "hello_{key}"` for even keys, null for odd ones.
    pub async fn start() -> Result<Self> {
        Self::start_with(test_config()).await
    }

    pub async fn start_with(config: ScanEngineConfig) -> Result<Self> {
        let cluster = Arc::new(MemoryCluster::new(NUM_SERVERS));
        let schema = Schema::builder()
            .add_column(ColumnSchema::new("key", ColumnType::Int32).primary_key())
            .add_column(ColumnSchema::new("int_val", ColumnType::Int32).nullable(false))
            .add_column(ColumnSchema::new("string_val", ColumnType::String))
            .build()?;
        let step = NUM_ROWS / NUM_PARTITIONS;
        let splits = (1..NUM_PARTITIONS)
            .map(|idx| PartialRow::new().set("key", idx * step))
            .collect::<Vec<_>>();
        cluster.create_table(TABLE, schema, &splits, NUM_SERVERS)?;

        let mut last_write = 0;
        for key in 0..NUM_ROWS {
            last_write = cluster.insert(TABLE, seed_row(key))?;
        }

        let client = ScanClient::new(cluster.clone(), config);
        let table = client.open_table(TABLE).await?;
        Ok(Self {
            cluster,
            client,
            table,
            last_write,
        })
    }

    pub fn partition_ids(&self) -> Vec<u64> {
        self.cluster.partition_ids(TABLE).expect("partition ids")
    }

    /// Re-opens the table so the handle reflects schema changes.
    pub async fn reopen_table(&mut self) -> Result<()> {
        self.table = self.client.open_table(TABLE).await?;
        Ok(())
    }
}

pub fn seed_row(key: i32) -> Vec<Value> {
    let string_val = if key % 2 == 0 {
        Value::from(format!("hello_{key}"))
    } else {
        Value::Null
    };
    vec![Value::Int32(key), Value::Int32(key * 2), string_val]
}

/// Primary keys of the given rows, in delivery order.
pub fn keys(rows: &[ResultRow]) -> Vec<i32> {
    rows.iter()
        .map(|row| match row.get("key") {
            Some(Value::Int32(key)) => *key,
            other => panic!("row without int32 key: {other:?}"),
        })
        .collect()
}
