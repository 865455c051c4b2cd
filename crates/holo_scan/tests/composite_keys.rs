//! Scans over a `(host STRING, ts UNIXTIME_MICROS)` primary key.
//!
//! Host names include embedded zero bytes so the escaped string encoding and
//! leading-column pruning are exercised through the whole scan path.

mod common;

use std::sync::Arc;

use anyhow::Result;
use common::test_config;
use holo_scan::{
    ColumnSchema, ColumnType, FaultKind, MemoryCluster, PartialRow, ResultRow, ScanClient, Schema,
    Table, Value,
};

const METRICS: &str = "host_metrics";
const HOSTS: [&str; 6] = ["a", "a\u{0}z", "b", "b\u{0}x", "ba", "c"];
const TIMESTAMPS: [i64; 3] = [100, 200, 300];

struct MetricsTable {
    cluster: Arc<MemoryCluster>,
    table: Table,
}

/// Three partitions split at `(b, MIN)` and `(c, 200)`.
async fn metrics_table() -> Result<MetricsTable> {
    let cluster = Arc::new(MemoryCluster::new(3));
    let schema = Schema::builder()
        .add_column(ColumnSchema::new("host", ColumnType::String).primary_key())
        .add_column(ColumnSchema::new("ts", ColumnType::UnixtimeMicros).primary_key())
        .add_column(ColumnSchema::new("load", ColumnType::Int32))
        .build()?;
    let splits = [
        PartialRow::new().set("host", "b"),
        PartialRow::new()
            .set("host", "c")
            .set("ts", Value::UnixtimeMicros(200)),
    ];
    cluster.create_table(METRICS, schema, &splits, 3)?;

    let mut load = 0;
    for host in HOSTS {
        for ts in TIMESTAMPS {
            cluster.insert(
                METRICS,
                vec![Value::from(host), Value::UnixtimeMicros(ts), Value::Int32(load)],
            )?;
            load += 1;
        }
    }

    let client = ScanClient::new(cluster.clone(), test_config());
    let table = client.open_table(METRICS).await?;
    Ok(MetricsTable { cluster, table })
}

fn host_keys(rows: &[ResultRow]) -> Vec<(String, i64)> {
    rows.iter()
        .map(|row| match (row.get("host"), row.get("ts")) {
            (Some(Value::String(host)), Some(Value::UnixtimeMicros(ts))) => (host.clone(), *ts),
            other => panic!("row without a (host, ts) key: {other:?}"),
        })
        .collect()
}

fn expected(hosts: &[&str]) -> Vec<(String, i64)> {
    hosts
        .iter()
        .flat_map(|host| TIMESTAMPS.iter().map(move |ts| (host.to_string(), *ts)))
        .collect()
}

fn assert_ascending(keys: &[(String, i64)]) {
    assert!(
        keys.windows(2).all(|pair| pair[0] < pair[1]),
        "keys out of order: {keys:?}"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn full_scan_orders_escaped_strings() -> Result<()> {
    let metrics = metrics_table().await?;
    assert_eq!(metrics.cluster.partition_ids(METRICS)?.len(), 3);

    let mut scanner = metrics.table.new_scanner();
    let keys = host_keys(&scanner.read_all().await?);
    assert_ascending(&keys);
    assert_eq!(keys, expected(&HOSTS));
    assert_eq!(scanner.stats().partitions_visited, 3);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn leading_column_equality_skips_later_partitions() -> Result<()> {
    let metrics = metrics_table().await?;
    let host = metrics.table.column("host")?;

    let mut scanner = metrics.table.new_scanner();
    scanner.configure()?.add_predicate(host.eq("b")?)?;
    let keys = host_keys(&scanner.read_all().await?);

    assert_eq!(keys, expected(&["b"]));
    // The range stops short of the partition starting at ("c", 200).
    assert!(scanner.stats().partitions_visited < 3);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn leading_column_greater_than_skips_the_prefix() -> Result<()> {
    let metrics = metrics_table().await?;
    let host = metrics.table.column("host")?;

    let mut scanner = metrics.table.new_scanner();
    scanner.configure()?.add_predicate(host.gt("a")?)?;
    let keys = host_keys(&scanner.read_all().await?);

    assert_ascending(&keys);
    assert_eq!(keys, expected(&HOSTS[1..]));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn partial_row_bounds_fill_missing_key_columns() -> Result<()> {
    let metrics = metrics_table().await?;

    let mut scanner = metrics.table.new_scanner();
    scanner
        .configure()?
        .set_lower_bound(&PartialRow::new().set("host", "b"))?
        .set_exclusive_upper_bound(&PartialRow::new().set("host", "c"))?;
    let keys = host_keys(&scanner.read_all().await?);
    assert_eq!(keys, expected(&["b", "b\u{0}x", "ba"]));

    let mut scanner = metrics.table.new_scanner();
    scanner.configure()?.set_upper_bound(
        &PartialRow::new()
            .set("host", "c")
            .set("ts", Value::UnixtimeMicros(200)),
        true,
    )?;
    let keys = host_keys(&scanner.read_all().await?);
    let mut through_c = expected(&HOSTS[..5]);
    through_c.extend([("c".to_string(), 100), ("c".to_string(), 200)]);
    assert_eq!(keys, through_c);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fault_tolerant_scan_resumes_after_variable_length_keys() -> Result<()> {
    let metrics = metrics_table().await?;
    let ids = metrics.cluster.partition_ids(METRICS)?;
    // Each batch holds one row; the middle partition fails right after ("b\0x", 100).
    metrics
        .cluster
        .inject_fetch_faults(METRICS, ids[1], 4, 1, FaultKind::Unreachable)?;
    metrics
        .cluster
        .inject_fetch_faults(METRICS, ids[2], 1, 1, FaultKind::ScannerExpired)?;

    let mut scanner = metrics.table.new_scanner();
    scanner
        .configure()?
        .set_fault_tolerant(true)
        .set_batch_size_bytes(16)?;
    let keys = host_keys(&scanner.read_all().await?);

    assert_ascending(&keys);
    assert_eq!(keys, expected(&HOSTS));
    let stats = scanner.stats();
    assert_eq!(stats.retries, 2);
    assert_eq!(stats.duplicate_rows_skipped, 0);
    assert_eq!(metrics.cluster.open_scan_count(), 0);
    Ok(())
}
