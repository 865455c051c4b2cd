//! Scan tokens built on one client and executed elsewhere.

mod common;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use common::{keys, test_config, TestHarness, NUM_ROWS, TABLE};
use holo_scan::{
    BackendError, ColumnSchema, ColumnType, MemoryCluster, PartialRow, ReadMode, ScanClient,
    ScanError, ScanToken, Schema, Value,
};

async fn run_tokens(client: &ScanClient, tokens: &[ScanToken]) -> Result<Vec<i32>> {
    let mut all = Vec::new();
    for token in tokens {
        let bytes = token.serialize()?;
        let mut scanner = client.deserialize_into_scanner(&bytes).await?;
        all.extend(keys(&scanner.read_all().await?));
    }
    Ok(all)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn tokens_cover_the_table_once() -> Result<()> {
    let harness = TestHarness::start().await?;
    let tokens = harness.table.new_scan_token_builder().build().await?;
    assert_eq!(tokens.len(), 4);
    assert_eq!(
        tokens.iter().map(ScanToken::partition_id).collect::<Vec<_>>(),
        harness.partition_ids()
    );
    assert!(tokens.iter().all(|token| token.table_name() == TABLE));

    let token_keys = run_tokens(&harness.client, &tokens).await?;
    let direct = keys(&harness.table.new_scanner().read_all().await?);
    assert_eq!(token_keys, direct);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn tokens_are_pruned_by_key_predicates() -> Result<()> {
    let harness = TestHarness::start().await?;
    let key = harness.table.column("key")?;
    let string_val = harness.table.column("string_val")?;

    let mut builder = harness.table.new_scan_token_builder();
    builder
        .configure()
        .add_predicate(key.ge(30)?)?
        .add_predicate(key.lt(60)?)?
        .add_predicate(string_val.is_not_null())?
        .set_projected_column_names(["key"])?;
    let tokens = builder.build().await?;

    let ids = harness.partition_ids();
    assert_eq!(
        tokens.iter().map(ScanToken::partition_id).collect::<Vec<_>>(),
        vec![ids[1], ids[2]]
    );
    assert!(tokens[0].describe().contains("range=[(key=30), (key=50))"));
    assert!(tokens[1].describe().contains("range=[(key=50), (key=60))"));

    let token_keys = run_tokens(&harness.client, &tokens).await?;
    assert_eq!(token_keys, (30..60).step_by(2).collect::<Vec<_>>());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn contradictory_scans_produce_no_tokens() -> Result<()> {
    let harness = TestHarness::start().await?;
    let key = harness.table.column("key")?;

    let mut builder = harness.table.new_scan_token_builder();
    builder
        .configure()
        .add_predicate(key.eq(5)?)?
        .add_predicate(key.eq(6)?)?;
    assert!(builder.build().await?.is_empty());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn snapshot_tokens_share_one_cut() -> Result<()> {
    let harness = TestHarness::start().await?;
    let mut builder = harness.table.new_scan_token_builder();
    builder.configure().set_read_mode(ReadMode::Snapshot);
    let tokens = builder.build().await?;

    let timestamps = tokens
        .iter()
        .map(ScanToken::snapshot_timestamp)
        .collect::<BTreeSet<_>>();
    assert_eq!(timestamps, BTreeSet::from([Some(harness.last_write)]));

    harness
        .cluster
        .insert(TABLE, vec![Value::Int32(150), Value::Int32(300), Value::Null])?;

    // A fresh client learns the cut from the token itself.
    let worker = ScanClient::new(harness.cluster.clone(), test_config());
    assert_eq!(worker.latest_observed_timestamp(), None);
    let token_keys = run_tokens(&worker, &tokens).await?;
    assert_eq!(token_keys, (0..NUM_ROWS).collect::<Vec<_>>());
    assert!(worker.latest_observed_timestamp() >= Some(harness.last_write));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn snapshot_tokens_on_an_unwritten_table_match_a_direct_scan() -> Result<()> {
    let cluster = Arc::new(MemoryCluster::new(3));
    let schema = Schema::builder()
        .add_column(ColumnSchema::new("key", ColumnType::Int32).primary_key())
        .build()?;
    cluster.create_table("empty", schema, &[PartialRow::new().set("key", 10)], 3)?;
    assert_eq!(cluster.clock(), 0);

    let client = ScanClient::new(cluster.clone(), test_config());
    let table = client.open_table("empty").await?;

    let mut direct = table.new_scanner();
    direct.configure()?.set_read_mode(ReadMode::Snapshot);
    assert!(direct.read_all().await?.is_empty());

    let mut builder = table.new_scan_token_builder();
    builder.configure().set_read_mode(ReadMode::Snapshot);
    let tokens = builder.build().await?;
    assert_eq!(tokens.len(), 2);
    assert!(tokens
        .iter()
        .all(|token| token.snapshot_timestamp() == Some(0)));
    assert!(run_tokens(&client, &tokens).await?.is_empty());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn token_build_gives_up_on_a_stalled_partition_lookup() -> Result<()> {
    let harness = TestHarness::start().await?;
    harness.cluster.stall_lookups(1, Duration::from_millis(500));

    let mut builder = harness.table.new_scan_token_builder();
    builder
        .configure()
        .set_timeout(Duration::from_millis(50))?;
    let err = builder.build().await.expect_err("lookup deadline");
    assert!(
        matches!(err, ScanError::Backend(BackendError::ResolveTimeout { .. })),
        "{err}"
    );

    // The stall is spent; the next build succeeds.
    assert_eq!(builder.build().await?.len(), 4);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn tokens_execute_concurrently() -> Result<()> {
    let harness = TestHarness::start().await?;
    let mut builder = harness.table.new_scan_token_builder();
    builder
        .configure()
        .set_fault_tolerant(true)
        .set_batch_size_bytes(64)?;
    let tokens = builder.build().await?;
    assert!(tokens.iter().all(|token| token.read_mode() == ReadMode::Snapshot));

    let mut tasks = Vec::new();
    for token in &tokens {
        let bytes = token.serialize()?;
        let client = harness.client.clone();
        tasks.push(tokio::spawn(async move {
            let mut scanner = client.deserialize_into_scanner(&bytes).await?;
            let rows = scanner.read_all().await?;
            anyhow::Ok(keys(&rows))
        }));
    }

    let mut all = Vec::new();
    for task in tasks {
        all.extend(task.await.context("token task panicked")??);
    }
    all.sort_unstable();
    assert_eq!(all, (0..NUM_ROWS).collect::<Vec<_>>());
    assert_eq!(harness.cluster.open_scan_count(), 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn limit_applies_to_each_token() -> Result<()> {
    let harness = TestHarness::start().await?;
    let mut builder = harness.table.new_scan_token_builder();
    builder.configure().set_limit(3);
    let tokens = builder.build().await?;

    let token_keys = run_tokens(&harness.client, &tokens).await?;
    assert_eq!(
        token_keys,
        vec![0, 1, 2, 25, 26, 27, 50, 51, 52, 75, 76, 77]
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn dropped_column_makes_tokens_incompatible() -> Result<()> {
    let harness = TestHarness::start().await?;
    let tokens = harness.table.new_scan_token_builder().build().await?;
    let bytes = tokens[0].serialize()?;

    harness.cluster.drop_column(TABLE, "string_val")?;
    let err = harness
        .client
        .deserialize_into_scanner(&bytes)
        .await
        .expect_err("dropped column");
    assert!(matches!(err, ScanError::IncompatibleToken { .. }));
    assert_eq!(
        err.to_string(),
        "incompatible scan token: unknown column in scan token: string_val"
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn added_column_keeps_narrow_tokens_working() -> Result<()> {
    let mut harness = TestHarness::start().await?;
    let mut builder = harness.table.new_scan_token_builder();
    builder
        .configure()
        .set_projected_column_names(["key", "int_val"])?;
    let tokens = builder.build().await?;

    harness
        .cluster
        .add_column(TABLE, ColumnSchema::new("extra", ColumnType::Int64))?;
    harness.reopen_table().await?;
    assert!(harness.table.column("extra").is_ok());

    let token_keys = run_tokens(&harness.client, &tokens).await?;
    assert_eq!(token_keys, (0..NUM_ROWS).collect::<Vec<_>>());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn recreated_table_rejects_old_tokens() -> Result<()> {
    let harness = TestHarness::start().await?;
    let tokens = harness.table.new_scan_token_builder().build().await?;
    let bytes = tokens[0].serialize()?;

    let schema = harness.table.schema().clone();
    harness.cluster.drop_table(TABLE)?;
    harness.cluster.create_table(TABLE, schema, &[], 3)?;

    let err = harness
        .client
        .deserialize_into_scanner(&bytes)
        .await
        .expect_err("recreated table");
    assert!(matches!(err, ScanError::IncompatibleToken { .. }));
    assert!(err.to_string().contains("recreated"), "{err}");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn corrupted_tokens_are_rejected() -> Result<()> {
    let harness = TestHarness::start().await?;
    let tokens = harness.table.new_scan_token_builder().build().await?;
    let mut bytes = tokens[0].serialize()?;
    let last = bytes.len() - 1;
    bytes[last] ^= 0xff;

    let err = harness
        .client
        .deserialize_into_scanner(&bytes)
        .await
        .expect_err("checksum");
    assert!(matches!(err, ScanError::IncompatibleToken { .. }));

    let err = ScanToken::deserialize(&bytes[..10]).expect_err("truncated");
    assert!(matches!(err, ScanError::IncompatibleToken { .. }));
    Ok(())
}
