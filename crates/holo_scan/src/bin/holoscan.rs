//! Diagnostic scanner over a seeded in-memory cluster.
//!
//! Seeds a partitioned table, then runs one scan (or a set of scan tokens on
//! concurrent tasks) with the requested filters, bounds and read options,
//! printing the rows followed by the scan's resource metrics.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use holo_scan::{
    ColumnSchema, ColumnType, FaultKind, MemoryCluster, PartialRow, Predicate, ReadMode,
    ReplicaSelection, ResultRow, ScanClient, ScanEngineConfig, ScanSpecBuilder, Schema, Table,
    Value,
};
use tracing_subscriber::EnvFilter;

const TABLE_NAME: &str = "holoscan_demo";

/// CLI options.
#[derive(Parser, Debug, Clone)]
#[command(name = "holoscan")]
struct Args {
    /// Rows seeded into the demo table (`key` = 0..rows).
    #[arg(long, default_value_t = 100)]
    rows: i32,

    /// Range partitions the table is split into.
    #[arg(long, default_value_t = 4)]
    partitions: i32,

    /// Servers in the simulated cluster.
    #[arg(long, default_value_t = 3)]
    servers: u64,

    /// Filter such as `key >= 10`, `string_val IS NOT NULL` or `key IN (2, 98)`. Repeatable.
    #[arg(long = "filter")]
    filters: Vec<String>,

    /// Inclusive lower bound on `key`.
    #[arg(long)]
    lower: Option<i32>,

    /// Exclusive upper bound on `key`.
    #[arg(long)]
    upper: Option<i32>,

    #[arg(long)]
    limit: Option<usize>,

    /// latest, snapshot or read_your_writes.
    #[arg(long, default_value = "latest")]
    read_mode: String,

    /// leader_only, closest_replica or first_replica.
    #[arg(long, default_value = "leader_only")]
    selection: String,

    #[arg(long, default_value_t = false)]
    fault_tolerant: bool,

    /// Fetch failures injected into the first partition after its first batch.
    #[arg(long, default_value_t = 0)]
    inject_failures: usize,

    /// Comma-separated projected columns; all columns when omitted.
    #[arg(long)]
    projection: Option<String>,

    #[arg(long, default_value_t = 256)]
    batch_size_bytes: usize,

    /// Run the scan as serialized tokens on concurrent tasks.
    #[arg(long, default_value_t = false)]
    tokens: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("holo_scan=info,warn")),
        )
        .init();
    let args = Args::parse();
    run(args).await
}

async fn run(args: Args) -> Result<()> {
    anyhow::ensure!(args.rows >= 0, "--rows must be >= 0");
    anyhow::ensure!(args.partitions > 0, "--partitions must be > 0");
    anyhow::ensure!(args.servers > 0, "--servers must be > 0");

    let cluster = Arc::new(MemoryCluster::new(args.servers));
    let last_write = seed_table(&cluster, &args)?;
    if args.inject_failures > 0 {
        let first = cluster
            .partition_ids(TABLE_NAME)?
            .first()
            .copied()
            .context("table has no partitions")?;
        cluster.inject_fetch_faults(
            TABLE_NAME,
            first,
            1,
            args.inject_failures,
            FaultKind::Unreachable,
        )?;
    }

    let client = ScanClient::new(cluster.clone(), ScanEngineConfig::from_env()?);
    client.update_latest_observed_timestamp(last_write);
    let table = client.open_table(TABLE_NAME).await?;

    if args.tokens {
        run_tokens(&client, &table, &args).await
    } else {
        run_scanner(&table, &args).await
    }
}

fn seed_table(cluster: &MemoryCluster, args: &Args) -> Result<u64> {
    let schema = Schema::builder()
        .add_column(ColumnSchema::new("key", ColumnType::Int32).primary_key())
        .add_column(ColumnSchema::new("int_val", ColumnType::Int32))
        .add_column(ColumnSchema::new("string_val", ColumnType::String))
        .build()?;
    let step = (args.rows / args.partitions).max(1);
    let splits = (1..args.partitions)
        .map(|idx| PartialRow::new().set("key", idx * step))
        .collect::<Vec<_>>();
    cluster.create_table(TABLE_NAME, schema, &splits, args.servers.min(3))?;

    let mut last_write = 0;
    for key in 0..args.rows {
        let string_val = if key % 2 == 0 {
            Value::from(format!("hello_{key}"))
        } else {
            Value::Null
        };
        last_write = cluster.insert(
            TABLE_NAME,
            vec![Value::Int32(key), Value::Int32(key * 2), string_val],
        )?;
    }
    Ok(last_write)
}

fn configure(table: &Table, builder: &mut ScanSpecBuilder, args: &Args) -> Result<()> {
    for filter in &args.filters {
        let predicate = parse_filter(table, filter)
            .with_context(|| format!("invalid --filter '{filter}'"))?;
        builder.add_predicate(predicate)?;
    }
    if let Some(lower) = args.lower {
        builder.set_lower_bound(&PartialRow::new().set("key", lower))?;
    }
    if let Some(upper) = args.upper {
        builder.set_exclusive_upper_bound(&PartialRow::new().set("key", upper))?;
    }
    if let Some(limit) = args.limit {
        builder.set_limit(limit);
    }
    if let Some(projection) = &args.projection {
        builder.set_projected_column_names(
            projection
                .split(',')
                .map(str::trim)
                .filter(|name| !name.is_empty()),
        )?;
    }
    builder
        .set_read_mode(args.read_mode.parse::<ReadMode>()?)
        .set_selection(args.selection.parse::<ReplicaSelection>()?)
        .set_fault_tolerant(args.fault_tolerant)
        .set_batch_size_bytes(args.batch_size_bytes)?;
    Ok(())
}

async fn run_scanner(table: &Table, args: &Args) -> Result<()> {
    let mut scanner = table.new_scanner();
    configure(table, scanner.configure()?, args)?;
    let rows = scanner.read_all().await?;
    for row in &rows {
        println!("{}", render_row(row));
    }
    println!("-- {} rows", rows.len());
    print!("{}", scanner.resource_metrics().render_text());
    let stats = scanner.stats();
    println!(
        "pages={} retries={} reroutes={} partitions={} duplicates_skipped={}",
        stats.rpc_pages,
        stats.retries,
        stats.reroutes,
        stats.partitions_visited,
        stats.duplicate_rows_skipped
    );
    Ok(())
}

async fn run_tokens(client: &ScanClient, table: &Table, args: &Args) -> Result<()> {
    let mut token_builder = table.new_scan_token_builder();
    configure(table, token_builder.configure(), args)?;
    let tokens = token_builder.build().await?;
    println!("-- {} tokens", tokens.len());

    let mut tasks = Vec::with_capacity(tokens.len());
    for token in tokens {
        println!("{}", token.describe());
        let bytes = token.serialize()?;
        let client = client.clone();
        tasks.push(tokio::spawn(async move {
            let mut scanner = client.deserialize_into_scanner(&bytes).await?;
            let rows = scanner.read_all().await?;
            let metrics = scanner.resource_metrics().get();
            anyhow::Ok((rows, metrics))
        }));
    }

    let mut rows = Vec::new();
    let mut totals = std::collections::BTreeMap::<String, u64>::new();
    for task in tasks {
        let (task_rows, metrics) = task.await.context("scan token task panicked")??;
        rows.extend(task_rows);
        for (name, value) in metrics {
            *totals.entry(name).or_insert(0) += value;
        }
    }
    rows.sort_by(|a, b| a.key().cmp(b.key()));
    for row in &rows {
        println!("{}", render_row(row));
    }
    println!("-- {} rows", rows.len());
    for (name, value) in totals {
        println!("{name}={value}");
    }
    Ok(())
}

fn render_row(row: &ResultRow) -> String {
    row.schema()
        .columns()
        .iter()
        .zip(row.values())
        .map(|(column, value)| format!("{}={value}", column.name))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Parses `col op literal`, `col IS [NOT] NULL` or `col IN (a, b, ..)`.
fn parse_filter(table: &Table, raw: &str) -> Result<Predicate> {
    let raw = raw.trim();
    let (name, rest) = raw
        .split_once(char::is_whitespace)
        .context("expected `<column> <operator> ...`")?;
    let column = table.column(name)?;
    let rest = rest.trim();
    let upper = rest.to_ascii_uppercase();

    if upper == "IS NULL" {
        return Ok(column.is_null());
    }
    if upper == "IS NOT NULL" {
        return Ok(column.is_not_null());
    }
    if upper.starts_with("IN ") || upper.starts_with("IN(") {
        let list = rest[2..]
            .trim()
            .strip_prefix('(')
            .and_then(|inner| inner.strip_suffix(')'))
            .context("expected `IN (a, b, ..)`")?;
        let values = list
            .split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(|item| parse_literal(column, item))
            .collect::<Result<Vec<_>>>()?;
        return Ok(column.in_list(values)?);
    }

    let (op, literal) = rest
        .split_once(char::is_whitespace)
        .context("expected `<column> <operator> <literal>`")?;
    let Some(op) = holo_scan::ComparisonOp::parse(op) else {
        bail!("unknown operator '{op}'");
    };
    let value = parse_literal(column, literal.trim())?;
    Ok(Predicate::comparison(column, op, value)?)
}

fn parse_literal(column: &ColumnSchema, raw: &str) -> Result<Value> {
    let unquoted = raw
        .strip_prefix('\'')
        .and_then(|inner| inner.strip_suffix('\''))
        .or_else(|| raw.strip_prefix('"').and_then(|inner| inner.strip_suffix('"')));
    if let Some(text) = unquoted {
        return Ok(Value::from(text));
    }
    let value = match column.column_type {
        ColumnType::Int8
        | ColumnType::Int16
        | ColumnType::Int32
        | ColumnType::Int64
        | ColumnType::UnixtimeMicros => Value::Int64(
            raw.parse::<i64>()
                .with_context(|| format!("invalid integer literal {raw}"))?,
        ),
        ColumnType::Float | ColumnType::Double => Value::Double(
            raw.parse::<f64>()
                .with_context(|| format!("invalid floating literal {raw}"))?,
        ),
        ColumnType::Bool => Value::Bool(
            raw.parse::<bool>()
                .with_context(|| format!("invalid boolean literal {raw}"))?,
        ),
        ColumnType::String | ColumnType::Binary => Value::from(raw),
    };
    Ok(value)
}
