//! Loader Service - Loads the flat Superstore orders export into the warehouse
//!
//! Responsibilities:
//! - Read the raw delimited orders file
//! - Derive the eight dimension tables with dense surrogate keys
//! - Collapse raw order lines into one fact row per (order, product) pair
//! - Repair missing Order IDs with unique placeholders
//! - Append all nine tables, constraint checks disabled for the run
//!
//! CRITICAL: This loader must be DETERMINISTIC
//! Same source file = same surrogate keys in the same order

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::Parser;
use serde::Deserialize;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgConnection;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::hash::Hash;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "loader", about = "Loads the flat orders export into the warehouse")]
struct Args {
    /// Path to the delimited orders export
    #[arg(long, default_value = "./data/train.csv")]
    input: PathBuf,

    /// Field delimiter of the input file (single ASCII character)
    #[arg(long, default_value = ",")]
    delimiter: char,

    /// Dry run - build every table in memory but don't touch the database
    #[arg(long, default_value = "false")]
    dry_run: bool,
}

/// The nine target tables, in load order.
const TABLES: [&str; 9] = [
    "dim_region",
    "dim_city",
    "dim_segment",
    "dim_customer",
    "dim_category",
    "dim_subcategory",
    "dim_product",
    "dim_orderdate",
    "fact_order",
];

// =============================================================================
// RAW SOURCE
// =============================================================================

/// One line of the raw orders export (Superstore column headers).
/// Extra columns in the file are ignored.
#[derive(Debug, Clone, Deserialize)]
struct RawRecord {
    #[serde(rename = "Order ID")]
    order_id: Option<String>,
    #[serde(rename = "Sales")]
    sales: f64,
    #[serde(rename = "Product Name")]
    product_name: String,
    #[serde(rename = "Category")]
    category: String,
    #[serde(rename = "Sub-Category")]
    subcategory: String,
    #[serde(rename = "Customer Name")]
    customer_name: String,
    #[serde(rename = "Segment")]
    segment: String,
    #[serde(rename = "City")]
    city: String,
    #[serde(rename = "State")]
    state: String,
    #[serde(rename = "Region")]
    region: String,
    #[serde(rename = "Order Date")]
    order_date: String,
}

/// Raw source outcome: an absent file is a legitimate, recoverable state.
#[derive(Debug)]
enum SourceData {
    Missing,
    Rows(Vec<RawRecord>),
}

/// Parse the delimited content into raw records.
/// Malformed lines are skipped with a warning, never fatal.
fn parse_records(content: &str, delimiter: u8) -> Vec<RawRecord> {
    // Spreadsheet tools like to prepend a UTF-8 BOM to exports
    let content = content.strip_prefix('\u{feff}').unwrap_or(content);

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(content.as_bytes());

    let mut records = Vec::new();
    for (line_num, result) in reader.deserialize().enumerate() {
        match result {
            Ok(record) => records.push(record),
            Err(e) => {
                eprintln!("Warning: skipping line {} due to error: {}", line_num + 2, e);
            }
        }
    }

    records
}

async fn read_source(path: &Path, delimiter: u8) -> Result<SourceData> {
    let content = match fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(SourceData::Missing),
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to read {}", path.display()));
        }
    };

    Ok(SourceData::Rows(parse_records(&content, delimiter)))
}

// =============================================================================
// RUN REPORT
// =============================================================================

/// Why one table load could not complete.
#[derive(Debug, Error)]
enum LoadError {
    #[error("unparseable Order Date '{value}' (expected day-first dd/mm/yyyy)")]
    BadOrderDate { value: String },
    #[error("{table} was not built, references cannot be resolved")]
    DimensionUnavailable { table: &'static str },
    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

/// Outcome of one of the nine table loads.
#[derive(Debug)]
enum StepStatus {
    Loaded { rows: usize },
    Skipped { reason: &'static str },
    Failed(LoadError),
}

#[derive(Debug)]
struct StepReport {
    table: &'static str,
    status: StepStatus,
}

/// Collected results of a full run. Every step records its outcome here;
/// the caller decides what a failure means for the process exit.
#[derive(Debug)]
struct RunReport {
    steps: Vec<StepReport>,
    source_rows: usize,
    repaired_order_ids: usize,
}

impl RunReport {
    fn new(source_rows: usize) -> Self {
        Self {
            steps: Vec::new(),
            source_rows,
            repaired_order_ids: 0,
        }
    }

    fn record(&mut self, table: &'static str, status: StepStatus) {
        match &status {
            StepStatus::Loaded { rows } => println!("{} complete ({} row(s))", table, rows),
            StepStatus::Skipped { reason } => println!("{} skipped: {}", table, reason),
            StepStatus::Failed(e) => eprintln!("{} failed: {}", table, e),
        }
        self.steps.push(StepReport { table, status });
    }

    fn failed_count(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| matches!(s.status, StepStatus::Failed(_)))
            .count()
    }

    fn print_summary(&self) {
        println!("\n=== Load Summary ===");
        println!("Source rows: {}", self.source_rows);
        if self.repaired_order_ids > 0 {
            println!("Repaired Order IDs: {}", self.repaired_order_ids);
        }
        for step in &self.steps {
            match &step.status {
                StepStatus::Loaded { rows } => {
                    println!("  {:<16} {} row(s)", step.table, rows)
                }
                StepStatus::Skipped { reason } => {
                    println!("  {:<16} skipped ({})", step.table, reason)
                }
                StepStatus::Failed(e) => println!("  {:<16} FAILED - {}", step.table, e),
            }
        }
        let failed = self.failed_count();
        if failed > 0 {
            println!("{} of {} step(s) failed", failed, self.steps.len());
        }
    }
}

// =============================================================================
// SURROGATE KEY INDEX
// =============================================================================

/// Natural-key -> surrogate-key index for one dimension.
///
/// First occurrence wins: registering an already-known key keeps the original
/// surrogate, so an ambiguous natural key (the same city name in two states)
/// always resolves to the first row that introduced it.
#[derive(Debug)]
struct KeyIndex<K: Eq + Hash> {
    map: HashMap<K, i64>,
}

impl<K: Eq + Hash> KeyIndex<K> {
    fn new() -> Self {
        Self { map: HashMap::new() }
    }

    fn insert_first(&mut self, key: K, id: i64) {
        self.map.entry(key).or_insert(id);
    }

    /// Look up the surrogate key; `None` when the natural key has no match.
    fn resolve(&self, key: &K) -> Option<i64> {
        self.map.get(key).copied()
    }
}

// =============================================================================
// DIMENSION BUILDER
// =============================================================================
// Each build projects the relevant raw columns, drops duplicate projected
// tuples in first-seen order, and assigns surrogate key = position + 1.
// Second-level dimensions resolve their reference through the index of the
// dimension built before them.

#[derive(Debug, Clone, PartialEq)]
struct RegionRow {
    region_id: i64,
    region_name: String,
}

#[derive(Debug)]
struct RegionTable {
    rows: Vec<RegionRow>,
    /// region name -> region_id
    index: KeyIndex<String>,
}

fn build_regions(records: &[RawRecord]) -> RegionTable {
    let mut rows = Vec::new();
    let mut index = KeyIndex::new();
    let mut seen = HashSet::new();
    for record in records {
        if !seen.insert(record.region.clone()) {
            continue;
        }
        let region_id = rows.len() as i64 + 1;
        index.insert_first(record.region.clone(), region_id);
        rows.push(RegionRow {
            region_id,
            region_name: record.region.clone(),
        });
    }
    RegionTable { rows, index }
}

#[derive(Debug, Clone, PartialEq)]
struct CityRow {
    city_id: i64,
    city_name: String,
    state_name: String,
    region_id: Option<i64>,
}

#[derive(Debug)]
struct CityTable {
    rows: Vec<CityRow>,
    /// city name -> city_id (first row that introduced the name)
    index: KeyIndex<String>,
}

fn build_cities(records: &[RawRecord], regions: &RegionTable) -> CityTable {
    let mut rows = Vec::new();
    let mut index = KeyIndex::new();
    let mut seen = HashSet::new();
    for record in records {
        let key = (
            record.city.clone(),
            record.state.clone(),
            record.region.clone(),
        );
        if !seen.insert(key) {
            continue;
        }
        let city_id = rows.len() as i64 + 1;
        index.insert_first(record.city.clone(), city_id);
        rows.push(CityRow {
            city_id,
            city_name: record.city.clone(),
            state_name: record.state.clone(),
            region_id: regions.index.resolve(&record.region),
        });
    }
    CityTable { rows, index }
}

#[derive(Debug, Clone, PartialEq)]
struct SegmentRow {
    segment_id: i64,
    segment_name: String,
}

#[derive(Debug)]
struct SegmentTable {
    rows: Vec<SegmentRow>,
    /// segment name -> segment_id
    index: KeyIndex<String>,
}

fn build_segments(records: &[RawRecord]) -> SegmentTable {
    let mut rows = Vec::new();
    let mut index = KeyIndex::new();
    let mut seen = HashSet::new();
    for record in records {
        if !seen.insert(record.segment.clone()) {
            continue;
        }
        let segment_id = rows.len() as i64 + 1;
        index.insert_first(record.segment.clone(), segment_id);
        rows.push(SegmentRow {
            segment_id,
            segment_name: record.segment.clone(),
        });
    }
    SegmentTable { rows, index }
}

#[derive(Debug, Clone, PartialEq)]
struct CustomerRow {
    customer_id: i64,
    customer_name: String,
    segment_id: Option<i64>,
}

#[derive(Debug)]
struct CustomerTable {
    rows: Vec<CustomerRow>,
    /// customer name -> customer_id
    index: KeyIndex<String>,
}

fn build_customers(records: &[RawRecord], segments: &SegmentTable) -> CustomerTable {
    let mut rows = Vec::new();
    let mut index = KeyIndex::new();
    let mut seen = HashSet::new();
    for record in records {
        let key = (record.customer_name.clone(), record.segment.clone());
        if !seen.insert(key) {
            continue;
        }
        let customer_id = rows.len() as i64 + 1;
        index.insert_first(record.customer_name.clone(), customer_id);
        rows.push(CustomerRow {
            customer_id,
            customer_name: record.customer_name.clone(),
            segment_id: segments.index.resolve(&record.segment),
        });
    }
    CustomerTable { rows, index }
}

#[derive(Debug, Clone, PartialEq)]
struct CategoryRow {
    category_id: i64,
    category_name: String,
}

#[derive(Debug)]
struct CategoryTable {
    rows: Vec<CategoryRow>,
    /// category name -> category_id
    index: KeyIndex<String>,
}

fn build_categories(records: &[RawRecord]) -> CategoryTable {
    let mut rows = Vec::new();
    let mut index = KeyIndex::new();
    let mut seen = HashSet::new();
    for record in records {
        if !seen.insert(record.category.clone()) {
            continue;
        }
        let category_id = rows.len() as i64 + 1;
        index.insert_first(record.category.clone(), category_id);
        rows.push(CategoryRow {
            category_id,
            category_name: record.category.clone(),
        });
    }
    CategoryTable { rows, index }
}

#[derive(Debug, Clone, PartialEq)]
struct SubcategoryRow {
    subcategory_id: i64,
    subcategory_name: String,
    category_id: Option<i64>,
}

#[derive(Debug)]
struct SubcategoryTable {
    rows: Vec<SubcategoryRow>,
    /// subcategory name -> subcategory_id
    index: KeyIndex<String>,
}

fn build_subcategories(records: &[RawRecord], categories: &CategoryTable) -> SubcategoryTable {
    let mut rows = Vec::new();
    let mut index = KeyIndex::new();
    let mut seen = HashSet::new();
    for record in records {
        let key = (record.subcategory.clone(), record.category.clone());
        if !seen.insert(key) {
            continue;
        }
        let subcategory_id = rows.len() as i64 + 1;
        index.insert_first(record.subcategory.clone(), subcategory_id);
        rows.push(SubcategoryRow {
            subcategory_id,
            subcategory_name: record.subcategory.clone(),
            category_id: categories.index.resolve(&record.category),
        });
    }
    SubcategoryTable { rows, index }
}

#[derive(Debug, Clone, PartialEq)]
struct ProductRow {
    product_id: i64,
    product_name: String,
    category_id: Option<i64>,
    subcategory_id: Option<i64>,
}

#[derive(Debug)]
struct ProductTable {
    rows: Vec<ProductRow>,
    /// product name -> product_id
    index: KeyIndex<String>,
}

fn build_products(
    records: &[RawRecord],
    categories: &CategoryTable,
    subcategories: &SubcategoryTable,
) -> ProductTable {
    let mut rows = Vec::new();
    let mut index = KeyIndex::new();
    let mut seen = HashSet::new();
    for record in records {
        let key = (
            record.product_name.clone(),
            record.category.clone(),
            record.subcategory.clone(),
        );
        if !seen.insert(key) {
            continue;
        }
        let product_id = rows.len() as i64 + 1;
        index.insert_first(record.product_name.clone(), product_id);
        rows.push(ProductRow {
            product_id,
            product_name: record.product_name.clone(),
            category_id: categories.index.resolve(&record.category),
            subcategory_id: subcategories.index.resolve(&record.subcategory),
        });
    }
    ProductTable { rows, index }
}

#[derive(Debug, Clone, PartialEq)]
struct OrderDateRow {
    orderdate_id: i64,
    orderdate_when: NaiveDate,
}

#[derive(Debug)]
struct OrderDateTable {
    rows: Vec<OrderDateRow>,
    /// calendar date -> orderdate_id
    index: KeyIndex<NaiveDate>,
}

/// Order dates arrive day-first ("13/08/2017", occasionally "13-08-2017").
fn parse_order_date(raw: &str) -> Result<NaiveDate, LoadError> {
    NaiveDate::parse_from_str(raw, "%d/%m/%Y")
        .or_else(|_| NaiveDate::parse_from_str(raw, "%d-%m-%Y"))
        .map_err(|_| LoadError::BadOrderDate {
            value: raw.to_string(),
        })
}

/// The one fallible dimension build: every date string must parse.
/// Deduplication is on the parsed calendar date, so two spellings of the
/// same day share one row.
fn build_order_dates(records: &[RawRecord]) -> Result<OrderDateTable, LoadError> {
    let mut rows = Vec::new();
    let mut index = KeyIndex::new();
    let mut seen = HashSet::new();
    for record in records {
        let date = parse_order_date(&record.order_date)?;
        if !seen.insert(date) {
            continue;
        }
        let orderdate_id = rows.len() as i64 + 1;
        index.insert_first(date, orderdate_id);
        rows.push(OrderDateRow {
            orderdate_id,
            orderdate_when: date,
        });
    }
    Ok(OrderDateTable { rows, index })
}

// =============================================================================
// FACT BUILDER
// =============================================================================

/// fact_order row with every reference resolved (or NULL).
#[derive(Debug, Clone, PartialEq)]
struct FactRow {
    order_id: String,
    sales: f64,
    city_id: Option<i64>,
    customer_id: Option<i64>,
    product_id: Option<i64>,
    orderdate_id: Option<i64>,
}

#[derive(Debug)]
struct FactBuild {
    rows: Vec<FactRow>,
    /// Groups whose Order ID was empty and received a placeholder.
    repaired_order_ids: usize,
}

/// Accumulator for one (order, product) group.
///
/// City, customer and date are taken from the first line of the group. The
/// source is assumed to never split one (order, product) pair across cities,
/// customers or dates; if it ever does, those lines are merged here and the
/// later values are lost. Known limitation carried over from the source
/// system.
#[derive(Debug)]
struct FactAccum {
    sales: f64,
    city: String,
    customer_name: String,
    order_date: String,
}

fn build_facts(
    records: &[RawRecord],
    cities: &CityTable,
    customers: &CustomerTable,
    products: &ProductTable,
    order_dates: Option<&OrderDateTable>,
) -> Result<FactBuild, LoadError> {
    let order_dates = order_dates.ok_or(LoadError::DimensionUnavailable {
        table: "dim_orderdate",
    })?;

    // BTreeMap keeps the emitted rows sorted by (order id, product name);
    // lines with an empty Order ID sort first under the None key.
    let mut groups: BTreeMap<(Option<String>, String), FactAccum> = BTreeMap::new();
    for record in records {
        let key = (record.order_id.clone(), record.product_name.clone());
        let accum = groups.entry(key).or_insert_with(|| FactAccum {
            sales: 0.0,
            city: record.city.clone(),
            customer_name: record.customer_name.clone(),
            order_date: record.order_date.clone(),
        });
        accum.sales += record.sales;
    }

    let repaired = groups
        .keys()
        .filter(|(order_id, _)| order_id.is_none())
        .count();
    if repaired > 0 {
        println!(
            "{} fact row(s) missing Order ID - assigning placeholder ids",
            repaired
        );
    }

    let mut rows = Vec::with_capacity(groups.len());
    for ((order_id, product_name), accum) in &groups {
        let order_id = match order_id {
            Some(id) => id.clone(),
            // Placeholder keeps the row addressable without inventing a real order
            None => format!("UNKNOWN-{}", Uuid::new_v4()),
        };
        let date = parse_order_date(&accum.order_date)?;
        rows.push(FactRow {
            order_id,
            sales: accum.sales,
            city_id: cities.index.resolve(&accum.city),
            customer_id: customers.index.resolve(&accum.customer_name),
            product_id: products.index.resolve(product_name),
            orderdate_id: order_dates.index.resolve(&date),
        });
    }

    Ok(FactBuild {
        rows,
        repaired_order_ids: repaired,
    })
}

// =============================================================================
// DATABASE APPEND
// =============================================================================
// Plain per-row INSERTs on the run's single connection. Tables are
// provisioned out-of-band (db/schema.sql); nothing here creates or alters
// schema.

async fn write_regions(conn: &mut PgConnection, regions: &RegionTable) -> Result<usize, LoadError> {
    for row in &regions.rows {
        sqlx::query("INSERT INTO dim_region (region_id, region_name) VALUES ($1, $2)")
            .bind(row.region_id)
            .bind(&row.region_name)
            .execute(&mut *conn)
            .await?;
    }
    Ok(regions.rows.len())
}

async fn write_cities(conn: &mut PgConnection, cities: &CityTable) -> Result<usize, LoadError> {
    for row in &cities.rows {
        sqlx::query(
            "INSERT INTO dim_city (city_id, city_name, state_name, region_id) VALUES ($1, $2, $3, $4)",
        )
        .bind(row.city_id)
        .bind(&row.city_name)
        .bind(&row.state_name)
        .bind(row.region_id)
        .execute(&mut *conn)
        .await?;
    }
    Ok(cities.rows.len())
}

async fn write_segments(
    conn: &mut PgConnection,
    segments: &SegmentTable,
) -> Result<usize, LoadError> {
    for row in &segments.rows {
        sqlx::query("INSERT INTO dim_segment (segment_id, segment_name) VALUES ($1, $2)")
            .bind(row.segment_id)
            .bind(&row.segment_name)
            .execute(&mut *conn)
            .await?;
    }
    Ok(segments.rows.len())
}

async fn write_customers(
    conn: &mut PgConnection,
    customers: &CustomerTable,
) -> Result<usize, LoadError> {
    for row in &customers.rows {
        sqlx::query(
            "INSERT INTO dim_customer (customer_id, customer_name, segment_id) VALUES ($1, $2, $3)",
        )
        .bind(row.customer_id)
        .bind(&row.customer_name)
        .bind(row.segment_id)
        .execute(&mut *conn)
        .await?;
    }
    Ok(customers.rows.len())
}

async fn write_categories(
    conn: &mut PgConnection,
    categories: &CategoryTable,
) -> Result<usize, LoadError> {
    for row in &categories.rows {
        sqlx::query("INSERT INTO dim_category (category_id, category_name) VALUES ($1, $2)")
            .bind(row.category_id)
            .bind(&row.category_name)
            .execute(&mut *conn)
            .await?;
    }
    Ok(categories.rows.len())
}

async fn write_subcategories(
    conn: &mut PgConnection,
    subcategories: &SubcategoryTable,
) -> Result<usize, LoadError> {
    for row in &subcategories.rows {
        sqlx::query(
            "INSERT INTO dim_subcategory (subcategory_id, subcategory_name, category_id) VALUES ($1, $2, $3)",
        )
        .bind(row.subcategory_id)
        .bind(&row.subcategory_name)
        .bind(row.category_id)
        .execute(&mut *conn)
        .await?;
    }
    Ok(subcategories.rows.len())
}

async fn write_products(
    conn: &mut PgConnection,
    products: &ProductTable,
) -> Result<usize, LoadError> {
    for row in &products.rows {
        sqlx::query(
            "INSERT INTO dim_product (product_id, product_name, category_id, subcategory_id) VALUES ($1, $2, $3, $4)",
        )
        .bind(row.product_id)
        .bind(&row.product_name)
        .bind(row.category_id)
        .bind(row.subcategory_id)
        .execute(&mut *conn)
        .await?;
    }
    Ok(products.rows.len())
}

async fn write_order_dates(
    conn: &mut PgConnection,
    order_dates: &OrderDateTable,
) -> Result<usize, LoadError> {
    for row in &order_dates.rows {
        sqlx::query("INSERT INTO dim_orderdate (orderdate_id, orderdate_when) VALUES ($1, $2)")
            .bind(row.orderdate_id)
            .bind(row.orderdate_when)
            .execute(&mut *conn)
            .await?;
    }
    Ok(order_dates.rows.len())
}

async fn write_facts(conn: &mut PgConnection, facts: &[FactRow]) -> Result<usize, LoadError> {
    for row in facts {
        sqlx::query(
            r#"
            INSERT INTO fact_order (order_id, sales, city_id, customer_id, product_id, orderdate_id)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(&row.order_id)
        .bind(row.sales)
        .bind(row.city_id)
        .bind(row.customer_id)
        .bind(row.product_id)
        .bind(row.orderdate_id)
        .execute(&mut *conn)
        .await?;
    }
    Ok(facts.len())
}

// =============================================================================
// LOAD PIPELINE
// =============================================================================

/// Combine what was built with what (if anything) was written.
/// `write` is `None` on a dry run.
fn step_outcome(built_rows: usize, write: Option<Result<usize, LoadError>>) -> StepStatus {
    match write {
        None => StepStatus::Loaded { rows: built_rows },
        Some(Ok(rows)) => StepStatus::Loaded { rows },
        Some(Err(e)) => StepStatus::Failed(e),
    }
}

/// Run the nine table loads in dependency order. Failures are contained in
/// the returned report; one step failing never prevents the next from
/// running. Pass `None` for the connection to build without writing.
async fn run_load(mut conn: Option<&mut PgConnection>, source: &SourceData) -> RunReport {
    let records = match source {
        SourceData::Missing => {
            let mut report = RunReport::new(0);
            for table in TABLES {
                report.record(
                    table,
                    StepStatus::Skipped {
                        reason: "source file missing",
                    },
                );
            }
            return report;
        }
        SourceData::Rows(rows) if rows.is_empty() => {
            let mut report = RunReport::new(0);
            for table in TABLES {
                report.record(
                    table,
                    StepStatus::Skipped {
                        reason: "source file has no rows",
                    },
                );
            }
            return report;
        }
        SourceData::Rows(rows) => rows.as_slice(),
    };

    let mut report = RunReport::new(records.len());

    // Dimensions, strictly in reference order: every later build consumes the
    // indexes of the ones before it.
    println!("Building dim_region....");
    let regions = build_regions(records);
    let write = match conn.as_deref_mut() {
        Some(c) => Some(write_regions(c, &regions).await),
        None => None,
    };
    report.record("dim_region", step_outcome(regions.rows.len(), write));

    println!("Building dim_city....");
    let cities = build_cities(records, &regions);
    let write = match conn.as_deref_mut() {
        Some(c) => Some(write_cities(c, &cities).await),
        None => None,
    };
    report.record("dim_city", step_outcome(cities.rows.len(), write));

    println!("Building dim_segment....");
    let segments = build_segments(records);
    let write = match conn.as_deref_mut() {
        Some(c) => Some(write_segments(c, &segments).await),
        None => None,
    };
    report.record("dim_segment", step_outcome(segments.rows.len(), write));

    println!("Building dim_customer....");
    let customers = build_customers(records, &segments);
    let write = match conn.as_deref_mut() {
        Some(c) => Some(write_customers(c, &customers).await),
        None => None,
    };
    report.record("dim_customer", step_outcome(customers.rows.len(), write));

    println!("Building dim_category....");
    let categories = build_categories(records);
    let write = match conn.as_deref_mut() {
        Some(c) => Some(write_categories(c, &categories).await),
        None => None,
    };
    report.record("dim_category", step_outcome(categories.rows.len(), write));

    println!("Building dim_subcategory....");
    let subcategories = build_subcategories(records, &categories);
    let write = match conn.as_deref_mut() {
        Some(c) => Some(write_subcategories(c, &subcategories).await),
        None => None,
    };
    report.record(
        "dim_subcategory",
        step_outcome(subcategories.rows.len(), write),
    );

    println!("Building dim_product....");
    let products = build_products(records, &categories, &subcategories);
    let write = match conn.as_deref_mut() {
        Some(c) => Some(write_products(c, &products).await),
        None => None,
    };
    report.record("dim_product", step_outcome(products.rows.len(), write));

    println!("Building dim_orderdate....");
    let order_dates = match build_order_dates(records) {
        Ok(table) => {
            let write = match conn.as_deref_mut() {
                Some(c) => Some(write_order_dates(c, &table).await),
                None => None,
            };
            report.record("dim_orderdate", step_outcome(table.rows.len(), write));
            Some(table)
        }
        Err(e) => {
            report.record("dim_orderdate", StepStatus::Failed(e));
            None
        }
    };

    println!("Building fact_order....");
    match build_facts(
        records,
        &cities,
        &customers,
        &products,
        order_dates.as_ref(),
    ) {
        Ok(build) => {
            report.repaired_order_ids = build.repaired_order_ids;
            let write = match conn.as_deref_mut() {
                Some(c) => Some(write_facts(c, &build.rows).await),
                None => None,
            };
            report.record("fact_order", step_outcome(build.rows.len(), write));
        }
        Err(e) => report.record("fact_order", StepStatus::Failed(e)),
    }

    report
}

// =============================================================================
// MAIN
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    println!("=== Superstore Warehouse Loader ===");
    println!("Source: {}", args.input.display());
    println!("Mode: {}", if args.dry_run { "dry-run" } else { "live" });

    let source = read_source(&args.input, args.delimiter as u8).await?;
    match &source {
        SourceData::Missing => {
            println!("'{}' not found - every load will be skipped", args.input.display())
        }
        SourceData::Rows(rows) => println!("Raw source loaded ({} order line(s))", rows.len()),
    }

    if args.dry_run {
        println!("Dry run - skipping database connection");
        let report = run_load(None, &source).await;
        report.print_summary();
        println!("Dry run - nothing written to the database");
        return finish(report);
    }

    let db_url = std::env::var("DB_URL").context("DB_URL env var missing")?;

    // Pool of one: the constraint toggle below is session-scoped, so every
    // append must ride the same connection.
    let pool = PgPoolOptions::new()
        .max_connections(1)
        .connect(&db_url)
        .await
        .context("Failed to connect to database - check DB_URL in .env")?;
    let mut conn = pool.acquire().await?;

    sqlx::query("SET session_replication_role = 'replica'")
        .execute(&mut *conn)
        .await
        .context("Failed to disable foreign key checks")?;
    println!("Foreign key checks disabled");

    let report = run_load(Some(&mut *conn), &source).await;

    sqlx::query("SET session_replication_role = 'origin'")
        .execute(&mut *conn)
        .await
        .context("Failed to re-enable foreign key checks")?;
    println!("Foreign key checks re-enabled");

    report.print_summary();
    finish(report)
}

fn finish(report: RunReport) -> Result<()> {
    let failed = report.failed_count();
    if failed > 0 {
        anyhow::bail!("{} of {} table load(s) failed", failed, report.steps.len());
    }
    Ok(())
}

// =============================================================================
// TESTS
// =============================================================================
