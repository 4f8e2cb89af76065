//! API Service - Reporting API for the Superstore warehouse
//!
//! Endpoints:
//! - GET /health - Health check
//! - GET /summary - Headline KPIs (total sales, order count, average order value)
//! - GET /sales/yearly - Sales per calendar year
//! - GET /sales/by-region - Sales per region
//! - GET /sales/by-city - Top cities by sales
//! - GET /sales/by-category - Sales per category
//! - GET /export - Joined dataset as a CSV download

use anyhow::Context;
use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

// ============================================================================
// State
// ============================================================================

#[derive(Clone)]
struct AppState {
    pool: PgPool,
}

/// Shared join block. Every view and the export read the warehouse through
/// these inner joins, so fact rows with unresolved references never surface.
const JOINED_FROM: &str = r#"
    FROM fact_order fo
    JOIN dim_product dp ON fo.product_id = dp.product_id
    JOIN dim_subcategory dscat ON dp.subcategory_id = dscat.subcategory_id
    JOIN dim_category dcat ON dscat.category_id = dcat.category_id
    JOIN dim_customer dc ON fo.customer_id = dc.customer_id
    JOIN dim_segment ds ON dc.segment_id = ds.segment_id
    JOIN dim_city dcity ON fo.city_id = dcity.city_id
    JOIN dim_region dr ON dcity.region_id = dr.region_id
    JOIN dim_orderdate dd ON fo.orderdate_id = dd.orderdate_id
"#;

// ============================================================================
// Response types
// ============================================================================

#[derive(Serialize)]
struct HealthResponse {
    ok: bool,
    version: &'static str,
}

#[derive(sqlx::FromRow)]
struct SummaryRow {
    total_sales: f64,
    total_orders: i64,
}

#[derive(Serialize)]
struct SummaryResponse {
    has_data: bool,
    total_sales: f64,
    total_sales_formatted: String,
    total_orders: i64,
    total_orders_formatted: String,
    average_order_value: f64,
    average_order_value_formatted: String,
}

#[derive(Serialize, sqlx::FromRow)]
struct YearlySalesRow {
    year: i32,
    sales: f64,
}

#[derive(Serialize, sqlx::FromRow)]
struct RegionSalesRow {
    region_name: String,
    sales: f64,
}

#[derive(Serialize, sqlx::FromRow)]
struct CitySalesRow {
    city_name: String,
    sales: f64,
}

#[derive(Serialize, sqlx::FromRow)]
struct CategorySalesRow {
    category_name: String,
    sales: f64,
}

#[derive(sqlx::FromRow)]
struct ExportRow {
    order_id: String,
    sales: f64,
    product_name: String,
    category_name: String,
    subcategory_name: String,
    customer_name: String,
    segment_name: String,
    city_name: String,
    state_name: String,
    region_name: String,
    order_date: NaiveDate,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

// ============================================================================
// Query params
// ============================================================================

#[derive(Deserialize)]
struct CityQuery {
    limit: Option<i64>,
}

// ============================================================================
// Handlers
// ============================================================================

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        ok: true,
        version: "0.1.0",
    })
}

async fn summary_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let query = format!(
        "SELECT COALESCE(SUM(fo.sales), 0)::float8 AS total_sales, COUNT(DISTINCT fo.order_id) AS total_orders {}",
        JOINED_FROM
    );

    let row: Result<SummaryRow, _> = sqlx::query_as(&query).fetch_one(&state.pool).await;

    match row {
        Ok(row) => {
            let aov = average_order_value(row.total_sales, row.total_orders);
            Json(SummaryResponse {
                has_data: row.total_orders > 0,
                total_sales: row.total_sales,
                total_sales_formatted: format_usd(row.total_sales),
                total_orders: row.total_orders,
                total_orders_formatted: format_count(row.total_orders),
                average_order_value: aov,
                average_order_value_formatted: format_usd(aov),
            })
            .into_response()
        }
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: e.to_string(),
            }),
        )
            .into_response(),
    }
}

/// AOV with the zero-order case pinned to 0 instead of a division error.
fn average_order_value(total_sales: f64, total_orders: i64) -> f64 {
    if total_orders > 0 {
        total_sales / total_orders as f64
    } else {
        0.0
    }
}

/// Format a dollar amount for display, e.g. 2297200.86 -> "$2,297,200.86"
fn format_usd(amount: f64) -> String {
    let cents = format!("{:.2}", amount.abs());
    let (whole, frac) = cents.split_once('.').unwrap_or((cents.as_str(), "00"));
    let sign = if amount < 0.0 { "-" } else { "" };
    format!("{}${}.{}", sign, group_thousands(whole), frac)
}

/// Format a count for display, e.g. 4922 -> "4,922"
fn format_count(count: i64) -> String {
    group_thousands(&count.to_string())
}

/// Insert thousands separators into a digit string ("4922" -> "4,922").
fn group_thousands(digits: &str) -> String {
    let mut out = String::new();
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

async fn yearly_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let query = format!(
        r#"
        SELECT EXTRACT(YEAR FROM dd.orderdate_when)::int AS year,
               SUM(fo.sales)::float8 AS sales
        {}
        GROUP BY year
        ORDER BY year
        "#,
        JOINED_FROM
    );

    let rows: Result<Vec<YearlySalesRow>, _> =
        sqlx::query_as(&query).fetch_all(&state.pool).await;

    match rows {
        Ok(rows) => Json(serde_json::json!({ "years": rows })).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: e.to_string(),
            }),
        )
            .into_response(),
    }
}

async fn region_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let query = format!(
        r#"
        SELECT dr.region_name, SUM(fo.sales)::float8 AS sales
        {}
        GROUP BY dr.region_name
        ORDER BY sales DESC
        "#,
        JOINED_FROM
    );

    let rows: Result<Vec<RegionSalesRow>, _> =
        sqlx::query_as(&query).fetch_all(&state.pool).await;

    match rows {
        Ok(rows) => Json(serde_json::json!({ "regions": rows })).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: e.to_string(),
            }),
        )
            .into_response(),
    }
}

async fn city_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<CityQuery>,
) -> impl IntoResponse {
    let limit = params.limit.unwrap_or(10).min(100);

    let query = format!(
        r#"
        SELECT dcity.city_name, SUM(fo.sales)::float8 AS sales
        {}
        GROUP BY dcity.city_name
        ORDER BY sales DESC
        LIMIT $1
        "#,
        JOINED_FROM
    );

    let rows: Result<Vec<CitySalesRow>, _> = sqlx::query_as(&query)
        .bind(limit)
        .fetch_all(&state.pool)
        .await;

    match rows {
        Ok(rows) => Json(serde_json::json!({ "cities": rows })).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: e.to_string(),
            }),
        )
            .into_response(),
    }
}

async fn category_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let query = format!(
        r#"
        SELECT dcat.category_name, SUM(fo.sales)::float8 AS sales
        {}
        GROUP BY dcat.category_name
        ORDER BY sales DESC
        "#,
        JOINED_FROM
    );

    let rows: Result<Vec<CategorySalesRow>, _> =
        sqlx::query_as(&query).fetch_all(&state.pool).await;

    match rows {
        Ok(rows) => Json(serde_json::json!({ "categories": rows })).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: e.to_string(),
            }),
        )
            .into_response(),
    }
}

async fn export_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let query = format!(
        r#"
        SELECT
            fo.order_id,
            fo.sales,
            dp.product_name,
            dcat.category_name,
            dscat.subcategory_name,
            dc.customer_name,
            ds.segment_name,
            dcity.city_name,
            dcity.state_name,
            dr.region_name,
            dd.orderdate_when AS order_date
        {}
        ORDER BY fo.order_id, dp.product_name
        "#,
        JOINED_FROM
    );

    let rows: Result<Vec<ExportRow>, _> = sqlx::query_as(&query).fetch_all(&state.pool).await;

    let rows = match rows {
        Ok(rows) => rows,
        Err(e) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: e.to_string(),
                }),
            )
                .into_response();
        }
    };

    match render_export_csv(&rows) {
        Ok(body) => (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, "text/csv; charset=utf-8"),
                (
                    header::CONTENT_DISPOSITION,
                    "attachment; filename=\"superstore_data.csv\"",
                ),
            ],
            body,
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: e.to_string(),
            }),
        )
            .into_response(),
    }
}

/// Render the joined rows as a CSV document.
/// The body starts with a UTF-8 BOM so Excel opens it with the right encoding.
fn render_export_csv(rows: &[ExportRow]) -> anyhow::Result<Vec<u8>> {
    let mut buf = vec![0xEF, 0xBB, 0xBF];
    {
        let mut writer = csv::Writer::from_writer(&mut buf);
        writer.write_record([
            "order_id",
            "sales",
            "product_name",
            "category_name",
            "subcategory_name",
            "customer_name",
            "segment_name",
            "city_name",
            "state_name",
            "region_name",
            "order_date",
        ])?;
        for row in rows {
            writer.write_record([
                row.order_id.clone(),
                row.sales.to_string(),
                row.product_name.clone(),
                row.category_name.clone(),
                row.subcategory_name.clone(),
                row.customer_name.clone(),
                row.segment_name.clone(),
                row.city_name.clone(),
                row.state_name.clone(),
                row.region_name.clone(),
                row.order_date.to_string(),
            ])?;
        }
        writer.flush()?;
    }
    Ok(buf)
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let db_url = std::env::var("DB_URL").context("DB_URL env var missing")?;
    let bind = std::env::var("API_BIND").unwrap_or_else(|_| "127.0.0.1:8080".to_string());

    println!("=== Superstore Reporting API ===");
    println!("Connecting to database...");

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&db_url)
        .await
        .context("Failed to connect to database")?;

    println!("Database connected");

    let state = Arc::new(AppState { pool });

    // CORS for web frontend
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/summary", get(summary_handler))
        .route("/sales/yearly", get(yearly_handler))
        .route("/sales/by-region", get(region_handler))
        .route("/sales/by-city", get(city_handler))
        .route("/sales/by-category", get(category_handler))
        .route("/export", get(export_handler))
        .layer(cors)
        .with_state(state);

    println!("API listening on http://{}", bind);
    println!("\nEndpoints:");
    println!("  GET /health");
    println!("  GET /summary");
    println!("  GET /sales/yearly");
    println!("  GET /sales/by-region");
    println!("  GET /sales/by-city?limit=");
    println!("  GET /sales/by-category");
    println!("  GET /export");

    let listener = tokio::net::TcpListener::bind(&bind).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // ------------------------------------------------------------------------
    // KPI TESTS
    // ------------------------------------------------------------------------

    #[test]
    fn test_average_order_value() {
        assert_eq!(average_order_value(900.0, 4), 225.0);
    }

    #[test]
    fn test_average_order_value_zero_orders() {
        assert_eq!(average_order_value(0.0, 0), 0.0);
        assert_eq!(average_order_value(123.45, 0), 0.0);
    }

    // ------------------------------------------------------------------------
    // FORMATTING TESTS
    // ------------------------------------------------------------------------

    #[test]
    fn test_format_usd_groups_thousands() {
        assert_eq!(format_usd(2297200.8603), "$2,297,200.86");
        assert_eq!(format_usd(458.6), "$458.60");
        assert_eq!(format_usd(0.0), "$0.00");
    }

    #[test]
    fn test_format_count() {
        assert_eq!(format_count(4922), "4,922");
        assert_eq!(format_count(120), "120");
        assert_eq!(format_count(1000000), "1,000,000");
    }

    // ------------------------------------------------------------------------
    // EXPORT TESTS
    // ------------------------------------------------------------------------

    fn sample_row() -> ExportRow {
        ExportRow {
            order_id: "CA-1001".to_string(),
            sales: 261.96,
            product_name: "Bush Somerset Bookcase".to_string(),
            category_name: "Furniture".to_string(),
            subcategory_name: "Bookcases".to_string(),
            customer_name: "Claire Gute".to_string(),
            segment_name: "Consumer".to_string(),
            city_name: "Henderson".to_string(),
            state_name: "Kentucky".to_string(),
            region_name: "South".to_string(),
            order_date: NaiveDate::from_ymd_opt(2016, 11, 8).unwrap(),
        }
    }

    #[test]
    fn test_export_csv_starts_with_bom() {
        let body = render_export_csv(&[sample_row()]).unwrap();
        assert_eq!(body[..3], [0xEF, 0xBB, 0xBF]);
    }

    #[test]
    fn test_export_csv_header_and_row() {
        let body = render_export_csv(&[sample_row()]).unwrap();
        let text = String::from_utf8(body[3..].to_vec()).unwrap();
        let mut lines = text.lines();
        assert_eq!(
            lines.next().unwrap(),
            "order_id,sales,product_name,category_name,subcategory_name,customer_name,segment_name,city_name,state_name,region_name,order_date"
        );
        let row = lines.next().unwrap();
        assert!(row.starts_with("CA-1001,261.96,"));
        assert!(row.ends_with(",South,2016-11-08"));
    }

    #[test]
    fn test_export_csv_empty_keeps_header() {
        let body = render_export_csv(&[]).unwrap();
        let text = String::from_utf8(body[3..].to_vec()).unwrap();
        assert_eq!(text.lines().count(), 1);
    }

    #[test]
    fn test_export_csv_quotes_embedded_commas() {
        let mut row = sample_row();
        row.product_name = "Chairs, Stacking".to_string();
        let body = render_export_csv(&[row]).unwrap();
        let text = String::from_utf8(body[3..].to_vec()).unwrap();
        assert!(text.contains("\"Chairs, Stacking\""));
    }
}
