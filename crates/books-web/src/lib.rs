//! Axum + Askama dashboard over the warehouse `Books` table.
//!
//! Every page render opens one warehouse session, reads the whole table,
//! closes the session and computes the aggregates in memory.

pub mod stats;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use askama::Template;
use async_trait::async_trait;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::get,
    Router,
};
use books_core::Listing;
use books_warehouse::{fetch_table, WarehouseCredentials, WarehouseTarget};
use serde::Deserialize;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::stats::{AvailabilityShare, BookDetail, PriceRow, PRICE_TABLE_ROWS};

pub const CRATE_NAME: &str = "books-web";
pub const DEFAULT_SECRETS_PATH: &str = ".secrets/secrets.yaml";
pub const DEFAULT_WEB_PORT: u16 = 8000;

/// Dashboard settings read from the environment.
#[derive(Debug, Clone)]
pub struct DashboardConfig {
    pub secrets_path: PathBuf,
    pub target: WarehouseTarget,
    pub count_out_of_stock: bool,
    pub port: u16,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            secrets_path: PathBuf::from(DEFAULT_SECRETS_PATH),
            target: WarehouseTarget::default(),
            count_out_of_stock: false,
            port: DEFAULT_WEB_PORT,
        }
    }
}

impl DashboardConfig {
    pub fn from_env() -> Self {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            secrets_path: var("BOOKS_SECRETS_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.secrets_path),
            target: WarehouseTarget::from_vars(&var),
            count_out_of_stock: var("BOOKS_DASHBOARD_COUNT_OUT_OF_STOCK")
                .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
                .unwrap_or(defaults.count_out_of_stock),
            port: var("BOOKS_WEB_PORT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.port),
        }
    }
}

#[derive(Debug, Deserialize)]
struct SecretsYaml {
    #[serde(rename = "USER_NAME")]
    user_name: String,
    #[serde(rename = "PASSWORD")]
    password: String,
    #[serde(rename = "ACCOUNT")]
    account: String,
}

/// Read warehouse credentials from the dashboard secrets file.
pub async fn load_secrets(path: &Path) -> anyhow::Result<WarehouseCredentials> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading secrets file {}", path.display()))?;
    let secrets: SecretsYaml = serde_yaml::from_str(&raw)
        .with_context(|| format!("parsing secrets file {}", path.display()))?;
    Ok(WarehouseCredentials {
        account: secrets.account,
        user: secrets.user_name,
        password: secrets.password,
    })
}

/// Where a render gets its rows from.
#[async_trait]
pub trait ListingSource: Send + Sync {
    async fn fetch_listings(&self) -> anyhow::Result<Vec<Listing>>;
}

/// Reads the secrets file and the table on every call.
#[derive(Debug, Clone)]
pub struct WarehouseSource {
    pub secrets_path: PathBuf,
    pub target: WarehouseTarget,
}

#[async_trait]
impl ListingSource for WarehouseSource {
    async fn fetch_listings(&self) -> anyhow::Result<Vec<Listing>> {
        let credentials = load_secrets(&self.secrets_path).await?;
        let rows = fetch_table(&credentials, &self.target).await?;
        Ok(rows)
    }
}

#[derive(Clone)]
pub struct AppState {
    pub source: Arc<dyn ListingSource>,
    pub count_out_of_stock: bool,
}

impl AppState {
    pub fn new(source: Arc<dyn ListingSource>) -> Self {
        Self {
            source,
            count_out_of_stock: false,
        }
    }

    pub fn with_counted_out_of_stock(mut self, enabled: bool) -> Self {
        self.count_out_of_stock = enabled;
        self
    }

    pub fn from_config(config: &DashboardConfig) -> Self {
        Self::new(Arc::new(WarehouseSource {
            secrets_path: config.secrets_path.clone(),
            target: config.target.clone(),
        }))
        .with_counted_out_of_stock(config.count_out_of_stock)
    }
}

#[derive(Debug, Deserialize, Default)]
struct DashboardQuery {
    show: Option<String>,
    title: Option<String>,
    view: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PriceTable {
    MostExpensive,
    LeastExpensive,
}

impl PriceTable {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "most_expensive" => Some(Self::MostExpensive),
            "least_expensive" => Some(Self::LeastExpensive),
            _ => None,
        }
    }

    fn heading(self) -> &'static str {
        match self {
            Self::MostExpensive => "Top 5 Most Expensive Books",
            Self::LeastExpensive => "Top 5 Least Expensive Books",
        }
    }
}

#[derive(Debug, Clone)]
struct TitleOption {
    title: String,
    selected: bool,
}

#[derive(Template)]
#[template(path = "index.html")]
struct IndexTemplate {
    total_books: usize,
    average_price: String,
    availability_figure: String,
    rating_figure: String,
    price_table_heading: String,
    price_rows: Vec<PriceRow>,
    title_options: Vec<TitleOption>,
    detail: Option<BookDetail>,
    missing_title: String,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/healthz", get(healthz_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = DashboardConfig::from_env();
    let state = AppState::from_config(&config);
    let listener = TcpListener::bind(("0.0.0.0", config.port)).await?;
    info!(port = config.port, secrets = %config.secrets_path.display(), "dashboard listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn healthz_handler() -> &'static str {
    "ok"
}

async fn index_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DashboardQuery>,
) -> Response {
    match state.source.fetch_listings().await {
        Ok(rows) => render_html(build_index(&rows, &query, state.count_out_of_stock)),
        Err(err) => {
            warn!(error = %err, "dashboard render failed");
            server_error(err)
        }
    }
}

fn build_index(rows: &[Listing], query: &DashboardQuery, count_out_of_stock: bool) -> IndexTemplate {
    let share = if count_out_of_stock {
        AvailabilityShare::counted(rows)
    } else {
        AvailabilityShare::literal(rows)
    };
    let buckets = stats::rating_breakdown(rows);

    let table = query.show.as_deref().and_then(PriceTable::parse);
    let price_rows = match table {
        Some(PriceTable::MostExpensive) => stats::most_expensive(rows, PRICE_TABLE_ROWS),
        Some(PriceTable::LeastExpensive) => stats::least_expensive(rows, PRICE_TABLE_ROWS),
        None => Vec::new(),
    };

    let selected = query.title.clone().unwrap_or_default();
    let title_options = stats::distinct_titles(rows)
        .into_iter()
        .map(|title| TitleOption {
            selected: title == selected,
            title,
        })
        .collect();

    let (detail, missing_title) = match (&query.title, &query.view) {
        (Some(title), Some(_)) => match stats::lookup(rows, title) {
            Some(detail) => (Some(detail), String::new()),
            None => (None, title.clone()),
        },
        _ => (None, String::new()),
    };

    IndexTemplate {
        total_books: stats::total_books(rows),
        average_price: stats::average_price(rows)
            .map(|mean| format!("{mean:.2}"))
            .unwrap_or_else(|| "n/a".into()),
        availability_figure: script_json(&stats::availability_figure(&share)),
        rating_figure: script_json(&stats::rating_figure(&buckets)),
        price_table_heading: table.map(|t| t.heading().to_string()).unwrap_or_default(),
        price_rows,
        title_options,
        detail,
        missing_title,
    }
}

/// JSON safe to inline inside a `<script>` element.
fn script_json(value: &serde_json::Value) -> String {
    value.to_string().replace("</", "<\\/")
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => server_error(anyhow::anyhow!(err.to_string())),
    }
}

fn server_error(err: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Html(format!("Server error: {:#}", err)),
    )
        .into_response()
}
