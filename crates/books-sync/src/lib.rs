//! Collector and Loader jobs.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use books_adapters::{AdapterContext, BooksToScrapeAdapter, CatalogueAdapter, DEFAULT_URL_TEMPLATE};
use books_core::{Listing, DEFAULT_PAGE_COUNT};
use books_storage::{read_export, write_export, BackoffPolicy, HttpClientConfig, HttpFetcher};
use books_warehouse::{
    WarehouseCredentials, WarehouseError, WarehouseSession, WarehouseTarget, SKIP_HEADER_ROWS,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "books-sync";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub url_template: String,
    pub page_count: u32,
    pub export_path: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub fetch_max_retries: usize,
    pub target: WarehouseTarget,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            url_template: DEFAULT_URL_TEMPLATE.to_string(),
            page_count: DEFAULT_PAGE_COUNT,
            export_path: PathBuf::from("Books.csv"),
            user_agent: "books-bot/0.1".to_string(),
            http_timeout_secs: 20,
            fetch_max_retries: 0,
            target: WarehouseTarget::default(),
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    /// Build from a variable lookup; unset or unparsable values keep defaults.
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            url_template: var("BOOKS_CATALOGUE_URL_TEMPLATE").unwrap_or(defaults.url_template),
            page_count: var("BOOKS_PAGE_COUNT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.page_count),
            export_path: var("BOOKS_EXPORT_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.export_path),
            user_agent: var("BOOKS_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: var("BOOKS_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.http_timeout_secs),
            fetch_max_retries: var("BOOKS_FETCH_MAX_RETRIES")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.fetch_max_retries),
            target: WarehouseTarget::from_vars(&var),
        }
    }

    fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            backoff: BackoffPolicy {
                max_retries: self.fetch_max_retries,
                ..Default::default()
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CollectSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub pages_fetched: u32,
    pub listings: usize,
    pub export_path: String,
    pub export_sha256: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoadSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub database_created: bool,
    pub rows_staged: u64,
    pub rows_copied: u64,
    pub table: String,
}

pub struct Collector {
    config: SyncConfig,
    http: HttpFetcher,
    adapter: Box<dyn CatalogueAdapter>,
}

impl Collector {
    pub fn new(config: SyncConfig) -> Result<Self> {
        let http = HttpFetcher::new(config.http_client_config())?;
        let adapter = Box::new(BooksToScrapeAdapter::new(config.url_template.clone()));
        Ok(Self {
            config,
            http,
            adapter,
        })
    }

    pub fn with_adapter(mut self, adapter: Box<dyn CatalogueAdapter>) -> Self {
        self.adapter = adapter;
        self
    }

    /// Fetch and parse pages `1..=page_count` in order. Any failure aborts
    /// the run; nothing is returned for pages already parsed.
    pub async fn collect_listings(&self, run_id: Uuid) -> Result<Vec<Listing>> {
        let ctx = AdapterContext { run_id };
        let mut listings = Vec::new();
        for page in 1..=self.config.page_count {
            let fetched = self
                .adapter
                .fetch_page(&self.http, &ctx, page)
                .await
                .with_context(|| format!("fetching catalogue page {page}"))?;
            let parsed = self
                .adapter
                .parse_page(&fetched)
                .with_context(|| format!("parsing catalogue page {page}"))?;
            debug!(page, listings = parsed.len(), "page collected");
            listings.extend(parsed);
        }
        Ok(listings)
    }

    pub async fn run(&self) -> Result<CollectSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("collect", %run_id, source = self.adapter.source_id());
        self.run_inner(run_id).instrument(span).await
    }

    async fn run_inner(&self, run_id: Uuid) -> Result<CollectSummary> {
        let started_at = Utc::now();
        info!(pages = self.config.page_count, "collector started");
        let listings = self.collect_listings(run_id).await?;
        let written = write_export(&self.config.export_path, &listings)
            .await
            .with_context(|| format!("writing {}", self.config.export_path.display()))?;
        info!(
            listings = written.rows,
            path = %written.path.display(),
            sha256 = %written.sha256,
            "export written"
        );

        Ok(CollectSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            pages_fetched: self.config.page_count,
            listings: written.rows,
            export_path: written.path.display().to_string(),
            export_sha256: written.sha256,
        })
    }
}

pub struct Loader {
    credentials: WarehouseCredentials,
    target: WarehouseTarget,
    export_path: PathBuf,
}

impl Loader {
    pub fn new(
        credentials: WarehouseCredentials,
        target: WarehouseTarget,
        export_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            credentials,
            target,
            export_path: export_path.into(),
        }
    }

    pub async fn run(&self) -> Result<LoadSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("load", %run_id, table = %self.target.table);
        self.run_inner(run_id).instrument(span).await
    }

    async fn run_inner(&self, run_id: Uuid) -> Result<LoadSummary> {
        let started_at = Utc::now();
        // Validates the file before any warehouse object is touched.
        let exported = read_export(&self.export_path).await?;
        info!(rows = exported.len(), path = %self.export_path.display(), "loader started");

        let session = WarehouseSession::connect(&self.credentials, None)
            .await
            .context("connecting to warehouse")?;
        let (mut session, database_created) = self
            .open_database(session)
            .await
            .context("ensuring warehouse database")?;

        let outcome = self.provision_and_replace(&mut session).await;
        let closed = session.close().await;
        let (rows_staged, rows_copied) = outcome?;
        closed.context("closing warehouse session")?;

        if rows_copied != exported.len() as u64 {
            anyhow::bail!(
                "export holds {} rows but {} were copied into {}",
                exported.len(),
                rows_copied,
                self.target.table
            );
        }

        Ok(LoadSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            database_created,
            rows_staged,
            rows_copied,
            table: self.target.table.clone(),
        })
    }

    /// Bind compute, create the database when absent and reconnect into it.
    /// The session is closed on every failure path.
    async fn open_database(
        &self,
        mut session: WarehouseSession,
    ) -> Result<(WarehouseSession, bool), WarehouseError> {
        let target = &self.target;
        let created = match session.ensure_compute(&target.compute).await {
            Ok(()) => session.ensure_database(&target.database).await,
            Err(err) => Err(err),
        };
        let database_created = match created {
            Ok(created) => created,
            Err(err) => {
                session.close_quietly().await;
                return Err(err);
            }
        };
        let session = session.use_database(&target.database).await?;
        Ok((session, database_created))
    }

    async fn provision_and_replace(&self, session: &mut WarehouseSession) -> Result<(u64, u64)> {
        self.ensure_objects(session)
            .await
            .context("ensuring warehouse objects")?;
        self.replace_data(session)
            .await
            .context("replacing table data")
    }

    /// Idempotent phase: current schema and a freshly replaced table.
    async fn ensure_objects(&self, session: &mut WarehouseSession) -> Result<(), WarehouseError> {
        let target = &self.target;
        session.ensure_schema(&target.schema).await?;
        session.replace_table(&target.table).await?;
        info!(
            compute = %target.compute,
            database = %target.database,
            schema = %target.schema,
            "warehouse objects ready"
        );
        Ok(())
    }

    /// Non-idempotent phase. Not atomic: a failed copy leaves the table empty.
    async fn replace_data(
        &self,
        session: &mut WarehouseSession,
    ) -> Result<(u64, u64), WarehouseError> {
        let target = &self.target;
        session.replace_stage(&target.stage).await?;
        let rows_staged = session.put_file(&target.stage, &self.export_path).await?;
        let rows_copied = session
            .copy_into_table(&target.table, &target.stage, SKIP_HEADER_ROWS)
            .await?;
        let counted = session.count_rows(&target.table).await?;
        if counted != rows_copied as i64 {
            return Err(WarehouseError::RowCountMismatch {
                table: target.table.clone(),
                copied: rows_copied,
                counted,
            });
        }
        info!(rows_staged, rows_copied, "table data replaced");
        Ok((rows_staged, rows_copied))
    }
}

pub async fn run_collect_from_env() -> Result<CollectSummary> {
    let config = SyncConfig::from_env();
    Collector::new(config)?.run().await
}

pub async fn run_load_from_env() -> Result<LoadSummary> {
    let config = SyncConfig::from_env();
    let credentials = WarehouseCredentials::from_env().context("reading warehouse credentials")?;
    Loader::new(credentials, config.target, config.export_path)
        .run()
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn pod(title: &str, rating: &str, price: &str, status: &str) -> String {
        format!(
            r#"<article class="product_pod">
                 <p class="star-rating {rating}"></p>
                 <h3><a href="x/index.html" title="{title}">{title}</a></h3>
                 <p class="price_color">{price}</p>
                 <p class="instock availability">{status}</p>
               </article>"#
        )
    }

    async fn mount_page(server: &MockServer, page: u32, pods: &[String]) {
        Mock::given(method("GET"))
            .and(path(format!("/catalogue/page-{page}.html")))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(format!("<html><body>{}</body></html>", pods.join(""))),
            )
            .mount(server)
            .await;
    }

    fn config_for(server: &MockServer, page_count: u32, export_path: PathBuf) -> SyncConfig {
        SyncConfig {
            url_template: format!("{}/catalogue/page-{{page}}.html", server.uri()),
            page_count,
            export_path,
            ..Default::default()
        }
    }

    #[test]
    fn default_config_covers_fifty_pages() {
        let config = SyncConfig::default();
        assert_eq!(config.page_count, 50);
        assert_eq!(config.fetch_max_retries, 0);
        assert_eq!(config.export_path, PathBuf::from("Books.csv"));
        assert_eq!(
            config.url_template,
            "https://books.toscrape.com/catalogue/page-{page}.html"
        );
    }

    #[test]
    fn config_reads_overrides_and_ignores_garbage() {
        let vars = std::collections::HashMap::from([
            ("BOOKS_PAGE_COUNT", "3"),
            ("BOOKS_EXPORT_PATH", "out/listings.csv"),
            ("BOOKS_HTTP_TIMEOUT_SECS", "soon"),
            ("BOOKS_FETCH_MAX_RETRIES", "2"),
            ("BOOKS_SCHEMA", "staging_schema"),
        ]);
        let config = SyncConfig::from_vars(|name| vars.get(name).map(|v| v.to_string()));
        assert_eq!(config.page_count, 3);
        assert_eq!(config.export_path, PathBuf::from("out/listings.csv"));
        assert_eq!(config.http_timeout_secs, 20);
        assert_eq!(config.fetch_max_retries, 2);
        assert_eq!(config.user_agent, "books-bot/0.1");
        assert_eq!(config.target.schema, "staging_schema");
        assert_eq!(config.target.database, "book_db");
    }

    #[tokio::test]
    async fn single_page_run_writes_sanitized_row() {
        let server = MockServer::start().await;
        mount_page(&server, 1, &[pod("Book, A", "Three", "£10.00", "In stock")]).await;

        let dir = tempdir().unwrap();
        let export = dir.path().join("Books.csv");
        let summary = Collector::new(config_for(&server, 1, export.clone()))
            .unwrap()
            .run()
            .await
            .unwrap();

        assert_eq!(summary.listings, 1);
        assert_eq!(summary.pages_fetched, 1);
        let text = std::fs::read_to_string(&export).unwrap();
        assert_eq!(text, "Title,Rating,Price,Availability\nBook A,3,10.00,True\n");
    }

    #[tokio::test]
    async fn listings_keep_page_then_document_order() {
        let server = MockServer::start().await;
        mount_page(
            &server,
            1,
            &[
                pod("First", "One", "£1.00", "In stock"),
                pod("Second", "Two", "£2.00", "Out of stock"),
            ],
        )
        .await;
        mount_page(&server, 2, &[pod("Third", "Five", "£3.00", "In stock")]).await;

        let dir = tempdir().unwrap();
        let collector = Collector::new(config_for(&server, 2, dir.path().join("Books.csv"))).unwrap();
        let listings = collector.collect_listings(Uuid::new_v4()).await.unwrap();

        let titles = listings.iter().map(|l| l.title.as_str()).collect::<Vec<_>>();
        assert_eq!(titles, vec!["First", "Second", "Third"]);
        assert!(!listings[1].availability);
    }

    #[tokio::test]
    async fn failed_page_aborts_without_writing_export() {
        let server = MockServer::start().await;
        mount_page(&server, 1, &[pod("Only", "Four", "£4.00", "In stock")]).await;
        Mock::given(method("GET"))
            .and(path("/catalogue/page-2.html"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let export = dir.path().join("Books.csv");
        let err = Collector::new(config_for(&server, 2, export.clone()))
            .unwrap()
            .run()
            .await
            .unwrap_err();

        assert!(format!("{err:#}").contains("fetching catalogue page 2"));
        assert!(!export.exists());
    }

    #[tokio::test]
    async fn conversion_failure_aborts_run() {
        let server = MockServer::start().await;
        mount_page(&server, 1, &[pod("Odd", "Zero", "£4.00", "In stock")]).await;

        let dir = tempdir().unwrap();
        let export = dir.path().join("Books.csv");
        let err = Collector::new(config_for(&server, 1, export.clone()))
            .unwrap()
            .run()
            .await
            .unwrap_err();

        assert!(format!("{err:#}").contains("unknown rating word"));
        assert!(!export.exists());
    }

    struct FixtureAdapter;

    #[async_trait::async_trait]
    impl CatalogueAdapter for FixtureAdapter {
        fn source_id(&self) -> &'static str {
            "fixture"
        }

        fn page_url(&self, page: u32) -> String {
            format!("fixture://page-{page}.html")
        }

        async fn fetch_page(
            &self,
            _http: &HttpFetcher,
            _ctx: &AdapterContext,
            page: u32,
        ) -> Result<books_adapters::FetchedPage, books_adapters::AdapterError> {
            let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
                .join("../../fixtures/books-toscrape/page-1.html");
            Ok(books_adapters::FetchedPage {
                page,
                url: self.page_url(page),
                body: std::fs::read_to_string(path).expect("fixture page"),
                fetched_at: Utc::now(),
            })
        }

        fn parse_page(
            &self,
            page: &books_adapters::FetchedPage,
        ) -> Result<Vec<Listing>, books_adapters::AdapterError> {
            books_adapters::parse_listing_page(page.page, &page.body)
        }
    }

    #[tokio::test]
    async fn custom_adapter_replaces_http_source() {
        let dir = tempdir().unwrap();
        let export = dir.path().join("Books.csv");
        let config = SyncConfig {
            page_count: 2,
            export_path: export.clone(),
            ..Default::default()
        };
        let summary = Collector::new(config)
            .unwrap()
            .with_adapter(Box::new(FixtureAdapter))
            .run()
            .await
            .unwrap();

        assert_eq!(summary.listings, 8);
        let back = read_export(&export).await.unwrap();
        assert_eq!(back[0].title, "A Light in the Attic");
        assert_eq!(back[4].title, "A Light in the Attic");
        assert_eq!(summary.export_sha256.len(), 64);
    }

    #[tokio::test]
    async fn loader_rejects_missing_export_before_connecting() {
        let dir = tempdir().unwrap();
        let loader = Loader::new(
            WarehouseCredentials {
                account: "127.0.0.1:1".into(),
                user: "nobody".into(),
                password: "nothing".into(),
            },
            WarehouseTarget::default(),
            dir.path().join("missing.csv"),
        );
        let err = loader.run().await.unwrap_err();
        assert!(format!("{err:#}").contains("reading export"));
    }
}
