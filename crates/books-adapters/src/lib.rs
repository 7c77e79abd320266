//! Catalogue source adapter contract + the books.toscrape.com listing parser.

use async_trait::async_trait;
use books_core::{parse_availability, sanitize_title, ConversionError, ErrorKind, Listing, Price, Rating};
use books_storage::{FetchError, HttpFetcher};
use chrono::{DateTime, Utc};
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "books-adapters";

pub const DEFAULT_URL_TEMPLATE: &str = "https://books.toscrape.com/catalogue/page-{page}.html";

const LISTING_SELECTOR: &str = "article.product_pod";
const TITLE_SELECTOR: &str = "h3 a";
const RATING_SELECTOR: &str = "p";
const PRICE_SELECTOR: &str = "p.price_color";
const AVAILABILITY_SELECTOR: &str = "p.availability";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterContext {
    pub run_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchedPage {
    pub page: u32,
    pub url: String,
    pub body: String,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("invalid selector {selector:?}: {message}")]
    Selector { selector: String, message: String },
    #[error("listing {index}: nothing matches {selector:?}")]
    MissingElement { index: usize, selector: &'static str },
    #[error("listing {index}: {selector:?} has no {attribute:?}")]
    MissingAttribute {
        index: usize,
        selector: &'static str,
        attribute: &'static str,
    },
    #[error("listing {index}: title is empty after sanitizing")]
    EmptyTitle { index: usize },
    #[error("body is not valid UTF-8: {0}")]
    NotUtf8(#[source] std::str::Utf8Error),
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("page {page}: {source}")]
    Parse {
        page: u32,
        #[source]
        source: ParseError,
    },
    #[error("page {page}, listing {index}: {source}")]
    Conversion {
        page: u32,
        index: usize,
        #[source]
        source: ConversionError,
    },
}

impl AdapterError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AdapterError::Fetch(_) => ErrorKind::Fetch,
            AdapterError::Parse { .. } => ErrorKind::Parse,
            AdapterError::Conversion { .. } => ErrorKind::Conversion,
        }
    }
}

#[async_trait]
pub trait CatalogueAdapter: Send + Sync {
    fn source_id(&self) -> &'static str;

    fn page_url(&self, page: u32) -> String;

    async fn fetch_page(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        page: u32,
    ) -> Result<FetchedPage, AdapterError>;

    fn parse_page(&self, page: &FetchedPage) -> Result<Vec<Listing>, AdapterError>;
}

#[derive(Debug, Clone)]
pub struct BooksToScrapeAdapter {
    url_template: String,
}

impl Default for BooksToScrapeAdapter {
    fn default() -> Self {
        Self::new(DEFAULT_URL_TEMPLATE)
    }
}

impl BooksToScrapeAdapter {
    pub fn new(url_template: impl Into<String>) -> Self {
        Self {
            url_template: url_template.into(),
        }
    }
}

#[async_trait]
impl CatalogueAdapter for BooksToScrapeAdapter {
    fn source_id(&self) -> &'static str {
        "books-toscrape"
    }

    fn page_url(&self, page: u32) -> String {
        page_url(&self.url_template, page)
    }

    async fn fetch_page(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        page: u32,
    ) -> Result<FetchedPage, AdapterError> {
        let url = self.page_url(page);
        let response = http.fetch_bytes(ctx.run_id, &url).await?;
        let body = response.text().map_err(|err| AdapterError::Parse {
            page,
            source: ParseError::NotUtf8(err),
        })?;
        Ok(FetchedPage {
            page,
            url: response.final_url.clone(),
            body,
            fetched_at: Utc::now(),
        })
    }

    fn parse_page(&self, page: &FetchedPage) -> Result<Vec<Listing>, AdapterError> {
        let listings = parse_listing_page(page.page, &page.body)?;
        debug!(page = page.page, listings = listings.len(), "parsed listing page");
        Ok(listings)
    }
}

pub fn page_url(template: &str, page: u32) -> String {
    template.replace("{page}", &page.to_string())
}

fn selector(css: &str) -> Result<Selector, ParseError> {
    Selector::parse(css).map_err(|e| ParseError::Selector {
        selector: css.to_string(),
        message: e.to_string(),
    })
}

struct ListingSelectors {
    listing: Selector,
    title: Selector,
    rating: Selector,
    price: Selector,
    availability: Selector,
}

impl ListingSelectors {
    fn build() -> Result<Self, ParseError> {
        Ok(Self {
            listing: selector(LISTING_SELECTOR)?,
            title: selector(TITLE_SELECTOR)?,
            rating: selector(RATING_SELECTOR)?,
            price: selector(PRICE_SELECTOR)?,
            availability: selector(AVAILABILITY_SELECTOR)?,
        })
    }
}

fn first_match<'a>(
    container: ElementRef<'a>,
    sel: &Selector,
    index: usize,
    name: &'static str,
) -> Result<ElementRef<'a>, ParseError> {
    container
        .select(sel)
        .next()
        .ok_or(ParseError::MissingElement {
            index,
            selector: name,
        })
}

fn element_text(element: ElementRef<'_>) -> String {
    element.text().collect::<String>().trim().to_string()
}

/// Parse every `article.product_pod` on a catalogue page, in document order.
/// The first missing element or failed conversion aborts the whole page.
pub fn parse_listing_page(page: u32, html: &str) -> Result<Vec<Listing>, AdapterError> {
    let parse_err = |source| AdapterError::Parse { page, source };
    let selectors = ListingSelectors::build().map_err(parse_err)?;
    let document = Html::parse_document(html);

    let mut out = Vec::new();
    for (index, article) in document.select(&selectors.listing).enumerate() {
        let title = first_match(article, &selectors.title, index, TITLE_SELECTOR)
            .map_err(parse_err)?
            .value()
            .attr("title")
            .ok_or(ParseError::MissingAttribute {
                index,
                selector: TITLE_SELECTOR,
                attribute: "title",
            })
            .map_err(parse_err)?;

        let rating_word = first_match(article, &selectors.rating, index, RATING_SELECTOR)
            .map_err(parse_err)?
            .value()
            .attr("class")
            .and_then(|classes| classes.split_whitespace().nth(1))
            .ok_or(ParseError::MissingAttribute {
                index,
                selector: RATING_SELECTOR,
                attribute: "class",
            })
            .map_err(parse_err)?;

        let price_text = element_text(
            first_match(article, &selectors.price, index, PRICE_SELECTOR).map_err(parse_err)?,
        );
        let status_text = element_text(
            first_match(article, &selectors.availability, index, AVAILABILITY_SELECTOR)
                .map_err(parse_err)?,
        );

        let title = sanitize_title(title);
        if title.is_empty() {
            return Err(parse_err(ParseError::EmptyTitle { index }));
        }

        let conversion_err = |source| AdapterError::Conversion {
            page,
            index,
            source,
        };
        out.push(Listing {
            title,
            rating: Rating::from_word(rating_word).map_err(conversion_err)?,
            price: Price::from_prefixed_text(&price_text).map_err(conversion_err)?,
            availability: parse_availability(&status_text),
        });
    }
    Ok(out)
}
