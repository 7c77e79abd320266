//! Core domain model, field conversions and shared constants for the books pipeline.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "books-core";

/// Pages requested by a default collector run (inclusive range starting at 1).
pub const DEFAULT_PAGE_COUNT: u32 = 50;

/// Added to the distinct-title count shown as "total books" on the dashboard.
/// Reproduces the published dashboard figure, which is one higher than the
/// number of distinct titles.
pub const TOTAL_BOOKS_ADJUSTMENT: usize = 1;

/// Value of the out-of-stock pie slice in the literal dashboard rendering.
/// The published chart never counted out-of-stock rows.
pub const LITERAL_OUT_OF_STOCK_SLICE: usize = 0;

/// Status text that marks a listing as available.
pub const IN_STOCK_TEXT: &str = "In stock";

/// Header row of the listing export file.
pub const EXPORT_HEADER: [&str; 4] = ["Title", "Rating", "Price", "Availability"];

/// One scraped catalogue entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    pub title: String,
    pub rating: Rating,
    pub price: Price,
    pub availability: bool,
}

impl Listing {
    pub fn availability_label(&self) -> &'static str {
        availability_label(self.availability)
    }
}

pub fn availability_label(available: bool) -> &'static str {
    if available {
        "In Stock"
    } else {
        "Out of Stock"
    }
}

/// Star rating between 1 and 5.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Rating(u8);

impl Rating {
    pub const ALL: [Rating; 5] = [Rating(1), Rating(2), Rating(3), Rating(4), Rating(5)];

    pub fn new(value: u8) -> Result<Self, ConversionError> {
        if (1..=5).contains(&value) {
            Ok(Self(value))
        } else {
            Err(ConversionError::RatingOutOfRange(i64::from(value)))
        }
    }

    /// Parse a rating word such as `Three` (case-insensitive).
    pub fn from_word(word: &str) -> Result<Self, ConversionError> {
        let value = match word.trim().to_ascii_lowercase().as_str() {
            "one" => 1,
            "two" => 2,
            "three" => 3,
            "four" => 4,
            "five" => 5,
            _ => return Err(ConversionError::UnknownRatingWord(word.to_string())),
        };
        Ok(Self(value))
    }

    pub fn value(self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for Rating {
    type Error = ConversionError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Rating::new(value)
    }
}

impl TryFrom<i32> for Rating {
    type Error = ConversionError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        u8::try_from(value)
            .map_err(|_| ConversionError::RatingOutOfRange(i64::from(value)))
            .and_then(Rating::new)
    }
}

impl From<Rating> for u8 {
    fn from(rating: Rating) -> Self {
        rating.0
    }
}

impl fmt::Display for Rating {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Listing price in the catalogue currency. Displays with two decimals.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Price(f64);

impl Price {
    pub fn new(value: f64) -> Result<Self, ConversionError> {
        if value.is_finite() {
            Ok(Self(value))
        } else {
            Err(ConversionError::InvalidPrice(value.to_string()))
        }
    }

    /// Strip the one-character currency prefix (`£51.77`) and parse the rest.
    pub fn from_prefixed_text(text: &str) -> Result<Self, ConversionError> {
        let trimmed = text.trim();
        let mut chars = trimmed.chars();
        match chars.next() {
            Some(symbol) if !symbol.is_ascii_digit() && symbol != '.' && symbol != '-' => {}
            _ => return Err(ConversionError::InvalidPrice(text.to_string())),
        }
        Self::from_plain_text(chars.as_str())
            .map_err(|_| ConversionError::InvalidPrice(text.to_string()))
    }

    /// Parse a bare decimal such as `51.77`.
    pub fn from_plain_text(text: &str) -> Result<Self, ConversionError> {
        let trimmed = text.trim();
        if trimmed.is_empty()
            || !trimmed
                .chars()
                .all(|c| c.is_ascii_digit() || c == '.' || c == '-')
        {
            return Err(ConversionError::InvalidPrice(text.to_string()));
        }
        trimmed
            .parse::<f64>()
            .map_err(|_| ConversionError::InvalidPrice(text.to_string()))
            .and_then(Self::new)
    }

    pub fn value(self) -> f64 {
        self.0
    }
}

impl fmt::Display for Price {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2}", self.0)
    }
}

/// True only for the exact status text `In stock` (after trimming).
pub fn parse_availability(status_text: &str) -> bool {
    status_text.trim() == IN_STOCK_TEXT
}

/// Make a title safe for the comma-delimited export: newlines and commas
/// become spaces and whitespace runs collapse to one space.
pub fn sanitize_title(raw: &str) -> String {
    let replaced = raw.replace(['\n', '\r', ','], " ");
    replaced.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConversionError {
    #[error("unknown rating word {0:?}")]
    UnknownRatingWord(String),
    #[error("rating {0} is outside 1..=5")]
    RatingOutOfRange(i64),
    #[error("unparsable price {0:?}")]
    InvalidPrice(String),
    #[error("unparsable availability flag {0:?}")]
    InvalidAvailability(String),
}

/// Failure kinds across the pipeline. Every kind is fatal to the run that
/// raised it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    Fetch,
    Parse,
    Conversion,
    Connection,
    Provisioning,
    Load,
    Query,
}

impl ErrorKind {
    /// Kinds that may be retried when a retry policy is switched on.
    pub fn retry_allowed(self) -> bool {
        matches!(self, ErrorKind::Fetch | ErrorKind::Load)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Fetch => "fetch",
            ErrorKind::Parse => "parse",
            ErrorKind::Conversion => "conversion",
            ErrorKind::Connection => "connection",
            ErrorKind::Provisioning => "provisioning",
            ErrorKind::Load => "load",
            ErrorKind::Query => "query",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ConversionError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Conversion
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rating_words_map_to_numbers() {
        for (word, expected) in [("one", 1), ("two", 2), ("three", 3), ("four", 4), ("five", 5)] {
            assert_eq!(Rating::from_word(word).unwrap().value(), expected);
        }
        assert_eq!(Rating::from_word("Three").unwrap().value(), 3);
    }

    #[test]
    fn unknown_rating_words_fail() {
        for word in ["zero", "six", "", "3", "star-rating"] {
            assert_eq!(
                Rating::from_word(word),
                Err(ConversionError::UnknownRatingWord(word.to_string()))
            );
        }
    }

    #[test]
    fn rating_range_is_enforced() {
        assert!(Rating::new(0).is_err());
        assert!(Rating::new(6).is_err());
        assert!(Rating::try_from(-1i32).is_err());
        assert_eq!(Rating::try_from(4i32).unwrap().value(), 4);
    }

    #[test]
    fn prefixed_prices_parse_exactly() {
        assert_eq!(Price::from_prefixed_text("£51.77").unwrap().value(), 51.77);
        assert_eq!(Price::from_prefixed_text(" $10.00 ").unwrap().value(), 10.0);
        assert_eq!(Price::from_prefixed_text("£0.99").unwrap().to_string(), "0.99");
    }

    #[test]
    fn malformed_prices_fail() {
        for text in ["", "£", "£abc", "51.77", "££1.00", "£1,000.00"] {
            assert!(
                Price::from_prefixed_text(text).is_err(),
                "{text:?} should not parse"
            );
        }
    }

    #[test]
    fn price_displays_two_decimals() {
        assert_eq!(Price::new(10.0).unwrap().to_string(), "10.00");
        assert_eq!(Price::new(53.5).unwrap().to_string(), "53.50");
        assert!(Price::new(f64::NAN).is_err());
    }

    #[test]
    fn availability_requires_exact_in_stock() {
        assert!(parse_availability("In stock"));
        assert!(parse_availability("\n    In stock\n  "));
        assert!(!parse_availability("Out of stock"));
        assert!(!parse_availability("in stock"));
        assert!(!parse_availability(""));
    }

    #[test]
    fn titles_lose_commas_and_newlines() {
        assert_eq!(sanitize_title("Book, A"), "Book A");
        assert_eq!(sanitize_title("Line\nBreak,Title"), "Line Break Title");
        assert_eq!(sanitize_title("  Plain  "), "Plain");
    }

    #[test]
    fn only_fetch_and_load_are_retryable() {
        let retryable = [
            ErrorKind::Fetch,
            ErrorKind::Parse,
            ErrorKind::Conversion,
            ErrorKind::Connection,
            ErrorKind::Provisioning,
            ErrorKind::Load,
            ErrorKind::Query,
        ]
        .into_iter()
        .filter(|k| k.retry_allowed())
        .collect::<Vec<_>>();
        assert_eq!(retryable, vec![ErrorKind::Fetch, ErrorKind::Load]);
    }
}
