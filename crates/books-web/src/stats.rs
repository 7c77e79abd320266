//! Aggregates and chart figures derived from the in-memory `Books` table.

use std::collections::HashSet;

use books_core::{availability_label, Listing, Rating, LITERAL_OUT_OF_STOCK_SLICE, TOTAL_BOOKS_ADJUSTMENT};
use serde::Serialize;
use serde_json::{json, Value as JsonValue};

/// Rows shown in each of the most/least expensive tables.
pub const PRICE_TABLE_ROWS: usize = 5;

/// Distinct titles plus [`TOTAL_BOOKS_ADJUSTMENT`].
pub fn total_books(rows: &[Listing]) -> usize {
    let distinct = rows.iter().map(|r| r.title.as_str()).collect::<HashSet<_>>();
    distinct.len() + TOTAL_BOOKS_ADJUSTMENT
}

pub fn average_price(rows: &[Listing]) -> Option<f64> {
    if rows.is_empty() {
        return None;
    }
    let sum: f64 = rows.iter().map(|r| r.price.value()).sum();
    Some(sum / rows.len() as f64)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AvailabilityShare {
    pub in_stock: usize,
    pub out_of_stock: usize,
}

impl AvailabilityShare {
    /// In-stock count against the fixed [`LITERAL_OUT_OF_STOCK_SLICE`].
    pub fn literal(rows: &[Listing]) -> Self {
        Self {
            in_stock: rows.iter().filter(|r| r.availability).count(),
            out_of_stock: LITERAL_OUT_OF_STOCK_SLICE,
        }
    }

    /// Both slices counted from the rows.
    pub fn counted(rows: &[Listing]) -> Self {
        let in_stock = rows.iter().filter(|r| r.availability).count();
        Self {
            in_stock,
            out_of_stock: rows.len() - in_stock,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RatingBucket {
    pub rating: u8,
    pub count: usize,
    pub mean_price: Option<f64>,
}

/// One bucket per rating 1..=5, empty ratings included.
pub fn rating_breakdown(rows: &[Listing]) -> Vec<RatingBucket> {
    Rating::ALL
        .iter()
        .map(|rating| {
            let prices = rows
                .iter()
                .filter(|r| r.rating == *rating)
                .map(|r| r.price.value())
                .collect::<Vec<_>>();
            let mean_price = if prices.is_empty() {
                None
            } else {
                Some(prices.iter().sum::<f64>() / prices.len() as f64)
            };
            RatingBucket {
                rating: rating.value(),
                count: prices.len(),
                mean_price,
            }
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PriceRow {
    pub title: String,
    pub price: String,
}

fn sorted_by_price_desc(rows: &[Listing]) -> Vec<&Listing> {
    let mut sorted = rows.iter().collect::<Vec<_>>();
    sorted.sort_by(|a, b| b.price.value().total_cmp(&a.price.value()));
    sorted
}

fn price_row(listing: &Listing) -> PriceRow {
    PriceRow {
        title: listing.title.clone(),
        price: listing.price.to_string(),
    }
}

/// Head of the price-descending ordering.
pub fn most_expensive(rows: &[Listing], n: usize) -> Vec<PriceRow> {
    sorted_by_price_desc(rows)
        .into_iter()
        .take(n)
        .map(price_row)
        .collect()
}

/// Tail of the price-descending ordering, so the cheapest row comes last.
pub fn least_expensive(rows: &[Listing], n: usize) -> Vec<PriceRow> {
    let sorted = sorted_by_price_desc(rows);
    let start = sorted.len().saturating_sub(n);
    sorted[start..].iter().map(|l| price_row(l)).collect()
}

/// Every distinct title in first-seen order.
pub fn distinct_titles(rows: &[Listing]) -> Vec<String> {
    let mut seen = HashSet::new();
    rows.iter()
        .filter(|r| seen.insert(r.title.as_str()))
        .map(|r| r.title.clone())
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BookDetail {
    pub title: String,
    pub price: String,
    pub rating: u8,
    pub availability: &'static str,
}

/// First row whose title matches exactly.
pub fn lookup(rows: &[Listing], title: &str) -> Option<BookDetail> {
    rows.iter().find(|r| r.title == title).map(|r| BookDetail {
        title: r.title.clone(),
        price: r.price.to_string(),
        rating: r.rating.value(),
        availability: availability_label(r.availability),
    })
}

/// Plotly pie figure for the availability share.
pub fn availability_figure(share: &AvailabilityShare) -> JsonValue {
    json!({
        "data": [{
            "type": "pie",
            "labels": ["In Stock", "Out of Stock"],
            "values": [share.in_stock, share.out_of_stock],
            "marker": {"colors": ["green", "red"]},
            "sort": false
        }],
        "layout": {
            "title": {
                "text": "In Stock vs Out of Stock",
                "y": 1,
                "x": 0.5,
                "xanchor": "center",
                "yanchor": "top"
            }
        }
    })
}

/// Plotly bar + line figure: count per rating on `y`, mean price on `y2`.
pub fn rating_figure(buckets: &[RatingBucket]) -> JsonValue {
    let ratings = buckets.iter().map(|b| b.rating).collect::<Vec<_>>();
    let counts = buckets.iter().map(|b| b.count).collect::<Vec<_>>();
    let means = buckets.iter().map(|b| b.mean_price).collect::<Vec<_>>();
    json!({
        "data": [
            {"type": "bar", "x": ratings, "y": counts, "name": "Number of Books"},
            {"type": "scatter", "x": ratings, "y": means, "name": "Average Price", "yaxis": "y2"}
        ],
        "layout": {
            "autosize": false,
            "width": 700,
            "height": 500,
            "xaxis": {"title": {"text": "Ratings"}, "type": "category"},
            "yaxis": {"title": {"text": "Number of Books"}},
            "yaxis2": {"title": {"text": "Average Price"}, "overlaying": "y", "side": "right"},
            "legend": {"x": 0.9, "y": 1.2}
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use books_core::Price;

    fn row(title: &str, rating: u8, price: f64, availability: bool) -> Listing {
        Listing {
            title: title.to_string(),
            rating: Rating::new(rating).unwrap(),
            price: Price::new(price).unwrap(),
            availability,
        }
    }

    #[test]
    fn mean_price_over_all_rows() {
        let rows = vec![row("A", 1, 10.0, true), row("B", 2, 20.0, true), row("C", 3, 30.0, true)];
        assert_eq!(average_price(&rows), Some(20.0));
        assert_eq!(average_price(&[]), None);
    }

    #[test]
    fn total_books_is_distinct_titles_plus_one() {
        let rows = vec![row("A", 1, 1.0, true), row("B", 1, 1.0, true), row("A", 2, 2.0, true)];
        assert_eq!(total_books(&rows), 3);
        assert_eq!(total_books(&[]), 1);
    }

    #[test]
    fn literal_share_ignores_out_of_stock_rows() {
        let rows = vec![row("A", 1, 1.0, true), row("B", 1, 1.0, true), row("C", 1, 1.0, false)];
        assert_eq!(
            AvailabilityShare::literal(&rows),
            AvailabilityShare { in_stock: 2, out_of_stock: 0 }
        );
        assert_eq!(
            AvailabilityShare::counted(&rows),
            AvailabilityShare { in_stock: 2, out_of_stock: 1 }
        );
    }

    #[test]
    fn rating_breakdown_covers_all_five_ratings() {
        let rows = vec![row("A", 1, 10.0, true), row("B", 1, 20.0, true), row("C", 4, 7.5, true)];
        let buckets = rating_breakdown(&rows);
        assert_eq!(buckets.len(), 5);
        assert_eq!(buckets[0], RatingBucket { rating: 1, count: 2, mean_price: Some(15.0) });
        assert_eq!(buckets[1], RatingBucket { rating: 2, count: 0, mean_price: None });
        assert_eq!(buckets[3].mean_price, Some(7.5));
    }

    #[test]
    fn price_tables_take_head_and_tail_of_descending_sort() {
        let rows = (1..=7)
            .map(|i| row(&format!("B{i}"), 3, f64::from(i), true))
            .collect::<Vec<_>>();

        let top = most_expensive(&rows, PRICE_TABLE_ROWS);
        assert_eq!(
            top.iter().map(|r| r.title.as_str()).collect::<Vec<_>>(),
            vec!["B7", "B6", "B5", "B4", "B3"]
        );
        assert_eq!(top[0].price, "7.00");

        let bottom = least_expensive(&rows, PRICE_TABLE_ROWS);
        assert_eq!(
            bottom.iter().map(|r| r.title.as_str()).collect::<Vec<_>>(),
            vec!["B5", "B4", "B3", "B2", "B1"]
        );
    }

    #[test]
    fn price_tables_handle_short_tables() {
        let rows = vec![row("Only", 2, 3.0, true)];
        assert_eq!(most_expensive(&rows, 5).len(), 1);
        assert_eq!(least_expensive(&rows, 5).len(), 1);
        assert!(least_expensive(&[], 5).is_empty());
    }

    #[test]
    fn titles_are_distinct_in_first_seen_order() {
        let rows = vec![row("B", 1, 1.0, true), row("A", 1, 1.0, true), row("B", 1, 1.0, true)];
        assert_eq!(distinct_titles(&rows), vec!["B".to_string(), "A".to_string()]);
    }

    #[test]
    fn lookup_returns_first_match() {
        let rows = vec![row("Dup", 2, 5.0, false), row("Dup", 4, 9.0, true)];
        let detail = lookup(&rows, "Dup").unwrap();
        assert_eq!(detail.price, "5.00");
        assert_eq!(detail.rating, 2);
        assert_eq!(detail.availability, "Out of Stock");
        assert!(lookup(&rows, "Missing").is_none());
    }

    #[test]
    fn figures_carry_series_values() {
        let share = AvailabilityShare { in_stock: 2, out_of_stock: 0 };
        let pie = availability_figure(&share);
        assert_eq!(pie["data"][0]["values"], json!([2, 0]));

        let buckets = rating_breakdown(&[row("A", 5, 4.0, true)]);
        let fig = rating_figure(&buckets);
        assert_eq!(fig["data"][0]["x"], json!([1, 2, 3, 4, 5]));
        assert_eq!(fig["data"][0]["y"], json!([0, 0, 0, 0, 1]));
        assert_eq!(fig["data"][1]["y"], json!([null, null, null, null, 4.0]));
        assert_eq!(fig["data"][1]["yaxis"], "y2");
    }
}
