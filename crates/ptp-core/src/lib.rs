//! Core domain model for PriceTracker Pro.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "ptp-core";

/// Search result as handed over by a search source, before normalization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawListing {
    pub product_name: String,
    pub store: String,
    pub price_text: String,
    #[serde(default)]
    pub discount_text: Option<String>,
    #[serde(default)]
    pub original_price_text: Option<String>,
    pub link: String,
}

/// One normalized marketplace offer observed in one collection run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Listing {
    pub product_name: String,
    pub store: String,
    pub price_text: String,
    pub price_numeric: Decimal,
    pub discount_text: Option<String>,
    /// Percentage, present iff `discount_text` carried a percentage.
    pub discount_numeric: Option<Decimal>,
    /// List price before the discount, when the source shows one.
    pub original_price: Option<Decimal>,
    pub link: String,
}

impl Listing {
    pub fn key(&self) -> ListingKey {
        ListingKey {
            product_name: self.product_name.clone(),
            store: self.store.clone(),
        }
    }
}

/// Identity of "the same item" across snapshots.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ListingKey {
    pub product_name: String,
    pub store: String,
}

pub fn is_discounted(listing: &Listing) -> bool {
    listing.discount_numeric.is_some()
}

/// An empty store list matches every listing; comparison ignores case and surrounding whitespace.
pub fn matches_store_filter(listing: &Listing, stores: &[String]) -> bool {
    if stores.is_empty() {
        return true;
    }
    let store = listing.store.trim();
    stores
        .iter()
        .any(|wanted| wanted.trim().eq_ignore_ascii_case(store))
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingFilter {
    #[serde(default)]
    pub min_price: Option<Decimal>,
    #[serde(default)]
    pub max_price: Option<Decimal>,
    #[serde(default)]
    pub stores: Vec<String>,
    #[serde(default)]
    pub only_discounts: bool,
}

impl ListingFilter {
    pub fn matches(&self, listing: &Listing) -> bool {
        if let Some(min) = self.min_price {
            if listing.price_numeric < min {
                return false;
            }
        }
        if let Some(max) = self.max_price {
            if listing.price_numeric > max {
                return false;
            }
        }
        if self.only_discounts && !is_discounted(listing) {
            return false;
        }
        matches_store_filter(listing, &self.stores)
    }
}

/// Every listing collected by a single run. Listings carry no timestamp of
/// their own, so they all share `collected_at` by construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub run_id: Uuid,
    pub collected_at: DateTime<Utc>,
    pub listings: Vec<Listing>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotSummary {
    pub collected_at: DateTime<Utc>,
    pub offers: usize,
    pub min_price: Option<Decimal>,
    pub promotions: usize,
    pub stores: usize,
}

impl Snapshot {
    pub fn new(run_id: Uuid, collected_at: DateTime<Utc>, listings: Vec<Listing>) -> Self {
        Self {
            run_id,
            collected_at,
            listings,
        }
    }

    /// Lowest-priced listing per key. On equal prices the earlier listing wins.
    pub fn best_offers(&self) -> BTreeMap<ListingKey, &Listing> {
        let mut best: BTreeMap<ListingKey, &Listing> = BTreeMap::new();
        for listing in &self.listings {
            best.entry(listing.key())
                .and_modify(|current| {
                    if listing.price_numeric < current.price_numeric {
                        *current = listing;
                    }
                })
                .or_insert(listing);
        }
        best
    }

    pub fn best_price(&self, key: &ListingKey) -> Option<Decimal> {
        self.listings
            .iter()
            .filter(|l| l.product_name == key.product_name && l.store == key.store)
            .map(|l| l.price_numeric)
            .min()
    }

    pub fn cheapest(&self, n: usize) -> Vec<&Listing> {
        let mut sorted = self.listings.iter().collect::<Vec<_>>();
        sorted.sort_by_key(|l| l.price_numeric);
        sorted.truncate(n);
        sorted
    }

    /// Listings matching `filter`, cheapest first.
    pub fn filter(&self, filter: &ListingFilter) -> Vec<&Listing> {
        let mut rows = self
            .listings
            .iter()
            .filter(|l| filter.matches(l))
            .collect::<Vec<_>>();
        rows.sort_by_key(|l| l.price_numeric);
        rows
    }

    pub fn summary(&self) -> SnapshotSummary {
        let mut stores = self
            .listings
            .iter()
            .map(|l| l.store.as_str())
            .collect::<Vec<_>>();
        stores.sort_unstable();
        stores.dedup();
        SnapshotSummary {
            collected_at: self.collected_at,
            offers: self.listings.len(),
            min_price: self.listings.iter().map(|l| l.price_numeric).min(),
            promotions: self.listings.iter().filter(|l| is_discounted(l)).count(),
            stores: stores.len(),
        }
    }
}

/// Price movement of one key between the latest snapshot and the most recent
/// earlier snapshot that contained it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrendRecord {
    pub product: String,
    pub store: String,
    pub previous_price: Option<Decimal>,
    pub current_price: Decimal,
    pub variation_percent: Option<Decimal>,
}

impl TrendRecord {
    pub fn key(&self) -> ListingKey {
        ListingKey {
            product_name: self.product.clone(),
            store: self.store.clone(),
        }
    }
}

/// Rendered chart that can be served to a browser or attached to a notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrendArtifact {
    pub file_name: String,
    pub content_type: String,
    pub content: String,
}
