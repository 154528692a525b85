//! Search source contracts, listing normalization and page collection.

use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, OnceLock};

use anyhow::{Context, Result};
use async_trait::async_trait;
use ptp_core::{Listing, RawListing};
use ptp_storage::{FetchError, HttpFetcher};
use regex::Regex;
use reqwest::Url;
use rust_decimal::Decimal;
use scraper::{ElementRef, Html, Selector};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "ptp-adapters";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchContext {
    pub run_id: Uuid,
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("page {page} is not available")]
    PageUnavailable { page: u32 },
}

/// External provider of search results for a product query.
#[async_trait]
pub trait SearchSource: Send + Sync {
    fn source_id(&self) -> &str;

    async fn search(
        &self,
        ctx: &SearchContext,
        query: &str,
        page: u32,
    ) -> Result<Vec<RawListing>, SourceError>;
}

/// Separator convention used to read every price of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceLocale {
    /// `1.234,56`: period groups thousands, comma marks decimals.
    #[default]
    Brazilian,
    /// `1,234.56`: comma groups thousands, period marks decimals.
    International,
}

impl PriceLocale {
    fn thousands_separator(self) -> char {
        match self {
            Self::Brazilian => '.',
            Self::International => ',',
        }
    }

    fn decimal_separator(self) -> char {
        match self {
            Self::Brazilian => ',',
            Self::International => '.',
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("missing {0}")]
    MissingField(&'static str),
    #[error("no digits in price text {0:?}")]
    NoDigits(String),
    #[error("malformed price text {0:?}")]
    MalformedPrice(String),
    #[error("price must be positive, got {0}")]
    NonPositivePrice(Decimal),
    #[error("link {0:?} is not an absolute http(s) url")]
    InvalidLink(String),
}

/// Reads the first number in `text` under `locale`.
///
/// Currency symbols and trailing words are ignored; the thousands separator
/// is removed and the decimal separator becomes the decimal point.
pub fn parse_price(text: &str, locale: PriceLocale) -> Result<Decimal, ParseError> {
    let thousands = locale.thousands_separator();
    let decimal = locale.decimal_separator();

    let token = text
        .char_indices()
        .find(|(_, c)| c.is_ascii_digit())
        .map(|(start, _)| {
            text[start..]
                .chars()
                .take_while(|c| c.is_ascii_digit() || *c == thousands || *c == decimal)
                .collect::<String>()
        })
        .ok_or_else(|| ParseError::NoDigits(text.to_string()))?;

    let mut canonical = String::with_capacity(token.len());
    let mut decimal_seen = false;
    for ch in token.chars() {
        if ch == thousands {
            continue;
        }
        if ch == decimal {
            if decimal_seen {
                return Err(ParseError::MalformedPrice(text.to_string()));
            }
            decimal_seen = true;
            canonical.push('.');
            continue;
        }
        canonical.push(ch);
    }
    let canonical = canonical.trim_end_matches('.');

    let value =
        Decimal::from_str(canonical).map_err(|_| ParseError::MalformedPrice(text.to_string()))?;
    if value <= Decimal::ZERO {
        return Err(ParseError::NonPositivePrice(value));
    }
    Ok(value.normalize())
}

fn discount_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(\d+(?:[.,]\d+)?)\s*%").expect("valid discount pattern"))
}

/// Percentage carried by a discount label such as `"20% OFF"` or `"-12,5 %"`.
pub fn parse_discount(text: &str) -> Option<Decimal> {
    let caps = discount_pattern().captures(text)?;
    let number = caps.get(1)?.as_str().replace(',', ".");
    Decimal::from_str(&number).ok().map(|d| d.normalize())
}

fn non_empty(value: &str, field: &'static str) -> Result<String, ParseError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        Err(ParseError::MissingField(field))
    } else {
        Ok(trimmed.to_string())
    }
}

fn validate_link(link: &str) -> Result<String, ParseError> {
    let trimmed = link.trim();
    match Url::parse(trimmed) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => Ok(trimmed.to_string()),
        _ => Err(ParseError::InvalidLink(trimmed.to_string())),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NormalizedBatch {
    pub listings: Vec<Listing>,
    pub dropped: usize,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Normalizer {
    locale: PriceLocale,
}

impl Normalizer {
    pub fn new(locale: PriceLocale) -> Self {
        Self { locale }
    }

    pub fn try_normalize(&self, raw: &RawListing) -> Result<Listing, ParseError> {
        let product_name = non_empty(&raw.product_name, "product name")?;
        let store = non_empty(&raw.store, "store")?;
        let link = validate_link(&raw.link)?;
        let price_numeric = parse_price(&raw.price_text, self.locale)?;

        let discount_numeric = raw.discount_text.as_deref().and_then(parse_discount);
        let discount_text = match discount_numeric {
            Some(_) => raw.discount_text.as_ref().map(|t| t.trim().to_string()),
            None => None,
        };
        let original_price = raw
            .original_price_text
            .as_deref()
            .and_then(|t| parse_price(t, self.locale).ok());

        Ok(Listing {
            product_name,
            store,
            price_text: raw.price_text.trim().to_string(),
            price_numeric,
            discount_text,
            discount_numeric,
            original_price,
            link,
        })
    }

    /// Malformed input is dropped rather than failing the run.
    pub fn normalize(&self, raw: &RawListing) -> Option<Listing> {
        match self.try_normalize(raw) {
            Ok(listing) => Some(listing),
            Err(err) => {
                debug!(error = %err, product = %raw.product_name, store = %raw.store, "dropping listing");
                None
            }
        }
    }

    pub fn normalize_all(&self, raws: &[RawListing]) -> NormalizedBatch {
        let mut batch = NormalizedBatch::default();
        for raw in raws {
            match self.normalize(raw) {
                Some(listing) => batch.listings.push(listing),
                None => batch.dropped += 1,
            }
        }
        batch
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CollectionError {
    #[error("no_results: all {pages_attempted} result pages failed")]
    NoResults { pages_attempted: u32 },
}

impl CollectionError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NoResults { .. } => "no_results",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectedPages {
    pub listings: Vec<RawListing>,
    pub pages_succeeded: u32,
    pub pages_failed: u32,
}

#[derive(Clone)]
pub struct Collector {
    source: Arc<dyn SearchSource>,
}

impl Collector {
    pub fn new(source: Arc<dyn SearchSource>) -> Self {
        Self { source }
    }

    pub fn source_id(&self) -> &str {
        self.source.source_id()
    }

    /// Queries pages `0..page_count` in order. Failing pages are skipped; the
    /// call only fails when no page succeeded.
    pub async fn collect(
        &self,
        ctx: &SearchContext,
        query: &str,
        page_count: u32,
    ) -> Result<CollectedPages, CollectionError> {
        let mut collected = CollectedPages::default();
        for page in 0..page_count {
            match self.source.search(ctx, query, page).await {
                Ok(mut listings) => {
                    debug!(run_id = %ctx.run_id, page, results = listings.len(), "page collected");
                    collected.listings.append(&mut listings);
                    collected.pages_succeeded += 1;
                }
                Err(err) => {
                    warn!(
                        run_id = %ctx.run_id,
                        source_id = self.source.source_id(),
                        page,
                        error = %err,
                        "search page failed; skipping"
                    );
                    collected.pages_failed += 1;
                }
            }
        }

        if collected.pages_succeeded == 0 {
            return Err(CollectionError::NoResults {
                pages_attempted: page_count,
            });
        }
        Ok(collected)
    }
}

/// CSS selectors locating the fields of one result card.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultSelectors {
    pub item: String,
    pub title: String,
    pub price: String,
    pub store: String,
    #[serde(default)]
    pub discount: Option<String>,
    #[serde(default)]
    pub original_price: Option<String>,
    pub link: String,
}

impl Default for ResultSelectors {
    fn default() -> Self {
        Self {
            item: ".sh-dgr__content".to_string(),
            title: "h3".to_string(),
            price: ".a8Pemb".to_string(),
            store: ".aULzUe".to_string(),
            discount: Some(".Ib8pOd".to_string()),
            original_price: Some(".T14wmb".to_string()),
            link: "a[href]".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HtmlSourceSettings {
    pub base_url: String,
    #[serde(default = "default_query_param")]
    pub query_param: String,
    #[serde(default = "default_offset_param")]
    pub offset_param: String,
    #[serde(default = "default_results_per_page")]
    pub results_per_page: u32,
    /// Extra fixed query parameters, e.g. `tbm=shop`.
    #[serde(default)]
    pub extra_params: Vec<(String, String)>,
    #[serde(default)]
    pub selectors: ResultSelectors,
}

fn default_query_param() -> String {
    "q".to_string()
}

fn default_offset_param() -> String {
    "start".to_string()
}

fn default_results_per_page() -> u32 {
    20
}

fn parse_selector(selector: &str) -> Result<Selector, SourceError> {
    Selector::parse(selector).map_err(|e| SourceError::Message(format!("selector {selector:?}: {e}")))
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn first_text(card: &ElementRef<'_>, selector: &Selector) -> Option<String> {
    card.select(selector)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<String>()))
}

/// Pulls raw result cards out of a results page. Fields a card lacks are left
/// empty so the normalizer decides what to drop.
pub fn parse_results_page(
    html: &str,
    page_url: &Url,
    selectors: &ResultSelectors,
) -> Result<Vec<RawListing>, SourceError> {
    let item = parse_selector(&selectors.item)?;
    let title = parse_selector(&selectors.title)?;
    let price = parse_selector(&selectors.price)?;
    let store = parse_selector(&selectors.store)?;
    let link_sel = parse_selector(&selectors.link)?;
    let discount = selectors.discount.as_deref().map(parse_selector).transpose()?;
    let original_price = selectors
        .original_price
        .as_deref()
        .map(parse_selector)
        .transpose()?;

    let document = Html::parse_document(html);
    Ok(document
        .select(&item)
        .map(|card| {
            let href = card
                .select(&link_sel)
                .next()
                .and_then(|n| n.value().attr("href"))
                .map(str::trim)
                .unwrap_or_default();
            let link = if href.is_empty() {
                String::new()
            } else {
                page_url
                    .join(href)
                    .map(|u| u.to_string())
                    .unwrap_or_else(|_| href.to_string())
            };
            RawListing {
                product_name: first_text(&card, &title).unwrap_or_default(),
                store: first_text(&card, &store).unwrap_or_default(),
                price_text: first_text(&card, &price).unwrap_or_default(),
                discount_text: discount.as_ref().and_then(|s| first_text(&card, s)),
                original_price_text: original_price.as_ref().and_then(|s| first_text(&card, s)),
                link,
            }
        })
        .collect())
}

/// Scrapes a shopping results page over HTTP.
#[derive(Debug, Clone)]
pub struct HtmlSearchSource {
    http: HttpFetcher,
    settings: HtmlSourceSettings,
}

impl HtmlSearchSource {
    pub fn new(http: HttpFetcher, settings: HtmlSourceSettings) -> Result<Self, SourceError> {
        Url::parse(&settings.base_url)
            .map_err(|e| SourceError::Message(format!("base_url {:?}: {e}", settings.base_url)))?;
        let s = &settings.selectors;
        for selector in [&s.item, &s.title, &s.price, &s.store, &s.link] {
            parse_selector(selector)?;
        }
        for selector in [&s.discount, &s.original_price].into_iter().flatten() {
            parse_selector(selector)?;
        }
        Ok(Self { http, settings })
    }

    pub fn page_url(&self, query: &str, page: u32) -> Result<Url, SourceError> {
        let offset = page
            .checked_mul(self.settings.results_per_page)
            .ok_or_else(|| {
                SourceError::Message(format!(
                    "result offset for page {page} exceeds {}",
                    u32::MAX
                ))
            })?
            .to_string();
        let mut params = vec![
            (self.settings.query_param.as_str(), query),
            (self.settings.offset_param.as_str(), offset.as_str()),
        ];
        params.extend(
            self.settings
                .extra_params
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_str())),
        );
        Url::parse_with_params(&self.settings.base_url, &params)
            .map_err(|e| SourceError::Message(e.to_string()))
    }
}

#[async_trait]
impl SearchSource for HtmlSearchSource {
    fn source_id(&self) -> &str {
        "html-search"
    }

    async fn search(
        &self,
        ctx: &SearchContext,
        query: &str,
        page: u32,
    ) -> Result<Vec<RawListing>, SourceError> {
        let url = self.page_url(query, page)?;
        let response = self.http.fetch_bytes(ctx.run_id, url.as_str()).await?;
        let final_url = Url::parse(&response.final_url).unwrap_or(url);
        let body = String::from_utf8_lossy(&response.body);
        parse_results_page(&body, &final_url, &self.settings.selectors)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixturePages {
    #[serde(default)]
    pub query: Option<String>,
    pub pages: Vec<Vec<RawListing>>,
}

/// Serves recorded result pages; page `n` of the fixture answers page `n` of
/// any query.
#[derive(Debug, Clone)]
pub struct FixtureSearchSource {
    pages: Vec<Vec<RawListing>>,
}

impl FixtureSearchSource {
    pub fn from_pages(pages: Vec<Vec<RawListing>>) -> Self {
        Self { pages }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let fixture: FixturePages = read_json_file(path)?;
        Ok(Self::from_pages(fixture.pages))
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }
}

#[async_trait]
impl SearchSource for FixtureSearchSource {
    fn source_id(&self) -> &str {
        "fixture"
    }

    async fn search(
        &self,
        _ctx: &SearchContext,
        _query: &str,
        page: u32,
    ) -> Result<Vec<RawListing>, SourceError> {
        self.pages
            .get(page as usize)
            .cloned()
            .ok_or(SourceError::PageUnavailable { page })
    }
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}
