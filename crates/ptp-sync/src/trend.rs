use std::collections::BTreeMap;
use std::sync::Arc;

use plotters::prelude::*;
use ptp_core::{ListingKey, Snapshot, TrendArtifact, TrendRecord};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use thiserror::Error;

const SERIES_COLORS: [RGBColor; 6] = [
    RGBColor(14, 165, 233),
    RGBColor(39, 174, 96),
    RGBColor(231, 76, 60),
    RGBColor(243, 156, 18),
    RGBColor(142, 68, 173),
    RGBColor(52, 73, 94),
];

#[derive(Debug, Error)]
pub enum TrendError {
    #[error("rendering trend chart: {0}")]
    Render(String),
}

fn render_err(err: impl std::fmt::Display) -> TrendError {
    TrendError::Render(err.to_string())
}

/// `(current - previous) / previous * 100`, rounded to two places.
pub fn variation_percent(previous: Decimal, current: Decimal) -> Option<Decimal> {
    (current - previous)
        .checked_div(previous)
        .map(|ratio| (ratio * Decimal::ONE_HUNDRED).round_dp(2))
}

#[derive(Debug, Clone, Copy)]
pub struct TrendAnalyzer {
    chart_size: (u32, u32),
}

impl Default for TrendAnalyzer {
    fn default() -> Self {
        Self {
            chart_size: (960, 540),
        }
    }
}

impl TrendAnalyzer {
    /// One record per key of the latest snapshot, ordered by key. The previous
    /// price comes from the most recent earlier snapshot containing the key.
    pub fn compute_changes(&self, history: &[Arc<Snapshot>]) -> Vec<TrendRecord> {
        let Some((latest, earlier)) = history.split_last() else {
            return Vec::new();
        };

        latest
            .best_offers()
            .into_iter()
            .map(|(key, listing)| {
                let previous_price = earlier.iter().rev().find_map(|s| s.best_price(&key));
                let current_price = listing.price_numeric;
                TrendRecord {
                    variation_percent: previous_price
                        .and_then(|previous| variation_percent(previous, current_price)),
                    previous_price,
                    current_price,
                    product: key.product_name,
                    store: key.store,
                }
            })
            .collect()
    }

    /// SVG line chart of the best price per key across the history; `None`
    /// until there are two snapshots to compare.
    pub fn render_trend(&self, history: &[Arc<Snapshot>]) -> Result<Option<TrendArtifact>, TrendError> {
        let Some(latest) = history.last() else {
            return Ok(None);
        };
        if history.len() < 2 {
            return Ok(None);
        }

        let mut series: BTreeMap<ListingKey, Vec<(f64, f64)>> = BTreeMap::new();
        for (idx, snapshot) in history.iter().enumerate() {
            for (key, listing) in snapshot.best_offers() {
                if let Some(price) = listing.price_numeric.to_f64() {
                    series.entry(key).or_default().push((idx as f64, price));
                }
            }
        }

        let prices = series.values().flatten().map(|(_, y)| *y);
        let (mut y_min, mut y_max) = prices.fold((f64::MAX, f64::MIN), |(lo, hi), y| (lo.min(y), hi.max(y)));
        if y_min > y_max {
            return Ok(None);
        }
        let pad = ((y_max - y_min) * 0.05).max(1.0);
        y_min = (y_min - pad).max(0.0);
        y_max += pad;
        let x_max = (history.len() - 1) as f64;

        let mut content = String::new();
        {
            let root = SVGBackend::with_string(&mut content, self.chart_size).into_drawing_area();
            root.fill(&WHITE).map_err(render_err)?;
            let mut chart = ChartBuilder::on(&root)
                .margin(24)
                .build_cartesian_2d(0f64..x_max, y_min..y_max)
                .map_err(render_err)?;

            for (idx, points) in series.values().enumerate() {
                let color = SERIES_COLORS[idx % SERIES_COLORS.len()];
                chart
                    .draw_series(LineSeries::new(points.iter().copied(), color.stroke_width(2)))
                    .map_err(render_err)?;
                chart
                    .draw_series(points.iter().map(|p| Circle::new(*p, 3, color.filled())))
                    .map_err(render_err)?;
            }
            root.present().map_err(render_err)?;
        }

        Ok(Some(TrendArtifact {
            file_name: format!(
                "price-trend-{}.svg",
                latest.collected_at.format("%Y%m%d_%H%M%S")
            ),
            content_type: "image/svg+xml".to_string(),
            content,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use ptp_core::Listing;
    use std::str::FromStr;
    use uuid::Uuid;

    fn listing(store: &str, price: &str) -> Listing {
        Listing {
            product_name: "iPhone 13".to_string(),
            store: store.to_string(),
            price_text: format!("R$ {price}"),
            price_numeric: Decimal::from_str(price).unwrap(),
            discount_text: None,
            discount_numeric: None,
            original_price: None,
            link: format!("https://{store}.example/iphone-13"),
        }
    }

    fn history(runs: Vec<Vec<Listing>>) -> Vec<Arc<Snapshot>> {
        let start = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).single().unwrap();
        runs.into_iter()
            .enumerate()
            .map(|(idx, listings)| {
                Arc::new(Snapshot::new(
                    Uuid::new_v4(),
                    start + Duration::minutes(15 * idx as i64),
                    listings,
                ))
            })
            .collect()
    }

    #[test]
    fn variation_is_relative_to_previous_price() {
        assert_eq!(
            variation_percent(Decimal::from(100), Decimal::from(80)),
            Some(Decimal::new(-2000, 2))
        );
        assert_eq!(
            variation_percent(Decimal::from(3), Decimal::from(4)),
            Some(Decimal::new(3333, 2))
        );
        assert_eq!(variation_percent(Decimal::ZERO, Decimal::from(4)), None);
    }

    #[test]
    fn changes_compare_latest_against_prior_snapshot() {
        let h = history(vec![
            vec![listing("a", "100"), listing("b", "50")],
            vec![listing("a", "80"), listing("c", "70")],
        ]);
        let changes = TrendAnalyzer::default().compute_changes(&h);
        assert_eq!(changes.len(), 2);

        assert_eq!(changes[0].store, "a");
        assert_eq!(changes[0].previous_price, Some(Decimal::from(100)));
        assert_eq!(changes[0].variation_percent, Some(Decimal::from(-20)));

        assert_eq!(changes[1].store, "c");
        assert_eq!(changes[1].previous_price, None);
        assert_eq!(changes[1].variation_percent, None);
    }

    #[test]
    fn previous_price_skips_snapshots_missing_the_key() {
        let h = history(vec![
            vec![listing("a", "200")],
            vec![listing("b", "10")],
            vec![listing("a", "250")],
        ]);
        let changes = TrendAnalyzer::default().compute_changes(&h);
        assert_eq!(changes[0].previous_price, Some(Decimal::from(200)));
        assert_eq!(changes[0].variation_percent, Some(Decimal::from(25)));
    }

    #[test]
    fn duplicate_keys_use_the_lowest_price() {
        let h = history(vec![
            vec![listing("a", "120"), listing("a", "100")],
            vec![listing("a", "90"), listing("a", "95")],
        ]);
        let changes = TrendAnalyzer::default().compute_changes(&h);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].previous_price, Some(Decimal::from(100)));
        assert_eq!(changes[0].current_price, Decimal::from(90));
        assert_eq!(changes[0].variation_percent, Some(Decimal::from(-10)));
    }

    #[test]
    fn empty_history_has_no_changes() {
        assert!(TrendAnalyzer::default().compute_changes(&[]).is_empty());
    }

    #[test]
    fn render_needs_two_snapshots() {
        let analyzer = TrendAnalyzer::default();
        let one = history(vec![vec![listing("a", "100")]]);
        assert!(analyzer.render_trend(&one).unwrap().is_none());

        let two = history(vec![vec![listing("a", "100")], vec![listing("a", "80"), listing("b", "90")]]);
        let artifact = analyzer.render_trend(&two).unwrap().expect("artifact");
        assert_eq!(artifact.content_type, "image/svg+xml");
        assert_eq!(artifact.file_name, "price-trend-20260301_091500.svg");
        assert!(artifact.content.contains("<svg"));
    }
}
