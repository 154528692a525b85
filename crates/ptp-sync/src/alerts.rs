use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use ptp_core::{Listing, ListingKey, Snapshot, TrendArtifact, TrendRecord};
use rust_decimal::Decimal;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::AlertConfig;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("http status {status} from {url}")]
    HttpStatus { status: u16, url: String },
    #[error(transparent)]
    Address(#[from] lettre::address::AddressError),
    #[error(transparent)]
    Email(#[from] lettre::error::Error),
    #[error(transparent)]
    Smtp(#[from] lettre::transport::smtp::Error),
}

/// External messaging channel used to deliver alerts.
#[async_trait]
pub trait MessageChannel: Send + Sync {
    fn channel_id(&self) -> &str;

    async fn send(
        &self,
        recipient: &str,
        subject: &str,
        body: &str,
        attachments: &[TrendArtifact],
    ) -> Result<(), ChannelError>;
}

/// Writes alerts to the tracing output instead of delivering them.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogChannel;

#[async_trait]
impl MessageChannel for LogChannel {
    fn channel_id(&self) -> &str {
        "log"
    }

    async fn send(
        &self,
        recipient: &str,
        subject: &str,
        body: &str,
        attachments: &[TrendArtifact],
    ) -> Result<(), ChannelError> {
        info!(
            recipient,
            subject,
            attachments = attachments.len(),
            "price alert\n{body}"
        );
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    recipient: &'a str,
    subject: &'a str,
    body: &'a str,
    attachments: &'a [TrendArtifact],
}

/// Posts each alert once as JSON; a failed post is not retried.
#[derive(Debug, Clone)]
pub struct WebhookChannel {
    client: reqwest::Client,
    url: String,
}

impl WebhookChannel {
    pub fn new(url: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building webhook client")?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl MessageChannel for WebhookChannel {
    fn channel_id(&self) -> &str {
        "webhook"
    }

    async fn send(
        &self,
        recipient: &str,
        subject: &str,
        body: &str,
        attachments: &[TrendArtifact],
    ) -> Result<(), ChannelError> {
        let resp = self
            .client
            .post(&self.url)
            .json(&WebhookPayload {
                recipient,
                subject,
                body,
                attachments,
            })
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(ChannelError::HttpStatus {
                status: status.as_u16(),
                url: self.url.clone(),
            });
        }
        Ok(())
    }
}

/// Sends alerts as e-mail over a STARTTLS relay, trend charts as attachments.
pub struct SmtpChannel {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    sender: Mailbox,
}

impl SmtpChannel {
    pub fn new(
        server: &str,
        port: u16,
        sender: &str,
        credentials: Option<(String, String)>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let sender: Mailbox = sender
            .parse()
            .with_context(|| format!("parsing sender address {sender}"))?;
        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(server)
            .with_context(|| format!("configuring smtp relay {server}"))?
            .port(port)
            .timeout(Some(timeout));
        if let Some((username, password)) = credentials {
            builder = builder.credentials(Credentials::new(username, password));
        }
        Ok(Self {
            transport: builder.build(),
            sender,
        })
    }
}

#[async_trait]
impl MessageChannel for SmtpChannel {
    fn channel_id(&self) -> &str {
        "smtp"
    }

    async fn send(
        &self,
        recipient: &str,
        subject: &str,
        body: &str,
        attachments: &[TrendArtifact],
    ) -> Result<(), ChannelError> {
        let email = compose_email(&self.sender, recipient, subject, body, attachments)?;
        self.transport.send(email).await?;
        Ok(())
    }
}

/// Builds a multipart/mixed message: the plain-text body first, then one part per artifact.
pub fn compose_email(
    sender: &Mailbox,
    recipient: &str,
    subject: &str,
    body: &str,
    attachments: &[TrendArtifact],
) -> Result<Message, ChannelError> {
    let to: Mailbox = recipient.parse()?;
    let mut parts = MultiPart::mixed().singlepart(SinglePart::plain(body.to_string()));
    for artifact in attachments {
        let content_type = ContentType::parse(&artifact.content_type).map_err(|_| {
            ChannelError::Message(format!("invalid content type {}", artifact.content_type))
        })?;
        parts = parts.singlepart(
            Attachment::new(artifact.file_name.clone()).body(artifact.content.clone(), content_type),
        );
    }
    let email = Message::builder()
        .from(sender.clone())
        .to(to)
        .subject(subject)
        .multipart(parts)?;
    Ok(email)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub recipient: String,
    pub subject: String,
    pub body: String,
    pub attachments: Vec<TrendArtifact>,
}

/// Keeps sent messages in memory; can be switched to fail every send.
#[derive(Debug, Default)]
pub struct MemoryChannel {
    sent: Mutex<Vec<SentMessage>>,
    failing: Mutex<Option<String>>,
}

impl MemoryChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_with(&self, reason: Option<&str>) {
        *self.failing.lock().unwrap_or_else(PoisonError::into_inner) = reason.map(ToString::to_string);
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[async_trait]
impl MessageChannel for MemoryChannel {
    fn channel_id(&self) -> &str {
        "memory"
    }

    async fn send(
        &self,
        recipient: &str,
        subject: &str,
        body: &str,
        attachments: &[TrendArtifact],
    ) -> Result<(), ChannelError> {
        if let Some(reason) = self.failing.lock().unwrap_or_else(PoisonError::into_inner).clone() {
            return Err(ChannelError::Message(reason));
        }
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(SentMessage {
                recipient: recipient.to_string(),
                subject: subject.to_string(),
                body: body.to_string(),
                attachments: attachments.to_vec(),
            });
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AlertError {
    #[error("alert dispatch failed: {reason}")]
    DispatchFailed { reason: String },
}

impl AlertError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::DispatchFailed { .. } => "dispatch_failed",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AlertRecord {
    pub last_triggered_at: Option<DateTime<Utc>>,
    pub last_triggered_discount: Option<Decimal>,
}

/// Dedup memory for alerts, keyed by item and threshold.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AlertState {
    records: BTreeMap<(ListingKey, Decimal), AlertRecord>,
    last_evaluated_at: Option<DateTime<Utc>>,
}

impl AlertState {
    pub fn record(&self, key: &ListingKey, threshold: Decimal) -> Option<&AlertRecord> {
        self.records.get(&(key.clone(), threshold))
    }

    pub fn record_trigger(
        &mut self,
        key: ListingKey,
        threshold: Decimal,
        at: DateTime<Utc>,
        discount: Decimal,
    ) {
        let record = self.records.entry((key, threshold)).or_default();
        record.last_triggered_at = Some(at);
        record.last_triggered_discount = Some(discount);
    }

    pub fn mark_evaluated(&mut self, at: DateTime<Utc>) {
        self.last_evaluated_at = Some(at);
    }

    /// True when `key` already triggered at `discount` in the run right
    /// before this one.
    fn is_repeat(&self, key: &ListingKey, threshold: Decimal, discount: Decimal) -> bool {
        let Some(previous_run) = self.last_evaluated_at else {
            return false;
        };
        self.record(key, threshold).is_some_and(|r| {
            r.last_triggered_at == Some(previous_run) && r.last_triggered_discount == Some(discount)
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DispatchOutcome {
    Disabled,
    NothingQualified,
    Suppressed {
        keys: Vec<ListingKey>,
    },
    Dispatched {
        keys: Vec<ListingKey>,
        suppressed: Vec<ListingKey>,
    },
}

pub fn qualifies(listing: &Listing, threshold: Decimal) -> bool {
    listing.discount_numeric.is_some_and(|d| d >= threshold)
}

/// Best qualifying listing per key: highest discount, then lowest price.
pub fn qualifying_offers(snapshot: &Snapshot, threshold: Decimal) -> BTreeMap<ListingKey, &Listing> {
    let mut best: BTreeMap<ListingKey, &Listing> = BTreeMap::new();
    for listing in snapshot.listings.iter().filter(|l| qualifies(l, threshold)) {
        best.entry(listing.key())
            .and_modify(|current| {
                let better = (listing.discount_numeric, std::cmp::Reverse(listing.price_numeric))
                    > (current.discount_numeric, std::cmp::Reverse(current.price_numeric));
                if better {
                    *current = listing;
                }
            })
            .or_insert(listing);
    }
    best
}

/// Everything a run hands to the dispatcher besides config and dedup state.
#[derive(Debug, Clone, Copy)]
pub struct AlertInput<'a> {
    pub query: &'a str,
    pub snapshot: &'a Snapshot,
    pub changes: &'a [TrendRecord],
    pub artifact: Option<&'a TrendArtifact>,
}

#[derive(Clone)]
pub struct AlertDispatcher {
    channel: Arc<dyn MessageChannel>,
}

impl AlertDispatcher {
    pub fn new(channel: Arc<dyn MessageChannel>) -> Self {
        Self { channel }
    }

    /// Sends at most one message for the snapshot. Must be called for every
    /// successful run, alerts on or off, so repeats are judged against the
    /// run right before. `state` is left as it was when a send fails.
    pub async fn evaluate_and_dispatch(
        &self,
        input: AlertInput<'_>,
        config: &AlertConfig,
        state: &mut AlertState,
    ) -> Result<DispatchOutcome, AlertError> {
        let collected_at = input.snapshot.collected_at;
        if !config.enabled {
            state.mark_evaluated(collected_at);
            return Ok(DispatchOutcome::Disabled);
        }
        let threshold = config.threshold_percent;
        let qualifying = qualifying_offers(input.snapshot, threshold);

        if qualifying.is_empty() {
            state.mark_evaluated(collected_at);
            return Ok(DispatchOutcome::NothingQualified);
        }

        let (suppressed, to_send): (Vec<_>, Vec<_>) = qualifying.iter().partition(|(key, listing)| {
            listing
                .discount_numeric
                .is_some_and(|d| state.is_repeat(key, threshold, d))
        });
        let suppressed = suppressed.into_iter().map(|(k, _)| k.clone()).collect::<Vec<_>>();

        if !to_send.is_empty() {
            let recipient = config
                .recipient
                .as_deref()
                .ok_or_else(|| AlertError::DispatchFailed {
                    reason: "no recipient configured".to_string(),
                })?;
            let listings = to_send.iter().map(|(_, l)| **l).collect::<Vec<_>>();
            let subject = compose_subject(input.query, listings.len(), threshold);
            let body = compose_body(&input, &listings);
            let attachments = input.artifact.cloned().into_iter().collect::<Vec<_>>();

            self.channel
                .send(recipient, &subject, &body, &attachments)
                .await
                .map_err(|err| {
                    warn!(channel = self.channel.channel_id(), error = %err, "alert dispatch failed");
                    AlertError::DispatchFailed {
                        reason: err.to_string(),
                    }
                })?;
            info!(
                channel = self.channel.channel_id(),
                offers = listings.len(),
                suppressed = suppressed.len(),
                "price alert dispatched"
            );
        }

        for (key, listing) in &qualifying {
            if let Some(discount) = listing.discount_numeric {
                state.record_trigger(key.clone(), threshold, collected_at, discount);
            }
        }
        state.mark_evaluated(collected_at);

        if to_send.is_empty() {
            return Ok(DispatchOutcome::Suppressed { keys: suppressed });
        }
        Ok(DispatchOutcome::Dispatched {
            keys: to_send.into_iter().map(|(k, _)| k.clone()).collect(),
            suppressed,
        })
    }
}

fn compose_subject(query: &str, offers: usize, threshold: Decimal) -> String {
    let noun = if offers == 1 { "offer" } else { "offers" };
    format!("[PriceTracker] {offers} {noun} for \"{query}\" at {threshold}% off or more")
}

fn money(value: Option<Decimal>) -> String {
    match value {
        Some(v) => format!("{v:.2}"),
        None => "n/a".to_string(),
    }
}

fn compose_body(input: &AlertInput<'_>, listings: &[&Listing]) -> String {
    let mut lines = vec![
        format!("Offers collected at {}:", input.snapshot.collected_at.to_rfc3339()),
        String::new(),
    ];
    for listing in listings {
        let key = listing.key();
        let trend = input.changes.iter().find(|c| c.key() == key);
        let old_price = trend
            .and_then(|t| t.previous_price)
            .or(listing.original_price);
        let variation = trend
            .and_then(|t| t.variation_percent)
            .map(|v| format!(", {v:+.2}% since last run"))
            .unwrap_or_default();
        lines.push(format!(
            "- {} @ {}: {} -> {} ({}% off{})",
            listing.product_name,
            listing.store,
            money(old_price),
            money(Some(listing.price_numeric)),
            listing.discount_numeric.map(|d| d.to_string()).unwrap_or_default(),
            variation
        ));
        lines.push(format!("  {}", listing.link));
    }
    if input.artifact.is_some() {
        lines.push(String::new());
        lines.push("Price trend chart attached.".to_string());
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use std::str::FromStr;
    use uuid::Uuid;

    fn t(minute: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().unwrap() + Duration::minutes(minute)
    }

    fn listing(store: &str, price: &str, discount: Option<&str>) -> Listing {
        Listing {
            product_name: "iPhone 13".to_string(),
            store: store.to_string(),
            price_text: format!("R$ {price}"),
            price_numeric: Decimal::from_str(price).unwrap(),
            discount_text: discount.map(|d| format!("{d}%")),
            discount_numeric: discount.map(|d| Decimal::from_str(d).unwrap()),
            original_price: None,
            link: format!("https://{store}.example/iphone-13"),
        }
    }

    fn key(store: &str) -> ListingKey {
        ListingKey {
            product_name: "iPhone 13".to_string(),
            store: store.to_string(),
        }
    }

    fn config(threshold: i64) -> AlertConfig {
        AlertConfig {
            enabled: true,
            threshold_percent: Decimal::from(threshold),
            recipient: Some("alerts@example.com".to_string()),
        }
    }

    fn input(snapshot: &Snapshot) -> AlertInput<'_> {
        AlertInput {
            query: "iPhone 13",
            snapshot,
            changes: &[],
            artifact: None,
        }
    }

    fn prior_trigger_at_20() -> AlertState {
        let mut state = AlertState::default();
        state.record_trigger(key("a"), Decimal::from(15), t(0), Decimal::from(20));
        state.mark_evaluated(t(0));
        state
    }

    #[tokio::test]
    async fn unchanged_discount_in_consecutive_run_is_suppressed() {
        let channel = Arc::new(MemoryChannel::new());
        let dispatcher = AlertDispatcher::new(channel.clone());
        let mut state = prior_trigger_at_20();
        let snapshot = Snapshot::new(Uuid::new_v4(), t(15), vec![listing("a", "800", Some("20"))]);

        let outcome = dispatcher
            .evaluate_and_dispatch(input(&snapshot), &config(15), &mut state)
            .await
            .unwrap();
        assert_eq!(outcome, DispatchOutcome::Suppressed { keys: vec![key("a")] });
        assert!(channel.sent().is_empty());
        assert_eq!(
            state.record(&key("a"), Decimal::from(15)).unwrap().last_triggered_at,
            Some(t(15))
        );
    }

    #[tokio::test]
    async fn changed_discount_dispatches_again() {
        let channel = Arc::new(MemoryChannel::new());
        let dispatcher = AlertDispatcher::new(channel.clone());
        let mut state = prior_trigger_at_20();
        let snapshot = Snapshot::new(Uuid::new_v4(), t(15), vec![listing("a", "750", Some("25"))]);

        let outcome = dispatcher
            .evaluate_and_dispatch(input(&snapshot), &config(15), &mut state)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            DispatchOutcome::Dispatched {
                keys: vec![key("a")],
                suppressed: vec![]
            }
        );
        let sent = channel.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].recipient, "alerts@example.com");
        assert!(sent[0].body.contains("iPhone 13 @ a"));
        assert!(sent[0].body.contains("25% off"));
        assert_eq!(
            state.record(&key("a"), Decimal::from(15)).unwrap().last_triggered_discount,
            Some(Decimal::from(25))
        );
    }

    #[tokio::test]
    async fn condition_that_lapsed_for_a_run_alerts_again() {
        let channel = Arc::new(MemoryChannel::new());
        let dispatcher = AlertDispatcher::new(channel.clone());
        let mut state = prior_trigger_at_20();

        let gap = Snapshot::new(Uuid::new_v4(), t(15), vec![listing("a", "1000", None)]);
        let outcome = dispatcher
            .evaluate_and_dispatch(input(&gap), &config(15), &mut state)
            .await
            .unwrap();
        assert_eq!(outcome, DispatchOutcome::NothingQualified);

        let back = Snapshot::new(Uuid::new_v4(), t(30), vec![listing("a", "800", Some("20"))]);
        let outcome = dispatcher
            .evaluate_and_dispatch(input(&back), &config(15), &mut state)
            .await
            .unwrap();
        assert!(matches!(outcome, DispatchOutcome::Dispatched { .. }));
        assert_eq!(channel.sent().len(), 1);
    }

    #[tokio::test]
    async fn threshold_is_inclusive_and_below_threshold_is_ignored() {
        let channel = Arc::new(MemoryChannel::new());
        let dispatcher = AlertDispatcher::new(channel.clone());
        let mut state = AlertState::default();
        let snapshot = Snapshot::new(
            Uuid::new_v4(),
            t(0),
            vec![listing("a", "800", Some("15")), listing("b", "900", Some("10"))],
        );

        let outcome = dispatcher
            .evaluate_and_dispatch(input(&snapshot), &config(15), &mut state)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            DispatchOutcome::Dispatched {
                keys: vec![key("a")],
                suppressed: vec![]
            }
        );
        assert!(state.record(&key("b"), Decimal::from(15)).is_none());
    }

    #[tokio::test]
    async fn disabled_alerts_do_nothing() {
        let channel = Arc::new(MemoryChannel::new());
        let dispatcher = AlertDispatcher::new(channel.clone());
        let mut state = AlertState::default();
        let snapshot = Snapshot::new(Uuid::new_v4(), t(0), vec![listing("a", "800", Some("50"))]);
        let mut cfg = config(15);
        cfg.enabled = false;

        let outcome = dispatcher
            .evaluate_and_dispatch(input(&snapshot), &cfg, &mut state)
            .await
            .unwrap();
        assert_eq!(outcome, DispatchOutcome::Disabled);
        assert!(state.records.is_empty());
        assert_eq!(state.last_evaluated_at, Some(t(0)));
        assert!(channel.sent().is_empty());
    }

    #[tokio::test]
    async fn run_with_alerts_off_breaks_the_repeat_chain() {
        let channel = Arc::new(MemoryChannel::new());
        let dispatcher = AlertDispatcher::new(channel.clone());
        let mut state = AlertState::default();
        let on = config(15);
        let mut off = config(15);
        off.enabled = false;

        let runs = [(0, &on), (15, &off), (30, &on)];
        let mut outcomes = Vec::new();
        for (minute, cfg) in runs {
            let snapshot = Snapshot::new(Uuid::new_v4(), t(minute), vec![listing("a", "800", Some("20"))]);
            outcomes.push(
                dispatcher
                    .evaluate_and_dispatch(input(&snapshot), cfg, &mut state)
                    .await
                    .unwrap(),
            );
        }

        assert!(matches!(outcomes[0], DispatchOutcome::Dispatched { .. }));
        assert_eq!(outcomes[1], DispatchOutcome::Disabled);
        assert!(matches!(outcomes[2], DispatchOutcome::Dispatched { .. }));
        assert_eq!(channel.sent().len(), 2);
        assert_eq!(state.last_evaluated_at, Some(t(30)));
    }

    #[tokio::test]
    async fn failed_send_leaves_dedup_state_untouched() {
        let channel = Arc::new(MemoryChannel::new());
        channel.fail_with(Some("smtp auth rejected"));
        let dispatcher = AlertDispatcher::new(channel.clone());
        let mut state = AlertState::default();
        let snapshot = Snapshot::new(Uuid::new_v4(), t(0), vec![listing("a", "800", Some("20"))]);

        let err = dispatcher
            .evaluate_and_dispatch(input(&snapshot), &config(15), &mut state)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "dispatch_failed");
        assert_eq!(state, AlertState::default());

        channel.fail_with(None);
        let next = Snapshot::new(Uuid::new_v4(), t(15), vec![listing("a", "800", Some("20"))]);
        let outcome = dispatcher
            .evaluate_and_dispatch(input(&next), &config(15), &mut state)
            .await
            .unwrap();
        assert!(matches!(outcome, DispatchOutcome::Dispatched { .. }));
    }

    #[tokio::test]
    async fn message_reports_trend_and_attachment() {
        let channel = Arc::new(MemoryChannel::new());
        let dispatcher = AlertDispatcher::new(channel.clone());
        let mut state = AlertState::default();
        let snapshot = Snapshot::new(Uuid::new_v4(), t(15), vec![listing("a", "800", Some("20"))]);
        let changes = vec![TrendRecord {
            product: "iPhone 13".to_string(),
            store: "a".to_string(),
            previous_price: Some(Decimal::from(1000)),
            current_price: Decimal::from(800),
            variation_percent: Some(Decimal::from(-20)),
        }];
        let artifact = TrendArtifact {
            file_name: "price-trend.svg".to_string(),
            content_type: "image/svg+xml".to_string(),
            content: "<svg/>".to_string(),
        };

        dispatcher
            .evaluate_and_dispatch(
                AlertInput {
                    query: "iPhone 13",
                    snapshot: &snapshot,
                    changes: &changes,
                    artifact: Some(&artifact),
                },
                &config(15),
                &mut state,
            )
            .await
            .unwrap();

        let sent = channel.sent();
        assert_eq!(sent[0].attachments, vec![artifact]);
        assert!(sent[0].subject.contains("\"iPhone 13\""));
        assert!(sent[0].body.contains("1000.00 -> 800.00"));
        assert!(sent[0].body.contains("-20.00% since last run"));
    }

    fn svg() -> TrendArtifact {
        TrendArtifact {
            file_name: "price-trend.svg".to_string(),
            content_type: "image/svg+xml".to_string(),
            content: "<svg/>".to_string(),
        }
    }

    /// Serves POST / with `status` and counts the requests it receives.
    async fn webhook_endpoint(
        status: axum::http::StatusCode,
    ) -> (String, Arc<std::sync::atomic::AtomicUsize>) {
        use axum::{extract::State, routing::post, Router};
        use std::sync::atomic::{AtomicUsize, Ordering};

        let hits = Arc::new(AtomicUsize::new(0));
        let app = Router::new()
            .route(
                "/",
                post(move |State(hits): State<Arc<AtomicUsize>>| async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    status
                }),
            )
            .with_state(hits.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}/"), hits)
    }

    #[tokio::test]
    async fn webhook_error_status_fails_after_a_single_post() {
        use std::sync::atomic::Ordering;

        let (url, hits) = webhook_endpoint(axum::http::StatusCode::INTERNAL_SERVER_ERROR).await;
        let channel = WebhookChannel::new(url, std::time::Duration::from_secs(5)).unwrap();
        let err = channel
            .send("buyer@example.com", "drop", "body", &[svg()])
            .await
            .unwrap_err();

        assert!(matches!(err, ChannelError::HttpStatus { status: 500, .. }));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn webhook_success_status_is_delivered() {
        use std::sync::atomic::Ordering;

        let (url, hits) = webhook_endpoint(axum::http::StatusCode::OK).await;
        let channel = WebhookChannel::new(url, std::time::Duration::from_secs(5)).unwrap();
        channel
            .send("buyer@example.com", "drop", "body", &[])
            .await
            .unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn email_carries_body_and_chart_attachment() {
        let sender: Mailbox = "alerts@example.com".parse().unwrap();
        let email = compose_email(
            &sender,
            "buyer@example.com",
            "Price drop: iPhone 13",
            "Loja A 1000.00 -> 800.00",
            &[svg()],
        )
        .unwrap();
        let raw = String::from_utf8(email.formatted()).unwrap();

        assert!(raw.contains("Subject: Price drop: iPhone 13"));
        assert!(raw.contains("To: buyer@example.com"));
        assert!(raw.contains("multipart/mixed"));
        assert!(raw.contains("image/svg+xml"));
        assert!(raw.contains("price-trend.svg"));
        assert!(raw.contains("Loja A 1000.00 -> 800.00"));
    }

    #[test]
    fn email_to_malformed_recipient_is_rejected() {
        let sender: Mailbox = "alerts@example.com".parse().unwrap();
        let err = compose_email(&sender, "not an address", "subject", "body", &[]).unwrap_err();
        assert!(matches!(err, ChannelError::Address(_)));
    }

    #[tokio::test]
    async fn smtp_relay_that_hangs_up_is_a_send_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                drop(socket);
            }
        });

        let channel = SmtpChannel::new(
            "localhost",
            port,
            "alerts@example.com",
            None,
            std::time::Duration::from_secs(5),
        )
        .unwrap();
        let err = channel
            .send("buyer@example.com", "drop", "body", &[svg()])
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::Smtp(_)));
    }
}
