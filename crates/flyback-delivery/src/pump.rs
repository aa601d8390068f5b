//! The webhook delivery pump: cursor-based scan, POST with timeout,
//! exponential backoff, and dead-lettering (spec §4.I).

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use flyback_storage::EventLog;
use flyback_types::{DeliveryCursor, DlqEntry, Event, SCHEMA_VERSION};
use reqwest::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::cursor::CursorStore;
use crate::dlq::DlqStore;
use crate::signing::sign;

const FINAL_RESOLUTION_TYPE: &str = "resolution.final";

/// Static configuration for the delivery pump (spec §6 "Environment").
#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    /// Destination webhook URL. `None` disables delivery entirely.
    pub webhook_url: Option<String>,
    /// Shared secret for `x-flyback-signature`. `None` sends unsigned.
    pub webhook_secret: Option<String>,
    /// POST timeout before a delivery attempt is cancelled.
    pub timeout: Duration,
    /// Base of the exponential backoff schedule.
    pub backoff_base: Duration,
    /// Ceiling the backoff schedule never exceeds.
    pub backoff_max: Duration,
    /// Consecutive failures against one event before it is dead-lettered.
    pub max_retries: u32,
    /// False when this process is a read-only replica (spec §4.J).
    pub writes_enabled: bool,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            webhook_secret: None,
            timeout: Duration::from_secs(5),
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(60),
            max_retries: 5,
            writes_enabled: true,
        }
    }
}

/// Errors the pump itself cannot recover from (storage failures).
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// Underlying storage failure persisting cursor or DLQ state.
    #[error(transparent)]
    Storage(#[from] flyback_storage::StorageError),
}

/// Outcome of one [`DeliveryPump::tick`] call.
#[derive(Debug, PartialEq)]
pub enum TickOutcome {
    /// Delivery disabled, no eligible event, an in-flight attempt already
    /// running, or the backoff timer hasn't elapsed yet.
    Idle,
    /// `seq` was POSTed successfully.
    Delivered { seq: u64 },
    /// `seq` failed; will be retried after backoff.
    Failed { seq: u64, retry_count: u32 },
    /// `seq` exhausted its retries and was moved to the DLQ.
    DeadLettered { seq: u64 },
}

#[derive(Serialize)]
struct WebhookPayload<'a> {
    schema_version: u32,
    delivery_ts: DateTime<Utc>,
    seq: u64,
    event_id: &'a str,
    #[serde(rename = "type")]
    type_name: &'static str,
    ts: DateTime<Utc>,
    payload: &'a flyback_types::EventPayload,
}

struct PumpState {
    cursor: DeliveryCursor,
    next_attempt_at: Option<DateTime<Utc>>,
    in_flight: bool,
}

/// Owns the delivery cursor, the HTTP client, and the DLQ; advances one
/// `resolution.final` event per [`DeliveryPump::tick`] call.
pub struct DeliveryPump {
    config: DeliveryConfig,
    client: reqwest::Client,
    event_log: Arc<EventLog>,
    cursor_store: CursorStore,
    dlq: DlqStore,
    state: Mutex<PumpState>,
}

impl DeliveryPump {
    /// Open the pump rooted at `dir`, restoring the persisted cursor.
    pub async fn open(dir: &Path, event_log: Arc<EventLog>, config: DeliveryConfig) -> Result<Self, DeliveryError> {
        let cursor_store = CursorStore::new(dir);
        let cursor = cursor_store.load().await?;
        Ok(Self {
            config,
            client: reqwest::Client::new(),
            event_log,
            cursor_store,
            dlq: DlqStore::new(dir),
            state: Mutex::new(PumpState { cursor, next_attempt_at: None, in_flight: false }),
        })
    }

    /// Current persisted-equivalent cursor, for reporting (spec §4.H
    /// "delivery health").
    pub async fn cursor(&self) -> DeliveryCursor {
        self.state.lock().await.cursor
    }

    /// Count of entries currently dead-lettered.
    pub async fn dlq_depth(&self) -> Result<u64, DeliveryError> {
        Ok(self.dlq.depth().await?)
    }

    /// Run one scheduled tick of the delivery loop (spec §4.I steps 1-6).
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickOutcome, DeliveryError> {
        if !self.config.writes_enabled || self.config.webhook_url.is_none() {
            return Ok(TickOutcome::Idle);
        }

        let mut state = self.state.lock().await;
        if state.in_flight {
            return Ok(TickOutcome::Idle);
        }
        if let Some(next) = state.next_attempt_at {
            if now < next {
                return Ok(TickOutcome::Idle);
            }
        }

        let next_event = self
            .event_log
            .next_after(state.cursor.last_delivered_seq, Some(FINAL_RESOLUTION_TYPE))
            .await?;
        let Some(event) = next_event else {
            return Ok(TickOutcome::Idle);
        };

        state.in_flight = true;
        state.cursor.last_attempt_at = Some(now);
        drop(state);

        let outcome = self.attempt_delivery(&event, now).await;

        let mut state = self.state.lock().await;
        state.in_flight = false;
        outcome
    }

    async fn attempt_delivery(&self, event: &Event, now: DateTime<Utc>) -> Result<TickOutcome, DeliveryError> {
        let url = self.config.webhook_url.as_deref().expect("checked by caller");
        let body_struct = WebhookPayload {
            schema_version: SCHEMA_VERSION,
            delivery_ts: now,
            seq: event.seq,
            event_id: &event.event_id,
            type_name: event.type_name(),
            ts: event.ts,
            payload: &event.payload,
        };
        let body = serde_json::to_vec(&body_struct).expect("WebhookPayload always serializes");

        let mut request = self
            .client
            .post(url)
            .timeout(self.config.timeout)
            .header(CONTENT_TYPE, "application/json")
            .header(
                HeaderName::from_static("x-flyback-schema-version"),
                HeaderValue::from_str(&SCHEMA_VERSION.to_string()).expect("schema version is a valid header value"),
            );
        if let Some(secret) = &self.config.webhook_secret {
            let signature = sign(secret, &body);
            request = request.header(
                HeaderName::from_static("x-flyback-signature"),
                HeaderValue::from_str(&signature).expect("hex signature is valid header value"),
            );
        }

        let result = request.body(body).send().await;

        match result {
            Ok(response) if response.status().is_success() => self.record_success(event.seq).await,
            Ok(response) => self.record_failure(event, now, Some(response.status().as_u16()), format!("http {}", response.status())).await,
            Err(e) => self.record_failure(event, now, None, e.to_string()).await,
        }
    }

    async fn record_success(&self, seq: u64) -> Result<TickOutcome, DeliveryError> {
        let mut state = self.state.lock().await;
        state.cursor.last_delivered_seq = seq;
        state.cursor.retry_count = 0;
        state.next_attempt_at = None;
        let cursor = state.cursor;
        drop(state);
        self.cursor_store.save(&cursor).await?;
        info!(seq, "delivered resolution.final webhook");
        Ok(TickOutcome::Delivered { seq })
    }

    async fn record_failure(
        &self,
        event: &Event,
        now: DateTime<Utc>,
        status: Option<u16>,
        error: String,
    ) -> Result<TickOutcome, DeliveryError> {
        let mut state = self.state.lock().await;
        state.cursor.retry_count += 1;
        let retry_count = state.cursor.retry_count;

        if retry_count >= self.config.max_retries {
            warn!(seq = event.seq, %error, retry_count, "exhausted retries, dead-lettering event");
            state.cursor.last_delivered_seq = event.seq;
            state.cursor.retry_count = 0;
            state.next_attempt_at = None;
            let cursor = state.cursor;
            drop(state);

            self.dlq
                .append(&DlqEntry {
                    failed_at: now,
                    seq: event.seq,
                    event_id: event.event_id.clone(),
                    status,
                    error,
                    payload: serde_json::to_value(&event.payload).expect("EventPayload always serializes"),
                })
                .await?;
            self.cursor_store.save(&cursor).await?;
            return Ok(TickOutcome::DeadLettered { seq: event.seq });
        }

        let multiplier: u32 = 1u32 << (retry_count - 1).min(20);
        let backoff = self.config.backoff_base.saturating_mul(multiplier).min(self.config.backoff_max);
        state.next_attempt_at = Some(now + chrono::Duration::from_std(backoff).unwrap_or_default());
        let cursor = state.cursor;
        drop(state);
        self.cursor_store.save(&cursor).await?;
        warn!(seq = event.seq, %error, retry_count, "delivery attempt failed, backing off");
        Ok(TickOutcome::Failed { seq: event.seq, retry_count })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flyback_types::event::{ImpressionRecorded, Scope};
    use flyback_types::UnassignedEvent;
    use tempfile::tempdir;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn scope() -> Scope {
        Scope { campaign_id: "c".into(), publisher_id: "p".into(), creative_id: "cr".into() }
    }

    fn final_event(token_id: &str) -> UnassignedEvent {
        UnassignedEvent::new(flyback_types::EventPayload::ResolutionFinal(flyback_types::event::ResolutionFinal {
            token_id: token_id.into(),
            scope: scope(),
            stage: "purchase".into(),
            value: 5.0,
            outcome_type: "purchase".into(),
            weighted_value: 5.0,
            billable: true,
        }))
    }

    #[tokio::test]
    async fn delivers_and_advances_cursor_on_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(header("x-flyback-schema-version", "1"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let log = Arc::new(EventLog::open(dir.path(), 0).await.unwrap());
        log.append_batch(vec![final_event("t1")], Utc::now()).await.unwrap();

        let config = DeliveryConfig { webhook_url: Some(format!("{}/hook", server.uri())), ..Default::default() };
        let pump = DeliveryPump::open(dir.path(), log, config).await.unwrap();

        let outcome = pump.tick(Utc::now()).await.unwrap();
        assert_eq!(outcome, TickOutcome::Delivered { seq: 1 });
        assert_eq!(pump.cursor().await.last_delivered_seq, 1);
    }

    #[tokio::test]
    async fn dead_letters_after_exhausting_retries() {
        let server = MockServer::start().await;
        Mock::given(method("POST")).and(path("/hook")).respond_with(ResponseTemplate::new(500)).mount(&server).await;

        let dir = tempdir().unwrap();
        let log = Arc::new(EventLog::open(dir.path(), 0).await.unwrap());
        log.append_batch(vec![final_event("t1")], Utc::now()).await.unwrap();

        let config = DeliveryConfig {
            webhook_url: Some(format!("{}/hook", server.uri())),
            max_retries: 1,
            backoff_base: Duration::from_millis(1),
            ..Default::default()
        };
        let pump = DeliveryPump::open(dir.path(), log, config).await.unwrap();

        let outcome = pump.tick(Utc::now()).await.unwrap();
        assert_eq!(outcome, TickOutcome::DeadLettered { seq: 1 });
        assert_eq!(pump.dlq_depth().await.unwrap(), 1);
        assert_eq!(pump.cursor().await.last_delivered_seq, 1);
    }

    #[tokio::test]
    async fn idle_when_no_webhook_configured() {
        let dir = tempdir().unwrap();
        let log = Arc::new(EventLog::open(dir.path(), 0).await.unwrap());
        let pump = DeliveryPump::open(dir.path(), log, DeliveryConfig::default()).await.unwrap();
        assert_eq!(pump.tick(Utc::now()).await.unwrap(), TickOutcome::Idle);
    }
}
