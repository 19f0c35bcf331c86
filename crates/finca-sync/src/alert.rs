//! Threshold alerting and the outbound push-notification port.

use std::sync::Arc;

use async_trait::async_trait;
use finca_core::{percent_change, PriceReading};
use finca_storage::{FetchError, HttpFetcher};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PushNotification {
    pub title: String,
    pub body: String,
}

/// Wire shape sent to the push gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PushMessage {
    pub topic: String,
    pub notification: PushNotification,
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("push gateway: {0}")]
    Transport(#[from] FetchError),
    #[error("{0}")]
    Message(String),
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, message: &PushMessage) -> Result<(), DispatchError>;
}

/// Used when no push gateway is configured: the alert only shows up in logs.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, message: &PushMessage) -> Result<(), DispatchError> {
        info!(
            topic = %message.topic,
            title = %message.notification.title,
            body = %message.notification.body,
            "push gateway not configured; alert logged only"
        );
        Ok(())
    }
}

/// Posts [`PushMessage`] JSON to an HTTP push gateway.
#[derive(Debug, Clone)]
pub struct HttpPushNotifier {
    http: Arc<HttpFetcher>,
    endpoint: String,
    bearer_token: Option<String>,
}

impl HttpPushNotifier {
    pub fn new(http: Arc<HttpFetcher>, endpoint: impl Into<String>, bearer_token: Option<String>) -> Self {
        Self {
            http,
            endpoint: endpoint.into(),
            bearer_token,
        }
    }
}

#[async_trait]
impl Notifier for HttpPushNotifier {
    async fn send(&self, message: &PushMessage) -> Result<(), DispatchError> {
        self.http
            .post_json(&self.endpoint, message, self.bearer_token.as_deref())
            .await?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlertThresholds {
    pub absolute_price: Decimal,
    pub relative_change_percent: Decimal,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            absolute_price: Decimal::from(500),
            relative_change_percent: Decimal::from(10),
        }
    }
}

impl AlertThresholds {
    /// `price >= absolute OR change >= relative`. Drops never alert on their own.
    pub fn should_alert(&self, price: Decimal, change_percent: Decimal) -> bool {
        price >= self.absolute_price || change_percent >= self.relative_change_percent
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AlertOutcome {
    NotTriggered,
    Dispatched,
    DispatchFailed(String),
}

pub struct AlertDispatcher {
    thresholds: AlertThresholds,
    topic: String,
    product_label: String,
    notifier: Arc<dyn Notifier>,
}

impl AlertDispatcher {
    pub fn new(
        thresholds: AlertThresholds,
        topic: impl Into<String>,
        product_label: impl Into<String>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            thresholds,
            topic: topic.into(),
            product_label: product_label.into(),
            notifier,
        }
    }

    pub fn thresholds(&self) -> AlertThresholds {
        self.thresholds
    }

    pub fn evaluate(&self, previous: Option<&PriceReading>, current: &PriceReading) -> bool {
        self.thresholds
            .should_alert(current.price, percent_change(previous, current))
    }

    pub fn compose(&self, current: &PriceReading, change_percent: Decimal) -> PushNotification {
        let change = change_percent.round_dp_with_strategy(1, RoundingStrategy::MidpointAwayFromZero);
        let sign = if change.is_sign_negative() { "" } else { "+" };
        PushNotification {
            title: format!("Price alert: {}", self.product_label),
            body: format!(
                "{}: {} {} {} ({sign}{change}% vs previous reading)",
                self.product_label,
                current.price.normalize(),
                current.currency,
                current.unit.describe(),
            ),
        }
    }

    /// Sends a notification. Failures are logged and reported, never raised.
    pub async fn dispatch(&self, title: &str, body: &str, topic: &str) -> AlertOutcome {
        let message = PushMessage {
            topic: topic.to_string(),
            notification: PushNotification {
                title: title.to_string(),
                body: body.to_string(),
            },
        };
        match self.notifier.send(&message).await {
            Ok(()) => {
                info!(topic, title, "price alert dispatched");
                AlertOutcome::Dispatched
            }
            Err(err) => {
                warn!(topic, error = %err, "price alert dispatch failed");
                AlertOutcome::DispatchFailed(err.to_string())
            }
        }
    }

    pub async fn process(&self, previous: Option<&PriceReading>, current: &PriceReading) -> AlertOutcome {
        if !self.evaluate(previous, current) {
            return AlertOutcome::NotTriggered;
        }
        let notification = self.compose(current, percent_change(previous, current));
        self.dispatch(&notification.title, &notification.body, &self.topic)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use finca_core::{PriceUnit, ReadingSource};
    use parking_lot::Mutex;
    use rust_decimal_macros::dec;

    #[derive(Default)]
    struct RecordingNotifier {
        sent: Mutex<Vec<PushMessage>>,
        fail: bool,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn send(&self, message: &PushMessage) -> Result<(), DispatchError> {
            self.sent.lock().push(message.clone());
            if self.fail {
                Err(DispatchError::Message("gateway down".into()))
            } else {
                Ok(())
            }
        }
    }

    fn reading(price: Decimal) -> PriceReading {
        PriceReading {
            price,
            unit: PriceUnit::PerThousand,
            currency: "GTQ".into(),
            source: ReadingSource::ScheduledJob,
            captured_at: Utc.with_ymd_and_hms(2026, 3, 2, 13, 0, 0).single().unwrap(),
        }
    }

    #[test]
    fn threshold_rule_boundaries() {
        let t = AlertThresholds::default();
        assert!(!t.should_alert(dec!(499), dec!(5)));
        assert!(t.should_alert(dec!(500), dec!(0)));
        assert!(t.should_alert(dec!(10), dec!(15)));
        assert!(!t.should_alert(dec!(10), dec!(-40)));
    }

    #[tokio::test]
    async fn triggered_alert_carries_price_and_change() {
        let notifier = Arc::new(RecordingNotifier::default());
        let dispatcher = AlertDispatcher::new(
            AlertThresholds::default(),
            "price-alerts",
            "Limón Persa",
            notifier.clone(),
        );
        let outcome = dispatcher
            .process(Some(&reading(dec!(450))), &reading(dec!(520)))
            .await;
        assert_eq!(outcome, AlertOutcome::Dispatched);

        let sent = notifier.sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].topic, "price-alerts");
        assert!(sent[0].notification.body.contains("520"));
        assert!(sent[0].notification.body.contains("15.6%"));
    }

    #[tokio::test]
    async fn quiet_readings_send_nothing() {
        let notifier = Arc::new(RecordingNotifier::default());
        let dispatcher = AlertDispatcher::new(AlertThresholds::default(), "price-alerts", "Limón Persa", notifier.clone());
        let outcome = dispatcher
            .process(Some(&reading(dec!(470))), &reading(dec!(480)))
            .await;
        assert_eq!(outcome, AlertOutcome::NotTriggered);
        assert!(notifier.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn dispatch_failure_is_reported_not_raised() {
        let notifier = Arc::new(RecordingNotifier {
            fail: true,
            ..Default::default()
        });
        let dispatcher = AlertDispatcher::new(AlertThresholds::default(), "price-alerts", "Limón Persa", notifier);
        let outcome = dispatcher.dispatch("t", "b", "price-alerts").await;
        assert!(matches!(outcome, AlertOutcome::DispatchFailed(msg) if msg.contains("gateway down")));
    }

    #[test]
    fn negative_change_has_no_plus_sign() {
        let dispatcher = AlertDispatcher::new(AlertThresholds::default(), "price-alerts", "Limón Persa", Arc::new(LogNotifier));
        let body = dispatcher.compose(&reading(dec!(600)), dec!(-12.34)).body;
        assert!(body.contains("(-12.3% vs previous reading)"), "{body}");
    }

    #[test]
    fn push_message_wire_shape() {
        let message = PushMessage {
            topic: "price-alerts".into(),
            notification: PushNotification {
                title: "t".into(),
                body: "b".into(),
            },
        };
        assert_eq!(
            serde_json::to_value(&message).unwrap(),
            serde_json::json!({"topic": "price-alerts", "notification": {"title": "t", "body": "b"}})
        );
    }
}
