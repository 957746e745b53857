use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};
use ulid::Ulid;

use crate::engine::Engine;
use crate::model::PaymentStatus;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentIntent {
    pub id: String,
    pub client_secret: String,
}

#[derive(Debug)]
pub enum PaymentError {
    Timeout(Duration),
    NotFound(String),
    Provider(String),
}

impl PaymentError {
    fn is_retryable(&self) -> bool {
        !matches!(self, PaymentError::NotFound(_))
    }
}

impl std::fmt::Display for PaymentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PaymentError::Timeout(d) => write!(f, "timed out after {}ms", d.as_millis()),
            PaymentError::NotFound(id) => write!(f, "unknown payment intent {id}"),
            PaymentError::Provider(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for PaymentError {}

/// The external payment provider. Only the calls the booking flow relies on.
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    /// `idempotency_key` makes retries of this call safe.
    async fn create_payment_intent(
        &self,
        amount_cents: i64,
        customer_ref: &str,
        idempotency_key: &str,
    ) -> Result<PaymentIntent, PaymentError>;

    /// Provider-defined status string, e.g. `succeeded` or `requires_payment_method`.
    async fn retrieve_payment_intent(&self, id: &str) -> Result<String, PaymentError>;
}

/// `succeeded` → completed, `processing`/`requires_*` → pending, anything else → failed.
pub fn map_provider_status(status: &str) -> PaymentStatus {
    match status {
        "succeeded" => PaymentStatus::Completed,
        "processing" => PaymentStatus::Pending,
        s if s.starts_with("requires_") => PaymentStatus::Pending,
        _ => PaymentStatus::Failed,
    }
}

/// Asynchronous provider notification. Delivered at least once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentCallback {
    pub rental_id: Ulid,
    pub payment_intent_id: String,
    pub status: String,
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Bound on each individual provider call.
    pub timeout: Duration,
    pub attempts: u32,
    /// First backoff; doubles after every failed attempt.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            attempts: 3,
            backoff: Duration::from_millis(200),
        }
    }
}

/// Run `call` under the policy's timeout, retrying retryable failures with
/// exponential backoff. Only use for reads or calls carrying an idempotency key.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, op: &'static str, mut call: F) -> Result<T, PaymentError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, PaymentError>>,
{
    let mut delay = policy.backoff;
    let mut attempt = 1;
    loop {
        let result = match tokio::time::timeout(policy.timeout, call()).await {
            Ok(r) => r,
            Err(_) => Err(PaymentError::Timeout(policy.timeout)),
        };
        match result {
            Ok(v) => return Ok(v),
            Err(e) if attempt < policy.attempts && e.is_retryable() => {
                warn!("{op} attempt {attempt} failed: {e}; retrying in {}ms", delay.as_millis());
                metrics::counter!(crate::observability::PAYMENT_RETRIES_TOTAL, "op" => op).increment(1);
                tokio::time::sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

// ── In-process provider ──────────────────────────────────────────

#[derive(Debug, Clone)]
struct IntentRecord {
    intent: PaymentIntent,
    status: String,
}

/// Provider kept in memory. With `auto_capture` every intent reports
/// `succeeded`; otherwise statuses are driven through `set_status`.
pub struct LocalPaymentProvider {
    intents: DashMap<String, IntentRecord>,
    by_key: DashMap<String, String>,
    auto_capture: bool,
}

impl LocalPaymentProvider {
    pub fn new(auto_capture: bool) -> Self {
        Self {
            intents: DashMap::new(),
            by_key: DashMap::new(),
            auto_capture,
        }
    }

    pub fn set_status(&self, id: &str, status: &str) -> Result<(), PaymentError> {
        let mut record = self
            .intents
            .get_mut(id)
            .ok_or_else(|| PaymentError::NotFound(id.to_string()))?;
        record.status = status.to_string();
        Ok(())
    }

    pub fn intent_count(&self) -> usize {
        self.intents.len()
    }
}

#[async_trait]
impl PaymentProvider for LocalPaymentProvider {
    async fn create_payment_intent(
        &self,
        amount_cents: i64,
        customer_ref: &str,
        idempotency_key: &str,
    ) -> Result<PaymentIntent, PaymentError> {
        if amount_cents <= 0 {
            return Err(PaymentError::Provider(format!("invalid amount {amount_cents} for {customer_ref}")));
        }
        if let Some(existing) = self.by_key.get(idempotency_key)
            && let Some(record) = self.intents.get(existing.value())
        {
            return Ok(record.intent.clone());
        }
        let id = format!("pi_{}", Ulid::new().to_string().to_lowercase());
        let intent = PaymentIntent {
            client_secret: format!("{id}_secret_{}", Ulid::new().to_string().to_lowercase()),
            id: id.clone(),
        };
        let status = if self.auto_capture { "succeeded" } else { "requires_payment_method" };
        self.intents.insert(
            id.clone(),
            IntentRecord {
                intent: intent.clone(),
                status: status.to_string(),
            },
        );
        self.by_key.insert(idempotency_key.to_string(), id);
        Ok(intent)
    }

    async fn retrieve_payment_intent(&self, id: &str) -> Result<String, PaymentError> {
        self.intents
            .get(id)
            .map(|r| r.status.clone())
            .ok_or_else(|| PaymentError::NotFound(id.to_string()))
    }
}

/// Consume provider callbacks until the channel closes. Each callback is
/// handled idempotently, so redelivery is harmless.
pub async fn run_callback_consumer(engine: Arc<Engine>, mut rx: mpsc::Receiver<PaymentCallback>) {
    while let Some(callback) = rx.recv().await {
        let rental_id = callback.rental_id;
        match engine.handle_payment_callback(callback).await {
            Ok(outcome) => info!("payment callback for rental {rental_id}: {outcome:?}"),
            Err(e) => warn!("payment callback for rental {rental_id} failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[test]
    fn provider_status_mapping() {
        assert_eq!(map_provider_status("succeeded"), PaymentStatus::Completed);
        assert_eq!(map_provider_status("processing"), PaymentStatus::Pending);
        assert_eq!(map_provider_status("requires_action"), PaymentStatus::Pending);
        assert_eq!(map_provider_status("requires_payment_method"), PaymentStatus::Pending);
        assert_eq!(map_provider_status("canceled"), PaymentStatus::Failed);
        assert_eq!(map_provider_status("something_new"), PaymentStatus::Failed);
    }

    fn fast_policy(attempts: u32) -> RetryPolicy {
        RetryPolicy {
            timeout: Duration::from_millis(50),
            attempts,
            backoff: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn retry_recovers_from_transient_failure() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result = with_retry(&fast_policy(3), "retrieve", move || async move {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(PaymentError::Provider("503".into()))
            } else {
                Ok("succeeded")
            }
        })
        .await;
        assert_eq!(result.unwrap(), "succeeded");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn retry_gives_up_after_attempts() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<(), _> = with_retry(&fast_policy(3), "retrieve", move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(PaymentError::Provider("down".into()))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn not_found_is_not_retried() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<(), _> = with_retry(&fast_policy(5), "retrieve", move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(PaymentError::NotFound("pi_x".into()))
        })
        .await;
        assert!(matches!(result, Err(PaymentError::NotFound(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn slow_call_times_out() {
        let result: Result<(), _> = with_retry(&fast_policy(1), "retrieve", || async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(PaymentError::Timeout(_))));
    }

    #[tokio::test]
    async fn local_provider_is_idempotent_per_key() {
        let provider = LocalPaymentProvider::new(false);
        let a = provider.create_payment_intent(5000, "cus_1", "rental_1").await.unwrap();
        let b = provider.create_payment_intent(5000, "cus_1", "rental_1").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(provider.intent_count(), 1);
        assert_eq!(provider.retrieve_payment_intent(&a.id).await.unwrap(), "requires_payment_method");

        provider.set_status(&a.id, "succeeded").unwrap();
        assert_eq!(provider.retrieve_payment_intent(&a.id).await.unwrap(), "succeeded");
        assert!(provider.retrieve_payment_intent("pi_missing").await.is_err());
    }

    #[tokio::test]
    async fn auto_capture_reports_succeeded() {
        let provider = LocalPaymentProvider::new(true);
        let intent = provider.create_payment_intent(100, "cus", "k").await.unwrap();
        assert_eq!(provider.retrieve_payment_intent(&intent.id).await.unwrap(), "succeeded");
        assert!(provider.create_payment_intent(0, "cus", "k2").await.is_err());
    }
}
