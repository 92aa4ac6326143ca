//! Payments: Razorpay orders and webhook reconciliation
//!
//! Orders are created server-side with a fixed price; the provider notifies
//! capture/failure through a signed webhook. Deliveries are deduplicated by
//! a hash of the raw body, so provider retries never double-process.

use anyhow::{Context, Result};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use std::time::Duration;

type HmacSha256 = Hmac<Sha256>;

/// Price of one song, in paise.
pub const PRICE_PAISE: i64 = 49_900;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Created,
    Captured,
    Failed,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Created => "created",
            PaymentStatus::Captured => "captured",
            PaymentStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "captured" => PaymentStatus::Captured,
            "failed" => PaymentStatus::Failed,
            _ => PaymentStatus::Created,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payment {
    pub id: String,
    pub request_id: String,
    pub provider_order_id: String,
    pub provider_payment_id: Option<String>,
    pub amount_paise: i64,
    pub currency: String,
    pub status: PaymentStatus,
    pub created_at: String,
    pub updated_at: String,
}

/// Webhook body shape: `{ event, payload: { payment: { entity: {...} } } }`.
#[derive(Debug, Deserialize)]
pub struct PaymentWebhookEvent {
    #[serde(default)]
    pub event: String,
    #[serde(default)]
    pub payload: PaymentWebhookPayload,
}

#[derive(Debug, Default, Deserialize)]
pub struct PaymentWebhookPayload {
    #[serde(default)]
    pub payment: Option<PaymentEntityWrapper>,
}

#[derive(Debug, Deserialize)]
pub struct PaymentEntityWrapper {
    pub entity: PaymentEntity,
}

#[derive(Debug, Deserialize)]
pub struct PaymentEntity {
    pub id: String,
    #[serde(default)]
    pub order_id: Option<String>,
}

/// Deduplication key for a webhook delivery: hash of the raw body, so an
/// identical retry maps to the same key.
pub fn idempotency_key(body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body);
    hex::encode(hasher.finalize())
}

/// Razorpay REST client plus webhook signature verification.
pub struct RazorpayClient {
    client: reqwest::Client,
    base_url: String,
    key_id: String,
    key_secret: String,
    webhook_secret: String,
}

const RAZORPAY_BASE_URL: &str = "https://api.razorpay.com";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProviderOrder {
    pub id: String,
    pub amount: i64,
    pub currency: String,
}

impl RazorpayClient {
    pub fn new(key_id: String, key_secret: String, webhook_secret: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(20))
            .build()
            .context("Failed to build payments HTTP client")?;

        Ok(Self {
            client,
            base_url: RAZORPAY_BASE_URL.to_string(),
            key_id,
            key_secret,
            webhook_secret,
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    /// Create a provider order for the given amount.
    pub async fn create_order(&self, amount_paise: i64, receipt: &str) -> Result<ProviderOrder> {
        let body = serde_json::json!({
            "amount": amount_paise,
            "currency": "INR",
            "receipt": receipt,
        });

        let response = self
            .client
            .post(format!("{}/v1/orders", self.base_url))
            .basic_auth(&self.key_id, Some(&self.key_secret))
            .json(&body)
            .send()
            .await
            .context("Order request failed")?;

        if !response.status().is_success() {
            anyhow::bail!("Payments API returned HTTP {}", response.status());
        }

        response
            .json::<ProviderOrder>()
            .await
            .context("Failed to decode order response")
    }

    /// Verify the `X-Razorpay-Signature` header: HMAC-SHA256 hex over the
    /// raw body with the webhook secret.
    pub fn verify_webhook_signature(&self, body: &[u8], signature_hex: &str) -> bool {
        verify_signature(&self.webhook_secret, body, signature_hex)
    }
}

pub fn verify_signature(secret: &str, body: &[u8], signature_hex: &str) -> bool {
    let Ok(expected) = hex::decode(signature_hex.trim()) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

/// Compute the hex signature for a body; used by tests to forge valid
/// deliveries.
pub fn sign_body(secret: &str, body: &[u8]) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .context("Failed to initialize webhook signer")?;
    mac.update(body);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

#[derive(Clone)]
pub struct PaymentStore {
    pool: SqlitePool,
}

impl PaymentStore {
    /// Create the store and its tables.
    pub async fn new(pool: SqlitePool) -> Result<Self> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS payments (
                id TEXT PRIMARY KEY,
                request_id TEXT NOT NULL,
                provider_order_id TEXT NOT NULL UNIQUE,
                provider_payment_id TEXT,
                amount_paise INTEGER NOT NULL,
                currency TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                FOREIGN KEY (request_id) REFERENCES song_requests(id) ON DELETE CASCADE
            )
            "#,
        )
        .execute(&pool)
        .await
        .context("Failed to create payments table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS payment_webhooks (
                idempotency_key TEXT PRIMARY KEY,
                event TEXT NOT NULL,
                received_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await
        .context("Failed to create payment_webhooks table")?;

        Ok(Self { pool })
    }

    pub async fn create(
        &self,
        request_id: &str,
        provider_order_id: &str,
        amount_paise: i64,
        currency: &str,
    ) -> Result<Payment> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = chrono::Utc::now().to_rfc3339();

        sqlx::query(
            r#"
            INSERT INTO payments
                (id, request_id, provider_order_id, provider_payment_id,
                 amount_paise, currency, status, created_at, updated_at)
            VALUES (?, ?, ?, NULL, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(request_id)
        .bind(provider_order_id)
        .bind(amount_paise)
        .bind(currency)
        .bind(PaymentStatus::Created.as_str())
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await
        .context("Failed to insert payment")?;

        Ok(Payment {
            id,
            request_id: request_id.to_string(),
            provider_order_id: provider_order_id.to_string(),
            provider_payment_id: None,
            amount_paise,
            currency: currency.to_string(),
            status: PaymentStatus::Created,
            created_at: now.clone(),
            updated_at: now,
        })
    }

    pub async fn find_by_order(&self, provider_order_id: &str) -> Result<Option<Payment>> {
        let row = sqlx::query_as::<
            _,
            (
                String,
                String,
                String,
                Option<String>,
                i64,
                String,
                String,
                String,
                String,
            ),
        >(
            r#"
            SELECT id, request_id, provider_order_id, provider_payment_id,
                   amount_paise, currency, status, created_at, updated_at
            FROM payments
            WHERE provider_order_id = ?
            "#,
        )
        .bind(provider_order_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch payment")?;

        Ok(row.map(
            |(
                id,
                request_id,
                provider_order_id,
                provider_payment_id,
                amount_paise,
                currency,
                status,
                created_at,
                updated_at,
            )| Payment {
                id,
                request_id,
                provider_order_id,
                provider_payment_id,
                amount_paise,
                currency,
                status: PaymentStatus::from_str(&status),
                created_at,
                updated_at,
            },
        ))
    }

    /// Record a webhook delivery. Returns false when this exact delivery
    /// was already processed.
    pub async fn record_webhook(&self, key: &str, event: &str) -> Result<bool> {
        let now = chrono::Utc::now().to_rfc3339();
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO payment_webhooks (idempotency_key, event, received_at)
            VALUES (?, ?, ?)
            "#,
        )
        .bind(key)
        .bind(event)
        .bind(&now)
        .execute(&self.pool)
        .await
        .context("Failed to record payment webhook")?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn set_status(
        &self,
        provider_order_id: &str,
        status: PaymentStatus,
        provider_payment_id: Option<&str>,
    ) -> Result<Option<Payment>> {
        let now = chrono::Utc::now().to_rfc3339();
        sqlx::query(
            r#"
            UPDATE payments SET
                status = ?,
                provider_payment_id = COALESCE(?, provider_payment_id),
                updated_at = ?
            WHERE provider_order_id = ?
            "#,
        )
        .bind(status.as_str())
        .bind(provider_payment_id)
        .bind(&now)
        .bind(provider_order_id)
        .execute(&self.pool)
        .await
        .context("Failed to update payment status")?;

        self.find_by_order(provider_order_id).await
    }
}
