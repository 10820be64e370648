//! Payment gateway collaborator.
//!
//! The ledger consumes the gateway through the [`PaymentGateway`] trait:
//! charge creation before a gateway payment goes pending, refund execution
//! before a refund row commits. Amounts cross this boundary as integer
//! minor units only. Webhook payloads are verified and parsed here; the
//! boundary layer performs the verification before handing the event to the
//! payment ledger.

use std::sync::Mutex;

use anyhow::anyhow;
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use ledger_core::error::LedgerError;
use reqwest::Client;
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

/// Charge creation request; amount in minor units (cents).
#[derive(Debug, Clone, Serialize)]
pub struct ChargeRequest {
    pub amount_minor: i64,
    pub currency: String,
    pub invoice_id: String,
    pub tenant_id: String,
}

/// Result of charge creation.
#[derive(Debug, Clone, Deserialize)]
pub struct ChargeIntent {
    pub gateway_request_id: String,
    pub client_secret: Option<String>,
}

/// Result of a gateway refund.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayRefund {
    pub gateway_refund_id: String,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_charge(&self, request: &ChargeRequest) -> Result<ChargeIntent, LedgerError>;

    async fn refund(
        &self,
        gateway_charge_id: &str,
        amount_minor: i64,
    ) -> Result<GatewayRefund, LedgerError>;
}

/// Stripe client configuration.
#[derive(Debug, Clone)]
pub struct StripeConfig {
    pub secret_key: Secret<String>,
    pub webhook_secret: Secret<String>,
    pub api_base_url: String,
}

/// Stripe client for charge and refund execution.
#[derive(Clone)]
pub struct StripeClient {
    client: Client,
    config: StripeConfig,
}

/// Payment intent response from Stripe.
#[derive(Debug, Deserialize)]
struct PaymentIntentResponse {
    id: String,
    client_secret: Option<String>,
}

/// Refund response from Stripe.
#[derive(Debug, Deserialize)]
struct RefundResponse {
    id: String,
}

/// Webhook event delivered by Stripe.
#[derive(Debug, Deserialize)]
pub struct WebhookEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: WebhookData,
}

#[derive(Debug, Deserialize)]
pub struct WebhookData {
    pub object: WebhookPaymentIntent,
}

/// Payment intent entity inside a webhook payload.
#[derive(Debug, Deserialize)]
pub struct WebhookPaymentIntent {
    pub id: String,
    pub amount: i64,
    pub currency: String,
    pub status: String,
    #[serde(default)]
    pub last_payment_error: Option<serde_json::Value>,
}

impl StripeClient {
    pub fn new(config: StripeConfig) -> Self {
        Self {
            client: Client::new(),
            config,
        }
    }

    /// Check if Stripe is configured (credentials are set).
    pub fn is_configured(&self) -> bool {
        !self.config.secret_key.expose_secret().is_empty()
    }

    /// Verify a webhook signature header.
    ///
    /// The header carries `t=<timestamp>,v1=<signature>`; the signature is
    /// `HMAC-SHA256("{timestamp}.{body}", webhook_secret)`.
    pub fn verify_webhook_signature(&self, body: &str, signature_header: &str) -> Result<bool, LedgerError> {
        let mut timestamp = None;
        let mut signature = None;
        for part in signature_header.split(',') {
            match part.trim().split_once('=') {
                Some(("t", value)) => timestamp = Some(value),
                Some(("v1", value)) => signature = Some(value),
                _ => {}
            }
        }
        let (timestamp, signature) = match (timestamp, signature) {
            (Some(t), Some(v)) => (t, v),
            _ => {
                tracing::warn!("Malformed webhook signature header");
                return Ok(false);
            }
        };

        let payload = format!("{}.{}", timestamp, body);
        let expected =
            compute_signature(&payload, self.config.webhook_secret.expose_secret())?;

        let is_valid = expected == signature;
        if !is_valid {
            tracing::warn!("Webhook signature verification failed");
        }
        Ok(is_valid)
    }

    /// Parse a webhook event from the request body.
    pub fn parse_webhook_event(&self, body: &str) -> Result<WebhookEvent, LedgerError> {
        serde_json::from_str(body)
            .map_err(|e| LedgerError::GatewayError(anyhow!("Invalid webhook payload: {}", e)))
    }
}

/// Compute HMAC-SHA256 signature.
fn compute_signature(payload: &str, secret: &str) -> Result<String, LedgerError> {
    type HmacSha256 = Hmac<Sha256>;
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| LedgerError::GatewayError(anyhow!("Invalid key length")))?;
    mac.update(payload.as_bytes());
    let result = mac.finalize();
    Ok(hex::encode(result.into_bytes()))
}

#[async_trait]
impl PaymentGateway for StripeClient {
    async fn create_charge(&self, request: &ChargeRequest) -> Result<ChargeIntent, LedgerError> {
        if !self.is_configured() {
            return Err(LedgerError::GatewayError(anyhow!(
                "Stripe credentials not configured"
            )));
        }

        let url = format!("{}/payment_intents", self.config.api_base_url);
        let amount = request.amount_minor.to_string();
        let params = [
            ("amount", amount.as_str()),
            ("currency", request.currency.as_str()),
            ("metadata[invoice_id]", request.invoice_id.as_str()),
            ("metadata[tenant_id]", request.tenant_id.as_str()),
        ];

        let response = self
            .client
            .post(&url)
            .basic_auth(self.config.secret_key.expose_secret(), None::<&str>)
            .form(&params)
            .send()
            .await
            .map_err(|e| LedgerError::GatewayError(anyhow!("Charge request failed: {}", e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| LedgerError::GatewayError(anyhow!("Charge response unreadable: {}", e)))?;

        tracing::debug!(status = %status, "Stripe create_charge response");

        if status.is_success() {
            let intent: PaymentIntentResponse = serde_json::from_str(&body)
                .map_err(|e| LedgerError::GatewayError(anyhow!("Invalid charge response: {}", e)))?;
            tracing::info!(intent_id = %intent.id, amount_minor = request.amount_minor, "Stripe payment intent created");
            Ok(ChargeIntent {
                gateway_request_id: intent.id,
                client_secret: intent.client_secret,
            })
        } else {
            tracing::error!(status = %status, body = %body, "Stripe charge creation failed");
            Err(LedgerError::GatewayError(anyhow!(
                "Stripe error ({}): {}",
                status,
                body
            )))
        }
    }

    async fn refund(
        &self,
        gateway_charge_id: &str,
        amount_minor: i64,
    ) -> Result<GatewayRefund, LedgerError> {
        if !self.is_configured() {
            return Err(LedgerError::GatewayError(anyhow!(
                "Stripe credentials not configured"
            )));
        }

        let url = format!("{}/refunds", self.config.api_base_url);
        let amount = amount_minor.to_string();
        let params = [
            ("payment_intent", gateway_charge_id),
            ("amount", amount.as_str()),
        ];

        let response = self
            .client
            .post(&url)
            .basic_auth(self.config.secret_key.expose_secret(), None::<&str>)
            .form(&params)
            .send()
            .await
            .map_err(|e| LedgerError::GatewayError(anyhow!("Refund request failed: {}", e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| LedgerError::GatewayError(anyhow!("Refund response unreadable: {}", e)))?;

        if status.is_success() {
            let refund: RefundResponse = serde_json::from_str(&body)
                .map_err(|e| LedgerError::GatewayError(anyhow!("Invalid refund response: {}", e)))?;
            tracing::info!(refund_id = %refund.id, amount_minor = amount_minor, "Stripe refund created");
            Ok(GatewayRefund {
                gateway_refund_id: refund.id,
            })
        } else {
            tracing::error!(status = %status, body = %body, "Stripe refund failed");
            Err(LedgerError::GatewayError(anyhow!(
                "Stripe error ({}): {}",
                status,
                body
            )))
        }
    }
}

/// Deterministic in-process gateway for tests and local development.
#[derive(Default)]
pub struct MockGateway {
    counter: Mutex<u64>,
    refunds: Mutex<Vec<(String, i64)>>,
}

impl MockGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refund calls seen so far, as (charge id, minor units).
    pub fn refund_calls(&self) -> Vec<(String, i64)> {
        self.refunds.lock().expect("mock lock poisoned").clone()
    }
}

#[async_trait]
impl PaymentGateway for MockGateway {
    async fn create_charge(&self, _request: &ChargeRequest) -> Result<ChargeIntent, LedgerError> {
        let mut counter = self.counter.lock().expect("mock lock poisoned");
        *counter += 1;
        Ok(ChargeIntent {
            gateway_request_id: format!("pi_mock_{:06}", *counter),
            client_secret: Some(format!("pi_mock_{:06}_secret", *counter)),
        })
    }

    async fn refund(
        &self,
        gateway_charge_id: &str,
        amount_minor: i64,
    ) -> Result<GatewayRefund, LedgerError> {
        let mut refunds = self.refunds.lock().expect("mock lock poisoned");
        refunds.push((gateway_charge_id.to_string(), amount_minor));
        Ok(GatewayRefund {
            gateway_refund_id: format!("re_mock_{:06}", refunds.len()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> StripeConfig {
        StripeConfig {
            secret_key: Secret::new("sk_test_123".to_string()),
            webhook_secret: Secret::new("whsec_test".to_string()),
            api_base_url: "https://api.stripe.com/v1".to_string(),
        }
    }

    #[test]
    fn test_is_configured() {
        let client = StripeClient::new(test_config());
        assert!(client.is_configured());

        let empty_config = StripeConfig {
            secret_key: Secret::new("".to_string()),
            webhook_secret: Secret::new("".to_string()),
            api_base_url: "".to_string(),
        };
        let client = StripeClient::new(empty_config);
        assert!(!client.is_configured());
    }

    #[test]
    fn test_webhook_signature_verification() {
        let client = StripeClient::new(test_config());

        let body = r#"{"id":"evt_1","type":"payment_intent.succeeded"}"#;
        let payload = format!("1700000000.{}", body);
        let expected = compute_signature(&payload, "whsec_test").unwrap();
        let header = format!("t=1700000000,v1={}", expected);

        assert!(client.verify_webhook_signature(body, &header).unwrap());
    }

    #[test]
    fn test_invalid_signature() {
        let client = StripeClient::new(test_config());

        let body = r#"{"id":"evt_1","type":"payment_intent.succeeded"}"#;
        let header = "t=1700000000,v1=deadbeef";

        assert!(!client.verify_webhook_signature(body, header).unwrap());
    }

    #[test]
    fn test_malformed_signature_header() {
        let client = StripeClient::new(test_config());
        assert!(!client.verify_webhook_signature("{}", "not-a-header").unwrap());
    }

    #[test]
    fn test_parse_webhook_event() {
        let client = StripeClient::new(test_config());
        let body = r#"{
            "id": "evt_1",
            "type": "payment_intent.succeeded",
            "data": {
                "object": {
                    "id": "pi_123",
                    "amount": 10000,
                    "currency": "usd",
                    "status": "succeeded"
                }
            }
        }"#;

        let event = client.parse_webhook_event(body).unwrap();
        assert_eq!(event.event_type, "payment_intent.succeeded");
        assert_eq!(event.data.object.id, "pi_123");
        assert_eq!(event.data.object.amount, 10000);
    }

    #[tokio::test]
    async fn mock_gateway_issues_sequential_intents() {
        let gateway = MockGateway::new();
        let request = ChargeRequest {
            amount_minor: 10000,
            currency: "usd".to_string(),
            invoice_id: "inv".to_string(),
            tenant_id: "tenant".to_string(),
        };

        let first = gateway.create_charge(&request).await.unwrap();
        let second = gateway.create_charge(&request).await.unwrap();
        assert_ne!(first.gateway_request_id, second.gateway_request_id);

        gateway.refund(&first.gateway_request_id, 500).await.unwrap();
        assert_eq!(gateway.refund_calls(), vec![(first.gateway_request_id, 500)]);
    }
}
