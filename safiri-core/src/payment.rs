use async_trait::async_trait;
use safiri_shared::Masked;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Succeeded,
    Declined,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequest {
    pub booking_id: Uuid,
    pub amount: i32,
    pub currency: String,
    /// MSISDN the STK push goes to, when the gateway needs one.
    pub phone_number: Option<Masked<String>>,
    /// Idempotency reference the gateway echoes back.
    pub reference: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PaymentResult {
    pub status: PaymentStatus,
    pub transaction_reference: Option<String>,
    pub message: Option<String>,
}

impl PaymentResult {
    pub fn succeeded(transaction_reference: impl Into<String>) -> Self {
        Self {
            status: PaymentStatus::Succeeded,
            transaction_reference: Some(transaction_reference.into()),
            message: None,
        }
    }

    pub fn declined(message: impl Into<String>) -> Self {
        Self {
            status: PaymentStatus::Declined,
            transaction_reference: None,
            message: Some(message.into()),
        }
    }
}

/// The external gateway (M-Pesa in production). An `Err` means the gateway
/// could not be reached or answered garbage; a decline is an `Ok`.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn charge(
        &self,
        request: &PaymentRequest,
    ) -> Result<PaymentResult, Box<dyn std::error::Error + Send + Sync>>;
}
