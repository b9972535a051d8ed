//! Delivery receipts surfaced to callers.
//!
//! Callers never see raw store or transport errors; failures are normalized
//! into the receipt's error text.

use uuid::Uuid;

/// Terminal disposition of a dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    /// Accepted for processing; no durable state yet.
    Accepted,
    /// Durably enqueued in the outbox for transport fan-out.
    Queued,
    /// A local receptor handled the message to completion.
    Delivered,
    /// Dispatch failed; see `error`.
    Failed,
}

/// What the dispatcher returns for every send or publish.
#[derive(Debug, Clone)]
pub struct DeliveryReceipt {
    pub message_id: Uuid,
    pub status: DeliveryStatus,
    pub error: Option<String>,
}

impl DeliveryReceipt {
    pub fn accepted(message_id: Uuid) -> Self {
        Self {
            message_id,
            status: DeliveryStatus::Accepted,
            error: None,
        }
    }

    pub fn queued(message_id: Uuid) -> Self {
        Self {
            message_id,
            status: DeliveryStatus::Queued,
            error: None,
        }
    }

    pub fn delivered(message_id: Uuid) -> Self {
        Self {
            message_id,
            status: DeliveryStatus::Delivered,
            error: None,
        }
    }

    pub fn failed(message_id: Uuid, error: impl Into<String>) -> Self {
        Self {
            message_id,
            status: DeliveryStatus::Failed,
            error: Some(error.into()),
        }
    }

    pub fn is_failed(&self) -> bool {
        self.status == DeliveryStatus::Failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_receipts_carry_error_text() {
        let receipt = DeliveryReceipt::failed(Uuid::now_v7(), "envelope too large");
        assert!(receipt.is_failed());
        assert_eq!(receipt.error.as_deref(), Some("envelope too large"));

        let receipt = DeliveryReceipt::queued(Uuid::now_v7());
        assert!(!receipt.is_failed());
        assert!(receipt.error.is_none());
    }
}
