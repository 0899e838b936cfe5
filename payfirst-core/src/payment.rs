use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Payment status as reported by the payment provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PaymentStatus {
    Pending,
    AwaitingRiskAnalysis,
    Confirmed,
    Received,
    ReceivedInCash,
    Overdue,
    Declined,
    Cancelled,
    Refunded,
    RefundRequested,
    ChargebackRequested,
    Deleted,
    Unknown(String),
}

/// How reconciliation should treat a status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentDisposition {
    /// Money is in; provisioning may proceed.
    Confirmed,
    /// Not there yet. Provider confirmation is eventually consistent.
    NotYetConfirmed,
    /// The provider will never confirm this payment.
    Rejected,
}

impl PaymentStatus {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "PENDING" => PaymentStatus::Pending,
            "AWAITING_RISK_ANALYSIS" => PaymentStatus::AwaitingRiskAnalysis,
            "CONFIRMED" => PaymentStatus::Confirmed,
            "RECEIVED" => PaymentStatus::Received,
            "RECEIVED_IN_CASH" => PaymentStatus::ReceivedInCash,
            "OVERDUE" => PaymentStatus::Overdue,
            "DECLINED" => PaymentStatus::Declined,
            "CANCELLED" | "CANCELED" => PaymentStatus::Cancelled,
            "REFUNDED" => PaymentStatus::Refunded,
            "REFUND_REQUESTED" => PaymentStatus::RefundRequested,
            "CHARGEBACK_REQUESTED" => PaymentStatus::ChargebackRequested,
            "DELETED" => PaymentStatus::Deleted,
            _ => PaymentStatus::Unknown(raw.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            PaymentStatus::Pending => "PENDING",
            PaymentStatus::AwaitingRiskAnalysis => "AWAITING_RISK_ANALYSIS",
            PaymentStatus::Confirmed => "CONFIRMED",
            PaymentStatus::Received => "RECEIVED",
            PaymentStatus::ReceivedInCash => "RECEIVED_IN_CASH",
            PaymentStatus::Overdue => "OVERDUE",
            PaymentStatus::Declined => "DECLINED",
            PaymentStatus::Cancelled => "CANCELLED",
            PaymentStatus::Refunded => "REFUNDED",
            PaymentStatus::RefundRequested => "REFUND_REQUESTED",
            PaymentStatus::ChargebackRequested => "CHARGEBACK_REQUESTED",
            PaymentStatus::Deleted => "DELETED",
            PaymentStatus::Unknown(raw) => raw.as_str(),
        }
    }

    pub fn disposition(&self) -> PaymentDisposition {
        match self {
            PaymentStatus::Confirmed | PaymentStatus::Received | PaymentStatus::ReceivedInCash => {
                PaymentDisposition::Confirmed
            }
            PaymentStatus::Declined
            | PaymentStatus::Cancelled
            | PaymentStatus::Refunded
            | PaymentStatus::RefundRequested
            | PaymentStatus::ChargebackRequested
            | PaymentStatus::Deleted => PaymentDisposition::Rejected,
            PaymentStatus::Pending
            | PaymentStatus::AwaitingRiskAnalysis
            | PaymentStatus::Overdue
            | PaymentStatus::Unknown(_) => PaymentDisposition::NotYetConfirmed,
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for PaymentStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for PaymentStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(PaymentStatus::parse(&raw))
    }
}
