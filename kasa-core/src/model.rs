use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SignageType {
    Billboard,
    Banner,
    NeonSign,
    LedDisplay,
    WallMount,
    VehicleWrap,
    Other,
}

impl SignageType {
    /// Parse the kebab-case form used on the public site ("neon-sign") as well
    /// as the stored snake_case form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "billboard" => Some(Self::Billboard),
            "banner" => Some(Self::Banner),
            "neon-sign" | "neon_sign" => Some(Self::NeonSign),
            "led-display" | "led_display" => Some(Self::LedDisplay),
            "wall-mount" | "wall_mount" => Some(Self::WallMount),
            "vehicle-wrap" | "vehicle_wrap" => Some(Self::VehicleWrap),
            "other" => Some(Self::Other),
            _ => None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ApplicationStatus {
    PendingPayment,
    Paid,
    Approved,
    Rejected,
    Expired,
}

impl ApplicationStatus {
    pub fn label(&self) -> &'static str {
        match self {
            Self::PendingPayment => "Pending Payment",
            Self::Paid => "Paid",
            Self::Approved => "Approved",
            Self::Rejected => "Rejected",
            Self::Expired => "Expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending_payment" => Some(Self::PendingPayment),
            "paid" => Some(Self::Paid),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            "expired" => Some(Self::Expired),
            _ => None,
        }
    }
}

/// A signage permit application as stored by the datastore.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct SignageApplication {
    pub id: String,
    pub application_id: String,
    pub business_name: String,
    pub email: String,
    pub phone: Option<String>,
    pub signage_type: SignageType,
    pub location: Option<String>,
    pub description: Option<String>,
    pub status: ApplicationStatus,
    pub amount_due: f64,
    pub amount_paid: f64,
    pub payment_date: Option<DateTime<Utc>>,
    pub issued_date: Option<DateTime<Utc>>,
    pub expiry_date: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl SignageApplication {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expiry_date.map(|d| d < now).unwrap_or(false)
    }
}

/// Insert payload for a new application. Status, amounts, and timestamps are
/// defaulted by the datastore.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct NewApplication {
    pub application_id: String,
    pub business_name: String,
    pub email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    pub signage_type: SignageType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Partial update applied when an application moves to a new status.
/// Only fields that are `Some` are written.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct StatusPatch {
    pub status: ApplicationStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount_paid: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_date: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issued_date: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiry_date: Option<DateTime<Utc>>,
}

impl Default for ApplicationStatus {
    fn default() -> Self {
        Self::PendingPayment
    }
}

impl StatusPatch {
    /// Build the patch for a status transition, reproducing the admin
    /// workflow: marking paid settles the balance and stamps the payment
    /// date; approval stamps the issue date and a one-year expiry.
    pub fn for_transition(
        app: &SignageApplication,
        new_status: ApplicationStatus,
        now: DateTime<Utc>,
    ) -> Self {
        let mut patch = StatusPatch {
            status: new_status,
            ..Default::default()
        };
        match new_status {
            ApplicationStatus::Paid => {
                patch.amount_paid = Some(app.amount_due);
                patch.payment_date = Some(now);
            }
            ApplicationStatus::Approved => {
                patch.issued_date = Some(now);
                patch.expiry_date = Some(now + Duration::days(365));
            }
            _ => {}
        }
        patch
    }
}
