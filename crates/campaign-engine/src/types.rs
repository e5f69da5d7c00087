//! Shared identifiers and data types
//!
//! Every identifier is a thin newtype over `String` so that a campaign id can
//! never be passed where a call id is expected. [`CallId`] is the only one
//! with derivation logic: it is computed from the campaign, contact and
//! submission timestamp of a dial task so that redelivered tasks map to the
//! same call and duplicate originations are detectable.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

string_id!(
    /// Campaign identifier, owned by the external campaign CRUD service
    CampaignId
);
string_id!(
    /// Contact identifier within a campaign's contact list
    ContactId
);
string_id!(
    /// Dial task identifier, unique per intake message
    TaskId
);
string_id!(
    /// One admitted run of a campaign; holds a resource slot
    ExecutionId
);
string_id!(
    /// Call identifier shared with the PBX (used as its channel id)
    CallId
);

/// Namespace for deterministic call id derivation
const CALL_ID_NAMESPACE: Uuid = Uuid::from_u128(0x6f1c_52a4_9e0b_4d37_8a41_2c5e_7b90_d3f6);

impl ExecutionId {
    pub fn generate() -> Self {
        Self(format!("exec-{}", Uuid::new_v4()))
    }
}

impl CallId {
    /// Derive the call id for a dial task.
    ///
    /// The same `(campaign, contact, submitted_at)` triple always yields the
    /// same id, so a task redelivered after a visibility timeout is recognised
    /// as the call already in flight.
    pub fn derive(campaign_id: &CampaignId, contact_id: &ContactId, submitted_at: DateTime<Utc>) -> Self {
        let name = format!(
            "{}:{}:{}",
            campaign_id,
            contact_id,
            submitted_at.timestamp_millis()
        );
        Self(Uuid::new_v5(&CALL_ID_NAMESPACE, name.as_bytes()).to_string())
    }
}

/// Campaign type as configured in the campaign service
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CampaignType {
    Voice,
    Sms,
    /// Voice leg plus SMS follow-up; admitted against the voice quota
    Hybrid,
}

impl CampaignType {
    pub fn admission_class(&self) -> AdmissionClass {
        match self {
            CampaignType::Voice | CampaignType::Hybrid => AdmissionClass::Voice,
            CampaignType::Sms => AdmissionClass::Sms,
        }
    }
}

impl fmt::Display for CampaignType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CampaignType::Voice => write!(f, "voice"),
            CampaignType::Sms => write!(f, "sms"),
            CampaignType::Hybrid => write!(f, "hybrid"),
        }
    }
}

/// Partition a campaign type is accounted against
///
/// Voice and SMS partitions never share counters or queues.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdmissionClass {
    Voice,
    Sms,
}

impl AdmissionClass {
    pub const ALL: [AdmissionClass; 2] = [AdmissionClass::Voice, AdmissionClass::Sms];

    pub fn as_str(&self) -> &'static str {
        match self {
            AdmissionClass::Voice => "voice",
            AdmissionClass::Sms => "sms",
        }
    }
}

impl fmt::Display for AdmissionClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of dial work
///
/// Immutable once enqueued. Delivery attempts are tracked by the queue,
/// not on the task itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DialTask {
    pub task_id: TaskId,
    pub campaign_id: CampaignId,
    pub contact_id: ContactId,
    pub phone_number: String,
    pub audio_ref: String,
    pub ivr_flow: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
    /// Submission time, used for call id derivation
    pub submitted_at: DateTime<Utc>,
}

impl DialTask {
    pub fn call_id(&self) -> CallId {
        CallId::derive(&self.campaign_id, &self.contact_id, self.submitted_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_call_id_is_deterministic() {
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let a = CallId::derive(&"camp-1".into(), &"contact-7".into(), at);
        let b = CallId::derive(&"camp-1".into(), &"contact-7".into(), at);
        assert_eq!(a, b);

        let later = CallId::derive(&"camp-1".into(), &"contact-7".into(), at + chrono::Duration::seconds(1));
        assert_ne!(a, later);
    }

    #[test]
    fn test_hybrid_admits_as_voice() {
        assert_eq!(CampaignType::Hybrid.admission_class(), AdmissionClass::Voice);
        assert_eq!(CampaignType::Sms.admission_class(), AdmissionClass::Sms);
    }

    #[test]
    fn test_campaign_type_serde_is_lowercase() {
        let t: CampaignType = serde_json::from_str("\"hybrid\"").unwrap();
        assert_eq!(t, CampaignType::Hybrid);
        assert_eq!(serde_json::to_string(&CampaignType::Sms).unwrap(), "\"sms\"");
    }
}
