//! Records exchanged with the attendance backend.

use crate::backend::BackendError;
use kiosk_core::{Descriptor, Enrollment, IdentityRef, ThresholdPolicy};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct BranchInfo {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub branch_code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceConfig {
    #[serde(default)]
    pub fr_enabled: bool,
    #[serde(default = "default_liveness_required")]
    pub liveness_required: bool,
    #[serde(default)]
    pub admin_review_threshold: Option<f32>,
    #[serde(default)]
    pub auto_approve_threshold: Option<f32>,
}

fn default_liveness_required() -> bool {
    true
}

impl Default for AttendanceConfig {
    fn default() -> Self {
        Self {
            fr_enabled: false,
            liveness_required: true,
            admin_review_threshold: None,
            auto_approve_threshold: None,
        }
    }
}

impl AttendanceConfig {
    pub fn thresholds(&self) -> ThresholdPolicy {
        ThresholdPolicy::resolve(self.admin_review_threshold, self.auto_approve_threshold)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DeviceCheck {
    pub registered: bool,
    #[serde(default)]
    pub device_name: Option<String>,
}

/// Clocked-in state of one identity at a branch.
#[derive(Debug, Clone, PartialEq)]
pub struct ClockStatus {
    pub identity: IdentityRef,
    pub display_name: String,
    pub is_clocked_in: bool,
}

/// Opaque reference to an uploaded photo (a storage id).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhotoRef(pub String);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClockInReceipt {
    /// Epoch milliseconds.
    pub clock_in_time: i64,
    #[serde(default)]
    pub auto_approved: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClockOutReceipt {
    /// Milliseconds between clock-in and clock-out.
    pub shift_duration: i64,
    #[serde(default)]
    pub auto_approved: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManualReceipt {
    pub clock_in_time: i64,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClockIn {
    pub identity: IdentityRef,
    pub branch_id: String,
    pub confidence: f32,
    pub photo: PhotoRef,
    pub liveness_passed: bool,
    pub device_fingerprint: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClockOut {
    pub identity: IdentityRef,
    pub confidence: f32,
    pub photo: PhotoRef,
    pub liveness_passed: bool,
    pub device_fingerprint: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ManualClockIn {
    pub identity: IdentityRef,
    pub branch_id: String,
    pub photo: Option<PhotoRef>,
    pub device_fingerprint: Option<String>,
}

/// Resolve the backend's `barber_id` / `user_id` pair. Exactly one must be set.
pub(crate) fn identity_from_ids(barber_id: Option<String>, user_id: Option<String>) -> Result<IdentityRef, BackendError> {
    match (barber_id, user_id) {
        (Some(id), None) => Ok(IdentityRef::Barber(id)),
        (None, Some(id)) => Ok(IdentityRef::StaffUser(id)),
        (Some(b), Some(u)) => Err(BackendError::InvalidIdentity(format!(
            "both barber_id ({b}) and user_id ({u}) set"
        ))),
        (None, None) => Err(BackendError::InvalidIdentity("neither barber_id nor user_id set".into())),
    }
}

/// Argument key and value for an identity.
pub(crate) fn identity_arg(identity: &IdentityRef) -> (&'static str, &str) {
    match identity {
        IdentityRef::Barber(id) => ("barber_id", id),
        IdentityRef::StaffUser(id) => ("user_id", id),
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct RawEnrollment {
    #[serde(default)]
    pub barber_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub barber_name: Option<String>,
    #[serde(default)]
    pub barber_avatar: Option<String>,
    #[serde(default)]
    pub embeddings: Vec<Vec<f32>>,
}

impl RawEnrollment {
    /// Convert, dropping malformed descriptors. `None` when the identity is
    /// ambiguous or no usable descriptor remains.
    pub fn into_enrollment(self) -> Option<Enrollment> {
        let identity = match identity_from_ids(self.barber_id, self.user_id) {
            Ok(identity) => identity,
            Err(e) => {
                tracing::warn!(error = %e, "skipping enrollment");
                return None;
            }
        };

        let total = self.embeddings.len();
        let embeddings: Vec<Descriptor> = self
            .embeddings
            .into_iter()
            .filter_map(|v| Descriptor::new(v).ok())
            .collect();
        if embeddings.len() < total {
            tracing::warn!(%identity, dropped = total - embeddings.len(), "dropped malformed descriptors");
        }
        if embeddings.is_empty() {
            return None;
        }

        Some(Enrollment {
            identity,
            display_name: self.barber_name.unwrap_or_else(|| "Unknown".to_string()),
            avatar_url: self.barber_avatar,
            embeddings,
        })
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct RawClockStatus {
    #[serde(default)]
    pub barber_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub barber_name: Option<String>,
    #[serde(rename = "isClockedIn", default)]
    pub is_clocked_in: bool,
}

impl RawClockStatus {
    pub fn into_status(self) -> Option<ClockStatus> {
        let identity = identity_from_ids(self.barber_id, self.user_id).ok()?;
        Some(ClockStatus {
            identity,
            display_name: self.barber_name.unwrap_or_default(),
            is_clocked_in: self.is_clocked_in,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiosk_core::types::DESCRIPTOR_LEN;
    use serde_json::json;

    #[test]
    fn test_identity_xor() {
        assert_eq!(
            identity_from_ids(Some("b1".into()), None).unwrap(),
            IdentityRef::Barber("b1".into())
        );
        assert_eq!(
            identity_from_ids(None, Some("u1".into())).unwrap(),
            IdentityRef::StaffUser("u1".into())
        );
        assert!(identity_from_ids(Some("b".into()), Some("u".into())).is_err());
        assert!(identity_from_ids(None, None).is_err());
    }

    #[test]
    fn test_identity_arg_keys() {
        assert_eq!(identity_arg(&IdentityRef::Barber("x".into())), ("barber_id", "x"));
        assert_eq!(identity_arg(&IdentityRef::StaffUser("y".into())), ("user_id", "y"));
    }

    #[test]
    fn test_enrollment_conversion_drops_bad_descriptors() {
        let raw: RawEnrollment = serde_json::from_value(json!({
            "_id": "e1",
            "user_id": "u1",
            "person_type": "staff",
            "barber_name": "Ana",
            "embeddings": [vec![0.1; DESCRIPTOR_LEN], vec![0.1; 12]],
        }))
        .unwrap();
        let enrollment = raw.into_enrollment().unwrap();
        assert_eq!(enrollment.identity, IdentityRef::StaffUser("u1".into()));
        assert_eq!(enrollment.display_name, "Ana");
        assert_eq!(enrollment.embeddings.len(), 1);
    }

    #[test]
    fn test_enrollment_without_descriptors_is_skipped() {
        let raw: RawEnrollment = serde_json::from_value(json!({
            "barber_id": "b1",
            "embeddings": [],
        }))
        .unwrap();
        assert!(raw.into_enrollment().is_none());
    }

    #[test]
    fn test_config_defaults() {
        let config: AttendanceConfig = serde_json::from_value(json!({ "fr_enabled": true })).unwrap();
        assert!(config.liveness_required);
        assert_eq!(config.thresholds(), ThresholdPolicy::default());
    }

    #[test]
    fn test_clock_status_parsing() {
        let raw: RawClockStatus = serde_json::from_value(json!({
            "barber_id": "b7",
            "barber_name": "Rico",
            "isClockedIn": true,
        }))
        .unwrap();
        let status = raw.into_status().unwrap();
        assert!(status.is_clocked_in);
        assert_eq!(status.identity, IdentityRef::Barber("b7".into()));
    }

    #[test]
    fn test_receipts_parse_camel_case() {
        let receipt: ClockOutReceipt = serde_json::from_value(json!({
            "success": true,
            "shiftDuration": 3_600_000,
            "autoApproved": false,
        }))
        .unwrap();
        assert_eq!(receipt.shift_duration, 3_600_000);
        assert!(!receipt.auto_approved);
    }
}
