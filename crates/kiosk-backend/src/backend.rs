use crate::types::{
    AttendanceConfig, BranchInfo, ClockIn, ClockInReceipt, ClockOut, ClockOutReceipt, ClockStatus, DeviceCheck,
    ManualClockIn, ManualReceipt, PhotoRef,
};
use async_trait::async_trait;
use kiosk_core::Enrollment;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("network error: {0}")]
    Network(String),
    /// A backend function rejected the call; `message` is shown verbatim.
    #[error("{message}")]
    Function { path: String, message: String },
    #[error("unexpected response from {path}: {reason}")]
    Decode { path: String, reason: String },
    #[error("invalid identity: {0}")]
    InvalidIdentity(String),
    #[error("photo upload failed: {0}")]
    Upload(String),
}

impl From<reqwest::Error> for BackendError {
    fn from(e: reqwest::Error) -> Self {
        BackendError::Network(e.to_string())
    }
}

/// Everything the kiosk needs from the attendance backend.
#[async_trait]
pub trait AttendanceBackend: Send + Sync {
    /// `None` when no branch has this code.
    async fn branch_by_code(&self, code: &str) -> Result<Option<BranchInfo>, BackendError>;

    async fn enrollments(&self, branch_id: &str) -> Result<Vec<Enrollment>, BackendError>;

    async fn attendance_config(&self, branch_id: &str) -> Result<AttendanceConfig, BackendError>;

    async fn device_registered(&self, branch_id: &str, fingerprint: &str) -> Result<DeviceCheck, BackendError>;

    async fn clock_statuses(&self, branch_id: &str) -> Result<Vec<ClockStatus>, BackendError>;

    /// First upload step: a one-shot URL to POST the photo to.
    async fn upload_target(&self) -> Result<String, BackendError>;

    /// Second upload step: transfer the JPEG and get its storage reference.
    async fn upload_photo(&self, target: &str, jpeg: Vec<u8>) -> Result<PhotoRef, BackendError>;

    async fn clock_in(&self, request: &ClockIn) -> Result<ClockInReceipt, BackendError>;

    async fn clock_out(&self, request: &ClockOut) -> Result<ClockOutReceipt, BackendError>;

    async fn clock_in_manual(&self, request: &ManualClockIn) -> Result<ManualReceipt, BackendError>;

    /// Both upload steps in order.
    async fn store_photo(&self, jpeg: Vec<u8>) -> Result<PhotoRef, BackendError> {
        let target = self.upload_target().await?;
        self.upload_photo(&target, jpeg).await
    }

    /// Current clocked-in state for one identity; unknown identities are
    /// treated as clocked out.
    async fn is_clocked_in(&self, branch_id: &str, identity: &kiosk_core::IdentityRef) -> Result<bool, BackendError> {
        let statuses = self.clock_statuses(branch_id).await?;
        Ok(statuses
            .iter()
            .any(|s| &s.identity == identity && s.is_clocked_in))
    }
}
