//! Activation guards checked before the camera or pipeline starts.

use crate::backend::{AttendanceBackend, BackendError};
use crate::types::AttendanceConfig;
use kiosk_core::Enrollment;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GuardError {
    #[error("Branch code required. Set KIOSK_BRANCH_CODE to your branch code.")]
    MissingBranchCode,
    #[error("Branch \"{0}\" not found. Check the branch code.")]
    UnknownBranch(String),
    #[error("Face recognition is not enabled for this branch. Contact your administrator.")]
    FaceRecognitionDisabled,
    #[error(
        "This device is not registered for attendance.\n\nDevice ID: {0}\n\nAsk your administrator to register this device in the attendance settings."
    )]
    DeviceNotRegistered(String),
    #[error("No barbers enrolled for face recognition at this branch.")]
    NoEnrollments,
    #[error("{0}")]
    Backend(#[from] BackendError),
}

/// Branch data resolved at activation; the starting snapshot for the session.
#[derive(Debug, Clone)]
pub struct GuardedSession {
    pub branch_id: String,
    pub branch_name: Option<String>,
    pub config: AttendanceConfig,
    pub enrollments: Vec<Enrollment>,
}

/// Kiosk activation: branch code resolves, face recognition is enabled,
/// this device is registered, and at least one enrollment exists. The
/// first failing check wins.
pub async fn run_guards(
    backend: &dyn AttendanceBackend,
    branch_code: Option<&str>,
    device_fingerprint: &str,
) -> Result<GuardedSession, GuardError> {
    let code = branch_code
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .ok_or(GuardError::MissingBranchCode)?;

    let branch = backend
        .branch_by_code(code)
        .await?
        .ok_or_else(|| GuardError::UnknownBranch(code.to_string()))?;

    let config = backend.attendance_config(&branch.id).await?;
    if !config.fr_enabled {
        return Err(GuardError::FaceRecognitionDisabled);
    }

    let device = backend.device_registered(&branch.id, device_fingerprint).await?;
    if !device.registered {
        return Err(GuardError::DeviceNotRegistered(device_fingerprint.to_string()));
    }

    let enrollments = backend.enrollments(&branch.id).await?;
    if enrollments.is_empty() {
        return Err(GuardError::NoEnrollments);
    }

    tracing::info!(
        branch = %branch.id,
        code,
        device = device.device_name.as_deref().unwrap_or("-"),
        enrollments = enrollments.len(),
        "kiosk guards passed"
    );

    Ok(GuardedSession {
        branch_id: branch.id,
        branch_name: branch.name,
        config,
        enrollments,
    })
}

/// Staff check-in activation: the branch is already known, nothing is
/// guarded beyond fetching the snapshot.
pub async fn load_staff_session(backend: &dyn AttendanceBackend, branch_id: &str) -> Result<GuardedSession, GuardError> {
    let config = backend.attendance_config(branch_id).await?;
    let enrollments = backend.enrollments(branch_id).await?;
    Ok(GuardedSession {
        branch_id: branch_id.to_string(),
        branch_name: None,
        config,
        enrollments,
    })
}
