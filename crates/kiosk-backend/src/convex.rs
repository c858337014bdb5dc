//! [`AttendanceBackend`] over the Convex HTTP API.
//!
//! Every call is `POST <deployment>/api/{query,mutation}` with a
//! `{path, args, format}` body; replies carry a `status` tag.

use crate::backend::{AttendanceBackend, BackendError};
use crate::types::{
    identity_arg, AttendanceConfig, BranchInfo, ClockIn, ClockInReceipt, ClockOut, ClockOutReceipt, ClockStatus,
    DeviceCheck, ManualClockIn, ManualReceipt, PhotoRef, RawClockStatus, RawEnrollment,
};
use async_trait::async_trait;
use kiosk_core::Enrollment;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

const GET_BRANCH_BY_CODE: &str = "services/branches:getBranchByCode";
const GET_ENROLLMENTS: &str = "services/faceAttendance:getEnrollmentsByBranch";
const GET_CONFIG: &str = "services/faceAttendance:getAttendanceConfig";
const CHECK_DEVICE: &str = "services/faceAttendance:checkDeviceRegistered";
const GENERATE_UPLOAD_URL: &str = "services/faceAttendance:generateUploadUrl";
const CLOCK_IN: &str = "services/faceAttendance:clockInWithFR";
const CLOCK_OUT: &str = "services/faceAttendance:clockOutWithFR";
const CLOCK_IN_MANUAL: &str = "services/faceAttendance:clockInManualFallback";
const GET_STATUSES: &str = "services/timeAttendance:getBarberStatusForBranch";

#[derive(Debug, Clone, Copy)]
enum CallKind {
    Query,
    Mutation,
}

impl CallKind {
    fn endpoint(&self) -> &'static str {
        match self {
            CallKind::Query => "api/query",
            CallKind::Mutation => "api/mutation",
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
enum Envelope {
    Success {
        value: Value,
    },
    Error {
        #[serde(rename = "errorMessage", default)]
        error_message: String,
        #[serde(rename = "errorData", default)]
        error_data: Option<Value>,
    },
}

impl Envelope {
    /// Unwrap the value, preferring the structured `errorData.message`.
    fn into_value(self, path: &str) -> Result<Value, BackendError> {
        match self {
            Envelope::Success { value } => Ok(value),
            Envelope::Error {
                error_message,
                error_data,
            } => {
                let message = error_data
                    .as_ref()
                    .and_then(|d| d.get("message"))
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or(error_message);
                Err(BackendError::Function {
                    path: path.to_string(),
                    message,
                })
            }
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadResponse {
    storage_id: String,
}

#[derive(Clone)]
pub struct ConvexBackend {
    base_url: String,
    client: reqwest::Client,
}

impl ConvexBackend {
    pub fn new(base_url: &str) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    async fn call(&self, kind: CallKind, path: &str, args: Value) -> Result<Value, BackendError> {
        let url = format!("{}/{}", self.base_url, kind.endpoint());
        tracing::debug!(path, ?kind, "backend call");

        let response = self
            .client
            .post(&url)
            .json(&json!({ "path": path, "args": args, "format": "json" }))
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;

        // Function errors come back as an error envelope, sometimes with a
        // non-2xx status; anything else unparseable is a transport problem.
        match serde_json::from_str::<Envelope>(&body) {
            Ok(envelope) => envelope.into_value(path),
            Err(e) if status.is_success() => Err(BackendError::Decode {
                path: path.to_string(),
                reason: e.to_string(),
            }),
            Err(_) => Err(BackendError::Network(format!("{path}: HTTP {status}"))),
        }
    }

    async fn typed<T: DeserializeOwned>(&self, kind: CallKind, path: &str, args: Value) -> Result<T, BackendError> {
        let value = self.call(kind, path, args).await?;
        serde_json::from_value(value).map_err(|e| BackendError::Decode {
            path: path.to_string(),
            reason: e.to_string(),
        })
    }
}

fn clock_in_args(request: &ClockIn) -> Value {
    let mut args = Map::new();
    let (key, id) = identity_arg(&request.identity);
    args.insert(key.into(), id.into());
    args.insert("branch_id".into(), request.branch_id.clone().into());
    args.insert("confidence_score".into(), json!(request.confidence));
    args.insert("photo_storage_id".into(), request.photo.0.clone().into());
    args.insert("liveness_passed".into(), request.liveness_passed.into());
    if let Some(fp) = &request.device_fingerprint {
        args.insert("device_fingerprint".into(), fp.clone().into());
    }
    Value::Object(args)
}

fn clock_out_args(request: &ClockOut) -> Value {
    let mut args = Map::new();
    let (key, id) = identity_arg(&request.identity);
    args.insert(key.into(), id.into());
    args.insert("confidence_score".into(), json!(request.confidence));
    args.insert("photo_storage_id".into(), request.photo.0.clone().into());
    args.insert("liveness_passed".into(), request.liveness_passed.into());
    if let Some(fp) = &request.device_fingerprint {
        args.insert("device_fingerprint".into(), fp.clone().into());
    }
    Value::Object(args)
}

fn manual_args(request: &ManualClockIn) -> Value {
    let mut args = Map::new();
    let (key, id) = identity_arg(&request.identity);
    args.insert(key.into(), id.into());
    args.insert("branch_id".into(), request.branch_id.clone().into());
    if let Some(photo) = &request.photo {
        args.insert("photo_storage_id".into(), photo.0.clone().into());
    }
    if let Some(fp) = &request.device_fingerprint {
        args.insert("device_fingerprint".into(), fp.clone().into());
    }
    Value::Object(args)
}

#[async_trait]
impl AttendanceBackend for ConvexBackend {
    async fn branch_by_code(&self, code: &str) -> Result<Option<BranchInfo>, BackendError> {
        self.typed(CallKind::Query, GET_BRANCH_BY_CODE, json!({ "branch_code": code }))
            .await
    }

    async fn enrollments(&self, branch_id: &str) -> Result<Vec<Enrollment>, BackendError> {
        let raw: Vec<RawEnrollment> = self
            .typed(CallKind::Query, GET_ENROLLMENTS, json!({ "branch_id": branch_id }))
            .await?;
        Ok(raw.into_iter().filter_map(RawEnrollment::into_enrollment).collect())
    }

    async fn attendance_config(&self, branch_id: &str) -> Result<AttendanceConfig, BackendError> {
        self.typed(CallKind::Query, GET_CONFIG, json!({ "branch_id": branch_id }))
            .await
    }

    async fn device_registered(&self, branch_id: &str, fingerprint: &str) -> Result<DeviceCheck, BackendError> {
        self.typed(
            CallKind::Query,
            CHECK_DEVICE,
            json!({ "branch_id": branch_id, "device_fingerprint": fingerprint }),
        )
        .await
    }

    async fn clock_statuses(&self, branch_id: &str) -> Result<Vec<ClockStatus>, BackendError> {
        let raw: Vec<RawClockStatus> = self
            .typed(CallKind::Query, GET_STATUSES, json!({ "branch_id": branch_id }))
            .await?;
        Ok(raw.into_iter().filter_map(RawClockStatus::into_status).collect())
    }

    async fn upload_target(&self) -> Result<String, BackendError> {
        self.typed(CallKind::Mutation, GENERATE_UPLOAD_URL, json!({})).await
    }

    async fn upload_photo(&self, target: &str, jpeg: Vec<u8>) -> Result<PhotoRef, BackendError> {
        let response = self
            .client
            .post(target)
            .header(reqwest::header::CONTENT_TYPE, "image/jpeg")
            .body(jpeg)
            .send()
            .await
            .map_err(|e| BackendError::Upload(e.to_string()))?;
        if !response.status().is_success() {
            return Err(BackendError::Upload(format!("HTTP {}", response.status())));
        }
        let body: UploadResponse = response
            .json()
            .await
            .map_err(|e| BackendError::Upload(e.to_string()))?;
        Ok(PhotoRef(body.storage_id))
    }

    async fn clock_in(&self, request: &ClockIn) -> Result<ClockInReceipt, BackendError> {
        self.typed(CallKind::Mutation, CLOCK_IN, clock_in_args(request)).await
    }

    async fn clock_out(&self, request: &ClockOut) -> Result<ClockOutReceipt, BackendError> {
        self.typed(CallKind::Mutation, CLOCK_OUT, clock_out_args(request)).await
    }

    async fn clock_in_manual(&self, request: &ManualClockIn) -> Result<ManualReceipt, BackendError> {
        self.typed(CallKind::Mutation, CLOCK_IN_MANUAL, manual_args(request)).await
    }
}
