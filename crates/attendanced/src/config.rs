use kiosk_hw::SourceSettings;
use serde::Serialize;
use std::path::PathBuf;

/// Which attendance flow the daemon runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Variant {
    /// Unattended branch kiosk: guarded activation, cooldowns, review branch.
    Kiosk,
    /// Staff-operated check-in screen.
    Staff,
}

impl Variant {
    pub fn as_str(&self) -> &'static str {
        match self {
            Variant::Kiosk => "kiosk",
            Variant::Staff => "staff",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbusBus {
    Session,
    System,
    Off,
}

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub variant: Variant,
    /// Branch code resolved by the kiosk guards.
    pub branch_code: Option<String>,
    /// Branch id used directly by the staff variant.
    pub branch_id: Option<String>,
    /// Convex deployment URL.
    pub backend_url: Option<String>,
    /// Directory containing the ONNX model files.
    pub model_dir: PathBuf,
    /// Requested video source type (`camera` or `snapshot`).
    pub source: String,
    pub source_settings: SourceSettings,
    /// Overrides the computed device fingerprint.
    pub device_fingerprint: Option<String>,
    pub dbus: DbusBus,
}

impl Config {
    /// Load configuration from `KIOSK_*` environment variables with defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let variant = match non_empty("KIOSK_VARIANT").as_deref() {
            None | Some("kiosk") => Variant::Kiosk,
            Some("staff") => Variant::Staff,
            Some(other) => {
                tracing::warn!(variant = other, "unknown KIOSK_VARIANT, using kiosk");
                Variant::Kiosk
            }
        };

        let model_dir = non_empty("KIOSK_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| default_model_dir(&lookup));

        let dbus = match non_empty("KIOSK_DBUS").as_deref() {
            Some("system") => DbusBus::System,
            Some("off") | Some("0") => DbusBus::Off,
            _ => DbusBus::Session,
        };

        let source_settings = SourceSettings {
            camera_device: non_empty("KIOSK_CAMERA_DEVICE").unwrap_or_else(|| "/dev/video0".to_string()),
            snapshot_url: non_empty("KIOSK_SNAPSHOT_URL"),
            snapshot_fps: non_empty("KIOSK_SNAPSHOT_FPS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(5),
        };

        Self {
            variant,
            branch_code: non_empty("KIOSK_BRANCH_CODE"),
            branch_id: non_empty("KIOSK_BRANCH_ID"),
            backend_url: non_empty("KIOSK_BACKEND_URL"),
            model_dir,
            source: non_empty("KIOSK_SOURCE").unwrap_or_else(|| "camera".to_string()),
            source_settings,
            device_fingerprint: non_empty("KIOSK_DEVICE_FINGERPRINT"),
            dbus,
        }
    }
}

fn default_model_dir(lookup: &impl Fn(&str) -> Option<String>) -> PathBuf {
    lookup("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            let home = lookup("HOME").unwrap_or_else(|| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("barber-kiosk/models")
}
