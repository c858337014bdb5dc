//! Stable device fingerprint for kiosk registration.

use sha2::{Digest, Sha256};

const FINGERPRINT_HEX_LEN: usize = 16;

/// Stable characteristics of the kiosk host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceTraits {
    pub machine_id: String,
    pub hostname: String,
    pub os: String,
    pub arch: String,
    pub camera: String,
}

impl DeviceTraits {
    /// Collect traits from the running host. Missing files become empty
    /// strings so the fingerprint is still computed, just with less entropy.
    pub fn collect(camera_device: &str) -> Self {
        let read = |path: &str| std::fs::read_to_string(path).map(|s| s.trim().to_string()).ok();
        let machine_id = read("/etc/machine-id")
            .or_else(|| read("/var/lib/dbus/machine-id"))
            .unwrap_or_default();
        let hostname = read("/etc/hostname")
            .or_else(|| std::env::var("HOSTNAME").ok())
            .unwrap_or_default();

        Self {
            machine_id,
            hostname,
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            camera: camera_device.to_string(),
        }
    }
}

/// SHA-256 over the traits, truncated to 16 hex characters.
pub fn device_fingerprint(traits: &DeviceTraits) -> String {
    let mut hasher = Sha256::new();
    for part in [&traits.machine_id, &traits.hostname, &traits.os, &traits.arch, &traits.camera] {
        hasher.update(part.as_bytes());
        hasher.update(b"|");
    }
    let digest = hasher.finalize();
    hex::encode(&digest[..FINGERPRINT_HEX_LEN / 2])
}
