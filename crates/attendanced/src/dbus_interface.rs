use crate::config::Variant;
use crate::session::SessionState;
use tokio::sync::watch;
use zbus::interface;

pub const BUS_NAME: &str = "org.barbershop.Kiosk1";
pub const OBJECT_PATH: &str = "/org/barbershop/Kiosk1";

/// D-Bus status surface of the attendance daemon.
///
/// Bus name: org.barbershop.Kiosk1
/// Object path: /org/barbershop/Kiosk1
pub struct KioskService {
    variant: Variant,
    branch: Option<String>,
    source: String,
    states: watch::Receiver<SessionState>,
}

impl KioskService {
    pub fn new(variant: Variant, branch: Option<String>, source: String, states: watch::Receiver<SessionState>) -> Self {
        Self {
            variant,
            branch,
            source,
            states,
        }
    }

    fn status_json(&self) -> serde_json::Value {
        let state = self.states.borrow().clone();
        serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "variant": self.variant,
            "branch": self.branch,
            "source": self.source,
            "phase": state.phase,
            "headline": state.headline(),
            "details": state.details(),
            "state": state,
        })
    }
}

#[interface(name = "org.barbershop.Kiosk1")]
impl KioskService {
    /// Current session state as JSON.
    async fn status(&self) -> zbus::fdo::Result<String> {
        Ok(self.status_json().to_string())
    }

    /// Current phase name only.
    async fn phase(&self) -> String {
        self.states.borrow().phase.as_str().to_string()
    }
}
