//! Observable session state: what the kiosk screen shows.

use chrono::{DateTime, FixedOffset};
use kiosk_core::{MatchCandidate, TurnDirection};
use serde::Serialize;
use std::fmt;

/// Philippine time, used for every rendered receipt.
const PHT_OFFSET_SECS: i32 = 8 * 3600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Loading,
    Idle,
    Detecting,
    Liveness,
    Matching,
    Greeting,
    Confirmed,
    LowConfidence,
    Rejected,
    Error,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Loading => "loading",
            Phase::Idle => "idle",
            Phase::Detecting => "detecting",
            Phase::Liveness => "liveness",
            Phase::Matching => "matching",
            Phase::Greeting => "greeting",
            Phase::Confirmed => "confirmed",
            Phase::LowConfidence => "low_confidence",
            Phase::Rejected => "rejected",
            Phase::Error => "error",
        }
    }

    /// Phases that auto-return to idle after a dwell.
    pub fn is_dwell(&self) -> bool {
        matches!(
            self,
            Phase::Greeting | Phase::Confirmed | Phase::LowConfidence | Phase::Rejected
        )
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LivenessStep {
    Blink,
    Turn,
}

/// Result of the clock mutation for the matched identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClockOutcome {
    ClockedIn { at_ms: i64, auto_approved: bool },
    ClockedOut { shift_ms: i64, auto_approved: bool },
}

impl ClockOutcome {
    pub fn auto_approved(&self) -> bool {
        match self {
            ClockOutcome::ClockedIn { auto_approved, .. } | ClockOutcome::ClockedOut { auto_approved, .. } => {
                *auto_approved
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionState {
    pub phase: Phase,
    pub match_result: Option<MatchCandidate>,
    pub clock_result: Option<ClockOutcome>,
    pub liveness_step: Option<LivenessStep>,
    pub turn_direction: Option<TurnDirection>,
    pub error_msg: Option<String>,
    /// Quality hints for the face currently in view.
    pub guidance: Vec<&'static str>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            phase: Phase::Loading,
            match_result: None,
            clock_result: None,
            liveness_step: None,
            turn_direction: None,
            error_msg: None,
            guidance: Vec::new(),
        }
    }
}

impl SessionState {
    fn name(&self) -> &str {
        self.match_result
            .as_ref()
            .map(|m| m.display_name.as_str())
            .unwrap_or("there")
    }

    /// Main line of the overlay.
    pub fn headline(&self) -> String {
        match self.phase {
            Phase::Loading => "Loading face recognition...".to_string(),
            Phase::Idle => self
                .error_msg
                .clone()
                .unwrap_or_else(|| "Stand in front of camera".to_string()),
            Phase::Detecting => "Face detected, hold still".to_string(),
            Phase::Liveness => match (self.liveness_step, self.turn_direction) {
                (Some(LivenessStep::Turn), Some(dir)) => format!("Please turn your head {}", dir.as_str()),
                _ => "Please blink your eyes".to_string(),
            },
            Phase::Matching => "Verifying identity...".to_string(),
            Phase::Greeting | Phase::Confirmed => match self.clock_result {
                Some(ClockOutcome::ClockedOut { .. }) => format!("Goodbye, {}!", self.name()),
                _ => format!("Good morning, {}!", self.name()),
            },
            Phase::LowConfidence => match self.clock_result {
                Some(ClockOutcome::ClockedOut { .. }) => format!("Clocked Out, {}", self.name()),
                _ => format!("Clocked In, {}", self.name()),
            },
            Phase::Rejected => self
                .error_msg
                .clone()
                .unwrap_or_else(|| "Face not recognized".to_string()),
            Phase::Error => self
                .error_msg
                .clone()
                .unwrap_or_else(|| "Face recognition unavailable".to_string()),
        }
    }

    /// Receipt lines under the headline for the outcome phases.
    pub fn details(&self) -> Vec<String> {
        let Some(outcome) = self.clock_result else {
            return Vec::new();
        };
        match self.phase {
            Phase::Greeting | Phase::Confirmed => {
                let receipt = match outcome {
                    ClockOutcome::ClockedIn { at_ms, .. } => format!("Clocked in at {}", format_clock_time(at_ms)),
                    ClockOutcome::ClockedOut { shift_ms, .. } => {
                        format!("Clocked out. Shift: {}", format_duration(shift_ms))
                    }
                };
                let badge = if outcome.auto_approved() { "Auto-approved" } else { "Pending review" };
                vec![receipt, badge.to_string()]
            }
            Phase::LowConfidence => vec!["Pending admin review".to_string()],
            _ => Vec::new(),
        }
    }
}

/// Epoch milliseconds rendered as a 12-hour Philippine wall clock.
pub fn format_clock_time(epoch_ms: i64) -> String {
    match (DateTime::from_timestamp_millis(epoch_ms), FixedOffset::east_opt(PHT_OFFSET_SECS)) {
        (Some(utc), Some(pht)) => utc.with_timezone(&pht).format("%I:%M %p").to_string(),
        _ => "--:--".to_string(),
    }
}

/// Shift length as `<h>h <m>m`; negative durations render as zero.
pub fn format_duration(ms: i64) -> String {
    let minutes = ms.max(0) / 60_000;
    format!("{}h {}m", minutes / 60, minutes % 60)
}
