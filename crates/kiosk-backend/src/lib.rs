//! kiosk-backend — the attendance backend as seen by the kiosk.
//!
//! [`AttendanceBackend`] is the seam the state machine talks to;
//! [`ConvexBackend`] implements it over the Convex HTTP API.

pub mod backend;
pub mod convex;
pub mod guard;
pub mod types;

pub use backend::{AttendanceBackend, BackendError};
pub use convex::ConvexBackend;
pub use guard::{load_staff_session, run_guards, GuardError, GuardedSession};
pub use types::{
    AttendanceConfig, BranchInfo, ClockIn, ClockInReceipt, ClockOut, ClockOutReceipt, ClockStatus, DeviceCheck,
    ManualClockIn, ManualReceipt, PhotoRef,
};
