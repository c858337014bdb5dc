//! The attendance state machine.
//!
//! One phase runs at a time. Each phase is an async step that owns its
//! polling loop and timers; the step future is dropped before the next
//! phase starts, so a phase's timers never outlive it.

use crate::capture::{CaptureError, CaptureGate, DetectedFace};
use crate::config::Variant;
use crate::cooldown::CooldownRegistry;
use crate::session::{ClockOutcome, LivenessStep, Phase, SessionState};
use kiosk_backend::{AttendanceBackend, BackendError, ClockIn, ClockOut, GuardError, GuardedSession};
use kiosk_core::{EuclideanMatcher, LivenessTracker, MatchCandidate, Matcher, TurnDirection, Verdict};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Consecutive good polls required before leaving IDLE.
const STABLE_POLLS: u32 = 3;
const STABLE_SCORE: f32 = 0.7;
const IDLE_POLL: Duration = Duration::from_millis(500);
const DETECT_HOLD: Duration = Duration::from_secs(1);
const LIVENESS_POLL: Duration = Duration::from_millis(150);
const LIVENESS_TIMEOUT: Duration = Duration::from_secs(20);
const MATCH_PRE_DELAY: Duration = Duration::from_millis(800);
const MATCH_ATTEMPTS: usize = 5;
const MISS_PAUSE: Duration = Duration::from_millis(300);
const HIT_PAUSE: Duration = Duration::from_millis(400);

/// Recoverable failures of one attendance cycle. The display text is what
/// the overlay shows.
#[derive(Error, Debug)]
pub enum CycleError {
    #[error("No face detected. Please try again.")]
    NoFace,
    #[error("Face not recognized.")]
    NotRecognized,
    #[error("Face not recognized (confidence {:.0}%). Please try again or ask for manual clock-in.", .0 * 100.0)]
    BelowThreshold(f32),
    #[error("Liveness check timed out. Please try again.")]
    LivenessTimeout,
    #[error("Attendance already recorded. Please wait a moment before trying again.")]
    InCooldown,
    #[error("{0}")]
    Capture(#[from] CaptureError),
    #[error("{0}")]
    Backend(#[from] BackendError),
}

/// Per-variant timings and branches.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Profile {
    pub greeting: Duration,
    pub confirmed: Duration,
    pub low_confidence: Duration,
    pub rejected: Duration,
    /// Liveness timeout and no-face go to REJECTED rather than IDLE.
    pub failures_reject: bool,
    pub cooldown: bool,
    /// Review-band matches show LOW_CONFIDENCE instead of GREETING.
    pub review_branch: bool,
    /// Refreshed config must keep face recognition on with enrollments.
    pub enforce_snapshot: bool,
    pub send_fingerprint: bool,
}

impl Profile {
    pub fn for_variant(variant: Variant) -> Self {
        match variant {
            Variant::Kiosk => Self {
                greeting: Duration::from_secs(3),
                confirmed: Duration::from_secs(5),
                low_confidence: Duration::from_secs(5),
                rejected: Duration::from_secs(5),
                failures_reject: true,
                cooldown: true,
                review_branch: true,
                enforce_snapshot: true,
                send_fingerprint: true,
            },
            Variant::Staff => Self {
                greeting: Duration::from_secs(2),
                confirmed: Duration::from_secs(4),
                low_confidence: Duration::from_secs(5),
                rejected: Duration::from_secs(8),
                failures_reject: false,
                cooldown: false,
                review_branch: false,
                enforce_snapshot: false,
                send_fingerprint: false,
            },
        }
    }
}

pub struct AttendanceMachine {
    profile: Profile,
    gate: CaptureGate,
    backend: Arc<dyn AttendanceBackend>,
    cooldowns: CooldownRegistry,
    matcher: EuclideanMatcher,
    session: GuardedSession,
    device_fingerprint: String,
    liveness: LivenessTracker,
    liveness_passed: bool,
    rng: StdRng,
    needs_refresh: bool,
    state: SessionState,
    publisher: watch::Sender<SessionState>,
}

impl AttendanceMachine {
    pub fn new(
        variant: Variant,
        session: GuardedSession,
        gate: CaptureGate,
        backend: Arc<dyn AttendanceBackend>,
        cooldowns: CooldownRegistry,
        device_fingerprint: String,
        publisher: watch::Sender<SessionState>,
    ) -> Self {
        let state = publisher.borrow().clone();
        Self {
            profile: Profile::for_variant(variant),
            gate,
            backend,
            cooldowns,
            matcher: EuclideanMatcher,
            session,
            device_fingerprint,
            liveness: LivenessTracker::default(),
            liveness_passed: false,
            rng: StdRng::from_entropy(),
            needs_refresh: false,
            state,
            publisher,
        }
    }

    /// Drive the machine until shutdown or a terminal error. Returns the
    /// last published state.
    pub async fn run(mut self, shutdown: CancellationToken) -> SessionState {
        self.transition(Phase::Idle);
        while self.state.phase != Phase::Error {
            let next = tokio::select! {
                _ = shutdown.cancelled() => break,
                next = self.step() => next,
            };
            self.transition(next);
        }
        tracing::info!(phase = %self.state.phase, "state machine stopped");
        self.state
    }

    fn publish(&self) {
        self.publisher.send_replace(self.state.clone());
    }

    fn transition(&mut self, to: Phase) {
        let from = self.state.phase;
        match to {
            Phase::Idle => {
                self.state.match_result = None;
                self.state.clock_result = None;
                self.state.liveness_step = None;
                self.state.turn_direction = None;
                if from.is_dwell() {
                    self.state.error_msg = None;
                }
                self.needs_refresh = from != Phase::Loading;
            }
            Phase::Error => tracing::error!(message = self.state.error_msg.as_deref().unwrap_or("-"), "session ended"),
            _ => {}
        }
        if from == Phase::Idle {
            self.state.guidance.clear();
        }
        self.state.phase = to;
        tracing::info!(from = %from, to = %to, "state transition");
        self.publish();
    }

    async fn step(&mut self) -> Phase {
        match self.state.phase {
            Phase::Loading => Phase::Idle,
            Phase::Idle => self.idle().await,
            Phase::Detecting => self.detecting().await,
            Phase::Liveness => self.liveness().await,
            Phase::Matching => self.matching().await,
            Phase::Greeting => {
                tokio::time::sleep(self.profile.greeting).await;
                Phase::Confirmed
            }
            Phase::Confirmed => {
                tokio::time::sleep(self.profile.confirmed).await;
                Phase::Idle
            }
            Phase::LowConfidence => {
                tokio::time::sleep(self.profile.low_confidence).await;
                Phase::Idle
            }
            Phase::Rejected => {
                tokio::time::sleep(self.profile.rejected).await;
                Phase::Idle
            }
            Phase::Error => std::future::pending().await,
        }
    }

    async fn idle(&mut self) -> Phase {
        if std::mem::take(&mut self.needs_refresh) {
            if let Err(e) = self.refresh_snapshot().await {
                self.state.error_msg = Some(e.to_string());
                return Phase::Error;
            }
        }

        let mut stable = 0;
        loop {
            if self.gate.source_lost() {
                self.state.error_msg = Some(CaptureError::SourceLost.to_string());
                return Phase::Error;
            }
            match self.gate.detect_face().await {
                Some(face) if face.score() > STABLE_SCORE => {
                    self.show_guidance(face.quality.reasons.clone());
                    if self.in_cooldown(&face) {
                        stable = 0;
                    } else {
                        stable += 1;
                        tracing::debug!(stable, score = face.score(), "stable face poll");
                        if stable >= STABLE_POLLS {
                            self.state.error_msg = None;
                            return Phase::Detecting;
                        }
                    }
                }
                other => {
                    stable = 0;
                    self.show_guidance(other.map(|f| f.quality.reasons).unwrap_or_default());
                }
            }
            tokio::time::sleep(IDLE_POLL).await;
        }
    }

    fn show_guidance(&mut self, reasons: Vec<&'static str>) {
        if self.state.guidance != reasons {
            self.state.guidance = reasons;
            self.publish();
        }
    }

    /// Cheap best-guess identity check so a cooling-down person never
    /// starts a cycle. Any guess counts, whatever its confidence.
    fn in_cooldown(&self, face: &DetectedFace) -> bool {
        if !self.profile.cooldown {
            return false;
        }
        match self
            .matcher
            .find_best_match(&face.capture.descriptor, &self.session.enrollments)
        {
            Some(guess) if self.cooldowns.has(&guess.identity) => {
                tracing::debug!(identity = %guess.identity, "identity in cooldown");
                true
            }
            _ => false,
        }
    }

    /// Re-fetch config and enrollments. Fetch failures keep the previous
    /// snapshot.
    async fn refresh_snapshot(&mut self) -> Result<(), GuardError> {
        let branch_id = self.session.branch_id.clone();
        match self.backend.attendance_config(&branch_id).await {
            Ok(config) => self.session.config = config,
            Err(e) => tracing::warn!(error = %e, "config refresh failed, keeping previous"),
        }
        match self.backend.enrollments(&branch_id).await {
            Ok(enrollments) => self.session.enrollments = enrollments,
            Err(e) => tracing::warn!(error = %e, "enrollment refresh failed, keeping previous"),
        }

        if self.profile.enforce_snapshot {
            if !self.session.config.fr_enabled {
                return Err(GuardError::FaceRecognitionDisabled);
            }
            if self.session.enrollments.is_empty() {
                return Err(GuardError::NoEnrollments);
            }
        }
        Ok(())
    }

    async fn detecting(&mut self) -> Phase {
        tokio::time::sleep(DETECT_HOLD).await;
        self.liveness_passed = false;
        if !self.session.config.liveness_required {
            return Phase::Matching;
        }
        self.liveness.reset();
        let direction = if self.rng.gen_bool(0.5) {
            TurnDirection::Left
        } else {
            TurnDirection::Right
        };
        self.state.liveness_step = Some(LivenessStep::Blink);
        self.state.turn_direction = Some(direction);
        Phase::Liveness
    }

    async fn liveness(&mut self) -> Phase {
        let completed = tokio::select! {
            _ = tokio::time::sleep(LIVENESS_TIMEOUT) => false,
            _ = self.liveness_steps() => true,
        };
        if completed {
            self.liveness_passed = true;
            return Phase::Matching;
        }
        self.fail_cycle(CycleError::LivenessTimeout)
    }

    /// Blink, then turn in the chosen direction.
    async fn liveness_steps(&mut self) {
        loop {
            if let Some(landmarks) = self.gate.detect_landmarks().await {
                match (self.state.liveness_step, self.state.turn_direction) {
                    (Some(LivenessStep::Turn), Some(direction)) => {
                        if self.liveness.check_head_turn(&landmarks, direction) {
                            tracing::debug!(direction = direction.as_str(), "head turn detected");
                            return;
                        }
                    }
                    _ => {
                        if self.liveness.check_blink(&landmarks) {
                            tracing::debug!("blink detected");
                            self.state.liveness_step = Some(LivenessStep::Turn);
                            self.publish();
                        }
                    }
                }
            }
            tokio::time::sleep(LIVENESS_POLL).await;
        }
    }

    async fn matching(&mut self) -> Phase {
        match self.match_and_clock().await {
            Ok(Verdict::Review) if self.profile.review_branch => Phase::LowConfidence,
            Ok(_) => Phase::Greeting,
            Err(e) => self.fail_cycle(e),
        }
    }

    /// Route a recoverable failure: REJECTED, or IDLE with the message for
    /// variants that do not reject on a missing face or liveness.
    fn fail_cycle(&mut self, error: CycleError) -> Phase {
        tracing::warn!(error = %error, "attendance cycle failed");
        self.state.match_result = None;
        self.state.error_msg = Some(error.to_string());
        match error {
            CycleError::NoFace | CycleError::LivenessTimeout if !self.profile.failures_reject => Phase::Idle,
            _ => Phase::Rejected,
        }
    }

    async fn best_candidate(&self) -> Result<MatchCandidate, CycleError> {
        tokio::time::sleep(MATCH_PRE_DELAY).await;

        let mut best: Option<MatchCandidate> = None;
        let mut saw_face = false;
        for attempt in 1..=MATCH_ATTEMPTS {
            let face = self.gate.detect_face().await;
            let pause = if face.is_some() { HIT_PAUSE } else { MISS_PAUSE };
            if let Some(face) = face {
                saw_face = true;
                let candidate = self
                    .matcher
                    .find_best_match(&face.capture.descriptor, &self.session.enrollments);
                if let Some(candidate) = candidate {
                    tracing::debug!(attempt, identity = %candidate.identity, confidence = candidate.confidence, "match attempt");
                    if best.as_ref().map_or(true, |b| candidate.confidence > b.confidence) {
                        best = Some(candidate);
                    }
                }
            }
            if attempt < MATCH_ATTEMPTS {
                tokio::time::sleep(pause).await;
            }
        }

        match best {
            Some(candidate) => Ok(candidate),
            None if saw_face => Err(CycleError::NotRecognized),
            None => Err(CycleError::NoFace),
        }
    }

    /// Match, then record the clock action. The photo is uploaded before
    /// any mutation is issued.
    async fn match_and_clock(&mut self) -> Result<Verdict, CycleError> {
        let candidate = self.best_candidate().await?;
        if self.profile.cooldown && self.cooldowns.has(&candidate.identity) {
            tracing::info!(identity = %candidate.identity, "match is still in cooldown, nothing recorded");
            return Err(CycleError::InCooldown);
        }
        let verdict = self.session.config.thresholds().verdict(candidate.confidence);
        if verdict == Verdict::Reject {
            return Err(CycleError::BelowThreshold(candidate.confidence));
        }
        tracing::info!(identity = %candidate.identity, confidence = candidate.confidence, ?verdict, "identity matched");
        self.state.match_result = Some(candidate.clone());
        self.publish();

        let jpeg = self.gate.capture_photo()?;
        let photo = self.backend.store_photo(jpeg).await?;

        let branch_id = &self.session.branch_id;
        let fingerprint = self
            .profile
            .send_fingerprint
            .then(|| self.device_fingerprint.clone());
        let outcome = if self.backend.is_clocked_in(branch_id, &candidate.identity).await? {
            let receipt = self
                .backend
                .clock_out(&ClockOut {
                    identity: candidate.identity.clone(),
                    confidence: candidate.confidence,
                    photo,
                    liveness_passed: self.liveness_passed,
                    device_fingerprint: fingerprint,
                })
                .await?;
            ClockOutcome::ClockedOut {
                shift_ms: receipt.shift_duration,
                auto_approved: receipt.auto_approved,
            }
        } else {
            let receipt = self
                .backend
                .clock_in(&ClockIn {
                    identity: candidate.identity.clone(),
                    branch_id: branch_id.clone(),
                    confidence: candidate.confidence,
                    photo,
                    liveness_passed: self.liveness_passed,
                    device_fingerprint: fingerprint,
                })
                .await?;
            ClockOutcome::ClockedIn {
                at_ms: receipt.clock_in_time,
                auto_approved: receipt.auto_approved,
            }
        };
        tracing::info!(identity = %candidate.identity, ?outcome, "clock action recorded");

        if self.profile.cooldown {
            self.cooldowns.mark(candidate.identity);
        }
        self.state.clock_result = Some(outcome);
        Ok(verdict)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cooldown::COOLDOWN_WINDOW;
    use crate::engine::{Analysis, EngineError, FaceEngine};
    use async_trait::async_trait;
    use image::RgbImage;
    use kiosk_backend::types::*;
    use kiosk_core::types::{DESCRIPTOR_LEN, LANDMARK_COUNT};
    use kiosk_core::{Descriptor, Enrollment, FaceBox, FaceDetection, IdentityRef, Landmarks68, Point};
    use kiosk_hw::{frame_channel, Frame, FrameSink};
    use std::collections::{HashSet, VecDeque};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::time::Instant;

    /// Landmarks with the given eye aspect ratio and head turn ratio.
    fn landmarks(ear: f32, turn: f32) -> Landmarks68 {
        let mut pts = vec![Point::new(0.0, 0.0); LANDMARK_COUNT];
        for (base, cx) in [(36usize, -2.0f32), (42, 2.0)] {
            pts[base] = Point::new(cx - 0.5, 0.0);
            pts[base + 3] = Point::new(cx + 0.5, 0.0);
            pts[base + 1] = Point::new(cx - 0.2, -ear / 2.0);
            pts[base + 5] = Point::new(cx - 0.2, ear / 2.0);
            pts[base + 2] = Point::new(cx + 0.2, -ear / 2.0);
            pts[base + 4] = Point::new(cx + 0.2, ear / 2.0);
        }
        pts[30] = Point::new(0.0, 5.0);
        pts[0] = Point::new(-(1.0 - turn), 5.0);
        pts[16] = Point::new(1.0 + turn, 5.0);
        Landmarks68::new(pts).unwrap()
    }

    /// Descriptor at `distance` from the all-zero enrollment.
    fn descriptor(distance: f32) -> Descriptor {
        let mut v = vec![0.0; DESCRIPTOR_LEN];
        v[0] = distance;
        Descriptor::new(v).unwrap()
    }

    /// Distance that maps to `confidence`.
    fn distance_for(confidence: f32) -> f32 {
        1.2 * (1.0 - confidence)
    }

    /// One centred face whenever `visible`. Landmark requests follow the
    /// published liveness step: a blink cycle, then a turn in the chosen
    /// direction (unless `cooperative` is off). Descriptor requests drain
    /// `queued` first, then fall back to `descriptor`.
    struct ScriptedEngine {
        visible: AtomicBool,
        cooperative: bool,
        descriptor: Mutex<Descriptor>,
        queued: Mutex<VecDeque<Descriptor>>,
        landmark_calls: AtomicUsize,
        state: watch::Receiver<SessionState>,
    }

    #[async_trait]
    impl FaceEngine for ScriptedEngine {
        async fn analyze(&self, _frame: Arc<Frame>, describe: bool) -> Result<Analysis, EngineError> {
            if !self.visible.load(Ordering::SeqCst) {
                return Ok(Analysis::default());
            }
            let lm = if describe || !self.cooperative {
                landmarks(0.3, 0.0)
            } else {
                let state = self.state.borrow().clone();
                match (state.liveness_step, state.turn_direction) {
                    (Some(LivenessStep::Turn), Some(TurnDirection::Left)) => landmarks(0.3, -0.3),
                    (Some(LivenessStep::Turn), Some(TurnDirection::Right)) => landmarks(0.3, 0.3),
                    _ => {
                        let n = self.landmark_calls.fetch_add(1, Ordering::SeqCst);
                        landmarks(if n % 4 == 3 { 0.18 } else { 0.31 }, 0.0)
                    }
                }
            };
            let face = FaceDetection {
                bbox: FaceBox { x: 220.0, y: 140.0, width: 200.0, height: 200.0 },
                score: 0.95,
                landmarks: lm,
            };
            Ok(Analysis {
                faces: vec![face],
                descriptor: describe.then(|| {
                    let next = self.queued.lock().unwrap().pop_front();
                    next.unwrap_or_else(|| self.descriptor.lock().unwrap().clone())
                }),
            })
        }
    }

    #[derive(Default)]
    struct FakeBackend {
        config: Mutex<AttendanceConfig>,
        fail_upload: bool,
        fail_clock: bool,
        clocked_in: Mutex<HashSet<IdentityRef>>,
        uploads: AtomicUsize,
        clock_ins: Mutex<Vec<(ClockIn, Instant)>>,
        clock_outs: Mutex<Vec<ClockOut>>,
    }

    #[async_trait]
    impl AttendanceBackend for FakeBackend {
        async fn branch_by_code(&self, _code: &str) -> Result<Option<BranchInfo>, BackendError> {
            Ok(None)
        }
        async fn enrollments(&self, _branch_id: &str) -> Result<Vec<Enrollment>, BackendError> {
            Ok(vec![enrollment()])
        }
        async fn attendance_config(&self, _branch_id: &str) -> Result<AttendanceConfig, BackendError> {
            Ok(self.config.lock().unwrap().clone())
        }
        async fn device_registered(&self, _b: &str, _fp: &str) -> Result<DeviceCheck, BackendError> {
            Ok(DeviceCheck { registered: true, device_name: None })
        }
        async fn clock_statuses(&self, _branch_id: &str) -> Result<Vec<ClockStatus>, BackendError> {
            Ok(self
                .clocked_in
                .lock()
                .unwrap()
                .iter()
                .map(|identity| ClockStatus {
                    identity: identity.clone(),
                    display_name: String::new(),
                    is_clocked_in: true,
                })
                .collect())
        }
        async fn upload_target(&self) -> Result<String, BackendError> {
            if self.fail_upload {
                return Err(BackendError::Upload("storage unavailable".into()));
            }
            Ok("https://upload.test/1".into())
        }
        async fn upload_photo(&self, _target: &str, jpeg: Vec<u8>) -> Result<PhotoRef, BackendError> {
            assert!(!jpeg.is_empty());
            self.uploads.fetch_add(1, Ordering::SeqCst);
            Ok(PhotoRef("storage-1".into()))
        }
        async fn clock_in(&self, request: &ClockIn) -> Result<ClockInReceipt, BackendError> {
            if self.fail_clock {
                return Err(BackendError::Function {
                    path: "services/faceAttendance:clockInWithFR".into(),
                    message: "Barber is not assigned to this branch".into(),
                });
            }
            let policy = self.config.lock().unwrap().thresholds();
            self.clocked_in.lock().unwrap().insert(request.identity.clone());
            self.clock_ins.lock().unwrap().push((request.clone(), Instant::now()));
            Ok(ClockInReceipt {
                clock_in_time: 1_705_282_200_000,
                auto_approved: request.confidence >= policy.auto_approve,
            })
        }
        async fn clock_out(&self, request: &ClockOut) -> Result<ClockOutReceipt, BackendError> {
            self.clocked_in.lock().unwrap().remove(&request.identity);
            self.clock_outs.lock().unwrap().push(request.clone());
            Ok(ClockOutReceipt { shift_duration: 3_600_000, auto_approved: true })
        }
        async fn clock_in_manual(&self, _r: &ManualClockIn) -> Result<ManualReceipt, BackendError> {
            unreachable!()
        }
    }

    fn enrollment() -> Enrollment {
        Enrollment {
            identity: IdentityRef::Barber("u1".into()),
            display_name: "Ursula".into(),
            avatar_url: None,
            embeddings: vec![descriptor(0.0)],
        }
    }

    fn config(liveness_required: bool) -> AttendanceConfig {
        AttendanceConfig {
            fr_enabled: true,
            liveness_required,
            admin_review_threshold: Some(0.50),
            auto_approve_threshold: Some(0.65),
        }
    }

    struct Harness {
        engine: Arc<ScriptedEngine>,
        backend: Arc<FakeBackend>,
        cooldowns: CooldownRegistry,
        states: watch::Receiver<SessionState>,
        token: CancellationToken,
        task: tokio::task::JoinHandle<SessionState>,
        visited: Vec<Phase>,
        sink: Option<FrameSink>,
    }

    impl Harness {
        fn start(variant: Variant, backend: FakeBackend, confidence: f32, cooperative: bool) -> Self {
            let (publisher, states) = watch::channel(SessionState::default());
            let (sink, feed) = frame_channel();
            sink.send_replace(Some(Arc::new(Frame::new(RgbImage::new(640, 480), 1))));

            let engine = Arc::new(ScriptedEngine {
                visible: AtomicBool::new(true),
                cooperative,
                descriptor: Mutex::new(descriptor(distance_for(confidence))),
                queued: Mutex::new(VecDeque::new()),
                landmark_calls: AtomicUsize::new(0),
                state: states.clone(),
            });
            let backend = Arc::new(backend);
            let session = GuardedSession {
                branch_id: "br1".into(),
                branch_name: Some("Main".into()),
                config: backend.config.lock().unwrap().clone(),
                enrollments: vec![enrollment()],
            };
            let cooldowns = CooldownRegistry::new();
            let machine = AttendanceMachine::new(
                variant,
                session,
                CaptureGate::new(engine.clone(), feed),
                backend.clone(),
                cooldowns.clone(),
                "fp-test".into(),
                publisher,
            );
            let token = CancellationToken::new();
            let task = tokio::spawn(machine.run(token.clone()));

            Self {
                engine,
                backend,
                cooldowns,
                states,
                token,
                task,
                visited: Vec::new(),
                sink: Some(sink),
            }
        }

        /// Wait (in paused time) until `phase` is published.
        async fn wait_for(&mut self, phase: Phase) -> SessionState {
            let deadline = Duration::from_secs(120);
            tokio::time::timeout(deadline, async {
                loop {
                    let state = self.states.borrow_and_update().clone();
                    if self.visited.last() != Some(&state.phase) {
                        self.visited.push(state.phase);
                    }
                    if state.phase == phase {
                        return state;
                    }
                    self.states.changed().await.unwrap();
                }
            })
            .await
            .unwrap_or_else(|_| panic!("never reached {phase}, visited {:?}", self.visited))
        }

        /// Confidence of every later descriptor request.
        fn set_confidence(&self, confidence: f32) {
            *self.engine.descriptor.lock().unwrap() = descriptor(distance_for(confidence));
        }

        async fn stop(self) -> SessionState {
            self.token.cancel();
            self.task.await.unwrap()
        }
    }

    fn kiosk_backend(liveness_required: bool) -> FakeBackend {
        FakeBackend {
            config: Mutex::new(config(liveness_required)),
            ..FakeBackend::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_liveness_skipped_when_not_required() {
        let mut h = Harness::start(Variant::Kiosk, kiosk_backend(false), 0.9, true);
        h.wait_for(Phase::Confirmed).await;
        h.visited.retain(|p| *p != Phase::Loading);
        assert_eq!(
            h.visited,
            vec![Phase::Idle, Phase::Detecting, Phase::Matching, Phase::Greeting, Phase::Confirmed]
        );
        let (clock_in, _) = h.backend.clock_ins.lock().unwrap()[0].clone();
        assert!(!clock_in.liveness_passed);
        assert_eq!(clock_in.device_fingerprint.as_deref(), Some("fp-test"));
        h.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_to_end_clock_in() {
        let mut h = Harness::start(Variant::Kiosk, kiosk_backend(true), 1.0, true);
        h.wait_for(Phase::Liveness).await;

        let greeting = h.wait_for(Phase::Greeting).await;
        let matched = greeting.match_result.clone().unwrap();
        assert_eq!(matched.display_name, "Ursula");
        assert!((matched.confidence - 1.0).abs() < 1e-6);
        assert!(matches!(
            greeting.clock_result,
            Some(ClockOutcome::ClockedIn { auto_approved: true, .. })
        ));
        assert_eq!(greeting.headline(), "Good morning, Ursula!");
        assert!(h.cooldowns.has(&IdentityRef::Barber("u1".into())));

        {
            let clock_ins = h.backend.clock_ins.lock().unwrap();
            assert_eq!(clock_ins.len(), 1);
            let (request, _) = &clock_ins[0];
            assert_eq!(request.identity, IdentityRef::Barber("u1".into()));
            assert_eq!(request.branch_id, "br1");
            assert!((request.confidence - 1.0).abs() < 1e-6);
            assert!(request.liveness_passed);
            assert_eq!(request.photo, PhotoRef("storage-1".into()));
        }
        assert_eq!(h.backend.uploads.load(Ordering::SeqCst), 1);

        h.wait_for(Phase::Confirmed).await;
        let idle = h.wait_for(Phase::Idle).await;
        assert!(idle.match_result.is_none());
        assert!(idle.clock_result.is_none());
        h.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_below_admin_threshold_rejected_without_recording() {
        let mut h = Harness::start(Variant::Kiosk, kiosk_backend(false), 0.40, true);
        let rejected = h.wait_for(Phase::Rejected).await;
        assert!(rejected.error_msg.unwrap().contains("Face not recognized"));
        assert!(rejected.match_result.is_none());
        assert_eq!(h.backend.uploads.load(Ordering::SeqCst), 0);
        assert!(h.backend.clock_ins.lock().unwrap().is_empty());

        let idle = h.wait_for(Phase::Idle).await;
        assert!(idle.error_msg.is_none());
        h.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_review_band_goes_to_low_confidence() {
        let mut h = Harness::start(Variant::Kiosk, kiosk_backend(false), 0.55, true);
        let state = h.wait_for(Phase::LowConfidence).await;
        assert!(!h.visited.contains(&Phase::Greeting));
        assert_eq!(state.headline(), "Clocked In, Ursula");
        assert_eq!(h.backend.clock_ins.lock().unwrap().len(), 1);
        assert!(h.cooldowns.has(&IdentityRef::Barber("u1".into())));
        h.wait_for(Phase::Idle).await;
        h.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_approve_band_greets_then_confirms() {
        let mut h = Harness::start(Variant::Kiosk, kiosk_backend(false), 0.80, true);
        h.wait_for(Phase::Greeting).await;
        let confirmed = h.wait_for(Phase::Confirmed).await;
        assert_eq!(confirmed.details()[1], "Auto-approved");
        assert!(!h.visited.contains(&Phase::LowConfidence));
        h.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_upload_failure_blocks_mutation() {
        let backend = FakeBackend {
            fail_upload: true,
            ..kiosk_backend(false)
        };
        let mut h = Harness::start(Variant::Kiosk, backend, 0.9, true);
        let rejected = h.wait_for(Phase::Rejected).await;
        assert_eq!(rejected.error_msg.as_deref(), Some("photo upload failed: storage unavailable"));
        assert!(h.backend.clock_ins.lock().unwrap().is_empty());
        assert!(h.backend.clock_outs.lock().unwrap().is_empty());
        assert!(!h.cooldowns.has(&IdentityRef::Barber("u1".into())));
        h.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_suppresses_then_releases() {
        let mut h = Harness::start(Variant::Kiosk, kiosk_backend(false), 0.9, true);
        h.wait_for(Phase::Confirmed).await;
        let clocked_at = h.backend.clock_ins.lock().unwrap()[0].1;

        h.wait_for(Phase::Idle).await;
        h.visited.clear();
        h.wait_for(Phase::Detecting).await;
        assert!(clocked_at.elapsed() >= COOLDOWN_WINDOW);

        // Second cycle for the same person clocks out.
        h.wait_for(Phase::Confirmed).await;
        assert_eq!(h.backend.clock_outs.lock().unwrap().len(), 1);
        h.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_ignores_guess_confidence() {
        let mut h = Harness::start(Variant::Kiosk, kiosk_backend(false), 0.9, true);
        h.wait_for(Phase::Confirmed).await;
        let clocked_at = h.backend.clock_ins.lock().unwrap()[0].1;

        // Same person, poorer frames while cooling down.
        h.set_confidence(0.45);
        h.wait_for(Phase::Idle).await;
        h.wait_for(Phase::Detecting).await;
        assert!(clocked_at.elapsed() >= COOLDOWN_WINDOW);

        h.set_confidence(0.9);
        h.wait_for(Phase::Confirmed).await;
        assert_eq!(h.backend.clock_outs.lock().unwrap().len(), 1);
        h.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_match_in_cooldown_records_nothing() {
        let mut h = Harness::start(Variant::Kiosk, kiosk_backend(false), 0.9, true);
        h.wait_for(Phase::Matching).await;
        h.cooldowns.mark(IdentityRef::Barber("u1".into()));

        let rejected = h.wait_for(Phase::Rejected).await;
        assert_eq!(rejected.error_msg, Some(CycleError::InCooldown.to_string()));
        assert_eq!(h.backend.uploads.load(Ordering::SeqCst), 0);
        assert!(h.backend.clock_ins.lock().unwrap().is_empty());
        h.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_clock_failure_surfaces_backend_message() {
        let backend = FakeBackend {
            fail_clock: true,
            ..kiosk_backend(false)
        };
        let mut h = Harness::start(Variant::Kiosk, backend, 0.9, true);
        let rejected = h.wait_for(Phase::Rejected).await;
        assert_eq!(rejected.error_msg.as_deref(), Some("Barber is not assigned to this branch"));
        assert_eq!(h.backend.uploads.load(Ordering::SeqCst), 1);
        assert!(h.backend.clock_ins.lock().unwrap().is_empty());
        assert!(!h.cooldowns.has(&IdentityRef::Barber("u1".into())));

        let idle = h.wait_for(Phase::Idle).await;
        assert!(idle.error_msg.is_none());
        h.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_matching_keeps_best_attempt() {
        let mut h = Harness::start(Variant::Kiosk, kiosk_backend(false), 0.7, true);
        h.wait_for(Phase::Matching).await;
        h.engine
            .queued
            .lock()
            .unwrap()
            .extend([0.55, 0.95, 0.6, 0.45, 0.52].map(|c| descriptor(distance_for(c))));

        let greeting = h.wait_for(Phase::Greeting).await;
        let matched = greeting.match_result.unwrap();
        assert!((matched.confidence - 0.95).abs() < 1e-4);
        let (clock_in, _) = h.backend.clock_ins.lock().unwrap()[0].clone();
        assert!((clock_in.confidence - 0.95).abs() < 1e-4);
        assert!(h.engine.queued.lock().unwrap().is_empty());
        h.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_staff_face_lost_during_matching_returns_to_idle() {
        let mut h = Harness::start(Variant::Staff, kiosk_backend(false), 0.9, true);
        h.wait_for(Phase::Matching).await;
        h.engine.visible.store(false, Ordering::SeqCst);
        h.visited.clear();

        let idle = h.wait_for(Phase::Idle).await;
        assert!(!h.visited.contains(&Phase::Rejected));
        assert_eq!(idle.error_msg.as_deref(), Some("No face detected. Please try again."));
        assert!(h.backend.clock_ins.lock().unwrap().is_empty());
        h.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_video_source_ends_session() {
        let mut h = Harness::start(Variant::Kiosk, kiosk_backend(false), 0.9, true);
        h.wait_for(Phase::Idle).await;
        if let Some(sink) = h.sink.take() {
            sink.send_replace(None);
        }

        let last = h.task.await.unwrap();
        assert_eq!(last.phase, Phase::Error);
        assert_eq!(last.error_msg, Some(CaptureError::SourceLost.to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_kiosk_liveness_timeout_rejects() {
        let mut h = Harness::start(Variant::Kiosk, kiosk_backend(true), 0.9, false);
        let entered = {
            h.wait_for(Phase::Liveness).await;
            Instant::now()
        };
        let rejected = h.wait_for(Phase::Rejected).await;
        assert!(entered.elapsed() >= LIVENESS_TIMEOUT);
        assert_eq!(rejected.error_msg.as_deref(), Some("Liveness check timed out. Please try again."));
        assert_eq!(h.backend.uploads.load(Ordering::SeqCst), 0);
        h.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_staff_liveness_timeout_returns_to_idle_with_message() {
        let mut h = Harness::start(Variant::Staff, kiosk_backend(true), 0.9, false);
        h.wait_for(Phase::Liveness).await;
        h.visited.clear();
        let idle = h.wait_for(Phase::Idle).await;
        assert!(!h.visited.contains(&Phase::Rejected));
        assert_eq!(idle.error_msg.as_deref(), Some("Liveness check timed out. Please try again."));
        h.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_staff_has_no_cooldown_or_review_branch() {
        let mut h = Harness::start(Variant::Staff, kiosk_backend(false), 0.55, true);
        let greeting = h.wait_for(Phase::Greeting).await;
        assert!(matches!(
            greeting.clock_result,
            Some(ClockOutcome::ClockedIn { auto_approved: false, .. })
        ));
        assert!(!h.cooldowns.has(&IdentityRef::Barber("u1".into())));
        let (clock_in, _) = h.backend.clock_ins.lock().unwrap()[0].clone();
        assert!(clock_in.device_fingerprint.is_none());
        h.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_face_lost_during_matching() {
        let mut h = Harness::start(Variant::Kiosk, kiosk_backend(false), 0.9, true);
        h.wait_for(Phase::Matching).await;
        h.engine.visible.store(false, Ordering::SeqCst);
        let rejected = h.wait_for(Phase::Rejected).await;
        assert_eq!(rejected.error_msg.as_deref(), Some("No face detected. Please try again."));
        h.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_with_recognition_disabled_ends_session() {
        let mut h = Harness::start(Variant::Kiosk, kiosk_backend(false), 0.9, true);
        h.wait_for(Phase::Confirmed).await;
        h.backend.config.lock().unwrap().fr_enabled = false;

        let last = h.task.await.unwrap();
        assert_eq!(last.phase, Phase::Error);
        assert_eq!(
            last.error_msg.as_deref(),
            Some("Face recognition is not enabled for this branch. Contact your administrator.")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_machine() {
        let mut h = Harness::start(Variant::Kiosk, kiosk_backend(true), 0.9, false);
        h.wait_for(Phase::Liveness).await;
        let last = h.stop().await;
        assert_eq!(last.phase, Phase::Liveness);
    }

    #[test]
    fn test_profiles() {
        let kiosk = Profile::for_variant(Variant::Kiosk);
        let staff = Profile::for_variant(Variant::Staff);
        assert_eq!(kiosk.greeting, Duration::from_secs(3));
        assert_eq!(staff.greeting, Duration::from_secs(2));
        assert_eq!(staff.rejected, Duration::from_secs(8));
        assert!(kiosk.cooldown && !staff.cooldown);
    }

    #[test]
    fn test_below_threshold_message() {
        let msg = CycleError::BelowThreshold(0.4).to_string();
        assert!(msg.starts_with("Face not recognized (confidence 40%)"));
    }
}
