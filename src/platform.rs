//! Platform mode manager.
//!
//! Every registered subsystem runs on its own thread and parks in
//! [`Platform::wait_mode_change`] once per period. A mode change flags
//! every live subsystem `ModeChangePending` and wakes it; the transition
//! completes once each one has reported ready again, or fails subsystems
//! that do not answer within the mode-change timeout. Heartbeat bits are
//! cleared by the subsystems and checked once per window.

use crate::error::{Error, Result};
use crate::fault::{FaultKind, FaultManager, FaultRecord};
use crate::frame::Frame;
use crate::subsystems::{
    CommandDescriptor, SatelliteMode, Subsystem, SubsystemCore, SubsystemId, SubsystemState, SubsystemStatus,
    MAX_SUBSYSTEMS,
};
use crate::utils;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError, RwLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlatformTiming {
    /// How long a subsystem task parks between periodic rounds.
    pub period: Duration,
    pub mode_change_timeout: Duration,
    pub heartbeat_window: Duration,
    /// Treat a missed heartbeat as fatal for the subsystem.
    pub escalate_heartbeat: bool,
}

impl Default for PlatformTiming {
    fn default() -> Self {
        Self {
            period: Duration::from_millis(100),
            mode_change_timeout: Duration::from_secs(2),
            heartbeat_window: Duration::from_secs(1),
            escalate_heartbeat: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TransitionState {
    Idle,
    Pending(SatelliteMode),
    Completed(SatelliteMode),
    /// Finished, but some subsystems were failed for not answering.
    TimedOut(SatelliteMode),
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct HeartbeatReport {
    pub missed: heapless::Vec<(SubsystemId, u32), MAX_SUBSYSTEMS>,
}

impl HeartbeatReport {
    pub fn is_clean(&self) -> bool {
        self.missed.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubsystemReport {
    pub id: SubsystemId,
    pub name: &'static str,
    pub state: SubsystemState,
}

#[derive(Debug)]
struct Transition {
    current: SatelliteMode,
    target: Option<(SatelliteMode, Instant)>,
}

pub struct Platform {
    timing: PlatformTiming,
    subsystems: RwLock<Vec<Arc<dyn Subsystem>>>,
    running: AtomicBool,
    transition: Mutex<Transition>,
    ready: Condvar,
    tasks: Mutex<Vec<(SubsystemId, JoinHandle<()>)>>,
    faults: Mutex<FaultManager>,
}

impl Platform {
    pub fn new(timing: PlatformTiming) -> Arc<Self> {
        Arc::new(Self {
            timing,
            subsystems: RwLock::new(Vec::new()),
            running: AtomicBool::new(false),
            transition: Mutex::new(Transition {
                current: SatelliteMode::Booting,
                target: None,
            }),
            ready: Condvar::new(),
            tasks: Mutex::new(Vec::new()),
            faults: Mutex::new(FaultManager::new()),
        })
    }

    pub fn timing(&self) -> &PlatformTiming {
        &self.timing
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn current_mode(&self) -> SatelliteMode {
        utils::lock(&self.transition).current
    }

    /// Adds a subsystem before [`Platform::start`]. `Exist` if its id is
    /// already registered, `Illegal` once the platform runs.
    pub fn register(self: &Arc<Self>, ss: Arc<dyn Subsystem>) -> Result<()> {
        if self.is_running() {
            return Err(Error::Illegal);
        }
        let mut subsystems = utils::write(&self.subsystems);
        let id = ss.core().id();
        if subsystems.iter().any(|other| other.core().id() == id) {
            return Err(Error::Exist);
        }
        if subsystems.len() >= MAX_SUBSYSTEMS {
            return Err(Error::NoSpace);
        }
        ss.core().attach(Arc::downgrade(self));
        subsystems.push(ss);
        debug!("subsystem {} registered", id);
        Ok(())
    }

    pub fn subsystem(&self, id: SubsystemId) -> Option<Arc<dyn Subsystem>> {
        utils::read(&self.subsystems)
            .iter()
            .find(|ss| ss.core().id() == id)
            .cloned()
    }

    /// Spawns one named thread per subsystem, highest priority first.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(Error::Illegal);
        }
        let mut ordered = utils::read(&self.subsystems).clone();
        ordered.sort_by(|a, b| b.core().config().priority.cmp(&a.core().config().priority));

        for ss in ordered {
            let config = ss.core().config().clone();
            let platform = Arc::clone(self);
            let spawned = std::thread::Builder::new()
                .name(format!("ss-{}", config.name))
                .stack_size(config.stack_size)
                .spawn(move || ss.run(platform));
            match spawned {
                Ok(handle) => utils::lock(&self.tasks).push((config.id, handle)),
                Err(e) => {
                    error!("failed to spawn {} task: {}", config.name, e);
                    let _ = self.shutdown();
                    return Err(e.into());
                }
            }
        }
        info!("🚀 platform started ({} subsystems)", utils::lock(&self.tasks).len());
        Ok(())
    }

    /// Stops every subsystem task and joins it. Must not be called from a
    /// subsystem thread. `Error` if a task panicked.
    pub fn shutdown(&self) -> Result<()> {
        self.running.store(false, Ordering::Release);
        for ss in utils::read(&self.subsystems).iter() {
            let _state = ss.core().state();
            ss.core().signal().notify_all();
        }

        let tasks = std::mem::take(&mut *utils::lock(&self.tasks));
        let mut result = Ok(());
        for (id, handle) in tasks {
            if handle.join().is_err() {
                error!("{} task panicked", id);
                result = Err(Error::Error);
            }
        }
        info!("platform stopped");
        result
    }

    /// Asks every live subsystem to enter `mode`. `Busy` while a subsystem
    /// is still booting or another transition is pending.
    pub fn request_mode_change(&self, mode: SatelliteMode) -> Result<()> {
        let mut transition = utils::lock(&self.transition);
        if transition.target.is_some() {
            return Err(Error::Busy);
        }
        let subsystems = utils::read(&self.subsystems);
        if subsystems.iter().any(|ss| ss.core().status() == SubsystemStatus::Booting) {
            return Err(Error::Busy);
        }

        for ss in subsystems.iter() {
            let core = ss.core();
            let mut state = core.state();
            if state.status == SubsystemStatus::FatalError {
                continue;
            }
            state.status = SubsystemStatus::ModeChangePending;
            state.requested_mode = mode;
            core.signal().notify_all();
        }
        transition.target = Some((mode, Instant::now()));
        info!("mode change {:?} -> {:?} requested", transition.current, mode);
        Ok(())
    }

    /// Parks the calling subsystem task for at most `timeout`. Returns the
    /// requested mode if a mode change is pending for it, `None` when the
    /// period elapsed or the platform is stopping.
    pub fn wait_mode_change(&self, core: &SubsystemCore, timeout: Duration) -> Option<SatelliteMode> {
        let state = core.state();
        let (state, _) = core
            .signal()
            .wait_timeout_while(state, timeout, |s| {
                s.status != SubsystemStatus::ModeChangePending && self.is_running()
            })
            .unwrap_or_else(PoisonError::into_inner);
        (state.status == SubsystemStatus::ModeChangePending).then_some(state.requested_mode)
    }

    /// Marks the subsystem ready in the mode it was asked for. A subsystem
    /// in `FatalError` stays there.
    pub fn ss_is_ready(&self, core: &SubsystemCore) {
        {
            let mut state = core.state();
            if state.status == SubsystemStatus::FatalError {
                return;
            }
            state.status = SubsystemStatus::Ready;
            state.mode = state.requested_mode;
            info!("{} ready ({:?})", core.name(), state.mode);
        }
        let _transition = utils::lock(&self.transition);
        self.ready.notify_all();
    }

    /// Clears `mask` from the subsystem's missing heartbeat bits.
    pub fn ss_is_alive(&self, core: &SubsystemCore, mask: u32) {
        core.state().heartbeat_missing &= !mask;
    }

    pub fn ss_report_error(&self, core: &SubsystemCore, err: Error) {
        self.mark_fatal(core, err, FaultKind::Reported(err));
        let _transition = utils::lock(&self.transition);
        self.ready.notify_all();
    }

    fn mark_fatal(&self, core: &SubsystemCore, err: Error, kind: FaultKind) {
        {
            let mut state = core.state();
            state.status = SubsystemStatus::FatalError;
            state.last_error = Some(err);
        }
        error!("💥 {} entered FATAL_ERROR: {}", core.name(), err);
        self.record_fault(core.id(), kind);
    }

    fn record_fault(&self, id: SubsystemId, kind: FaultKind) {
        utils::lock(&self.faults).record_fault(id, kind, utils::uptime_ms());
    }

    /// Every subsystem has left `Booting` and `ModeChangePending`.
    fn all_settled(&self) -> bool {
        utils::read(&self.subsystems).iter().all(|ss| {
            matches!(
                ss.core().status(),
                SubsystemStatus::Ready | SubsystemStatus::FatalError
            )
        })
    }

    fn any_fatal(&self) -> bool {
        utils::read(&self.subsystems)
            .iter()
            .any(|ss| ss.core().status() == SubsystemStatus::FatalError)
    }

    fn expire_stragglers(&self) {
        for ss in utils::read(&self.subsystems).iter() {
            let status = ss.core().status();
            if matches!(status, SubsystemStatus::Booting | SubsystemStatus::ModeChangePending) {
                self.mark_fatal(ss.core(), Error::Timeout, FaultKind::ModeChangeTimeout);
            }
        }
    }

    fn finish(&self, transition: &mut Transition) -> Option<SatelliteMode> {
        let (mode, started) = transition.target.take()?;
        transition.current = mode;
        info!("🛰️ mode {:?} reached in {} ms", mode, started.elapsed().as_millis());
        Some(mode)
    }

    /// Non-blocking progress check of the pending transition, for callers
    /// that run on a subsystem thread themselves.
    pub fn poll_transition(&self) -> TransitionState {
        let mut transition = utils::lock(&self.transition);
        let Some((mode, started)) = transition.target else {
            return TransitionState::Idle;
        };
        if self.all_settled() {
            self.finish(&mut transition);
            return TransitionState::Completed(mode);
        }
        if started.elapsed() >= self.timing.mode_change_timeout {
            self.expire_stragglers();
            self.finish(&mut transition);
            return TransitionState::TimedOut(mode);
        }
        TransitionState::Pending(mode)
    }

    /// Blocks until every subsystem has settled, failing the ones that do
    /// not within `timeout`. `Timeout` if any had to be failed, `Error` if a
    /// subsystem is in `FatalError` for another reason.
    pub fn await_ready(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut transition = utils::lock(&self.transition);
        while !self.all_settled() {
            let now = Instant::now();
            if now >= deadline {
                warn!("subsystems did not settle within {} ms", timeout.as_millis());
                self.expire_stragglers();
                self.finish(&mut transition);
                return Err(Error::Timeout);
            }
            let (guard, _) = self
                .ready
                .wait_timeout(transition, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            transition = guard;
        }
        self.finish(&mut transition);
        if self.any_fatal() {
            return Err(Error::Error);
        }
        Ok(())
    }

    /// Request plus wait. Blocks, so never call it from a subsystem thread.
    pub fn change_mode(&self, mode: SatelliteMode) -> Result<()> {
        self.request_mode_change(mode)?;
        self.await_ready(self.timing.mode_change_timeout)
    }

    /// Starts every task, waits for them to boot, then walks the satellite
    /// through `Initializing` into `target`.
    pub fn boot(self: &Arc<Self>, target: SatelliteMode) -> Result<()> {
        self.start()?;
        self.await_ready(self.timing.mode_change_timeout)?;
        self.change_mode(SatelliteMode::Initializing)?;
        self.change_mode(target)
    }

    /// Closes the current heartbeat window: every ready subsystem with
    /// expected bits still missing is recorded as a fault, and every mask
    /// is re-armed for the next window.
    pub fn check_heartbeats(&self) -> HeartbeatReport {
        let mut report = HeartbeatReport::default();
        let mut escalate = Vec::new();
        for ss in utils::read(&self.subsystems).iter() {
            let core = ss.core();
            let missing = {
                let mut state = core.state();
                let missing = state.heartbeat_missing;
                state.heartbeat_missing = core.config().heartbeats;
                if state.status != SubsystemStatus::Ready {
                    continue;
                }
                missing
            };
            if missing == 0 {
                continue;
            }
            warn!("💔 {} missed heartbeat bits {:#x}", core.name(), missing);
            self.record_fault(core.id(), FaultKind::HeartbeatMissed { missing });
            let _ = report.missed.push((core.id(), missing));
            if self.timing.escalate_heartbeat {
                escalate.push(Arc::clone(ss));
            }
        }
        for ss in escalate {
            self.ss_report_error(ss.core(), Error::Timeout);
        }
        report
    }

    /// Hands a command to the subsystem with id `id`.
    pub fn route_command(&self, id: SubsystemId, iframe: &mut Frame, oframe: &mut Frame, sequence: u32) -> Result<()> {
        let ss = self.subsystem(id).ok_or(Error::NoEnt)?;
        ss.execute_command(iframe, oframe, sequence)
    }

    pub fn statuses(&self) -> Vec<SubsystemReport> {
        utils::read(&self.subsystems)
            .iter()
            .map(|ss| SubsystemReport {
                id: ss.core().id(),
                name: ss.core().name(),
                state: ss.core().snapshot(),
            })
            .collect()
    }

    pub fn faults(&self) -> Vec<FaultRecord> {
        utils::lock(&self.faults).fault_history().to_vec()
    }

    /// Unresolved faults, oldest first.
    pub fn active_faults(&self) -> Vec<FaultRecord> {
        utils::lock(&self.faults).active_faults().cloned().collect()
    }

    pub fn resolve_fault(&self, fault_id: u32) -> bool {
        utils::lock(&self.faults).resolve_fault(fault_id, utils::uptime_ms())
    }

    /// Drops resolved faults from the history; returns how many went.
    pub fn clear_resolved_faults(&self) -> usize {
        let mut faults = utils::lock(&self.faults);
        let before = faults.fault_history().len();
        faults.clear_resolved_faults();
        before - faults.fault_history().len()
    }

    pub fn describe_commands(&self) -> Vec<(SubsystemId, Vec<CommandDescriptor>)> {
        utils::read(&self.subsystems)
            .iter()
            .map(|ss| (ss.core().id(), ss.describe()))
            .collect()
    }
}

impl core::fmt::Debug for Platform {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Platform")
            .field("timing", &self.timing)
            .field("running", &self.is_running())
            .field("mode", &self.current_mode())
            .finish()
    }
}
