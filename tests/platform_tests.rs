use satcore::error::{Error, Result};
use satcore::fault::FaultKind;
use satcore::frame::Frame;
use satcore::nvram::Nvram;
use satcore::platform::{Platform, PlatformTiming, TransitionState};
use satcore::subsystems::{
    main_loop, platform as platform_ss, PlatformSubsystem, SatelliteMode, Subsystem, SubsystemConfig,
    SubsystemCore, SubsystemId, SubsystemStatus,
};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

fn fast_timing() -> PlatformTiming {
    PlatformTiming {
        period: Duration::from_millis(10),
        mode_change_timeout: Duration::from_millis(300),
        heartbeat_window: Duration::from_millis(50),
        escalate_heartbeat: false,
    }
}

/// Configurable stand-in subsystem.
struct Stub {
    core: SubsystemCore,
    entered: Mutex<Vec<SatelliteMode>>,
    boot_delay: Duration,
    stall_on: Option<SatelliteMode>,
    fail_on: Option<SatelliteMode>,
    silent: bool,
}

impl Stub {
    fn new(id: SubsystemId) -> Self {
        Self {
            core: SubsystemCore::new(SubsystemConfig::new(id)),
            entered: Mutex::new(Vec::new()),
            boot_delay: Duration::ZERO,
            stall_on: None,
            fail_on: None,
            silent: false,
        }
    }

    fn with_config(mut self, config: SubsystemConfig) -> Self {
        self.core = SubsystemCore::new(config);
        self
    }

    fn entered(&self) -> Vec<SatelliteMode> {
        self.entered.lock().unwrap().clone()
    }
}

impl Subsystem for Stub {
    fn core(&self) -> &SubsystemCore {
        &self.core
    }

    fn execute_command(&self, iframe: &mut Frame, oframe: &mut Frame, sequence: u32) -> Result<()> {
        let command = iframe.get_u8()?;
        oframe.put_u8(self.core.id().code())?;
        oframe.put_u8(command)?;
        oframe.put_u24(sequence)
    }

    fn boot(&self, _platform: &Platform) -> Result<()> {
        thread::sleep(self.boot_delay);
        Ok(())
    }

    fn enter_mode(&self, _platform: &Platform, mode: SatelliteMode) -> Result<()> {
        if self.stall_on == Some(mode) {
            thread::sleep(Duration::from_millis(600));
        }
        if self.fail_on == Some(mode) {
            return Err(Error::Illegal);
        }
        self.entered.lock().unwrap().push(mode);
        Ok(())
    }

    fn run(self: Arc<Self>, platform: Arc<Platform>) {
        if !self.silent {
            return main_loop(self.as_ref(), &platform);
        }
        // Acknowledges mode changes but never heartbeats.
        platform.ss_is_ready(&self.core);
        while platform.is_running() {
            if let Some(mode) = platform.wait_mode_change(&self.core, platform.timing().period) {
                self.entered.lock().unwrap().push(mode);
                platform.ss_is_ready(&self.core);
            }
        }
    }
}

fn platform_with(stubs: &[Arc<Stub>]) -> Arc<Platform> {
    let platform = Platform::new(fast_timing());
    for stub in stubs {
        platform.register(Arc::clone(stub) as Arc<dyn Subsystem>).unwrap();
    }
    platform
}

fn status_of(platform: &Platform, id: SubsystemId) -> SubsystemStatus {
    platform
        .statuses()
        .into_iter()
        .find(|r| r.id == id)
        .map(|r| r.state.status)
        .unwrap()
}

#[cfg(test)]
mod mode_change_tests {
    use super::*;

    #[test]
    fn test_boot_walks_every_subsystem_into_target() {
        let power = Arc::new(Stub::new(SubsystemId::Power));
        let thermal = Arc::new(Stub::new(SubsystemId::Thermal));
        let platform = platform_with(&[Arc::clone(&power), Arc::clone(&thermal)]);

        platform.boot(SatelliteMode::Mission).unwrap();

        assert_eq!(platform.current_mode(), SatelliteMode::Mission);
        for stub in [&power, &thermal] {
            assert_eq!(stub.entered(), vec![SatelliteMode::Initializing, SatelliteMode::Mission]);
        }
        for report in platform.statuses() {
            assert_eq!(report.state.status, SubsystemStatus::Ready);
            assert_eq!(report.state.mode, SatelliteMode::Mission);
        }
        platform.shutdown().unwrap();
    }

    #[test]
    fn test_successive_changes_are_acknowledged() {
        let stub = Arc::new(Stub::new(SubsystemId::Payload));
        let platform = platform_with(&[Arc::clone(&stub)]);
        platform.boot(SatelliteMode::Mission).unwrap();

        platform.change_mode(SatelliteMode::LowPower).unwrap();
        platform.change_mode(SatelliteMode::Survival).unwrap();

        assert_eq!(platform.current_mode(), SatelliteMode::Survival);
        assert_eq!(
            stub.entered(),
            vec![
                SatelliteMode::Initializing,
                SatelliteMode::Mission,
                SatelliteMode::LowPower,
                SatelliteMode::Survival
            ]
        );
        platform.shutdown().unwrap();
    }

    #[test]
    fn test_request_while_booting_is_busy() {
        let mut slow = Stub::new(SubsystemId::Aocs);
        slow.boot_delay = Duration::from_millis(150);
        let platform = platform_with(&[Arc::new(slow)]);

        platform.start().unwrap();
        assert_eq!(
            platform.request_mode_change(SatelliteMode::Mission).unwrap_err(),
            Error::Busy
        );
        platform.await_ready(Duration::from_secs(2)).unwrap();
        platform.request_mode_change(SatelliteMode::Mission).unwrap();
        platform.await_ready(Duration::from_secs(2)).unwrap();
        platform.shutdown().unwrap();
    }

    #[test]
    fn test_stalled_subsystem_times_out_into_fatal() {
        let healthy = Arc::new(Stub::new(SubsystemId::Power));
        let mut stalled = Stub::new(SubsystemId::Payload);
        stalled.stall_on = Some(SatelliteMode::Survival);
        let stalled = Arc::new(stalled);
        let platform = platform_with(&[Arc::clone(&healthy), Arc::clone(&stalled)]);
        platform.boot(SatelliteMode::Mission).unwrap();

        platform.request_mode_change(SatelliteMode::Survival).unwrap();
        assert_eq!(
            platform.request_mode_change(SatelliteMode::Mission).unwrap_err(),
            Error::Busy
        );
        assert_eq!(platform.poll_transition(), TransitionState::Pending(SatelliteMode::Survival));
        assert_eq!(
            platform.await_ready(platform.timing().mode_change_timeout).unwrap_err(),
            Error::Timeout
        );

        assert_eq!(platform.current_mode(), SatelliteMode::Survival);
        assert_eq!(status_of(&platform, SubsystemId::Payload), SubsystemStatus::FatalError);
        assert_eq!(status_of(&platform, SubsystemId::Power), SubsystemStatus::Ready);
        let faults = platform.faults();
        assert_eq!(faults.len(), 1);
        assert_eq!(faults[0].subsystem, SubsystemId::Payload);
        assert_eq!(faults[0].kind, FaultKind::ModeChangeTimeout);
        assert_eq!(platform.poll_transition(), TransitionState::Idle);

        // Let the stalled task finish its sleep; it must stay fatal.
        thread::sleep(Duration::from_millis(400));
        assert_eq!(status_of(&platform, SubsystemId::Payload), SubsystemStatus::FatalError);
        assert_eq!(stalled.entered().last(), Some(&SatelliteMode::Survival));
        platform.shutdown().unwrap();
    }

    #[test]
    fn test_poll_transition_expires_stragglers() {
        let mut stalled = Stub::new(SubsystemId::Memory);
        stalled.stall_on = Some(SatelliteMode::LowPower);
        let platform = platform_with(&[Arc::new(stalled)]);
        platform.boot(SatelliteMode::Mission).unwrap();

        platform.request_mode_change(SatelliteMode::LowPower).unwrap();
        thread::sleep(platform.timing().mode_change_timeout + Duration::from_millis(50));
        assert_eq!(platform.poll_transition(), TransitionState::TimedOut(SatelliteMode::LowPower));
        assert_eq!(status_of(&platform, SubsystemId::Memory), SubsystemStatus::FatalError);
        platform.shutdown().unwrap();
    }

    #[test]
    fn test_failed_enter_mode_is_reported_and_skipped_afterwards() {
        let healthy = Arc::new(Stub::new(SubsystemId::Power));
        let mut failing = Stub::new(SubsystemId::Thermal);
        failing.fail_on = Some(SatelliteMode::LowPower);
        let failing = Arc::new(failing);
        let platform = platform_with(&[Arc::clone(&healthy), Arc::clone(&failing)]);
        platform.boot(SatelliteMode::Mission).unwrap();

        assert_eq!(platform.change_mode(SatelliteMode::LowPower).unwrap_err(), Error::Error);
        let thermal = platform
            .statuses()
            .into_iter()
            .find(|r| r.id == SubsystemId::Thermal)
            .unwrap();
        assert_eq!(thermal.state.status, SubsystemStatus::FatalError);
        assert_eq!(thermal.state.last_error, Some(Error::Illegal));
        assert_eq!(platform.faults()[0].kind, FaultKind::Reported(Error::Illegal));

        // The fatal subsystem is no longer asked; the rest still follow.
        assert_eq!(platform.change_mode(SatelliteMode::Mission).unwrap_err(), Error::Error);
        assert_eq!(platform.current_mode(), SatelliteMode::Mission);
        assert_eq!(healthy.entered().last(), Some(&SatelliteMode::Mission));
        assert_eq!(failing.entered(), vec![SatelliteMode::Initializing, SatelliteMode::Mission]);
        assert_eq!(status_of(&platform, SubsystemId::Thermal), SubsystemStatus::FatalError);
        platform.shutdown().unwrap();
    }

    #[test]
    fn test_faults_can_be_resolved() {
        let mut failing = Stub::new(SubsystemId::Payload);
        failing.fail_on = Some(SatelliteMode::Initializing);
        let platform = platform_with(&[Arc::new(failing)]);
        assert_eq!(platform.boot(SatelliteMode::Mission).unwrap_err(), Error::Error);

        let id = platform.faults()[0].id;
        assert!(platform.resolve_fault(id));
        assert!(platform.faults()[0].resolved);
        assert!(!platform.resolve_fault(id + 100));
        assert!(platform.active_faults().is_empty());
        assert_eq!(platform.clear_resolved_faults(), 1);
        assert!(platform.faults().is_empty());
        platform.shutdown().unwrap();
    }
}

#[cfg(test)]
mod fault_command_tests {
    use super::*;

    fn run(ground: &PlatformSubsystem, request: &[u8]) -> Result<Frame> {
        let mut iframe = Frame::from_slice(request);
        let mut oframe = Frame::with_capacity(64);
        ground.execute_command(&mut iframe, &mut oframe, 1)?;
        oframe.reset_for_reading();
        Ok(oframe)
    }

    #[test]
    fn test_get_resolve_and_clear_faults() {
        let platform = Platform::new(fast_timing());
        let stub = Arc::new(Stub::new(SubsystemId::Payload));
        let ground = Arc::new(PlatformSubsystem::new(Arc::new(Nvram::in_memory())));
        platform.register(Arc::clone(&stub) as Arc<dyn Subsystem>).unwrap();
        platform.register(Arc::clone(&ground) as Arc<dyn Subsystem>).unwrap();

        platform.ss_report_error(stub.core(), Error::Illegal);
        platform.ss_report_error(stub.core(), Error::Timeout);
        let first = platform.faults()[0].id;

        let mut faults = run(&ground, &[platform_ss::CMD_GET_FAULTS]).unwrap();
        assert_eq!(faults.get_u8().unwrap(), 2);
        assert_eq!(faults.get_u32().unwrap(), first);
        assert_eq!(faults.get_u8().unwrap(), SubsystemId::Payload.code());

        let mut resolve = vec![platform_ss::CMD_RESOLVE_FAULT];
        resolve.extend_from_slice(&first.to_be_bytes());
        run(&ground, &resolve).unwrap();
        assert_eq!(run(&ground, &resolve[..1]).unwrap_err(), Error::NoSpace);
        let mut unknown = vec![platform_ss::CMD_RESOLVE_FAULT];
        unknown.extend_from_slice(&(first + 100).to_be_bytes());
        assert_eq!(run(&ground, &unknown).unwrap_err(), Error::NoEnt);

        let mut faults = run(&ground, &[platform_ss::CMD_GET_FAULTS]).unwrap();
        assert_eq!(faults.get_u8().unwrap(), 1);
        assert_eq!(faults.get_u32().unwrap(), first + 1);

        let mut cleared = run(&ground, &[platform_ss::CMD_CLEAR_FAULTS]).unwrap();
        assert_eq!(cleared.get_u8().unwrap(), 1);
        assert_eq!(platform.faults().len(), 1);
    }
}

#[cfg(test)]
mod registry_tests {
    use super::*;

    #[test]
    fn test_duplicate_id_is_rejected() {
        let platform = platform_with(&[Arc::new(Stub::new(SubsystemId::Power))]);
        assert_eq!(
            platform
                .register(Arc::new(Stub::new(SubsystemId::Power)))
                .unwrap_err(),
            Error::Exist
        );
    }

    #[test]
    fn test_register_and_start_after_start_are_illegal() {
        let platform = platform_with(&[Arc::new(Stub::new(SubsystemId::Power))]);
        platform.start().unwrap();
        assert_eq!(
            platform
                .register(Arc::new(Stub::new(SubsystemId::Thermal)))
                .unwrap_err(),
            Error::Illegal
        );
        assert_eq!(platform.start().unwrap_err(), Error::Illegal);
        platform.shutdown().unwrap();
        assert!(!platform.is_running());
        platform.shutdown().unwrap();
    }

    #[test]
    fn test_route_command() {
        let platform = platform_with(&[Arc::new(Stub::new(SubsystemId::Payload))]);

        let mut oframe = Frame::with_capacity(8);
        platform
            .route_command(SubsystemId::Payload, &mut Frame::from_slice(&[9]), &mut oframe, 77)
            .unwrap();
        assert_eq!(oframe.written(), &[SubsystemId::Payload.code(), 9, 0, 0, 77]);

        assert_eq!(
            platform
                .route_command(SubsystemId::Aocs, &mut Frame::from_slice(&[0]), &mut oframe, 1)
                .unwrap_err(),
            Error::NoEnt
        );
    }

    #[test]
    fn test_subsystem_sees_its_platform() {
        let stub = Arc::new(Stub::new(SubsystemId::Cdh));
        assert!(stub.core().platform().is_none());
        let platform = platform_with(&[Arc::clone(&stub)]);
        assert!(Arc::ptr_eq(&stub.core().platform().unwrap(), &platform));
    }
}

#[cfg(test)]
mod heartbeat_tests {
    use super::*;

    fn silent_stub(id: SubsystemId) -> Arc<Stub> {
        let mut stub = Stub::new(id).with_config(SubsystemConfig::new(id).heartbeats(0b101));
        stub.silent = true;
        Arc::new(stub)
    }

    #[test]
    fn test_missing_heartbeats_are_recorded() {
        let healthy = Arc::new(Stub::new(SubsystemId::Power));
        let platform = platform_with(&[healthy, silent_stub(SubsystemId::Payload)]);
        platform.boot(SatelliteMode::Mission).unwrap();
        thread::sleep(Duration::from_millis(60));

        let report = platform.check_heartbeats();
        assert!(!report.is_clean());
        assert_eq!(report.missed.as_slice(), &[(SubsystemId::Payload, 0b101)]);
        assert_eq!(
            platform.faults().last().map(|f| f.kind),
            Some(FaultKind::HeartbeatMissed { missing: 0b101 })
        );
        assert_eq!(status_of(&platform, SubsystemId::Payload), SubsystemStatus::Ready);
        platform.shutdown().unwrap();
    }

    #[test]
    fn test_escalated_heartbeat_is_fatal() {
        let platform = Platform::new(PlatformTiming {
            escalate_heartbeat: true,
            ..fast_timing()
        });
        platform.register(silent_stub(SubsystemId::Memory)).unwrap();
        platform.boot(SatelliteMode::Mission).unwrap();

        platform.check_heartbeats();
        let state = platform.statuses()[0].state;
        assert_eq!(state.status, SubsystemStatus::FatalError);
        assert_eq!(state.last_error, Some(Error::Timeout));
        platform.shutdown().unwrap();
    }

    #[test]
    fn test_heartbeat_window_is_rearmed() {
        let platform = platform_with(&[Arc::new(Stub::new(SubsystemId::Power))]);
        platform.boot(SatelliteMode::Mission).unwrap();
        for _ in 0..3 {
            thread::sleep(Duration::from_millis(40));
            assert!(platform.check_heartbeats().is_clean());
        }
        assert!(platform.faults().is_empty());
        platform.shutdown().unwrap();
    }
}
