use crate::error::Error;
use crate::subsystems::SubsystemId;
use heapless::Vec;
use serde::{Deserialize, Serialize};

pub const MAX_FAULT_HISTORY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FaultKind {
    /// Subsystem did not acknowledge a boot or mode change in time.
    ModeChangeTimeout,
    /// Expected heartbeat bits still missing at the end of a window.
    HeartbeatMissed { missing: u32 },
    /// Subsystem reported a fatal error itself.
    Reported(Error),
}

impl FaultKind {
    pub fn code(&self) -> u8 {
        match self {
            FaultKind::ModeChangeTimeout => 1,
            FaultKind::HeartbeatMissed { .. } => 2,
            FaultKind::Reported(_) => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultRecord {
    pub id: u32,
    pub subsystem: SubsystemId,
    pub kind: FaultKind,
    /// Milliseconds of uptime.
    pub timestamp: u64,
    pub duration_ms: u32,
    pub resolved: bool,
}

/// Bounded fault history; the oldest record is dropped when full.
#[derive(Debug)]
pub struct FaultManager {
    fault_history: Vec<FaultRecord, MAX_FAULT_HISTORY>,
    next_fault_id: u32,
}

impl FaultManager {
    pub fn new() -> Self {
        Self {
            fault_history: Vec::new(),
            next_fault_id: 1,
        }
    }

    pub fn record_fault(&mut self, subsystem: SubsystemId, kind: FaultKind, timestamp: u64) -> u32 {
        let fault_id = self.next_fault_id;
        self.next_fault_id = self.next_fault_id.wrapping_add(1);

        if self.fault_history.is_full() {
            self.fault_history.remove(0);
        }
        let _ = self.fault_history.push(FaultRecord {
            id: fault_id,
            subsystem,
            kind,
            timestamp,
            duration_ms: 0,
            resolved: false,
        });
        fault_id
    }

    pub fn resolve_fault(&mut self, fault_id: u32, timestamp: u64) -> bool {
        match self.fault_history.iter_mut().find(|f| f.id == fault_id) {
            Some(fault) => {
                fault.resolved = true;
                fault.duration_ms = timestamp.saturating_sub(fault.timestamp) as u32;
                true
            }
            None => false,
        }
    }

    pub fn active_faults(&self) -> impl Iterator<Item = &FaultRecord> {
        self.fault_history.iter().filter(|f| !f.resolved)
    }

    pub fn fault_history(&self) -> &[FaultRecord] {
        &self.fault_history
    }

    pub fn clear_resolved_faults(&mut self) {
        self.fault_history.retain(|f| !f.resolved);
    }
}

impl Default for FaultManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_history_is_bounded() {
        let mut faults = FaultManager::new();
        for t in 0..(MAX_FAULT_HISTORY as u64 + 3) {
            faults.record_fault(SubsystemId::Power, FaultKind::ModeChangeTimeout, t);
        }
        assert_eq!(faults.fault_history().len(), MAX_FAULT_HISTORY);
        assert_eq!(faults.fault_history()[0].id, 4);
    }

    #[test]
    fn test_resolve_and_clear() {
        let mut faults = FaultManager::new();
        let id = faults.record_fault(SubsystemId::Thermal, FaultKind::Reported(Error::Timeout), 100);
        faults.record_fault(SubsystemId::Cdh, FaultKind::HeartbeatMissed { missing: 1 }, 150);

        assert!(faults.resolve_fault(id, 400));
        assert!(!faults.resolve_fault(99, 400));
        assert_eq!(faults.fault_history()[0].duration_ms, 300);
        assert_eq!(faults.active_faults().count(), 1);

        faults.clear_resolved_faults();
        assert_eq!(faults.fault_history().len(), 1);
    }
}
