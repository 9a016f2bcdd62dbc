use crate::{DaqError, DaqResult};
use std::fmt;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SessionState {
    #[default]
    Idle,
    Armed,
    Running,
    Stopping,
}

impl SessionState {
    pub fn name(self) -> &'static str {
        match self {
            SessionState::Idle => "Idle",
            SessionState::Armed => "Armed",
            SessionState::Running => "Running",
            SessionState::Stopping => "Stopping",
        }
    }

    fn can_become(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Idle, Armed) | (Armed, Running) | (Armed, Stopping) | (Running, Stopping) | (Stopping, Idle)
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Soft counters of one run. None of these are persisted.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SessionCounters {
    /// Low half of the 64-bit hardware clock value last read.
    pub clock_low: u32,
    /// High half of the 64-bit hardware clock value last read.
    pub clock_high: u32,
    pub last_gt_id: u32,
    pub pulser_count: u64,
    pub pedestal_count: u64,
    pub polls: u64,
}

impl SessionCounters {
    pub fn clock_ticks(&self) -> u64 {
        ((self.clock_high as u64) << 32) | self.clock_low as u64
    }

    pub fn set_clock_ticks(&mut self, ticks: u64) {
        self.clock_low = ticks as u32;
        self.clock_high = (ticks >> 32) as u32;
    }
}

/// Run state of one device, driven only by the lifecycle hooks.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AcquisitionSession {
    state: SessionState,
    counters: SessionCounters,
}

impl AcquisitionSession {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn counters(&self) -> &SessionCounters {
        &self.counters
    }

    pub fn counters_mut(&mut self) -> &mut SessionCounters {
        &mut self.counters
    }

    pub fn transition(&mut self, next: SessionState) -> DaqResult<()> {
        if !self.state.can_become(next) {
            return Err(DaqError::InvalidTransition {
                from: self.state.name(),
                to: next.name(),
            });
        }
        self.state = next;
        Ok(())
    }

    pub fn arm(&mut self) -> DaqResult<()> {
        self.transition(SessionState::Armed)
    }

    /// Enter `Running` on the first poll; later polls are no-ops.
    pub fn begin_taking(&mut self) -> DaqResult<()> {
        if self.state == SessionState::Running {
            return Ok(());
        }
        self.transition(SessionState::Running)
    }

    /// Pass through `Stopping` back to `Idle`, dropping all soft state.
    pub fn stop(&mut self) -> DaqResult<()> {
        if self.state == SessionState::Idle {
            return Ok(());
        }
        self.transition(SessionState::Stopping)?;
        self.counters = SessionCounters::default();
        self.transition(SessionState::Idle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normal_lifecycle() {
        let mut s = AcquisitionSession::new();
        s.arm().unwrap();
        s.begin_taking().unwrap();
        s.begin_taking().unwrap();
        assert_eq!(s.state(), SessionState::Running);
        s.counters_mut().pedestal_count = 12;
        s.stop().unwrap();
        assert_eq!(s.state(), SessionState::Idle);
        assert_eq!(s.counters(), &SessionCounters::default());
    }

    #[test]
    fn cannot_take_data_before_arming() {
        let mut s = AcquisitionSession::new();
        let err = s.begin_taking().unwrap_err();
        assert!(matches!(
            err,
            DaqError::InvalidTransition {
                from: "Idle",
                to: "Running"
            }
        ));
        s.stop().unwrap();
        s.arm().unwrap();
        assert!(s.arm().is_err());
    }

    #[test]
    fn clock_halves() {
        let mut c = SessionCounters::default();
        c.set_clock_ticks(0x0012_3456_89ab_cdef);
        assert_eq!(c.clock_low, 0x89ab_cdef);
        assert_eq!(c.clock_high, 0x0012_3456);
        assert_eq!(c.clock_ticks(), 0x0012_3456_89ab_cdef);
    }
}
