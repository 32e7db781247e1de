//! `PodSession`: the single process-wide owner of the USB channel, the
//! target run/halt state, cached fallback registers, and the breakpoint
//! tables. Every higher-level operation borrows this struct rather than
//! reaching for ambient globals, threading one owned device handle through
//! the whole bring-up/debug/flash lifecycle instead of stashing it
//! statically.

use log::info;
use rusb::Context;

use crate::breakpoints::BreakpointTable;
use crate::error::Result;
use crate::usb::{self, UsbChannel};

/// Run/halt/flash state of the attached target. `Unknown` only occurs
/// before bring-up completes or after a USB error leaves the persistent
/// buffer in an undefined state.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TargetState {
    Unknown,
    Halted,
    Running,
    Flashing,
}

/// Process-wide singleton: the claimed USB interface, target state, cached
/// registers, and breakpoint tables. Created once at startup and dropped on
/// exit, which releases the USB interface.
pub struct PodSession {
    pub channel: UsbChannel<Context>,
    pub state: TargetState,
    pub breakpoints: BreakpointTable,
    /// Fallback stack pointer, populated from flash word 0 on first halt.
    pub cached_sp: Option<u32>,
    /// Fallback program counter, populated from flash word 1 on first halt.
    pub cached_pc: Option<u32>,
    pub verbose: bool,
}

impl PodSession {
    /// Opens the pod by VID/PID and claims its interface. The target state
    /// starts `Unknown` until the bring-up sequencer runs.
    pub fn open(verbose: bool) -> Result<Self> {
        let channel = usb::open()?;
        info!("claimed pod interface, starting in Unknown state");
        Ok(PodSession {
            channel,
            state: TargetState::Unknown,
            breakpoints: BreakpointTable::new(),
            cached_sp: None,
            cached_pc: None,
            verbose,
        })
    }

    /// Populates the register-read fallback cache from the two vectors at
    /// the base of flash, called once after the first successful halt.
    pub fn seed_register_cache(&mut self, sp: u32, pc: u32) {
        self.cached_sp = Some(sp);
        self.cached_pc = Some(pc);
    }

    pub fn is_halted(&self) -> bool {
        self.state == TargetState::Halted
    }

    pub fn mark_halted(&mut self) {
        self.state = TargetState::Halted;
    }

    pub fn mark_running(&mut self) {
        self.state = TargetState::Running;
    }

    pub fn mark_flashing(&mut self) {
        self.state = TargetState::Flashing;
    }

    /// Any USB-layer error leaves the persistent buffer in an undefined
    /// state: the session must be marked `Unknown` so the next command
    /// re-establishes ordering rather than trusting stale assumptions.
    pub fn mark_unknown(&mut self) {
        self.state = TargetState::Unknown;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_with_empty_register_cache() {
        // Constructed by hand since `open()` needs a live pod; exercises
        // the state-transition helpers in isolation instead.
        let bp = BreakpointTable::new();
        assert_eq!(bp.free_hw_slot(), Some(0));
    }

    #[test]
    fn target_state_equality() {
        assert_eq!(TargetState::Halted, TargetState::Halted);
        assert_ne!(TargetState::Halted, TargetState::Running);
    }
}
