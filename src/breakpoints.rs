//! The hardware/software breakpoint and watchpoint tables (part of the
//! Debug Coordinator's state), plus the write-only Trigger Definition
//! Register shadow they're all layered on top of.

pub const MAX_HW_BREAKPOINTS: usize = 4;
pub const MAX_SW_BREAKPOINTS: usize = 32;

/// PBR register offsets indexed by slot, from the MCF5223x debug-register
/// table: PBR0=0x08, PBR1=0x18, PBR2=0x1A, PBR3=0x1B.
pub const PBR_REG: [u16; MAX_HW_BREAKPOINTS] = [0x08, 0x18, 0x1A, 0x1B];

pub const DEBUG_REG_TDR: u16 = 0x07;
pub const ABLR_WRITE: u16 = 0x0D;
pub const ABHR_WRITE: u16 = 0x0C;

pub const TDR_TRC_HALT: u32 = 1 << 30;
pub const TDR_EBL1: u32 = 1 << 13;
pub const TDR_EPC1: u32 = 1 << 9;
pub const TDR_EAR1: u32 = 1 << 10;
pub const TDR_EAL_INSIDE: u32 = 1 << 14;
pub const TDR_EAL_MASK: u32 = 0b11 << 14;
pub const TDR_DRW_WRITE: u32 = 1 << 20;
pub const TDR_DRW_READ: u32 = 1 << 21;
pub const TDR_DRW_RW: u32 = TDR_DRW_WRITE | TDR_DRW_READ;

#[derive(Copy, Clone, Debug, Default)]
pub struct HwBreakpoint {
    pub addr: u32,
    pub used: bool,
}

#[derive(Copy, Clone, Debug, Default)]
pub struct SwBreakpoint {
    pub addr: u32,
    pub original_insn: u16,
    pub active: bool,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum WatchpointKind {
    Write,
    Read,
    Access,
}

#[derive(Copy, Clone, Debug, Default)]
pub struct Watchpoint {
    pub addr: u32,
    pub length: u32,
    pub kind: Option<WatchpointKindStorage>,
    pub active: bool,
}

/// `WatchpointKind` without requiring `Default`; kept separate so
/// `Watchpoint` itself can still derive `Default`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct WatchpointKindStorage(pub WatchpointKind);

/// Breakpoint/watchpoint tables plus the shadow copy of the write-only
/// Trigger Definition Register. All hardware state updates are routed
/// through `tdr_shadow`; nothing here ever tries to read TDR/PBRn/ABLR/ABHR
/// back from the target.
#[derive(Default)]
pub struct BreakpointTable {
    pub hw: [HwBreakpoint; MAX_HW_BREAKPOINTS],
    pub sw: [SwBreakpoint; MAX_SW_BREAKPOINTS],
    pub watchpoint: Watchpoint,
    pub tdr_shadow: u32,
}

impl BreakpointTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Finds a free hardware slot, or `None` if all four are in use.
    pub fn free_hw_slot(&self) -> Option<usize> {
        self.hw.iter().position(|b| !b.used)
    }

    pub fn find_hw_slot(&self, addr: u32) -> Option<usize> {
        self.hw.iter().position(|b| b.used && b.addr == addr)
    }

    pub fn free_sw_slot(&self) -> Option<usize> {
        self.sw.iter().position(|b| !b.active)
    }

    pub fn find_sw_slot(&self, addr: u32) -> Option<usize> {
        self.sw.iter().position(|b| b.active && b.addr == addr)
    }

    pub fn any_hw_active(&self) -> bool {
        self.hw.iter().any(|b| b.used)
    }

    /// Computes the TDR value after arming a hardware breakpoint in `slot`,
    /// without writing anything — callers write the result through the WDMREG
    /// path and only then update `self.tdr_shadow`.
    pub fn tdr_with_hw_breakpoint_armed(&self, slot: usize) -> u32 {
        self.tdr_shadow | TDR_TRC_HALT | TDR_EBL1 | TDR_EPC1 | (1 << (24 + slot))
    }

    /// Computes the TDR value after disarming a hardware breakpoint slot,
    /// clearing `EBL1|EPC1` too if it was the last one.
    pub fn tdr_with_hw_breakpoint_cleared(&self, slot: usize, any_other_active: bool) -> u32 {
        let mut tdr = self.tdr_shadow & !(1 << (24 + slot));
        if !any_other_active {
            tdr &= !(TDR_EBL1 | TDR_EPC1);
        }
        tdr
    }

    pub fn tdr_with_watchpoint_armed(&self, kind: WatchpointKind) -> u32 {
        let mut tdr = self.tdr_shadow | TDR_TRC_HALT | TDR_EBL1 | TDR_EAR1 | TDR_EAL_INSIDE;
        tdr &= !TDR_DRW_RW;
        tdr |= match kind {
            WatchpointKind::Write => TDR_DRW_WRITE,
            WatchpointKind::Read => TDR_DRW_READ,
            WatchpointKind::Access => TDR_DRW_RW,
        };
        tdr
    }

    pub fn tdr_with_watchpoint_cleared(&self) -> u32 {
        let mut tdr = self.tdr_shadow;
        tdr &= !TDR_EAR1;
        tdr &= !TDR_EAL_MASK;
        tdr &= !TDR_DRW_RW;
        if !self.any_hw_active() {
            tdr &= !(TDR_TRC_HALT | TDR_EBL1);
        }
        tdr
    }

    /// Whether the shadow indicates a watchpoint was armed and could have
    /// triggered the halt just observed — used to decide between `S05` and
    /// `T05watch:<addr>;` stop replies.
    pub fn watchpoint_may_have_triggered(&self) -> bool {
        self.watchpoint.active
            && (self.tdr_shadow & TDR_EAR1) != 0
            && (self.tdr_shadow & TDR_TRC_HALT) != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_free_hw_slots_in_order() {
        let mut t = BreakpointTable::new();
        assert_eq!(t.free_hw_slot(), Some(0));
        t.hw[0] = HwBreakpoint { addr: 0x1000, used: true };
        assert_eq!(t.free_hw_slot(), Some(1));
    }

    #[test]
    fn reports_no_free_slot_when_full() {
        let mut t = BreakpointTable::new();
        for b in t.hw.iter_mut() {
            b.used = true;
        }
        assert_eq!(t.free_hw_slot(), None);
    }

    #[test]
    fn arms_hw_breakpoint_tdr_bits() {
        let t = BreakpointTable::new();
        let tdr = t.tdr_with_hw_breakpoint_armed(2);
        assert_ne!(tdr & TDR_TRC_HALT, 0);
        assert_ne!(tdr & TDR_EBL1, 0);
        assert_ne!(tdr & TDR_EPC1, 0);
        assert_ne!(tdr & (1 << (24 + 2)), 0);
    }

    #[test]
    fn clearing_last_hw_breakpoint_disables_triggering() {
        let mut t = BreakpointTable::new();
        t.tdr_shadow = t.tdr_with_hw_breakpoint_armed(0);
        let cleared = t.tdr_with_hw_breakpoint_cleared(0, false);
        assert_eq!(cleared & TDR_EBL1, 0);
        assert_eq!(cleared & TDR_EPC1, 0);
    }

    #[test]
    fn clearing_one_of_several_keeps_triggering_enabled() {
        let mut t = BreakpointTable::new();
        t.tdr_shadow = t.tdr_with_hw_breakpoint_armed(0) | (1 << 25);
        let cleared = t.tdr_with_hw_breakpoint_cleared(0, true);
        assert_ne!(cleared & TDR_EBL1, 0);
    }

    #[test]
    fn watchpoint_write_kind_sets_write_bit_only() {
        let t = BreakpointTable::new();
        let tdr = t.tdr_with_watchpoint_armed(WatchpointKind::Write);
        assert_ne!(tdr & TDR_DRW_WRITE, 0);
        assert_eq!(tdr & TDR_DRW_READ, 0);
    }

    #[test]
    fn watchpoint_access_kind_sets_both_bits() {
        let t = BreakpointTable::new();
        let tdr = t.tdr_with_watchpoint_armed(WatchpointKind::Access);
        assert_eq!(tdr & TDR_DRW_RW, TDR_DRW_RW);
    }

    #[test]
    fn detects_watchpoint_trigger_from_shadow() {
        let mut t = BreakpointTable::new();
        t.watchpoint.active = true;
        t.tdr_shadow = t.tdr_with_watchpoint_armed(WatchpointKind::Write);
        assert!(t.watchpoint_may_have_triggered());
    }

    #[test]
    fn no_trigger_when_watchpoint_inactive() {
        let mut t = BreakpointTable::new();
        t.tdr_shadow = TDR_EAR1 | TDR_TRC_HALT;
        assert!(!t.watchpoint_may_have_triggered());
    }
}
