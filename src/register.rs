//! GDB-visible register numbering for the ColdFire register file.
//!
//! Fixed order: `D0..D7, A0..A7, SR, PC` — 18 registers, 32 bits each. This
//! is the order GDB's m68k target description expects and the order `g`/`G`
//! serialize registers in.

pub const NUM_REGISTERS: usize = 18;

pub const REG_D0: usize = 0;
pub const REG_D7: usize = 7;
pub const REG_A0: usize = 8;
pub const REG_A7: usize = 15;
pub const REG_SR: usize = 16;
pub const REG_PC: usize = 17;

/// BDM store-register addresses (write path), `07 14` window-base
/// `0x28800000`: D0..D7 at `0x0180+n`, A0..A7 at `0x0188+n`, SR at `0x080E`.
pub fn write_bdm_reg_addr(reg: usize) -> Option<u16> {
    match reg {
        REG_D0..=REG_D7 => Some(0x0180 + reg as u16),
        REG_A0..=REG_A7 => Some(0x0188 + (reg - REG_A0) as u16),
        REG_SR => Some(0x080E),
        _ => None,
    }
}

/// BDM read-register addresses (read path via `07 13`), window-base
/// `0x2180`/`0x2188`: D0..D7 at `0x2180+n`, A0..A7 at `0x2188+n`. PC and SR
/// are *not* read through this path — they require the `07 11` window.
pub fn read_bdm_reg_addr(reg: usize) -> Option<u16> {
    match reg {
        REG_D0..=REG_D7 => Some(0x2180 + reg as u16),
        REG_A0..=REG_A7 => Some(0x2188 + (reg - REG_A0) as u16),
        _ => None,
    }
}

/// GDB queries register indices beyond our 18 (floating point, mostly)
/// that don't exist on this chip. Returns the zero-filled hex payload GDB
/// expects for each known range, or `None` for anything else (which
/// should get an empty response).
pub fn fallback_payload_for_unknown(reg: usize) -> Option<&'static str> {
    match reg {
        18..=25 => Some("000000000000000000000000"), // FP0-7: 96-bit extended
        26..=28 => Some("00000000"),                  // FPCONTROL/FPSTATUS/FPIADDR
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_data_registers() {
        assert_eq!(write_bdm_reg_addr(REG_D0), Some(0x0180));
        assert_eq!(write_bdm_reg_addr(REG_D7), Some(0x0187));
        assert_eq!(read_bdm_reg_addr(REG_D0), Some(0x2180));
        assert_eq!(read_bdm_reg_addr(REG_D7), Some(0x2187));
    }

    #[test]
    fn maps_address_registers() {
        assert_eq!(write_bdm_reg_addr(REG_A0), Some(0x0188));
        assert_eq!(write_bdm_reg_addr(REG_A7), Some(0x018F));
        assert_eq!(read_bdm_reg_addr(REG_A0), Some(0x2188));
        assert_eq!(read_bdm_reg_addr(REG_A7), Some(0x218F));
    }

    #[test]
    fn maps_sr_write_only() {
        assert_eq!(write_bdm_reg_addr(REG_SR), Some(0x080E));
        assert_eq!(read_bdm_reg_addr(REG_SR), None);
    }

    #[test]
    fn pc_has_no_generic_bdm_mapping() {
        assert_eq!(write_bdm_reg_addr(REG_PC), None);
        assert_eq!(read_bdm_reg_addr(REG_PC), None);
    }

    #[test]
    fn fallback_payloads_cover_fp_range() {
        assert_eq!(
            fallback_payload_for_unknown(18),
            Some("000000000000000000000000")
        );
        assert_eq!(fallback_payload_for_unknown(26), Some("00000000"));
        assert_eq!(fallback_payload_for_unknown(29), None);
    }
}
