//! Typed wrappers for every pod command (component B): mode entry,
//! register/memory read/write, debug-register writes, GO/freeze/halt, bulk
//! download. Wraps the raw [`crate::usb`] transport in small,
//! single-purpose command functions instead of one do-everything
//! dispatcher.

use std::time::Duration;

use byteorder::{BigEndian, ByteOrder};
use rusb::UsbContext;

use crate::error::{PodError, Result};
use crate::usb::{extract_sram_longword, UsbChannel};

/// BDM mode identifiers used by [`enter_mode`].
pub mod mode {
    pub const FLASH_OP: u8 = 0xFC;
    pub const STANDARD_DEBUG: u8 = 0xF8;
    pub const ALTERNATIVE: u8 = 0xF0;
}

pub const DEBUG_REG_WDMREG_PREFIX: u8 = 0x2C;
pub const DEBUG_REG_WDMREG_BASE: u8 = 0x42;

const WINDOW_BASE_READ: [u8; 2] = [0x29, 0x80];
const WINDOW_BASE_WRITE: [u8; 2] = [0x28, 0x80];

/// `07 01 <mode>` — enter a BDM mode.
pub fn enter_mode<T: UsbContext>(ch: &mut UsbChannel<T>, mode: u8) -> Result<()> {
    ch.send_aa(0x07, 0x01, &[mode])?;
    Ok(())
}

/// `07 0A 00` — enable memory access. Bring-up issues this twice.
pub fn enable_memory_access<T: UsbContext>(ch: &mut UsbChannel<T>) -> Result<()> {
    ch.send_aa(0x07, 0x0A, &[0x00])?;
    Ok(())
}

/// `07 13 21{8|A}n` — read a CPU D/A register. D0-D7 live at `0x2180+n`,
/// A0-A7 at `0x2188+n`. The 32-bit value is embedded at offsets 5..9 of
/// the response.
pub fn read_reg_07_13<T: UsbContext>(ch: &mut UsbChannel<T>, bdm_reg: u16) -> Result<u32> {
    let mut payload = [0u8; 2];
    BigEndian::write_u16(&mut payload, bdm_reg);
    let n = ch.send_aa(0x07, 0x13, &payload)?;
    if n < 9 {
        return Err(PodError::ProtocolFraming(format!(
            "07 13 response too short ({} bytes)",
            n
        )));
    }
    Ok(BigEndian::read_u32(&ch.buf()[5..9]))
}

/// `07 11 2980 00 00 08 {0F|0E}` — read PC (`0F`) or SR (`0E`) via the
/// dedicated read-mode window. Reading PC/SR via `07 13` with opcode
/// `0x298F` returns stale data after a PC write, so this path is
/// mandatory for both.
fn read_via_07_11<T: UsbContext>(ch: &mut UsbChannel<T>, selector: u8) -> Result<u32> {
    let payload = [
        WINDOW_BASE_READ[0],
        WINDOW_BASE_READ[1],
        0x00,
        0x00,
        0x08,
        selector,
    ];
    let n = ch.send_aa(0x07, 0x11, &payload)?;
    if n < 9 {
        return Err(PodError::ProtocolFraming(format!(
            "07 11 response too short ({} bytes)",
            n
        )));
    }
    Ok(BigEndian::read_u32(&ch.buf()[5..9]))
}

pub fn read_pc<T: UsbContext>(ch: &mut UsbChannel<T>) -> Result<u32> {
    read_via_07_11(ch, 0x0F)
}

pub fn read_sr<T: UsbContext>(ch: &mut UsbChannel<T>) -> Result<u32> {
    read_via_07_11(ch, 0x0E)
}

/// `07 14 2880 00 00 reg_hi reg_lo value` — write a CPU/BDM register
/// (window-base `0x28800000`). Writing PC requires the caller to follow up
/// with [`sync`] (`07 12 FFFF`); this function does not do it implicitly
/// because not every write-register caller wants PC's sync semantics
/// forced on every register.
pub fn write_bdm_reg<T: UsbContext>(ch: &mut UsbChannel<T>, reg: u16, value: u32) -> Result<()> {
    // payload layout: window_base(2) 00 00 reg(2) value(4) = 10 bytes total
    let mut payload = [0u8; 10];
    payload[0..2].copy_from_slice(&WINDOW_BASE_WRITE);
    payload[2] = 0x00;
    payload[3] = 0x00;
    BigEndian::write_u16(&mut payload[4..6], reg);
    BigEndian::write_u32(&mut payload[6..10], value);
    ch.send_aa(0x07, 0x14, &payload)?;
    Ok(())
}

/// Writes PC, including the mandatory `07 12 FFFF` sync that follows.
pub fn write_pc<T: UsbContext>(ch: &mut UsbChannel<T>, value: u32) -> Result<()> {
    write_bdm_reg(ch, 0x080F, value)?;
    sync(ch)
}

/// `07 12 FFFF` — sync required after writing PC or any debug register.
pub fn sync<T: UsbContext>(ch: &mut UsbChannel<T>) -> Result<()> {
    ch.send_aa(0x07, 0x12, &[0xFF, 0xFF])?;
    Ok(())
}

/// `07 14 2C (0x42|DRc) 00 00 00 drc value` — Write Debug Module Register.
/// Distinct command shape from [`write_bdm_reg`], used for TDR, PBR0..3,
/// ABLR, ABHR. Always followed by [`sync`].
pub fn write_debug_reg<T: UsbContext>(ch: &mut UsbChannel<T>, drc: u16, value: u32) -> Result<()> {
    let mut payload = [0u8; 10];
    payload[0] = DEBUG_REG_WDMREG_PREFIX;
    payload[1] = DEBUG_REG_WDMREG_BASE | (drc as u8 & 0x1F);
    payload[2] = 0x00;
    payload[3] = 0x00;
    payload[4] = 0x00;
    payload[5] = drc as u8;
    BigEndian::write_u32(&mut payload[6..10], value);
    ch.send_aa(0x07, 0x14, &payload)?;
    sync(ch)
}

/// `07 10 <window>` — memory-window setup step used throughout bring-up.
/// The response format is not documented to be structured, so the drain
/// is required but its contents are never validated beyond the standard
/// header.
pub fn set_memory_window<T: UsbContext>(ch: &mut UsbChannel<T>, window: u16) -> Result<()> {
    let mut payload = [0u8; 2];
    BigEndian::write_u16(&mut payload, window);
    ch.send_aa(0x07, 0x10, &payload)?;
    Ok(())
}

/// `07 16 addr_hi addr_lo d3 d2 d1 d0` — write memory with a 16-bit short
/// address and 32-bit data.
pub fn write_memory_short_addr<T: UsbContext>(
    ch: &mut UsbChannel<T>,
    addr: u16,
    data: u32,
) -> Result<()> {
    let mut payload = [0u8; 6];
    BigEndian::write_u16(&mut payload[0..2], addr);
    BigEndian::write_u32(&mut payload[2..6], data);
    ch.send_aa(0x07, 0x16, &payload)?;
    Ok(())
}

/// `07 16 a3 a2 a1 a0 d3 d2 d1 d0` — write memory with a full 32-bit
/// address and 32-bit data.
pub fn write_memory_long_addr<T: UsbContext>(
    ch: &mut UsbChannel<T>,
    addr: u32,
    data: u32,
) -> Result<()> {
    let mut payload = [0u8; 8];
    BigEndian::write_u32(&mut payload[0..4], addr);
    BigEndian::write_u32(&mut payload[4..8], data);
    ch.send_aa(0x07, 0x16, &payload)?;
    Ok(())
}

/// `07 19 00 04 addr32 data32` — the primary SRAM-word writer used once
/// the memory window is established. Requires the `02 00 00 00 00 02`
/// padding pattern in bytes 16..256 of the outgoing buffer; without it,
/// some pod firmwares silently drop the write.
pub fn write_word_0719<T: UsbContext>(ch: &mut UsbChannel<T>, addr: u32, data: u32) -> Result<()> {
    let mut payload = [0u8; 10];
    payload[0] = 0x00;
    payload[1] = 0x04;
    BigEndian::write_u32(&mut payload[2..6], addr);
    BigEndian::write_u32(&mut payload[6..10], data);
    ch.send_aa_0719(&payload)?;
    Ok(())
}

/// Reads `length` bytes starting at `addr` via `07 17`, the bulk
/// flash/SRAM reader (A's 6-byte-group de-interleaving is handled in
/// [`crate::usb::UsbChannel::read_memory_block`]).
pub fn read_memory<T: UsbContext>(ch: &mut UsbChannel<T>, addr: u32, length: usize) -> Result<Vec<u8>> {
    ch.read_memory_block(addr, length)
}

/// `07 1B <addr:4> <len:2>` — SRAM-verify reader with the pathological
/// `{0,7,9,11}` layout. Returns a single 32-bit value.
pub fn read_sram_longword<T: UsbContext>(ch: &mut UsbChannel<T>, addr: u32) -> Result<u32> {
    let mut payload = [0u8; 6];
    BigEndian::write_u32(&mut payload[0..4], addr);
    BigEndian::write_u16(&mut payload[4..6], 4);
    let n = ch.send_aa(0x07, 0x1B, &payload)?;
    extract_sram_longword(&ch.buf()[5..n])
}

/// `07 02 FC 0C` — resumes the target. No response is expected; reading
/// one here would hang waiting for a packet the pod never sends.
pub fn bdm_go<T: UsbContext>(ch: &mut UsbChannel<T>) -> Result<()> {
    ch.send_aa_no_response(0x07, 0x02, &[0xFC, 0x0C, 0x00])
}

/// `04 7F FE 02` — freeze check. Status byte `0x88` means running;
/// `0x00`/`0x01` means halted; anything else is treated as running. A
/// transport timeout also means "still running", not an error.
pub fn bdm_freeze<T: UsbContext>(ch: &mut UsbChannel<T>) -> Result<bool> {
    let timeout = ch.freeze_check_timeout();
    let n = match ch.send_aa_with_timeout(0x04, 0x7F, &[0xFE, 0x02], timeout)? {
        Some(n) => n,
        None => return Ok(false), // timeout: still running
    };
    if n < 5 {
        return Ok(false);
    }
    let status = ch.buf()[4];
    Ok(status == 0x00 || status == 0x01)
}

/// `04 40 00 01` — forces a halt.
pub fn bdm_halt<T: UsbContext>(ch: &mut UsbChannel<T>) -> Result<()> {
    ch.send_aa(0x04, 0x40, &[0x00, 0x01])?;
    Ok(())
}

/// Uploads `data` to `base_addr` using the chunked (no-response) bulk
/// transfer, 1192 bytes at a time with a 5 ms gap.
pub fn bulk_download_chunked<T: UsbContext>(
    ch: &mut UsbChannel<T>,
    base_addr: u32,
    data: &[u8],
) -> Result<()> {
    ch.send_bb_chunked(base_addr, data)
}

/// Uploads `data` to `addr` as a single transfer that DOES produce a short
/// response, which must be drained.
pub fn bulk_download_single<T: UsbContext>(
    ch: &mut UsbChannel<T>,
    addr: u32,
    data: &[u8],
) -> Result<()> {
    ch.send_bb_single(addr, data)
}

/// Wait up to `timeout_ms` for the target to halt, polling [`bdm_freeze`]
/// roughly every millisecond. Used by the flashloader-RPC poll loop with
/// larger, operation-specific timeouts layered on top by the caller.
pub fn wait_for_halt<T: UsbContext>(ch: &mut UsbChannel<T>, timeout: Duration) -> Result<bool> {
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if bdm_freeze(ch)? {
            return Ok(true);
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_base_read_constant_matches_spec() {
        assert_eq!(WINDOW_BASE_READ, [0x29, 0x80]);
    }

    #[test]
    fn window_base_write_constant_matches_spec() {
        assert_eq!(WINDOW_BASE_WRITE, [0x28, 0x80]);
    }

    #[test]
    fn wdmreg_register_selector_masks_to_five_bits() {
        let drc = 0x07u16;
        let selector = DEBUG_REG_WDMREG_BASE | (drc as u8 & 0x1F);
        assert_eq!(selector, 0x47);
    }
}
