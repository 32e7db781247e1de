//! Flashloader RPC (component D): uploads the on-target flashloader ELF
//! image into SRAM once per session, then drives it through its
//! parameter-block protocol for each erase/program/verify operation.
//!
//! The loader image itself is an external contract (a fixed binary driven
//! by typed request/response framing) rather than anything this crate
//! generates itself — only the host-side RPC client lives here.

use std::thread::sleep;
use std::time::{Duration, Instant};

use byteorder::{BigEndian, ByteOrder};
use log::{debug, info};
use rusb::UsbContext;

use crate::bdm::{self, mode};
use crate::error::{PodError, Result};
use crate::file_loader::LoadedImage;
use crate::session::PodSession;

pub const PARAMS_BASE: u32 = 0x2000_0000;
pub const DATA_BUFFER_BASE: u32 = 0x2000_0100;
pub const LOADER_CODE_BASE: u32 = 0x2000_0500;
pub const INITIAL_SP: u32 = 0x2000_7FF0;
pub const DATA_BUFFER_SIZE: usize = 1024;

const PARAM_OFFSET_OPERATION: u32 = 0x00;
const PARAM_OFFSET_FLASH_ADDR: u32 = 0x04;
const PARAM_OFFSET_LENGTH: u32 = 0x08;
const PARAM_OFFSET_RESULT: u32 = 0x0C;
const PARAM_OFFSET_STATUS: u32 = 0x10;

/// CSR bit 14: target halted.
const CSR_HALTED_BIT: u32 = 1 << 14;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum Operation {
    Init = 0,
    MassErase = 1,
    SectorErase = 2,
    Program = 3,
    BlankCheck = 4,
    Verify = 5,
}

impl Operation {
    fn timeout(self) -> Duration {
        match self {
            Operation::SectorErase => Duration::from_secs(10),
            Operation::MassErase => Duration::from_secs(30),
            _ => Duration::from_secs(5),
        }
    }
}

/// Result codes the flashloader reports back in the parameter block.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RpcResult {
    Success,
    AccessError,
    ProtectionViolation,
    NotBlank,
    VerifyFailed,
    Timeout,
    UnknownOp,
    Other(u32),
}

impl RpcResult {
    fn from_code(code: u32) -> Self {
        match code {
            0 => RpcResult::Success,
            1 => RpcResult::AccessError,
            2 => RpcResult::ProtectionViolation,
            3 => RpcResult::NotBlank,
            4 => RpcResult::VerifyFailed,
            5 => RpcResult::Timeout,
            0xFF => RpcResult::UnknownOp,
            other => RpcResult::Other(other),
        }
    }

    pub fn is_success(self) -> bool {
        matches!(self, RpcResult::Success)
    }
}

/// Tracks whether the loader image has already been uploaded this
/// session — upload is idempotent, so callers don't need to know.
pub struct FlashloaderRpc {
    loaded: bool,
}

impl FlashloaderRpc {
    pub fn new() -> Self {
        FlashloaderRpc { loaded: false }
    }

    /// Uploads the loader image if it hasn't been uploaded yet this
    /// session. `image` must already be the flattened, gap-zero-filled
    /// segment set produced by [`crate::file_loader::load`].
    pub fn ensure_loaded(&mut self, session: &mut PodSession, image: &LoadedImage) -> Result<()> {
        if self.loaded {
            return Ok(());
        }
        crate::bringup::validate_sram(&mut session.channel)?;
        info!(
            "uploading flashloader image ({} bytes) to 0x{:08x}",
            image.bytes.len(),
            LOADER_CODE_BASE
        );
        bdm::bulk_download_chunked(&mut session.channel, LOADER_CODE_BASE, &image.bytes)?;
        self.loaded = true;
        Ok(())
    }

    /// Runs one RPC call: writes the parameter block, sets PC to the
    /// loader entry point, resumes, polls for halt, and reads back the
    /// result and CFMUSTAT.
    pub fn call(
        &mut self,
        session: &mut PodSession,
        entry_point: u32,
        op: Operation,
        flash_addr: u32,
        length: u32,
    ) -> Result<()> {
        session.mark_flashing();
        crate::bringup::memory_window_setup(&mut session.channel)?;

        let ch = &mut session.channel;
        write_param(ch, PARAM_OFFSET_OPERATION, op as u32)?;
        write_param(ch, PARAM_OFFSET_FLASH_ADDR, flash_addr)?;
        write_param(ch, PARAM_OFFSET_LENGTH, length)?;
        write_param(ch, PARAM_OFFSET_RESULT, 0xFFFF_FFFF)?;
        write_param(ch, PARAM_OFFSET_STATUS, 0)?;

        bdm::write_pc(ch, entry_point)?;
        bdm::write_bdm_reg(ch, 0x080E, 0x2700)?;
        bdm::bdm_go(ch)?;

        let halted = wait_for_halt_csr(ch, op.timeout())?;
        if !halted {
            bdm::enter_mode(ch, mode::STANDARD_DEBUG)?;
            session.mark_unknown();
            return Err(PodError::FlashResult {
                result: 5, // RESULT_ERROR_TIMEOUT
                cfmustat: 0,
            });
        }

        let result = read_param(ch, PARAM_OFFSET_RESULT)?;
        let status = read_param(ch, PARAM_OFFSET_STATUS)? as u8;
        bdm::enter_mode(ch, mode::STANDARD_DEBUG)?;
        session.mark_halted();

        debug!("flashloader op {:?} -> result=0x{:08x} cfmustat=0x{:02x}", op, result, status);
        if RpcResult::from_code(result).is_success() {
            Ok(())
        } else {
            Err(PodError::FlashResult { result, cfmustat: status })
        }
    }
}

impl Default for FlashloaderRpc {
    fn default() -> Self {
        Self::new()
    }
}

fn write_param<T: UsbContext>(ch: &mut crate::usb::UsbChannel<T>, offset: u32, value: u32) -> Result<()> {
    bdm::write_word_0719(ch, PARAMS_BASE + offset, value)
}

fn read_param<T: UsbContext>(ch: &mut crate::usb::UsbChannel<T>, offset: u32) -> Result<u32> {
    bdm::read_sram_longword(ch, PARAMS_BASE + offset)
}

/// Writes `data` into the loader's 1 KB data buffer ahead of a `Program`
/// or `Verify` call. `data.len()` must not exceed [`DATA_BUFFER_SIZE`].
pub fn stage_data_buffer<T: UsbContext>(ch: &mut crate::usb::UsbChannel<T>, data: &[u8]) -> Result<()> {
    if data.len() > DATA_BUFFER_SIZE {
        return Err(PodError::OutOfRange(format!(
            "{} bytes exceeds {} byte data buffer",
            data.len(),
            DATA_BUFFER_SIZE
        )));
    }
    for (i, word) in data.chunks(4).enumerate() {
        let mut padded = [0xFFu8; 4];
        padded[..word.len()].copy_from_slice(word);
        let value = BigEndian::read_u32(&padded);
        bdm::write_word_0719(ch, DATA_BUFFER_BASE + (i as u32) * 4, value)?;
    }
    Ok(())
}

/// Polls the BDM CSR once per second for the halted bit, up to `timeout`.
fn wait_for_halt_csr<T: UsbContext>(
    ch: &mut crate::usb::UsbChannel<T>,
    timeout: Duration,
) -> Result<bool> {
    let start = Instant::now();
    loop {
        let csr = bdm::read_reg_07_13(ch, 0x2D80)?;
        if csr & CSR_HALTED_BIT != 0 {
            return Ok(true);
        }
        if start.elapsed() >= timeout {
            return Ok(false);
        }
        sleep(Duration::from_secs(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_result_codes() {
        assert_eq!(RpcResult::from_code(0), RpcResult::Success);
        assert_eq!(RpcResult::from_code(3), RpcResult::NotBlank);
        assert_eq!(RpcResult::from_code(0xFF), RpcResult::UnknownOp);
        assert_eq!(RpcResult::from_code(42), RpcResult::Other(42));
    }

    #[test]
    fn per_operation_timeouts_match_spec() {
        assert_eq!(Operation::SectorErase.timeout(), Duration::from_secs(10));
        assert_eq!(Operation::MassErase.timeout(), Duration::from_secs(30));
        assert_eq!(Operation::Program.timeout(), Duration::from_secs(5));
    }

    #[test]
    fn only_success_is_success() {
        assert!(RpcResult::Success.is_success());
        assert!(!RpcResult::VerifyFailed.is_success());
    }
}
