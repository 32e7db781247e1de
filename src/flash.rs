//! Flash Programming Engine (component E): drives the flashloader RPC
//! (component D) through erase/program/verify operations over the
//! 256 KB internal flash, tracking which of its 2 KB logical sectors
//! are known-erased so repeated `vFlashErase` calls from GDB don't
//! re-erase sectors unnecessarily.

use log::info;

use crate::error::{PodError, Result};
use crate::file_loader::LoadedImage;
use crate::flashloader::{self, FlashloaderRpc, Operation, DATA_BUFFER_SIZE};
use crate::session::PodSession;

pub const FLASH_BASE: u32 = 0x0000_0000;
pub const FLASH_SIZE: u32 = 256 * 1024;
pub const SECTOR_SIZE: u32 = 2 * 1024;
pub const SECTOR_COUNT: usize = (FLASH_SIZE / SECTOR_SIZE) as usize;

/// Owns the flashloader RPC client and the erased-sector bitmap. One
/// instance lives for the lifetime of a debug session; `init()` must
/// run (ensuring the loader is uploaded) before any other operation.
pub struct FlashEngine {
    rpc: FlashloaderRpc,
    loader_entry: u32,
    erased_sectors: [bool; SECTOR_COUNT],
}

impl FlashEngine {
    pub fn new() -> Self {
        FlashEngine {
            rpc: FlashloaderRpc::new(),
            loader_entry: flashloader::LOADER_CODE_BASE,
            erased_sectors: [false; SECTOR_COUNT],
        }
    }

    /// Uploads the flashloader image (if not already uploaded this
    /// session) and remembers its entry point for subsequent RPC calls.
    pub fn init(&mut self, session: &mut PodSession, loader_image: &LoadedImage) -> Result<()> {
        self.rpc.ensure_loaded(session, loader_image)?;
        self.loader_entry = loader_image.entry;
        Ok(())
    }

    pub fn mass_erase(&mut self, session: &mut PodSession) -> Result<()> {
        info!("mass-erasing flash");
        self.rpc
            .call(session, self.loader_entry, Operation::MassErase, FLASH_BASE, FLASH_SIZE)?;
        self.erased_sectors = [true; SECTOR_COUNT];
        Ok(())
    }

    /// Erases the 2 KB sector containing `addr`, unless it's already
    /// known-erased. `addr` must fall within the flash address range.
    pub fn erase_sector_containing(&mut self, session: &mut PodSession, addr: u32) -> Result<()> {
        let idx = sector_index(addr)?;
        if self.erased_sectors[idx] {
            return Ok(());
        }
        let sector_addr = FLASH_BASE + (idx as u32) * SECTOR_SIZE;
        self.rpc.call(
            session,
            self.loader_entry,
            Operation::SectorErase,
            sector_addr,
            SECTOR_SIZE,
        )?;
        self.erased_sectors[idx] = true;
        Ok(())
    }

    /// Erases every sector touched by `[addr, addr+len)`, used by
    /// `vFlashErase`.
    pub fn erase_range(&mut self, session: &mut PodSession, addr: u32, len: u32) -> Result<()> {
        bounds_check(addr, len)?;
        if len == 0 {
            return Ok(());
        }
        let first = sector_index(addr)?;
        let last = sector_index(addr + len - 1)?;
        for idx in first..=last {
            let sector_addr = FLASH_BASE + (idx as u32) * SECTOR_SIZE;
            if !self.erased_sectors[idx] {
                self.rpc.call(
                    session,
                    self.loader_entry,
                    Operation::SectorErase,
                    sector_addr,
                    SECTOR_SIZE,
                )?;
                self.erased_sectors[idx] = true;
            }
        }
        Ok(())
    }

    /// Programs `data` at `addr`, chunked to the loader's 1 KB data
    /// buffer. The sectors touched are marked no-longer-erased — the
    /// caller is responsible for erasing first (via `vFlashErase` or
    /// `--erase`); this method does not implicitly erase.
    pub fn program(&mut self, session: &mut PodSession, addr: u32, data: &[u8]) -> Result<()> {
        bounds_check(addr, data.len() as u32)?;
        for (chunk, chunk_addr) in chunks(addr, data) {
            flashloader::stage_data_buffer(&mut session.channel, chunk)?;
            self.rpc.call(
                session,
                self.loader_entry,
                Operation::Program,
                chunk_addr,
                chunk.len() as u32,
            )?;
            if let Ok(idx) = sector_index(chunk_addr) {
                self.erased_sectors[idx] = false;
            }
        }
        Ok(())
    }

    pub fn blank_check(&mut self, session: &mut PodSession, addr: u32, len: u32) -> Result<bool> {
        bounds_check(addr, len)?;
        match self
            .rpc
            .call(session, self.loader_entry, Operation::BlankCheck, addr, len)
        {
            Ok(()) => Ok(true),
            Err(PodError::FlashResult { result: 3, .. }) => Ok(false), // RpcResult::NotBlank
            Err(other) => Err(other),
        }
    }

    /// Verifies `data` against flash content at `addr`. Returns
    /// `Ok(false)` for a loader-reported mismatch (result code 4,
    /// `VerifyFailed`) rather than an error — only protocol/timeout
    /// failures propagate as `Err`.
    pub fn verify(&mut self, session: &mut PodSession, addr: u32, data: &[u8]) -> Result<bool> {
        bounds_check(addr, data.len() as u32)?;
        for (chunk, chunk_addr) in chunks(addr, data) {
            flashloader::stage_data_buffer(&mut session.channel, chunk)?;
            match self.rpc.call(
                session,
                self.loader_entry,
                Operation::Verify,
                chunk_addr,
                chunk.len() as u32,
            ) {
                Ok(()) => continue,
                Err(PodError::FlashResult { result: 4, .. }) => return Ok(false),
                Err(other) => return Err(other),
            }
        }
        Ok(true)
    }

    /// Convenience for standalone `--program [--verify]` CLI mode:
    /// erases the touched range, programs it, and optionally verifies.
    pub fn program_binary(
        &mut self,
        session: &mut PodSession,
        base_addr: u32,
        data: &[u8],
        verify: bool,
    ) -> Result<()> {
        self.erase_range(session, base_addr, data.len() as u32)?;
        self.program(session, base_addr, data)?;
        if verify && !self.verify(session, base_addr, data)? {
            return Err(PodError::FlashResult { result: 4, cfmustat: 0 });
        }
        Ok(())
    }
}

impl Default for FlashEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn sector_index(addr: u32) -> Result<usize> {
    if addr >= FLASH_BASE + FLASH_SIZE {
        return Err(PodError::OutOfRange(format!(
            "address 0x{:08x} is outside flash range 0x{:08x}..0x{:08x}",
            addr,
            FLASH_BASE,
            FLASH_BASE + FLASH_SIZE
        )));
    }
    Ok(((addr - FLASH_BASE) / SECTOR_SIZE) as usize)
}

fn bounds_check(addr: u32, len: u32) -> Result<()> {
    let end = addr
        .checked_add(len)
        .ok_or_else(|| PodError::OutOfRange(format!("address 0x{:08x} + {} overflows u32", addr, len)))?;
    if addr < FLASH_BASE || end > FLASH_BASE + FLASH_SIZE {
        return Err(PodError::OutOfRange(format!(
            "range 0x{:08x}..0x{:08x} is outside flash range 0x{:08x}..0x{:08x}",
            addr,
            end,
            FLASH_BASE,
            FLASH_BASE + FLASH_SIZE
        )));
    }
    Ok(())
}

/// Splits `data` into `<=DATA_BUFFER_SIZE` chunks, pairing each with its
/// base address in flash.
fn chunks(addr: u32, data: &[u8]) -> impl Iterator<Item = (&[u8], u32)> {
    data.chunks(DATA_BUFFER_SIZE)
        .enumerate()
        .map(move |(i, chunk)| (chunk, addr + (i * DATA_BUFFER_SIZE) as u32))
}

/// Pads `data` up to the next 4-byte boundary with `0xFF`, matching the
/// flashloader's word-aligned program/verify contract for a final
/// partial word.
pub fn pad_to_word(data: &[u8]) -> Vec<u8> {
    let mut out = data.to_vec();
    while out.len() % 4 != 0 {
        out.push(0xFF);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sector_index_maps_addresses() {
        assert_eq!(sector_index(0).unwrap(), 0);
        assert_eq!(sector_index(SECTOR_SIZE).unwrap(), 1);
        assert_eq!(sector_index(FLASH_SIZE - 1).unwrap(), SECTOR_COUNT - 1);
        assert!(sector_index(FLASH_SIZE).is_err());
    }

    #[test]
    fn bounds_check_rejects_out_of_range() {
        assert!(bounds_check(0, FLASH_SIZE).is_ok());
        assert!(bounds_check(0, FLASH_SIZE + 1).is_err());
        assert!(bounds_check(FLASH_SIZE - 1, 2).is_err());
        assert!(bounds_check(u32::MAX, 1).is_err());
    }

    #[test]
    fn chunks_splits_on_data_buffer_size_boundary() {
        let data = vec![0u8; DATA_BUFFER_SIZE + 10];
        let parts: Vec<_> = chunks(0x1000, &data).collect();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].0.len(), DATA_BUFFER_SIZE);
        assert_eq!(parts[0].1, 0x1000);
        assert_eq!(parts[1].0.len(), 10);
        assert_eq!(parts[1].1, 0x1000 + DATA_BUFFER_SIZE as u32);
    }

    #[test]
    fn pad_to_word_fills_with_0xff() {
        assert_eq!(pad_to_word(&[1, 2, 3]), vec![1, 2, 3, 0xFF]);
        assert_eq!(pad_to_word(&[1, 2, 3, 4]), vec![1, 2, 3, 4]);
    }

    #[test]
    fn new_engine_has_no_erased_sectors() {
        let engine = FlashEngine::new();
        assert!(engine.erased_sectors.iter().all(|&e| !e));
    }
}
