//! Debug Coordinator (component H): the target run/halt state machine,
//! register file view, breakpoint/watchpoint tables, the `qCRC` path, and
//! the `vFlash*` session buffer. Translates inbound RSP packets (component
//! G) into calls on the BDM/bring-up/flashloader/flash layers below it.
//!
//! Kept free of any socket code — [`crate::server`] owns the TCP loop and
//! calls [`DebugCoordinator::handle_packet`] once per extracted packet.

use std::thread::sleep;
use std::time::{Duration, Instant};

use byteorder::{BigEndian, ByteOrder};
use log::{debug, warn};

use crate::bdm::{self, mode};
use crate::breakpoints::{self, HwBreakpoint, SwBreakpoint, Watchpoint, WatchpointKind, WatchpointKindStorage};
use crate::bringup::{self, ChipId};
use crate::error::{PodError, Result};
use crate::file_loader::LoadedImage;
use crate::flash::FlashEngine;
use crate::register::{self, NUM_REGISTERS, REG_A7, REG_PC, REG_SR};
use crate::session::PodSession;

const CSR_ADDR: u16 = 0x2D80;
/// Single-step-mode enable bit in the BDM core status register.
const CSR_SSM_BIT: u32 = 1 << 4;
/// BKPT (hardware breakpoint hit) bit in the CSR, polled during `c`.
const CSR_BKPT_BIT: u32 = 1 << 24;

const SW_BREAKPOINT_OPCODE: u16 = 0x4AC8; // ColdFire HALT
const CONTINUE_TIMEOUT: Duration = Duration::from_secs(5);
const STEP_TIMEOUT: Duration = Duration::from_millis(100);
const VFLASH_CAPACITY: usize = crate::flash::FLASH_SIZE as usize;

/// Staged buffer for one `vFlashErase`/`vFlashWrite*`/`vFlashDone` cycle.
struct VFlashSession {
    base_addr: u32,
    bytes: Vec<u8>,
    write_len: usize,
}

pub struct DebugCoordinator {
    session: PodSession,
    chip: ChipId,
    flash: FlashEngine,
    loader_image: LoadedImage,
    vflash: Option<VFlashSession>,
    vflash_inited: bool,
    step_count: u8,
}

impl DebugCoordinator {
    pub fn new(session: PodSession, chip: ChipId, loader_image: LoadedImage) -> Self {
        DebugCoordinator {
            session,
            chip,
            flash: FlashEngine::new(),
            loader_image,
            vflash: None,
            vflash_inited: false,
            step_count: 0,
        }
    }

    pub fn chip(&self) -> ChipId {
        self.chip
    }

    pub fn session_mut(&mut self) -> &mut PodSession {
        &mut self.session
    }

    pub fn flash_mut(&mut self) -> &mut FlashEngine {
        &mut self.flash
    }

    pub fn loader_image(&self) -> &LoadedImage {
        &self.loader_image
    }

    /// Standalone `--erase` CLI mode: uploads the flashloader (if needed)
    /// and mass-erases the whole chip.
    pub fn mass_erase(&mut self) -> Result<()> {
        self.flash.init(&mut self.session, &self.loader_image)?;
        self.flash.mass_erase(&mut self.session)
    }

    /// Standalone `--program FILE [--base ADDR] [--verify]` CLI mode:
    /// uploads the flashloader (if needed), erases the touched range,
    /// programs it, and optionally verifies.
    pub fn program_file(&mut self, base_addr: u32, data: &[u8], verify: bool) -> Result<()> {
        self.flash.init(&mut self.session, &self.loader_image)?;
        self.flash.program_binary(&mut self.session, base_addr, data, verify)
    }

    /// Populates the register-read fallback cache from the reset vectors at
    /// the base of flash, per §4.H — called once right after bring-up.
    pub fn seed_register_cache(&mut self) -> Result<()> {
        let vectors = bdm::read_memory(&mut self.session.channel, 0, 8)?;
        let sp = BigEndian::read_u32(&vectors[0..4]);
        let pc = BigEndian::read_u32(&vectors[4..8]);
        self.session.seed_register_cache(sp, pc);
        Ok(())
    }

    /// `k` (kill) gets no reply at all per the GDB RSP convention; the
    /// server closes the connection immediately instead of calling
    /// [`Self::handle_packet`].
    pub fn is_kill(payload: &[u8]) -> bool {
        payload == b"k"
    }

    /// Services one already-unescaped RSP packet payload and returns the
    /// raw (unescaped) reply payload. The caller is responsible for
    /// escaping and framing it as `$…#cc`.
    pub fn handle_packet(&mut self, payload: &[u8]) -> Vec<u8> {
        match self.dispatch(payload) {
            Ok(reply) => reply,
            Err(e) => {
                warn!("packet error: {}", e);
                format!("E{:02x}", e.gdb_errno()).into_bytes()
            }
        }
    }

    fn dispatch(&mut self, payload: &[u8]) -> Result<Vec<u8>> {
        if payload.is_empty() {
            return Ok(Vec::new());
        }
        match payload[0] {
            b'?' => Ok(b"S05".to_vec()),
            b'g' => self.cmd_read_all_registers(),
            b'G' => self.cmd_write_all_registers(&payload[1..]),
            b'p' => self.cmd_read_register(&payload[1..]),
            b'P' => self.cmd_write_register(&payload[1..]),
            b'm' => self.cmd_read_memory(&payload[1..]),
            b'M' => self.cmd_write_memory(&payload[1..]),
            b'c' => self.cmd_continue(),
            b's' => self.cmd_step(),
            b'H' => Ok(b"OK".to_vec()),
            b'D' => Ok(b"OK".to_vec()),
            b'k' => Ok(Vec::new()), // unreachable: server intercepts via is_kill
            b'Z' => self.cmd_set_break(&payload[1..]),
            b'z' => self.cmd_clear_break(&payload[1..]),
            b'q' => self.cmd_query(&payload[1..]),
            b'v' => self.cmd_v(&payload[1..]),
            _ => Ok(Vec::new()),
        }
    }

    fn cmd_v(&mut self, rest: &[u8]) -> Result<Vec<u8>> {
        if rest.starts_with(b"Cont;c") {
            return self.cmd_continue();
        }
        if rest.starts_with(b"Cont;s") {
            return self.cmd_step();
        }
        if let Some(body) = rest.strip_prefix(b"FlashErase:") {
            return self.cmd_vflash_erase(body);
        }
        if let Some(body) = rest.strip_prefix(b"FlashWrite:") {
            return self.cmd_vflash_write(body);
        }
        if rest == b"FlashDone" {
            return self.cmd_vflash_done();
        }
        Ok(Vec::new())
    }

    fn cmd_query(&mut self, rest: &[u8]) -> Result<Vec<u8>> {
        if rest.starts_with(b"Supported") {
            return Ok(b"PacketSize=1000;qXfer:features:read+;qXfer:memory-map:read+;vFlash+".to_vec());
        }
        if rest == b"Attached" {
            return Ok(b"1".to_vec());
        }
        if rest == b"C" {
            return Ok(b"QC1".to_vec());
        }
        if rest.starts_with(b"fThreadInfo") {
            return Ok(b"m1".to_vec());
        }
        if rest.starts_with(b"sThreadInfo") {
            return Ok(b"l".to_vec());
        }
        if let Some(spec) = rest.strip_prefix(b"Xfer:features:read:target.xml:") {
            let spec = std::str::from_utf8(spec).map_err(bad_arg)?;
            return Ok(qxfer_reply(target_xml(), spec));
        }
        if let Some(spec) = rest.strip_prefix(b"Xfer:memory-map:read:") {
            let spec = std::str::from_utf8(spec).map_err(bad_arg)?;
            return Ok(qxfer_reply(memory_map_xml(), spec));
        }
        if let Some(body) = rest.strip_prefix(b"CRC:") {
            return self.cmd_crc(body);
        }
        if let Some(body) = rest.strip_prefix(b"Rcmd,") {
            return self.cmd_monitor(body);
        }
        Ok(Vec::new())
    }

    // --- registers -------------------------------------------------------

    fn read_register(&mut self, reg: usize) -> Result<u32> {
        let ch = &mut self.session.channel;
        match reg {
            REG_PC => bdm::read_pc(ch),
            REG_SR => bdm::read_sr(ch),
            REG_A7 => {
                let addr = register::read_bdm_reg_addr(reg);
                let read = addr.and_then(|a| bdm::read_reg_07_13(ch, a).ok());
                match read {
                    Some(v) if v != 0 => Ok(v),
                    _ => Ok(self.session.cached_sp.unwrap_or(0)),
                }
            }
            _ => {
                let addr = register::read_bdm_reg_addr(reg)
                    .ok_or_else(|| PodError::BadArgument(format!("register {} has no BDM read mapping", reg)))?;
                bdm::read_reg_07_13(ch, addr)
            }
        }
    }

    fn write_register(&mut self, reg: usize, value: u32) -> Result<()> {
        let ch = &mut self.session.channel;
        if reg == REG_PC {
            bdm::write_pc(ch, value)
        } else {
            let addr = register::write_bdm_reg_addr(reg)
                .ok_or_else(|| PodError::BadArgument(format!("register {} has no BDM write mapping", reg)))?;
            bdm::write_bdm_reg(ch, addr, value)
        }
    }

    fn cmd_read_all_registers(&mut self) -> Result<Vec<u8>> {
        let mut out = String::with_capacity(NUM_REGISTERS * 8);
        for reg in 0..NUM_REGISTERS {
            out.push_str(&hex_u32(self.read_register(reg)?));
        }
        Ok(out.into_bytes())
    }

    fn cmd_write_all_registers(&mut self, rest: &[u8]) -> Result<Vec<u8>> {
        let s = std::str::from_utf8(rest).map_err(bad_arg)?;
        for (reg, chunk) in s.as_bytes().chunks(8).enumerate().take(NUM_REGISTERS) {
            let chunk = std::str::from_utf8(chunk).map_err(bad_arg)?;
            let value = u32::from_str_radix(chunk, 16).map_err(bad_arg)?;
            self.write_register(reg, value)?;
        }
        Ok(b"OK".to_vec())
    }

    fn cmd_read_register(&mut self, rest: &[u8]) -> Result<Vec<u8>> {
        let s = std::str::from_utf8(rest).map_err(bad_arg)?;
        let reg = usize::from_str_radix(s.trim(), 16).map_err(bad_arg)?;
        if reg < NUM_REGISTERS {
            Ok(hex_u32(self.read_register(reg)?).into_bytes())
        } else if let Some(fallback) = register::fallback_payload_for_unknown(reg) {
            Ok(fallback.as_bytes().to_vec())
        } else {
            Ok(Vec::new())
        }
    }

    fn cmd_write_register(&mut self, rest: &[u8]) -> Result<Vec<u8>> {
        let s = std::str::from_utf8(rest).map_err(bad_arg)?;
        let (reg_s, val_s) = s.split_once('=').ok_or_else(|| PodError::BadArgument("P missing '='".into()))?;
        let reg = usize::from_str_radix(reg_s, 16).map_err(bad_arg)?;
        let value = u32::from_str_radix(val_s, 16).map_err(bad_arg)?;
        if reg < NUM_REGISTERS {
            self.write_register(reg, value)?;
        }
        Ok(b"OK".to_vec())
    }

    // --- memory ------------------------------------------------------------

    fn cmd_read_memory(&mut self, rest: &[u8]) -> Result<Vec<u8>> {
        let s = std::str::from_utf8(rest).map_err(bad_arg)?;
        let (addr, len) = parse_addr_len(s)?;
        let data = bdm::read_memory(&mut self.session.channel, addr, len as usize)?;
        Ok(hex_encode(&data).into_bytes())
    }

    fn cmd_write_memory(&mut self, rest: &[u8]) -> Result<Vec<u8>> {
        let s = std::str::from_utf8(rest).map_err(bad_arg)?;
        let (addr_len, hex_data) = s.split_once(':').ok_or_else(|| PodError::BadArgument("M missing ':'".into()))?;
        let (addr, _len) = parse_addr_len(addr_len)?;
        let data = hex_decode(hex_data)?;
        write_memory_words(&mut self.session.channel, addr, &data)
    }

    // --- execution control ---------------------------------------------------

    fn cmd_continue(&mut self) -> Result<Vec<u8>> {
        {
            let ch = &mut self.session.channel;
            bdm::enter_mode(ch, mode::STANDARD_DEBUG)?;
            bdm::bdm_go(ch)?;
        }
        self.session.mark_running();

        let start = Instant::now();
        let mut elapsed = Duration::ZERO;
        let halted = loop {
            if bdm::bdm_freeze(&mut self.session.channel)? {
                break true;
            }
            if elapsed.as_millis() % 10 == 0 {
                if let Ok(csr) = bdm::read_reg_07_13(&mut self.session.channel, CSR_ADDR) {
                    if csr & CSR_BKPT_BIT != 0 {
                        break true;
                    }
                }
            }
            if elapsed >= CONTINUE_TIMEOUT {
                break false;
            }
            sleep(Duration::from_millis(1));
            elapsed = start.elapsed();
        };

        if !halted {
            bdm::bdm_halt(&mut self.session.channel)?;
            bdm::enter_mode(&mut self.session.channel, mode::STANDARD_DEBUG)?;
            let _ = bdm::bdm_freeze(&mut self.session.channel)?;
        }
        self.session.mark_halted();

        if self.session.breakpoints.watchpoint_may_have_triggered() {
            Ok(format!("T05watch:{:08x};", self.session.breakpoints.watchpoint.addr).into_bytes())
        } else {
            Ok(b"S05".to_vec())
        }
    }

    fn cmd_step(&mut self) -> Result<Vec<u8>> {
        let pc = bdm::read_pc(&mut self.session.channel)?;
        let csr = bdm::read_reg_07_13(&mut self.session.channel, CSR_ADDR)?;
        bdm::write_bdm_reg(&mut self.session.channel, CSR_ADDR, csr | CSR_SSM_BIT)?;
        bdm::bdm_go(&mut self.session.channel)?;

        let halted = bdm::wait_for_halt(&mut self.session.channel, STEP_TIMEOUT)?;
        if !halted {
            bdm::bdm_halt(&mut self.session.channel)?;
        }
        let csr_after = bdm::read_reg_07_13(&mut self.session.channel, CSR_ADDR)?;
        bdm::write_bdm_reg(&mut self.session.channel, CSR_ADDR, csr_after & !CSR_SSM_BIT)?;
        self.session.mark_halted();
        debug!("single-step from pc=0x{:08x}", pc);

        self.step_count += 1;
        if self.step_count >= 2 {
            let pc_now = bdm::read_pc(&mut self.session.channel)?;
            bdm::enter_mode(&mut self.session.channel, mode::STANDARD_DEBUG)?;
            bdm::enter_mode(&mut self.session.channel, mode::ALTERNATIVE)?;
            bdm::enter_mode(&mut self.session.channel, mode::STANDARD_DEBUG)?;
            bdm::write_pc(&mut self.session.channel, pc_now)?;
            self.step_count = 0;
        }
        Ok(b"S05".to_vec())
    }

    // --- breakpoints / watchpoints -------------------------------------------

    fn cmd_set_break(&mut self, rest: &[u8]) -> Result<Vec<u8>> {
        let s = std::str::from_utf8(rest).map_err(bad_arg)?;
        let (ztype, addr, kind) = parse_break_spec(s)?;
        match ztype {
            0 => self.set_breakpoint_prefer_hw(addr),
            1 => self.set_hw_breakpoint(addr),
            2 => self.set_watchpoint(addr, kind, WatchpointKind::Write),
            3 => self.set_watchpoint(addr, kind, WatchpointKind::Read),
            4 => self.set_watchpoint(addr, kind, WatchpointKind::Access),
            _ => Ok(Vec::new()),
        }
    }

    fn cmd_clear_break(&mut self, rest: &[u8]) -> Result<Vec<u8>> {
        let s = std::str::from_utf8(rest).map_err(bad_arg)?;
        let (ztype, addr, _kind) = parse_break_spec(s)?;
        match ztype {
            0 => self.clear_breakpoint_any(addr),
            1 => {
                if let Some(slot) = self.session.breakpoints.find_hw_slot(addr) {
                    self.clear_hw_breakpoint_slot(slot)
                } else {
                    Ok(b"OK".to_vec())
                }
            }
            2 | 3 | 4 => self.clear_watchpoint(),
            _ => Ok(Vec::new()),
        }
    }

    fn set_breakpoint_prefer_hw(&mut self, addr: u32) -> Result<Vec<u8>> {
        if self.session.breakpoints.free_hw_slot().is_some() {
            self.set_hw_breakpoint(addr)
        } else {
            self.set_software_breakpoint(addr)
        }
    }

    fn set_hw_breakpoint(&mut self, addr: u32) -> Result<Vec<u8>> {
        if self.session.breakpoints.find_hw_slot(addr).is_some() {
            return Ok(b"OK".to_vec());
        }
        let slot = self
            .session
            .breakpoints
            .free_hw_slot()
            .ok_or_else(|| PodError::BadArgument("no free hardware breakpoint slot".into()))?;
        let pbr = breakpoints::PBR_REG[slot];
        bdm::write_debug_reg(&mut self.session.channel, pbr, addr)?;
        let tdr = self.session.breakpoints.tdr_with_hw_breakpoint_armed(slot);
        bdm::write_debug_reg(&mut self.session.channel, breakpoints::DEBUG_REG_TDR, tdr)?;
        self.session.breakpoints.tdr_shadow = tdr;
        self.session.breakpoints.hw[slot] = HwBreakpoint { addr, used: true };
        Ok(b"OK".to_vec())
    }

    fn clear_breakpoint_any(&mut self, addr: u32) -> Result<Vec<u8>> {
        if let Some(slot) = self.session.breakpoints.find_hw_slot(addr) {
            self.clear_hw_breakpoint_slot(slot)
        } else if let Some(slot) = self.session.breakpoints.find_sw_slot(addr) {
            self.clear_software_breakpoint(slot)
        } else {
            Ok(b"OK".to_vec())
        }
    }

    fn clear_hw_breakpoint_slot(&mut self, slot: usize) -> Result<Vec<u8>> {
        let pbr = breakpoints::PBR_REG[slot];
        bdm::write_debug_reg(&mut self.session.channel, pbr, 0)?;
        self.session.breakpoints.hw[slot].used = false;
        let any_other = self.session.breakpoints.any_hw_active();
        let tdr = self.session.breakpoints.tdr_with_hw_breakpoint_cleared(slot, any_other);
        bdm::write_debug_reg(&mut self.session.channel, breakpoints::DEBUG_REG_TDR, tdr)?;
        self.session.breakpoints.tdr_shadow = tdr;
        Ok(b"OK".to_vec())
    }

    fn set_software_breakpoint(&mut self, addr: u32) -> Result<Vec<u8>> {
        if self.session.breakpoints.find_sw_slot(addr).is_some() {
            return Ok(b"OK".to_vec());
        }
        let slot = self
            .session
            .breakpoints
            .free_sw_slot()
            .ok_or_else(|| PodError::BadArgument("no free software breakpoint slot".into()))?;
        let word = bdm::read_memory(&mut self.session.channel, addr, 4)?;
        let original_insn = BigEndian::read_u16(&word[0..2]);
        let mut patched = word;
        BigEndian::write_u16(&mut patched[0..2], SW_BREAKPOINT_OPCODE);
        let value = BigEndian::read_u32(&patched);
        bdm::write_memory_long_addr(&mut self.session.channel, addr, value)?;
        self.session.breakpoints.sw[slot] = SwBreakpoint { addr, original_insn, active: true };
        Ok(b"OK".to_vec())
    }

    fn clear_software_breakpoint(&mut self, slot: usize) -> Result<Vec<u8>> {
        let bp = self.session.breakpoints.sw[slot];
        let word = bdm::read_memory(&mut self.session.channel, bp.addr, 4)?;
        let mut restored = word;
        BigEndian::write_u16(&mut restored[0..2], bp.original_insn);
        let value = BigEndian::read_u32(&restored);
        bdm::write_memory_long_addr(&mut self.session.channel, bp.addr, value)?;
        self.session.breakpoints.sw[slot].active = false;
        Ok(b"OK".to_vec())
    }

    fn set_watchpoint(&mut self, addr: u32, len: u32, kind: WatchpointKind) -> Result<Vec<u8>> {
        let ablr = addr;
        let abhr = addr + len.saturating_sub(1);
        bdm::write_debug_reg(&mut self.session.channel, breakpoints::ABLR_WRITE, ablr)?;
        bdm::write_debug_reg(&mut self.session.channel, breakpoints::ABHR_WRITE, abhr)?;
        let tdr = self.session.breakpoints.tdr_with_watchpoint_armed(kind);
        bdm::write_debug_reg(&mut self.session.channel, breakpoints::DEBUG_REG_TDR, tdr)?;
        self.session.breakpoints.tdr_shadow = tdr;
        self.session.breakpoints.watchpoint = Watchpoint {
            addr,
            length: len,
            kind: Some(WatchpointKindStorage(kind)),
            active: true,
        };
        Ok(b"OK".to_vec())
    }

    fn clear_watchpoint(&mut self) -> Result<Vec<u8>> {
        let tdr = self.session.breakpoints.tdr_with_watchpoint_cleared();
        bdm::write_debug_reg(&mut self.session.channel, breakpoints::DEBUG_REG_TDR, tdr)?;
        self.session.breakpoints.tdr_shadow = tdr;
        self.session.breakpoints.watchpoint.active = false;
        Ok(b"OK".to_vec())
    }

    // --- qCRC / monitor ------------------------------------------------------

    fn cmd_crc(&mut self, rest: &[u8]) -> Result<Vec<u8>> {
        let s = std::str::from_utf8(rest).map_err(bad_arg)?;
        let (addr, len) = parse_addr_len(s)?;
        let data = bdm::read_memory(&mut self.session.channel, addr, len as usize)?;
        let crc = crate::crc::xcrc32(&data, 0xFFFF_FFFF);
        Ok(format!("C{:08x}", crc).into_bytes())
    }

    fn cmd_monitor(&mut self, rest: &[u8]) -> Result<Vec<u8>> {
        let s = std::str::from_utf8(rest).map_err(bad_arg)?;
        let cmd_bytes = hex_decode(s)?;
        let cmd = String::from_utf8_lossy(&cmd_bytes).into_owned();
        let message = match cmd.trim() {
            "reset" => {
                self.monitor_reset(false)?;
                "target reset\n".to_string()
            }
            "reset halt" => {
                self.monitor_reset(true)?;
                "target reset and halted\n".to_string()
            }
            "halt" => {
                bdm::bdm_halt(&mut self.session.channel)?;
                bdm::enter_mode(&mut self.session.channel, mode::STANDARD_DEBUG)?;
                self.session.mark_halted();
                "target halted\n".to_string()
            }
            "go" => {
                bdm::enter_mode(&mut self.session.channel, mode::STANDARD_DEBUG)?;
                bdm::bdm_go(&mut self.session.channel)?;
                self.session.mark_running();
                "target resumed\n".to_string()
            }
            other => format!("unknown monitor command: {}\n", other),
        };
        Ok(hex_encode(message.as_bytes()).into_bytes())
    }

    fn monitor_reset(&mut self, halt: bool) -> Result<()> {
        let vectors = bdm::read_memory(&mut self.session.channel, 0, 8)?;
        let sp_raw = BigEndian::read_u32(&vectors[0..4]);
        let pc_raw = BigEndian::read_u32(&vectors[4..8]);
        let sp = if sp_raw == 0 || sp_raw == 0xFFFF_FFFF {
            self.session.cached_sp.unwrap_or(0x2000_8000)
        } else {
            sp_raw
        };
        let pc = if pc_raw == 0 || pc_raw == 0xFFFF_FFFF {
            self.session.cached_pc.unwrap_or(0x0000_0400)
        } else {
            pc_raw
        };
        bdm::write_bdm_reg(&mut self.session.channel, 0x018F, sp)?;
        bdm::write_pc(&mut self.session.channel, pc)?;
        if halt {
            bdm::bdm_halt(&mut self.session.channel)?;
            bdm::enter_mode(&mut self.session.channel, mode::STANDARD_DEBUG)?;
            self.session.mark_halted();
        } else {
            self.session.mark_running();
        }
        Ok(())
    }

    // --- vFlash ----------------------------------------------------------------

    fn cmd_vflash_erase(&mut self, rest: &[u8]) -> Result<Vec<u8>> {
        let s = std::str::from_utf8(rest).map_err(bad_arg)?;
        let (addr, len) = parse_addr_len(s)?;
        if (addr as u64) + (len as u64) > crate::flash::FLASH_SIZE as u64 {
            return Err(PodError::OutOfRange(format!(
                "vFlashErase range 0x{:08x}+{} exceeds flash size",
                addr, len
            )));
        }
        if !self.vflash_inited {
            self.flash.init(&mut self.session, &self.loader_image)?;
            self.vflash_inited = true;
        }
        self.flash.erase_range(&mut self.session, addr, len)?;
        Ok(b"OK".to_vec())
    }

    fn cmd_vflash_write(&mut self, rest: &[u8]) -> Result<Vec<u8>> {
        let colon = rest
            .iter()
            .position(|&b| b == b':')
            .ok_or_else(|| PodError::BadArgument("vFlashWrite missing ':'".into()))?;
        let addr_str = std::str::from_utf8(&rest[..colon]).map_err(bad_arg)?;
        let addr = u32::from_str_radix(addr_str, 16).map_err(bad_arg)?;
        let data = &rest[colon + 1..];
        if data.len() > VFLASH_CAPACITY {
            return Err(PodError::OutOfRange("vFlashWrite payload exceeds flash capacity".into()));
        }
        let session_buf = self.vflash.get_or_insert_with(|| VFlashSession {
            base_addr: addr,
            bytes: vec![0xFFu8; VFLASH_CAPACITY],
            write_len: 0,
        });
        if addr < session_buf.base_addr {
            return Err(PodError::OutOfRange("vFlashWrite address precedes session base".into()));
        }
        let offset = (addr - session_buf.base_addr) as usize;
        if offset + data.len() > session_buf.bytes.len() {
            return Err(PodError::OutOfRange("vFlashWrite extends past session capacity".into()));
        }
        session_buf.bytes[offset..offset + data.len()].copy_from_slice(data);
        session_buf.write_len = session_buf.write_len.max(offset + data.len());
        Ok(b"OK".to_vec())
    }

    fn cmd_vflash_done(&mut self) -> Result<Vec<u8>> {
        let session_buf = self
            .vflash
            .take()
            .ok_or_else(|| PodError::BadArgument("vFlashDone without an active vFlash session".into()))?;
        let data = &session_buf.bytes[..session_buf.write_len];
        self.flash.program(&mut self.session, session_buf.base_addr, data)?;
        self.vflash_inited = false;
        bringup::reinit_after_flash(&mut self.session.channel)?;
        self.session.mark_halted();
        Ok(b"OK".to_vec())
    }
}

fn bad_arg<E: std::fmt::Display>(e: E) -> PodError {
    PodError::BadArgument(e.to_string())
}

fn hex_u32(v: u32) -> String {
    format!("{:08x}", v)
}

fn hex_encode(data: &[u8]) -> String {
    let mut s = String::with_capacity(data.len() * 2);
    for b in data {
        s.push_str(&format!("{:02x}", b));
    }
    s
}

fn hex_decode(s: &str) -> Result<Vec<u8>> {
    if s.len() % 2 != 0 {
        return Err(PodError::BadArgument("odd-length hex string".into()));
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).map_err(bad_arg))
        .collect()
}

/// Parses the common `addr,len` form shared by `m`, `qCRC`, and `vFlashErase`.
fn parse_addr_len(s: &str) -> Result<(u32, u32)> {
    let (addr_s, len_s) = s
        .split_once(',')
        .ok_or_else(|| PodError::BadArgument(format!("expected 'addr,len', got {:?}", s)))?;
    let addr = u32::from_str_radix(addr_s, 16).map_err(bad_arg)?;
    let len = u32::from_str_radix(len_s, 16).map_err(bad_arg)?;
    Ok((addr, len))
}

/// Parses `Z`/`z` packet bodies: `type,addr,kind`.
fn parse_break_spec(s: &str) -> Result<(u8, u32, u32)> {
    let mut parts = s.splitn(3, ',');
    let ztype = parts
        .next()
        .ok_or_else(|| PodError::BadArgument("missing breakpoint type".into()))?;
    let ztype: u8 = ztype.parse().map_err(bad_arg)?;
    let addr = u32::from_str_radix(
        parts.next().ok_or_else(|| PodError::BadArgument("missing breakpoint address".into()))?,
        16,
    )
    .map_err(bad_arg)?;
    let kind = u32::from_str_radix(
        parts.next().ok_or_else(|| PodError::BadArgument("missing breakpoint kind".into()))?,
        16,
    )
    .map_err(bad_arg)?;
    Ok((ztype, addr, kind))
}

fn write_memory_words<T: rusb::UsbContext>(
    ch: &mut crate::usb::UsbChannel<T>,
    addr: u32,
    data: &[u8],
) -> Result<Vec<u8>> {
    for (i, chunk) in data.chunks(4).enumerate() {
        let mut word = [0xFFu8; 4];
        word[..chunk.len()].copy_from_slice(chunk);
        let value = BigEndian::read_u32(&word);
        bdm::write_word_0719(ch, addr + (i * 4) as u32, value)?;
    }
    Ok(b"OK".to_vec())
}

/// Builds a `qXfer` reply: `l`/`m` prefix plus the requested slice of
/// `data`, honoring the `offset,length` suffix GDB appends to the query.
fn qxfer_reply(data: &[u8], offset_len: &str) -> Vec<u8> {
    let mut parts = offset_len.splitn(2, ',');
    let offset = parts.next().and_then(|s| usize::from_str_radix(s, 16).ok()).unwrap_or(0);
    let length = parts.next().and_then(|s| usize::from_str_radix(s, 16).ok()).unwrap_or(data.len());
    if offset >= data.len() {
        return b"l".to_vec();
    }
    let end = (offset + length).min(data.len());
    let mut out = Vec::with_capacity(end - offset + 1);
    out.push(if end == data.len() { b'l' } else { b'm' });
    out.extend_from_slice(&data[offset..end]);
    out
}

fn target_xml() -> &'static [u8] {
    br#"<?xml version="1.0"?>
<!DOCTYPE target SYSTEM "gdb-target.dtd">
<target>
  <architecture>m68k:521x</architecture>
</target>
"#
}

fn memory_map_xml() -> &'static [u8] {
    br#"<?xml version="1.0"?>
<!DOCTYPE memory-map PUBLIC "+//IDN gnu.org//DTD GDB Memory Map V1.0//EN" "http://sourceware.org/gdb/gdb-memory-map.dtd">
<memory-map>
  <memory type="flash" start="0x00000000" length="0x40000">
    <property name="blocksize">0x800</property>
  </memory>
  <memory type="ram" start="0x20000000" length="0x8000"/>
  <memory type="ram" start="0x40000000" length="0x200000"/>
</memory-map>
"#
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_encode_decode_round_trips() {
        let data = vec![0x00, 0xAB, 0xFF, 0x10];
        let hex = hex_encode(&data);
        assert_eq!(hex, "00abff10");
        assert_eq!(hex_decode(&hex).unwrap(), data);
    }

    #[test]
    fn hex_decode_rejects_odd_length() {
        assert!(hex_decode("abc").is_err());
    }

    #[test]
    fn parses_addr_len_pair() {
        assert_eq!(parse_addr_len("1000,20").unwrap(), (0x1000, 0x20));
        assert!(parse_addr_len("1000").is_err());
    }

    #[test]
    fn parses_break_spec_fields() {
        assert_eq!(parse_break_spec("1,2000,2").unwrap(), (1, 0x2000, 2));
        assert_eq!(parse_break_spec("0,1000,1").unwrap(), (0, 0x1000, 1));
    }

    #[test]
    fn qxfer_full_document_marked_last() {
        let data = b"hello world";
        let reply = qxfer_reply(data, "0,100");
        assert_eq!(reply[0], b'l');
        assert_eq!(&reply[1..], data);
    }

    #[test]
    fn qxfer_partial_document_marked_more() {
        let data = b"hello world";
        let reply = qxfer_reply(data, "0,5");
        assert_eq!(reply[0], b'm');
        assert_eq!(&reply[1..], b"hello");
        let reply2 = qxfer_reply(data, "5,100");
        assert_eq!(reply2[0], b'l');
        assert_eq!(&reply2[1..], b" world");
    }

    #[test]
    fn qxfer_offset_past_end_returns_bare_last_marker() {
        let data = b"abc";
        assert_eq!(qxfer_reply(data, "10,5"), b"l".to_vec());
    }

    #[test]
    fn target_xml_names_the_m68k_521x_architecture() {
        let xml = std::str::from_utf8(target_xml()).unwrap();
        assert!(xml.contains("m68k:521x"));
    }

    #[test]
    fn memory_map_xml_lists_flash_and_both_ram_regions() {
        let xml = std::str::from_utf8(memory_map_xml()).unwrap();
        assert!(xml.contains("start=\"0x00000000\""));
        assert!(xml.contains("0x800"));
        assert!(xml.contains("start=\"0x20000000\""));
        assert!(xml.contains("start=\"0x40000000\""));
    }

    #[test]
    fn kill_packet_is_recognized_without_needing_a_session() {
        assert!(DebugCoordinator::is_kill(b"k"));
        assert!(!DebugCoordinator::is_kill(b"kill"));
    }
}
