//! The USB framed channel to the BDM pod (component A).
//!
//! Two bulk endpoints carry two request classes, distinguished by their
//! first two bytes: `AA 55` control/debug commands and `BB 66` bulk data
//! downloads. Every higher-level BDM command in [`crate::bdm`] is built on
//! top of [`UsbChannel::send_aa`] / [`UsbChannel::send_aa_no_response`] /
//! [`UsbChannel::send_bb_chunked`] / [`UsbChannel::send_bb_single`].

use std::time::Duration;

use byteorder::{BigEndian, ByteOrder};
use log::trace;
use rusb::{DeviceHandle, UsbContext};

use crate::error::{PodError, Result};

pub const VENDOR_ID: u16 = 0x1357;
pub const PRODUCT_ID: u16 = 0x0503;
pub const INTERFACE: u8 = 0;
pub const ENDPOINT_OUT: u8 = 0x02;
pub const ENDPOINT_IN: u8 = 0x81;

/// Size of the persistent command/response buffer. Never reallocated,
/// never zeroed: bytes past the active request/response are load-bearing
/// leftovers from whatever command ran before.
pub const BUF_SIZE: usize = 256;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
const FREEZE_TIMEOUT: Duration = Duration::from_millis(500);
const CHUNK_SIZE: usize = 1192;
const MAX_READ_PACKETS: usize = 10;

/// A validated `AA 55`-class response: the status byte has already been
/// checked to equal `0xEE`, leaving only the payload for callers to parse.
pub struct Response<'a> {
    pub magic: [u8; 2],
    pub payload: &'a [u8],
}

/// Owns the USB interface handle and the single persistent 256-byte
/// command/response buffer described in the data model. Every method here
/// takes `&mut self`, so the borrow checker alone rules out two commands
/// being in flight against the same buffer at once.
pub struct UsbChannel<T: UsbContext> {
    handle: DeviceHandle<T>,
    buf: [u8; BUF_SIZE],
}

impl<T: UsbContext> UsbChannel<T> {
    /// Claims `INTERFACE` on an already-opened device handle. The buffer
    /// starts zeroed only because there is no prior response to inherit
    /// bytes from; every subsequent command must never re-zero it.
    pub fn new(mut handle: DeviceHandle<T>) -> Result<Self> {
        handle.claim_interface(INTERFACE)?;
        Ok(UsbChannel {
            handle,
            buf: [0u8; BUF_SIZE],
        })
    }

    /// Writes a `AA 55` request with the given `cmd`/`sub` bytes and
    /// payload, then reads back and validates a standard or memory-read
    /// response. Returns the number of payload bytes actually read.
    ///
    /// Per the persistent-buffer invariant, only the header and payload
    /// bytes of this request are written into `self.buf`; everything past
    /// `len(cmd)+header` is left exactly as the previous response wrote it.
    pub fn send_aa(&mut self, cmd: u8, sub: u8, payload: &[u8]) -> Result<usize> {
        self.build_aa_request(cmd, sub, payload);
        self.write_out()?;
        self.read_response_into_buf()
    }

    /// Same framing as [`Self::send_aa`] but for commands that are
    /// documented as fire-and-forget (BDM GO, legacy BDM resume): no IN
    /// transfer is attempted, because reading one here would either hang or
    /// desynchronize the pod ahead of the next real command.
    pub fn send_aa_no_response(&mut self, cmd: u8, sub: u8, payload: &[u8]) -> Result<()> {
        self.build_aa_request(cmd, sub, payload);
        self.write_out()
    }

    /// Builds the `AA 55 len_hi len_lo cmd sub payload…` header in the
    /// persistent buffer. `len` counts bytes from `cmd` inclusive.
    fn build_aa_request(&mut self, cmd: u8, sub: u8, payload: &[u8]) {
        build_aa_request_into(&mut self.buf, cmd, sub, payload);
    }

    /// Sends the entire 256-byte buffer on the OUT endpoint regardless of
    /// the declared length — the pod only interprets the declared length,
    /// but the host always ships the whole buffer.
    fn write_out(&mut self) -> Result<()> {
        trace!("usb out: {:02x?}", &self.buf[..16]);
        self.handle
            .write_bulk(ENDPOINT_OUT, &self.buf, DEFAULT_TIMEOUT)?;
        Ok(())
    }

    /// Reads one IN packet directly into the persistent buffer (never a
    /// scratch buffer — the whole point is that leftover bytes persist),
    /// then validates the framing and status byte.
    fn read_response_into_buf(&mut self) -> Result<usize> {
        let n = self.handle.read_bulk(ENDPOINT_IN, &mut self.buf, DEFAULT_TIMEOUT)?;
        validate_response(&self.buf[..n])?;
        Ok(n)
    }

    /// Performs the freeze-check read with its own short timeout. A
    /// `rusb::Error::Timeout` here is not surfaced as an error: the target
    /// is simply still running.
    pub fn read_with_timeout(&mut self, timeout: Duration) -> Result<Option<usize>> {
        match self.handle.read_bulk(ENDPOINT_IN, &mut self.buf, timeout) {
            Ok(n) => Ok(Some(n)),
            Err(rusb::Error::Timeout) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Current contents of the persistent buffer (for helpers that need to
    /// pick values out of the last response, e.g. the 6-byte-group or SRAM
    /// de-interleavers).
    pub fn buf(&self) -> &[u8; BUF_SIZE] {
        &self.buf
    }

    pub fn buf_mut(&mut self) -> &mut [u8; BUF_SIZE] {
        &mut self.buf
    }

    /// Issues a freeze-check read with the pod's 500 ms deadline.
    pub fn freeze_check_timeout(&self) -> Duration {
        FREEZE_TIMEOUT
    }

    /// Writes an `AA 55` request and reads back its response within
    /// `timeout` instead of the default 5 s deadline, surfacing a timeout as
    /// `Ok(None)` rather than an error. Used by the freeze check, where "no
    /// response yet" means the target is still running, not a failure.
    pub fn send_aa_with_timeout(
        &mut self,
        cmd: u8,
        sub: u8,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<Option<usize>> {
        self.build_aa_request(cmd, sub, payload);
        self.write_out()?;
        self.read_with_timeout(timeout)
    }

    /// Writes a `07 19` word-write request whose padding region (bytes
    /// `16..256`) carries the `02 00 00 00 00 02` pattern rather than
    /// leftover response bytes, then reads back and validates the standard
    /// response.
    pub fn send_aa_0719(&mut self, payload: &[u8]) -> Result<usize> {
        self.build_aa_request(0x07, 0x19, payload);
        apply_0719_padding(&mut self.buf);
        self.write_out()?;
        self.read_response_into_buf()
    }

    /// Uploads `data` to `base_addr` in SRAM as a sequence of 1192-byte
    /// `BB 66`/`07 19` chunks with no response read between chunks and a
    /// mandatory 5 ms settle between each (reading here corrupts later
    /// commands by leaving a stray packet in flight).
    pub fn send_bb_chunked(&mut self, base_addr: u32, data: &[u8]) -> Result<()> {
        for (i, chunk) in data.chunks(CHUNK_SIZE).enumerate() {
            let addr = base_addr + (i * CHUNK_SIZE) as u32;
            self.build_bb_request(addr, chunk);
            self.write_out()?;
            std::thread::sleep(Duration::from_millis(5));
        }
        Ok(())
    }

    /// Uploads `data` to `addr` as a single `BB 66`/`07 19` transfer. Unlike
    /// the chunked path this one DOES produce a short `99 66 00 03 EE`
    /// acknowledgement; it must be drained (logged, not validated strictly)
    /// or later commands hang, then the pod needs ~20 ms to settle.
    pub fn send_bb_single(&mut self, addr: u32, data: &[u8]) -> Result<()> {
        self.build_bb_request(addr, data);
        self.write_out()?;
        std::thread::sleep(Duration::from_millis(20));
        match self.handle.read_bulk(ENDPOINT_IN, &mut self.buf, DEFAULT_TIMEOUT) {
            Ok(_) => {}
            Err(e) => trace!("bb single: unexpected drain result: {}", e),
        }
        Ok(())
    }

    fn build_bb_request(&mut self, addr: u32, data: &[u8]) {
        build_bb_request_into(&mut self.buf, addr, data);
    }

    /// Reads `length` bytes of memory starting at `addr` using `07 17`,
    /// assembling multi-packet responses (capped at ten packets) and
    /// de-interleaving the 6-byte groups (4 data bytes + 2 padding bytes
    /// per group) into a contiguous buffer.
    pub fn read_memory_block(&mut self, addr: u32, length: usize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(length);
        let mut offset = 0usize;
        let mut packets = 0;
        while out.len() < length && packets < MAX_READ_PACKETS {
            let remaining = length - out.len();
            let request_len = ((remaining + 3) / 4) * 6;
            let mut payload = [0u8; 6];
            BigEndian::write_u32(&mut payload[0..4], addr + offset as u32);
            BigEndian::write_u16(&mut payload[4..6], request_len.min(0xFFFF) as u16);
            let n = self.send_aa(0x07, 0x17, &payload)?;
            let data = &self.buf[5..n];
            let degrouped = degroup_6byte(data);
            let take = degrouped.len().min(remaining);
            out.extend_from_slice(&degrouped[..take]);
            offset = out.len();
            packets += 1;
            if n < BUF_SIZE {
                break;
            }
        }
        out.truncate(length);
        Ok(out)
    }
}

/// Free-function form of the `AA 55` header builder, split out so the
/// framing logic is exercisable without a live USB handle.
fn build_aa_request_into(buf: &mut [u8; BUF_SIZE], cmd: u8, sub: u8, payload: &[u8]) {
    let len = 2 + payload.len();
    buf[0] = 0xAA;
    buf[1] = 0x55;
    BigEndian::write_u16(&mut buf[2..4], len as u16);
    buf[4] = cmd;
    buf[5] = sub;
    buf[6..6 + payload.len()].copy_from_slice(payload);
}

/// Free-function form of the `BB 66`/`07 19` bulk-download header builder.
fn build_bb_request_into(buf: &mut [u8; BUF_SIZE], addr: u32, data: &[u8]) {
    let dlen = data.len();
    buf[0] = 0xBB;
    buf[1] = 0x66;
    BigEndian::write_u16(&mut buf[2..4], (6 + dlen) as u16);
    buf[4] = 0x07;
    buf[5] = 0x19;
    BigEndian::write_u16(&mut buf[6..8], dlen as u16);
    BigEndian::write_u32(&mut buf[8..12], addr);
    buf[12..12 + dlen].copy_from_slice(data);
}

/// Validates the standard `99 66 len_hi len_lo EE …` or memory-read
/// `88 A5 len_hi len_lo EE …` response shape: minimum length 5, magic in
/// the accepted set, status byte `0xEE`.
pub fn validate_response(resp: &[u8]) -> Result<()> {
    if resp.len() < 5 {
        return Err(PodError::ProtocolFraming(format!(
            "response too short ({} bytes)",
            resp.len()
        )));
    }
    let magic = [resp[0], resp[1]];
    if magic != [0x99, 0x66] && magic != [0x88, 0xA5] {
        return Err(PodError::ProtocolFraming(format!(
            "unexpected magic {:02x?}",
            magic
        )));
    }
    if resp[4] != 0xEE {
        return Err(PodError::ProtocolStatus(resp[4]));
    }
    Ok(())
}

/// De-interleaves a `07 17` response payload: every 6 bytes carry 4 data
/// bytes followed by 2 padding bytes.
pub fn degroup_6byte(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() / 6 * 4 + 4);
    for group in data.chunks(6) {
        let take = group.len().min(4);
        out.extend_from_slice(&group[..take]);
    }
    out
}

/// Extracts a big-endian 32-bit value from the pathological `07 1B`
/// SRAM-read layout, where the four value bytes appear at offsets
/// `{0, 7, 9, 11}` of the payload rather than contiguously.
pub fn extract_sram_longword(payload: &[u8]) -> Result<u32> {
    if payload.len() < 12 {
        return Err(PodError::ProtocolFraming(format!(
            "07 1B payload too short ({} bytes, need 12)",
            payload.len()
        )));
    }
    Ok(u32::from_be_bytes([
        payload[0],
        payload[7],
        payload[9],
        payload[11],
    ]))
}

/// Fills bytes `16..256` of `buf` with the repeating `02 00 00 00 00 02`
/// pattern the `07 19` word-writer requires for its padding region. Zeros
/// there yield silent write failures on some pod firmwares.
pub fn apply_0719_padding(buf: &mut [u8; BUF_SIZE]) {
    const PATTERN: [u8; 6] = [0x02, 0x00, 0x00, 0x00, 0x00, 0x02];
    for (i, b) in buf.iter_mut().enumerate().skip(16) {
        *b = PATTERN[(i - 16) % PATTERN.len()];
    }
}

/// Opens the pod by VID/PID and wraps it in a channel with the interface
/// claimed. The common entry point used by [`crate::session::PodSession`].
pub fn open() -> Result<UsbChannel<rusb::Context>> {
    let context = rusb::Context::new()?;
    let handle = context
        .open_device_with_vid_pid(VENDOR_ID, PRODUCT_ID)
        .ok_or_else(|| {
            PodError::Internal(format!(
                "no pod found at VID=0x{:04x} PID=0x{:04x}",
                VENDOR_ID, PRODUCT_ID
            ))
        })?;
    UsbChannel::new(handle)
}

#[cfg(test)]
mod tests {
    use assert_hex::assert_eq_hex;
    use hex_literal::hex;

    use super::*;

    #[test]
    fn validates_standard_response() {
        let resp = [0x99, 0x66, 0x00, 0x05, 0xEE, 0xAB, 0xCD, 0xEF, 0x01];
        assert!(validate_response(&resp).is_ok());
    }

    #[test]
    fn validates_memory_read_response() {
        let resp = [0x88, 0xA5, 0x00, 0x05, 0xEE, 0x00, 0x00, 0x00, 0x00];
        assert!(validate_response(&resp).is_ok());
    }

    #[test]
    fn rejects_bad_magic() {
        let resp = [0x12, 0x34, 0x00, 0x05, 0xEE];
        assert!(matches!(
            validate_response(&resp),
            Err(PodError::ProtocolFraming(_))
        ));
    }

    #[test]
    fn rejects_bad_status() {
        let resp = [0x99, 0x66, 0x00, 0x05, 0x01];
        match validate_response(&resp) {
            Err(PodError::ProtocolStatus(0x01)) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn rejects_short_response() {
        let resp = [0x99, 0x66];
        assert!(matches!(
            validate_response(&resp),
            Err(PodError::ProtocolFraming(_))
        ));
    }

    #[test]
    fn degroups_6_byte_payload() {
        // two groups: {AA BB CC DD, pad pad}, {11 22 33 44, pad pad}
        let data = [0xAA, 0xBB, 0xCC, 0xDD, 0x00, 0x00, 0x11, 0x22, 0x33, 0x44, 0x00, 0x00];
        assert_eq!(degroup_6byte(&data), vec![0xAA, 0xBB, 0xCC, 0xDD, 0x11, 0x22, 0x33, 0x44]);
    }

    #[test]
    fn extracts_pathological_sram_layout() {
        // Worked example: writing 0xABCD1234 places the bytes at offsets {0,7,9,11}.
        let mut payload = [0u8; 12];
        payload[0] = 0xAB;
        payload[7] = 0xCD;
        payload[9] = 0x12;
        payload[11] = 0x34;
        assert_eq!(extract_sram_longword(&payload).unwrap(), 0xABCD1234);
    }

    #[test]
    fn rejects_short_sram_payload() {
        let payload = [0u8; 4];
        assert!(extract_sram_longword(&payload).is_err());
    }

    #[test]
    fn applies_0719_padding_pattern() {
        let mut buf = [0u8; BUF_SIZE];
        apply_0719_padding(&mut buf);
        assert_eq!(&buf[16..22], &[0x02, 0x00, 0x00, 0x00, 0x00, 0x02]);
        assert_eq!(&buf[250..256], &buf[16..22]);
    }

    #[test]
    fn builds_aa_request_header_preserving_leftover_bytes() {
        let mut buf = [0u8; BUF_SIZE];
        buf[100] = 0x7F; // leftover byte from a hypothetical previous response
        build_aa_request_into(&mut buf, 0x07, 0x13, &hex!("21 80"));
        assert_eq_hex!(&buf[0..8], &hex!("AA 55 00 04 07 13 21 80"));
        // leftover byte past the new request must be untouched.
        assert_eq_hex!(buf[100], 0x7F);
    }

    #[test]
    fn builds_bb_request_header() {
        let mut buf = [0u8; BUF_SIZE];
        let data = hex!("DE AD BE EF");
        build_bb_request_into(&mut buf, 0x2000_0100, &data);
        assert_eq_hex!(&buf[0..16], &hex!("BB 66 00 0A 07 19 00 04 20 00 01 00 DE AD BE EF"));
    }
}
