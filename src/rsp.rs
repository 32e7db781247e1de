//! GDB RSP Parser/Serializer (component G): packet framing with `$…#cc`
//! checksums, the binary escape scheme used by `vFlashWrite`, `+`/`-`
//! acknowledgement bytes, and the out-of-band interrupt byte `0x03`.
//!
//! Kept as pure functions over byte slices — no socket, no coordinator
//! state — so the framing invariants can be exercised directly, the same
//! way `usb.rs` keeps its request/response builders free-standing for
//! testing without a live `rusb` context.

/// One unit of input pulled off the wire by [`extract_events`].
#[derive(Debug, Eq, PartialEq)]
pub enum Event {
    /// Host acknowledged the last response (`+`).
    Ack,
    /// Host asked for retransmission (`-`).
    Nack,
    /// Out-of-band `0x03` outside any packet frame: an immediate halt
    /// request, not tied to any particular packet.
    Interrupt,
    /// A complete `$…#cc` frame. `payload` is already unescaped.
    /// `checksum_ok` tells the caller whether to ack or nack it.
    Packet { payload: Vec<u8>, checksum_ok: bool },
}

/// Scans `buf` for complete events (`+`, `-`, `0x03`, or a full `$…#cc`
/// packet), consuming everything it recognizes and leaving only a
/// trailing partial packet (if any) in `buf` for the next read to
/// complete. Binary-safe: never assumes payloads are NUL-terminated or
/// otherwise string-like.
pub fn extract_events(buf: &mut Vec<u8>) -> Vec<Event> {
    let mut events = Vec::new();
    let mut i = 0;
    while i < buf.len() {
        match buf[i] {
            b'+' => {
                events.push(Event::Ack);
                i += 1;
            }
            b'-' => {
                events.push(Event::Nack);
                i += 1;
            }
            0x03 => {
                events.push(Event::Interrupt);
                i += 1;
            }
            b'$' => match find_unescaped(&buf[i + 1..], b'#') {
                Some(rel_hash) => {
                    let hash_pos = i + 1 + rel_hash;
                    if hash_pos + 2 >= buf.len() {
                        // checksum hex not fully arrived yet; wait for more data.
                        break;
                    }
                    let escaped_payload = buf[i + 1..hash_pos].to_vec();
                    let checksum_hex = &buf[hash_pos + 1..hash_pos + 3];
                    let checksum_ok = parse_hex_byte(checksum_hex)
                        .map(|expected| checksum(&escaped_payload) == expected)
                        .unwrap_or(false);
                    events.push(Event::Packet {
                        payload: unescape(&escaped_payload),
                        checksum_ok,
                    });
                    i = hash_pos + 3;
                }
                None => break, // incomplete packet; wait for more data.
            },
            _ => {
                // Stray byte outside any frame (stale ack noise, etc).
                i += 1;
            }
        }
    }
    buf.drain(0..i);
    events
}

/// Finds the index of the first unescaped occurrence of `target` in
/// `data`, treating `0x7D` as an escape marker that consumes the byte
/// after it (so an escaped `#`/`$`/`*`/`}` never terminates the scan).
fn find_unescaped(data: &[u8], target: u8) -> Option<usize> {
    let mut i = 0;
    while i < data.len() {
        if data[i] == target {
            return Some(i);
        }
        if data[i] == 0x7D {
            i += 2;
        } else {
            i += 1;
        }
    }
    None
}

fn parse_hex_byte(hex: &[u8]) -> Option<u8> {
    if hex.len() != 2 {
        return None;
    }
    let s = std::str::from_utf8(hex).ok()?;
    u8::from_str_radix(s, 16).ok()
}

/// Mod-256 sum of `payload` bytes, the RSP checksum algorithm.
pub fn checksum(payload: &[u8]) -> u8 {
    payload.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}

/// Escapes `{0x23='#', 0x24='$', 0x2A='*', 0x7D='}'}` as `0x7D` followed by
/// `byte ^ 0x20`, per the RSP binary escape scheme.
pub fn escape(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    for &b in data {
        if matches!(b, 0x23 | 0x24 | 0x2A | 0x7D) {
            out.push(0x7D);
            out.push(b ^ 0x20);
        } else {
            out.push(b);
        }
    }
    out
}

/// Inverse of [`escape`]: unconditionally valid for any input, escaped or
/// not (a lone trailing `0x7D` with nothing to escape is passed through).
pub fn unescape(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut i = 0;
    while i < data.len() {
        if data[i] == 0x7D && i + 1 < data.len() {
            out.push(data[i + 1] ^ 0x20);
            i += 2;
        } else {
            out.push(data[i]);
            i += 1;
        }
    }
    out
}

/// Wraps `payload` (unescaped) as a full `$<escaped>#<checksum>` frame,
/// the checksum computed over the escaped bytes as transmitted.
pub fn encode_packet(payload: &[u8]) -> Vec<u8> {
    let escaped = escape(payload);
    let sum = checksum(&escaped);
    let mut out = Vec::with_capacity(escaped.len() + 4);
    out.push(b'$');
    out.extend_from_slice(&escaped);
    out.push(b'#');
    out.extend_from_slice(format!("{:02x}", sum).as_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_then_extract_round_trips() {
        let payload = b"qSupported";
        let frame = encode_packet(payload);
        let mut buf = frame.clone();
        let events = extract_events(&mut buf);
        assert_eq!(events.len(), 1);
        match &events[0] {
            Event::Packet { payload: p, checksum_ok } => {
                assert_eq!(p, payload);
                assert!(checksum_ok);
            }
            other => panic!("expected Packet, got {:?}", other),
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn detects_corrupted_checksum() {
        let mut frame = encode_packet(b"g");
        let last = frame.len() - 1;
        frame[last] = if frame[last] == b'0' { b'1' } else { b'0' };
        let mut buf = frame;
        let events = extract_events(&mut buf);
        match &events[0] {
            Event::Packet { checksum_ok, .. } => assert!(!checksum_ok),
            other => panic!("expected Packet, got {:?}", other),
        }
    }

    #[test]
    fn parses_ack_nack_and_interrupt() {
        let mut buf = vec![b'+', b'-', 0x03];
        let events = extract_events(&mut buf);
        assert_eq!(events, vec![Event::Ack, Event::Nack, Event::Interrupt]);
    }

    #[test]
    fn incomplete_packet_is_left_for_next_read() {
        let mut buf = b"$qSupp".to_vec();
        let events = extract_events(&mut buf);
        assert!(events.is_empty());
        assert_eq!(buf, b"$qSupp");
    }

    #[test]
    fn escaped_hash_inside_payload_does_not_end_frame_early() {
        // payload contains a literal '#' (0x23), which must be escaped on
        // the wire as 7D 03 so the real frame-terminating '#' isn't confused.
        let payload = vec![b'a', 0x23, b'b'];
        let frame = encode_packet(&payload);
        let mut buf = frame;
        let events = extract_events(&mut buf);
        match &events[0] {
            Event::Packet { payload: p, checksum_ok } => {
                assert_eq!(p, &payload);
                assert!(checksum_ok);
            }
            other => panic!("expected Packet, got {:?}", other),
        }
    }

    #[test]
    fn unescape_is_total_on_arbitrary_input() {
        for b in [0x7Du8, 0x23, 0x00, 0xFF] {
            let data = [0x7D, b];
            let _ = unescape(&data); // must not panic on any byte after the marker
        }
        let trailing_marker = [b'a', 0x7D];
        assert_eq!(unescape(&trailing_marker), vec![b'a', 0x7D]);
    }

    #[test]
    fn escape_unescape_round_trips_arbitrary_bytes() {
        let data: Vec<u8> = (0u8..=255).collect();
        assert_eq!(unescape(&escape(&data)), data);
    }

    #[test]
    fn binary_safe_payload_with_nul_bytes() {
        let payload = vec![0x00, 0x01, 0x00, 0xFF];
        let frame = encode_packet(&payload);
        let mut buf = frame;
        let events = extract_events(&mut buf);
        match &events[0] {
            Event::Packet { payload: p, .. } => assert_eq!(p, &payload),
            other => panic!("expected Packet, got {:?}", other),
        }
    }
}
