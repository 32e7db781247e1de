//! File Loader (component F): reads `.bin` / `.elf` / `.srec` firmware
//! images into a normalized segment list plus an entry point.
//!
//! ELF parsing reads a fixed-size header buffer and indexes fields by byte
//! offset rather than pulling in a generic ELF crate, narrowed to the
//! big-endian 32-bit m68k `PT_LOAD`-only subset this target needs.

use std::fs;
use std::path::Path;

use byteorder::{BigEndian, ByteOrder};

use crate::error::{PodError, Result};

/// Total addressable flash; images bound for flash programming may not
/// extend past this.
pub const FLASH_SIZE: u32 = 256 * 1024;

const ELF_MAGIC: [u8; 4] = [0x7F, 0x45, 0x4C, 0x46];
const ELFCLASS32: u8 = 1;
const ELFDATA2MSB: u8 = 2;
const EM_68K: u16 = 4;
const PT_LOAD: u32 = 1;

#[derive(Clone, Debug)]
pub struct Segment {
    pub addr: u32,
    pub data: Vec<u8>,
}

/// A normalized firmware image: the raw segment list as read from the
/// file, its entry point, address bounds, and `bytes` — the segments
/// already flattened into one contiguous `[min_addr, max_addr)` buffer
/// with gaps filled per the caller's fill byte.
#[derive(Clone, Debug)]
pub struct LoadedImage {
    pub segments: Vec<Segment>,
    pub entry: u32,
    pub min_addr: u32,
    pub max_addr: u32,
    pub total: usize,
    pub bytes: Vec<u8>,
}

enum Kind {
    Elf,
    SRecord,
    Binary,
}

/// Loads `path` as `.bin` (requires `base`), `.elf`, or `.srec`/`.s19`/
/// `.s28`/`.s37`, falling back to content-sniffing when the extension is
/// missing or unrecognized. Flattens with `0xFF` fill (the erased-flash
/// value) since this path feeds flash programming; rejects images whose
/// extent exceeds the 256 KB flash.
pub fn load(path: &Path, base: Option<u32>) -> Result<LoadedImage> {
    let data = read_file(path)?;
    let (segments, entry) = match detect_kind(path, &data) {
        Kind::Elf => parse_elf(&data)?,
        Kind::SRecord => parse_srecord(&data)?,
        Kind::Binary => {
            let base = base.ok_or_else(|| {
                PodError::BadArgument("raw .bin image requires --base ADDR".into())
            })?;
            (vec![Segment { addr: base, data }], base)
        }
    };
    flatten(segments, entry, 0xFF, true)
}

/// Loads the on-target flashloader ELF stub for upload into SRAM.
/// Zero-fills gaps between its `PT_LOAD` segments (it's position-
/// independent code, not flash content) and is not subject to the
/// 256 KB flash-size ceiling since it lands in SRAM.
pub fn load_flashloader(path: &Path) -> Result<LoadedImage> {
    let data = read_file(path)?;
    let (segments, entry) = parse_elf(&data)?;
    flatten(segments, entry, 0x00, false)
}

/// Returns the flattened, gap-filled contiguous image `[min_addr,
/// max_addr)`, the form GDB's `compare-sections` and this crate's flash
/// programming path both want.
pub fn file_get_contiguous(image: &LoadedImage) -> &[u8] {
    &image.bytes
}

fn read_file(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).map_err(|e| PodError::FileFormat(format!("{}: {}", path.display(), e)))
}

fn detect_kind(path: &Path, data: &[u8]) -> Kind {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|s| s.to_ascii_lowercase())
        .as_deref()
    {
        Some("elf") => return Kind::Elf,
        Some("bin") => return Kind::Binary,
        Some("srec") | Some("s19") | Some("s28") | Some("s37") => return Kind::SRecord,
        _ => {}
    }
    if data.len() >= 4 && data[0..4] == ELF_MAGIC {
        return Kind::Elf;
    }
    if data.first() == Some(&b'S') && data.get(1).map(u8::is_ascii_digit).unwrap_or(false) {
        return Kind::SRecord;
    }
    Kind::Binary
}

fn flatten(segments: Vec<Segment>, entry: u32, fill: u8, enforce_flash_ceiling: bool) -> Result<LoadedImage> {
    if segments.is_empty() {
        return Err(PodError::FileFormat("image contains no loadable segments".into()));
    }
    let min_addr = segments.iter().map(|s| s.addr).min().unwrap();
    let max_addr = segments
        .iter()
        .map(|s| s.addr + s.data.len() as u32)
        .max()
        .unwrap();
    if enforce_flash_ceiling && max_addr > FLASH_SIZE {
        return Err(PodError::OutOfRange(format!(
            "image extends to 0x{:08x}, exceeds {} byte flash",
            max_addr, FLASH_SIZE
        )));
    }
    let total = (max_addr - min_addr) as usize;
    let mut bytes = vec![fill; total];
    for seg in &segments {
        let offset = (seg.addr - min_addr) as usize;
        bytes[offset..offset + seg.data.len()].copy_from_slice(&seg.data);
    }
    Ok(LoadedImage {
        segments,
        entry,
        min_addr,
        max_addr,
        total,
        bytes,
    })
}

/// Parses the `PT_LOAD` program headers of a big-endian 32-bit m68k ELF
/// into `(segments, entry)`. Section headers, symbols, and every other
/// ELF feature are out of scope — this crate only ever needs to know
/// where to put bytes and where to jump.
fn parse_elf(data: &[u8]) -> Result<(Vec<Segment>, u32)> {
    if data.len() < 52 || data[0..4] != ELF_MAGIC {
        return Err(PodError::FileFormat("missing ELF magic".into()));
    }
    if data[4] != ELFCLASS32 {
        return Err(PodError::FileFormat("only 32-bit ELF is supported".into()));
    }
    if data[5] != ELFDATA2MSB {
        return Err(PodError::FileFormat("only big-endian ELF is supported".into()));
    }
    let machine = BigEndian::read_u16(&data[18..20]);
    if machine != EM_68K {
        return Err(PodError::FileFormat(format!(
            "unsupported ELF machine type {} (expected m68k)",
            machine
        )));
    }
    let entry = BigEndian::read_u32(&data[24..28]);
    let phoff = BigEndian::read_u32(&data[28..32]) as usize;
    let phentsize = BigEndian::read_u16(&data[42..44]) as usize;
    let phnum = BigEndian::read_u16(&data[44..46]) as usize;

    let mut segments = Vec::new();
    for i in 0..phnum {
        let off = phoff + i * phentsize;
        let ph = data
            .get(off..off + 32)
            .ok_or_else(|| PodError::FileFormat("truncated program header table".into()))?;
        if BigEndian::read_u32(&ph[0..4]) != PT_LOAD {
            continue;
        }
        let p_offset = BigEndian::read_u32(&ph[4..8]) as usize;
        let p_vaddr = BigEndian::read_u32(&ph[8..12]);
        let p_filesz = BigEndian::read_u32(&ph[16..20]) as usize;
        let p_memsz = BigEndian::read_u32(&ph[20..24]) as usize;

        let file_bytes = data
            .get(p_offset..p_offset + p_filesz)
            .ok_or_else(|| PodError::FileFormat("PT_LOAD segment extends past end of file".into()))?;
        let mut seg_data = file_bytes.to_vec();
        if p_memsz > p_filesz {
            seg_data.resize(p_memsz, 0);
        }
        segments.push(Segment { addr: p_vaddr, data: seg_data });
    }
    if segments.is_empty() {
        return Err(PodError::FileFormat("no PT_LOAD segments found".into()));
    }
    Ok((segments, entry))
}

/// Parses Motorola S-Record text: `S0` header (ignored), `S1`/`S2`/`S3`
/// data records (16/24/32-bit address), `S5` count record (ignored), and
/// `S7`/`S8`/`S9` start-address/termination records (32/24/16-bit). Every
/// record is checksum-verified.
fn parse_srecord(data: &[u8]) -> Result<(Vec<Segment>, u32)> {
    let text = std::str::from_utf8(data)
        .map_err(|_| PodError::FileFormat("S-Record file is not valid ASCII text".into()))?;
    let mut segments = Vec::new();
    let mut entry = 0u32;
    let mut saw_data = false;

    for raw_line in text.lines() {
        let line = raw_line.trim();
        if line.is_empty() {
            continue;
        }
        if line.as_bytes()[0] != b'S' || line.len() < 4 {
            return Err(PodError::FileFormat(format!("malformed S-Record line: {:?}", line)));
        }
        let rec_type = line.as_bytes()[1];
        let bytes = hex_decode(&line[2..])?;
        if bytes.len() < 2 {
            return Err(PodError::FileFormat("S-Record line too short".into()));
        }
        let count = bytes[0] as usize;
        if bytes.len() != count + 1 {
            return Err(PodError::FileFormat(format!(
                "S-Record byte count mismatch in line: {:?}",
                line
            )));
        }
        let checksum = *bytes.last().unwrap();
        let sum: u32 = bytes[..bytes.len() - 1].iter().map(|&b| b as u32).sum();
        let computed = (sum as u8).wrapping_neg();
        if computed != checksum {
            return Err(PodError::FileFormat(format!(
                "S-Record checksum mismatch in line: {:?}",
                line
            )));
        }
        let body = &bytes[1..bytes.len() - 1];
        match rec_type {
            b'0' => {}
            b'1' | b'2' | b'3' => {
                let addr_len = addr_len_for(rec_type);
                if body.len() < addr_len {
                    return Err(PodError::FileFormat("S-Record data shorter than its address field".into()));
                }
                let addr = read_be_addr(&body[..addr_len]);
                segments.push(Segment { addr, data: body[addr_len..].to_vec() });
                saw_data = true;
            }
            b'5' => {}
            b'7' | b'8' | b'9' => {
                let addr_len = match rec_type {
                    b'7' => 4,
                    b'8' => 3,
                    b'9' => 2,
                    _ => unreachable!(),
                };
                if body.len() < addr_len {
                    return Err(PodError::FileFormat("S-Record termination record too short".into()));
                }
                entry = read_be_addr(&body[..addr_len]);
            }
            other => {
                return Err(PodError::FileFormat(format!(
                    "unsupported S-Record type S{}",
                    other as char
                )));
            }
        }
    }
    if !saw_data {
        return Err(PodError::FileFormat("S-Record file contains no data records".into()));
    }
    Ok((segments, entry))
}

fn addr_len_for(rec_type: u8) -> usize {
    match rec_type {
        b'1' => 2,
        b'2' => 3,
        b'3' => 4,
        _ => unreachable!(),
    }
}

fn read_be_addr(bytes: &[u8]) -> u32 {
    let mut padded = [0u8; 4];
    padded[4 - bytes.len()..].copy_from_slice(bytes);
    BigEndian::read_u32(&padded)
}

fn hex_decode(s: &str) -> Result<Vec<u8>> {
    if s.len() % 2 != 0 {
        return Err(PodError::FileFormat("odd number of hex digits in S-Record line".into()));
    }
    (0..s.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&s[i..i + 2], 16)
                .map_err(|_| PodError::FileFormat(format!("invalid hex digits: {:?}", &s[i..i + 2])))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(name: &str, data: &[u8]) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!("openlink-test-{}-{}", std::process::id(), name));
        let mut f = fs::File::create(&path).unwrap();
        f.write_all(data).unwrap();
        path
    }

    fn minimal_be_elf(load_addr: u32, code: &[u8], entry: u32) -> Vec<u8> {
        let phoff = 52u32;
        let phentsize = 32u16;
        let phnum = 1u16;
        let mut buf = vec![0u8; phoff as usize + phentsize as usize];
        buf[0..4].copy_from_slice(&ELF_MAGIC);
        buf[4] = ELFCLASS32;
        buf[5] = ELFDATA2MSB;
        buf[6] = 1; // EI_VERSION
        BigEndian::write_u16(&mut buf[16..18], 2); // ET_EXEC
        BigEndian::write_u16(&mut buf[18..20], EM_68K);
        BigEndian::write_u32(&mut buf[24..28], entry);
        BigEndian::write_u32(&mut buf[28..32], phoff);
        BigEndian::write_u16(&mut buf[42..44], phentsize);
        BigEndian::write_u16(&mut buf[44..46], phnum);

        let ph = phoff as usize;
        BigEndian::write_u32(&mut buf[ph..ph + 4], PT_LOAD);
        let data_off = buf.len() as u32;
        BigEndian::write_u32(&mut buf[ph + 4..ph + 8], data_off);
        BigEndian::write_u32(&mut buf[ph + 8..ph + 12], load_addr);
        BigEndian::write_u32(&mut buf[ph + 16..ph + 20], code.len() as u32);
        BigEndian::write_u32(&mut buf[ph + 20..ph + 24], code.len() as u32);
        buf.extend_from_slice(code);
        buf
    }

    #[test]
    fn parses_minimal_elf_segment_and_entry() {
        let elf = minimal_be_elf(0x2000_0500, &[0xDE, 0xAD, 0xBE, 0xEF], 0x2000_0500);
        let (segments, entry) = parse_elf(&elf).unwrap();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].addr, 0x2000_0500);
        assert_eq!(segments[0].data, vec![0xDE, 0xAD, 0xBE, 0xEF]);
        assert_eq!(entry, 0x2000_0500);
    }

    #[test]
    fn rejects_little_endian_elf() {
        let mut elf = minimal_be_elf(0x2000_0500, &[0x00], 0);
        elf[5] = 1; // ELFDATA2LSB
        assert!(matches!(parse_elf(&elf), Err(PodError::FileFormat(_))));
    }

    #[test]
    fn load_flashloader_zero_fills_gaps() {
        let path = write_temp("loader.elf", &minimal_be_elf(0x2000_0500, &[0x01, 0x02], 0x2000_0500));
        let image = load_flashloader(&path).unwrap();
        assert_eq!(image.bytes, vec![0x01, 0x02]);
        fs::remove_file(path).ok();
    }

    #[test]
    fn raw_binary_requires_base() {
        let path = write_temp("fw.bin", &[0xAA; 4]);
        assert!(matches!(load(&path, None), Err(PodError::BadArgument(_))));
        fs::remove_file(path).ok();
    }

    #[test]
    fn raw_binary_with_base_loads_at_base() {
        let path = write_temp("fw2.bin", &[0x11, 0x22, 0x33, 0x44]);
        let image = load(&path, Some(0x1000)).unwrap();
        assert_eq!(image.min_addr, 0x1000);
        assert_eq!(image.bytes, vec![0x11, 0x22, 0x33, 0x44]);
        fs::remove_file(path).ok();
    }

    #[test]
    fn rejects_images_past_flash_ceiling() {
        let path = write_temp("big.bin", &[0xFF; 4]);
        let result = load(&path, Some(FLASH_SIZE - 1));
        assert!(matches!(result, Err(PodError::OutOfRange(_))));
        fs::remove_file(path).ok();
    }

    #[test]
    fn parses_srecord_data_and_fills_gap() {
        // S1 record: addr 0x0000, data [0x11, 0x22]
        // count = 1(addr bytes' count field itself uses 2 addr + 2 data + 1 checksum = 5)
        let rec1 = build_s1(0x0000, &[0x11, 0x22]);
        let rec2 = build_s1(0x0004, &[0x33, 0x44]);
        let term = build_s9(0x0000);
        let text = format!("{}\n{}\n{}\n", rec1, rec2, term);
        let path = write_temp("fw.srec", text.as_bytes());
        let (segments, entry) = parse_srecord(text.as_bytes()).unwrap();
        assert_eq!(segments.len(), 2);
        assert_eq!(entry, 0);
        let image = load(&path, None).unwrap();
        assert_eq!(image.bytes, vec![0x11, 0x22, 0xFF, 0xFF, 0x33, 0x44]);
        fs::remove_file(path).ok();
    }

    fn build_s1(addr: u16, data: &[u8]) -> String {
        let mut body = vec![(data.len() + 3) as u8];
        body.extend_from_slice(&addr.to_be_bytes());
        body.extend_from_slice(data);
        let sum: u32 = body.iter().map(|&b| b as u32).sum();
        let checksum = (sum as u8).wrapping_neg();
        let mut hex = String::from("S1");
        for b in &body {
            hex.push_str(&format!("{:02X}", b));
        }
        hex.push_str(&format!("{:02X}", checksum));
        hex
    }

    fn build_s9(addr: u16) -> String {
        let body = vec![3u8, (addr >> 8) as u8, (addr & 0xFF) as u8];
        let sum: u32 = body.iter().map(|&b| b as u32).sum();
        let checksum = (sum as u8).wrapping_neg();
        let mut hex = String::from("S9");
        for b in &body {
            hex.push_str(&format!("{:02X}", b));
        }
        hex.push_str(&format!("{:02X}", checksum));
        hex
    }

    #[test]
    fn rejects_srecord_checksum_mismatch() {
        let mut rec = build_s1(0x0000, &[0x11, 0x22]);
        rec.pop();
        rec.push('0'); // corrupt last checksum digit
        let text = format!("{}\n", rec);
        assert!(matches!(parse_srecord(text.as_bytes()), Err(PodError::FileFormat(_))));
    }
}
