use std::path::PathBuf;

use structopt::StructOpt;

/// GDB remote-serial debug agent for ColdFire V2 (MCF5223x) targets over a
/// USB BDM pod.
///
/// Run with `--gdb` to listen for a GDB connection, or with `--erase`/
/// `--program` for a standalone one-shot flash operation.
#[derive(StructOpt, Debug)]
#[structopt(name = "openlink-coldfire")]
pub struct Opts {
    /// Start the GDB remote-serial server.
    #[structopt(long)]
    pub gdb: bool,

    /// TCP port the GDB server listens on.
    #[structopt(env = "GDB_PORT", short = "p", long = "port", default_value = "3333")]
    pub port: u16,

    /// Mass-erase the target's internal flash and exit.
    #[structopt(long)]
    pub erase: bool,

    /// Program `FILE` (ELF, S-Record, or raw binary) into flash and exit.
    #[structopt(long, value_name = "FILE")]
    pub program: Option<PathBuf>,

    /// Base address to load a raw `.bin` image at. Ignored for ELF/S-Record
    /// images, which carry their own addresses.
    #[structopt(long, value_name = "ADDR", parse(try_from_str = parse_u32))]
    pub base: Option<u32>,

    /// Read back and compare flash contents after `--program`.
    #[structopt(short = "v", long)]
    pub verify: bool,

    /// Enable verbose (debug-level) logging.
    #[structopt(long)]
    pub verbose: bool,

    /// Path to the on-target flashloader ELF image. Overrides the default
    /// search (`flashloader/flashloader.elf` in the current directory, then
    /// `/usr/local/share/openlink-coldfire/flashloader/flashloader.elf`).
    #[structopt(env = "OPENLINK_FLASHLOADER", long, value_name = "PATH")]
    pub flashloader: Option<PathBuf>,
}

fn parse_u32(s: &str) -> Result<u32, std::num::ParseIntError> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16)
    } else {
        s.parse()
    }
}

/// Default search path for the flashloader image relative to the current
/// working directory, tried before the system-wide install location.
const DEFAULT_FLASHLOADER_CWD: &str = "flashloader/flashloader.elf";
/// System-wide fallback install location.
const DEFAULT_FLASHLOADER_SYSTEM: &str = "/usr/local/share/openlink-coldfire/flashloader/flashloader.elf";

/// Resolves the flashloader image path: `--flashloader`/`OPENLINK_FLASHLOADER`
/// wins outright if given, otherwise the CWD-relative default is preferred
/// over the system-wide install location, and the CWD default is returned
/// even if it doesn't exist (so the resulting I/O error names the path GDB
/// users actually expect to populate).
pub fn resolve_flashloader_path(opts: &Opts) -> PathBuf {
    if let Some(explicit) = &opts.flashloader {
        return explicit.clone();
    }
    let cwd_default = PathBuf::from(DEFAULT_FLASHLOADER_CWD);
    if cwd_default.exists() {
        return cwd_default;
    }
    let system_default = PathBuf::from(DEFAULT_FLASHLOADER_SYSTEM);
    if system_default.exists() {
        return system_default;
    }
    cwd_default
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_hex_and_decimal_base_addresses() {
        assert_eq!(parse_u32("0x20000000").unwrap(), 0x2000_0000);
        assert_eq!(parse_u32("1024").unwrap(), 1024);
    }

    #[test]
    fn explicit_flashloader_path_wins() {
        let opts = Opts {
            gdb: false,
            port: 3333,
            erase: false,
            program: None,
            base: None,
            verify: false,
            verbose: false,
            flashloader: Some(PathBuf::from("/tmp/custom.elf")),
        };
        assert_eq!(resolve_flashloader_path(&opts), PathBuf::from("/tmp/custom.elf"));
    }
}
