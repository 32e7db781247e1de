use thiserror::Error;

/// Every error this crate can surface, from the USB transport up through the
/// GDB packet layer.
#[derive(Error, Debug)]
pub enum PodError {
    /// A `rusb` transfer failed (claim, write, or read).
    #[error("USB I/O error: {0}")]
    UsbIo(#[from] rusb::Error),

    /// A bulk IN transfer did not complete within its deadline. Distinct from
    /// [`PodError::UsbIo`] because the freeze-check path treats this as
    /// "target still running", not a failure.
    #[error("USB transfer timed out")]
    UsbTimeout,

    /// Response did not start with `99 66` / `88 A5`, or was shorter than the
    /// minimum 5-byte header.
    #[error("malformed response framing: {0}")]
    ProtocolFraming(String),

    /// Response framing was fine but the status byte wasn't `0xEE`.
    #[error("pod reported status 0x{0:02x} (expected 0xee)")]
    ProtocolStatus(u8),

    #[error("bad argument: {0}")]
    BadArgument(String),

    #[error("target has not completed bring-up")]
    TargetNotInitialized,

    /// A flashloader RPC completed but reported a non-success result code.
    #[error("flash operation failed: result=0x{result:02x} cfmustat=0x{cfmustat:02x}")]
    FlashResult { result: u32, cfmustat: u8 },

    #[error("unrecognized or malformed firmware file: {0}")]
    FileFormat(String),

    #[error("address/length out of range: {0}")]
    OutOfRange(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, PodError>;

impl PodError {
    /// Maps this error onto a GDB RSP `E xx` error-number payload, per the
    /// propagation policy: parse errors -> 01, I/O-class -> 05, allocation ->
    /// 0C, range/bad-arg -> 0E, flash failure -> 10.
    pub fn gdb_errno(&self) -> u8 {
        match self {
            PodError::BadArgument(_) => 0x01,
            PodError::UsbIo(_) | PodError::UsbTimeout | PodError::ProtocolFraming(_) => 0x05,
            PodError::ProtocolStatus(_) => 0x05,
            PodError::Io(_) => 0x05,
            PodError::Internal(_) => 0x05,
            PodError::TargetNotInitialized => 0x05,
            PodError::OutOfRange(_) => 0x0e,
            PodError::FlashResult { .. } => 0x10,
            PodError::FileFormat(_) => 0x01,
        }
    }
}
