use std::fmt::Display;

use thiserror::Error;

/// Longest command the protocol allows on the wire
pub const MAX_COMMAND_LEN: usize = 64;

/// Fastboot commands in their ASCII wire form
///
/// The [Display] implementation renders exactly the bytes to be sent as a
/// single bulk OUT transfer.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum FastbootCommand<S> {
    /// Retrieve a variable
    GetVar(S),
    /// Announce a download of the given size
    Download(u32),
    /// Flash previously downloaded data to a partition
    Flash(S),
    /// Erase a partition
    Erase(S),
    /// Select the active slot
    SetActive(S),
    /// Reboot into the OS
    Reboot,
    /// Reboot into the bootloader
    RebootBootloader,
    /// Reboot into userspace fastboot
    RebootFastboot,
    /// Reboot into recovery
    RebootRecovery,
    /// Vendor specific command
    Oem(S),
    /// Unlock flashing
    FlashingUnlock,
    /// Lock flashing
    FlashingLock,
    /// Continue the boot process
    Continue,
}

impl<S: Display> Display for FastbootCommand<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::GetVar(var) => write!(f, "getvar:{var}"),
            Self::Download(size) => write!(f, "download:{size:08x}"),
            Self::Flash(target) => write!(f, "flash:{target}"),
            Self::Erase(target) => write!(f, "erase:{target}"),
            Self::SetActive(slot) => write!(f, "set_active:{slot}"),
            Self::Reboot => write!(f, "reboot"),
            Self::RebootBootloader => write!(f, "reboot-bootloader"),
            Self::RebootFastboot => write!(f, "reboot-fastboot"),
            Self::RebootRecovery => write!(f, "reboot-recovery"),
            Self::Oem(cmd) => write!(f, "oem {cmd}"),
            Self::FlashingUnlock => write!(f, "flashing unlock"),
            Self::FlashingLock => write!(f, "flashing lock"),
            Self::Continue => write!(f, "continue"),
        }
    }
}

/// Reply parsing errors
#[derive(Debug, Clone, Error, Eq, PartialEq)]
pub enum ResponseParseError {
    #[error("Reply is shorter than the 4 byte tag")]
    TruncatedReply,
    #[error("Unknown reply tag: {0:?}")]
    UnknownTag([u8; 4]),
    #[error("Invalid DATA length: {0}")]
    BadDataLength(String),
}

/// A single device reply
///
/// Every reply is one bulk IN transfer tagged by its first 4 bytes. `Info`
/// and `Text` are purely informational; a command completes on `Okay` or
/// `Fail`.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum FastbootResponse {
    Okay(String),
    Fail(String),
    Info(String),
    Text(String),
    Data(u32),
}

impl FastbootResponse {
    /// Parse a reply from the bytes of a bulk IN transfer
    pub fn from_bytes(bytes: &[u8]) -> Result<FastbootResponse, ResponseParseError> {
        if bytes.len() < 4 {
            return Err(ResponseParseError::TruncatedReply);
        }
        let (tag, rest) = bytes.split_at(4);
        let msg = String::from_utf8_lossy(rest)
            .trim_end_matches('\0')
            .to_string();
        match tag {
            b"OKAY" => Ok(FastbootResponse::Okay(msg)),
            b"FAIL" => Ok(FastbootResponse::Fail(msg)),
            b"INFO" => Ok(FastbootResponse::Info(msg)),
            b"TEXT" => Ok(FastbootResponse::Text(msg)),
            b"DATA" => {
                let size = u32::from_str_radix(msg.trim(), 16)
                    .map_err(|_| ResponseParseError::BadDataLength(msg))?;
                Ok(FastbootResponse::Data(size))
            }
            _ => Err(ResponseParseError::UnknownTag([
                tag[0], tag[1], tag[2], tag[3],
            ])),
        }
    }
}

/// Parse an unsigned variable value given as hex with a 0x prefix or as
/// decimal
///
/// Devices report numeric variables such as `max-download-size` and
/// `partition-size:<name>` in either base; negative values are never valid.
pub fn parse_var_u64(value: &str) -> Option<u64> {
    let value = value.trim();
    if let Some(hex) = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
    {
        u64::from_str_radix(hex, 16).ok()
    } else {
        value.parse().ok()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn command_wire_forms() {
        assert_eq!(
            FastbootCommand::GetVar("product").to_string(),
            "getvar:product"
        );
        assert_eq!(
            FastbootCommand::<&str>::Download(0x100000).to_string(),
            "download:00100000"
        );
        assert_eq!(FastbootCommand::Flash("boot_a").to_string(), "flash:boot_a");
        assert_eq!(FastbootCommand::Erase("cache").to_string(), "erase:cache");
        assert_eq!(
            FastbootCommand::SetActive("b").to_string(),
            "set_active:b"
        );
        assert_eq!(FastbootCommand::<&str>::Reboot.to_string(), "reboot");
        assert_eq!(
            FastbootCommand::<&str>::RebootBootloader.to_string(),
            "reboot-bootloader"
        );
        assert_eq!(
            FastbootCommand::Oem("device-info").to_string(),
            "oem device-info"
        );
        assert_eq!(
            FastbootCommand::<&str>::FlashingUnlock.to_string(),
            "flashing unlock"
        );
        assert_eq!(FastbootCommand::<&str>::Continue.to_string(), "continue");
    }

    #[test]
    fn response_parsing() {
        assert_eq!(
            FastbootResponse::from_bytes(b"OKAYpixel").unwrap(),
            FastbootResponse::Okay("pixel".into())
        );
        assert_eq!(
            FastbootResponse::from_bytes(b"FAILnot allowed").unwrap(),
            FastbootResponse::Fail("not allowed".into())
        );
        assert_eq!(
            FastbootResponse::from_bytes(b"INFOmax-download-size:0x1000000").unwrap(),
            FastbootResponse::Info("max-download-size:0x1000000".into())
        );
        assert_eq!(
            FastbootResponse::from_bytes(b"TEXThello").unwrap(),
            FastbootResponse::Text("hello".into())
        );
        assert_eq!(
            FastbootResponse::from_bytes(b"DATA00100000").unwrap(),
            FastbootResponse::Data(0x100000)
        );
        assert_eq!(
            FastbootResponse::from_bytes(b"OKAY").unwrap(),
            FastbootResponse::Okay(String::new())
        );
    }

    #[test]
    fn response_trailing_nul_trimmed() {
        assert_eq!(
            FastbootResponse::from_bytes(b"OKAYpixel\0\0\0").unwrap(),
            FastbootResponse::Okay("pixel".into())
        );
    }

    #[test]
    fn response_rejects_garbage() {
        assert_eq!(
            FastbootResponse::from_bytes(b"OK"),
            Err(ResponseParseError::TruncatedReply)
        );
        assert_eq!(
            FastbootResponse::from_bytes(b"WHAT is this"),
            Err(ResponseParseError::UnknownTag(*b"WHAT"))
        );
        assert!(matches!(
            FastbootResponse::from_bytes(b"DATAzzzzzzzz"),
            Err(ResponseParseError::BadDataLength(_))
        ));
    }

    #[test]
    fn variable_number_parsing() {
        assert_eq!(parse_var_u64("0x1000000"), Some(0x1000000));
        assert_eq!(parse_var_u64("0X10"), Some(16));
        assert_eq!(parse_var_u64("268435456"), Some(268435456));
        assert_eq!(parse_var_u64(" 4096 "), Some(4096));
        assert_eq!(parse_var_u64("-1"), None);
        assert_eq!(parse_var_u64("0x"), None);
        assert_eq!(parse_var_u64("banana"), None);
    }
}
