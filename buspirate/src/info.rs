//! Parsing of the Bus Pirate's identity banner.
//!
//! The `i` terminal command prints three lines such as:
//!
//! ```text
//! Bus Pirate v3.5
//! Firmware v5.10 (r559)  Bootloader v4.4
//! DEVID:0x0447 REVID:0x3046 (24FJ64GA002 B8)
//! ```

/// Hardware revisions this library has been tested against.
pub const KNOWN_HARDWARE: &[&str] = &["v3.5", "v3.6"];
pub const KNOWN_FIRMWARE: &[&str] = &["v5.10", "v6.1", "v6.3", "v7.0"];
pub const KNOWN_BOOTLOADER: &[&str] = &["v4.4", "v4.5"];

/// `DeviceInfo` is an immutable snapshot of the identity banner.
///
/// Only trust the other fields when `valid` is set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceInfo {
    pub hardware_version: String,
    pub hardware_major: u8,
    pub firmware_version: String,
    pub firmware_major: u8,
    pub firmware_minor: u8,
    pub bootloader_version: String,
    pub bootloader_major: u8,
    pub bootloader_minor: u8,
    pub device_id: String,
    pub revision_id: String,
    pub mcu: String,
    /// All three version strings are known-good and well formed.
    pub valid: bool,
}

impl DeviceInfo {
    /// Parses the body of the `i` command's output.
    pub fn parse(banner: &str) -> Self {
        let mut info = DeviceInfo::default();

        let lines: Vec<&str> = banner
            .split(|c: char| c == '\r' || c == '\n')
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .collect();
        let (Some(hardware), Some(versions), Some(ids)) = (lines.first(), lines.get(1), lines.get(2))
        else {
            log::warn!("buspirate: identity banner has only {} lines", lines.len());
            return info;
        };

        let hardware: Vec<&str> = hardware.split_whitespace().collect();
        info.hardware_version = token(&hardware, 2);

        let versions: Vec<&str> = versions.split_whitespace().collect();
        info.firmware_version = token(&versions, 1);
        info.bootloader_version = token(&versions, 4);

        let ids: Vec<&str> = ids.split_whitespace().collect();
        info.device_id = field_value(&ids, 0);
        info.revision_id = field_value(&ids, 1);
        info.mcu = ids
            .iter()
            .skip(2)
            .map(|t| t.trim_matches(|c: char| c == '(' || c == ')'))
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join(" ");

        let hardware = parse_version(&info.hardware_version);
        let firmware = parse_version(&info.firmware_version);
        let bootloader = parse_version(&info.bootloader_version);
        if let Some((major, _)) = hardware {
            info.hardware_major = major;
        }
        if let Some((major, minor)) = firmware {
            info.firmware_major = major;
            info.firmware_minor = minor;
        }
        if let Some((major, minor)) = bootloader {
            info.bootloader_major = major;
            info.bootloader_minor = minor;
        }

        // Non-short-circuiting so that every mismatch gets logged.
        let known = known("hardware", &info.hardware_version, KNOWN_HARDWARE)
            & known("firmware", &info.firmware_version, KNOWN_FIRMWARE)
            & known("bootloader", &info.bootloader_version, KNOWN_BOOTLOADER);
        info.valid = known && hardware.is_some() && firmware.is_some() && bootloader.is_some();
        info
    }
}

fn token(tokens: &[&str], index: usize) -> String {
    tokens.get(index).copied().unwrap_or_default().to_string()
}

/// Value half of a `NAME:value` token.
fn field_value(tokens: &[&str], index: usize) -> String {
    tokens
        .get(index)
        .and_then(|t| t.split_once(':'))
        .map(|(_, value)| value.to_string())
        .unwrap_or_default()
}

fn known(kind: &str, version: &str, whitelist: &[&str]) -> bool {
    let ok = whitelist.contains(&version);
    if !ok {
        log::warn!("buspirate: unrecognised {} version {:?}", kind, version);
    }
    ok
}

/// Splits a `v<major>.<minor>` version string.
fn parse_version(version: &str) -> Option<(u8, u8)> {
    let (major, minor) = version.strip_prefix('v')?.split_once('.')?;
    let digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
    if !digits(major) || !digits(minor) {
        return None;
    }
    Some((major.parse().ok()?, minor.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    const BANNER: &str = "Bus Pirate v3.5\r\nFirmware v5.10 (r559)  Bootloader v4.4\r\nDEVID:0x0447 REVID:0x3046 (24FJ64GA002 B8)\r\nhttp://dangerousprototypes.com";

    #[test]
    fn test_parse_banner() {
        let info = DeviceInfo::parse(BANNER);
        assert!(info.valid);
        assert_eq!(info.hardware_version, "v3.5");
        assert_eq!(info.hardware_major, 3);
        assert_eq!(info.firmware_version, "v5.10");
        assert_eq!((info.firmware_major, info.firmware_minor), (5, 10));
        assert_eq!(info.bootloader_version, "v4.4");
        assert_eq!((info.bootloader_major, info.bootloader_minor), (4, 4));
        assert_eq!(info.device_id, "0x0447");
        assert_eq!(info.revision_id, "0x3046");
        assert_eq!(info.mcu, "24FJ64GA002 B8");
    }

    #[test]
    fn test_parse_tolerates_blank_lines() {
        let info = DeviceInfo::parse(&format!("\r\n\r\n{}\r\n", BANNER));
        assert!(info.valid);
    }

    #[test]
    fn test_unknown_versions_are_invalid() {
        let info = DeviceInfo::parse(&BANNER.replace("v5.10", "v5.11"));
        assert!(!info.valid);
        // Still parsed, just not trusted.
        assert_eq!(info.firmware_version, "v5.11");

        assert!(!DeviceInfo::parse(&BANNER.replace("v3.5", "v4")).valid);
        assert!(!DeviceInfo::parse(&BANNER.replace("v4.4", "v2.0")).valid);
    }

    #[test]
    fn test_truncated_banner() {
        let info = DeviceInfo::parse("Bus Pirate v3.5\r\nFirmware");
        assert!(!info.valid);
        assert_eq!(info, DeviceInfo::default());

        let info = DeviceInfo::parse("Bus Pirate\r\nFirmware\r\nDEVID");
        assert!(!info.valid);
        assert_eq!(info.hardware_version, "");
        assert_eq!(info.device_id, "");
    }

    #[test]
    fn test_parse_version() {
        assert_eq!(parse_version("v3.5"), Some((3, 5)));
        assert_eq!(parse_version("v5.10"), Some((5, 10)));
        assert_eq!(parse_version("v3b"), None);
        assert_eq!(parse_version("3.5"), None);
        assert_eq!(parse_version("v3."), None);
        assert_eq!(parse_version("v.5"), None);
    }
}
