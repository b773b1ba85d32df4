//! Terminal ("HiZ") mode command framing.
//!
//! In terminal mode the Bus Pirate echoes every character it receives and ends
//! each response with a fresh prompt naming the current mode, such as
//! `\r\nHiZ>` or `\r\nSPI>`.

use crate::transport::{find_subslice, Delimiter};
use crate::{BusPirate, Result};

/// Matches the `\r\n<mode>>` prompt that terminates a terminal response.
#[derive(Debug, Clone, Copy, Default)]
pub struct Prompt;

impl Prompt {
    /// Offset of the `\r\n` that starts the first prompt in `received`.
    pub fn find(received: &[u8]) -> Option<usize> {
        let mut start = 0;
        while let Some(pos) = find_subslice(&received[start..], b"\r\n") {
            let at = start + pos;
            let name = &received[at + 2..];
            let name_len = name.iter().take_while(|&&b| is_mode_name_byte(b)).count();
            if name_len > 0 && name.get(name_len) == Some(&b'>') {
                return Some(at);
            }
            start = at + 1;
        }
        None
    }
}

impl Delimiter for Prompt {
    fn matches(&self, received: &[u8]) -> bool {
        Prompt::find(received).is_some()
    }
}

fn is_mode_name_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'-' || b == b'_'
}

/// Strips the echoed command, the line break after it and the trailing
/// prompt from a raw terminal response.
pub(crate) fn strip_terminal_framing<'a>(command: &[u8], raw: &'a [u8]) -> &'a [u8] {
    let end = Prompt::find(raw).unwrap_or(raw.len());
    let body = &raw[..end];
    let body = body.strip_prefix(command).unwrap_or(body);
    body.strip_prefix(b"\r\n").unwrap_or(body)
}

impl BusPirate {
    /// Types `command` at the terminal without waiting for its output.
    pub fn send_command(&mut self, command: &str) -> Result<()> {
        self.transport.flush()?;
        self.transport.write(format!("{}\n", command).as_bytes())?;
        Ok(())
    }

    /// Types `command` at the terminal and returns its output, without the
    /// echo and the closing prompt.
    pub fn send_responsive_command(&mut self, command: &str) -> Result<String> {
        let timeout = self.config.command_timeout;
        self.transport.flush()?;
        self.transport.write(format!("{}\n", command).as_bytes())?;
        let raw = self.transport.read_until(&Prompt, timeout)?;

        let body = strip_terminal_framing(command.as_bytes(), &raw);
        log::debug!("buspirate: {:?} -> {} bytes", command, body.len());
        Ok(String::from_utf8_lossy(body).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimBusPirate;
    use crate::test_support::opened;

    #[test]
    fn test_prompt_matching() {
        assert_eq!(Prompt::find(b"i\r\nHiZ>"), Some(1));
        assert_eq!(Prompt::find(b"\r\nSPI>"), Some(0));
        assert_eq!(Prompt::find(b"\r\nRESET\r\nhttp://x\r\n"), None);
        assert_eq!(Prompt::find(b"\r\n>"), None);
        assert_eq!(Prompt::find(b"\r\nHiZ"), None);
        assert!(Prompt.matches(b"abc\r\n\r\nHiZ>"));
    }

    #[test]
    fn test_strip_framing() {
        let raw = b"i\r\nBus Pirate v3.5\r\nFirmware v5.10\r\nHiZ>";
        assert_eq!(
            strip_terminal_framing(b"i", raw),
            b"Bus Pirate v3.5\r\nFirmware v5.10"
        );
        assert_eq!(strip_terminal_framing(b"", b"\r\nHiZ>"), b"");
    }

    #[test]
    fn test_responsive_command() {
        let sim = SimBusPirate::new();
        let mut bp = opened(&sim);
        let out = bp.send_responsive_command("i").unwrap();
        assert!(out.starts_with("Bus Pirate v3.5\r\n"));
        assert!(!out.contains("HiZ>"));

        let out = bp.send_responsive_command("x").unwrap();
        assert!(out.contains("Syntax error"));
    }

    #[test]
    fn test_send_command_discards_output() {
        let sim = SimBusPirate::new();
        let mut bp = opened(&sim);
        bp.send_command("i").unwrap();
        let out = bp.send_responsive_command("i").unwrap();
        assert!(out.starts_with("Bus Pirate"));
    }
}
