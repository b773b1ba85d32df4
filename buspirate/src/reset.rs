//! Recovery of the Bus Pirate from an unknown mode.
//!
//! The command that returns the Bus Pirate to its terminal depends on which
//! mode it is actually in, and the host cannot know that in advance (another
//! program may have left it in a binary mode). `BusPirate::reset` therefore
//! tries each strategy of `RESET_CASCADE` in order and stops at the first one
//! the Bus Pirate confirms.

use crate::hiz::Prompt;
use crate::transport::{find_subslice, Delimiter, Transport};
use crate::{BusPirate, Config, Error, Mode, Result, PROTO_VERSION_MSG, SUCCESS};

/// Binary-mode command that resets the Bus Pirate back to its terminal.
pub const BB_RESET: u8 = 0x0F;

const TERMINAL_RESET: &[u8] = b"#\n";

/// Matches the first prompt printed after the `RESET` banner. Prompts
/// answering the pings can still be in transit when the flush runs, so
/// earlier prompts do not count.
struct ResetPrompt;

impl Delimiter for ResetPrompt {
    fn matches(&self, received: &[u8]) -> bool {
        find_subslice(received, b"RESET").is_some_and(|at| Prompt::find(&received[at..]).is_some())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetStrategy {
    /// The Bus Pirate is at a terminal prompt: type `#`.
    Terminal,
    /// The Bus Pirate is in bit-bang root mode: send the binary reset command.
    BitBangRoot,
    /// The Bus Pirate is in one of the binary protocol modes: step back to
    /// bit-bang root first, then reset from there.
    BitBangHwMode,
}

/// Strategies in the order they are attempted.
pub const RESET_CASCADE: [ResetStrategy; 3] = [
    ResetStrategy::Terminal,
    ResetStrategy::BitBangRoot,
    ResetStrategy::BitBangHwMode,
];

impl ResetStrategy {
    /// Runs this strategy once. `Ok` means the Bus Pirate confirmed it is back at
    /// its terminal.
    pub fn attempt(self, transport: &mut Transport, config: &Config) -> Result<()> {
        match self {
            ResetStrategy::Terminal => reset_terminal(transport, config),
            ResetStrategy::BitBangRoot => reset_bitbang_root(transport, config),
            ResetStrategy::BitBangHwMode => reset_bitbang_hw_mode(transport, config),
        }
    }
}

fn reset_terminal(transport: &mut Transport, config: &Config) -> Result<()> {
    for _ in 0..config.ping_count {
        transport.write(b"\n")?;
    }
    transport.flush()?;
    transport.write(TERMINAL_RESET)?;

    transport.read_until(&ResetPrompt, config.command_timeout)?;
    Ok(())
}

fn reset_bitbang_root(transport: &mut Transport, config: &Config) -> Result<()> {
    transport.flush()?;
    transport.write(&[BB_RESET])?;
    let response = transport.read_exact(1, config.command_timeout)?;
    match response.first() {
        Some(&SUCCESS) => Ok(()),
        _ => Err(Error::Nak { command: BB_RESET }),
    }
}

fn reset_bitbang_hw_mode(transport: &mut Transport, config: &Config) -> Result<()> {
    transport.flush()?;
    transport.write(&[crate::bitbang::BB_INIT])?;
    transport.read_until(PROTO_VERSION_MSG, config.command_timeout)?;
    reset_bitbang_root(transport, config)
}

impl BusPirate {
    /// `reset` returns the Bus Pirate to terminal (HiZ) mode from whatever mode it
    /// is in.
    ///
    /// Connection failures end the cascade immediately. If no strategy
    /// succeeds the mode becomes `Invalid` and the cached identity is
    /// dropped.
    pub fn reset(&mut self) -> Result<()> {
        for strategy in RESET_CASCADE {
            match strategy.attempt(&mut self.transport, &self.config) {
                Ok(()) => {
                    log::debug!("buspirate: reset via {:?}", strategy);
                    self.mode = Mode::HiZ;
                    return Ok(());
                }
                Err(e) if e.is_connection_error() => {
                    self.invalidate();
                    return Err(e);
                }
                Err(e) => log::warn!("buspirate: {:?} reset failed: {}", strategy, e),
            }
        }

        self.invalidate();
        Err(Error::Protocol(
            "the Bus Pirate did not respond to any reset sequence".into(),
        ))
    }
}
