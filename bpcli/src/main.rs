//! bpcli - bench bring-up tool for the `buspirate` crate

use buspirate::sim::SimBusPirate;
use buspirate::spi::{ChipSelectMode, ClockMode, Setup, Spi};
use buspirate::transport::serial::{Connection, SerialSettings};
use buspirate::{BusPirate, Config, Transport};
use clap::{Parser, Subcommand, ValueEnum};

/// Parse a string of hex digits, optionally `0x`-prefixed, into bytes
fn parse_hex_bytes(s: &str) -> Result<Vec<u8>, String> {
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    if digits.is_empty() || digits.len() % 2 != 0 {
        return Err(format!("Invalid hex bytes: {}", s));
    }
    (0..digits.len())
        .step_by(2)
        .map(|i| {
            digits
                .get(i..i + 2)
                .and_then(|pair| u8::from_str_radix(pair, 16).ok())
                .ok_or_else(|| format!("Invalid hex bytes: {}", s))
        })
        .collect()
}

#[derive(Parser)]
#[command(name = "bpcli")]
#[command(author, version, about = "Bus Pirate SPI bring-up tool", long_about = None)]
struct Cli {
    /// Verbosity level (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Serial port of the Bus Pirate, or a dev=<path>[:<baud>] string
    #[arg(long, default_value = "/dev/ttyUSB0", global = true)]
    port: String,

    #[arg(long, default_value_t = 115_200, global = true)]
    baud: u32,

    /// Talk to a simulated Bus Pirate instead of real hardware
    #[arg(long, global = true)]
    simulate: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the Bus Pirate's identity
    Info,
    /// Return the Bus Pirate to its terminal
    Reset,
    /// Run one SPI transaction and print the bytes read
    Spi {
        /// Clock frequency in Hz
        #[arg(long, default_value_t = 1_000_000)]
        speed: u32,

        /// SPI mode number
        #[arg(long, default_value_t = 0, value_parser = clap::value_parser!(u8).range(0..=3))]
        mode: u8,

        #[arg(long, value_enum, default_value_t = CsArg::Auto)]
        cs: CsArg,

        /// Use the Bus Pirate's write-then-read command and read this many bytes
        /// after writing, instead of a full-duplex transfer
        #[arg(long)]
        read: Option<usize>,

        /// Bytes to write, as hex (e.g. 9f000000)
        data: Vec<String>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum CsArg {
    Auto,
    Between,
    Manual,
}

impl From<CsArg> for ChipSelectMode {
    fn from(cs: CsArg) -> Self {
        match cs {
            CsArg::Auto => ChipSelectMode::AutoAfterTransfer,
            CsArg::Between => ChipSelectMode::AutoBetweenTransfer,
            CsArg::Manual => ChipSelectMode::Manual,
        }
    }
}

fn clock_mode(mode: u8) -> ClockMode {
    match mode {
        1 => ClockMode::Mode1,
        2 => ClockMode::Mode2,
        3 => ClockMode::Mode3,
        _ => ClockMode::Mode0,
    }
}

fn transport(cli: &Cli) -> Result<Transport, String> {
    if cli.simulate {
        return Ok(Transport::new(SimBusPirate::new()));
    }
    if cli.port.starts_with("dev=") {
        let conn = Connection::parse(&cli.port)?;
        let settings = conn.settings();
        return Ok(Transport::serial(&conn.device, settings));
    }
    let settings = SerialSettings {
        baud_rate: cli.baud,
        ..SerialSettings::default()
    };
    Ok(Transport::serial(&cli.port, settings))
}

fn log_level(verbose: u8) -> log::LevelFilter {
    match verbose {
        0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    }
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse CLI arguments first to get the verbosity
    let cli = Cli::parse();

    env_logger::Builder::from_default_env()
        .filter_level(log_level(cli.verbose))
        .init();

    let mut bp = BusPirate::new(transport(&cli)?, Config::default());
    if let Err(e) = bp.open() {
        log::error!("Failed to open Bus Pirate on {}: {}", bp.transport_mut().name(), e);
        return Err(e.into());
    }

    match cli.command {
        Commands::Info => {
            if let Some(info) = bp.device_info() {
                println!("Hardware:   {}", info.hardware_version);
                println!("Firmware:   {}", info.firmware_version);
                println!("Bootloader: {}", info.bootloader_version);
                println!("Device ID:  {} rev {}", info.device_id, info.revision_id);
                println!("MCU:        {}", info.mcu);
            }
            bp.close();
        }
        Commands::Reset => {
            bp.reset()?;
            bp.close();
            println!("Bus Pirate reset to terminal mode");
        }
        Commands::Spi {
            speed,
            mode,
            cs,
            read,
            data,
        } => {
            let mut tx = Vec::new();
            for chunk in &data {
                tx.extend(parse_hex_bytes(chunk)?);
            }
            let mut spi = Spi::new(bp);
            spi.init(&Setup {
                mode: clock_mode(mode),
                clock_frequency: speed,
                chip_select_mode: cs.into(),
                ..Setup::default()
            })?;
            log::info!("SPI clock {} Hz", spi.get_clock_frequency());

            let result = match read {
                Some(len) => spi.write_then_read(&tx, len),
                None => {
                    let mut rx = vec![0u8; tx.len()];
                    spi.read_write_bytes(&tx, &mut rx).map(|()| rx)
                }
            };
            let deinit = spi.deinit();
            let rx = result?;
            deinit?;
            println!("{}", to_hex(&rx));
        }
    }

    Ok(())
}
