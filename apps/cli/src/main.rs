use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use ptu_core::firmware::{FwBinHeader, FwVersion};
use ptu_core::protocol::constants::PRIMARY_FW_BIN_FILE_NUM;
use ptu_core::self_test::{OutputFormat, SelfTestId};
use ptu_core::session::{Session, SessionConfig};
use ptu_core::state::FlashLoader;
use tracing::{debug, error, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "Touch controller firmware updater", long_about = None)]
struct Args {
    /// hidraw node of the touch device (e.g. /dev/hidraw0)
    hidraw: PathBuf,

    /// I2C bus of the touch device; required for the PIP2 ROM boot loader
    #[arg(long)]
    i2c_bus: Option<u32>,

    /// I2C slave address of the touch device
    #[arg(long, value_parser = parse_u8)]
    i2c_addr: Option<u8>,

    /// TOML configuration file; command line flags take precedence
    #[arg(long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show the version of the firmware running on the touch processor
    CheckActive,
    /// Show the version in the header of a firmware bin (no device access)
    CheckTarget {
        bin: PathBuf,
    },
    /// Query and show the device state
    Status,
    /// Write a firmware bin to a flash file
    Update {
        bin: PathBuf,
        /// Flash file number to write
        #[arg(long, default_value_t = PRIMARY_FW_BIN_FILE_NUM)]
        file: u8,
        /// Config files to erase before writing (0 skips an entry)
        #[arg(long, num_args = 1..)]
        erase: Vec<u8>,
        /// Flash loaders to try, in order
        #[arg(long, value_enum, num_args = 1..)]
        loader: Vec<LoaderArg>,
        /// Write even if the active firmware already has the target version
        #[arg(long)]
        force: bool,
    },
    /// Run a firmware self-test and print the results
    SelfTest {
        #[arg(value_parser = parse_u8)]
        id: u8,
        /// Result width: 1 (bytes) or 2 (words)
        #[arg(long, default_value_t = 2, value_parser = clap::value_parser!(u8).range(1..=2))]
        format: u8,
        /// Sign-extend word results
        #[arg(long)]
        signed: bool,
        /// Number of values expected
        #[arg(long)]
        len: Option<usize>,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum LoaderArg {
    TouchProgrammer,
    RomBootloader,
    AuxProgrammer,
}

impl From<LoaderArg> for FlashLoader {
    fn from(arg: LoaderArg) -> Self {
        match arg {
            LoaderArg::TouchProgrammer => FlashLoader::TouchProgrammerImage,
            LoaderArg::RomBootloader => FlashLoader::RomBootloader,
            LoaderArg::AuxProgrammer => FlashLoader::AuxProgrammerImage,
        }
    }
}

/// Accepts decimal or `0x`-prefixed hex.
fn parse_u8(s: &str) -> Result<u8, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u8::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("'{s}' is not a byte value: {e}"))
}

fn main() {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to install the log subscriber: {e}");
        std::process::exit(1);
    }

    info!("ptupdater v{}", env!("CARGO_PKG_VERSION"));

    if let Err(e) = run(args) {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn load_config(args: &Args) -> Result<SessionConfig> {
    let mut config = match &args.config {
        Some(path) => SessionConfig::load_from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => SessionConfig::default(),
    };
    config.hidraw_path = Some(args.hidraw.clone());
    if let Some(bus) = args.i2c_bus {
        config.i2c_bus = Some(bus);
    }
    if let Some(address) = args.i2c_addr {
        config.i2c_address = address;
    }
    Ok(config)
}

fn run(args: Args) -> Result<()> {
    let config = load_config(&args)?;
    debug!(hidraw = %args.hidraw.display(), "HIDRAW node");

    // Reading a bin header needs no device.
    if let Command::CheckTarget { bin } = &args.command {
        let header = FwBinHeader::from_file(bin)?;
        println!("Target Version: {}", FwVersion::from_bin_header(&header));
        return Ok(());
    }

    let mut session = Session::new(&config);
    let result = setup(&mut session, &config).and_then(|()| execute(&mut session, args.command));
    let teardown = session.teardown().context("Teardown failed");
    result.and(teardown)
}

fn setup(session: &mut Session, config: &SessionConfig) -> Result<()> {
    match config.i2c_bus {
        Some(bus) => session
            .open_i2c(bus, config.i2c_address)
            .context("Failed to set up the PIP2 API")?,
        None => debug!("PIP2 interface will not be used because the I2C bus was not specified"),
    }

    let hidraw = config
        .hidraw_path
        .as_deref()
        .context("No hidraw node given")?;
    if let Err(e) = session.open_hidraw(hidraw) {
        if !session.pip2().is_active() {
            return Err(e).context(
                "The HIDRAW interface is unavailable; the touch device may be stuck in \
                 the ROM boot loader or its firmware images may be corrupt",
            );
        }
        warn!(
            "The HIDRAW interface is unavailable ({}). The device is probably stuck in \
             the ROM boot loader; updating through PIP2 is still possible, but the host \
             needs a restart for HIDRAW to enumerate again",
            e
        );
    }
    Ok(())
}

fn execute(session: &mut Session, command: Command) -> Result<()> {
    match command {
        Command::CheckActive => {
            let version = session.active_firmware_version()?.unwrap_or_else(|| {
                warn!("The active firmware could not be queried; an update is required");
                FwVersion::UNKNOWN
            });
            println!("Active Version: {}", version);
        }
        Command::CheckTarget { .. } => {}
        Command::Status => {
            let state = session.determine_state()?;
            println!("State: {}", state);
            println!("Flash loader: {}", session.loader());
        }
        Command::Update {
            bin,
            file,
            erase,
            loader,
            force,
        } => update(session, &bin, file, &erase, &loader, force)?,
        Command::SelfTest {
            id,
            format,
            signed,
            len,
        } => {
            let output = OutputFormat::from_id(format)
                .with_context(|| format!("Unsupported output format {format}"))?;
            let name = SelfTestId::from_u8(id).map_or("Unknown self-test", SelfTestId::name);
            let report = session.run_self_test(id, output, &[], signed, len)?;
            println!(
                "{} (0x{:02X}): {} values in {}",
                name,
                id,
                report.values.len(),
                report.unit
            );
            for row in report.values.chunks(16) {
                let line: Vec<String> = row.iter().map(i32::to_string).collect();
                println!("{}", line.join(" "));
            }
        }
    }
    Ok(())
}

fn update(
    session: &mut Session,
    bin: &std::path::Path,
    file: u8,
    erase: &[u8],
    loaders: &[LoaderArg],
    force: bool,
) -> Result<()> {
    let image =
        std::fs::read(bin).with_context(|| format!("Failed to read {}", bin.display()))?;
    let target = FwVersion::from_bin_header(&FwBinHeader::parse(&image)?);
    info!(target = %target, "Target firmware");

    if file == PRIMARY_FW_BIN_FILE_NUM && !force {
        if let Some(active) = session.active_firmware_version()? {
            info!(active = %active, "Active firmware");
            if active == target {
                println!("Firmware is already at version {}", target);
                return Ok(());
            }
        }
    }

    let loaders: Vec<FlashLoader> = if loaders.is_empty() {
        vec![FlashLoader::TouchProgrammerImage, FlashLoader::RomBootloader]
    } else {
        loaders.iter().copied().map(FlashLoader::from).collect()
    };
    session.write_image_to_flash_file(file, &image, erase, &loaders)?;

    match session.active_firmware_version()? {
        Some(active) => println!("Active Version: {}", active),
        None => warn!("Flash file written, but the firmware is not scanning"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_u8() {
        assert_eq!(parse_u8("0x24"), Ok(0x24));
        assert_eq!(parse_u8("36"), Ok(36));
        assert!(parse_u8("0x100").is_err());
    }

    #[test]
    fn test_cli_overrides_config() {
        let args = Args::parse_from([
            "ptupdater",
            "/dev/hidraw3",
            "--i2c-bus",
            "2",
            "--i2c-addr",
            "0x48",
            "update",
            "fw.bin",
            "--erase",
            "3",
            "0",
            "--loader",
            "rom-bootloader",
        ]);
        let config = load_config(&args).unwrap();
        assert_eq!(config.hidraw_path, Some(PathBuf::from("/dev/hidraw3")));
        assert_eq!(config.i2c_bus, Some(2));
        assert_eq!(config.i2c_address, 0x48);
        match args.command {
            Command::Update {
                file, erase, loader, ..
            } => {
                assert_eq!(file, 1);
                assert_eq!(erase, vec![3, 0]);
                assert_eq!(FlashLoader::from(loader[0]), FlashLoader::RomBootloader);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_self_test_format_range() {
        assert!(Args::try_parse_from(["ptupdater", "/dev/hidraw0", "self-test", "5", "--format", "3"]).is_err());
        let args = Args::parse_from(["ptupdater", "/dev/hidraw0", "self-test", "0x05", "--signed"]);
        assert!(matches!(
            args.command,
            Command::SelfTest {
                id: 5,
                format: 2,
                signed: true,
                len: None
            }
        ));
    }
}
