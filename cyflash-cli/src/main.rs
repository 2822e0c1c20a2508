//! CLI front end: argument parsing, transport construction, progress rendering, and process
//! exit-code mapping around the `cyflash` flashing session.

use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use colored::Colorize;
use structopt::StructOpt;

use cyflash::session::{CancelSignal, ChunkSize, Confirmation, Options, ProgressEvent, ReinitDuration};
use cyflash::transport::Transport;
use cyflash::{BootloaderClient, CyflashError, Image, Session};

#[cfg(feature = "serial")]
use cyflash::transport::serial::{SerialSettings, SerialTransport};

#[cfg(feature = "can")]
use cyflash::transport::can::{CanSettings, CanTransport};

#[derive(Debug, StructOpt)]
#[structopt(
    name = "cyflash",
    about = "Flash Cypress PSoC bootloaders over serial or CAN"
)]
struct Opt {
    /// Path to the .cyacd firmware image
    #[structopt(parse(from_os_str))]
    image: PathBuf,

    /// Serial port device, e.g. /dev/ttyUSB0 or COM3
    #[structopt(long, conflicts_with = "canbus", required_unless = "canbus")]
    serial: Option<String>,

    /// CAN interface name, e.g. can0
    #[structopt(long, conflicts_with = "serial", required_unless = "serial")]
    canbus: Option<String>,

    /// Erase every image row before programming it
    #[structopt(long)]
    erase: bool,

    #[structopt(long = "serial_baudrate", default_value = "115200")]
    serial_baudrate: u32,

    /// Per-command timeout, in seconds
    #[structopt(long, default_value = "5")]
    timeout: f64,

    #[structopt(long, default_value = "N")]
    parity: String,

    #[structopt(long, default_value = "1")]
    stopbits: u8,

    /// Allow flashing an image with an older app version than the device reports
    #[structopt(long, conflicts_with = "nodowngrade")]
    downgrade: bool,

    /// Refuse to flash an image with an older app version than the device reports
    #[structopt(long, conflicts_with = "downgrade")]
    nodowngrade: bool,

    /// Allow flashing an image whose app id differs from the device's current app
    #[structopt(long, conflicts_with = "nonewapp")]
    newapp: bool,

    /// Refuse to flash an image whose app id differs from the device's current app
    #[structopt(long, conflicts_with = "newapp")]
    nonewapp: bool,

    /// SendData chunk size in bytes
    #[structopt(short = "c", long = "chunk-size", default_value = "32")]
    chunk_size: ChunkSize,

    /// Repetitive-init duration in seconds; 0 = single try, negative = retry forever
    #[structopt(short = "r", long = "reinit", default_value = "2")]
    reinit: f64,

    #[structopt(long = "canbus_channel")]
    canbus_channel: Option<String>,

    #[structopt(long = "canbus_baudrate", default_value = "500000")]
    canbus_baudrate: u32,

    #[structopt(long = "canbus_id", default_value = "0")]
    canbus_id: u32,

    #[structopt(long = "canbus_broadcast_id")]
    canbus_broadcast_id: Option<u32>,

    #[structopt(long = "canbus_wildcard_id")]
    canbus_wildcard_id: Option<u32>,

    #[structopt(long = "canbus_echo")]
    canbus_echo: bool,
}

/// Interactive yes/no prompt backed by `dialoguer`, used for the downgrade/different-app
/// confirmation policy.
struct TerminalConfirmation;

impl Confirmation for TerminalConfirmation {
    fn confirm(&mut self, prompt: &str) -> bool {
        dialoguer::Confirm::new()
            .with_prompt(prompt)
            .default(false)
            .interact()
            .unwrap_or(false)
    }
}

/// `Ctrl-C`-driven cancellation flag, set once from the `ctrlc` signal handler and polled by the
/// orchestrator between rows.
struct CtrlCSignal(Arc<AtomicBool>);

impl CancelSignal for CtrlCSignal {
    fn is_canceled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

fn parse_parity(s: &str) -> Result<serialport::Parity, String> {
    match s.to_ascii_uppercase().as_str() {
        "N" => Ok(serialport::Parity::None),
        "E" => Ok(serialport::Parity::Even),
        "O" => Ok(serialport::Parity::Odd),
        other => Err(format!("parity must be one of N, E, O, got {other}")),
    }
}

fn parse_stopbits(n: u8) -> Result<serialport::StopBits, String> {
    match n {
        1 => Ok(serialport::StopBits::One),
        2 => Ok(serialport::StopBits::Two),
        other => Err(format!("stopbits must be 1 or 2, got {other}")),
    }
}

fn build_transport(opt: &Opt) -> cyflash::Result<Box<dyn Transport>> {
    let timeout = Duration::from_secs_f64(opt.timeout.max(0.0));

    if let Some(port) = &opt.serial {
        #[cfg(feature = "serial")]
        {
            let parity = parse_parity(&opt.parity)
                .map_err(|e| CyflashError::ImageParse(e))?;
            let stop_bits = parse_stopbits(opt.stopbits)
                .map_err(|e| CyflashError::ImageParse(e))?;
            let settings = SerialSettings {
                port: port.clone(),
                baud_rate: opt.serial_baudrate,
                parity,
                stop_bits,
                timeout,
            };
            return Ok(Box::new(SerialTransport::open(&settings)?));
        }
        #[cfg(not(feature = "serial"))]
        {
            let _ = port;
            panic!("built without the `serial` feature");
        }
    }

    if let Some(interface) = &opt.canbus {
        #[cfg(feature = "can")]
        {
            let settings = CanSettings {
                interface: interface.clone(),
                channel: opt.canbus_channel.clone(),
                bitrate: opt.canbus_baudrate,
                device_id: opt.canbus_id,
                broadcast_id: opt.canbus_broadcast_id,
                wildcard_id: opt.canbus_wildcard_id,
                echo: opt.canbus_echo,
            };
            return Ok(Box::new(CanTransport::open(&settings)?));
        }
        #[cfg(not(feature = "can"))]
        {
            let _ = interface;
            panic!("built without the `can` feature");
        }
    }

    unreachable!("structopt requires either --serial or --canbus")
}

fn render_event(event: &ProgressEvent) {
    match event {
        ProgressEvent::EnteredBootloader { identity } => {
            println!(
                "{} silicon 0x{:08X} rev {} (bootloader {}.{}.{})",
                "entered bootloader".green(),
                identity.silicon_id,
                identity.silicon_rev,
                identity.version_major(),
                identity.version_minor(),
                identity.version_patch(),
            );
        }
        ProgressEvent::ArrayRange { array, first, last } => {
            println!(
                "{} array {} rows {}..{}",
                "flash range".cyan(),
                array,
                first,
                last
            );
        }
        ProgressEvent::Erasing { row, total, errors } => {
            print!(
                "\r{} row {} ({} errors)          ",
                "erasing".yellow(),
                row,
                errors
            );
            let _ = total;
        }
        ProgressEvent::Programming { row, total, errors } => {
            print!(
                "\r{} row {} ({} errors)          ",
                "programming".blue(),
                row,
                errors
            );
            let _ = total;
        }
        ProgressEvent::Verified { ok } => {
            println!();
            if *ok {
                println!("{}", "checksum verified".green());
            } else {
                println!("{}", "checksum verification failed".red());
            }
        }
        ProgressEvent::Rebooting => {
            println!("{}", "rebooting device".cyan());
        }
    }
}

fn run(opt: Opt) -> cyflash::Result<()> {
    let file = File::open(&opt.image)
        .map_err(|e| CyflashError::ImageParse(format!("cannot open {:?}: {e}", opt.image)))?;
    let image = Image::parse(BufReader::new(file))?;
    log::info!(
        "parsed image: silicon 0x{:08X} rev {}, {} rows",
        image.silicon_id,
        image.silicon_rev,
        image.rows.len()
    );

    let transport = build_transport(&opt)?;
    let client = BootloaderClient::new(transport, image.checksum_kind)
        .with_command_timeout(Duration::from_secs_f64(opt.timeout.max(0.0)));

    let options = Options {
        erase: opt.erase,
        chunk_size: opt.chunk_size,
        reinit_duration: ReinitDuration::from_secs(opt.reinit),
        allow_downgrade: opt.downgrade,
        allow_different_app: opt.newapp,
        app_index: 0,
        ..Options::default()
    };

    let canceled = Arc::new(AtomicBool::new(false));
    let handler_flag = canceled.clone();
    let _ = ctrlc::set_handler(move || {
        handler_flag.store(true, Ordering::SeqCst);
    });
    let cancel_signal = CtrlCSignal(canceled);

    let mut session = Session::new(client, options);
    let mut confirmation = TerminalConfirmation;

    session.flash(&image, &mut confirmation, &cancel_signal, |event| {
        render_event(&event);
    })
}

fn main() -> ExitCode {
    pretty_env_logger::init();
    let opt = Opt::from_args();

    match run(opt) {
        Ok(()) => ExitCode::from(0),
        Err(CyflashError::Canceled) => {
            eprintln!("{}", "canceled".yellow());
            ExitCode::from(1)
        }
        Err(err) => {
            log::error!("{err:#}");
            eprintln!("{} {err}", "error:".red());
            ExitCode::from(1)
        }
    }
}
