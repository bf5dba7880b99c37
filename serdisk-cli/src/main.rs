//! serdiskd - serve a host directory to a serial remote drive.
//!
//! Usage:
//!   serdiskd [-D]... [-s BAUD] <device> [<root-dir>]
//!
//! Examples:
//!   serdiskd /dev/ttyUSB0                # serve the current directory
//!   serdiskd -s 19200 /dev/ttyUSB0 /srv/guest
//!   serdiskd -DD /dev/ttyUSB0            # with command tracing

use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgAction, Parser};
use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits, TTYPort};

use serdisk_core::{SerialLink, Server};

/// Line speeds the guest side can be configured for.
const BAUD_RATES: &[u32] = &[75, 150, 300, 600, 1200, 2400, 4800, 9600, 19200, 38400];

/// Serial remote drive server
#[derive(Parser, Debug)]
#[command(name = "serdiskd")]
#[command(about = "Serve a directory to a remote drive over a serial line")]
struct Args {
    /// Serial device connected to the guest
    device: PathBuf,

    /// Directory served as the guest drive
    #[arg(default_value = ".")]
    root: PathBuf,

    /// Line speed in bits per second
    #[arg(short = 's', long = "speed", default_value_t = 38400)]
    speed: u32,

    /// Increase debug verbosity (repeatable)
    #[arg(short = 'D', action = ArgAction::Count)]
    debug: u8,
}

/// The opened serial device as a driver-facing link.
struct DevicePort(TTYPort);

impl Read for DevicePort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

impl Write for DevicePort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

impl SerialLink for DevicePort {
    fn discard_input(&mut self) -> io::Result<()> {
        self.0
            .clear(ClearBuffer::Input)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
    }
}

/// Unsupported rates fall back to the default, like the guest side.
fn effective_speed(requested: u32) -> u32 {
    if BAUD_RATES.contains(&requested) {
        requested
    } else {
        eprintln!("unsupported speed {}, using 38400", requested);
        38400
    }
}

fn open_port(args: &Args, speed: u32) -> Result<DevicePort, serialport::Error> {
    let mut port = serialport::new(args.device.to_string_lossy(), speed)
        .data_bits(DataBits::Eight)
        .stop_bits(StopBits::One)
        .parity(Parity::None)
        .flow_control(FlowControl::None)
        .timeout(Duration::from_secs(600))
        .open_native()?;

    // One guest per device: the session tables cannot tell two clients
    // apart, so refuse to share the line.
    port.set_exclusive(true)?;

    Ok(DevicePort(port))
}

fn run(args: Args) -> io::Result<()> {
    let speed = effective_speed(args.speed);
    let mut port = match open_port(&args, speed) {
        Ok(port) => port,
        Err(e) => {
            eprintln!("cannot open {}: {}", args.device.display(), e);
            std::process::exit(1);
        }
    };

    println!(
        "Serial remote drive service: {} ({} bps), serving {}",
        args.device.display(),
        speed,
        args.root.display()
    );

    let mut server = Server::new(&args.root);
    server.debug = args.debug;
    server.serve(&mut port)
}

fn main() {
    let args = Args::parse();
    if let Err(e) = run(args) {
        eprintln!("link failed: {}", e);
        std::process::exit(1);
    }
}
