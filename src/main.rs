use std::process::exit;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::LevelFilter;
use tokio::runtime::Runtime;

use squid_rs::logging::init_logging_with;
use squid_rs::{
    available_ports, DeviceProbe, ParameterKind, Session, SessionConfig, SquidError,
    TuneRequest, TuneVariant, UsbFilter,
};

#[derive(Parser, Debug)]
#[command(name = "squid-demo", about = "Talk to a SQUID controller on a serial port")]
struct Args {
    /// Serial port (e.g. /dev/ttyUSB0). Default: probe every port.
    #[arg(short, long, global = true)]
    port: Option<String>,
    /// Probe every serial port, not only FTDI adapters.
    #[arg(long, global = true)]
    all_ports: bool,
    /// Skip the device-wide baseline/release broadcasts.
    #[arg(long, global = true)]
    no_baseline: bool,
    /// More log output (-v debug, -vv trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List controllers without opening a session.
    Scan {
        /// Probe all ports at once.
        #[arg(long)]
        concurrent: bool,
    },
    /// Open a session and list its channels.
    Channels,
    /// Set an analog parameter, e.g. `set 1 bias 0.75`.
    Set {
        channel: u8,
        parameter: ParameterKind,
        value: f64,
    },
    /// Read sample bursts from a channel.
    Sample {
        channel: u8,
        #[arg(short, long, default_value_t = 1)]
        count: usize,
    },
    /// Run the device auto-tune on a channel.
    Tune {
        channel: u8,
        #[arg(allow_negative_numbers = true)]
        start_bias: f64,
        #[arg(allow_negative_numbers = true)]
        end_bias: f64,
        /// Keep offset/flux and loop controls as they are.
        #[arg(long)]
        no_reset: bool,
    },
}

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {e:#}");
        exit(1);
    }
}

fn run() -> Result<()> {
    let args = Args::parse();
    let level = match args.verbose {
        0 => None,
        1 => Some(LevelFilter::Debug),
        _ => Some(LevelFilter::Trace),
    };
    init_logging_with(level);

    let mut config = SessionConfig::default();
    if !args.all_ports {
        config.usb_filter = Some(UsbFilter::FTDI);
    }
    config.device_baseline = !args.no_baseline;

    if let Command::Scan { concurrent } = args.command {
        return scan(&config, args.port, concurrent);
    }

    let mut session = match &args.port {
        Some(port) => Session::connect_port(port, config),
        None => Session::connect(config),
    }
    .context("could not open a session")?;
    println!(
        "Connected: port={} baud={} protocol={}",
        session.port(),
        session.baud(),
        session.variant()
    );

    let outcome = operate(&mut session, args.command);
    session.close().context("teardown failed")?;
    outcome
}

fn scan(config: &SessionConfig, port: Option<String>, concurrent: bool) -> Result<()> {
    let ports = match port {
        Some(port) => vec![port],
        None => available_ports(config.usb_filter)?,
    };
    println!("Probing {} port(s)...", ports.len());

    let probe = DeviceProbe::new(config);
    let found = if concurrent {
        let rt = Runtime::new().context("tokio runtime init failed")?;
        let device = rt.block_on(Arc::new(probe).discover_concurrently(ports));
        match device {
            Ok(device) => vec![device],
            Err(SquidError::DeviceNotFound { .. }) => Vec::new(),
            Err(e) => return Err(e.into()),
        }
    } else {
        probe.scan(&ports)?
    };

    if found.is_empty() {
        println!("No controller found.");
    }
    for device in &found {
        println!(
            "{}  baud={}  protocol={}",
            device.port, device.baud, device.variant
        );
    }
    Ok(())
}

fn operate(session: &mut Session, command: Command) -> Result<()> {
    match command {
        Command::Scan { .. } => Ok(()),
        Command::Channels => {
            for info in session.channels() {
                let state = session.channel_state(info.id);
                println!(
                    "channel {:#04x}  {:?}  {:?}",
                    info.id, state, info.capabilities
                );
                if let Some(meta) = info.metadata {
                    println!(
                        "    firmware={:#06x} created={:#010x} serial={:#06x}",
                        meta.firmware_id,
                        meta.creation_date_raw(),
                        meta.serial_number
                    );
                }
            }
            Ok(())
        }
        Command::Set {
            channel,
            parameter,
            value,
        } => {
            let acknowledged = session.set(channel, parameter, value)?;
            println!(
                "channel {:#04x}: {} = {:.4} {}",
                channel,
                parameter,
                acknowledged,
                parameter.unit()
            );
            Ok(())
        }
        Command::Sample { channel, count } => {
            for i in 0..count {
                let burst = session.sample(channel)?;
                let (amplitude, offset) = burst.amplitude_and_offset();
                println!(
                    "[Burst {}] {} samples | amplitude {:.4} V | offset {:.4} V",
                    i,
                    burst.len(),
                    amplitude,
                    offset
                );
            }
            Ok(())
        }
        Command::Tune {
            channel,
            start_bias,
            end_bias,
            no_reset,
        } => {
            let variant = if no_reset {
                TuneVariant::Squid2
            } else {
                TuneVariant::Squid
            };
            println!("Tuning channel {:#04x} (takes a few seconds)...", channel);
            let result = session.auto_tune(channel, TuneRequest::new(variant, start_bias, end_bias))?;
            println!(
                "bias={:.4} offset={:.4} flux={:.4}",
                result.bias, result.offset, result.flux
            );
            Ok(())
        }
    }
}
