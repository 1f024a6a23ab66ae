//! USB handler control tool
//!
//! Inspect and edit remembered handler choices, and dry-run handler matching
//! against the configured manifest.
//!
//! # Usage
//!
//! ```bash
//! usb-handlerctl list
//! usb-handlerctl forget S2 0x04e8 0x6860
//! usb-handlerctl match '{"name":"/dev/bus/usb/001/004","vendor_id":1256,"product_id":26720}'
//! usb-handlerctl --config /path/to/config.toml match device.json
//! ```

use std::path::PathBuf;
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use usb_handler::platform::PackageRegistry;
use usb_handler::resolver::enumerate_candidates;
use usb_handler::{Config, DeviceIdentity, ManifestRegistry, SettingsStore, UsbDevice};

enum Command {
    List,
    Forget(DeviceIdentity),
    Match(String),
}

struct Args {
    config_path: Option<PathBuf>,
    command: Command,
}

fn print_help() {
    println!(
        r#"usb-handlerctl - manage USB handler settings

USAGE:
    usb-handlerctl [OPTIONS] <COMMAND>

OPTIONS:
    -c, --config <PATH>    Path to config file
    -h, --help             Print help
    -v, --version          Print version

COMMANDS:
    list                       Print every remembered handler as JSON lines
    forget <SERIAL> <VID> <PID>
                               Forget the handler for one device (ids in hex or decimal)
    match <DEVICE_JSON|FILE>   Show which declared handlers would match a device

ENVIRONMENT:
    RUST_LOG                   Log filter (overrides general.log_level)
"#
    );
}

fn parse_id(value: &str) -> Result<u16, String> {
    let parsed = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => value.parse(),
    };
    parsed.map_err(|_| format!("Invalid USB id: {}", value))
}

fn parse_args() -> Result<Args, String> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let mut config_path = None;
    let mut positional = Vec::new();

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            "--version" | "-v" => {
                println!("usb-handlerctl v{}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--config" | "-c" => {
                i += 1;
                let path = args.get(i).ok_or("--config requires a path")?;
                config_path = Some(PathBuf::from(path));
            }
            other => positional.push(other.to_string()),
        }
        i += 1;
    }

    let command = match positional.as_slice() {
        [cmd] if cmd == "list" => Command::List,
        [cmd, serial, vid, pid] if cmd == "forget" => Command::Forget(DeviceIdentity::new(
            serial.as_str(),
            parse_id(vid)?,
            parse_id(pid)?,
        )),
        [cmd, device] if cmd == "match" => Command::Match(device.clone()),
        [] => return Err("No command given (try --help)".to_string()),
        _ => return Err(format!("Unrecognized command: {}", positional.join(" "))),
    };

    Ok(Args {
        config_path,
        command,
    })
}

fn read_device(arg: &str) -> Result<UsbDevice, Box<dyn std::error::Error>> {
    let json = if arg.trim_start().starts_with('{') {
        arg.to_string()
    } else {
        std::fs::read_to_string(arg)?
    };
    Ok(serde_json::from_str(&json)?)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = match parse_args() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(2);
        }
    };

    let config = match &args.config_path {
        Some(path) => Config::load_from_path(path.clone()),
        None => Config::load(),
    };

    // Logs go to stderr so stdout stays machine-readable
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| config.general.log_level.clone()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match args.command {
        Command::List => {
            let store = SettingsStore::open(config.storage.resolved_db_path())?;
            for setting in store.get_all_settings()? {
                println!("{}", serde_json::to_string(&setting)?);
            }
        }
        Command::Forget(identity) => {
            let store = SettingsStore::open(config.storage.resolved_db_path())?;
            if store.delete_settings(&identity)? {
                info!("Forgot handler for {}", identity);
                println!("Forgot {}", identity);
            } else {
                println!("No handler remembered for {}", identity);
            }
        }
        Command::Match(arg) => {
            let device = read_device(&arg)?;
            let manifest = config
                .registry
                .manifest_path
                .as_ref()
                .ok_or("No registry.manifest_path configured")?;
            let registry = ManifestRegistry::load(manifest)?;
            debug!("Matching {} against {:?}", device.identity(), manifest);

            let (matches, probes) = enumerate_candidates(&registry.query_handlers(), &device);
            // A device already in accessory mode is never probed
            let probes: Vec<_> = if device.is_in_aoap_mode() {
                Vec::new()
            } else {
                probes.into_iter().collect()
            };
            let report = serde_json::json!({
                "device": device.identity(),
                "in_aoap_mode": device.is_in_aoap_mode(),
                "matches": matches,
                "aoap_probes": probes,
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    Ok(())
}
