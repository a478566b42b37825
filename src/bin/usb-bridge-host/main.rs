//! Discovers USB devices exposing the bridge interface.

use clap::{Parser, Subcommand};
use std::{io, path::PathBuf, sync::Arc, thread, time::Duration};

use usb_bridge_host::{FoundDevice, Handle, Registry, Scanner, Transport, UsbFs};

mod config;

use config::Settings;

#[derive(Parser)]
#[command(author, version, about)]
struct Args {
    /// Configuration file in TOML format
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Root of the usbfs device hierarchy
    #[arg(long, value_name = "PATH")]
    dev_root: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Scan once and print matching devices
    List,
    /// Attach matching devices and log attach and detach events until interrupted
    Monitor,
}

/// Transport that logs attach and detach events.
struct LogTransport;

impl Transport for LogTransport {
    fn attach(&self, handle: Arc<Handle>, serial: &str, stable_path: Option<&str>, writable: bool) {
        log::info!(
            "attached {} (serial {serial:?}, path {}{})",
            handle.path().display(),
            stable_path.unwrap_or("unknown"),
            if writable { "" } else { ", read-only" }
        );
    }

    fn detach(&self, handle: &Arc<Handle>) {
        log::info!("detached {}", handle.path().display());
    }
}

fn print_device(found: &FoundDevice) {
    let m = &found.interface;
    println!(
        "{}  {}  class {}  interface {}  endpoints 0x{:02x}/0x{:02x}  {}",
        found.path.display(),
        m.id,
        m.class,
        m.interface,
        m.ep_in,
        m.ep_out,
        found.stable_path.as_deref().unwrap_or("-")
    );
}

fn monitor(scanner: Scanner, poll: Duration) -> io::Result<()> {
    let registry = scanner.registry().clone();
    let _monitor = scanner.spawn()?;

    // Writable handles are never detached, they only become dead when kicked.
    // Polling for dead handles covers both kinds.
    loop {
        thread::sleep(poll);
        for handle in registry.handles() {
            if handle.is_dead() {
                log::info!("closing {}", handle.path().display());
                registry.close(&handle);
            }
        }
    }
}

fn main() -> io::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let settings = match &args.config {
        Some(path) => Settings::load(path)?,
        None => Settings::default(),
    };
    let mut config = settings.config();
    if let Some(dev_root) = &args.dev_root {
        config = config.with_dev_root(dev_root);
    }
    let poll = config.scan_interval;

    let registry = Arc::new(Registry::new(config, Arc::new(UsbFs), Arc::new(LogTransport)));
    let scanner = Scanner::new(registry, Arc::new(settings.filter()));

    match args.command {
        Command::List => {
            let mut found = 0;
            scanner.scan(|device| {
                print_device(&device);
                found += 1;
            });
            if found == 0 {
                eprintln!("no matching devices found");
            }
            Ok(())
        }
        Command::Monitor => monitor(scanner, poll),
    }
}
