//! driverd command line
//!
//! # Usage
//!
//! ```bash
//! # Run as daemon: load drivers for present devices, then follow devd
//! driverd -u -x nvidia,if_iwm
//!
//! # Show what would be loaded for every present device
//! driverd -l
//!
//! # Candidate drivers for one vendor/device pair (exit 1 if none)
//! driverd -c 8086:10d3
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use std::io::{self, BufRead, Seek, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};

use driverd::config::CONFIG_ENV;
use driverd::enumerate::{DeviceList, DeviceSource, SystemDevices};
use driverd::hooks::{CommandHook, NoopHook, PolicyHook};
use driverd::ids::IdDatabase;
use driverd::kmod::KldModules;
use driverd::netstart::NetStart;
use driverd::{
    BusKind, DaemonConfig, Daemon, DeviceRecord, Dispatcher, DriverDatabase, HintsResolver,
    LoadPolicy, Orchestrator, Resolver,
};

#[derive(Parser)]
#[command(name = "driverd")]
#[command(version)]
#[command(about = "Load kernel modules for present and hotplugged devices")]
#[command(long_about = None)]
struct Cli {
    /// Log what would be loaded without loading anything
    #[arg(short = 'n', long)]
    dry_run: bool,

    /// Never load these modules (comma separated)
    #[arg(short = 'x', long, value_delimiter = ',')]
    exclude: Vec<String>,

    /// Stay attached to the terminal
    #[arg(short, long)]
    foreground: bool,

    /// Start DHCP on newly attached network interfaces
    #[arg(short = 'u', long)]
    netstart: bool,

    /// List candidate drivers for all present devices and exit
    #[arg(short, long, conflicts_with = "check")]
    list: bool,

    /// List candidate drivers for VENDOR:DEVICE (hex) and exit
    #[arg(short, long, value_name = "VENDOR:DEVICE", value_parser = parse_id_pair)]
    check: Option<IdPair>,

    /// Configuration file
    #[arg(long, env = CONFIG_ENV)]
    config: Option<PathBuf>,

    /// Debug logging unless RUST_LOG says otherwise
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct IdPair {
    vendor: u16,
    device: u16,
}

fn parse_id_pair(s: &str) -> Result<IdPair, String> {
    let hex = |v: &str| {
        let v = v.trim();
        let v = v
            .strip_prefix("0x")
            .or_else(|| v.strip_prefix("0X"))
            .unwrap_or(v);
        u16::from_str_radix(v, 16).map_err(|e| format!("invalid id '{v}': {e}"))
    };
    let (vendor, device) = s
        .split_once(':')
        .ok_or_else(|| format!("expected VENDOR:DEVICE, got '{s}'"))?;
    Ok(IdPair {
        vendor: hex(vendor)?,
        device: hex(device)?,
    })
}

// =============================================================================
// MAIN
// =============================================================================

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "debug,driverd=debug"
    } else {
        "info,driverd=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with_writer(io::stderr)
        .init();

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let config_path = DaemonConfig::resolve_path(cli.config.as_deref());
    let config = DaemonConfig::load(&config_path)?;

    let ids = IdDatabase::from_config(&config.id_databases);
    let database = DriverDatabase::open(&config.database)
        .with_context(|| format!("Couldn't open {}", config.database.display()))?;
    let mut resolver = Resolver::new(database, HintsResolver::new(config.hints_files.iter().cloned()));

    if let Some(pair) = cli.check {
        return check(&mut resolver, &ids, pair);
    }

    let source = Arc::new(SystemDevices::default());
    if cli.list {
        list(&mut resolver, &ids, source.as_ref()).await?;
        return Ok(ExitCode::SUCCESS);
    }

    let hook: Arc<dyn PolicyHook> = if config.hooks.is_empty() {
        Arc::new(NoopHook)
    } else {
        Arc::new(CommandHook::new(config.hooks.clone()))
    };
    let exclude = config
        .exclude_kmods
        .iter()
        .cloned()
        .chain(cli.exclude)
        .filter(|name| !name.is_empty());
    let policy = LoadPolicy::new(exclude, hook, Arc::new(KldModules::default()), cli.dry_run);

    let mut daemon = Daemon::new(Orchestrator::new(resolver, policy), source, ids);
    if cli.netstart {
        daemon = daemon.with_netstart(NetStart::from_config(&config.netstart));
    }

    info!(
        dry_run = cli.dry_run,
        foreground = cli.foreground,
        database = %config.database.display(),
        "driverd starting"
    );
    daemon.start().await.context("Initial device scan failed")?;

    Dispatcher::from_config(&config)
        .run(&mut daemon)
        .await
        .context("Event loop failed")?;
    Ok(ExitCode::SUCCESS)
}

// =============================================================================
// DIAGNOSTIC MODES
// =============================================================================

fn check<R: BufRead + Seek>(resolver: &mut Resolver<R>, ids: &IdDatabase, pair: IdPair) -> Result<ExitCode> {
    let device = DeviceRecord::pci(pair.vendor, pair.device);
    let descr = ids
        .describe(&device)
        .or_else(|| {
            let mut usb = device.clone();
            usb.bus = BusKind::Usb;
            ids.describe(&usb)
        })
        .unwrap_or_default();

    let candidates = resolver.resolve_all(&device)?;
    let mut out = io::stdout().lock();
    for candidate in &candidates {
        writeln!(out, "{}: {}", descr, candidate.name)?;
    }

    Ok(if candidates.is_empty() {
        ExitCode::from(1)
    } else {
        ExitCode::SUCCESS
    })
}

async fn list<R: BufRead + Seek>(
    resolver: &mut Resolver<R>,
    ids: &IdDatabase,
    source: &dyn DeviceSource,
) -> Result<()> {
    let mut records = source.pci_devices().await?;
    records.extend(source.usb_devices().await?);

    let mut devices = DeviceList::new();
    devices.admit(records.into_iter().map(|mut device| {
        ids.annotate(&mut device);
        device
    }));

    let mut out = io::stdout().lock();
    for device in devices.iter() {
        for candidate in resolver.resolve_all(device)? {
            for line in device_lines(device, &candidate.name) {
                writeln!(out, "{}", line)?;
            }
        }
    }
    Ok(())
}

/// Output lines for one candidate: the device, then each USB interface.
fn device_lines(device: &DeviceRecord, driver: &str) -> Vec<String> {
    let descr = device.description_or_empty();
    let mut lines = vec![format!(
        "vendor={:04x} product={:04x} class={:02x} subclass={:02x} bus={} {}: {}",
        device.vendor, device.device, device.class, device.subclass, device.bus, descr, driver
    )];
    if device.bus == BusKind::Usb {
        lines.extend(device.interfaces.iter().map(|iface| {
            format!(
                "vendor={:04x} product={:04x} ifclass={:02x} ifsubclass={:02x} bus=USB protocol={:02x} {}: {}",
                device.vendor, device.device, iface.class, iface.subclass, iface.protocol, descr, driver
            )
        }));
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use driverd::Interface;

    #[test]
    fn test_parse_id_pair() {
        assert_eq!(
            parse_id_pair("8086:10d3"),
            Ok(IdPair {
                vendor: 0x8086,
                device: 0x10d3
            })
        );
        assert_eq!(
            parse_id_pair("0x5ac:0X12a8"),
            Ok(IdPair {
                vendor: 0x05ac,
                device: 0x12a8
            })
        );
        assert!(parse_id_pair("8086").is_err());
        assert!(parse_id_pair("8086:zz").is_err());
        assert!(parse_id_pair("18086:0001").is_err());
    }

    #[test]
    fn test_pci_line() {
        let mut dev = DeviceRecord::pci(0x8086, 0x10d3).with_class(0x02, 0x00);
        dev.description = Some("Intel Corporation 82574L".to_string());
        assert_eq!(
            device_lines(&dev, "if_em"),
            vec!["vendor=8086 product=10d3 class=02 subclass=00 bus=PCI Intel Corporation 82574L: if_em"]
        );
    }

    #[test]
    fn test_usb_lines_include_interfaces() {
        let dev = DeviceRecord::usb(0x8564, 0x1000).with_interface(Interface::new(8, 6, 0x50));
        assert_eq!(
            device_lines(&dev, "umass"),
            vec![
                "vendor=8564 product=1000 class=00 subclass=00 bus=USB : umass",
                "vendor=8564 product=1000 ifclass=08 ifsubclass=06 bus=USB protocol=50 : umass",
            ]
        );
    }

    #[test]
    fn test_cli_flags() {
        let cli = Cli::try_parse_from(["driverd", "-n", "-x", "nvidia,if_iwm", "-u"]).unwrap();
        assert!(cli.dry_run);
        assert!(cli.netstart);
        assert_eq!(cli.exclude, vec!["nvidia", "if_iwm"]);

        assert!(Cli::try_parse_from(["driverd", "-l", "-c", "8086:10d3"]).is_err());
    }
}
