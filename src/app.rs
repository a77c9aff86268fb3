use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use clap::Parser;
use log::{info, warn, LevelFilter};
use serde::Serialize;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;

use crate::config::io::{load_or_default, ConfigIO};
use crate::device::adapter::Adapter;
use crate::device::btle::BtleAdapter;
use crate::device::query::{DeviceQuery, Snapshot};
use crate::device::session::DiscoveryController;
use crate::device::simulated::SimulatedAdapter;
use crate::device::types::{DeviceId, DeviceRecord};
use crate::error::AppRunError;
use crate::set_log_level;

#[derive(Parser, Debug)]
#[command(version, about = "Track nearby bluetooth peripherals")]
pub struct Args {
    /// Stop after this long (e.g. "30s", "2m"). Runs until Ctrl-C when omitted
    #[arg(long, value_parser = humantime::parse_duration)]
    pub duration: Option<Duration>,

    /// Re-poll the connection state of bonded devices on this interval (e.g. "5s")
    #[arg(long, value_parser = humantime::parse_duration)]
    pub poll_interval: Option<Duration>,

    /// Use a simulated adapter with a scripted set of devices instead of the real radio
    #[arg(long)]
    pub simulate: bool,

    /// Print snapshots as JSON lines
    #[arg(long)]
    pub json: bool,

    #[arg(long)]
    pub log_level: Option<LevelFilter>,

    /// Config file to use instead of the default location
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Write the effective configuration back to the config file
    #[arg(long)]
    pub save_config: bool,

    /// Show the details of one device and exit
    #[arg(long, value_name = "ID", conflicts_with = "connect")]
    pub details: Option<DeviceId>,

    /// Ask for a connection to one device and exit
    #[arg(long, value_name = "ID")]
    pub connect: Option<DeviceId>,
}

// how long --details / --connect wait for the device to show up, unless --duration is given
const DEVICE_COMMAND_WAIT: Duration = Duration::from_secs(10);

#[derive(Serialize)]
struct SnapshotReport<'a> {
    snapshot: &'a Snapshot,
    devices: Vec<DeviceRecord>,
}

fn describe(query: &DeviceQuery, id: &DeviceId) -> String {
    match query.device(id) {
        Some(record) => format!("{} ({})", record.label(), record.id),
        None => id.to_string(),
    }
}

pub fn render_text(query: &DeviceQuery, snapshot: &Snapshot) -> String {
    let mut out = String::new();

    out.push_str("Currently connected device:\n");
    match &snapshot.connected_device {
        Some(id) => out.push_str(&format!("  {}\n", describe(query, id))),
        None => out.push_str("  No device connected\n"),
    }
    for id in &snapshot.additional_connected {
        out.push_str(&format!("  {} (also reports connected)\n", describe(query, id)));
    }

    out.push_str("Previously connected devices:\n");
    for id in &snapshot.previously_connected {
        out.push_str(&format!("  {}\n", describe(query, id)));
    }

    out.push_str("Available devices:\n");
    if snapshot.available.is_empty() {
        out.push_str("  No devices found\n");
    }
    for id in &snapshot.available {
        out.push_str(&format!("  {}\n", describe(query, id)));
    }

    out
}

pub fn render_details(record: &DeviceRecord) -> String {
    let last_seen = match record.last_seen_at {
        Some(time) => humantime::format_rfc3339_seconds(time).to_string(),
        None => "never".to_string(),
    };

    format!(
        "{}\n  Address: {}\n  Category: {}\n  Bond state: {:?}\n  Connection state: {:?}\n  Last seen: {}\n",
        record.label(),
        record.id,
        record.category(),
        record.bond_state,
        record.connection_state,
        last_seen,
    )
}

fn print_record(record: &DeviceRecord, json: bool) -> Result<(), AppRunError> {
    let mut stdout = io::stdout().lock();

    if json {
        serde_json::to_writer(&mut stdout, record)?;
        writeln!(stdout)?;
    } else {
        write!(stdout, "{}", render_details(record))?;
    }

    stdout.flush()?;
    Ok(())
}

async fn wait_for_device(query: &DeviceQuery, id: &DeviceId, wait: Duration) {
    let mut changes = query.changes();
    let deadline = sleep(wait);
    tokio::pin!(deadline);

    while query.device(id).is_none() {
        tokio::select! {
            _ = &mut deadline => {
                break;
            },
            changed = changes.changed() => {
                if changed.is_err() {
                    break;
                }
            },
        }
    }
}

async fn device_command(
    controller: &mut DiscoveryController,
    simulated: Option<SimulatedAdapter>,
    id: &DeviceId,
    connect: bool,
    wait: Duration,
) -> Result<DeviceRecord, AppRunError> {
    controller.start().await?;
    let cancel = CancellationToken::new();
    let replay = simulated.map(|simulated| simulated.replay(cancel.clone(), SimulatedAdapter::demo_script()));

    wait_for_device(&controller.query(), id, wait).await;
    let result = if connect {
        controller.connect(id).and_then(|()| controller.view_details(id))
    } else {
        controller.view_details(id)
    };

    cancel.cancel();
    if let Some(replay) = replay {
        let _ = replay.await;
    }
    controller.stop().await;

    Ok(result?)
}

fn print_snapshot(query: &DeviceQuery, json: bool) -> Result<(), AppRunError> {
    let snapshot = query.snapshot();
    let mut stdout = io::stdout().lock();

    if json {
        let mut ids: Vec<DeviceId> = snapshot.connected_device.iter().cloned().collect();
        ids.extend(snapshot.additional_connected.iter().cloned());
        ids.extend(snapshot.previously_connected.iter().cloned());
        ids.extend(snapshot.available.iter().cloned());

        let report = SnapshotReport { snapshot: &snapshot, devices: query.devices(&ids) };
        serde_json::to_writer(&mut stdout, &report)?;
        writeln!(stdout)?;
    } else {
        writeln!(stdout, "{}", render_text(query, &snapshot))?;
    }

    stdout.flush()?;
    Ok(())
}

async fn watch_devices(query: DeviceQuery, duration: Option<Duration>, json: bool) -> Result<(), AppRunError> {
    let mut changes = query.changes();
    let deadline = async move {
        match duration {
            Some(duration) => sleep(duration).await,
            None => std::future::pending().await,
        }
    };
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(deadline);
    tokio::pin!(ctrl_c);

    print_snapshot(&query, json)?;

    'mainloop: loop {
        tokio::select! {
            _ = &mut deadline => {
                info!("Scan duration elapsed");
                break 'mainloop;
            },
            result = &mut ctrl_c => {
                if let Err(err) = result {
                    warn!("Failed to listen for Ctrl-C: {}", err);
                }
                info!("Interrupted");
                break 'mainloop;
            },
            changed = changes.changed() => {
                if changed.is_err() {
                    break 'mainloop;
                }
                print_snapshot(&query, json)?;
            },
        }
    }

    Ok(())
}

pub async fn run(args: Args) -> Result<(), AppRunError> {
    let config_io = ConfigIO::new_sync(args.config.clone())?;
    let mut locker = config_io.locker()?;
    let _instance_lock = locker.lock()?;

    let mut config = load_or_default(&config_io).await;
    if args.log_level.is_none() {
        set_log_level(config.log_level_filter());
    }
    if let Some(interval) = args.poll_interval {
        config.connection_poll_interval_ms = Some(interval.as_millis() as u64);
    }
    if args.save_config {
        config_io.save(&config).await?;
    }

    let simulated = args.simulate.then(SimulatedAdapter::demo);
    let adapter: Arc<dyn Adapter> = match &simulated {
        Some(simulated) => Arc::new(simulated.clone()),
        None => Arc::new(BtleAdapter::new().await?),
    };

    let mut controller = DiscoveryController::with_options(adapter, config.session_options());
    let (duration, json) = (args.duration, args.json);

    let command = match (args.details, args.connect) {
        (Some(id), _) => Some((id, false)),
        (None, Some(id)) => Some((id, true)),
        (None, None) => None,
    };
    if let Some((id, connect)) = command {
        let record = device_command(&mut controller, simulated, &id, connect, duration.unwrap_or(DEVICE_COMMAND_WAIT)).await?;
        return print_record(&record, json);
    }

    controller.run_session(|query| async move {
        let cancel = CancellationToken::new();
        let replay = simulated.map(|simulated| simulated.replay(cancel.clone(), SimulatedAdapter::demo_script()));

        let result = watch_devices(query, duration, json).await;

        cancel.cancel();
        if let Some(replay) = replay {
            let _ = replay.await;
        }
        result
    }).await?
}
