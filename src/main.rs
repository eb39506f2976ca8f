use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::time::{interval, sleep, timeout, Duration, Instant};

use vertical_tracker_rs::live_status::LiveStatus;
use vertical_tracker_rs::sensors::{SensorHub, TermuxLocationSource, TermuxSensorSource};
use vertical_tracker_rs::{
    Clock, JsonFileStore, KeyValueStore, SystemClock, TrackerConfig, TrackerHandle, TrackerService,
    VerticalTracker,
};

/// How long to wait for the first reading before giving up on a startup request
const STARTUP_WAIT: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(name = "vertical_tracker")]
#[command(about = "Barometric height tracker with accelerometer/GPS fusion", long_about = None)]
struct Args {
    /// Duration in seconds (0 = continuous)
    #[arg(value_name = "SECONDS", default_value = "0")]
    duration: u64,

    /// Directory for calibration, sync state and live status
    #[arg(long, default_value = "vertical_tracker_data")]
    data_dir: PathBuf,

    /// JSON config file; missing fields take defaults
    #[arg(long)]
    config: Option<PathBuf>,

    /// Use simulated sensors even when a barometer is present
    #[arg(long)]
    simulate: bool,

    /// Calibrate to this height (m) once the first pressure reading arrives
    #[arg(long, allow_hyphen_values = true)]
    calibrate_height: Option<f64>,

    /// Sync to a height (m) read from another device once an estimate exists
    #[arg(long, allow_hyphen_values = true)]
    sync_height: Option<f64>,

    /// Seconds between live status updates
    #[arg(long, default_value = "2")]
    status_interval_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => TrackerConfig::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => TrackerConfig::default(),
    };

    info!("Vertical Tracker starting");
    info!("  Duration: {} seconds (0=continuous)", args.duration);
    info!("  Data Dir: {}", args.data_dir.display());
    info!("  Simulate: {}", args.simulate);

    let store: Arc<dyn KeyValueStore> = Arc::new(
        JsonFileStore::open(&args.data_dir)
            .with_context(|| format!("opening data dir {}", args.data_dir.display()))?,
    );
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let tracker = VerticalTracker::new(&config, store.clone(), clock.clone());
    let (handle, task) = TrackerService::start(tracker, store, clock.clone(), &config);

    let mut hub = SensorHub::new(
        Arc::new(TermuxSensorSource::detect(clock.clone()).await),
        Some(Arc::new(TermuxLocationSource::new(clock.clone()))),
        handle.sink(),
        config.acquisition,
        clock,
    );
    let mode = if args.simulate {
        hub.start_simulated()
    } else {
        hub.start()
    };
    info!("Acquisition mode: {:?}", mode);

    if let Some(height) = args.calibrate_height {
        calibrate_on_first_reading(&handle, height).await;
    }
    if let Some(height) = args.sync_height {
        sync_on_first_estimate(&handle, height).await;
    }

    let start = Instant::now();
    let status_path = args.data_dir.join("live_status.json");
    let mut ticker = interval(Duration::from_secs(args.status_interval_secs.max(1)));
    let stop_after = async {
        if args.duration > 0 {
            sleep(Duration::from_secs(args.duration)).await
        } else {
            std::future::pending::<()>().await
        }
    };
    tokio::pin!(stop_after);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, stopping...");
                break;
            }
            _ = &mut stop_after => {
                info!("Duration reached, stopping...");
                break;
            }
            _ = ticker.tick() => {
                let status = live_status(&handle, start.elapsed().as_secs()).await?;
                if let Err(e) = status.save(&status_path) {
                    warn!("Failed to write {}: {}", status_path.display(), e);
                }
                info!("{}", status.summary());
            }
        }
    }

    hub.stop();
    let final_status = live_status(&handle, start.elapsed().as_secs()).await?;
    let final_path = args.data_dir.join("live_status_final.json");
    if let Err(e) = final_status.save(&final_path) {
        warn!("Failed to write {}: {}", final_path.display(), e);
    }

    handle.shutdown().await?;
    let tracker = task.await.context("tracker task panicked")?;
    let snapshot = tracker.snapshot();

    println!("\n=== Final Stats ===");
    println!("History points: {}", tracker.history().len());
    println!("Skipped ticks (no accel): {}", tracker.skipped_ticks());
    if snapshot.has_estimate {
        println!("Height: {:.2} m (offset {:+.2} m)", snapshot.height, snapshot.sync_offset);
        println!("Baro bias: {:.4} m", snapshot.baro_bias);
    } else {
        println!("Height: no estimate");
    }

    Ok(())
}

async fn live_status(handle: &TrackerHandle, uptime_seconds: u64) -> Result<LiveStatus> {
    let mut status = LiveStatus::from_snapshot(&handle.snapshot(), uptime_seconds);
    status.history_points = handle.history().await?.len();
    Ok(status)
}

async fn calibrate_on_first_reading(handle: &TrackerHandle, height: f64) {
    let mut snapshots = handle.subscribe();
    // The watch guard must be released before calling back into the tracker
    let ready = matches!(
        timeout(STARTUP_WAIT, snapshots.wait_for(|s| s.pressure.is_some())).await,
        Ok(Ok(_))
    );
    if !ready {
        warn!("No pressure reading within {:?}, not calibrating", STARTUP_WAIT);
        return;
    }
    match handle.calibrate(height).await {
        Ok(result) if result.is_durable() => info!("Calibrated to {:.2} m", height),
        Ok(_) => warn!("Calibrated to {:.2} m for this session only", height),
        Err(e) => warn!("Calibration failed: {}", e),
    }
}

async fn sync_on_first_estimate(handle: &TrackerHandle, height: f64) {
    let mut snapshots = handle.subscribe();
    let ready = matches!(
        timeout(STARTUP_WAIT, snapshots.wait_for(|s| s.has_estimate)).await,
        Ok(Ok(_))
    );
    if !ready {
        warn!("No height estimate within {:?}, not syncing", STARTUP_WAIT);
        return;
    }
    match handle.manual_sync(height).await {
        Ok(offset) => info!("Synced to {:.2} m (offset {:+.2} m)", height, offset.value),
        Err(e) => warn!("Sync failed: {}", e),
    }
}
