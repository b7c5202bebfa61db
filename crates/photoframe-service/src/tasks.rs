use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use tokio::{
    task::JoinHandle,
    time::{interval, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use crate::service::PhotoService;

/// Handles of the long-lived maintenance loops; dropping them stops the loops.
pub struct BackgroundTasks {
    rescan: JoinHandle<()>,
    sweep: JoinHandle<()>,
}

impl BackgroundTasks {
    pub fn abort(&self) {
        self.rescan.abort();
        self.sweep.abort();
    }
}

impl Drop for BackgroundTasks {
    fn drop(&mut self) {
        self.abort();
    }
}

/// Start the directory rescan loop and the idle-session sweep loop.
///
/// Each iteration logs its own failure and the loop carries on.
pub fn spawn_background(
    service: Arc<PhotoService>,
    rescan_every: Duration,
    sweep_every: Duration,
) -> BackgroundTasks {
    let rescan_service = service.clone();
    let rescan = tokio::spawn(async move {
        let mut ticker = interval(rescan_every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match rescan_service.rescan().await {
                Ok(0) => debug!("Rescan found no bucket changes"),
                Ok(changed) => info!("Rescan updated {} bucket(s)", changed),
                Err(err) => warn!("Bucket rescan failed: {err}"),
            }
        }
    });

    let sweep = tokio::spawn(async move {
        let mut ticker = interval(sweep_every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match service.sweep(Instant::now()) {
                Ok(report) if report.sessions > 0 || report.addresses > 0 => info!(
                    "Evicted {} idle session(s) and {} address binding(s)",
                    report.sessions, report.addresses
                ),
                Ok(_) => {}
                Err(err) => warn!("Session sweep failed: {err}"),
            }
        }
    });

    BackgroundTasks { rescan, sweep }
}
