//! Background loop that bridges the vendor API to the store and live listeners.

use futures::stream::{self, StreamExt};
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    broadcaster::{Broadcaster, LocationEvent},
    dto::{Device, LocationSample},
    store::{Store, StoreError},
    vendor::{DeviceDescriptor, VendorApi, VendorError},
};

#[derive(Clone, Debug)]
pub struct PollerConfig {
    pub interval: Duration,
    /// Devices whose location is fetched at the same time.
    pub concurrency: usize,
}

#[derive(Debug, Error)]
pub enum PollError {
    #[error(transparent)]
    Vendor(#[from] VendorError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Outcome counts of one poll cycle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub devices: usize,
    pub written: usize,
    pub unchanged: usize,
    pub no_data: usize,
    pub failed: usize,
}

enum DeviceOutcome {
    Written,
    Unchanged,
    NoData,
    Failed,
}

pub struct Poller {
    vendor: Arc<dyn VendorApi>,
    store: Store,
    broadcaster: Arc<Broadcaster>,
    config: PollerConfig,
}

impl Poller {
    pub fn new(
        vendor: Arc<dyn VendorApi>,
        store: Store,
        broadcaster: Arc<Broadcaster>,
        config: PollerConfig,
    ) -> Self {
        Poller {
            vendor,
            store,
            broadcaster,
            config,
        }
    }

    /// Polls until `cancel` fires. A cycle still in flight at that point is
    /// abandoned; rows written so far stay valid on their own.
    pub async fn run(self, cancel: CancellationToken) {
        info!(
            "Starting poller (interval: {}s, concurrency: {})",
            self.config.interval.as_secs_f64(),
            self.config.concurrency
        );

        let mut cycle: u64 = 0;
        let mut consecutive_failures = 0u32;

        while !cancel.is_cancelled() {
            cycle += 1;

            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Abandoning poll cycle {} on shutdown", cycle);
                    break;
                }
                result = self.poll_once() => match result {
                    Ok(report) => {
                        consecutive_failures = 0;
                        if report.written > 0 {
                            info!(
                                cycle,
                                devices = report.devices,
                                written = report.written,
                                failed = report.failed,
                                "Poll cycle stored new positions"
                            );
                        } else {
                            debug!(cycle, ?report, "Poll cycle complete");
                        }
                    }
                    Err(err) => {
                        consecutive_failures += 1;
                        if consecutive_failures <= 3 {
                            warn!("Poll cycle {} failed: {} (attempt {})", cycle, err, consecutive_failures);
                        } else if consecutive_failures == 4 {
                            error!(
                                "Poll cycle failed {} times in a row, will keep trying silently: {}",
                                consecutive_failures, err
                            );
                        } else {
                            debug!("Poll cycle {} failed: {}", cycle, err);
                        }
                    }
                },
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep(self.config.interval) => {}
            }
        }

        info!("Poller stopped after {} cycle(s)", cycle);
    }

    /// Runs a single fetch, diff, store and publish pass.
    ///
    /// A vendor failure while listing devices aborts the cycle before anything
    /// is written. A vendor failure for one device only skips that device. A
    /// store failure stops all remaining writes of the cycle.
    pub async fn poll_once(&self) -> Result<CycleReport, PollError> {
        let devices = self.vendor.list_devices().await?;

        let mut report = CycleReport {
            devices: devices.len(),
            ..Default::default()
        };

        let mut outcomes = stream::iter(devices)
            .map(|descriptor| async move { self.poll_device(&descriptor).await })
            .buffer_unordered(self.config.concurrency.max(1));

        while let Some(outcome) = outcomes.next().await {
            match outcome? {
                DeviceOutcome::Written => report.written += 1,
                DeviceOutcome::Unchanged => report.unchanged += 1,
                DeviceOutcome::NoData => report.no_data += 1,
                DeviceOutcome::Failed => report.failed += 1,
            }
        }

        Ok(report)
    }

    async fn poll_device(&self, descriptor: &DeviceDescriptor) -> Result<DeviceOutcome, StoreError> {
        self.store.upsert_device(&Device::from(descriptor)).await?;

        let snapshot = match self.vendor.current_location(&descriptor.id).await {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => {
                debug!(device = %descriptor.id, "No location reported");
                return Ok(DeviceOutcome::NoData);
            }
            Err(err) => {
                warn!(device = %descriptor.id, "Skipping device this cycle: {}", err);
                return Ok(DeviceOutcome::Failed);
            }
        };

        if !snapshot.is_plausible() {
            warn!(
                device = %descriptor.id,
                latitude = snapshot.latitude,
                longitude = snapshot.longitude,
                "Skipping implausible position"
            );
            return Ok(DeviceOutcome::Failed);
        }

        let sample = snapshot.into_sample(&descriptor.id, self.vendor.source());
        if !record_fix(&self.store, &self.broadcaster, &sample).await? {
            return Ok(DeviceOutcome::Unchanged);
        }

        Ok(DeviceOutcome::Written)
    }
}

/// Stores `sample` unless it repeats the device's latest fix, then publishes it
/// to live listeners. Returns whether a row was written.
pub(crate) async fn record_fix(
    store: &Store,
    broadcaster: &Broadcaster,
    sample: &LocationSample,
) -> Result<bool, StoreError> {
    let previous = store.latest_sample(&sample.device_id).await?;
    if previous.is_some_and(|previous| !previous.differs_from(sample)) {
        return Ok(false);
    }

    if store.append_sample(sample).await?.is_none() {
        return Ok(false);
    }
    store.touch_device(sample).await?;

    let listeners = broadcaster.publish(LocationEvent::from(sample));
    debug!(
        device = %sample.device_id,
        latitude = sample.latitude,
        longitude = sample.longitude,
        listeners,
        "Stored new position"
    );

    Ok(true)
}
