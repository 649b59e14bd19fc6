//! A device source that synthesizes plausible readings.
//!
//! Every tracked device moves on a horizontal circle (each one at its own
//! phase), buttons toggle in a staggered pattern and valuators follow a sine
//! wave.  This is what the server runs when no driver is attached, and what
//! the end-to-end tests and demos watch move.

use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tracing::{debug, info};
use trackrelay_core::{
    local_time_micros, DeviceDescriptor, DeviceUpdate, Pose, Quat, TrackingType, ValuatorKind,
    Vec3, Velocity,
};

use super::{DeviceSource, SourceError};

const RADIUS: f32 = 0.5;
const HEIGHT: f32 = 1.5;
/// Radians per second.
const ANGULAR_SPEED: f32 = 1.0;
/// Phase offset between consecutive devices, in radians.
const PHASE_STEP: f32 = 0.5;
const BUTTON_PERIOD_SECS: f32 = 1.0;

/// Simulated source emitting one reading per device every `interval`.
pub struct SimulatedSource {
    descriptors: Vec<DeviceDescriptor>,
    interval: Duration,
    stop: Mutex<Option<watch::Sender<bool>>>,
}

impl SimulatedSource {
    pub fn new(descriptors: Vec<DeviceDescriptor>, interval: Duration) -> Self {
        Self {
            descriptors,
            interval,
            stop: Mutex::new(None),
        }
    }

    /// The reading for device `index` at `elapsed` seconds into the simulation.
    pub fn reading(
        index: usize,
        descriptor: &DeviceDescriptor,
        elapsed: f32,
        time_stamp: u64,
    ) -> DeviceUpdate {
        let angle = elapsed * ANGULAR_SPEED + index as f32 * PHASE_STEP;
        let (sin, cos) = angle.sin_cos();
        let mut update = DeviceUpdate::new(index as u16)
            .with_time_stamp(time_stamp)
            .with_valid(true);

        let position = Vec3::new(RADIUS * cos, HEIGHT, RADIUS * sin);
        let linear = Vec3::new(-RADIUS * sin * ANGULAR_SPEED, 0.0, RADIUS * cos * ANGULAR_SPEED);
        match descriptor.tracking {
            TrackingType::None => {}
            TrackingType::Position => {
                update = update.with_pose(Pose::at(position)).with_velocity(Velocity {
                    linear,
                    angular: Vec3::ZERO,
                });
            }
            TrackingType::PositionOrientation => {
                update = update
                    .with_pose(Pose::new(position, Quat::from_yaw(angle)))
                    .with_velocity(Velocity {
                        linear,
                        angular: Vec3::new(0.0, ANGULAR_SPEED, 0.0),
                    });
            }
        }

        if descriptor.buttons > 0 {
            let phase = (elapsed / BUTTON_PERIOD_SECS) as u64;
            let buttons = (0..u64::from(descriptor.buttons))
                .map(|b| (phase + b) % 2 == 1)
                .collect();
            update = update.with_buttons(buttons);
        }

        if !descriptor.valuators.is_empty() {
            let valuators = descriptor
                .valuators
                .iter()
                .map(|kind| match kind {
                    ValuatorKind::Bipolar => sin,
                    ValuatorKind::Unipolar => 0.5 * (1.0 + sin),
                })
                .collect();
            update = update.with_valuators(valuators);
        }
        update
    }
}

impl DeviceSource for SimulatedSource {
    fn descriptors(&self) -> Vec<DeviceDescriptor> {
        self.descriptors.clone()
    }

    fn start(&self) -> Result<mpsc::UnboundedReceiver<DeviceUpdate>, SourceError> {
        let mut stop = self.stop.lock().unwrap_or_else(PoisonError::into_inner);
        if stop.is_some() {
            return Err(SourceError::AlreadyStarted);
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| SourceError::StartFailed(e.to_string()))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let descriptors = self.descriptors.clone();
        let interval = self.interval;

        runtime.spawn(async move {
            let started = Instant::now();
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let elapsed = started.elapsed().as_secs_f32();
                        let now = local_time_micros();
                        for (index, descriptor) in descriptors.iter().enumerate() {
                            if tx.send(Self::reading(index, descriptor, elapsed, now)).is_err() {
                                debug!("simulated source receiver dropped");
                                return;
                            }
                        }
                    }
                    // Fires on stop() and when the source itself is dropped.
                    _ = stop_rx.changed() => return,
                }
            }
        });

        info!(devices = self.descriptors.len(), ?interval, "simulated device source started");
        *stop = Some(stop_tx);
        Ok(rx)
    }

    fn stop(&self) {
        if let Some(stop) = self.stop.lock().unwrap_or_else(PoisonError::into_inner).take() {
            let _ = stop.send(true);
            info!("simulated device source stopped");
        }
    }
}
