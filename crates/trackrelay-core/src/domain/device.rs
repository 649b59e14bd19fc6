//! Device descriptors, poses and per-device state.
//!
//! A [`DeviceDescriptor`] is the static, session-lifetime description of one
//! tracked device.  A [`DeviceState`] is its live record: latest pose,
//! velocities, buttons, valuators, time stamp and validity.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::protocol::codec::ProtocolError;
use crate::protocol::messages::DeviceUpdate;

/// Microseconds since the Unix epoch, used to stamp updates that arrive
/// without a time stamp of their own.
pub fn local_time_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}

// ── Geometry ──────────────────────────────────────────────────────────────────

/// A 3-component vector (metres, or metres/radians per second for velocities).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    pub const ZERO: Vec3 = Vec3 { x: 0.0, y: 0.0, z: 0.0 };

    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }
}

/// A rotation quaternion, stored `(x, y, z, w)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quat {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub w: f32,
}

impl Quat {
    pub const IDENTITY: Quat = Quat { x: 0.0, y: 0.0, z: 0.0, w: 1.0 };

    pub const fn new(x: f32, y: f32, z: f32, w: f32) -> Self {
        Self { x, y, z, w }
    }

    /// Rotation of `angle` radians about the vertical (y) axis.
    pub fn from_yaw(angle: f32) -> Self {
        let half = angle * 0.5;
        Self::new(0.0, half.sin(), 0.0, half.cos())
    }

    /// Returns the quaternion scaled to unit length, or identity if it is degenerate.
    pub fn normalized(self) -> Self {
        let len = (self.x * self.x + self.y * self.y + self.z * self.z + self.w * self.w).sqrt();
        if len.is_finite() && len > f32::EPSILON {
            Self::new(self.x / len, self.y / len, self.z / len, self.w / len)
        } else {
            Self::IDENTITY
        }
    }
}

impl Default for Quat {
    fn default() -> Self {
        Self::IDENTITY
    }
}

/// Position plus orientation.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Pose {
    pub position: Vec3,
    pub orientation: Quat,
}

impl Pose {
    pub const fn new(position: Vec3, orientation: Quat) -> Self {
        Self { position, orientation }
    }

    /// A pose with identity orientation.
    pub const fn at(position: Vec3) -> Self {
        Self { position, orientation: Quat::IDENTITY }
    }
}

/// Linear and angular velocity.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Velocity {
    pub linear: Vec3,
    pub angular: Vec3,
}

// ── Descriptor ────────────────────────────────────────────────────────────────

/// Which parts of a pose a device reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum TrackingType {
    None = 0,
    Position = 1,
    PositionOrientation = 2,
}

impl TryFrom<u8> for TrackingType {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(TrackingType::None),
            1 => Ok(TrackingType::Position),
            2 => Ok(TrackingType::PositionOrientation),
            _ => Err(()),
        }
    }
}

/// The value range of an analog valuator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ValuatorKind {
    /// `[-1, 1]`, e.g. a joystick axis.
    Bipolar = 0,
    /// `[0, 1]`, e.g. a trigger.
    Unipolar = 1,
}

impl ValuatorKind {
    pub const fn range(self) -> (f32, f32) {
        match self {
            ValuatorKind::Bipolar => (-1.0, 1.0),
            ValuatorKind::Unipolar => (0.0, 1.0),
        }
    }

    /// Clamps `value` into this kind's range; NaN becomes `0.0`.
    pub fn clamp(self, value: f32) -> f32 {
        if value.is_nan() {
            return 0.0;
        }
        let (lo, hi) = self.range();
        value.clamp(lo, hi)
    }
}

impl TryFrom<u8> for ValuatorKind {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ValuatorKind::Bipolar),
            1 => Ok(ValuatorKind::Unipolar),
            _ => Err(()),
        }
    }
}

/// Static description of one device.
///
/// The device's index is its position in the descriptor table it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub name: String,
    pub tracking: TrackingType,
    pub buttons: u16,
    pub valuators: Vec<ValuatorKind>,
}

impl DeviceDescriptor {
    pub fn new(name: impl Into<String>, tracking: TrackingType) -> Self {
        Self {
            name: name.into(),
            tracking,
            buttons: 0,
            valuators: Vec::new(),
        }
    }

    pub fn with_buttons(mut self, buttons: u16) -> Self {
        self.buttons = buttons;
        self
    }

    pub fn with_valuators(mut self, valuators: Vec<ValuatorKind>) -> Self {
        self.valuators = valuators;
        self
    }

    /// A copy of this descriptor under a different name.
    pub fn renamed(&self, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..self.clone()
        }
    }
}

// ── State ─────────────────────────────────────────────────────────────────────

/// The latest known state of one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceState {
    pub pose: Pose,
    pub linear_velocity: Vec3,
    pub angular_velocity: Vec3,
    pub buttons: Vec<bool>,
    pub valuators: Vec<f32>,
    /// Microseconds; never decreases.
    pub time_stamp: u64,
    pub valid: bool,
    /// `true` if the most recent update carried a time stamp older than the
    /// one already stored.
    pub late: bool,
}

impl DeviceState {
    /// Initial state for `descriptor`: invalid, identity pose, everything zeroed.
    pub fn new(descriptor: &DeviceDescriptor) -> Self {
        Self {
            pose: Pose::default(),
            linear_velocity: Vec3::ZERO,
            angular_velocity: Vec3::ZERO,
            buttons: vec![false; descriptor.buttons as usize],
            valuators: vec![0.0; descriptor.valuators.len()],
            time_stamp: 0,
            valid: false,
            late: false,
        }
    }

    /// Checks that `update` fits `descriptor` without touching any state.
    ///
    /// # Errors
    ///
    /// - [`ProtocolError::CountMismatch`] if the button or valuator count differs.
    /// - [`ProtocolError::PoseNotTracked`] if a pose is sent for an untracked device.
    pub fn check(
        descriptor: &DeviceDescriptor,
        index: usize,
        update: &DeviceUpdate,
    ) -> Result<(), ProtocolError> {
        if update.pose.is_some() && descriptor.tracking == TrackingType::None {
            return Err(ProtocolError::PoseNotTracked { device: index });
        }
        if let Some(buttons) = &update.buttons {
            if buttons.len() != descriptor.buttons as usize {
                return Err(ProtocolError::CountMismatch {
                    device: index,
                    what: "buttons",
                    expected: descriptor.buttons as usize,
                    received: buttons.len(),
                });
            }
        }
        if let Some(valuators) = &update.valuators {
            if valuators.len() != descriptor.valuators.len() {
                return Err(ProtocolError::CountMismatch {
                    device: index,
                    what: "valuators",
                    expected: descriptor.valuators.len(),
                    received: valuators.len(),
                });
            }
        }
        Ok(())
    }

    /// Applies an already-checked update; returns `true` if it arrived late.
    ///
    /// `local_now` stamps updates that carry no time stamp.  Fields are
    /// applied even when late; only the stored time stamp refuses to go
    /// backwards.
    pub fn apply(
        &mut self,
        descriptor: &DeviceDescriptor,
        update: &DeviceUpdate,
        local_now: u64,
    ) -> bool {
        if let Some(pose) = update.pose {
            self.pose = match descriptor.tracking {
                TrackingType::PositionOrientation => {
                    Pose::new(pose.position, pose.orientation.normalized())
                }
                _ => Pose::at(pose.position),
            };
        }
        if let Some(velocity) = update.velocity {
            self.linear_velocity = velocity.linear;
            self.angular_velocity = velocity.angular;
        }
        if let Some(buttons) = &update.buttons {
            self.buttons.clone_from(buttons);
        }
        if let Some(valuators) = &update.valuators {
            let kinds = &descriptor.valuators;
            for ((slot, value), kind) in self.valuators.iter_mut().zip(valuators).zip(kinds) {
                *slot = kind.clamp(*value);
            }
        }

        let ts = update.time_stamp.unwrap_or(local_now);
        let late = ts < self.time_stamp;
        self.time_stamp = self.time_stamp.max(ts);
        self.late = late;
        self.valid = update.valid.unwrap_or(true);
        late
    }

    /// Marks the device invalid without touching anything else.
    pub fn invalidate(&mut self) {
        self.valid = false;
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn wand() -> DeviceDescriptor {
        DeviceDescriptor::new("wand", TrackingType::PositionOrientation)
            .with_buttons(3)
            .with_valuators(vec![ValuatorKind::Bipolar, ValuatorKind::Unipolar])
    }

    #[test]
    fn test_new_state_is_invalid_and_sized_from_descriptor() {
        let state = DeviceState::new(&wand());

        assert!(!state.valid);
        assert_eq!(state.buttons, vec![false; 3]);
        assert_eq!(state.valuators, vec![0.0; 2]);
        assert_eq!(state.pose.orientation, Quat::IDENTITY);
    }

    #[test]
    fn test_valuator_clamping_per_kind() {
        assert_eq!(ValuatorKind::Bipolar.clamp(-3.0), -1.0);
        assert_eq!(ValuatorKind::Bipolar.clamp(0.25), 0.25);
        assert_eq!(ValuatorKind::Unipolar.clamp(-0.5), 0.0);
        assert_eq!(ValuatorKind::Unipolar.clamp(7.0), 1.0);
        assert_eq!(ValuatorKind::Bipolar.clamp(f32::NAN), 0.0);
    }

    #[test]
    fn test_check_rejects_wrong_button_count() {
        let update = DeviceUpdate::new(0).with_buttons(vec![true]);

        let err = DeviceState::check(&wand(), 0, &update).unwrap_err();

        assert!(matches!(
            err,
            ProtocolError::CountMismatch { what: "buttons", expected: 3, received: 1, .. }
        ));
    }

    #[test]
    fn test_check_rejects_pose_for_untracked_device() {
        let pad = DeviceDescriptor::new("pad", TrackingType::None).with_buttons(1);
        let update = DeviceUpdate::new(4).with_pose(Pose::default());

        assert_eq!(
            DeviceState::check(&pad, 4, &update),
            Err(ProtocolError::PoseNotTracked { device: 4 })
        );
    }

    #[test]
    fn test_apply_clamps_valuators_and_sets_valid() {
        // Arrange
        let descriptor = wand();
        let mut state = DeviceState::new(&descriptor);
        let update = DeviceUpdate::new(0)
            .with_valuators(vec![2.0, -2.0])
            .with_time_stamp(10);

        // Act
        let late = state.apply(&descriptor, &update, 999);

        // Assert
        assert!(!late);
        assert_eq!(state.valuators, vec![1.0, 0.0]);
        assert_eq!(state.time_stamp, 10);
        assert!(state.valid);
    }

    #[test]
    fn test_apply_older_time_stamp_is_flagged_late_but_applied() {
        let descriptor = wand();
        let mut state = DeviceState::new(&descriptor);
        state.apply(&descriptor, &DeviceUpdate::new(0).with_time_stamp(500), 0);

        let late = state.apply(
            &descriptor,
            &DeviceUpdate::new(0)
                .with_pose(Pose::at(Vec3::new(1.0, 0.0, 0.0)))
                .with_time_stamp(400),
            0,
        );

        assert!(late);
        assert!(state.late);
        assert_eq!(state.time_stamp, 500);
        assert_eq!(state.pose.position, Vec3::new(1.0, 0.0, 0.0));
    }

    #[test]
    fn test_apply_without_time_stamp_uses_local_clock() {
        let descriptor = wand();
        let mut state = DeviceState::new(&descriptor);

        state.apply(&descriptor, &DeviceUpdate::new(0), 1234);

        assert_eq!(state.time_stamp, 1234);
    }

    #[test]
    fn test_position_only_device_ignores_orientation() {
        let descriptor = DeviceDescriptor::new("puck", TrackingType::Position);
        let mut state = DeviceState::new(&descriptor);
        let pose = Pose::new(Vec3::new(1.0, 2.0, 3.0), Quat::from_yaw(1.0));

        state.apply(&descriptor, &DeviceUpdate::new(0).with_pose(pose), 0);

        assert_eq!(state.pose, Pose::at(Vec3::new(1.0, 2.0, 3.0)));
    }

    #[test]
    fn test_explicit_invalid_flag_is_respected() {
        let descriptor = wand();
        let mut state = DeviceState::new(&descriptor);
        state.apply(&descriptor, &DeviceUpdate::new(0), 1);

        state.apply(&descriptor, &DeviceUpdate::invalid(0, 2), 0);

        assert!(!state.valid);
        assert_eq!(state.time_stamp, 2);
    }

    #[test]
    fn test_quaternion_normalisation_handles_degenerate_input() {
        assert_eq!(Quat::new(0.0, 0.0, 0.0, 0.0).normalized(), Quat::IDENTITY);
        let q = Quat::new(0.0, 0.0, 0.0, 2.0).normalized();
        assert_eq!(q, Quat::IDENTITY);
    }
}
