//! # lattice-types
//!
//! Shared geometry, pose, and anchor types for the Lattice spatial platform.
//!
//! These types are used by:
//! - `lattice-backend`: session fan-out, anchor service, wire messages
//! - `lattice-fusion`: pose fusion core and VIO EKF
//!
//! ## Coordinate Conventions
//!
//! - **World frame**: right-hand Cartesian, Z up, meters. The session host
//!   publishes the origin during colocalization.
//! - **Quaternions on the wire**: `[x, y, z, w]`, unit norm (1e-3 tolerance).
//! - **EKF-internal quaternions**: `[w, x, y, z]` (see `lattice-fusion`).

use serde::{Deserialize, Serialize};

// ── 3D Vector & Quaternion ────────────────────────────────────────────────────

/// 3D vector (meters)
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Vec3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Vec3 {
    pub const ZERO: Vec3 = Vec3 { x: 0.0, y: 0.0, z: 0.0 };

    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    pub fn norm(&self) -> f64 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }

    /// Euclidean distance to another point
    pub fn distance(&self, other: &Vec3) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        let dz = self.z - other.z;
        (dx * dx + dy * dy + dz * dz).sqrt()
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }

    pub fn to_array(&self) -> [f64; 3] {
        [self.x, self.y, self.z]
    }
}

impl From<[f64; 3]> for Vec3 {
    fn from(a: [f64; 3]) -> Self {
        Self { x: a[0], y: a[1], z: a[2] }
    }
}

/// Orientation quaternion, wire order `[x, y, z, w]`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quat {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub w: f64,
}

impl Default for Quat {
    fn default() -> Self {
        Self { x: 0.0, y: 0.0, z: 0.0, w: 1.0 }
    }
}

impl Quat {
    pub const IDENTITY: Quat = Quat { x: 0.0, y: 0.0, z: 0.0, w: 1.0 };

    pub fn new(x: f64, y: f64, z: f64, w: f64) -> Self {
        Self { x, y, z, w }
    }

    pub fn norm(&self) -> f64 {
        (self.x * self.x + self.y * self.y + self.z * self.z + self.w * self.w).sqrt()
    }

    /// Unit-norm check with the wire tolerance window used by message
    /// validation (magnitude within [0.9, 1.1]).
    pub fn is_normalized(&self) -> bool {
        let m = self.norm();
        (0.9..=1.1).contains(&m)
    }

    /// Strict unit-norm check for stored anchors (|‖q‖ − 1| < 1e-3)
    pub fn is_unit(&self) -> bool {
        (self.norm() - 1.0).abs() < 1e-3
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite() && self.w.is_finite()
    }

    pub fn normalized(&self) -> Quat {
        let m = self.norm();
        if m < 1e-12 {
            return Quat::IDENTITY;
        }
        Quat { x: self.x / m, y: self.y / m, z: self.z / m, w: self.w / m }
    }

    pub fn to_array(&self) -> [f64; 4] {
        [self.x, self.y, self.z, self.w]
    }
}

impl From<[f64; 4]> for Quat {
    fn from(a: [f64; 4]) -> Self {
        Self { x: a[0], y: a[1], z: a[2], w: a[3] }
    }
}

// ── Tracking & Source Enums ───────────────────────────────────────────────────

/// AR tracking quality reported alongside every pose and anchor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackingState {
    #[default]
    Tracking,
    Limited,
    Paused,
    Stopped,
    Lost,
    Initializing,
}

impl TrackingState {
    /// States a stored anchor may carry. The filter-side states
    /// `limited`/`lost`/`initializing` never reach the anchor store.
    pub fn is_anchor_state(&self) -> bool {
        matches!(self, Self::Tracking | Self::Paused | Self::Stopped)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tracking => "tracking",
            Self::Limited => "limited",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
            Self::Lost => "lost",
            Self::Initializing => "initializing",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "tracking" => Some(Self::Tracking),
            "limited" => Some(Self::Limited),
            "paused" => Some(Self::Paused),
            "stopped" => Some(Self::Stopped),
            "lost" => Some(Self::Lost),
            "initializing" => Some(Self::Initializing),
            _ => None,
        }
    }
}

/// Where a fused pose sample came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoseSource {
    Slam,
    Vio,
    Vps,
    Predicted,
}

/// How a session agrees on a shared coordinate frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColocalizationMethod {
    #[default]
    QrCode,
    Visual,
    Gps,
    Manual,
}

/// Anchor persistence class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnchorType {
    #[default]
    Persistent,
    Temporary,
    Shared,
}

impl AnchorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Persistent => "persistent",
            Self::Temporary => "temporary",
            Self::Shared => "shared",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "persistent" => Some(Self::Persistent),
            "temporary" => Some(Self::Temporary),
            "shared" => Some(Self::Shared),
            _ => None,
        }
    }
}

// ── Pose ──────────────────────────────────────────────────────────────────────

/// A 6-DoF pose sample with confidence and provenance.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Pose {
    pub position: Vec3,
    /// Wire-order quaternion [x, y, z, w]
    pub rotation: Quat,
    /// Seconds since epoch (fractional)
    pub timestamp: f64,
    pub confidence: f64,
    pub tracking_state: TrackingState,
}

impl Pose {
    pub fn identity(timestamp: f64) -> Self {
        Self {
            position: Vec3::ZERO,
            rotation: Quat::IDENTITY,
            timestamp,
            confidence: 1.0,
            tracking_state: TrackingState::Tracking,
        }
    }
}

/// A pose sample inside the fusion core ring buffer. Velocity fields are
/// present only for VIO-sourced samples.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PoseSample {
    pub position: Vec3,
    pub rotation: Quat,
    pub timestamp: f64,
    pub confidence: f64,
    pub tracking_state: TrackingState,
    pub source: PoseSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub velocity: Option<Vec3>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub angular_velocity: Option<Vec3>,
    #[serde(default)]
    pub is_prediction: bool,
}

// ── Shared Coordinate System ──────────────────────────────────────────────────

/// Session-wide coordinate frame published by the host during colocalization.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CoordinateSystem {
    pub origin: Vec3,
    pub rotation: Quat,
}

impl Default for CoordinateSystem {
    fn default() -> Self {
        Self { origin: Vec3::ZERO, rotation: Quat::IDENTITY }
    }
}
