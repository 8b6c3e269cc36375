//! # lattice-fusion
//!
//! Per-session AR localization fusion for the Lattice spatial platform.
//!
//! Two cooperating pieces:
//! - [`fusion::PoseFusion`] — merges SLAM, VIO, and VPS pose streams into a
//!   single authoritative pose with confidence-weighted source selection and
//!   short-horizon motion-model prediction.
//! - [`ekf::VioEkf`] — a 19-state Extended Kalman filter over IMU + camera
//!   (position, quaternion, velocity, angular velocity, accel/gyro biases).
//!
//! Both are pure CPU math with explicit timestamps: no wall-clock reads, no
//! I/O, no suspension points. Callers feed samples and read state.

pub mod ekf;
pub mod fusion;
pub mod imu;

pub use ekf::{CameraIntrinsics, EkfError, VioCalibration, VioEkf, VioState, VisualFeature};
pub use fusion::{FusionConfig, PoseFusion};
pub use imu::ImuSample;
