//! IMU sample type and stationarity detection used by EKF initialization.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

/// Gravity magnitude used throughout the filter (m/s²)
pub const GRAVITY: f64 = 9.81;

/// One inertial measurement: specific force + angular rate, body frame.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ImuSample {
    /// Seconds since epoch (fractional)
    pub timestamp: f64,
    /// Accelerometer reading [x, y, z] m/s² (measures specific force — a
    /// device at rest reads +g along the axis pointing up)
    pub accel: [f64; 3],
    /// Gyroscope reading [x, y, z] rad/s
    pub gyro: [f64; 3],
}

impl ImuSample {
    pub fn new(timestamp: f64, accel: [f64; 3], gyro: [f64; 3]) -> Self {
        Self { timestamp, accel, gyro }
    }

    pub fn accel_vec(&self) -> Vector3<f64> {
        Vector3::new(self.accel[0], self.accel[1], self.accel[2])
    }

    pub fn gyro_vec(&self) -> Vector3<f64> {
        Vector3::new(self.gyro[0], self.gyro[1], self.gyro[2])
    }

    /// Stationarity gate for initialization: |‖a‖ − g| < 0.5 and ‖ω‖ < 0.1.
    pub fn is_stationary(&self) -> bool {
        let accel_dev = (self.accel_vec().norm() - GRAVITY).abs();
        accel_dev < 0.5 && self.gyro_vec().norm() < 0.1
    }
}
