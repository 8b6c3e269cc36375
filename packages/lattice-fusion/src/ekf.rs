//! # ekf
//!
//! 19-state Extended Kalman filter for visual-inertial odometry.
//!
//! State vector layout:
//!   [pos(3), quat(4, wxyz), vel(3), ang_vel(3), accel_bias(3), gyro_bias(3)]
//!
//! IMU samples drive the prediction step (discrete Euler integration with
//! gravity compensation in the world frame, biases as random walk); 2-D/3-D
//! feature correspondences drive the visual update through a pinhole
//! projection model and its analytic Jacobian.
//!
//! ## Invariants
//! - Quaternion norm stays within [0.9, 1.1] and is renormalized after every
//!   update step.
//! - Covariance is symmetrized after each update; callers can rely on it
//!   staying positive semi-definite across long predict/update runs.

use nalgebra::{
    DMatrix, DVector, Matrix2x3, Matrix3, Matrix4x3, Quaternion, SMatrix, SVector, UnitQuaternion,
    Vector3,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use lattice_types::TrackingState;

use crate::imu::{ImuSample, GRAVITY};

/// State vector size: pos(3) + quat(4) + vel(3) + ang_vel(3) + biases(6)
pub const STATE_SIZE: usize = 19;

const POS: usize = 0;
const QUAT: usize = 3;
const VEL: usize = 7;
const ANG_VEL: usize = 10;
const BIAS_A: usize = 13;
const BIAS_G: usize = 16;

type StateVector = SVector<f64, STATE_SIZE>;
type StateMatrix = SMatrix<f64, STATE_SIZE, STATE_SIZE>;

#[derive(Debug, Error)]
pub enum EkfError {
    #[error("filter is not initialized")]
    NotInitialized,
    #[error("insufficient IMU samples for initialization: {0} < 50")]
    InsufficientSamples(usize),
    #[error("device not stationary enough for initialization")]
    NotStationary,
    #[error("invalid time delta: {0}")]
    InvalidTimeDelta(f64),
    #[error("insufficient feature correspondences: {0} < 4")]
    InsufficientFeatures(usize),
    #[error("innovation covariance is singular")]
    SingularInnovation,
}

// ── Calibration ───────────────────────────────────────────────────────────────

/// IMU and camera noise characteristics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VioCalibration {
    /// Accelerometer noise, m/s² std
    pub accel_noise_std: f64,
    /// Gyroscope noise, rad/s std
    pub gyro_noise_std: f64,
    /// Accelerometer bias random walk, m/s² std
    pub accel_bias_std: f64,
    /// Gyroscope bias random walk, rad/s std
    pub gyro_bias_std: f64,
    /// Visual feature noise, pixel std
    pub pixel_noise_std: f64,
}

impl Default for VioCalibration {
    fn default() -> Self {
        Self {
            accel_noise_std: 0.1,
            gyro_noise_std: 0.01,
            accel_bias_std: 0.05,
            gyro_bias_std: 0.001,
            pixel_noise_std: 1.0,
        }
    }
}

/// Pinhole camera intrinsics for the visual update.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CameraIntrinsics {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
}

impl Default for CameraIntrinsics {
    fn default() -> Self {
        Self { fx: 500.0, fy: 500.0, cx: 320.0, cy: 240.0 }
    }
}

/// One 2-D/3-D feature correspondence: an observed image point and the
/// world-frame landmark it tracks.
#[derive(Debug, Clone, Copy)]
pub struct VisualFeature {
    /// Observed pixel [u, v]
    pub pixel: [f64; 2],
    /// World-frame landmark [x, y, z]
    pub landmark: [f64; 3],
}

// ── Output State ──────────────────────────────────────────────────────────────

/// Snapshot of the filter estimate exposed to the fusion core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VioState {
    pub timestamp: f64,
    pub position: [f64; 3],
    /// Quaternion [w, x, y, z]
    pub orientation: [f64; 4],
    pub velocity: [f64; 3],
    pub angular_velocity: [f64; 3],
    pub accel_bias: [f64; 3],
    pub gyro_bias: [f64; 3],
    /// Trace of the 3×3 position covariance block
    pub position_uncertainty: f64,
    /// Trace of the 3×3 orientation covariance block
    pub orientation_uncertainty: f64,
    pub confidence: f64,
    pub tracking_state: TrackingState,
}

// ── Filter ────────────────────────────────────────────────────────────────────

pub struct VioEkf {
    calibration: VioCalibration,
    intrinsics: CameraIntrinsics,
    state: StateVector,
    covariance: StateMatrix,
    process_noise: StateMatrix,
    is_initialized: bool,
    last_imu_timestamp: f64,
    /// World-frame gravity vector (−Z down)
    gravity: Vector3<f64>,
}

impl VioEkf {
    pub fn new(calibration: VioCalibration, intrinsics: CameraIntrinsics) -> Self {
        let mut state = StateVector::zeros();
        state[QUAT] = 1.0; // identity quaternion [w, x, y, z]

        let process_noise = Self::build_process_noise(&calibration);

        Self {
            calibration,
            intrinsics,
            state,
            covariance: StateMatrix::identity() * 1000.0,
            process_noise,
            is_initialized: false,
            last_imu_timestamp: 0.0,
            gravity: Vector3::new(0.0, 0.0, -GRAVITY),
        }
    }

    fn build_process_noise(cal: &VioCalibration) -> StateMatrix {
        let mut q = StateMatrix::zeros();
        for i in 0..3 {
            q[(POS + i, POS + i)] = 0.01;
            q[(VEL + i, VEL + i)] = cal.accel_noise_std * cal.accel_noise_std;
            q[(ANG_VEL + i, ANG_VEL + i)] = cal.gyro_noise_std * cal.gyro_noise_std;
            q[(BIAS_A + i, BIAS_A + i)] = cal.accel_bias_std * cal.accel_bias_std;
            q[(BIAS_G + i, BIAS_G + i)] = cal.gyro_bias_std * cal.gyro_bias_std;
        }
        for i in 0..4 {
            q[(QUAT + i, QUAT + i)] = 0.001;
        }
        q
    }

    pub fn is_initialized(&self) -> bool {
        self.is_initialized
    }

    // ── Initialization ────────────────────────────────────────────────────────

    /// Initialize from a window of static IMU samples: align orientation with
    /// the averaged gravity direction and estimate initial sensor biases.
    ///
    /// Requires ≥ 50 samples, 80% of which must register as stationary.
    pub fn initialize(&mut self, samples: &[ImuSample]) -> Result<(), EkfError> {
        if samples.len() < 50 {
            return Err(EkfError::InsufficientSamples(samples.len()));
        }

        let stationary = samples.iter().filter(|s| s.is_stationary()).count();
        if (stationary as f64) < samples.len() as f64 * 0.8 {
            warn!(
                "VIO init rejected: {stationary}/{} samples stationary",
                samples.len()
            );
            return Err(EkfError::NotStationary);
        }

        let n = samples.len() as f64;
        let mean_accel: Vector3<f64> =
            samples.iter().map(|s| s.accel_vec()).sum::<Vector3<f64>>() / n;
        let mean_gyro: Vector3<f64> =
            samples.iter().map(|s| s.gyro_vec()).sum::<Vector3<f64>>() / n;

        // A static accelerometer reads the gravity reaction: rotate that
        // measured direction onto world +Z (Rodrigues alignment).
        let orientation = align_with_gravity(&mean_accel);
        let q = orientation.quaternion();
        self.state[QUAT] = q.w;
        self.state[QUAT + 1] = q.i;
        self.state[QUAT + 2] = q.j;
        self.state[QUAT + 3] = q.k;

        for i in 0..3 {
            self.state[POS + i] = 0.0;
            self.state[VEL + i] = 0.0;
            self.state[ANG_VEL + i] = 0.0;
        }

        // Gyro bias is the stationary mean; accel bias is what remains after
        // removing the expected gravity reaction in the body frame.
        let expected_accel = orientation.inverse() * Vector3::new(0.0, 0.0, GRAVITY);
        let accel_bias = mean_accel - expected_accel;
        for i in 0..3 {
            self.state[BIAS_G + i] = mean_gyro[i];
            self.state[BIAS_A + i] = accel_bias[i];
        }

        // Post-alignment uncertainty per state block: 1 m position, 0.1 rad
        // orientation, 0.1 m/s velocity, 0.01 / 0.001 biases. Each block total
        // is spread across its axes.
        self.covariance = StateMatrix::identity();
        for i in 0..3 {
            self.covariance[(POS + i, POS + i)] = 1.0 / 3.0;
            self.covariance[(VEL + i, VEL + i)] = 0.1 / 3.0;
            self.covariance[(BIAS_A + i, BIAS_A + i)] = 0.01 / 3.0;
            self.covariance[(BIAS_G + i, BIAS_G + i)] = 0.001 / 3.0;
        }
        for i in 0..4 {
            self.covariance[(QUAT + i, QUAT + i)] = 0.1 / 4.0;
        }

        self.is_initialized = true;
        self.last_imu_timestamp = samples[samples.len() - 1].timestamp;

        debug!("VIO EKF initialized ({stationary}/{} stationary samples)", samples.len());
        Ok(())
    }

    // ── Prediction ────────────────────────────────────────────────────────────

    /// Propagate the state forward with one IMU sample.
    ///
    /// Rejects `dt ∉ (0, 0.1]` — out-of-order or gapped IMU streams must not
    /// corrupt the estimate.
    pub fn predict(&mut self, sample: &ImuSample) -> Result<(), EkfError> {
        if !self.is_initialized {
            return Err(EkfError::NotInitialized);
        }

        let dt = sample.timestamp - self.last_imu_timestamp;
        if dt <= 0.0 || dt > 0.1 {
            return Err(EkfError::InvalidTimeDelta(dt));
        }

        let orientation = self.unit_quaternion();
        let accel_bias = self.segment3(BIAS_A);
        let gyro_bias = self.segment3(BIAS_G);

        let accel_body = sample.accel_vec() - accel_bias;
        let gyro_body = sample.gyro_vec() - gyro_bias;

        // Specific force to world-frame acceleration: a_w = R·f + g
        let accel_world = orientation * accel_body + self.gravity;

        let vel = self.segment3(VEL);
        let new_pos = self.segment3(POS) + vel * dt + accel_world * (0.5 * dt * dt);
        let new_vel = vel + accel_world * dt;

        // Quaternion update by axis-angle rotation from ω·dt
        let rotation_vec = gyro_body * dt;
        let angle = rotation_vec.norm();
        let new_q = if angle > 1e-8 {
            let axis = rotation_vec / angle;
            let delta = Quaternion::new(
                (angle / 2.0).cos(),
                axis[0] * (angle / 2.0).sin(),
                axis[1] * (angle / 2.0).sin(),
                axis[2] * (angle / 2.0).sin(),
            );
            (self.quaternion() * delta).normalize()
        } else {
            self.quaternion().normalize()
        };

        for i in 0..3 {
            self.state[POS + i] = new_pos[i];
            self.state[VEL + i] = new_vel[i];
            self.state[ANG_VEL + i] = gyro_body[i];
        }
        self.state[QUAT] = new_q.w;
        self.state[QUAT + 1] = new_q.i;
        self.state[QUAT + 2] = new_q.j;
        self.state[QUAT + 3] = new_q.k;

        // P ← F·P·Fᵀ + Q·dt with the sparse transition Jacobian
        let f = self.transition_jacobian(dt);
        self.covariance = f * self.covariance * f.transpose() + self.process_noise * dt;

        self.last_imu_timestamp = sample.timestamp;
        Ok(())
    }

    /// Sparse state-transition Jacobian: position couples to velocity,
    /// quaternion to angular velocity.
    fn transition_jacobian(&self, dt: f64) -> StateMatrix {
        let mut f = StateMatrix::identity();
        for i in 0..3 {
            f[(POS + i, VEL + i)] = dt;
        }
        // Quaternion rate ≈ ½·Ξ(q)·ω; first-order coupling onto the 4×3 block
        for i in 0..3 {
            f[(QUAT + i + 1, ANG_VEL + i)] = 0.5 * dt;
        }
        f
    }

    // ── Visual Update ─────────────────────────────────────────────────────────

    /// Fuse 2-D/3-D feature correspondences through the pinhole model.
    ///
    /// Requires ≥ 4 usable correspondences (landmarks behind the camera are
    /// dropped). A singular innovation covariance skips the update and leaves
    /// the predicted state untouched.
    pub fn update_visual(&mut self, features: &[VisualFeature]) -> Result<(), EkfError> {
        if !self.is_initialized {
            return Err(EkfError::NotInitialized);
        }
        if features.len() < 4 {
            return Err(EkfError::InsufficientFeatures(features.len()));
        }

        let orientation = self.unit_quaternion();
        let rotation = orientation.to_rotation_matrix();
        let r_transpose = rotation.matrix().transpose();
        let position = self.segment3(POS);

        // Build stacked innovation vector and measurement Jacobian
        let mut rows: Vec<(f64, f64, Matrix2x3<f64>, Vector3<f64>)> = Vec::new();
        for feature in features {
            let landmark = Vector3::new(feature.landmark[0], feature.landmark[1], feature.landmark[2]);
            let p_cam = r_transpose * (landmark - position);
            if p_cam.z < 1e-3 {
                continue; // behind or on the image plane
            }

            let (fx, fy) = (self.intrinsics.fx, self.intrinsics.fy);
            let (x, y, z) = (p_cam.x, p_cam.y, p_cam.z);
            let u = fx * x / z + self.intrinsics.cx;
            let v = fy * y / z + self.intrinsics.cy;

            // ∂(u,v)/∂p_cam
            #[rustfmt::skip]
            let proj = Matrix2x3::new(
                fx / z, 0.0,    -fx * x / (z * z),
                0.0,    fy / z, -fy * y / (z * z),
            );

            rows.push((feature.pixel[0] - u, feature.pixel[1] - v, proj, p_cam));
        }

        if rows.len() < 4 {
            return Err(EkfError::InsufficientFeatures(rows.len()));
        }

        let m = rows.len() * 2;
        let mut h = DMatrix::<f64>::zeros(m, STATE_SIZE);
        let mut innovation = DVector::<f64>::zeros(m);

        // δθ→δq chain: δq = ½·Ξ(q)·δθ, so ∂δθ/∂q = 2·Ξ(q)ᵀ
        let xi_t = self.xi_matrix().transpose() * 2.0;

        for (row, (du, dv, proj, p_cam)) in rows.iter().enumerate() {
            innovation[row * 2] = *du;
            innovation[row * 2 + 1] = *dv;

            // ∂p_cam/∂position = −Rᵀ
            let h_pos = proj * (-r_transpose);
            // ∂p_cam/∂δθ = [p_cam]× (body-frame perturbation)
            let h_quat = proj * skew(p_cam) * xi_t;

            for col in 0..3 {
                h[(row * 2, POS + col)] = h_pos[(0, col)];
                h[(row * 2 + 1, POS + col)] = h_pos[(1, col)];
            }
            for col in 0..4 {
                h[(row * 2, QUAT + col)] = h_quat[(0, col)];
                h[(row * 2 + 1, QUAT + col)] = h_quat[(1, col)];
            }
        }

        let pixel_var = self.calibration.pixel_noise_std * self.calibration.pixel_noise_std;
        let p = DMatrix::<f64>::from_fn(STATE_SIZE, STATE_SIZE, |r, c| self.covariance[(r, c)]);

        // S = H·P·Hᵀ + R
        let mut s = &h * &p * h.transpose();
        for i in 0..m {
            s[(i, i)] += pixel_var;
        }

        let s_inv = match s.try_inverse() {
            Some(inv) => inv,
            None => {
                warn!("VIO visual update skipped: singular innovation covariance");
                return Err(EkfError::SingularInnovation);
            }
        };

        // K = P·Hᵀ·S⁻¹
        let k = &p * h.transpose() * s_inv;
        let correction = &k * innovation;
        for i in 0..STATE_SIZE {
            self.state[i] += correction[i];
        }

        // P ← (I − K·H)·P, then symmetrize to keep it PSD over long runs
        let i_kh = DMatrix::<f64>::identity(STATE_SIZE, STATE_SIZE) - &k * &h;
        let new_p = i_kh * p;
        for r in 0..STATE_SIZE {
            for c in 0..STATE_SIZE {
                self.covariance[(r, c)] = 0.5 * (new_p[(r, c)] + new_p[(c, r)]);
            }
        }

        self.renormalize_quaternion();
        Ok(())
    }

    // ── Output ────────────────────────────────────────────────────────────────

    /// Current filter estimate with confidence derived from the covariance
    /// trace: `clamp(1 − (tr(P_pos) + tr(P_ori)) / 10, 0, 1)`.
    pub fn state(&self) -> VioState {
        let pos_uncertainty: f64 = (0..3).map(|i| self.covariance[(POS + i, POS + i)]).sum();
        let ori_uncertainty: f64 = (0..3).map(|i| self.covariance[(QUAT + i, QUAT + i)]).sum();
        let confidence = (1.0 - (pos_uncertainty + ori_uncertainty) / 10.0).clamp(0.0, 1.0);

        let tracking_state = if !self.is_initialized {
            TrackingState::Initializing
        } else if confidence >= 0.7 {
            TrackingState::Tracking
        } else if confidence >= 0.3 {
            TrackingState::Limited
        } else {
            TrackingState::Lost
        };

        VioState {
            timestamp: self.last_imu_timestamp,
            position: self.array3(POS),
            orientation: [
                self.state[QUAT],
                self.state[QUAT + 1],
                self.state[QUAT + 2],
                self.state[QUAT + 3],
            ],
            velocity: self.array3(VEL),
            angular_velocity: self.array3(ANG_VEL),
            accel_bias: self.array3(BIAS_A),
            gyro_bias: self.array3(BIAS_G),
            position_uncertainty: pos_uncertainty,
            orientation_uncertainty: ori_uncertainty,
            confidence,
            tracking_state,
        }
    }

    /// Full covariance snapshot (used by the numerical invariant tests)
    pub fn covariance(&self) -> &StateMatrix {
        &self.covariance
    }

    /// Reset to the uninitialized state; the next `initialize` starts fresh.
    pub fn reset(&mut self) {
        self.state = StateVector::zeros();
        self.state[QUAT] = 1.0;
        self.covariance = StateMatrix::identity() * 1000.0;
        self.is_initialized = false;
        self.last_imu_timestamp = 0.0;
        debug!("VIO EKF reset");
    }

    // ── Internal helpers ──────────────────────────────────────────────────────

    fn segment3(&self, offset: usize) -> Vector3<f64> {
        Vector3::new(self.state[offset], self.state[offset + 1], self.state[offset + 2])
    }

    fn array3(&self, offset: usize) -> [f64; 3] {
        [self.state[offset], self.state[offset + 1], self.state[offset + 2]]
    }

    fn quaternion(&self) -> Quaternion<f64> {
        Quaternion::new(
            self.state[QUAT],
            self.state[QUAT + 1],
            self.state[QUAT + 2],
            self.state[QUAT + 3],
        )
    }

    fn unit_quaternion(&self) -> UnitQuaternion<f64> {
        UnitQuaternion::from_quaternion(self.quaternion())
    }

    fn renormalize_quaternion(&mut self) {
        let q = self.quaternion();
        let n = q.norm();
        if n > 1e-12 {
            self.state[QUAT] = q.w / n;
            self.state[QUAT + 1] = q.i / n;
            self.state[QUAT + 2] = q.j / n;
            self.state[QUAT + 3] = q.k / n;
        } else {
            self.state[QUAT] = 1.0;
            self.state[QUAT + 1] = 0.0;
            self.state[QUAT + 2] = 0.0;
            self.state[QUAT + 3] = 0.0;
        }
    }

    /// Ξ(q): the 4×3 map from a small body-frame rotation δθ to the
    /// quaternion increment, δq = ½·q ⊗ [0, δθ].
    fn xi_matrix(&self) -> Matrix4x3<f64> {
        let q = self.quaternion();
        let (w, x, y, z) = (q.w, q.i, q.j, q.k);
        #[rustfmt::skip]
        let xi = Matrix4x3::new(
            -x, -y, -z,
             w, -z,  y,
             z,  w, -x,
            -y,  x,  w,
        ) * 0.5;
        xi
    }
}

/// Rotation aligning the measured gravity reaction with world +Z. Falls back
/// to a half-turn about X when the device is exactly upside down.
fn align_with_gravity(mean_accel: &Vector3<f64>) -> UnitQuaternion<f64> {
    let up = Vector3::z();
    let measured = mean_accel.normalize();
    UnitQuaternion::rotation_between(&measured, &up)
        .unwrap_or_else(|| UnitQuaternion::from_axis_angle(&Vector3::x_axis(), std::f64::consts::PI))
}

fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
    #[rustfmt::skip]
    let m = Matrix3::new(
        0.0,  -v.z,  v.y,
        v.z,   0.0, -v.x,
       -v.y,   v.x,  0.0,
    );
    m
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rand_distr::{Distribution, Normal};

    fn flat_device_samples(n: usize, rng: &mut StdRng) -> Vec<ImuSample> {
        let accel_noise = Normal::new(0.0, 0.1).unwrap();
        let gyro_noise = Normal::new(0.0, 0.01).unwrap();
        (0..n)
            .map(|i| {
                ImuSample::new(
                    i as f64 * 0.01,
                    [
                        accel_noise.sample(rng),
                        accel_noise.sample(rng),
                        GRAVITY + accel_noise.sample(rng),
                    ],
                    [
                        gyro_noise.sample(rng),
                        gyro_noise.sample(rng),
                        gyro_noise.sample(rng),
                    ],
                )
            })
            .collect()
    }

    fn fresh_filter() -> VioEkf {
        VioEkf::new(VioCalibration::default(), CameraIntrinsics::default())
    }

    #[test]
    fn init_rejects_short_window() {
        let mut rng = StdRng::seed_from_u64(7);
        let samples = flat_device_samples(49, &mut rng);
        let mut ekf = fresh_filter();
        assert!(matches!(
            ekf.initialize(&samples),
            Err(EkfError::InsufficientSamples(49))
        ));
    }

    #[test]
    fn init_rejects_moving_device() {
        let samples: Vec<ImuSample> = (0..100)
            .map(|i| ImuSample::new(i as f64 * 0.01, [3.0, 0.0, GRAVITY], [0.5, 0.0, 0.0]))
            .collect();
        let mut ekf = fresh_filter();
        assert!(matches!(ekf.initialize(&samples), Err(EkfError::NotStationary)));
    }

    #[test]
    fn init_from_still_device_reaches_tracking() {
        let mut rng = StdRng::seed_from_u64(42);
        let samples = flat_device_samples(100, &mut rng);
        let mut ekf = fresh_filter();
        ekf.initialize(&samples).unwrap();

        let state = ekf.state();
        assert_eq!(state.tracking_state, TrackingState::Tracking);

        // Estimated orientation must map the measured gravity reaction onto
        // world +Z (i.e. gravity itself onto −Z) within 0.05 rad.
        let q = UnitQuaternion::from_quaternion(Quaternion::new(
            state.orientation[0],
            state.orientation[1],
            state.orientation[2],
            state.orientation[3],
        ));
        let n = samples.len() as f64;
        let mean_accel =
            samples.iter().map(|s| s.accel_vec()).sum::<Vector3<f64>>() / n;
        let rotated = q * mean_accel.normalize();
        let angle = rotated.dot(&Vector3::z()).clamp(-1.0, 1.0).acos();
        assert!(angle < 0.05, "gravity alignment off by {angle} rad");

        // Position drift under 0.1 m across one further second of stationary
        // prediction.
        let mut rng2 = StdRng::seed_from_u64(43);
        let more = flat_device_samples(100, &mut rng2);
        for s in &more {
            let shifted = ImuSample::new(s.timestamp + 1.0, s.accel, s.gyro);
            ekf.predict(&shifted).unwrap();
        }
        let drifted = ekf.state();
        let drift =
            (drifted.position[0].powi(2) + drifted.position[1].powi(2) + drifted.position[2].powi(2))
                .sqrt();
        assert!(drift < 0.1, "stationary drift {drift} m");
    }

    #[test]
    fn predict_rejects_bad_time_deltas() {
        let mut rng = StdRng::seed_from_u64(1);
        let samples = flat_device_samples(60, &mut rng);
        let mut ekf = fresh_filter();
        ekf.initialize(&samples).unwrap();
        let last_ts = samples.last().unwrap().timestamp;

        let gap = ImuSample::new(last_ts + 0.5, [0.0, 0.0, GRAVITY], [0.0; 3]);
        assert!(matches!(ekf.predict(&gap), Err(EkfError::InvalidTimeDelta(_))));

        let backwards = ImuSample::new(last_ts - 0.01, [0.0, 0.0, GRAVITY], [0.0; 3]);
        assert!(matches!(ekf.predict(&backwards), Err(EkfError::InvalidTimeDelta(_))));
    }

    #[test]
    fn predict_requires_initialization() {
        let mut ekf = fresh_filter();
        let s = ImuSample::new(0.01, [0.0, 0.0, GRAVITY], [0.0; 3]);
        assert!(matches!(ekf.predict(&s), Err(EkfError::NotInitialized)));
    }

    #[test]
    fn visual_update_requires_four_features() {
        let mut rng = StdRng::seed_from_u64(5);
        let samples = flat_device_samples(60, &mut rng);
        let mut ekf = fresh_filter();
        ekf.initialize(&samples).unwrap();

        let too_few = vec![
            VisualFeature { pixel: [320.0, 240.0], landmark: [0.0, 0.0, 2.0] };
            3
        ];
        assert!(matches!(
            ekf.update_visual(&too_few),
            Err(EkfError::InsufficientFeatures(3))
        ));
    }

    /// Project a landmark through the current estimate to fabricate a
    /// consistent observation.
    fn observe(ekf: &VioEkf, intr: &CameraIntrinsics, landmark: [f64; 3]) -> VisualFeature {
        let st = ekf.state();
        let q = UnitQuaternion::from_quaternion(Quaternion::new(
            st.orientation[0],
            st.orientation[1],
            st.orientation[2],
            st.orientation[3],
        ));
        let p = Vector3::new(st.position[0], st.position[1], st.position[2]);
        let l = Vector3::new(landmark[0], landmark[1], landmark[2]);
        let p_cam = q.inverse() * (l - p);
        VisualFeature {
            pixel: [
                intr.fx * p_cam.x / p_cam.z + intr.cx,
                intr.fy * p_cam.y / p_cam.z + intr.cy,
            ],
            landmark,
        }
    }

    #[test]
    fn visual_update_renormalizes_quaternion() {
        let mut rng = StdRng::seed_from_u64(11);
        let samples = flat_device_samples(60, &mut rng);
        let mut ekf = fresh_filter();
        ekf.initialize(&samples).unwrap();

        let intr = CameraIntrinsics::default();
        let features: Vec<VisualFeature> = [
            [0.5, 0.2, 3.0],
            [-0.4, 0.3, 2.5],
            [0.1, -0.6, 4.0],
            [0.8, 0.8, 3.5],
            [-0.2, -0.1, 2.0],
        ]
        .iter()
        .map(|&l| observe(&ekf, &intr, l))
        .collect();

        ekf.update_visual(&features).unwrap();
        let st = ekf.state();
        let norm = (st.orientation.iter().map(|c| c * c).sum::<f64>()).sqrt();
        assert!((norm - 1.0).abs() < 1e-9);
    }

    #[test]
    fn covariance_stays_positive_semidefinite() {
        let mut rng = StdRng::seed_from_u64(99);
        let samples = flat_device_samples(60, &mut rng);
        let mut ekf = fresh_filter();
        ekf.initialize(&samples).unwrap();

        let intr = CameraIntrinsics::default();
        let jitter = Normal::new(0.0, 0.05).unwrap();
        let gyro_jitter = Normal::new(0.0, 0.02).unwrap();
        let mut ts = samples.last().unwrap().timestamp;

        for cycle in 0..10_000 {
            ts += 0.01;
            let s = ImuSample::new(
                ts,
                [
                    jitter.sample(&mut rng),
                    jitter.sample(&mut rng),
                    GRAVITY + jitter.sample(&mut rng),
                ],
                [
                    gyro_jitter.sample(&mut rng),
                    gyro_jitter.sample(&mut rng),
                    gyro_jitter.sample(&mut rng),
                ],
            );
            ekf.predict(&s).unwrap();

            if cycle % 50 == 0 {
                let features: Vec<VisualFeature> = [
                    [0.5, 0.2, 3.0],
                    [-0.4, 0.3, 2.5],
                    [0.1, -0.6, 4.0],
                    [0.8, 0.8, 3.5],
                    [-0.2, -0.1, 2.0],
                ]
                .iter()
                .map(|&l| observe(&ekf, &intr, l))
                .collect();
                // A singular S is a legal skip, not a failure
                let _ = ekf.update_visual(&features);
            }

            if cycle % 500 == 0 {
                let p = ekf.covariance();
                for i in 0..STATE_SIZE {
                    assert!(p[(i, i)] >= -1e-9, "negative variance at ({i},{i}): {}", p[(i, i)]);
                    for j in 0..STATE_SIZE {
                        assert!(
                            (p[(i, j)] - p[(j, i)]).abs() < 1e-6,
                            "asymmetry at ({i},{j})"
                        );
                    }
                }
                // PSD up to numerical jitter: Cholesky must succeed
                let symmetrized = (p + p.transpose()) * 0.5
                    + SMatrix::<f64, STATE_SIZE, STATE_SIZE>::identity() * 1e-6;
                assert!(
                    nalgebra::Cholesky::new(symmetrized).is_some(),
                    "covariance lost positive semi-definiteness at cycle {cycle}"
                );
            }
        }
    }

    #[test]
    fn reset_returns_to_initializing() {
        let mut rng = StdRng::seed_from_u64(3);
        let samples = flat_device_samples(60, &mut rng);
        let mut ekf = fresh_filter();
        ekf.initialize(&samples).unwrap();
        assert!(ekf.is_initialized());

        ekf.reset();
        assert!(!ekf.is_initialized());
        assert_eq!(ekf.state().tracking_state, TrackingState::Initializing);
    }
}
