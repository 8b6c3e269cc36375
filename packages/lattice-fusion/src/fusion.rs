//! # fusion
//!
//! Confidence-weighted pose source selection over SLAM, VIO, and VPS streams.
//!
//! Gating rules:
//! - SLAM accepted at confidence ≥ 0.7 and wins whenever active (more
//!   accurate when available).
//! - VIO accepted at confidence ≥ 0.5, used only while SLAM is inactive.
//! - VPS fixes are absolute corrections and overwrite the current pose
//!   whenever they clear their own threshold.
//!
//! The engine keeps a bounded sample ring for short-horizon prediction:
//! linear position extrapolation from the last two samples, rotation held,
//! confidence attenuated.

use std::collections::VecDeque;

use tracing::{debug, warn};

use lattice_types::{Pose, PoseSample, PoseSource, Vec3};

// ── Configuration ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct FusionConfig {
    /// Minimum SLAM confidence to accept a sample
    pub min_slam_confidence: f64,
    /// Minimum VIO confidence to accept a sample
    pub min_vio_confidence: f64,
    /// Minimum VPS confidence for an absolute correction
    pub min_vps_confidence: f64,
    /// Ring size for prediction history
    pub max_history: usize,
    /// Seconds after which the fused pose is considered stale
    pub stale_after: f64,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            min_slam_confidence: 0.7,
            min_vio_confidence: 0.5,
            min_vps_confidence: 0.6,
            max_history: 30,
            stale_after: 1.0,
        }
    }
}

// ── Fusion Engine ─────────────────────────────────────────────────────────────

pub struct PoseFusion {
    config: FusionConfig,
    history: VecDeque<PoseSample>,
    current: Option<PoseSample>,
    slam_active: bool,
    vio_active: bool,
}

impl PoseFusion {
    pub fn new(config: FusionConfig) -> Self {
        let max_history = config.max_history;
        Self {
            config,
            history: VecDeque::with_capacity(max_history),
            current: None,
            slam_active: false,
            vio_active: false,
        }
    }

    pub fn slam_active(&self) -> bool {
        self.slam_active
    }

    pub fn vio_active(&self) -> bool {
        self.vio_active
    }

    // ── Source inputs ─────────────────────────────────────────────────────────

    /// Feed a SLAM pose. Accepted at confidence ≥ `min_slam_confidence`;
    /// an accepted SLAM sample always becomes the current pose.
    pub fn update_slam(&mut self, pose: Pose) -> bool {
        if pose.confidence >= self.config.min_slam_confidence {
            self.slam_active = true;
            self.accept(sample_from(pose, PoseSource::Slam, None, None));
            true
        } else {
            self.slam_active = false;
            false
        }
    }

    /// Feed a VIO pose with optional velocities. Accepted at confidence ≥
    /// `min_vio_confidence`; only becomes the current pose while SLAM is
    /// inactive.
    pub fn update_vio(
        &mut self,
        pose: Pose,
        velocity: Option<Vec3>,
        angular_velocity: Option<Vec3>,
    ) -> bool {
        if pose.confidence >= self.config.min_vio_confidence {
            self.vio_active = true;
            if !self.slam_active {
                self.accept(sample_from(pose, PoseSource::Vio, velocity, angular_velocity));
            }
            true
        } else {
            self.vio_active = false;
            false
        }
    }

    /// Feed a VPS fix. An absolute correction: overwrites the current pose
    /// whenever its confidence clears `min_vps_confidence`, regardless of
    /// which relative source is active.
    pub fn update_vps(&mut self, pose: Pose) -> bool {
        if pose.confidence >= self.config.min_vps_confidence {
            debug!("VPS correction accepted (confidence {:.2})", pose.confidence);
            self.accept(sample_from(pose, PoseSource::Vps, None, None));
            true
        } else {
            false
        }
    }

    // ── Outputs ───────────────────────────────────────────────────────────────

    /// Best available pose, invalidated once older than `stale_after`.
    pub fn current_pose(&self, now: f64) -> Option<PoseSample> {
        let current = self.current.as_ref()?;
        if now - current.timestamp > self.config.stale_after {
            warn!("fused pose is stale ({:.2}s old)", now - current.timestamp);
            return None;
        }
        Some(*current)
    }

    /// Blended tracking quality in [0, 1]: last confidence × linear age decay
    /// over 2 s × 1.2 boost when both SLAM and VIO contribute.
    pub fn quality(&self, now: f64) -> f64 {
        let Some(current) = self.current.as_ref() else {
            return 0.0;
        };
        let age = (now - current.timestamp).max(0.0);
        let age_factor = (1.0 - age / 2.0).max(0.0);
        let boost = if self.slam_active && self.vio_active { 1.2 } else { 1.0 };
        (current.confidence * age_factor * boost).min(1.0)
    }

    /// Extrapolate the pose to a future timestamp from the velocity implied
    /// by the last two samples. Rotation is held constant; confidence is
    /// attenuated by 0.8 and the sample is flagged as a prediction.
    pub fn predict(&self, future_timestamp: f64) -> Option<PoseSample> {
        if self.history.len() < 2 {
            return self.current;
        }

        let prev = self.history[self.history.len() - 2];
        let last = self.history[self.history.len() - 1];
        let dt = last.timestamp - prev.timestamp;
        if dt <= 0.0 {
            return self.current;
        }

        let velocity = Vec3::new(
            (last.position.x - prev.position.x) / dt,
            (last.position.y - prev.position.y) / dt,
            (last.position.z - prev.position.z) / dt,
        );
        let horizon = future_timestamp - last.timestamp;

        Some(PoseSample {
            position: Vec3::new(
                last.position.x + velocity.x * horizon,
                last.position.y + velocity.y * horizon,
                last.position.z + velocity.z * horizon,
            ),
            rotation: last.rotation,
            timestamp: future_timestamp,
            confidence: (last.confidence * 0.8).max(0.1),
            tracking_state: last.tracking_state,
            source: PoseSource::Predicted,
            velocity: Some(velocity),
            angular_velocity: last.angular_velocity,
            is_prediction: true,
        })
    }

    /// Recent samples within a time window, oldest first.
    pub fn recent_history(&self, now: f64, max_age: f64) -> Vec<PoseSample> {
        let cutoff = now - max_age;
        self.history.iter().filter(|s| s.timestamp >= cutoff).copied().collect()
    }

    pub fn reset(&mut self) {
        self.current = None;
        self.history.clear();
        self.slam_active = false;
        self.vio_active = false;
        debug!("pose fusion reset");
    }

    // ── Internal ──────────────────────────────────────────────────────────────

    fn accept(&mut self, sample: PoseSample) {
        if self.history.len() >= self.config.max_history {
            self.history.pop_front();
        }
        self.history.push_back(sample);
        self.current = Some(sample);
    }
}

fn sample_from(
    pose: Pose,
    source: PoseSource,
    velocity: Option<Vec3>,
    angular_velocity: Option<Vec3>,
) -> PoseSample {
    PoseSample {
        position: pose.position,
        rotation: pose.rotation,
        timestamp: pose.timestamp,
        confidence: pose.confidence,
        tracking_state: pose.tracking_state,
        source,
        velocity,
        angular_velocity,
        is_prediction: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lattice_types::{Quat, TrackingState};

    fn pose(ts: f64, x: f64, confidence: f64) -> Pose {
        Pose {
            position: Vec3::new(x, 0.0, 0.0),
            rotation: Quat::IDENTITY,
            timestamp: ts,
            confidence,
            tracking_state: TrackingState::Tracking,
        }
    }

    #[test]
    fn slam_below_threshold_is_rejected() {
        let mut fusion = PoseFusion::new(FusionConfig::default());
        assert!(!fusion.update_slam(pose(1.0, 0.0, 0.6)));
        assert!(!fusion.slam_active());
        assert!(fusion.current_pose(1.0).is_none());
    }

    #[test]
    fn slam_wins_over_vio() {
        let mut fusion = PoseFusion::new(FusionConfig::default());
        assert!(fusion.update_slam(pose(1.0, 1.0, 0.9)));
        // VIO is accepted (vio_active) but must not displace the SLAM pose
        assert!(fusion.update_vio(pose(1.1, 99.0, 0.8), None, None));
        let current = fusion.current_pose(1.2).unwrap();
        assert_eq!(current.source, PoseSource::Slam);
        assert!((current.position.x - 1.0).abs() < 1e-12);
    }

    #[test]
    fn vio_takes_over_when_slam_drops() {
        let mut fusion = PoseFusion::new(FusionConfig::default());
        assert!(fusion.update_slam(pose(1.0, 1.0, 0.9)));
        // A low-confidence SLAM sample deactivates the source
        assert!(!fusion.update_slam(pose(1.1, 1.0, 0.2)));
        assert!(fusion.update_vio(pose(1.2, 5.0, 0.6), None, None));
        let current = fusion.current_pose(1.3).unwrap();
        assert_eq!(current.source, PoseSource::Vio);
    }

    #[test]
    fn vio_below_threshold_is_rejected() {
        let mut fusion = PoseFusion::new(FusionConfig::default());
        assert!(!fusion.update_vio(pose(1.0, 0.0, 0.4), None, None));
        assert!(!fusion.vio_active());
    }

    #[test]
    fn vps_overrides_even_while_slam_active() {
        let mut fusion = PoseFusion::new(FusionConfig::default());
        fusion.update_slam(pose(1.0, 1.0, 0.9));
        assert!(fusion.update_vps(pose(1.1, 50.0, 0.95)));
        let current = fusion.current_pose(1.2).unwrap();
        assert_eq!(current.source, PoseSource::Vps);
        assert!((current.position.x - 50.0).abs() < 1e-12);
    }

    #[test]
    fn current_pose_goes_stale_after_one_second() {
        let mut fusion = PoseFusion::new(FusionConfig::default());
        fusion.update_slam(pose(1.0, 0.0, 0.9));
        assert!(fusion.current_pose(1.9).is_some());
        assert!(fusion.current_pose(2.1).is_none());
    }

    #[test]
    fn quality_decays_linearly_and_boosts_dual_source() {
        let mut fusion = PoseFusion::new(FusionConfig::default());
        fusion.update_slam(pose(1.0, 0.0, 0.8));
        // Age 1 s → factor 0.5, single source
        assert!((fusion.quality(2.0) - 0.4).abs() < 1e-9);

        fusion.update_vio(pose(1.0, 0.0, 0.6), None, None);
        // Both sources active → ×1.2 boost
        assert!((fusion.quality(2.0) - 0.48).abs() < 1e-9);
    }

    #[test]
    fn quality_is_capped_at_one() {
        let mut fusion = PoseFusion::new(FusionConfig::default());
        fusion.update_slam(pose(1.0, 0.0, 1.0));
        fusion.update_vio(pose(1.0, 0.0, 1.0), None, None);
        assert!((fusion.quality(1.0) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn prediction_extrapolates_linearly() {
        let mut fusion = PoseFusion::new(FusionConfig::default());
        fusion.update_slam(pose(0.0, 0.0, 0.9));
        fusion.update_slam(pose(1.0, 1.0, 0.9));

        let predicted = fusion.predict(2.0).unwrap();
        assert!(predicted.is_prediction);
        assert_eq!(predicted.source, PoseSource::Predicted);
        assert!((predicted.position.x - 2.0).abs() < 1e-9);
        assert_eq!(predicted.rotation, Quat::IDENTITY);
        assert!((predicted.confidence - 0.72).abs() < 1e-9);
    }

    #[test]
    fn prediction_with_single_sample_returns_current() {
        let mut fusion = PoseFusion::new(FusionConfig::default());
        fusion.update_slam(pose(1.0, 3.0, 0.9));
        let predicted = fusion.predict(5.0).unwrap();
        assert!(!predicted.is_prediction);
        assert!((predicted.position.x - 3.0).abs() < 1e-12);
    }

    #[test]
    fn history_ring_is_bounded() {
        let mut fusion = PoseFusion::new(FusionConfig::default());
        for i in 0..100 {
            fusion.update_slam(pose(i as f64 * 0.016, i as f64, 0.9));
        }
        let history = fusion.recent_history(100.0 * 0.016, 100.0);
        assert_eq!(history.len(), 30);
    }
}
