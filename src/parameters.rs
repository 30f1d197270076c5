use crate::all::*;

// Everything the back end recognizes as configuration. Defaults come from the
// clap attributes so the set can be flattened into a host command line or
// deserialized from a JSON config.
#[derive(Debug, Clone)]
#[derive(clap::Parser, serde::Deserialize)]
#[serde(default)]
pub struct ParameterSet {
  // Discard landmarks triangulated farther away than this, meters.
  #[clap(long, default_value = "30.")]
  pub landmark_distance_threshold: f64,

  // Extra integration uncertainty added per preintegration step.
  #[clap(long, default_value = "1e-4")]
  pub imu_integration_sigma: f64,

  // Keyframes older than this many seconds are marginalized.
  #[clap(long, default_value = "100.")]
  pub retention_horizon: f64,

  // World gravity vector, m/s^2.
  #[clap(long, number_of_values = 3, allow_hyphen_values = true,
    default_values = &["0.", "0.", "-9.81"])]
  pub world_gravity: Vec<f64>,

  // Inertial noise model, continuous-time densities and random walks.
  #[clap(long, default_value = "2e-3")]
  pub acc_noise_density: f64,
  #[clap(long, default_value = "1.7e-4")]
  pub gyro_noise_density: f64,
  #[clap(long, default_value = "3e-3")]
  pub acc_bias_sigma: f64,
  #[clap(long, default_value = "1.9e-5")]
  pub gyro_bias_sigma: f64,

  // Stereo reprojection noise, pixels.
  #[clap(long, default_value = "1.")]
  pub smart_noise_sigma: f64,

  // Priors installed on the first keyframe and on marginalization boundaries.
  #[clap(long, default_value = "0.1")]
  pub prior_pose_sigma: f64,
  #[clap(long, default_value = "0.1")]
  pub prior_velocity_sigma: f64,
  #[clap(long, default_value = "0.1")]
  pub prior_bias_sigma: f64,

  // Optimization pass per keyframe cycle.
  #[clap(long, default_value = "10")]
  pub max_iterations: usize,

  // Bias divergence beyond which a cached preintegration is stale.
  #[clap(long, default_value = "1e-3")]
  pub bias_update_tolerance: f64,
}

impl Default for ParameterSet {
  fn default() -> ParameterSet {
    // Reuse the clap defaults instead of duplicating them here.
    use clap::Parser;
    ParameterSet::parse_from(["parameters"])
  }
}

impl ParameterSet {
  pub fn from_json(text: &str) -> Result<ParameterSet> {
    serde_json::from_str(text)
      .context("ParameterSet JSON deserialization failed.")
  }

  pub fn gravity(&self) -> Vector3d {
    assert_eq!(self.world_gravity.len(), 3);
    Vector3d::new(self.world_gravity[0], self.world_gravity[1], self.world_gravity[2])
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_defaults() {
    let p = ParameterSet::default();
    assert_eq!(p.landmark_distance_threshold, 30.);
    assert_eq!(p.gravity(), Vector3d::new(0., 0., -9.81));
    assert_eq!(p.max_iterations, 10);
  }

  #[test]
  fn test_from_json() {
    let p = ParameterSet::from_json(
      r#"{ "retention_horizon": 2.5, "world_gravity": [0.0, -9.81, 0.0] }"#,
    ).unwrap();
    assert_eq!(p.retention_horizon, 2.5);
    assert_eq!(p.gravity(), Vector3d::new(0., -9.81, 0.));
    // Unlisted fields keep their defaults.
    assert_eq!(p.smart_noise_sigma, 1.);
  }

  #[test]
  fn test_bad_json_is_an_error() {
    assert!(ParameterSet::from_json("{ not json").is_err());
  }
}
