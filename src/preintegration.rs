use crate::all::*;

// Compact relative-motion constraint between two time instants, produced by
// integrating a run of bias-corrected inertial samples. The deltas live in
// the body frame of the start instant and do not include gravity; gravity is
// applied at propagation time. Linearized against `bias`: when the current
// bias estimate diverges past tolerance the summary is stale and must be
// recomputed from the raw batch, not patched.
#[derive(Clone, Debug)]
pub struct PreintegratedSummary {
  pub start_time: Timestamp,
  pub end_time: Timestamp,
  pub delta_rotation: Quaterniond,
  pub delta_velocity: Vector3d,
  pub delta_position: Vector3d,
  // Seconds covered, equal to `seconds_between(start_time, end_time)`.
  pub delta_time: f64,
  // Uncertainty of (rotation, velocity, position), in that block order.
  pub covariance: Matrix9d,
  // The bias value the integration was linearized against.
  pub bias: SensorBias,
  // First-order sensitivities of the deltas to a bias change, used to correct
  // the deltas inside the motion factor without re-integration.
  pub d_rotation_d_gyro: Matrix3d,
  pub d_velocity_d_accel: Matrix3d,
  pub d_velocity_d_gyro: Matrix3d,
  pub d_position_d_accel: Matrix3d,
  pub d_position_d_gyro: Matrix3d,
}

impl PreintegratedSummary {
  // Propagates a navigation state through the deltas. Used both for seeding
  // new keyframes and inside the motion factor residual.
  pub fn predict(&self, prev: &NavigationState, gravity: &Vector3d) -> NavigationState {
    let dt = self.delta_time;
    let r = prev.pose.rotation;
    NavigationState {
      pose: RigidPose::new(
        r * self.delta_rotation,
        prev.pose.translation + prev.velocity * dt + 0.5 * gravity * dt * dt
          + r * self.delta_position,
      ),
      velocity: prev.velocity + gravity * dt + r * self.delta_velocity,
      bias: prev.bias,
    }
  }

  // Deltas corrected to first order for a bias differing from the
  // linearization point.
  pub fn corrected_deltas(&self, bias: &SensorBias) -> (Quaterniond, Vector3d, Vector3d) {
    let dba = bias.accel - self.bias.accel;
    let dbg = bias.gyro - self.bias.gyro;
    (
      self.delta_rotation * so3_exp(&(self.d_rotation_d_gyro * dbg)),
      self.delta_velocity + self.d_velocity_d_accel * dba + self.d_velocity_d_gyro * dbg,
      self.delta_position + self.d_position_d_accel * dba + self.d_position_d_gyro * dbg,
    )
  }

  pub fn is_stale(&self, bias: &SensorBias, tolerance: f64) -> bool {
    self.bias.distance(bias) > tolerance
  }
}

// Integrates raw sample batches served by the measurement buffer into
// `PreintegratedSummary` constraints. Retains the latest raw batch so the
// summary can be re-derived after a bias update; bias correction is nonlinear
// in orientation, so the stale summary is never incrementally patched.
pub struct PreintegrationEngine {
  gravity: Vector3d,
  acc_noise_density: f64,
  gyro_noise_density: f64,
  integration_sigma: f64,
  bias_tolerance: f64,
  // Current linearization point.
  bias: SensorBias,
  // Bias pushed by the estimator callback, adopted between cycles.
  pending_bias: SensorBias,
  cached_samples: Vec<InertialSample>,
}

impl PreintegrationEngine {
  pub fn new(parameters: &ParameterSet, initial_bias: SensorBias) -> PreintegrationEngine {
    PreintegrationEngine {
      gravity: parameters.gravity(),
      acc_noise_density: parameters.acc_noise_density,
      gyro_noise_density: parameters.gyro_noise_density,
      integration_sigma: parameters.imu_integration_sigma,
      bias_tolerance: parameters.bias_update_tolerance,
      bias: initial_bias,
      pending_bias: initial_bias,
      cached_samples: vec![],
    }
  }

  pub fn current_bias(&self) -> SensorBias {
    self.bias
  }

  pub fn gravity(&self) -> Vector3d {
    self.gravity
  }

  // Consumes an ordered batch bounded to the keyframe interval, as returned
  // by the measurement buffer, and caches it for later re-derivation.
  pub fn integrate(&mut self, samples: &[InertialSample]) -> Result<PreintegratedSummary> {
    if samples.len() < 2 {
      bail!("Preintegration needs at least two samples, got {}.", samples.len());
    }
    for pair in samples.windows(2) {
      if pair[1].time <= pair[0].time {
        bail!(
          "Preintegration batch is not time-ordered: {} after {}.",
          pair[1].time, pair[0].time,
        );
      }
    }
    self.cached_samples.clear();
    self.cached_samples.extend_from_slice(samples);
    Ok(integrate_batch(
      samples,
      &self.bias,
      self.acc_noise_density,
      self.gyro_noise_density,
      self.integration_sigma,
    ))
  }

  // Sole entry point for the estimator's bias feedback. Only records the
  // value; the linearization point changes in `reset_with_updated_bias` so an
  // integration in progress is never interrupted.
  pub fn update_bias(&mut self, bias: SensorBias) {
    self.pending_bias = bias;
  }

  // Adopts the pushed bias as the new linearization point when it has
  // diverged past tolerance, re-deriving the cached batch from raw samples.
  // Returns the refreshed summary when a re-derivation happened.
  pub fn reset_with_updated_bias(&mut self) -> Option<PreintegratedSummary> {
    if self.bias.distance(&self.pending_bias) <= self.bias_tolerance {
      return None;
    }
    debug!("Relinearizing preintegration around an updated bias.");
    self.bias = self.pending_bias;
    if self.cached_samples.len() < 2 {
      return None;
    }
    Some(integrate_batch(
      &self.cached_samples,
      &self.bias,
      self.acc_noise_density,
      self.gyro_noise_density,
      self.integration_sigma,
    ))
  }
}

fn integrate_batch(
  samples: &[InertialSample],
  bias: &SensorBias,
  acc_noise_density: f64,
  gyro_noise_density: f64,
  integration_sigma: f64,
) -> PreintegratedSummary {
  let mut delta_rotation = Quaterniond::identity();
  let mut delta_velocity = Vector3d::zeros();
  let mut delta_position = Vector3d::zeros();
  let mut covariance = Matrix9d::zeros();
  let mut d_rotation_d_gyro = Matrix3d::zeros();
  let mut d_velocity_d_accel = Matrix3d::zeros();
  let mut d_velocity_d_gyro = Matrix3d::zeros();
  let mut d_position_d_accel = Matrix3d::zeros();
  let mut d_position_d_gyro = Matrix3d::zeros();

  for pair in samples.windows(2) {
    let dt = seconds_between(pair[0].time, pair[1].time);
    // Trapezoidal: use the interval midpoint of both channels.
    let w = 0.5 * (pair[0].gyro + pair[1].gyro) - bias.gyro;
    let a = 0.5 * (pair[0].accel + pair[1].accel) - bias.accel;

    let r = delta_rotation.to_rotation_matrix().into_inner();
    let increment = w * dt;
    let dr = so3_exp(&increment);
    let dr_mat = dr.to_rotation_matrix().into_inner();
    let jr = so3_right_jacobian(&increment);
    let r_skew_a = r * skew(&a);

    // Covariance propagation for the (rotation, velocity, position) error
    // state, discrete form.
    let mut transition = Matrix9d::identity();
    transition.fixed_slice_mut::<3, 3>(0, 0).copy_from(&dr_mat.transpose());
    transition.fixed_slice_mut::<3, 3>(3, 0).copy_from(&(-r_skew_a * dt));
    transition.fixed_slice_mut::<3, 3>(6, 0).copy_from(&(-0.5 * r_skew_a * dt * dt));
    transition.fixed_slice_mut::<3, 3>(6, 3).copy_from(&(Matrix3d::identity() * dt));

    covariance = transition * covariance * transition.transpose();
    let gyro_var = gyro_noise_density * gyro_noise_density / dt;
    let acc_var = acc_noise_density * acc_noise_density / dt;
    let jr_dt = jr * dt;
    let r_dt = r * dt;
    let r_dt2 = 0.5 * r * dt * dt;
    add_block(&mut covariance, 0, &(gyro_var * jr_dt * jr_dt.transpose()));
    add_block(&mut covariance, 3, &(acc_var * r_dt * r_dt.transpose()));
    add_block(&mut covariance, 6, &(acc_var * r_dt2 * r_dt2.transpose()));
    let int_var = integration_sigma * integration_sigma * dt;
    add_block(&mut covariance, 6, &(Matrix3d::identity() * int_var));

    // Bias sensitivities accumulate before the deltas they refer to.
    d_position_d_accel += d_velocity_d_accel * dt - 0.5 * r * dt * dt;
    d_position_d_gyro += d_velocity_d_gyro * dt - 0.5 * r_skew_a * d_rotation_d_gyro * dt * dt;
    d_velocity_d_accel -= r * dt;
    d_velocity_d_gyro -= r_skew_a * d_rotation_d_gyro * dt;
    d_rotation_d_gyro = dr_mat.transpose() * d_rotation_d_gyro - jr * dt;

    delta_position += delta_velocity * dt + 0.5 * r * a * dt * dt;
    delta_velocity += r * a * dt;
    delta_rotation = delta_rotation * dr;
  }

  PreintegratedSummary {
    start_time: samples[0].time,
    end_time: samples[samples.len() - 1].time,
    delta_rotation,
    delta_velocity,
    delta_position,
    delta_time: seconds_between(samples[0].time, samples[samples.len() - 1].time),
    covariance,
    bias: *bias,
    d_rotation_d_gyro,
    d_velocity_d_accel,
    d_velocity_d_gyro,
    d_position_d_accel,
    d_position_d_gyro,
  }
}

fn add_block(covariance: &mut Matrix9d, offset: usize, block: &Matrix3d) {
  let mut slice = covariance.fixed_slice_mut::<3, 3>(offset, offset);
  slice += block;
}
