use crate::all::*;

use std::collections::BTreeMap;

// Error-state dimension per keyframe: rotation, position, velocity and the
// two bias blocks.
pub const STATE_DIM: usize = 15;

const CONVERGENCE_DELTA: f64 = 1e-10;
const NUMERIC_DIFF_EPS: f64 = 1e-6;
const COVARIANCE_JITTER: f64 = 1e-12;
const DAMPING: f64 = 1e-12;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SolveStatus {
  Converged,
  // Recoverable: the caller keeps the previous estimate.
  NotConverged,
}

#[derive(Clone, Copy, Debug)]
pub struct SolveReport {
  pub status: SolveStatus,
  pub iterations: usize,
  pub final_cost: f64,
}

pub struct EvalContext<'a> {
  pub camera: &'a StereoCamera,
  pub gravity: Vector3d,
  pub parameters: &'a ParameterSet,
}

// Applies a 15-dof error-state update: right-multiplied rotation increment,
// additive everything else.
pub fn retract(state: &KeyframeState, delta: &[f64]) -> KeyframeState {
  assert_eq!(delta.len(), STATE_DIM);
  let d = |i: usize| Vector3d::new(delta[i], delta[i + 1], delta[i + 2]);
  KeyframeState {
    index: state.index,
    time: state.time,
    pose: RigidPose::new(
      state.pose.rotation * so3_exp(&d(0)),
      state.pose.translation + d(3),
    ),
    velocity: state.velocity + d(6),
    bias: SensorBias::new(state.bias.accel + d(9), state.bias.gyro + d(12)),
  }
}

// One bounded Gauss-Newton pass over the active graph. Residuals and
// Jacobians are whitened per factor; Jacobians come from central differences
// on the retraction. Non-convergence is reported, never panicked on; the
// caller decides whether to keep the updated states.
pub fn optimize(
  graph: &FactorGraph,
  states: &mut BTreeMap<usize, KeyframeState>,
  context: &EvalContext,
) -> SolveReport {
  let order: Vec<usize> = states.keys().copied().collect();
  let offsets: BTreeMap<usize, usize> = order.iter()
    .enumerate()
    .map(|(slot, &index)| (index, slot * STATE_DIM))
    .collect();
  let dim = order.len() * STATE_DIM;

  let mut iterations = 0;
  let mut cost = 0.;
  for _ in 0..context.parameters.max_iterations {
    iterations += 1;
    let mut h = Matrixd::zeros(dim, dim);
    let mut g = Vectord::zeros(dim);
    cost = 0.;

    for factor in graph.factors() {
      let overlay = Overlay { states: &*states, replaced: None };
      let residual = match eval_factor(factor, &overlay, context) {
        Some(r) => r,
        // Degenerate by policy: contributes nothing, stays in the graph.
        None => continue,
      };
      cost += 0.5 * residual.norm_squared();

      let variables = factor.variables();
      let mut jacobians = Vec::with_capacity(variables.len());
      let mut degenerate = false;
      for &variable in &variables {
        match numeric_jacobian(factor, states, context, variable, residual.len()) {
          Some(j) => jacobians.push(j),
          None => { degenerate = true; break },
        }
      }
      if degenerate { continue }

      for (vi, ji) in variables.iter().zip(&jacobians) {
        let oi = offsets[vi];
        let gi = -ji.transpose() * &residual;
        for k in 0..STATE_DIM {
          g[oi + k] += gi[k];
        }
        for (vj, jj) in variables.iter().zip(&jacobians) {
          let oj = offsets[vj];
          let block = ji.transpose() * jj;
          for r in 0..STATE_DIM {
            for c in 0..STATE_DIM {
              h[(oi + r, oj + c)] += block[(r, c)];
            }
          }
        }
      }
    }

    for k in 0..dim {
      h[(k, k)] += DAMPING;
    }
    let delta = match nalgebra::linalg::Cholesky::new(h) {
      Some(cholesky) => cholesky.solve(&g),
      None => {
        warn!("Normal equations not positive definite; keeping previous estimate.");
        return SolveReport { status: SolveStatus::NotConverged, iterations, final_cost: cost };
      },
    };

    for (slot, &index) in order.iter().enumerate() {
      let offset = slot * STATE_DIM;
      let state = states[&index];
      states.insert(index, retract(&state, &delta.as_slice()[offset..offset + STATE_DIM]));
    }

    if delta.norm() < CONVERGENCE_DELTA {
      return SolveReport { status: SolveStatus::Converged, iterations, final_cost: cost };
    }
  }
  SolveReport { status: SolveStatus::NotConverged, iterations, final_cost: cost }
}

struct Overlay<'a> {
  states: &'a BTreeMap<usize, KeyframeState>,
  replaced: Option<KeyframeState>,
}

impl<'a> Overlay<'a> {
  fn get(&self, index: usize) -> KeyframeState {
    match &self.replaced {
      Some(state) if state.index == index => *state,
      _ => self.states[&index],
    }
  }
}

fn numeric_jacobian(
  factor: &Factor,
  states: &BTreeMap<usize, KeyframeState>,
  context: &EvalContext,
  variable: usize,
  residual_dim: usize,
) -> Option<Matrixd> {
  let base = states[&variable];
  let mut jacobian = Matrixd::zeros(residual_dim, STATE_DIM);
  let mut delta = [0.; STATE_DIM];
  for k in 0..STATE_DIM {
    delta[k] = NUMERIC_DIFF_EPS;
    let plus = eval_factor(factor, &Overlay { states, replaced: Some(retract(&base, &delta)) }, context)?;
    delta[k] = -NUMERIC_DIFF_EPS;
    let minus = eval_factor(factor, &Overlay { states, replaced: Some(retract(&base, &delta)) }, context)?;
    delta[k] = 0.;
    let column = (plus - minus) / (2. * NUMERIC_DIFF_EPS);
    jacobian.column_mut(k).copy_from(&column);
  }
  Some(jacobian)
}

// Whitened residual of one factor, or `None` when the factor is degenerate
// under the current estimates (landmark behind a camera, triangulation
// failure, point beyond the distance threshold).
fn eval_factor(factor: &Factor, overlay: &Overlay, context: &EvalContext) -> Option<Vectord> {
  match factor {
    Factor::PriorPose { index, pose, sigma } => {
      let state = overlay.get(*index);
      let rot = so3_log(&(pose.rotation.inverse() * state.pose.rotation));
      let pos = state.pose.translation - pose.translation;
      let mut r = Vectord::zeros(6);
      for k in 0..3 {
        r[k] = rot[k] / sigma;
        r[3 + k] = pos[k] / sigma;
      }
      Some(r)
    },
    Factor::PriorVelocity { index, velocity, sigma } => {
      let state = overlay.get(*index);
      let diff = (state.velocity - velocity) / *sigma;
      Some(Vectord::from_column_slice(diff.as_slice()))
    },
    Factor::PriorBias { index, bias, sigma } => {
      let state = overlay.get(*index);
      let accel = (state.bias.accel - bias.accel) / *sigma;
      let gyro = (state.bias.gyro - bias.gyro) / *sigma;
      let mut r = Vectord::zeros(6);
      for k in 0..3 {
        r[k] = accel[k];
        r[3 + k] = gyro[k];
      }
      Some(r)
    },
    Factor::Motion { i, j, summary } => {
      let si = overlay.get(*i);
      let sj = overlay.get(*j);
      Some(motion_residual(summary, &si, &sj, &context.gravity))
    },
    Factor::BiasWalk { i, j, accel_sigma, gyro_sigma } => {
      let bi = overlay.get(*i).bias;
      let bj = overlay.get(*j).bias;
      let mut r = Vectord::zeros(6);
      for k in 0..3 {
        r[k] = (bj.accel[k] - bi.accel[k]) / accel_sigma;
        r[3 + k] = (bj.gyro[k] - bi.gyro[k]) / gyro_sigma;
      }
      Some(r)
    },
    Factor::SmartStereo { observations, .. } => {
      smart_residual(observations, overlay, context)
    },
  }
}

// Preintegrated motion residual in the on-manifold form, with first-order
// bias correction against the linearization point.
fn motion_residual(
  summary: &PreintegratedSummary,
  si: &KeyframeState,
  sj: &KeyframeState,
  gravity: &Vector3d,
) -> Vectord {
  let (delta_rotation, delta_velocity, delta_position) = summary.corrected_deltas(&si.bias);
  let dt = summary.delta_time;
  let ri_inv = si.pose.rotation.inverse();

  let r_rot = so3_log(&(delta_rotation.inverse() * (ri_inv * sj.pose.rotation)));
  let r_vel = ri_inv * (sj.velocity - si.velocity - gravity * dt) - delta_velocity;
  let r_pos = ri_inv
    * (sj.pose.translation - si.pose.translation - si.velocity * dt - 0.5 * gravity * dt * dt)
    - delta_position;

  let mut r = nalgebra::SVector::<f64, 9>::zeros();
  for k in 0..3 {
    r[k] = r_rot[k];
    r[3 + k] = r_vel[k];
    r[6 + k] = r_pos[k];
  }

  // Whiten with the inverse Cholesky factor of the accumulated covariance.
  let mut covariance = summary.covariance;
  for k in 0..9 {
    covariance[(k, k)] += COVARIANCE_JITTER;
  }
  let whitened = nalgebra::linalg::Cholesky::new(covariance)
    .map(|c| c.l().solve_lower_triangular(&r).unwrap_or(r))
    .unwrap_or(r);
  Vectord::from_column_slice(whitened.as_slice())
}

fn smart_residual(
  observations: &[(usize, StereoObservation)],
  overlay: &Overlay,
  context: &EvalContext,
) -> Option<Vectord> {
  let poses: Vec<(usize, RigidPose)> = observations.iter()
    .map(|(index, _)| (*index, overlay.get(*index).pose))
    .collect();
  let rays: Vec<(&RigidPose, StereoObservation)> = poses.iter()
    .zip(observations)
    .map(|((_, pose), (_, observation))| (pose, *observation))
    .collect();
  let point = context.camera.triangulate(&rays)?;

  // Range gate relative to the newest observing keyframe.
  let newest = poses.iter().max_by_key(|(index, _)| *index)?;
  let center = context.camera.camera_pose(&newest.1).translation;
  if (point - center).norm() > context.parameters.landmark_distance_threshold {
    return None;
  }

  let sigma = context.parameters.smart_noise_sigma;
  let mut r = Vectord::zeros(3 * observations.len());
  for (slot, (_, pose)) in poses.iter().enumerate() {
    let projected = context.camera.project(pose, &point)?;
    let observed = observations[slot].1;
    r[3 * slot] = (projected.left_x - observed.left_x) / sigma;
    r[3 * slot + 1] = (projected.right_x - observed.right_x) / sigma;
    r[3 * slot + 2] = (projected.y - observed.y) / sigma;
  }
  Some(r)
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::BTreeMap;

  fn window_of(states: Vec<KeyframeState>) -> BTreeMap<usize, KeyframeState> {
    states.into_iter().map(|s| (s.index, s)).collect()
  }

  fn keyframe(index: usize, translation: Vector3d) -> KeyframeState {
    KeyframeState {
      index,
      time: (index as Timestamp + 1) * 1_000_000_000,
      pose: RigidPose::new(Quaterniond::identity(), translation),
      velocity: Vector3d::zeros(),
      bias: SensorBias::zero(),
    }
  }

  #[test]
  fn test_prior_pulls_state_to_anchor() {
    let parameters = ParameterSet::default();
    let camera = StereoCamera::new(400., 400., 400., 300., 0.5);
    let context = EvalContext {
      camera: &camera,
      gravity: parameters.gravity(),
      parameters: &parameters,
    };

    // Start the state away from the prior; one pass should pull it back.
    let anchor = RigidPose::new(
      Quaterniond::from_scaled_axis(Vector3d::new(0., 0.1, 0.)),
      Vector3d::new(1., 2., 3.),
    );
    let mut states = window_of(vec![keyframe(0, Vector3d::new(1.3, 1.8, 3.4))]);
    let mut graph = FactorGraph::new();
    graph.add(Factor::PriorPose { index: 0, pose: anchor, sigma: 0.1 }, &states).unwrap();
    graph.add(Factor::PriorVelocity { index: 0, velocity: Vector3d::new(1., 0., 0.), sigma: 0.1 }, &states).unwrap();
    graph.add(Factor::PriorBias { index: 0, bias: SensorBias::zero(), sigma: 0.1 }, &states).unwrap();

    let report = optimize(&graph, &mut states, &context);
    assert_eq!(report.status, SolveStatus::Converged);
    let state = states[&0];
    assert!((state.pose.translation - anchor.translation).norm() < 1e-7);
    assert!(so3_log(&(anchor.rotation.inverse() * state.pose.rotation)).norm() < 1e-7);
    assert!((state.velocity - Vector3d::new(1., 0., 0.)).norm() < 1e-7);
  }

  #[test]
  fn test_retract_round_trip() {
    let state = keyframe(3, Vector3d::new(1., 2., 3.));
    let mut delta = [0.; STATE_DIM];
    delta[1] = 0.2;
    delta[4] = -0.5;
    delta[8] = 1.5;
    delta[13] = 0.01;
    let moved = retract(&state, &delta);
    assert!((so3_log(&moved.pose.rotation) - Vector3d::new(0., 0.2, 0.)).norm() < 1e-12);
    assert_eq!(moved.pose.translation[1], 1.5);
    assert_eq!(moved.velocity[2], 1.5);
    assert_eq!(moved.bias.gyro[1], 0.01);
    assert_eq!(moved.time, state.time);
  }

  #[test]
  fn test_bias_walk_residual_is_whitened_per_channel() {
    let parameters = ParameterSet::default();
    let camera = StereoCamera::new(400., 400., 400., 300., 0.5);
    let context = EvalContext {
      camera: &camera,
      gravity: parameters.gravity(),
      parameters: &parameters,
    };

    let mut a = keyframe(0, Vector3d::zeros());
    a.bias = SensorBias::zero();
    let mut b = keyframe(1, Vector3d::zeros());
    b.bias = SensorBias::new(Vector3d::new(2., 0., 0.), Vector3d::new(0., 4., 0.));
    let states = window_of(vec![a, b]);

    let factor = Factor::BiasWalk { i: 0, j: 1, accel_sigma: 2., gyro_sigma: 4. };
    let overlay = Overlay { states: &states, replaced: None };
    let r = eval_factor(&factor, &overlay, &context).unwrap();
    // Each channel is divided by its own sigma, not a shared one.
    assert_eq!(r.len(), 6);
    assert!((r[0] - 1.).abs() < 1e-12);
    assert!((r[4] - 1.).abs() < 1e-12);
    assert!(r.iter().enumerate().all(|(k, &x)| k == 0 || k == 4 || x == 0.));
  }

  #[test]
  fn test_zero_iterations_reports_not_converged() {
    let mut parameters = ParameterSet::default();
    parameters.max_iterations = 0;
    let camera = StereoCamera::new(400., 400., 400., 300., 0.5);
    let context = EvalContext {
      camera: &camera,
      gravity: parameters.gravity(),
      parameters: &parameters,
    };
    let mut states = window_of(vec![keyframe(0, Vector3d::zeros())]);
    let graph = FactorGraph::new();
    let report = optimize(&graph, &mut states, &context);
    assert_eq!(report.status, SolveStatus::NotConverged);
  }
}
