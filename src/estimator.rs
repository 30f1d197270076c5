use crate::all::*;

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;

pub type BiasUpdateCallback = Box<dyn FnMut(SensorBias)>;

// Result of one keyframe cycle. On `NotConverged` the states equal the
// previous optimized estimate (plus the propagated seed of the new keyframe).
#[derive(Clone, Copy, Debug)]
pub struct KeyframeOutput {
  pub index: usize,
  pub time: Timestamp,
  pub state: NavigationState,
  pub status: SolveStatus,
}

// Owns the per-keyframe state variables and the growing/shrinking factor
// graph. Construction performs the one-time transition out of the
// uninitialized state: it seeds keyframe 0 from an externally supplied guess
// and installs the three priors; nothing is optimized before that. Cycles are
// not reentrant and must observe strictly increasing timestamps.
pub struct SlidingWindowEstimator {
  parameters: ParameterSet,
  camera: StereoCamera,
  keyframes: BTreeMap<usize, KeyframeState>,
  graph: FactorGraph,
  // Per-landmark running tracks; a track reaches the graph at length two.
  tracks: HashMap<LandmarkId, Vec<(usize, StereoObservation)>>,
  next_index: usize,
  last_time: Timestamp,
  bias_callback: Option<BiasUpdateCallback>,
}

impl SlidingWindowEstimator {
  pub fn new(
    initial: NavigationState,
    start_time: Timestamp,
    camera: StereoCamera,
    parameters: ParameterSet,
  ) -> Result<SlidingWindowEstimator> {
    if start_time <= 0 {
      bail!("Start timestamp must be positive, got {}.", start_time);
    }
    let keyframe = KeyframeState {
      index: 0,
      time: start_time,
      pose: initial.pose,
      velocity: initial.velocity,
      bias: initial.bias,
    };
    let mut keyframes = BTreeMap::new();
    keyframes.insert(0, keyframe);

    let mut graph = FactorGraph::new();
    add_state_priors(&mut graph, &keyframes, 0, &initial, &parameters)?;

    info!("Estimator initialized at t={} with 3 priors.", start_time);
    Ok(SlidingWindowEstimator {
      parameters,
      camera,
      keyframes,
      graph,
      tracks: HashMap::new(),
      next_index: 1,
      last_time: start_time,
      bias_callback: None,
    })
  }

  // Injected feedback edge towards the preintegration engine. Invoked
  // synchronously at the end of every cycle with the newly optimized bias;
  // must not block.
  pub fn register_bias_update_callback(&mut self, callback: impl FnMut(SensorBias) + 'static) {
    self.bias_callback = Some(Box::new(callback));
  }

  pub fn process_keyframe(
    &mut self,
    time: Timestamp,
    observations: &[LandmarkObservation],
    tracking_status: TrackingStatusSummary,
    summary: &PreintegratedSummary,
  ) -> Result<KeyframeOutput> {
    // Precondition violations abort the cycle loudly; they indicate an
    // upstream synchronization bug, not a runtime condition to retry.
    if time <= self.last_time {
      bail!("Keyframe timestamps must increase: {} after {}.", time, self.last_time);
    }
    if summary.start_time != self.last_time || summary.end_time != time {
      bail!(
        "Preintegrated summary covers [{}, {}], expected [{}, {}].",
        summary.start_time, summary.end_time, self.last_time, time,
      );
    }
    for observation in observations {
      if !observation.is_finite() {
        bail!("Malformed observation for landmark {:?}.", observation.id);
      }
    }

    // New state variable, seeded by propagating the previous keyframe
    // through the preintegrated deltas.
    let index = self.next_index;
    let previous = self.keyframes[&(index - 1)].navigation_state();
    let seeded = summary.predict(&previous, &self.parameters.gravity());
    self.keyframes.insert(index, KeyframeState {
      index,
      time,
      pose: seeded.pose,
      velocity: seeded.velocity,
      bias: seeded.bias,
    });
    self.next_index += 1;
    self.last_time = time;

    // The motion constraint pair exists at every keyframe from index 1 on.
    self.graph.add(
      Factor::Motion { i: index - 1, j: index, summary: summary.clone() },
      &self.keyframes,
    )?;
    let (accel_sigma, gyro_sigma) = bias_walk_sigmas(&self.parameters, summary.delta_time);
    self.graph.add(
      Factor::BiasWalk { i: index - 1, j: index, accel_sigma, gyro_sigma },
      &self.keyframes,
    )?;

    self.ingest_observations(index, observations, tracking_status)?;

    // One incremental optimization pass. Non-convergence is recoverable: the
    // previous optimized estimate is restored, including the fresh seed.
    let snapshot = self.keyframes.clone();
    let context = EvalContext {
      camera: &self.camera,
      gravity: self.parameters.gravity(),
      parameters: &self.parameters,
    };
    let report = optimize(&self.graph, &mut self.keyframes, &context);
    if report.status == SolveStatus::NotConverged {
      warn!(
        "Optimization did not converge at keyframe {} (cost {:.3e}); keeping previous estimate.",
        index, report.final_cost,
      );
      self.keyframes = snapshot;
    }
    debug!(
      "Keyframe {}: {} factors, {} iterations, cost {:.3e}.",
      index, self.graph.len(), report.iterations, report.final_cost,
    );

    self.apply_retention_policy(time)?;

    let optimized = self.keyframes[&index];
    if let Some(callback) = &mut self.bias_callback {
      callback(optimized.bias);
    }

    Ok(KeyframeOutput {
      index,
      time,
      state: optimized.navigation_state(),
      status: report.status,
    })
  }

  // Mapping from keyframe index to its current optimized state.
  pub fn state(&self) -> &BTreeMap<usize, KeyframeState> {
    &self.keyframes
  }

  pub fn navigation_state(&self, index: usize) -> Option<NavigationState> {
    self.keyframes.get(&index).map(|k| k.navigation_state())
  }

  // Diagnostic view of the active graph.
  pub fn active_factors(&self) -> &[Factor] {
    self.graph.factors()
  }

  fn ingest_observations(
    &mut self,
    index: usize,
    observations: &[LandmarkObservation],
    tracking_status: TrackingStatusSummary,
  ) -> Result<()> {
    if tracking_status.stereo != TrackingStatus::Valid {
      // Degenerate visual input is excluded by policy, not an error.
      debug!("Stereo tracking {:?} at keyframe {}; skipping observations.", tracking_status.stereo, index);
      return Ok(());
    }
    for observation in observations {
      let track = self.tracks.entry(observation.id).or_default();
      track.push((index, observation.stereo()));
      // A single observation under-constrains the landmark and must not be
      // added as a degenerate factor.
      if track.len() >= 2 {
        self.graph.set_landmark_observations(observation.id, track.clone(), &self.keyframes)?;
      }
    }
    Ok(())
  }

  // Time-horizon retention: keyframes older than `time - horizon` leave the
  // window together with every factor referencing them. Instead of the exact
  // covariance-preserving fold-in, information crossing the boundary is
  // approximated by anchoring the oldest retained keyframe with priors at its
  // current estimate before the boundary factors are dropped.
  fn apply_retention_policy(&mut self, time: Timestamp) -> Result<()> {
    let horizon = (self.parameters.retention_horizon * NANOS_PER_SECOND) as Timestamp;
    let removed: BTreeSet<usize> = self.keyframes.iter()
      .filter(|(_, keyframe)| keyframe.time < time - horizon)
      .map(|(&index, _)| index)
      .collect();
    if removed.is_empty() {
      return Ok(());
    }
    assert!(!removed.contains(&(self.next_index - 1)));

    if self.graph.has_boundary_factors(&removed) {
      let boundary = *self.keyframes.keys()
        .find(|index| !removed.contains(index))
        .expect("window never empties: the current keyframe is always retained");
      let anchor = self.keyframes[&boundary].navigation_state();
      add_state_priors(&mut self.graph, &self.keyframes, boundary, &anchor, &self.parameters)?;
    }

    let stats = self.graph.remove_marginalized(&removed);
    for index in &removed {
      self.keyframes.remove(index);
    }
    for track in self.tracks.values_mut() {
      track.retain(|(index, _)| !removed.contains(index));
    }
    self.tracks.retain(|_, track| !track.is_empty());

    info!(
      "Marginalized {} keyframes ({} factors dropped, {} of them boundary).",
      removed.len(), stats.dropped_factors, stats.dropped_boundary_factors,
    );
    Ok(())
  }
}

fn add_state_priors(
  graph: &mut FactorGraph,
  window: &BTreeMap<usize, KeyframeState>,
  index: usize,
  state: &NavigationState,
  parameters: &ParameterSet,
) -> Result<()> {
  graph.add(Factor::PriorPose {
    index,
    pose: state.pose,
    sigma: parameters.prior_pose_sigma,
  }, window)?;
  graph.add(Factor::PriorVelocity {
    index,
    velocity: state.velocity,
    sigma: parameters.prior_velocity_sigma,
  }, window)?;
  graph.add(Factor::PriorBias {
    index,
    bias: state.bias,
    sigma: parameters.prior_bias_sigma,
  }, window)?;
  Ok(())
}

// Per-channel random-walk sigmas over one keyframe interval.
fn bias_walk_sigmas(parameters: &ParameterSet, delta_time: f64) -> (f64, f64) {
  let sqrt_dt = delta_time.max(1e-6).sqrt();
  (parameters.acc_bias_sigma * sqrt_dt, parameters.gyro_bias_sigma * sqrt_dt)
}
