use crate::all::*;

use std::collections::BTreeMap;
use std::collections::BTreeSet;

// Probabilistic constraints over the active window. Factors reference
// keyframe state variables by index, never by pointer, so existence checks
// and bulk removal are cheap and nothing can dangle.
#[derive(Clone, Debug)]
pub enum Factor {
  PriorPose {
    index: usize,
    pose: RigidPose,
    sigma: f64,
  },
  PriorVelocity {
    index: usize,
    velocity: Vector3d,
    sigma: f64,
  },
  PriorBias {
    index: usize,
    bias: SensorBias,
    sigma: f64,
  },
  // Preintegrated inertial constraint between consecutive keyframes.
  Motion {
    i: usize,
    j: usize,
    summary: PreintegratedSummary,
  },
  // Bias random walk between consecutive keyframes, whitened per channel.
  BiasWalk {
    i: usize,
    j: usize,
    accel_sigma: f64,
    gyro_sigma: f64,
  },
  // Implicit multi-view landmark constraint over every keyframe that has
  // observed the landmark. Instantiated only once the track has at least two
  // observations.
  SmartStereo {
    id: LandmarkId,
    observations: Vec<(usize, StereoObservation)>,
  },
}

impl Factor {
  // Indices of the keyframe variables this factor constrains.
  pub fn variables(&self) -> Vec<usize> {
    match self {
      Factor::PriorPose { index, .. }
      | Factor::PriorVelocity { index, .. }
      | Factor::PriorBias { index, .. } => vec![*index],
      Factor::Motion { i, j, .. } | Factor::BiasWalk { i, j, .. } => vec![*i, *j],
      Factor::SmartStereo { observations, .. } =>
        observations.iter().map(|(index, _)| *index).collect(),
    }
  }
}

#[derive(Default)]
pub struct FactorGraph {
  factors: Vec<Factor>,
}

// Bookkeeping from one marginalization pass.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct RemovalStats {
  pub dropped_factors: usize,
  // Factors that spanned the removed/retained boundary; their information is
  // lost unless the caller anchors the boundary with priors first.
  pub dropped_boundary_factors: usize,
  pub trimmed_landmark_factors: usize,
}

impl FactorGraph {
  pub fn new() -> FactorGraph {
    FactorGraph { factors: vec![] }
  }

  // Every referenced variable must exist in the active window.
  pub fn add(&mut self, factor: Factor, window: &BTreeMap<usize, KeyframeState>) -> Result<()> {
    for index in factor.variables() {
      if !window.contains_key(&index) {
        bail!("Factor references keyframe {} which is not in the window.", index);
      }
    }
    self.factors.push(factor);
    Ok(())
  }

  // Inserts or refreshes the single landmark factor for `id` with the full
  // track. Requires at least two observations; shorter tracks must not reach
  // the graph.
  pub fn set_landmark_observations(
    &mut self,
    id: LandmarkId,
    observations: Vec<(usize, StereoObservation)>,
    window: &BTreeMap<usize, KeyframeState>,
  ) -> Result<()> {
    assert!(observations.len() >= 2);
    for (index, _) in &observations {
      if !window.contains_key(index) {
        bail!("Landmark {:?} observed from keyframe {} which is not in the window.", id, index);
      }
    }
    for factor in &mut self.factors {
      if let Factor::SmartStereo { id: existing, observations: obs } = factor {
        if *existing == id {
          *obs = observations;
          return Ok(());
        }
      }
    }
    self.factors.push(Factor::SmartStereo { id, observations });
    Ok(())
  }

  // Removes every reference to the given keyframes in one pass: factors
  // touching only removed variables disappear, landmark factors are trimmed
  // to their surviving observations (and disappear below two).
  pub fn remove_marginalized(&mut self, removed: &BTreeSet<usize>) -> RemovalStats {
    let mut stats = RemovalStats::default();
    self.factors.retain_mut(|factor| {
      if let Factor::SmartStereo { observations, .. } = factor {
        let before = observations.len();
        observations.retain(|(index, _)| !removed.contains(index));
        if observations.len() < before {
          stats.trimmed_landmark_factors += 1;
        }
        if observations.len() < 2 {
          stats.dropped_factors += 1;
          return false;
        }
        return true;
      }
      let variables = factor.variables();
      let touches_removed = variables.iter().any(|v| removed.contains(v));
      if touches_removed {
        stats.dropped_factors += 1;
        if variables.iter().any(|v| !removed.contains(v)) {
          stats.dropped_boundary_factors += 1;
        }
        return false;
      }
      true
    });
    stats
  }

  // True when some factor spans the removed set and the rest of the window,
  // i.e. dropping would lose information about retained variables.
  pub fn has_boundary_factors(&self, removed: &BTreeSet<usize>) -> bool {
    self.factors.iter().any(|factor| {
      let variables = factor.variables();
      variables.iter().any(|v| removed.contains(v))
        && variables.iter().any(|v| !removed.contains(v))
    })
  }

  pub fn factors(&self) -> &[Factor] {
    &self.factors
  }

  pub fn len(&self) -> usize {
    self.factors.len()
  }

  pub fn is_empty(&self) -> bool {
    self.factors.is_empty()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn keyframe(index: usize) -> KeyframeState {
    KeyframeState {
      index,
      time: (index as Timestamp + 1) * 1_000_000_000,
      pose: RigidPose::identity(),
      velocity: Vector3d::zeros(),
      bias: SensorBias::zero(),
    }
  }

  fn window(indices: &[usize]) -> BTreeMap<usize, KeyframeState> {
    indices.iter().map(|&i| (i, keyframe(i))).collect()
  }

  fn observation() -> StereoObservation {
    StereoObservation { left_x: 100., right_x: 90., y: 50. }
  }

  #[test]
  fn test_add_checks_variable_existence() {
    let window = window(&[0, 1]);
    let mut graph = FactorGraph::new();
    graph.add(Factor::BiasWalk { i: 0, j: 1, accel_sigma: 1., gyro_sigma: 1. }, &window).unwrap();
    assert!(graph.add(Factor::BiasWalk { i: 1, j: 2, accel_sigma: 1., gyro_sigma: 1. }, &window).is_err());
    assert_eq!(graph.len(), 1);
  }

  #[test]
  fn test_landmark_factor_is_refreshed_not_duplicated() {
    let window = window(&[0, 1, 2]);
    let mut graph = FactorGraph::new();
    let id = LandmarkId(7);
    graph.set_landmark_observations(
      id, vec![(0, observation()), (1, observation())], &window).unwrap();
    graph.set_landmark_observations(
      id, vec![(0, observation()), (1, observation()), (2, observation())], &window).unwrap();
    assert_eq!(graph.len(), 1);
    match &graph.factors()[0] {
      Factor::SmartStereo { observations, .. } => assert_eq!(observations.len(), 3),
      other => panic!("unexpected factor {:?}", other),
    }
  }

  #[test]
  fn test_remove_marginalized() {
    let window = window(&[0, 1, 2]);
    let mut graph = FactorGraph::new();
    graph.add(Factor::PriorVelocity { index: 0, velocity: Vector3d::zeros(), sigma: 1. }, &window).unwrap();
    graph.add(Factor::BiasWalk { i: 0, j: 1, accel_sigma: 1., gyro_sigma: 1. }, &window).unwrap();
    graph.add(Factor::BiasWalk { i: 1, j: 2, accel_sigma: 1., gyro_sigma: 1. }, &window).unwrap();
    graph.set_landmark_observations(
      LandmarkId(1),
      vec![(0, observation()), (1, observation()), (2, observation())],
      &window,
    ).unwrap();
    graph.set_landmark_observations(
      LandmarkId(2), vec![(0, observation()), (1, observation())], &window).unwrap();

    let removed: BTreeSet<usize> = [0].into_iter().collect();
    assert!(graph.has_boundary_factors(&removed));
    let stats = graph.remove_marginalized(&removed);

    // Prior on 0 and walk 0-1 dropped; landmark 2 lost its second observation.
    assert_eq!(stats.dropped_factors, 3);
    assert_eq!(stats.dropped_boundary_factors, 1);
    assert_eq!(stats.trimmed_landmark_factors, 2);
    assert_eq!(graph.len(), 2);
    for factor in graph.factors() {
      assert!(factor.variables().iter().all(|v| !removed.contains(v)));
    }
  }
}
