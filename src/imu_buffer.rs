use crate::all::*;

use std::collections::VecDeque;

// Outcome of a window query. The buffer never blocks waiting for data; the
// caller retries on `DataNotYetAvailable` and skips the keyframe on
// `DataNeverAvailable`.
#[derive(Clone, Debug)]
pub enum WindowQuery {
  DataAvailable(Vec<InertialSample>),
  DataNotYetAvailable,
  DataNeverAvailable,
}

// Thread-safe append-only store of timestamped inertial samples shared
// between the sensor producer and the keyframe consumer. A single mutex
// guards the log; that is the only synchronization point of the pipeline.
pub struct MeasurementBuffer {
  inner: Mutex<BufferInner>,
}

struct BufferInner {
  samples: VecDeque<InertialSample>,
  // `None` disables eviction, used in the initialization scenario.
  max_len: Option<usize>,
}

impl MeasurementBuffer {
  pub fn new(max_len: Option<usize>) -> MeasurementBuffer {
    if let Some(max_len) = max_len { assert!(max_len >= 2) }
    MeasurementBuffer {
      inner: Mutex::new(BufferInner {
        samples: VecDeque::new(),
        max_len,
      }),
    }
  }

  // Appends a sample. Timestamps must be strictly increasing and positive;
  // violations are an explicit error rather than silent corruption.
  pub fn add_measurement(&self, sample: InertialSample) -> Result<()> {
    let mut inner = self.inner.lock().unwrap();
    if sample.time <= 0 {
      bail!("Inertial timestamps must be positive, got {}.", sample.time);
    }
    if let Some(last) = inner.samples.back() {
      if sample.time <= last.time {
        bail!(
          "Out-of-order inertial sample: {} after {}.",
          sample.time, last.time,
        );
      }
    }
    inner.samples.push_back(sample);
    if let Some(max_len) = inner.max_len {
      while inner.samples.len() > max_len {
        inner.samples.pop_front();
      }
    }
    Ok(())
  }

  // Returns samples spanning exactly `[t0, t1]`. Boundary samples are exact
  // matches or synthetic samples linearly interpolated from the surrounding
  // pair.
  pub fn get_interpolated_window(&self, t0: Timestamp, t1: Timestamp) -> WindowQuery {
    assert!(t0 < t1, "Window bounds must satisfy t0 < t1.");
    let inner = self.inner.lock().unwrap();
    let samples = &inner.samples;
    let (oldest, newest) = match (samples.front(), samples.back()) {
      (Some(f), Some(b)) => (f.time, b.time),
      _ => return WindowQuery::DataNotYetAvailable,
    };
    // A lost window start is final even while the end is still pending, so
    // this check comes first.
    if t0 < oldest {
      return WindowQuery::DataNeverAvailable;
    }
    if t1 > newest {
      return WindowQuery::DataNotYetAvailable;
    }

    let mut window = vec![];
    for (i, sample) in samples.iter().enumerate() {
      if sample.time < t0 { continue }
      if window.is_empty() && sample.time > t0 {
        // i > 0 because t0 >= oldest and no exact match was found yet.
        window.push(interpolate(&samples[i - 1], sample, t0));
      }
      if sample.time > t1 {
        window.push(interpolate(&samples[i - 1], sample, t1));
        break;
      }
      window.push(*sample);
      if sample.time == t1 { break }
    }
    WindowQuery::DataAvailable(window)
  }

  pub fn oldest_timestamp(&self) -> Option<Timestamp> {
    self.inner.lock().unwrap().samples.front().map(|s| s.time)
  }

  pub fn newest_timestamp(&self) -> Option<Timestamp> {
    self.inner.lock().unwrap().samples.back().map(|s| s.time)
  }

  pub fn len(&self) -> usize {
    self.inner.lock().unwrap().samples.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn clear(&self) {
    self.inner.lock().unwrap().samples.clear();
  }
}

fn interpolate(a: &InertialSample, b: &InertialSample, t: Timestamp) -> InertialSample {
  assert!(a.time < t && t < b.time);
  let w = (t - a.time) as f64 / (b.time - a.time) as f64;
  InertialSample {
    time: t,
    accel: a.accel + (b.accel - a.accel) * w,
    gyro: a.gyro + (b.gyro - a.gyro) * w,
  }
}
