// NOTE This kind of import-all file isn't a common Rust idiom.

pub use crate::{
  camera::*,
  estimator::*,
  factor_graph::*,
  imu_buffer::*,
  init::*,
  math::*,
  optimize::*,
  parameters::*,
  preintegration::*,
  types::*,
};

pub use {
  std::sync::Mutex,
  log::{debug, error, info, warn, LevelFilter},
  anyhow::{anyhow, bail, Context as AnyhowContext, Result},
};
