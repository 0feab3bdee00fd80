//! Adaptive query pacing

mod controller;

pub use controller::{RateConfig, RateController};
