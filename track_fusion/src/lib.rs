//! Trajectory resampling and spatiotemporal fusion for animal-tracking fixes.
//!
//! Irregular geodetic fixes are projected to Web Mercator, resampled onto a
//! fixed time grid per entity, joined against a gridded environmental table by
//! rounded (lat, lon, year) keys, and shifted into next-position training rows.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod environment;
pub mod io;
pub mod pipeline;
pub mod projection;
pub mod resample;
pub mod training;

pub use environment::{
    merge_environment, round_to, EnvReading, EnvironmentalGridIndex, EnvironmentalRecord,
    GridKey, VariableRecord,
};
pub use pipeline::{
    load_entities, load_environment, resample_entities, run_batch, Batch, BatchReport,
    EntityInput, EntityOutcome, EntitySource, EnvironmentSource, ProcessedEntity, SkippedEntity,
};
pub use projection::WebMercator;
pub use resample::{resample_track, ProjectedFix, RawFix, ResampledPoint, Trajectory};
pub use training::{
    build_training_examples, chronological_split, label_points, JoinCoverage, TrainingExample,
};

#[derive(Error, Debug)]
pub enum TrackError {
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),
    #[error("invalid fix at row {row}: {reason}")]
    InvalidFix { row: usize, reason: String },
    #[error("insufficient samples: {0} distinct timestamp(s), need at least 2")]
    InsufficientSamples(usize),
    #[error("no entity produced a resampled trajectory")]
    EmptyBatch,
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl TrackError {
    /// Short stable label used in reports and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            TrackError::SourceUnavailable(_) => "source_unavailable",
            TrackError::InvalidFix { .. } => "invalid_fix",
            TrackError::InsufficientSamples(_) => "insufficient_samples",
            TrackError::EmptyBatch => "empty_batch",
            TrackError::InvalidParameter(_) => "invalid_parameter",
            TrackError::Io(_) => "io",
            TrackError::Csv(_) => "csv",
            TrackError::Json(_) => "json",
        }
    }
}

/// Six hours, the default resample step.
pub const DEFAULT_STEP_S: f64 = 6.0 * 3600.0;
pub const DEFAULT_JOIN_DECIMALS: u32 = 2;
/// Smallest accepted resample step.
pub const MIN_STEP_S: f64 = 1.0;
const MAX_JOIN_DECIMALS: u32 = 10;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Params {
    pub step_s: f64,
    pub join_decimals: u32,
    pub depth_min: i64,
    pub depth_max: i64,
    pub test_fraction: f64,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            step_s: DEFAULT_STEP_S,
            join_decimals: DEFAULT_JOIN_DECIMALS,
            depth_min: 0,
            depth_max: 3,
            test_fraction: 0.0,
        }
    }
}

impl Params {
    pub fn validate(&self) -> Result<(), TrackError> {
        if !self.step_s.is_finite() || self.step_s < MIN_STEP_S {
            return Err(TrackError::InvalidParameter(format!(
                "step must be at least {} s, got {}",
                MIN_STEP_S, self.step_s
            )));
        }
        if self.join_decimals > MAX_JOIN_DECIMALS {
            return Err(TrackError::InvalidParameter(format!(
                "join precision {} exceeds {} decimals",
                self.join_decimals, MAX_JOIN_DECIMALS
            )));
        }
        if self.depth_min > self.depth_max {
            return Err(TrackError::InvalidParameter(format!(
                "depth clamp [{}, {}] is inverted",
                self.depth_min, self.depth_max
            )));
        }
        if !(0.0..1.0).contains(&self.test_fraction) {
            return Err(TrackError::InvalidParameter(format!(
                "test fraction must lie in [0, 1), got {}",
                self.test_fraction
            )));
        }
        Ok(())
    }

    /// Load parameters from a JSON file; absent fields keep their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self, TrackError> {
        let text = fs::read_to_string(path).map_err(|e| {
            TrackError::InvalidParameter(format!("cannot read {}: {}", path.display(), e))
        })?;
        let params: Params = serde_json::from_str(&text).map_err(|e| {
            TrackError::InvalidParameter(format!("{} is not valid params JSON: {}", path.display(), e))
        })?;
        params.validate()?;
        Ok(params)
    }
}
