//! Batch orchestration: load, resample, enrich and label entities in parallel.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::environment::{merge_environment, EnvironmentalGridIndex};
use crate::io::{read_environment_file, read_track_file, read_variable_file, Variable};
use crate::resample::{resample_track, RawFix, Trajectory};
use crate::training::{label_points, JoinCoverage, TrainingExample};
use crate::{Params, TrackError};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntitySource {
    pub entity_id: String,
    pub path: PathBuf,
}

impl EntitySource {
    /// Name entities after their file stems, or `{prefix}_{n}` (1-based) when a prefix is given.
    /// Colliding stems get a numeric suffix so no two entities share an id.
    pub fn from_paths(paths: &[PathBuf], id_prefix: Option<&str>) -> Vec<EntitySource> {
        let mut seen: HashMap<String, usize> = HashMap::new();
        paths
            .iter()
            .enumerate()
            .map(|(idx, path)| {
                let base = match id_prefix {
                    Some(prefix) => format!("{}_{}", prefix, idx + 1),
                    None => path
                        .file_stem()
                        .map(|s| s.to_string_lossy().into_owned())
                        .unwrap_or_else(|| format!("entity_{}", idx + 1)),
                };
                let count = seen.entry(base.clone()).or_insert(0);
                *count += 1;
                let entity_id = if *count == 1 {
                    base
                } else {
                    format!("{}_{}", base, count)
                };
                EntitySource {
                    entity_id,
                    path: path.clone(),
                }
            })
            .collect()
    }
}

#[derive(Debug)]
pub struct EntityInput {
    pub entity_id: String,
    pub fixes: Result<Vec<RawFix>, TrackError>,
}

#[derive(Debug)]
pub struct EntityOutcome {
    pub entity_id: String,
    pub result: Result<Trajectory, TrackError>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ProcessedEntity {
    pub entity_id: String,
    pub year: i32,
    pub points: usize,
    pub examples: usize,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SkippedEntity {
    pub entity_id: String,
    pub kind: String,
    pub cause: String,
}

impl SkippedEntity {
    fn new(entity_id: &str, err: &TrackError) -> Self {
        Self {
            entity_id: entity_id.to_string(),
            kind: err.kind().to_string(),
            cause: err.to_string(),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct EnvironmentSummary {
    pub available: bool,
    pub keys: usize,
    pub duplicate_keys: usize,
}

impl EnvironmentSummary {
    pub fn of(index: &EnvironmentalGridIndex) -> Self {
        Self {
            available: index.is_available(),
            keys: index.len(),
            duplicate_keys: index.duplicate_keys(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct BatchReport {
    pub params: Params,
    pub processed: Vec<ProcessedEntity>,
    pub skipped: Vec<SkippedEntity>,
    pub environment: EnvironmentSummary,
    pub coverage: JoinCoverage,
}

impl BatchReport {
    pub fn write_json(&self, path: &Path) -> Result<(), TrackError> {
        let text = serde_json::to_string_pretty(self)?;
        fs::write(path, text)?;
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct Batch {
    pub trajectories: Vec<Trajectory>,
    pub examples: Vec<TrainingExample>,
    pub report: BatchReport,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EnvironmentSource {
    None,
    Combined(PathBuf),
    PerVariable {
        chlorophyll: PathBuf,
        temperature: PathBuf,
    },
}

/// Build the shared index, degrading to a total-miss index when the data cannot be loaded.
pub fn load_environment(source: &EnvironmentSource, decimals: u32) -> EnvironmentalGridIndex {
    match source {
        EnvironmentSource::None => {
            warn!("no environmental table given; temperature and chlorophyll will be missing");
            EnvironmentalGridIndex::unavailable(decimals)
        }
        EnvironmentSource::Combined(path) => match read_environment_file(path) {
            Ok(records) => EnvironmentalGridIndex::build(records, decimals),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "environmental table unavailable");
                EnvironmentalGridIndex::unavailable(decimals)
            }
        },
        EnvironmentSource::PerVariable {
            chlorophyll,
            temperature,
        } => {
            let chl = read_variable_file(chlorophyll, Variable::Chlorophyll);
            let temp = read_variable_file(temperature, Variable::Temperature);
            if chl.is_err() && temp.is_err() {
                warn!("neither environmental table could be read");
                return EnvironmentalGridIndex::unavailable(decimals);
            }
            let chl = chl.unwrap_or_else(|err| {
                warn!(path = %chlorophyll.display(), error = %err, "chlorophyll table unavailable");
                Vec::new()
            });
            let temp = temp.unwrap_or_else(|err| {
                warn!(path = %temperature.display(), error = %err, "temperature table unavailable");
                Vec::new()
            });
            EnvironmentalGridIndex::build(merge_environment(chl, temp), decimals)
        }
    }
}

/// Read every track table in parallel; read failures stay attached to their entity.
pub fn load_entities(sources: &[EntitySource]) -> Vec<EntityInput> {
    sources
        .par_iter()
        .map(|source| EntityInput {
            entity_id: source.entity_id.clone(),
            fixes: read_track_file(&source.path),
        })
        .collect()
}

pub fn resample_entities(inputs: Vec<EntityInput>, params: &Params) -> Vec<EntityOutcome> {
    inputs
        .into_par_iter()
        .map(|input| EntityOutcome {
            result: input
                .fixes
                .and_then(|fixes| resample_track(&input.entity_id, fixes, params)),
            entity_id: input.entity_id,
        })
        .collect()
}

/// Run every entity end to end and gather the survivors in input order.
///
/// Entity failures are reported and skipped; only a batch with no surviving
/// entity is an error.
pub fn run_batch(
    inputs: Vec<EntityInput>,
    index: &EnvironmentalGridIndex,
    params: &Params,
) -> Result<Batch, TrackError> {
    params.validate()?;
    if index.decimals() != params.join_decimals {
        return Err(TrackError::InvalidParameter(format!(
            "environmental index keyed at {} decimals but join precision is {}",
            index.decimals(),
            params.join_decimals
        )));
    }
    let outcomes: Vec<(String, Result<(Trajectory, Vec<TrainingExample>), TrackError>)> = inputs
        .into_par_iter()
        .map(|input| {
            let result = input
                .fixes
                .and_then(|fixes| resample_track(&input.entity_id, fixes, params))
                .map(|trajectory| {
                    let examples = label_points(&trajectory.points, index);
                    (trajectory, examples)
                });
            (input.entity_id, result)
        })
        .collect();

    let mut trajectories = Vec::new();
    let mut examples = Vec::new();
    let mut processed = Vec::new();
    let mut skipped = Vec::new();
    for (entity_id, result) in outcomes {
        match result {
            Ok((trajectory, entity_examples)) => {
                processed.push(ProcessedEntity {
                    entity_id,
                    year: trajectory.year,
                    points: trajectory.len(),
                    examples: entity_examples.len(),
                });
                trajectories.push(trajectory);
                examples.extend(entity_examples);
            }
            Err(err) => {
                warn!(entity = %entity_id, error = %err, "skipping entity");
                skipped.push(SkippedEntity::new(&entity_id, &err));
            }
        }
    }

    if trajectories.is_empty() {
        return Err(TrackError::EmptyBatch);
    }

    let coverage = JoinCoverage::from_examples(&examples);
    info!(
        entities = processed.len(),
        skipped = skipped.len(),
        points = trajectories.iter().map(Trajectory::len).sum::<usize>(),
        examples = examples.len(),
        temperature_missing = coverage.temperature_missing,
        chlorophyll_missing = coverage.chlorophyll_missing,
        "batch complete"
    );

    Ok(Batch {
        trajectories,
        examples,
        report: BatchReport {
            params: params.clone(),
            processed,
            skipped,
            environment: EnvironmentSummary::of(index),
            coverage,
        },
    })
}
