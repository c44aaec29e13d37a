//! Per-entity resampling of irregular fixes onto a fixed time grid.

use chrono::{DateTime, Datelike, TimeDelta, Utc};
use ndarray::{Array1, ArrayView1};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::projection::WebMercator;
use crate::{Params, TrackError};

/// One recorded observation as read from a track table.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RawFix {
    pub timestamp: DateTime<Utc>,
    pub lon: f64,
    pub lat: f64,
    /// Raw location-class code; integer-like for depth classes, letters otherwise.
    pub lc: String,
}

impl RawFix {
    pub fn new(timestamp: DateTime<Utc>, lon: f64, lat: f64, lc: impl Into<String>) -> Self {
        Self {
            timestamp,
            lon,
            lat,
            lc: lc.into(),
        }
    }

    pub fn depth(&self) -> Option<i64> {
        parse_depth_code(&self.lc)
    }
}

/// Integer-like codes parse, anything else (letters, blanks) is missing.
pub fn parse_depth_code(code: &str) -> Option<i64> {
    let trimmed = code.trim();
    if let Ok(value) = trimmed.parse::<i64>() {
        return Some(value);
    }
    match trimmed.parse::<f64>() {
        Ok(value) if value.is_finite() && value.fract() == 0.0 => Some(value as i64),
        _ => None,
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ProjectedFix {
    pub elapsed_s: f64,
    pub x: f64,
    pub y: f64,
    pub depth: Option<i64>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ResampledPoint {
    pub elapsed_s: f64,
    pub longitude: f64,
    pub latitude: f64,
    pub depth_class: i64,
    pub entity_id: String,
    pub year: i32,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Trajectory {
    pub entity_id: String,
    pub year: i32,
    pub points: Vec<ResampledPoint>,
}

impl Trajectory {
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// Upper bound on resampled points per entity.
pub const MAX_GRID_POINTS: usize = 10_000_000;

/// Uniform planar series produced before back-projection.
#[derive(Clone, Debug)]
pub struct PlanarSeries {
    pub times: Array1<f64>,
    pub x: Array1<f64>,
    pub y: Array1<f64>,
    pub depth_class: Vec<i64>,
}

/// Sort, project, and resample one entity's fixes.
pub fn resample_track(
    entity_id: &str,
    mut fixes: Vec<RawFix>,
    params: &Params,
) -> Result<Trajectory, TrackError> {
    for (idx, fix) in fixes.iter().enumerate() {
        if !WebMercator::in_domain(fix.lon, fix.lat) {
            return Err(TrackError::InvalidFix {
                row: idx + 1,
                reason: format!("position ({}, {}) outside projection domain", fix.lon, fix.lat),
            });
        }
    }
    if fixes.is_empty() {
        return Err(TrackError::InsufficientSamples(0));
    }

    // Stable, so the first-seen fix survives timestamp dedup.
    fixes.sort_by_key(|fix| fix.timestamp);
    let year = fixes[0].timestamp.year();

    let projector = WebMercator;
    let projected = project_fixes(&fixes, &projector);
    let series = resample_projected(&projected, params)?;
    let (lons, lats) = projector.unproject_many(series.x.view(), series.y.view());

    let points = series
        .times
        .iter()
        .zip(lons.iter().zip(lats.iter()))
        .zip(series.depth_class.iter())
        .map(|((&t, (&lon, &lat)), &depth_class)| ResampledPoint {
            elapsed_s: t,
            longitude: lon,
            latitude: lat,
            depth_class,
            entity_id: entity_id.to_string(),
            year,
        })
        .collect::<Vec<_>>();

    debug!(
        entity = entity_id,
        fixes = fixes.len(),
        distinct = projected.len(),
        points = points.len(),
        "resampled track"
    );

    Ok(Trajectory {
        entity_id: entity_id.to_string(),
        year,
        points,
    })
}

/// Seconds at nanosecond resolution; spans too long for `i64` nanoseconds fall back to milliseconds.
pub fn elapsed_seconds(delta: TimeDelta) -> f64 {
    match delta.num_nanoseconds() {
        Some(ns) => ns as f64 / 1e9,
        None => delta.num_milliseconds() as f64 / 1e3,
    }
}

/// Project time-sorted fixes and collapse repeated timestamps, keeping the first.
pub fn project_fixes(sorted: &[RawFix], projector: &WebMercator) -> Vec<ProjectedFix> {
    let Some(first) = sorted.first() else {
        return Vec::new();
    };
    let t0 = first.timestamp;
    let lon: Vec<f64> = sorted.iter().map(|f| f.lon).collect();
    let lat: Vec<f64> = sorted.iter().map(|f| f.lat).collect();
    let (xs, ys) = projector.project_many(ArrayView1::from(&lon), ArrayView1::from(&lat));

    let mut out: Vec<ProjectedFix> = Vec::with_capacity(sorted.len());
    for (idx, fix) in sorted.iter().enumerate() {
        let elapsed_s = elapsed_seconds(fix.timestamp - t0);
        if out.last().is_some_and(|prev| prev.elapsed_s == elapsed_s) {
            continue;
        }
        out.push(ProjectedFix {
            elapsed_s,
            x: xs[idx],
            y: ys[idx],
            depth: fix.depth(),
        });
    }
    out
}

/// Resample sorted, deduplicated planar fixes over `[min(t), max(t))`.
pub fn resample_projected(
    fixes: &[ProjectedFix],
    params: &Params,
) -> Result<PlanarSeries, TrackError> {
    if fixes.len() < 2 {
        return Err(TrackError::InsufficientSamples(fixes.len()));
    }
    let times: Vec<f64> = fixes.iter().map(|f| f.elapsed_s).collect();
    let xs: Vec<f64> = fixes.iter().map(|f| f.x).collect();
    let ys: Vec<f64> = fixes.iter().map(|f| f.y).collect();
    let depth = fill_missing(&fixes.iter().map(|f| f.depth).collect::<Vec<_>>());

    let start = times[0];
    let end = times[times.len() - 1];
    let slots = ((end - start) / params.step_s).ceil();
    if slots > MAX_GRID_POINTS as f64 {
        return Err(TrackError::InvalidParameter(format!(
            "step {} s over a {} s track needs {} grid points, limit is {}",
            params.step_s, end - start, slots, MAX_GRID_POINTS
        )));
    }
    let grid = time_grid(start, end, params.step_s);

    let x = interp_linear(&times, &xs, &grid);
    let y = interp_linear(&times, &ys, &grid);
    let depth_class = grid
        .iter()
        .map(|&q| {
            let value = depth[nearest_index(&times, q)].map(|d| d as f64);
            depth_class(value, params.depth_min, params.depth_max)
        })
        .collect();

    Ok(PlanarSeries {
        times: grid,
        x,
        y,
        depth_class,
    })
}

/// `start, start + step, ...` strictly below `end`.
pub fn time_grid(start: f64, end: f64, step: f64) -> Array1<f64> {
    if !(end > start) || !(step > 0.0) {
        return Array1::zeros(0);
    }
    let count = ((end - start) / step).ceil() as usize;
    let values: Vec<f64> = (0..count)
        .map(|k| start + k as f64 * step)
        .take_while(|&t| t < end)
        .collect();
    Array1::from_vec(values)
}

/// Piecewise-linear interpolation; queries outside `times` extend the edge segments.
pub fn interp_linear(times: &[f64], values: &[f64], queries: &Array1<f64>) -> Array1<f64> {
    debug_assert!(times.len() >= 2 && times.len() == values.len());
    let last_segment = times.len() - 2;
    queries.mapv(|q| {
        let idx = times.partition_point(|&t| t <= q).saturating_sub(1).min(last_segment);
        let (t0, t1) = (times[idx], times[idx + 1]);
        let (v0, v1) = (values[idx], values[idx + 1]);
        v0 + (v1 - v0) * (q - t0) / (t1 - t0)
    })
}

/// Index of the sample closest to `q`; an exact midpoint resolves to the earlier sample.
pub fn nearest_index(times: &[f64], q: f64) -> usize {
    debug_assert!(!times.is_empty());
    let upper = times.partition_point(|&t| t < q);
    if upper == 0 {
        return 0;
    }
    if upper == times.len() {
        return times.len() - 1;
    }
    let midpoint = (times[upper - 1] + times[upper]) / 2.0;
    if q <= midpoint {
        upper - 1
    } else {
        upper
    }
}

/// Forward fill, then backward fill the leading gap.
pub fn fill_missing(values: &[Option<i64>]) -> Vec<Option<i64>> {
    let mut out = Vec::with_capacity(values.len());
    let mut last = None;
    for value in values {
        if value.is_some() {
            last = *value;
        }
        out.push(last);
    }
    if let Some(first) = values.iter().find_map(|v| *v) {
        for slot in out.iter_mut().take_while(|v| v.is_none()) {
            *slot = Some(first);
        }
    }
    out
}

/// Round to the nearest class and clamp; a fully missing channel maps to `min`.
pub fn depth_class(value: Option<f64>, min: i64, max: i64) -> i64 {
    match value {
        Some(v) if v.is_finite() => (v.round_ties_even() as i64).clamp(min, max),
        _ => min,
    }
}
