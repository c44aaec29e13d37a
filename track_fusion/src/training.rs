//! Environmental enrichment and next-position labelling.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::environment::EnvironmentalGridIndex;
use crate::resample::{ResampledPoint, Trajectory};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TrainingExample {
    pub longitude: f64,
    pub latitude: f64,
    pub temperature: Option<f64>,
    pub chlorophyll: Option<f64>,
    pub entity_id: String,
    pub longitude_next: f64,
    pub latitude_next: f64,
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct JoinCoverage {
    pub rows: usize,
    /// Rows carrying at least one environmental value.
    pub matched: usize,
    pub temperature_missing: usize,
    pub chlorophyll_missing: usize,
}

impl JoinCoverage {
    pub fn from_examples(examples: &[TrainingExample]) -> Self {
        let mut coverage = JoinCoverage {
            rows: examples.len(),
            ..JoinCoverage::default()
        };
        for example in examples {
            if example.temperature.is_none() {
                coverage.temperature_missing += 1;
            }
            if example.chlorophyll.is_none() {
                coverage.chlorophyll_missing += 1;
            }
            if example.temperature.is_some() || example.chlorophyll.is_some() {
                coverage.matched += 1;
            }
        }
        coverage
    }
}

/// Label each trajectory independently; a trajectory never borrows another's points.
pub fn build_training_examples(
    trajectories: &[Trajectory],
    index: &EnvironmentalGridIndex,
) -> Vec<TrainingExample> {
    trajectories
        .iter()
        .flat_map(|trajectory| label_points(&trajectory.points, index))
        .collect()
}

/// Enrich and label a table of points whose entities may be interleaved.
///
/// Each row's label is the next row with the same `entity_id`; rows without a
/// successor (the last of every entity) are dropped. Surviving rows keep table order.
pub fn label_points(
    points: &[ResampledPoint],
    index: &EnvironmentalGridIndex,
) -> Vec<TrainingExample> {
    let mut next: Vec<Option<usize>> = vec![None; points.len()];
    let mut last_seen: HashMap<&str, usize> = HashMap::new();
    for (idx, point) in points.iter().enumerate() {
        if let Some(prev) = last_seen.insert(point.entity_id.as_str(), idx) {
            next[prev] = Some(idx);
        }
    }

    points
        .iter()
        .zip(next)
        .filter_map(|(point, next_idx)| {
            let label = &points[next_idx?];
            let reading = index
                .lookup(point.latitude, point.longitude, point.year)
                .unwrap_or_default();
            Some(TrainingExample {
                longitude: point.longitude,
                latitude: point.latitude,
                temperature: reading.temperature,
                chlorophyll: reading.chlorophyll,
                entity_id: point.entity_id.clone(),
                longitude_next: label.longitude,
                latitude_next: label.latitude,
            })
        })
        .collect()
}

/// Split without shuffling: the trailing `ceil(test_fraction * n)` rows are the test part.
pub fn chronological_split<T>(mut rows: Vec<T>, test_fraction: f64) -> (Vec<T>, Vec<T>) {
    let fraction = test_fraction.clamp(0.0, 1.0);
    let n_test = (fraction * rows.len() as f64).ceil() as usize;
    let test = rows.split_off(rows.len() - n_test.min(rows.len()));
    (rows, test)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::EnvironmentalRecord;

    fn point(entity: &str, t: f64, lon: f64, lat: f64) -> ResampledPoint {
        ResampledPoint {
            elapsed_s: t,
            longitude: lon,
            latitude: lat,
            depth_class: 1,
            entity_id: entity.to_string(),
            year: 2013,
        }
    }

    fn trajectory(entity: &str, coords: &[(f64, f64)]) -> Trajectory {
        Trajectory {
            entity_id: entity.to_string(),
            year: 2013,
            points: coords
                .iter()
                .enumerate()
                .map(|(i, &(lon, lat))| point(entity, i as f64 * 21_600.0, lon, lat))
                .collect(),
        }
    }

    #[test]
    fn drops_exactly_last_point_of_each_entity() {
        let index = EnvironmentalGridIndex::unavailable(2);
        let trajs = vec![
            trajectory("A", &[(-71.0, 41.0), (-70.9, 41.1), (-70.8, 41.2)]),
            trajectory("B", &[(-60.0, 30.0), (-60.1, 30.1)]),
            trajectory("C", &[(-50.0, 20.0)]),
        ];
        let examples = build_training_examples(&trajs, &index);
        assert_eq!(examples.len(), 2 + 1);
        assert_eq!(examples[0].longitude_next, -70.9);
        assert_eq!(examples[1].latitude_next, 41.2);
        assert_eq!(examples[2].entity_id, "B");
        assert_eq!(examples[2].longitude_next, -60.1);
    }

    #[test]
    fn interleaved_entities_never_cross() {
        let index = EnvironmentalGridIndex::unavailable(2);
        let points = vec![
            point("A", 0.0, 1.0, 1.0),
            point("B", 0.0, 100.0, 50.0),
            point("A", 1.0, 2.0, 2.0),
            point("B", 1.0, 101.0, 51.0),
            point("A", 2.0, 3.0, 3.0),
        ];
        let examples = label_points(&points, &index);
        assert_eq!(examples.len(), 3);
        for example in &examples {
            if example.entity_id == "A" {
                assert!(example.longitude_next < 10.0);
            } else {
                assert!(example.longitude_next >= 100.0);
            }
        }
        let order: Vec<(&str, f64)> = examples
            .iter()
            .map(|e| (e.entity_id.as_str(), e.longitude))
            .collect();
        assert_eq!(order, vec![("A", 1.0), ("B", 100.0), ("A", 2.0)]);
    }

    #[test]
    fn enrichment_uses_point_position_and_year() {
        let index = EnvironmentalGridIndex::build(
            [EnvironmentalRecord {
                latitude: 41.20,
                longitude: -71.50,
                year: 2013,
                temperature: Some(15.5),
                chlorophyll: Some(0.5),
            }],
            2,
        );
        let trajs = vec![trajectory("A", &[(-71.498, 41.204), (-71.0, 42.0), (-70.0, 43.0)])];
        let examples = build_training_examples(&trajs, &index);
        assert_eq!(examples[0].temperature, Some(15.5));
        assert_eq!(examples[0].chlorophyll, Some(0.5));
        assert_eq!(examples[1].temperature, None);

        let coverage = JoinCoverage::from_examples(&examples);
        assert_eq!(
            coverage,
            JoinCoverage {
                rows: 2,
                matched: 1,
                temperature_missing: 1,
                chlorophyll_missing: 1,
            }
        );
    }

    #[test]
    fn split_keeps_order() {
        let (train, test) = chronological_split((0..10).collect::<Vec<_>>(), 0.2);
        assert_eq!(train, (0..8).collect::<Vec<_>>());
        assert_eq!(test, vec![8, 9]);

        let (train, test) = chronological_split((0..7).collect::<Vec<_>>(), 0.2);
        assert_eq!(train.len(), 5);
        assert_eq!(test.len(), 2);

        let (train, test) = chronological_split(vec![1, 2, 3], 0.0);
        assert_eq!(train, vec![1, 2, 3]);
        assert!(test.is_empty());
    }
}
