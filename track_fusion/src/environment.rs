//! Rounded-key index over gridded environmental measurements.

use std::collections::btree_map::Entry as BTreeEntry;
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap, HashSet};

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// One row of the combined environmental table.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct EnvironmentalRecord {
    pub latitude: f64,
    pub longitude: f64,
    pub year: i32,
    pub temperature: Option<f64>,
    pub chlorophyll: Option<f64>,
}

/// One row of a single-variable table (temperature-only or chlorophyll-only).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct VariableRecord {
    pub latitude: f64,
    pub longitude: f64,
    pub year: i32,
    pub value: Option<f64>,
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct EnvReading {
    pub temperature: Option<f64>,
    pub chlorophyll: Option<f64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GridKey {
    pub latitude: OrderedFloat<f64>,
    pub longitude: OrderedFloat<f64>,
    pub year: i32,
}

impl GridKey {
    pub fn rounded(latitude: f64, longitude: f64, year: i32, decimals: u32) -> Self {
        Self {
            latitude: OrderedFloat(round_to(latitude, decimals)),
            longitude: OrderedFloat(round_to(longitude, decimals)),
            year,
        }
    }
}

/// Round half-to-even at `decimals` places. Negative zero folds to zero so
/// both sides of a join hash identically.
pub fn round_to(value: f64, decimals: u32) -> f64 {
    let scale = 10f64.powi(decimals as i32);
    let rounded = (value * scale).round_ties_even() / scale;
    if rounded == 0.0 {
        0.0
    } else {
        rounded
    }
}

/// Immutable lookup from rounded (lat, lon, year) to environmental readings.
///
/// Built once per run and shared read-only across worker threads. An index
/// built from an unavailable table answers every lookup with `None`.
#[derive(Clone, Debug)]
pub struct EnvironmentalGridIndex {
    decimals: u32,
    entries: HashMap<GridKey, EnvReading>,
    duplicate_keys: usize,
    skipped_records: usize,
    available: bool,
}

impl EnvironmentalGridIndex {
    /// Index `records`; on a repeated rounded key the first record wins.
    pub fn build<I>(records: I, decimals: u32) -> Self
    where
        I: IntoIterator<Item = EnvironmentalRecord>,
    {
        let mut entries = HashMap::new();
        let mut duplicate_keys = 0usize;
        let mut skipped_records = 0usize;
        for record in records {
            if !record.latitude.is_finite() || !record.longitude.is_finite() {
                skipped_records += 1;
                continue;
            }
            let key = GridKey::rounded(record.latitude, record.longitude, record.year, decimals);
            match entries.entry(key) {
                Entry::Vacant(slot) => {
                    slot.insert(EnvReading {
                        temperature: record.temperature.filter(|v| v.is_finite()),
                        chlorophyll: record.chlorophyll.filter(|v| v.is_finite()),
                    });
                }
                Entry::Occupied(_) => duplicate_keys += 1,
            }
        }
        if duplicate_keys > 0 {
            warn!(
                duplicate_keys,
                decimals, "environmental table has repeated rounded keys; kept first occurrence"
            );
        }
        debug!(keys = entries.len(), skipped_records, "built environmental index");
        Self {
            decimals,
            entries,
            duplicate_keys,
            skipped_records,
            available: true,
        }
    }

    /// Total-miss index used when the environmental table cannot be loaded.
    pub fn unavailable(decimals: u32) -> Self {
        Self {
            decimals,
            entries: HashMap::new(),
            duplicate_keys: 0,
            skipped_records: 0,
            available: false,
        }
    }

    pub fn lookup(&self, latitude: f64, longitude: f64, year: i32) -> Option<EnvReading> {
        if !latitude.is_finite() || !longitude.is_finite() {
            return None;
        }
        let key = GridKey::rounded(latitude, longitude, year, self.decimals);
        self.entries.get(&key).copied()
    }

    pub fn decimals(&self) -> u32 {
        self.decimals
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_available(&self) -> bool {
        self.available
    }

    pub fn duplicate_keys(&self) -> usize {
        self.duplicate_keys
    }

    pub fn skipped_records(&self) -> usize {
        self.skipped_records
    }
}

/// Full outer join of per-variable tables on the exact (lat, lon, year) key.
///
/// Output is sorted by key. A key repeated within one input keeps its first row.
pub fn merge_environment(
    chlorophyll: Vec<VariableRecord>,
    temperature: Vec<VariableRecord>,
) -> Vec<EnvironmentalRecord> {
    let mut merged: BTreeMap<GridKey, EnvironmentalRecord> = BTreeMap::new();
    let mut seen_chl = 0usize;

    for record in chlorophyll {
        let key = exact_key(&record);
        if let BTreeEntry::Vacant(slot) = merged.entry(key) {
            seen_chl += 1;
            slot.insert(EnvironmentalRecord {
                latitude: record.latitude,
                longitude: record.longitude,
                year: record.year,
                temperature: None,
                chlorophyll: record.value,
            });
        }
    }

    let mut temp_keys: HashSet<GridKey> = HashSet::new();
    for record in temperature {
        let key = exact_key(&record);
        if !temp_keys.insert(key) {
            continue;
        }
        merged
            .entry(key)
            .and_modify(|row| row.temperature = record.value)
            .or_insert(EnvironmentalRecord {
                latitude: record.latitude,
                longitude: record.longitude,
                year: record.year,
                temperature: record.value,
                chlorophyll: None,
            });
    }

    debug!(
        chlorophyll_keys = seen_chl,
        temperature_keys = temp_keys.len(),
        merged = merged.len(),
        "merged environmental tables"
    );
    merged.into_values().collect()
}

fn exact_key(record: &VariableRecord) -> GridKey {
    GridKey {
        latitude: OrderedFloat(record.latitude),
        longitude: OrderedFloat(record.longitude),
        year: record.year,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(lat: f64, lon: f64, year: i32, temp: f64, chl: f64) -> EnvironmentalRecord {
        EnvironmentalRecord {
            latitude: lat,
            longitude: lon,
            year,
            temperature: Some(temp),
            chlorophyll: Some(chl),
        }
    }

    fn var(lat: f64, lon: f64, year: i32, value: f64) -> VariableRecord {
        VariableRecord {
            latitude: lat,
            longitude: lon,
            year,
            value: Some(value),
        }
    }

    #[test]
    fn rounding_is_half_even_and_folds_negative_zero() {
        assert_eq!(round_to(41.204, 2), 41.2);
        assert_eq!(round_to(-71.498, 2), -71.5);
        assert_eq!(round_to(0.125, 2), 0.12);
        assert_eq!(round_to(-0.001, 2).to_bits(), 0.0f64.to_bits());
        assert_eq!(round_to(12.7, 0), 13.0);
    }

    #[test]
    fn rounded_point_matches_grid_cell() {
        let index = EnvironmentalGridIndex::build([record(41.20, -71.50, 2013, 15.5, 0.5)], 2);
        let reading = index.lookup(41.204, -71.498, 2013).unwrap();
        assert_eq!(reading.temperature, Some(15.5));
        assert_eq!(reading.chlorophyll, Some(0.5));
    }

    #[test]
    fn miss_on_year_or_position() {
        let index = EnvironmentalGridIndex::build([record(41.20, -71.50, 2013, 15.5, 0.5)], 2);
        assert!(index.lookup(41.20, -71.50, 2014).is_none());
        assert!(index.lookup(41.21, -71.50, 2013).is_none());
        assert!(index.lookup(f64::NAN, -71.50, 2013).is_none());
    }

    #[test]
    fn unavailable_index_always_misses() {
        let index = EnvironmentalGridIndex::unavailable(2);
        assert!(!index.is_available());
        assert!(index.is_empty());
        assert!(index.lookup(41.2, -71.5, 2013).is_none());
    }

    #[test]
    fn duplicate_keys_keep_first() {
        let index = EnvironmentalGridIndex::build(
            [
                record(41.201, -71.5, 2013, 10.0, 1.0),
                record(41.199, -71.5, 2013, 20.0, 2.0),
            ],
            2,
        );
        assert_eq!(index.len(), 1);
        assert_eq!(index.duplicate_keys(), 1);
        assert_eq!(index.lookup(41.2, -71.5, 2013).unwrap().temperature, Some(10.0));
    }

    #[test]
    fn rebuild_is_deterministic() {
        let rows = vec![
            record(41.2, -71.5, 2013, 15.5, 0.5),
            record(41.3, -71.4, 2013, 16.0, 0.7),
            record(41.3, -71.4, 2014, 17.0, 0.9),
        ];
        let a = EnvironmentalGridIndex::build(rows.clone(), 2);
        let b = EnvironmentalGridIndex::build(rows, 2);
        for (lat, lon, year) in [(41.2, -71.5, 2013), (41.3, -71.4, 2014), (0.0, 0.0, 2013)] {
            assert_eq!(a.lookup(lat, lon, year), b.lookup(lat, lon, year));
        }
    }

    #[test]
    fn coarser_rounding_matches_at_least_as_often() {
        let rows = vec![record(41.2, -71.5, 2013, 15.5, 0.5), record(40.0, -70.0, 2013, 12.0, 0.2)];
        let queries = [(41.23, -71.46), (41.204, -71.498), (39.97, -70.02), (10.0, 10.0)];
        let fine = EnvironmentalGridIndex::build(rows.clone(), 2);
        let coarse = EnvironmentalGridIndex::build(rows, 1);
        let hits = |index: &EnvironmentalGridIndex| {
            queries
                .iter()
                .filter(|(lat, lon)| index.lookup(*lat, *lon, 2013).is_some())
                .count()
        };
        assert_eq!(hits(&fine), 1);
        assert_eq!(hits(&coarse), 3);
    }

    #[test]
    fn non_finite_readings_become_missing() {
        let index = EnvironmentalGridIndex::build([record(1.0, 2.0, 2015, f64::NAN, 0.3)], 2);
        let reading = index.lookup(1.0, 2.0, 2015).unwrap();
        assert_eq!(reading.temperature, None);
        assert_eq!(reading.chlorophyll, Some(0.3));
    }

    #[test]
    fn outer_merge_keeps_every_key() {
        let chl = vec![var(41.2, -71.5, 2013, 0.5), var(41.3, -71.5, 2013, 0.6)];
        let temp = vec![var(41.2, -71.5, 2013, 15.5), var(40.0, -71.5, 2013, 14.0)];
        let merged = merge_environment(chl, temp);
        assert_eq!(merged.len(), 3);
        assert_eq!(merged[0].latitude, 40.0);
        assert_eq!(merged[0].temperature, Some(14.0));
        assert_eq!(merged[0].chlorophyll, None);
        assert_eq!(merged[1].temperature, Some(15.5));
        assert_eq!(merged[1].chlorophyll, Some(0.5));
        assert_eq!(merged[2].temperature, None);
        assert_eq!(merged[2].chlorophyll, Some(0.6));
    }

    #[test]
    fn outer_merge_ignores_repeated_rows_within_a_side() {
        let chl = vec![var(1.0, 1.0, 2016, 0.1), var(1.0, 1.0, 2016, 0.9)];
        let temp = vec![var(1.0, 1.0, 2016, 20.0), var(1.0, 1.0, 2016, 30.0)];
        let merged = merge_environment(chl, temp);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].chlorophyll, Some(0.1));
        assert_eq!(merged[0].temperature, Some(20.0));
    }
}
