//! Spherical Web Mercator (EPSG:3857) <-> WGS84 (EPSG:4326).

use std::f64::consts::{FRAC_PI_2, FRAC_PI_4};

use ndarray::{Array1, ArrayView1, Zip};

/// WGS84 semi-major axis, the sphere radius used by EPSG:3857.
pub const EARTH_RADIUS_M: f64 = 6_378_137.0;

/// Latitude at which the Mercator square closes; beyond it y diverges.
pub const MAX_LATITUDE: f64 = 85.051_128_779_806_59;

/// Stateless projector between geodetic degrees and planar meters.
#[derive(Clone, Copy, Debug, Default)]
pub struct WebMercator;

impl WebMercator {
    pub fn in_domain(lon: f64, lat: f64) -> bool {
        lon.is_finite() && lat.is_finite() && lat.abs() <= MAX_LATITUDE
    }

    pub fn project(&self, lon: f64, lat: f64) -> (f64, f64) {
        let x = EARTH_RADIUS_M * lon.to_radians();
        let y = EARTH_RADIUS_M * (FRAC_PI_4 + lat.to_radians() / 2.0).tan().ln();
        (x, y)
    }

    pub fn unproject(&self, x: f64, y: f64) -> (f64, f64) {
        let lon = (x / EARTH_RADIUS_M).to_degrees();
        let lat = (2.0 * (y / EARTH_RADIUS_M).exp().atan() - FRAC_PI_2).to_degrees();
        (lon, lat)
    }

    /// Project parallel longitude/latitude columns in one pass.
    pub fn project_many(
        &self,
        lon: ArrayView1<f64>,
        lat: ArrayView1<f64>,
    ) -> (Array1<f64>, Array1<f64>) {
        debug_assert_eq!(lon.len(), lat.len());
        let mut xs = Array1::zeros(lon.len());
        let mut ys = Array1::zeros(lon.len());
        Zip::from(&mut xs)
            .and(&mut ys)
            .and(lon)
            .and(lat)
            .for_each(|x, y, &lo, &la| {
                (*x, *y) = self.project(lo, la);
            });
        (xs, ys)
    }

    pub fn unproject_many(
        &self,
        x: ArrayView1<f64>,
        y: ArrayView1<f64>,
    ) -> (Array1<f64>, Array1<f64>) {
        debug_assert_eq!(x.len(), y.len());
        let mut lons = Array1::zeros(x.len());
        let mut lats = Array1::zeros(x.len());
        Zip::from(&mut lons)
            .and(&mut lats)
            .and(x)
            .and(y)
            .for_each(|lon, lat, &px, &py| {
                (*lon, *lat) = self.unproject(px, py);
            });
        (lons, lats)
    }
}
