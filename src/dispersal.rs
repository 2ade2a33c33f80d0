//! Spreads records that collapsed onto a region centroid so their markers do
//! not stack. Each record is moved once; the `dispersed` flag is persisted so
//! later runs leave it alone.

use std::f64::consts::TAU;

use rand::{rngs::StdRng, Rng, SeedableRng};
use tracing::{debug, info};

use crate::centroids::extent_km_for;
use crate::config::AppConfig;
use crate::record::{Coordinate, Record, Tier};

const EARTH_RADIUS_KM: f64 = 6_371.0088;

pub struct Disperser {
    radius_km: f64,
    rng: StdRng,
}

impl Disperser {
    pub fn new(config: &AppConfig) -> Self {
        let rng = match config.jitter_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self::with_rng(config.jitter_radius_km, rng)
    }

    pub fn with_rng(radius_km: f64, rng: StdRng) -> Self {
        Self {
            radius_km: radius_km.max(0.0),
            rng,
        }
    }

    pub fn radius_km(&self) -> f64 {
        self.radius_km
    }

    /// Applies one bounded offset to every resolved, state-tier record that
    /// has not been dispersed yet. Returns how many records moved.
    pub fn apply(&mut self, records: &mut [Record]) -> usize {
        let mut moved = 0;
        for record in records.iter_mut().filter(|r| is_eligible(r)) {
            let Some(origin) = record.coordinate else {
                continue;
            };
            let radius_km = capped_radius(self.radius_km, record);
            let bearing = self.rng.gen_range(0.0..TAU);
            // sqrt gives uniform density over the disc
            let distance_km = radius_km * self.rng.gen::<f64>().sqrt();
            let target = destination(origin, bearing, distance_km);
            debug!(
                row = record.index + 1,
                %origin,
                %target,
                distance_km,
                "dispersed centroid record"
            );
            record.coordinate = Some(target);
            record.dispersed = true;
            moved += 1;
        }
        if moved > 0 {
            info!(moved, radius_km = self.radius_km, "dispersal pass complete");
        }
        moved
    }
}

/// Keeps the offset inside small regions such as DC or Rhode Island.
fn capped_radius(radius_km: f64, record: &Record) -> f64 {
    record
        .state
        .as_deref()
        .and_then(extent_km_for)
        .map_or(radius_km, |extent| radius_km.min(extent))
}

fn is_eligible(record: &Record) -> bool {
    record.is_resolved() && record.tier == Some(Tier::State) && !record.dispersed
}

/// Point reached by travelling `distance_km` from `origin` along a great
/// circle at `bearing` radians from north.
pub fn destination(origin: Coordinate, bearing: f64, distance_km: f64) -> Coordinate {
    let angular = distance_km / EARTH_RADIUS_KM;
    let lat1 = origin.lat.to_radians();
    let lng1 = origin.lng.to_radians();

    let lat2 = (lat1.sin() * angular.cos() + lat1.cos() * angular.sin() * bearing.cos()).asin();
    let lng2 = lng1
        + (bearing.sin() * angular.sin() * lat1.cos())
            .atan2(angular.cos() - lat1.sin() * lat2.sin());

    let lng_deg = (lng2.to_degrees() + 540.0).rem_euclid(360.0) - 180.0;
    Coordinate::new(lat2.to_degrees(), lng_deg)
}

/// Great-circle distance between two points.
pub fn haversine_km(a: Coordinate, b: Coordinate) -> f64 {
    let d_lat = (b.lat - a.lat).to_radians();
    let d_lng = (b.lng - a.lng).to_radians();
    let h = (d_lat / 2.0).sin().powi(2)
        + a.lat.to_radians().cos() * b.lat.to_radians().cos() * (d_lng / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * h.sqrt().min(1.0).asin()
}
