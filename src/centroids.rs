//! Static reference coordinates for US states, used as the lowest-precision
//! fallback when nothing more specific can be resolved.

use std::collections::HashMap;

use once_cell::sync::Lazy;

use crate::record::Coordinate;

struct StateCentroid {
    code: &'static str,
    name: &'static str,
    lat: f64,
    lng: f64,
    /// Rough radius of a disc around the centroid that stays inside the region.
    extent_km: f64,
}

const fn state(
    code: &'static str,
    name: &'static str,
    lat: f64,
    lng: f64,
    extent_km: f64,
) -> StateCentroid {
    StateCentroid {
        code,
        name,
        lat,
        lng,
        extent_km,
    }
}

static STATE_CENTROIDS: &[StateCentroid] = &[
    state("AL", "Alabama", 32.806671, -86.791130, 110.0),
    state("AK", "Alaska", 61.370716, -152.404419, 300.0),
    state("AZ", "Arizona", 33.729759, -111.431221, 200.0),
    state("AR", "Arkansas", 34.969704, -92.373123, 110.0),
    state("CA", "California", 36.116203, -119.681564, 150.0),
    state("CO", "Colorado", 39.059811, -105.311104, 180.0),
    state("CT", "Connecticut", 41.597782, -72.755371, 35.0),
    state("DE", "Delaware", 39.318523, -75.507141, 12.0),
    state("DC", "District of Columbia", 38.897438, -77.026817, 5.0),
    state("FL", "Florida", 27.766279, -81.686783, 80.0),
    state("GA", "Georgia", 33.040619, -83.643074, 130.0),
    state("HI", "Hawaii", 21.094318, -157.498337, 25.0),
    state("ID", "Idaho", 44.240459, -114.478828, 90.0),
    state("IL", "Illinois", 40.349457, -88.986137, 100.0),
    state("IN", "Indiana", 39.849426, -86.258278, 90.0),
    state("IA", "Iowa", 42.011539, -93.210526, 130.0),
    state("KS", "Kansas", 38.526600, -96.726486, 140.0),
    state("KY", "Kentucky", 37.668140, -84.670067, 70.0),
    state("LA", "Louisiana", 31.169546, -91.867805, 90.0),
    state("ME", "Maine", 44.693947, -69.381927, 90.0),
    state("MD", "Maryland", 39.063946, -76.802101, 15.0),
    state("MA", "Massachusetts", 42.230171, -71.530106, 25.0),
    state("MI", "Michigan", 43.326618, -84.536095, 90.0),
    state("MN", "Minnesota", 45.694454, -93.900192, 130.0),
    state("MS", "Mississippi", 32.741646, -89.678696, 100.0),
    state("MO", "Missouri", 38.456085, -92.288368, 130.0),
    state("MT", "Montana", 46.921925, -110.454353, 180.0),
    state("NE", "Nebraska", 41.125370, -98.268082, 130.0),
    state("NV", "Nevada", 38.313515, -117.055374, 150.0),
    state("NH", "New Hampshire", 43.452492, -71.563896, 35.0),
    state("NJ", "New Jersey", 40.298904, -74.521011, 35.0),
    state("NM", "New Mexico", 34.840515, -106.248482, 200.0),
    state("NY", "New York", 42.165726, -74.948051, 90.0),
    state("NC", "North Carolina", 35.630066, -79.806419, 70.0),
    state("ND", "North Dakota", 47.528912, -99.784012, 130.0),
    state("OH", "Ohio", 40.388783, -82.764915, 110.0),
    state("OK", "Oklahoma", 35.565342, -96.928917, 90.0),
    state("OR", "Oregon", 44.572021, -122.070938, 140.0),
    state("PA", "Pennsylvania", 40.590752, -77.209755, 90.0),
    state("RI", "Rhode Island", 41.680893, -71.511780, 12.0),
    state("SC", "South Carolina", 33.856892, -80.945007, 80.0),
    state("SD", "South Dakota", 44.299782, -99.438828, 130.0),
    state("TN", "Tennessee", 35.747845, -86.692345, 50.0),
    state("TX", "Texas", 31.054487, -97.563461, 250.0),
    state("UT", "Utah", 40.150032, -111.862434, 120.0),
    state("VT", "Vermont", 44.045876, -72.710686, 35.0),
    state("VA", "Virginia", 37.769337, -78.169968, 70.0),
    state("WA", "Washington", 47.400902, -121.490494, 110.0),
    state("WV", "West Virginia", 38.491226, -80.954453, 50.0),
    state("WI", "Wisconsin", 44.268543, -89.616508, 110.0),
    state("WY", "Wyoming", 42.755966, -107.302490, 150.0),
];

// Keyed by upper-cased code and upper-cased full name.
static LOOKUP: Lazy<HashMap<String, &'static StateCentroid>> = Lazy::new(|| {
    let mut map = HashMap::with_capacity(STATE_CENTROIDS.len() * 2);
    for entry in STATE_CENTROIDS {
        map.insert(entry.code.to_string(), entry);
        map.insert(entry.name.to_ascii_uppercase(), entry);
    }
    map
});

/// Looks up the centroid for a region given as a two-letter code or a full
/// state name, ignoring case and surrounding whitespace.
pub fn centroid_for(region: &str) -> Option<Coordinate> {
    let key = region.trim().to_ascii_uppercase();
    LOOKUP
        .get(&key)
        .map(|entry| Coordinate::new(entry.lat, entry.lng))
}

/// Approximate distance from the region's centroid that still lies inside it.
pub fn extent_km_for(region: &str) -> Option<f64> {
    let key = region.trim().to_ascii_uppercase();
    LOOKUP.get(&key).map(|entry| entry.extent_km)
}
