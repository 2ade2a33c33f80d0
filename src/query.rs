use crate::centroids::centroid_for;
use crate::record::{Coordinate, Record, Tier};

#[derive(Debug, Clone, PartialEq)]
pub enum QueryTarget {
    /// Free text sent to the geocoding service.
    Search(String),
    /// Precomputed region centroid; no network call.
    Centroid(Coordinate),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CandidateQuery {
    pub tier: Tier,
    pub target: QueryTarget,
}

impl CandidateQuery {
    fn search(tier: Tier, subject: &str, state: &str) -> Self {
        Self {
            tier,
            target: QueryTarget::Search(format!("{subject}, {state}, USA")),
        }
    }

    pub fn describe(&self) -> String {
        match &self.target {
            QueryTarget::Search(text) => text.clone(),
            QueryTarget::Centroid(coord) => format!("centroid {coord}"),
        }
    }
}

/// Candidate queries for a record, most precise first. Empty when the record
/// has no region, since every tier is scoped to it.
pub fn build_queries(record: &Record) -> Vec<CandidateQuery> {
    let Some(state) = record.state.as_deref().map(str::trim).filter(|s| !s.is_empty()) else {
        return Vec::new();
    };

    let mut queries = Vec::with_capacity(4);
    let fields = [
        (Tier::City, record.city.as_deref()),
        (Tier::Business, record.business.as_deref()),
        (Tier::Name, record.name.as_deref()),
    ];
    for (tier, value) in fields {
        if let Some(subject) = value.map(str::trim).filter(|v| !v.is_empty()) {
            queries.push(CandidateQuery::search(tier, subject, state));
        }
    }

    if let Some(centroid) = centroid_for(state) {
        queries.push(CandidateQuery {
            tier: Tier::State,
            target: QueryTarget::Centroid(centroid),
        });
    }
    queries
}
