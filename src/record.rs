use std::fmt;

use serde::Serialize;

use crate::errors::{AppError, AppResult};

/// Text written to storage for a record with no resolved location.
pub const SENTINEL_TEXT: &str = "0,0";

const COORD_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Coordinate {
    pub lat: f64,
    pub lng: f64,
}

impl Coordinate {
    pub const SENTINEL: Coordinate = Coordinate { lat: 0.0, lng: 0.0 };

    pub const fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    pub fn is_sentinel(&self) -> bool {
        self.lat.abs() < COORD_EPSILON && self.lng.abs() < COORD_EPSILON
    }

    /// True for a finite, in-range point that is not the sentinel.
    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lng.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lng)
            && !self.is_sentinel()
    }

    /// Parses a stored `"lat, lng"` cell. The sentinel, unparsable text and
    /// out-of-range values all yield `None`; callers must not plot those.
    pub fn parse(value: &str) -> Option<Self> {
        let mut parts = value.trim().split(',');
        let lat = parts.next()?.trim().parse::<f64>().ok()?;
        let lng = parts.next()?.trim().parse::<f64>().ok()?;
        if parts.next().is_some() {
            return None;
        }
        Some(Self::new(lat, lng)).filter(Coordinate::is_valid)
    }
}

impl fmt::Display for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_sentinel() {
            f.write_str(SENTINEL_TEXT)
        } else {
            write!(f, "{}, {}", self.lat, self.lng)
        }
    }
}

/// Fallback level that produced a coordinate, most precise first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    City,
    Business,
    Name,
    State,
}

impl Tier {
    pub const ALL: [Tier; 4] = [Tier::City, Tier::Business, Tier::Name, Tier::State];

    pub fn as_tag(&self) -> &'static str {
        match self {
            Tier::City => "city",
            Tier::Business => "business",
            Tier::Name => "name",
            Tier::State => "state",
        }
    }

    pub fn parse(value: &str) -> AppResult<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "city" => Ok(Tier::City),
            "business" => Ok(Tier::Business),
            "name" => Ok(Tier::Name),
            "state" => Ok(Tier::State),
            _ => Err(AppError::Config(format!("invalid resolution tier: {value}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStatus {
    Unresolved,
    Resolved,
    Failed,
}

impl ResolutionStatus {
    pub fn as_tag(&self) -> &'static str {
        match self {
            ResolutionStatus::Unresolved => "unresolved",
            ResolutionStatus::Resolved => "resolved",
            ResolutionStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub index: usize,
    pub name: Option<String>,
    pub business: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub coordinate: Option<Coordinate>,
    pub tier: Option<Tier>,
    pub status: ResolutionStatus,
    pub dispersed: bool,
}

impl Record {
    pub fn new(index: usize) -> Self {
        Self {
            index,
            name: None,
            business: None,
            city: None,
            state: None,
            coordinate: None,
            tier: None,
            status: ResolutionStatus::Unresolved,
            dispersed: false,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.status == ResolutionStatus::Resolved
            && self.coordinate.map(|c| c.is_valid()).unwrap_or(false)
    }

    pub fn mark_resolved(&mut self, coordinate: Coordinate, tier: Tier) {
        self.coordinate = Some(coordinate);
        self.tier = Some(tier);
        self.status = ResolutionStatus::Resolved;
        self.dispersed = false;
    }

    /// Marks every tier as exhausted. A record that is already resolved keeps
    /// its location.
    pub fn mark_failed(&mut self) {
        if self.is_resolved() {
            return;
        }
        self.coordinate = None;
        self.tier = None;
        self.status = ResolutionStatus::Failed;
    }

    /// Short human-readable identifier for progress logs.
    pub fn label(&self) -> String {
        self.name
            .as_deref()
            .or(self.business.as_deref())
            .map(str::to_string)
            .unwrap_or_else(|| format!("row {}", self.index + 1))
    }

    /// Text for the stored coordinate cell.
    pub fn coordinate_text(&self) -> String {
        self.coordinate
            .filter(Coordinate::is_valid)
            .map(|c| c.to_string())
            .unwrap_or_else(|| SENTINEL_TEXT.to_string())
    }
}

/// Normalises a raw cell into an optional field; blanks and `nan` are absent.
pub fn clean_field(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("nan") {
        None
    } else {
        Some(trimmed.to_string())
    }
}
