use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use strum::{Display, EnumString};
use thiserror::Error;

/// Domain-level errors (identifiers, column names, table shape)
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DomainError {
    #[error("Invalid region identifier: {0:?}")]
    InvalidRegion(String),
    #[error("Malformed column name: {0}")]
    MalformedColumn(String),
    #[error("Unknown field {field:?} in column {column}")]
    UnknownField { column: String, field: String },
    #[error("Unknown namespace prefix: {0}")]
    UnknownNamespace(String),
    #[error("Field {field} is not valid in namespace {namespace}")]
    FieldNotInNamespace { namespace: Namespace, field: Field },
    #[error("Index is not strictly increasing at position {0}")]
    NonMonotonicIndex(usize),
    #[error("Timestamp {0} is not aligned to the hour")]
    UnalignedTimestamp(String),
    #[error("Column {column} has {actual} samples, expected {expected}")]
    LengthMismatch {
        column: String,
        expected: usize,
        actual: usize,
    },
    #[error("Duplicate column: {0}")]
    DuplicateColumn(String),
}

/// Balancing region identifier.
///
/// Regions are derived from column names, so they may not contain any of the
/// separators used by the naming convention (`.`, `-`, `_`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Region(String);

impl Region {
    pub fn new(id: impl Into<String>) -> Result<Self, DomainError> {
        let id = id.into();
        let valid = !id.is_empty()
            && id != "ALL"
            && id.chars().all(|c| c.is_ascii_alphanumeric());
        if valid {
            Ok(Self(id))
        } else {
            Err(DomainError::InvalidRegion(id))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Region {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Region::new(value)
    }
}

impl From<Region> for String {
    fn from(region: Region) -> Self {
        region.0
    }
}

impl FromStr for Region {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Region::new(s)
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Accounting field of a region or region pair
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display, EnumString,
)]
pub enum Field {
    /// Demand
    #[strum(serialize = "D")]
    #[serde(rename = "D")]
    Demand,
    /// Net generation
    #[strum(serialize = "NG")]
    #[serde(rename = "NG")]
    NetGeneration,
    /// Total interchange, positive for net exports
    #[strum(serialize = "TI")]
    #[serde(rename = "TI")]
    TotalInterchange,
    /// Directed interchange with one partner, positive for exports
    #[strum(serialize = "ID")]
    #[serde(rename = "ID")]
    Interchange,
}

impl Field {
    /// Fields keyed by a single region
    pub const REGIONAL: [Field; 3] = [Field::Demand, Field::NetGeneration, Field::TotalInterchange];
}

/// Tracked pollutant
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display, EnumString,
)]
pub enum Pollutant {
    #[strum(serialize = "CO2")]
    #[serde(rename = "CO2")]
    Co2,
    #[strum(serialize = "SO2")]
    #[serde(rename = "SO2")]
    So2,
    #[strum(serialize = "NOX")]
    #[serde(rename = "NOX")]
    Nox,
}

/// Variable namespace. Every namespace shares the same field structure but
/// renders its column names with its own template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Namespace {
    /// Electricity (MWh), `EBA.<r>-ALL.<F>.H`
    Electricity,
    /// Pollutant mass, `<P>_<r>_<F>`
    Pollutant(Pollutant),
    /// Pollutant intensity per unit of electricity, `<P>i_<r>_<F>`
    Intensity(Pollutant),
}

impl Namespace {
    /// Column-name prefix for this namespace
    pub fn prefix(&self) -> String {
        match self {
            Namespace::Electricity => "EBA".to_string(),
            Namespace::Pollutant(p) => p.to_string(),
            Namespace::Intensity(p) => format!("{}i", p),
        }
    }

    /// Intensity namespaces only carry demand and generation columns
    pub fn supports(&self, field: Field) -> bool {
        match self {
            Namespace::Intensity(_) => matches!(field, Field::Demand | Field::NetGeneration),
            _ => true,
        }
    }

    pub fn is_intensity(&self) -> bool {
        matches!(self, Namespace::Intensity(_))
    }
}

impl FromStr for Namespace {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "EBA" {
            return Ok(Namespace::Electricity);
        }
        if let Ok(p) = s.parse::<Pollutant>() {
            return Ok(Namespace::Pollutant(p));
        }
        s.strip_suffix('i')
            .and_then(|base| base.parse::<Pollutant>().ok())
            .map(Namespace::Intensity)
            .ok_or_else(|| DomainError::UnknownNamespace(s.to_string()))
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.prefix())
    }
}
