//! Typed column keys and the serialized naming convention.
//!
//! String formatting of column names lives here and nowhere else:
//!
//! | namespace   | regional field         | interchange            |
//! |-------------|------------------------|------------------------|
//! | electricity | `EBA.<r>-ALL.<F>.H`    | `EBA.<a>-<b>.ID.H`     |
//! | pollutant   | `<P>_<r>_<F>`          | `<P>_<a>-<b>_ID`       |
//! | intensity   | `<P>i_<r>_<F>`         | n/a                    |

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::types::{DomainError, Field, Namespace, Region};

/// Key of one column in a [`TimeSeriesTable`](super::TimeSeriesTable)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ColumnKey {
    /// D, NG or TI of one region
    Region {
        namespace: Namespace,
        region: Region,
        field: Field,
    },
    /// Directed interchange from `from` to `to`
    Pair {
        namespace: Namespace,
        from: Region,
        to: Region,
    },
}

impl ColumnKey {
    /// Regional column. Interchange columns must be built with [`ColumnKey::pair`].
    pub fn region(namespace: Namespace, region: Region, field: Field) -> Self {
        debug_assert!(field != Field::Interchange, "use ColumnKey::pair for interchange");
        ColumnKey::Region {
            namespace,
            region,
            field,
        }
    }

    pub fn pair(namespace: Namespace, from: Region, to: Region) -> Self {
        ColumnKey::Pair {
            namespace,
            from,
            to,
        }
    }

    pub fn namespace(&self) -> Namespace {
        match self {
            ColumnKey::Region { namespace, .. } | ColumnKey::Pair { namespace, .. } => *namespace,
        }
    }

    pub fn field(&self) -> Field {
        match self {
            ColumnKey::Region { field, .. } => *field,
            ColumnKey::Pair { .. } => Field::Interchange,
        }
    }

    /// Owning region (the exporting side for interchange columns)
    pub fn region_id(&self) -> &Region {
        match self {
            ColumnKey::Region { region, .. } => region,
            ColumnKey::Pair { from, .. } => from,
        }
    }

    /// Partner region for interchange columns
    pub fn partner(&self) -> Option<&Region> {
        match self {
            ColumnKey::Region { .. } => None,
            ColumnKey::Pair { to, .. } => Some(to),
        }
    }

    /// Same key moved to another namespace
    pub fn with_namespace(&self, namespace: Namespace) -> Self {
        match self.clone() {
            ColumnKey::Region { region, field, .. } => ColumnKey::Region {
                namespace,
                region,
                field,
            },
            ColumnKey::Pair { from, to, .. } => ColumnKey::Pair { namespace, from, to },
        }
    }

    fn parse_dotted(s: &str) -> Result<Self, DomainError> {
        let malformed = || DomainError::MalformedColumn(s.to_string());
        let parts: Vec<&str> = s.split('.').collect();
        if parts.len() != 4 || parts[3] != "H" {
            return Err(malformed());
        }
        let namespace: Namespace = parts[0].parse()?;
        let (a, b) = parts[1].split_once('-').ok_or_else(malformed)?;
        let field = parse_field(s, parts[2])?;
        let from = Region::new(a)?;
        match (field, b) {
            (Field::Interchange, partner) => Ok(ColumnKey::pair(namespace, from, Region::new(partner)?)),
            (field, "ALL") => Ok(ColumnKey::region(namespace, from, field)),
            _ => Err(malformed()),
        }
    }

    fn parse_underscored(s: &str) -> Result<Self, DomainError> {
        let malformed = || DomainError::MalformedColumn(s.to_string());
        let parts: Vec<&str> = s.split('_').collect();
        if parts.len() != 3 {
            return Err(malformed());
        }
        let namespace: Namespace = parts[0].parse()?;
        let field = parse_field(s, parts[2])?;
        if !namespace.supports(field) {
            return Err(DomainError::FieldNotInNamespace { namespace, field });
        }
        if field == Field::Interchange {
            let (a, b) = parts[1].split_once('-').ok_or_else(malformed)?;
            Ok(ColumnKey::pair(namespace, Region::new(a)?, Region::new(b)?))
        } else {
            Ok(ColumnKey::region(namespace, Region::new(parts[1])?, field))
        }
    }
}

fn parse_field(column: &str, token: &str) -> Result<Field, DomainError> {
    token.parse::<Field>().map_err(|_| DomainError::UnknownField {
        column: column.to_string(),
        field: token.to_string(),
    })
}

impl FromStr for ColumnKey {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.starts_with("EBA.") {
            Self::parse_dotted(s)
        } else {
            Self::parse_underscored(s)
        }
    }
}

impl TryFrom<String> for ColumnKey {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ColumnKey> for String {
    fn from(key: ColumnKey) -> Self {
        key.to_string()
    }
}

impl fmt::Display for ColumnKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnKey::Region {
                namespace: Namespace::Electricity,
                region,
                field,
            } => write!(f, "EBA.{}-ALL.{}.H", region, field),
            ColumnKey::Pair {
                namespace: Namespace::Electricity,
                from,
                to,
            } => write!(f, "EBA.{}-{}.ID.H", from, to),
            ColumnKey::Region {
                namespace,
                region,
                field,
            } => write!(f, "{}_{}_{}", namespace, region, field),
            ColumnKey::Pair { namespace, from, to } => write!(f, "{}_{}-{}_ID", namespace, from, to),
        }
    }
}
