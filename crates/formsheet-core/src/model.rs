//! Domain records shared by storage, the dependency caches and the engine

use crate::cell::{CellAddress, CellValue};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_type!(
    /// Identifier of a period (a template of sheets)
    PeriodId
);
id_type!(
    /// Identifier of a sheet
    SheetId
);
id_type!(
    /// Identifier of a filled-in document
    DocumentId
);
id_type!(
    /// Identifier of a division (organizational unit)
    DivisionId
);

/// A sheet of a period
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sheet {
    pub id: SheetId,
    pub period: PeriodId,
    pub name: String,
    /// Display order within the period
    #[serde(default)]
    pub position: u32,
}

/// A document: the values one division filled in for one period
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: DocumentId,
    pub period: PeriodId,
    pub division: DivisionId,
}

/// A division; `parent` is the division its documents are aggregated into
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Division {
    pub id: DivisionId,
    #[serde(default)]
    pub parent: Option<DivisionId>,
}

/// Kind of data a cell holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CellKind {
    #[default]
    #[serde(rename = "n")]
    Numeric,
    #[serde(rename = "money")]
    Money,
    #[serde(rename = "text")]
    Text,
    #[serde(rename = "bool")]
    Boolean,
    #[serde(rename = "date")]
    Date,
}

/// How an aggregating cell combines its contributors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregationMethod {
    Sum,
    Avg,
    Min,
    Max,
}

impl AggregationMethod {
    /// Name as used in import files
    pub fn as_str(&self) -> &'static str {
        match self {
            AggregationMethod::Sum => "sum",
            AggregationMethod::Avg => "avg",
            AggregationMethod::Min => "min",
            AggregationMethod::Max => "max",
        }
    }
}

impl FromStr for AggregationMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "sum" => Ok(AggregationMethod::Sum),
            "avg" | "average" => Ok(AggregationMethod::Avg),
            "min" => Ok(AggregationMethod::Min),
            "max" => Ok(AggregationMethod::Max),
            _ => Err(Error::UnknownAggregation(s.to_string())),
        }
    }
}

impl fmt::Display for AggregationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Position of a cell: the sheet it belongs to and its address there
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CellPos {
    pub sheet: SheetId,
    pub address: CellAddress,
}

impl CellPos {
    pub fn new(sheet: SheetId, address: CellAddress) -> Self {
        Self { sheet, address }
    }
}

impl fmt::Display for CellPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}!{}", self.sheet, self.address)
    }
}

/// A cell of a sheet template
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cell {
    pub sheet: SheetId,
    pub address: CellAddress,
    #[serde(default)]
    pub kind: CellKind,
    /// Formula text including the leading `=`
    #[serde(default)]
    pub formula: Option<String>,
    /// Value used when a document has no stored value for the cell
    #[serde(default)]
    pub default: CellValue,
    /// Set when the cell aggregates values of subordinate documents
    #[serde(default)]
    pub aggregation: Option<AggregationMethod>,
}

impl Cell {
    pub fn new(sheet: SheetId, address: CellAddress) -> Self {
        Self {
            sheet,
            address,
            kind: CellKind::default(),
            formula: None,
            default: CellValue::Empty,
            aggregation: None,
        }
    }

    pub fn pos(&self) -> CellPos {
        CellPos::new(self.sheet, self.address)
    }
}

/// A boolean check gating status transitions of a period's documents
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Limitation {
    /// Ordering key; failures are reported in index order
    pub index: u32,
    /// Boolean expression (with or without a leading `=`)
    pub formula: String,
    pub error_message: String,
    /// Sheet the formula's unqualified references belong to
    pub sheet: SheetId,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregation_method_from_str() {
        assert_eq!("SUM".parse::<AggregationMethod>().unwrap(), AggregationMethod::Sum);
        assert_eq!("avg".parse::<AggregationMethod>().unwrap(), AggregationMethod::Avg);
        assert!("median".parse::<AggregationMethod>().is_err());
    }

    #[test]
    fn test_cell_json() {
        let cell: Cell =
            serde_json::from_str(r#"{"sheet": 1, "address": "C1", "formula": "=A1+B1"}"#).unwrap();
        assert_eq!(cell.address, CellAddress::new(0, 2));
        assert_eq!(cell.kind, CellKind::Numeric);
        assert_eq!(cell.default, CellValue::Empty);
        assert!(cell.aggregation.is_none());
    }
}
