//! Typed PLC values and their text representation.
//!
//! Tag values are persisted as text so one column can hold every data type.
//! `PlcValue` is the typed form used while polling.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Declared PLC data type of a tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DataType {
    Bool,
    Int,
    Dint,
    Real,
    Lreal,
    String,
}

/// Length of a TwinCAT `STRING` without an explicit size, including the terminator.
pub const DEFAULT_STRING_LEN: usize = 81;

impl DataType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Bool => "BOOL",
            DataType::Int => "INT",
            DataType::Dint => "DINT",
            DataType::Real => "REAL",
            DataType::Lreal => "LREAL",
            DataType::String => "STRING",
        }
    }

    /// Size in bytes of the value in PLC memory.
    pub fn byte_size(&self) -> usize {
        match self {
            DataType::Bool => 1,
            DataType::Int => 2,
            DataType::Dint | DataType::Real => 4,
            DataType::Lreal => 8,
            DataType::String => DEFAULT_STRING_LEN,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "BOOL" => Ok(DataType::Bool),
            "INT" => Ok(DataType::Int),
            "DINT" => Ok(DataType::Dint),
            "REAL" => Ok(DataType::Real),
            "LREAL" => Ok(DataType::Lreal),
            "STRING" => Ok(DataType::String),
            other => Err(format!("unsupported data type: {}", other)),
        }
    }
}

/// A value read from a PLC.
#[derive(Debug, Clone, PartialEq)]
pub enum PlcValue {
    Bool(bool),
    Int(i64),
    Real(f64),
    Text(String),
}

impl PlcValue {
    /// Text form stored in `last_value` and history rows.
    pub fn to_text(&self) -> String {
        match self {
            PlcValue::Bool(b) => b.to_string(),
            PlcValue::Int(i) => i.to_string(),
            PlcValue::Real(r) => r.to_string(),
            PlcValue::Text(s) => s.clone(),
        }
    }

    /// Parse a stored text value according to the declared data type.
    pub fn parse(text: &str, data_type: DataType) -> Option<PlcValue> {
        match data_type {
            DataType::Bool => match text.trim().to_ascii_lowercase().as_str() {
                "true" | "1" => Some(PlcValue::Bool(true)),
                "false" | "0" => Some(PlcValue::Bool(false)),
                _ => None,
            },
            DataType::Int | DataType::Dint => text.trim().parse().ok().map(PlcValue::Int),
            DataType::Real | DataType::Lreal => text.trim().parse().ok().map(PlcValue::Real),
            DataType::String => Some(PlcValue::Text(text.to_string())),
        }
    }

    /// Whether the value counts as "true" for alarm policies.
    pub fn is_truthy(&self) -> bool {
        match self {
            PlcValue::Bool(b) => *b,
            PlcValue::Int(i) => *i != 0,
            PlcValue::Real(r) => *r != 0.0,
            PlcValue::Text(s) => {
                let s = s.trim();
                !s.is_empty() && !s.eq_ignore_ascii_case("false") && s != "0"
            }
        }
    }

    /// Typed equality. Floats compare with a relative epsilon.
    pub fn same_as(&self, other: &PlcValue, epsilon: f64) -> bool {
        match (self, other) {
            (PlcValue::Real(a), PlcValue::Real(b)) => {
                let scale = 1.0_f64.max(a.abs()).max(b.abs());
                (a - b).abs() <= epsilon * scale
            }
            (a, b) => a == b,
        }
    }
}

impl fmt::Display for PlcValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_text())
    }
}

/// Alarm severity configured per tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "info" | "low" => Ok(Severity::Info),
            "warning" | "medium" => Ok(Severity::Warning),
            "critical" | "high" => Ok(Severity::Critical),
            other => Err(format!("unsupported severity: {}", other)),
        }
    }
}
