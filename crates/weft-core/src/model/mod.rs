// Canonical in-memory process description.
// The three descriptor sources (CWL, WPS 1.0 XML, OGC API JSON) each parse
// into these tagged variants; merge.rs unifies them, render.rs writes the
// wire forms back out.

pub mod cwl_io;
pub mod formats;
pub mod merge;
pub mod ogc_io;
pub mod render;
pub mod wps_io;

use semver::Version;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use weft_contracts::{JobControlOption, Metadata, ProcessKind, TransmissionMode, Visibility};

use crate::error::{Error, Result};

/// Literal data types accepted by literal I/O.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LiteralType {
    String,
    Integer,
    Float,
    Boolean,
    DateTime,
}

impl LiteralType {
    /// Whether `value` inhabits this type. Integers inhabit Float as well.
    pub fn accepts(self, value: &Value) -> bool {
        match self {
            LiteralType::String => value.is_string(),
            LiteralType::Integer => value.is_i64() || value.is_u64(),
            LiteralType::Float => value.is_number(),
            LiteralType::Boolean => value.is_boolean(),
            LiteralType::DateTime => value
                .as_str()
                .map(|s| chrono::DateTime::parse_from_rfc3339(s).is_ok())
                .unwrap_or(false),
        }
    }

    /// More constrained of two compatible types, or None on contradiction.
    pub fn most_constrained(self, other: LiteralType) -> Option<LiteralType> {
        use LiteralType::*;
        match (self, other) {
            (a, b) if a == b => Some(a),
            (Integer, Float) | (Float, Integer) => Some(Integer),
            (DateTime, String) | (String, DateTime) => Some(DateTime),
            _ => None,
        }
    }

    pub fn ogc_name(self) -> &'static str {
        match self {
            LiteralType::String => "string",
            LiteralType::Integer => "integer",
            LiteralType::Float => "number",
            LiteralType::Boolean => "boolean",
            LiteralType::DateTime => "dateTime",
        }
    }
}

/// Upper occurrence bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Occurrence {
    Finite(u32),
    Unbounded,
}

impl Occurrence {
    pub fn at_least(self, n: u32) -> bool {
        match self {
            Occurrence::Finite(max) => max >= n,
            Occurrence::Unbounded => true,
        }
    }

    /// Larger of two bounds; unbounded absorbs everything.
    pub fn widest(self, other: Occurrence) -> Occurrence {
        match (self, other) {
            (Occurrence::Unbounded, _) | (_, Occurrence::Unbounded) => Occurrence::Unbounded,
            (Occurrence::Finite(a), Occurrence::Finite(b)) => Occurrence::Finite(a.max(b)),
        }
    }
}

impl std::fmt::Display for Occurrence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Occurrence::Finite(n) => write!(f, "{}", n),
            Occurrence::Unbounded => write!(f, "unbounded"),
        }
    }
}

/// One allowed format for complex I/O. The media type string preserves its
/// full parameter set (e.g. `image/tiff; application=geotiff`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Format {
    pub media_type: String,
    #[serde(default)]
    pub default: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub maximum_megabytes: Option<u32>,
}

impl Format {
    pub fn new(media_type: impl Into<String>) -> Self {
        Self {
            media_type: media_type.into(),
            default: false,
            schema: None,
            encoding: None,
            maximum_megabytes: None,
        }
    }

    pub fn as_default(mut self) -> Self {
        self.default = true;
        self
    }
}

/// Closed or open numeric range constraint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllowedRange {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub minimum: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub maximum: Option<f64>,
    #[serde(default)]
    pub exclusive_minimum: bool,
    #[serde(default)]
    pub exclusive_maximum: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spacing: Option<f64>,
}

impl AllowedRange {
    pub fn contains(&self, v: f64) -> bool {
        if let Some(min) = self.minimum {
            if v < min || (self.exclusive_minimum && v == min) {
                return false;
            }
        }
        if let Some(max) = self.maximum {
            if v > max || (self.exclusive_maximum && v == max) {
                return false;
            }
        }
        true
    }
}

/// Value domain of a literal I/O.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LiteralDomain {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_type: Option<LiteralType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_value: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uom: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_values: Vec<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_ranges: Vec<AllowedRange>,
    /// Explicit AnyValue marker from WPS.
    #[serde(default)]
    pub any_value: bool,
}

impl LiteralDomain {
    /// Whether `value` satisfies this domain's constraints.
    pub fn accepts(&self, value: &Value) -> bool {
        if let Some(dt) = self.data_type {
            if !dt.accepts(value) {
                return false;
            }
        }
        if !self.allowed_values.is_empty() && !self.allowed_values.contains(value) {
            return false;
        }
        if !self.allowed_ranges.is_empty() {
            let Some(n) = value.as_f64() else {
                return false;
            };
            if !self.allowed_ranges.iter().any(|r| r.contains(n)) {
                return false;
            }
        }
        true
    }
}

/// The type of an I/O descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum IoType {
    Literal(LiteralType),
    /// File or directory with an ordered format list on the descriptor.
    Complex { directory: bool },
    BoundingBox { supported_crs: Vec<String> },
    Enum { values: Vec<String> },
}

impl IoType {
    pub fn is_complex(&self) -> bool {
        matches!(self, IoType::Complex { .. })
    }
}

/// Canonical descriptor for a single input or output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IoDescriptor {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub io_type: IoType,
    pub min_occurs: u32,
    pub max_occurs: Occurrence,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub formats: Vec<Format>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub domains: Vec<LiteralDomain>,
    /// Referenced JSON schema, when the OGC form supplied one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema_ref: Option<String>,
}

impl IoDescriptor {
    pub fn new(id: impl Into<String>, io_type: IoType) -> Self {
        Self {
            id: id.into(),
            title: None,
            description: None,
            io_type,
            min_occurs: 1,
            max_occurs: Occurrence::Finite(1),
            default: None,
            formats: Vec::new(),
            domains: Vec::new(),
            schema_ref: None,
        }
    }

    pub fn optional(&self) -> bool {
        self.min_occurs == 0
    }

    pub fn array(&self) -> bool {
        self.max_occurs.at_least(2)
    }

    /// Default format, when one is marked.
    pub fn default_format(&self) -> Option<&Format> {
        self.formats.iter().find(|f| f.default)
    }

    /// Validate descriptor invariants. `output` enables output-only rules.
    pub fn validate(&self, output: bool) -> Result<()> {
        if let Occurrence::Finite(max) = self.max_occurs {
            if self.min_occurs > max {
                return Err(Error::schema(format!(
                    "'{}': minOccurs {} exceeds maxOccurs {}",
                    self.id, self.min_occurs, max
                )));
            }
            if max == 0 {
                return Err(Error::schema(format!("'{}': maxOccurs must be >= 1", self.id)));
            }
        }
        let defaults = self.formats.iter().filter(|f| f.default).count();
        if defaults > 1 {
            return Err(Error::schema(format!(
                "'{}': {} formats marked default, at most one allowed",
                self.id, defaults
            )));
        }
        if output && self.io_type.is_complex() && self.formats.is_empty() {
            return Err(Error::schema(format!(
                "'{}': complex output requires at least one format",
                self.id
            )));
        }
        if let Some(default) = &self.default {
            if self.min_occurs != 0 {
                return Err(Error::schema(format!(
                    "'{}': default value requires minOccurs = 0",
                    self.id
                )));
            }
            if let IoType::Literal(dt) = self.io_type {
                if !dt.accepts(default) {
                    return Err(Error::schema(format!(
                        "'{}': default {} does not satisfy type {:?}",
                        self.id, default, dt
                    )));
                }
            }
            for domain in &self.domains {
                if !domain.accepts(default) {
                    return Err(Error::schema(format!(
                        "'{}': default {} outside literal domain",
                        self.id, default
                    )));
                }
            }
        }
        if let IoType::Enum { values } = &self.io_type {
            if values.is_empty() {
                return Err(Error::schema(format!("'{}': enum with no symbols", self.id)));
            }
        }
        Ok(())
    }

    /// Ensure exactly one default format when any format exists: keep the
    /// first explicit default, else promote the first entry.
    pub fn normalise_default_format(&mut self) {
        if self.formats.is_empty() {
            return;
        }
        if let Some(first_default) = self.formats.iter().position(|f| f.default) {
            for (i, f) in self.formats.iter_mut().enumerate() {
                f.default = i == first_default;
            }
        } else {
            self.formats[0].default = true;
        }
    }
}

/// Canonical process description.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessModel {
    pub id: String,
    pub version: Version,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keywords: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub metadata: Vec<Metadata>,
    pub inputs: Vec<IoDescriptor>,
    pub outputs: Vec<IoDescriptor>,
    pub job_control_options: Vec<JobControlOption>,
    pub output_transmission: Vec<TransmissionMode>,
    pub visibility: Visibility,
    pub kind: ProcessKind,
    pub revision_id: Uuid,
}

impl ProcessModel {
    pub fn new(id: impl Into<String>, kind: ProcessKind) -> Self {
        Self {
            id: id.into(),
            version: Version::new(1, 0, 0),
            title: None,
            description: None,
            keywords: Vec::new(),
            metadata: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            job_control_options: vec![
                JobControlOption::AsyncExecute,
                JobControlOption::SyncExecute,
                JobControlOption::Dismiss,
            ],
            output_transmission: vec![TransmissionMode::Value, TransmissionMode::Reference],
            visibility: Visibility::Private,
            kind,
            revision_id: Uuid::now_v7(),
        }
    }

    pub fn input(&self, id: &str) -> Option<&IoDescriptor> {
        self.inputs.iter().find(|d| d.id == id)
    }

    pub fn output(&self, id: &str) -> Option<&IoDescriptor> {
        self.outputs.iter().find(|d| d.id == id)
    }

    /// Validate the whole model.
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(Error::schema("process id must not be empty"));
        }
        if self.job_control_options.is_empty() {
            return Err(Error::schema("jobControlOptions must not be empty"));
        }
        if self.output_transmission.is_empty() {
            return Err(Error::schema("outputTransmission must not be empty"));
        }
        for input in &self.inputs {
            input.validate(false)?;
        }
        for output in &self.outputs {
            output.validate(true)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn literal_type_accepts() {
        assert!(LiteralType::String.accepts(&json!("x")));
        assert!(LiteralType::Integer.accepts(&json!(3)));
        assert!(!LiteralType::Integer.accepts(&json!(3.5)));
        assert!(LiteralType::Float.accepts(&json!(3)));
        assert!(LiteralType::Boolean.accepts(&json!(true)));
        assert!(LiteralType::DateTime.accepts(&json!("2026-08-01T00:00:00Z")));
        assert!(!LiteralType::DateTime.accepts(&json!("yesterday")));
    }

    #[test]
    fn most_constrained_typing() {
        assert_eq!(
            LiteralType::Integer.most_constrained(LiteralType::Float),
            Some(LiteralType::Integer)
        );
        assert_eq!(
            LiteralType::String.most_constrained(LiteralType::DateTime),
            Some(LiteralType::DateTime)
        );
        assert_eq!(LiteralType::Integer.most_constrained(LiteralType::String), None);
    }

    #[test]
    fn occurrence_widest() {
        assert_eq!(
            Occurrence::Finite(1).widest(Occurrence::Unbounded),
            Occurrence::Unbounded
        );
        assert_eq!(
            Occurrence::Finite(2).widest(Occurrence::Finite(5)),
            Occurrence::Finite(5)
        );
    }

    #[test]
    fn default_requires_min_occurs_zero() {
        let mut desc = IoDescriptor::new("lvl", IoType::Literal(LiteralType::Integer));
        desc.default = Some(json!(3));
        assert!(desc.validate(false).is_err());
        desc.min_occurs = 0;
        assert!(desc.validate(false).is_ok());
    }

    #[test]
    fn default_must_satisfy_domain() {
        let mut desc = IoDescriptor::new("lvl", IoType::Literal(LiteralType::Integer));
        desc.min_occurs = 0;
        desc.default = Some(json!(9));
        desc.domains.push(LiteralDomain {
            allowed_values: vec![json!(1), json!(2), json!(3)],
            ..Default::default()
        });
        assert!(desc.validate(false).is_err());
        desc.default = Some(json!(2));
        assert!(desc.validate(false).is_ok());
    }

    #[test]
    fn at_most_one_default_format() {
        let mut desc = IoDescriptor::new("data", IoType::Complex { directory: false });
        desc.formats = vec![
            Format::new("application/json").as_default(),
            Format::new("text/plain").as_default(),
        ];
        assert!(desc.validate(false).is_err());
    }

    #[test]
    fn complex_output_needs_a_format() {
        let desc = IoDescriptor::new("out", IoType::Complex { directory: false });
        assert!(desc.validate(true).is_err());
        assert!(desc.validate(false).is_ok());
    }

    #[test]
    fn normalise_promotes_first_format() {
        let mut desc = IoDescriptor::new("data", IoType::Complex { directory: false });
        desc.formats = vec![Format::new("application/json"), Format::new("text/plain")];
        desc.normalise_default_format();
        assert!(desc.formats[0].default);
        assert!(!desc.formats[1].default);
    }

    #[test]
    fn allowed_range_bounds() {
        let range = AllowedRange {
            minimum: Some(0.0),
            maximum: Some(10.0),
            exclusive_minimum: false,
            exclusive_maximum: true,
            spacing: None,
        };
        assert!(range.contains(0.0));
        assert!(range.contains(9.9));
        assert!(!range.contains(10.0));
        assert!(!range.contains(-0.1));
    }

    #[test]
    fn model_requires_nonempty_control_options() {
        let mut model = ProcessModel::new("echo", ProcessKind::Application);
        assert!(model.validate().is_ok());
        model.job_control_options.clear();
        assert!(model.validate().is_err());
    }
}
