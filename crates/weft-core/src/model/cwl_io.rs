// CWL I/O parsing: algebraic CWL types into canonical descriptors.
// Nullability (`T?`, ["null", T]) lowers minOccurs to 0; arrays widen
// maxOccurs to unbounded.

use serde_json::{Map, Value};

use super::formats::resolve_format_reference;
use super::{Format, IoDescriptor, IoType, LiteralType, Occurrence};
use crate::error::{Error, Result};

/// Outcome of unwrapping a CWL type expression.
#[derive(Debug, Clone, PartialEq)]
struct CwlType {
    io_type: IoType,
    nullable: bool,
    array: bool,
}

fn literal_of(name: &str) -> Option<LiteralType> {
    match name {
        "string" => Some(LiteralType::String),
        "int" | "long" => Some(LiteralType::Integer),
        "float" | "double" => Some(LiteralType::Float),
        "boolean" => Some(LiteralType::Boolean),
        _ => None,
    }
}

/// Unwrap a CWL type expression in any of its accepted shapes.
fn parse_type(id: &str, expr: &Value) -> Result<CwlType> {
    match expr {
        Value::String(s) => parse_type_name(id, s),
        Value::Array(options) => {
            // union form; only ["null", T] is supported
            let mut nullable = false;
            let mut inner = None;
            for option in options {
                if option.as_str() == Some("null") {
                    nullable = true;
                } else if inner.is_none() {
                    inner = Some(parse_type(id, option)?);
                } else {
                    return Err(Error::schema(format!(
                        "'{}': union types beyond [null, T] are not supported",
                        id
                    )));
                }
            }
            let mut inner = inner
                .ok_or_else(|| Error::schema(format!("'{}': union type with no member", id)))?;
            inner.nullable |= nullable;
            Ok(inner)
        }
        Value::Object(obj) => {
            match obj.get("type").and_then(Value::as_str) {
                Some("array") => {
                    let items = obj
                        .get("items")
                        .ok_or_else(|| Error::schema(format!("'{}': array without items", id)))?;
                    let inner = parse_type(id, items)?;
                    Ok(CwlType {
                        array: true,
                        ..inner
                    })
                }
                Some("enum") => {
                    let values = obj
                        .get("symbols")
                        .and_then(Value::as_array)
                        .map(|syms| {
                            syms.iter()
                                .filter_map(Value::as_str)
                                // symbols may be namespaced file#symbol references
                                .map(|s| s.rsplit('/').next().unwrap_or(s).to_string())
                                .collect::<Vec<_>>()
                        })
                        .unwrap_or_default();
                    Ok(CwlType {
                        io_type: IoType::Enum { values },
                        nullable: false,
                        array: false,
                    })
                }
                Some(other) => parse_type_name(id, other),
                None => Err(Error::schema(format!("'{}': type object without type", id))),
            }
        }
        _ => Err(Error::schema(format!("'{}': unsupported type expression", id))),
    }
}

fn parse_type_name(id: &str, name: &str) -> Result<CwlType> {
    let mut name = name;
    let mut nullable = false;
    let mut array = false;
    if let Some(stripped) = name.strip_suffix('?') {
        nullable = true;
        name = stripped;
    }
    if let Some(stripped) = name.strip_suffix("[]") {
        array = true;
        name = stripped;
    }
    let io_type = if name == "File" || name == "stdout" || name == "stderr" {
        IoType::Complex { directory: false }
    } else if name == "Directory" {
        IoType::Complex { directory: true }
    } else if let Some(lit) = literal_of(name) {
        IoType::Literal(lit)
    } else {
        return Err(Error::schema(format!("'{}': unknown CWL type '{}'", id, name)));
    };
    Ok(CwlType {
        io_type,
        nullable,
        array,
    })
}

/// Formats from the CWL `format` field (single URI or list).
fn parse_formats(expr: Option<&Value>) -> Vec<Format> {
    let mut formats = Vec::new();
    let mut push = |reference: &str| {
        if let Some(media_type) = resolve_format_reference(reference) {
            formats.push(Format::new(media_type));
        }
    };
    match expr {
        Some(Value::String(s)) => push(s),
        Some(Value::Array(list)) => {
            for entry in list.iter().filter_map(Value::as_str) {
                push(entry);
            }
        }
        _ => {}
    }
    formats
}

fn descriptor_from_entry(id: &str, entry: &Value, output: bool) -> Result<IoDescriptor> {
    // shorthand: the entry may be the bare type expression
    let (type_expr, obj): (&Value, Option<&Map<String, Value>>) = match entry {
        Value::Object(obj) if obj.contains_key("type") => (&obj["type"], Some(obj)),
        other => (other, None),
    };

    let parsed = parse_type(id, type_expr)?;
    let mut desc = IoDescriptor::new(id, parsed.io_type);

    if parsed.array {
        desc.max_occurs = Occurrence::Unbounded;
    }
    if parsed.nullable {
        desc.min_occurs = 0;
    }

    if let Some(obj) = obj {
        desc.title = obj.get("label").and_then(Value::as_str).map(String::from);
        desc.description = obj.get("doc").and_then(Value::as_str).map(String::from);
        desc.formats = parse_formats(obj.get("format"));
        if !output {
            if let Some(default) = obj.get("default") {
                desc.default = Some(default.clone());
                desc.min_occurs = 0;
            }
        }
    }
    if output && desc.io_type.is_complex() && desc.formats.is_empty() {
        // collection falls back to the generic type until merged with
        // another source that knows better
        desc.formats.push(Format::new("application/octet-stream"));
    }
    desc.normalise_default_format();
    Ok(desc)
}

/// Parse a CWL `inputs`/`outputs` section (mapping or list form).
pub fn parse_io_section(section: &Value, output: bool) -> Result<Vec<IoDescriptor>> {
    let mut descriptors = Vec::new();
    match section {
        Value::Object(map) => {
            for (id, entry) in map {
                descriptors.push(descriptor_from_entry(id, entry, output)?);
            }
        }
        Value::Array(list) => {
            for entry in list {
                let id = entry
                    .get("id")
                    .and_then(Value::as_str)
                    .ok_or_else(|| Error::schema("list-form I/O entry without id"))?;
                // strip any leading #step/ fragment
                let id = id.rsplit('/').next().unwrap_or(id);
                descriptors.push(descriptor_from_entry(id, entry, output)?);
            }
        }
        Value::Null => {}
        _ => return Err(Error::schema("I/O section must be a mapping or list")),
    }
    Ok(descriptors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn shorthand_string_type() {
        let descs = parse_io_section(&json!({"message": "string"}), false).unwrap();
        assert_eq!(descs.len(), 1);
        assert_eq!(descs[0].io_type, IoType::Literal(LiteralType::String));
        assert_eq!(descs[0].min_occurs, 1);
    }

    #[test]
    fn nullable_lowers_min_occurs() {
        let descs = parse_io_section(&json!({"level": "int?"}), false).unwrap();
        assert_eq!(descs[0].min_occurs, 0);
        assert_eq!(descs[0].io_type, IoType::Literal(LiteralType::Integer));

        let descs =
            parse_io_section(&json!({"level": {"type": ["null", "int"]}}), false).unwrap();
        assert_eq!(descs[0].min_occurs, 0);
    }

    #[test]
    fn array_widens_max_occurs() {
        let descs = parse_io_section(&json!({"files": "File[]"}), false).unwrap();
        assert_eq!(descs[0].max_occurs, Occurrence::Unbounded);
        assert_eq!(descs[0].io_type, IoType::Complex { directory: false });

        let descs = parse_io_section(
            &json!({"files": {"type": {"type": "array", "items": "File"}}}),
            false,
        )
        .unwrap();
        assert_eq!(descs[0].max_occurs, Occurrence::Unbounded);
    }

    #[test]
    fn default_makes_input_optional() {
        let descs =
            parse_io_section(&json!({"level": {"type": "int", "default": 3}}), false).unwrap();
        assert_eq!(descs[0].min_occurs, 0);
        assert_eq!(descs[0].default, Some(json!(3)));
    }

    #[test]
    fn edam_format_resolves_to_media_type() {
        let descs = parse_io_section(
            &json!({"data": {
                "type": "File",
                "format": "http://edamontology.org/format_3650"
            }}),
            false,
        )
        .unwrap();
        assert_eq!(descs[0].formats[0].media_type, "application/x-netcdf");
        assert!(descs[0].formats[0].default);
    }

    #[test]
    fn enum_symbols_are_stripped_of_namespaces() {
        let descs = parse_io_section(
            &json!({"method": {"type": {
                "type": "enum",
                "symbols": ["#methods/nearest", "#methods/bilinear"]
            }}}),
            false,
        )
        .unwrap();
        assert_eq!(
            descs[0].io_type,
            IoType::Enum {
                values: vec!["nearest".into(), "bilinear".into()]
            }
        );
    }

    #[test]
    fn complex_output_gets_fallback_format() {
        let descs = parse_io_section(&json!({"out": {"type": "File"}}), true).unwrap();
        assert_eq!(descs[0].formats[0].media_type, "application/octet-stream");
    }

    #[test]
    fn list_form_strips_fragments() {
        let descs = parse_io_section(
            &json!([{"id": "#main/message", "type": "string"}]),
            false,
        )
        .unwrap();
        assert_eq!(descs[0].id, "message");
    }

    #[test]
    fn contradictory_union_rejected() {
        let err = parse_io_section(&json!({"x": {"type": ["int", "string"]}}), false);
        assert!(err.is_err());
    }
}
