// OGC API - Processes JSON parsing: per-I/O OpenAPI `schema` objects (plus
// the legacy list form with `formats`/`literalDataDomains`) into canonical
// descriptors.

use serde_json::Value;

use super::formats::normalise_media_type;
use super::{
    AllowedRange, Format, IoDescriptor, IoType, LiteralDomain, LiteralType, Occurrence,
};
use crate::error::{Error, Result};

fn literal_of_schema(schema: &Value) -> Option<LiteralType> {
    let type_name = schema.get("type").and_then(Value::as_str)?;
    match type_name {
        "string" => match schema.get("format").and_then(Value::as_str) {
            Some("date-time") | Some("dateTime") => Some(LiteralType::DateTime),
            Some("uri") | Some("binary") | Some("byte") => None,
            _ => Some(LiteralType::String),
        },
        "integer" => Some(LiteralType::Integer),
        "number" => Some(LiteralType::Float),
        "boolean" => Some(LiteralType::Boolean),
        _ => None,
    }
}

/// Collect complex formats from a schema alternative.
fn format_of_schema(schema: &Value) -> Option<Format> {
    let media_type = schema.get("contentMediaType").and_then(Value::as_str)?;
    let mut format = Format::new(normalise_media_type(media_type));
    format.encoding = schema
        .get("contentEncoding")
        .and_then(Value::as_str)
        .map(String::from);
    format.schema = schema
        .get("contentSchema")
        .and_then(Value::as_str)
        .map(String::from);
    Some(format)
}

struct SchemaShape {
    io_type: IoType,
    formats: Vec<Format>,
    array: bool,
    nullable: bool,
    schema_ref: Option<String>,
}

fn parse_schema(id: &str, schema: &Value) -> Result<SchemaShape> {
    // $ref-only schemas are kept as opaque references
    if let Some(reference) = schema.get("$ref").and_then(Value::as_str) {
        return Ok(SchemaShape {
            io_type: IoType::Complex { directory: false },
            formats: Vec::new(),
            array: false,
            nullable: false,
            schema_ref: Some(reference.to_string()),
        });
    }

    if let Some(variants) = schema.get("oneOf").and_then(Value::as_array) {
        // union of qualified representations; complex when any alternative
        // names a media type
        let mut formats = Vec::new();
        let mut literal = None;
        for variant in variants {
            if let Some(format) = format_of_schema(variant) {
                formats.push(format);
            } else if literal.is_none() {
                literal = literal_of_schema(variant);
            }
        }
        if !formats.is_empty() {
            return Ok(SchemaShape {
                io_type: IoType::Complex { directory: false },
                formats,
                array: false,
                nullable: false,
                schema_ref: None,
            });
        }
        if let Some(lit) = literal {
            return Ok(SchemaShape {
                io_type: IoType::Literal(lit),
                formats: Vec::new(),
                array: false,
                nullable: false,
                schema_ref: None,
            });
        }
        return Err(Error::schema(format!("'{}': oneOf with no usable variant", id)));
    }

    if let Some(symbols) = schema.get("enum").and_then(Value::as_array) {
        let values = symbols
            .iter()
            .map(|v| match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect();
        return Ok(SchemaShape {
            io_type: IoType::Enum { values },
            formats: Vec::new(),
            array: false,
            nullable: false,
            schema_ref: None,
        });
    }

    match schema.get("type").and_then(Value::as_str) {
        Some("array") => {
            let items = schema
                .get("items")
                .ok_or_else(|| Error::schema(format!("'{}': array schema without items", id)))?;
            let inner = parse_schema(id, items)?;
            Ok(SchemaShape {
                array: true,
                ..inner
            })
        }
        Some("object") => {
            // bbox object form
            if schema
                .get("properties")
                .map(|p| p.get("bbox").is_some())
                .unwrap_or(false)
            {
                Ok(SchemaShape {
                    io_type: IoType::BoundingBox {
                        supported_crs: Vec::new(),
                    },
                    formats: Vec::new(),
                    array: false,
                    nullable: false,
                    schema_ref: None,
                })
            } else {
                Ok(SchemaShape {
                    io_type: IoType::Complex { directory: false },
                    formats: vec![Format::new("application/json")],
                    array: false,
                    nullable: false,
                    schema_ref: None,
                })
            }
        }
        _ => {
            if let Some(format) = format_of_schema(schema) {
                return Ok(SchemaShape {
                    io_type: IoType::Complex { directory: false },
                    formats: vec![format],
                    array: false,
                    nullable: schema.get("nullable").and_then(Value::as_bool).unwrap_or(false),
                    schema_ref: None,
                });
            }
            if let Some(lit) = literal_of_schema(schema) {
                return Ok(SchemaShape {
                    io_type: IoType::Literal(lit),
                    formats: Vec::new(),
                    array: false,
                    nullable: schema.get("nullable").and_then(Value::as_bool).unwrap_or(false),
                    schema_ref: None,
                });
            }
            // string/uri and string/binary land here: complex without a
            // declared media type
            if schema.get("type").and_then(Value::as_str) == Some("string") {
                return Ok(SchemaShape {
                    io_type: IoType::Complex { directory: false },
                    formats: Vec::new(),
                    array: false,
                    nullable: false,
                    schema_ref: None,
                });
            }
            Err(Error::schema(format!("'{}': unsupported schema shape", id)))
        }
    }
}

fn parse_domains(value: Option<&Value>) -> Vec<LiteralDomain> {
    let Some(Value::Array(list)) = value else {
        return Vec::new();
    };
    list.iter()
        .map(|entry| {
            let data_type = entry
                .get("dataType")
                .and_then(|dt| {
                    dt.as_str()
                        .or_else(|| dt.get("name").and_then(Value::as_str))
                })
                .and_then(|name| match name {
                    "string" => Some(LiteralType::String),
                    "integer" | "int" => Some(LiteralType::Integer),
                    "float" | "double" | "number" => Some(LiteralType::Float),
                    "boolean" | "bool" => Some(LiteralType::Boolean),
                    "dateTime" | "date-time" => Some(LiteralType::DateTime),
                    _ => None,
                });
            let definition = entry.get("valueDefinition");
            let allowed_values = definition
                .and_then(|d| d.get("allowedValues"))
                .or_else(|| entry.get("allowedValues"))
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            let allowed_ranges = definition
                .and_then(|d| d.get("allowedRanges"))
                .or_else(|| entry.get("allowedRanges"))
                .and_then(Value::as_array)
                .map(|ranges| {
                    ranges
                        .iter()
                        .map(|r| AllowedRange {
                            minimum: r.get("minimumValue").and_then(value_as_f64),
                            maximum: r.get("maximumValue").and_then(value_as_f64),
                            exclusive_minimum: false,
                            exclusive_maximum: false,
                            spacing: r.get("spacing").and_then(value_as_f64),
                        })
                        .collect()
                })
                .unwrap_or_default();
            LiteralDomain {
                data_type,
                default_value: entry.get("defaultValue").cloned(),
                uom: entry
                    .get("uom")
                    .and_then(|u| u.as_str().or_else(|| u.get("uom").and_then(Value::as_str)))
                    .map(String::from),
                allowed_values,
                allowed_ranges,
                any_value: definition
                    .and_then(|d| d.get("anyValue"))
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
            }
        })
        .collect()
}

fn value_as_f64(v: &Value) -> Option<f64> {
    v.as_f64().or_else(|| v.as_str().and_then(|s| s.parse().ok()))
}

/// Legacy `formats` list entries ({mimeType|mediaType, default, …}).
fn parse_legacy_formats(value: Option<&Value>) -> Vec<Format> {
    let Some(Value::Array(list)) = value else {
        return Vec::new();
    };
    list.iter()
        .filter_map(|entry| {
            let media_type = entry
                .get("mediaType")
                .or_else(|| entry.get("mimeType"))
                .and_then(Value::as_str)?;
            Some(Format {
                media_type: normalise_media_type(media_type),
                default: entry.get("default").and_then(Value::as_bool).unwrap_or(false),
                schema: entry.get("schema").and_then(Value::as_str).map(String::from),
                encoding: entry.get("encoding").and_then(Value::as_str).map(String::from),
                maximum_megabytes: entry
                    .get("maximumMegabytes")
                    .and_then(Value::as_u64)
                    .map(|v| v as u32),
            })
        })
        .collect()
}

fn parse_occurs(value: Option<&Value>) -> Option<Occurrence> {
    match value? {
        Value::String(s) if s == "unbounded" => Some(Occurrence::Unbounded),
        Value::String(s) => s.parse().ok().map(Occurrence::Finite),
        Value::Number(n) => n.as_u64().map(|v| Occurrence::Finite(v as u32)),
        _ => None,
    }
}

fn descriptor_from_entry(id: &str, entry: &Value, output: bool) -> Result<IoDescriptor> {
    let legacy_formats = parse_legacy_formats(entry.get("formats"));
    let domains = parse_domains(entry.get("literalDataDomains"));

    let shape = if let Some(schema) = entry.get("schema") {
        Some(parse_schema(id, schema)?)
    } else {
        None
    };

    let io_type = match &shape {
        Some(s) => s.io_type.clone(),
        None if !legacy_formats.is_empty() => IoType::Complex { directory: false },
        None => IoType::Literal(
            domains
                .first()
                .and_then(|d| d.data_type)
                .unwrap_or(LiteralType::String),
        ),
    };

    let mut desc = IoDescriptor::new(id, io_type);
    desc.title = entry.get("title").and_then(Value::as_str).map(String::from);
    desc.description = entry
        .get("description")
        .and_then(Value::as_str)
        .map(String::from);

    if let Some(shape) = shape {
        desc.formats = shape.formats;
        desc.schema_ref = shape.schema_ref;
        if shape.array {
            desc.max_occurs = Occurrence::Unbounded;
        }
        if shape.nullable {
            desc.min_occurs = 0;
        }
    }
    for format in legacy_formats {
        if !desc
            .formats
            .iter()
            .any(|f| normalise_media_type(&f.media_type) == normalise_media_type(&format.media_type))
        {
            desc.formats.push(format);
        }
    }

    if let Some(min) = entry.get("minOccurs").and_then(Value::as_u64) {
        desc.min_occurs = min as u32;
    } else if let Some(min) = entry.get("minOccurs").and_then(Value::as_str) {
        desc.min_occurs = min.parse().unwrap_or(desc.min_occurs);
    }
    if let Some(max) = parse_occurs(entry.get("maxOccurs")) {
        desc.max_occurs = max;
    }

    if let Some(domain) = domains.first() {
        if let Some(default) = domain.default_value.clone() {
            desc.default = Some(default);
            desc.min_occurs = 0;
        }
    }
    desc.domains = domains;
    if output && desc.io_type.is_complex() && desc.formats.is_empty() {
        desc.formats.push(Format::new("application/octet-stream"));
    }
    desc.normalise_default_format();
    Ok(desc)
}

/// Parse an OGC API inputs/outputs section (mapping or legacy list form).
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
                    .ok_or_else(|| Error::schema("legacy I/O entry without id"))?;
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
    fn literal_schema() {
        let descs = parse_io_section(
            &json!({"level": {"schema": {"type": "integer"}, "minOccurs": 0}}),
            false,
        )
        .unwrap();
        assert_eq!(descs[0].io_type, IoType::Literal(LiteralType::Integer));
        assert_eq!(descs[0].min_occurs, 0);
    }

    #[test]
    fn array_schema_widens_occurrence() {
        let descs = parse_io_section(
            &json!({"files": {"schema": {
                "type": "array",
                "items": {"type": "string", "contentMediaType": "application/x-netcdf"}
            }}}),
            false,
        )
        .unwrap();
        assert_eq!(descs[0].max_occurs, Occurrence::Unbounded);
        assert_eq!(descs[0].formats[0].media_type, "application/x-netcdf");
    }

    #[test]
    fn one_of_unions_formats() {
        let descs = parse_io_section(
            &json!({"data": {"schema": {"oneOf": [
                {"type": "string", "contentMediaType": "application/json"},
                {"type": "string", "contentMediaType": "application/x-yaml"}
            ]}}}),
            false,
        )
        .unwrap();
        assert_eq!(descs[0].formats.len(), 2);
        assert!(descs[0].formats[0].default);
    }

    #[test]
    fn enum_schema() {
        let descs = parse_io_section(
            &json!({"method": {"schema": {"type": "string", "enum": ["nearest", "bilinear"]}}}),
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
    fn legacy_list_form_with_domains() {
        let descs = parse_io_section(
            &json!([{
                "id": "level",
                "minOccurs": "0",
                "maxOccurs": "1",
                "literalDataDomains": [{
                    "dataType": {"name": "integer"},
                    "defaultValue": 1,
                    "valueDefinition": {"allowedValues": [1, 2, 3]}
                }]
            }]),
            false,
        )
        .unwrap();
        assert_eq!(descs[0].io_type, IoType::Literal(LiteralType::Integer));
        assert_eq!(descs[0].default, Some(json!(1)));
        assert_eq!(descs[0].min_occurs, 0);
        assert_eq!(descs[0].domains[0].allowed_values, vec![json!(1), json!(2), json!(3)]);
    }

    #[test]
    fn legacy_formats_merge_into_schema_formats() {
        let descs = parse_io_section(
            &json!({"data": {
                "schema": {"type": "string", "contentMediaType": "application/json"},
                "formats": [
                    {"mimeType": "application/json", "default": true},
                    {"mimeType": "text/plain"}
                ]
            }}),
            false,
        )
        .unwrap();
        // deduplicated by normalised media type
        assert_eq!(descs[0].formats.len(), 2);
    }

    #[test]
    fn maximum_megabytes_preserved() {
        let descs = parse_io_section(
            &json!([{
                "id": "data",
                "formats": [{"mimeType": "application/x-netcdf", "maximumMegabytes": 100}]
            }]),
            false,
        )
        .unwrap();
        assert_eq!(descs[0].formats[0].maximum_megabytes, Some(100));
    }
}
