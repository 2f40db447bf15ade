// Wire renderings of the canonical model: OGC API mapping form, legacy list
// form, and the WPS 1.0 ProcessDescription XML.

use quick_xml::events::{BytesDecl, BytesText, Event};
use quick_xml::Writer;
use serde_json::{json, Map, Value};

use weft_contracts::{ProcessSummary, TransmissionMode};

use super::{IoDescriptor, IoType, LiteralDomain, Occurrence, ProcessModel};
use crate::error::{Error, Result};

fn occurs_value(occurs: Occurrence) -> Value {
    match occurs {
        Occurrence::Finite(n) => json!(n),
        Occurrence::Unbounded => json!("unbounded"),
    }
}

fn domain_value(domain: &LiteralDomain) -> Value {
    let mut out = Map::new();
    if let Some(dt) = domain.data_type {
        out.insert("dataType".into(), json!({ "name": dt.ogc_name() }));
    }
    if let Some(default) = &domain.default_value {
        out.insert("defaultValue".into(), default.clone());
    }
    if let Some(uom) = &domain.uom {
        out.insert("uom".into(), json!(uom));
    }
    let mut definition = Map::new();
    if !domain.allowed_values.is_empty() {
        definition.insert("allowedValues".into(), json!(domain.allowed_values));
    }
    if !domain.allowed_ranges.is_empty() {
        let ranges: Vec<Value> = domain
            .allowed_ranges
            .iter()
            .map(|r| {
                let mut range = Map::new();
                if let Some(min) = r.minimum {
                    range.insert("minimumValue".into(), json!(min));
                }
                if let Some(max) = r.maximum {
                    range.insert("maximumValue".into(), json!(max));
                }
                if let Some(spacing) = r.spacing {
                    range.insert("spacing".into(), json!(spacing));
                }
                Value::Object(range)
            })
            .collect();
        definition.insert("allowedRanges".into(), json!(ranges));
    }
    if domain.any_value {
        definition.insert("anyValue".into(), json!(true));
    }
    if !definition.is_empty() {
        out.insert("valueDefinition".into(), Value::Object(definition));
    }
    Value::Object(out)
}

/// OpenAPI schema for one descriptor.
fn schema_value(descriptor: &IoDescriptor) -> Value {
    match &descriptor.io_type {
        IoType::Literal(lit) => {
            let mut schema = Map::new();
            match lit.ogc_name() {
                "dateTime" => {
                    schema.insert("type".into(), json!("string"));
                    schema.insert("format".into(), json!("date-time"));
                }
                name => {
                    schema.insert("type".into(), json!(name));
                }
            }
            Value::Object(schema)
        }
        IoType::Enum { values } => json!({ "type": "string", "enum": values }),
        IoType::BoundingBox { supported_crs } => json!({
            "type": "object",
            "properties": {
                "bbox": { "type": "array", "items": { "type": "number" } },
                "crs": { "type": "string", "enum": supported_crs }
            },
            "required": ["bbox"]
        }),
        IoType::Complex { .. } => {
            if let Some(reference) = &descriptor.schema_ref {
                return json!({ "$ref": reference });
            }
            let alternatives: Vec<Value> = descriptor
                .formats
                .iter()
                .map(|f| {
                    let mut alt = Map::new();
                    alt.insert("type".into(), json!("string"));
                    alt.insert("contentMediaType".into(), json!(f.media_type));
                    if let Some(encoding) = &f.encoding {
                        alt.insert("contentEncoding".into(), json!(encoding));
                    }
                    if let Some(schema) = &f.schema {
                        alt.insert("contentSchema".into(), json!(schema));
                    }
                    Value::Object(alt)
                })
                .collect();
            match alternatives.len() {
                0 => json!({ "type": "string", "format": "uri" }),
                1 => alternatives.into_iter().next().expect("len checked"),
                _ => json!({ "oneOf": alternatives }),
            }
        }
    }
}

fn formats_value(descriptor: &IoDescriptor) -> Option<Value> {
    if descriptor.formats.is_empty() {
        return None;
    }
    let formats: Vec<Value> = descriptor
        .formats
        .iter()
        .map(|f| {
            let mut out = Map::new();
            out.insert("mediaType".into(), json!(f.media_type));
            if f.default {
                out.insert("default".into(), json!(true));
            }
            if let Some(encoding) = &f.encoding {
                out.insert("encoding".into(), json!(encoding));
            }
            if let Some(schema) = &f.schema {
                out.insert("schema".into(), json!(schema));
            }
            if let Some(mb) = f.maximum_megabytes {
                out.insert("maximumMegabytes".into(), json!(mb));
            }
            Value::Object(out)
        })
        .collect();
    Some(json!(formats))
}

/// One descriptor in the OGC mapping form.
pub fn ogc_io_value(descriptor: &IoDescriptor, output: bool) -> Value {
    let mut out = Map::new();
    if let Some(title) = &descriptor.title {
        out.insert("title".into(), json!(title));
    }
    if let Some(description) = &descriptor.description {
        out.insert("description".into(), json!(description));
    }
    out.insert("schema".into(), schema_value(descriptor));
    if !output {
        out.insert("minOccurs".into(), json!(descriptor.min_occurs));
        out.insert("maxOccurs".into(), occurs_value(descriptor.max_occurs));
    }
    if let Some(formats) = formats_value(descriptor) {
        out.insert("formats".into(), formats);
    }
    if !descriptor.domains.is_empty() {
        let domains: Vec<Value> = descriptor.domains.iter().map(domain_value).collect();
        out.insert("literalDataDomains".into(), json!(domains));
    }
    Value::Object(out)
}

/// OGC mapping form for a whole section.
pub fn ogc_io_map(descriptors: &[IoDescriptor], output: bool) -> Map<String, Value> {
    descriptors
        .iter()
        .map(|d| (d.id.clone(), ogc_io_value(d, output)))
        .collect()
}

/// Legacy list form for a whole section.
pub fn legacy_io_list(descriptors: &[IoDescriptor], output: bool) -> Value {
    let list: Vec<Value> = descriptors
        .iter()
        .map(|d| {
            let mut out = Map::new();
            out.insert("id".into(), json!(d.id));
            if let Some(title) = &d.title {
                out.insert("title".into(), json!(title));
            }
            if let Some(description) = &d.description {
                out.insert("abstract".into(), json!(description));
            }
            if !output {
                out.insert("minOccurs".into(), json!(d.min_occurs.to_string()));
                out.insert("maxOccurs".into(), json!(d.max_occurs.to_string()));
            }
            if let Some(formats) = formats_value(d) {
                out.insert("formats".into(), formats);
            }
            if !d.domains.is_empty() {
                let domains: Vec<Value> = d.domains.iter().map(domain_value).collect();
                out.insert("literalDataDomains".into(), json!(domains));
            }
            if let Some(default) = &d.default {
                out.insert("default".into(), default.clone());
            }
            Value::Object(out)
        })
        .collect();
    json!(list)
}

/// Process summary DTO for listings.
pub fn process_summary(model: &ProcessModel) -> ProcessSummary {
    ProcessSummary {
        id: model.id.clone(),
        version: Some(model.version.to_string()),
        title: model.title.clone(),
        description: model.description.clone(),
        keywords: model.keywords.clone(),
        job_control_options: model.job_control_options.clone(),
        output_transmission: model.output_transmission.clone(),
        kind: Some(model.kind),
        links: Vec::new(),
    }
}

/// Full OGC process description document.
pub fn ogc_description(model: &ProcessModel) -> Value {
    let mut out = serde_json::to_value(process_summary(model))
        .expect("summary serialization is infallible");
    let obj = out.as_object_mut().expect("summary is an object");
    if !model.metadata.is_empty() {
        obj.insert(
            "metadata".into(),
            serde_json::to_value(&model.metadata).expect("metadata serialization is infallible"),
        );
    }
    obj.insert("inputs".into(), Value::Object(ogc_io_map(&model.inputs, false)));
    obj.insert(
        "outputs".into(),
        Value::Object(ogc_io_map(&model.outputs, true)),
    );
    out
}

/// Legacy (pre-mapping) process description document.
pub fn legacy_description(model: &ProcessModel) -> Value {
    json!({
        "process": {
            "id": model.id,
            "version": model.version.to_string(),
            "title": model.title,
            "abstract": model.description,
            "keywords": model.keywords,
            "inputs": legacy_io_list(&model.inputs, false),
            "outputs": legacy_io_list(&model.outputs, true),
            "jobControlOptions": model.job_control_options,
            "outputTransmission": model.output_transmission.iter().map(|t| match t {
                TransmissionMode::Value => "value",
                TransmissionMode::Reference => "reference",
            }).collect::<Vec<_>>(),
            "visibility": model.visibility,
        }
    })
}

fn write_io_xml<W: std::io::Write>(
    writer: &mut Writer<W>,
    descriptor: &IoDescriptor,
    output: bool,
) -> std::result::Result<(), quick_xml::Error> {
    let element = if output { "Output" } else { "Input" };
    let mut start = quick_xml::events::BytesStart::new(element);
    if !output {
        start.push_attribute(("minOccurs", descriptor.min_occurs.to_string().as_str()));
        start.push_attribute(("maxOccurs", descriptor.max_occurs.to_string().as_str()));
    }
    writer.write_event(Event::Start(start))?;

    writer
        .create_element("ows:Identifier")
        .write_text_content(BytesText::new(&descriptor.id))?;
    if let Some(title) = &descriptor.title {
        writer
            .create_element("ows:Title")
            .write_text_content(BytesText::new(title))?;
    }
    if let Some(description) = &descriptor.description {
        writer
            .create_element("ows:Abstract")
            .write_text_content(BytesText::new(description))?;
    }

    match &descriptor.io_type {
        IoType::Literal(lit) => {
            let element = if output { "LiteralOutput" } else { "LiteralData" };
            writer.write_event(Event::Start(quick_xml::events::BytesStart::new(element)))?;
            writer
                .create_element("ows:DataType")
                .with_attribute((
                    "ows:reference",
                    format!("http://www.w3.org/TR/xmlschema-2/#{}", lit.ogc_name()).as_str(),
                ))
                .write_text_content(BytesText::new(lit.ogc_name()))?;
            for domain in &descriptor.domains {
                if !domain.allowed_values.is_empty() {
                    writer.write_event(Event::Start(quick_xml::events::BytesStart::new(
                        "ows:AllowedValues",
                    )))?;
                    for value in &domain.allowed_values {
                        let text = match value {
                            Value::String(s) => s.clone(),
                            other => other.to_string(),
                        };
                        writer
                            .create_element("ows:Value")
                            .write_text_content(BytesText::new(&text))?;
                    }
                    writer.write_event(Event::End(quick_xml::events::BytesEnd::new(
                        "ows:AllowedValues",
                    )))?;
                } else if domain.any_value {
                    writer
                        .create_element("ows:AnyValue")
                        .write_empty()?;
                }
            }
            if let Some(default) = &descriptor.default {
                let text = match default {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                writer
                    .create_element("DefaultValue")
                    .write_text_content(BytesText::new(&text))?;
            }
            writer.write_event(Event::End(quick_xml::events::BytesEnd::new(element)))?;
        }
        IoType::Enum { values } => {
            let element = if output { "LiteralOutput" } else { "LiteralData" };
            writer.write_event(Event::Start(quick_xml::events::BytesStart::new(element)))?;
            writer
                .create_element("ows:DataType")
                .write_text_content(BytesText::new("string"))?;
            writer.write_event(Event::Start(quick_xml::events::BytesStart::new(
                "ows:AllowedValues",
            )))?;
            for value in values {
                writer
                    .create_element("ows:Value")
                    .write_text_content(BytesText::new(value))?;
            }
            writer.write_event(Event::End(quick_xml::events::BytesEnd::new(
                "ows:AllowedValues",
            )))?;
            writer.write_event(Event::End(quick_xml::events::BytesEnd::new(element)))?;
        }
        IoType::BoundingBox { supported_crs } => {
            let element = if output {
                "BoundingBoxOutput"
            } else {
                "BoundingBoxData"
            };
            writer.write_event(Event::Start(quick_xml::events::BytesStart::new(element)))?;
            for (i, crs) in supported_crs.iter().enumerate() {
                let wrapper = if i == 0 { "Default" } else { "Supported" };
                writer.write_event(Event::Start(quick_xml::events::BytesStart::new(wrapper)))?;
                writer
                    .create_element("CRS")
                    .write_text_content(BytesText::new(crs))?;
                writer.write_event(Event::End(quick_xml::events::BytesEnd::new(wrapper)))?;
            }
            writer.write_event(Event::End(quick_xml::events::BytesEnd::new(element)))?;
        }
        IoType::Complex { .. } => {
            let element = if output { "ComplexOutput" } else { "ComplexData" };
            let mut start = quick_xml::events::BytesStart::new(element);
            if let Some(mb) = descriptor.formats.iter().find_map(|f| f.maximum_megabytes) {
                start.push_attribute(("maximumMegabytes", mb.to_string().as_str()));
            }
            writer.write_event(Event::Start(start))?;
            let write_format = |writer: &mut Writer<W>,
                                format: &super::Format|
             -> std::result::Result<(), quick_xml::Error> {
                writer.write_event(Event::Start(quick_xml::events::BytesStart::new("Format")))?;
                writer
                    .create_element("MimeType")
                    .write_text_content(BytesText::new(&format.media_type))?;
                if let Some(encoding) = &format.encoding {
                    writer
                        .create_element("Encoding")
                        .write_text_content(BytesText::new(encoding))?;
                }
                if let Some(schema) = &format.schema {
                    writer
                        .create_element("Schema")
                        .write_text_content(BytesText::new(schema))?;
                }
                writer.write_event(Event::End(quick_xml::events::BytesEnd::new("Format")))?;
                Ok(())
            };
            if let Some(default) = descriptor.formats.iter().find(|f| f.default) {
                writer.write_event(Event::Start(quick_xml::events::BytesStart::new("Default")))?;
                write_format(writer, default)?;
                writer.write_event(Event::End(quick_xml::events::BytesEnd::new("Default")))?;
            }
            writer.write_event(Event::Start(quick_xml::events::BytesStart::new("Supported")))?;
            for format in &descriptor.formats {
                write_format(writer, format)?;
            }
            writer.write_event(Event::End(quick_xml::events::BytesEnd::new("Supported")))?;
            writer.write_event(Event::End(quick_xml::events::BytesEnd::new(element)))?;
        }
    }

    writer.write_event(Event::End(quick_xml::events::BytesEnd::new(element)))?;
    Ok(())
}

fn write_process_description<W: std::io::Write>(
    writer: &mut Writer<W>,
    model: &ProcessModel,
) -> std::result::Result<(), quick_xml::Error> {
    let mut description = quick_xml::events::BytesStart::new("ProcessDescription");
    description.push_attribute(("wps:processVersion", model.version.to_string().as_str()));
    writer.write_event(Event::Start(description))?;

    writer
        .create_element("ows:Identifier")
        .write_text_content(BytesText::new(&model.id))?;
    if let Some(title) = &model.title {
        writer
            .create_element("ows:Title")
            .write_text_content(BytesText::new(title))?;
    }
    if let Some(description) = &model.description {
        writer
            .create_element("ows:Abstract")
            .write_text_content(BytesText::new(description))?;
    }

    writer.write_event(Event::Start(quick_xml::events::BytesStart::new("DataInputs")))?;
    for input in &model.inputs {
        write_io_xml(writer, input, false)?;
    }
    writer.write_event(Event::End(quick_xml::events::BytesEnd::new("DataInputs")))?;

    writer.write_event(Event::Start(quick_xml::events::BytesStart::new(
        "ProcessOutputs",
    )))?;
    for output in &model.outputs {
        write_io_xml(writer, output, true)?;
    }
    writer.write_event(Event::End(quick_xml::events::BytesEnd::new("ProcessOutputs")))?;

    writer.write_event(Event::End(quick_xml::events::BytesEnd::new(
        "ProcessDescription",
    )))?;
    Ok(())
}

/// WPS 1.0 ProcessDescriptions document for any number of processes.
pub fn wps_descriptions_xml(models: &[&ProcessModel]) -> Result<String> {
    let mut writer = Writer::new(Vec::new());
    let render = |writer: &mut Writer<Vec<u8>>| -> std::result::Result<(), quick_xml::Error> {
        writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
        let mut root = quick_xml::events::BytesStart::new("wps:ProcessDescriptions");
        root.push_attribute(("xmlns:wps", "http://www.opengis.net/wps/1.0.0"));
        root.push_attribute(("xmlns:ows", "http://www.opengis.net/ows/1.1"));
        root.push_attribute(("service", "WPS"));
        root.push_attribute(("version", "1.0.0"));
        writer.write_event(Event::Start(root))?;
        for model in models {
            write_process_description(writer, model)?;
        }
        writer.write_event(Event::End(quick_xml::events::BytesEnd::new(
            "wps:ProcessDescriptions",
        )))?;
        Ok(())
    };
    render(&mut writer).map_err(|e| Error::Internal(anyhow::anyhow!("XML rendering: {}", e)))?;
    String::from_utf8(writer.into_inner())
        .map_err(|e| Error::Internal(anyhow::anyhow!("XML encoding: {}", e)))
}

/// WPS 1.0 ProcessDescriptions document for a single process.
pub fn wps_description_xml(model: &ProcessModel) -> Result<String> {
    wps_descriptions_xml(&[model])
}

/// WPS 1.0 GetCapabilities document listing the given processes.
pub fn wps_capabilities_xml(
    title: &str,
    summaries: &[(String, Option<String>, Option<String>)],
) -> Result<String> {
    let mut writer = Writer::new(Vec::new());
    let render = |writer: &mut Writer<Vec<u8>>| -> std::result::Result<(), quick_xml::Error> {
        writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
        let mut root = quick_xml::events::BytesStart::new("wps:Capabilities");
        root.push_attribute(("xmlns:wps", "http://www.opengis.net/wps/1.0.0"));
        root.push_attribute(("xmlns:ows", "http://www.opengis.net/ows/1.1"));
        root.push_attribute(("service", "WPS"));
        root.push_attribute(("version", "1.0.0"));
        writer.write_event(Event::Start(root))?;
        writer.write_event(Event::Start(quick_xml::events::BytesStart::new(
            "ows:ServiceIdentification",
        )))?;
        writer
            .create_element("ows:Title")
            .write_text_content(BytesText::new(title))?;
        writer
            .create_element("ows:ServiceType")
            .write_text_content(BytesText::new("WPS"))?;
        writer.write_event(Event::End(quick_xml::events::BytesEnd::new(
            "ows:ServiceIdentification",
        )))?;
        writer.write_event(Event::Start(quick_xml::events::BytesStart::new(
            "wps:ProcessOfferings",
        )))?;
        for (id, title, description) in summaries {
            writer.write_event(Event::Start(quick_xml::events::BytesStart::new(
                "wps:Process",
            )))?;
            writer
                .create_element("ows:Identifier")
                .write_text_content(BytesText::new(id))?;
            if let Some(title) = title {
                writer
                    .create_element("ows:Title")
                    .write_text_content(BytesText::new(title))?;
            }
            if let Some(description) = description {
                writer
                    .create_element("ows:Abstract")
                    .write_text_content(BytesText::new(description))?;
            }
            writer.write_event(Event::End(quick_xml::events::BytesEnd::new("wps:Process")))?;
        }
        writer.write_event(Event::End(quick_xml::events::BytesEnd::new(
            "wps:ProcessOfferings",
        )))?;
        writer.write_event(Event::End(quick_xml::events::BytesEnd::new(
            "wps:Capabilities",
        )))?;
        Ok(())
    };
    render(&mut writer).map_err(|e| Error::Internal(anyhow::anyhow!("XML rendering: {}", e)))?;
    String::from_utf8(writer.into_inner())
        .map_err(|e| Error::Internal(anyhow::anyhow!("XML encoding: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::super::{cwl_io, ogc_io, wps_io, Format, LiteralType};
    use super::*;
    use serde_json::json;
    use weft_contracts::ProcessKind;

    fn sample_model() -> ProcessModel {
        let mut model = ProcessModel::new("subset", ProcessKind::Application);
        model.title = Some("Subset a dataset".into());
        model.description = Some("Extracts a spatial subset.".into());
        let inputs = cwl_io::parse_io_section(
            &json!({
                "dataset": {"type": "File[]", "format": "http://edamontology.org/format_3650"},
                "level": {"type": "int", "default": 1}
            }),
            false,
        )
        .unwrap();
        let outputs = cwl_io::parse_io_section(
            &json!({"output": {"type": "File", "format": "http://edamontology.org/format_3650"}}),
            true,
        )
        .unwrap();
        model.inputs = inputs;
        model.outputs = outputs;
        model
    }

    #[test]
    fn ogc_rendering_parses_back_to_same_descriptors() {
        let model = sample_model();
        let rendered = ogc_description(&model);
        let reparsed =
            ogc_io::parse_io_section(rendered.get("inputs").unwrap(), false).unwrap();
        for original in &model.inputs {
            let parsed = reparsed.iter().find(|d| d.id == original.id).unwrap();
            assert_eq!(parsed.io_type, original.io_type, "{}", original.id);
            assert_eq!(parsed.min_occurs, original.min_occurs);
            assert_eq!(parsed.max_occurs, original.max_occurs);
            assert_eq!(parsed.formats.len(), original.formats.len());
        }
    }

    #[test]
    fn ogc_rendering_is_deterministic() {
        let model = sample_model();
        let a = serde_json::to_string(&ogc_description(&model)).unwrap();
        let b = serde_json::to_string(&ogc_description(&model)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn legacy_rendering_uses_string_occurs() {
        let model = sample_model();
        let rendered = legacy_description(&model);
        let inputs = rendered["process"]["inputs"].as_array().unwrap();
        let dataset = inputs.iter().find(|i| i["id"] == "dataset").unwrap();
        assert_eq!(dataset["minOccurs"], "1");
        assert_eq!(dataset["maxOccurs"], "unbounded");
    }

    #[test]
    fn wps_xml_round_trips_through_parser() {
        let model = sample_model();
        let xml = wps_description_xml(&model).unwrap();
        let info = wps_io::parse_describe_process(&xml).unwrap();
        assert_eq!(info.id, "subset");
        assert_eq!(info.inputs.len(), 2);
        let dataset = info.inputs.iter().find(|d| d.id == "dataset").unwrap();
        assert_eq!(dataset.max_occurs, Occurrence::Unbounded);
        assert!(dataset.io_type.is_complex());
        let level = info.inputs.iter().find(|d| d.id == "level").unwrap();
        assert_eq!(level.io_type, IoType::Literal(LiteralType::Integer));
        assert_eq!(level.default, Some(json!(1)));
    }

    #[test]
    fn capabilities_round_trip_through_parser() {
        let xml = wps_capabilities_xml(
            "weft",
            &[
                ("echo".into(), Some("Echo".into()), None),
                ("subset".into(), None, Some("Extracts a subset.".into())),
            ],
        )
        .unwrap();
        let parsed = wps_io::parse_capabilities(&xml).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].id, "echo");
        assert_eq!(parsed[0].title.as_deref(), Some("Echo"));
        assert_eq!(parsed[1].abstract_.as_deref(), Some("Extracts a subset."));
    }

    #[test]
    fn complex_schema_with_single_format_is_not_one_of() {
        let mut desc = IoDescriptor::new("data", IoType::Complex { directory: false });
        desc.formats = vec![Format::new("application/json").as_default()];
        let schema = schema_value(&desc);
        assert_eq!(schema["contentMediaType"], "application/json");
        assert!(schema.get("oneOf").is_none());
    }
}
