// WPS 1.0 XML parsing: DescribeProcess and GetCapabilities documents into
// canonical descriptors, and ExecuteResponse status documents for remote
// step monitoring. Parsing is namespace-agnostic (local names only) since
// servers disagree on prefixes.

use quick_xml::events::Event;
use quick_xml::Reader;
use serde_json::Value;

use super::{
    AllowedRange, Format, IoDescriptor, IoType, LiteralDomain, LiteralType, Occurrence,
};
use crate::error::{Error, Result};

/// Process-level information extracted from DescribeProcess.
#[derive(Debug, Clone, Default)]
pub struct WpsProcessInfo {
    pub id: String,
    pub title: Option<String>,
    pub abstract_: Option<String>,
    pub version: Option<String>,
    pub inputs: Vec<IoDescriptor>,
    pub outputs: Vec<IoDescriptor>,
}

/// Summary entry from GetCapabilities ProcessOfferings.
#[derive(Debug, Clone)]
pub struct WpsProcessSummary {
    pub id: String,
    pub title: Option<String>,
    pub abstract_: Option<String>,
}

/// Parsed ExecuteResponse status.
#[derive(Debug, Clone, PartialEq)]
pub enum WpsExecuteStatus {
    Accepted,
    Started { percent: u8 },
    Succeeded,
    Failed { text: String },
}

/// Parsed ExecuteResponse document.
#[derive(Debug, Clone)]
pub struct WpsExecuteResponse {
    pub status_location: Option<String>,
    pub status: WpsExecuteStatus,
    /// output id -> reference href or inline literal
    pub outputs: Vec<(String, WpsOutputData)>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WpsOutputData {
    Reference { href: String, media_type: Option<String> },
    Literal(String),
}

fn literal_of(data_type: &str) -> Option<LiteralType> {
    // strip xs: / xsd: prefixes and ows URIs
    let name = data_type
        .rsplit(|c| c == ':' || c == '#')
        .next()
        .unwrap_or(data_type);
    match name.to_ascii_lowercase().as_str() {
        "string" => Some(LiteralType::String),
        "integer" | "int" | "long" | "nonnegativeinteger" | "positiveinteger" => {
            Some(LiteralType::Integer)
        }
        "float" | "double" | "decimal" => Some(LiteralType::Float),
        "boolean" | "bool" => Some(LiteralType::Boolean),
        "datetime" | "date-time" | "date" => Some(LiteralType::DateTime),
        _ => None,
    }
}

fn local(name: &[u8]) -> String {
    let name = String::from_utf8_lossy(name);
    name.rsplit(':').next().unwrap_or(&name).to_string()
}

#[derive(Debug, Default)]
struct IoBuilder {
    id: String,
    title: Option<String>,
    abstract_: Option<String>,
    min_occurs: Option<u32>,
    max_occurs: Option<Occurrence>,
    literal: Option<LiteralDomain>,
    formats: Vec<Format>,
    maximum_megabytes: Option<u32>,
    bbox_crs: Vec<String>,
    kind: IoKind,
}

#[derive(Debug, Default, PartialEq)]
enum IoKind {
    #[default]
    Unknown,
    Literal,
    Complex,
    BoundingBox,
}

impl IoBuilder {
    fn build(mut self, output: bool) -> Result<IoDescriptor> {
        let io_type = match self.kind {
            IoKind::Literal | IoKind::Unknown => {
                let domain = self.literal.clone().unwrap_or_default();
                IoType::Literal(domain.data_type.unwrap_or(LiteralType::String))
            }
            IoKind::Complex => IoType::Complex { directory: false },
            IoKind::BoundingBox => IoType::BoundingBox {
                supported_crs: std::mem::take(&mut self.bbox_crs),
            },
        };
        let mut desc = IoDescriptor::new(&self.id, io_type);
        desc.title = self.title;
        desc.description = self.abstract_;
        if let Some(min) = self.min_occurs {
            desc.min_occurs = min;
        } else if output {
            desc.min_occurs = 1;
        }
        if let Some(max) = self.max_occurs {
            desc.max_occurs = max;
        }
        if let Some(mut domain) = self.literal {
            if let Some(default) = domain.default_value.clone() {
                desc.default = Some(default);
                desc.min_occurs = 0;
            }
            // coerce string-typed allowed values to the declared type
            if let Some(dt) = domain.data_type {
                domain.allowed_values = domain
                    .allowed_values
                    .into_iter()
                    .map(|v| coerce(&v, dt))
                    .collect();
                if let Some(default) = &desc.default {
                    desc.default = Some(coerce(default, dt));
                }
            }
            desc.domains.push(domain);
        }
        for mut format in std::mem::take(&mut self.formats) {
            format.maximum_megabytes = self.maximum_megabytes;
            desc.formats.push(format);
        }
        desc.normalise_default_format();
        desc.validate(output)?;
        Ok(desc)
    }
}

fn coerce(value: &Value, dt: LiteralType) -> Value {
    let Some(s) = value.as_str() else {
        return value.clone();
    };
    match dt {
        LiteralType::Integer => s.parse::<i64>().map(Value::from).unwrap_or_else(|_| value.clone()),
        LiteralType::Float => s.parse::<f64>().map(Value::from).unwrap_or_else(|_| value.clone()),
        LiteralType::Boolean => s.parse::<bool>().map(Value::from).unwrap_or_else(|_| value.clone()),
        _ => value.clone(),
    }
}

fn parse_occurrence(raw: &str) -> Option<Occurrence> {
    if raw.eq_ignore_ascii_case("unbounded") {
        return Some(Occurrence::Unbounded);
    }
    raw.parse::<u32>().ok().map(Occurrence::Finite)
}

/// Parse a WPS 1.0 DescribeProcess response.
pub fn parse_describe_process(xml: &str) -> Result<WpsProcessInfo> {
    let mut reader = Reader::from_str(xml);
    let mut info = WpsProcessInfo::default();
    let mut stack: Vec<String> = Vec::new();
    let mut current: Option<IoBuilder> = None;
    let mut in_output_section = false;
    let mut in_default_format = false;
    let mut format: Option<Format> = None;
    let mut range: Option<AllowedRange> = None;

    loop {
        let event = reader
            .read_event()
            .map_err(|e| Error::schema(format!("invalid DescribeProcess XML: {}", e)))?;
        match event {
            Event::Start(ref e) | Event::Empty(ref e) => {
                let name = local(e.name().as_ref());
                let empty = matches!(event, Event::Empty(_));
                match name.as_str() {
                    "ProcessDescription" => {
                        for attr in e.attributes().flatten() {
                            if local(attr.key.as_ref()) == "processVersion" {
                                info.version =
                                    Some(attr.unescape_value().unwrap_or_default().to_string());
                            }
                        }
                    }
                    "ProcessOutputs" => in_output_section = true,
                    "Input" | "Output" => {
                        let mut builder = IoBuilder::default();
                        for attr in e.attributes().flatten() {
                            let key = local(attr.key.as_ref());
                            let value = attr.unescape_value().unwrap_or_default();
                            match key.as_str() {
                                "minOccurs" => builder.min_occurs = value.parse().ok(),
                                "maxOccurs" => builder.max_occurs = parse_occurrence(&value),
                                _ => {}
                            }
                        }
                        current = Some(builder);
                    }
                    "LiteralData" | "LiteralOutput" => {
                        if let Some(builder) = current.as_mut() {
                            builder.kind = IoKind::Literal;
                            builder.literal.get_or_insert_with(LiteralDomain::default);
                        }
                    }
                    "ComplexData" | "ComplexOutput" => {
                        if let Some(builder) = current.as_mut() {
                            builder.kind = IoKind::Complex;
                            for attr in e.attributes().flatten() {
                                if local(attr.key.as_ref()) == "maximumMegabytes" {
                                    builder.maximum_megabytes =
                                        attr.unescape_value().ok().and_then(|v| v.parse().ok());
                                }
                            }
                        }
                    }
                    "BoundingBoxData" | "BoundingBoxOutput" => {
                        if let Some(builder) = current.as_mut() {
                            builder.kind = IoKind::BoundingBox;
                        }
                    }
                    "Default" => in_default_format = true,
                    "Format" => format = Some(Format::new(String::new())),
                    "Range" => range = Some(AllowedRange {
                        minimum: None,
                        maximum: None,
                        exclusive_minimum: false,
                        exclusive_maximum: false,
                        spacing: None,
                    }),
                    "AnyValue" => {
                        if let Some(builder) = current.as_mut() {
                            builder
                                .literal
                                .get_or_insert_with(LiteralDomain::default)
                                .any_value = true;
                        }
                    }
                    _ => {}
                }
                if !empty {
                    stack.push(name);
                }
            }
            Event::End(ref e) => {
                let name = local(e.name().as_ref());
                match name.as_str() {
                    "ProcessOutputs" => in_output_section = false,
                    "Default" => in_default_format = false,
                    "Format" => {
                        if let (Some(builder), Some(mut fmt)) = (current.as_mut(), format.take()) {
                            if !fmt.media_type.is_empty() {
                                fmt.default = in_default_format;
                                builder.formats.push(fmt);
                            }
                        }
                    }
                    "Range" => {
                        if let (Some(builder), Some(r)) = (current.as_mut(), range.take()) {
                            builder
                                .literal
                                .get_or_insert_with(LiteralDomain::default)
                                .allowed_ranges
                                .push(r);
                        }
                    }
                    "Input" | "Output" => {
                        if let Some(builder) = current.take() {
                            let desc = builder.build(in_output_section)?;
                            if in_output_section {
                                info.outputs.push(desc);
                            } else {
                                info.inputs.push(desc);
                            }
                        }
                    }
                    _ => {}
                }
                stack.pop();
            }
            Event::Text(t) => {
                let text = t
                    .unescape()
                    .map_err(|e| Error::schema(format!("invalid XML text: {}", e)))?
                    .trim()
                    .to_string();
                if text.is_empty() {
                    continue;
                }
                let here = stack.last().map(String::as_str).unwrap_or("");
                match here {
                    "Identifier" => {
                        if let Some(builder) = current.as_mut() {
                            builder.id = text;
                        } else {
                            info.id = text;
                        }
                    }
                    "Title" => {
                        if let Some(builder) = current.as_mut() {
                            builder.title = Some(text);
                        } else {
                            info.title = Some(text);
                        }
                    }
                    "Abstract" => {
                        if let Some(builder) = current.as_mut() {
                            builder.abstract_ = Some(text);
                        } else {
                            info.abstract_ = Some(text);
                        }
                    }
                    "DataType" => {
                        if let Some(builder) = current.as_mut() {
                            builder
                                .literal
                                .get_or_insert_with(LiteralDomain::default)
                                .data_type = literal_of(&text);
                        }
                    }
                    "Value" => {
                        if let Some(builder) = current.as_mut() {
                            builder
                                .literal
                                .get_or_insert_with(LiteralDomain::default)
                                .allowed_values
                                .push(Value::String(text));
                        }
                    }
                    "MinimumValue" => {
                        if let Some(r) = range.as_mut() {
                            r.minimum = text.parse().ok();
                        }
                    }
                    "MaximumValue" => {
                        if let Some(r) = range.as_mut() {
                            r.maximum = text.parse().ok();
                        }
                    }
                    "Spacing" => {
                        if let Some(r) = range.as_mut() {
                            r.spacing = text.parse().ok();
                        }
                    }
                    "DefaultValue" => {
                        if let Some(builder) = current.as_mut() {
                            builder
                                .literal
                                .get_or_insert_with(LiteralDomain::default)
                                .default_value = Some(Value::String(text));
                        }
                    }
                    "UOM" => {
                        if let Some(builder) = current.as_mut() {
                            let domain =
                                builder.literal.get_or_insert_with(LiteralDomain::default);
                            if domain.uom.is_none() {
                                domain.uom = Some(text);
                            }
                        }
                    }
                    "MimeType" => {
                        if let Some(fmt) = format.as_mut() {
                            fmt.media_type = text;
                        }
                    }
                    "Encoding" => {
                        if let Some(fmt) = format.as_mut() {
                            fmt.encoding = Some(text);
                        }
                    }
                    "Schema" => {
                        if let Some(fmt) = format.as_mut() {
                            fmt.schema = Some(text);
                        }
                    }
                    "CRS" => {
                        if let Some(builder) = current.as_mut() {
                            builder.bbox_crs.push(text);
                        }
                    }
                    _ => {}
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if info.id.is_empty() {
        return Err(Error::schema("DescribeProcess without process identifier"));
    }
    Ok(info)
}

/// Parse GetCapabilities into the offered process summaries.
pub fn parse_capabilities(xml: &str) -> Result<Vec<WpsProcessSummary>> {
    let mut reader = Reader::from_str(xml);
    let mut processes = Vec::new();
    let mut stack: Vec<String> = Vec::new();
    let mut current: Option<WpsProcessSummary> = None;

    loop {
        let event = reader
            .read_event()
            .map_err(|e| Error::schema(format!("invalid GetCapabilities XML: {}", e)))?;
        match event {
            Event::Start(ref e) => {
                let name = local(e.name().as_ref());
                if name == "Process" && stack.iter().any(|s| s == "ProcessOfferings") {
                    current = Some(WpsProcessSummary {
                        id: String::new(),
                        title: None,
                        abstract_: None,
                    });
                }
                stack.push(name);
            }
            Event::End(ref e) => {
                if local(e.name().as_ref()) == "Process" {
                    if let Some(p) = current.take() {
                        if !p.id.is_empty() {
                            processes.push(p);
                        }
                    }
                }
                stack.pop();
            }
            Event::Text(t) => {
                let text = t
                    .unescape()
                    .map_err(|e| Error::schema(format!("invalid XML text: {}", e)))?
                    .trim()
                    .to_string();
                if text.is_empty() {
                    continue;
                }
                if let Some(p) = current.as_mut() {
                    match stack.last().map(String::as_str).unwrap_or("") {
                        "Identifier" => p.id = text,
                        "Title" => p.title = Some(text),
                        "Abstract" => p.abstract_ = Some(text),
                        _ => {}
                    }
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(processes)
}

/// Parse a WPS ExecuteResponse (initial response or polled status document).
pub fn parse_execute_response(xml: &str) -> Result<WpsExecuteResponse> {
    let mut reader = Reader::from_str(xml);
    let mut response = WpsExecuteResponse {
        status_location: None,
        status: WpsExecuteStatus::Accepted,
        outputs: Vec::new(),
    };
    let mut stack: Vec<String> = Vec::new();
    let mut current_output: Option<String> = None;
    let mut failure_text = String::new();
    let mut in_failed = false;

    loop {
        let event = reader
            .read_event()
            .map_err(|e| Error::schema(format!("invalid ExecuteResponse XML: {}", e)))?;
        match event {
            Event::Start(ref e) | Event::Empty(ref e) => {
                let name = local(e.name().as_ref());
                let empty = matches!(event, Event::Empty(_));
                match name.as_str() {
                    "ExecuteResponse" => {
                        for attr in e.attributes().flatten() {
                            if local(attr.key.as_ref()) == "statusLocation" {
                                response.status_location =
                                    Some(attr.unescape_value().unwrap_or_default().to_string());
                            }
                        }
                    }
                    "ProcessAccepted" => response.status = WpsExecuteStatus::Accepted,
                    "ProcessStarted" => {
                        let mut percent = 0;
                        for attr in e.attributes().flatten() {
                            if local(attr.key.as_ref()) == "percentCompleted" {
                                percent = attr
                                    .unescape_value()
                                    .ok()
                                    .and_then(|v| v.parse().ok())
                                    .unwrap_or(0);
                            }
                        }
                        response.status = WpsExecuteStatus::Started { percent };
                    }
                    "ProcessSucceeded" => response.status = WpsExecuteStatus::Succeeded,
                    "ProcessFailed" => in_failed = true,
                    "Output" => current_output = Some(String::new()),
                    "Reference" => {
                        let mut href = None;
                        let mut media_type = None;
                        for attr in e.attributes().flatten() {
                            match local(attr.key.as_ref()).as_str() {
                                "href" => {
                                    href = Some(
                                        attr.unescape_value().unwrap_or_default().to_string(),
                                    )
                                }
                                "mimeType" => {
                                    media_type = Some(
                                        attr.unescape_value().unwrap_or_default().to_string(),
                                    )
                                }
                                _ => {}
                            }
                        }
                        if let (Some(id), Some(href)) = (current_output.clone(), href) {
                            if !id.is_empty() {
                                response
                                    .outputs
                                    .push((id, WpsOutputData::Reference { href, media_type }));
                            }
                        }
                    }
                    _ => {}
                }
                if !empty {
                    stack.push(name);
                }
            }
            Event::End(ref e) => {
                let name = local(e.name().as_ref());
                if name == "ProcessFailed" {
                    in_failed = false;
                    response.status = WpsExecuteStatus::Failed {
                        text: std::mem::take(&mut failure_text),
                    };
                } else if name == "Output" {
                    current_output = None;
                }
                stack.pop();
            }
            Event::Text(t) => {
                let text = t
                    .unescape()
                    .map_err(|e| Error::schema(format!("invalid XML text: {}", e)))?
                    .trim()
                    .to_string();
                if text.is_empty() {
                    continue;
                }
                let here = stack.last().map(String::as_str).unwrap_or("");
                if in_failed && (here == "ExceptionText" || here == "Exception") {
                    if !failure_text.is_empty() {
                        failure_text.push(' ');
                    }
                    failure_text.push_str(&text);
                } else if here == "Identifier" {
                    if let Some(id) = current_output.as_mut() {
                        *id = text;
                    }
                } else if here == "LiteralData" {
                    if let Some(id) = current_output.clone() {
                        response.outputs.push((id, WpsOutputData::Literal(text)));
                    }
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    const DESCRIBE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<wps:ProcessDescriptions xmlns:wps="http://www.opengis.net/wps/1.0.0" xmlns:ows="http://www.opengis.net/ows/1.1">
  <ProcessDescription wps:processVersion="2.1">
    <ows:Identifier>subset</ows:Identifier>
    <ows:Title>Subset a dataset</ows:Title>
    <ows:Abstract>Extracts a spatial subset.</ows:Abstract>
    <DataInputs>
      <Input minOccurs="1" maxOccurs="unbounded">
        <ows:Identifier>dataset</ows:Identifier>
        <ows:Title>Input dataset</ows:Title>
        <ComplexData maximumMegabytes="200">
          <Default><Format><MimeType>application/x-netcdf</MimeType></Format></Default>
          <Supported>
            <Format><MimeType>application/x-netcdf</MimeType></Format>
            <Format><MimeType>application/zip</MimeType><Encoding>base64</Encoding></Format>
          </Supported>
        </ComplexData>
      </Input>
      <Input minOccurs="0" maxOccurs="1">
        <ows:Identifier>level</ows:Identifier>
        <LiteralData>
          <ows:DataType>xs:integer</ows:DataType>
          <ows:AllowedValues>
            <ows:Value>1</ows:Value>
            <ows:Value>2</ows:Value>
          </ows:AllowedValues>
          <DefaultValue>1</DefaultValue>
        </LiteralData>
      </Input>
    </DataInputs>
    <ProcessOutputs>
      <Output>
        <ows:Identifier>output</ows:Identifier>
        <ComplexOutput>
          <Default><Format><MimeType>application/x-netcdf</MimeType></Format></Default>
          <Supported><Format><MimeType>application/x-netcdf</MimeType></Format></Supported>
        </ComplexOutput>
      </Output>
    </ProcessOutputs>
  </ProcessDescription>
</wps:ProcessDescriptions>"#;

    #[test]
    fn describe_process_round_trip() {
        let info = parse_describe_process(DESCRIBE).unwrap();
        assert_eq!(info.id, "subset");
        assert_eq!(info.version.as_deref(), Some("2.1"));
        assert_eq!(info.inputs.len(), 2);

        let dataset = &info.inputs[0];
        assert_eq!(dataset.id, "dataset");
        assert_eq!(dataset.max_occurs, Occurrence::Unbounded);
        assert_eq!(dataset.io_type, IoType::Complex { directory: false });
        assert_eq!(dataset.formats.len(), 3);
        assert!(dataset.formats[0].default);
        assert_eq!(dataset.formats[0].maximum_megabytes, Some(200));
        assert_eq!(dataset.formats[2].encoding.as_deref(), Some("base64"));

        let level = &info.inputs[1];
        assert_eq!(level.min_occurs, 0);
        assert_eq!(level.io_type, IoType::Literal(LiteralType::Integer));
        assert_eq!(level.default, Some(serde_json::json!(1)));
        assert_eq!(
            level.domains[0].allowed_values,
            vec![serde_json::json!(1), serde_json::json!(2)]
        );

        assert_eq!(info.outputs.len(), 1);
        assert_eq!(info.outputs[0].id, "output");
    }

    #[test]
    fn capabilities_listing() {
        let xml = r#"<wps:Capabilities xmlns:wps="http://www.opengis.net/wps/1.0.0" xmlns:ows="http://www.opengis.net/ows/1.1">
          <wps:ProcessOfferings>
            <wps:Process><ows:Identifier>a</ows:Identifier><ows:Title>A</ows:Title></wps:Process>
            <wps:Process><ows:Identifier>b</ows:Identifier></wps:Process>
          </wps:ProcessOfferings>
        </wps:Capabilities>"#;
        let list = parse_capabilities(xml).unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].id, "a");
        assert_eq!(list[0].title.as_deref(), Some("A"));
        assert_eq!(list[1].id, "b");
    }

    #[test]
    fn execute_response_started_percent() {
        let xml = r#"<wps:ExecuteResponse xmlns:wps="http://www.opengis.net/wps/1.0.0" statusLocation="https://wps.example.test/status/1.xml">
          <wps:Status><wps:ProcessStarted percentCompleted="42">running</wps:ProcessStarted></wps:Status>
        </wps:ExecuteResponse>"#;
        let resp = parse_execute_response(xml).unwrap();
        assert_eq!(
            resp.status_location.as_deref(),
            Some("https://wps.example.test/status/1.xml")
        );
        assert_eq!(resp.status, WpsExecuteStatus::Started { percent: 42 });
    }

    #[test]
    fn execute_response_success_outputs() {
        let xml = r#"<ExecuteResponse>
          <Status><ProcessSucceeded>done</ProcessSucceeded></Status>
          <ProcessOutputs>
            <Output>
              <Identifier>result</Identifier>
              <Reference href="https://wps.example.test/out/result.nc" mimeType="application/x-netcdf"/>
            </Output>
            <Output>
              <Identifier>count</Identifier>
              <Data><LiteralData>3</LiteralData></Data>
            </Output>
          </ProcessOutputs>
        </ExecuteResponse>"#;
        let resp = parse_execute_response(xml).unwrap();
        assert_eq!(resp.status, WpsExecuteStatus::Succeeded);
        assert_eq!(resp.outputs.len(), 2);
        assert_eq!(
            resp.outputs[0].1,
            WpsOutputData::Reference {
                href: "https://wps.example.test/out/result.nc".into(),
                media_type: Some("application/x-netcdf".into())
            }
        );
        assert_eq!(resp.outputs[1].1, WpsOutputData::Literal("3".into()));
    }

    #[test]
    fn execute_response_failure_text() {
        let xml = r#"<ExecuteResponse>
          <Status><ProcessFailed><ExceptionReport><Exception><ExceptionText>out of memory</ExceptionText></Exception></ExceptionReport></ProcessFailed></Status>
        </ExecuteResponse>"#;
        let resp = parse_execute_response(xml).unwrap();
        assert_eq!(
            resp.status,
            WpsExecuteStatus::Failed {
                text: "out of memory".into()
            }
        );
    }
}
