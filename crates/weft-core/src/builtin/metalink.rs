// Metalink v3/v4 parsing. Namespace-aware: v3 lives in
// http://www.metalinker.org/ and nests url under resources, v4 lives in
// urn:ietf:params:xml:ns:metalink with url directly under file.

use quick_xml::events::Event;
use quick_xml::name::ResolveResult;
use quick_xml::NsReader;

use crate::error::{Error, Result};

const NS_V3: &[u8] = b"http://www.metalinker.org/";
const NS_V4: &[u8] = b"urn:ietf:params:xml:ns:metalink";

/// One file entry with its candidate URLs in document order.
#[derive(Debug, Clone, PartialEq)]
pub struct MetalinkFile {
    pub name: String,
    pub urls: Vec<String>,
}

fn known_namespace(resolve: &ResolveResult) -> bool {
    match resolve {
        ResolveResult::Bound(ns) => ns.as_ref() == NS_V3 || ns.as_ref() == NS_V4,
        // tolerate unprefixed documents that forgot the default namespace
        ResolveResult::Unbound => true,
        ResolveResult::Unknown(_) => false,
    }
}

/// Parse a Metalink v3 or v4 document into its file entries.
pub fn parse_metalink(xml: &str) -> Result<Vec<MetalinkFile>> {
    let mut reader = NsReader::from_str(xml);
    let mut files = Vec::new();
    let mut current: Option<MetalinkFile> = None;
    let mut in_url = false;

    loop {
        let event = reader
            .read_resolved_event()
            .map_err(|e| Error::schema(format!("invalid Metalink XML: {}", e)))?;
        match event {
            (resolve, Event::Start(e)) => {
                let name = e.local_name();
                let name = name.as_ref();
                if !known_namespace(&resolve) {
                    continue;
                }
                match name {
                    b"file" => {
                        let mut file = MetalinkFile {
                            name: String::new(),
                            urls: Vec::new(),
                        };
                        for attr in e.attributes().flatten() {
                            if attr.key.local_name().as_ref() == b"name" {
                                file.name = attr.unescape_value().unwrap_or_default().to_string();
                            }
                        }
                        current = Some(file);
                    }
                    b"url" => in_url = true,
                    _ => {}
                }
            }
            (_, Event::End(e)) => {
                match e.local_name().as_ref() {
                    b"file" => {
                        if let Some(file) = current.take() {
                            files.push(file);
                        }
                    }
                    b"url" => in_url = false,
                    _ => {}
                }
            }
            (_, Event::Text(t)) => {
                if in_url {
                    if let Some(file) = current.as_mut() {
                        let url = t
                            .unescape()
                            .map_err(|e| Error::schema(format!("invalid XML text: {}", e)))?
                            .trim()
                            .to_string();
                        if !url.is_empty() {
                            file.urls.push(url);
                        }
                    }
                }
            }
            (_, Event::Eof) => break,
            _ => {}
        }
    }

    if files.is_empty() {
        return Err(Error::schema("Metalink document contains no file entries"));
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_v4() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
        <metalink xmlns="urn:ietf:params:xml:ns:metalink">
          <file name="a.nc">
            <url>https://example.test/a.nc</url>
            <url>https://mirror.example.test/a.nc</url>
          </file>
          <file name="b.nc">
            <url>https://example.test/b.nc</url>
          </file>
        </metalink>"#;
        let files = parse_metalink(xml).unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].name, "a.nc");
        assert_eq!(files[0].urls.len(), 2);
        assert_eq!(files[1].urls, vec!["https://example.test/b.nc"]);
    }

    #[test]
    fn parses_v3_with_resources() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
        <metalink xmlns="http://www.metalinker.org/" version="3.0">
          <files>
            <file name="data.nc">
              <resources>
                <url type="http">https://example.test/data.nc</url>
              </resources>
            </file>
          </files>
        </metalink>"#;
        let files = parse_metalink(xml).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].urls, vec!["https://example.test/data.nc"]);
    }

    #[test]
    fn foreign_namespace_elements_ignored() {
        let xml = r#"<?xml version="1.0"?>
        <metalink xmlns="urn:ietf:params:xml:ns:metalink" xmlns:x="https://other.example.test/">
          <x:file name="ignored"><x:url>https://example.test/ignored.nc</x:url></x:file>
          <file name="kept.nc"><url>https://example.test/kept.nc</url></file>
        </metalink>"#;
        let files = parse_metalink(xml).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].name, "kept.nc");
    }

    #[test]
    fn empty_document_rejected() {
        let xml = r#"<metalink xmlns="urn:ietf:params:xml:ns:metalink"></metalink>"#;
        assert!(parse_metalink(xml).is_err());
    }
}
