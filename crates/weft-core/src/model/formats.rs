// Media type handling: normalisation, EDAM ontology mapping, and the
// built-in table of types that skip remote IANA validation.

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

/// Normalise a media type for use as a merge key: lowercase type/subtype,
/// parameters preserved in order with whitespace collapsed.
pub fn normalise_media_type(media_type: &str) -> String {
    let mut parts = media_type.split(';');
    let essence = parts.next().unwrap_or("").trim().to_ascii_lowercase();
    let params: Vec<String> = parts
        .map(|p| {
            let p = p.trim();
            match p.split_once('=') {
                Some((k, v)) => format!("{}={}", k.trim().to_ascii_lowercase(), v.trim()),
                None => p.to_ascii_lowercase(),
            }
        })
        .filter(|p| !p.is_empty())
        .collect();
    if params.is_empty() {
        essence
    } else {
        format!("{}; {}", essence, params.join("; "))
    }
}

/// EDAM ontology format URIs with a known IANA media type equivalent.
/// CWL packages routinely tag files with these instead of media types.
static EDAM_TO_IANA: &[(&str, &str)] = &[
    ("format_1915", "text/plain"),
    ("format_2330", "text/plain"),
    ("format_3003", "text/x-bed"),
    ("format_3464", "application/json"),
    ("format_3475", "text/tab-separated-values"),
    ("format_3591", "image/tiff; application=geotiff"),
    ("format_3752", "text/csv"),
    ("format_3839", "application/x-hdf"),
    ("format_3650", "application/x-netcdf"),
    ("format_2333", "application/octet-stream"),
    ("format_3857", "application/zip"),
    ("format_3982", "application/gml+xml"),
    ("format_2332", "application/xml"),
];

/// Resolve an EDAM URI (or CURIE such as `edam:format_3650`) to its IANA
/// equivalent, when a mapping exists.
pub fn edam_to_media_type(reference: &str) -> Option<&'static str> {
    let key = reference
        .rsplit(|c| c == '/' || c == ':' || c == '#')
        .next()?;
    EDAM_TO_IANA
        .iter()
        .find(|(edam, _)| *edam == key)
        .map(|(_, iana)| *iana)
}

/// Map an IANA media-type registry URI back to the bare media type.
pub fn iana_to_media_type(reference: &str) -> Option<String> {
    let rest = reference
        .strip_prefix("https://www.iana.org/assignments/media-types/")
        .or_else(|| reference.strip_prefix("http://www.iana.org/assignments/media-types/"))?;
    Some(normalise_media_type(rest))
}

/// Media types recognised without remote validation.
static KNOWN_MEDIA_TYPES: &[&str] = &[
    "text/plain",
    "text/csv",
    "text/html",
    "text/xml",
    "application/json",
    "application/xml",
    "application/zip",
    "application/octet-stream",
    "application/x-netcdf",
    "application/x-hdf",
    "application/pdf",
    "application/gml+xml",
    "application/geo+json",
    "application/metalink4+xml",
    "image/png",
    "image/jpeg",
    "image/gif",
    "image/tiff",
    "image/tiff; application=geotiff",
    "image/tiff; subtype=geotiff",
];

pub fn is_known_media_type(media_type: &str) -> bool {
    let normalised = normalise_media_type(media_type);
    KNOWN_MEDIA_TYPES.contains(&normalised.as_str())
}

/// Process-local cache for media-type lookups resolved at runtime
/// (IANA table hits and remote validations recorded by the deploy path).
pub fn lookup_cache() -> &'static Mutex<HashMap<String, Option<String>>> {
    static CACHE: OnceLock<Mutex<HashMap<String, Option<String>>>> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Resolve any format reference (EDAM URI, IANA URI, or bare media type) to
/// a normalised media type string. Results are cached.
pub fn resolve_format_reference(reference: &str) -> Option<String> {
    {
        let cache = lookup_cache().lock().expect("format cache poisoned");
        if let Some(hit) = cache.get(reference) {
            return hit.clone();
        }
    }
    let resolved = if let Some(iana) = edam_to_media_type(reference) {
        Some(iana.to_string())
    } else if let Some(media) = iana_to_media_type(reference) {
        Some(media)
    } else if reference.contains('/') && !reference.contains("://") {
        // already a media type
        Some(normalise_media_type(reference))
    } else {
        None
    };
    lookup_cache()
        .lock()
        .expect("format cache poisoned")
        .insert(reference.to_string(), resolved.clone());
    resolved
}

/// File extension conventionally paired with a media type, used when
/// deriving staged filenames.
pub fn extension_for(media_type: &str) -> Option<&'static str> {
    match normalise_media_type(media_type).as_str() {
        "application/json" | "application/geo+json" => Some("json"),
        "application/x-netcdf" => Some("nc"),
        "application/x-hdf" => Some("hdf"),
        "application/zip" => Some("zip"),
        "application/xml" | "text/xml" => Some("xml"),
        "application/gml+xml" => Some("gml"),
        "text/plain" => Some("txt"),
        "text/csv" => Some("csv"),
        s if s.starts_with("image/tiff") => Some("tif"),
        "image/png" => Some("png"),
        "image/jpeg" => Some("jpg"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalisation_lowercases_essence_and_keeps_parameters() {
        assert_eq!(normalise_media_type("Text/Plain"), "text/plain");
        assert_eq!(
            normalise_media_type("Image/TIFF;  Application=geotiff"),
            "image/tiff; application=geotiff"
        );
        // parameter values keep their case
        assert_eq!(
            normalise_media_type("application/x-thing; Profile=UPPER"),
            "application/x-thing; profile=UPPER"
        );
    }

    #[test]
    fn edam_resolution() {
        assert_eq!(
            edam_to_media_type("http://edamontology.org/format_3650"),
            Some("application/x-netcdf")
        );
        assert_eq!(edam_to_media_type("edam:format_3464"), Some("application/json"));
        assert_eq!(edam_to_media_type("edam:format_0000"), None);
    }

    #[test]
    fn iana_uri_resolution() {
        assert_eq!(
            iana_to_media_type("https://www.iana.org/assignments/media-types/application/json")
                .as_deref(),
            Some("application/json")
        );
        assert!(iana_to_media_type("https://example.test/whatever").is_none());
    }

    #[test]
    fn known_table_skips_geotiff_variants() {
        assert!(is_known_media_type("image/tiff; subtype=geotiff"));
        assert!(is_known_media_type("TEXT/PLAIN"));
        assert!(!is_known_media_type("application/x-very-custom"));
    }

    #[test]
    fn resolve_any_reference_form() {
        assert_eq!(
            resolve_format_reference("http://edamontology.org/format_3650").as_deref(),
            Some("application/x-netcdf")
        );
        assert_eq!(
            resolve_format_reference("image/TIFF; subtype=geotiff").as_deref(),
            Some("image/tiff; subtype=geotiff")
        );
        assert_eq!(resolve_format_reference("not-a-format"), None);
        // cached second hit
        assert_eq!(
            resolve_format_reference("http://edamontology.org/format_3650").as_deref(),
            Some("application/x-netcdf")
        );
    }
}
