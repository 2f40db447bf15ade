// Descriptor merge operator: unifies per-id descriptors parsed from CWL,
// WPS XML and OGC JSON. Most constrained type wins; contradictions fail
// with DESCRIPTION_MISMATCH.

use std::collections::HashSet;

use super::formats::normalise_media_type;
use super::{Format, IoDescriptor, IoType, Occurrence};
use crate::error::{Error, Result};

fn merge_types(id: &str, a: &IoType, b: &IoType) -> Result<IoType> {
    use super::LiteralType;
    match (a, b) {
        (IoType::Literal(x), IoType::Literal(y)) => x
            .most_constrained(*y)
            .map(IoType::Literal)
            .ok_or_else(|| Error::mismatch(id, format!("literal {:?} vs {:?}", x, y))),
        (IoType::Complex { directory: da }, IoType::Complex { directory: db }) => {
            Ok(IoType::Complex {
                directory: *da || *db,
            })
        }
        // sources without format knowledge describe files as bare strings
        (IoType::Complex { directory }, IoType::Literal(LiteralType::String))
        | (IoType::Literal(LiteralType::String), IoType::Complex { directory }) => {
            Ok(IoType::Complex {
                directory: *directory,
            })
        }
        (IoType::Enum { values }, IoType::Literal(LiteralType::String))
        | (IoType::Literal(LiteralType::String), IoType::Enum { values }) => Ok(IoType::Enum {
            values: values.clone(),
        }),
        (IoType::Enum { values: va }, IoType::Enum { values: vb }) => {
            let sa: HashSet<_> = va.iter().collect();
            let sb: HashSet<_> = vb.iter().collect();
            if sa.is_subset(&sb) {
                Ok(IoType::Enum { values: va.clone() })
            } else if sb.is_subset(&sa) {
                Ok(IoType::Enum { values: vb.clone() })
            } else {
                Err(Error::mismatch(id, "enum symbol sets disagree"))
            }
        }
        (
            IoType::BoundingBox { supported_crs: ca },
            IoType::BoundingBox { supported_crs: cb },
        ) => {
            let mut crs = ca.clone();
            for c in cb {
                if !crs.contains(c) {
                    crs.push(c.clone());
                }
            }
            Ok(IoType::BoundingBox { supported_crs: crs })
        }
        (x, y) => Err(Error::mismatch(id, format!("{:?} vs {:?}", x, y))),
    }
}

/// Union of format lists keyed by normalised media type. Field gaps are
/// filled from later occurrences; the first explicit default wins.
fn merge_formats(a: &[Format], b: &[Format]) -> Vec<Format> {
    let mut merged: Vec<Format> = Vec::new();
    for format in a.iter().chain(b.iter()) {
        let key = normalise_media_type(&format.media_type);
        if let Some(existing) = merged
            .iter_mut()
            .find(|f| normalise_media_type(&f.media_type) == key)
        {
            if existing.schema.is_none() {
                existing.schema = format.schema.clone();
            }
            if existing.encoding.is_none() {
                existing.encoding = format.encoding.clone();
            }
            if existing.maximum_megabytes.is_none() {
                existing.maximum_megabytes = format.maximum_megabytes;
            }
            existing.default |= format.default;
        } else {
            merged.push(format.clone());
        }
    }
    // single default: first explicit wins, else promote the first entry
    if let Some(first) = merged.iter().position(|f| f.default) {
        for (i, f) in merged.iter_mut().enumerate() {
            f.default = i == first;
        }
    } else if let Some(first) = merged.first_mut() {
        first.default = true;
    }
    merged
}

/// Merge two descriptors for the same id. `a` is the authoritative source
/// (the execution unit); `b` supplements it.
pub fn merge_descriptor(a: &IoDescriptor, b: &IoDescriptor, output: bool) -> Result<IoDescriptor> {
    debug_assert_eq!(a.id, b.id);
    let io_type = merge_types(&a.id, &a.io_type, &b.io_type)?;

    let mut merged = IoDescriptor::new(&a.id, io_type);
    merged.title = a.title.clone().or_else(|| b.title.clone());
    merged.description = a.description.clone().or_else(|| b.description.clone());
    merged.schema_ref = a.schema_ref.clone().or_else(|| b.schema_ref.clone());

    // a nullable/defaulted side forces optionality; never tighten
    merged.min_occurs = a.min_occurs.min(b.min_occurs);
    // never clip an unbounded side back to a scalar
    merged.max_occurs = a.max_occurs.widest(b.max_occurs);

    merged.default = a.default.clone().or_else(|| b.default.clone());
    if merged.default.is_some() {
        merged.min_occurs = 0;
    }

    merged.formats = merge_formats(&a.formats, &b.formats);
    merged.domains = if a.domains.is_empty() {
        b.domains.clone()
    } else {
        a.domains.clone()
    };

    merged.validate(output)?;
    Ok(merged)
}

/// Merge descriptor lists from several sources. The first list provides the
/// ordering; ids known only to later sources are appended.
pub fn merge_sections(sources: Vec<Vec<IoDescriptor>>, output: bool) -> Result<Vec<IoDescriptor>> {
    let mut iter = sources.into_iter();
    let Some(mut merged) = iter.next() else {
        return Ok(Vec::new());
    };
    for source in iter {
        for descriptor in source {
            if let Some(existing) = merged.iter_mut().find(|d| d.id == descriptor.id) {
                *existing = merge_descriptor(existing, &descriptor, output)?;
            } else {
                merged.push(descriptor);
            }
        }
    }
    for descriptor in &mut merged {
        descriptor.normalise_default_format();
        descriptor.validate(output)?;
    }
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::super::{LiteralDomain, LiteralType};
    use super::*;
    use serde_json::json;

    fn lit(id: &str, t: LiteralType) -> IoDescriptor {
        IoDescriptor::new(id, IoType::Literal(t))
    }

    #[test]
    fn most_constrained_literal_wins() {
        let cwl = lit("n", LiteralType::Integer);
        let wps = lit("n", LiteralType::Float);
        let merged = merge_descriptor(&cwl, &wps, false).unwrap();
        assert_eq!(merged.io_type, IoType::Literal(LiteralType::Integer));
    }

    #[test]
    fn contradiction_fails_deployment() {
        let cwl = lit("n", LiteralType::Integer);
        let wps = lit("n", LiteralType::String);
        let err = merge_descriptor(&cwl, &wps, false).unwrap_err();
        assert_eq!(err.code(), "DESCRIPTION_MISMATCH");
    }

    #[test]
    fn array_vs_scalar_yields_array() {
        let mut cwl = IoDescriptor::new("files", IoType::Complex { directory: false });
        cwl.max_occurs = Occurrence::Unbounded;
        let wps = IoDescriptor::new("files", IoType::Complex { directory: false });
        let merged = merge_descriptor(&cwl, &wps, false).unwrap();
        assert_eq!(merged.max_occurs, Occurrence::Unbounded);
    }

    #[test]
    fn format_union_deduplicates_and_fills_fields() {
        let mut a = IoDescriptor::new("data", IoType::Complex { directory: false });
        a.formats = vec![Format::new("application/x-netcdf")];
        let mut b = IoDescriptor::new("data", IoType::Complex { directory: false });
        b.formats = vec![
            Format {
                media_type: "application/X-NETCDF".into(),
                default: false,
                schema: None,
                encoding: None,
                maximum_megabytes: Some(100),
            },
            Format::new("application/zip"),
        ];
        let merged = merge_descriptor(&a, &b, false).unwrap();
        assert_eq!(merged.formats.len(), 2);
        assert_eq!(merged.formats[0].maximum_megabytes, Some(100));
        assert!(merged.formats[0].default, "first format promoted to default");
    }

    #[test]
    fn first_explicit_default_wins() {
        let mut a = IoDescriptor::new("data", IoType::Complex { directory: false });
        a.formats = vec![Format::new("application/json")];
        let mut b = IoDescriptor::new("data", IoType::Complex { directory: false });
        b.formats = vec![
            Format::new("text/plain").as_default(),
            Format::new("application/json"),
        ];
        let merged = merge_descriptor(&a, &b, false).unwrap();
        let default: Vec<_> = merged.formats.iter().filter(|f| f.default).collect();
        assert_eq!(default.len(), 1);
        assert_eq!(default[0].media_type, "text/plain");
    }

    #[test]
    fn default_value_forces_optional() {
        let mut cwl = lit("lvl", LiteralType::Integer);
        cwl.default = Some(json!(1));
        cwl.min_occurs = 0;
        let wps = lit("lvl", LiteralType::Integer);
        let merged = merge_descriptor(&cwl, &wps, false).unwrap();
        assert_eq!(merged.min_occurs, 0);
        assert_eq!(merged.default, Some(json!(1)));
    }

    #[test]
    fn string_literal_upgrades_to_complex() {
        let cwl = IoDescriptor::new("data", IoType::Complex { directory: false });
        let other = lit("data", LiteralType::String);
        let merged = merge_descriptor(&cwl, &other, false).unwrap();
        assert!(merged.io_type.is_complex());
    }

    #[test]
    fn enum_subset_is_kept() {
        let a = IoDescriptor::new(
            "m",
            IoType::Enum {
                values: vec!["x".into()],
            },
        );
        let b = IoDescriptor::new(
            "m",
            IoType::Enum {
                values: vec!["x".into(), "y".into()],
            },
        );
        let merged = merge_descriptor(&a, &b, false).unwrap();
        assert_eq!(
            merged.io_type,
            IoType::Enum {
                values: vec!["x".into()]
            }
        );
    }

    #[test]
    fn sections_append_ids_unknown_to_first_source() {
        let a = vec![lit("x", LiteralType::String)];
        let b = vec![
            lit("x", LiteralType::String),
            lit("y", LiteralType::Integer),
        ];
        let merged = merge_sections(vec![a, b], false).unwrap();
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[1].id, "y");
    }

    #[test]
    fn domains_from_supplementary_source_survive() {
        let cwl = lit("lvl", LiteralType::Integer);
        let mut wps = lit("lvl", LiteralType::Integer);
        wps.domains.push(LiteralDomain {
            allowed_values: vec![json!(1), json!(2)],
            ..Default::default()
        });
        let merged = merge_descriptor(&cwl, &wps, false).unwrap();
        assert_eq!(merged.domains.len(), 1);
    }
}
