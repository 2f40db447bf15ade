// W3C PROV capture: one in-memory document per job run, emitted in six
// encodings. The process is the plan, the job the activity, steps are
// sub-activities related through wasInformedBy.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::error::{Error, Result};

const WEFT_NS: &str = "urn:weft:";
const PROV_NS: &str = "http://www.w3.org/ns/prov#";

/// Requested encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvFormat {
    Provn,
    Nt,
    Json,
    JsonLd,
    Xml,
    Turtle,
}

impl ProvFormat {
    pub fn from_media_type(media_type: &str) -> Option<ProvFormat> {
        match media_type.trim() {
            "text/provenance-notation" => Some(ProvFormat::Provn),
            "application/n-triples" => Some(ProvFormat::Nt),
            "application/json" => Some(ProvFormat::Json),
            "application/ld+json" => Some(ProvFormat::JsonLd),
            "application/xml" | "text/xml" => Some(ProvFormat::Xml),
            "text/turtle" => Some(ProvFormat::Turtle),
            _ => None,
        }
    }

    pub fn media_type(self) -> &'static str {
        match self {
            ProvFormat::Provn => "text/provenance-notation",
            ProvFormat::Nt => "application/n-triples",
            ProvFormat::Json => "application/json",
            ProvFormat::JsonLd => "application/ld+json",
            ProvFormat::Xml => "application/xml",
            ProvFormat::Turtle => "text/turtle",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum EntityRole {
    Input,
    Output,
}

/// Input or output entity of a run.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ProvEntity {
    pub id: String,
    pub role: EntityRole,
    pub label: String,
    /// Source URL or published location, when known.
    pub location: Option<String>,
    /// Owning activity: the job itself or a step id.
    pub activity: String,
}

/// The job activity or one step sub-activity.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ProvActivity {
    pub id: String,
    pub label: String,
    pub started: Option<DateTime<Utc>>,
    pub ended: Option<DateTime<Utc>>,
}

/// One job run's provenance.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ProvDocument {
    pub job_id: Uuid,
    pub process_id: String,
    pub process_version: String,
    pub job: ProvActivity,
    pub steps: Vec<ProvActivity>,
    pub entities: Vec<ProvEntity>,
    /// Effective CWL document, when the run executed one.
    pub cwl: Option<Value>,
}

impl ProvDocument {
    pub fn new(job_id: Uuid, process_id: impl Into<String>, version: impl Into<String>) -> Self {
        let process_id = process_id.into();
        Self {
            job: ProvActivity {
                id: format!("job/{}", job_id),
                label: format!("execution of {}", process_id),
                started: None,
                ended: None,
            },
            job_id,
            process_id,
            process_version: version.into(),
            steps: Vec::new(),
            entities: Vec::new(),
            cwl: None,
        }
    }

    pub fn add_step(
        &mut self,
        step_id: &str,
        started: DateTime<Utc>,
        ended: Option<DateTime<Utc>>,
    ) {
        self.steps.push(ProvActivity {
            id: format!("job/{}/step/{}", self.job_id, step_id),
            label: step_id.to_string(),
            started: Some(started),
            ended,
        });
    }

    pub fn add_input(&mut self, id: &str, location: Option<String>) {
        self.entities.push(ProvEntity {
            id: format!("job/{}/input/{}", self.job_id, id),
            role: EntityRole::Input,
            label: id.to_string(),
            location,
            activity: self.job.id.clone(),
        });
    }

    pub fn add_output(&mut self, id: &str, location: Option<String>) {
        self.entities.push(ProvEntity {
            id: format!("job/{}/output/{}", self.job_id, id),
            role: EntityRole::Output,
            label: id.to_string(),
            location,
            activity: self.job.id.clone(),
        });
    }

    fn plan_id(&self) -> String {
        format!("process/{}:{}", self.process_id, self.process_version)
    }

    fn agent_id(&self) -> &'static str {
        "engine"
    }

    fn timestamp(dt: &Option<DateTime<Utc>>) -> String {
        dt.map(|t| t.to_rfc3339_opts(SecondsFormat::Millis, true))
            .unwrap_or_else(|| "-".into())
    }

    pub fn emit(&self, format: ProvFormat) -> Result<String> {
        match format {
            ProvFormat::Provn => Ok(self.to_provn()),
            ProvFormat::Nt => Ok(self.to_ntriples()),
            ProvFormat::Json => serde_json::to_string_pretty(&self.to_prov_json())
                .map_err(|e| Error::Internal(anyhow::anyhow!("PROV-JSON: {}", e))),
            ProvFormat::JsonLd => serde_json::to_string_pretty(&self.to_jsonld())
                .map_err(|e| Error::Internal(anyhow::anyhow!("PROV-JSONLD: {}", e))),
            ProvFormat::Xml => self.to_xml(),
            ProvFormat::Turtle => Ok(self.to_turtle()),
        }
    }

    fn to_provn(&self) -> String {
        let mut out = String::from("document\n");
        out.push_str(&format!("  prefix weft <{}>\n", WEFT_NS));
        out.push_str(&format!(
            "  entity(weft:{}, [prov:type='prov:Plan', prov:label=\"{}\"])\n",
            self.plan_id(),
            self.process_id
        ));
        out.push_str(&format!(
            "  agent(weft:{}, [prov:type='prov:SoftwareAgent'])\n",
            self.agent_id()
        ));
        out.push_str(&format!(
            "  activity(weft:{}, {}, {})\n",
            self.job.id,
            Self::timestamp(&self.job.started),
            Self::timestamp(&self.job.ended)
        ));
        out.push_str(&format!(
            "  wasAssociatedWith(weft:{}, weft:{}, weft:{})\n",
            self.job.id,
            self.agent_id(),
            self.plan_id()
        ));
        for step in &self.steps {
            out.push_str(&format!(
                "  activity(weft:{}, {}, {})\n",
                step.id,
                Self::timestamp(&step.started),
                Self::timestamp(&step.ended)
            ));
            out.push_str(&format!(
                "  wasInformedBy(weft:{}, weft:{})\n",
                step.id, self.job.id
            ));
        }
        for entity in &self.entities {
            let location = entity
                .location
                .as_ref()
                .map(|l| format!(", prov:atLocation=\"{}\"", l))
                .unwrap_or_default();
            out.push_str(&format!(
                "  entity(weft:{}, [prov:label=\"{}\"{}])\n",
                entity.id, entity.label, location
            ));
            match entity.role {
                EntityRole::Input => out.push_str(&format!(
                    "  used(weft:{}, weft:{}, -)\n",
                    entity.activity, entity.id
                )),
                EntityRole::Output => out.push_str(&format!(
                    "  wasGeneratedBy(weft:{}, weft:{}, -)\n",
                    entity.id, entity.activity
                )),
            }
        }
        out.push_str("endDocument\n");
        out
    }

    fn triple(subject: &str, predicate: &str, object: &str) -> String {
        format!("<{}{}> <{}{}> {} .\n", WEFT_NS, subject, PROV_NS, predicate, object)
    }

    fn iri(id: &str) -> String {
        format!("<{}{}>", WEFT_NS, id)
    }

    fn to_ntriples(&self) -> String {
        let mut out = String::new();
        let rdf_type = format!("<{}Activity>", PROV_NS);
        out.push_str(&format!(
            "<{}{}> <http://www.w3.org/1999/02/22-rdf-syntax-ns#type> {} .\n",
            WEFT_NS, self.job.id, rdf_type
        ));
        out.push_str(&Self::triple(
            &self.job.id,
            "wasAssociatedWith",
            &Self::iri(self.agent_id()),
        ));
        out.push_str(&Self::triple(
            &self.job.id,
            "qualifiedAssociation",
            &Self::iri(&self.plan_id()),
        ));
        for step in &self.steps {
            out.push_str(&Self::triple(&step.id, "wasInformedBy", &Self::iri(&self.job.id)));
        }
        for entity in &self.entities {
            match entity.role {
                EntityRole::Input => {
                    out.push_str(&Self::triple(&entity.activity, "used", &Self::iri(&entity.id)))
                }
                EntityRole::Output => out.push_str(&Self::triple(
                    &entity.id,
                    "wasGeneratedBy",
                    &Self::iri(&entity.activity),
                )),
            }
            if let Some(location) = &entity.location {
                out.push_str(&Self::triple(
                    &entity.id,
                    "atLocation",
                    &format!("\"{}\"", location),
                ));
            }
        }
        out
    }

    fn to_turtle(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("@prefix prov: <{}> .\n", PROV_NS));
        out.push_str(&format!("@prefix weft: <{}> .\n\n", WEFT_NS));
        out.push_str(&format!(
            "weft:{} a prov:Plan ; rdfs:label \"{}\" .\n",
            self.plan_id(),
            self.process_id
        ));
        out.push_str(&format!("weft:{} a prov:SoftwareAgent .\n", self.agent_id()));
        out.push_str(&format!(
            "weft:{} a prov:Activity ;\n  prov:wasAssociatedWith weft:{} .\n",
            self.job.id,
            self.agent_id()
        ));
        for step in &self.steps {
            out.push_str(&format!(
                "weft:{} a prov:Activity ; prov:wasInformedBy weft:{} .\n",
                step.id, self.job.id
            ));
        }
        for entity in &self.entities {
            out.push_str(&format!("weft:{} a prov:Entity .\n", entity.id));
            match entity.role {
                EntityRole::Input => out.push_str(&format!(
                    "weft:{} prov:used weft:{} .\n",
                    entity.activity, entity.id
                )),
                EntityRole::Output => out.push_str(&format!(
                    "weft:{} prov:wasGeneratedBy weft:{} .\n",
                    entity.id, entity.activity
                )),
            }
        }
        out
    }

    fn to_prov_json(&self) -> Value {
        let mut entities = Map::new();
        entities.insert(
            format!("weft:{}", self.plan_id()),
            json!({ "prov:type": "prov:Plan", "prov:label": self.process_id }),
        );
        for entity in &self.entities {
            let mut body = Map::new();
            body.insert("prov:label".into(), json!(entity.label));
            if let Some(location) = &entity.location {
                body.insert("prov:atLocation".into(), json!(location));
            }
            entities.insert(format!("weft:{}", entity.id), Value::Object(body));
        }

        let mut activities = Map::new();
        let mut activity_body = Map::new();
        if let Some(started) = self.job.started {
            activity_body.insert(
                "prov:startTime".into(),
                json!(started.to_rfc3339_opts(SecondsFormat::Millis, true)),
            );
        }
        if let Some(ended) = self.job.ended {
            activity_body.insert(
                "prov:endTime".into(),
                json!(ended.to_rfc3339_opts(SecondsFormat::Millis, true)),
            );
        }
        activities.insert(format!("weft:{}", self.job.id), Value::Object(activity_body));
        for step in &self.steps {
            let mut body = Map::new();
            if let Some(started) = step.started {
                body.insert(
                    "prov:startTime".into(),
                    json!(started.to_rfc3339_opts(SecondsFormat::Millis, true)),
                );
            }
            if let Some(ended) = step.ended {
                body.insert(
                    "prov:endTime".into(),
                    json!(ended.to_rfc3339_opts(SecondsFormat::Millis, true)),
                );
            }
            activities.insert(format!("weft:{}", step.id), Value::Object(body));
        }

        let mut used = Map::new();
        let mut generated = Map::new();
        let mut informed = Map::new();
        for (i, entity) in self.entities.iter().enumerate() {
            match entity.role {
                EntityRole::Input => {
                    used.insert(
                        format!("_:u{}", i),
                        json!({
                            "prov:activity": format!("weft:{}", entity.activity),
                            "prov:entity": format!("weft:{}", entity.id)
                        }),
                    );
                }
                EntityRole::Output => {
                    generated.insert(
                        format!("_:g{}", i),
                        json!({
                            "prov:entity": format!("weft:{}", entity.id),
                            "prov:activity": format!("weft:{}", entity.activity)
                        }),
                    );
                }
            }
        }
        for (i, step) in self.steps.iter().enumerate() {
            informed.insert(
                format!("_:i{}", i),
                json!({
                    "prov:informed": format!("weft:{}", step.id),
                    "prov:informant": format!("weft:{}", self.job.id)
                }),
            );
        }

        json!({
            "prefix": { "weft": WEFT_NS, "prov": PROV_NS },
            "entity": entities,
            "activity": activities,
            "agent": { format!("weft:{}", self.agent_id()): { "prov:type": "prov:SoftwareAgent" } },
            "wasAssociatedWith": {
                "_:a0": {
                    "prov:activity": format!("weft:{}", self.job.id),
                    "prov:agent": format!("weft:{}", self.agent_id()),
                    "prov:plan": format!("weft:{}", self.plan_id())
                }
            },
            "used": used,
            "wasGeneratedBy": generated,
            "wasInformedBy": informed,
        })
    }

    fn to_jsonld(&self) -> Value {
        let mut graph = vec![json!({
            "@id": format!("weft:{}", self.plan_id()),
            "@type": "prov:Plan",
            "prov:label": self.process_id,
        })];
        graph.push(json!({
            "@id": format!("weft:{}", self.job.id),
            "@type": "prov:Activity",
            "prov:wasAssociatedWith": { "@id": format!("weft:{}", self.agent_id()) },
            "prov:startedAtTime": self.job.started.map(|t| t.to_rfc3339_opts(SecondsFormat::Millis, true)),
            "prov:endedAtTime": self.job.ended.map(|t| t.to_rfc3339_opts(SecondsFormat::Millis, true)),
        }));
        for step in &self.steps {
            graph.push(json!({
                "@id": format!("weft:{}", step.id),
                "@type": "prov:Activity",
                "prov:wasInformedBy": { "@id": format!("weft:{}", self.job.id) },
            }));
        }
        for entity in &self.entities {
            let mut node = json!({
                "@id": format!("weft:{}", entity.id),
                "@type": "prov:Entity",
                "prov:label": entity.label,
            });
            if entity.role == EntityRole::Output {
                node["prov:wasGeneratedBy"] = json!({ "@id": format!("weft:{}", entity.activity) });
            }
            graph.push(node);
        }
        json!({
            "@context": { "prov": PROV_NS, "weft": WEFT_NS },
            "@graph": graph,
        })
    }

    fn to_xml(&self) -> Result<String> {
        use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
        use quick_xml::Writer;

        let mut writer = Writer::new(Vec::new());
        let render = |writer: &mut Writer<Vec<u8>>| -> std::result::Result<(), quick_xml::Error> {
            writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
            let mut root = BytesStart::new("prov:document");
            root.push_attribute(("xmlns:prov", PROV_NS));
            root.push_attribute(("xmlns:weft", WEFT_NS));
            writer.write_event(Event::Start(root))?;

            let mut plan = BytesStart::new("prov:entity");
            plan.push_attribute(("prov:id", format!("weft:{}", self.plan_id()).as_str()));
            writer.write_event(Event::Start(plan))?;
            writer
                .create_element("prov:type")
                .write_text_content(BytesText::new("prov:Plan"))?;
            writer.write_event(Event::End(BytesEnd::new("prov:entity")))?;

            let mut write_activity =
                |writer: &mut Writer<Vec<u8>>,
                 activity: &ProvActivity|
                 -> std::result::Result<(), quick_xml::Error> {
                    let mut start = BytesStart::new("prov:activity");
                    start.push_attribute(("prov:id", format!("weft:{}", activity.id).as_str()));
                    writer.write_event(Event::Start(start))?;
                    if let Some(started) = activity.started {
                        writer.create_element("prov:startTime").write_text_content(
                            BytesText::new(
                                &started.to_rfc3339_opts(SecondsFormat::Millis, true),
                            ),
                        )?;
                    }
                    if let Some(ended) = activity.ended {
                        writer.create_element("prov:endTime").write_text_content(
                            BytesText::new(&ended.to_rfc3339_opts(SecondsFormat::Millis, true)),
                        )?;
                    }
                    writer.write_event(Event::End(BytesEnd::new("prov:activity")))?;
                    Ok(())
                };
            write_activity(writer, &self.job)?;
            for step in &self.steps {
                write_activity(writer, step)?;
            }

            for entity in &self.entities {
                let mut start = BytesStart::new("prov:entity");
                start.push_attribute(("prov:id", format!("weft:{}", entity.id).as_str()));
                writer.write_event(Event::Start(start))?;
                writer
                    .create_element("prov:label")
                    .write_text_content(BytesText::new(&entity.label))?;
                if let Some(location) = &entity.location {
                    writer
                        .create_element("prov:atLocation")
                        .write_text_content(BytesText::new(location))?;
                }
                writer.write_event(Event::End(BytesEnd::new("prov:entity")))?;

                let relation = match entity.role {
                    EntityRole::Input => "prov:used",
                    EntityRole::Output => "prov:wasGeneratedBy",
                };
                let mut rel = BytesStart::new(relation);
                rel.push_attribute((
                    "prov:activity",
                    format!("weft:{}", entity.activity).as_str(),
                ));
                rel.push_attribute(("prov:entity", format!("weft:{}", entity.id).as_str()));
                writer.write_event(Event::Empty(rel))?;
            }

            writer.write_event(Event::End(BytesEnd::new("prov:document")))?;
            Ok(())
        };
        render(&mut writer).map_err(|e| Error::Internal(anyhow::anyhow!("PROV-XML: {}", e)))?;
        String::from_utf8(writer.into_inner())
            .map_err(|e| Error::Internal(anyhow::anyhow!("PROV-XML encoding: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ProvDocument {
        let job_id = Uuid::nil();
        let mut doc = ProvDocument::new(job_id, "echo", "1.0.0");
        doc.job.started = Some("2026-08-01T10:00:00Z".parse().unwrap());
        doc.job.ended = Some("2026-08-01T10:00:05Z".parse().unwrap());
        doc.add_step("tool", "2026-08-01T10:00:01Z".parse().unwrap(), None);
        doc.add_input("message", None);
        doc.add_output("echoed", Some("http://localhost/wpsoutputs/x/echoed".into()));
        doc
    }

    #[test]
    fn all_formats_emit() {
        let doc = sample();
        for format in [
            ProvFormat::Provn,
            ProvFormat::Nt,
            ProvFormat::Json,
            ProvFormat::JsonLd,
            ProvFormat::Xml,
            ProvFormat::Turtle,
        ] {
            let body = doc.emit(format).unwrap();
            assert!(!body.is_empty(), "{:?}", format);
        }
    }

    #[test]
    fn provn_structure() {
        let body = sample().emit(ProvFormat::Provn).unwrap();
        assert!(body.starts_with("document"));
        assert!(body.contains("prov:Plan"));
        assert!(body.contains("wasAssociatedWith"));
        assert!(body.contains("wasInformedBy"));
        assert!(body.contains("wasGeneratedBy"));
        assert!(body.trim_end().ends_with("endDocument"));
    }

    #[test]
    fn prov_json_relations() {
        let body = sample().emit(ProvFormat::Json).unwrap();
        let value: Value = serde_json::from_str(&body).unwrap();
        assert!(value["entity"]
            .as_object()
            .unwrap()
            .keys()
            .any(|k| k.contains("input/message")));
        assert_eq!(value["used"].as_object().unwrap().len(), 1);
        assert_eq!(value["wasGeneratedBy"].as_object().unwrap().len(), 1);
        assert_eq!(value["wasInformedBy"].as_object().unwrap().len(), 1);
    }

    #[test]
    fn ntriples_lines_end_with_dot() {
        let body = sample().emit(ProvFormat::Nt).unwrap();
        for line in body.lines() {
            assert!(line.ends_with(" ."), "line: {}", line);
        }
    }

    #[test]
    fn media_type_round_trip() {
        for format in [
            ProvFormat::Provn,
            ProvFormat::Nt,
            ProvFormat::JsonLd,
            ProvFormat::Turtle,
        ] {
            assert_eq!(ProvFormat::from_media_type(format.media_type()), Some(format));
        }
    }
}
