//! The live pipeline model delivered by the production service.
//!
//! A [`PipelineSnapshot`] is an ordered list of level-1 artifacts (documents),
//! each optionally holding level-2 children. Order is pipeline order and is
//! preserved through every update.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::answer::AnswerType;
use crate::{ConveyorError, Result};

/// Id prefixes owned by the diagram's synthetic group and waypoint nodes.
pub const RESERVED_ID_PREFIXES: &[&str] = &["group:", "wp:"];

fn default_level() -> u8 {
    1
}

/// A document or work unit tracked by the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactNode {
    pub id: String,
    #[serde(default = "default_level")]
    pub level: u8,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub raw_state: String,
    #[serde(default)]
    pub stations: Vec<Station>,
    #[serde(default)]
    pub questions: Vec<Question>,
    #[serde(default)]
    pub children: Vec<ArtifactNode>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interrupt_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
}

impl ArtifactNode {
    /// Minimal artifact with no stations, questions, children, or dependencies.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        raw_state: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            level: 1,
            name: name.into(),
            description: None,
            raw_state: raw_state.into(),
            stations: Vec::new(),
            questions: Vec::new(),
            children: Vec::new(),
            dependencies: Vec::new(),
            interrupt_id: None,
            instance_id: None,
        }
    }

    /// Stations currently waiting on operator input.
    pub fn stations_needing_input(&self) -> impl Iterator<Item = &Station> {
        self.stations.iter().filter(|s| s.needs_input)
    }

    pub fn needs_input(&self) -> bool {
        self.stations.iter().any(|s| s.needs_input)
    }
}

/// One step of the production process for an artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Station {
    pub id: String,
    #[serde(default)]
    pub label: String,
    pub raw_state: String,
    #[serde(default)]
    pub needs_input: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step: Option<StepRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRef {
    pub name: String,
}

/// A question the operator must answer before a station can resume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Question {
    pub id: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub answer_type: AnswerType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub choices: Option<Vec<String>>,
}

/// A pending operator-input request tied to one artifact.
///
/// Derived from the snapshot: an interrupt exists exactly while its artifact
/// carries an `interruptId`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Interrupt {
    pub id: String,
    pub artifact_id: String,
    pub station_ids: Vec<String>,
    pub questions: Vec<Question>,
}

/// Incremental update to a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ArtifactPatch {
    /// Replace the artifact with the same id in place, or insert it.
    /// New level-2 artifacts are appended to `parent_id`'s children.
    Upsert {
        artifact: ArtifactNode,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_id: Option<String>,
    },
    /// Logically remove an artifact.
    Remove { id: String },
}

/// Ordered sequence of top-level artifacts. Insertion order is pipeline order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineSnapshot {
    #[serde(default)]
    pub documents: Vec<ArtifactNode>,
}

impl PipelineSnapshot {
    pub fn new(documents: Vec<ArtifactNode>) -> Self {
        Self { documents }
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    /// All artifacts in pipeline order, each parent before its children.
    pub fn iter_all(&self) -> impl Iterator<Item = &ArtifactNode> {
        self.documents
            .iter()
            .flat_map(|doc| std::iter::once(doc).chain(doc.children.iter()))
    }

    pub fn find(&self, id: &str) -> Option<&ArtifactNode> {
        self.iter_all().find(|a| a.id == id)
    }

    pub fn find_mut(&mut self, id: &str) -> Option<&mut ArtifactNode> {
        for doc in &mut self.documents {
            if doc.id == id {
                return Some(doc);
            }
            if let Some(child) = doc.children.iter_mut().find(|c| c.id == id) {
                return Some(child);
            }
        }
        None
    }

    pub fn contains(&self, id: &str) -> bool {
        self.find(id).is_some()
    }

    /// Open interrupts in pipeline order.
    pub fn interrupts(&self) -> Vec<Interrupt> {
        self.iter_all()
            .filter_map(|artifact| {
                let id = artifact.interrupt_id.as_ref()?;
                Some(Interrupt {
                    id: id.clone(),
                    artifact_id: artifact.id.clone(),
                    station_ids: artifact
                        .stations_needing_input()
                        .map(|s| s.id.clone())
                        .collect(),
                    questions: artifact.questions.clone(),
                })
            })
            .collect()
    }

    pub fn interrupt(&self, interrupt_id: &str) -> Option<Interrupt> {
        self.interrupts().into_iter().find(|i| i.id == interrupt_id)
    }

    /// Check the structural invariants of the model.
    ///
    /// Ids are unique across the whole snapshot and never start with one of
    /// [`RESERVED_ID_PREFIXES`]. Top-level artifacts are level 1, children are
    /// level 2 and have no children of their own.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for doc in &self.documents {
            if doc.level != 1 {
                return Err(ConveyorError::InvalidSnapshot(format!(
                    "top-level artifact '{}' has level {}",
                    doc.id, doc.level
                )));
            }
            for child in &doc.children {
                if child.level != 2 {
                    return Err(ConveyorError::InvalidSnapshot(format!(
                        "child '{}' of '{}' has level {}",
                        child.id, doc.id, child.level
                    )));
                }
                if !child.children.is_empty() {
                    return Err(ConveyorError::InvalidSnapshot(format!(
                        "level-2 artifact '{}' has children",
                        child.id
                    )));
                }
            }
        }
        for artifact in self.iter_all() {
            if artifact.id.is_empty() {
                return Err(ConveyorError::InvalidSnapshot(
                    "artifact with empty id".into(),
                ));
            }
            if let Some(prefix) = RESERVED_ID_PREFIXES
                .iter()
                .find(|p| artifact.id.starts_with(**p))
            {
                return Err(ConveyorError::InvalidSnapshot(format!(
                    "artifact id '{}' uses the reserved prefix '{prefix}'",
                    artifact.id
                )));
            }
            if !seen.insert(artifact.id.as_str()) {
                return Err(ConveyorError::InvalidSnapshot(format!(
                    "duplicate artifact id '{}'",
                    artifact.id
                )));
            }
        }
        Ok(())
    }

    /// Apply an incremental patch in place.
    ///
    /// Removing an id that is not present is a no-op.
    pub fn apply_patch(&mut self, patch: ArtifactPatch) -> Result<()> {
        match patch {
            ArtifactPatch::Upsert {
                artifact,
                parent_id,
            } => {
                if let Some(existing) = self.find_mut(&artifact.id) {
                    *existing = artifact;
                    return Ok(());
                }
                match parent_id {
                    Some(parent_id) => {
                        let parent = self
                            .documents
                            .iter_mut()
                            .find(|d| d.id == parent_id)
                            .ok_or(ConveyorError::UnknownArtifact { id: parent_id })?;
                        parent.children.push(artifact);
                    }
                    None => self.documents.push(artifact),
                }
            }
            ArtifactPatch::Remove { id } => {
                let before = self.iter_all().count();
                self.documents.retain(|d| d.id != id);
                for doc in &mut self.documents {
                    doc.children.retain(|c| c.id != id);
                }
                if self.iter_all().count() == before {
                    tracing::debug!(artifact = %id, "Remove patch for unknown artifact ignored");
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> PipelineSnapshot {
        serde_json::from_str(
            r#"{
                "documents": [
                    {
                        "id": "brief",
                        "name": "Project Brief",
                        "rawState": "produced"
                    },
                    {
                        "id": "backlog",
                        "name": "Backlog",
                        "rawState": "in_production",
                        "dependencies": ["brief"],
                        "interruptId": "int-1",
                        "stations": [
                            {"id": "draft", "label": "Draft", "rawState": "complete"},
                            {"id": "qa", "label": "QA", "rawState": "active", "needsInput": true,
                             "currentStep": {"name": "clarify scope"}}
                        ],
                        "questions": [
                            {"id": "q1", "text": "Which audience?", "required": true,
                             "answerType": "single_choice", "choices": ["ops", "dev"]}
                        ],
                        "children": [
                            {"id": "epic-1", "level": 2, "name": "Epic One", "rawState": "ready"},
                            {"id": "epic-2", "level": 2, "name": "Epic Two", "rawState": "queued"}
                        ]
                    }
                ]
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn deserializes_camel_case_wire_format() {
        let snap = sample();
        assert_eq!(snap.documents.len(), 2);
        let backlog = &snap.documents[1];
        assert_eq!(backlog.level, 1);
        assert_eq!(backlog.interrupt_id.as_deref(), Some("int-1"));
        assert!(backlog.stations[1].needs_input);
        assert_eq!(
            backlog.stations[1].current_step.as_ref().map(|s| s.name.as_str()),
            Some("clarify scope")
        );
        assert_eq!(backlog.questions[0].answer_type, AnswerType::Choice);
        assert_eq!(backlog.children[0].level, 2);
    }

    #[test]
    fn iter_all_is_pipeline_order_parents_first() {
        let ids: Vec<_> = sample().iter_all().map(|a| a.id.clone()).collect();
        assert_eq!(ids, vec!["brief", "backlog", "epic-1", "epic-2"]);
    }

    #[test]
    fn find_reaches_children() {
        let snap = sample();
        assert_eq!(snap.find("epic-2").unwrap().name, "Epic Two");
        assert!(snap.contains("brief"));
        assert!(!snap.contains("missing"));
    }

    #[test]
    fn interrupts_are_derived_from_interrupt_id() {
        let interrupts = sample().interrupts();
        assert_eq!(interrupts.len(), 1);
        let int = &interrupts[0];
        assert_eq!(int.id, "int-1");
        assert_eq!(int.artifact_id, "backlog");
        assert_eq!(int.station_ids, vec!["qa".to_string()]);
        assert_eq!(int.questions.len(), 1);
    }

    #[test]
    fn validate_accepts_well_formed_snapshot() {
        assert!(sample().validate().is_ok());
    }

    #[test]
    fn validate_rejects_duplicate_ids() {
        let mut snap = sample();
        snap.documents[1].children[1].id = "brief".into();
        let err = snap.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate artifact id 'brief'"));
    }

    #[test]
    fn validate_rejects_ids_that_look_synthetic() {
        let mut snap = sample();
        snap.documents.push(ArtifactNode::new("group:backlog", "Sneaky", "queued"));
        let err = snap.validate().unwrap_err();
        assert!(err.to_string().contains("reserved prefix 'group:'"));

        let mut snap = sample();
        snap.documents[1].children[0].id = "wp:in:brief".into();
        assert!(snap.validate().is_err());
    }

    #[test]
    fn validate_rejects_wrong_levels() {
        let mut snap = sample();
        snap.documents[0].level = 2;
        assert!(snap.validate().is_err());

        let mut snap = sample();
        snap.documents[1].children[0].level = 1;
        assert!(snap.validate().is_err());
    }

    #[test]
    fn upsert_replaces_in_place_preserving_order() {
        let mut snap = sample();
        let mut updated = ArtifactNode::new("brief", "Project Brief v2", "produced");
        updated.description = Some("revised".into());
        snap.apply_patch(ArtifactPatch::Upsert {
            artifact: updated,
            parent_id: None,
        })
        .unwrap();
        assert_eq!(snap.documents[0].name, "Project Brief v2");
        assert_eq!(snap.documents[1].id, "backlog");
    }

    #[test]
    fn upsert_appends_new_artifacts() {
        let mut snap = sample();
        snap.apply_patch(ArtifactPatch::Upsert {
            artifact: ArtifactNode::new("release", "Release Notes", "queued"),
            parent_id: None,
        })
        .unwrap();
        let mut child = ArtifactNode::new("epic-3", "Epic Three", "queued");
        child.level = 2;
        snap.apply_patch(ArtifactPatch::Upsert {
            artifact: child,
            parent_id: Some("backlog".into()),
        })
        .unwrap();

        assert_eq!(snap.documents.last().unwrap().id, "release");
        assert_eq!(snap.documents[1].children.last().unwrap().id, "epic-3");
    }

    #[test]
    fn upsert_child_of_unknown_parent_fails() {
        let mut snap = sample();
        let err = snap
            .apply_patch(ArtifactPatch::Upsert {
                artifact: ArtifactNode::new("orphan", "Orphan", "queued"),
                parent_id: Some("nope".into()),
            })
            .unwrap_err();
        assert!(matches!(err, ConveyorError::UnknownArtifact { .. }));
    }

    #[test]
    fn remove_drops_artifact_and_tolerates_unknown_ids() {
        let mut snap = sample();
        snap.apply_patch(ArtifactPatch::Remove { id: "epic-1".into() })
            .unwrap();
        assert!(!snap.contains("epic-1"));
        snap.apply_patch(ArtifactPatch::Remove { id: "ghost".into() })
            .unwrap();
        assert_eq!(snap.iter_all().count(), 3);
    }

    #[test]
    fn patch_wire_format_is_op_tagged() {
        let patch: ArtifactPatch =
            serde_json::from_str(r#"{"op": "remove", "id": "brief"}"#).unwrap();
        assert_eq!(patch, ArtifactPatch::Remove { id: "brief".into() });
    }
}
