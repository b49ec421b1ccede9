//! Project document persistence

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};
use crate::project::ProjectState;
use crate::steps::MAX_STEP_COUNT;

pub const DOCUMENT_VERSION: u32 = 1;

#[derive(Serialize)]
struct DocumentRef<'a> {
    version: u32,
    #[serde(flatten)]
    project: &'a ProjectState,
}

#[derive(Deserialize)]
struct Document {
    #[serde(default = "default_version")]
    version: u32,
    #[serde(flatten)]
    project: ProjectState,
}

fn default_version() -> u32 {
    DOCUMENT_VERSION
}

/// Serialize a project to its JSON document
pub fn save_project(project: &ProjectState) -> Result<String> {
    let doc = DocumentRef {
        version: DOCUMENT_VERSION,
        project,
    };
    Ok(serde_json::to_string_pretty(&doc)?)
}

/// Parse a JSON document and repair its invariants
pub fn load_project(json: &str) -> Result<ProjectState> {
    let doc: Document = serde_json::from_str(json)?;
    if doc.version > DOCUMENT_VERSION {
        return Err(CoreError::InvalidDocument(format!(
            "document version {} is newer than supported version {}",
            doc.version, DOCUMENT_VERSION
        )));
    }
    let mut project = doc.project;
    if project.sequences.is_empty() {
        return Err(CoreError::InvalidDocument("no sequences".into()));
    }
    if project.step_count() > MAX_STEP_COUNT {
        return Err(CoreError::InvalidDocument(format!(
            "step count {} exceeds the limit of {MAX_STEP_COUNT}",
            project.step_count()
        )));
    }
    if project.ids_exhausted() {
        return Err(CoreError::InvalidDocument("channel ids exhausted".into()));
    }
    project.normalize();
    Ok(project)
}

pub fn save_to_path(project: &ProjectState, path: &Path) -> Result<()> {
    std::fs::write(path, save_project(project)?)?;
    Ok(())
}

pub fn load_from_path(path: &Path) -> Result<ProjectState> {
    load_project(&std::fs::read_to_string(path)?)
}
