//! Versioned JSON documents for sequences, trigger sets, channel groups and scripts.
//!
//! Every persisted entity is wrapped in a [`Document`] envelope:
//!
//! ```json
//! {
//!   "schema_version": 1,
//!   "kind": "sequence",
//!   "id": "5f0c…",
//!   "saved_at": "2024-05-01T12:00:00Z",
//!   "software_version": "0.1.0",
//!   "definition": { … }
//! }
//! ```
//!
//! Loading checks the schema version before looking at anything else. A version other
//! than [`SCHEMA_VERSION`] is rejected with [`AutomationError::UnsupportedVersion`];
//! no migration is attempted.

use crate::error::{AppResult, AutomationError};
use crate::script::Script;
use crate::sequence::Sequence;
use crate::sync::ChannelGroup;
use crate::trigger::TriggerSet;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::Path;
use tracing::info;
use uuid::Uuid;

/// Schema version written by this build.
pub const SCHEMA_VERSION: u32 = 1;

/// Which definition a document carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    /// A [`Sequence`].
    Sequence,
    /// A [`TriggerSet`].
    TriggerSet,
    /// A [`ChannelGroup`].
    ChannelGroup,
    /// A [`Script`].
    Script,
}

impl fmt::Display for DocumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DocumentKind::Sequence => "sequence",
            DocumentKind::TriggerSet => "trigger_set",
            DocumentKind::ChannelGroup => "channel_group",
            DocumentKind::Script => "script",
        };
        f.write_str(name)
    }
}

/// An entity that can be stored in a [`Document`].
pub trait Persistable: Serialize + DeserializeOwned {
    /// Kind written to the envelope and checked on load.
    const KIND: DocumentKind;

    /// Id copied into the envelope.
    fn document_id(&self) -> Uuid;

    /// Checks run after deserialization.
    fn validate_loaded(&self) -> AppResult<()> {
        Ok(())
    }
}

impl Persistable for Sequence {
    const KIND: DocumentKind = DocumentKind::Sequence;

    fn document_id(&self) -> Uuid {
        self.id
    }

    fn validate_loaded(&self) -> AppResult<()> {
        self.validate()
    }
}

impl Persistable for TriggerSet {
    const KIND: DocumentKind = DocumentKind::TriggerSet;

    fn document_id(&self) -> Uuid {
        self.id
    }
}

impl Persistable for ChannelGroup {
    const KIND: DocumentKind = DocumentKind::ChannelGroup;

    fn document_id(&self) -> Uuid {
        self.id.0
    }

    fn validate_loaded(&self) -> AppResult<()> {
        self.check_structure()
    }
}

impl Persistable for Script {
    const KIND: DocumentKind = DocumentKind::Script;

    fn document_id(&self) -> Uuid {
        self.id
    }
}

/// Envelope around one persisted definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Format version; only [`SCHEMA_VERSION`] is accepted.
    pub schema_version: u32,
    pub kind: DocumentKind,
    /// Id of the wrapped definition.
    pub id: Uuid,
    pub saved_at: DateTime<Utc>,
    /// Version of the crate that wrote the document.
    #[serde(default)]
    pub software_version: String,
    /// The definition itself, as JSON.
    pub definition: serde_json::Value,
}

/// Wraps `entity` in a current-version envelope.
pub fn to_document<T: Persistable>(entity: &T) -> AppResult<Document> {
    Ok(Document {
        schema_version: SCHEMA_VERSION,
        kind: T::KIND,
        id: entity.document_id(),
        saved_at: Utc::now(),
        software_version: env!("CARGO_PKG_VERSION").to_string(),
        definition: serde_json::to_value(entity)?,
    })
}

/// Unwraps a document, checking its version and kind.
pub fn from_document<T: Persistable>(document: Document) -> AppResult<T> {
    if document.schema_version != SCHEMA_VERSION {
        return Err(AutomationError::UnsupportedVersion {
            found: document.schema_version,
            supported: SCHEMA_VERSION,
        });
    }
    if document.kind != T::KIND {
        return Err(AutomationError::Configuration(format!(
            "Expected a {} document, found {}",
            T::KIND,
            document.kind
        )));
    }
    let entity: T = serde_json::from_value(document.definition)?;
    entity.validate_loaded()?;
    Ok(entity)
}

pub fn to_json<T: Persistable>(entity: &T) -> AppResult<String> {
    Ok(serde_json::to_string_pretty(&to_document(entity)?)?)
}

/// Parses a document from JSON.
///
/// The version field is read on its own first, so a document from a newer schema is
/// reported as [`AutomationError::UnsupportedVersion`] even if the rest of its layout
/// has changed.
pub fn from_json<T: Persistable>(json: &str) -> AppResult<T> {
    #[derive(Deserialize)]
    struct VersionProbe {
        schema_version: u32,
    }

    let probe: VersionProbe = serde_json::from_str(json)?;
    if probe.schema_version != SCHEMA_VERSION {
        return Err(AutomationError::UnsupportedVersion {
            found: probe.schema_version,
            supported: SCHEMA_VERSION,
        });
    }
    from_document(serde_json::from_str(json)?)
}

pub fn save<T: Persistable, P: AsRef<Path>>(entity: &T, path: P) -> AppResult<()> {
    let path = path.as_ref();
    fs::write(path, to_json(entity)?)?;
    info!("Saved {} {} to {}", T::KIND, entity.document_id(), path.display());
    Ok(())
}

pub fn load<T: Persistable, P: AsRef<Path>>(path: P) -> AppResult<T> {
    let path = path.as_ref();
    let entity = from_json(&fs::read_to_string(path)?)?;
    info!("Loaded {} from {}", T::KIND, path.display());
    Ok(entity)
}
