//! Shared domain types: scenes, phases, trigger kinds, bulk modes

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque scene identifier owned by the library collaborator
pub type SceneId = i64;

/// Read-only view of a scene as the ingest core sees it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scene {
    pub id: SceneId,

    /// Absolute path to the source file
    pub path: String,

    pub has_metadata: bool,
    pub has_thumbnail: bool,
    pub has_sprites: bool,
}

impl Scene {
    /// Whether the derivation artifact for `phase` already exists
    pub fn has_phase(&self, phase: Phase) -> bool {
        match phase {
            Phase::Metadata => self.has_metadata,
            Phase::Thumbnail => self.has_thumbnail,
            Phase::Sprites => self.has_sprites,
        }
    }
}

/// Derivation phase applied to a scene
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Metadata,
    Thumbnail,
    Sprites,
}

impl Phase {
    /// All processing phases, in derivation order
    pub const ALL: [Phase; 3] = [Phase::Metadata, Phase::Thumbnail, Phase::Sprites];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Metadata => "metadata",
            Phase::Thumbnail => "thumbnail",
            Phase::Sprites => "sprites",
        }
    }

    /// Parse from a request path or stored row
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "metadata" => Ok(Phase::Metadata),
            "thumbnail" => Ok(Phase::Thumbnail),
            "sprites" => Ok(Phase::Sprites),
            other => Err(Error::validation(format!("unknown phase: {}", other))),
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Slot in the trigger table. `Scan` configures library-wide sweeps and is
/// never a job phase of its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerSlot {
    Metadata,
    Thumbnail,
    Sprites,
    Scan,
}

impl TriggerSlot {
    pub const ALL: [TriggerSlot; 4] = [
        TriggerSlot::Metadata,
        TriggerSlot::Thumbnail,
        TriggerSlot::Sprites,
        TriggerSlot::Scan,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerSlot::Metadata => "metadata",
            TriggerSlot::Thumbnail => "thumbnail",
            TriggerSlot::Sprites => "sprites",
            TriggerSlot::Scan => "scan",
        }
    }

    /// The processing phase behind this slot, if any
    pub fn phase(&self) -> Option<Phase> {
        match self {
            TriggerSlot::Metadata => Some(Phase::Metadata),
            TriggerSlot::Thumbnail => Some(Phase::Thumbnail),
            TriggerSlot::Sprites => Some(Phase::Sprites),
            TriggerSlot::Scan => None,
        }
    }
}

impl From<Phase> for TriggerSlot {
    fn from(phase: Phase) -> Self {
        match phase {
            Phase::Metadata => TriggerSlot::Metadata,
            Phase::Thumbnail => TriggerSlot::Thumbnail,
            Phase::Sprites => TriggerSlot::Sprites,
        }
    }
}

impl fmt::Display for TriggerSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// When a trigger slot fires
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    /// Run when a scene is imported (metadata only)
    OnImport,

    /// Run after another phase completes
    AfterJob,

    /// Only explicit submissions
    Manual,

    /// Cron schedule
    Scheduled,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerType::OnImport => "on_import",
            TriggerType::AfterJob => "after_job",
            TriggerType::Manual => "manual",
            TriggerType::Scheduled => "scheduled",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "on_import" => Ok(TriggerType::OnImport),
            "after_job" => Ok(TriggerType::AfterJob),
            "manual" => Ok(TriggerType::Manual),
            "scheduled" => Ok(TriggerType::Scheduled),
            other => Err(Error::validation(format!("unknown trigger type: {}", other))),
        }
    }
}

impl fmt::Display for TriggerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scope selector for bulk phase submissions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BulkMode {
    /// Only scenes whose phase flag is not yet set
    Missing,

    /// Every scene
    All,
}

impl BulkMode {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "missing" => Ok(BulkMode::Missing),
            "all" => Ok(BulkMode::All),
            other => Err(Error::validation(format!("unknown bulk mode: {}", other))),
        }
    }
}

/// The already-authenticated caller, as resolved by the HTTP layer.
/// Core operations receive it explicitly; nothing is smuggled through
/// task-local context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subject {
    pub name: String,
}

impl Subject {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn anonymous() -> Self {
        Self {
            name: "anonymous".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_parse() {
        assert_eq!(Phase::parse("metadata").unwrap(), Phase::Metadata);
        assert_eq!(Phase::parse("sprites").unwrap(), Phase::Sprites);
        assert!(Phase::parse("scan").is_err());
        assert!(Phase::parse("METADATA").is_err());
    }

    #[test]
    fn test_trigger_type_parse() {
        assert_eq!(TriggerType::parse("on_import").unwrap(), TriggerType::OnImport);
        assert_eq!(TriggerType::parse("after_job").unwrap(), TriggerType::AfterJob);
        assert!(TriggerType::parse("onimport").is_err());
    }

    #[test]
    fn test_bulk_mode_parse() {
        assert_eq!(BulkMode::parse("missing").unwrap(), BulkMode::Missing);
        assert_eq!(BulkMode::parse("all").unwrap(), BulkMode::All);
        assert!(BulkMode::parse("everything").is_err());
    }

    #[test]
    fn test_scene_has_phase() {
        let scene = Scene {
            id: 1,
            path: "/media/a.mp4".to_string(),
            has_metadata: true,
            has_thumbnail: false,
            has_sprites: false,
        };
        assert!(scene.has_phase(Phase::Metadata));
        assert!(!scene.has_phase(Phase::Thumbnail));
    }

    #[test]
    fn test_slot_phase_mapping() {
        assert_eq!(TriggerSlot::Thumbnail.phase(), Some(Phase::Thumbnail));
        assert_eq!(TriggerSlot::Scan.phase(), None);
        assert_eq!(TriggerSlot::from(Phase::Sprites), TriggerSlot::Sprites);
    }
}
