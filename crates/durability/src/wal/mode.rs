//! Durability mode configuration

use serde::{Deserialize, Serialize};

/// Controls when WAL appends reach the disk
///
/// # Modes
///
/// | Mode | Write | fsync | Data Loss Window |
/// |------|-------|-------|------------------|
/// | Cache | never | never | everything |
/// | Flush | every append, flushed to the OS | never | OS crash only |
/// | Always | every append | every append | none |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DurabilityMode {
    /// No WAL file at all
    ///
    /// Appends are counted but not written. Replay finds nothing.
    /// Use case: tests and throwaway nodes.
    Cache,

    /// Every append is flushed out of process buffers before returning
    #[default]
    Flush,

    /// Every append is flushed and fsynced before returning
    Always,
}

impl DurabilityMode {
    /// False only for Cache
    pub fn requires_wal(&self) -> bool {
        !matches!(self, DurabilityMode::Cache)
    }

    /// True only for Always
    pub fn requires_fsync(&self) -> bool {
        matches!(self, DurabilityMode::Always)
    }

    /// Human-readable description of the mode
    pub fn description(&self) -> &'static str {
        match self {
            DurabilityMode::Cache => "Cache (no WAL, all data lost on restart)",
            DurabilityMode::Flush => "Flush (write-through to the OS on every append)",
            DurabilityMode::Always => "Always (fsync on every append)",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_flush() {
        assert_eq!(DurabilityMode::default(), DurabilityMode::Flush);
    }

    #[test]
    fn test_predicates() {
        assert!(!DurabilityMode::Cache.requires_wal());
        assert!(DurabilityMode::Flush.requires_wal());
        assert!(!DurabilityMode::Flush.requires_fsync());
        assert!(DurabilityMode::Always.requires_fsync());
    }

    #[test]
    fn test_serde_names() {
        assert_eq!(
            serde_json::to_string(&DurabilityMode::Always).unwrap(),
            "\"always\""
        );
        let mode: DurabilityMode = serde_json::from_str("\"cache\"").unwrap();
        assert_eq!(mode, DurabilityMode::Cache);
    }
}
