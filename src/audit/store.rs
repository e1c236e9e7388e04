//! On-disk layout of the audit namespace.
//!
//! ```text
//! <root>/log                              audit record stream
//! <root>/<trace_id>/<transaction_id>/req  request body artifact
//! <root>/<trace_id>/<transaction_id>/res  response body artifact
//! ```

use std::path::{Path, PathBuf};

use crate::capture::{ArtifactDir, SinkFlavor};

/// File name of the audit record stream under the root.
pub const LOG_FILE: &str = "log";
/// Leaf name of a request body artifact.
pub const REQUEST_LEAF: &str = "req";
/// Leaf name of a response body artifact.
pub const RESPONSE_LEAF: &str = "res";

/// Maps transaction identities to storage paths.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
    flavor: SinkFlavor,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>, flavor: SinkFlavor) -> Self {
        Self {
            root: root.into(),
            flavor,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn flavor(&self) -> SinkFlavor {
        self.flavor
    }

    pub fn log_path(&self) -> PathBuf {
        self.root.join(LOG_FILE)
    }

    /// Directory handle for one transaction. Not created until an artifact
    /// is written into it.
    pub fn transaction_dir(&self, trace_id: &str, transaction_id: &str) -> ArtifactDir {
        ArtifactDir::new(self.root.join(trace_id).join(transaction_id))
    }
}

/// Whether `id` is safe to use as a single directory name under the root.
///
/// Rejects separators, traversal components, and the name of the log file.
pub fn is_valid_segment(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 128
        && id != "."
        && id != ".."
        && id != LOG_FILE
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_paths() {
        let store = ArtifactStore::new("/var/audit", SinkFlavor::Plain);
        assert_eq!(store.log_path(), PathBuf::from("/var/audit/log"));
        let dir = store.transaction_dir("abc123", "tx-1");
        assert_eq!(dir.path(), Path::new("/var/audit/abc123/tx-1"));
        assert_eq!(dir.path().join(REQUEST_LEAF), PathBuf::from("/var/audit/abc123/tx-1/req"));
    }

    #[test]
    fn segment_validation() {
        assert!(is_valid_segment("abc123"));
        assert!(is_valid_segment("0af7651916cd43dd8448eb211c80319c"));
        assert!(is_valid_segment("trace_1.2-x"));

        assert!(!is_valid_segment(""));
        assert!(!is_valid_segment("."));
        assert!(!is_valid_segment(".."));
        assert!(!is_valid_segment("../etc"));
        assert!(!is_valid_segment("a/b"));
        assert!(!is_valid_segment("a\\b"));
        assert!(!is_valid_segment("log"));
        assert!(!is_valid_segment("with space"));
        assert!(!is_valid_segment(&"x".repeat(129)));
    }
}
