use thiserror::Error;

/// Storage-layer failures that callers branch on by kind.
///
/// Malformed blob addresses are deliberately absent: those are counted and
/// logged at the row that produced them and the scan moves on.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Pre-existing corruption found before any destructive step. Aborts the
    /// whole run.
    #[error("integrity check failed: {0}")]
    Integrity(String),

    /// An external storage cluster could not be opened. The cluster is
    /// skipped; the rest of the scan continues.
    #[error("cluster {cluster} is unavailable: {reason}")]
    ClusterUnavailable { cluster: String, reason: String },

    /// A redirect chain revisited a title it had already passed through.
    #[error("circular redirect chain via {0}")]
    CircularRedirect(String),

    /// The row changed between read and write, so this item's fix was
    /// abandoned.
    #[error("concurrent modification: {0}")]
    ConcurrentModification(String),
}

impl StoreError {
    pub fn cluster_unavailable(cluster: &str, reason: impl Into<String>) -> Self {
        Self::ClusterUnavailable {
            cluster: cluster.to_string(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integrity_message_names_the_check() {
        let error = StoreError::Integrity("historical blob stubs present".to_string());
        assert_eq!(
            error.to_string(),
            "integrity check failed: historical blob stubs present"
        );
    }

    #[test]
    fn cluster_unavailable_message_includes_cluster_and_reason() {
        let error = StoreError::cluster_unavailable("cluster2", "unable to open database file");
        assert_eq!(
            error.to_string(),
            "cluster cluster2 is unavailable: unable to open database file"
        );
    }

    #[test]
    fn circular_redirect_message_names_the_title() {
        let error = StoreError::CircularRedirect("0:Loop_start".to_string());
        assert!(error.to_string().contains("Loop_start"));
    }
}
