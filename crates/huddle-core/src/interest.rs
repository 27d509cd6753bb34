//! Interest index.
//!
//! Maps each document to the connections currently listening to it. The
//! index is the fan-out source for join/leave notifications.

use crate::connection::ConnectionId;
use huddle_protocol::DocumentId;
use std::collections::{HashMap, HashSet};
use tracing::trace;

/// Document id to interested connection ids.
#[derive(Debug, Default)]
pub struct InterestIndex {
    documents: HashMap<DocumentId, HashSet<ConnectionId>>,
}

impl InterestIndex {
    /// Create an empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the connections interested in `document`.
    ///
    /// An unknown document has no interested connections.
    #[must_use]
    pub fn interested(&self, document: &str) -> Vec<ConnectionId> {
        self.documents
            .get(document)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Check if a connection is recorded as interested in a document.
    #[must_use]
    pub fn contains(&self, document: &str, connection_id: &str) -> bool {
        self.documents
            .get(document)
            .is_some_and(|set| set.contains(connection_id))
    }

    /// Record a connection's interest in a document.
    ///
    /// Returns `true` if the interest was new.
    pub fn insert(&mut self, document: &str, connection_id: ConnectionId) -> bool {
        let inserted = self
            .documents
            .entry(document.to_string())
            .or_default()
            .insert(connection_id);
        if inserted {
            trace!(document = %document, "Interest added");
        }
        inserted
    }

    /// Remove a connection's interest in a document.
    ///
    /// Returns `true` if the interest was present.
    pub fn remove(&mut self, document: &str, connection_id: &str) -> bool {
        self.documents
            .get_mut(document)
            .is_some_and(|set| set.remove(connection_id))
    }

    /// Drop the entry for `document` if nobody is interested in it anymore.
    pub fn prune(&mut self, document: &str) -> bool {
        if self.documents.get(document).is_some_and(HashSet::is_empty) {
            self.documents.remove(document);
            trace!(document = %document, "Pruned empty document");
            return true;
        }
        false
    }

    /// Number of documents with an entry.
    #[must_use]
    pub fn document_count(&self) -> usize {
        self.documents.len()
    }

    /// Total number of `(document, connection)` pairs.
    #[must_use]
    pub fn interest_count(&self) -> usize {
        self.documents.values().map(HashSet::len).sum()
    }

    /// Iterate over every `(document, connection)` pair.
    pub fn pairs(&self) -> impl Iterator<Item = (&DocumentId, &ConnectionId)> {
        self.documents
            .iter()
            .flat_map(|(doc, set)| set.iter().map(move |id| (doc, id)))
    }

    /// Check if the index is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_remove() {
        let mut index = InterestIndex::new();

        assert!(index.insert("doc", "c1".into()));
        assert!(!index.insert("doc", "c1".into()));
        assert!(index.insert("doc", "c2".into()));
        assert!(index.contains("doc", "c1"));
        assert_eq!(index.interest_count(), 2);

        assert!(index.remove("doc", "c1"));
        assert!(!index.remove("doc", "c1"));
        assert!(!index.contains("doc", "c1"));
    }

    #[test]
    fn test_unknown_document_reads_empty() {
        let mut index = InterestIndex::new();

        assert!(index.interested("missing").is_empty());
        assert!(!index.remove("missing", "c1"));
        assert!(index.is_empty());
    }

    #[test]
    fn test_prune() {
        let mut index = InterestIndex::new();
        index.insert("doc", "c1".into());

        assert!(!index.prune("doc"));
        index.remove("doc", "c1");
        assert!(index.prune("doc"));
        assert_eq!(index.document_count(), 0);
    }

    #[test]
    fn test_pairs() {
        let mut index = InterestIndex::new();
        index.insert("a", "c1".into());
        index.insert("b", "c1".into());
        index.insert("b", "c2".into());

        let mut pairs: Vec<(String, String)> = index
            .pairs()
            .map(|(d, c)| (d.clone(), c.to_string()))
            .collect();
        pairs.sort();
        assert_eq!(
            pairs,
            vec![
                ("a".to_string(), "c1".to_string()),
                ("b".to_string(), "c1".to_string()),
                ("b".to_string(), "c2".to_string()),
            ]
        );
    }
}
