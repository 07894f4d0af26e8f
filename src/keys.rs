//! Store key layout.
//!
//! Every key lives under a configurable namespace. A queue owns a stream, a
//! consumer group and a dedup set; outcome lists and stat maps exist both
//! globally and per queue.

use crate::outcome::OutcomeKind;

/// Namespace-level keys shared by every queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    namespace: String,
}

impl KeySpace {
    /// Create a key space rooted at `namespace`.
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    /// The namespace prefix.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn internals(&self, suffix: &str) -> String {
        format!("{}:internals:{}", self.namespace, suffix)
    }

    /// Global outcome list for `kind`.
    pub fn outcome_list(&self, kind: OutcomeKind) -> String {
        self.internals(kind.list_name())
    }

    /// Global stats hash.
    pub fn stats(&self) -> String {
        self.internals("stat")
    }

    /// Set of every queue name ever used.
    pub fn queue_names(&self) -> String {
        self.internals("qnames")
    }

    /// Keys for one queue.
    pub fn queue(&self, qname: &str) -> QueueKeys {
        let stream = format!("{}:queue:{}", self.namespace, qname);
        QueueKeys {
            qname: qname.to_string(),
            dedup_set: format!("{stream}:dedupset"),
            group: format!("{stream}:cg"),
            stream,
            space: self.clone(),
        }
    }
}

/// Keys belonging to a single queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueKeys {
    /// Queue name
    pub qname: String,
    /// Backing stream
    pub stream: String,
    /// Dedup key set
    pub dedup_set: String,
    /// Consumer group name
    pub group: String,
    space: KeySpace,
}

impl QueueKeys {
    /// The namespace these keys belong to.
    pub fn space(&self) -> &KeySpace {
        &self.space
    }

    /// Per-queue outcome list for `kind`.
    pub fn outcome_list(&self, kind: OutcomeKind) -> String {
        format!("{}:{}", self.space.outcome_list(kind), self.qname)
    }

    /// Per-queue stats hash.
    pub fn stats(&self) -> String {
        format!("{}:{}", self.space.stats(), self.qname)
    }

    /// Global queue-name registry.
    pub fn queue_names(&self) -> String {
        self.space.queue_names()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_layout() {
        let keys = KeySpace::new("ns").queue("emails");

        assert_eq!(keys.stream, "ns:queue:emails");
        assert_eq!(keys.dedup_set, "ns:queue:emails:dedupset");
        assert_eq!(keys.group, "ns:queue:emails:cg");
        assert_eq!(keys.stats(), "ns:internals:stat:emails");
        assert_eq!(keys.queue_names(), "ns:internals:qnames");
    }

    #[test]
    fn test_outcome_lists() {
        let space = KeySpace::new("ns");
        let keys = space.queue("q");

        assert_eq!(space.outcome_list(OutcomeKind::Success), "ns:internals:results");
        assert_eq!(keys.outcome_list(OutcomeKind::Failure), "ns:internals:failed:q");
        assert_eq!(keys.outcome_list(OutcomeKind::Dead), "ns:internals:dead:q");
    }
}
