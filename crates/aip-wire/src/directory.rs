//! Agent directory: which worker connection hosts which agent kind.

use aip_types::error::{AipError, AipResult};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

/// Maps agent kinds to the worker connection currently hosting them.
///
/// A kind is hosted by at most one live worker. Registration by the current
/// host is idempotent; registration by anyone else fails until the host
/// releases the kind (normally by disconnecting).
#[derive(Debug, Clone, Default)]
pub struct Directory {
    kinds: Arc<RwLock<HashMap<String, String>>>,
}

impl Directory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `kind` to `worker_id`.
    pub fn register(&self, kind: &str, worker_id: &str) -> AipResult<()> {
        let mut kinds = self.kinds.write().unwrap_or_else(|e| e.into_inner());
        match kinds.get(kind) {
            Some(existing) if existing == worker_id => Ok(()),
            Some(existing) => {
                warn!(
                    kind = %kind,
                    host = %existing,
                    claimant = %worker_id,
                    "Rejected kind registration: already hosted"
                );
                Err(AipError::KindConflict(kind.to_string()))
            }
            None => {
                debug!(kind = %kind, worker = %worker_id, "Kind registered");
                kinds.insert(kind.to_string(), worker_id.to_string());
                Ok(())
            }
        }
    }

    /// Bind every kind in `kinds` to `worker_id`, or none of them.
    pub fn register_all(&self, kinds: &[String], worker_id: &str) -> AipResult<()> {
        let mut table = self.kinds.write().unwrap_or_else(|e| e.into_inner());
        if let Some(conflict) = kinds
            .iter()
            .find(|k| table.get(*k).is_some_and(|host| host != worker_id))
        {
            warn!(kind = %conflict, claimant = %worker_id, "Rejected kind registration: already hosted");
            return Err(AipError::KindConflict(conflict.clone()));
        }
        for kind in kinds {
            table.insert(kind.clone(), worker_id.to_string());
        }
        Ok(())
    }

    /// The worker hosting `kind`, if any.
    pub fn lookup(&self, kind: &str) -> Option<String> {
        let kinds = self.kinds.read().unwrap_or_else(|e| e.into_inner());
        kinds.get(kind).cloned()
    }

    /// Drop every binding owned by `worker_id`; returns the released kinds.
    pub fn release_worker(&self, worker_id: &str) -> Vec<String> {
        let mut kinds = self.kinds.write().unwrap_or_else(|e| e.into_inner());
        let released: Vec<String> = kinds
            .iter()
            .filter(|(_, host)| host.as_str() == worker_id)
            .map(|(kind, _)| kind.clone())
            .collect();
        for kind in &released {
            kinds.remove(kind);
        }
        released
    }

    /// Kinds hosted by `worker_id`, sorted.
    pub fn kinds_of(&self, worker_id: &str) -> Vec<String> {
        let kinds = self.kinds.read().unwrap_or_else(|e| e.into_inner());
        let mut out: Vec<String> = kinds
            .iter()
            .filter(|(_, host)| host.as_str() == worker_id)
            .map(|(kind, _)| kind.clone())
            .collect();
        out.sort();
        out
    }

    pub fn len(&self) -> usize {
        self.kinds.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_lookup() {
        let dir = Directory::new();
        dir.register("tools", "w1").unwrap();
        assert_eq!(dir.lookup("tools").as_deref(), Some("w1"));
        assert!(dir.lookup("missing").is_none());
    }

    #[test]
    fn test_second_host_conflicts() {
        let dir = Directory::new();
        dir.register("tools", "w1").unwrap();
        dir.register("tools", "w1").unwrap();
        match dir.register("tools", "w2") {
            Err(AipError::KindConflict(kind)) => assert_eq!(kind, "tools"),
            other => panic!("Expected KindConflict, got {other:?}"),
        }
        assert_eq!(dir.lookup("tools").as_deref(), Some("w1"));
    }

    #[test]
    fn test_register_all_is_atomic() {
        let dir = Directory::new();
        dir.register("b", "w1").unwrap();
        let err = dir.register_all(&["a".into(), "b".into()], "w2");
        assert!(err.is_err());
        assert!(dir.lookup("a").is_none());
    }

    #[test]
    fn test_release_frees_kinds() {
        let dir = Directory::new();
        dir.register_all(&["a".into(), "b".into()], "w1").unwrap();
        dir.register("c", "w2").unwrap();
        let mut released = dir.release_worker("w1");
        released.sort();
        assert_eq!(released, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(dir.len(), 1);
        dir.register("a", "w2").unwrap();
        assert_eq!(dir.kinds_of("w2"), vec!["a".to_string(), "c".to_string()]);
    }
}
