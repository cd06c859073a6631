//! Process-local discovery store.

use aip_types::discovery::{DiscoveryStore, RecordFilter, ServerRecord};
use aip_types::error::{AipError, AipResult};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

/// Discovery store kept entirely in memory. Cloning shares the records.
#[derive(Clone, Default)]
pub struct MemoryDiscoveryStore {
    records: Arc<RwLock<BTreeMap<String, ServerRecord>>>,
}

impl MemoryDiscoveryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl DiscoveryStore for MemoryDiscoveryStore {
    async fn exists(&self, name: &str) -> AipResult<bool> {
        let records = self.records.read().unwrap_or_else(|e| e.into_inner());
        Ok(records.contains_key(name))
    }

    async fn add(&self, record: ServerRecord) -> AipResult<()> {
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        if records.contains_key(&record.name) {
            return Err(AipError::Store(format!(
                "Record '{}' already exists",
                record.name
            )));
        }
        records.insert(record.name.clone(), record);
        Ok(())
    }

    async fn update(&self, record: ServerRecord) -> AipResult<()> {
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        match records.get_mut(&record.name) {
            Some(existing) => {
                *existing = record;
                Ok(())
            }
            None => Err(AipError::Store(format!("No record named '{}'", record.name))),
        }
    }

    async fn get(&self, name: &str) -> AipResult<Option<ServerRecord>> {
        let records = self.records.read().unwrap_or_else(|e| e.into_inner());
        Ok(records.get(name).cloned())
    }

    async fn query(&self, filter: &RecordFilter) -> AipResult<Vec<ServerRecord>> {
        let records = self.records.read().unwrap_or_else(|e| e.into_inner());
        let matched = records.values().filter(|r| filter.matches(r)).cloned();
        Ok(match filter.limit {
            Some(limit) => matched.take(limit).collect(),
            None => matched.collect(),
        })
    }

    async fn remove(&self, name: &str) -> AipResult<bool> {
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        Ok(records.remove(name).is_some())
    }
}
