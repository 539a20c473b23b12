use anyhow::bail;
use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::provider::name_service::{NameQuery, NameRecord, NameRecordType, NameService};
use crate::reference::Reference;

/// A [NameService] backed by a list of records in memory
#[derive(Default)]
pub struct InMemoryNameService {
    records: RwLock<Vec<NameRecord>>,
}

impl InMemoryNameService {
    pub fn with_proxies(proxies: &[Reference]) -> InMemoryNameService {
        let records = proxies.iter()
            .enumerate()
            .map(|(i, p)| NameRecord::new(format!("proxy{}", i), "test", *p, NameRecordType::PROXY))
            .collect();
        InMemoryNameService {
            records: RwLock::new(records),
        }
    }

    pub async fn get(&self, address: Reference) -> Option<NameRecord> {
        self.records.read().await
            .iter()
            .find(|r| r.address == address)
            .cloned()
    }
}

#[async_trait]
impl NameService for InMemoryNameService {
    async fn lookup(&self, query: &NameQuery) -> anyhow::Result<Vec<NameRecord>> {
        Ok(self.records.read().await
            .iter()
            .filter(|r| query.matches(r))
            .cloned()
            .collect())
    }

    async fn update(&self, record: NameRecord, is_upsert: bool) -> anyhow::Result<()> {
        let mut records = self.records.write().await;
        match records.iter_mut().find(|r| r.address == record.address) {
            Some(existing) => *existing = record,
            None if is_upsert => records.push(record),
            None => bail!("no record for {}", record.address),
        }
        Ok(())
    }
}
