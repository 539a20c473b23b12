use std::time::SystemTime;

use async_trait::async_trait;
use bitflags::bitflags;
#[cfg(test)] use mockall::automock;

use crate::reference::Reference;

bitflags! {
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
    pub struct NameRecordType: u32 {
        const HUB = 0x1;
        const HOST = 0x2;
        const PROXY = 0x4;
        const STARTUP = 0x8;
        const LINK = 0x10;
    }
}

/// An entry in the name registry, e.g. a proxy that sockets can link through
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NameRecord {
    pub name: String,
    pub domain: String,
    pub address: Reference,
    pub record_type: NameRecordType,
    pub references: Vec<Reference>,
    pub last_activity: SystemTime,
}

impl NameRecord {
    pub fn new(name: impl Into<String>, domain: impl Into<String>, address: Reference, record_type: NameRecordType) -> NameRecord {
        NameRecord {
            name: name.into(),
            domain: domain.into(),
            address,
            record_type,
            references: Vec::new(),
            last_activity: SystemTime::now(),
        }
    }

    pub fn is_proxy(&self) -> bool {
        self.record_type.contains(NameRecordType::PROXY)
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum NameQuery {
    ByAddress(Reference),
    ByName { name: String, domain: String },
    /// all records having at least the given type bits
    ByType(NameRecordType),
}

impl NameQuery {
    pub fn matches(&self, record: &NameRecord) -> bool {
        match self {
            NameQuery::ByAddress(address) => record.address == *address,
            NameQuery::ByName { name, domain } => record.name == *name && record.domain == *domain,
            NameQuery::ByType(t) => record.record_type.contains(*t),
        }
    }
}

/// The name registry. Its backing store is not part of this library.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NameService: Send + Sync + 'static {
    async fn lookup(&self, query: &NameQuery) -> anyhow::Result<Vec<NameRecord>>;

    /// `is_upsert == false` updates an existing record only
    async fn update(&self, record: NameRecord, is_upsert: bool) -> anyhow::Result<()>;
}
