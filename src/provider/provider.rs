use std::sync::Arc;

use tracing::debug;

use crate::address::SocketAddress;
use crate::config::ProxyConfig;
use crate::provider::name_service::{NameQuery, NameRecord, NameRecordType, NameService};
use crate::provider::remoting::Remoting;
use crate::provider::stream_service::StreamService;
use crate::reference::Reference;

/// The context every socket is created with: configuration and the external services it talks
///  to. There is no global instance, callers pass a provider explicitly.
pub struct Provider {
    pub config: Arc<ProxyConfig>,
    pub name_service: Arc<dyn NameService>,
    pub remoting: Arc<dyn Remoting>,
    pub stream_service: Arc<dyn StreamService>,
}

impl Provider {
    pub fn new(
        config: ProxyConfig,
        name_service: Arc<dyn NameService>,
        remoting: Arc<dyn Remoting>,
        stream_service: Arc<dyn StreamService>,
    ) -> anyhow::Result<Arc<Provider>> {
        config.validate()?;

        Ok(Arc::new(Provider {
            config: Arc::new(config),
            name_service,
            remoting,
            stream_service,
        }))
    }

    /// Determines the proxies a socket for the given address can link through:
    /// * a `Proxy` address whose host is a reference names one specific proxy
    /// * an `Inet6` address carrying the reference of a registered proxy names that proxy
    /// * anything else can go through any proxy
    ///
    /// Collections resolve to the union of their members' candidates.
    pub async fn resolve_proxies(&self, address: &SocketAddress) -> anyhow::Result<Vec<NameRecord>> {
        let mut result: Vec<NameRecord> = Vec::new();
        let mut all_proxies_added = false;

        for addr in address.iter() {
            let candidates = match self.specific_proxy(addr).await? {
                Some(records) => records,
                None if all_proxies_added => continue,
                None => {
                    all_proxies_added = true;
                    self.name_service.lookup(&NameQuery::ByType(NameRecordType::PROXY)).await?
                }
            };

            for record in candidates {
                if !result.iter().any(|r| r.address == record.address) {
                    result.push(record);
                }
            }
        }

        debug!("resolved {} proxy candidates for {}", result.len(), address);
        Ok(result)
    }

    async fn specific_proxy(&self, address: &SocketAddress) -> anyhow::Result<Option<Vec<NameRecord>>> {
        match address {
            SocketAddress::Proxy { .. } => match address.to_reference() {
                Some(reference) => Ok(Some(self.lookup_proxy(reference).await?)),
                None => Ok(None),
            },
            SocketAddress::Inet6 { .. } | SocketAddress::Bound { .. } => {
                let Some(reference) = address.to_reference() else {
                    return Ok(None);
                };
                let records = self.lookup_proxy(reference).await?;
                if records.is_empty() {
                    // a plain IPv6 address
                    Ok(None)
                }
                else {
                    Ok(Some(records))
                }
            }
            _ => Ok(None),
        }
    }

    async fn lookup_proxy(&self, reference: Reference) -> anyhow::Result<Vec<NameRecord>> {
        let records = self.name_service.lookup(&NameQuery::ByAddress(reference)).await?;
        Ok(records.into_iter()
            .filter(|r| r.is_proxy())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::name_service::MockNameService;
    use crate::provider::remoting::MockRemoting;
    use crate::provider::stream_service::MockStreamService;
    use mockall::predicate::eq;

    fn proxy_record(b: u8) -> NameRecord {
        NameRecord::new(format!("proxy{}", b), "test", Reference::from_bytes([b; 16]), NameRecordType::PROXY)
    }

    fn addresses(records: &[NameRecord]) -> Vec<Reference> {
        records.iter().map(|r| r.address).collect()
    }

    fn provider(name_service: MockNameService) -> Arc<Provider> {
        Provider::new(
            ProxyConfig::default(),
            Arc::new(name_service),
            Arc::new(MockRemoting::new()),
            Arc::new(MockStreamService::new()),
        ).unwrap()
    }

    #[test]
    fn test_new_validates_config() {
        let config = ProxyConfig { max_receive_buffer: 0, ..Default::default() };
        assert!(Provider::new(
            config,
            Arc::new(MockNameService::new()),
            Arc::new(MockRemoting::new()),
            Arc::new(MockStreamService::new()),
        ).is_err());
    }

    #[tokio::test]
    async fn test_resolve_proxy_host_reference() {
        let mut name_service = MockNameService::new();
        name_service.expect_lookup()
            .with(eq(NameQuery::ByAddress(Reference::from_bytes([2; 16]))))
            .times(1)
            .returning(|_| Ok(vec![proxy_record(2)]));

        let address = SocketAddress::proxy(Reference::from_bytes([2; 16]).to_string(), 0);
        let resolved = provider(name_service).resolve_proxies(&address).await.unwrap();
        assert_eq!(addresses(&resolved), vec![Reference::from_bytes([2; 16])]);
    }

    #[tokio::test]
    async fn test_resolve_host_name_uses_all_proxies() {
        let mut name_service = MockNameService::new();
        name_service.expect_lookup()
            .with(eq(NameQuery::ByType(NameRecordType::PROXY)))
            .times(1)
            .returning(|_| Ok(vec![proxy_record(1), proxy_record(2), proxy_record(3)]));

        let resolved = provider(name_service).resolve_proxies(&SocketAddress::proxy("www.example.com", 80)).await.unwrap();
        assert_eq!(resolved.len(), 3);
    }

    #[tokio::test]
    async fn test_resolve_plain_ipv6_falls_back_to_all_proxies() {
        let mut name_service = MockNameService::new();
        name_service.expect_lookup()
            .with(eq(NameQuery::ByAddress(Reference::from_bytes([0x20; 16]))))
            .returning(|_| Ok(vec![]));
        name_service.expect_lookup()
            .with(eq(NameQuery::ByType(NameRecordType::PROXY)))
            .returning(|_| Ok(vec![proxy_record(1)]));

        let address = SocketAddress::Inet6 { addr: [0x20; 16], port: 443, flow: 0, scope_id: 0 };
        let resolved = provider(name_service).resolve_proxies(&address).await.unwrap();
        assert_eq!(addresses(&resolved), vec![Reference::from_bytes([1; 16])]);
    }

    #[tokio::test]
    async fn test_resolve_collection_is_deduplicated() {
        let mut name_service = MockNameService::new();
        name_service.expect_lookup()
            .with(eq(NameQuery::ByType(NameRecordType::PROXY)))
            .times(1)
            .returning(|_| Ok(vec![proxy_record(1), proxy_record(2)]));
        name_service.expect_lookup()
            .with(eq(NameQuery::ByAddress(Reference::from_bytes([2; 16]))))
            .returning(|_| Ok(vec![proxy_record(2)]));

        let address = SocketAddress::collection(vec![
            SocketAddress::proxy("a.example.com", 1),
            SocketAddress::proxy("b.example.com", 1),
            SocketAddress::proxy(Reference::from_bytes([2; 16]).to_string(), 0),
        ]);
        let resolved = provider(name_service).resolve_proxies(&address).await.unwrap();
        assert_eq!(addresses(&resolved), vec![Reference::from_bytes([1; 16]), Reference::from_bytes([2; 16])]);
    }
}
