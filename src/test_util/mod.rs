//! In-memory implementations of the external services (name registry, control channel, stream
//!  transport) for testing code that uses proxy sockets without actual proxies. They are used
//!  for testing this crate itself, but they are also exported for application testing.

pub mod name_service;
pub mod remoting;
pub mod stream;

use std::sync::Arc;

use crate::config::ProxyConfig;
use crate::provider::provider::Provider;
use crate::reference::Reference;
use crate::test_util::name_service::InMemoryNameService;
use crate::test_util::remoting::FakeRemoting;
use crate::test_util::stream::FakeStreamService;

/// A [Provider] wired to in-memory fakes with a given number of registered proxies
pub struct TestEnv {
    pub provider: Arc<Provider>,
    pub name_service: Arc<InMemoryNameService>,
    pub remoting: Arc<FakeRemoting>,
    pub stream_service: Arc<FakeStreamService>,
    pub proxies: Vec<Reference>,
}

impl TestEnv {
    pub fn new(num_proxies: u8) -> TestEnv {
        Self::with_config(num_proxies, ProxyConfig::default())
    }

    pub fn with_config(num_proxies: u8, config: ProxyConfig) -> TestEnv {
        let proxies = (1..=num_proxies)
            .map(|i| Reference::from_bytes([i; 16]))
            .collect::<Vec<_>>();

        let name_service = Arc::new(InMemoryNameService::with_proxies(&proxies));
        let remoting = Arc::new(FakeRemoting::default());
        let stream_service = Arc::new(FakeStreamService::default());

        let provider = Provider::new(config, name_service.clone(), remoting.clone(), stream_service.clone())
            .expect("test configuration should be valid");

        TestEnv {
            provider,
            name_service,
            remoting,
            stream_service,
            proxies,
        }
    }

    pub async fn proxy_record(&self, index: usize) -> crate::provider::name_service::NameRecord {
        self.name_service.get(self.proxies[index]).await
            .expect("proxy should be registered")
    }
}
