use super::store::{MetaStore, MetaStoreError};
use std::collections::BTreeMap;
use std::sync::Arc;

pub struct ResourceChecker {
    store: Arc<MetaStore>,
}

impl ResourceChecker {
    pub fn new(store: Arc<MetaStore>) -> Self {
        Self { store }
    }

    // Returns hosts that can't recover because of not having enough resources.
    pub fn check_failure_tolerance(&self) -> Result<Vec<String>, MetaStoreError> {
        // host => proxy addresses
        let mut proxy_map: BTreeMap<&str, Vec<String>> = BTreeMap::new();
        for (proxy_address, proxy_resource) in self.store.all_proxies.iter() {
            proxy_map
                .entry(proxy_resource.host.as_str())
                .or_insert_with(Vec::new)
                .push(proxy_address.clone());
        }

        let mut hosts = vec![];
        for (host, proxy_addresses) in proxy_map.into_iter() {
            let assigned = proxy_addresses.iter().any(|address| {
                self.store
                    .all_proxies
                    .get(address)
                    .map(|proxy| proxy.cluster.is_some())
                    .unwrap_or(false)
            });
            if !assigned {
                continue;
            }
            if !self.check_failure_tolerance_for_one_host(&proxy_addresses)? {
                hosts.push(host.to_string());
            }
        }

        Ok(hosts)
    }

    fn check_failure_tolerance_for_one_host(
        &self,
        proxy_addresses: &[String],
    ) -> Result<bool, MetaStoreError> {
        let mut store = (*self.store).clone();
        // The whole host is down so none of its free proxies can be a replacement.
        store
            .failed_proxies
            .extend(proxy_addresses.iter().cloned());

        for proxy_address in proxy_addresses.iter() {
            let assigned = store
                .all_proxies
                .get(proxy_address)
                .map(|proxy| proxy.cluster.is_some())
                .unwrap_or(false);
            if !assigned {
                continue;
            }
            match store.replace_failed_proxy(proxy_address.clone()) {
                Ok(Some(_)) => (),
                Ok(None) => return Ok(false),
                Err(err) => {
                    error!("ResourceChecker failed to replace failed proxy: {}", err);
                    return Err(err);
                }
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::super::utils::tests::add_testing_proxies;
    use super::*;

    #[test]
    fn test_no_cluster() {
        let mut store = MetaStore::new();
        add_testing_proxies(&mut store, 4, 2);

        let checker = ResourceChecker::new(Arc::new(store));
        let hosts = checker.check_failure_tolerance().unwrap();
        assert!(hosts.is_empty());
    }

    #[test]
    fn test_enough_resources() {
        let mut store = MetaStore::new();
        add_testing_proxies(&mut store, 4, 2);
        store.add_cluster("test_cluster".to_string(), 4).unwrap();

        let checker = ResourceChecker::new(Arc::new(store));
        let hosts = checker.check_failure_tolerance().unwrap();
        assert!(hosts.is_empty());
    }

    #[test]
    fn test_no_enough_resource() {
        let mut store = MetaStore::new();
        add_testing_proxies(&mut store, 4, 2);
        store.add_cluster("test_cluster".to_string(), 16).unwrap();

        let checker = ResourceChecker::new(Arc::new(store));
        let hosts = checker.check_failure_tolerance().unwrap();
        assert_eq!(
            hosts,
            vec!["127.0.0.1", "127.0.0.2", "127.0.0.3", "127.0.0.4"]
        );
    }

    #[test]
    fn test_checker_does_not_touch_store() {
        let mut store = MetaStore::new();
        add_testing_proxies(&mut store, 4, 2);
        store.add_cluster("test_cluster".to_string(), 8).unwrap();
        let store = Arc::new(store);
        let epoch = store.get_global_epoch();

        let checker = ResourceChecker::new(store.clone());
        checker.check_failure_tolerance().unwrap();
        assert_eq!(store.get_global_epoch(), epoch);
        assert!(store.failed_proxies.is_empty());
    }
}
