use super::query::MetaStoreQuery;
use super::store::{HostProxy, MetaStore, MetaStoreError, CHUNK_PARTS};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::num::NonZeroUsize;

// The free proxies grouped by host, together with how many chunks
// already link each pair of hosts.
pub struct ResourcePool {
    // host => free proxies
    free_hosts: BTreeMap<String, BTreeSet<String>>,
    // host => peer host => linked chunk number
    link_table: BTreeMap<String, BTreeMap<String, usize>>,
}

impl ResourcePool {
    pub fn new(store: &MetaStore) -> Self {
        let mut free_hosts: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for host_proxy in MetaStoreQuery::new(store).get_free_proxies().into_iter() {
            let HostProxy {
                host,
                proxy_address,
            } = host_proxy;
            free_hosts
                .entry(host)
                .or_insert_with(BTreeSet::new)
                .insert(proxy_address);
        }

        let mut link_table: BTreeMap<String, BTreeMap<String, usize>> = BTreeMap::new();
        for cluster in store.clusters.values() {
            for chunk in cluster.chunks.iter() {
                let first_host = chunk.hosts[0].clone();
                let second_host = chunk.hosts[1].clone();
                *link_table
                    .entry(first_host.clone())
                    .or_insert_with(BTreeMap::new)
                    .entry(second_host.clone())
                    .or_insert(0) += 1;
                *link_table
                    .entry(second_host)
                    .or_insert_with(BTreeMap::new)
                    .entry(first_host)
                    .or_insert(0) += 1;
            }
        }

        Self {
            free_hosts,
            link_table,
        }
    }

    pub fn free_proxy_num(&self) -> usize {
        self.free_hosts.values().map(|proxies| proxies.len()).sum()
    }

    fn link_count(&self, host1: &str, host2: &str) -> usize {
        self.link_table
            .get(host1)
            .and_then(|peers| peers.get(host2))
            .cloned()
            .unwrap_or(0)
    }

    fn add_link(&mut self, host1: &str, host2: &str) {
        *self
            .link_table
            .entry(host1.to_string())
            .or_insert_with(BTreeMap::new)
            .entry(host2.to_string())
            .or_insert(0) += 1;
        *self
            .link_table
            .entry(host2.to_string())
            .or_insert_with(BTreeMap::new)
            .entry(host1.to_string())
            .or_insert(0) += 1;
    }

    fn take_proxy(&mut self, host: &str) -> Result<String, MetaStoreError> {
        let proxies = self.free_hosts.get_mut(host).ok_or_else(|| {
            error!("invalid state: host {} not found in free hosts", host);
            MetaStoreError::InvalidState
        })?;
        let proxy_address = proxies.iter().next().cloned().ok_or_else(|| {
            error!("invalid state: no free proxy left in host {}", host);
            MetaStoreError::InvalidState
        })?;
        proxies.remove(&proxy_address);
        if proxies.is_empty() {
            self.free_hosts.remove(host);
        }
        Ok(proxy_address)
    }

    // Pairs `2 * chunk_num` free proxies into chunks, two different hosts per chunk.
    // The proxies taken out are removed from the pool.
    pub fn allocate_chunks(
        &mut self,
        chunk_num: NonZeroUsize,
    ) -> Result<Vec<[String; CHUNK_PARTS]>, MetaStoreError> {
        let k = chunk_num.get();

        // A host can contribute at most one proxy to each chunk.
        let mut quotas: BTreeMap<String, usize> = self
            .free_hosts
            .iter()
            .map(|(host, proxies)| (host.clone(), std::cmp::min(proxies.len(), k)))
            .collect();
        let mut total: usize = quotas.values().sum();
        if total < 2 * k {
            return Err(MetaStoreError::NoAvailableResource);
        }

        while total > 2 * k {
            let host = Self::max_quota_host(&quotas)?;
            if let Some(quota) = quotas.get_mut(&host) {
                *quota -= 1;
            }
            total -= 1;
        }

        // No host ever holds more than half of the remaining quota,
        // so the pairing below never gets stuck.
        let mut chunks = Vec::with_capacity(k);
        while total > 0 {
            let first_host = Self::max_quota_host(&quotas)?;

            let forced_host = quotas
                .iter()
                .find(|(host, quota)| **host != first_host && **quota * 2 == total)
                .map(|(host, _)| host.clone());

            let second_host = match forced_host {
                Some(host) => host,
                None => quotas
                    .iter()
                    .filter(|(host, quota)| **host != first_host && **quota > 0)
                    .min_by(|(host1, quota1), (host2, quota2)| {
                        self.link_count(&first_host, host1)
                            .cmp(&self.link_count(&first_host, host2))
                            .then_with(|| quota2.cmp(quota1))
                            .then_with(|| host1.cmp(host2))
                    })
                    .map(|(host, _)| host.clone())
                    .ok_or_else(|| {
                        error!("invalid state: cannot find second host for {}", first_host);
                        MetaStoreError::InvalidState
                    })?,
            };

            for host in [&first_host, &second_host].iter() {
                if let Some(quota) = quotas.get_mut(host.as_str()) {
                    *quota -= 1;
                }
            }
            total -= 2;

            let first_proxy = self.take_proxy(&first_host)?;
            let second_proxy = self.take_proxy(&second_host)?;
            self.add_link(&first_host, &second_host);
            chunks.push([first_proxy, second_proxy]);
        }

        Ok(chunks)
    }

    fn max_quota_host(quotas: &BTreeMap<String, usize>) -> Result<String, MetaStoreError> {
        // The iteration is sorted by host so the first maximum wins ties.
        quotas
            .iter()
            .filter(|(_, quota)| **quota > 0)
            .max_by(|(host1, quota1), (host2, quota2)| match quota1.cmp(quota2) {
                Ordering::Equal => host2.cmp(host1),
                other => other,
            })
            .map(|(host, _)| host.clone())
            .ok_or_else(|| {
                error!("invalid state: no host left in quotas");
                MetaStoreError::InvalidState
            })
    }

    // Finds a free proxy on a host other than `peer_host` to rebuild a chunk.
    pub fn find_replacement(&self, peer_host: &str) -> Option<String> {
        let (_, proxies) = self
            .free_hosts
            .iter()
            .filter(|(host, proxies)| host.as_str() != peer_host && !proxies.is_empty())
            .min_by(|(host1, proxies1), (host2, proxies2)| {
                self.link_count(peer_host, host1)
                    .cmp(&self.link_count(peer_host, host2))
                    .then_with(|| proxies2.len().cmp(&proxies1.len()))
                    .then_with(|| host1.cmp(host2))
            })?;
        proxies.iter().next().cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::super::utils::tests::add_testing_proxies;
    use super::*;
    use std::collections::HashMap;

    fn allocate(store: &MetaStore, chunk_num: usize) -> Result<Vec<[String; 2]>, MetaStoreError> {
        ResourcePool::new(store).allocate_chunks(NonZeroUsize::new(chunk_num).unwrap())
    }

    fn host_of(store: &MetaStore, proxy_address: &str) -> String {
        store.all_proxies.get(proxy_address).unwrap().host.clone()
    }

    #[test]
    fn test_allocate_across_hosts() {
        let mut store = MetaStore::new();
        add_testing_proxies(&mut store, 3, 2);
        let chunks = allocate(&store, 3).unwrap();
        assert_eq!(chunks.len(), 3);

        let mut used = BTreeSet::new();
        for [a, b] in chunks.iter() {
            assert_ne!(host_of(&store, a), host_of(&store, b));
            assert!(used.insert(a.clone()));
            assert!(used.insert(b.clone()));
        }
        assert_eq!(used.len(), 6);
    }

    #[test]
    fn test_allocate_spreads_links() {
        let mut store = MetaStore::new();
        add_testing_proxies(&mut store, 3, 2);
        let chunks = allocate(&store, 3).unwrap();

        let mut links: HashMap<(String, String), usize> = HashMap::new();
        for [a, b] in chunks.iter() {
            let mut pair = [host_of(&store, a), host_of(&store, b)];
            pair.sort();
            let [h1, h2] = pair;
            *links.entry((h1, h2)).or_insert(0) += 1;
        }
        // Every pair of the 3 hosts is linked exactly once.
        assert_eq!(links.len(), 3);
        assert!(links.values().all(|count| *count == 1));
    }

    #[test]
    fn test_allocate_with_unbalanced_hosts() {
        let mut store = MetaStore::new();
        add_testing_proxies(&mut store, 1, 5);
        for i in 1..=2 {
            store
                .add_proxy(
                    format!("127.0.1.{}:7001", i),
                    [
                        format!("127.0.1.{}:6001", i),
                        format!("127.0.1.{}:6002", i),
                    ],
                    None,
                )
                .unwrap();
        }
        // 5 + 1 + 1 free proxies: 2 chunks at most.
        let chunks = allocate(&store, 2).unwrap();
        for [a, b] in chunks.iter() {
            assert_ne!(host_of(&store, a), host_of(&store, b));
        }
        assert_eq!(
            allocate(&store, 3).unwrap_err(),
            MetaStoreError::NoAvailableResource
        );
    }

    #[test]
    fn test_allocate_not_enough_proxies() {
        let mut store = MetaStore::new();
        add_testing_proxies(&mut store, 2, 1);
        assert!(allocate(&store, 1).is_ok());
        assert_eq!(
            allocate(&store, 2).unwrap_err(),
            MetaStoreError::NoAvailableResource
        );
    }

    #[test]
    fn test_failed_proxy_is_not_free() {
        let mut store = MetaStore::new();
        add_testing_proxies(&mut store, 2, 1);
        store.failed_proxies.insert("127.0.0.1:7001".to_string());
        let pool = ResourcePool::new(&store);
        assert_eq!(pool.free_proxy_num(), 1);
        assert_eq!(
            allocate(&store, 1).unwrap_err(),
            MetaStoreError::NoAvailableResource
        );
    }

    #[test]
    fn test_find_replacement() {
        let mut store = MetaStore::new();
        add_testing_proxies(&mut store, 3, 2);
        let pool = ResourcePool::new(&store);
        let proxy = pool.find_replacement("127.0.0.1").unwrap();
        assert_ne!(host_of(&store, &proxy), "127.0.0.1");

        let mut store = MetaStore::new();
        add_testing_proxies(&mut store, 1, 2);
        let pool = ResourcePool::new(&store);
        assert!(pool.find_replacement("127.0.0.1").is_none());
    }
}
