use super::pool::ResourcePool;
use super::query::MetaStoreQuery;
use super::store::{
    ChunkRolePosition, ChunkStore, ClusterStore, MetaStore, MetaStoreError, MigrationState,
    ProxyResource, ScalingState, CHUNK_NODE_NUM, CHUNK_PARTS, NODES_PER_PROXY,
};
use crate::common::cluster::{ClusterName, Node, Range, RangeList};
use crate::common::config::ClusterConfig;
use crate::common::utils::SLOT_NUM;
use std::collections::{HashMap, HashSet};
use std::convert::TryFrom;
use std::num::NonZeroUsize;

pub fn parse_cluster_name(cluster_name: &str) -> Result<ClusterName, MetaStoreError> {
    ClusterName::try_from(cluster_name).map_err(|_| MetaStoreError::InvalidClusterName)
}

// Returns the number of chunks for `node_num` nodes.
pub fn validate_node_num(node_num: usize) -> Result<NonZeroUsize, MetaStoreError> {
    if node_num % CHUNK_NODE_NUM != 0 {
        return Err(MetaStoreError::InvalidNodeNum);
    }
    NonZeroUsize::new(node_num / CHUNK_NODE_NUM).ok_or(MetaStoreError::InvalidNodeNum)
}

// Spreads the whole slot space over `master_num` masters.
// The first `remainder` masters get one more slot.
pub fn gen_balanced_slot_nums(master_num: usize) -> Vec<usize> {
    if master_num == 0 {
        return vec![];
    }
    let average = SLOT_NUM / master_num;
    let remainder = SLOT_NUM - average * master_num;
    (0..master_num)
        .map(|i| average + (i < remainder) as usize)
        .collect()
}

// Mutates the store in place and stamps every touched cluster with `new_epoch`.
// Bumping the global epoch is left to `MetaStore::commit`.
pub struct MetaStoreUpdate<'a> {
    store: &'a mut MetaStore,
    new_epoch: u64,
}

impl<'a> MetaStoreUpdate<'a> {
    pub fn new(store: &'a mut MetaStore, new_epoch: u64) -> Self {
        Self { store, new_epoch }
    }

    pub fn add_failure(
        &mut self,
        address: String,
        reporter_id: String,
        now: i64,
        failure_ttl: chrono::Duration,
    ) -> Result<(), MetaStoreError> {
        let ttl = failure_ttl.num_seconds();
        for reporter_map in self.store.failures.values_mut() {
            reporter_map.retain(|_, report_time| now - *report_time < ttl);
        }
        self.store
            .failures
            .retain(|_, reporter_map| !reporter_map.is_empty());

        self.store
            .failures
            .entry(address)
            .or_insert_with(HashMap::new)
            .insert(reporter_id, now);
        Ok(())
    }

    fn parse_proxy_host(proxy_address: &str) -> Result<String, MetaStoreError> {
        let mut parts = proxy_address.rsplitn(2, ':');
        let port = parts.next().ok_or(MetaStoreError::InvalidProxyAddress)?;
        let host = parts.next().ok_or(MetaStoreError::InvalidProxyAddress)?;
        if host.is_empty() || port.parse::<u16>().is_err() {
            return Err(MetaStoreError::InvalidProxyAddress);
        }
        Ok(host.to_string())
    }

    pub fn add_proxy(
        &mut self,
        proxy_address: String,
        nodes: [String; NODES_PER_PROXY],
        host: Option<String>,
    ) -> Result<(), MetaStoreError> {
        let address_host = Self::parse_proxy_host(&proxy_address)?;
        let host = host.unwrap_or(address_host);

        if self.store.all_proxies.contains_key(&proxy_address) {
            return Err(MetaStoreError::AlreadyExisted);
        }

        self.store.failed_proxies.remove(&proxy_address);
        self.store.failures.remove(&proxy_address);
        self.store.all_proxies.insert(
            proxy_address.clone(),
            ProxyResource {
                proxy_address,
                node_addresses: nodes,
                host,
                cluster: None,
            },
        );
        Ok(())
    }

    pub fn remove_proxy(&mut self, proxy_address: String) -> Result<(), MetaStoreError> {
        match self.store.all_proxies.get(&proxy_address) {
            None => return Err(MetaStoreError::ProxyNotFound),
            Some(proxy) => {
                if proxy.cluster.is_some() {
                    return Err(MetaStoreError::InUse);
                }
            }
        }

        self.store.all_proxies.remove(&proxy_address);
        self.store.failed_proxies.remove(&proxy_address);
        self.store.failures.remove(&proxy_address);
        Ok(())
    }

    pub fn add_cluster(
        &mut self,
        cluster_name: String,
        node_num: usize,
    ) -> Result<(), MetaStoreError> {
        let cluster_name = parse_cluster_name(&cluster_name)?;
        let chunk_num = validate_node_num(node_num)?;
        if self.store.clusters.contains_key(&cluster_name) {
            return Err(MetaStoreError::AlreadyExisted);
        }

        let mut chunks = self.generate_free_chunks(chunk_num)?;
        Self::assign_balanced_slots(&mut chunks);

        self.occupy_proxies(&cluster_name, &chunks);
        let cluster_store = ClusterStore {
            epoch: self.new_epoch,
            name: cluster_name.clone(),
            chunks,
            config: ClusterConfig::default(),
            migration_state: MigrationState::Idle,
            scaling_state: ScalingState::Idle,
            migration: None,
        };
        self.store.clusters.insert(cluster_name, cluster_store);
        Ok(())
    }

    // Migration is allowed to be running. Its workflow will find the cluster gone.
    pub fn remove_cluster(&mut self, cluster_name: String) -> Result<(), MetaStoreError> {
        let cluster_name = parse_cluster_name(&cluster_name)?;

        let cluster_store = self
            .store
            .clusters
            .remove(&cluster_name)
            .ok_or(MetaStoreError::ClusterNotFound)?;

        self.release_proxies(&cluster_store.chunks);
        Ok(())
    }

    pub fn auto_scale_up_nodes(
        &mut self,
        cluster_name: String,
        cluster_node_num: usize,
    ) -> Result<Vec<Node>, MetaStoreError> {
        let name = parse_cluster_name(&cluster_name)?;
        validate_node_num(cluster_node_num)?;

        let existing_node_num = self
            .store
            .clusters
            .get(&name)
            .ok_or(MetaStoreError::ClusterNotFound)?
            .get_node_number();

        let added_num = match cluster_node_num.checked_sub(existing_node_num) {
            None | Some(0) => return Err(MetaStoreError::NodeNumAlreadyEnough),
            Some(added_num) => added_num,
        };

        self.auto_add_nodes(cluster_name, added_num)
    }

    pub fn auto_add_nodes(
        &mut self,
        cluster_name: String,
        num: usize,
    ) -> Result<Vec<Node>, MetaStoreError> {
        self.add_nodes_impl(cluster_name, num, false)
    }

    // Used inside the transaction which has just marked the cluster as changing.
    pub fn add_nodes_for_scaling(
        &mut self,
        cluster_name: String,
        num: usize,
    ) -> Result<Vec<Node>, MetaStoreError> {
        self.add_nodes_impl(cluster_name, num, true)
    }

    fn add_nodes_impl(
        &mut self,
        cluster_name: String,
        num: usize,
        allow_changing: bool,
    ) -> Result<Vec<Node>, MetaStoreError> {
        let cluster_name = parse_cluster_name(&cluster_name)?;
        let chunk_num = validate_node_num(num)?;

        {
            let cluster = self
                .store
                .clusters
                .get(&cluster_name)
                .ok_or(MetaStoreError::ClusterNotFound)?;
            if cluster.is_migrating() {
                return Err(MetaStoreError::MigrationRunning);
            }
            if cluster.is_changing() && !allow_changing {
                return Err(MetaStoreError::NodeNumberChanging);
            }
        }

        let mut chunks = self.generate_free_chunks(chunk_num)?;
        self.occupy_proxies(&cluster_name, &chunks);

        let new_epoch = self.new_epoch;
        let cluster = self
            .store
            .clusters
            .get_mut(&cluster_name)
            .ok_or(MetaStoreError::ClusterNotFound)?;
        cluster.chunks.append(&mut chunks);
        cluster.set_epoch(new_epoch);

        let nodes = MetaStoreQuery::cluster_store_to_cluster(cluster).into_nodes();
        let new_nodes = nodes
            .get((nodes.len() - num)..)
            .ok_or_else(|| {
                error!("invalid state: cannot get back the added nodes");
                MetaStoreError::InvalidState
            })?
            .to_vec();
        Ok(new_nodes)
    }

    pub fn auto_delete_free_nodes(&mut self, cluster_name: String) -> Result<(), MetaStoreError> {
        let cluster_name = parse_cluster_name(&cluster_name)?;
        let new_epoch = self.new_epoch;

        let removed_chunks = {
            let cluster = self
                .store
                .clusters
                .get_mut(&cluster_name)
                .ok_or(MetaStoreError::ClusterNotFound)?;
            cluster.check_idle()?;

            let free_indices: HashSet<usize> =
                cluster.get_free_chunk_indices().into_iter().collect();
            if free_indices.is_empty() {
                return Err(MetaStoreError::FreeNodeNotFound);
            }

            let chunks = std::mem::replace(&mut cluster.chunks, vec![]);
            let (removed_chunks, kept_chunks): (Vec<_>, Vec<_>) = chunks
                .into_iter()
                .enumerate()
                .partition(|(i, _)| free_indices.contains(i));
            cluster.chunks = kept_chunks.into_iter().map(|(_, chunk)| chunk).collect();
            cluster.set_epoch(new_epoch);
            removed_chunks
                .into_iter()
                .map(|(_, chunk)| chunk)
                .collect::<Vec<_>>()
        };

        self.release_proxies(&removed_chunks);
        Ok(())
    }

    fn generate_free_chunks(
        &self,
        chunk_num: NonZeroUsize,
    ) -> Result<Vec<ChunkStore>, MetaStoreError> {
        let proxy_pairs = ResourcePool::new(&self.store).allocate_chunks(chunk_num)?;

        let mut chunks = Vec::with_capacity(proxy_pairs.len());
        for [first, second] in proxy_pairs.into_iter() {
            let first_proxy = self.get_proxy_resource(&first)?;
            let second_proxy = self.get_proxy_resource(&second)?;
            chunks.push(ChunkStore {
                role_position: ChunkRolePosition::Normal,
                stable_slots: [RangeList::default(), RangeList::default()],
                proxy_addresses: [
                    first_proxy.proxy_address.clone(),
                    second_proxy.proxy_address.clone(),
                ],
                hosts: [first_proxy.host.clone(), second_proxy.host.clone()],
                node_addresses: [
                    first_proxy.node_addresses[0].clone(),
                    first_proxy.node_addresses[1].clone(),
                    second_proxy.node_addresses[0].clone(),
                    second_proxy.node_addresses[1].clone(),
                ],
            });
        }
        Ok(chunks)
    }

    fn get_proxy_resource(&self, proxy_address: &str) -> Result<&ProxyResource, MetaStoreError> {
        self.store.all_proxies.get(proxy_address).ok_or_else(|| {
            error!("invalid state: allocated proxy {} not found", proxy_address);
            MetaStoreError::InvalidState
        })
    }

    // Master `i` is `chunks[i / 2].stable_slots[i % 2]`.
    fn assign_balanced_slots(chunks: &mut [ChunkStore]) {
        let slot_nums = gen_balanced_slot_nums(chunks.len() * CHUNK_PARTS);
        let mut curr_slot = 0;
        for (i, slot_num) in slot_nums.into_iter().enumerate() {
            let chunk = &mut chunks[i / CHUNK_PARTS];
            chunk.stable_slots[i % CHUNK_PARTS] =
                RangeList::from_single_range(Range(curr_slot, curr_slot + slot_num - 1));
            curr_slot += slot_num;
        }
    }

    fn occupy_proxies(&mut self, cluster_name: &ClusterName, chunks: &[ChunkStore]) {
        for chunk in chunks.iter() {
            for proxy_address in chunk.proxy_addresses.iter() {
                if let Some(proxy) = self.store.all_proxies.get_mut(proxy_address) {
                    proxy.cluster = Some(cluster_name.clone());
                }
            }
        }
    }

    fn release_proxies(&mut self, chunks: &[ChunkStore]) {
        for chunk in chunks.iter() {
            for proxy_address in chunk.proxy_addresses.iter() {
                if let Some(proxy) = self.store.all_proxies.get_mut(proxy_address) {
                    proxy.cluster = None;
                }
            }
        }
    }

    pub fn replace_failed_proxy(
        &mut self,
        failed_proxy_address: String,
    ) -> Result<Option<String>, MetaStoreError> {
        let cluster_name = match self.store.all_proxies.get(&failed_proxy_address) {
            None => return Err(MetaStoreError::ProxyNotFound),
            Some(proxy) => proxy.cluster.clone(),
        };

        let cluster_name = match cluster_name {
            None => {
                self.store.failures.remove(&failed_proxy_address);
                self.store.failed_proxies.insert(failed_proxy_address);
                return Ok(None);
            }
            Some(cluster_name) => cluster_name,
        };

        let (chunk_index, side) = self.takeover_master(&cluster_name, &failed_proxy_address)?;
        self.store
            .failed_proxies
            .insert(failed_proxy_address.clone());

        let peer_host = self
            .store
            .clusters
            .get(&cluster_name)
            .and_then(|cluster| cluster.chunks.get(chunk_index))
            .map(|chunk| chunk.hosts[1 - side].clone())
            .ok_or(MetaStoreError::InvalidState)?;

        let new_proxy_address = match ResourcePool::new(&self.store).find_replacement(&peer_host) {
            Some(address) => address,
            None => {
                warn!(
                    "no free proxy to replace failed proxy {} of cluster {}",
                    failed_proxy_address, cluster_name
                );
                return Ok(None);
            }
        };
        let proxy_resource = self.get_proxy_resource(&new_proxy_address)?.clone();

        {
            let cluster = self
                .store
                .clusters
                .get_mut(&cluster_name)
                .ok_or(MetaStoreError::ClusterNotFound)?;
            let chunk = cluster
                .chunks
                .get_mut(chunk_index)
                .ok_or(MetaStoreError::InvalidState)?;
            chunk.hosts[side] = proxy_resource.host.clone();
            chunk.proxy_addresses[side] = proxy_resource.proxy_address.clone();
            chunk.node_addresses[2 * side] = proxy_resource.node_addresses[0].clone();
            chunk.node_addresses[2 * side + 1] = proxy_resource.node_addresses[1].clone();
        }

        if let Some(proxy) = self.store.all_proxies.get_mut(&failed_proxy_address) {
            proxy.cluster = None;
        }
        if let Some(proxy) = self.store.all_proxies.get_mut(&new_proxy_address) {
            proxy.cluster = Some(cluster_name.clone());
        }

        info!(
            "replaced failed proxy {} with {} in cluster {}",
            failed_proxy_address, new_proxy_address, cluster_name
        );
        Ok(Some(new_proxy_address))
    }

    // Lets the peer proxy serve both masters of the chunk.
    // Returns the chunk index and which side of the chunk the failed proxy is.
    fn takeover_master(
        &mut self,
        cluster_name: &ClusterName,
        failed_proxy_address: &str,
    ) -> Result<(usize, usize), MetaStoreError> {
        let new_epoch = self.new_epoch;
        let cluster = self
            .store
            .clusters
            .get_mut(cluster_name)
            .ok_or(MetaStoreError::ClusterNotFound)?;

        let (chunk_index, side) = cluster
            .chunks
            .iter()
            .enumerate()
            .find_map(|(i, chunk)| {
                chunk
                    .proxy_addresses
                    .iter()
                    .position(|address| address == failed_proxy_address)
                    .map(|side| (i, side))
            })
            .ok_or_else(|| {
                error!(
                    "invalid state: proxy {} not found in cluster {}",
                    failed_proxy_address, cluster_name
                );
                MetaStoreError::InvalidState
            })?;

        if let Some(chunk) = cluster.chunks.get_mut(chunk_index) {
            chunk.role_position = if side == 0 {
                ChunkRolePosition::SecondChunkMaster
            } else {
                ChunkRolePosition::FirstChunkMaster
            };
        }

        let mut changed_chunks = HashSet::new();
        changed_chunks.insert(chunk_index);
        Self::bump_task_epochs(cluster, &changed_chunks, new_epoch);
        cluster.set_epoch(new_epoch);
        Ok((chunk_index, side))
    }

    // The master addresses of the tasks have changed.
    fn bump_task_epochs(cluster: &mut ClusterStore, chunk_indices: &HashSet<usize>, epoch: u64) {
        if let Some(migration) = cluster.migration.as_mut() {
            for task in migration.tasks.iter_mut() {
                if chunk_indices.contains(&task.src.chunk_index)
                    || chunk_indices.contains(&task.dst.chunk_index)
                {
                    task.epoch = epoch;
                }
            }
        }
    }

    pub fn balance_masters(&mut self, cluster_name: String) -> Result<(), MetaStoreError> {
        let cluster_name = parse_cluster_name(&cluster_name)?;
        let new_epoch = self.new_epoch;

        let failed_proxies = &self.store.failed_proxies;
        let failures = &self.store.failures;
        let failed_proxy_exists = |addresses: &[String; CHUNK_PARTS]| -> bool {
            addresses
                .iter()
                .any(|address| failed_proxies.contains(address) || failures.contains_key(address))
        };

        let cluster = self
            .store
            .clusters
            .get_mut(&cluster_name)
            .ok_or(MetaStoreError::ClusterNotFound)?;

        let mut changed_chunks = HashSet::new();
        for (i, chunk) in cluster.chunks.iter_mut().enumerate() {
            if chunk.role_position == ChunkRolePosition::Normal
                || failed_proxy_exists(&chunk.proxy_addresses)
            {
                continue;
            }
            chunk.role_position = ChunkRolePosition::Normal;
            changed_chunks.insert(i);
        }
        Self::bump_task_epochs(cluster, &changed_chunks, new_epoch);
        cluster.set_epoch(new_epoch);
        Ok(())
    }

    pub fn change_config(
        &mut self,
        cluster_name: String,
        config: HashMap<String, String>,
    ) -> Result<(), MetaStoreError> {
        let cluster_name = parse_cluster_name(&cluster_name)?;
        let new_epoch = self.new_epoch;
        let cluster = self
            .store
            .clusters
            .get_mut(&cluster_name)
            .ok_or(MetaStoreError::ClusterNotFound)?;

        let mut cluster_config = cluster.config.clone();
        for (k, v) in config.iter() {
            cluster_config
                .set_field(k, v)
                .map_err(|err| MetaStoreError::InvalidConfig {
                    key: k.clone(),
                    value: v.clone(),
                    error: err.to_string(),
                })?;
        }
        cluster.config = cluster_config;
        cluster.set_epoch(new_epoch);
        Ok(())
    }
}
