use super::store::{
    ClusterStore, MasterPosition, MetaStore, MetaStoreError, MigrationKind, MigrationState,
    MigrationStore, MigrationTaskStore, ScalingState, CHUNK_PARTS,
};
use super::update::{gen_balanced_slot_nums, parse_cluster_name, validate_node_num, MetaStoreUpdate};
use crate::common::cluster::{ClusterName, MigrationTaskMeta, Range, RangeList};
use std::cmp::min;

// Mutates the store in place like `MetaStoreUpdate`.
pub struct MetaStoreMigrate<'a> {
    store: &'a mut MetaStore,
    new_epoch: u64,
}

impl<'a> MetaStoreMigrate<'a> {
    pub fn new(store: &'a mut MetaStore, new_epoch: u64) -> Self {
        Self { store, new_epoch }
    }

    fn get_cluster_mut(
        &mut self,
        cluster_name: &ClusterName,
    ) -> Result<&mut ClusterStore, MetaStoreError> {
        self.store
            .clusters
            .get_mut(cluster_name)
            .ok_or(MetaStoreError::ClusterNotFound)
    }

    // Moves slots to the slot-less chunks so that every master ends up with an even share.
    pub fn migrate_slots(&mut self, cluster_name: String) -> Result<(), MetaStoreError> {
        let cluster_name = parse_cluster_name(&cluster_name)?;
        let new_epoch = self.new_epoch;
        let cluster = self.get_cluster_mut(&cluster_name)?;
        cluster.check_idle()?;

        if cluster.get_free_chunk_indices().is_empty() {
            return Err(MetaStoreError::FreeNodeNotFound);
        }

        let targets = gen_balanced_slot_nums(cluster.chunks.len() * CHUNK_PARTS);
        let target_node_number = cluster.get_node_number();
        Self::start_migration(
            cluster,
            MigrationKind::Expand,
            targets,
            target_node_number,
            new_epoch,
        )
    }

    // Drains the trailing chunks onto the first `new_node_num / 4` chunks.
    pub fn migrate_slots_to_scale_down(
        &mut self,
        cluster_name: String,
        new_node_num: usize,
    ) -> Result<(), MetaStoreError> {
        let cluster_name = parse_cluster_name(&cluster_name)?;
        let new_chunk_num = validate_node_num(new_node_num)?.get();
        let new_epoch = self.new_epoch;
        let cluster = self.get_cluster_mut(&cluster_name)?;
        cluster.check_idle()?;

        if !cluster.get_free_chunk_indices().is_empty() {
            return Err(MetaStoreError::FreeNodeFound);
        }
        if new_node_num >= cluster.get_node_number() {
            return Err(MetaStoreError::InvalidNodeNum);
        }

        let mut targets = gen_balanced_slot_nums(new_chunk_num * CHUNK_PARTS);
        targets.resize(cluster.chunks.len() * CHUNK_PARTS, 0);
        Self::start_migration(
            cluster,
            MigrationKind::Shrink,
            targets,
            new_node_num,
            new_epoch,
        )
    }

    fn start_migration(
        cluster: &mut ClusterStore,
        kind: MigrationKind,
        targets: Vec<usize>,
        target_node_number: usize,
        epoch: u64,
    ) -> Result<(), MetaStoreError> {
        let tasks = Self::plan_tasks(cluster, &targets, epoch)?;
        if tasks.is_empty() {
            warn!(
                "no slot needs to be moved for cluster {}, migration is skipped",
                cluster.name
            );
            return Ok(());
        }

        for task in tasks.iter() {
            info!(
                "cluster {} migration {:?}: slots {} from {:?} to {:?} epoch {}",
                cluster.name, kind, task.range_list, task.src, task.dst, task.epoch
            );
        }

        cluster.migration = Some(MigrationStore {
            kind,
            epoch,
            target_node_number,
            committed_task_number: 0,
            tasks,
        });
        cluster.migration_state = MigrationState::Migrating;
        cluster.set_epoch(epoch);
        Ok(())
    }

    // Masters holding more than their target give away slots from the tail of their ranges.
    // The receivers are filled in master index order, one task per source and destination pair.
    fn plan_tasks(
        cluster: &mut ClusterStore,
        targets: &[usize],
        epoch: u64,
    ) -> Result<Vec<MigrationTaskStore>, MetaStoreError> {
        let master_num = cluster.chunks.len() * CHUNK_PARTS;
        if targets.len() != master_num {
            error!(
                "invalid state: {} slot targets for {} masters",
                targets.len(),
                master_num
            );
            return Err(MetaStoreError::InvalidState);
        }

        let position = |master_index: usize| {
            MasterPosition::new(master_index / CHUNK_PARTS, master_index % CHUNK_PARTS)
        };

        let mut deficits: Vec<(MasterPosition, usize)> = (0..master_num)
            .filter_map(|i| {
                let current = cluster.get_master_slots_num(position(i));
                targets[i]
                    .checked_sub(current)
                    .filter(|deficit| *deficit > 0)
                    .map(|deficit| (position(i), deficit))
            })
            .collect();
        deficits.reverse();

        let mut tasks = vec![];
        for (i, target) in targets.iter().enumerate() {
            let src = position(i);
            let current = cluster.get_master_slots_num(src);
            let mut surplus = match current.checked_sub(*target) {
                None | Some(0) => continue,
                Some(surplus) => surplus,
            };

            while surplus > 0 {
                let (dst, deficit) = match deficits.last_mut() {
                    Some(entry) => entry,
                    None => {
                        error!("invalid state: no master left to receive slots");
                        return Err(MetaStoreError::InvalidState);
                    }
                };
                let dst = *dst;
                let moved_num = min(surplus, *deficit);
                *deficit -= moved_num;
                if *deficit == 0 {
                    deficits.pop();
                }
                surplus -= moved_num;

                let src_slots = &mut cluster.chunks[src.chunk_index].stable_slots[src.part];
                let range_list = Self::split_tail(src_slots, moved_num);
                tasks.push(MigrationTaskStore {
                    range_list,
                    src,
                    dst,
                    epoch,
                });
            }
        }

        if !deficits.is_empty() {
            error!("invalid state: slots are not enough for {:?}", deficits);
            return Err(MetaStoreError::InvalidState);
        }
        Ok(tasks)
    }

    // Removes the last `num` slots of `range_list` and returns them.
    fn split_tail(range_list: &mut RangeList, num: usize) -> RangeList {
        range_list.compact();
        let ranges = range_list.get_mut_ranges();
        let mut removed = vec![];
        let mut remaining = num;
        while remaining > 0 {
            let last = match ranges.last_mut() {
                Some(last) => last,
                None => break,
            };
            let slots_num = last.get_slots_num();
            if slots_num <= remaining {
                removed.push(*last);
                ranges.pop();
                remaining -= slots_num;
            } else {
                let end = last.end();
                *last.end_mut() = end - remaining;
                removed.push(Range(end - remaining + 1, end));
                remaining = 0;
            }
        }
        let mut removed = RangeList::new(removed);
        removed.compact();
        removed
    }

    pub fn commit_migration(&mut self, task: MigrationTaskMeta) -> Result<(), MetaStoreError> {
        let new_epoch = self.new_epoch;
        let meta = task
            .slot_range
            .tag
            .get_migration_meta()
            .ok_or(MetaStoreError::InvalidMigrationTask)?;
        let cluster = self.get_cluster_mut(&task.cluster_name)?;

        let migration = cluster
            .migration
            .as_mut()
            .ok_or(MetaStoreError::MigrationTaskNotFound)?;
        let index = migration
            .tasks
            .iter()
            .position(|t| t.range_list == task.slot_range.range_list && t.epoch == meta.epoch)
            .ok_or(MetaStoreError::MigrationTaskNotFound)?;
        let mut committed = migration.tasks.remove(index);
        migration.committed_task_number += 1;
        let finished = migration.tasks.is_empty();

        let dst_slots = cluster
            .chunks
            .get_mut(committed.dst.chunk_index)
            .and_then(|chunk| chunk.stable_slots.get_mut(committed.dst.part))
            .ok_or_else(|| {
                error!("invalid state: migration destination {:?}", committed.dst);
                MetaStoreError::InvalidState
            })?;
        dst_slots.merge_another(&mut committed.range_list);

        if finished {
            info!("cluster {} migration is done", cluster.name);
            cluster.migration = None;
            cluster.migration_state = MigrationState::Idle;
        }
        cluster.set_epoch(new_epoch);
        Ok(())
    }

    // Marks the cluster as changing and grows it to `node_num` in one transaction.
    // Returns the proxies of the slot-less chunks and the epoch they should catch up with.
    pub fn start_scaling_out(
        &mut self,
        cluster_name: String,
        node_num: usize,
    ) -> Result<(Vec<String>, u64), MetaStoreError> {
        let name = parse_cluster_name(&cluster_name)?;
        validate_node_num(node_num)?;
        let new_epoch = self.new_epoch;

        let existing_node_num = {
            let cluster = self.get_cluster_mut(&name)?;
            cluster.check_idle()?;
            let existing_node_num = cluster.get_node_number();
            if existing_node_num > node_num {
                return Err(MetaStoreError::FreeNodeFound);
            }
            cluster.scaling_state = ScalingState::Changing;
            cluster.set_epoch(new_epoch);
            existing_node_num
        };

        if node_num > existing_node_num {
            MetaStoreUpdate::new(&mut *self.store, new_epoch)
                .add_nodes_for_scaling(cluster_name, node_num - existing_node_num)?;
        }

        let cluster = self.get_cluster_mut(&name)?;
        let proxy_addresses: Vec<String> = cluster
            .get_free_chunk_indices()
            .into_iter()
            .flat_map(|i| cluster.chunks[i].proxy_addresses.to_vec())
            .collect();
        Ok((proxy_addresses, cluster.epoch))
    }

    pub fn stop_scaling(&mut self, cluster_name: String) -> Result<(), MetaStoreError> {
        let name = parse_cluster_name(&cluster_name)?;
        let new_epoch = self.new_epoch;
        let cluster = self.get_cluster_mut(&name)?;
        if !cluster.is_changing() {
            return Err(MetaStoreError::InvalidState);
        }
        cluster.scaling_state = ScalingState::Idle;
        cluster.set_epoch(new_epoch);
        Ok(())
    }

    pub fn start_expand_after_scaling(
        &mut self,
        cluster_name: String,
    ) -> Result<(), MetaStoreError> {
        self.stop_scaling(cluster_name.clone())?;
        self.migrate_slots(cluster_name)
    }

    // The owner of a changing flag does not survive a restart.
    pub fn reset_stale_scaling(&mut self) -> Result<Vec<ClusterName>, MetaStoreError> {
        let new_epoch = self.new_epoch;
        let mut names = vec![];
        for cluster in self.store.clusters.values_mut() {
            if cluster.is_changing() {
                cluster.scaling_state = ScalingState::Idle;
                cluster.set_epoch(new_epoch);
                names.push(cluster.name.clone());
            }
        }
        names.sort();
        Ok(names)
    }
}
