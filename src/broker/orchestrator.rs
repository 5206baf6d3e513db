use super::storage::MetaStorage;
use super::store::MetaStoreError;
use crate::common::cluster::{ClusterName, MigrationTaskMeta};
use crate::common::utils::ThreadSafe;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::{stream, Future, StreamExt};
use mockall::automock;
use std::convert::TryFrom;
use std::error::Error;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

const COMMIT_RETRY_TIMES: usize = 10;
const COMMIT_RETRY_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TransferOutcome {
    // The data is moved and the workflow should commit the task.
    Transferred,
    // Someone else already committed it.
    Committed,
}

#[derive(Debug)]
pub enum TransferError {
    ClusterNotFound,
    Storage(MetaStoreError),
    Transfer(String),
}

impl fmt::Display for TransferError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::ClusterNotFound => write!(f, "cluster not found"),
            Self::Storage(err) => write!(f, "storage error: {}", err),
            Self::Transfer(reason) => write!(f, "transfer error: {}", reason),
        }
    }
}

impl Error for TransferError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Storage(err) => Some(err),
            _ => None,
        }
    }
}

#[allow(clippy::indexing_slicing)]
mod trait_mod {
    use super::*;

    // Moves the data of one slot range between two masters.
    #[automock]
    pub trait SlotTransfer: ThreadSafe {
        fn transfer<'s>(
            &'s self,
            task: MigrationTaskMeta,
        ) -> Pin<Box<dyn Future<Output = Result<TransferOutcome, TransferError>> + Send + 's>>;
    }
}

pub use self::trait_mod::{MockSlotTransfer, SlotTransfer};

// The server proxies move the data themselves and commit the task through the HTTP API.
// This one only waits for that commit to show up.
pub struct ProxyCommitWatcher {
    storage: Arc<dyn MetaStorage>,
    interval: Duration,
}

impl ProxyCommitWatcher {
    pub fn new(storage: Arc<dyn MetaStorage>, interval: Duration) -> Self {
        Self { storage, interval }
    }

    async fn wait_for_commit(&self, task: MigrationTaskMeta) -> Result<TransferOutcome, TransferError> {
        let cluster_name = task.cluster_name.to_string();
        loop {
            let info = self
                .storage
                .get_cluster_info_by_name(&cluster_name)
                .await
                .map_err(TransferError::Storage)?;
            if info.is_none() {
                return Err(TransferError::ClusterNotFound);
            }

            let tasks = self
                .storage
                .get_migration_tasks(&cluster_name)
                .await
                .map_err(TransferError::Storage)?;
            let pending = tasks
                .iter()
                .any(|t| t.slot_range.range_list == task.slot_range.range_list);
            if !pending {
                return Ok(TransferOutcome::Committed);
            }
            tokio::time::sleep(self.interval).await;
        }
    }
}

impl SlotTransfer for ProxyCommitWatcher {
    fn transfer<'s>(
        &'s self,
        task: MigrationTaskMeta,
    ) -> Pin<Box<dyn Future<Output = Result<TransferOutcome, TransferError>> + Send + 's>> {
        Box::pin(self.wait_for_commit(task))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "status", content = "reason")]
pub enum MigrationStatus {
    Running,
    Done,
    Failed(String),
}

struct MigrationWorkflow {
    status: watch::Receiver<MigrationStatus>,
    handle: JoinHandle<()>,
}

impl MigrationWorkflow {
    fn is_running(&self) -> bool {
        *self.status.borrow() == MigrationStatus::Running && !self.handle.is_finished()
    }
}

// At most one workflow per cluster. The migration state in the storage
// is what decides whether there is still work to do.
pub struct MigrationOrchestrator {
    storage: Arc<dyn MetaStorage>,
    transfer: Arc<dyn SlotTransfer>,
    migration_limit: usize,
    workflows: DashMap<ClusterName, MigrationWorkflow>,
}

impl MigrationOrchestrator {
    pub fn new(
        storage: Arc<dyn MetaStorage>,
        transfer: Arc<dyn SlotTransfer>,
        migration_limit: usize,
    ) -> Self {
        Self {
            storage,
            transfer,
            migration_limit: std::cmp::max(migration_limit, 1),
            workflows: DashMap::new(),
        }
    }

    pub async fn start_expand(&self, cluster_name: String) -> Result<(), MetaStoreError> {
        self.storage.migrate_slots(cluster_name.clone()).await?;
        self.attach_after_start(&cluster_name).await
    }

    pub async fn start_shrink(
        &self,
        cluster_name: String,
        new_node_num: usize,
    ) -> Result<(), MetaStoreError> {
        self.storage
            .migrate_slots_to_scale_down(cluster_name.clone(), new_node_num)
            .await?;
        self.attach_after_start(&cluster_name).await
    }

    pub async fn start_expand_after_scaling(
        &self,
        cluster_name: String,
    ) -> Result<(), MetaStoreError> {
        self.storage
            .start_expand_after_scaling(cluster_name.clone())
            .await?;
        self.attach_after_start(&cluster_name).await
    }

    pub async fn resume_migration(&self, cluster_name: String) -> Result<(), MetaStoreError> {
        let info = self
            .storage
            .get_cluster_info_by_name(&cluster_name)
            .await?
            .ok_or(MetaStoreError::ClusterNotFound)?;
        if !info.is_migrating {
            return Err(MetaStoreError::MigrationTaskNotFound);
        }
        info!("resume migration of cluster {}", info.name);
        self.attach_workflow(info.name, false)
    }

    // Called once the cluster is removed. A workflow still running is aborted.
    pub fn remove_workflow(&self, cluster_name: &str) {
        let cluster_name = match ClusterName::try_from(cluster_name) {
            Ok(cluster_name) => cluster_name,
            Err(_) => return,
        };
        if let Some((_, workflow)) = self.workflows.remove(&cluster_name) {
            if workflow.is_running() {
                warn!("abort migration workflow of removed cluster {}", cluster_name);
            }
            workflow.handle.abort();
        }
    }

    pub fn get_migration_status(&self, cluster_name: &str) -> Option<MigrationStatus> {
        let cluster_name = ClusterName::try_from(cluster_name).ok()?;
        self.workflows
            .get(&cluster_name)
            .map(|workflow| workflow.status.borrow().clone())
    }

    // Called on startup for the clusters left migrating by the last process.
    pub async fn recover_workflows(&self) -> Result<Vec<ClusterName>, MetaStoreError> {
        let store = self.storage.get_all_metadata().await?;
        let mut recovered = vec![];
        for cluster in store.clusters.values() {
            if !cluster.is_migrating() {
                continue;
            }
            warn!(
                "cluster {} is still migrating, re-attach the migration workflow",
                cluster.name
            );
            self.attach_workflow(cluster.name.clone(), false)?;
            recovered.push(cluster.name.clone());
        }
        Ok(recovered)
    }

    pub async fn wait_for_migration(&self, cluster_name: &str) -> Option<MigrationStatus> {
        let cluster_name = ClusterName::try_from(cluster_name).ok()?;
        let mut status = self.workflows.get(&cluster_name)?.status.clone();
        loop {
            let current = status.borrow().clone();
            if current != MigrationStatus::Running {
                return Some(current);
            }
            if status.changed().await.is_err() {
                return Some(status.borrow().clone());
            }
        }
    }

    async fn attach_after_start(&self, cluster_name: &str) -> Result<(), MetaStoreError> {
        // An empty plan leaves the cluster idle.
        let info = self
            .storage
            .get_cluster_info_by_name(cluster_name)
            .await?
            .ok_or(MetaStoreError::ClusterNotFound)?;
        if !info.is_migrating {
            return Ok(());
        }
        // A workflow still registered here has already seen its migration finish
        // since the storage accepted a new one.
        self.attach_workflow(info.name, true)
    }

    fn attach_workflow(
        &self,
        cluster_name: ClusterName,
        replace_running: bool,
    ) -> Result<(), MetaStoreError> {
        match self.workflows.entry(cluster_name.clone()) {
            Entry::Occupied(mut entry) => {
                if entry.get().is_running() {
                    if !replace_running {
                        return Err(MetaStoreError::MigrationRunning);
                    }
                    entry.get().handle.abort();
                }
                entry.insert(self.spawn_workflow(cluster_name));
            }
            Entry::Vacant(entry) => {
                entry.insert(self.spawn_workflow(cluster_name));
            }
        }
        Ok(())
    }

    fn spawn_workflow(&self, cluster_name: ClusterName) -> MigrationWorkflow {
        let (sender, receiver) = watch::channel(MigrationStatus::Running);
        let storage = self.storage.clone();
        let transfer = self.transfer.clone();
        let migration_limit = self.migration_limit;

        let handle = tokio::spawn(async move {
            let status = match Self::run_workflow(
                storage.as_ref(),
                transfer.as_ref(),
                &cluster_name,
                migration_limit,
            )
            .await
            {
                Ok(()) => {
                    info!("migration workflow of cluster {} is done", cluster_name);
                    MigrationStatus::Done
                }
                Err(reason) => {
                    error!(
                        "migration workflow of cluster {} failed: {}",
                        cluster_name, reason
                    );
                    MigrationStatus::Failed(reason)
                }
            };
            let _ = sender.send(status);
        });

        MigrationWorkflow {
            status: receiver,
            handle,
        }
    }

    async fn run_workflow(
        storage: &dyn MetaStorage,
        transfer: &dyn SlotTransfer,
        cluster_name: &ClusterName,
        migration_limit: usize,
    ) -> Result<(), String> {
        let name = cluster_name.to_string();
        loop {
            let info = storage
                .get_cluster_info_by_name(&name)
                .await
                .map_err(|err| err.to_string())?
                .ok_or_else(|| "cluster not found".to_string())?;
            if !info.is_migrating {
                return Ok(());
            }

            let tasks = storage
                .get_migration_tasks(&name)
                .await
                .map_err(|err| err.to_string())?;
            if tasks.is_empty() {
                return Err(MetaStoreError::InvalidState.to_string());
            }

            let results: Vec<Result<(), String>> = stream::iter(tasks)
                .map(|task| Self::run_task(storage, transfer, task))
                .buffer_unordered(migration_limit)
                .collect()
                .await;
            for res in results.into_iter() {
                res?;
            }
        }
    }

    async fn run_task(
        storage: &dyn MetaStorage,
        transfer: &dyn SlotTransfer,
        task: MigrationTaskMeta,
    ) -> Result<(), String> {
        let outcome = transfer
            .transfer(task.clone())
            .await
            .map_err(|err| format!("slots {}: {}", task.slot_range.range_list, err))?;
        match outcome {
            TransferOutcome::Committed => Ok(()),
            TransferOutcome::Transferred => Self::commit_task(storage, task).await,
        }
    }

    async fn commit_task(storage: &dyn MetaStorage, task: MigrationTaskMeta) -> Result<(), String> {
        for _ in 0..COMMIT_RETRY_TIMES {
            match storage.commit_migration(task.clone()).await {
                Ok(()) => return Ok(()),
                Err(MetaStoreError::Retry) => {
                    tokio::time::sleep(COMMIT_RETRY_INTERVAL).await;
                }
                // Committed by a proxy, or re-issued with a new epoch after a failover.
                // The next round picks up whatever is still pending.
                Err(MetaStoreError::MigrationTaskNotFound) => {
                    warn!(
                        "migration task {} of cluster {} is no longer pending",
                        task.slot_range.range_list, task.cluster_name
                    );
                    return Ok(());
                }
                Err(err) => return Err(err.to_string()),
            }
        }
        Err(MetaStoreError::Retry.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::super::storage::MemoryStorage;
    use super::super::store::MetaStore;
    use super::super::utils::tests::{add_testing_proxies, check_stable_slots_balanced};
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    const CLUSTER_NAME: &str = "testcluster";

    async fn gen_storage(node_num: usize) -> Arc<MemoryStorage> {
        let mut store = MetaStore::new();
        add_testing_proxies(&mut store, 4, 4);
        let storage = Arc::new(MemoryStorage::new(store));
        storage
            .add_cluster(CLUSTER_NAME.to_string(), node_num)
            .await
            .unwrap();
        storage
    }

    fn gen_transfer() -> MockSlotTransfer {
        let mut transfer = MockSlotTransfer::new();
        transfer
            .expect_transfer()
            .returning(|_| Box::pin(async { Ok(TransferOutcome::Transferred) }));
        transfer
    }

    #[tokio::test]
    async fn test_expand_until_done() {
        let storage = gen_storage(4).await;
        storage
            .auto_add_nodes(CLUSTER_NAME.to_string(), 4)
            .await
            .unwrap();
        let orchestrator = MigrationOrchestrator::new(storage.clone(), Arc::new(gen_transfer()), 2);

        orchestrator
            .start_expand(CLUSTER_NAME.to_string())
            .await
            .unwrap();
        let status = orchestrator.wait_for_migration(CLUSTER_NAME).await;
        assert_eq!(status, Some(MigrationStatus::Done));

        let info = storage
            .get_cluster_info_by_name(CLUSTER_NAME)
            .await
            .unwrap()
            .unwrap();
        assert!(!info.is_migrating);
        assert_eq!(info.node_number_with_slots, 8);
        let cluster = storage
            .get_cluster_by_name(CLUSTER_NAME)
            .await
            .unwrap()
            .unwrap();
        check_stable_slots_balanced(&cluster, 4);
        storage.check_metadata().await.unwrap();
    }

    #[tokio::test]
    async fn test_shrink_then_delete_free_nodes() {
        let storage = gen_storage(8).await;
        let orchestrator = MigrationOrchestrator::new(storage.clone(), Arc::new(gen_transfer()), 1);

        orchestrator
            .start_shrink(CLUSTER_NAME.to_string(), 4)
            .await
            .unwrap();
        let status = orchestrator.wait_for_migration(CLUSTER_NAME).await;
        assert_eq!(status, Some(MigrationStatus::Done));

        let info = storage
            .get_cluster_info_by_name(CLUSTER_NAME)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(info.node_number, 8);
        assert_eq!(info.node_number_with_slots, 4);

        storage
            .auto_delete_free_nodes(CLUSTER_NAME.to_string())
            .await
            .unwrap();
        let cluster = storage
            .get_cluster_by_name(CLUSTER_NAME)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cluster.get_nodes().len(), 4);
        check_stable_slots_balanced(&cluster, 2);
    }

    #[tokio::test]
    async fn test_transfer_failure_then_resume() {
        let storage = gen_storage(4).await;
        storage
            .auto_add_nodes(CLUSTER_NAME.to_string(), 4)
            .await
            .unwrap();

        let broken = Arc::new(AtomicBool::new(true));
        let broken_clone = broken.clone();
        let mut transfer = MockSlotTransfer::new();
        transfer.expect_transfer().returning(move |_| {
            let broken = broken_clone.load(Ordering::SeqCst);
            Box::pin(async move {
                if broken {
                    Err(TransferError::Transfer("connection refused".to_string()))
                } else {
                    Ok(TransferOutcome::Transferred)
                }
            })
        });
        let orchestrator = MigrationOrchestrator::new(storage.clone(), Arc::new(transfer), 2);

        orchestrator
            .start_expand(CLUSTER_NAME.to_string())
            .await
            .unwrap();
        let status = orchestrator.wait_for_migration(CLUSTER_NAME).await.unwrap();
        assert!(matches!(status, MigrationStatus::Failed(_)));
        let info = storage
            .get_cluster_info_by_name(CLUSTER_NAME)
            .await
            .unwrap()
            .unwrap();
        assert!(info.is_migrating);

        let err = orchestrator
            .start_expand(CLUSTER_NAME.to_string())
            .await
            .unwrap_err();
        assert_eq!(err, MetaStoreError::MigrationRunning);

        broken.store(false, Ordering::SeqCst);
        orchestrator
            .resume_migration(CLUSTER_NAME.to_string())
            .await
            .unwrap();
        let status = orchestrator.wait_for_migration(CLUSTER_NAME).await;
        assert_eq!(status, Some(MigrationStatus::Done));
        let info = storage
            .get_cluster_info_by_name(CLUSTER_NAME)
            .await
            .unwrap()
            .unwrap();
        assert!(!info.is_migrating);
    }

    #[tokio::test]
    async fn test_remove_workflow() {
        let storage = gen_storage(4).await;
        storage
            .auto_add_nodes(CLUSTER_NAME.to_string(), 4)
            .await
            .unwrap();
        let orchestrator = MigrationOrchestrator::new(storage.clone(), Arc::new(gen_transfer()), 2);
        orchestrator
            .start_expand(CLUSTER_NAME.to_string())
            .await
            .unwrap();
        let status = orchestrator.wait_for_migration(CLUSTER_NAME).await;
        assert_eq!(status, Some(MigrationStatus::Done));

        orchestrator.remove_workflow(CLUSTER_NAME);
        assert!(orchestrator.get_migration_status(CLUSTER_NAME).is_none());
        assert!(orchestrator.workflows.is_empty());
        // Nothing to remove.
        orchestrator.remove_workflow(CLUSTER_NAME);
        orchestrator.remove_workflow("invalid name");
    }

    #[tokio::test]
    async fn test_resume_idle_cluster() {
        let storage = gen_storage(4).await;
        let orchestrator = MigrationOrchestrator::new(storage, Arc::new(gen_transfer()), 1);
        let err = orchestrator
            .resume_migration(CLUSTER_NAME.to_string())
            .await
            .unwrap_err();
        assert_eq!(err, MetaStoreError::MigrationTaskNotFound);
        assert!(orchestrator.get_migration_status(CLUSTER_NAME).is_none());
    }

    #[tokio::test]
    async fn test_recover_workflows() {
        let storage = gen_storage(4).await;
        storage
            .auto_add_nodes(CLUSTER_NAME.to_string(), 4)
            .await
            .unwrap();
        // Started by a previous process.
        storage
            .migrate_slots(CLUSTER_NAME.to_string())
            .await
            .unwrap();

        let orchestrator = MigrationOrchestrator::new(storage.clone(), Arc::new(gen_transfer()), 4);
        let recovered = orchestrator.recover_workflows().await.unwrap();
        assert_eq!(recovered.len(), 1);
        let status = orchestrator.wait_for_migration(CLUSTER_NAME).await;
        assert_eq!(status, Some(MigrationStatus::Done));
    }

    #[tokio::test]
    async fn test_proxy_commit_watcher() {
        let storage = gen_storage(4).await;
        storage
            .auto_add_nodes(CLUSTER_NAME.to_string(), 4)
            .await
            .unwrap();
        let watcher = ProxyCommitWatcher::new(storage.clone(), Duration::from_millis(1));
        let orchestrator = MigrationOrchestrator::new(storage.clone(), Arc::new(watcher), 4);
        orchestrator
            .start_expand(CLUSTER_NAME.to_string())
            .await
            .unwrap();

        // The proxies report every task as done.
        let tasks = storage.get_migration_tasks(CLUSTER_NAME).await.unwrap();
        assert!(!tasks.is_empty());
        for task in tasks.into_iter() {
            storage.commit_migration(task).await.unwrap();
        }

        let status = orchestrator.wait_for_migration(CLUSTER_NAME).await;
        assert_eq!(status, Some(MigrationStatus::Done));
    }

    #[test]
    fn test_status_serialization() {
        let failed = MigrationStatus::Failed("timeout".to_string());
        let value = serde_json::to_value(&failed).unwrap();
        assert_eq!(value["status"], "failed");
        assert_eq!(value["reason"], "timeout");
        let value = serde_json::to_value(&MigrationStatus::Done).unwrap();
        assert_eq!(value["status"], "done");
    }
}
