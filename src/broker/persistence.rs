use super::store::MetaStore;
use chrono::Utc;
use futures::Future;
use std::error::Error;
use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use tokio::fs::{remove_file, rename, File};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;

pub trait MetaPersistence {
    fn store<'s>(
        &'s self,
        store: Arc<MetaStore>,
    ) -> Pin<Box<dyn Future<Output = Result<(), MetaSyncError>> + Send + 's>>;
    fn load<'s>(
        &'s self,
    ) -> Pin<Box<dyn Future<Output = Result<Option<MetaStore>, MetaSyncError>> + Send + 's>>;
}

pub struct JsonFileStorage {
    json_file: JsonFile,
    // Global epoch of the last snapshot written to or loaded from the file.
    last_epoch: Mutex<Option<u64>>,
}

impl JsonFileStorage {
    pub fn new(filename: String) -> Self {
        Self {
            json_file: JsonFile::new(filename),
            last_epoch: Mutex::new(None),
        }
    }

    // Snapshots are taken before the lock, so a slower writer may come with an older one.
    async fn store_impl(&self, store: Arc<MetaStore>) -> Result<(), MetaSyncError> {
        let mut last_epoch = self.last_epoch.lock().await;
        let epoch = store.get_global_epoch();
        if let Some(last) = *last_epoch {
            if epoch < last {
                debug!(
                    "skip writing meta file with epoch {} older than {}",
                    epoch, last
                );
                return Ok(());
            }
        }
        self.json_file.store(store).await?;
        *last_epoch = Some(epoch);
        Ok(())
    }

    async fn load_impl(&self) -> Result<Option<MetaStore>, MetaSyncError> {
        let mut last_epoch = self.last_epoch.lock().await;
        let store = self.json_file.load().await?;
        if let Some(store) = store.as_ref() {
            *last_epoch = Some(store.get_global_epoch());
        }
        Ok(store)
    }
}

impl MetaPersistence for JsonFileStorage {
    fn store<'s>(
        &'s self,
        store: Arc<MetaStore>,
    ) -> Pin<Box<dyn Future<Output = Result<(), MetaSyncError>> + Send + 's>> {
        Box::pin(self.store_impl(store))
    }

    fn load<'s>(
        &'s self,
    ) -> Pin<Box<dyn Future<Output = Result<Option<MetaStore>, MetaSyncError>> + Send + 's>> {
        Box::pin(self.load_impl())
    }
}

struct JsonFile {
    filename: String,
}

impl JsonFile {
    fn new(filename: String) -> Self {
        Self { filename }
    }

    // Written to a temporary file first so that a crash never leaves a half-written snapshot.
    async fn store(&self, store: Arc<MetaStore>) -> Result<(), MetaSyncError> {
        let data = serde_json::to_vec(&*store).map_err(|err| {
            error!("failed to convert MetaStore to json {}", err);
            MetaSyncError::Json
        })?;

        let now = Utc::now().timestamp_nanos();
        let tmp_filename = format!("{}-{}", self.filename, now);
        let res = Self::write_file(tmp_filename.as_str(), data.as_slice()).await;
        if let Err(err) = res {
            if let Err(remove_err) = remove_file(tmp_filename.as_str()).await {
                warn!("failed to remove {}: {}", tmp_filename, remove_err);
            }
            return Err(err);
        }

        rename(tmp_filename.as_str(), self.filename.as_str())
            .await
            .map_err(MetaSyncError::Io)?;
        Ok(())
    }

    async fn write_file(filename: &str, data: &[u8]) -> Result<(), MetaSyncError> {
        let mut tmp_file = File::create(filename).await.map_err(MetaSyncError::Io)?;
        tmp_file.write_all(data).await.map_err(MetaSyncError::Io)?;
        tmp_file.sync_all().await.map_err(MetaSyncError::Io)?;
        Ok(())
    }

    async fn load(&self) -> Result<Option<MetaStore>, MetaSyncError> {
        let mut file = match File::open(self.filename.as_str()).await {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(MetaSyncError::Io(err)),
        };
        let mut contents = vec![];
        file.read_to_end(&mut contents)
            .await
            .map_err(MetaSyncError::Io)?;

        let store = serde_json::from_slice(&contents).map_err(|err| {
            error!("invalid json data {}", err);
            MetaSyncError::Json
        })?;

        Ok(Some(store))
    }
}

#[derive(Debug)]
pub enum MetaSyncError {
    Io(io::Error),
    Json,
    // Addresses of the replicas that did not take the snapshot.
    Replication(Vec<String>),
}

impl MetaSyncError {
    pub fn to_code(&self) -> &str {
        match self {
            Self::Io(_) => "PERSISTENCE_IO_ERROR",
            Self::Json => "PERSISTENCE_JSON_ERROR",
            Self::Replication(_) => "REPLICATION_ERROR",
        }
    }
}

impl fmt::Display for MetaSyncError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Replication(failed_addresses) => {
                write!(f, "{}: {}", self.to_code(), failed_addresses.join(","))
            }
            _ => write!(f, "{}", self.to_code()),
        }
    }
}

impl Error for MetaSyncError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io(io_error) => Some(io_error),
            _ => None,
        }
    }
}

impl PartialEq for MetaSyncError {
    fn eq(&self, other: &Self) -> bool {
        self.to_code() == other.to_code()
    }
}

#[cfg(test)]
mod tests {
    use super::super::utils::tests::add_testing_proxies;
    use super::*;

    fn gen_filename(name: &str) -> String {
        let dir = std::env::temp_dir();
        let filename = format!("{}-{}.json", name, Utc::now().timestamp_nanos());
        dir.join(filename).to_string_lossy().to_string()
    }

    #[tokio::test]
    async fn test_store_and_load() {
        let filename = gen_filename("undermoon-broker-persistence");
        let storage = JsonFileStorage::new(filename.clone());

        let mut store = MetaStore::new();
        add_testing_proxies(&mut store, 2, 2);
        store.add_cluster("testcluster".to_string(), 4).unwrap();
        storage.store(Arc::new(store.clone())).await.unwrap();

        let loaded = storage.load().await.unwrap().unwrap();
        assert_eq!(loaded.get_global_epoch(), store.get_global_epoch());
        assert_eq!(loaded.get_cluster_names(), store.get_cluster_names());
        assert_eq!(loaded.get_proxies(), store.get_proxies());

        remove_file(filename.as_str()).await.unwrap();
    }

    #[tokio::test]
    async fn test_older_snapshot_does_not_overwrite_newer() {
        let filename = gen_filename("undermoon-broker-out-of-order");
        let storage = JsonFileStorage::new(filename.clone());

        let mut store = MetaStore::new();
        add_testing_proxies(&mut store, 2, 2);
        let older = Arc::new(store.clone());
        store.add_cluster("testcluster".to_string(), 4).unwrap();
        let newer = Arc::new(store);
        assert!(newer.get_global_epoch() > older.get_global_epoch());

        storage.store(newer.clone()).await.unwrap();
        storage.store(older).await.unwrap();

        let loaded = storage.load().await.unwrap().unwrap();
        assert_eq!(loaded.get_global_epoch(), newer.get_global_epoch());
        assert_eq!(loaded.get_cluster_names(), newer.get_cluster_names());

        // The same epoch is still written.
        storage.store(newer.clone()).await.unwrap();
        remove_file(filename.as_str()).await.unwrap();
    }

    #[tokio::test]
    async fn test_load_missing_file() {
        let storage = JsonFileStorage::new(gen_filename("undermoon-broker-missing"));
        assert!(storage.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_load_invalid_file() {
        let filename = gen_filename("undermoon-broker-invalid");
        tokio::fs::write(filename.as_str(), b"not json")
            .await
            .unwrap();
        let storage = JsonFileStorage::new(filename.clone());
        let err = storage.load().await.unwrap_err();
        assert_eq!(err, MetaSyncError::Json);
        remove_file(filename.as_str()).await.unwrap();
    }
}
