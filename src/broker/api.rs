use super::service::{MemBrokerConfigPayload, MemBrokerService, ProxyResourcePayload};
use super::store::{ErrorKind, MetaStore, MetaStoreError};
use crate::common::cluster::{Cluster, ClusterName, MigrationTaskMeta, Proxy};
use crate::common::version::UNDERMOON_BROKER_VERSION;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use warp::filters::BoxedFilter;
use warp::http::{Method, StatusCode};
use warp::reply::{Reply, Response};
use warp::Filter;

pub const MEM_BROKER_API_VERSION: &str = "v3";

// The whole snapshot is sent through `PUT /metadata`.
const MAX_BODY_SIZE: u64 = 64 * 1024 * 1024;

type ServiceState = Arc<MemBrokerService>;
type ApiResult = Result<Response, Infallible>;

pub fn gen_routes(
    service: ServiceState,
) -> impl Filter<Extract = impl Reply, Error = warp::Rejection> + Clone {
    let debug_service = if service.get_config().debug {
        Some(service.clone())
    } else {
        None
    };
    let log = warp::log::custom(move |info: warp::log::Info| {
        // The GET APIs are accessed too frequently so we don't log them.
        if info.method() != Method::GET {
            info!(
                "{} {} {:?} status {} in {:?}",
                info.method(),
                info.path(),
                info.remote_addr(),
                info.status(),
                info.elapsed()
            );
        } else if let Some(service) = debug_service.clone() {
            tokio::spawn(async move {
                if let Err(invalid_meta_store) = service.check_metadata().await {
                    error!("Invalid meta store: {:?}", invalid_meta_store);
                }
            });
        }
    });

    warp::path("api")
        .and(warp::path(MEM_BROKER_API_VERSION))
        .and(
            meta_routes(service.clone())
                .or(cluster_routes(service.clone()))
                .unify()
                .or(migration_routes(service.clone()))
                .unify()
                .or(proxy_routes(service.clone()))
                .unify()
                .or(epoch_routes(service))
                .unify(),
        )
        .with(log)
}

fn with_service(
    service: ServiceState,
) -> impl Filter<Extract = (ServiceState,), Error = Infallible> + Clone {
    warp::any().map(move || service.clone())
}

fn json_body<T: DeserializeOwned + Send>(
) -> impl Filter<Extract = (T,), Error = warp::Rejection> + Clone {
    warp::body::content_length_limit(MAX_BODY_SIZE).and(warp::body::json())
}

#[derive(Debug, Deserialize)]
struct Pagination {
    offset: Option<usize>,
    limit: Option<usize>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ClusterNamesPayload {
    pub names: Vec<ClusterName>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ClusterPayload {
    pub cluster: Option<Cluster>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ProxyAddressesPayload {
    pub addresses: Vec<String>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ProxyPayload {
    pub proxy: Option<Proxy>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct FailuresPayload {
    pub addresses: Vec<String>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct FailedProxiesPayload {
    pub addresses: Vec<String>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ReplaceProxyResponse {
    pub proxy: Option<Proxy>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct CreateClusterPayload {
    pub node_number: usize,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct AutoAddNodesPayload {
    pub node_number: usize,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct AutoScaleUpNodesPayload {
    pub cluster_node_number: usize,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ResourceFailureCheckPayload {
    pub hosts_cannot_fail: Vec<String>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct RecoverEpochResult {
    pub failed_addresses: Vec<String>,
}

fn error_response(err: MetaStoreError) -> Response {
    let status = match err.kind() {
        ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    };
    warp::reply::with_status(warp::reply::json(&err), status).into_response()
}

fn json_response<T: Serialize>(res: Result<T, MetaStoreError>) -> Response {
    match res {
        Ok(body) => warp::reply::json(&body).into_response(),
        Err(err) => error_response(err),
    }
}

fn empty_response(res: Result<(), MetaStoreError>) -> Response {
    match res {
        Ok(()) => warp::reply().into_response(),
        Err(err) => error_response(err),
    }
}

// Persists the change before replying when `auto_update_meta_file` is on.
// The change is already live at this point, so a failed write only gets logged.
// The next successful write carries it.
async fn updated<T>(
    service: &MemBrokerService,
    res: Result<T, MetaStoreError>,
) -> Result<T, MetaStoreError> {
    let value = res?;
    persist(service).await;
    Ok(value)
}

async fn persist(service: &MemBrokerService) {
    if let Err(err) = service.trigger_update().await {
        error!("change committed but failed to update meta file: {}", err);
    }
}

fn meta_routes(service: ServiceState) -> BoxedFilter<(Response,)> {
    let version = warp::path!("version")
        .and(warp::get())
        .and_then(get_version);
    let get_metadata = warp::path!("metadata")
        .and(warp::get())
        .and(with_service(service.clone()))
        .and_then(get_all_metadata);
    let put_metadata = warp::path!("metadata")
        .and(warp::put())
        .and(json_body::<MetaStore>())
        .and(with_service(service.clone()))
        .and_then(restore_metadata);
    let get_config = warp::path!("config")
        .and(warp::get())
        .and(with_service(service.clone()))
        .and_then(get_broker_config);
    let put_config = warp::path!("config")
        .and(warp::put())
        .and(json_body::<MemBrokerConfigPayload>())
        .and(with_service(service.clone()))
        .and_then(change_broker_config);
    let check_resource = warp::path!("resources" / "failures" / "check")
        .and(warp::post())
        .and(with_service(service))
        .and_then(check_resource_for_failures);

    version
        .or(get_metadata)
        .unify()
        .or(put_metadata)
        .unify()
        .or(get_config)
        .unify()
        .or(put_config)
        .unify()
        .or(check_resource)
        .unify()
        .boxed()
}

fn cluster_routes(service: ServiceState) -> BoxedFilter<(Response,)> {
    let names = warp::path!("clusters" / "names")
        .and(warp::get())
        .and(warp::query::<Pagination>())
        .and(with_service(service.clone()))
        .and_then(get_cluster_names);
    let get_meta = warp::path!("clusters" / "meta" / String)
        .and(warp::get())
        .and(with_service(service.clone()))
        .and_then(get_cluster_by_name);
    let add = warp::path!("clusters" / "meta" / String)
        .and(warp::post())
        .and(json_body::<CreateClusterPayload>())
        .and(with_service(service.clone()))
        .and_then(add_cluster);
    let remove = warp::path!("clusters" / "meta" / String)
        .and(warp::delete())
        .and(with_service(service.clone()))
        .and_then(remove_cluster);
    let info = warp::path!("clusters" / "info" / String)
        .and(warp::get())
        .and(with_service(service.clone()))
        .and_then(get_cluster_info_by_name);
    let add_nodes = warp::path!("clusters" / "nodes" / String)
        .and(warp::patch())
        .and(json_body::<AutoAddNodesPayload>())
        .and(with_service(service.clone()))
        .and_then(auto_add_nodes);
    let scale_up_nodes = warp::path!("clusters" / "nodes" / String)
        .and(warp::put())
        .and(json_body::<AutoScaleUpNodesPayload>())
        .and(with_service(service.clone()))
        .and_then(auto_scale_up_nodes);
    let delete_free_nodes = warp::path!("clusters" / "free_nodes" / String)
        .and(warp::delete())
        .and(with_service(service.clone()))
        .and_then(auto_delete_free_nodes);
    let config = warp::path!("clusters" / "config" / String)
        .and(warp::patch())
        .and(json_body::<HashMap<String, String>>())
        .and(with_service(service.clone()))
        .and_then(change_config);
    let balance = warp::path!("clusters" / "balance" / String)
        .and(warp::put())
        .and(with_service(service))
        .and_then(balance_masters);

    names
        .or(get_meta)
        .unify()
        .or(add)
        .unify()
        .or(remove)
        .unify()
        .or(info)
        .unify()
        .or(add_nodes)
        .unify()
        .or(scale_up_nodes)
        .unify()
        .or(delete_free_nodes)
        .unify()
        .or(config)
        .unify()
        .or(balance)
        .unify()
        .boxed()
}

fn migration_routes(service: ServiceState) -> BoxedFilter<(Response,)> {
    let expand = warp::path!("clusters" / "migrations" / "expand" / String)
        .and(warp::post())
        .and(with_service(service.clone()))
        .and_then(migrate_slots);
    let shrink = warp::path!("clusters" / "migrations" / "shrink" / String / usize)
        .and(warp::post())
        .and(with_service(service.clone()))
        .and_then(migrate_slots_to_scale_down);
    let auto = warp::path!("clusters" / "migrations" / "auto" / String / usize)
        .and(warp::post())
        .and(with_service(service.clone()))
        .and_then(auto_scale_node_number);
    let status = warp::path!("clusters" / "migrations" / "status" / String)
        .and(warp::get())
        .and(with_service(service.clone()))
        .and_then(get_migration_status);
    let resume = warp::path!("clusters" / "migrations" / "resume" / String)
        .and(warp::post())
        .and(with_service(service.clone()))
        .and_then(resume_migration);
    let commit = warp::path!("clusters" / "migrations")
        .and(warp::put())
        .and(json_body::<MigrationTaskMeta>())
        .and(with_service(service))
        .and_then(commit_migration);

    expand
        .or(shrink)
        .unify()
        .or(auto)
        .unify()
        .or(status)
        .unify()
        .or(resume)
        .unify()
        .or(commit)
        .unify()
        .boxed()
}

fn proxy_routes(service: ServiceState) -> BoxedFilter<(Response,)> {
    let addresses = warp::path!("proxies" / "addresses")
        .and(warp::get())
        .and(warp::query::<Pagination>())
        .and(with_service(service.clone()))
        .and_then(get_proxy_addresses);
    let get_meta = warp::path!("proxies" / "meta" / String)
        .and(warp::get())
        .and(with_service(service.clone()))
        .and_then(get_proxy_by_address);
    let add = warp::path!("proxies" / "meta")
        .and(warp::post())
        .and(json_body::<ProxyResourcePayload>())
        .and(with_service(service.clone()))
        .and_then(add_proxy);
    let remove = warp::path!("proxies" / "meta" / String)
        .and(warp::delete())
        .and(with_service(service.clone()))
        .and_then(remove_proxy);
    let add_failure = warp::path!("failures" / String / String)
        .and(warp::post())
        .and(with_service(service.clone()))
        .and_then(add_failure);
    let failures = warp::path!("failures")
        .and(warp::get())
        .and(with_service(service.clone()))
        .and_then(get_failures);
    let failed = warp::path!("proxies" / "failed" / "addresses")
        .and(warp::get())
        .and(with_service(service.clone()))
        .and_then(get_failed_proxies);
    let failover = warp::path!("proxies" / "failover" / String)
        .and(warp::post())
        .and(with_service(service))
        .and_then(replace_failed_proxy);

    addresses
        .or(get_meta)
        .unify()
        .or(add)
        .unify()
        .or(remove)
        .unify()
        .or(add_failure)
        .unify()
        .or(failures)
        .unify()
        .or(failed)
        .unify()
        .or(failover)
        .unify()
        .boxed()
}

fn epoch_routes(service: ServiceState) -> BoxedFilter<(Response,)> {
    let get = warp::path!("epoch")
        .and(warp::get())
        .and(with_service(service.clone()))
        .and_then(get_epoch);
    let recovery = warp::path!("epoch" / "recovery")
        .and(warp::put())
        .and(with_service(service.clone()))
        .and_then(recover_epoch);
    let bump = warp::path!("epoch" / u64)
        .and(warp::put())
        .and(with_service(service))
        .and_then(bump_epoch);

    get.or(recovery)
        .unify()
        .or(bump)
        .unify()
        .boxed()
}

async fn get_version() -> ApiResult {
    Ok(UNDERMOON_BROKER_VERSION.into_response())
}

async fn get_all_metadata(state: ServiceState) -> ApiResult {
    let res = match state.get_all_data().await {
        Ok(store) => warp::reply::json(&*store).into_response(),
        Err(err) => error_response(err),
    };
    Ok(res)
}

async fn restore_metadata(meta_store: MetaStore, state: ServiceState) -> ApiResult {
    let res = state.restore_metadata(meta_store).await;
    Ok(empty_response(updated(&state, res).await))
}

async fn get_broker_config(state: ServiceState) -> ApiResult {
    Ok(json_response(state.get_broker_config()))
}

async fn change_broker_config(
    config_payload: MemBrokerConfigPayload,
    state: ServiceState,
) -> ApiResult {
    Ok(empty_response(state.change_broker_config(config_payload)))
}

async fn check_resource_for_failures(state: ServiceState) -> ApiResult {
    let res = state
        .check_resource_for_failures()
        .await
        .map(|hosts_cannot_fail| ResourceFailureCheckPayload { hosts_cannot_fail });
    Ok(json_response(res))
}

async fn get_cluster_names(pagination: Pagination, state: ServiceState) -> ApiResult {
    let Pagination { offset, limit } = pagination;
    let res = state
        .get_cluster_names(offset, limit)
        .await
        .map(|names| ClusterNamesPayload { names });
    Ok(json_response(res))
}

async fn get_cluster_by_name(cluster_name: String, state: ServiceState) -> ApiResult {
    let res = state
        .get_cluster_by_name(&cluster_name)
        .await
        .map(|cluster| ClusterPayload { cluster });
    Ok(json_response(res))
}

async fn get_cluster_info_by_name(cluster_name: String, state: ServiceState) -> ApiResult {
    let res = match state.get_cluster_info_by_name(&cluster_name).await {
        Ok(Some(cluster_info)) => Ok(cluster_info),
        Ok(None) => Err(MetaStoreError::ClusterNotFound),
        Err(err) => Err(err),
    };
    Ok(json_response(res))
}

async fn add_cluster(
    cluster_name: String,
    payload: CreateClusterPayload,
    state: ServiceState,
) -> ApiResult {
    let CreateClusterPayload { node_number } = payload;
    let res = state.add_cluster(cluster_name, node_number).await;
    Ok(empty_response(updated(&state, res).await))
}

async fn remove_cluster(cluster_name: String, state: ServiceState) -> ApiResult {
    let res = state.remove_cluster(cluster_name).await;
    Ok(empty_response(updated(&state, res).await))
}

async fn auto_add_nodes(
    cluster_name: String,
    payload: AutoAddNodesPayload,
    state: ServiceState,
) -> ApiResult {
    let res = state
        .auto_add_nodes(cluster_name, payload.node_number)
        .await;
    Ok(json_response(updated(&state, res).await))
}

async fn auto_scale_up_nodes(
    cluster_name: String,
    payload: AutoScaleUpNodesPayload,
    state: ServiceState,
) -> ApiResult {
    let res = state
        .auto_scale_up_nodes(cluster_name, payload.cluster_node_number)
        .await;
    Ok(json_response(updated(&state, res).await))
}

async fn auto_delete_free_nodes(cluster_name: String, state: ServiceState) -> ApiResult {
    let res = state.auto_delete_free_nodes(cluster_name).await;
    Ok(empty_response(updated(&state, res).await))
}

async fn change_config(
    cluster_name: String,
    config: HashMap<String, String>,
    state: ServiceState,
) -> ApiResult {
    let res = state.change_config(cluster_name, config).await;
    Ok(empty_response(updated(&state, res).await))
}

async fn balance_masters(cluster_name: String, state: ServiceState) -> ApiResult {
    let res = state.balance_masters(cluster_name).await;
    Ok(empty_response(updated(&state, res).await))
}

async fn migrate_slots(cluster_name: String, state: ServiceState) -> ApiResult {
    let res = state.migrate_slots(cluster_name).await;
    Ok(empty_response(updated(&state, res).await))
}

async fn migrate_slots_to_scale_down(
    cluster_name: String,
    new_node_num: usize,
    state: ServiceState,
) -> ApiResult {
    let res = state
        .migrate_slots_to_scale_down(cluster_name, new_node_num)
        .await;
    Ok(empty_response(updated(&state, res).await))
}

async fn auto_scale_node_number(
    cluster_name: String,
    new_node_num: usize,
    state: ServiceState,
) -> ApiResult {
    // The nodes may have been added even if the scaling fails.
    let res = state
        .auto_scale_node_number(cluster_name, new_node_num)
        .await;
    persist(&state).await;
    Ok(empty_response(res))
}

async fn get_migration_status(cluster_name: String, state: ServiceState) -> ApiResult {
    Ok(json_response(Ok(state.get_migration_status(&cluster_name))))
}

async fn resume_migration(cluster_name: String, state: ServiceState) -> ApiResult {
    Ok(empty_response(state.resume_migration(cluster_name).await))
}

async fn commit_migration(task: MigrationTaskMeta, state: ServiceState) -> ApiResult {
    let res = state.commit_migration(task).await;
    Ok(empty_response(updated(&state, res).await))
}

async fn get_proxy_addresses(pagination: Pagination, state: ServiceState) -> ApiResult {
    let Pagination { offset, limit } = pagination;
    let res = state
        .get_proxy_addresses(offset, limit)
        .await
        .map(|addresses| ProxyAddressesPayload { addresses });
    Ok(json_response(res))
}

async fn get_proxy_by_address(address: String, state: ServiceState) -> ApiResult {
    let res = state
        .get_proxy_by_address(&address)
        .await
        .map(|proxy| ProxyPayload { proxy });
    Ok(json_response(res))
}

async fn add_proxy(proxy_resource: ProxyResourcePayload, state: ServiceState) -> ApiResult {
    let res = state.add_proxy(proxy_resource).await;
    Ok(empty_response(updated(&state, res).await))
}

async fn remove_proxy(proxy_address: String, state: ServiceState) -> ApiResult {
    let res = state.remove_proxy(proxy_address).await;
    Ok(empty_response(updated(&state, res).await))
}

async fn add_failure(
    server_proxy_address: String,
    reporter_id: String,
    state: ServiceState,
) -> ApiResult {
    let res = state.add_failure(server_proxy_address, reporter_id).await;
    Ok(empty_response(updated(&state, res).await))
}

async fn get_failures(state: ServiceState) -> ApiResult {
    let res = state
        .get_failures()
        .await
        .map(|addresses| FailuresPayload { addresses });
    Ok(json_response(res))
}

async fn get_failed_proxies(state: ServiceState) -> ApiResult {
    let res = state
        .get_failed_proxies()
        .await
        .map(|addresses| FailedProxiesPayload { addresses });
    Ok(json_response(res))
}

async fn replace_failed_proxy(proxy_address: String, state: ServiceState) -> ApiResult {
    let res = state
        .replace_failed_proxy(proxy_address)
        .await
        .map(|proxy| ReplaceProxyResponse { proxy });
    Ok(json_response(updated(&state, res).await))
}

async fn get_epoch(state: ServiceState) -> ApiResult {
    let res = match state.get_epoch().await {
        Ok(epoch) => epoch.to_string().into_response(),
        Err(err) => error_response(err),
    };
    Ok(res)
}

async fn recover_epoch(state: ServiceState) -> ApiResult {
    let res = state
        .recover_epoch()
        .await
        .map(|failed_addresses| RecoverEpochResult { failed_addresses });
    Ok(json_response(updated(&state, res).await))
}

async fn bump_epoch(new_epoch: u64, state: ServiceState) -> ApiResult {
    let res = state.force_bump_all_epoch(new_epoch).await;
    Ok(empty_response(updated(&state, res).await))
}
