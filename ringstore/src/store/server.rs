//! Store server: data-plane and admin listeners, shard creation, and
//! the master heartbeat link.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{interval, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::net::messages::{
    BatchRequest, BatchResponse, BootstrapCopyBatch, BootstrapCopyRequest, CheckBinlogRequest,
    CheckBinlogResponse, CreateShardRequest, DeleteShardRequest, EntryOp, GetResponse, KeyValue,
    LogEntry, OkResponse, Request, ResizeClusterRequest, Response, ScanResponse, ShardStatus,
    StoreHeartbeat, StreamEnd, TailBinlogBatch, TailBinlogRequest, WriteResponse, WRONG_SHARD,
};
use crate::net::{FromBytes, Stream};
use crate::storage::{MergeOp, Row};
use crate::topology::{
    bootstrap_plan_with_topo_change, local_shards, BootstrapPlan, BootstrapRequest, Cluster,
    ClusterRegistry, ShardInfo, StoreResource,
};
use crate::util::now_ns;

use super::shard::Shard;
use super::{Error, LocalShardsInCluster, PeriodicTask, StoreOption};

const CLUSTER_CONFIG_FILE: &str = "cluster.config";
const CLUSTER_DESC_FILE: &str = "cluster.desc";
const MASTER_RETRY: Duration = Duration::from_secs(2);

pub struct StoreServer {
    option: StoreOption,
    store_name: String,
    resource: StoreResource,
    registry: Arc<ClusterRegistry>,
    keyspace_shards: DashMap<String, HashMap<u32, Arc<Shard>>>,
    status_in_cluster: RwLock<HashMap<String, LocalShardsInCluster>>,
    periodic: Mutex<Vec<PeriodicTask>>,
    status_tx: mpsc::UnboundedSender<StoreHeartbeat>,
    shutdown: CancellationToken,
}

impl StoreServer {
    /// Bind listeners, recover local shards, and start serving.
    pub async fn start(option: StoreOption) -> Result<Arc<Self>, Error> {
        std::fs::create_dir_all(&option.dir)?;

        let data_listener = TcpListener::bind(&option.address).await?;
        let admin_listener = TcpListener::bind(&option.admin_address).await?;
        let address = data_listener.local_addr()?.to_string();
        let admin_address = admin_listener.local_addr()?.to_string();

        let resource = StoreResource {
            network: "tcp".into(),
            address: address.clone(),
            admin_address: admin_address.clone(),
            data_center: option.data_center.clone(),
            disk_size_gb: option.disk_size_gb,
            allocated_size_gb: 0,
            tags: option.tags.clone(),
        };

        let (status_tx, status_rx) = mpsc::unbounded_channel();

        let server = Arc::new(Self {
            store_name: format!("store@{}", admin_address),
            option,
            resource,
            registry: Arc::new(ClusterRegistry::new()),
            keyspace_shards: DashMap::new(),
            status_in_cluster: RwLock::new(HashMap::new()),
            periodic: Mutex::new(vec![]),
            status_tx,
            shutdown: CancellationToken::new(),
        });

        server.list_existing_clusters()?;
        server.start_existing_shards().await?;

        info!(
            "{} serving data on {}, admin on {}",
            server.store_name, address, admin_address
        );

        tokio::spawn(server.clone().accept_loop(data_listener, true));
        tokio::spawn(server.clone().accept_loop(admin_listener, false));
        tokio::spawn(server.clone().periodic_loop());
        tokio::spawn(server.clone().master_link(status_rx));

        Ok(server)
    }

    pub fn data_address(&self) -> &str {
        &self.resource.address
    }

    pub fn admin_address(&self) -> &str {
        &self.resource.admin_address
    }

    pub fn resource(&self) -> &StoreResource {
        &self.resource
    }

    /// Stop listeners and shut every shard down.
    pub fn shutdown(&self) {
        info!("{} shutting down", self.store_name);
        self.shutdown.cancel();
        for entry in self.keyspace_shards.iter() {
            for shard in entry.value().values() {
                shard.shutdown_node();
            }
        }
    }

    // ---- recovery -------------------------------------------------------

    fn keyspace_dir(&self, keyspace: &str) -> std::path::PathBuf {
        self.option.dir.join(keyspace)
    }

    /// Enumerate keyspace directories and parse their cluster configs.
    fn list_existing_clusters(&self) -> Result<(), Error> {
        for entry in std::fs::read_dir(&self.option.dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let keyspace = entry.file_name().to_string_lossy().to_string();

            let config_path = entry.path().join(CLUSTER_CONFIG_FILE);
            let text = match std::fs::read_to_string(&config_path) {
                Ok(text) => text,
                Err(err) => {
                    warn!("{}: read {}: {}", self.store_name, config_path.display(), err);
                    continue;
                }
            };
            let status: LocalShardsInCluster = match toml::from_str(&text) {
                Ok(status) => status,
                Err(err) => {
                    error!("{}: parse {}: {}", self.store_name, config_path.display(), err);
                    continue;
                }
            };

            // last known placement, so follows can resolve peers after
            // a restart without waiting for the master
            let desc_path = entry.path().join(CLUSTER_DESC_FILE);
            if let Ok(bytes) = std::fs::read(&desc_path) {
                match serde_json::from_slice::<Cluster>(&bytes) {
                    Ok(cluster) => self.registry.set(cluster),
                    Err(err) => {
                        warn!("{}: parse {}: {}", self.store_name, desc_path.display(), err)
                    }
                }
            }

            info!(
                "{} recovered keyspace {} ({} shards)",
                self.store_name,
                keyspace,
                status.shards.len()
            );
            self.status_in_cluster.write().insert(keyspace, status);
        }
        Ok(())
    }

    /// Open recovered shards and catch them up from their peers.
    async fn start_existing_shards(self: &Arc<Self>) -> Result<(), Error> {
        let statuses: Vec<LocalShardsInCluster> =
            self.status_in_cluster.read().values().cloned().collect();

        for status in statuses {
            for info in &status.shards {
                let shard = self.open_shard(info)?;
                shard
                    .start_with_bootstrap_plan(&BootstrapPlan::plain(info.cluster_size), vec![])
                    .await?;
            }
        }
        Ok(())
    }

    fn open_shard(self: &Arc<Self>, info: &ShardInfo) -> Result<Arc<Shard>, Error> {
        let dir = self.keyspace_dir(&info.keyspace).join(info.shard_id.to_string());
        let shard = Shard::open(
            info,
            dir,
            self.registry.clone(),
            MergeOp::BytesConcat,
            self.option.log_file_size_mb,
            self.option.log_file_count,
        )?;

        self.keyspace_shards
            .entry(info.keyspace.clone())
            .or_default()
            .insert(info.shard_id, shard.clone());

        let mut periodic = self.periodic.lock();
        periodic.push(PeriodicTask::FlushProgress(Arc::downgrade(&shard)));
        periodic.push(PeriodicTask::CompactStore(Arc::downgrade(&shard)));

        Ok(shard)
    }

    fn get_shard(&self, keyspace: &str, shard_id: u32) -> Option<Arc<Shard>> {
        self.keyspace_shards
            .get(keyspace)?
            .get(&shard_id)
            .cloned()
    }

    fn send_shard_status(&self, info: ShardInfo, status: ShardStatus) {
        let _ = self.status_tx.send(StoreHeartbeat::shard_status(
            &self.option.data_center,
            info,
            status,
        ));
    }

    // ---- shard creation and topology ------------------------------------

    /// Open the local shards for a keyspace and run their bootstrap
    /// plans. Idempotent for shards already open.
    pub async fn create_shards(self: &Arc<Self>, req: &CreateShardRequest) -> Result<(), Error> {
        let keyspace = &req.keyspace;
        info!(
            "{} create shards for {} server {} size {} r {}",
            self.store_name, keyspace, req.server_id, req.cluster_size, req.replication_factor
        );

        // primaries of the pre-change topology, for bootstrap dialing
        let mut existing = vec![];
        if let Some(cluster) = self.registry.get(keyspace) {
            for server_id in 0..cluster.expected_size() {
                if let Some(node) = cluster.get_node(server_id, 0) {
                    existing.push(node.clone());
                }
            }
        }

        match &req.cluster {
            Some(cluster) => {
                self.registry.set(cluster.clone());
                self.save_cluster_desc(keyspace, cluster)?;
            }
            None => {
                self.registry
                    .get_or_create(keyspace, req.cluster_size, req.replication_factor);
            }
        }

        if self.keyspace_shards.contains_key(keyspace) {
            let status = self
                .status_in_cluster
                .read()
                .get(keyspace)
                .cloned()
                .ok_or_else(|| Error::MissingLocalStatus(keyspace.clone()))?;
            if status.id != req.server_id {
                return Err(Error::ServerIdMismatch {
                    local: status.id,
                    requested: req.server_id,
                });
            }
            if status.cluster_size == req.cluster_size
                && status.replication_factor == req.replication_factor
                && req.from_cluster_size.is_none()
            {
                return Err(Error::KeyspaceExists(keyspace.clone()));
            }
        }

        std::fs::create_dir_all(self.keyspace_dir(keyspace))?;

        let mut status = self
            .status_in_cluster
            .read()
            .get(keyspace)
            .cloned()
            .unwrap_or(LocalShardsInCluster {
                id: req.server_id,
                cluster_size: req.cluster_size,
                replication_factor: req.replication_factor,
                shards: vec![],
            });

        for cluster_shard in local_shards(req.server_id, req.cluster_size, req.replication_factor)
        {
            let shard_info = status
                .shard_info(cluster_shard.shard_id)
                .cloned()
                .unwrap_or(ShardInfo {
                    server_id: req.server_id,
                    shard_id: cluster_shard.shard_id,
                    keyspace: keyspace.clone(),
                    cluster_size: req.cluster_size,
                    replication_factor: req.replication_factor,
                    is_candidate: req.is_candidate,
                });

            let shard = match self.get_shard(keyspace, cluster_shard.shard_id) {
                Some(shard) => {
                    debug!("{} found existing shard {}", self.store_name, shard);
                    shard
                }
                None => self.open_shard(&shard_info)?,
            };

            let plan = match req.from_cluster_size {
                Some(from) if from != req.cluster_size => {
                    bootstrap_plan_with_topo_change(&BootstrapRequest {
                        server_id: req.server_id,
                        shard_id: cluster_shard.shard_id,
                        from_cluster_size: from,
                        to_cluster_size: req.cluster_size,
                        replication_factor: req.replication_factor,
                    })
                }
                _ => BootstrapPlan::plain(req.cluster_size),
            };
            info!(
                "{} shard {} {}",
                self.store_name,
                shard_info.identifier(),
                plan
            );

            shard
                .start_with_bootstrap_plan(&plan, existing.clone())
                .await?;

            status.upsert_shard(shard_info.clone());
            self.send_shard_status(shard_info, ShardStatus::Ready);
        }

        status.cluster_size = req.cluster_size;
        status.replication_factor = req.replication_factor;
        status.id = req.server_id;
        self.save_cluster_config(&status, keyspace)
    }

    /// Drop every shard of a keyspace and its on-disk data.
    pub fn delete_keyspace(&self, keyspace: &str) -> Result<(), Error> {
        info!("{} delete keyspace {}", self.store_name, keyspace);

        let shards = self
            .keyspace_shards
            .remove(keyspace)
            .map(|(_, shards)| shards)
            .ok_or_else(|| Error::KeyspaceNotFound(keyspace.to_string()))?;

        for (_, shard) in shards {
            let info = ShardInfo {
                server_id: shard.server_id,
                shard_id: shard.id,
                keyspace: keyspace.to_string(),
                cluster_size: 0,
                replication_factor: 0,
                is_candidate: false,
            };
            shard.shutdown_node();
            self.send_shard_status(info, ShardStatus::Deleted);
        }

        self.status_in_cluster.write().remove(keyspace);
        self.registry.remove(keyspace);
        std::fs::remove_dir_all(self.keyspace_dir(keyspace))?;
        Ok(())
    }

    /// Commit a cluster resize: adopt the promoted placement, retire
    /// shards that moved out, re-filter and re-follow the survivors.
    pub fn commit_resize(self: &Arc<Self>, req: &ResizeClusterRequest) -> Result<(), Error> {
        let keyspace = &req.keyspace;
        let target = req.target_cluster_size;
        info!("{} resize {} to {}", self.store_name, keyspace, target);

        if let Some(cluster) = &req.cluster {
            self.registry.set(cluster.clone());
            self.save_cluster_desc(keyspace, cluster)?;
        }

        let mut status = self
            .status_in_cluster
            .read()
            .get(keyspace)
            .cloned()
            .ok_or_else(|| Error::KeyspaceNotFound(keyspace.clone()))?;

        let keep = local_shards(status.id, target, status.replication_factor);
        let mut retired = vec![];

        if let Some(mut shards) = self.keyspace_shards.get_mut(keyspace) {
            shards.retain(|shard_id, shard| {
                if keep.iter().any(|c| c.shard_id == *shard_id) {
                    shard.set_cluster_size(target);
                    shard.cancel_one_time_follows();
                    shard.adjust_normal_followings(target, status.replication_factor);
                    true
                } else {
                    info!("{} retiring shard {}", self.store_name, shard);
                    shard.shutdown_node();
                    retired.push((*shard_id, shard.dir.clone()));
                    false
                }
            });
        }

        for (shard_id, dir) in retired {
            if let Err(err) = std::fs::remove_dir_all(&dir) {
                warn!("{}: remove {}: {}", self.store_name, dir.display(), err);
            }
            self.send_shard_status(
                ShardInfo {
                    server_id: status.id,
                    shard_id,
                    keyspace: keyspace.clone(),
                    cluster_size: target,
                    replication_factor: status.replication_factor,
                    is_candidate: false,
                },
                ShardStatus::Deleted,
            );
        }

        status.cluster_size = target;
        status
            .shards
            .retain(|info| keep.iter().any(|c| c.shard_id == info.shard_id));
        for info in status.shards.iter_mut() {
            info.cluster_size = target;
            info.is_candidate = false;
        }
        self.save_cluster_config(&status, keyspace)
    }

    fn save_cluster_config(
        &self,
        status: &LocalShardsInCluster,
        keyspace: &str,
    ) -> Result<(), Error> {
        let text = toml::to_string_pretty(status)?;
        let path = self.keyspace_dir(keyspace).join(CLUSTER_CONFIG_FILE);
        debug!("{} save cluster config to {}", self.store_name, path.display());
        std::fs::write(&path, text)?;
        self.status_in_cluster
            .write()
            .insert(keyspace.to_string(), status.clone());
        Ok(())
    }

    fn save_cluster_desc(&self, keyspace: &str, cluster: &Cluster) -> Result<(), Error> {
        let path = self.keyspace_dir(keyspace).join(CLUSTER_DESC_FILE);
        std::fs::create_dir_all(self.keyspace_dir(keyspace))?;
        std::fs::write(&path, serde_json::to_vec(cluster)?)?;
        Ok(())
    }

    // ---- listeners ------------------------------------------------------

    async fn accept_loop(self: Arc<Self>, listener: TcpListener, data_plane: bool) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                accepted = listener.accept() => {
                    let (socket, addr) = match accepted {
                        Ok(accepted) => accepted,
                        Err(err) => {
                            warn!("{} accept: {}", self.store_name, err);
                            continue;
                        }
                    };
                    let _ = socket.set_nodelay(true);
                    let server = self.clone();
                    tokio::spawn(async move {
                        let result = if data_plane {
                            server.handle_data_connection(socket).await
                        } else {
                            server.handle_admin_connection(socket).await
                        };
                        if let Err(err) = result {
                            if !err_is_disconnect(&err) {
                                warn!("connection from {}: {}", addr, err);
                            }
                        }
                    });
                }
            }
        }
    }

    async fn periodic_loop(self: Arc<Self>) {
        let mut tick = interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = tick.tick() => {
                    self.periodic.lock().retain(|task| task.every_second());
                }
            }
        }
    }

    // ---- master link ----------------------------------------------------

    /// One heartbeat stream to the master: the resource advertisement
    /// on connect, shard status afterwards. Reconnects forever.
    async fn master_link(
        self: Arc<Self>,
        mut status_rx: mpsc::UnboundedReceiver<StoreHeartbeat>,
    ) {
        let Some(master) = self.option.master.clone() else {
            return;
        };

        loop {
            if self.shutdown.is_cancelled() {
                return;
            }

            match Stream::connect(&master).await {
                Ok(mut stream) => {
                    info!("{} registered with master {}", self.store_name, master);
                    let register = StoreHeartbeat::register(self.resource.clone());
                    if stream.send_flush(&register).await.is_ok() {
                        loop {
                            tokio::select! {
                                _ = self.shutdown.cancelled() => return,
                                update = status_rx.recv() => {
                                    match update {
                                        Some(heartbeat) => {
                                            if stream.send_flush(&heartbeat).await.is_err() {
                                                break;
                                            }
                                        }
                                        None => return,
                                    }
                                }
                            }
                        }
                    }
                    warn!("{} lost master {}", self.store_name, master);
                }
                Err(err) => {
                    debug!("{} dial master {}: {}", self.store_name, master, err);
                }
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = sleep(MASTER_RETRY) => (),
            }
        }
    }

    // ---- data plane -----------------------------------------------------

    async fn handle_data_connection(self: &Arc<Self>, socket: TcpStream) -> Result<(), Error> {
        let mut stream = Stream::plain(socket);
        loop {
            let message = match stream.read_message().await {
                Ok(message) => message,
                Err(err) if err.disconnect() => return Ok(()),
                Err(err) => return Err(err.into()),
            };

            let batch: BatchRequest = message.parse()?;
            let responses = batch
                .requests
                .iter()
                .map(|request| self.process_request(&batch.keyspace, request))
                .collect();
            stream.send_flush(&BatchResponse { responses }).await?;
        }
    }

    fn process_request(&self, keyspace: &str, request: &Request) -> Response {
        let Some(status) = self.status_in_cluster.read().get(keyspace).cloned() else {
            return Response::error(format!("keyspace {} not found", keyspace));
        };
        let cluster_size = status.cluster_size.max(1);

        let route = |partition_hash: u64| -> Option<Arc<Shard>> {
            let shard_id = (partition_hash % cluster_size as u64) as u32;
            self.get_shard(keyspace, shard_id)
        };

        match request {
            Request::Get(get) => match route(get.partition_hash) {
                None => Response::error(WRONG_SHARD),
                Some(shard) => Response::Get(GetResponse {
                    ok: true,
                    status: String::new(),
                    key_value: shard.get(&get.key).map(|row| KeyValue {
                        key: get.key.clone(),
                        value: row.value,
                    }),
                }),
            },

            Request::Put(put) => match route(put.partition_hash) {
                None => Response::error(WRONG_SHARD),
                Some(shard) => {
                    let entry = LogEntry {
                        updated_at_ns: timestamp(put.updated_at_ns),
                        op: EntryOp::Put {
                            key: put.key.clone(),
                            partition_hash: put.partition_hash,
                            value: put.value.clone(),
                            ttl_second: put.ttl_second,
                            op_and_data_type: put.op_and_data_type,
                        },
                    };
                    write_response(shard.write_entry(&entry))
                }
            },

            Request::Delete(delete) => match route(delete.partition_hash) {
                None => Response::error(WRONG_SHARD),
                Some(shard) => {
                    let entry = LogEntry {
                        updated_at_ns: timestamp(delete.updated_at_ns),
                        op: EntryOp::Delete {
                            key: delete.key.clone(),
                            partition_hash: delete.partition_hash,
                        },
                    };
                    write_response(shard.write_entry(&entry))
                }
            },

            Request::Merge(merge) => match route(merge.partition_hash) {
                None => Response::error(WRONG_SHARD),
                Some(shard) => {
                    let entry = LogEntry {
                        updated_at_ns: timestamp(merge.updated_at_ns),
                        op: EntryOp::Merge {
                            key: merge.key.clone(),
                            partition_hash: merge.partition_hash,
                            value: merge.value.clone(),
                            op_and_data_type: merge.op_and_data_type,
                        },
                    };
                    write_response(shard.write_entry(&entry))
                }
            },

            Request::Scan(scan) => match route(scan.partition_hash) {
                None => Response::error(WRONG_SHARD),
                Some(shard) => {
                    let last_seen = (!scan.last_seen_key.is_empty())
                        .then(|| scan.last_seen_key.as_ref());
                    Response::Scan(ScanResponse {
                        ok: true,
                        status: String::new(),
                        key_values: shard.prefix_scan(
                            &scan.prefix,
                            last_seen,
                            scan.limit as usize,
                        ),
                    })
                }
            },
        }
    }

    // ---- admin plane ----------------------------------------------------

    async fn handle_admin_connection(self: &Arc<Self>, socket: TcpStream) -> Result<(), Error> {
        let mut stream = Stream::plain(socket);
        let message = match stream.read_message().await {
            Ok(message) => message,
            Err(err) if err.disconnect() => return Ok(()),
            Err(err) => return Err(err.into()),
        };

        match message.code() {
            'S' => {
                let request = CreateShardRequest::from_bytes(message.payload())?;
                let response = match self.create_shards(&request).await {
                    Ok(()) => OkResponse::ok(),
                    Err(err) => {
                        error!("{} create shards: {}", self.store_name, err);
                        OkResponse::error(err)
                    }
                };
                stream.send_flush(&response).await?;
            }

            'D' => {
                let request = DeleteShardRequest::from_bytes(message.payload())?;
                let response = match self.delete_keyspace(&request.keyspace) {
                    Ok(()) => OkResponse::ok(),
                    Err(err) => OkResponse::error(err),
                };
                stream.send_flush(&response).await?;
            }

            'Y' => {
                let request = ResizeClusterRequest::from_bytes(message.payload())?;
                let response = match self.commit_resize(&request) {
                    Ok(()) => OkResponse::ok(),
                    Err(err) => OkResponse::error(err),
                };
                stream.send_flush(&response).await?;
            }

            'B' => {
                let request = CheckBinlogRequest::from_bytes(message.payload())?;
                match self.get_shard(&request.keyspace, request.shard_id) {
                    Some(shard) => {
                        let (earliest, latest) = match &shard.binlog {
                            Some(binlog) => (binlog.earliest(), binlog.latest()),
                            None => (0, 0),
                        };
                        stream
                            .send_flush(&CheckBinlogResponse {
                                earliest_segment: earliest,
                                latest_segment: latest,
                            })
                            .await?;
                    }
                    None => {
                        stream
                            .send_flush(&OkResponse::error(Error::ShardNotFound(format!(
                                "{}.{}",
                                request.keyspace, request.shard_id
                            ))))
                            .await?;
                    }
                }
            }

            'P' => {
                let request = BootstrapCopyRequest::from_bytes(message.payload())?;
                self.serve_bootstrap_copy(&mut stream, &request).await?;
            }

            'T' => {
                let request = TailBinlogRequest::from_bytes(message.payload())?;
                self.serve_tail_binlog(&mut stream, &request).await?;
            }

            code => {
                stream
                    .send_flush(&OkResponse::error(format!("unexpected message '{}'", code)))
                    .await?;
            }
        }

        Ok(())
    }

    /// Stream the shard's rows in key order, filtered by the
    /// requester's partition rule, ending with the binlog position the
    /// copy covers.
    async fn serve_bootstrap_copy(
        self: &Arc<Self>,
        stream: &mut Stream,
        req: &BootstrapCopyRequest,
    ) -> Result<(), Error> {
        let Some(shard) = self.get_shard(&req.keyspace, req.shard_id) else {
            stream
                .send_flush(&StreamEnd::error(format!(
                    "shard {}.{} not found",
                    req.keyspace, req.shard_id
                )))
                .await?;
            return Ok(());
        };

        debug!(
            "{} bootstrap copy of {} for {}",
            self.store_name, shard, req.origin
        );

        // captured before the scan: everything written after this
        // position will reach the follower by tailing
        let tail = shard
            .binlog
            .as_ref()
            .map(|binlog| binlog.tail_position())
            .unwrap_or((0, 0));

        let mut last_key: Option<Vec<u8>> = None;
        loop {
            let batch = shard.db.scan_from(last_key.as_deref(), 1024);
            let Some((key, _)) = batch.last() else {
                break;
            };
            last_key = Some(key.clone());

            let key_values: Vec<KeyValue> = batch
                .into_iter()
                .filter(|(_, value)| match_target_filter(value, req))
                .map(|(key, value)| KeyValue {
                    key: Bytes::from(key),
                    value,
                })
                .collect();

            if !key_values.is_empty() {
                stream
                    .send(&BootstrapCopyBatch {
                        key_values,
                        binlog_progress: None,
                    })
                    .await?;
            }
        }

        stream
            .send(&BootstrapCopyBatch {
                key_values: vec![],
                binlog_progress: Some(tail),
            })
            .await?;
        stream.send_flush(&StreamEnd::ok()).await?;
        Ok(())
    }

    /// Long-poll tail of the shard's binlog. Entries are filtered by
    /// the requester's partition rule, but the cursor always advances
    /// so filtered-out history is not re-read.
    async fn serve_tail_binlog(
        self: &Arc<Self>,
        stream: &mut Stream,
        req: &TailBinlogRequest,
    ) -> Result<(), Error> {
        let Some(shard) = self.get_shard(&req.keyspace, req.shard_id) else {
            stream
                .send_flush(&StreamEnd::error(format!(
                    "shard {}.{} not found",
                    req.keyspace, req.shard_id
                )))
                .await?;
            return Ok(());
        };
        let Some(binlog) = shard.binlog.clone() else {
            // no binlog configured: an empty stream, not an error
            stream.send_flush(&StreamEnd::ok()).await?;
            return Ok(());
        };

        debug!(
            "{} tail of {} for {} from {}:{}",
            self.store_name, shard, req.origin, req.segment, req.offset
        );

        let limit = (req.limit as usize).clamp(1, 65536);
        let mut segment = req.segment;
        let mut offset = req.offset;

        loop {
            if shard.is_shutdown() {
                stream.send_flush(&StreamEnd::ok()).await?;
                return Ok(());
            }

            let notified = binlog.appended();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match binlog.read(segment, offset, limit) {
                Ok((records, next_segment, next_offset)) => {
                    if records.is_empty() && (next_segment, next_offset) == (segment, offset) {
                        // at the tail; wait for an append, shutdown, or
                        // the follower hanging up
                        let wait = tokio::select! {
                            _ = self.shutdown.cancelled() => TailWait::Shutdown,
                            _ = &mut notified => TailWait::Appended,
                            read = stream.read_message() => TailWait::Follower(read),
                        };
                        match wait {
                            TailWait::Shutdown => {
                                stream.send_flush(&StreamEnd::ok()).await?;
                                return Ok(());
                            }
                            TailWait::Appended => continue,
                            TailWait::Follower(Err(err)) if err.disconnect() => return Ok(()),
                            TailWait::Follower(Err(err)) => return Err(err.into()),
                            TailWait::Follower(Ok(message)) => {
                                return Err(Error::Net(crate::net::Error::UnexpectedMessage(
                                    message.code(),
                                )));
                            }
                        }
                    }

                    let entries: Vec<LogEntry> = records
                        .iter()
                        .filter_map(|record| match LogEntry::from_bytes(record.clone()) {
                            Ok(entry) => Some(entry),
                            Err(err) => {
                                warn!("{}: undecodable binlog record: {}", shard, err);
                                None
                            }
                        })
                        .filter(|entry| {
                            req.target_cluster_size == 0
                                || entry.partition_hash() % req.target_cluster_size as u64
                                    == req.target_shard_id as u64
                        })
                        .collect();

                    stream
                        .send_flush(&TailBinlogBatch {
                            entries,
                            next_segment,
                            next_offset,
                        })
                        .await?;
                    segment = next_segment;
                    offset = next_offset;
                }
                Err(err) => {
                    stream.send_flush(&StreamEnd::error(err)).await?;
                    return Ok(());
                }
            }
        }
    }
}

enum TailWait {
    Shutdown,
    Appended,
    Follower(Result<crate::net::Message, crate::net::Error>),
}

fn timestamp(requested: u64) -> u64 {
    if requested == 0 {
        now_ns()
    } else {
        requested
    }
}

fn write_response(result: Result<(), Error>) -> Response {
    match result {
        Ok(()) => Response::Write(WriteResponse {
            ok: true,
            status: String::new(),
        }),
        Err(err) => Response::error(err),
    }
}

fn match_target_filter(value: &Bytes, req: &BootstrapCopyRequest) -> bool {
    if req.target_cluster_size == 0 {
        return true;
    }
    match Row::from_bytes(value.clone()) {
        Ok(row) => {
            row.partition_hash % req.target_cluster_size as u64 == req.target_shard_id as u64
        }
        Err(_) => true,
    }
}

fn err_is_disconnect(err: &Error) -> bool {
    matches!(err, Error::Net(net) if net.disconnect())
}
