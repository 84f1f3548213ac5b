//! Master server: registration streams and admin RPCs.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::net::messages::peer::expect_ok;
use crate::net::messages::{
    ClientHeartbeat, ClusterUpdate, CreateClusterRequest, CreateClusterResponse,
    CreateShardRequest, DeleteClusterRequest, DeleteShardRequest, DescRequest, DescResponse,
    OkResponse, ResizeClusterRequest, ShardStatus, StoreHeartbeat,
};
use crate::net::{FromBytes, MessageWriter, Stream};
use crate::topology::{
    local_shards, meet_requirement, Cluster, ClusterNode, DataCenter, ShardInfo, StoreResource,
};

use super::{ClientChannels, ClientKey, Error, Keyspaces, MasterOption};

/// How long to wait for READY notifications past the create-shard RPCs
/// during a resize. The RPCs themselves complete after bootstrap, so
/// this only covers heartbeat lag.
const READY_WAIT: Duration = Duration::from_secs(5);

type ReadyKey = (String, u32, u32);

pub struct MasterServer {
    option: MasterOption,
    address: String,
    data_centers: RwLock<HashMap<String, DataCenter>>,
    keyspaces: Keyspaces,
    clients: ClientChannels,
    ready_waiters: Mutex<HashMap<ReadyKey, Vec<oneshot::Sender<()>>>>,
    shutdown: CancellationToken,
}

impl MasterServer {
    pub async fn start(option: MasterOption) -> Result<Arc<Self>, Error> {
        let listener = TcpListener::bind(&option.address).await?;
        let address = listener.local_addr()?.to_string();

        let server = Arc::new(Self {
            option,
            address: address.clone(),
            data_centers: RwLock::new(HashMap::new()),
            keyspaces: Keyspaces::new(),
            clients: ClientChannels::new(),
            ready_waiters: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        });

        info!("master listening on {}", address);
        tokio::spawn(server.clone().accept_loop(listener));
        Ok(server)
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn shutdown(&self) {
        info!("master shutting down");
        self.shutdown.cancel();
    }

    /// Stores currently registered in a data center.
    pub fn store_count(&self, data_center: &str) -> usize {
        self.data_centers
            .read()
            .get(data_center)
            .map(|dc| dc.servers().len())
            .unwrap_or(0)
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                accepted = listener.accept() => {
                    let (socket, addr) = match accepted {
                        Ok(accepted) => accepted,
                        Err(err) => {
                            warn!("master accept: {}", err);
                            continue;
                        }
                    };
                    let _ = socket.set_nodelay(true);
                    let server = self.clone();
                    tokio::spawn(async move {
                        if let Err(err) = server.handle_connection(socket).await {
                            if !matches!(&err, Error::Net(net) if net.disconnect()) {
                                warn!("master connection from {}: {}", addr, err);
                            }
                        }
                    });
                }
            }
        }
    }

    async fn handle_connection(self: &Arc<Self>, socket: TcpStream) -> Result<(), Error> {
        let mut stream = Stream::plain(socket);
        let message = match stream.read_message().await {
            Ok(message) => message,
            Err(err) if err.disconnect() => return Ok(()),
            Err(err) => return Err(err.into()),
        };

        match message.code() {
            'H' => {
                let heartbeat = StoreHeartbeat::from_bytes(message.payload())?;
                self.handle_store_stream(stream, heartbeat).await
            }
            'C' => {
                let heartbeat = ClientHeartbeat::from_bytes(message.payload())?;
                self.handle_client_stream(stream, heartbeat).await
            }
            'K' => {
                let request = CreateClusterRequest::from_bytes(message.payload())?;
                let response = match self.create_cluster(&request).await {
                    Ok(cluster) => CreateClusterResponse::ok(cluster),
                    Err(err) => {
                        error!("create cluster {}: {}", request.keyspace, err);
                        CreateClusterResponse::error(err)
                    }
                };
                stream.send_flush(&response).await?;
                Ok(())
            }
            'Y' => {
                let request = ResizeClusterRequest::from_bytes(message.payload())?;
                let response = match self.resize_cluster(&request).await {
                    Ok(()) => OkResponse::ok(),
                    Err(err) => {
                        error!("resize cluster {}: {}", request.keyspace, err);
                        OkResponse::error(err)
                    }
                };
                stream.send_flush(&response).await?;
                Ok(())
            }
            'X' => {
                let request = DeleteClusterRequest::from_bytes(message.payload())?;
                let response = match self.delete_cluster(&request.keyspace).await {
                    Ok(()) => OkResponse::ok(),
                    Err(err) => OkResponse::error(err),
                };
                stream.send_flush(&response).await?;
                Ok(())
            }
            'G' => {
                let request = DescRequest::from_bytes(message.payload())?;
                stream
                    .send_flush(&DescResponse {
                        cluster: self.keyspaces.cluster(&request.keyspace),
                    })
                    .await?;
                Ok(())
            }
            code => Err(Error::Net(crate::net::Error::UnexpectedMessage(code))),
        }
    }

    // ---- store registration ---------------------------------------------

    async fn handle_store_stream(
        self: &Arc<Self>,
        mut stream: Stream,
        first: StoreHeartbeat,
    ) -> Result<(), Error> {
        let Some(resource) = first.store.clone() else {
            return Err(Error::Net(crate::net::Error::Remote(
                "store heartbeat without resource".into(),
            )));
        };
        let data_center = if first.data_center.is_empty() {
            resource.data_center.clone()
        } else {
            first.data_center.clone()
        };

        info!(
            "store connected: {} ({} GB) in {}",
            resource.admin_address, resource.disk_size_gb, data_center
        );
        self.data_centers
            .write()
            .entry(data_center.clone())
            .or_insert_with(|| DataCenter::new(&data_center))
            .add_store(resource.clone());

        let result = loop {
            match stream.read_message().await {
                Ok(message) => match message.code() {
                    'H' => {
                        let heartbeat = StoreHeartbeat::from_bytes(message.payload())?;
                        if let Some((info, status)) = heartbeat.shard_status {
                            self.on_shard_status(&info, status);
                        }
                    }
                    code => break Err(Error::Net(crate::net::Error::UnexpectedMessage(code))),
                },
                Err(err) if err.disconnect() => break Ok(()),
                Err(err) => break Err(err.into()),
            }
        };

        // deregister on disconnect
        info!("store disconnected: {}", resource.admin_address);
        if let Some(dc) = self.data_centers.write().get_mut(&data_center) {
            dc.remove_store(&resource.admin_address);
        }

        result
    }

    fn on_shard_status(&self, info: &ShardInfo, status: ShardStatus) {
        debug!("shard {} reported {:?}", info.identifier(), status);
        if status != ShardStatus::Ready {
            return;
        }
        let key = (info.keyspace.clone(), info.server_id, info.shard_id);
        if let Some(waiters) = self.ready_waiters.lock().remove(&key) {
            for waiter in waiters {
                let _ = waiter.send(());
            }
        }
    }

    fn register_ready_waiter(&self, keyspace: &str, server_id: u32, shard_id: u32) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.ready_waiters
            .lock()
            .entry((keyspace.to_string(), server_id, shard_id))
            .or_default()
            .push(tx);
        rx
    }

    // ---- client registration --------------------------------------------

    async fn handle_client_stream(
        self: &Arc<Self>,
        stream: Stream,
        first: ClientHeartbeat,
    ) -> Result<(), Error> {
        let client = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|| "unknown".into());
        let (mut reader, writer) = stream.into_split().await?;

        // one writer task per connection; follows feed it
        let (out_tx, out_rx) = mpsc::channel::<ClusterUpdate>(8);
        let conn_token = self.shutdown.child_token();
        tokio::spawn(client_writer(writer, out_rx, conn_token.clone()));

        let mut followed: Vec<ClientKey> = vec![];
        let mut heartbeat = Some(first);

        let result = loop {
            if let Some(heartbeat) = heartbeat.take() {
                self.process_client_heartbeat(&client, heartbeat, &out_tx, &conn_token, &mut followed)
                    .await;
            }

            match reader.read_message().await {
                Ok(message) => match message.code() {
                    'C' => match ClientHeartbeat::from_bytes(message.payload()) {
                        Ok(parsed) => heartbeat = Some(parsed),
                        Err(err) => break Err(err.into()),
                    },
                    code => break Err(Error::Net(crate::net::Error::UnexpectedMessage(code))),
                },
                Err(err) if err.disconnect() => break Ok(()),
                Err(err) => break Err(err.into()),
            }
        };

        conn_token.cancel();
        for key in followed {
            self.clients.remove_client(&key);
        }
        debug!("client disconnected: {}", client);
        result
    }

    async fn process_client_heartbeat(
        self: &Arc<Self>,
        client: &str,
        heartbeat: ClientHeartbeat,
        out_tx: &mpsc::Sender<ClusterUpdate>,
        conn_token: &CancellationToken,
        followed: &mut Vec<ClientKey>,
    ) {
        let Some(follow) = heartbeat.cluster_follow else {
            return;
        };
        let key = ClientKey {
            keyspace: follow.keyspace.clone(),
            data_center: heartbeat.data_center.clone(),
            client: client.to_string(),
        };

        if follow.is_unfollow {
            self.clients.remove_client(&key);
            followed.retain(|k| k != &key);
            return;
        }

        let Some(mut rx) = self.clients.add_client(key.clone()) else {
            return;
        };
        followed.push(key.clone());
        info!("client {} follows {}/{}", client, key.keyspace, key.data_center);

        // current ring right away, updates as they come
        let current = self
            .keyspaces
            .cluster(&follow.keyspace)
            .unwrap_or_else(|| Cluster::new(&follow.keyspace, 0, 0));
        let _ = out_tx.send(ClusterUpdate { cluster: current }).await;

        let out_tx = out_tx.clone();
        let conn_token = conn_token.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = conn_token.cancelled() => return,
                    changed = rx.changed() => {
                        if changed.is_err() {
                            // unfollowed
                            return;
                        }
                        let update = rx.borrow_and_update().clone();
                        if let Some(cluster) = update {
                            if out_tx.send(ClusterUpdate { cluster }).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            }
        });
    }

    // ---- admin operations -----------------------------------------------

    /// Create a keyspace: pick stores, place shards, open them
    /// everywhere. On partial failure the created shards are deleted
    /// best-effort and the keyspace stays unregistered.
    pub async fn create_cluster(self: &Arc<Self>, req: &CreateClusterRequest) -> Result<Cluster, Error> {
        let entry = self.keyspaces.get_or_create(&req.keyspace);
        let _guard = entry.lock.lock().await;

        if let Some(cluster) = &entry.state.read().cluster {
            if cluster.expected_size() > 0 {
                return Err(Error::KeyspaceExists(req.keyspace.clone()));
            }
        }

        let data_center = self.option.data_center.clone();
        let servers = {
            let mut data_centers = self.data_centers.write();
            let dc = data_centers
                .get_mut(&data_center)
                .ok_or_else(|| Error::NoDataCenter(data_center.clone()))?;
            dc.allocate_servers(
                req.cluster_size as usize,
                req.total_disk_size_gb * req.replication_factor.max(1),
                |store| meet_requirement(&store.tags, &req.tags),
            )?
        };

        let cluster = place_cluster(
            &req.keyspace,
            req.cluster_size,
            req.replication_factor,
            &servers,
            false,
        );

        info!(
            "creating cluster {} size {} r {} on {:?}",
            req.keyspace,
            req.cluster_size,
            req.replication_factor,
            servers.iter().map(|s| &s.admin_address).collect::<Vec<_>>()
        );

        let creates = servers.iter().enumerate().map(|(server_id, store)| {
            let request = CreateShardRequest {
                keyspace: req.keyspace.clone(),
                server_id: server_id as u32,
                cluster_size: req.cluster_size,
                replication_factor: req.replication_factor,
                from_cluster_size: None,
                is_candidate: false,
                cluster: Some(cluster.clone()),
            };
            let addr = store.admin_address.clone();
            async move { (addr.clone(), create_shard_rpc(&addr, &request).await) }
        });

        let results = join_all(creates).await;
        let failed: Vec<(String, crate::net::Error)> = results
            .iter()
            .filter_map(|(addr, result)| {
                result
                    .as_ref()
                    .err()
                    .map(|err| (addr.clone(), crate::net::Error::Remote(err.to_string())))
            })
            .collect();

        if let Some((addr, err)) = failed.first() {
            // roll back what succeeded, best effort
            warn!("create cluster {}: rolling back", req.keyspace);
            let rollbacks = results
                .iter()
                .filter(|(_, result)| result.is_ok())
                .map(|(addr, _)| delete_shard_rpc(addr.clone(), req.keyspace.clone()));
            join_all(rollbacks).await;

            return Err(Error::CreateShard {
                addr: addr.clone(),
                error: err.to_string(),
            });
        }

        entry.state.write().cluster = Some(cluster.clone());
        self.clients
            .notify_cluster(&req.keyspace, &data_center, &cluster);
        Ok(cluster)
    }

    /// Resize a keyspace: open candidate shards with their bootstrap
    /// plans, await readiness, promote the new ring, then commit on the
    /// survivors and retire the rest.
    pub async fn resize_cluster(self: &Arc<Self>, req: &ResizeClusterRequest) -> Result<(), Error> {
        let entry = self
            .keyspaces
            .get(&req.keyspace)
            .ok_or_else(|| Error::KeyspaceNotFound(req.keyspace.clone()))?;
        let _guard = entry.lock.lock().await;

        let current = entry
            .state
            .read()
            .cluster
            .clone()
            .ok_or_else(|| Error::KeyspaceNotFound(req.keyspace.clone()))?;

        let from = current.expected_size();
        let to = req.target_cluster_size;
        let replication_factor = current.replication_factor();
        if from == to || to == 0 {
            return Ok(());
        }
        info!("resizing {} from {} to {}", req.keyspace, from, to);

        let mut stores: Vec<StoreResource> = Vec::with_capacity(to as usize);
        for server_id in 0..from.min(to) {
            let node = current
                .get_node(server_id, 0)
                .ok_or_else(|| Error::IncompleteCluster(req.keyspace.clone(), server_id))?;
            stores.push(node.store.clone());
        }

        if to > from {
            let taken: Vec<String> = stores.iter().map(|s| s.admin_address.clone()).collect();
            let data_center = self.option.data_center.clone();
            let mut data_centers = self.data_centers.write();
            let dc = data_centers
                .get_mut(&data_center)
                .ok_or_else(|| Error::NoDataCenter(data_center.clone()))?;
            let extra = dc.allocate_servers((to - from) as usize, 0, |store| {
                !taken.contains(&store.admin_address)
            })?;
            stores.extend(extra);
        }

        let next = place_cluster(&req.keyspace, to, replication_factor, &stores, true);
        entry.state.write().next_cluster = Some(next.clone());

        // waiters first, so a fast store cannot report before we listen
        let mut ready = vec![];
        for (server_id, store) in stores.iter().enumerate() {
            for shard in local_shards(server_id as u32, to, replication_factor) {
                ready.push((
                    store.admin_address.clone(),
                    self.register_ready_waiter(&req.keyspace, shard.server_id, shard.shard_id),
                ));
            }
        }

        let creates = stores.iter().enumerate().map(|(server_id, store)| {
            let request = CreateShardRequest {
                keyspace: req.keyspace.clone(),
                server_id: server_id as u32,
                cluster_size: to,
                replication_factor,
                from_cluster_size: Some(from),
                is_candidate: true,
                cluster: Some(next.clone()),
            };
            let addr = store.admin_address.clone();
            async move { (addr.clone(), create_shard_rpc(&addr, &request).await) }
        });

        for (addr, result) in join_all(creates).await {
            if let Err(err) = result {
                entry.state.write().next_cluster = None;
                return Err(Error::CreateShard {
                    addr,
                    error: err.to_string(),
                });
            }
        }

        for (addr, waiter) in ready {
            if timeout(READY_WAIT, waiter).await.is_err() {
                // the create RPC succeeded, so the shard is up; only
                // its heartbeat is lagging
                debug!("ready notification from {} lagging", addr);
            }
        }

        // promote
        let promoted = place_cluster(&req.keyspace, to, replication_factor, &stores, false);
        {
            let mut state = entry.state.write();
            state.cluster = Some(promoted.clone());
            state.next_cluster = None;
        }
        let data_center = self.option.data_center.clone();
        self.clients
            .notify_cluster(&req.keyspace, &data_center, &promoted);

        // commit on every member of the new ring
        for store in stores.iter() {
            if let Err(err) = resize_rpc(
                &store.admin_address,
                &ResizeClusterRequest {
                    keyspace: req.keyspace.clone(),
                    target_cluster_size: to,
                    cluster: Some(promoted.clone()),
                },
            )
            .await
            {
                warn!("resize commit on {}: {}", store.admin_address, err);
            }
        }

        // retire stores that dropped out of the ring
        if to < from {
            for server_id in to..from {
                if let Some(node) = current.get_node(server_id, 0) {
                    if let Err(err) =
                        delete_shard_rpc(node.store.admin_address.clone(), req.keyspace.clone())
                            .await
                    {
                        warn!(
                            "retire server {} on {}: {}",
                            server_id, node.store.admin_address, err
                        );
                    }
                }
            }
        }

        Ok(())
    }

    /// Remove a keyspace everywhere and tell clients the ring is gone.
    pub async fn delete_cluster(self: &Arc<Self>, keyspace: &str) -> Result<(), Error> {
        let entry = self
            .keyspaces
            .get(keyspace)
            .ok_or_else(|| Error::KeyspaceNotFound(keyspace.to_string()))?;
        let _guard = entry.lock.lock().await;

        let cluster = entry.state.read().cluster.clone();
        if let Some(cluster) = cluster {
            let mut addresses: Vec<String> = cluster
                .nodes()
                .map(|node| node.store.admin_address.clone())
                .collect();
            addresses.sort();
            addresses.dedup();
            for addr in addresses {
                if let Err(err) = delete_shard_rpc(addr.clone(), keyspace.to_string()).await {
                    warn!("delete shards on {}: {}", addr, err);
                }
            }
        }

        self.keyspaces.remove(keyspace);
        self.clients.notify_cluster(
            keyspace,
            &self.option.data_center,
            &Cluster::new(keyspace, 0, 0),
        );
        Ok(())
    }
}

/// Place shards on the chosen stores: server `i` hosts the shards the
/// ring assigns it.
fn place_cluster(
    keyspace: &str,
    cluster_size: u32,
    replication_factor: u32,
    stores: &[StoreResource],
    is_candidate: bool,
) -> Cluster {
    let mut cluster = Cluster::new(keyspace, cluster_size, replication_factor);
    for (server_id, store) in stores.iter().enumerate().take(cluster_size as usize) {
        for shard in local_shards(server_id as u32, cluster_size, replication_factor) {
            cluster.set_node(ClusterNode {
                store: store.clone(),
                shard_info: ShardInfo {
                    server_id: server_id as u32,
                    shard_id: shard.shard_id,
                    keyspace: keyspace.to_string(),
                    cluster_size,
                    replication_factor,
                    is_candidate,
                },
            });
        }
    }
    cluster
}

async fn create_shard_rpc(addr: &str, request: &CreateShardRequest) -> Result<(), crate::net::Error> {
    let mut stream = Stream::connect(addr).await?;
    stream.send_flush(request).await?;
    expect_ok(&stream.read_message().await?)
}

async fn delete_shard_rpc(addr: String, keyspace: String) -> Result<(), crate::net::Error> {
    let mut stream = Stream::connect(&addr).await?;
    stream.send_flush(&DeleteShardRequest { keyspace }).await?;
    expect_ok(&stream.read_message().await?)
}

async fn resize_rpc(addr: &str, request: &ResizeClusterRequest) -> Result<(), crate::net::Error> {
    let mut stream = Stream::connect(addr).await?;
    stream.send_flush(request).await?;
    expect_ok(&stream.read_message().await?)
}

/// Drains queued ring updates into the client stream; ends on
/// connection teardown.
async fn client_writer(
    mut writer: MessageWriter,
    mut out_rx: mpsc::Receiver<ClusterUpdate>,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            update = out_rx.recv() => {
                let Some(update) = update else { return };
                if let Err(err) = writer.send_flush(&update).await {
                    debug!("client writer: {}", err);
                    return;
                }
            }
        }
    }
}
