//! Output channel: the producer end of a pipeline.
//!
//! The owner writes tokens into the current chunk and calls `update()` to
//! hand the chunk to the connected consumers. The channel listens on TCP;
//! each consumer says hello, then asks for more with update messages.
//! Delivery never blocks on the socket: frames go to one writer task per
//! connection.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use rand::Rng;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, watch};

use sluice_core::config::{ConnectionInfo, OutputConfig};
use sluice_core::wire::{ConsumerMessage, Frame, LocalChunkRef};
use sluice_core::{ChannelId, DataToken, MemoryLocation};
use sluice_pool::{ChunkLease, CopyPolicy, MemoryPool};

use crate::consumer::{ConnId, ConsumerSnapshot, Hello, Registry, SharedStep};
use crate::delivery::WriterTracker;
use crate::error::ChannelError;
use crate::transport::{self, OutboundTx};

/// How often `signal_end_of_stream` checks whether consumer queues drained.
const DRAIN_POLL: Duration = Duration::from_millis(100);

pub struct OutputChannel {
    shared: Arc<OutputShared>,
    port: u16,
    shutdown: broadcast::Sender<()>,
}

struct OutputShared {
    instance_id: String,
    config: OutputConfig,
    pool: MemoryPool,
    channel: ChannelId,
    /// The producer's hold on the chunk being filled.
    current: Mutex<ChunkLease>,
    registry: tokio::sync::Mutex<Registry>,
    writers: WriterTracker,
    ready: watch::Sender<u64>,
    end_of_stream: AtomicBool,
    next_conn: AtomicU64,
}

impl OutputChannel {
    /// Claim a pool channel, start listening and accept consumers in the
    /// background.
    pub async fn bind(
        instance_id: impl Into<String>,
        config: OutputConfig,
        pool: MemoryPool,
    ) -> Result<Self, ChannelError> {
        let instance_id = instance_id.into();
        let listener = bind_listener(&config).await?;
        let port = listener.local_addr()?.port();

        let channel = pool.register_channel()?;
        let chunk = match pool.register_chunk(channel) {
            Ok(chunk) => chunk,
            Err(e) => {
                let _ = pool.unregister_channel(channel);
                return Err(e.into());
            }
        };
        tracing::info!(%instance_id, port, %channel, "output channel listening");

        let (ready, _) = watch::channel(0);
        let shared = Arc::new(OutputShared {
            instance_id,
            current: Mutex::new(ChunkLease::adopt(pool.clone(), channel, chunk)),
            config,
            pool,
            channel,
            registry: tokio::sync::Mutex::new(Registry::new()),
            writers: WriterTracker::new(),
            ready,
            end_of_stream: AtomicBool::new(false),
            next_conn: AtomicU64::new(1),
        });

        let (shutdown, _) = broadcast::channel(1);
        let acceptor = Acceptor {
            listener,
            shared: shared.clone(),
            shutdown: shutdown.clone(),
        };
        tokio::spawn(acceptor.run());

        Ok(Self {
            shared,
            port,
            shutdown,
        })
    }

    pub fn instance_id(&self) -> &str {
        &self.shared.instance_id
    }

    /// The pool channel this output writes into.
    pub fn channel_id(&self) -> ChannelId {
        self.shared.channel
    }

    /// Where consumers reach this channel.
    pub fn information(&self) -> ConnectionInfo {
        ConnectionInfo::tcp(
            self.shared.config.hostname.clone(),
            self.port,
            MemoryLocation::Remote,
        )
    }

    /// Append a token to the current chunk, keeping borrowed segments.
    pub fn write(&self, token: DataToken) -> Result<(), ChannelError> {
        self.write_with_policy(token, CopyPolicy::Borrow)
    }

    pub fn write_with_policy(&self, token: DataToken, policy: CopyPolicy) -> Result<(), ChannelError> {
        let current = self.shared.lock_current();
        self.shared
            .pool
            .write(token, self.shared.channel, current.chunk(), policy)?;
        self.shared.end_of_stream.store(false, Ordering::Release);
        Ok(())
    }

    /// Distribute the current chunk and start a fresh one. A no-op while the
    /// current chunk is empty.
    ///
    /// Both the shared and the copy round run even if the first fails; the
    /// first error is returned.
    pub async fn update(&self) -> Result<(), ChannelError> {
        let shared = &self.shared;
        let pool = &shared.pool;
        let ch = shared.channel;

        let chunk = {
            let mut current = shared.lock_current();
            if pool.size(ch, current.chunk())? == 0 {
                return Ok(());
            }
            let fresh = pool.register_chunk(ch)?;
            std::mem::replace(&mut *current, ChunkLease::adopt(pool.clone(), ch, fresh))
        };

        if shared.registry.lock().await.has_local() {
            let copied = pool.assure_all_data_is_copied(ch, chunk.chunk())?;
            if copied > 0 {
                tracing::trace!(chunk = %chunk.chunk(), copied, "copied borrowed tokens for local consumers");
            }
        }

        let distributed = self.distribute(&chunk).await;
        let copied = self.copy(&chunk).await;
        drop(chunk);
        distributed.and(copied)
    }

    /// Hand the chunk to one shared consumer, or park, drop or reject it
    /// according to the distribution mode and `no_input_shared`.
    async fn distribute(&self, chunk: &ChunkLease) -> Result<(), ChannelError> {
        let shared = &self.shared;
        let mode = shared.config.distribution_mode;
        let policy = shared.config.no_input_shared;
        let mut shutdown = self.shutdown.subscribe();

        loop {
            let step = {
                let mut registry = shared.registry.lock().await;
                let step = registry.plan_shared(mode, policy);
                if matches!(step, SharedStep::Deliver(_) | SharedStep::Enqueue(_) | SharedStep::Backlog) {
                    registry.apply_shared(step, chunk.try_clone()?, &shared.writers)?;
                }
                step
            };
            match step {
                SharedStep::Wait => {
                    if !self.pause(shared.poll_interval(), &mut shutdown).await {
                        return Ok(());
                    }
                }
                SharedStep::Throw => return Err(ChannelError::NoSharedInput),
                SharedStep::Drop => {
                    tracing::trace!(chunk = %chunk.chunk(), "no shared input ready, dropping data");
                    return Ok(());
                }
                SharedStep::Deliver(_) | SharedStep::Enqueue(_) | SharedStep::Backlog => return Ok(()),
            }
        }
    }

    /// Hand the chunk to every copy consumer.
    async fn copy(&self, chunk: &ChunkLease) -> Result<(), ChannelError> {
        let shared = &self.shared;
        let ids = {
            let registry = shared.registry.lock().await;
            if let Some(id) = registry.unready_throw_copy() {
                return Err(ChannelError::CopyInputNotReady(id.to_string()));
            }
            registry.copy_ids()
        };

        let mut shutdown = self.shutdown.subscribe();
        for id in ids {
            let mut lease = chunk.try_clone()?;
            loop {
                let back = shared
                    .registry
                    .lock()
                    .await
                    .offer_copy(&id, lease, &shared.writers)?;
                match back {
                    None => break,
                    Some(l) => {
                        lease = l;
                        if !self.pause(shared.poll_interval(), &mut shutdown).await {
                            return Ok(());
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Sleep unless shut down first. Returns false on shutdown.
    async fn pause(&self, period: Duration, shutdown: &mut broadcast::Receiver<()>) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(period) => true,
            _ = shutdown.recv() => false,
        }
    }

    /// Flush pending data, wait until no consumer has queued chunks, then
    /// send end-of-stream to every consumer.
    pub async fn signal_end_of_stream(&self) -> Result<(), ChannelError> {
        self.update().await?;
        self.shared.end_of_stream.store(true, Ordering::Release);

        let mut shutdown = self.shutdown.subscribe();
        loop {
            let queued = self.shared.registry.lock().await.queued_total();
            if queued == 0 {
                break;
            }
            tracing::debug!(queued, "waiting for consumer queues to drain before end-of-stream");
            if !self.pause(DRAIN_POLL, &mut shutdown).await {
                return Ok(());
            }
        }

        let registry = self.shared.registry.lock().await;
        for consumer in registry.all() {
            tracing::debug!(instance_id = %consumer.instance_id, "sending end-of-stream");
            consumer.send_control(Frame::EndOfStream);
        }
        Ok(())
    }

    /// True after `signal_end_of_stream` until the next write.
    pub fn is_end_of_stream(&self) -> bool {
        self.shared.end_of_stream.load(Ordering::Acquire)
    }

    pub async fn consumers(&self) -> ConsumerSnapshot {
        self.shared.registry.lock().await.snapshot()
    }

    /// Ticks each time a consumer becomes ready for data.
    pub fn subscribe_ready(&self) -> watch::Receiver<u64> {
        self.shared.ready.subscribe()
    }

    /// Stop accepting and close every consumer connection.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }
}

impl Drop for OutputChannel {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl OutputShared {
    fn lock_current(&self) -> std::sync::MutexGuard<'_, ChunkLease> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.config.wait_poll_interval_ms.max(1))
    }

    async fn on_hello(&self, conn: ConnId, msg: ConsumerMessage, tx: OutboundTx) {
        let ConsumerMessage::Hello {
            instance_id,
            memory_location,
            data_distribution,
            on_slowness,
            pool_id,
        } = msg
        else {
            return;
        };
        // Pool handles only mean something inside the pool they came from.
        let memory_location = match (memory_location, pool_id) {
            (MemoryLocation::Local, Some(id)) if id == self.pool.id() => MemoryLocation::Local,
            (MemoryLocation::Local, _) => {
                tracing::warn!(%instance_id, "consumer is not on this memory pool, falling back to remote delivery");
                MemoryLocation::Remote
            }
            (location, _) => location,
        };
        let mut registry = self.registry.lock().await;
        match registry.hello(
            conn,
            instance_id.clone(),
            memory_location,
            data_distribution,
            on_slowness,
            tx,
        ) {
            Hello::New(role) => tracing::info!(
                %instance_id,
                role = %role,
                location = %memory_location,
                on_slowness = %on_slowness,
                "registered consumer"
            ),
            Hello::Replaced(role) => {
                tracing::info!(%instance_id, role = %role, "consumer reconnected, transport replaced")
            }
        }
        // Hello doubles as the first readiness notice.
        self.mark_available(&mut registry, &instance_id);
    }

    async fn on_available(&self, instance_id: &str, released: &[LocalChunkRef]) {
        let mut registry = self.registry.lock().await;
        let freed = registry.release(instance_id, released);
        if freed > 0 {
            tracing::trace!(%instance_id, freed, "local chunks released");
        }
        self.mark_available(&mut registry, instance_id);
    }

    fn mark_available(&self, registry: &mut Registry, instance_id: &str) {
        if registry.available(instance_id, &self.writers) {
            self.ready.send_modify(|n| *n = n.wrapping_add(1));
        }
    }

    async fn on_disconnect(&self, conn: ConnId) {
        let removed = self.registry.lock().await.remove_conn(conn);
        if let Some(consumer) = removed {
            tracing::info!(
                instance_id = %consumer.instance_id,
                queued = consumer.queued(),
                in_flight = consumer.in_flight(),
                "consumer disconnected, releasing its chunks"
            );
        }
    }
}

impl Drop for OutputShared {
    fn drop(&mut self) {
        if let Err(e) = self.pool.unregister_channel(self.channel) {
            tracing::warn!(channel = %self.channel, error = %e, "failed to unregister output channel");
        }
    }
}

async fn bind_listener(config: &OutputConfig) -> Result<TcpListener, ChannelError> {
    let Some((lo, hi)) = config.port_range else {
        return TcpListener::bind(("0.0.0.0", config.port))
            .await
            .map_err(|source| ChannelError::Network { attempts: 1, source });
    };
    let (lo, hi) = (lo.min(hi), lo.max(hi));
    let attempts = config.bind_attempts.max(1);
    let mut last = None;
    for _ in 0..attempts {
        let port = rand::thread_rng().gen_range(lo..=hi);
        match TcpListener::bind(("0.0.0.0", port)).await {
            Ok(listener) => return Ok(listener),
            Err(e) => {
                tracing::debug!(port, error = %e, "port taken, retrying");
                last = Some(e);
            }
        }
    }
    Err(ChannelError::Network {
        attempts,
        source: last.unwrap_or_else(|| std::io::Error::from(std::io::ErrorKind::AddrInUse)),
    })
}

// ── Connection tasks ──────────────────────────────────────────────────────────

struct Acceptor {
    listener: TcpListener,
    shared: Arc<OutputShared>,
    shutdown: broadcast::Sender<()>,
}

impl Acceptor {
    async fn run(self) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::debug!(instance_id = %self.shared.instance_id, "output channel shutting down");
                    return;
                }

                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => self.serve(stream, peer),
                    Err(e) => tracing::warn!(error = %e, "accept failed"),
                }
            }
        }
    }

    fn serve(&self, stream: TcpStream, peer: SocketAddr) {
        let _ = stream.set_nodelay(true);
        let conn = self.shared.next_conn.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(%peer, conn, "consumer connected");

        let (reader, writer) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();
        transport::spawn_writer(writer, rx, self.shutdown.subscribe(), peer.to_string());

        let task = ConsumerReader {
            conn,
            peer,
            reader,
            tx,
            shared: self.shared.clone(),
            shutdown: self.shutdown.subscribe(),
        };
        tokio::spawn(task.run());
    }
}

/// Reads hello and update messages from one consumer.
struct ConsumerReader {
    conn: ConnId,
    peer: SocketAddr,
    reader: tokio::net::tcp::OwnedReadHalf,
    tx: OutboundTx,
    shared: Arc<OutputShared>,
    shutdown: broadcast::Receiver<()>,
}

impl ConsumerReader {
    async fn run(mut self) {
        let peer = self.peer;
        loop {
            tokio::select! {
                _ = self.shutdown.recv() => break,

                frame = transport::read_frame(&mut self.reader) => match frame {
                    Ok(Some(Frame::Consumer(msg @ ConsumerMessage::Hello { .. }))) => {
                        self.shared.on_hello(self.conn, msg, self.tx.clone()).await;
                    }
                    Ok(Some(Frame::Consumer(ConsumerMessage::Update { instance_id, released }))) => {
                        self.shared.on_available(&instance_id, &released).await;
                    }
                    Ok(Some(other)) => {
                        let e = ChannelError::Protocol(other.kind());
                        tracing::warn!(%peer, error = %e, "closing consumer connection");
                        break;
                    }
                    Ok(None) => {
                        tracing::debug!(%peer, "consumer closed the connection");
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(%peer, error = %e, "consumer connection failed");
                        break;
                    }
                }
            }
        }
        self.shared.on_disconnect(self.conn).await;
    }
}
