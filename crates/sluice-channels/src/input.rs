//! Input channel: the consumer end of a pipeline.
//!
//! Connects to any number of output channels and fills the inactive one of
//! two chunks with what they send. Once the inactive chunk holds enough
//! tokens it becomes the active chunk the owner reads from. Producers are
//! asked for more data only while there is room, which is the backpressure
//! the output side sees.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};

use sluice_core::config::{ConfigError, ConnectionInfo, InputConfig, OutputChannelRef};
use sluice_core::wire::{decode_tokens, ConsumerMessage, Frame, LocalChunkRef, PayloadHeader};
use sluice_core::{ChannelId, ChunkId, DataToken, MemoryLocation, MinData};
use sluice_pool::{ChunkLease, MemoryPool, PoolError};

use crate::delivery::Outbound;
use crate::error::ChannelError;
use crate::transport::{self, OutboundTx};

/// What the owner is told about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputEvent {
    /// A new active buffer is ready to be read.
    Data,
    /// Every connected producer finished its stream.
    EndOfStream,
}

pub struct InputChannel {
    shared: Arc<InputShared>,
    events: tokio::sync::Mutex<mpsc::UnboundedReceiver<InputEvent>>,
    shutdown: broadcast::Sender<()>,
}

struct InputShared {
    instance_id: String,
    config: InputConfig,
    pool: MemoryPool,
    channel: ChannelId,
    buffers: Mutex<Buffers>,
    links: DashMap<u64, ProducerLink>,
    next_conn: AtomicU64,
    events: mpsc::UnboundedSender<InputEvent>,
    end_of_stream: AtomicBool,
}

/// Double buffer. The two leases are distinct chunks of the same channel.
struct Buffers {
    chunks: [ChunkLease; 2],
    active: usize,
    /// Producers owed an update once the owner frees a buffer.
    withheld: HashSet<u64>,
    /// Aggregated end-of-stream seen since the last data.
    stream_ended: bool,
    /// End-of-stream arrived while both buffers were full; reported once
    /// the owner has moved on to the tail data.
    eos_deferred: bool,
}

impl Buffers {
    fn active(&self) -> ChunkId {
        self.chunks[self.active].chunk()
    }

    fn inactive(&self) -> ChunkId {
        self.chunks[1 - self.active].chunk()
    }

    fn swap(&mut self) {
        self.active = 1 - self.active;
    }
}

struct ProducerLink {
    info: ConnectionInfo,
    tx: OutboundTx,
    eos: bool,
    /// Local chunks read and not yet reported back to the producer.
    released: Vec<LocalChunkRef>,
    close: broadcast::Sender<()>,
}

/// Follow-up work decided under the buffer lock.
#[derive(Default)]
struct Outcome {
    events: Vec<InputEvent>,
    notify: Vec<u64>,
}

impl InputChannel {
    /// Claim a pool channel with its two buffers. No connection is made yet.
    pub fn new(instance_id: impl Into<String>, config: InputConfig, pool: MemoryPool) -> Result<Self, ChannelError> {
        let instance_id = instance_id.into();
        let channel = pool.register_channel()?;
        let chunks = match register_pair(&pool, channel) {
            Ok(chunks) => chunks,
            Err(e) => {
                let _ = pool.unregister_channel(channel);
                return Err(e.into());
            }
        };
        tracing::debug!(%instance_id, %channel, min_data = u32::from(config.min_data), "input channel created");

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = broadcast::channel(1);
        Ok(Self {
            shared: Arc::new(InputShared {
                instance_id,
                config,
                pool,
                channel,
                buffers: Mutex::new(Buffers {
                    chunks,
                    active: 0,
                    withheld: HashSet::new(),
                    stream_ended: false,
                    eos_deferred: false,
                }),
                links: DashMap::new(),
                next_conn: AtomicU64::new(1),
                events: events_tx,
                end_of_stream: AtomicBool::new(false),
            }),
            events: tokio::sync::Mutex::new(events_rx),
            shutdown,
        })
    }

    pub fn instance_id(&self) -> &str {
        &self.shared.instance_id
    }

    /// Connect to an output channel and say hello. The hello also tells the
    /// producer we are ready for the first chunk.
    pub async fn connect(&self, info: ConnectionInfo) -> Result<(), ChannelError> {
        let stream = TcpStream::connect(info.addr()).await?;
        let _ = stream.set_nodelay(true);
        let (reader, writer) = stream.into_split();

        let shared = &self.shared;
        let conn = shared.next_conn.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let (close, _) = broadcast::channel(1);
        transport::spawn_writer(writer, rx, close.subscribe(), info.addr());

        let hello = ConsumerMessage::Hello {
            instance_id: shared.instance_id.clone(),
            memory_location: info.memory_location,
            data_distribution: shared.config.data_distribution,
            on_slowness: shared.config.on_slowness,
            pool_id: (info.memory_location == MemoryLocation::Local).then(|| shared.pool.id()),
        };
        let _ = tx.send(Outbound::control(Frame::Consumer(hello)));

        tracing::info!(
            instance_id = %shared.instance_id,
            producer = %info.addr(),
            location = %info.memory_location,
            "connected to output channel"
        );
        let task = ProducerReader {
            conn,
            peer: info.addr(),
            reader,
            shared: shared.clone(),
            shutdown: self.shutdown.subscribe(),
            close: close.subscribe(),
        };
        shared.links.insert(
            conn,
            ProducerLink {
                info,
                tx,
                eos: false,
                released: Vec::new(),
                close,
            },
        );
        tokio::spawn(task.run());
        Ok(())
    }

    /// Drop the connection to the producer at `info`'s host and port.
    /// Returns false if there was none.
    pub fn disconnect(&self, info: &ConnectionInfo) -> bool {
        let found = self
            .shared
            .links
            .iter()
            .find(|l| l.info.hostname == info.hostname && l.info.port == info.port)
            .map(|l| *l.key());
        let Some(conn) = found else {
            return false;
        };
        if let Some((_, link)) = self.shared.links.remove(&conn) {
            let _ = link.close.send(());
            tracing::info!(producer = %link.info.addr(), "disconnected from output channel");
        }
        self.shared.dispatch(self.shared.evaluate_end_of_stream());
        true
    }

    pub fn connection_count(&self) -> usize {
        self.shared.links.len()
    }

    /// Configured `instanceId:channelName` producers.
    pub fn connected_output_channels(&self) -> Result<Vec<OutputChannelRef>, ConfigError> {
        self.shared.config.output_channel_refs()
    }

    /// Token `index` of the active buffer.
    pub fn read(&self, index: usize) -> Result<Arc<DataToken>, ChannelError> {
        let buffers = self.shared.lock_buffers();
        Ok(self.shared.pool.read(index, self.shared.channel, buffers.active())?)
    }

    /// Tokens in the active buffer.
    pub fn size(&self) -> Result<usize, ChannelError> {
        let buffers = self.shared.lock_buffers();
        Ok(self.shared.pool.size(self.shared.channel, buffers.active())?)
    }

    /// Whether the owner has enough data to work on.
    pub fn can_compute(&self) -> Result<bool, ChannelError> {
        let shared = &self.shared;
        let eos = self.is_end_of_stream();
        let size = self.size()?;
        let min_data = shared.config.min_data;
        if min_data == MinData::Any {
            return Ok(!(eos && shared.config.respond_to_end_of_stream));
        }
        if eos && size == 0 {
            return Ok(false);
        }
        if min_data == MinData::All && !eos {
            return Ok(false);
        }
        Ok(size >= min_data.swap_threshold().unwrap_or(0))
    }

    /// The owner is done with the active buffer. Releases it, promotes the
    /// inactive one if that holds enough data and asks withheld producers
    /// for more. Below the threshold the inactive buffer keeps filling.
    pub fn update(&self) -> Result<(), ChannelError> {
        let shared = &self.shared;
        if shared.config.keep_data_until_new {
            return Ok(());
        }
        let outcome = {
            let mut buffers = shared.lock_buffers();
            shared.pool.clear_chunk_data(shared.channel, buffers.active())?;
            let size = shared.pool.size(shared.channel, buffers.inactive())?;
            let tail = std::mem::take(&mut buffers.eos_deferred);
            let promote = match shared.threshold() {
                _ if tail => size > 0,
                Some(n) => size >= n.max(1),
                None => buffers.stream_ended && size > 0,
            };
            let mut outcome = Outcome {
                events: Vec::new(),
                notify: buffers.withheld.drain().collect(),
            };
            if promote {
                buffers.swap();
                outcome.events.push(InputEvent::Data);
            }
            if tail && shared.config.respond_to_end_of_stream {
                shared.end_of_stream.store(true, Ordering::Release);
                outcome.events.push(InputEvent::EndOfStream);
            }
            outcome
        };
        shared.dispatch(outcome);
        Ok(())
    }

    /// Next event for the owner. `None` once the channel is gone.
    pub async fn next_event(&self) -> Option<InputEvent> {
        self.events.lock().await.recv().await
    }

    /// Hand every token of each new active buffer to `handler`, releasing
    /// the buffer afterwards, until end-of-stream. Returns false if the
    /// channel closed first.
    pub async fn for_each_token<F>(&self, mut handler: F) -> Result<bool, ChannelError>
    where
        F: FnMut(Arc<DataToken>),
    {
        while let Some(event) = self.next_event().await {
            match event {
                InputEvent::Data => {
                    for index in 0..self.size()? {
                        handler(self.read(index)?);
                    }
                    self.update()?;
                }
                InputEvent::EndOfStream => return Ok(true),
            }
        }
        Ok(false)
    }

    /// True after an aggregated end-of-stream, until new data arrives.
    pub fn is_end_of_stream(&self) -> bool {
        self.shared.end_of_stream.load(Ordering::Acquire)
    }

    /// Close every producer connection.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
        for link in self.shared.links.iter() {
            let _ = link.close.send(());
        }
    }
}

impl Drop for InputChannel {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn register_pair(pool: &MemoryPool, channel: ChannelId) -> Result<[ChunkLease; 2], PoolError> {
    let first = ChunkLease::adopt(pool.clone(), channel, pool.register_chunk(channel)?);
    let second = ChunkLease::adopt(pool.clone(), channel, pool.register_chunk(channel)?);
    Ok([first, second])
}

impl InputShared {
    fn lock_buffers(&self) -> MutexGuard<'_, Buffers> {
        self.buffers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn threshold(&self) -> Option<usize> {
        self.config.min_data.swap_threshold()
    }

    // ── Receive path ──

    /// A producer on our pool sent a reference to one of its chunks. The
    /// tokens are shared into the inactive buffer; the producer keeps its
    /// hold until the next update reports the chunk as released.
    fn on_local_chunk(&self, conn: u64, chunk: LocalChunkRef) {
        if let Some(mut link) = self.links.get_mut(&conn) {
            link.released.push(chunk);
        }
        if chunk.pool_id != self.pool.id() {
            tracing::warn!(conn, pool_id = chunk.pool_id, "local chunk from another memory pool, requesting more data");
            self.notify(conn);
            return;
        }
        let received = self.receive(conn, |pool, ch, inactive| {
            let tokens = pool.read_chunk(chunk.channel_id, chunk.chunk_id)?;
            pool.write_chunk(&tokens, ch, inactive)
        });
        if let Err(e) = received {
            tracing::warn!(conn, error = %e, "failed to read local chunk, requesting more data");
            self.notify(conn);
        }
    }

    fn on_payload(&self, conn: u64, header: &PayloadHeader, payload: Bytes) {
        let tokens = match decode_tokens(header, payload) {
            Ok(tokens) => tokens,
            Err(e) => {
                tracing::warn!(conn, error = %e, "discarding corrupt payload, requesting more data");
                self.notify(conn);
                return;
            }
        };
        let (buffers, metas): (Vec<_>, Vec<_>) = tokens.into_iter().map(|t| (t.buffers, t.meta)).unzip();
        let received = self.receive(conn, |pool, ch, inactive| pool.write_parts(buffers, metas, ch, inactive));
        if let Err(e) = received {
            tracing::warn!(conn, error = %e, "failed to store payload, requesting more data");
            self.notify(conn);
        }
    }

    /// Append to the inactive buffer with `fill`, then decide whether to
    /// swap and whom to ask for more.
    fn receive<F>(&self, conn: u64, fill: F) -> Result<(), PoolError>
    where
        F: FnOnce(&MemoryPool, ChannelId, ChunkId) -> Result<(), PoolError>,
    {
        let outcome = {
            let mut buffers = self.lock_buffers();
            fill(&self.pool, self.channel, buffers.inactive())?;
            buffers.stream_ended = false;
            self.end_of_stream.store(false, Ordering::Release);

            let inactive = self.pool.size(self.channel, buffers.inactive())?;
            let active = self.pool.size(self.channel, buffers.active())?;
            let mut outcome = Outcome::default();
            match self.threshold() {
                None => outcome.notify.push(conn),
                Some(n) if inactive < n => outcome.notify.push(conn),
                Some(_) if active == 0 => {
                    buffers.swap();
                    outcome.events.push(InputEvent::Data);
                    outcome.notify.push(conn);
                }
                Some(_) if self.config.keep_data_until_new => {
                    self.pool.clear_chunk_data(self.channel, buffers.active())?;
                    buffers.swap();
                    outcome.events.push(InputEvent::Data);
                    outcome.notify.push(conn);
                }
                Some(_) => {
                    tracing::trace!(conn, "both buffers full, withholding update");
                    buffers.withheld.insert(conn);
                }
            }
            outcome
        };
        self.dispatch(outcome);
        Ok(())
    }

    fn on_end_of_stream(&self, conn: u64) {
        tracing::debug!(conn, "producer signalled end-of-stream");
        if let Some(mut link) = self.links.get_mut(&conn) {
            link.eos = true;
        }
        self.dispatch(self.evaluate_end_of_stream());
    }

    /// Fire end-of-stream once every live producer has sent one. Data still
    /// waiting in the inactive buffer is always reported before it.
    fn evaluate_end_of_stream(&self) -> Outcome {
        let mut buffers = self.lock_buffers();
        let mut outcome = Outcome::default();
        if self.links.is_empty() || !self.links.iter().all(|l| l.eos) {
            return outcome;
        }
        let inactive = self.pool.size(self.channel, buffers.inactive()).unwrap_or(0);
        let active = self.pool.size(self.channel, buffers.active()).unwrap_or(0);
        buffers.stream_ended = true;
        if inactive > 0 {
            if active == 0 || self.config.keep_data_until_new {
                if active > 0 {
                    let _ = self.pool.clear_chunk_data(self.channel, buffers.active());
                }
                buffers.swap();
                outcome.events.push(InputEvent::Data);
            } else {
                // The owner still holds the active buffer.
                buffers.eos_deferred = true;
            }
        }
        if self.config.respond_to_end_of_stream && !buffers.eos_deferred {
            self.end_of_stream.store(true, Ordering::Release);
            outcome.events.push(InputEvent::EndOfStream);
        }
        for mut link in self.links.iter_mut() {
            link.eos = false;
        }
        tracing::debug!(instance_id = %self.instance_id, "end-of-stream from all producers");
        outcome
    }

    fn dispatch(&self, outcome: Outcome) {
        for event in outcome.events {
            let _ = self.events.send(event);
        }
        for conn in outcome.notify {
            self.notify(conn);
        }
    }

    /// Tell a producer we can take more, after `delay_on_input_ms`. Local
    /// chunks read since the last update are released with it.
    fn notify(&self, conn: u64) {
        let Some((tx, released)) = self
            .links
            .get_mut(&conn)
            .map(|mut l| (l.tx.clone(), std::mem::take(&mut l.released)))
        else {
            return;
        };
        let frame = Frame::Consumer(ConsumerMessage::Update {
            instance_id: self.instance_id.clone(),
            released,
        });
        let delay = self.config.delay_on_input_ms;
        if delay == 0 {
            let _ = tx.send(Outbound::control(frame));
            return;
        }
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay)).await;
            let _ = tx.send(Outbound::control(frame));
        });
    }

    fn on_disconnect(&self, conn: u64) {
        if self.links.remove(&conn).is_some() {
            tracing::info!(conn, "output channel connection closed");
        }
        self.lock_buffers().withheld.remove(&conn);
        self.dispatch(self.evaluate_end_of_stream());
    }
}

impl Drop for InputShared {
    fn drop(&mut self) {
        if let Err(e) = self.pool.unregister_channel(self.channel) {
            tracing::warn!(channel = %self.channel, error = %e, "failed to unregister input channel");
        }
    }
}

/// Reads data and end-of-stream frames from one producer.
struct ProducerReader {
    conn: u64,
    peer: String,
    reader: tokio::net::tcp::OwnedReadHalf,
    shared: Arc<InputShared>,
    shutdown: broadcast::Receiver<()>,
    close: broadcast::Receiver<()>,
}

impl ProducerReader {
    async fn run(mut self) {
        let peer = self.peer.clone();
        loop {
            tokio::select! {
                _ = self.shutdown.recv() => break,
                _ = self.close.recv() => break,

                frame = transport::read_frame(&mut self.reader) => match frame {
                    Ok(Some(Frame::LocalChunk(chunk))) => self.shared.on_local_chunk(self.conn, chunk),
                    Ok(Some(Frame::Payload { header, payload })) => {
                        self.shared.on_payload(self.conn, &header, payload)
                    }
                    Ok(Some(Frame::EndOfStream)) => self.shared.on_end_of_stream(self.conn),
                    Ok(Some(other)) => {
                        let e = ChannelError::Protocol(other.kind());
                        tracing::warn!(%peer, error = %e, "closing producer connection");
                        break;
                    }
                    Ok(None) => {
                        tracing::debug!(%peer, "producer closed the connection");
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(%peer, error = %e, "producer connection failed");
                        break;
                    }
                }
            }
        }
        self.shared.on_disconnect(self.conn);
    }
}
