use crate::persister::Persister;
use capture_buffers::{DataCallback, StreamMeta};
use capture_receiver::PacketFilter;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use stratum_ring::RingConsumer;
use stratum_spead::{HeapCounter, PacketSummary};
use tracing::{debug, error, info};

/// How long the consumer loop blocks on its ring before treating the
/// stream as idle and flushing.
pub const PULL_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, thiserror::Error)]
pub enum ConsumerError {
    #[error(transparent)]
    Config(#[from] capture_config::ConfigError),

    #[error(transparent)]
    Mem(#[from] stratum_mem::MemError),
}

/// The capability set every reassembly mode implements. Construction is
/// the mode's `init`; the registry drives the rest.
pub trait Consumer: Send {
    /// Flows this consumer accepts; evaluated on the receiver thread.
    fn filter(&self) -> PacketFilter;

    /// Installs the data callback. Valid between init and start.
    fn set_callback(&mut self, callback: DataCallback);

    /// Handles one packet pulled off the ring. Malformed input is dropped
    /// silently.
    fn process_packet(&mut self, packet: &[u8]);

    /// Ring timeout: flush partially filled buffers.
    fn on_stream_end(&mut self);

    /// Double-buffer modes spawn their persister thread here when the
    /// consumer starts; container modes have none.
    fn start_persister(&mut self) -> Option<Persister> {
        None
    }

    /// Final teardown before the consumer thread exits.
    fn cleanup(&mut self) {}
}

/// The standard header fields every mode extracts. `None` means a
/// required item was missing and the packet is dropped.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Standard {
    pub counter: HeapCounter,
    pub payload_length: usize,
    pub payload_offset: usize,
    pub sync_time: u64,
    /// sync_time + timestamp × tick.
    pub time: f64,
}

pub(crate) fn standard(s: &PacketSummary, tick_seconds: f64) -> Option<Standard> {
    Some(Standard {
        counter: HeapCounter(s.heap_counter?),
        payload_length: s.payload_length? as usize,
        payload_offset: s.payload_offset.unwrap_or(0) as usize,
        sync_time: s.sync_time?,
        time: s.packet_time(tick_seconds)?,
    })
}

/// Rolling stream-level bookkeeping for callback metadata.
#[derive(Debug, Default)]
pub(crate) struct StreamTracker {
    station_id: u16,
    payload_length: u32,
    sync_time: u64,
    first_counter: Option<u64>,
    last_counter: u64,
    nof_packets: u64,
}

impl StreamTracker {
    pub fn observe(&mut self, station_id: u16, std: &Standard, counter: u64) {
        self.station_id = station_id;
        self.payload_length = std.payload_length as u32;
        self.sync_time = std.sync_time;
        if self.first_counter.is_none() {
            self.first_counter = Some(counter);
        }
        self.last_counter = counter;
        self.nof_packets += 1;
    }

    pub fn snapshot(&self) -> StreamMeta {
        StreamMeta {
            station_id: self.station_id,
            payload_length: self.payload_length,
            sync_time: self.sync_time,
            nof_packets: self.nof_packets,
            first_packet_counter: self.first_counter.unwrap_or(0),
            last_packet_counter: self.last_counter,
        }
    }

    /// Epoch turnover: counters restart, stream identity stays.
    pub fn reset_epoch(&mut self) {
        self.first_counter = None;
        self.nof_packets = 0;
    }
}

/// Owns a consumer's thread: pulls packets off the ring, times out into
/// `on_stream_end`, and exits when the stop flag is raised.
pub struct ConsumerRunner {
    name: String,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<Box<dyn Consumer>>>,
}

impl ConsumerRunner {
    pub fn spawn(name: &str, mut consumer: Box<dyn Consumer>, mut ring: RingConsumer) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();
        let thread_name = name.to_string();
        let handle = std::thread::Builder::new()
            .name(format!("consumer-{name}"))
            .spawn(move || {
                info!(consumer = thread_name, "consumer thread started");
                while !thread_stop.load(Ordering::Acquire) {
                    match ring.pull_timeout(PULL_TIMEOUT) {
                        Some(packet) => consumer.process_packet(&packet),
                        None => consumer.on_stream_end(),
                    }
                }
                // Deliver whatever the stop interrupted, then tear down.
                consumer.on_stream_end();
                consumer.cleanup();
                debug!(consumer = thread_name, "consumer thread exited");
                consumer
            })
            .expect("failed to spawn consumer thread");
        Self {
            name: name.to_string(),
            stop,
            handle: Some(handle),
        }
    }

    /// Raises the stop flag and joins. Returns the consumer for reuse,
    /// or `None` if its thread panicked.
    pub fn stop(mut self) -> Option<Box<dyn Consumer>> {
        self.stop.store(true, Ordering::Release);
        match self.handle.take()?.join() {
            Ok(consumer) => Some(consumer),
            Err(_) => {
                error!(consumer = self.name, "consumer thread panicked");
                None
            }
        }
    }
}
