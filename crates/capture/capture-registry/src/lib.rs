//! `capture-registry`: named consumer lifecycle and the process-wide
//! station surface.
//!
//! The registry owns everything: factories, initialised consumers,
//! running threads, and the receiver. Consumers are referenced by name
//! through typed status codes; nothing here panics on a bad name or a
//! wrong-state call. A process-wide singleton exposes the same
//! operations as free functions for embedders that want the flat C-style
//! surface.

pub use capture_buffers::{
    CallbackMeta, DataCallback, DynamicCallback, SimpleCallback,
};
pub use capture_config::ConsumerConfig;
use capture_consumers::{Consumer, ConsumerError, ConsumerRunner, Persister, builtin_factories};
use capture_receiver::{ConsumerPort, Receiver, ReceiverConfig};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::OnceLock;
use stratum_ring::{RingConfig, channel};
use tracing::{error, info, warn};

/// Result of every registry operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Success,
    Failure,
    NotFound,
    NotAllowed,
    Rejected,
    Aborted,
}

type Factory = fn(&ConsumerConfig) -> Result<Box<dyn Consumer>, ConsumerError>;

enum EntryState {
    /// Built and configured, thread not yet running.
    Initialised(Box<dyn Consumer>),
    /// Thread running; the consumer lives inside the runner.
    Running {
        runner: ConsumerRunner,
        persister: Option<Persister>,
    },
    /// Momentary state while ownership moves between the two above.
    Swapping,
}

struct Entry {
    config: ConsumerConfig,
    state: EntryState,
}

/// The station: receiver plus named consumers.
#[derive(Default)]
pub struct Station {
    receiver: Option<Receiver>,
    receiver_config: Option<ReceiverConfig>,
    factories: HashMap<String, Factory>,
    consumers: HashMap<String, Entry>,
}

impl Station {
    pub fn new() -> Self {
        Self::default()
    }

    // ── receiver lifecycle ──────────────────────────────────────────

    pub fn start_receiver(
        &mut self,
        interface: &str,
        ip: &str,
        frame_size: usize,
        frames_per_block: usize,
        nof_blocks: usize,
    ) -> Status {
        if self.receiver.is_some() {
            warn!("receiver already running");
            return Status::NotAllowed;
        }
        let config = ReceiverConfig {
            interface: interface.to_string(),
            ip: ip.to_string(),
            ports: Vec::new(),
            frame_size,
            frames_per_block,
            nof_blocks,
        };
        match Receiver::start(config.clone(), Vec::new()) {
            Ok(receiver) => {
                self.receiver = Some(receiver);
                self.receiver_config = Some(config);
                Status::Success
            }
            Err(e) => {
                error!(error = %e, "failed to start receiver");
                Status::Failure
            }
        }
    }

    pub fn add_receiver_port(&mut self, port: u16) -> Status {
        let Some(receiver) = self.receiver.as_ref() else {
            return Status::NotAllowed;
        };
        match receiver.add_port(port) {
            Ok(()) => Status::Success,
            Err(e) => {
                error!(error = %e, port, "failed to add receiver port");
                Status::Failure
            }
        }
    }

    pub fn stop_receiver(&mut self) -> Status {
        // Running consumers keep their rings; they simply stop seeing
        // packets once the sockets close.
        match self.receiver.take() {
            Some(receiver) => {
                receiver.stop();
                Status::Success
            }
            None => Status::NotAllowed,
        }
    }

    /// Interface diagnostics, when the receiver runs.
    pub fn receiver_stats(&self) -> Option<stratum_stats::Snapshot> {
        self.receiver.as_ref().map(|r| r.stats())
    }

    pub fn receiver_rates(&self) -> Option<stratum_stats::Rates> {
        self.receiver.as_ref().map(|r| r.rates())
    }

    // ── consumer lifecycle ──────────────────────────────────────────

    /// Registers a consumer kind by name against the builtin factory
    /// table.
    pub fn load_consumer(&mut self, name: &str) -> Status {
        match builtin_factories().iter().find(|(n, _)| *n == name) {
            Some(&(n, factory)) => {
                self.factories.insert(n.to_string(), factory);
                Status::Success
            }
            None => {
                warn!(consumer = name, "unknown consumer kind");
                Status::NotFound
            }
        }
    }

    /// Parses the JSON configuration and builds the consumer.
    pub fn initialise_consumer(&mut self, name: &str, json: &str) -> Status {
        let Some(&factory) = self.factories.get(name) else {
            return Status::NotFound;
        };
        if self.consumers.contains_key(name) {
            warn!(consumer = name, "consumer already initialised");
            return Status::NotAllowed;
        }
        let config = match ConsumerConfig::from_json(json) {
            Ok(c) => c,
            Err(e) => {
                error!(consumer = name, error = %e, "consumer configuration rejected");
                return Status::Rejected;
            }
        };
        match factory(&config) {
            Ok(consumer) => {
                self.consumers.insert(
                    name.to_string(),
                    Entry {
                        config,
                        state: EntryState::Initialised(consumer),
                    },
                );
                info!(consumer = name, "consumer initialised");
                Status::Success
            }
            Err(e) => {
                error!(consumer = name, error = %e, "consumer initialisation failed");
                Status::Failure
            }
        }
    }

    /// Installs a callback on an initialised (not yet started) consumer.
    pub fn set_consumer_callback(&mut self, name: &str, callback: DataCallback) -> Status {
        match self.consumers.get_mut(name) {
            Some(Entry {
                state: EntryState::Initialised(consumer),
                ..
            }) => {
                consumer.set_callback(callback);
                Status::Success
            }
            Some(_) => Status::NotAllowed,
            None => Status::NotFound,
        }
    }

    /// Starts the consumer thread (and persister, for double-buffer
    /// modes) and attaches its ring to the receiver.
    pub fn start_consumer(&mut self, name: &str) -> Status {
        let Some(receiver_config) = self.receiver_config.clone() else {
            warn!(consumer = name, "cannot start a consumer without a receiver");
            return Status::NotAllowed;
        };
        let Some(receiver) = self.receiver.as_ref() else {
            return Status::NotAllowed;
        };
        let Some(entry) = self.consumers.get_mut(name) else {
            return Status::NotFound;
        };
        let EntryState::Initialised(_) = entry.state else {
            return Status::NotAllowed;
        };
        // Take the consumer out to move it into its thread.
        let EntryState::Initialised(mut consumer) =
            std::mem::replace(&mut entry.state, EntryState::Swapping)
        else {
            unreachable!();
        };

        let persister = consumer.start_persister();
        let filter = consumer.filter();
        let (producer, ring_consumer) = channel(RingConfig::new(
            receiver_config.ring_capacity(),
            entry.config.max_packet_size,
        ));
        receiver.attach(ConsumerPort {
            name: name.to_string(),
            filter,
            ring: producer,
        });
        let runner = ConsumerRunner::spawn(name, consumer, ring_consumer);
        entry.state = EntryState::Running { runner, persister };
        info!(consumer = name, "consumer started");
        Status::Success
    }

    /// Stops the consumer thread, detaches it from the receiver, and
    /// returns it to the initialised state for reuse.
    pub fn stop_consumer(&mut self, name: &str) -> Status {
        let Some(entry) = self.consumers.get_mut(name) else {
            return Status::NotFound;
        };
        let EntryState::Running { .. } = entry.state else {
            return Status::NotAllowed;
        };
        if let Some(receiver) = self.receiver.as_ref() {
            receiver.detach(name);
        }
        let EntryState::Running { runner, persister } =
            std::mem::replace(&mut entry.state, EntryState::Swapping)
        else {
            unreachable!();
        };
        let consumer = runner.stop();
        if let Some(persister) = persister {
            persister.stop();
        }
        match consumer {
            Some(consumer) => {
                entry.state = EntryState::Initialised(consumer);
                info!(consumer = name, "consumer stopped");
                Status::Success
            }
            None => {
                self.consumers.remove(name);
                Status::Aborted
            }
        }
    }

    /// Stops (if running) and removes the consumer entirely.
    pub fn teardown_consumer(&mut self, name: &str) -> Status {
        if !self.consumers.contains_key(name) {
            return Status::NotFound;
        }
        if matches!(
            self.consumers.get(name).map(|e| &e.state),
            Some(EntryState::Running { .. })
        ) {
            let status = self.stop_consumer(name);
            if status == Status::Aborted {
                return Status::Aborted;
            }
        }
        self.consumers.remove(name);
        info!(consumer = name, "consumer torn down");
        Status::Success
    }

    /// Stops everything: consumers first, then the receiver.
    pub fn shutdown(&mut self) {
        let names: Vec<String> = self.consumers.keys().cloned().collect();
        for name in names {
            self.teardown_consumer(&name);
        }
        if self.receiver.is_some() {
            self.stop_receiver();
        }
    }
}

// ── process-wide surface ────────────────────────────────────────────

static STATION: OnceLock<Mutex<Station>> = OnceLock::new();

fn station() -> &'static Mutex<Station> {
    STATION.get_or_init(|| Mutex::new(Station::new()))
}

pub fn start_receiver(
    interface: &str,
    ip: &str,
    frame_size: usize,
    frames_per_block: usize,
    nof_blocks: usize,
) -> Status {
    station()
        .lock()
        .start_receiver(interface, ip, frame_size, frames_per_block, nof_blocks)
}

pub fn add_receiver_port(port: u16) -> Status {
    station().lock().add_receiver_port(port)
}

pub fn stop_receiver() -> Status {
    station().lock().stop_receiver()
}

pub fn load_consumer(name: &str) -> Status {
    station().lock().load_consumer(name)
}

pub fn initialise_consumer(name: &str, json: &str) -> Status {
    station().lock().initialise_consumer(name, json)
}

/// Installs a simple-signature callback and starts the consumer.
pub fn start_consumer(name: &str, callback: SimpleCallback) -> Status {
    let mut station = station().lock();
    match station.set_consumer_callback(name, DataCallback::Simple(callback)) {
        Status::Success => station.start_consumer(name),
        other => other,
    }
}

/// Installs a dynamic-signature callback and starts the consumer.
pub fn start_consumer_dynamic(name: &str, callback: DynamicCallback) -> Status {
    let mut station = station().lock();
    match station.set_consumer_callback(name, DataCallback::Dynamic(callback)) {
        Status::Success => station.start_consumer(name),
        other => other,
    }
}

pub fn stop_consumer(name: &str) -> Status {
    station().lock().stop_consumer(name)
}
