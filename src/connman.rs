//! Registry of connected Stratum v2 clients.
//!
//! The wire transport (Noise handshake, framing, encryption, socket I/O)
//! lives outside this crate. It registers a client here once the TCP
//! connection is up, flips the handshake flags as `SetupConnection` and
//! `CoinbaseOutputDataSize` arrive, drains the client's outbound queue, and
//! removes the client when the socket closes. The Template Provider only
//! ever addresses clients through this registry, re-looking them up by id
//! after every potentially blocking call.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use async_channel::Sender;
use nohash_hasher::BuildNoHashHasher;
use roles_logic_sv2::{parsers::TemplateDistribution, utils::Mutex};

use crate::error::TpResult;

/// A connected mining client.
#[derive(Debug)]
pub struct Sv2Client {
    /// Ephemeral identifier, unique for the process lifetime.
    id: u64,
    /// Whether the client confirmed the connection with a successful
    /// `SetupConnection`.
    pub setup_connection_confirmed: bool,
    /// Whether the client has sent its `CoinbaseOutputDataSize` message.
    pub coinbase_output_data_size_recv: bool,
    /// Additional coinbase output size the client asked us to reserve.
    pub coinbase_tx_outputs_size: u32,
    /// Whether the client is a candidate for disconnection. The transport
    /// closes the socket after draining the queued messages.
    pub disconnect_flag: bool,
    /// Queue of messages to be sent, drained by the transport.
    send_messages: Sender<TemplateDistribution<'static>>,
}

impl Sv2Client {
    pub fn new(id: u64, send_messages: Sender<TemplateDistribution<'static>>) -> Self {
        Self {
            id,
            setup_connection_confirmed: false,
            coinbase_output_data_size_recv: false,
            coinbase_tx_outputs_size: 0,
            disconnect_flag: false,
            send_messages,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_fully_connected(&self) -> bool {
        !self.disconnect_flag && self.setup_connection_confirmed
    }

    /// Queues a message for the transport to send. Returns false when the
    /// transport has already torn the connection down.
    pub fn send_message(&self, message: TemplateDistribution<'static>) -> bool {
        self.send_messages.try_send(message).is_ok()
    }
}

type Clients = HashMap<u64, Arc<Mutex<Sv2Client>>, BuildNoHashHasher<u64>>;

/// The set of live clients, shared between the transport and the Template
/// Provider.
#[derive(Debug)]
pub struct Sv2Connman {
    clients: Mutex<Clients>,
    next_client_id: AtomicU64,
}

impl Default for Sv2Connman {
    fn default() -> Self {
        Self::new()
    }
}

impl Sv2Connman {
    pub fn new() -> Self {
        Self {
            clients: Mutex::new(HashMap::with_hasher(BuildNoHashHasher::default())),
            next_client_id: AtomicU64::new(1),
        }
    }

    /// Adds a freshly accepted connection. Called by the transport.
    pub fn register_client(
        &self,
        send_messages: Sender<TemplateDistribution<'static>>,
    ) -> TpResult<Arc<Mutex<Sv2Client>>> {
        let id = self.next_client_id.fetch_add(1, Ordering::Relaxed);
        let client = Arc::new(Mutex::new(Sv2Client::new(id, send_messages)));
        self.clients.safe_lock(|clients| {
            clients.insert(id, client.clone());
        })?;
        Ok(client)
    }

    /// Drops a disconnected client. Called by the transport.
    pub fn remove_client(&self, id: u64) -> TpResult<()> {
        self.clients.safe_lock(|clients| {
            clients.remove(&id);
        })?;
        Ok(())
    }

    pub fn get_client_by_id(&self, id: u64) -> TpResult<Option<Arc<Mutex<Sv2Client>>>> {
        Ok(self.clients.safe_lock(|clients| clients.get(&id).cloned())?)
    }

    /// Performs a function on each fully connected client.
    pub fn for_each_client<F>(&self, mut func: F) -> TpResult<()>
    where
        F: FnMut(&mut Sv2Client),
    {
        self.clients.safe_lock(|clients| -> TpResult<()> {
            for client in clients.values() {
                client.safe_lock(|client| {
                    if client.is_fully_connected() {
                        func(client);
                    }
                })?;
            }
            Ok(())
        })?
    }

    /// Number of clients that are not marked for disconnection.
    pub fn connected_clients(&self) -> TpResult<usize> {
        self.clients.safe_lock(|clients| -> TpResult<usize> {
            let mut count = 0;
            for client in clients.values() {
                if !client.safe_lock(|client| client.disconnect_flag)? {
                    count += 1;
                }
            }
            Ok(count)
        })?
    }

    /// Number of clients that completed `SetupConnection`.
    pub fn fully_connected_clients(&self) -> TpResult<usize> {
        self.clients.safe_lock(|clients| -> TpResult<usize> {
            let mut count = 0;
            for client in clients.values() {
                if client.safe_lock(|client| client.is_fully_connected())? {
                    count += 1;
                }
            }
            Ok(count)
        })?
    }
}
