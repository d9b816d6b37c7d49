use serde::{Deserialize, Serialize};
use sled::Db;

use crate::broker::message::Message;
use crate::topology::{BindingSpec, ExchangeSpec, QueueSpec};
use crate::utils::PersistenceError;

const TOPOLOGY_TREE: &str = "topology";

/// Durable definitions reloaded when the broker restarts.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StoredTopology {
    pub exchanges: Vec<ExchangeSpec>,
    pub queues: Vec<QueueSpec>,
    pub bindings: Vec<BindingSpec>,
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "lowercase")]
enum TopologyRecord {
    Exchange(ExchangeSpec),
    Queue(QueueSpec),
    Binding(BindingSpec),
}

/// The broker's "disk": durable exchanges, queues, bindings, and the
/// persistent messages sitting on durable queues.
///
/// Messages live in one tree per queue, keyed by the big-endian queue
/// sequence number so iteration yields queue order.
#[derive(Clone)]
pub struct Persistence {
    db: Db,
}

impl Persistence {
    pub fn open(path: &str) -> Result<Self, PersistenceError> {
        let db = sled::open(path)?;
        Ok(Self { db })
    }

    /// A store that lives as long as the process; used when durability only
    /// has to survive `MemoryBroker::restart`.
    pub fn temporary() -> Result<Self, PersistenceError> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db })
    }

    pub fn save_exchange(&self, spec: &ExchangeSpec) -> Result<(), PersistenceError> {
        self.save_record(
            format!("exchange/{}", spec.name),
            &TopologyRecord::Exchange(spec.clone()),
        )
    }

    pub fn save_queue(&self, spec: &QueueSpec) -> Result<(), PersistenceError> {
        self.save_record(
            format!("queue/{}", spec.name),
            &TopologyRecord::Queue(spec.clone()),
        )
    }

    pub fn save_binding(&self, spec: &BindingSpec) -> Result<(), PersistenceError> {
        self.save_record(
            format!("binding/{}/{}/{}", spec.exchange, spec.queue, spec.pattern),
            &TopologyRecord::Binding(spec.clone()),
        )
    }

    pub fn load_topology(&self) -> Result<StoredTopology, PersistenceError> {
        let tree = self.db.open_tree(TOPOLOGY_TREE)?;
        let mut topology = StoredTopology::default();
        for entry in tree.iter() {
            let (_, value) = entry?;
            match serde_json::from_slice(&value)? {
                TopologyRecord::Exchange(spec) => topology.exchanges.push(spec),
                TopologyRecord::Queue(spec) => topology.queues.push(spec),
                TopologyRecord::Binding(spec) => topology.bindings.push(spec),
            }
        }
        Ok(topology)
    }

    pub fn store_message(
        &self,
        queue: &str,
        seq: u64,
        message: &Message,
    ) -> Result<(), PersistenceError> {
        let serialized = serde_json::to_vec(message)?;
        let tree = self.db.open_tree(message_tree(queue))?;
        tree.insert(seq.to_be_bytes(), serialized)?;
        Ok(())
    }

    pub fn remove_message(&self, queue: &str, seq: u64) -> Result<(), PersistenceError> {
        let tree = self.db.open_tree(message_tree(queue))?;
        tree.remove(seq.to_be_bytes())?;
        Ok(())
    }

    /// Messages of one queue in queue order, with their sequence numbers.
    pub fn load_messages(&self, queue: &str) -> Result<Vec<(u64, Message)>, PersistenceError> {
        let tree = self.db.open_tree(message_tree(queue))?;
        let mut messages = Vec::new();
        for entry in tree.iter() {
            let (key, value) = entry?;
            let Ok(bytes) = <[u8; 8]>::try_from(key.as_ref()) else {
                continue;
            };
            messages.push((u64::from_be_bytes(bytes), serde_json::from_slice(&value)?));
        }
        Ok(messages)
    }

    pub fn flush(&self) -> Result<(), PersistenceError> {
        self.db.flush()?;
        Ok(())
    }

    fn save_record(&self, key: String, record: &TopologyRecord) -> Result<(), PersistenceError> {
        let tree = self.db.open_tree(TOPOLOGY_TREE)?;
        tree.insert(key.as_bytes(), serde_json::to_vec(record)?)?;
        Ok(())
    }
}

fn message_tree(queue: &str) -> String {
    format!("queue/{queue}")
}

impl std::fmt::Debug for Persistence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Persistence")
            .field("db", &"sled::Db")
            .finish()
    }
}
