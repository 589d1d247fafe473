//! Pluggable write-through persistence.
//!
//! The control plane is in-memory by default. When a store is configured
//! it receives node registrations, task records, and configuration
//! changes; crash recovery rebuilds the registry from it and re-surfaces
//! unconfirmed in-flight tasks as pending.

use std::fmt;

use crate::engine::config::OrchestratorConfig;
use crate::engine::task::Task;
use crate::node::registry::NodeInfo;
use crate::utils::error::LatticeError;

pub trait Store: Send + Sync + fmt::Debug {
    fn put_node(&self, node: &NodeInfo) -> Result<(), LatticeError>;
    fn delete_node(&self, node_id: &str) -> Result<(), LatticeError>;
    fn load_nodes(&self) -> Result<Vec<NodeInfo>, LatticeError>;

    fn put_task(&self, task: &Task) -> Result<(), LatticeError>;
    fn load_tasks(&self) -> Result<Vec<Task>, LatticeError>;

    fn put_config(&self, config: &OrchestratorConfig) -> Result<(), LatticeError>;
    fn load_config(&self) -> Result<Option<OrchestratorConfig>, LatticeError>;
}

const CONFIG_KEY: &[u8] = b"orchestrator";

/// Sled-backed store. Values are JSON documents keyed by entity id.
#[derive(Debug)]
pub struct SledStore {
    nodes: sled::Tree,
    tasks: sled::Tree,
    config: sled::Tree,
    _db: sled::Db,
}

impl SledStore {
    pub fn open(path: &str) -> Result<Self, LatticeError> {
        let db = sled::open(path)?;
        Ok(Self {
            nodes: db.open_tree("nodes")?,
            tasks: db.open_tree("tasks")?,
            config: db.open_tree("config")?,
            _db: db,
        })
    }
}

impl Store for SledStore {
    fn put_node(&self, node: &NodeInfo) -> Result<(), LatticeError> {
        let value = serde_json::to_vec(node)?;
        self.nodes.insert(node.node_id.as_bytes(), value)?;
        Ok(())
    }

    fn delete_node(&self, node_id: &str) -> Result<(), LatticeError> {
        self.nodes.remove(node_id.as_bytes())?;
        Ok(())
    }

    fn load_nodes(&self) -> Result<Vec<NodeInfo>, LatticeError> {
        let mut nodes = Vec::new();
        for item in self.nodes.iter() {
            let (_, value) = item?;
            nodes.push(serde_json::from_slice(&value)?);
        }
        Ok(nodes)
    }

    fn put_task(&self, task: &Task) -> Result<(), LatticeError> {
        let value = serde_json::to_vec(task)?;
        self.tasks.insert(task.task_id.as_bytes(), value)?;
        Ok(())
    }

    fn load_tasks(&self) -> Result<Vec<Task>, LatticeError> {
        let mut tasks = Vec::new();
        for item in self.tasks.iter() {
            let (_, value) = item?;
            tasks.push(serde_json::from_slice(&value)?);
        }
        Ok(tasks)
    }

    fn put_config(&self, config: &OrchestratorConfig) -> Result<(), LatticeError> {
        let value = serde_json::to_vec(config)?;
        self.config.insert(CONFIG_KEY, value)?;
        Ok(())
    }

    fn load_config(&self) -> Result<Option<OrchestratorConfig>, LatticeError> {
        match self.config.get(CONFIG_KEY)? {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }
}

/// In-memory store for tests and recovery drills.
#[derive(Debug, Default)]
pub struct MemoryStore {
    nodes: dashmap::DashMap<String, NodeInfo>,
    tasks: dashmap::DashMap<String, Task>,
    config: std::sync::Mutex<Option<OrchestratorConfig>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemoryStore {
    fn put_node(&self, node: &NodeInfo) -> Result<(), LatticeError> {
        self.nodes.insert(node.node_id.clone(), node.clone());
        Ok(())
    }

    fn delete_node(&self, node_id: &str) -> Result<(), LatticeError> {
        self.nodes.remove(node_id);
        Ok(())
    }

    fn load_nodes(&self) -> Result<Vec<NodeInfo>, LatticeError> {
        Ok(self.nodes.iter().map(|e| e.value().clone()).collect())
    }

    fn put_task(&self, task: &Task) -> Result<(), LatticeError> {
        self.tasks.insert(task.task_id.clone(), task.clone());
        Ok(())
    }

    fn load_tasks(&self) -> Result<Vec<Task>, LatticeError> {
        Ok(self.tasks.iter().map(|e| e.value().clone()).collect())
    }

    fn put_config(&self, config: &OrchestratorConfig) -> Result<(), LatticeError> {
        *self.config.lock().expect("memory store poisoned") = Some(config.clone());
        Ok(())
    }

    fn load_config(&self) -> Result<Option<OrchestratorConfig>, LatticeError> {
        Ok(self.config.lock().expect("memory store poisoned").clone())
    }
}
