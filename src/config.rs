use std::path::PathBuf;
use std::time::Duration;

/// Dispatcher node configuration.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Port serving HTTP, the worker websocket and the peer websocket.
    pub port: u16,
    /// Externally reachable IP advertised to the directory.
    pub advertise_ip: String,
    /// Directory ("centrum") base URL used for bootstrap and liveness.
    pub directory_url: String,
    /// Directory where the node store and chain data live.
    pub data_dir: PathBuf,
    /// Maximum number of concurrently connected workers.
    pub max_workers: usize,
    /// Maximum number of jobs batched into a single block.
    pub max_tree_jobs: usize,
    /// Grace period given to workers and neighbours on shutdown.
    pub shutdown_grace: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            port: 9995,
            advertise_ip: "127.0.0.1".to_string(),
            directory_url: "http://127.0.0.1:9990".to_string(),
            data_dir: PathBuf::from(".taskmesh"),
            max_workers: 128,
            max_tree_jobs: 24,
            shutdown_grace: Duration::from_secs(3),
        }
    }
}

impl NodeConfig {
    pub fn new(port: u16, data_dir: PathBuf) -> Self {
        Self {
            port,
            data_dir,
            ..Default::default()
        }
    }

    pub fn with_directory(mut self, url: String) -> Self {
        self.directory_url = url;
        self
    }

    pub fn with_max_workers(mut self, cap: usize) -> Self {
        self.max_workers = cap;
        self
    }

    pub fn with_max_tree_jobs(mut self, cap: usize) -> Self {
        self.max_tree_jobs = cap;
        self
    }
}
