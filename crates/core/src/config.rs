//! Service configuration.
//!
//! Plain structs with serde derives; the launcher deserializes them from a
//! TOML file and hands snapshots to the services. Loading and the CLI are
//! out of scope.

use serde::{Deserialize, Serialize};

/// Index service configuration snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Root directory holding one subdirectory per collection
    pub index_directory: String,
    /// Seconds between background flush passes; 0 disables the loop
    pub flush_interval_secs: u64,
    /// Seconds between background optimize passes; 0 disables the loop
    pub optimize_interval_secs: u64,
    /// Kernel build threads
    pub build_thread_count: u32,
    /// Query threads
    pub query_thread_count: u32,
    /// Threads of the service-owned background pool
    pub dump_thread_count: u32,
    /// Read index files through mmap
    pub use_mmap_read: bool,
}

impl Default for IndexConfig {
    fn default() -> Self {
        IndexConfig {
            index_directory: "./indices".to_string(),
            flush_interval_secs: 300,
            optimize_interval_secs: 600,
            build_thread_count: 4,
            query_thread_count: 4,
            dump_thread_count: 2,
            use_mmap_read: true,
        }
    }
}

impl IndexConfig {
    /// Concurrency handed to the index kernel.
    pub fn kernel_concurrency(&self) -> u32 {
        self.build_thread_count + self.query_thread_count
    }
}

/// MySQL repository configuration for one replicated collection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RepositoryConfig {
    /// Source uri, `mysql://host:port/database`
    pub connection_uri: String,
    /// Account with REPLICATION SLAVE / REPLICATION CLIENT grants
    pub user: String,
    /// Account password
    pub password: String,
    /// Watched table name
    pub table_name: String,
    /// Collection fed by this table
    pub collection_name: String,
    /// Index column names expected in the table
    pub index_columns: Vec<String>,
    /// Forward column names expected in the table
    pub forward_columns: Vec<String>,
}
