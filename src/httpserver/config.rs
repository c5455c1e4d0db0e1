#[derive(uniffi::Record, Debug, Clone, PartialEq, Eq)]
pub struct BlobServerConfig {
    /// Loopback port to listen on, 0 picks a free one.
    pub port: u16,
    /// Connections served at once, 0 for no limit.
    pub max_connections: u64,
}

impl Default for BlobServerConfig {
    fn default() -> Self {
        Self {
            port: 0,
            max_connections: 16,
        }
    }
}
