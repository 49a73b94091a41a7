pub mod config;
pub mod error;
pub mod manager;
pub mod peer;
pub mod pool;
pub mod protocol;
pub mod store;

// Re-export commonly used types for easier testing
pub use crate::config::PeerNetConfig;
pub use crate::error::PeerNetError;
pub use crate::manager::{ManagerState, PeerNetworkManager};
pub use crate::peer::PeerRecord;
pub use crate::pool::ConnectionPool;
pub use crate::protocol::{
    AddPeerRequest, BroadcastReport, NetworkStatus, PeerListResponse, SharePeersRequest,
    SharePeersResponse, StatusResponse,
};
pub use crate::store::PeerStore;
