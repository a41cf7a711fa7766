//! Reconciliation with the remote authority.

mod checkpoint;
mod coordinator;
mod http;
mod memory;
mod progress;
mod remote;
mod state;
mod trigger;

pub use checkpoint::{last_sync_at, watermark};
pub use coordinator::{SyncCoordinator, SyncOutcome};
pub use http::HttpRemote;
pub use memory::MemoryRemote;
pub use progress::{SyncProgress, SyncStep};
pub use remote::{PullResponse, PushAck, PushItem, RemoteChange, RemoteEndpoint, TransportError};
pub use state::{SyncState, SyncStateHandle};
pub use trigger::{SyncNotice, SyncTicket, SyncTrigger};
