//! InkSync Core Library
//!
//! Real-time scene synchronization for collaborative whiteboards: end-to-end
//! encrypted relay transport, element reconciliation, presence and follow
//! mode, and persistence of scenes and attachments to a blob store.

pub mod config;
pub mod crypto;
pub mod element;
pub mod error;
pub mod files;
pub mod host;
pub mod idle;
pub mod portal;
pub mod presence;
pub mod protocol;
pub mod reconcile;
pub mod room;
pub mod session;
pub mod socket;
pub mod storage;
pub mod throttle;

#[cfg(test)]
mod test_util;

pub use config::CollabConfig;
pub use crypto::{CryptoError, EncryptedData, RoomKey};
pub use element::{Element, ElementId, FileId, FileStatus, scene_version};
pub use error::{CollabError, CollabResult};
pub use files::{BinaryFileData, FileManager};
pub use host::{AppState, DocumentHost, MemoryDocument};
pub use idle::{ActivitySignal, ActivitySource, ChannelActivitySource, IdleDetector};
pub use portal::{ChannelState, Portal, PortalEvent};
pub use presence::{Collaborator, Collaborators, FollowAction, PointerButton, SocketId, UserFollowPayload, UserIdleState};
pub use protocol::{ClientFrame, ServerFrame, SocketUpdate};
pub use reconcile::{ReconcileContext, reconcile};
pub use room::RoomLinkData;
pub use session::{Session, SessionPhase, SessionStatus};
pub use socket::{ConnectionState, MemoryHub, SocketConnector, SocketError, SocketEvent, SocketTransport};
pub use storage::{MemoryStore, RemoteStore, SaveOutcome, SceneStore, StorageError};

#[cfg(not(target_arch = "wasm32"))]
pub use socket::NativeConnector;
#[cfg(not(target_arch = "wasm32"))]
pub use storage::{DirectoryStore, HttpStore};
