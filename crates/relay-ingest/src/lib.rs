pub mod mirror;
pub mod model;
pub mod signals;
pub mod state;

pub use mirror::{MirrorError, RemoteSignalMirror};
pub use model::{
    ConnectionRecord, EventStatus, NewRawEvent, OAuthTicket, RawEventRecord, SetupConfig, Signal,
    StoreSnapshot,
};
pub use signals::{LocalSignalStore, MirroredSignalStore, SignalStore, SignalStoreError};
pub use state::{
    normalize_limit, system_clock, Clock, IntegrationStore, StoreError, StoreLimits,
    DEFAULT_LIST_LIMIT, MAX_LIST_LIMIT,
};
