pub mod async_queue;
pub mod event_manager;
pub mod filter;
pub mod firestore_client;
pub mod order_by;
pub mod query;
pub mod settings;
pub mod sync_engine;
pub mod target;
pub mod user;
pub mod view;
pub mod view_snapshot;

pub use async_queue::{AsyncQueue, DelayedOperation, TimerId};
pub use event_manager::{EventManager, ListenOptions, QueryListener, ViewSnapshotObserver};
pub use filter::{CompositeFilter, CompositeOperator, FieldFilter, Filter, FilterOperator};
pub use firestore_client::{FirestoreClient, ListenerRegistration};
pub use order_by::{Bound, Direction, OrderBy};
pub use query::{LimitType, Query};
pub use settings::{BackoffSettings, FirestoreSettings, SyncEngineSettings};
pub use sync_engine::{SyncEngine, SyncEngineListener, WriteAcknowledgement};
pub use target::{Target, TargetId, TargetIdGenerator};
pub use user::User;
pub use view::{LimboDocumentChange, View, ViewChange, ViewDocumentChanges};
pub use view_snapshot::{DocumentChangeType, DocumentViewChange, OnlineState, SyncState, ViewSnapshot};
