//! Topic-based publish/subscribe.
//!
//! - **Registry**: publisher side; numbers messages per topic and fans them
//!   out to subscribers
//! - **Methods**: stream methods serving the registry to clients
//! - **Reconcile**: consumer side; folds a snapshot and a live subscription
//!   into one monotonically advancing state

pub mod methods;
pub mod reconcile;
pub mod registry;

pub use methods::{CreateTopicMethod, GetTopicsMethod, PublishTopicMethod, SubscribeTopicMethod};
pub use reconcile::{
    FnReducer, Ingested, MethodSnapshotSource, QueryError, ReconcileState, Reconciler, Snapshot,
    SnapshotSource, TopicQuery, TopicReducer,
};
pub use registry::{MetaEvent, Subscription, Topic, TopicInfo, TopicRegistry};
