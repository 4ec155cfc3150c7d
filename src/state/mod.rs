//! Hub state: the snapshot model, how it is captured from a hub, persisted,
//! and replayed onto another hub.

pub mod file;
pub mod model;
pub mod pool;
pub mod replay;
pub mod reset;
pub mod sanitize;
pub mod snapshot;

pub use model::{Aspect, AspectSet, HubState, aspect_set};
pub use replay::ReplayEngine;
pub use reset::ResetEngine;
pub use snapshot::SnapshotBuilder;
