//! Client-side cache consistency layer.
//!
//! This module provides a keyed cache of server-derived values that:
//! - Addresses entities and result sets with hierarchical keys
//! - Serves stale values while revalidating them in the background
//! - Applies writes optimistically and rolls them back if the server refuses
//! - Invalidates dependent query groups after a confirmed change
//! - Retries transient fetch failures with exponential backoff

mod entry;
mod error;
mod invalidation;
mod keys;
mod mutation;
mod retry;
mod store;

pub use entry::{CacheEntry, ErrorInfo, FetchStatus, MutationId};
pub use error::{CacheError, ErrorClass};
pub use invalidation::{
  minimize, Change, EntityClass, InvalidationEvent, InvalidationRouter, RouteFn,
};
pub use keys::{is_descendant, CacheKey, Segment};
pub use mutation::{CommitOutcome, MutationDescriptor, MutationExecutor};
pub use retry::{RetryDecision, RetryPolicy};
pub use store::{CacheStore, FetchFn, Projection, Snapshot, Subscription};
