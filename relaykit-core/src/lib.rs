use std::num::NonZeroUsize;

mod error;
pub use error::{AnyError, AnyResult};

pub mod cache;
pub mod config;
pub mod entity;
pub mod failure;
pub mod future;
pub mod runtime;

pub use cache::{Entity, Expirator, KeyedEntity, ObjectCache, Retention};
pub use entity::{ChangeNotifier, WeakField};
pub use failure::{ErrorKind, Failure, FailureHints, FailureLevel};
pub use future::{CancelableFuture, Future, Promise};

pub const FALLBACK_PARALLELISM: NonZeroUsize = match NonZeroUsize::new(1) {
    Some(n) => n,
    None => unreachable!(),
};

pub fn max_parallel_count() -> NonZeroUsize {
    std::thread::available_parallelism().unwrap_or(FALLBACK_PARALLELISM)
}
