//! Bounded fan-out over a batch of work items.
//!
//! Items are pulled from a shared queue by at most `concurrency` scoped
//! coroutines; each worker handles one item end to end before taking the next.
//! The call returns once every item is done, with every error that was produced.

use may::coroutine;
use std::sync::{Mutex, PoisonError};

/// Run `f` over `items` with at most `concurrency` invocations in flight.
///
/// An error (or a slow item) only affects its own worker; the remaining items
/// are still processed. The returned vector is empty when every call succeeded.
pub fn run<T, E, F>(concurrency: usize, items: Vec<T>, f: F) -> Vec<E>
where
    T: Send,
    E: Send,
    F: Fn(T) -> Result<(), E> + Sync,
{
    if items.is_empty() {
        return Vec::new();
    }

    let workers = concurrency.max(1).min(items.len());
    let queue = Mutex::new(items.into_iter());
    let errors = Mutex::new(Vec::new());

    coroutine::scope(|scope| {
        for _ in 0..workers {
            may::go!(scope, || {
                loop {
                    let next = queue
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .next();
                    let Some(item) = next else {
                        break;
                    };
                    if let Err(e) = f(item) {
                        errors
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .push(e);
                    }
                }
            });
        }
    });

    errors.into_inner().unwrap_or_else(PoisonError::into_inner)
}
