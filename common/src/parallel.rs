//! Concurrency-limited parallel iteration utilities.
//!
//! Wraps rayon's `par_iter` to process items in parallel while limiting
//! the number of items in flight at once (e.g. to cap open directory handles
//! or decode memory).

use rayon::prelude::*;

/// Maps `f` over `items` in parallel, with at most `max_concurrent` items in flight.
/// Output order matches input order.
///
/// # Panics
///
/// Panics if `max_concurrent` is 0.
pub fn par_map_limited<T, R, F>(items: &[T], max_concurrent: usize, f: F) -> Vec<R>
where
    T: Sync,
    R: Send,
    F: Fn(&T) -> R + Sync,
{
    assert!(max_concurrent > 0, "max_concurrent must be > 0");

    let mut results = Vec::with_capacity(items.len());
    for chunk in items.chunks(max_concurrent) {
        let chunk_results: Vec<R> = chunk.par_iter().map(&f).collect();
        results.extend(chunk_results);
    }
    results
}

/// Like [`par_map_limited`], but stops before the next chunk once `keep_going`
/// returns false. Items already in flight still complete.
pub fn par_map_limited_while<T, R, F, K>(
    items: &[T],
    max_concurrent: usize,
    keep_going: K,
    f: F,
) -> Option<Vec<R>>
where
    T: Sync,
    R: Send,
    F: Fn(&T) -> R + Sync,
    K: Fn() -> bool,
{
    assert!(max_concurrent > 0, "max_concurrent must be > 0");

    let mut results = Vec::with_capacity(items.len());
    for chunk in items.chunks(max_concurrent) {
        if !keep_going() {
            return None;
        }
        let chunk_results: Vec<R> = chunk.par_iter().map(&f).collect();
        results.extend(chunk_results);
    }
    Some(results)
}
