//! Wave-limited parallel execution.
//!
//! Items are processed in consecutive waves of at most `wave_size` items.
//! Every item of a wave runs in parallel on the current rayon pool, and the
//! next wave starts only after the whole wave has finished.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};

use rayon::prelude::*;

/// Splits `items` into waves of at most `wave_size` items, preserving order.
///
/// # Panics
///
/// Panics if `wave_size` is 0.
pub fn waves<T>(items: &[T], wave_size: usize) -> std::slice::Chunks<'_, T> {
    assert!(wave_size > 0, "wave_size must be > 0");
    items.chunks(wave_size)
}

/// Maps `f` over `items` wave by wave, with at most `wave_size` items in flight.
///
/// Output order matches input order. A panic inside `f` is caught and
/// reported as that item's `Err`. `on_wave` is called before each wave with
/// `(wave_index, wave_len)`.
pub fn par_map_waves_isolated<T, R, F, W>(
    items: &[T],
    wave_size: usize,
    on_wave: W,
    f: F,
) -> Vec<Result<R, String>>
where
    T: Sync,
    R: Send,
    F: Fn(&T) -> R + Sync,
    W: Fn(usize, usize),
{
    let mut results = Vec::with_capacity(items.len());
    for (wave_index, wave) in waves(items, wave_size).enumerate() {
        on_wave(wave_index, wave.len());
        let wave_results: Vec<Result<R, String>> = wave
            .par_iter()
            .map(|item| catch_unwind(AssertUnwindSafe(|| f(item))).map_err(panic_message))
            .collect();
        results.extend(wave_results);
    }
    results
}

/// Extracts a readable message from a panic payload.
pub fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "worker panicked".to_string()
    }
}
