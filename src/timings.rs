#[cfg(feature = "timings")]
use std::time::Instant;

use crate::types::Symbol;

#[cfg(feature = "timings")]
pub(crate) fn time_block<T, F>(label: &'static str, symbol: &Symbol, f: F) -> T
where
    F: FnOnce() -> T,
{
    let start = Instant::now();
    let value = f();
    let elapsed = start.elapsed();
    tracing::info!(
        target: "timings",
        %label,
        symbol = %symbol,
        elapsed_ms = elapsed.as_secs_f64() * 1e3
    );
    value
}

#[cfg(not(feature = "timings"))]
pub(crate) fn time_block<T, F>(_: &'static str, _: &Symbol, f: F) -> T
where
    F: FnOnce() -> T,
{
    f()
}
