use std::time::{Duration, Instant};

/// Runs `f` and returns its value with the wall time it took. With the
/// `timings` feature the duration is also emitted on the `timings` target.
pub(crate) fn timed<T, F>(label: &'static str, f: F) -> (T, Duration)
where
    F: FnOnce() -> T,
{
    let start = Instant::now();
    let value = f();
    let elapsed = start.elapsed();
    report(label, elapsed);
    (value, elapsed)
}

#[cfg(feature = "timings")]
fn report(label: &'static str, elapsed: Duration) {
    tracing::info!(target: "timings", %label, elapsed_ms = elapsed.as_secs_f64() * 1e3);
}

#[cfg(not(feature = "timings"))]
fn report(_: &'static str, _: Duration) {}
