//! Per-test log capture.
//!
//! A backup logs from the test's own task, from a spawned task per object transfer, and from the
//! blocking threads that compress objects.  `cargo test` only captures output printed from the
//! test's own thread, so the log events of all of those threads are buffered here instead and
//! printed together once the test is over.
use crate::Result;
use std::{
    future::Future,
    io::Write,
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex},
    time::Duration,
};
use tracing_subscriber::EnvFilter;

/// Log filter used when `RUST_LOG` isn't set.  Everything from coldvault, only warnings from the
/// HTTP and AWS stacks underneath it.
const DEFAULT_FILTER: &str = "warn,coldvault=trace,coldvault_testing=debug";

/// Shared buffer which every thread of a test writes its formatted log events to
#[derive(Clone, Default)]
struct CapturedLog(Arc<Mutex<Vec<u8>>>);

impl CapturedLog {
    fn into_string(self) -> String {
        let buffer = self.0.lock().unwrap();

        String::from_utf8_lossy(&buffer).into_owned()
    }
}

impl Write for CapturedLog {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);

        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Run a test with logging enabled.
///
/// This takes the place of `tokio::test`, running the test on its own multi-threaded runtime.
/// Log events are filtered by `RUST_LOG` if it's set.  They're printed when the test finishes,
/// whether it passed, failed or panicked, so they aren't interleaved with other tests' output.
pub fn test_with_logging(test: impl Future<Output = Result<()>>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(DEFAULT_FILTER))
        .expect("BUG: default test log filter is valid");

    let (result, log) = run_capturing_log(filter, test);

    println!("Log events from this test:\n{log}");

    match result {
        Ok(result) => result,
        Err(panic) => std::panic::resume_unwind(panic),
    }
}

/// Run `test` on a new runtime whose every thread, blocking threads included, logs into one
/// buffer.  Returns the outcome of the test, with any panic caught, and the captured log.
fn run_capturing_log(
    filter: EnvFilter,
    test: impl Future<Output = Result<()>>,
) -> (std::thread::Result<Result<()>>, String) {
    use tracing_subscriber::prelude::*;

    let log = CapturedLog::default();

    // Transfer spans carry the object name, so every line says which object it's about
    let format = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(true)
        .with_writer({
            let log = log.clone();
            move || log.clone()
        });

    let dispatch = tracing::Dispatch::new(tracing_subscriber::registry().with(filter).with(format));

    let result = tracing::dispatcher::with_default(&dispatch, || {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .on_thread_start({
                let dispatch = dispatch.clone();
                move || {
                    // The runtime's threads exit with the runtime, which is when this default
                    // needs to go away anyway
                    std::mem::forget(tracing::dispatcher::set_default(&dispatch));
                }
            })
            .build();

        let runtime = match runtime {
            Ok(runtime) => runtime,
            Err(e) => return Ok(Err(e.into())),
        };

        // Test futures can't reasonably be required to be unwind safe
        std::panic::catch_unwind(AssertUnwindSafe(move || {
            let result = runtime.block_on(test);
            runtime.shutdown_timeout(Duration::from_secs(10));

            result
        }))
    });

    (result, log.into_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing::Instrument;

    #[test]
    fn events_from_every_thread_are_captured_with_their_spans() {
        let (result, log) = run_capturing_log(EnvFilter::new("debug"), async {
            tracing::info!("from the test task");

            tokio::spawn(
                async {
                    tracing::info!("from a spawned task");

                    tokio::task::spawn_blocking(|| tracing::debug!("from a blocking thread"))
                        .await
                        .unwrap();
                }
                .instrument(tracing::debug_span!("transfer", object = %"2024/a.png")),
            )
            .await
            .unwrap();

            Ok(())
        });

        assert!(result.unwrap().is_ok());
        assert!(log.contains("from the test task"), "{log}");
        assert!(
            log.contains("transfer{object=2024/a.png}") && log.contains("from a spawned task"),
            "{log}"
        );
        assert!(log.contains("from a blocking thread"), "{log}");
    }

    #[test]
    fn log_is_kept_when_the_test_panics() {
        let (result, log) = run_capturing_log(EnvFilter::new("info"), async {
            tracing::info!("before the panic");
            assert_eq!(1, 2, "test failed");

            Ok(())
        });

        assert!(result.is_err());
        assert!(log.contains("before the panic"), "{log}");
    }
}
