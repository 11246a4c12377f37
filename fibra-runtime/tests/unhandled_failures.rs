//! Reporting of unhandled fiber failures
//!
//! A fiber that fails while nobody waits on it is logged at `warn`. These
//! tests install a global subscriber that writes into a buffer and look for
//! the failure in the captured output.

use std::io;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use fibra_runtime::prelude::*;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use tracing::Level;

#[derive(Clone, Default)]
struct Captured(Arc<Mutex<Vec<u8>>>);

impl Captured {
    fn contains(&self, needle: &str) -> bool {
        String::from_utf8_lossy(&self.0.lock()).contains(needle)
    }
}

impl io::Write for Captured {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn captured() -> &'static Captured {
    static CAPTURED: OnceLock<Captured> = OnceLock::new();
    CAPTURED.get_or_init(|| {
        let captured = Captured::default();
        let writer = captured.clone();
        let _ = tracing_subscriber::fmt()
            .with_max_level(Level::WARN)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .try_init();
        captured
    })
}

fn runtime(report_unhandled: bool) -> Runtime {
    Runtime::new(
        RuntimeConfig::builder()
            .num_workers(2)
            .report_unhandled(report_unhandled)
            .default_timeout(Some(Duration::from_secs(10)))
            .build_unchecked(),
    )
}

#[test]
fn test_forked_failure_nobody_joins_is_reported() {
    let logs = captured();
    let program = fail::<(), &'static str, ()>("child-boom")
        .fork::<Never>()
        .zip_right(sleep(Duration::from_millis(200)));
    assert_eq!(runtime(true).run(program), Exit::succeed(()));
    assert!(logs.contains("child-boom"));
    assert!(logs.contains("unhandled"));
}

#[test]
fn test_joined_failure_is_not_reported() {
    let logs = captured();
    let program = sleep::<(), &'static str>(Duration::from_millis(50))
        .zip_right(fail::<(), &'static str, ()>("joined-boom"))
        .fork::<&'static str>()
        .chain(|fiber| fiber.join());
    assert_eq!(runtime(true).run(program), Exit::fail("joined-boom"));
    assert!(!logs.contains("joined-boom"));
}

#[test]
fn test_reporting_can_be_switched_off() {
    let logs = captured();
    let program = fail::<(), &'static str, ()>("quiet-boom")
        .fork::<Never>()
        .zip_right(sleep(Duration::from_millis(200)));
    assert_eq!(runtime(false).run(program), Exit::succeed(()));
    assert!(!logs.contains("quiet-boom"));
}

#[test]
fn test_foreach_par_failure_is_not_reported() {
    let logs = captured();
    let program = foreach_par(0..3u32, |i| {
        if i == 1 {
            fail::<(), &'static str, u32>("par-boom")
        } else {
            sleep(Duration::from_millis(50)).as_(i)
        }
    });
    assert_eq!(runtime(true).run(program), Exit::fail("par-boom"));
    assert!(!logs.contains("par-boom"));
}
