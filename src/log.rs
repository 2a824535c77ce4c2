use env_logger::Builder;
use std::io::Write;
use std::sync::Once;

static INIT: Once = Once::new();

/// Initializes the `env_logger` backend for the `log` facade used throughout
/// this crate. Idempotent, so tests and embedding binaries can call it freely.
pub fn init_log() {
    INIT.call_once(|| {
        let mut builder = Builder::from_default_env();
        builder
            .format_timestamp_micros()
            .format(|buf, record| {
                writeln!(
                    buf,
                    "[{} {}] {}",
                    record.level(),
                    record.target(),
                    record.args()
                )
            })
            .init();
    });
}
