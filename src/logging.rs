use std::sync::Once;

use log::{Level, LevelFilter, Log};

struct SimpleLogger;

impl Log for SimpleLogger {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true // show all levels
    }

    fn log(&self, record: &log::Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let color = match record.level() {
            Level::Error => 31, // Red
            Level::Warn => 93,  // BrightYellow
            Level::Info => 34,  // Blue
            Level::Debug => 32, // Green
            Level::Trace => 90, // BrightBlack
        };

        let display_level = match record.level() {
            Level::Error => "ERR",
            Level::Warn => "WRN",
            Level::Info => "INF",
            Level::Debug => "DBG",
            Level::Trace => "TRC",
        };

        println!(
            "\u{1B}[{}m[{}] {}\u{1B}[0m",
            color,
            display_level,
            record.args()
        )
    }

    fn flush(&self) {}
}

static INIT: Once = Once::new();

/// Install the logger. Safe to call more than once; later calls are no-ops.
pub fn init() {
    INIT.call_once(|| {
        static LOGGER: SimpleLogger = SimpleLogger;
        log::set_logger(&LOGGER).unwrap();
        log::set_max_level(match std::env::var("LOG").as_deref() {
            Ok("ERROR") => LevelFilter::Error,
            Ok("WARN") => LevelFilter::Warn,
            Ok("INFO") => LevelFilter::Info,
            Ok("DEBUG") => LevelFilter::Debug,
            Ok("TRACE") => LevelFilter::Trace,
            _ => LevelFilter::Info,
        });
    });
}
