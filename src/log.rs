use log::{LevelFilter, Log, Metadata, Record};
use once_cell::sync::Lazy;
use std::fs::{File, OpenOptions};
use std::io::{self, Write as _};
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};

struct NopLogger;

impl Log for NopLogger {
    fn enabled(&self, _: &Metadata) -> bool {
        false
    }

    fn log(&self, _: &Record) {}

    fn flush(&self) {}
}

struct Sinks {
    frontend: Box<dyn Log>,
    diagnostics: Option<Mutex<File>>,
}

/// Routing point for the adapter's log records.
///
/// Where records may go changes over the process lifetime: stderr while the
/// adapter runs standalone, DAP `output` events once a client is bound (the
/// stdio transport owns stdout, and an IDE-spawned process has no visible
/// stderr). `--log-file` additionally mirrors every record into a diagnostics
/// file, which survives frontend switches and client disconnects.
#[derive(Clone)]
pub struct AdapterLog {
    sinks: Arc<RwLock<Sinks>>,
}

pub static LOGGER: Lazy<AdapterLog> = Lazy::new(|| {
    let logger = AdapterLog {
        sinks: Arc::new(RwLock::new(Sinks {
            frontend: Box::new(NopLogger),
            diagnostics: None,
        })),
    };

    log::set_boxed_logger(Box::new(logger.clone())).expect("infallible");
    log::set_max_level(LevelFilter::Debug);

    logger
});

impl AdapterLog {
    /// Replace the frontend logger and reset the global maximum log level.
    /// The diagnostics file, if any, is unaffected.
    pub fn switch<L: Log + 'static>(&self, logger: L, level_filter: LevelFilter) {
        self.sinks.write().unwrap().frontend = Box::new(logger);
        log::set_max_level(level_filter);
    }

    /// Append a copy of every record to `path`.
    pub fn attach_diagnostics_file(&self, path: &Path) -> io::Result<()> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        self.sinks.write().unwrap().diagnostics = Some(Mutex::new(file));
        Ok(())
    }
}

impl Log for AdapterLog {
    fn enabled(&self, metadata: &Metadata) -> bool {
        let sinks = self.sinks.read().unwrap();
        sinks.frontend.enabled(metadata) || sinks.diagnostics.is_some()
    }

    fn log(&self, record: &Record) {
        let sinks = self.sinks.read().unwrap();

        if let Some(file) = &sinks.diagnostics {
            if let Ok(mut file) = file.lock() {
                _ = writeln!(
                    file,
                    "[{}] {} {}",
                    record.level(),
                    record.module_path().unwrap_or(record.target()),
                    record.args()
                );
            }
        }

        sinks.frontend.log(record);
    }

    fn flush(&self) {
        let sinks = self.sinks.read().unwrap();
        if let Some(file) = &sinks.diagnostics {
            if let Ok(mut file) = file.lock() {
                _ = file.flush();
            }
        }
        sinks.frontend.flush();
    }
}
