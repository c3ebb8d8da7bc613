//! Bridge from the [`log`] facade to a user-supplied callback.
//!
//! Embedders that cannot read stderr (language bindings, GUIs) subscribe a
//! callback and receive every record the crate logs. The subscriber lives in
//! one process-wide slot: subscribing replaces the previous callback,
//! [`unsubscribe`] clears the slot. The slot is mutex-guarded since records
//! are produced from transport and timer threads concurrently.
//!
//! [`init`] installs the forwarder as the global [`log`] sink. Call it at
//! most once per process and not together with another logger such as
//! `env_logger`.

use std::sync::{Arc, Mutex};

use log::{Level, Metadata, Record};

/// One captured log record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogRecord {
    /// Severity.
    pub level: Level,
    /// Module path that produced the record.
    pub target: String,
    /// Formatted message.
    pub message: String,
}

type Subscriber = Arc<dyn Fn(&LogRecord) + Send + Sync>;

static SLOT: Mutex<Option<Subscriber>> = Mutex::new(None);

/// Installs the forwarder as the process-wide [`log`] sink.
///
/// Records at `max_level` and below are forwarded to the subscribed
/// callback. Fails if another logger is already installed.
pub fn init(max_level: log::LevelFilter) -> Result<(), log::SetLoggerError> {
    log::set_logger(&Forwarder)?;
    log::set_max_level(max_level);
    Ok(())
}

/// Subscribes `callback` to log records, replacing any previous subscriber.
pub fn subscribe(callback: impl Fn(&LogRecord) + Send + Sync + 'static) {
    *SLOT.lock().unwrap() = Some(Arc::new(callback));
}

/// Clears the subscriber slot.
///
/// Records produced afterwards are dropped until the next [`subscribe`].
pub fn unsubscribe() {
    *SLOT.lock().unwrap() = None;
}

fn dispatch(record: &LogRecord) {
    // The callback runs outside the lock so it may re-subscribe.
    let subscriber = SLOT.lock().unwrap().clone();
    if let Some(subscriber) = subscriber {
        subscriber(record);
    }
}

struct Forwarder;

impl log::Log for Forwarder {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        dispatch(&LogRecord {
            level: record.level(),
            target: record.target().to_string(),
            message: record.args().to_string(),
        });
    }

    fn flush(&self) {}
}

///////////////////////////////////////////////////////////////////////////////
//                                   Tests                                   //
///////////////////////////////////////////////////////////////////////////////
