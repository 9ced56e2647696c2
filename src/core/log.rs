/*
 * Copyright (C) 2020-2023 Fanout, Inc.
 * Copyright (C) 2023 Fastly, Inc.
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use log::{Level, Log, Metadata, Record};
use std::fmt;
use std::fs::File;
use std::io::{self, Write};
use std::str;
use std::sync::{Arc, Mutex, OnceLock};
use time::macros::format_description;
use time::{OffsetDateTime, UtcOffset};

enum SharedOutput<'a> {
    Stdout(io::Stdout),
    File(&'a Mutex<File>),
}

impl Write for SharedOutput<'_> {
    fn write(&mut self, buf: &[u8]) -> Result<usize, io::Error> {
        match self {
            Self::Stdout(g) => g.write(buf),
            Self::File(g) => match g.lock() {
                Ok(mut f) => f.write(buf),
                Err(_) => Err(io::Error::from(io::ErrorKind::Other)),
            },
        }
    }

    fn flush(&mut self) -> Result<(), io::Error> {
        match self {
            Self::Stdout(g) => g.flush(),
            Self::File(g) => match g.lock() {
                Ok(mut f) => f.flush(),
                Err(_) => Err(io::Error::from(io::ErrorKind::Other)),
            },
        }
    }
}

pub struct SimpleLogger {
    local_offset: Option<UtcOffset>,
    output_file: Option<Mutex<File>>,
}

impl SimpleLogger {
    fn write_record(&self, record: &Record) -> Result<(), io::Error> {
        let mut output = match &self.output_file {
            Some(f) => SharedOutput::File(f),
            None => SharedOutput::Stdout(io::stdout()),
        };

        let now = OffsetDateTime::now_utc().to_offset(self.local_offset.unwrap_or(UtcOffset::UTC));

        let format = format_description!(
            "[year]-[month]-[day] [hour]:[minute]:[second].[subsecond digits:3]"
        );

        let mut ts = [0u8; 64];

        let size = {
            let mut ts = io::Cursor::new(&mut ts[..]);

            now.format_into(&mut ts, &format)
                .map_err(|_| io::Error::from(io::ErrorKind::InvalidData))?;

            ts.position() as usize
        };

        let ts = str::from_utf8(&ts[..size])
            .map_err(|_| io::Error::from(io::ErrorKind::InvalidData))?;

        let lname = match record.level() {
            log::Level::Error => "ERR",
            log::Level::Warn => "WARN",
            log::Level::Info => "INFO",
            log::Level::Debug => "DEBUG",
            log::Level::Trace => "TRACE",
        };

        if record.level() <= log::Level::Info {
            writeln!(&mut output, "[{}] {} {}", lname, ts, record.args())
        } else {
            writeln!(
                &mut output,
                "[{}] {} [{}] {}",
                lname,
                ts,
                record.target(),
                record.args()
            )
        }
    }
}

impl Log for SimpleLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        // nowhere left to report a failed log write
        let _ = self.write_record(record);
    }

    fn flush(&self) {}
}

// SAFETY: this method is unsound on platforms where another thread may
// modify environment vars
unsafe fn get_offset() -> Option<UtcOffset> {
    time::util::local_offset::set_soundness(time::util::local_offset::Soundness::Unsound);

    let offset = UtcOffset::current_local_offset().ok();

    time::util::local_offset::set_soundness(time::util::local_offset::Soundness::Sound);

    offset
}

static LOGGER: OnceLock<SimpleLogger> = OnceLock::new();

pub fn ensure_init_simple_logger(output_file: Option<File>) {
    LOGGER.get_or_init(|| {
        // SAFETY: this call happens once, very early, before any other
        // threads exist
        let local_offset = unsafe { get_offset() };

        SimpleLogger {
            local_offset,
            output_file: output_file.map(Mutex::new),
        }
    });
}

pub fn get_simple_logger() -> &'static SimpleLogger {
    LOGGER.get_or_init(|| SimpleLogger {
        local_offset: None,
        output_file: None,
    })
}

pub fn local_offset_check() {
    if get_simple_logger().local_offset.is_none() {
        log::warn!("Failed to determine local time offset. Log timestamps will be in UTC.");
    }
}

// forwards to whatever logger is installed in the log facade
struct GlobalSink;

impl Log for GlobalSink {
    fn enabled(&self, metadata: &Metadata) -> bool {
        log::logger().enabled(metadata)
    }

    fn log(&self, record: &Record) {
        log::logger().log(record)
    }

    fn flush(&self) {
        log::logger().flush()
    }
}

/// Explicit logging handle. Components receive one at construction instead
/// of reaching for a process-wide logger, so tests can capture output.
#[derive(Clone)]
pub struct Logger {
    sink: Arc<dyn Log>,
    target: &'static str,
}

impl Logger {
    pub fn new(sink: Arc<dyn Log>) -> Self {
        Self {
            sink,
            target: "webserv",
        }
    }

    /// A handle that writes through the `log` facade.
    pub fn global() -> Self {
        Self::new(Arc::new(GlobalSink))
    }

    pub fn with_target(&self, target: &'static str) -> Self {
        Self {
            sink: Arc::clone(&self.sink),
            target,
        }
    }

    pub fn log(&self, level: Level, args: fmt::Arguments) {
        let metadata = Metadata::builder().level(level).target(self.target).build();

        if !self.sink.enabled(&metadata) {
            return;
        }

        self.sink.log(
            &Record::builder()
                .metadata(metadata)
                .args(args)
                .build(),
        );
    }

    pub fn error(&self, args: fmt::Arguments) {
        self.log(Level::Error, args)
    }

    pub fn warn(&self, args: fmt::Arguments) {
        self.log(Level::Warn, args)
    }

    pub fn info(&self, args: fmt::Arguments) {
        self.log(Level::Info, args)
    }

    pub fn debug(&self, args: fmt::Arguments) {
        self.log(Level::Debug, args)
    }
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Logger").field("target", &self.target).finish()
    }
}

#[cfg(test)]
pub mod testutil {
    use super::*;

    /// Sink that keeps every record in memory.
    #[derive(Default)]
    pub struct CaptureSink {
        records: Mutex<Vec<(Level, String)>>,
    }

    impl CaptureSink {
        pub fn records(&self) -> Vec<(Level, String)> {
            match self.records.lock() {
                Ok(records) => records.clone(),
                Err(_) => Vec::new(),
            }
        }

        pub fn contains(&self, level: Level, needle: &str) -> bool {
            self.records()
                .iter()
                .any(|(l, msg)| *l == level && msg.contains(needle))
        }
    }

    impl Log for CaptureSink {
        fn enabled(&self, _metadata: &Metadata) -> bool {
            true
        }

        fn log(&self, record: &Record) {
            if let Ok(mut records) = self.records.lock() {
                records.push((record.level(), record.args().to_string()));
            }
        }

        fn flush(&self) {}
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::CaptureSink;
    use super::*;

    #[test]
    fn capture() {
        let sink = Arc::new(CaptureSink::default());
        let log = Logger::new(sink.clone()).with_target("test");

        log.error(format_args!("bad thing {}", 1));
        log.debug(format_args!("detail"));

        let records = sink.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0], (Level::Error, "bad thing 1".to_string()));
        assert!(sink.contains(Level::Debug, "detail"));
        assert!(!sink.contains(Level::Warn, "detail"));
    }
}
