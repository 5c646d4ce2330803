use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};
use spin::mutex::Mutex;
use std::io::Write;

// 多个线程同时写stderr时保证一行不被打断
static STDERR: Mutex<()> = Mutex::new(());

struct ConsoleLogger;

static LOGGER: ConsoleLogger = ConsoleLogger;

impl Log for ConsoleLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let _guard = STDERR.lock();
        let stderr = std::io::stderr();
        let mut out = stderr.lock();
        let _ = writeln!(out, "[{:>5}] {}: {}", record.level(), record.target(), record.args());
    }

    fn flush(&self) {
        let _ = std::io::stderr().flush();
    }
}

// 日志级别：-v 次数优先，其次是 DDFS_LOG 环境变量，默认只输出warn
fn level(verbose: u64) -> LevelFilter {
    match verbose {
        0 => std::env::var("DDFS_LOG")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(LevelFilter::Warn),
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

pub fn init(verbose: u64) -> Result<(), SetLoggerError> {
    log::set_logger(&LOGGER)?;
    log::set_max_level(level(verbose));
    Ok(())
}

#[cfg(test)]
mod console_tests {
    use super::*;

    #[test]
    fn test_verbose_overrides_env() {
        assert_eq!(level(1), LevelFilter::Info);
        assert_eq!(level(2), LevelFilter::Debug);
        assert_eq!(level(5), LevelFilter::Trace);
    }
}
