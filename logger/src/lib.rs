use std::{
    fmt,
    sync::atomic::{AtomicU8, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};

static MAX_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);

#[derive(Copy, Clone, PartialEq, PartialOrd)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
        };
        write!(f, "{}", s)
    }
}

pub fn set_level(level: LogLevel) {
    MAX_LEVEL.store(level as u8, Ordering::Relaxed);
}

fn log(level: LogLevel, args: fmt::Arguments) {
    if level as u8 > MAX_LEVEL.load(Ordering::Relaxed) {
        return;
    }
    let now = SystemTime::now();
    let epoch = now.duration_since(UNIX_EPOCH).unwrap();
    let unix = epoch.as_secs();
    let hours = (unix / 3600) % 24;
    let minutes = (unix / 60) % 60;
    let seconds = unix % 60;
    println!(
        "[{:02}:{:02}:{:02}] [{}] {}",
        hours, minutes, seconds, level, args
    );
}

pub fn info(fmt: impl fmt::Display) {
    log(LogLevel::Info, format_args!("{}", fmt));
}

pub fn warn(fmt: impl fmt::Display) {
    log(LogLevel::Warn, format_args!("{}", fmt));
}

pub fn error(fmt: impl fmt::Display) {
    log(LogLevel::Error, format_args!("{}", fmt));
}

pub fn debug(fmt: impl fmt::Display) {
    log(LogLevel::Debug, format_args!("{}", fmt));
}

#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => {
        $crate::info(format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! warn {
    ($($arg:tt)*) => {
        $crate::warn(format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! error {
    ($($arg:tt)*) => {
        $crate::error(format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! debug {
    ($($arg:tt)*) => {
        $crate::debug(format_args!($($arg)*))
    };
}
