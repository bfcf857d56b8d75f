use std::fs::{ self, OpenOptions };
use std::io::{ self, Write };
use std::path::Path;
use std::sync::Mutex;
use chrono::Local;

//  order of log (Debug < Info < Warning < Error).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug = 0,
    Info = 1,
    Warning = 2,
    Error = 3,
}

impl LogLevel {
    fn as_str(&self) -> &str {
        match self {
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARN",
            LogLevel::Error => "ERROR",
            LogLevel::Debug => "DEBUG",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "debug" => Some(LogLevel::Debug),
            "info" => Some(LogLevel::Info),
            "warning" | "warn" => Some(LogLevel::Warning),
            "error" => Some(LogLevel::Error),
            _ => None,
        }
    }
}

/// Appends timestamped lines to the session log; optionally mirrors them to stderr
/// so interactive modes show hits and status without tailing the file.
pub struct Logger {
    file_path: String,
    file_mutex: Mutex<()>,
    enabled: bool,
    echo: bool,
    min_level: LogLevel,
}

impl Logger {
    pub fn new_with_level(
        file_path: &str,
        enabled: bool,
        min_level: LogLevel
    ) -> Result<Self, io::Error> {
        if enabled {
            if let Some(dir) = Path::new(file_path).parent() {
                if !dir.as_os_str().is_empty() {
                    fs::create_dir_all(dir)?;
                }
            }
            OpenOptions::new().create(true).append(true).open(file_path)?;
        }
        Ok(Logger {
            file_path: file_path.to_string(),
            file_mutex: Mutex::new(()),
            enabled,
            echo: false,
            min_level,
        })
    }

    /// Logger that drops everything. Used by tests.
    pub fn disabled() -> Self {
        Logger {
            file_path: String::new(),
            file_mutex: Mutex::new(()),
            enabled: false,
            echo: false,
            min_level: LogLevel::Error,
        }
    }

    pub fn with_echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    fn should_log(&self, level: LogLevel) -> bool {
        self.enabled && level >= self.min_level
    }

    pub fn log(&self, level: LogLevel, message: &str) -> Result<(), io::Error> {
        if !self.should_log(level) {
            return Ok(());
        }

        let _guard = self.file_mutex
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "logger mutex poisoned"))?;

        let line = format!(
            "[{}] [{}] {}\n",
            Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            level.as_str(),
            message
        );

        if self.echo {
            eprint!("{}", line);
        }

        let mut file = OpenOptions::new().create(true).append(true).open(&self.file_path)?;
        file.write_all(line.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    pub fn log_fmt(&self, level: LogLevel, args: std::fmt::Arguments) -> Result<(), io::Error> {
        if !self.should_log(level) {
            return Ok(());
        }
        self.log(level, &format!("{}", args))
    }

    pub fn info(&self, message: &str) -> Result<(), io::Error> {
        self.log(LogLevel::Info, message)
    }
    pub fn warn(&self, message: &str) -> Result<(), io::Error> {
        self.log(LogLevel::Warning, message)
    }
    pub fn error(&self, message: &str) -> Result<(), io::Error> {
        self.log(LogLevel::Error, message)
    }

    pub fn info_fmt(&self, args: std::fmt::Arguments) -> Result<(), io::Error> {
        self.log_fmt(LogLevel::Info, args)
    }
    pub fn warn_fmt(&self, args: std::fmt::Arguments) -> Result<(), io::Error> {
        self.log_fmt(LogLevel::Warning, args)
    }
    pub fn error_fmt(&self, args: std::fmt::Arguments) -> Result<(), io::Error> {
        self.log_fmt(LogLevel::Error, args)
    }
    pub fn debug_fmt(&self, args: std::fmt::Arguments) -> Result<(), io::Error> {
        self.log_fmt(LogLevel::Debug, args)
    }

    pub fn file_path(&self) -> &str {
        &self.file_path
    }
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }
}

#[macro_export]
macro_rules! log_info {
    (
        $logger:expr,
        $($arg:tt)*
    ) => {
        $logger.info_fmt(format_args!($($arg)*))
    };
}
#[macro_export]
macro_rules! log_warn {
    (
        $logger:expr,
        $($arg:tt)*
    ) => {
        $logger.warn_fmt(format_args!($($arg)*))
    };
}
#[macro_export]
macro_rules! log_error {
    (
        $logger:expr,
        $($arg:tt)*
    ) => {
        $logger.error_fmt(format_args!($($arg)*))
    };
}
#[macro_export]
macro_rules! log_debug {
    (
        $logger:expr,
        $($arg:tt)*
    ) => {
        $logger.debug_fmt(format_args!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_parse_accepts_aliases() {
        assert_eq!(LogLevel::parse("WARN"), Some(LogLevel::Warning));
        assert_eq!(LogLevel::parse("warning"), Some(LogLevel::Warning));
        assert_eq!(LogLevel::parse("debug"), Some(LogLevel::Debug));
        assert_eq!(LogLevel::parse("verbose"), None);
    }

    #[test]
    fn disabled_logger_never_touches_disk() {
        let logger = Logger::disabled();
        assert!(!logger.is_enabled());
        assert!(logger.info("dropped").is_ok());
        assert!(log_warn!(logger, "also {}", "dropped").is_ok());
    }

    #[test]
    fn respects_min_level() {
        let path = std::env::temp_dir().join(
            format!("beat-lanes-logger-{}.log", std::process::id())
        );
        let path_str = path.to_string_lossy().into_owned();
        let _ = fs::remove_file(&path);

        let logger = Logger::new_with_level(&path_str, true, LogLevel::Info).unwrap();
        log_debug!(logger, "hidden {}", 1).unwrap();
        log_info!(logger, "shown {}", 2).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert!(!text.contains("hidden"));
        assert!(text.contains("[INFO] shown 2"));
        let _ = fs::remove_file(&path);
    }
}
