//!
//! Log setup for the intake: console and rotating files, as text or json lines.
//!
use anyhow::Result;
use flexi_logger::{DeferredNow, LoggerHandle};
use log::Record;
use serde::Serialize;

use crate::config::{LogLevel, LoggingConfig};

static INIT_LOGGING: parking_lot::Mutex<bool> = parking_lot::Mutex::new(false);
static HOSTNAME: std::sync::OnceLock<String> = std::sync::OnceLock::new();
static LOCAL_IP: std::sync::OnceLock<String> = std::sync::OnceLock::new();

const SERVICE: &str = "submission-intake";
const ROTATE_BYTES: u64 = 10 << 20;
const KEEP_ROTATED: usize = 5;

/// The most verbose level emitted for a configured level, `None` when logging is off
fn threshold(level: &LogLevel) -> Option<log::Level> {
    match level {
        LogLevel::Debug => Some(log::Level::Debug),
        LogLevel::Info => Some(log::Level::Info),
        LogLevel::Warning => Some(log::Level::Warn),
        // the log crate has nothing above error
        LogLevel::Error | LogLevel::Critical => Some(log::Level::Error),
        LogLevel::Disabled => None,
    }
}

pub fn configure_logging(config: &LoggingConfig) -> Result<LoggerHandle> {
    use flexi_logger::*;
    use flexi_logger::writers::FileLogWriter;

    {
        let mut init = INIT_LOGGING.lock();
        if *init {
            return Err(anyhow::anyhow!("Logger double initalized"))
        }
        *init = true;

        HOSTNAME.get_or_init(|| gethostname::gethostname().to_string_lossy().into_owned());
        // hosts without a routable address still log, just without an ip
        if let Ok(local_ip) = local_ip_address::local_ip() {
            LOCAL_IP.get_or_init(|| local_ip.to_string());
        }
    }

    let Some(log_level) = threshold(&config.log_level) else {
        return Ok(Logger::with(LogSpecification::off()).start()?)
    };

    // other crates only report warnings, ours report at the configured level
    let spec = LogSpecification::env_or_parse(format!("warn, submission_intake={log_level}, submission_filestore={log_level}"))?;
    let formatter: FormatFunction = if config.log_as_json { json_format } else { text_format };
    let mut builder = Logger::with(spec).format(formatter);

    if config.log_to_file {
        let directory = &config.log_directory;
        if !directory.exists() {
            println!("Warning: log directory does not exist. Will try to create {}", directory.to_string_lossy());
            std::fs::create_dir_all(directory)?;
        }

        // one file per level, each holding that level and everything more severe
        for (name, suffix, level) in [("DebugFile", ".dbg", log::Level::Debug), ("LogFile", ".log", log::Level::Info), ("ErrorFile", ".err", log::Level::Error)] {
            if log_level < level {
                continue
            }
            let writer = FileLogWriter::builder(FileSpec::default().directory(directory).suffix(suffix))
                .append()
                .max_level(level.to_level_filter())
                .rotate(Criterion::Size(ROTATE_BYTES), Naming::Numbers, Cleanup::KeepLogFiles(KEEP_ROTATED))
                .format(formatter)
                .try_build()?;
            builder = builder.add_writer(name, Box::new(writer));
        }
    }

    if config.log_to_console {
        builder = builder.log_to_stdout();
    }

    Ok(builder.start()?)
}

fn text_format(w: &mut dyn std::io::Write, now: &mut DeferredNow, record: &Record) -> Result<(), std::io::Error> {
    let hostname = HOSTNAME.get().map_or("<unknown>", String::as_str);
    write!(w, "{} {:5} {hostname}[{}] {}: {}",
        now.format_rfc3339(),
        record.level(),
        std::process::id(),
        record.module_path().unwrap_or("<unknown>"),
        record.args())
}

/// One flat json document per line
#[derive(Serialize)]
struct LogLine<'a> {
    #[serde(rename="@timestamp")]
    timestamp: String,
    service: &'static str,
    level: &'static str,
    logger: &'a str,
    hostname: &'a str,
    ip: &'a str,
    pid: u32,
    message: &'a std::fmt::Arguments<'a>,
}

fn json_format(w: &mut dyn std::io::Write, now: &mut DeferredNow, record: &Record) -> Result<(), std::io::Error> {
    let line = LogLine {
        timestamp: now.format_rfc3339(),
        service: SERVICE,
        level: record.level().as_str(),
        logger: record.module_path().unwrap_or("<unknown>"),
        hostname: HOSTNAME.get().map_or("<unknown>", String::as_str),
        ip: LOCAL_IP.get().map_or("<unknown>", String::as_str),
        pid: std::process::id(),
        message: record.args(),
    };
    serde_json::to_writer(w, &line)?;
    Ok(())
}

#[cfg(test)]
mod test {
    use flexi_logger::DeferredNow;
    use log::Record;

    use crate::config::LogLevel;

    use super::{json_format, text_format, threshold};

    #[test]
    fn levels() {
        assert_eq!(threshold(&LogLevel::Warning), Some(log::Level::Warn));
        assert_eq!(threshold(&LogLevel::Critical), Some(log::Level::Error));
        assert_eq!(threshold(&LogLevel::Disabled), None);
    }

    #[test]
    fn json_lines() {
        let mut out = vec![];
        json_format(&mut out, &mut DeferredNow::new(), &Record::builder()
            .args(format_args!("Admitted {} for {}", "c1/hw1", "A1"))
            .level(log::Level::Info)
            .module_path(Some("submission_intake::store"))
            .build()).unwrap();

        let line: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(line["message"], "Admitted c1/hw1 for A1");
        assert_eq!(line["level"], "INFO");
        assert_eq!(line["logger"], "submission_intake::store");
        assert_eq!(line["service"], "submission-intake");
        assert_eq!(line["pid"], std::process::id());
        assert!(line["@timestamp"].is_string());
    }

    #[test]
    fn text_lines() {
        let mut out = vec![];
        text_format(&mut out, &mut DeferredNow::new(), &Record::builder()
            .args(format_args!("Rejected A1 submission of c1/hw1"))
            .level(log::Level::Warn)
            .module_path(Some("submission_intake::policy"))
            .build()).unwrap();

        let line = String::from_utf8(out).unwrap();
        assert!(line.contains(" WARN "), "{line}");
        assert!(line.ends_with("submission_intake::policy: Rejected A1 submission of c1/hw1"), "{line}");
    }
}
