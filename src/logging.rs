//! Structured logging setup, mirroring the teacher's `setup_logging()` in
//! `main.rs`: a `log4rs` file + stdout appender pair behind the `log`
//! facade, gated by `AFM_DEBUG` instead of a fixed `LevelFilter::Info`.

use log::LevelFilter;
use log4rs::append::console::ConsoleAppender;
use log4rs::append::file::FileAppender;
use log4rs::config::{Appender, Config, Root};
use log4rs::encode::pattern::PatternEncoder;

/// Initialize the global logger. Safe to call once at process start; a
/// second call is a no-op (log4rs returns an error we swallow, matching
/// the teacher's own "best effort" logging setup).
pub fn init() {
    let level = if std::env::var("AFM_DEBUG").as_deref() == Ok("1") {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    let pattern = "{d(%Y-%m-%d %H:%M:%S)} {l} [{T}] {m}{n}";

    let stdout = ConsoleAppender::builder()
        .encoder(Box::new(PatternEncoder::new(pattern)))
        .build();

    let log_dir = dirs::home_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join(".afm")
        .join("logs");
    let _ = std::fs::create_dir_all(&log_dir);
    let log_file = log_dir.join("afm.log");

    let config = match FileAppender::builder()
        .encoder(Box::new(PatternEncoder::new(pattern)))
        .build(&log_file)
    {
        Ok(file) => Config::builder()
            .appender(Appender::builder().build("stdout", Box::new(stdout)))
            .appender(Appender::builder().build("file", Box::new(file)))
            .build(
                Root::builder()
                    .appender("stdout")
                    .appender("file")
                    .build(level),
            ),
        Err(_) => Config::builder()
            .appender(Appender::builder().build("stdout", Box::new(stdout)))
            .build(Root::builder().appender("stdout").build(level)),
    };

    if let Ok(config) = config {
        let _ = log4rs::init_config(config);
    }
}
