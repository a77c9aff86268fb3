use std::env;
use log::LevelFilter;

pub mod app;
pub mod config;
pub mod device;
pub mod error;

pub use crate::app::{run, Args};

pub fn init_logging(level: LevelFilter) {
    let mut dispatch = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{} {} {}] {}",
                humantime::format_rfc3339(std::time::SystemTime::now()),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(LevelFilter::Trace)
        // btleplug is very chatty at debug level
        .level_for("btleplug", LevelFilter::Info)
        .chain(std::io::stderr());

    if let Ok(log_file) = env::var("LOG_FILE") {
        dispatch = dispatch.chain(
            fern::log_file(log_file).expect("Failed to open LOG_FILE")
        );
    }

    dispatch.apply().expect("Failed to initialize logger");
    set_log_level(level);
}

pub fn set_log_level(level: LevelFilter) {
    log::set_max_level(level);
}
