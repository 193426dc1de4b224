//! Contains a collection of functions that are called at the start of the program.

use std::panic;

use log::LevelFilter;

pub fn setup_logger(log_level: &str) {
    let mut log_builder = env_logger::Builder::new();

    log_builder
        // Timestamp in millis
        .format_timestamp_millis()
        // Parse user defined log level configuration
        .parse_filters(log_level)
        // h2 and tonic's transport layer are very verbose and this node
        // talks to many peers, so keep them quiet unless something breaks.
        .filter_module("h2", LevelFilter::Error)
        .filter_module("tower", LevelFilter::Warn);

    log_builder.init();
}

pub fn setup_panic_hook() {
    panic::set_hook(Box::new(move |panic_info| {
        let loc = if let Some(loc) = panic_info.location() {
            format!(" in file {} at line {}", loc.file(), loc.line())
        } else {
            String::new()
        };
        let message = if let Some(s) = panic_info.payload().downcast_ref::<&str>() {
            s
        } else if let Some(s) = panic_info.payload().downcast_ref::<String>() {
            s
        } else {
            "Payload not captured as it is not a string."
        };
        log::error!("Panic occurred{loc}: {message}");
    }));
}
