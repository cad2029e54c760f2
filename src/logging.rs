use log::LevelFilter;

/// Stderr logging via fern; as PID 1 stderr is the console. Debug mode
/// overrides the configured level with trace.
pub fn setup_logging(level: &str, debug: bool) -> Result<(), fern::InitError> {
    let level = if debug {
        LevelFilter::Trace
    } else {
        match level {
            "error" => LevelFilter::Error,
            "warn" => LevelFilter::Warn,
            "debug" => LevelFilter::Debug,
            "trace" => LevelFilter::Trace,
            _ => LevelFilter::Info,
        }
    };

    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{}][{}][{}] {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.target(),
                record.level(),
                message
            ))
        })
        .level(level)
        .chain(std::io::stderr())
        .apply()?;
    Ok(())
}
