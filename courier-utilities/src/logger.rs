use std::{env, path::Path, time::SystemTime};

use courier_models::errors::SendableError;
use log::{LevelFilter, info};

/// Install the process-wide logger: stdout, plus `log_file` when given.
pub fn setup_logger(level: LevelFilter, log_file: Option<&Path>) -> Result<(), SendableError> {
    let mut dispatch = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{} {} {}] {}",
                humantime::format_rfc3339_seconds(SystemTime::now()),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(level)
        .chain(std::io::stdout());

    if let Some(path) = log_file {
        dispatch = dispatch.chain(fern::log_file(path)?);
    }

    dispatch.apply()?;
    Ok(())
}

pub fn print_env() -> std::io::Result<()> {
    let path = env::current_dir()?;
    info!("The current directory is {}", path.display());
    Ok(())
}
