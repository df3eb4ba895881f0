use std::{env, path::Path};

use courier_models::errors::SendableError;
use log::{LevelFilter, info};

use crate::logger::{self, print_env};

pub fn startup(name: &str, level: LevelFilter, log_file: Option<&Path>) -> Result<(), SendableError> {
    unsafe {
        env::set_var("RUST_BACKTRACE", "1");
    }
    logger::setup_logger(level, log_file)?;
    log_panics::init();

    info!("--- {} ---", name);
    print_env()?;

    Ok(())
}
