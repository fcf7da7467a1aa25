//! Quakecli.
//!
//! A command line client that lists the earthquakes of the configured USGS feed, together with
//! the locations of the most recent ones.

#![warn(missing_debug_implementations, clippy::all)]

mod cli;
mod logging;
mod output;

fn main() {
    match cli::execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}
