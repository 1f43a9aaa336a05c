//! jsonkeep.
//!
//! jsonkeep is a caching proxy in front of a JSON HTTP upstream. Concurrent requests for the same
//! path share a single upstream fetch, and every path that was ever requested is refreshed in the
//! background once its document is older than the configured ttl.

#![warn(missing_debug_implementations, clippy::all)]

mod cli;
mod endpoints;
mod healthcheck;
mod logging;
mod server;
mod service;

fn main() {
    match cli::execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}
