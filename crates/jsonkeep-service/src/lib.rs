//! The request coalescing cache refresh service behind the `jsonkeep` server.

#[macro_use]
pub mod metrics;

pub mod config;
pub mod fetch;
pub mod keep;
pub mod logging;
pub mod store;
pub mod utils;

#[cfg(test)]
mod test;
