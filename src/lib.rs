// src/lib.rs

// Modules publics, utilisés par le binaire `account_watcher`.
pub mod config;
pub mod decoders;
pub mod error;
pub mod feed;
pub mod filtering;
pub mod history;
pub mod lifecycle;
pub mod monitoring;
pub mod reconciler;
pub mod rpc;
pub mod state;
pub mod watcher;

#[cfg(test)]
mod testing;

pub use error::{WatchError, WatchResult};
