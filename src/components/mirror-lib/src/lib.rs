mod canonical_store;
mod config;
mod def;
mod entity_service;
mod error;
mod id_assigner;
mod log_util;
mod shard_conn;
mod shard_locator;
mod sync_scheduler;

pub use canonical_store::*;
pub use config::*;
pub use def::*;
pub use entity_service::*;
pub use error::*;
pub use id_assigner::*;
pub use log_util::*;
pub use shard_conn::*;
pub use shard_locator::*;
pub use sync_scheduler::*;

#[cfg(test)]
mod test_support;

#[macro_use]
extern crate log;
