pub mod canonical;
pub mod client;
pub mod config;
pub mod digest;
pub mod instrument;
pub mod layout;
pub mod logging;
pub mod memory;
pub mod mock;
pub mod model;
pub mod query;
pub mod storage;

pub use client::{Client, InstrumentedClient, instrument};
pub use config::{Mode, RecordingConfig};
pub use model::{Model, Schema};
