pub mod catalog;
pub mod chat;
pub mod config;
pub mod engine;
pub mod error;
pub mod history;
pub mod model;
pub mod offer;
pub mod outbox;
pub mod rating;
pub mod service_run;
pub mod settlement;
pub mod store;
pub mod time;
pub mod trade;
pub mod utils;

pub use engine::Engine;
pub use error::{Result, SettlementError};
