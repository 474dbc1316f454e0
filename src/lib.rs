pub mod auth;
pub mod catalog;
pub mod config;
pub mod engine;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod payment;
pub mod pricing;
pub mod sql;
pub mod sweeper;
pub mod tls;
pub mod wal;
pub mod wire;
