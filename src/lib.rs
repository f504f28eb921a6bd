pub mod limits;
pub mod model;
pub mod observability;
pub mod provision;
pub mod scheduler;
pub mod service;
pub mod sql;
pub mod store;
pub mod view;
pub mod wal;
pub mod wire;
