pub mod api;
pub mod engine;
pub mod identity;
pub mod limits;
pub mod model;
pub mod observability;
pub mod payment;
pub mod reaper;
pub mod wal;
