//! roomd — a room-booking scheduling engine speaking the Postgres wire
//! protocol. Conflict validation, same-day and role cutoffs, and the
//! transactional consistency contract live in [`engine`].

pub mod auth;
pub mod engine;
pub mod limits;
pub mod maintenance;
pub mod model;
pub mod notify;
pub mod observability;
pub mod sql;
pub mod tenant;
pub mod tls;
pub mod wal;
pub mod wire;
