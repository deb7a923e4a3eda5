//! slotwire — expert slot-booking over the Postgres wire protocol.
//!
//! Experts publish weekly recurring availability and date-specific slot
//! overrides; users claim slots; experts accept or reject claims with
//! single-winner semantics. Any Postgres client is a slotwire client:
//! state mutations are INSERT/UPDATE/DELETE against a handful of virtual
//! tables, durably journaled and served from memory behind per-expert
//! locks.

pub mod auth;
pub mod compactor;
pub mod directory;
pub mod engine;
pub mod journal;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod sql;
pub mod tenant;
pub mod tls;
pub mod wire;
