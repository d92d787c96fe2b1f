//! Route handlers (spec §6), one module per endpoint family.

pub mod chat;
pub mod health;
pub mod models;
pub mod props;
