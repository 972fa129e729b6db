//! Offline cache and realtime sync layer for FinderID and MCard.

pub mod cache;
pub mod config;
pub mod domain;
pub mod logging;
pub mod realtime;
pub mod remote;
pub mod sync;
