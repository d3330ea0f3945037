//! Kryształkowo gallery cache daemon
//!
//! Caches gallery images and listing metadata on the local machine and
//! issues account activation codes by email.

pub mod activation;
pub mod cache;
pub mod clock;
pub mod config;
pub mod fetch;
pub mod ipc;
