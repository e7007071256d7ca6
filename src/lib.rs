//! Carrier appointment verification service.
//!
//! Accepts verification requests for insurance producers, runs them one at a
//! time against the external verification automation, and keeps clients in
//! sync through server-sent events or status polling. The [`client`] module
//! holds the client-side session manager that survives page reloads.

pub mod app_state;
pub mod client;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod routes;
pub mod services;
