pub mod broadcaster;
pub mod dedup;
pub mod encryption;
pub mod executor;
pub mod gateway;
pub mod queue;
pub mod rate_limit;
pub mod store;
pub mod subscription;
pub mod verifier;
