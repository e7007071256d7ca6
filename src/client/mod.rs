pub mod local;
pub mod resync;
pub mod storage;
pub mod transport;
