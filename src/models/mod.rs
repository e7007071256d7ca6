pub mod event;
pub mod job;
pub mod subject;
pub mod submit;
