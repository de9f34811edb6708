pub mod config;
pub mod consumer;
pub mod drain;
pub mod event;
pub mod lag;
pub mod model;
pub mod shutdown;
