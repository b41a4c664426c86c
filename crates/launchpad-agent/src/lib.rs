pub mod api;
pub mod config;
pub mod error;
pub mod host;
pub mod logs;
pub mod observe;
pub mod os;
pub mod ports;
pub mod registry;
pub mod supervisor;
