pub mod adaptor;
pub mod app;
pub mod channels;
pub mod config;
pub mod dto;
pub mod error;
pub mod frame;
pub mod handlers;
pub mod heartbeat;
pub mod pricing;
pub mod quota;
pub mod relay;
pub mod relay_info;
pub mod scanner;
pub mod settings;
pub mod tokens;
pub mod upstream;
