mod client;
mod config;
mod messages;

pub use client::HelloClient;
pub use config::ClientConfig;
pub use messages::{Hello, UserInfo};
