pub mod config;
pub mod core;
pub mod dump;
pub mod error;
pub mod handler;
pub mod management;
pub mod stream;

pub use config::{ConfigStore, ConfigUpdateError, GatewayConfig};
pub use core::{Gateway, GatewayState};
pub use error::ProxyError;
pub use stream::{LineReconstructor, reframe};
