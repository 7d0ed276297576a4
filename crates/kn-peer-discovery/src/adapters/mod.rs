//! # Adapters
//!
//! Configuration loading for [`listen_udp`](crate::udp::listen_udp). The
//! transport itself lives in [`crate::udp`] and the node database backends
//! in [`crate::nodedb`].

pub mod config;

pub use config::{ConfigError, TomlConfigProvider};
