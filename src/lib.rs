pub mod core;

pub use core::{
    config::{ClientSettings, ConfigError},
    errors::{ErrorClass, RelayError},
    kernel::{RelayClient, RelayClientBuilder, StreamSubscription},
    types::*,
};
