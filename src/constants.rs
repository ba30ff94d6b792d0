//! Constants used throughout the framework
//!
//! This module centralizes channel names, file locations and log text so the
//! bus, the registry and the application report things consistently.

// Channel names
pub const CHANNEL_EXTERNAL: &str = "channel:external";
pub const CHANNEL_INPROC: &str = "channel:inproc";
pub const CHANNEL_MULTICAST: &str = "channel:multicast";

// Application defaults
pub const DEFAULT_APP_NAME: &str = "waltz";
pub const DEFAULT_APP_VERSION: &str = env!("CARGO_PKG_VERSION");

// Files and directories
pub const CONFIG_FILE_NAME: &str = "waltz.toml";
pub const CONFIG_DIR_NAME: &str = "waltz";
pub const LOG_FILE_NAME: &str = "waltz.log";
pub const CONFIG_GENERATED: &str = "Configuration written to";

// Logging
pub const DEFAULT_LOG_LEVEL: &str = "info";
pub const LOG_BUFFER_CAPACITY: usize = 1000;
pub const LOG_TIMESTAMP_FORMAT: &str = "%H:%M:%S%.3f";
