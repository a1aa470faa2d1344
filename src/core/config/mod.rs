pub mod data;
pub mod io;

pub use data::{path_display, Config, McpServerConfig, ProviderConfig, TurnSettings};
pub use io::ConfigError;
