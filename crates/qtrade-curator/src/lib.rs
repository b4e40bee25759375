pub mod config;
pub mod daemon;
pub mod error;

pub use config::CuratorConfig;
pub use daemon::Daemon;
pub use error::CuratorError;
