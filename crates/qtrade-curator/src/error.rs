use qtrade_vault::VaultError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CuratorError {
    #[error("Vault error: {0}")]
    Vault(#[from] VaultError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
