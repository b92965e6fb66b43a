use std::path::PathBuf;

use conveyor_core::CoreError;

/// Configuration for the database connection pool.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl DatabaseConfig {
    /// Read configuration from environment variables.
    ///
    /// - `DATABASE_URL` (required)
    /// - `DATABASE_MAX_CONNECTIONS` (optional, defaults to 5)
    pub fn from_env() -> Result<Self, CoreError> {
        let url = std::env::var("DATABASE_URL").map_err(|_| {
            CoreError::Config("DATABASE_URL not set. Required for metadata storage.".into())
        })?;

        let max_connections = match std::env::var("DATABASE_MAX_CONNECTIONS") {
            Err(_) => 5,
            Ok(raw) => {
                let parsed: u32 = raw.parse().map_err(|_| {
                    CoreError::Config(format!(
                        "Invalid DATABASE_MAX_CONNECTIONS '{raw}': must be a positive integer"
                    ))
                })?;
                if parsed == 0 {
                    return Err(CoreError::Config(
                        "DATABASE_MAX_CONNECTIONS must be at least 1".into(),
                    ));
                }
                parsed
            }
        };

        Ok(Self {
            url,
            max_connections,
        })
    }
}

/// Configuration for the filesystem blob store.
#[derive(Debug, Clone)]
pub struct BlobConfig {
    pub root: PathBuf,
}

impl BlobConfig {
    /// Read configuration from `CONVEYOR_BLOB_ROOT` (required).
    pub fn from_env() -> Result<Self, CoreError> {
        let root = std::env::var("CONVEYOR_BLOB_ROOT").map_err(|_| {
            CoreError::Config("CONVEYOR_BLOB_ROOT not set. Required for artifact storage.".into())
        })?;
        Ok(Self { root: root.into() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_database_url_is_a_config_error() {
        // Serialize env mutation within the test binary.
        let _guard = ENV_LOCK.lock().unwrap();
        unsafe {
            std::env::remove_var("DATABASE_URL");
        }
        let err = DatabaseConfig::from_env().unwrap_err();
        assert!(matches!(err, CoreError::Config(_)));
    }

    #[test]
    fn max_connections_parses_and_validates() {
        let _guard = ENV_LOCK.lock().unwrap();
        unsafe {
            std::env::set_var("DATABASE_URL", "postgres://localhost/conveyor");
            std::env::set_var("DATABASE_MAX_CONNECTIONS", "12");
        }
        let config = DatabaseConfig::from_env().unwrap();
        assert_eq!(config.max_connections, 12);

        unsafe {
            std::env::set_var("DATABASE_MAX_CONNECTIONS", "0");
        }
        assert!(DatabaseConfig::from_env().is_err());

        unsafe {
            std::env::set_var("DATABASE_MAX_CONNECTIONS", "lots");
        }
        assert!(DatabaseConfig::from_env().is_err());

        unsafe {
            std::env::remove_var("DATABASE_MAX_CONNECTIONS");
            std::env::remove_var("DATABASE_URL");
        }
    }

    static ENV_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
}
