//! API key table loaded from the environment.
//!
//! Key generation and rotation live outside the core; this validator only
//! resolves bearer tokens against the configured table. Format of
//! `CONVEYOR_API_KEYS`: comma-separated `token:tenant:role` triples, e.g.
//! `s3cret:acme:developer,adm1n:ops:admin`.

use std::collections::HashMap;
use std::sync::Arc;

use conveyor_core::CoreError;
use conveyor_core::governor::{KeyRecord, KeyValidator, Role};

#[derive(Clone, Default)]
pub struct EnvKeyValidator {
    keys: Arc<HashMap<String, KeyRecord>>,
}

fn parse_role(raw: &str) -> Result<Role, CoreError> {
    match raw {
        "admin" => Ok(Role::Admin),
        "developer" => Ok(Role::Developer),
        "analyst" => Ok(Role::Analyst),
        "service" => Ok(Role::Service),
        other => Err(CoreError::Config(format!("unknown role '{other}'"))),
    }
}

impl EnvKeyValidator {
    pub fn parse(spec: &str) -> Result<Self, CoreError> {
        let mut keys = HashMap::new();
        for entry in spec.split(',').filter(|e| !e.trim().is_empty()) {
            let mut parts = entry.trim().splitn(3, ':');
            let (Some(token), Some(tenant), Some(role)) =
                (parts.next(), parts.next(), parts.next())
            else {
                return Err(CoreError::Config(format!(
                    "malformed API key entry '{entry}': expected token:tenant:role"
                )));
            };
            keys.insert(
                token.to_string(),
                KeyRecord {
                    key_id: format!("key-{tenant}-{role}"),
                    tenant_id: tenant.to_string(),
                    role: parse_role(role)?,
                    expires_at: None,
                },
            );
        }
        if keys.is_empty() {
            return Err(CoreError::Config(
                "CONVEYOR_API_KEYS configured no keys".into(),
            ));
        }
        Ok(Self {
            keys: Arc::new(keys),
        })
    }

    pub fn from_env() -> Result<Self, CoreError> {
        let spec = std::env::var("CONVEYOR_API_KEYS").map_err(|_| {
            CoreError::Config("CONVEYOR_API_KEYS not set. Required for authentication.".into())
        })?;
        Self::parse(&spec)
    }
}

impl KeyValidator for EnvKeyValidator {
    async fn validate(&self, credential: &str) -> Result<Option<KeyRecord>, CoreError> {
        Ok(self.keys.get(credential).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn parses_key_table() {
        let validator = EnvKeyValidator::parse("s3cret:acme:developer, adm1n:ops:admin").unwrap();

        let record = validator.validate("s3cret").await.unwrap().unwrap();
        assert_eq!(record.tenant_id, "acme");
        assert_eq!(record.role, Role::Developer);

        let record = validator.validate("adm1n").await.unwrap().unwrap();
        assert_eq!(record.role, Role::Admin);

        assert!(validator.validate("nope").await.unwrap().is_none());
    }

    #[test]
    fn rejects_malformed_entries() {
        assert!(EnvKeyValidator::parse("just-a-token").is_err());
        assert!(EnvKeyValidator::parse("t:acme:superuser").is_err());
        assert!(EnvKeyValidator::parse("").is_err());
    }
}
