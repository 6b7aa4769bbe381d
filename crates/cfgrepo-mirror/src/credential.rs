//! Credentials for reaching mirror remotes.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cfgrepo_meta::project::META_MARKER_TIMEOUT;
use cfgrepo_meta::{ProjectManager, Query, Revision};
use serde::{Deserialize, Serialize};

use crate::error::MirrorError;

/// Path of a credential document in a meta repository. Accepts either a
/// bare credential ID or the qualified `projects/<p>/credentials/<id>`.
pub fn credential_file(name: &str) -> String {
    let id = name.rsplit_once("/credentials/").map_or(name, |(_, id)| id);
    format!("/credentials/{}.json", id)
}

/// Qualified name of a project credential.
pub fn credential_name(project: &str, id: &str) -> String {
    format!("projects/{}/credentials/{}", project, id)
}

/// A credential document.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE", rename_all_fields = "camelCase")]
pub enum Credential {
    /// Anonymous access.
    None {
        /// Credential name
        #[serde(default)]
        name: String,
    },
    /// Username and password.
    Password {
        /// Credential name
        #[serde(default)]
        name: String,
        /// Login
        username: String,
        /// Secret
        password: String,
    },
    /// Bearer token.
    AccessToken {
        /// Credential name
        #[serde(default)]
        name: String,
        /// Secret
        access_token: String,
    },
}

impl Credential {
    /// Anonymous access under an empty name.
    pub fn anonymous() -> Self {
        Credential::None {
            name: String::new(),
        }
    }

    /// The credential's name.
    pub fn name(&self) -> &str {
        match self {
            Credential::None { name }
            | Credential::Password { name, .. }
            | Credential::AccessToken { name, .. } => name,
        }
    }

    /// Rejects credentials with empty secrets.
    pub fn validate(&self) -> Result<(), MirrorError> {
        let empty = match self {
            Credential::None { .. } => false,
            Credential::Password { username, password, .. } => username.is_empty() || password.is_empty(),
            Credential::AccessToken { access_token, .. } => access_token.is_empty(),
        };
        if empty {
            return Err(MirrorError::Credential(format!(
                "credential '{}' has an empty secret",
                self.name()
            )));
        }
        Ok(())
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::None { name } => f.debug_struct("None").field("name", name).finish(),
            Credential::Password { name, username, .. } => f
                .debug_struct("Password")
                .field("name", name)
                .field("username", username)
                .field("password", &"****")
                .finish(),
            Credential::AccessToken { name, .. } => f
                .debug_struct("AccessToken")
                .field("name", name)
                .field("access_token", &"****")
                .finish(),
        }
    }
}

/// Looks up credentials by project and name.
#[async_trait]
pub trait CredentialStore: Send + Sync + 'static {
    /// Returns the named credential of a project.
    async fn credential(&self, project: &str, name: &str) -> Result<Credential, MirrorError>;
}

/// Reads credentials from `/credentials/<id>.json` in each project's meta
/// repository.
pub struct MetaRepoCredentialStore {
    projects: Arc<ProjectManager>,
    marker_timeout: Duration,
}

impl MetaRepoCredentialStore {
    /// Creates a store over the given projects.
    pub fn new(projects: Arc<ProjectManager>) -> Self {
        Self {
            projects,
            marker_timeout: META_MARKER_TIMEOUT,
        }
    }

    /// Overrides how long to wait for a pending meta repository migration.
    pub fn with_marker_timeout(mut self, timeout: Duration) -> Self {
        self.marker_timeout = timeout;
        self
    }
}

#[async_trait]
impl CredentialStore for MetaRepoCredentialStore {
    async fn credential(&self, project: &str, name: &str) -> Result<Credential, MirrorError> {
        let meta = self
            .projects
            .get(project)?
            .resolve_meta_repository(self.marker_timeout)
            .await?;
        let path = credential_file(name);
        let entry = meta
            .get_or_none(Revision::HEAD, &Query::json(path.as_str()))?
            .ok_or_else(|| {
                MirrorError::Credential(format!("credential not found: {} ({})", name, path))
            })?;
        let value = entry.content.as_json().cloned().unwrap_or_default();
        let credential: Credential = serde_json::from_value(value)
            .map_err(|e| MirrorError::Credential(format!("malformed credential {}: {}", path, e)))?;
        credential.validate()?;
        Ok(credential)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_credential_file() {
        assert_eq!(credential_file("none"), "/credentials/none.json");
        assert_eq!(
            credential_file(&credential_name("foo", "none")),
            "/credentials/none.json"
        );
    }

    #[test]
    fn test_parse_credentials() {
        let none: Credential =
            serde_json::from_value(json!({"type": "NONE", "name": "projects/foo/credentials/none"})).unwrap();
        assert_eq!(none.name(), "projects/foo/credentials/none");

        let token: Credential =
            serde_json::from_value(json!({"type": "ACCESS_TOKEN", "name": "t", "accessToken": "abc"})).unwrap();
        assert!(matches!(token, Credential::AccessToken { ref access_token, .. } if access_token == "abc"));

        let password: Credential = serde_json::from_value(json!({
            "type": "PASSWORD", "name": "p", "username": "u", "password": ""
        }))
        .unwrap();
        assert!(matches!(password.validate(), Err(MirrorError::Credential(_))));
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let credential = Credential::AccessToken {
            name: "t".into(),
            access_token: "super-secret".into(),
        };
        assert!(!format!("{:?}", credential).contains("super-secret"));
    }
}
