//! Replicated mutation commands.
//!
//! Commands are the only way state changes. They are encoded as JSON into
//! the Raft log and applied in log order on every replica, so a command's
//! timestamp and author travel with it instead of being taken at apply time.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::MetaError;
use crate::project::{is_reserved_repository, ProjectManager, SYSTEM_PROJECT};
use crate::repository::CommitOutcome;
use crate::types::{now_millis, validate_name, Author, Change, CommitResult, Revision};

/// A state mutation, serialized with a `type` discriminator.
///
/// `timestamp` and `author` may be absent in older encodings; they default
/// to the decode time and the system author.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum Command {
    /// Create a project with its reserved repositories.
    CreateProject {
        /// Logical time of the request
        #[serde(default = "now_millis")]
        timestamp: i64,
        /// Requesting user
        #[serde(default = "Author::system")]
        author: Author,
        /// Project to create
        project_name: String,
    },
    /// Remove a project and everything in it.
    RemoveProject {
        /// Logical time of the request
        #[serde(default = "now_millis")]
        timestamp: i64,
        /// Requesting user
        #[serde(default = "Author::system")]
        author: Author,
        /// Project to remove
        project_name: String,
    },
    /// Create a repository.
    CreateRepository {
        /// Logical time of the request
        #[serde(default = "now_millis")]
        timestamp: i64,
        /// Requesting user
        #[serde(default = "Author::system")]
        author: Author,
        /// Owning project
        project_name: String,
        /// Repository to create
        repository_name: String,
    },
    /// Remove a repository.
    RemoveRepository {
        /// Logical time of the request
        #[serde(default = "now_millis")]
        timestamp: i64,
        /// Requesting user
        #[serde(default = "Author::system")]
        author: Author,
        /// Owning project
        project_name: String,
        /// Repository to remove
        repository_name: String,
    },
    /// Commit a change set on top of a base revision.
    Push {
        /// Logical time of the request
        #[serde(default = "now_millis")]
        timestamp: i64,
        /// Requesting user
        #[serde(default = "Author::system")]
        author: Author,
        /// Owning project
        project_name: String,
        /// Target repository
        repository_name: String,
        /// Revision the change set was prepared against
        base_revision: Revision,
        /// One-line summary
        summary: String,
        /// Long description
        #[serde(default)]
        detail: String,
        /// Changes to apply
        changes: Vec<Change>,
    },
}

/// What an applied command produced.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum CommandResult {
    /// Project created
    ProjectCreated,
    /// Project removed
    ProjectRemoved,
    /// Repository created at its initial revision
    RepositoryCreated {
        /// The initial revision
        revision: Revision,
    },
    /// Repository removed
    RepositoryRemoved,
    /// Change set committed
    Pushed(CommitResult),
}

/// Outcome of applying one command, identical on every replica.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum CommandOutcome {
    /// State changed.
    Applied(CommandResult),
    /// A push that would not change content.
    Redundant,
    /// A push against a stale base revision.
    Conflict {
        /// Head at apply time
        head: Revision,
    },
}

impl CommandOutcome {
    /// Converts expected non-success outcomes into their typed errors.
    pub fn into_result(self) -> Result<CommandResult, MetaError> {
        match self {
            CommandOutcome::Applied(result) => Ok(result),
            CommandOutcome::Redundant => Err(MetaError::RedundantChange),
            CommandOutcome::Conflict { head } => Err(MetaError::Conflict { head }),
        }
    }
}

impl From<CommitOutcome> for CommandOutcome {
    fn from(outcome: CommitOutcome) -> Self {
        match outcome {
            CommitOutcome::Applied(result) => CommandOutcome::Applied(CommandResult::Pushed(result)),
            CommitOutcome::Redundant => CommandOutcome::Redundant,
            CommitOutcome::Conflict { head } => CommandOutcome::Conflict { head },
        }
    }
}

impl Command {
    /// Creates a project creation command stamped with the current time.
    pub fn create_project(author: Author, project: impl Into<String>) -> Self {
        Command::CreateProject {
            timestamp: now_millis(),
            author,
            project_name: project.into(),
        }
    }

    /// Creates a project removal command stamped with the current time.
    pub fn remove_project(author: Author, project: impl Into<String>) -> Self {
        Command::RemoveProject {
            timestamp: now_millis(),
            author,
            project_name: project.into(),
        }
    }

    /// Creates a repository creation command stamped with the current time.
    pub fn create_repository(
        author: Author,
        project: impl Into<String>,
        repository: impl Into<String>,
    ) -> Self {
        Command::CreateRepository {
            timestamp: now_millis(),
            author,
            project_name: project.into(),
            repository_name: repository.into(),
        }
    }

    /// Creates a repository removal command stamped with the current time.
    pub fn remove_repository(
        author: Author,
        project: impl Into<String>,
        repository: impl Into<String>,
    ) -> Self {
        Command::RemoveRepository {
            timestamp: now_millis(),
            author,
            project_name: project.into(),
            repository_name: repository.into(),
        }
    }

    /// Creates a push command stamped with the current time.
    pub fn push(
        author: Author,
        project: impl Into<String>,
        repository: impl Into<String>,
        base_revision: Revision,
        summary: impl Into<String>,
        changes: Vec<Change>,
    ) -> Self {
        Command::Push {
            timestamp: now_millis(),
            author,
            project_name: project.into(),
            repository_name: repository.into(),
            base_revision,
            summary: summary.into(),
            detail: String::new(),
            changes,
        }
    }

    /// Wire name of the command type.
    pub fn kind(&self) -> &'static str {
        match self {
            Command::CreateProject { .. } => "CREATE_PROJECT",
            Command::RemoveProject { .. } => "REMOVE_PROJECT",
            Command::CreateRepository { .. } => "CREATE_REPOSITORY",
            Command::RemoveRepository { .. } => "REMOVE_REPOSITORY",
            Command::Push { .. } => "PUSH",
        }
    }

    /// The project, or `project/repository`, the command acts on.
    pub fn target(&self) -> String {
        match self {
            Command::CreateProject { project_name, .. }
            | Command::RemoveProject { project_name, .. } => project_name.clone(),
            Command::CreateRepository {
                project_name,
                repository_name,
                ..
            }
            | Command::RemoveRepository {
                project_name,
                repository_name,
                ..
            }
            | Command::Push {
                project_name,
                repository_name,
                ..
            } => format!("{}/{}", project_name, repository_name),
        }
    }

    /// The requesting user.
    pub fn author(&self) -> &Author {
        match self {
            Command::CreateProject { author, .. }
            | Command::RemoveProject { author, .. }
            | Command::CreateRepository { author, .. }
            | Command::RemoveRepository { author, .. }
            | Command::Push { author, .. } => author,
        }
    }

    /// The logical timestamp in milliseconds.
    pub fn timestamp(&self) -> i64 {
        match self {
            Command::CreateProject { timestamp, .. }
            | Command::RemoveProject { timestamp, .. }
            | Command::CreateRepository { timestamp, .. }
            | Command::RemoveRepository { timestamp, .. }
            | Command::Push { timestamp, .. } => *timestamp,
        }
    }

    /// Rejects commands that can never apply, before they are replicated.
    pub fn validate(&self) -> Result<(), MetaError> {
        match self {
            Command::CreateProject { project_name, .. }
            | Command::RemoveProject { project_name, .. } => validate_name("project", project_name),
            Command::CreateRepository {
                project_name,
                repository_name,
                ..
            }
            | Command::RemoveRepository {
                project_name,
                repository_name,
                ..
            } => {
                validate_project_target(project_name)?;
                validate_name("repository", repository_name)?;
                if is_reserved_repository(repository_name) {
                    return Err(MetaError::Validation(format!(
                        "repository name is reserved: {}",
                        repository_name
                    )));
                }
                Ok(())
            }
            Command::Push {
                project_name,
                repository_name,
                base_revision,
                changes,
                ..
            } => {
                validate_project_target(project_name)?;
                validate_name("repository", repository_name)?;
                if base_revision.as_i64() == 0 {
                    return Err(MetaError::Validation("revision 0 is not valid".to_string()));
                }
                if changes.is_empty() {
                    return Err(MetaError::Validation("push has no changes".to_string()));
                }
                for change in changes {
                    change.validate()?;
                }
                Ok(())
            }
        }
    }

    /// Applies the command to local state.
    pub fn apply(&self, projects: &ProjectManager) -> Result<CommandOutcome, MetaError> {
        let result = match self {
            Command::CreateProject {
                timestamp,
                author,
                project_name,
            } => {
                projects.create(project_name, *timestamp, author)?;
                CommandResult::ProjectCreated
            }
            Command::RemoveProject { project_name, .. } => {
                projects.remove(project_name)?;
                CommandResult::ProjectRemoved
            }
            Command::CreateRepository {
                timestamp,
                author,
                project_name,
                repository_name,
            } => {
                let revision =
                    projects.create_repository(project_name, repository_name, *timestamp, author)?;
                CommandResult::RepositoryCreated { revision }
            }
            Command::RemoveRepository {
                timestamp,
                author,
                project_name,
                repository_name,
            } => {
                projects.remove_repository(project_name, repository_name, *timestamp, author)?;
                CommandResult::RepositoryRemoved
            }
            Command::Push {
                timestamp,
                author,
                project_name,
                repository_name,
                base_revision,
                summary,
                detail,
                changes,
            } => {
                return projects
                    .push(
                        project_name,
                        repository_name,
                        *base_revision,
                        *timestamp,
                        author,
                        summary,
                        detail,
                        changes.clone(),
                    )
                    .map(CommandOutcome::from)
            }
        };
        Ok(CommandOutcome::Applied(result))
    }
}

fn validate_project_target(project: &str) -> Result<(), MetaError> {
    if project == SYSTEM_PROJECT {
        return Ok(());
    }
    validate_name("project", project)
}

/// A command paired with the ID used to deduplicate retries.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicatedCommand {
    /// Client-chosen or generated request ID
    pub request_id: Uuid,
    /// The command
    pub command: Command,
}

impl ReplicatedCommand {
    /// Wraps a command with a fresh request ID.
    pub fn new(command: Command) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            command,
        }
    }

    /// Encodes for the Raft log.
    pub fn encode(&self) -> Result<Vec<u8>, MetaError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decodes a Raft log payload.
    pub fn decode(bytes: &[u8]) -> Result<Self, MetaError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_create_repository_json_conversion() {
        let command = Command::CreateRepository {
            timestamp: 1234,
            author: Author::new("foo", "bar@baz.com"),
            project_name: "foo".to_string(),
            repository_name: "bar".to_string(),
        };
        let expected = json!({
            "type": "CREATE_REPOSITORY",
            "timestamp": 1234,
            "author": { "name": "foo", "email": "bar@baz.com" },
            "projectName": "foo",
            "repositoryName": "bar"
        });
        assert_eq!(serde_json::to_value(&command).unwrap(), expected);
        let back: Command = serde_json::from_value(expected).unwrap();
        assert_eq!(back, command);
    }

    #[test]
    fn test_missing_author_and_timestamp_default() {
        let command: Command = serde_json::from_value(json!({
            "type": "CREATE_REPOSITORY",
            "projectName": "foo",
            "repositoryName": "bar"
        }))
        .unwrap();
        assert_eq!(command.author(), &Author::system());
        assert_ne!(command.timestamp(), 0);
        assert_eq!(command.target(), "foo/bar");
    }

    #[test]
    fn test_push_json_shape() {
        let command = Command::Push {
            timestamp: 1,
            author: Author::system(),
            project_name: "foo".to_string(),
            repository_name: "bar".to_string(),
            base_revision: Revision::HEAD,
            summary: "add a".to_string(),
            detail: String::new(),
            changes: vec![Change::upsert_json("/a.json", json!({"a": 1}))],
        };
        let value = serde_json::to_value(&command).unwrap();
        assert_eq!(value["type"], "PUSH");
        assert_eq!(value["baseRevision"], -1);
        assert_eq!(value["changes"][0]["type"], "UPSERT_JSON");
        assert_eq!(command.kind(), "PUSH");
    }

    #[test]
    fn test_validate_rejects_reserved_and_bad_names() {
        let author = Author::system();
        assert!(Command::create_repository(author.clone(), "foo", "meta")
            .validate()
            .is_err());
        assert!(Command::remove_repository(author.clone(), "foo", "internal")
            .validate()
            .is_err());
        assert!(Command::create_project(author.clone(), "-bad").validate().is_err());
        assert!(Command::create_project(author.clone(), SYSTEM_PROJECT)
            .validate()
            .is_err());
        let change = || vec![Change::upsert_json("/job.json", json!({}))];
        assert!(Command::push(
            author.clone(),
            SYSTEM_PROJECT,
            "internal",
            Revision::HEAD,
            "job",
            change()
        )
        .validate()
        .is_ok());
        assert!(
            Command::push(author.clone(), "foo", "bar", Revision::new(0), "zero", change())
                .validate()
                .is_err()
        );
        assert!(
            Command::push(author, "foo", "bar", Revision::HEAD, "empty", vec![])
                .validate()
                .is_err()
        );
    }

    #[test]
    fn test_replicated_command_roundtrip() {
        let command = ReplicatedCommand::new(Command::create_project(Author::system(), "foo"));
        let bytes = command.encode().unwrap();
        assert_eq!(ReplicatedCommand::decode(&bytes).unwrap(), command);
        assert!(ReplicatedCommand::decode(b"not json").is_err());
    }

    #[test]
    fn test_outcome_into_result() {
        assert_eq!(
            CommandOutcome::Redundant.into_result(),
            Err(MetaError::RedundantChange)
        );
        assert_eq!(
            CommandOutcome::Conflict {
                head: Revision::new(3)
            }
            .into_result(),
            Err(MetaError::Conflict {
                head: Revision::new(3)
            })
        );
    }
}
