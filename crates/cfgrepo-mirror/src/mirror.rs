//! Mirror configuration documents.
//!
//! Each mirror is a JSON document in its project's meta repository at
//! `/repos/<localRepo>/mirrors/<id>.json`. It links a directory of a local
//! repository with a directory on a branch of a remote Git repository.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use cfgrepo_meta::project::is_reserved_repository;
use cfgrepo_meta::types::validate_name;
use cfgrepo_meta::{Author, EntryContent, PathPattern, Revision, VersionedRepository};
use cron::Schedule;
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};

use crate::config::MirroringServicePluginConfig;
use crate::error::MirrorError;

/// Pattern matching every mirror document in a meta repository.
pub const MIRRORS_PATTERN: &str = "/repos/*/mirrors/*.json";

const DEFAULT_BRANCH: &str = "master";

/// Path of a mirror document.
pub fn mirror_file(local_repo: &str, id: &str) -> String {
    format!("/repos/{}/mirrors/{}.json", local_repo, id)
}

/// Which way content flows.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MirrorDirection {
    /// Local repository content is pushed to the remote.
    LocalToRemote,
    /// Remote content is committed to the local repository.
    RemoteToLocal,
    /// Local to remote, then remote to local.
    Both,
}

impl fmt::Display for MirrorDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MirrorDirection::LocalToRemote => f.write_str("LOCAL_TO_REMOTE"),
            MirrorDirection::RemoteToLocal => f.write_str("REMOTE_TO_LOCAL"),
            MirrorDirection::Both => f.write_str("BOTH"),
        }
    }
}

/// Exclusion rules in gitignore syntax, given either as one
/// newline-separated string or as a list of lines.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GitignoreRules {
    /// Newline-separated rules.
    Text(String),
    /// One rule per element.
    Lines(Vec<String>),
}

impl GitignoreRules {
    fn lines(&self) -> Vec<&str> {
        match self {
            GitignoreRules::Text(text) => text.lines().collect(),
            GitignoreRules::Lines(lines) => lines.iter().map(String::as_str).collect(),
        }
    }
}

fn default_enabled() -> bool {
    true
}

fn default_type() -> String {
    "single".to_string()
}

fn default_local_path() -> String {
    "/".to_string()
}

/// A mirror document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MirrorConfig {
    /// Unique within the project.
    pub id: String,
    /// Disabled mirrors are never run.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Mirror kind. Only `single` is defined.
    #[serde(rename = "type", default = "default_type")]
    pub mirror_type: String,
    /// Which way content flows.
    pub direction: MirrorDirection,
    /// Local repository name.
    pub local_repo: String,
    /// Directory within the local repository.
    #[serde(default = "default_local_path")]
    pub local_path: String,
    /// `git+<scheme>://<host>/<repo>.git[/<path>][#<branch>]`
    pub remote_uri: String,
    /// Quartz-style cron expression with a seconds field. Absent means
    /// every scheduler tick.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,
    /// Paths excluded from mirroring.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gitignore: Option<GitignoreRules>,
    /// Credential used to reach the remote.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential_name: Option<String>,
    /// Zone the mirror is pinned to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zone: Option<String>,
    /// Author of commits made by this mirror.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<Author>,
}

impl MirrorConfig {
    /// Checks names, paths and the remote URI.
    pub fn validate(&self) -> Result<(), MirrorError> {
        validate_name("mirror", &self.id).map_err(|e| MirrorError::InvalidConfig(e.to_string()))?;
        validate_name("repository", &self.local_repo)
            .map_err(|e| MirrorError::InvalidConfig(e.to_string()))?;
        if is_reserved_repository(&self.local_repo) {
            return Err(MirrorError::InvalidConfig(format!(
                "cannot mirror reserved repository '{}'",
                self.local_repo
            )));
        }
        if self.mirror_type != "single" {
            return Err(MirrorError::InvalidConfig(format!(
                "unsupported mirror type '{}'",
                self.mirror_type
            )));
        }
        normalize_dir(&self.local_path)?;
        RemoteSpec::parse(&self.remote_uri)?;
        self.ignore_rules()?;
        self.cron_schedule()?;
        Ok(())
    }

    /// The parsed `schedule`.
    pub fn cron_schedule(&self) -> Result<Option<Schedule>, MirrorError> {
        self.schedule.as_deref().map(parse_schedule).transpose()
    }

    /// The remote this mirror talks to.
    pub fn remote(&self) -> Result<RemoteSpec, MirrorError> {
        RemoteSpec::parse(&self.remote_uri)
    }

    /// The local directory, normalised to start and end with `/`.
    pub fn local_dir(&self) -> Result<String, MirrorError> {
        normalize_dir(&self.local_path)
    }

    /// Compiled exclusion rules.
    pub fn ignore_rules(&self) -> Result<IgnoreRules, MirrorError> {
        match &self.gitignore {
            Some(rules) => IgnoreRules::parse(&rules.lines()),
            None => Ok(IgnoreRules::default()),
        }
    }

    /// Author of this mirror's commits: the mirror's own author, else the
    /// plugin default, else the built-in mirror identity.
    pub fn resolve_author(&self, plugin: &MirroringServicePluginConfig) -> Author {
        self.author
            .clone()
            .or_else(|| plugin.default_mirror_author.clone())
            .unwrap_or_else(Author::mirror)
    }

    /// Parses a mirror document.
    pub fn from_entry(content: &EntryContent) -> Result<Self, MirrorError> {
        let value = content
            .as_json()
            .ok_or_else(|| MirrorError::InvalidConfig("mirror document is not JSON".to_string()))?;
        let config: MirrorConfig = serde_json::from_value(value.clone())
            .map_err(|e| MirrorError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }
}

/// Parses a cron expression. `?` ("no specific value") reads as `*`.
pub fn parse_schedule(expr: &str) -> Result<Schedule, MirrorError> {
    Schedule::from_str(&expr.replace('?', "*"))
        .map_err(|e| MirrorError::InvalidConfig(format!("schedule '{}': {}", expr, e)))
}

fn normalize_dir(path: &str) -> Result<String, MirrorError> {
    if !path.starts_with('/') {
        return Err(MirrorError::InvalidConfig(format!(
            "path must be absolute: {}",
            path
        )));
    }
    if path
        .split('/')
        .skip(1)
        .any(|seg| seg == "." || seg == "..")
    {
        return Err(MirrorError::InvalidConfig(format!(
            "path must not contain relative segments: {}",
            path
        )));
    }
    let trimmed = path.trim_end_matches('/');
    Ok(format!("{}/", trimmed))
}

/// A parsed remote URI.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RemoteSpec {
    /// Transport scheme, e.g. `https`, `ssh`, `file`.
    pub scheme: String,
    /// Repository URL without the `git+` prefix, path or branch.
    pub repo_uri: String,
    /// Directory within the remote tree, starting and ending with `/`.
    pub path: String,
    /// Branch name.
    pub branch: String,
}

impl RemoteSpec {
    /// Parses `git+<scheme>://<host>/<repo>.git[/<path>][#<branch>]`.
    pub fn parse(uri: &str) -> Result<Self, MirrorError> {
        let invalid = |reason: &str| MirrorError::InvalidConfig(format!("remote URI {}: {}", uri, reason));

        let rest = uri
            .strip_prefix("git+")
            .ok_or_else(|| invalid("must start with git+"))?;
        let (rest, branch) = match rest.split_once('#') {
            Some((_, "")) => return Err(invalid("empty branch")),
            Some((r, b)) => (r, b.to_string()),
            None => (rest, DEFAULT_BRANCH.to_string()),
        };
        let (scheme, _) = rest
            .split_once("://")
            .ok_or_else(|| invalid("missing scheme"))?;
        if scheme.is_empty() {
            return Err(invalid("missing scheme"));
        }

        let mut split = None;
        let mut search = 0;
        while let Some(pos) = rest[search..].find(".git") {
            let end = search + pos + ".git".len();
            if end == rest.len() || rest.as_bytes()[end] == b'/' {
                split = Some(end);
                break;
            }
            search = end;
        }
        let end = split.ok_or_else(|| invalid("repository must end with .git"))?;
        let path = match &rest[end..] {
            "" => "/".to_string(),
            p => normalize_dir(p)?,
        };

        Ok(Self {
            scheme: scheme.to_string(),
            repo_uri: rest[..end].to_string(),
            path,
            branch,
        })
    }
}

impl fmt::Display for RemoteSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}#{}", self.repo_uri, self.path.trim_end_matches('/'), self.branch)
    }
}

struct IgnoreRule {
    matcher: GlobSet,
    negated: bool,
}

/// Gitignore-style exclusion rules. The last matching rule wins; `!`
/// re-includes a path.
#[derive(Default)]
pub struct IgnoreRules {
    rules: Vec<IgnoreRule>,
}

impl IgnoreRules {
    /// Compiles rule lines. Blank lines and `#` comments are skipped.
    pub fn parse(lines: &[&str]) -> Result<Self, MirrorError> {
        let mut rules = Vec::new();
        for line in lines {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (negated, pattern) = match line.strip_prefix('!') {
                Some(p) => (true, p),
                None => (false, line),
            };
            let pattern = pattern.trim_end_matches('/');
            if pattern.is_empty() {
                continue;
            }
            let anchored = if pattern.starts_with('/') {
                pattern.to_string()
            } else if pattern.contains('/') {
                format!("/{}", pattern)
            } else {
                format!("/**/{}", pattern)
            };

            let mut builder = GlobSetBuilder::new();
            for glob in [anchored.clone(), format!("{}/**", anchored)] {
                builder.add(
                    GlobBuilder::new(&glob)
                        .literal_separator(true)
                        .build()
                        .map_err(|e| MirrorError::InvalidConfig(format!("gitignore rule {}: {}", line, e)))?,
                );
            }
            rules.push(IgnoreRule {
                matcher: builder
                    .build()
                    .map_err(|e| MirrorError::InvalidConfig(format!("gitignore rule {}: {}", line, e)))?,
                negated,
            });
        }
        Ok(Self { rules })
    }

    /// Returns true if `path` (relative to the mirror root, starting with
    /// `/`) is excluded.
    pub fn is_ignored(&self, path: &str) -> bool {
        self.rules
            .iter()
            .rev()
            .find(|rule| rule.matcher.is_match(path))
            .map(|rule| !rule.negated)
            .unwrap_or(false)
    }

    /// Number of compiled rules.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Returns true if nothing is excluded.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Result of reading mirror documents: the valid ones plus the paths of
/// documents that could not be used.
#[derive(Debug, Default)]
pub struct LoadedMirrors {
    /// Parsed, valid mirrors.
    pub mirrors: Vec<MirrorConfig>,
    /// Documents that failed to parse or validate.
    pub invalid: Vec<(String, MirrorError)>,
}

/// Reads every mirror document from a meta repository at its head.
pub fn load_mirrors(meta: &VersionedRepository) -> Result<LoadedMirrors, MirrorError> {
    let pattern = PathPattern::parse(MIRRORS_PATTERN)?;
    let mut loaded = LoadedMirrors::default();
    let mut seen = BTreeMap::new();
    for entry in meta.find(Revision::HEAD, &pattern)? {
        match MirrorConfig::from_entry(&entry.content) {
            Ok(mirror) => {
                if let Some(previous) = seen.insert(mirror.id.clone(), entry.path.clone()) {
                    loaded.invalid.push((
                        entry.path,
                        MirrorError::InvalidConfig(format!(
                            "duplicate mirror id '{}' (also in {})",
                            mirror.id, previous
                        )),
                    ));
                    continue;
                }
                loaded.mirrors.push(mirror);
            }
            Err(e) => loaded.invalid.push((entry.path, e)),
        }
    }
    Ok(loaded)
}
