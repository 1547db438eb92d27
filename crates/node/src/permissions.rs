//! Token, role and path-rule access control.
//!
//! A bearer token is bound to a [`Role`]; a role owns an ordered list of
//! [`PermissionRule`]s. [`PermissionCache::check_access`] evaluates a request
//! fail-closed:
//!
//! 1. token not bound to a role: `Blocked`
//! 2. role without rules: `Blocked`
//! 3. `Allowed` only if some rule grants the action and either names the path
//!    exactly or is recursive (`use_all`) and names an ancestor of it.
//!
//! Paths are compared segment by segment after lexical normalization, so a
//! rule for `/doc` never covers `/docs2`. Store failures also yield `Blocked`.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, RwLock};

use anyhow::{Context, Result};
use protocol::ProtocolError;
use serde::{Deserialize, Serialize};

// ============================================================================
// Model
// ============================================================================

/// An operation a rule can grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Read,
    Write,
    Remove,
    Rename,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Read => "read",
            Action::Write => "write",
            Action::Remove => "remove",
            Action::Rename => "rename",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "read" => Ok(Action::Read),
            "write" => Ok(Action::Write),
            "remove" => Ok(Action::Remove),
            "rename" => Ok(Action::Rename),
            other => Err(format!("unknown action: {}", other)),
        }
    }
}

/// Result of an access check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Blocked,
    Allowed,
}

impl Access {
    pub fn is_allowed(self) -> bool {
        self == Access::Allowed
    }
}

/// A named group of rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub comment: String,
    #[serde(default)]
    pub sort_order: i32,
}

/// One path grant belonging to a role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionRule {
    pub id: i64,
    pub path: String,
    /// Also covers every descendant of `path`.
    #[serde(default)]
    pub use_all: bool,
    #[serde(default)]
    pub read: bool,
    #[serde(default)]
    pub write: bool,
    #[serde(default)]
    pub remove: bool,
    #[serde(default)]
    pub rename: bool,
    pub role_id: i64,
    #[serde(default)]
    pub sort_order: i32,
    #[serde(default)]
    pub comment: String,
}

impl PermissionRule {
    /// Rule granting nothing yet; set flags with the builder methods.
    pub fn new(id: i64, role_id: i64, path: impl Into<String>) -> Self {
        Self {
            id,
            path: path.into(),
            use_all: false,
            read: false,
            write: false,
            remove: false,
            rename: false,
            role_id,
            sort_order: 0,
            comment: String::new(),
        }
    }

    pub fn recursive(mut self) -> Self {
        self.use_all = true;
        self
    }

    pub fn grant(mut self, action: Action) -> Self {
        match action {
            Action::Read => self.read = true,
            Action::Write => self.write = true,
            Action::Remove => self.remove = true,
            Action::Rename => self.rename = true,
        }
        self
    }

    pub fn grants(&self, action: Action) -> bool {
        match action {
            Action::Read => self.read,
            Action::Write => self.write,
            Action::Remove => self.remove,
            Action::Rename => self.rename,
        }
    }

    /// Whether this rule covers the already-normalized `path`.
    pub fn covers(&self, path: &str) -> bool {
        let Some(rule_path) = normalize_path(&self.path) else {
            return false;
        };
        if rule_path == path {
            return true;
        }
        self.use_all && is_descendant(path, &rule_path)
    }
}

/// A token's role assignment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenBinding {
    pub token: String,
    pub role_id: i64,
}

// ============================================================================
// Path handling
// ============================================================================

/// Lexically normalize a path: unify separators, drop `.` and empty segments,
/// resolve `..`. Returns `None` if the path climbs above its root.
pub fn normalize_path(path: &str) -> Option<String> {
    let unified = path.replace('\\', "/");
    let absolute = unified.starts_with('/');

    let mut segments: Vec<&str> = Vec::new();
    for segment in unified.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop()?;
            }
            other => segments.push(other),
        }
    }

    let joined = segments.join("/");
    Some(if absolute {
        format!("/{}", joined)
    } else {
        joined
    })
}

/// Segment-wise strict descendant test on normalized paths.
fn is_descendant(path: &str, ancestor: &str) -> bool {
    let path_segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    let ancestor_segments: Vec<&str> = ancestor.split('/').filter(|s| !s.is_empty()).collect();

    if path.starts_with('/') != ancestor.starts_with('/') {
        return false;
    }
    path_segments.len() > ancestor_segments.len()
        && path_segments
            .iter()
            .zip(&ancestor_segments)
            .all(|(a, b)| a == b)
}

// ============================================================================
// Store contract
// ============================================================================

/// Query/update contract of the backing role/rule store.
pub trait PermissionStore: Send + Sync {
    fn role_for_token(&self, token: &str) -> Result<Option<Role>>;
    fn rules_for_role(&self, role_id: i64) -> Result<Vec<PermissionRule>>;
    fn roles(&self) -> Result<Vec<Role>>;
    fn bind_token(&self, token: &str, role_id: i64) -> Result<()>;
    fn upsert_role(&self, role: Role) -> Result<()>;
    fn upsert_rule(&self, rule: PermissionRule) -> Result<()>;
    /// Returns whether a rule was removed.
    fn remove_rule(&self, rule_id: i64) -> Result<bool>;
}

/// On-disk layout of [`JsonPermissionStore`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct PermissionData {
    #[serde(default = "default_version")]
    version: u32,
    #[serde(default)]
    roles: Vec<Role>,
    #[serde(default)]
    rules: Vec<PermissionRule>,
    #[serde(default)]
    tokens: Vec<TokenBinding>,
}

fn default_version() -> u32 {
    1
}

/// JSON-file-backed [`PermissionStore`].
///
/// Every mutation is written back atomically (temp file, then rename) when
/// the store has a path.
pub struct JsonPermissionStore {
    path: Option<PathBuf>,
    data: RwLock<PermissionData>,
}

impl JsonPermissionStore {
    /// Store persisting to `path`. Call [`JsonPermissionStore::load`] to read it.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: Some(path.as_ref().to_path_buf()),
            data: RwLock::new(PermissionData {
                version: 1,
                ..Default::default()
            }),
        }
    }

    /// Store that is never persisted.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            data: RwLock::new(PermissionData::default()),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Load from disk. A missing file leaves the store empty.
    pub fn load(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if !path.exists() {
            tracing::debug!("Permissions file not found at {:?}, starting empty", path);
            return Ok(());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read permissions: {}", path.display()))?;
        let loaded: PermissionData = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse permissions: {}", path.display()))?;

        let mut data = self
            .data
            .write()
            .map_err(|_| anyhow::anyhow!("Failed to acquire write lock on permissions"))?;
        tracing::info!(
            roles = loaded.roles.len(),
            rules = loaded.rules.len(),
            tokens = loaded.tokens.len(),
            "Loaded permissions from {:?}",
            path
        );
        *data = loaded;
        Ok(())
    }

    fn save(&self, data: &PermissionData) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create permissions directory: {}", parent.display())
            })?;
        }

        let contents =
            serde_json::to_string_pretty(data).context("Failed to serialize permissions")?;
        let temp_path = path.with_extension("json.tmp");
        fs::write(&temp_path, &contents).with_context(|| {
            format!("Failed to write temp permissions: {}", temp_path.display())
        })?;
        fs::rename(&temp_path, path).with_context(|| {
            format!(
                "Failed to rename temp permissions {} to {}",
                temp_path.display(),
                path.display()
            )
        })?;
        Ok(())
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, PermissionData>> {
        self.data
            .read()
            .map_err(|_| anyhow::anyhow!("Failed to acquire read lock on permissions"))
    }

    fn mutate<T>(&self, f: impl FnOnce(&mut PermissionData) -> Result<T>) -> Result<T> {
        let mut data = self
            .data
            .write()
            .map_err(|_| anyhow::anyhow!("Failed to acquire write lock on permissions"))?;
        let out = f(&mut data)?;
        self.save(&data)?;
        Ok(out)
    }
}

impl PermissionStore for JsonPermissionStore {
    fn role_for_token(&self, token: &str) -> Result<Option<Role>> {
        let data = self.read()?;
        let Some(binding) = data.tokens.iter().find(|b| b.token == token) else {
            return Ok(None);
        };
        Ok(data.roles.iter().find(|r| r.id == binding.role_id).cloned())
    }

    fn rules_for_role(&self, role_id: i64) -> Result<Vec<PermissionRule>> {
        let data = self.read()?;
        let mut rules: Vec<PermissionRule> = data
            .rules
            .iter()
            .filter(|r| r.role_id == role_id)
            .cloned()
            .collect();
        rules.sort_by_key(|r| (r.sort_order, r.id));
        Ok(rules)
    }

    fn roles(&self) -> Result<Vec<Role>> {
        let mut roles = self.read()?.roles.clone();
        roles.sort_by_key(|r| (r.sort_order, r.id));
        Ok(roles)
    }

    fn bind_token(&self, token: &str, role_id: i64) -> Result<()> {
        self.mutate(|data| {
            if !data.roles.iter().any(|r| r.id == role_id) {
                anyhow::bail!("cannot bind token to unknown role {}", role_id);
            }
            data.tokens.retain(|b| b.token != token);
            data.tokens.push(TokenBinding {
                token: token.to_string(),
                role_id,
            });
            Ok(())
        })
    }

    fn upsert_role(&self, role: Role) -> Result<()> {
        self.mutate(|data| {
            match data.roles.iter_mut().find(|r| r.id == role.id) {
                Some(existing) => *existing = role,
                None => data.roles.push(role),
            }
            Ok(())
        })
    }

    fn upsert_rule(&self, rule: PermissionRule) -> Result<()> {
        self.mutate(|data| {
            if !data.roles.iter().any(|r| r.id == rule.role_id) {
                anyhow::bail!("rule {} references unknown role {}", rule.id, rule.role_id);
            }
            match data.rules.iter_mut().find(|r| r.id == rule.id) {
                Some(existing) => *existing = rule,
                None => data.rules.push(rule),
            }
            Ok(())
        })
    }

    fn remove_rule(&self, rule_id: i64) -> Result<bool> {
        self.mutate(|data| {
            let before = data.rules.len();
            data.rules.retain(|r| r.id != rule_id);
            Ok(data.rules.len() != before)
        })
    }
}

// ============================================================================
// Cache and evaluation
// ============================================================================

#[derive(Debug, Default)]
struct Snapshot {
    /// Memoized bound tokens. Unbound lookups are never recorded, so the
    /// map cannot be grown by presenting junk tokens.
    tokens: HashMap<String, i64>,
    /// Rules per role, sorted by `sort_order`.
    rules: HashMap<i64, Vec<PermissionRule>>,
}

/// Read-mostly in-memory view over a [`PermissionStore`].
pub struct PermissionCache {
    store: Arc<dyn PermissionStore>,
    snapshot: RwLock<Snapshot>,
}

impl PermissionCache {
    pub fn new(store: Arc<dyn PermissionStore>) -> Self {
        Self {
            store,
            snapshot: RwLock::new(Snapshot::default()),
        }
    }

    /// The wrapped store. Call [`PermissionCache::refresh`] after mutating it.
    pub fn store(&self) -> &Arc<dyn PermissionStore> {
        &self.store
    }

    /// Drop cached lookups and reload rules for every role.
    pub fn refresh(&self) -> Result<()> {
        let mut rules = HashMap::new();
        for role in self.store.roles()? {
            rules.insert(role.id, self.store.rules_for_role(role.id)?);
        }
        let mut snapshot = self
            .snapshot
            .write()
            .map_err(|_| anyhow::anyhow!("Failed to acquire write lock on permission cache"))?;
        *snapshot = Snapshot {
            tokens: HashMap::new(),
            rules,
        };
        tracing::debug!(roles = snapshot.rules.len(), "Permission cache refreshed");
        Ok(())
    }

    fn role_id(&self, token: &str) -> Result<Option<i64>> {
        if let Ok(snapshot) = self.snapshot.read() {
            if let Some(cached) = snapshot.tokens.get(token) {
                return Ok(Some(*cached));
            }
        }
        let role_id = self.store.role_for_token(token)?.map(|r| r.id);
        if let Some(id) = role_id {
            if let Ok(mut snapshot) = self.snapshot.write() {
                snapshot.tokens.insert(token.to_string(), id);
            }
        }
        Ok(role_id)
    }

    fn rules(&self, role_id: i64) -> Result<Vec<PermissionRule>> {
        if let Ok(snapshot) = self.snapshot.read() {
            if let Some(rules) = snapshot.rules.get(&role_id) {
                return Ok(rules.clone());
            }
        }
        let rules = self.store.rules_for_role(role_id)?;
        if let Ok(mut snapshot) = self.snapshot.write() {
            snapshot.rules.insert(role_id, rules.clone());
        }
        Ok(rules)
    }

    /// Evaluate `action` on `path` for `token`.
    pub fn check_access(&self, token: &str, path: &str, action: Action) -> Access {
        match self.evaluate(token, path, action) {
            Ok(access) => access,
            Err(e) => {
                tracing::warn!(%action, path, "Permission lookup failed, blocking: {:#}", e);
                Access::Blocked
            }
        }
    }

    fn evaluate(&self, token: &str, path: &str, action: Action) -> Result<Access> {
        let Some(path) = normalize_path(path) else {
            return Ok(Access::Blocked);
        };
        let Some(role_id) = self.role_id(token)? else {
            return Ok(Access::Blocked);
        };
        let rules = self.rules(role_id)?;
        let allowed = rules
            .iter()
            .any(|rule| rule.grants(action) && rule.covers(&path));
        Ok(if allowed {
            Access::Allowed
        } else {
            Access::Blocked
        })
    }

    /// Like [`PermissionCache::check_access`], as a `Result`.
    pub fn require(&self, token: &str, path: &str, action: Action) -> Result<(), ProtocolError> {
        match self.check_access(token, path, action) {
            Access::Allowed => Ok(()),
            Access::Blocked => {
                tracing::debug!(%action, path, "Access blocked");
                Err(ProtocolError::PermissionDenied {
                    action: action.to_string(),
                    path: path.to_string(),
                })
            }
        }
    }
}
