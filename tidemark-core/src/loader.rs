//! Changelog documents (TOML or JSON) and their translation into the model.
//!
//! A document looks like this in TOML:
//!
//! ```toml
//! [properties]
//! app_schema = "app"
//!
//! [[include]]
//! file = "tables/users.toml"
//!
//! [[change_set]]
//! id = "1"
//! author = "alice"
//! context = "!test"
//!
//! [[change_set.changes]]
//! kind = "createTable"
//! schema = "${app_schema}"
//! table = "accounts"
//! columns = [{ name = "id", type = "BIGINT", primary_key = true }]
//! ```
//!
//! Includes are resolved relative to the including file and come before the
//! including document's own change sets. `${name}` references are expanded in
//! every string value; names the loader does not know are left as written.

use std::collections::{BTreeMap, HashMap};
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, LazyLock};

use regex_lite::Regex;
use serde::Deserialize;
use serde_json::Value;

use crate::change::{Change, ChangeRegistry};
use crate::changelog::Changelog;
use crate::changeset::{parse_expression, ChangeSet, ChangeSetId, RollbackDefinition, ValidationFailAction};
use crate::checksum::ValidCheckSum;
use crate::error::{Result, TidemarkError, ValidationIssue};
use crate::precondition::PreconditionContainer;

/// Compiled regex for matching `${name}` references.
static PROPERTY_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\$\{([^}]+)\}").unwrap());

/// Maximum include nesting.
const MAX_INCLUDE_DEPTH: usize = 32;

/// Document syntax, chosen by file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Toml,
    Json,
}

impl Format {
    pub fn from_path(path: &Path) -> Result<Self> {
        match path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .as_deref()
        {
            Some("toml") => Ok(Format::Toml),
            Some("json") => Ok(Format::Json),
            _ => Err(TidemarkError::ChangelogParseError(format!(
                "Unsupported changelog format '{}'. Use a .toml or .json file.",
                path.display()
            ))),
        }
    }

    fn parse(self, source: &str) -> std::result::Result<Value, String> {
        match self {
            Format::Toml => toml::from_str::<Value>(source).map_err(|e| e.to_string()),
            Format::Json => serde_json::from_str::<Value>(source).map_err(|e| e.to_string()),
        }
    }
}

// ── document structs ──

#[derive(Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
struct RawDocument {
    logical_path: Option<String>,
    properties: BTreeMap<String, Value>,
    preconditions: Option<PreconditionContainer>,
    include: Vec<RawInclude>,
    include_all: Vec<RawIncludeAll>,
    change_set: Vec<RawChangeSet>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawInclude {
    file: String,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawIncludeAll {
    path: String,
}

fn default_true() -> bool {
    true
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawChangeSet {
    id: String,
    author: String,
    #[serde(default)]
    logical_path: Option<String>,
    #[serde(default)]
    run_always: bool,
    #[serde(default)]
    run_on_change: bool,
    #[serde(default = "default_true")]
    fail_on_error: bool,
    #[serde(default = "default_true")]
    run_in_transaction: bool,
    #[serde(default, alias = "contexts")]
    context: Option<String>,
    #[serde(default)]
    labels: Option<String>,
    #[serde(default)]
    dbms: Option<String>,
    #[serde(default)]
    comment: Option<String>,
    #[serde(default)]
    valid_checksums: Vec<String>,
    #[serde(default)]
    on_validation_fail: ValidationFailAction,
    #[serde(default)]
    preconditions: Option<PreconditionContainer>,
    #[serde(default)]
    changes: Vec<Value>,
    #[serde(default)]
    rollback: Option<RawRollback>,
}

/// `rollback = "empty"` or a list of changes.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawRollback {
    Keyword(String),
    Changes(Vec<Value>),
}

// ── loader ──

/// Reads changelog documents and builds changes through a registry.
pub struct ChangelogLoader<'a> {
    registry: &'a ChangeRegistry,
    properties: HashMap<String, String>,
}

impl<'a> ChangelogLoader<'a> {
    pub fn new(registry: &'a ChangeRegistry) -> Self {
        Self {
            registry,
            properties: HashMap::new(),
        }
    }

    /// Properties that take precedence over a document's own `[properties]`.
    pub fn with_properties(mut self, properties: HashMap<String, String>) -> Self {
        self.properties = properties
            .into_iter()
            .map(|(k, v)| (k.to_lowercase(), v))
            .collect();
        self
    }

    /// Load the changelog rooted at `path`, resolving includes.
    ///
    /// Logical paths default to each file's path relative to the root
    /// document's directory.
    pub fn load(&self, path: &Path) -> Result<Changelog> {
        let base = path.parent().map(Path::to_path_buf).unwrap_or_default();
        let mut stack = Vec::new();
        let changelog = self.load_file(path, &base, &mut stack)?;
        check_duplicates(&changelog)?;
        log::debug!(
            "Changelog loaded; path={}, change_sets={}",
            path.display(),
            changelog.len()
        );
        Ok(changelog)
    }

    /// Parse a single document from memory. Includes resolve against the current directory.
    pub fn parse_str(&self, source: &str, format: Format, logical_path: &str) -> Result<Changelog> {
        let mut stack = Vec::new();
        let changelog =
            self.parse_document(source, format, logical_path, Path::new("."), Path::new("."), &mut stack)?;
        check_duplicates(&changelog)?;
        Ok(changelog)
    }

    fn load_file(&self, path: &Path, base: &Path, stack: &mut Vec<PathBuf>) -> Result<Changelog> {
        let canonical = std::fs::canonicalize(path).map_err(|e| {
            TidemarkError::ChangelogParseError(format!(
                "Cannot read changelog '{}': {}",
                path.display(),
                e
            ))
        })?;
        if stack.contains(&canonical) {
            let chain: Vec<String> = stack
                .iter()
                .chain(std::iter::once(&canonical))
                .map(|p| p.display().to_string())
                .collect();
            return Err(TidemarkError::ChangelogParseError(format!(
                "Include cycle detected: {}",
                chain.join(" -> ")
            )));
        }
        if stack.len() >= MAX_INCLUDE_DEPTH {
            return Err(TidemarkError::ChangelogParseError(format!(
                "Includes nested deeper than {} levels at '{}'",
                MAX_INCLUDE_DEPTH,
                path.display()
            )));
        }

        let source = std::fs::read_to_string(path)?;
        let format = Format::from_path(path)?;
        let logical = logical_path_for(path, base);
        let dir = path.parent().map(Path::to_path_buf).unwrap_or_default();

        stack.push(canonical);
        let result = self.parse_document(&source, format, &logical, &dir, base, stack);
        stack.pop();
        result
    }

    fn parse_document(
        &self,
        source: &str,
        format: Format,
        logical_path: &str,
        dir: &Path,
        base: &Path,
        stack: &mut Vec<PathBuf>,
    ) -> Result<Changelog> {
        let mut value = format.parse(source).map_err(|e| {
            TidemarkError::ChangelogParseError(format!("{}: {}", logical_path, e))
        })?;

        let properties = self.document_properties(&value);
        expand_value(&mut value, &properties);

        let doc: RawDocument = serde_json::from_value(value).map_err(|e| {
            TidemarkError::ChangelogParseError(format!("{}: {}", logical_path, e))
        })?;
        let logical_path = doc.logical_path.as_deref().unwrap_or(logical_path);

        let mut changelog = Changelog::new(logical_path);
        if let Some(preconditions) = doc.preconditions {
            changelog = changelog.with_preconditions(preconditions);
        }

        for include in &doc.include {
            let child = self.load_file(&dir.join(&include.file), base, stack)?;
            changelog.include(child);
        }
        for include_all in &doc.include_all {
            for file in list_changelogs(&dir.join(&include_all.path))? {
                let child = self.load_file(&file, base, stack)?;
                changelog.include(child);
            }
        }

        for raw in doc.change_set {
            let change_set = self.build_change_set(raw, logical_path)?;
            changelog.add_change_set(change_set);
        }
        Ok(changelog)
    }

    /// Merged property map for one document. Loader-level properties win.
    fn document_properties(&self, value: &Value) -> HashMap<String, String> {
        let mut properties = HashMap::new();
        if let Some(Value::Object(map)) = value.get("properties") {
            for (key, v) in map {
                let text = match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                properties.insert(key.to_lowercase(), text);
            }
        }
        properties.extend(self.properties.iter().map(|(k, v)| (k.clone(), v.clone())));
        properties
    }

    fn build_change_set(&self, raw: RawChangeSet, default_path: &str) -> Result<ChangeSet> {
        let path = raw.logical_path.as_deref().unwrap_or(default_path);
        let identity = ChangeSetId::new(&raw.id, &raw.author, path);
        let context = |e: TidemarkError| match e {
            TidemarkError::ChangelogParseError(msg) => {
                TidemarkError::ChangelogParseError(format!("{}: {}", identity, msg))
            }
            other => other,
        };

        let changes = self.build_changes(&raw.changes).map_err(context)?;
        let rollback = match raw.rollback {
            None => RollbackDefinition::Derived,
            Some(RawRollback::Keyword(k)) if k.eq_ignore_ascii_case("empty") => {
                RollbackDefinition::Empty
            }
            Some(RawRollback::Keyword(k)) => {
                return Err(context(TidemarkError::ChangelogParseError(format!(
                    "rollback must be \"empty\" or a list of changes, got \"{}\"",
                    k
                ))))
            }
            Some(RawRollback::Changes(list)) if list.is_empty() => RollbackDefinition::Empty,
            Some(RawRollback::Changes(list)) => {
                RollbackDefinition::Changes(self.build_changes(&list).map_err(context)?)
            }
        };
        let valid_checksums = raw
            .valid_checksums
            .iter()
            .map(|s| {
                s.parse::<ValidCheckSum>().map_err(|_| {
                    context(TidemarkError::ChangelogParseError(format!(
                        "invalid valid_checksums entry '{}'",
                        s
                    )))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let mut change_set = ChangeSet::new(&raw.id, &raw.author, path)
            .with_rollback(rollback)
            .with_run_always(raw.run_always)
            .with_run_on_change(raw.run_on_change)
            .with_fail_on_error(raw.fail_on_error)
            .with_run_in_transaction(raw.run_in_transaction)
            .with_contexts(parse_expression(raw.context.as_deref()).map_err(context)?)
            .with_labels(parse_expression(raw.labels.as_deref()).map_err(context)?)
            .with_dbms(parse_expression(raw.dbms.as_deref()).map_err(context)?)
            .with_valid_checksums(valid_checksums)
            .with_on_validation_fail(raw.on_validation_fail);
        if let Some(comment) = raw.comment.as_deref() {
            change_set = change_set.with_comments(comment);
        }
        if let Some(preconditions) = raw.preconditions {
            change_set = change_set.with_preconditions(preconditions);
        }
        change_set.set_changes(changes);
        Ok(change_set)
    }

    /// Each entry is `{ kind = "...", <attributes> }`.
    fn build_changes(&self, entries: &[Value]) -> Result<Vec<Arc<dyn Change>>> {
        entries
            .iter()
            .map(|entry| {
                let mut attributes = entry.clone();
                let kind = attributes
                    .as_object_mut()
                    .and_then(|m| m.remove("kind"))
                    .and_then(|k| k.as_str().map(str::to_string))
                    .ok_or_else(|| {
                        TidemarkError::ChangelogParseError(
                            "every change needs a string 'kind'".to_string(),
                        )
                    })?;
                self.registry.create(&kind, &attributes)
            })
            .collect()
    }
}

fn check_duplicates(changelog: &Changelog) -> Result<()> {
    let duplicates = changelog.duplicate_identities();
    if duplicates.is_empty() {
        return Ok(());
    }
    Err(TidemarkError::ValidationFailed(
        duplicates
            .into_iter()
            .map(|id| ValidationIssue::DuplicateIdentity {
                change_set: id.to_string(),
            })
            .collect(),
    ))
}

/// Changelog files directly inside `dir`, sorted by file name.
fn list_changelogs(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = std::fs::read_dir(dir).map_err(|e| {
        TidemarkError::ChangelogParseError(format!(
            "Cannot list include_all directory '{}': {}",
            dir.display(),
            e
        ))
    })?;
    let mut files = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.is_file() && Format::from_path(&path).is_ok() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Path of `file` relative to `base`, with `/` separators.
fn logical_path_for(file: &Path, base: &Path) -> String {
    let relative = file.strip_prefix(base).unwrap_or(file);
    let mut parts: Vec<String> = Vec::new();
    for component in relative.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                parts.pop();
            }
            other => parts.push(other.as_os_str().to_string_lossy().into_owned()),
        }
    }
    parts.join("/")
}

/// Expand `${name}` in every string of the document except `[properties]` itself.
fn expand_value(value: &mut Value, properties: &HashMap<String, String>) {
    if properties.is_empty() {
        return;
    }
    match value {
        Value::String(s) => {
            if s.contains("${") {
                *s = expand(s, properties);
            }
        }
        Value::Array(items) => items.iter_mut().for_each(|v| expand_value(v, properties)),
        Value::Object(map) => {
            for (key, v) in map.iter_mut() {
                if key != "properties" {
                    expand_value(v, properties);
                }
            }
        }
        _ => {}
    }
}

/// Replace known `${name}` references (case-insensitive); unknown ones stay verbatim.
pub fn expand(text: &str, properties: &HashMap<String, String>) -> String {
    PROPERTY_RE
        .replace_all(text, |caps: &regex_lite::Captures<'_>| {
            match properties.get(&caps[1].trim().to_lowercase()) {
                Some(v) => v.clone(),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&path, content).unwrap();
        path
    }

    const USERS: &str = r#"
[[change_set]]
id = "1"
author = "alice"
comment = "users table"

[[change_set.changes]]
kind = "createTable"
table = "users"
columns = [{ name = "id", type = "BIGINT", primary_key = true }]
"#;

    #[test]
    fn test_load_toml_document() {
        let dir = tempfile::tempdir().unwrap();
        let root = write(dir.path(), "changelog.toml", USERS);
        let registry = ChangeRegistry::with_builtins();
        let log = ChangelogLoader::new(&registry).load(&root).unwrap();

        assert_eq!(log.len(), 1);
        let cs = &log.change_sets()[0];
        assert_eq!(cs.identity(), &ChangeSetId::new("1", "alice", "changelog.toml"));
        assert_eq!(cs.comments(), Some("users table"));
        assert_eq!(cs.description(), "createTable users");
        assert!(cs.fail_on_error());
        assert!(cs.run_in_transaction());
    }

    #[test]
    fn test_includes_come_first_with_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "tables/users.toml", USERS);
        let root = write(
            dir.path(),
            "main.toml",
            r#"
[[include]]
file = "tables/users.toml"

[[change_set]]
id = "2"
author = "bob"
changes = [{ kind = "sql", sql = "SELECT 1" }]
"#,
        );
        let registry = ChangeRegistry::with_builtins();
        let log = ChangelogLoader::new(&registry).load(&root).unwrap();

        let ids: Vec<String> = log
            .change_sets()
            .iter()
            .map(|c| c.identity().to_string())
            .collect();
        assert_eq!(ids, vec!["tables/users.toml::1::alice", "main.toml::2::bob"]);
    }

    #[test]
    fn test_include_all_sorted_by_name() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "parts/002.json",
            r#"{"change_set": [{"id": "b", "author": "x", "changes": [{"kind": "sql", "sql": "SELECT 2"}]}]}"#,
        );
        write(
            dir.path(),
            "parts/001.json",
            r#"{"change_set": [{"id": "a", "author": "x", "changes": [{"kind": "sql", "sql": "SELECT 1"}]}]}"#,
        );
        write(dir.path(), "parts/readme.txt", "ignored");
        let root = write(dir.path(), "root.toml", "[[include_all]]\npath = \"parts\"\n");

        let registry = ChangeRegistry::with_builtins();
        let log = ChangelogLoader::new(&registry).load(&root).unwrap();
        let ids: Vec<&str> = log
            .change_sets()
            .iter()
            .map(|c| c.identity().id.as_str())
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(log.change_sets()[0].identity().path, "parts/001.json");
    }

    #[test]
    fn test_include_cycle_detected() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.toml", "[[include]]\nfile = \"b.toml\"\n");
        let root = write(dir.path(), "b.toml", "[[include]]\nfile = \"a.toml\"\n");
        let registry = ChangeRegistry::with_builtins();
        let err = ChangelogLoader::new(&registry).load(&root).unwrap_err();
        assert!(err.to_string().contains("Include cycle detected"));
    }

    #[test]
    fn test_duplicate_identity_fails_load() {
        let registry = ChangeRegistry::with_builtins();
        let source = r#"
[[change_set]]
id = "1"
author = "alice"

[[change_set]]
id = "1"
author = "alice"
"#;
        let err = ChangelogLoader::new(&registry)
            .parse_str(source, Format::Toml, "main.toml")
            .unwrap_err();
        match err {
            TidemarkError::ValidationFailed(issues) => {
                assert_eq!(issues.len(), 1);
                assert_eq!(issues[0].change_set(), "main.toml::1::alice");
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn test_properties_expand_with_loader_precedence() {
        let registry = ChangeRegistry::with_builtins();
        let source = r#"
[properties]
table = "from_doc"
schema = "app"

[[change_set]]
id = "1"
author = "alice"
changes = [{ kind = "sql", sql = "CREATE TABLE ${schema}.${table} (id INT); -- ${unknown}" }]
"#;
        let mut props = HashMap::new();
        props.insert("TABLE".to_string(), "from_config".to_string());
        let log = ChangelogLoader::new(&registry)
            .with_properties(props)
            .parse_str(source, Format::Toml, "main.toml")
            .unwrap();
        let statements = log.change_sets()[0].forward_statements();
        assert_eq!(
            statements[0].sql(),
            "CREATE TABLE app.from_config (id INT); -- ${unknown}"
        );
    }

    #[test]
    fn test_rollback_forms_and_flags() {
        let registry = ChangeRegistry::with_builtins();
        let source = r#"
[[change_set]]
id = "1"
author = "alice"
run_on_change = true
context = "dev or test"
valid_checksums = ["ANY"]
rollback = "empty"
changes = [{ kind = "sql", sql = "UPDATE t SET a = 1" }]

[[change_set]]
id = "2"
author = "alice"
fail_on_error = false
changes = [{ kind = "sql", sql = "CREATE TABLE x (id INT)" }]
rollback = [{ kind = "dropTable", table = "x" }]

[change_set.preconditions]
on_fail = "CONTINUE"
checks = [{ not = { table_exists = { table = "x" } } }]
"#;
        let log = ChangelogLoader::new(&registry)
            .parse_str(source, Format::Toml, "main.toml")
            .unwrap();
        let first = &log.change_sets()[0];
        assert!(first.run_on_change());
        assert!(matches!(first.rollback(), RollbackDefinition::Empty));
        assert_eq!(first.valid_checksums(), &[ValidCheckSum::Any]);
        assert_eq!(first.contexts().source(), "dev or test");

        let second = &log.change_sets()[1];
        assert!(!second.fail_on_error());
        assert!(second.preconditions().is_some());
        assert_eq!(
            second.rollback_statements().unwrap()[0].sql(),
            "DROP TABLE \"x\""
        );
    }

    #[test]
    fn test_unknown_kind_lists_registered() {
        let registry = ChangeRegistry::with_builtins();
        let source = r#"
[[change_set]]
id = "1"
author = "alice"
changes = [{ kind = "createWidget" }]
"#;
        let err = ChangelogLoader::new(&registry)
            .parse_str(source, Format::Toml, "main.toml")
            .unwrap_err();
        assert!(matches!(err, TidemarkError::UnknownChangeType { ref kind, .. } if kind == "createWidget"));
    }

    #[test]
    fn test_unknown_field_rejected() {
        let registry = ChangeRegistry::with_builtins();
        let source = "[[change_set]]\nid = \"1\"\nauthor = \"a\"\nrun_allways = true\n";
        assert!(ChangelogLoader::new(&registry)
            .parse_str(source, Format::Toml, "main.toml")
            .is_err());
    }

    #[test]
    fn test_unsupported_extension() {
        assert!(Format::from_path(Path::new("changelog.yaml")).is_err());
        assert_eq!(Format::from_path(Path::new("a.JSON")).unwrap(), Format::Json);
    }

    #[test]
    fn test_logical_path_normalization() {
        assert_eq!(
            logical_path_for(Path::new("db/./tables/../users.toml"), Path::new("db")),
            "users.toml"
        );
    }
}
