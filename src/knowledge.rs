use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::OnceLock;

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value;

use crate::callsite::ResolvedCall;
use crate::descriptor::validate_method_descriptor;
use crate::ir::Constant;
use crate::permission::Permission;

const BUILTIN_TABLE: &str = include_str!("assets/permissions.json");
const SCHEMA: &str = include_str!("assets/knowledge-base.schema.json");

static BUILTIN: OnceLock<std::result::Result<KnowledgeBase, String>> = OnceLock::new();

/// How a template derives the permission target from a call site.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub(crate) enum TargetTemplate {
    /// Fixed target, independent of the arguments.
    Literal(String),
    /// `{i}` placeholders are replaced by argument `i`; any non-literal
    /// referenced argument selects `wildcard` instead.
    Substitute { pattern: String, wildcard: String },
}

/// One permission a sensitive symbol implies.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub(crate) struct PermissionTemplate {
    pub(crate) kind: String,
    pub(crate) target: TargetTemplate,
    #[serde(default)]
    pub(crate) actions: String,
}

impl PermissionTemplate {
    pub(crate) fn resolve(&self, arguments: &[Option<Constant>]) -> Permission {
        let target = match &self.target {
            TargetTemplate::Literal(target) => target.clone(),
            TargetTemplate::Substitute { pattern, wildcard } => {
                substitute(pattern, arguments).unwrap_or_else(|| wildcard.clone())
            }
        };
        Permission::new(self.kind.clone(), target, self.actions.clone())
    }
}

/// Expand `{i}` placeholders; `None` when a referenced argument is unknown.
fn substitute(pattern: &str, arguments: &[Option<Constant>]) -> Option<String> {
    let mut output = String::with_capacity(pattern.len());
    let mut rest = pattern;
    while let Some(start) = rest.find('{') {
        output.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        let placeholder = after
            .find('}')
            .and_then(|end| after[..end].parse::<usize>().ok().map(|index| (index, end)));
        match placeholder {
            Some((index, end)) => {
                let argument = arguments.get(index)?.as_ref()?;
                output.push_str(&argument.render());
                rest = &after[end + 1..];
            }
            None => {
                output.push('{');
                rest = after;
            }
        }
    }
    output.push_str(rest);
    Some(output)
}

/// Symbol a knowledge base entry is keyed by. `descriptor: None` matches any overload.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
struct SymbolKey {
    owner: String,
    name: String,
    descriptor: Option<String>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct KnowledgeBaseFile {
    entries: Vec<EntryDefinition>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct EntryDefinition {
    owner: String,
    name: String,
    #[serde(default)]
    descriptor: Option<String>,
    permissions: Vec<PermissionTemplate>,
}

/// Table mapping invoked symbols to the permissions they imply.
#[derive(Clone, Debug, Default)]
pub(crate) struct KnowledgeBase {
    entries: BTreeMap<SymbolKey, Vec<PermissionTemplate>>,
}

impl KnowledgeBase {
    /// Built-in table, parsed once per process.
    pub(crate) fn builtin() -> Result<&'static KnowledgeBase> {
        BUILTIN
            .get_or_init(|| {
                KnowledgeBase::from_json("built-in knowledge base", BUILTIN_TABLE)
                    .map_err(|err| format!("{err:#}"))
            })
            .as_ref()
            .map_err(|err| anyhow::anyhow!("{err}"))
    }

    /// Copy of this table with the entries of `paths` layered on top.
    ///
    /// An extension entry replaces the existing entry with the identical key.
    pub(crate) fn extended(&self, paths: &[impl AsRef<Path>]) -> Result<KnowledgeBase> {
        let mut merged = self.clone();
        for path in paths {
            let path = path.as_ref();
            let text = fs::read_to_string(path)
                .with_context(|| format!("read knowledge base {}", path.display()))?;
            let extension = KnowledgeBase::from_json(&path.display().to_string(), &text)?;
            merged.entries.extend(extension.entries);
        }
        Ok(merged)
    }

    pub(crate) fn from_json(source: &str, text: &str) -> Result<KnowledgeBase> {
        let value: Value = serde_json::from_str(text)
            .with_context(|| format!("parse {source} as JSON"))?;
        validate_schema(&value).with_context(|| format!("validate {source}"))?;
        let file: KnowledgeBaseFile = serde_path_to_error::deserialize(value)
            .map_err(|err| anyhow::anyhow!("{source}: {} at {}", err.inner(), err.path()))?;

        let mut entries = BTreeMap::new();
        for entry in file.entries {
            if let Some(descriptor) = &entry.descriptor {
                validate_method_descriptor(descriptor).with_context(|| {
                    format!("{source}: entry {}.{}", entry.owner, entry.name)
                })?;
            }
            let key = SymbolKey {
                owner: entry.owner,
                name: entry.name,
                descriptor: entry.descriptor,
            };
            if entries.contains_key(&key) {
                anyhow::bail!(
                    "{source}: duplicate entry {}.{}{}",
                    key.owner,
                    key.name,
                    key.descriptor.as_deref().unwrap_or(" (any descriptor)")
                );
            }
            entries.insert(key, entry.permissions);
        }
        Ok(KnowledgeBase { entries })
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Templates for a symbol: the exact descriptor first, then the any-descriptor entry.
    pub(crate) fn lookup(&self, owner: &str, name: &str, descriptor: &str) -> &[PermissionTemplate] {
        let mut key = SymbolKey {
            owner: owner.to_string(),
            name: name.to_string(),
            descriptor: Some(descriptor.to_string()),
        };
        if let Some(templates) = self.entries.get(&key) {
            return templates;
        }
        key.descriptor = None;
        self.entries
            .get(&key)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Permissions required by one call site; empty when it is not sensitive.
    pub(crate) fn resolve(&self, call: &ResolvedCall<'_>) -> Vec<Permission> {
        self.lookup(&call.call.owner, &call.call.name, &call.call.descriptor)
            .iter()
            .map(|template| template.resolve(&call.arguments))
            .collect()
    }
}

fn validate_schema(value: &Value) -> Result<()> {
    let schema: Value =
        serde_json::from_str(SCHEMA).context("load knowledge base schema")?;
    let compiled = jsonschema::validator_for(&schema)
        .map_err(|err| anyhow::anyhow!("compile knowledge base schema: {err}"))?;
    let errors: Vec<String> = compiled
        .iter_errors(value)
        .map(|error| error.to_string())
        .collect();
    if !errors.is_empty() {
        let message = errors.join("\n");
        anyhow::bail!("knowledge base schema validation failed:\n{message}");
    }
    Ok(())
}
