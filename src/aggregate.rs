use std::collections::BTreeSet;

use serde::Serialize;

use crate::permission::Permission;
use crate::scan::Scope;

/// Finding for one matched call site.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub(crate) struct ModulePermission {
    /// Binary name with slashes, as stored in the class file.
    pub(crate) class_name: String,
    pub(crate) method: String,
    pub(crate) descriptor: String,
    pub(crate) line: Option<u32>,
    pub(crate) permissions: Vec<Permission>,
    /// Grant statements of `permissions`, in the same order.
    pub(crate) policy: Vec<String>,
}

impl ModulePermission {
    pub(crate) fn new(
        class_name: &str,
        method: &str,
        descriptor: &str,
        line: Option<u32>,
        permissions: Vec<Permission>,
    ) -> Self {
        let policy = permissions.iter().map(Permission::grant_statement).collect();
        Self {
            class_name: class_name.to_string(),
            method: method.to_string(),
            descriptor: descriptor.to_string(),
            line,
            permissions,
            policy,
        }
    }

    /// Line with `-1` standing in for unknown.
    pub(crate) fn line_or_sentinel(&self) -> i64 {
        self.line.map_or(-1, i64::from)
    }

    /// Source cross-reference link, available only when the line is known.
    pub(crate) fn xref(&self, base: &str) -> Option<String> {
        let line = self.line?;
        Some(format!(
            "{}/{}.html#{}",
            base.trim_end_matches('/'),
            self.class_name,
            line
        ))
    }
}

/// Order one class's findings by line, keeping scan order within a line.
///
/// Findings without a line sort first.
pub(crate) fn order_by_line(findings: &mut [ModulePermission]) {
    findings.sort_by_key(|finding| finding.line);
}

/// Findings of one archive, in scan order.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct ModulePermissions {
    pub(crate) module_name: String,
    pub(crate) scope: Scope,
    pub(crate) permissions: Vec<ModulePermission>,
}

impl ModulePermissions {
    pub(crate) fn new(module_name: &str, scope: Scope, permissions: Vec<ModulePermission>) -> Self {
        Self {
            module_name: module_name.to_string(),
            scope,
            permissions,
        }
    }

    pub(crate) fn policy_set(&self) -> PolicySet {
        let mut policy = PolicySet::default();
        for finding in &self.permissions {
            policy.extend(finding.policy.iter().cloned());
        }
        policy
    }

    /// Distinct `(kind, target)` pairs this module requires.
    pub(crate) fn requirements(&self) -> BTreeSet<(String, String)> {
        self.permissions
            .iter()
            .flat_map(|finding| finding.permissions.iter())
            .map(|permission| (permission.kind.clone(), permission.target.clone()))
            .collect()
    }

    /// Node labels for the module graph view.
    pub(crate) fn permission_keys(&self) -> BTreeSet<String> {
        self.permissions
            .iter()
            .flat_map(|finding| finding.permissions.iter())
            .map(Permission::key)
            .collect()
    }
}

/// Sorted, deduplicated set of grant statements.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
#[serde(transparent)]
pub(crate) struct PolicySet(BTreeSet<String>);

impl PolicySet {
    pub(crate) fn union(&mut self, other: &PolicySet) {
        self.0.extend(other.0.iter().cloned());
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub(crate) fn len(&self) -> usize {
        self.0.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Extend<String> for PolicySet {
    fn extend<T: IntoIterator<Item = String>>(&mut self, iter: T) {
        self.0.extend(iter);
    }
}

impl FromIterator<String> for PolicySet {
    fn from_iter<T: IntoIterator<Item = String>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Single owner of the project-wide union.
///
/// Modules are added in input order; test-scoped modules are kept for
/// per-module listing but never reach the unions.
#[derive(Debug, Default)]
pub(crate) struct ProjectAggregator {
    modules: Vec<ModulePermissions>,
    policy: PolicySet,
    dependency_policy: PolicySet,
}

impl ProjectAggregator {
    pub(crate) fn add(&mut self, module: ModulePermissions) {
        match module.scope {
            Scope::Project => self.policy.union(&module.policy_set()),
            Scope::Compile => {
                let policy = module.policy_set();
                self.policy.union(&policy);
                self.dependency_policy.union(&policy);
            }
            Scope::Test => {}
        }
        self.modules.push(module);
    }

    pub(crate) fn finish(self) -> AggregatedProject {
        AggregatedProject {
            modules: self.modules,
            policy: self.policy,
            dependency_policy: self.dependency_policy,
        }
    }
}

/// Result of [`ProjectAggregator::finish`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct AggregatedProject {
    pub(crate) modules: Vec<ModulePermissions>,
    /// Project module plus every non-test dependency.
    pub(crate) policy: PolicySet,
    /// Non-test dependencies only.
    pub(crate) dependency_policy: PolicySet,
}
