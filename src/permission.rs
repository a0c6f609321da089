use std::fmt;

use serde::Serialize;

/// Concrete permission a call site requires.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize)]
pub(crate) struct Permission {
    /// Fully qualified permission class, e.g. `java.io.FilePermission`.
    pub(crate) kind: String,
    pub(crate) target: String,
    /// Comma-separated actions; empty for permissions that take none.
    pub(crate) actions: String,
}

impl Permission {
    pub(crate) fn new(
        kind: impl Into<String>,
        target: impl Into<String>,
        actions: impl Into<String>,
    ) -> Self {
        Self {
            kind: kind.into(),
            target: target.into(),
            actions: actions.into(),
        }
    }

    /// Policy-file permission entry for this triple.
    pub(crate) fn grant_statement(&self) -> String {
        self.to_string()
    }

    /// `(kind, target)` identity used by the module graph view.
    pub(crate) fn key(&self) -> String {
        format!("{}.{}", self.kind, self.target)
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "permission {} \"{}\"",
            self.kind,
            escape_quoted(&self.target)
        )?;
        if !self.actions.is_empty() {
            write!(f, ", \"{}\"", escape_quoted(&self.actions))?;
        }
        f.write_str(";")
    }
}

fn escape_quoted(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        if ch == '"' || ch == '\\' {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}
