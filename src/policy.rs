use crate::aggregate::PolicySet;

/// Render a policy grant block, scoped to `codebase` when one is given.
pub(crate) fn format_policy(policy: &PolicySet, codebase: Option<&str>) -> String {
    let mut block = match codebase.filter(|name| !name.is_empty()) {
        Some(name) => format!("grant codebase \"file:/{name}\" {{\n"),
        None => "grant {\n".to_string(),
    };
    for statement in policy.iter() {
        block.push('\t');
        block.push_str(statement);
        block.push('\n');
    }
    block.push_str("};\n");
    block
}
