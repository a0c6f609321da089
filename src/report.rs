use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;

use anyhow::{Context, Result};
use clap::ValueEnum;
use serde::Serialize;
use serde_json::json;
use serde_sarif::sarif::Result as SarifResult;
use serde_sarif::sarif::{
    ArtifactLocation, Invocation, Location, LogicalLocation, Message, MultiformatMessageString,
    PhysicalLocation, PropertyBag, Region, ReportingDescriptor, Run, SCHEMA_URL, Sarif, Tool,
    ToolComponent,
};

use crate::aggregate::{ModulePermission, ModulePermissions, PolicySet};
use crate::engine::ProjectReport;
use crate::error::ScanError;
use crate::permission::Permission;
use crate::policy::format_policy;
use crate::scan::Scope;

/// Output formats supported by the CLI.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, ValueEnum)]
pub(crate) enum OutputFormat {
    /// Policy file grant blocks.
    #[default]
    Policy,
    /// Findings, module requirements and policy as JSON.
    Json,
    /// SARIF 2.1.0 log with one result per required permission.
    Sarif,
}

/// Rendering options that do not change what was found.
#[derive(Clone, Debug, Default)]
pub(crate) struct ReportOptions {
    pub(crate) format: OutputFormat,
    /// Emit one grant block per module ahead of the project block.
    pub(crate) per_module: bool,
    /// Base URL of a source cross-reference for the project module.
    pub(crate) xref: Option<String>,
}

pub(crate) fn write_report(
    writer: &mut dyn Write,
    report: &ProjectReport,
    options: &ReportOptions,
) -> Result<()> {
    match options.format {
        OutputFormat::Policy => writer
            .write_all(render_policy(report, options.per_module).as_bytes())
            .context("failed to write policy output"),
        OutputFormat::Json => {
            serde_json::to_writer_pretty(&mut *writer, &json_report(report, options))
                .context("failed to serialize JSON output")?;
            writer
                .write_all(b"\n")
                .context("failed to write JSON output")
        }
        OutputFormat::Sarif => {
            serde_json::to_writer(&mut *writer, &build_sarif(report))
                .context("failed to serialize SARIF output")?;
            writer
                .write_all(b"\n")
                .context("failed to write SARIF output")
        }
    }
}

/// Project grant block, optionally preceded by one block per module.
pub(crate) fn render_policy(report: &ProjectReport, per_module: bool) -> String {
    let mut output = String::new();
    if per_module {
        for module in &report.modules {
            output.push_str(&format!("// {} ({})\n", module.module_name, module.scope));
            output.push_str(&format_policy(&module.policy_set(), module_codebase(module)));
            output.push('\n');
        }
        output.push_str("// all dependencies\n");
        output.push_str(&format_policy(&report.dependency_policy, None));
        output.push('\n');
        output.push_str("// project\n");
    }
    output.push_str(&format_policy(&report.policy, None));
    output
}

/// The project's own module is granted unscoped; dependencies by file name.
fn module_codebase(module: &ModulePermissions) -> Option<&str> {
    match module.scope {
        Scope::Project => None,
        Scope::Compile | Scope::Test => Some(module.module_name.as_str()),
    }
}

#[derive(Serialize)]
struct JsonReport<'a> {
    project: Option<&'a str>,
    class_count: usize,
    modules: Vec<JsonModule<'a>>,
    policy: &'a PolicySet,
    dependency_policy: &'a PolicySet,
    diagnostics: &'a [ScanError],
}

#[derive(Serialize)]
struct JsonModule<'a> {
    name: &'a str,
    scope: Scope,
    findings: Vec<JsonFinding<'a>>,
    /// Distinct (kind, target) pairs, the edges of the module graph.
    requires: Vec<JsonRequirement>,
    keys: BTreeSet<String>,
    policy: PolicySet,
}

#[derive(Serialize)]
struct JsonFinding<'a> {
    class_name: &'a str,
    method: &'a str,
    descriptor: &'a str,
    line: i64,
    permissions: &'a [Permission],
    policy: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    xref: Option<String>,
}

#[derive(Serialize)]
struct JsonRequirement {
    kind: String,
    target: String,
}

fn json_report<'a>(report: &'a ProjectReport, options: &ReportOptions) -> JsonReport<'a> {
    JsonReport {
        project: report.project.as_deref(),
        class_count: report.class_count,
        modules: report
            .modules
            .iter()
            .map(|module| json_module(module, options.xref.as_deref()))
            .collect(),
        policy: &report.policy,
        dependency_policy: &report.dependency_policy,
        diagnostics: &report.diagnostics,
    }
}

fn json_module<'a>(module: &'a ModulePermissions, xref: Option<&str>) -> JsonModule<'a> {
    let xref = xref.filter(|_| module.scope == Scope::Project);
    JsonModule {
        name: &module.module_name,
        scope: module.scope,
        findings: module
            .permissions
            .iter()
            .map(|finding| json_finding(finding, xref))
            .collect(),
        requires: module
            .requirements()
            .into_iter()
            .map(|(kind, target)| JsonRequirement { kind, target })
            .collect(),
        keys: module.permission_keys(),
        policy: module.policy_set(),
    }
}

fn json_finding<'a>(finding: &'a ModulePermission, xref: Option<&str>) -> JsonFinding<'a> {
    JsonFinding {
        class_name: &finding.class_name,
        method: &finding.method,
        descriptor: &finding.descriptor,
        line: finding.line_or_sentinel(),
        permissions: &finding.permissions,
        policy: &finding.policy,
        xref: xref.and_then(|base| finding.xref(base)),
    }
}

fn build_sarif(report: &ProjectReport) -> Sarif {
    let kinds: BTreeSet<&str> = report
        .modules
        .iter()
        .flat_map(|module| module.permissions.iter())
        .flat_map(|finding| finding.permissions.iter())
        .map(|permission| permission.kind.as_str())
        .collect();
    let rules: Vec<ReportingDescriptor> = kinds.into_iter().map(rule_descriptor).collect();

    let mut results = Vec::new();
    for module in &report.modules {
        for finding in &module.permissions {
            for permission in &finding.permissions {
                results.push(permission_result(module, finding, permission));
            }
        }
    }

    let semantic_version = env!("CARGO_PKG_VERSION").to_string();
    let driver = if rules.is_empty() {
        ToolComponent::builder()
            .name("policyextractor")
            .semantic_version(semantic_version)
            .build()
    } else {
        ToolComponent::builder()
            .name("policyextractor")
            .rules(rules)
            .semantic_version(semantic_version)
            .build()
    };
    let tool = Tool {
        driver,
        extensions: None,
        properties: None,
    };
    let run = Run::builder()
        .tool(tool)
        .invocations(vec![build_invocation(report)])
        .results(results)
        .build();

    Sarif::builder()
        .schema(SCHEMA_URL)
        .runs(vec![run])
        .version(json!("2.1.0"))
        .build()
}

fn rule_descriptor(kind: &str) -> ReportingDescriptor {
    let name = kind.rsplit('.').next().unwrap_or(kind);
    ReportingDescriptor::builder()
        .id(kind)
        .name(name)
        .short_description(
            MultiformatMessageString::builder()
                .text(format!("Code requires {kind}"))
                .build(),
        )
        .build()
}

fn permission_result(
    module: &ModulePermissions,
    finding: &ModulePermission,
    permission: &Permission,
) -> SarifResult {
    let logical = LogicalLocation::builder()
        .name(format!(
            "{}.{}{}",
            finding.class_name, finding.method, finding.descriptor
        ))
        .kind("function")
        .build();
    let artifact_location = ArtifactLocation::builder()
        .uri(module.module_name.clone())
        .build();
    let physical = match finding.line {
        Some(line) => PhysicalLocation::builder()
            .artifact_location(artifact_location)
            .region(Region::builder().start_line(line as i64).build())
            .build(),
        None => PhysicalLocation::builder()
            .artifact_location(artifact_location)
            .build(),
    };
    let location = Location::builder()
        .logical_locations(vec![logical])
        .physical_location(physical)
        .build();
    let message = Message::builder()
        .text(format!(
            "{}.{} requires {}",
            finding.class_name.replace('/', "."),
            finding.method,
            permission.grant_statement()
        ))
        .build();
    let mut result = SarifResult::builder()
        .message(message)
        .locations(vec![location])
        .build();
    result.rule_id = Some(permission.kind.clone());
    result
}

fn build_invocation(report: &ProjectReport) -> Invocation {
    let mut properties = BTreeMap::new();
    properties.insert(
        "policyextractor.class_count".to_string(),
        json!(report.class_count),
    );
    properties.insert(
        "policyextractor.module_count".to_string(),
        json!(report.modules.len()),
    );
    properties.insert(
        "policyextractor.diagnostics".to_string(),
        json!(
            report
                .diagnostics
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
        ),
    );
    Invocation::builder()
        .execution_successful(true)
        .properties(
            PropertyBag::builder()
                .additional_properties(properties)
                .build(),
        )
        .build()
}
