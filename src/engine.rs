use std::sync::Arc;
use std::time::Instant;

use opentelemetry::Context as OtelContext;
use rayon::prelude::*;
use tracing::{debug, trace, warn};

use crate::aggregate::{ModulePermission, ModulePermissions, PolicySet, ProjectAggregator, order_by_line};
use crate::callsite::call_sites;
use crate::error::ScanError;
use crate::ir::Class;
use crate::knowledge::KnowledgeBase;
use crate::reader::parse_class;
use crate::scan::{ArchiveEntry, Artifact, Scope, open_archive};
use crate::telemetry::{Phase, Telemetry, record_diagnostic, traced, traced_under};

/// Class entries held in memory at once while scanning an archive.
const ENTRY_BATCH: usize = 64;

/// Outcome of scanning one artifact.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct ArchiveScan {
    pub(crate) permissions: ModulePermissions,
    /// Entries that parsed successfully.
    pub(crate) class_count: usize,
    pub(crate) diagnostics: Vec<ScanError>,
}

/// Everything a run produces, handed to the report writers.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct ProjectReport {
    /// Name of the project module, if one was scanned.
    pub(crate) project: Option<String>,
    /// Project module first, then dependencies in input order.
    pub(crate) modules: Vec<ModulePermissions>,
    /// Union over the project module and non-test dependencies.
    pub(crate) policy: PolicySet,
    /// Union over non-test dependencies only.
    pub(crate) dependency_policy: PolicySet,
    pub(crate) diagnostics: Vec<ScanError>,
    pub(crate) class_count: usize,
}

/// Permission extraction over classes, archives and whole projects.
pub(crate) struct Engine<'a> {
    knowledge: &'a KnowledgeBase,
    telemetry: Option<Arc<Telemetry>>,
}

impl<'a> Engine<'a> {
    pub(crate) fn new(knowledge: &'a KnowledgeBase) -> Self {
        Self {
            knowledge,
            telemetry: None,
        }
    }

    pub(crate) fn with_telemetry(mut self, telemetry: Option<Arc<Telemetry>>) -> Self {
        self.telemetry = telemetry;
        self
    }

    fn telemetry(&self) -> Option<&Telemetry> {
        self.telemetry.as_deref()
    }

    /// Findings for one class entry, ordered by line.
    pub(crate) fn examine_class(
        &self,
        module: &str,
        entry: &str,
        bytes: &[u8],
    ) -> Result<Vec<ModulePermission>, ScanError> {
        let class = parse_class(bytes).map_err(|err| ScanError::malformed(module, entry, &err))?;
        Ok(self.class_findings(&class))
    }

    fn class_findings(&self, class: &Class) -> Vec<ModulePermission> {
        let mut findings = Vec::new();
        for method in &class.methods {
            for call in call_sites(method) {
                let permissions = self.knowledge.resolve(&call);
                if permissions.is_empty() {
                    continue;
                }
                trace!(
                    class = %class.name,
                    owner = %call.call.owner,
                    name = %call.call.name,
                    kind = ?call.call.kind,
                    "sensitive call"
                );
                findings.push(ModulePermission::new(
                    &class.name,
                    &method.name,
                    &method.descriptor,
                    call.line,
                    permissions,
                ));
            }
        }
        order_by_line(&mut findings);
        findings
    }

    /// Scan every class entry of one artifact. Never fails: problems become diagnostics.
    pub(crate) fn examine_archive(&self, artifact: &Artifact) -> ArchiveScan {
        let module = artifact.module_name.as_str();
        traced(self.telemetry(), Phase::Archive(artifact), || {
            let archive = match open_archive(artifact) {
                Ok(archive) => archive,
                Err(err) => {
                    warn!("skipping {}: {err}", artifact.path.display());
                    record_diagnostic(&err);
                    return ArchiveScan {
                        permissions: ModulePermissions::new(module, artifact.scope, Vec::new()),
                        class_count: 0,
                        diagnostics: vec![err],
                    };
                }
            };
            debug!(module, entries = archive.entry_names().len(), "opened module");
            let mut entries = archive.entries();
            let parent = OtelContext::current();
            let mut permissions = Vec::new();
            let mut diagnostics = Vec::new();
            let mut class_count = 0;
            loop {
                // Read a batch in name order, then parse it in parallel and drop the bytes.
                let batch: Vec<ArchiveEntry> = entries.by_ref().take(ENTRY_BATCH).collect();
                if batch.is_empty() {
                    break;
                }
                let results: Vec<Result<Vec<ModulePermission>, ScanError>> = batch
                    .par_iter()
                    .map(|entry| {
                        let data = entry.data.as_ref().map_err(Clone::clone)?;
                        let phase = Phase::Class {
                            module,
                            entry: &entry.name,
                        };
                        traced_under(self.telemetry(), &parent, phase, || {
                            self.examine_class(module, &entry.name, data)
                        })
                    })
                    .collect();
                for result in results {
                    match result {
                        Ok(findings) => {
                            class_count += 1;
                            permissions.extend(findings);
                        }
                        Err(err) => {
                            warn!(module = err.module(), "{err}");
                            record_diagnostic(&err);
                            diagnostics.push(err);
                        }
                    }
                }
            }
            debug!(
                module,
                classes = class_count,
                findings = permissions.len(),
                "scanned module"
            );
            ArchiveScan {
                permissions: ModulePermissions::new(module, artifact.scope, permissions),
                class_count,
                diagnostics,
            }
        })
    }

    /// Scan the project output and its dependencies concurrently.
    ///
    /// Test-scoped dependencies are scanned only when `include_test` is set,
    /// and never contribute to the project policy.
    pub(crate) fn examine_project(
        &self,
        project: Option<&Artifact>,
        dependencies: &[Artifact],
        include_test: bool,
    ) -> ProjectReport {
        let started_at = Instant::now();
        let artifacts: Vec<&Artifact> = project
            .into_iter()
            .chain(
                dependencies
                    .iter()
                    .filter(|artifact| include_test || artifact.scope != Scope::Test),
            )
            .collect();
        let parent = OtelContext::current();
        let scans: Vec<ArchiveScan> = artifacts
            .par_iter()
            .map(|artifact| {
                let _guard = parent.clone().attach();
                self.examine_archive(artifact)
            })
            .collect();

        let mut aggregator = ProjectAggregator::default();
        let mut diagnostics = Vec::new();
        let mut class_count = 0;
        for scan in scans {
            class_count += scan.class_count;
            diagnostics.extend(scan.diagnostics);
            aggregator.add(scan.permissions);
        }
        let aggregated = aggregator.finish();
        debug!(
            modules = aggregated.modules.len(),
            classes = class_count,
            grants = aggregated.policy.len(),
            diagnostics = diagnostics.len(),
            duration_ms = started_at.elapsed().as_millis() as u64,
            "scan finished"
        );
        ProjectReport {
            project: project.map(|artifact| artifact.module_name.clone()),
            modules: aggregated.modules,
            policy: aggregated.policy,
            dependency_policy: aggregated.dependency_policy,
            diagnostics,
            class_count,
        }
    }
}
