use std::fmt;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use serde::Serialize;
use zip::ZipArchive;

use crate::error::ScanError;

/// Role an input plays in the project.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum Scope {
    /// The project's own compiled output.
    Project,
    /// A dependency needed at runtime.
    Compile,
    /// A dependency used only by tests.
    Test,
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Scope::Project => "project",
            Scope::Compile => "compile",
            Scope::Test => "test",
        })
    }
}

/// One input to scan: a packaged archive, a classes directory or a class file.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct Artifact {
    pub(crate) path: PathBuf,
    /// File name of `path`; identifies the module in every output.
    pub(crate) module_name: String,
    pub(crate) scope: Scope,
}

impl Artifact {
    pub(crate) fn new(path: impl Into<PathBuf>, scope: Scope) -> Self {
        let path = path.into();
        let module_name = path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| path.display().to_string());
        Self {
            path,
            module_name,
            scope,
        }
    }
}

/// Class entry bytes, or the reason they could not be read.
#[derive(Debug)]
pub(crate) struct ArchiveEntry {
    pub(crate) name: String,
    pub(crate) data: Result<Vec<u8>, ScanError>,
}

/// Opened input with its class entry names sorted.
pub(crate) struct Archive {
    module_name: String,
    source: Source,
    entry_names: Vec<String>,
}

enum Source {
    Zip(ZipArchive<fs::File>),
    Directory(PathBuf),
    ClassFile(PathBuf),
}

impl Archive {
    pub(crate) fn entry_names(&self) -> &[String] {
        &self.entry_names
    }

    /// Class entries in name order, each read only when the iterator reaches it.
    pub(crate) fn entries(mut self) -> Entries {
        let names = std::mem::take(&mut self.entry_names).into_iter();
        Entries {
            archive: self,
            names,
        }
    }

    fn read_entry(&mut self, name: &str) -> Result<Vec<u8>, ScanError> {
        let malformed = |err: std::io::Error| ScanError::MalformedClass {
            module: self.module_name.clone(),
            entry: name.to_string(),
            reason: err.to_string(),
        };
        match &mut self.source {
            Source::Zip(archive) => {
                let mut entry = archive.by_name(name).map_err(|err| ScanError::MalformedClass {
                    module: self.module_name.clone(),
                    entry: name.to_string(),
                    reason: err.to_string(),
                })?;
                let mut data = Vec::new();
                entry.read_to_end(&mut data).map_err(malformed)?;
                Ok(data)
            }
            Source::Directory(root) => fs::read(root.join(name)).map_err(malformed),
            Source::ClassFile(path) => fs::read(path.as_path()).map_err(malformed),
        }
    }
}

/// Lazy reader over the class entries of one archive.
pub(crate) struct Entries {
    archive: Archive,
    names: std::vec::IntoIter<String>,
}

impl Iterator for Entries {
    type Item = ArchiveEntry;

    fn next(&mut self) -> Option<Self::Item> {
        let name = self.names.next()?;
        let data = self.archive.read_entry(&name);
        Some(ArchiveEntry { name, data })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.names.size_hint()
    }
}

/// Open an artifact for reading. Failure here skips the whole artifact.
pub(crate) fn open_archive(artifact: &Artifact) -> Result<Archive, ScanError> {
    let path = artifact.path.as_path();
    let module = artifact.module_name.as_str();
    if path.is_dir() {
        let mut entry_names = Vec::new();
        collect_class_files(path, path, &mut entry_names)
            .map_err(|err| ScanError::unreadable(module, err))?;
        entry_names.retain(|name| is_scanned_entry(name));
        entry_names.sort();
        return Ok(Archive {
            module_name: module.to_string(),
            source: Source::Directory(path.to_path_buf()),
            entry_names,
        });
    }

    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    match extension.as_str() {
        "class" => Ok(Archive {
            module_name: module.to_string(),
            source: Source::ClassFile(path.to_path_buf()),
            entry_names: vec![module.to_string()],
        }),
        "jar" | "war" | "ear" | "zip" => {
            let file = fs::File::open(path).map_err(|err| ScanError::unreadable(module, err))?;
            let mut archive =
                ZipArchive::new(file).map_err(|err| ScanError::unreadable(module, err))?;
            let mut entry_names = Vec::new();
            for index in 0..archive.len() {
                let entry = archive
                    .by_index(index)
                    .map_err(|err| ScanError::unreadable(module, err))?;
                if entry.is_dir() {
                    continue;
                }
                let name = entry.name().to_string();
                if is_scanned_entry(&name) {
                    entry_names.push(name);
                }
            }
            entry_names.sort();
            Ok(Archive {
                module_name: module.to_string(),
                source: Source::Zip(archive),
                entry_names,
            })
        }
        _ => Err(ScanError::unreadable(
            module,
            format!("unsupported input file: {}", path.display()),
        )),
    }
}

/// Class entries, skipping module descriptors and multi-release copies.
fn is_scanned_entry(name: &str) -> bool {
    name.ends_with(".class")
        && !name.ends_with("module-info.class")
        && !name.starts_with("META-INF/versions/")
}

fn collect_class_files(
    root: &Path,
    dir: &Path,
    entry_names: &mut Vec<String>,
) -> std::io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        // Symlinks are not followed, so a link back to an ancestor cannot loop.
        let file_type = entry.file_type()?;
        let path = entry.path();
        if file_type.is_dir() {
            collect_class_files(root, &path, entry_names)?;
            continue;
        }
        if !file_type.is_file() {
            continue;
        }
        let Ok(relative) = path.strip_prefix(root) else {
            continue;
        };
        let name = relative
            .components()
            .map(|component| component.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        entry_names.push(name);
    }
    Ok(())
}
