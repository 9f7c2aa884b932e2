//! Dependency lookup.
//!
//! Module name normalization and the `ImageSource` seam the mapping session uses to fetch the
//! bytes of dependencies that are not already loaded in the target. The recursive mapping
//! itself lives in the session; this module also offers an offline walk of the dependency
//! graph for diagnostics.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::path::{Path, PathBuf};

use memmap2::Mmap;

use crate::error::MapError;
use crate::image::ImageDescriptor;

/// Canonical form of a module name: file name only, ASCII lowercase, `.dll` when there is no
/// extension.
pub fn normalize_module_name(name: &str) -> String {
    let file = name.rsplit(|c: char| c == '\\' || c == '/').next().unwrap_or(name);
    let mut normalized = file.to_ascii_lowercase();
    if !normalized.contains('.') {
        normalized.push_str(".dll");
    }
    normalized
}

/// Provides raw image bytes for dependencies.
pub trait ImageSource {
    /// Returns `None` when the source has no image of that name.
    fn load(&self, name: &str) -> Result<Option<Vec<u8>>, MapError>;
}

/// Looks dependencies up in a list of directories, matching file names case-insensitively.
#[derive(Debug, Clone, Default)]
pub struct SearchPath {
    dirs: Vec<PathBuf>,
}

impl SearchPath {
    pub fn new(dirs: impl IntoIterator<Item = PathBuf>) -> Self {
        Self {
            dirs: dirs.into_iter().collect(),
        }
    }

    pub fn push(&mut self, dir: impl Into<PathBuf>) {
        self.dirs.push(dir.into());
    }

    fn find(&self, name: &str) -> Result<Option<PathBuf>, MapError> {
        for dir in &self.dirs {
            let exact = dir.join(name);
            if exact.is_file() {
                return Ok(Some(exact));
            }
            let Ok(entries) = std::fs::read_dir(dir) else {
                tracing::debug!("skipping unreadable search dir {}", dir.display());
                continue;
            };
            for entry in entries {
                let entry = entry?;
                if entry.file_name().to_string_lossy().eq_ignore_ascii_case(name)
                    && entry.path().is_file()
                {
                    return Ok(Some(entry.path()));
                }
            }
        }
        Ok(None)
    }
}

impl ImageSource for SearchPath {
    fn load(&self, name: &str) -> Result<Option<Vec<u8>>, MapError> {
        let Some(path) = self.find(name)? else {
            return Ok(None);
        };
        tracing::debug!("loading {} from {}", name, path.display());
        read_image(&path).map(Some)
    }
}

/// Reads an image file through a memory map.
pub fn read_image(path: &Path) -> Result<Vec<u8>, MapError> {
    let file = File::open(path)?;
    // SAFETY: the mapping is copied out immediately and never outlives this call.
    let mmap = unsafe { Mmap::map(&file)? };
    Ok(mmap.to_vec())
}

/// Images held in memory, keyed by normalized name.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    images: HashMap<String, Vec<u8>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: &str, bytes: Vec<u8>) {
        self.images.insert(normalize_module_name(name), bytes);
    }

    pub fn with(mut self, name: &str, bytes: Vec<u8>) -> Self {
        self.insert(name, bytes);
        self
    }
}

impl ImageSource for MemorySource {
    fn load(&self, name: &str) -> Result<Option<Vec<u8>>, MapError> {
        Ok(self.images.get(&normalize_module_name(name)).cloned())
    }
}

/// Outcome of looking up one node during an offline dependency walk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeStatus {
    Found,
    Missing,
    /// Already listed higher up (shared dependency or cycle).
    Seen,
    /// Present but not a parseable image.
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyNode {
    pub name: String,
    pub depth: usize,
    pub status: NodeStatus,
}

/// Walks the dependency graph of `root` depth-first without touching any process.
pub fn dependency_tree(
    root_name: &str,
    root: &ImageDescriptor,
    source: &dyn ImageSource,
) -> Result<Vec<DependencyNode>, MapError> {
    let mut nodes = Vec::new();
    let mut seen = HashSet::new();
    let root_name = normalize_module_name(root_name);
    seen.insert(root_name.clone());
    nodes.push(DependencyNode {
        name: root_name,
        depth: 0,
        status: NodeStatus::Found,
    });
    walk(root, 1, source, &mut seen, &mut nodes)?;
    Ok(nodes)
}

fn walk(
    image: &ImageDescriptor,
    depth: usize,
    source: &dyn ImageSource,
    seen: &mut HashSet<String>,
    nodes: &mut Vec<DependencyNode>,
) -> Result<(), MapError> {
    for name in image.imports.dependencies() {
        if !seen.insert(name.to_string()) {
            nodes.push(DependencyNode {
                name: name.to_string(),
                depth,
                status: NodeStatus::Seen,
            });
            continue;
        }
        let Some(bytes) = source.load(name)? else {
            nodes.push(DependencyNode {
                name: name.to_string(),
                depth,
                status: NodeStatus::Missing,
            });
            continue;
        };
        match ImageDescriptor::parse_named(name, &bytes) {
            Ok(child) => {
                nodes.push(DependencyNode {
                    name: name.to_string(),
                    depth,
                    status: NodeStatus::Found,
                });
                walk(&child, depth + 1, source, seen, nodes)?;
            }
            Err(e) => nodes.push(DependencyNode {
                name: name.to_string(),
                depth,
                status: NodeStatus::Invalid(e.to_string()),
            }),
        }
    }
    Ok(())
}
