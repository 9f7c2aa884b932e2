//! Offline output.
//!
//! Writes a flat mapped view to disk and renders human-readable summaries of images and
//! dependency trees for the command-line tool.

use anyhow::{Context, Result};
use std::fmt::Write as _;
use std::path::Path;

use crate::image::ImageDescriptor;
use crate::layout::Layout;
use crate::resolver::{DependencyNode, NodeStatus};
use crate::symbol::ExportTarget;

/// Writes the flat view of `layout` to `output_path`.
pub fn write_layout(output_path: &Path, layout: &Layout) -> Result<()> {
    std::fs::write(output_path, layout.data())
        .with_context(|| format!("failed to write {}", output_path.display()))?;
    tracing::debug!(
        "wrote {:#x} bytes for base {:#x} to {}",
        layout.len(),
        layout.base(),
        output_path.display()
    );
    Ok(())
}

/// Multi-line description of an image's headers and directories.
pub fn describe(name: &str, image: &ImageDescriptor) -> String {
    let mut out = String::new();
    let kind = if image.is_dll() { "dll" } else { "executable" };
    let _ = writeln!(out, "{name}: {} {kind}", image.machine);
    let _ = writeln!(out, "  preferred base   {:#x}", image.preferred_base);
    let _ = writeln!(out, "  size of image    {:#x}", image.size_of_image);
    match image.entry_point() {
        Some(rva) => {
            let _ = writeln!(out, "  entry point      {rva:#x}");
        }
        None => {
            let _ = writeln!(out, "  entry point      none");
        }
    }
    let _ = writeln!(
        out,
        "  fixed base       {}",
        if image.requires_fixed_base() { "yes" } else { "no" }
    );

    let _ = writeln!(out, "sections:");
    for section in &image.sections {
        let _ = writeln!(
            out,
            "  {:<8} {:#010x} {:#08x} raw {:#08x} flags {:#010x}",
            section.name.trim_end_matches('\0'),
            section.virtual_address,
            section.virtual_size,
            section.data.len(),
            section.characteristics
        );
    }

    let _ = writeln!(out, "imports:");
    for module in &image.imports.modules {
        let _ = writeln!(out, "  {} ({} symbols)", module.name, module.entries.len());
        for entry in &module.entries {
            let _ = writeln!(out, "    {:#010x} {}", entry.slot_rva, entry.symbol);
        }
    }

    let _ = writeln!(out, "exports: {}", image.exports.len());
    for (export, ordinal) in image.exports.names() {
        let target = image
            .exports
            .lookup(&crate::symbol::ImportSymbol::Name(export.to_string()));
        match target {
            Some(ExportTarget::Rva(rva)) => {
                let _ = writeln!(out, "  #{ordinal:<5} {export} @ {rva:#x}");
            }
            Some(ExportTarget::Forward { module, symbol }) => {
                let _ = writeln!(out, "  #{ordinal:<5} {export} -> {module}!{symbol}");
            }
            None => {}
        }
    }

    let _ = writeln!(
        out,
        "relocations: {} in {} pages",
        image.relocations.len(),
        image.relocations.pages.len()
    );
    if let Some(tls) = &image.tls {
        let _ = writeln!(
            out,
            "tls: template {:#x}..{:#x}, zero fill {:#x}, {} callbacks",
            tls.template_start,
            tls.template_end,
            tls.zero_fill,
            tls.callbacks.len()
        );
    }
    if !image.exceptions.is_empty() {
        let _ = writeln!(out, "runtime functions: {}", image.exceptions.functions.len());
    }
    out
}

/// One line per node, indented by depth.
pub fn describe_tree(nodes: &[DependencyNode]) -> String {
    let mut out = String::new();
    for node in nodes {
        let status = match &node.status {
            NodeStatus::Found => String::new(),
            NodeStatus::Missing => " (not found)".to_string(),
            NodeStatus::Seen => " (see above)".to_string(),
            NodeStatus::Invalid(reason) => format!(" (invalid: {reason})"),
        };
        let _ = writeln!(out, "{}{}{}", "  ".repeat(node.depth), node.name, status);
    }
    out
}
