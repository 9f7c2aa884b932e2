//! Entry point for the manmap tool.
//!
//! This file handles high-level application flow:
//! 1. Parse command-line arguments using `clap`.
//! 2. Initialize logging from `--log-level`.
//! 3. Read the image through a memory map and run the requested offline command.
//!
//! Error handling is done via `anyhow`.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

use manmap::config::{Command, Config};
use manmap::fixup;
use manmap::image::ImageDescriptor;
use manmap::layout::Layout;
use manmap::resolver::{dependency_tree, read_image, SearchPath};
use manmap::writer;

fn main() -> Result<()> {
    let config = Config::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&config.log_level))
        .with_writer(std::io::stderr)
        .init();

    match config.command {
        Command::Inspect { image } => {
            let (name, descriptor) = load(&image)?;
            print!("{}", writer::describe(&name, &descriptor));
        }
        Command::Layout {
            image,
            base,
            output,
        } => {
            let (name, descriptor) = load(&image)?;
            let mut layout = Layout::new(&descriptor);
            if let Some(base) = base {
                fixup::relocate(&name, &descriptor, &mut layout, base)
                    .with_context(|| format!("failed to relocate {name} to {base:#x}"))?;
            }
            writer::write_layout(&output, &layout)?;
            println!(
                "Laid out {} ({:#x} bytes at {:#x}) to {}",
                name,
                layout.len(),
                layout.base(),
                output.display()
            );
        }
        Command::Deps { image, search_path } => {
            let (name, descriptor) = load(&image)?;
            let mut dirs: Vec<PathBuf> = image.parent().map(Path::to_path_buf).into_iter().collect();
            dirs.extend(search_path);
            let source = SearchPath::new(dirs);
            let nodes = dependency_tree(&name, &descriptor, &source)?;
            print!("{}", writer::describe_tree(&nodes));
        }
    }
    Ok(())
}

fn load(path: &Path) -> Result<(String, ImageDescriptor)> {
    let bytes = read_image(path).with_context(|| format!("failed to open {}", path.display()))?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    let descriptor = ImageDescriptor::parse_named(&name, &bytes)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    Ok((name, descriptor))
}
