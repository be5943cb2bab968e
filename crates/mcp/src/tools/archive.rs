// Archive tools: create and extract ZIP files inside the sandbox

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs::File;
use std::path::{Path, PathBuf};
use toolgate_core::registry::{json_schema_object, json_schema_string};
use toolgate_core::{Sandbox, Tool, ToolDescriptor};
use walkdir::WalkDir;

#[derive(Debug, Deserialize)]
struct ArchiveArgs {
    source: String,
    destination: String,
}

/// Tool to pack a file or directory into a ZIP archive
pub struct ZipTool {
    sandbox: Sandbox,
}

impl ZipTool {
    pub fn new(sandbox: Sandbox) -> Self {
        Self { sandbox }
    }
}

#[async_trait::async_trait]
impl Tool for ZipTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: "zip".to_string(),
            description: "Compress a file or directory into a ZIP archive.".to_string(),
            parameters: json_schema_object(
                serde_json::json!({
                    "source": json_schema_string("File or directory to compress"),
                    "destination": json_schema_string("Path of the archive to create, e.g. out.zip")
                }),
                vec!["source", "destination"],
            ),
        }
    }

    async fn execute(&self, params: serde_json::Value) -> Result<String> {
        let args: ArchiveArgs = serde_json::from_value(params).context("Invalid arguments for zip")?;
        let source = self.sandbox.resolve(&args.source)?;
        let destination = self.sandbox.resolve(&args.destination)?;

        if !source.exists() {
            bail!("Source not found: {}", args.source);
        }

        let (src, dst) = (source.clone(), destination.clone());
        let files = tokio::task::spawn_blocking(move || write_archive(&src, &dst))
            .await
            .context("Archive task panicked")??;

        Ok(format!(
            "Compressed {} file(s) from {} into {}",
            files,
            self.sandbox.display(&source),
            self.sandbox.display(&destination)
        ))
    }
}

/// Tool to extract a ZIP archive
pub struct UnzipTool {
    sandbox: Sandbox,
}

impl UnzipTool {
    pub fn new(sandbox: Sandbox) -> Self {
        Self { sandbox }
    }
}

#[async_trait::async_trait]
impl Tool for UnzipTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: "unzip".to_string(),
            description: "Extract a ZIP archive into a directory.".to_string(),
            parameters: json_schema_object(
                serde_json::json!({
                    "source": json_schema_string("Archive to extract"),
                    "destination": json_schema_string("Directory to extract into")
                }),
                vec!["source", "destination"],
            ),
        }
    }

    async fn execute(&self, params: serde_json::Value) -> Result<String> {
        let args: ArchiveArgs = serde_json::from_value(params).context("Invalid arguments for unzip")?;
        let source = self.sandbox.resolve(&args.source)?;
        let destination = self.sandbox.resolve(&args.destination)?;

        let (src, dst) = (source.clone(), destination.clone());
        let files = tokio::task::spawn_blocking(move || extract_archive(&src, &dst))
            .await
            .context("Extract task panicked")??;

        Ok(format!(
            "Extracted {} file(s) from {} into {}",
            files,
            self.sandbox.display(&source),
            self.sandbox.display(&destination)
        ))
    }
}

fn write_archive(source: &Path, destination: &Path) -> Result<usize> {
    if let Some(parent) = destination.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = File::create(destination)
        .with_context(|| format!("Failed to create {}", destination.display()))?;
    let mut zip = zip::ZipWriter::new(file);
    let options =
        zip::write::FileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    // Entries are named relative to the source's parent, so a directory
    // keeps its own name inside the archive
    let base = source.parent().unwrap_or(source);
    let mut files = 0;

    for entry in WalkDir::new(source).into_iter().filter_map(|e| e.ok()) {
        let path = entry.path();
        if path == destination {
            continue;
        }

        let relative = path.strip_prefix(base)?;
        if relative.as_os_str().is_empty() {
            continue;
        }
        let name = relative.to_string_lossy().replace('\\', "/");

        if entry.file_type().is_dir() {
            zip.add_directory(name, options)?;
        } else if entry.file_type().is_file() {
            zip.start_file(name, options)?;
            let mut input = File::open(path)
                .with_context(|| format!("Failed to open {}", path.display()))?;
            std::io::copy(&mut input, &mut zip)?;
            files += 1;
        }
    }

    zip.finish().context("Failed to finalize archive")?;
    Ok(files)
}

fn extract_archive(source: &Path, destination: &Path) -> Result<usize> {
    let file = File::open(source).with_context(|| format!("Failed to open {}", source.display()))?;
    let mut archive = zip::ZipArchive::new(file).context("Invalid ZIP archive")?;
    std::fs::create_dir_all(destination)?;

    let mut files = 0;
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;

        let Some(relative) = entry.enclosed_name().map(PathBuf::from) else {
            bail!("Unsafe path in archive: {}", entry.name());
        };
        let target = destination.join(relative);

        if entry.is_dir() {
            std::fs::create_dir_all(&target)?;
        } else {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut output = File::create(&target)
                .with_context(|| format!("Failed to create {}", target.display()))?;
            std::io::copy(&mut entry, &mut output)?;
            files += 1;
        }
    }

    Ok(files)
}
