// Filesystem tools confined to the sandbox root

use crate::tools::truncate_output;
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use toolgate_core::registry::{json_schema_object, json_schema_string};
use toolgate_core::{Sandbox, Tool, ToolDescriptor};

#[derive(Debug, Deserialize)]
struct PathArgs {
    path: String,
}

/// Tool to read a text file
pub struct ReadFileTool {
    sandbox: Sandbox,
    max_output_bytes: usize,
}

impl ReadFileTool {
    pub fn new(sandbox: Sandbox, max_output_bytes: usize) -> Self {
        Self {
            sandbox,
            max_output_bytes,
        }
    }
}

#[async_trait::async_trait]
impl Tool for ReadFileTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: "readFile".to_string(),
            description: "Read a text file. Paths are relative to the workspace root.".to_string(),
            parameters: json_schema_object(
                serde_json::json!({
                    "path": json_schema_string("Path of the file to read")
                }),
                vec!["path"],
            ),
        }
    }

    async fn execute(&self, params: serde_json::Value) -> Result<String> {
        let args: PathArgs =
            serde_json::from_value(params).context("Invalid arguments for readFile")?;
        let path = self.sandbox.resolve(&args.path)?;

        if path.is_dir() {
            bail!("{} is a directory, use listFiles instead", args.path);
        }

        let bytes = tokio::fs::read(&path)
            .await
            .with_context(|| format!("Failed to read {}", args.path))?;

        match String::from_utf8(bytes) {
            Ok(content) => Ok(truncate_output(content, self.max_output_bytes)),
            Err(e) => Ok(format!(
                "{} is a binary file ({} bytes) and cannot be shown as text",
                args.path,
                e.as_bytes().len()
            )),
        }
    }
}

#[derive(Debug, Deserialize)]
struct WriteFileArgs {
    path: String,
    content: String,
}

/// Tool to create or overwrite a file
pub struct WriteFileTool {
    sandbox: Sandbox,
}

impl WriteFileTool {
    pub fn new(sandbox: Sandbox) -> Self {
        Self { sandbox }
    }
}

#[async_trait::async_trait]
impl Tool for WriteFileTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: "writeFile".to_string(),
            description: "Create or overwrite a file with the given content. Missing parent directories are created.".to_string(),
            parameters: json_schema_object(
                serde_json::json!({
                    "path": json_schema_string("Path of the file to write"),
                    "content": json_schema_string("Full file content")
                }),
                vec!["path", "content"],
            ),
        }
    }

    async fn execute(&self, params: serde_json::Value) -> Result<String> {
        let args: WriteFileArgs =
            serde_json::from_value(params).context("Invalid arguments for writeFile")?;
        let path = self.sandbox.resolve(&args.path)?;

        if path == self.sandbox.root() {
            bail!("Refusing to overwrite the workspace root");
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create parent directory for {}", args.path))?;
        }

        tokio::fs::write(&path, args.content.as_bytes())
            .await
            .with_context(|| format!("Failed to write {}", args.path))?;

        tracing::debug!(path = %path.display(), bytes = args.content.len(), "Wrote file");
        Ok(format!(
            "Wrote {} bytes to {}",
            args.content.len(),
            self.sandbox.display(&path)
        ))
    }
}

#[derive(Debug, Deserialize)]
struct ListFilesArgs {
    #[serde(default)]
    path: Option<String>,
}

/// Tool to list a directory
pub struct ListFilesTool {
    sandbox: Sandbox,
}

impl ListFilesTool {
    pub fn new(sandbox: Sandbox) -> Self {
        Self { sandbox }
    }
}

#[async_trait::async_trait]
impl Tool for ListFilesTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: "listFiles".to_string(),
            description: "List the entries of a directory. Directories end with '/'.".to_string(),
            parameters: json_schema_object(
                serde_json::json!({
                    "path": json_schema_string("Directory to list (default: workspace root)")
                }),
                vec![],
            ),
        }
    }

    async fn execute(&self, params: serde_json::Value) -> Result<String> {
        let args: ListFilesArgs =
            serde_json::from_value(params).context("Invalid arguments for listFiles")?;
        let requested = args.path.unwrap_or_else(|| ".".to_string());
        let path = self.sandbox.resolve(&requested)?;

        let mut dir = tokio::fs::read_dir(&path)
            .await
            .with_context(|| format!("Failed to read directory {}", requested))?;

        let mut entries = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            entries.push(format!("{}{}", name, if is_dir { "/" } else { "" }));
        }
        entries.sort();

        Ok(format!(
            "Directory: {}\n\nContents ({} items):\n{}",
            self.sandbox.display(&path),
            entries.len(),
            entries.join("\n")
        ))
    }
}

/// Tool to delete a file or directory tree
pub struct DeleteFileTool {
    sandbox: Sandbox,
}

impl DeleteFileTool {
    pub fn new(sandbox: Sandbox) -> Self {
        Self { sandbox }
    }
}

#[async_trait::async_trait]
impl Tool for DeleteFileTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: "deleteFile".to_string(),
            description: "Delete a file, or a directory with everything in it.".to_string(),
            parameters: json_schema_object(
                serde_json::json!({
                    "path": json_schema_string("Path of the file or directory to delete")
                }),
                vec!["path"],
            ),
        }
    }

    async fn execute(&self, params: serde_json::Value) -> Result<String> {
        let args: PathArgs =
            serde_json::from_value(params).context("Invalid arguments for deleteFile")?;
        let path = self.sandbox.resolve(&args.path)?;

        if path == self.sandbox.root() {
            bail!("Refusing to delete the workspace root");
        }

        let metadata = tokio::fs::symlink_metadata(&path)
            .await
            .with_context(|| format!("File not found: {}", args.path))?;

        let removed = if metadata.is_dir() {
            tokio::fs::remove_dir_all(&path).await
        } else {
            tokio::fs::remove_file(&path).await
        };
        removed.with_context(|| format!("Failed to delete {}", args.path))?;

        tracing::info!(path = %path.display(), "Deleted");
        Ok(format!("Deleted {}", self.sandbox.display(&path)))
    }
}
