// Content search across files in the sandbox

use crate::tools::truncate_output;
use anyhow::{Context, Result};
use regex::Regex;
use serde::Deserialize;
use std::path::Path;
use toolgate_core::registry::{json_schema_object, json_schema_string};
use toolgate_core::{Sandbox, Tool, ToolDescriptor};
use walkdir::WalkDir;

const MAX_MATCHES: usize = 200;
const MAX_FILE_BYTES: u64 = 2 * 1024 * 1024;

#[derive(Debug, Deserialize)]
struct GrepArgs {
    pattern: String,
    #[serde(default)]
    path: Option<String>,
}

/// Tool to search file contents with a regular expression
pub struct GrepTool {
    sandbox: Sandbox,
    max_output_bytes: usize,
}

impl GrepTool {
    pub fn new(sandbox: Sandbox, max_output_bytes: usize) -> Self {
        Self {
            sandbox,
            max_output_bytes,
        }
    }
}

#[async_trait::async_trait]
impl Tool for GrepTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: "grep".to_string(),
            description: format!(
                "Search files for lines matching a regular expression. Reports up to {} matches as path:line: text.",
                MAX_MATCHES
            ),
            parameters: json_schema_object(
                serde_json::json!({
                    "pattern": json_schema_string("Regular expression to search for"),
                    "path": json_schema_string("File or directory to search (default: workspace root)")
                }),
                vec!["pattern"],
            ),
        }
    }

    async fn execute(&self, params: serde_json::Value) -> Result<String> {
        let args: GrepArgs = serde_json::from_value(params).context("Invalid arguments for grep")?;
        let regex = Regex::new(&args.pattern)
            .with_context(|| format!("Invalid pattern: {}", args.pattern))?;
        let root = self.sandbox.resolve(args.path.as_deref().unwrap_or("."))?;

        let sandbox = self.sandbox.clone();
        let (matches, truncated) =
            tokio::task::spawn_blocking(move || search(&sandbox, &root, &regex))
                .await
                .context("Search task panicked")?;

        if matches.is_empty() {
            return Ok(format!("No matches for {}", args.pattern));
        }

        let mut output = matches.join("\n");
        if truncated {
            output.push_str(&format!("\n... (stopped after {} matches)", MAX_MATCHES));
        }
        Ok(truncate_output(output, self.max_output_bytes))
    }
}

fn search(sandbox: &Sandbox, root: &Path, regex: &Regex) -> (Vec<String>, bool) {
    let mut matches = Vec::new();

    let walker = WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| {
            let name = e.file_name().to_string_lossy();
            e.depth() == 0 || !(name.starts_with('.') || name == "target" || name == "node_modules")
        })
        .filter_map(|e| e.ok());

    for entry in walker {
        if !entry.file_type().is_file() {
            continue;
        }
        if entry.metadata().map(|m| m.len() > MAX_FILE_BYTES).unwrap_or(true) {
            continue;
        }
        // Binary or unreadable files are skipped
        let Ok(content) = std::fs::read_to_string(entry.path()) else {
            continue;
        };

        let display = sandbox.display(entry.path());
        for (number, line) in content.lines().enumerate() {
            if regex.is_match(line) {
                if matches.len() == MAX_MATCHES {
                    return (matches, true);
                }
                matches.push(format!("{}:{}: {}", display, number + 1, line.trim_end()));
            }
        }
    }

    (matches, false)
}
