// Web tools for fetching external content and searching

use crate::tools::{truncate_output, ToolsConfig};
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use toolgate_core::registry::{json_schema_boolean, json_schema_object, json_schema_string};
use toolgate_core::{Tool, ToolDescriptor};
use url::Url;

const MAX_SEARCH_RESULTS: usize = 8;

fn http_client(config: &ToolsConfig) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(concat!("toolgate/", env!("CARGO_PKG_VERSION")))
        .timeout(config.fetch_timeout())
        .build()
        .context("Failed to create HTTP client")
}

/// Tool to fetch content from web URLs
pub struct FetchUrlTool {
    client: reqwest::Client,
    allowed_domains: Vec<String>,
    max_output_bytes: usize,
}

impl FetchUrlTool {
    pub fn new(config: &ToolsConfig) -> Result<Self> {
        Ok(Self {
            client: http_client(config)?,
            allowed_domains: config.allowed_domains.clone(),
            max_output_bytes: config.max_output_bytes,
        })
    }

    fn is_domain_allowed(&self, url: &Url) -> bool {
        if self.allowed_domains.is_empty() {
            return true;
        }

        let Some(host) = url.host_str() else {
            return false;
        };
        self.allowed_domains
            .iter()
            .any(|allowed| host == allowed || host.ends_with(&format!(".{}", allowed)))
    }
}

#[derive(Debug, Deserialize)]
struct FetchUrlArgs {
    url: String,
    #[serde(default)]
    include_headers: bool,
}

#[async_trait::async_trait]
impl Tool for FetchUrlTool {
    fn descriptor(&self) -> ToolDescriptor {
        let mut description = "Fetch a web page or API response over HTTP(S) and return its body.".to_string();
        if !self.allowed_domains.is_empty() {
            description.push_str(&format!(" Only allowed domains: {}", self.allowed_domains.join(", ")));
        }

        ToolDescriptor {
            name: "fetchUrl".to_string(),
            description,
            parameters: json_schema_object(
                serde_json::json!({
                    "url": json_schema_string("The URL to fetch"),
                    "include_headers": json_schema_boolean("Include HTTP status and response headers (default: false)")
                }),
                vec!["url"],
            ),
        }
    }

    async fn execute(&self, params: serde_json::Value) -> Result<String> {
        let args: FetchUrlArgs =
            serde_json::from_value(params).context("Invalid arguments for fetchUrl")?;

        let url = Url::parse(&args.url).with_context(|| format!("Invalid URL: {}", args.url))?;
        if url.scheme() != "http" && url.scheme() != "https" {
            bail!("Only HTTP/HTTPS URLs are supported, got: {}", url.scheme());
        }
        if !self.is_domain_allowed(&url) {
            bail!(
                "Domain not allowed: {}. Allowed domains: {}",
                url.host_str().unwrap_or("unknown"),
                self.allowed_domains.join(", ")
            );
        }

        let response = self
            .client
            .get(url.as_str())
            .send()
            .await
            .with_context(|| format!("HTTP request to {} failed", url))?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response.text().await.context("Failed to read response body")?;

        let mut output = String::new();
        if args.include_headers {
            output.push_str(&format!("HTTP Status: {}\n\nHeaders:\n", status));
            for (name, value) in headers.iter() {
                output.push_str(&format!(
                    "  {}: {}\n",
                    name,
                    value.to_str().unwrap_or("<non-utf8>")
                ));
            }
            output.push_str("\nBody:\n");
        } else if !status.is_success() {
            output.push_str(&format!("HTTP Status: {}\n\n", status));
        }
        output.push_str(&body);

        Ok(truncate_output(output, self.max_output_bytes))
    }
}

/// Instant-answer response; field names follow the DuckDuckGo API
#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
struct InstantAnswer {
    heading: String,
    answer: String,
    abstract_text: String,
    #[serde(rename = "AbstractURL")]
    abstract_url: String,
    definition: String,
    related_topics: Vec<RelatedTopic>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
struct RelatedTopic {
    text: String,
    #[serde(rename = "FirstURL")]
    first_url: String,
    /// Grouped topics nest further entries
    topics: Vec<RelatedTopic>,
}

impl InstantAnswer {
    fn render(&self, query: &str) -> String {
        let mut lines = Vec::new();

        if !self.heading.is_empty() {
            lines.push(self.heading.clone());
        }
        if !self.answer.is_empty() {
            lines.push(format!("Answer: {}", self.answer));
        }
        if !self.abstract_text.is_empty() {
            lines.push(self.abstract_text.clone());
            if !self.abstract_url.is_empty() {
                lines.push(format!("Source: {}", self.abstract_url));
            }
        }
        if !self.definition.is_empty() {
            lines.push(format!("Definition: {}", self.definition));
        }

        let topics: Vec<&RelatedTopic> = self
            .related_topics
            .iter()
            .flat_map(|topic| {
                if topic.topics.is_empty() {
                    vec![topic]
                } else {
                    topic.topics.iter().collect()
                }
            })
            .filter(|topic| !topic.text.is_empty())
            .take(MAX_SEARCH_RESULTS)
            .collect();

        if !topics.is_empty() {
            lines.push(String::new());
            lines.push("Related:".to_string());
            for topic in topics {
                lines.push(format!("- {} ({})", topic.text, topic.first_url));
            }
        }

        if lines.is_empty() {
            format!("No results for {}", query)
        } else {
            lines.join("\n")
        }
    }
}

/// Tool to search the web through an instant-answer endpoint
pub struct SearchTool {
    client: reqwest::Client,
    endpoint: Url,
}

impl SearchTool {
    pub fn new(config: &ToolsConfig) -> Result<Self> {
        let endpoint = Url::parse(&config.search_endpoint)
            .with_context(|| format!("Invalid search endpoint: {}", config.search_endpoint))?;
        Ok(Self {
            client: http_client(config)?,
            endpoint,
        })
    }
}

#[derive(Debug, Deserialize)]
struct SearchArgs {
    query: String,
}

#[async_trait::async_trait]
impl Tool for SearchTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: "search".to_string(),
            description: "Search the web and return a short summary with related links.".to_string(),
            parameters: json_schema_object(
                serde_json::json!({
                    "query": json_schema_string("Search query")
                }),
                vec!["query"],
            ),
        }
    }

    async fn execute(&self, params: serde_json::Value) -> Result<String> {
        let args: SearchArgs = serde_json::from_value(params).context("Invalid arguments for search")?;
        if args.query.trim().is_empty() {
            bail!("Search query is empty");
        }

        let response = self
            .client
            .get(self.endpoint.clone())
            .query(&[
                ("q", args.query.as_str()),
                ("format", "json"),
                ("no_html", "1"),
                ("skip_disambig", "1"),
            ])
            .send()
            .await
            .context("Search request failed")?
            .error_for_status()
            .context("Search endpoint returned an error")?;

        let answer: InstantAnswer = response
            .json()
            .await
            .context("Search endpoint returned an unexpected body")?;

        Ok(answer.render(&args.query))
    }
}
