//! Deterministic, budget-free substitutes for full task execution.

use sitebot_core::{SitebotError, SitebotResult, TaskDefinition, TaskMetrics, TaskResult};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// Reported duration of every fallback execution.
pub const FALLBACK_DURATION_MS: u64 = 5;

/// A generated artifact and where it goes, relative to the output directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FallbackArtifact {
    /// Destination path relative to the engine's output directory.
    pub path: PathBuf,
    /// File contents.
    pub content: String,
}

/// A rule: a pure function from a task to its artifact.
pub type FallbackRule = Arc<dyn Fn(&TaskDefinition) -> SitebotResult<FallbackArtifact> + Send + Sync>;

/// Registry and executor of named fallback rules.
pub struct FallbackEngine {
    rules: HashMap<String, FallbackRule>,
    output_dir: PathBuf,
}

impl FallbackEngine {
    /// Empty engine writing under `output_dir`.
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            rules: HashMap::new(),
            output_dir: output_dir.into(),
        }
    }

    /// Engine preloaded with the built-in rules.
    pub fn with_builtin_rules(output_dir: impl Into<PathBuf>) -> Self {
        let mut engine = Self::new(output_dir);
        engine.register("page-stub", Arc::new(page_stub));
        engine.register("seed-content", Arc::new(seed_content));
        engine.register("smoke-test-stub", Arc::new(smoke_test_stub));
        engine
    }

    /// Register (or replace) a rule.
    pub fn register(&mut self, name: impl Into<String>, rule: FallbackRule) {
        self.rules.insert(name.into(), rule);
    }

    /// Whether a rule named `name` exists.
    pub fn has_rule(&self, name: &str) -> bool {
        self.rules.contains_key(name)
    }

    /// Registered rule names, sorted.
    pub fn rule_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.rules.keys().cloned().collect();
        names.sort();
        names
    }

    /// Where artifacts are written.
    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// First rule the task declares that is registered here.
    pub fn select_rule<'a>(&self, task: &'a TaskDefinition) -> Option<&'a str> {
        task.fallback_rules
            .iter()
            .find(|r| self.has_rule(r))
            .map(String::as_str)
    }

    /// Run `rule_name` for `task`, write its artifact and return a
    /// `success` result tagged as a fallback.
    pub async fn execute_rule(
        &self,
        rule_name: &str,
        task: &TaskDefinition,
    ) -> SitebotResult<TaskResult> {
        let rule = self
            .rules
            .get(rule_name)
            .ok_or_else(|| SitebotError::NoFallbackRule(rule_name.to_string()))?;
        let artifact = rule(task)?;
        if artifact.path.is_absolute()
            || artifact
                .path
                .components()
                .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(SitebotError::Validation(format!(
                "fallback rule '{rule_name}' produced a path outside the output directory: {}",
                artifact.path.display()
            )));
        }

        let dest = self.output_dir.join(&artifact.path);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&dest, artifact.content.as_bytes()).await?;
        info!(task_id = %task.id, rule = %rule_name, path = %dest.display(), "Fallback rule applied");

        let metrics = TaskMetrics {
            duration_ms: Some(FALLBACK_DURATION_MS),
            fallback_used: Some(true),
            rule_applied: Some(rule_name.to_string()),
            ..TaskMetrics::default()
        };
        Ok(TaskResult::success(&task.id)
            .with_artifact(dest.display().to_string())
            .with_metrics(metrics))
    }
}

fn input_str<'a>(task: &'a TaskDefinition, field: &str) -> Option<&'a str> {
    task.inputs_ref
        .as_ref()
        .and_then(|v| v.get(field))
        .and_then(|v| v.as_str())
}

fn slug(task: &TaskDefinition) -> String {
    let raw = input_str(task, "slug").unwrap_or(&task.id);
    let slug: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    let slug = slug.trim_matches('-').to_string();
    if slug.is_empty() {
        "index".to_string()
    } else {
        slug
    }
}

/// Markdown page from `inputsRef.title` and `inputsRef.body`.
fn page_stub(task: &TaskDefinition) -> SitebotResult<FallbackArtifact> {
    let title = input_str(task, "title").unwrap_or(&task.id);
    let body = input_str(task, "body").unwrap_or("Content coming soon.");
    // A JSON string is a valid YAML double-quoted scalar.
    let front_title = serde_json::to_string(title)?;
    let heading = title.split_whitespace().collect::<Vec<_>>().join(" ");
    Ok(FallbackArtifact {
        path: PathBuf::from("pages").join(format!("{}.md", slug(task))),
        content: format!(
            "---\ntitle: {front_title}\ngenerated: fallback\n---\n\n# {heading}\n\n{body}\n"
        ),
    })
}

/// Pretty-printed copy of `inputsRef`.
fn seed_content(task: &TaskDefinition) -> SitebotResult<FallbackArtifact> {
    let value = task.inputs_ref.clone().unwrap_or(serde_json::Value::Null);
    Ok(FallbackArtifact {
        path: PathBuf::from("seed").join(format!("{}.json", slug(task))),
        content: serde_json::to_string_pretty(&value)? + "\n",
    })
}

/// Shell smoke test that fetches `inputsRef.url`.
fn smoke_test_stub(task: &TaskDefinition) -> SitebotResult<FallbackArtifact> {
    let url = input_str(task, "url").ok_or_else(|| {
        SitebotError::Validation(format!(
            "task '{}' needs inputsRef.url for smoke-test-stub",
            task.id
        ))
    })?;
    Ok(FallbackArtifact {
        path: PathBuf::from("tests").join(format!("{}.sh", slug(task))),
        content: format!(
            "#!/bin/sh\nset -e\nurl={}\nstatus=$(curl -s -o /dev/null -w '%{{http_code}}' \"$url\")\n[ \"$status\" = \"200\" ] || {{ echo \"$url returned $status\"; exit 1; }}\n",
            shell_quote(url)
        ),
    })
}

/// Single-quote `s` for POSIX sh.
fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}
