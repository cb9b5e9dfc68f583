use crate::config::BotConfig;
use async_trait::async_trait;
use sitebot_core::{SitebotError, SitebotResult, TaskDefinition, TaskMetrics, TaskResult};
use sitebot_orchestrator::{Bot, BotDescriptor};
use std::process::Stdio;
use tracing::{debug, info};

/// Bot that runs an external program per task.
///
/// The task is passed through `SITEBOT_TASK_*` environment variables. Exit
/// status 0 means success; each non-empty stdout line is an artifact
/// reference, except `tokens: <in> <out>` (token metrics) and
/// `review: required` (asks for human review). The queue enforces the
/// timeout; the child is killed when the handler is dropped.
pub struct CommandBot {
    descriptor: BotDescriptor,
    command: String,
    args: Vec<String>,
}

impl CommandBot {
    pub fn new(config: &BotConfig) -> Self {
        Self {
            descriptor: BotDescriptor::new(
                &config.name,
                config.accepts.iter().cloned(),
                config.concurrency,
            ),
            command: config.command.clone(),
            args: config.args.clone(),
        }
    }
}

#[async_trait]
impl Bot for CommandBot {
    fn descriptor(&self) -> &BotDescriptor {
        &self.descriptor
    }

    async fn handle(&self, task: &TaskDefinition) -> SitebotResult<TaskResult> {
        let inputs = match &task.inputs_ref {
            Some(value) => serde_json::to_string(value)?,
            None => "null".to_string(),
        };
        info!(bot = %self.descriptor.name, task_id = %task.id, command = %self.command, "Running bot command");

        let output = tokio::process::Command::new(&self.command)
            .args(&self.args)
            .env("SITEBOT_TASK_ID", &task.id)
            .env("SITEBOT_TASK_NAME", &task.name)
            .env("SITEBOT_TASK_VERSION", &task.version)
            .env("SITEBOT_TASK_PRIORITY", task.priority.to_string())
            .env("SITEBOT_TASK_CLASS", task.concurrency_class.to_string())
            .env("SITEBOT_TASK_ESTIMATED_TOKENS", task.estimated_tokens.to_string())
            .env("SITEBOT_TASK_INPUTS", inputs)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                SitebotError::Handler(format!("failed to start '{}': {e}", self.command))
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let code = output.status.code().unwrap_or(-1);
            return Err(SitebotError::Handler(format!(
                "'{}' exited with {code}: {}",
                self.command,
                truncate_output(stderr.trim(), 2_000)
            )));
        }

        let parsed = parse_stdout(&stdout);
        debug!(task_id = %task.id, artifacts = parsed.artifacts.len(), "Bot command finished");
        let mut metrics = TaskMetrics::default();
        if let Some((tokens_in, tokens_out)) = parsed.tokens {
            metrics = metrics.with_tokens(tokens_in, tokens_out);
        }
        if parsed.review {
            metrics.human_review_required = Some(true);
        }
        let mut result = TaskResult::success(&task.id).with_metrics(metrics);
        result.artifacts = parsed.artifacts;
        Ok(result)
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
struct ParsedOutput {
    artifacts: Vec<String>,
    tokens: Option<(u64, u64)>,
    review: bool,
}

fn parse_stdout(stdout: &str) -> ParsedOutput {
    let mut parsed = ParsedOutput::default();
    for line in stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if let Some(rest) = line.strip_prefix("tokens:") {
            let mut counts = rest.split_whitespace().map(str::parse::<u64>);
            if let (Some(Ok(tokens_in)), Some(Ok(tokens_out))) = (counts.next(), counts.next()) {
                parsed.tokens = Some((tokens_in, tokens_out));
                continue;
            }
        }
        if line == "review: required" {
            parsed.review = true;
            continue;
        }
        parsed.artifacts.push(line.to_string());
    }
    parsed
}

fn truncate_output(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        return s.to_string();
    }
    let mut end = max_len;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}... [truncated, {} total bytes]", &s[..end], s.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh_bot(script: &str) -> CommandBot {
        CommandBot::new(&BotConfig {
            name: "sh".into(),
            accepts: vec!["build-page".into()],
            concurrency: 2,
            command: "sh".into(),
            args: vec!["-c".into(), script.into()],
        })
    }

    #[test]
    fn test_parse_stdout() {
        let parsed = parse_stdout("pages/home.html\n\ntokens: 120 45\n  assets/logo.svg \nreview: required\n");
        assert_eq!(parsed.artifacts, vec!["pages/home.html", "assets/logo.svg"]);
        assert_eq!(parsed.tokens, Some((120, 45)));
        assert!(parsed.review);

        // A malformed tokens line is just output.
        let parsed = parse_stdout("tokens: lots\n");
        assert_eq!(parsed.tokens, None);
        assert_eq!(parsed.artifacts, vec!["tokens: lots"]);
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate_output("short", 10), "short");
        let out = truncate_output("ééé", 3);
        assert!(out.starts_with("é..."));
    }

    #[tokio::test]
    async fn test_task_env_and_artifacts() {
        let bot = sh_bot(r#"echo "pages/$SITEBOT_TASK_ID.html"; echo "$SITEBOT_TASK_INPUTS"; echo "tokens: 10 4""#);
        let task = TaskDefinition::new("home", "build-page")
            .with_inputs(serde_json::json!({"title": "Home"}));

        let result = bot.handle(&task).await.unwrap();
        assert!(result.is_success());
        assert_eq!(
            result.artifacts,
            vec!["pages/home.html", r#"{"title":"Home"}"#]
        );
        assert_eq!(result.metrics.tokens_in, Some(10));
        assert_eq!(result.metrics.tokens_out, Some(4));
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_handler_failure() {
        let bot = sh_bot("echo broken >&2; exit 3");
        let err = bot
            .handle(&TaskDefinition::new("home", "build-page"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "HANDLER_FAILURE");
        assert!(err.to_string().contains("exited with 3: broken"));
    }

    #[tokio::test]
    async fn test_missing_program() {
        let bot = CommandBot::new(&BotConfig {
            name: "ghost".into(),
            accepts: vec!["x".into()],
            concurrency: 1,
            command: "/nonexistent/sitebot-bot".into(),
            args: vec![],
        });
        let err = bot.handle(&TaskDefinition::new("a", "x")).await.unwrap_err();
        assert!(err.to_string().contains("failed to start"));
    }
}
