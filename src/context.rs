use std::path::Path;

use serde_json::json;
use tracing::{debug, warn};

use crate::agent::tools::Tool;
use crate::agent::tools::discovery_tools::LsTool;
use crate::hooks::{Entries, HookContext, HookRegistry};

const RULES_FILE: &str = "RULES.md";
const README_FILE: &str = "README.md";

/// Contents of `RULES.md` from the global config dir and the project root, in that order.
pub fn load_rules(cwd: &Path, global_config_dir: Option<&Path>) -> Option<String> {
    let candidates = global_config_dir.map(|d| d.join(RULES_FILE)).into_iter().chain([cwd.join(RULES_FILE)]);
    let sections: Vec<String> = candidates
        .filter_map(|p| std::fs::read_to_string(&p).ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    if sections.is_empty() {
        return None;
    }
    Some(format!("The user provides the following rules that you should follow:\n{}", sections.join("\n\n")))
}

async fn directory_structure(cwd: &Path) -> Option<String> {
    if !crate::discovery::looks_like_project(cwd) {
        return None;
    }
    let ls = LsTool { root: cwd.to_path_buf() };
    match ls.run(json!({"dir_path": "."})).await {
        Ok(res) => {
            let summary = res.return_display.as_ref().and_then(|v| v.as_str()).unwrap_or_default().to_string();
            Some(format!("{summary}\n<directory_structure>\n{}\n</directory_structure>", res.text()))
        }
        Err(e) => {
            warn!(error = %e, "failed to list project directory");
            None
        }
    }
}

pub fn render_context(entries: &Entries) -> String {
    let body: Vec<String> = entries.iter().map(|(k, v)| format!("<context name=\"{k}\">{v}</context>")).collect();
    format!("# Context\nAs you answer the user's questions, you can use the following context:\n{}", body.join("\n"))
}

pub fn render_environment(entries: &Entries) -> String {
    let body: Vec<String> = entries.iter().map(|(k, v)| format!("<env name=\"{k}\">{v}</env>")).collect();
    format!("# Environment\nHere is useful information about the environment you are running in.\n{}", body.join("\n"))
}

/// Builds the `# Context` and `# Environment` messages sent with every turn.
pub async fn build_context_messages(cwd: &Path, global_config_dir: Option<&Path>, hooks: &HookRegistry, ctx: &HookContext) -> Vec<String> {
    let git = match crate::git_ops::status(cwd) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "failed to read git status");
            None
        }
    };

    let mut context: Entries = Vec::new();
    if let Some(summary) = &git {
        context.push(("gitStatus".into(), crate::git_ops::llm_git_status(summary)));
    }
    if let Some(tree) = directory_structure(cwd).await {
        context.push(("directoryStructure".into(), tree));
    }
    if let Some(rules) = load_rules(cwd, global_config_dir) {
        context.push(("rules".into(), rules));
    }
    if let Ok(readme) = std::fs::read_to_string(cwd.join(README_FILE)) {
        context.push(("readme".into(), readme));
    }
    let context = hooks.context(ctx, context).await;

    let env: Entries = vec![
        ("Working directory".into(), cwd.display().to_string()),
        ("Is directory a git repo".into(), if git.is_some() { "YES" } else { "NO" }.into()),
        ("Platform".into(), std::env::consts::OS.into()),
        ("Today's date".into(), chrono::Local::now().format("%Y-%m-%d").to_string()),
    ];
    let env = hooks.env(ctx, env).await;
    debug!(context = context.len(), env = env.len(), "built context messages");

    vec![render_context(&context), render_environment(&env)]
}
