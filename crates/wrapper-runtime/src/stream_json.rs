/// Format a tool_use block as a concise status line published to the bus
/// for the platform bridge to relay, e.g. "**Read** `src/main.rs`",
/// "**Bash** `cargo test`", "**Edit** `src/lib.rs`".
pub fn format_tool_action(name: &str, input: &serde_json::Value) -> String {
    match name {
        "Read" => {
            let path = input.get("file_path").and_then(|v| v.as_str()).unwrap_or("?");
            format!("**Read** `{}`", path)
        }
        "Write" => {
            let path = input.get("file_path").and_then(|v| v.as_str()).unwrap_or("?");
            format!("**Write** `{}`", path)
        }
        "Edit" => {
            let path = input.get("file_path").and_then(|v| v.as_str()).unwrap_or("?");
            format!("**Edit** `{}`", path)
        }
        "Bash" => {
            let cmd = input.get("command").and_then(|v| v.as_str()).unwrap_or("?");
            // Truncate long commands
            let cmd_short = if cmd.len() > 80 { &cmd[..77] } else { cmd };
            let suffix = if cmd.len() > 80 { "..." } else { "" };
            format!("**Bash** `{}{}`", cmd_short, suffix)
        }
        "Glob" => {
            let pattern = input.get("pattern").and_then(|v| v.as_str()).unwrap_or("?");
            format!("**Glob** `{}`", pattern)
        }
        "Grep" => {
            let pattern = input.get("pattern").and_then(|v| v.as_str()).unwrap_or("?");
            format!("**Grep** `{}`", pattern)
        }
        "WebFetch" => {
            let url = input.get("url").and_then(|v| v.as_str()).unwrap_or("?");
            format!("**WebFetch** `{}`", url)
        }
        "WebSearch" => {
            let query = input.get("query").and_then(|v| v.as_str()).unwrap_or("?");
            format!("**WebSearch** `{}`", query)
        }
        "Task" => {
            let desc = input.get("description").and_then(|v| v.as_str()).unwrap_or("subagent");
            format!("**Task** _{}_", desc)
        }
        "Skill" => {
            let skill = input.get("skill").and_then(|v| v.as_str()).unwrap_or("?");
            let args = input.get("args").and_then(|v| v.as_str());
            match args {
                Some(a) => format!("**Skill** `/{} {}`", skill, a),
                None => format!("**Skill** `/{}`", skill),
            }
        }
        "EnterPlanMode" => {
            "**EnterPlanMode**".to_string()
        }
        "NotebookEdit" => {
            let path = input.get("notebook_path").and_then(|v| v.as_str()).unwrap_or("?");
            format!("**NotebookEdit** `{}`", path)
        }
        "AskUserQuestion" => {
            "**AskUserQuestion**".to_string()
        }
        _ => {
            // For MCP tools and others, just show the name
            if name.starts_with("mcp__") {
                // Extract a readable name from mcp__server__tool format
                let parts: Vec<&str> = name.split("__").collect();
                let short_name = parts.last().unwrap_or(&name);
                format!("**MCP** _{}_", short_name)
            } else {
                format!("**{}**", name)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // -- format_tool_action tests --

    #[test]
    fn format_read_action() {
        let input = serde_json::json!({"file_path": "/src/main.rs"});
        assert_eq!(format_tool_action("Read", &input), "**Read** `/src/main.rs`");
    }

    #[test]
    fn format_bash_action() {
        let input = serde_json::json!({"command": "cargo test"});
        assert_eq!(format_tool_action("Bash", &input), "**Bash** `cargo test`");
    }

    #[test]
    fn format_bash_long_command() {
        let long_cmd = "a".repeat(100);
        let input = serde_json::json!({"command": long_cmd});
        let result = format_tool_action("Bash", &input);
        assert!(result.ends_with("...`"));
        assert!(result.len() < 100);
    }

    #[test]
    fn format_grep_action() {
        let input = serde_json::json!({"pattern": "fn main"});
        assert_eq!(format_tool_action("Grep", &input), "**Grep** `fn main`");
    }

    #[test]
    fn format_mcp_tool_action() {
        let input = serde_json::json!({});
        assert_eq!(format_tool_action("mcp__server__search", &input), "**MCP** _search_");
    }

    #[test]
    fn format_task_action() {
        let input = serde_json::json!({"description": "explore codebase"});
        assert_eq!(format_tool_action("Task", &input), "**Task** _explore codebase_");
    }
}
