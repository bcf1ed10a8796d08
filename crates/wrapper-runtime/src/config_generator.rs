//! Writes the workspace's tool-discovery files at container startup: the
//! MCP server list, the permission profile, and a short system-context
//! file. A write failure here is logged and startup continues — a missing
//! config file degrades the agent's capabilities, it does not make the
//! session unusable (§4.D).

use std::path::{Path, PathBuf};

use crate::config::Settings;

pub struct ConfigGenerator<'a> {
    settings: &'a Settings,
}

impl<'a> ConfigGenerator<'a> {
    pub fn new(settings: &'a Settings) -> Self {
        Self { settings }
    }

    pub fn generate_all(&self) {
        if let Err(e) = self.create_directories() {
            tracing::warn!(error = %e, "failed to create .claude directories");
        }
        if let Err(e) = self.write_mcp_json() {
            tracing::warn!(error = %e, "failed to write .mcp.json");
        }
        if let Err(e) = self.write_settings_json() {
            tracing::warn!(error = %e, "failed to write settings.json");
        }
        if let Err(e) = self.write_claude_md() {
            tracing::warn!(error = %e, "failed to write CLAUDE.md");
        }
    }

    fn workspace(&self) -> &Path {
        Path::new(&self.settings.workspace_path)
    }

    fn create_directories(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.workspace().join(".claude/skills"))?;
        std::fs::create_dir_all("/home/claude/.claude")
    }

    fn write_mcp_json(&self) -> std::io::Result<()> {
        let config = serde_json::json!({
            "mcpServers": {
                "cc-docker": {
                    "type": "stdio",
                    "command": "node",
                    "args": ["/opt/cc-docker-mcp/index.js"],
                    "env": {
                        "SESSION_ID": self.settings.session_id,
                        "REDIS_URL": self.settings.redis_url,
                        "GATEWAY_URL": self.settings.gateway_url,
                    },
                },
                "filesystem": {
                    "type": "stdio",
                    "command": "npx",
                    "args": ["-y", "@modelcontextprotocol/server-filesystem", &self.settings.workspace_path, "/shared"],
                },
            },
        });

        std::fs::write(self.workspace().join(".mcp.json"), serde_json::to_vec_pretty(&config)?)
    }

    fn write_settings_json(&self) -> std::io::Result<()> {
        let mut env = serde_json::json!({
            "SESSION_ID": self.settings.session_id,
            "REDIS_URL": self.settings.redis_url,
            "GATEWAY_URL": self.settings.gateway_url,
        });
        if let Some(parent) = &self.settings.parent_session_id {
            env["PARENT_SESSION_ID"] = serde_json::Value::String(parent.clone());
        }

        let settings = serde_json::json!({
            "permissions": {
                "allow": [
                    "Bash(*)", "Read(*)", "Write(*)", "Edit(*)", "Glob(*)", "Grep(*)",
                    "WebFetch(*)", "Task(*)", "mcp__cc-docker__*", "mcp__filesystem__*",
                ],
                "deny": [],
                "defaultMode": "bypassPermissions",
            },
            "env": env,
        });

        std::fs::write(
            PathBuf::from("/home/claude/.claude/settings.json"),
            serde_json::to_vec_pretty(&settings)?,
        )
    }

    fn write_claude_md(&self) -> std::io::Result<()> {
        let parent_line = match &self.settings.parent_session_id {
            Some(id) => format!("- Parent session: {id}"),
            None => "- Parent session: none (root session)".to_string(),
        };
        let content = format!(
            "# Session context\n\n- Session ID: {}\n{}\n\nUse the cc-docker MCP server to spawn, message, and monitor child sessions.\n",
            self.settings.session_id, parent_line,
        );
        std::fs::write(self.workspace().join(".claude/CLAUDE.md"), content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings_for(workspace: &std::path::Path) -> Settings {
        Settings {
            session_id: "s1".into(),
            redis_url: "redis://localhost".into(),
            gateway_url: "http://gateway:8000".into(),
            parent_session_id: Some("parent-1".into()),
            workspace_path: workspace.to_string_lossy().into_owned(),
            agent_command: "claude".into(),
            heartbeat_interval_secs: 10,
            state_ttl_secs: 60,
            result_ttl_secs: 3600,
            idle_poll_secs: 1,
            stop_grace_secs: 5,
        }
    }

    #[test]
    fn writes_mcp_json_and_settings_with_parent_env() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings_for(dir.path());
        ConfigGenerator::new(&settings).generate_all();

        let mcp: serde_json::Value =
            serde_json::from_slice(&std::fs::read(dir.path().join(".mcp.json")).unwrap()).unwrap();
        assert!(mcp["mcpServers"]["cc-docker"].is_object());

        assert!(dir.path().join(".claude/CLAUDE.md").exists());
    }
}
