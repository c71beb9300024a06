//! Argument vector construction for the agent CLI
//!
//! The process is always spawned from an explicit program + argv; nothing
//! is ever passed through a shell.

use crate::config::CommandConfig;
use crate::types::{AgentRecord, StartOptions};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Everything needed to spawn one agent process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: BTreeMap<String, String>,
}

impl LaunchSpec {
    pub fn build(
        command: &CommandConfig,
        record: &AgentRecord,
        prompt: &str,
        options: &StartOptions,
    ) -> Self {
        let mut args = command.base_args.clone();

        if let Some(model) = options.model.as_deref().filter(|m| !m.is_empty()) {
            args.push(command.model_flag.clone());
            args.push(model.to_string());
        }
        if let Some(session) = options.resume.as_deref().filter(|s| !s.is_empty()) {
            args.push(command.resume_flag.clone());
            args.push(session.to_string());
        }
        if !prompt.is_empty() {
            args.push(prompt.to_string());
        }

        let mut env: BTreeMap<String, String> = command
            .env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        env.extend(record.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        env.insert(command.skills_env.clone(), record.skills.join(","));
        env.insert(command.agent_id_env.clone(), record.id.clone());

        Self {
            program: command.program.clone(),
            args,
            cwd: PathBuf::from(&record.project_path),
            env,
        }
    }

    /// Loggable rendering; not used for execution
    pub fn display(&self) -> String {
        let mut out = self.program.clone();
        for arg in &self.args {
            out.push(' ');
            if arg.chars().any(|c| c.is_whitespace() || c == '"') {
                out.push_str(&format!("{:?}", arg));
            } else {
                out.push_str(arg);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentRegistry;
    use crate::types::AgentConfig;
    use pretty_assertions::assert_eq;

    fn record() -> AgentRecord {
        AgentRegistry::new(10)
            .create(
                AgentConfig::new("/work/repo")
                    .with_skills(["rust", "git"])
                    .with_env("EXTRA", "1"),
            )
            .unwrap()
    }

    #[test]
    fn test_prompt_is_last_positional_arg() {
        let command = CommandConfig {
            base_args: vec!["--print".to_string()],
            ..Default::default()
        };
        let spec = LaunchSpec::build(&command, &record(), "fix bug", &StartOptions::default());

        assert_eq!(spec.program, "claude");
        assert_eq!(spec.args, vec!["--print", "fix bug"]);
        assert_eq!(spec.cwd, PathBuf::from("/work/repo"));
    }

    #[test]
    fn test_model_and_resume_flags() {
        let options = StartOptions::default()
            .with_model("opus")
            .with_resume("sess-1");
        let spec = LaunchSpec::build(&CommandConfig::default(), &record(), "go", &options);
        assert_eq!(spec.args, vec!["--model", "opus", "--resume", "sess-1", "go"]);
    }

    #[test]
    fn test_shell_metacharacters_stay_in_one_arg() {
        let prompt = "do it; rm -rf / && echo $(whoami)";
        let spec = LaunchSpec::build(
            &CommandConfig::default(),
            &record(),
            prompt,
            &StartOptions::default(),
        );
        assert_eq!(spec.args, vec![prompt.to_string()]);
    }

    #[test]
    fn test_environment_carries_skills_and_id() {
        let record = record();
        let spec = LaunchSpec::build(
            &CommandConfig::default(),
            &record,
            "",
            &StartOptions::default(),
        );
        assert!(spec.args.is_empty());
        assert_eq!(spec.env["CONDUCTOR_SKILLS"], "rust,git");
        assert_eq!(spec.env["CONDUCTOR_AGENT_ID"], record.id);
        assert_eq!(spec.env["EXTRA"], "1");
    }

    #[test]
    fn test_agent_env_overrides_global_env() {
        let mut command = CommandConfig::default();
        command.env.insert("EXTRA".to_string(), "global".to_string());
        let spec = LaunchSpec::build(&command, &record(), "x", &StartOptions::default());
        assert_eq!(spec.env["EXTRA"], "1");
    }
}
