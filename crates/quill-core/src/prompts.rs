// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::Path;

const BASE_PROMPT: &str = "\
You are quill, a coding assistant operating on the user's working directory \
through tools.

Follow these rules:
- Inspect before you change: view a file before editing it, and prefer \
  grep/glob over guessing paths.
- Keep edits minimal and scoped to the request; never reformat unrelated code.
- Use bash for builds, tests, and version control; long-running commands are \
  promoted to background shells you can poll with job_output.
- Report what you actually did.  If a command fails, show the failure instead \
  of describing success.
- For multi-step work, maintain the todo list so progress is visible.";

/// Build the system prompt for a run.
///
/// `custom` replaces the built-in prompt entirely; `append` adds
/// project-specific instructions after it.
pub fn system_prompt(working_dir: &Path, custom: Option<&str>, append: Option<&str>) -> String {
    let mut prompt = match custom {
        Some(c) => c.to_string(),
        None => format!("{BASE_PROMPT}\n\nWorking directory: {}", working_dir.display()),
    };
    if let Some(extra) = append {
        prompt.push_str("\n\n");
        prompt.push_str(extra);
    }
    prompt
}

/// Prompt for a spawned sub-agent.  Sub-agents run unattended, so the
/// instructions push toward a single self-contained answer.
pub fn subagent_prompt(task: &str) -> String {
    format!(
        "You are a focused sub-agent.  Complete the following task and reply \
         with a single final answer containing everything the caller needs; \
         you will not get a follow-up question.\n\nTask: {task}"
    )
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_prompt_names_working_dir() {
        let p = system_prompt(Path::new("/work/repo"), None, None);
        assert!(p.contains("/work/repo"));
        assert!(p.contains("coding assistant"));
    }

    #[test]
    fn custom_prompt_replaces_builtin() {
        let p = system_prompt(Path::new("/w"), Some("be terse"), None);
        assert_eq!(p, "be terse");
    }

    #[test]
    fn append_is_added_after_prompt() {
        let p = system_prompt(Path::new("/w"), None, Some("project rule"));
        assert!(p.ends_with("project rule"));
    }

    #[test]
    fn subagent_prompt_embeds_task() {
        let p = subagent_prompt("count the files");
        assert!(p.contains("count the files"));
    }
}
