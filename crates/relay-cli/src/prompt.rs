//! System prompt assembly

use std::path::Path;

/// Build the system prompt from the registered tool names
pub fn build_system_prompt(tool_names: &[String], cwd: &Path) -> String {
    let has = |name: &str| tool_names.iter().any(|t| t == name);
    let can_modify = has("write") || has("edit") || has("bash");

    let mut prompt = String::from("You are relay, a coding assistant working in a local repository.\n\n");

    if !can_modify {
        prompt.push_str("NOTE: You are in READ-ONLY mode. You can explore and analyze code but cannot make changes.\n\n");
    }

    if !tool_names.is_empty() {
        prompt.push_str("Tools:\n");
        for name in tool_names {
            if let Some(line) = tool_line(name) {
                prompt.push_str(&format!("- {}: {}\n", name, line));
            }
        }
        prompt.push('\n');
    }

    prompt.push_str("Guidelines:\n");
    prompt.push_str("- Be concise and helpful\n");
    if has("read") && (has("edit") || has("write")) {
        prompt.push_str("- Always read files before making edits\n");
    }
    if has("edit") && has("write") {
        prompt.push_str("- Use edit for small changes, write for new files\n");
    }
    if has("glob") || has("grep") {
        prompt.push_str("- Use glob/grep to explore before making changes\n");
    }
    if has("bash") {
        prompt.push_str("- Warn before destructive commands\n");
    }
    if has("ask_user_question") {
        prompt.push_str("- Ask when requirements are ambiguous instead of guessing\n");
    }
    if has("enter_plan_mode") {
        prompt.push_str("- For large or risky changes, enter plan mode and get the plan approved first\n");
    }

    prompt.push_str(&format!("\nWorking directory: {}", cwd.display()));
    prompt
}

fn tool_line(name: &str) -> Option<&'static str> {
    Some(match name {
        "bash" => "Execute shell commands",
        "read" => "Read file contents",
        "write" => "Write content to a file",
        "edit" => "Make text replacements in files",
        "glob" => "Find files by pattern",
        "grep" => "Search file contents",
        "list" => "List directory contents",
        "web_fetch" => "Fetch a web page as text",
        "ask_user_question" => "Ask the user multiple-choice questions",
        "enter_plan_mode" => "Switch to read-only planning",
        "exit_plan_mode" => "Present a plan for approval",
        _ => return None,
    })
}
