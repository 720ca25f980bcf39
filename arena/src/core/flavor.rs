//! Agent CLI calling conventions.

use std::fmt;

/// How the agent executable accepts a prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CliFlavor {
    /// `<exe> -p <prompt>`, one invocation per step.
    SingleShot,
    /// `<exe> code <plan|apply> --repo <repo> --plan <file>`.
    FileBased,
}

impl fmt::Display for CliFlavor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CliFlavor::SingleShot => f.write_str("single-shot"),
            CliFlavor::FileBased => f.write_str("file-based"),
        }
    }
}

const PROMPT_FLAGS: [&str; 2] = ["-p", "--prompt"];

/// Classify an executable from its `--help` output.
///
/// Flags are matched as whole tokens so that `--plan` does not count as `-p`.
pub fn flavor_from_help(help_text: &str) -> CliFlavor {
    let supports_prompt = help_text
        .split(|c: char| c.is_whitespace() || matches!(c, ',' | '|' | '[' | ']' | '=' | '<'))
        .any(|token| PROMPT_FLAGS.contains(&token));
    if supports_prompt {
        CliFlavor::SingleShot
    } else {
        CliFlavor::FileBased
    }
}
