//! Loading rule text from the host repository and the state directory.

use std::fs;
use std::path::Path;

use tracing::{debug, warn};

use crate::core::rules::combine_rules;

/// Host rules: `docs/rules.md`, else every `docs/rules/*.md` in name order.
pub fn load_host_rules(repo: &Path) -> String {
    let rules_file = repo.join("docs").join("rules.md");
    if rules_file.is_file() {
        return read_or_empty(&rules_file);
    }
    let rules_dir = repo.join("docs").join("rules");
    let Ok(entries) = fs::read_dir(&rules_dir) else {
        return String::new();
    };
    let mut fragments: Vec<_> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && path.extension().is_some_and(|ext| ext == "md"))
        .collect();
    fragments.sort();
    fragments
        .iter()
        .map(|path| read_or_empty(path))
        .filter(|text| !text.trim().is_empty())
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Host rules for `repo` followed by the agent rules file.
pub fn assemble_rules(repo: &Path, agent_rules_path: &Path) -> String {
    let host = load_host_rules(repo);
    let agent = read_or_empty(agent_rules_path);
    debug!(host_bytes = host.len(), agent_bytes = agent.len(), "assembled rules");
    combine_rules(&host, &agent)
}

fn read_or_empty(path: &Path) -> String {
    match fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(err) => {
            warn!(path = %path.display(), err = %err, "unreadable rules file");
            String::new()
        }
    }
}
