//! Rule text concatenation.

/// Heading placed before agent-side rules when host rules are also present.
pub const AGENT_RULES_HEADING: &str = "# TaskArena Agent Rules";

/// Returned when neither source contributes any rules.
pub const NO_RULES: &str = "No additional rules available.";

/// Combine host-repository rules with agent rules.
///
/// Host rules come first. Blank inputs count as absent.
pub fn combine_rules(host: &str, agent: &str) -> String {
    let host = host.trim();
    let agent = agent.trim();
    match (host.is_empty(), agent.is_empty()) {
        (false, false) => [host, "---", AGENT_RULES_HEADING, agent].join("\n\n"),
        (false, true) => host.to_string(),
        (true, false) => agent.to_string(),
        (true, true) => NO_RULES.to_string(),
    }
}
