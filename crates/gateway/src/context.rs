//! Prompt assembly for the cortex, daemon, and classification calls.
//!
//! The cortex system prompt has a fixed section order; daemon prompts add
//! dependency results (head/tail sampled above a size cap), skill
//! sections, and behavioral instructions. The classification prompt is
//! standalone and is never concatenated with the full cortex context.

use cortex_domain::config::{SkillConfig, TemplateConfig};
use cortex_domain::daemon::Daemon;
use cortex_domain::engram::EngramEntry;

const CORTEX_IDENTITY: &str = "You are Cortex, a personal orchestrator. You coordinate \
background workers, remember what matters to the user, and answer directly when no \
tools are needed. Be concise and concrete.";

const DAEMON_INSTRUCTIONS: &str = "Work the task step by step. Call tools when you \
need external information or side effects. When the task is done, reply with a final \
summary and no tool calls. Never invent tool output.";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Truncation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn floor_boundary(s: &str, mut at: usize) -> usize {
    while at > 0 && !s.is_char_boundary(at) {
        at -= 1;
    }
    at
}

fn ceil_boundary(s: &str, mut at: usize) -> usize {
    while at < s.len() && !s.is_char_boundary(at) {
        at += 1;
    }
    at
}

/// Head/tail sampling: above `max_chars`, keep the first 50% and the last
/// 37.5% of the budget and elide the middle with a byte-count marker.
pub fn truncate_head_tail(content: &str, max_chars: usize) -> String {
    if content.len() <= max_chars || max_chars == 0 {
        return content.to_owned();
    }
    let head_len = floor_boundary(content, max_chars / 2);
    let tail_len = max_chars * 3 / 8;
    let tail_start = ceil_boundary(content, content.len().saturating_sub(tail_len));
    let elided = tail_start - head_len;
    format!(
        "{}\n... [{} bytes elided] ...\n{}",
        &content[..head_len],
        elided,
        &content[tail_start..]
    )
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Cortex prompt
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Inputs for the cortex system prompt, already resolved (memories
/// decrypted, engrams fetched, instructions looked up).
pub struct CortexContext<'a> {
    pub persona_facts: &'a str,
    /// Decrypted memory contents, at most 5.
    pub memories: &'a [String],
    pub context_summary: &'a str,
    pub active_daemons: &'a [Daemon],
    /// Most-recent first, at most 10.
    pub engrams: &'a [EngramEntry],
    pub project_instructions: &'a str,
}

pub fn build_cortex_prompt(ctx: &CortexContext<'_>) -> String {
    let mut out = String::from(CORTEX_IDENTITY);

    if !ctx.persona_facts.is_empty() {
        out.push_str("\n\n## About the user\n");
        out.push_str(ctx.persona_facts);
    }

    if !ctx.memories.is_empty() {
        out.push_str("\n\n## Relevant memories\n");
        for m in ctx.memories {
            out.push_str("- ");
            out.push_str(m);
            out.push('\n');
        }
    }

    if !ctx.context_summary.is_empty() {
        out.push_str("\n\n## Conversation summary\n");
        out.push_str(ctx.context_summary);
    }

    if !ctx.active_daemons.is_empty() {
        out.push_str("\n\n## Active daemons\n");
        for d in ctx.active_daemons {
            out.push_str(&format!(
                "- {} ({}): {} — {:.0}% — {}\n",
                d.role_label,
                d.role,
                d.task_summary,
                d.progress * 100.0,
                d.status,
            ));
        }
    }

    if !ctx.engrams.is_empty() {
        out.push_str("\n\n## Recent activity\n");
        for e in ctx.engrams {
            out.push_str(&format!("- [{}] {}\n", e.created_at.format("%Y-%m-%d %H:%M"), e.summary));
        }
    }

    if !ctx.project_instructions.is_empty() {
        out.push_str("\n\n## Project instructions\n");
        out.push_str(ctx.project_instructions);
    }

    out
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Daemon prompt
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct DaemonContext<'a> {
    pub daemon: &'a Daemon,
    /// (role label, result content) of completed dependencies.
    pub dependency_results: &'a [(String, String)],
    pub skills: &'a [SkillConfig],
    pub project_instructions: &'a str,
    pub dependency_result_max_chars: usize,
}

pub fn build_daemon_prompt(ctx: &DaemonContext<'_>) -> String {
    let d = ctx.daemon;
    let mut out = format!("You are {} — a {} daemon.", d.role_label, d.role);
    if !d.persona.is_empty() {
        out.push_str("\n\n## Persona\n");
        out.push_str(&d.persona);
    }

    out.push_str("\n\n## Your task\n");
    out.push_str(&d.task_summary);

    if !ctx.dependency_results.is_empty() {
        out.push_str("\n\n## Results from daemons you depend on\n");
        for (label, content) in ctx.dependency_results {
            let sampled = truncate_head_tail(content, ctx.dependency_result_max_chars);
            out.push_str(&format!("### {label}\n{sampled}\n"));
        }
    }

    for skill in ctx.skills {
        out.push_str(&format!("\n\n## Skill: {}\n{}", skill.name, skill.prompt));
    }

    if !ctx.project_instructions.is_empty() {
        out.push_str("\n\n## Project instructions\n");
        out.push_str(ctx.project_instructions);
    }

    out.push_str("\n\n## Instructions\n");
    out.push_str(DAEMON_INSTRUCTIONS);
    out
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Classification prompt
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Standalone classification prompt: user message, current daemon
/// activity, and the available templates (so the model can emit a
/// `template_slug`).
pub fn build_classification_prompt(
    user_message: &str,
    active_daemons: &[Daemon],
    templates: &[TemplateConfig],
) -> String {
    let mut out = String::from(
        "Classify the user's message and plan the work.\n\
         Modes:\n\
         - status: the user asks about progress of work already running\n\
         - quick: a direct answer with no tool use\n\
         - daemon: one objective that needs tools or background work\n\
         - multi_daemon: multiple distinct objectives\n\
         When unsure between quick and daemon, prefer daemon.\n",
    );

    if active_daemons.is_empty() {
        out.push_str("\nNo daemons are currently active.\n");
    } else {
        out.push_str("\nActive daemons:\n");
        for d in active_daemons {
            out.push_str(&format!(
                "- {} ({}): {} — {}\n",
                d.role_label, d.role, d.task_summary, d.status
            ));
        }
    }

    if !templates.is_empty() {
        out.push_str("\nAvailable daemon templates (set template_slug to use one):\n");
        for t in templates {
            out.push_str(&format!("- {} ({}): {}\n", t.slug, t.role, t.label));
        }
    }

    out.push_str(&format!("\nUser message: {user_message}\n"));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use cortex_domain::daemon::{DaemonPlan, DaemonRole};
    use cortex_domain::engram::EngramType;
    use uuid::Uuid;

    fn daemon(label: &str) -> Daemon {
        Daemon::from_plan(
            "u1",
            Uuid::new_v4(),
            &DaemonPlan {
                index: 0,
                role: DaemonRole::Researcher,
                role_label: label.into(),
                template_slug: None,
                task_summary: "dig into the topic".into(),
                tools_needed: vec![],
                depends_on: vec![],
                persona: None,
            },
        )
    }

    // ── truncate_head_tail ─────────────────────────────────────────

    #[test]
    fn short_content_is_untouched() {
        assert_eq!(truncate_head_tail("hello", 4_000), "hello");
    }

    #[test]
    fn long_content_is_head_tail_sampled() {
        let content = "x".repeat(10_000);
        let sampled = truncate_head_tail(&content, 4_000);
        // 50% head + 37.5% tail of the budget.
        assert!(sampled.starts_with(&"x".repeat(2_000)));
        assert!(sampled.ends_with(&"x".repeat(1_500)));
        assert!(sampled.contains("[6500 bytes elided]"));
        assert!(sampled.len() < content.len());
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let content = "é".repeat(5_000); // 2 bytes each
        let sampled = truncate_head_tail(&content, 4_000);
        // Must not panic and must stay valid UTF-8 (checked by slicing).
        assert!(sampled.contains("bytes elided"));
    }

    // ── section ordering ───────────────────────────────────────────

    #[test]
    fn cortex_prompt_sections_in_fixed_order() {
        let engram = EngramEntry::new("u1", EngramType::DaemonOutput, "found the report");
        let daemons = [daemon("Scout")];
        let memories = vec!["prefers brief answers".to_string()];
        let ctx = CortexContext {
            persona_facts: "Works in publishing.",
            memories: &memories,
            context_summary: "Discussing quarterly planning.",
            active_daemons: &daemons,
            engrams: std::slice::from_ref(&engram),
            project_instructions: "Use UK spelling.",
        };
        let prompt = build_cortex_prompt(&ctx);

        let order = [
            "You are Cortex",
            "## About the user",
            "## Relevant memories",
            "## Conversation summary",
            "## Active daemons",
            "## Recent activity",
            "## Project instructions",
        ];
        let mut last = 0;
        for marker in order {
            let pos = prompt.find(marker).unwrap_or_else(|| panic!("missing {marker}"));
            assert!(pos >= last, "{marker} out of order");
            last = pos;
        }
    }

    #[test]
    fn empty_sections_are_omitted() {
        let ctx = CortexContext {
            persona_facts: "",
            memories: &[],
            context_summary: "",
            active_daemons: &[],
            engrams: &[],
            project_instructions: "",
        };
        let prompt = build_cortex_prompt(&ctx);
        assert!(prompt.starts_with("You are Cortex"));
        assert!(!prompt.contains("##"));
    }

    #[test]
    fn daemon_prompt_samples_dependency_results() {
        let d = daemon("Writer");
        let deps = vec![("Scout".to_string(), "r".repeat(9_000))];
        let ctx = DaemonContext {
            daemon: &d,
            dependency_results: &deps,
            skills: &[],
            project_instructions: "",
            dependency_result_max_chars: 4_000,
        };
        let prompt = build_daemon_prompt(&ctx);
        assert!(prompt.contains("### Scout"));
        assert!(prompt.contains("bytes elided"));
        assert!(prompt.contains("## Instructions"));
    }

    #[test]
    fn classification_prompt_is_standalone_and_lists_templates() {
        let templates = vec![TemplateConfig {
            slug: "web-researcher".into(),
            role: DaemonRole::Researcher,
            label: "Web Researcher".into(),
            persona: "thorough".into(),
            instructions: String::new(),
            tools: vec![],
        }];
        let prompt = build_classification_prompt("look this up", &[], &templates);
        assert!(prompt.contains("web-researcher"));
        assert!(prompt.contains("User message: look this up"));
        // Never embeds the cortex identity.
        assert!(!prompt.contains("You are Cortex"));
    }

    #[test]
    fn classification_prompt_shows_active_daemons() {
        let daemons = [daemon("Scout")];
        let prompt = build_classification_prompt("how is it going?", &daemons, &[]);
        assert!(prompt.contains("Active daemons:"));
        assert!(prompt.contains("Scout"));
    }

    #[test]
    fn engram_timestamp_format_renders() {
        let mut engram = EngramEntry::new("u1", EngramType::Note, "note");
        engram.created_at = Utc::now();
        let ctx = CortexContext {
            persona_facts: "",
            memories: &[],
            context_summary: "",
            active_daemons: &[],
            engrams: std::slice::from_ref(&engram),
            project_instructions: "",
        };
        let prompt = build_cortex_prompt(&ctx);
        assert!(prompt.contains("## Recent activity"));
    }
}
