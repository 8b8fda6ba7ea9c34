//! API-key format and scope grammar.
//!
//! Key material is the literal prefix `clv_` followed by 64 lowercase hex
//! characters. Scopes are strings from the grammar:
//! `*` | `execute:*` | `execute:<agentId>` | `read:executions` | `read:*`.

pub const KEY_PREFIX: &str = "clv_";
pub const KEY_HEX_LEN: usize = 64;

/// Check the lexical shape of an API key (prefix + 64 lowercase hex).
pub fn is_valid_key_format(key: &str) -> bool {
    let Some(rest) = key.strip_prefix(KEY_PREFIX) else {
        return false;
    };
    rest.len() == KEY_HEX_LEN
        && rest
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
}

/// Check a scope string against the grammar.
pub fn is_valid_scope(scope: &str) -> bool {
    match scope {
        "*" | "execute:*" | "read:executions" | "read:*" => true,
        s => s
            .strip_prefix("execute:")
            .is_some_and(|agent| !agent.is_empty() && agent != "*"),
    }
}

/// True iff the scopes permit executing the given agent: `*`, `execute:*`,
/// or the exact `execute:<agent_id>`.
pub fn has_execute_scope(scopes: &[String], agent_id: &str) -> bool {
    scopes.iter().any(|s| {
        s == "*" || s == "execute:*" || s.strip_prefix("execute:") == Some(agent_id)
    })
}

/// True iff the scopes permit the given read resource (exact match, `read:*`,
/// or the all-scope `*`).
pub fn has_read_scope(scopes: &[String], resource: &str) -> bool {
    scopes
        .iter()
        .any(|s| s == "*" || s == "read:*" || s.strip_prefix("read:") == Some(resource))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scopes(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn key_format_accepts_canonical() {
        let key = format!("clv_{}", "ab12".repeat(16));
        assert!(is_valid_key_format(&key));
    }

    #[test]
    fn key_format_rejects_bad_shapes() {
        assert!(!is_valid_key_format("clv_short"));
        assert!(!is_valid_key_format(&"f".repeat(68)));
        // Uppercase hex is rejected.
        let upper = format!("clv_{}", "AB12".repeat(16));
        assert!(!is_valid_key_format(&upper));
        // Non-hex character.
        let bad = format!("clv_{}g", "a".repeat(63));
        assert!(!is_valid_key_format(&bad));
    }

    #[test]
    fn execute_scope_matching() {
        assert!(has_execute_scope(&scopes(&["*"]), "alpha"));
        assert!(has_execute_scope(&scopes(&["execute:*"]), "alpha"));
        assert!(has_execute_scope(&scopes(&["execute:alpha"]), "alpha"));
        assert!(!has_execute_scope(&scopes(&["execute:beta"]), "alpha"));
        assert!(!has_execute_scope(&scopes(&["read:*"]), "alpha"));
        assert!(!has_execute_scope(&[], "alpha"));
    }

    #[test]
    fn read_scope_matching() {
        assert!(has_read_scope(&scopes(&["read:executions"]), "executions"));
        assert!(has_read_scope(&scopes(&["read:*"]), "executions"));
        assert!(has_read_scope(&scopes(&["*"]), "executions"));
        assert!(!has_read_scope(&scopes(&["execute:*"]), "executions"));
    }

    #[test]
    fn scope_grammar_validation() {
        for ok in ["*", "execute:*", "execute:agent-7", "read:executions", "read:*"] {
            assert!(is_valid_scope(ok), "{ok} should be valid");
        }
        for bad in ["", "execute:", "write:*", "read:other"] {
            assert!(!is_valid_scope(bad), "{bad} should be invalid");
        }
    }
}
