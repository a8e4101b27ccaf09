//! Outbound-Command Sanitation
//!
//! The agent's shell tool runs with the secret-augmented environment,
//! so every command it asks to execute is rewritten to first unset the
//! secret-bearing variables. The agent cannot exfiltrate injected
//! credentials via environment introspection.

/// Rewrite a shell command so the named environment variables are
/// unset before the original command runs. Returns the command
/// unchanged when there is nothing to scrub.
pub fn scrub_command(command: &str, secret_names: &[String]) -> String {
    if secret_names.is_empty() {
        return command.to_string();
    }
    let mut names = secret_names.to_vec();
    names.sort();
    format!("unset {} 2>/dev/null; {}", names.join(" "), command)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scrub_prefixes_unset() {
        let scrubbed = scrub_command(
            "env | grep KEY",
            &["API_KEY".to_string(), "DB_PASSWORD".to_string()],
        );
        assert_eq!(
            scrubbed,
            "unset API_KEY DB_PASSWORD 2>/dev/null; env | grep KEY"
        );
    }

    #[test]
    fn test_scrub_is_deterministic_regardless_of_name_order() {
        let a = scrub_command("ls", &["B".to_string(), "A".to_string()]);
        let b = scrub_command("ls", &["A".to_string(), "B".to_string()]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_scrub_passthrough_without_secrets() {
        assert_eq!(scrub_command("ls -la", &[]), "ls -la");
    }
}
