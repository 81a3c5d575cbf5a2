//! `${VAR}` / `${VAR:-default}` placeholder substitution for config file
//! values, applied to the raw file text before TOML/YAML parsing.

use std::sync::LazyLock;

use regex::Regex;

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(:-([^}]*))?\}").expect("static placeholder regex is valid"));

/// Replace `${ENV_VAR}` and `${ENV_VAR:-default}` placeholders in config
/// string values. A variable that is unset and has no `:-default` fallback
/// is left as the literal placeholder.
pub fn substitute_env(input: &str) -> String {
    substitute_env_with(input, |name| std::env::var(name).ok())
}

/// The implementation behind [`substitute_env`]; split out so it's testable
/// without mutating the process environment.
fn substitute_env_with(input: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(input.len());
    let mut last_end = 0;

    for caps in PLACEHOLDER.captures_iter(input) {
        let whole = caps.get(0).expect("capture 0 is always present");
        out.push_str(&input[last_end..whole.start()]);
        last_end = whole.end();

        let name = &caps[1];
        let default = caps.get(3).map(|m| m.as_str());
        match lookup(name).or_else(|| default.map(str::to_string)) {
            Some(value) => out.push_str(&value),
            None => out.push_str(whole.as_str()),
        }
    }
    out.push_str(&input[last_end..]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitutes_known_var() {
        let lookup = |name: &str| match name {
            "OPSENTRY_TEST_VAR" => Some("hello".to_string()),
            _ => None,
        };
        assert_eq!(substitute_env_with("key=${OPSENTRY_TEST_VAR}", lookup), "key=hello");
    }

    #[test]
    fn leaves_unknown_var_without_default() {
        let lookup = |_: &str| None;
        assert_eq!(substitute_env_with("${OPSENTRY_NONEXISTENT_XYZ}", lookup), "${OPSENTRY_NONEXISTENT_XYZ}");
    }

    #[test]
    fn falls_back_to_default_when_unset() {
        let lookup = |_: &str| None;
        assert_eq!(substitute_env_with("host=${OPSENTRY_HOST:-127.0.0.1}", lookup), "host=127.0.0.1");
    }

    #[test]
    fn set_var_wins_over_default() {
        let lookup = |name: &str| match name {
            "OPSENTRY_HOST" => Some("0.0.0.0".to_string()),
            _ => None,
        };
        assert_eq!(substitute_env_with("host=${OPSENTRY_HOST:-127.0.0.1}", lookup), "host=0.0.0.0");
    }

    #[test]
    fn no_placeholders() {
        assert_eq!(substitute_env("plain text"), "plain text");
    }
}
