//! `${ENV_VAR}` placeholder expansion for raw config text.
//!
//! Supports `${NAME}` and `${NAME:-fallback}`. Unresolvable placeholders
//! without a fallback are left untouched so validation can point at them.

/// Expand placeholders using the process environment.
pub fn substitute_env(input: &str) -> String {
    substitute_env_with(input, |name| std::env::var(name).ok())
}

/// Expand placeholders using a custom lookup, which keeps tests away from
/// the real environment.
fn substitute_env_with(input: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            // Unterminated; emit the remainder verbatim.
            out.push_str(&rest[start..]);
            return out;
        };

        let body = &after[..end];
        let (name, fallback) = match body.split_once(":-") {
            Some((name, fallback)) => (name, Some(fallback)),
            None => (body, None),
        };

        match (name.is_empty(), lookup(name), fallback) {
            (false, Some(value), _) => out.push_str(&value),
            (false, None, Some(fallback)) => out.push_str(fallback),
            _ => {
                out.push_str("${");
                out.push_str(body);
                out.push('}');
            },
        }
        rest = &after[end + 1..];
    }

    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use {super::*, rstest::rstest};

    fn lookup(name: &str) -> Option<String> {
        match name {
            "RELAY_HASH" => Some("s3cret".into()),
            "EMPTY" => Some(String::new()),
            _ => None,
        }
    }

    #[rstest]
    #[case("api_hash = \"${RELAY_HASH}\"", "api_hash = \"s3cret\"")]
    #[case("${MISSING}", "${MISSING}")]
    #[case("${MISSING:-fallback}", "fallback")]
    #[case("${RELAY_HASH:-fallback}", "s3cret")]
    #[case("x${EMPTY}y", "xy")]
    #[case("${}", "${}")]
    #[case("tail ${UNTERMINATED", "tail ${UNTERMINATED")]
    #[case("plain text", "plain text")]
    #[case("${RELAY_HASH}-${RELAY_HASH}", "s3cret-s3cret")]
    fn expands(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(substitute_env_with(input, lookup), expected);
    }
}
