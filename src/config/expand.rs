//! Environment references in stored strings
//!
//! Stored values keep references like `%SystemRoot%` or `${HOME}` verbatim.
//! Consumers call [`expand`] when they need the real path. A reference to
//! an unset variable is left as written.

/// Expand against the process environment
pub fn expand(value: &str) -> String {
    expand_with(value, |name| std::env::var(name).ok())
}

/// Expand using `lookup` to resolve variable names
pub fn expand_with<F>(value: &str, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    let mut out = String::with_capacity(value.len());
    let mut rest = value;

    while let Some(pos) = rest.find(['%', '$']) {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];

        let reference = if tail.starts_with('%') {
            tail[1..].find('%').map(|end| (&tail[1..=end], end + 2))
        } else if let Some(inner) = tail.strip_prefix("${") {
            inner.find('}').map(|end| (&inner[..end], end + 3))
        } else {
            None
        };

        match reference {
            Some((name, len)) if is_name(name) => {
                match lookup(name) {
                    Some(v) => out.push_str(&v),
                    None => out.push_str(&tail[..len]),
                }
                rest = &tail[len..];
            }
            _ => {
                out.push_str(&tail[..1]);
                rest = &tail[1..];
            }
        }
    }

    out.push_str(rest);
    out
}

fn is_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '(' | ')' | '.' | '-'))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup(name: &str) -> Option<String> {
        match name {
            "ROOT" => Some("/srv".into()),
            "USER" => Some("svc".into()),
            _ => None,
        }
    }

    #[test]
    fn test_percent_reference() {
        assert_eq!(expand_with("%ROOT%/bin/app", lookup), "/srv/bin/app");
    }

    #[test]
    fn test_brace_reference() {
        assert_eq!(expand_with("${ROOT}/home/${USER}", lookup), "/srv/home/svc");
    }

    #[test]
    fn test_unknown_kept_verbatim() {
        assert_eq!(expand_with("%NOPE%/x ${NOPE}", lookup), "%NOPE%/x ${NOPE}");
    }

    #[test]
    fn test_unterminated_and_plain() {
        assert_eq!(expand_with("100% sure", lookup), "100% sure");
        assert_eq!(expand_with("cost $5 ${ROOT", lookup), "cost $5 ${ROOT");
        assert_eq!(expand_with("%%", lookup), "%%");
        assert_eq!(expand_with("", lookup), "");
    }

    #[test]
    fn test_process_environment() {
        std::env::set_var("SVCWRAP_EXPAND_TEST", "value");
        assert_eq!(expand("a-%SVCWRAP_EXPAND_TEST%-b"), "a-value-b");
    }
}
