//! INI reader and writer
//!
//! Used by the file-backed configuration store, the settings file and the
//! unit file backend. Keys are case-insensitive (normalized to uppercase),
//! section names keep their brackets. Values are stored as written, with no
//! list splitting and no variable expansion; [`get`] and [`get_all`] undo
//! the escaping applied by [`IniWriter::entry`], [`get_raw`] does not.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// A section contains key-value pairs, where each key can have multiple values
/// The u32 is the order the value appeared (for stable ordering)
pub type ParsedSection = HashMap<String, Vec<(u32, String)>>;

/// A parsed file is a map of section names to their contents
pub type ParsedFile = HashMap<String, ParsedSection>;

#[derive(Debug, thiserror::Error)]
pub enum IniError {
    #[error("Section '{0}' appears more than once")]
    DuplicateSection(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid value for {key}: {value:?}")]
    InvalidValue { key: String, value: String },
}

/// Parse INI content from a string
pub fn parse_file(content: &str) -> Result<ParsedFile, IniError> {
    let mut sections = HashMap::new();
    let mut current: Option<(String, Vec<&str>)> = None;

    for line in content.lines().map(str::trim) {
        if line.starts_with('[') {
            if let Some((name, lines)) = current.take() {
                insert_section(&mut sections, name, &lines)?;
            }
            current = Some((line.to_string(), Vec::new()));
        } else if let Some((_, lines)) = current.as_mut() {
            lines.push(line);
        }
        // Lines before the first section are ignored
    }

    if let Some((name, lines)) = current {
        insert_section(&mut sections, name, &lines)?;
    }

    Ok(sections)
}

fn insert_section(sections: &mut ParsedFile, name: String, lines: &[&str]) -> Result<(), IniError> {
    if sections.contains_key(&name) {
        return Err(IniError::DuplicateSection(name));
    }
    sections.insert(name, parse_section(lines));
    Ok(())
}

/// Parse a single section's lines into key-value pairs
fn parse_section(lines: &[&str]) -> ParsedSection {
    let mut entries: ParsedSection = HashMap::new();
    let mut entry_number = 0u32;

    for line in lines {
        if line.starts_with('#') || line.starts_with(';') || line.is_empty() {
            continue;
        }

        let Some((name, value)) = line.split_once('=') else {
            continue;
        };

        let name = name.trim().to_uppercase();
        entries
            .entry(name)
            .or_default()
            .push((entry_number, value.trim().to_string()));
        entry_number += 1;
    }

    entries
}

/// Read and parse a file from disk
pub fn parse_path(path: &Path) -> Result<ParsedFile, IniError> {
    let content = std::fs::read_to_string(path)?;
    parse_file(&content)
}

/// Last value of `key` in `section` as written (section given with brackets)
pub fn get_raw<'a>(file: &'a ParsedFile, section: &str, key: &str) -> Option<&'a str> {
    file.get(section)
        .and_then(|s| s.get(&key.to_uppercase()))
        .and_then(|values| values.iter().max_by_key(|(order, _)| *order))
        .map(|(_, v)| v.as_str())
}

/// Last value of `key` in `section`, unescaped
pub fn get(file: &ParsedFile, section: &str, key: &str) -> Option<String> {
    get_raw(file, section, key).map(unescape)
}

/// All values of `key` in `section`, unescaped, in file order
pub fn get_all(file: &ParsedFile, section: &str, key: &str) -> Vec<String> {
    let mut values = file
        .get(section)
        .and_then(|s| s.get(&key.to_uppercase()))
        .cloned()
        .unwrap_or_default();
    values.sort_by_key(|(order, _)| *order);
    values.into_iter().map(|(_, v)| unescape(&v)).collect()
}

/// Escape a value so the reader returns it unchanged
pub fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let last = value.chars().count().saturating_sub(1);
    for (i, c) in value.chars().enumerate() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            // Edge whitespace would be trimmed away by the reader
            c if c.is_whitespace() && (i == 0 || i == last) => {
                if c.is_ascii() {
                    out.push_str(&format!("\\x{:02x}", c as u32));
                } else {
                    out.push_str(&format!("\\u{{{:x}}}", c as u32));
                }
            }
            c => out.push(c),
        }
    }
    out
}

/// Inverse of [`escape`], unknown sequences are kept literally
pub fn unescape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.peek().copied() {
            Some('\\') => {
                chars.next();
                out.push('\\');
            }
            Some('n') => {
                chars.next();
                out.push('\n');
            }
            Some('r') => {
                chars.next();
                out.push('\r');
            }
            Some('t') => {
                chars.next();
                out.push('\t');
            }
            Some('x') => {
                let hex: String = chars.clone().skip(1).take(2).collect();
                match u8::from_str_radix(&hex, 16) {
                    Ok(b) if hex.len() == 2 => {
                        chars.nth(2);
                        out.push(char::from(b));
                    }
                    _ => out.push('\\'),
                }
            }
            Some('u') => {
                let rest: String = chars.clone().skip(1).take(8).collect();
                let decoded = rest
                    .strip_prefix('{')
                    .and_then(|r| r.split_once('}'))
                    .and_then(|(hex, _)| {
                        u32::from_str_radix(hex, 16)
                            .ok()
                            .and_then(char::from_u32)
                            .map(|c| (c, hex.len()))
                    });
                match decoded {
                    Some((c, len)) => {
                        // 'u', '{', the digits and '}'
                        chars.nth(len + 2);
                        out.push(c);
                    }
                    None => out.push('\\'),
                }
            }
            _ => out.push('\\'),
        }
    }
    out
}

/// Builds INI text section by section
#[derive(Debug, Default)]
pub struct IniWriter {
    out: String,
}

impl IniWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Comment line at the current position
    pub fn comment(&mut self, text: &str) -> &mut Self {
        self.out.push_str("# ");
        self.out.push_str(text);
        self.out.push('\n');
        self
    }

    /// Start a section, `name` without brackets
    pub fn section(&mut self, name: &str) -> &mut Self {
        if !self.out.is_empty() {
            self.out.push('\n');
        }
        self.out.push('[');
        self.out.push_str(name);
        self.out.push_str("]\n");
        self
    }

    /// Escaped key=value entry
    pub fn entry(&mut self, key: &str, value: &str) -> &mut Self {
        self.out.push_str(key);
        self.out.push('=');
        self.out.push_str(&escape(value));
        self.out.push('\n');
        self
    }

    /// Entry written verbatim (for formats with their own quoting)
    pub fn raw_entry(&mut self, key: &str, value: &str) -> &mut Self {
        self.out.push_str(key);
        self.out.push('=');
        self.out.push_str(value);
        self.out.push('\n');
        self
    }

    pub fn finish(&mut self) -> String {
        std::mem::take(&mut self.out)
    }
}

/// Parse a duration string (e.g., "5s", "100ms", "1min")
///
/// A bare number is taken as seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }

    if let Ok(secs) = s.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }

    if let Some(ms) = s.strip_suffix("ms") {
        return ms.trim().parse().ok().map(Duration::from_millis);
    }
    if let Some(mins) = s.strip_suffix("min") {
        return mins.trim().parse::<u64>().ok().map(|m| Duration::from_secs(m * 60));
    }
    if let Some(hours) = s.strip_suffix('h') {
        return hours.trim().parse::<u64>().ok().map(|h| Duration::from_secs(h * 3600));
    }
    if let Some(secs) = s.strip_suffix('s') {
        return secs.trim().parse().ok().map(Duration::from_secs);
    }

    None
}

/// Parse a boolean string value
pub fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_lowercase().as_str() {
        "yes" | "true" | "1" | "on" => Some(true),
        "no" | "false" | "0" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple() {
        let content = r#"
[Service]
DisplayName=Echo Service
Start=auto

[Parameters]
Application=/bin/echo
"#;
        let parsed = parse_file(content).unwrap();
        assert_eq!(get(&parsed, "[Service]", "DisplayName").as_deref(), Some("Echo Service"));
        assert_eq!(get(&parsed, "[Parameters]", "application").as_deref(), Some("/bin/echo"));
        assert_eq!(get(&parsed, "[Parameters]", "AppParameters"), None);
    }

    #[test]
    fn test_empty_file() {
        assert!(parse_file("").unwrap().is_empty());
        assert!(parse_file("# comment\n; another\n").unwrap().is_empty());
    }

    #[test]
    fn test_values_not_split() {
        let content = "[Unit]\nAfter=a.target b.target\nEnvironment=A=1,B=2\n";
        let parsed = parse_file(content).unwrap();
        assert_eq!(get_raw(&parsed, "[Unit]", "After"), Some("a.target b.target"));
        assert_eq!(get_raw(&parsed, "[Unit]", "Environment"), Some("A=1,B=2"));
    }

    #[test]
    fn test_last_value_wins_and_get_all_ordered() {
        let content = "[S]\nKey=one\nkey=two\nKEY=three\n";
        let parsed = parse_file(content).unwrap();
        assert_eq!(get(&parsed, "[S]", "Key").as_deref(), Some("three"));
        assert_eq!(get_all(&parsed, "[S]", "key"), vec!["one", "two", "three"]);
    }

    #[test]
    fn test_duplicate_section_error() {
        let result = parse_file("[A]\nx=1\n[A]\nx=2\n");
        assert!(matches!(result.unwrap_err(), IniError::DuplicateSection(_)));
    }

    #[test]
    fn test_escape_round_trip() {
        let values = [
            "plain",
            r#"--flag="value with spaces" -x"#,
            "%SystemRoot%\\system32",
            " leading and trailing ",
            "line one\nline two",
            "a=b=c",
            "",
            "\\x41 literal",
            "\\u{41} literal",
            "--x\u{0b}",
            "\u{0c}form feed",
            "\u{a0}no-break\u{a0}",
            "\u{3000}ideographic\u{3000}",
            "\t tab edges \t",
        ];
        for value in values {
            let mut w = IniWriter::new();
            w.section("S").entry("Value", value);
            let text = w.finish();
            let parsed = parse_file(&text).unwrap();
            assert_eq!(get(&parsed, "[S]", "Value").as_deref(), Some(value), "text was {:?}", text);
        }
    }

    #[test]
    fn test_raw_value_keeps_escapes() {
        let parsed = parse_file("[S]\nExecStart=/bin/sh -c \"a\\\\b\"\n").unwrap();
        assert_eq!(get_raw(&parsed, "[S]", "ExecStart"), Some(r#"/bin/sh -c "a\\b""#));
        assert_eq!(get(&parsed, "[S]", "ExecStart").as_deref(), Some(r#"/bin/sh -c "a\b""#));
    }

    #[test]
    fn test_unescape_unknown_sequence() {
        assert_eq!(unescape(r"C:\dir\file"), r"C:\dir\file");
        assert_eq!(unescape(r"\x4"), r"\x4");
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("5"), Some(Duration::from_secs(5)));
        assert_eq!(parse_duration("5s"), Some(Duration::from_secs(5)));
        assert_eq!(parse_duration("1500ms"), Some(Duration::from_millis(1500)));
        assert_eq!(parse_duration("2min"), Some(Duration::from_secs(120)));
        assert_eq!(parse_duration("1h"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_duration("-5"), None);
        assert_eq!(parse_duration("soon"), None);
        assert_eq!(parse_duration(""), None);
    }

    #[test]
    fn test_parse_bool() {
        assert_eq!(parse_bool("YES"), Some(true));
        assert_eq!(parse_bool("1"), Some(true));
        assert_eq!(parse_bool("off"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }
}
