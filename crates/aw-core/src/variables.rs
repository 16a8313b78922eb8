use std::collections::HashMap;

/// Parses a world's `.env`-style `variables` text into a key/value map.
/// Blank lines and lines starting with `#` are skipped; `KEY=VALUE` lines
/// have their value trimmed of surrounding whitespace and, if present, a
/// single layer of matching `"` or `'` quotes — the same shape `dotenvy`
/// accepts, implemented directly since only this line-oriented subset is
/// needed here.
pub fn parse_variables(text: &str) -> HashMap<String, String> {
    let mut vars = HashMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        vars.insert(key.to_string(), unquote(value.trim()));
    }
    vars
}

fn unquote(value: &str) -> String {
    let bytes = value.as_bytes();
    if bytes.len() >= 2 {
        let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
        if (first == b'"' && last == b'"') || (first == b'\'' && last == b'\'') {
            return value[1..value.len() - 1].to_string();
        }
    }
    value.to_string()
}

/// Replaces every `${KEY}` occurrence in `template` with its value from
/// `vars`; unresolved keys are left untouched rather than removed, so a
/// missing variable fails loudly downstream instead of silently blanking
/// part of a prompt.
pub fn substitute_variables(template: &str, vars: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("${") {
        let Some(end) = rest[start..].find('}') else {
            out.push_str(rest);
            return out;
        };
        out.push_str(&rest[..start]);
        let key = &rest[start + 2..start + end];
        match vars.get(key) {
            Some(value) => out.push_str(value),
            None => out.push_str(&rest[start..start + end + 1]),
        }
        rest = &rest[start + end + 1..];
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_key_value_lines_skipping_comments_and_blanks() {
        let vars = parse_variables("# comment\nFOO=bar\n\nBAZ=\"quoted value\"\nQUUX='single'\n");
        assert_eq!(vars.get("FOO"), Some(&"bar".to_string()));
        assert_eq!(vars.get("BAZ"), Some(&"quoted value".to_string()));
        assert_eq!(vars.get("QUUX"), Some(&"single".to_string()));
        assert_eq!(vars.len(), 3);
    }

    #[test]
    fn substitutes_known_keys_and_leaves_unknown_untouched() {
        let mut vars = HashMap::new();
        vars.insert("NAME".to_string(), "world".to_string());
        let out = substitute_variables("hello ${NAME}, missing ${OTHER}", &vars);
        assert_eq!(out, "hello world, missing ${OTHER}");
    }
}
