/// Normalizes `input` to kebab-case: lowercase, runs of non-alphanumeric
/// characters collapse to a single `-`, leading/trailing `-` trimmed.
/// `World.id`/`Agent.id` defaults are derived this way.
pub fn kebab_case(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut last_was_dash = true; // suppress a leading dash
    for ch in input.chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_lowercase());
            last_was_dash = false;
        } else if !last_was_dash {
            out.push('-');
            last_was_dash = true;
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    out
}

/// Resolves a caller-supplied identifier `x` against a collection whose
/// entries expose a stored id and a stored name:
///
/// 1. Exact match against `kebab_case(x)` among stored ids.
/// 2. Else, scan for any entry whose id, name, `kebab_case(id)`, or
///    `kebab_case(name)` equals `x` or `kebab_case(x)`.
/// 3. Else, fall back to `kebab_case(x)` so callers get a stable not-found
///    identifier rather than the raw, possibly-unnormalized input.
pub fn resolve_identifier<'a, T>(
    x: &str,
    entries: impl Iterator<Item = &'a T>,
    id_of: impl Fn(&'a T) -> &'a str,
    name_of: impl Fn(&'a T) -> &'a str,
) -> String {
    let normalized = kebab_case(x);
    let mut fallback = None;
    for entry in entries {
        let id = id_of(entry);
        let name = name_of(entry);
        if id == normalized {
            return id.to_string();
        }
        if fallback.is_none()
            && (id == x
                || name == x
                || kebab_case(id) == x
                || kebab_case(name) == x
                || kebab_case(id) == normalized
                || kebab_case(name) == normalized)
        {
            fallback = Some(id.to_string());
        }
    }
    fallback.unwrap_or(normalized)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kebab_case_collapses_separators() {
        assert_eq!(kebab_case("My Cool World!!"), "my-cool-world");
        assert_eq!(kebab_case("  leading"), "leading");
        assert_eq!(kebab_case("trailing  "), "trailing");
        assert_eq!(kebab_case("snake_case_name"), "snake-case-name");
    }

    #[test]
    fn resolve_identifier_matches_by_name_then_falls_back() {
        struct Entry {
            id: String,
            name: String,
        }
        let entries = vec![
            Entry { id: "research-world".to_string(), name: "Research World".to_string() },
        ];
        let resolved = resolve_identifier(
            "Research World",
            entries.iter(),
            |e| e.id.as_str(),
            |e| e.name.as_str(),
        );
        assert_eq!(resolved, "research-world");

        let missing = resolve_identifier("nope", entries.iter(), |e| e.id.as_str(), |e| e.name.as_str());
        assert_eq!(missing, "nope");
    }
}
