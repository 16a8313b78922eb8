use std::collections::HashSet;

/// Extracts every `@token` mention from `content`.
/// A token runs until the next whitespace or punctuation that cannot
/// appear in a kebab-case identifier.
pub fn extract_mentions(content: &str) -> HashSet<String> {
    let mut mentions = HashSet::new();
    let mut chars = content.char_indices().peekable();
    while let Some((i, ch)) = chars.next() {
        if ch != '@' {
            continue;
        }
        if i > 0 && content.as_bytes()[i - 1].is_ascii_alphanumeric() {
            continue; // an email-like "user@host" is not a mention
        }
        let rest = &content[i + 1..];
        let token: String = rest
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
            .collect();
        if !token.is_empty() {
            mentions.insert(token.to_lowercase());
        }
    }
    mentions
}

/// Extracts mentions that begin a paragraph. Paragraphs are
/// separated by one or more blank lines.
pub fn extract_paragraph_leading_mentions(content: &str) -> HashSet<String> {
    let mut mentions = HashSet::new();
    for paragraph in content.split("\n\n") {
        let trimmed = paragraph.trim_start();
        if let Some(rest) = trimmed.strip_prefix('@') {
            let token: String = rest
                .chars()
                .take_while(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
                .collect();
            if !token.is_empty() {
                mentions.insert(token.to_lowercase());
            }
        }
    }
    mentions
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_simple_mentions() {
        let mentions = extract_mentions("hey @researcher can you check this with @writer-bot?");
        assert!(mentions.contains("researcher"));
        assert!(mentions.contains("writer-bot"));
        assert_eq!(mentions.len(), 2);
    }

    #[test]
    fn ignores_email_like_tokens() {
        let mentions = extract_mentions("contact me at user@example.com");
        assert!(!mentions.contains("example"));
    }

    #[test]
    fn paragraph_leading_mentions_only_match_first_token() {
        let content = "@alice please look at this\n\nmeanwhile @bob should wait\n\n@carol go ahead";
        let leading = extract_paragraph_leading_mentions(content);
        assert!(leading.contains("alice"));
        assert!(leading.contains("carol"));
        assert!(!leading.contains("bob"));
    }
}
