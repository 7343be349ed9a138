//! Placeholder token detection.

use std::sync::OnceLock;

use regex::Regex;

struct Patterns {
    fenced: Regex,
    inline: Regex,
    token: Regex,
}

fn patterns() -> Option<&'static Patterns> {
    static PATTERNS: OnceLock<Option<Patterns>> = OnceLock::new();
    PATTERNS
        .get_or_init(|| {
            let compiled = (|| -> Result<Patterns, regex::Error> {
                Ok(Patterns {
                    fenced: Regex::new(r"(?s)```.*?```")?,
                    inline: Regex::new(r"`[^`\n]*`")?,
                    // `\b` is Unicode-aware: a token glued to CJK text is not a word.
                    token: Regex::new(r"(?i)\b(todo|tbd|fixme|xxx)\b")?,
                })
            })();
            match compiled {
                Ok(p) => Some(p),
                Err(e) => {
                    tracing::error!("Failed to compile placeholder patterns: {}", e);
                    None
                }
            }
        })
        .as_ref()
}

/// Find stand-alone placeholder tokens in `content`, ignoring anything inside
/// fenced or inline code spans.
///
/// Returns the distinct tokens found, upper-cased, in order of first
/// appearance.
pub fn find_placeholders(content: &str) -> Vec<String> {
    let Some(p) = patterns() else {
        return Vec::new();
    };

    let without_fences = p.fenced.replace_all(content, " ");
    let prose = p.inline.replace_all(&without_fences, " ");

    let mut found: Vec<String> = Vec::new();
    for m in p.token.find_iter(&prose) {
        let token = m.as_str().to_uppercase();
        if !found.contains(&token) {
            found.push(token);
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detects_whole_words() {
        assert_eq!(find_placeholders("Implement login, TODO add tests"), vec!["TODO"]);
        assert_eq!(find_placeholders("Owner: tbd. Also fixme later"), vec!["TBD", "FIXME"]);
        assert_eq!(find_placeholders("replace xxx with the real host"), vec!["XXX"]);
    }

    #[test]
    fn test_ignores_embedded_tokens() {
        assert!(find_placeholders("Update the todolist widget").is_empty());
        assert!(find_placeholders("Use the xxxl shirt size table").is_empty());
        assert!(find_placeholders("Rename mytodo to items").is_empty());
    }

    #[test]
    fn test_ignores_code_spans() {
        let content =
            "Run `grep TODO src/` and clean up.\n```\n// TODO: remove\nlet x = 1;\n```\nDone.";
        assert!(find_placeholders(content).is_empty());
    }

    #[test]
    fn test_no_misfire_inside_cjk_prose() {
        assert!(find_placeholders("完成todo列表的重构工作并补充说明文档").is_empty());
        assert_eq!(find_placeholders("完成 TODO 列表"), vec!["TODO"]);
    }

    #[test]
    fn test_duplicates_reported_once() {
        assert_eq!(find_placeholders("todo one, TODO two"), vec!["TODO"]);
    }
}
