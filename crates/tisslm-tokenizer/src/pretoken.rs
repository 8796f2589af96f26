//! GPT-2 style pre-tokenization.
//!
//! The canonical pattern uses the lookahead `\s+(?!\S)` to leave the final
//! space of a whitespace run attached to the following word. The `regex`
//! crate has no lookahead, so we match greedy `\s+` runs and re-split them
//! in a fix-up pass.

use regex::Regex;
use std::sync::OnceLock;

const SPLIT_PATTERN: &str =
    r"'(?:[sdmt]|ll|ve|re)| ?\p{L}+| ?\p{N}+| ?[^\s\p{L}\p{N}]+|\s+";

fn splitter() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // The pattern is a compile-time constant; it cannot fail to parse.
    RE.get_or_init(|| Regex::new(SPLIT_PATTERN).unwrap())
}

/// Split `text` into pre-tokens: contractions, space-prefixed words, numbers,
/// punctuation runs, and whitespace runs.
pub fn pretokenize(text: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let mut pending_space = false;

    for m in splitter().find_iter(text) {
        let mut piece = m.as_str().to_string();
        if pending_space {
            piece.insert(0, ' ');
            pending_space = false;
        }

        let is_whitespace = piece.chars().all(char::is_whitespace);
        let followed_by_text = text[m.end()..].starts_with(|c: char| !c.is_whitespace());
        if is_whitespace && followed_by_text && piece.chars().count() > 1 {
            // Leave the last whitespace char for the next token, matching
            // the `\s+(?!\S)` behavior of the reference pattern.
            let last = piece.pop().unwrap_or(' ');
            if !piece.is_empty() {
                out.push(piece);
            }
            if last == ' ' {
                pending_space = true;
            } else {
                out.push(last.to_string());
            }
        } else {
            out.push(piece);
        }
    }
    if pending_space {
        out.push(" ".to_string());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_words_carry_leading_space() {
        assert_eq!(pretokenize("hello world"), vec!["hello", " world"]);
    }

    #[test]
    fn test_contractions_split_off() {
        assert_eq!(pretokenize("don't"), vec!["don", "'t"]);
        assert_eq!(pretokenize("we're"), vec!["we", "'re"]);
    }

    #[test]
    fn test_numbers_and_punctuation() {
        assert_eq!(pretokenize("a1 b!?"), vec!["a", "1", " b", "!?"]);
    }

    #[test]
    fn test_space_run_leaves_one_for_next_word() {
        assert_eq!(pretokenize("a   b"), vec!["a", "  ", " b"]);
    }

    #[test]
    fn test_newline_run_before_word() {
        assert_eq!(pretokenize("a\n\nb"), vec!["a", "\n", "\n", "b"]);
    }

    #[test]
    fn test_trailing_whitespace_kept_whole() {
        assert_eq!(pretokenize("a  "), vec!["a", "  "]);
    }

    #[test]
    fn test_roundtrip_concatenation() {
        let text = "The  quick-brown fox, isn't it?\n  42 times.";
        assert_eq!(pretokenize(text).concat(), text);
    }
}
