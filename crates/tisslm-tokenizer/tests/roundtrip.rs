//! End-to-end tokenizer behavior: training, persistence, and the
//! encode/decode round trip on arbitrary text.

use proptest::prelude::*;
use tisslm_tokenizer::Tokenizer;

const CORPUS: &str = "the quick brown fox jumps over the lazy dog. \
the dog did not mind; the fox did it again and again and again. \
numbers like 123 and 456 appear, as do symbols: !?#@.";

#[test]
fn trained_tokenizer_compresses_training_text() {
    let mut tok = Tokenizer::new();
    tok.train(CORPUS, 400).unwrap();
    let trained_len = tok.encode(CORPUS).len();
    let byte_len = Tokenizer::new().encode(CORPUS).len();
    assert!(trained_len < byte_len);
    assert_eq!(tok.decode(&tok.encode(CORPUS)).unwrap(), CORPUS);
}

#[test]
fn persisted_tokenizer_encodes_identically() {
    let dir = tempfile::tempdir().unwrap();
    let prefix = dir.path().join("tok");
    let mut tok = Tokenizer::new();
    tok.train(CORPUS, 350).unwrap();
    tok.save(&prefix).unwrap();

    let loaded = Tokenizer::load(&prefix).unwrap();
    for text in ["the fox", "unseen words zebra!", "  spaced  out  "] {
        assert_eq!(loaded.encode(text), tok.encode(text));
    }
}

#[test]
fn unseen_bytes_still_encode() {
    let mut tok = Tokenizer::new();
    tok.train("only ascii here, nothing else", 300).unwrap();
    let text = "naïve café — 日本語";
    let ids = tok.encode(text);
    assert_eq!(tok.decode(&ids).unwrap(), text);
}

#[test]
fn crlf_line_endings_roundtrip_exactly() {
    let text = "line one\r\nline two\r\n\r\nend";
    let byte_level = Tokenizer::new();
    assert_eq!(byte_level.decode(&byte_level.encode(text)).unwrap(), text);

    let mut trained = Tokenizer::new();
    trained.train(CORPUS, 320).unwrap();
    assert_eq!(trained.decode(&trained.encode(text)).unwrap(), text);
}

proptest! {
    #[test]
    fn roundtrip_arbitrary_text(text in "\\PC{0,200}") {
        let mut tok = Tokenizer::new();
        tok.train(CORPUS, 320).unwrap();
        let ids = tok.encode(&text);
        prop_assert_eq!(tok.decode(&ids).unwrap(), text);
    }

    #[test]
    fn byte_level_roundtrip(text in ".*") {
        let tok = Tokenizer::new();
        let ids = tok.encode(&text);
        prop_assert_eq!(tok.decode(&ids).unwrap(), text);
    }
}
