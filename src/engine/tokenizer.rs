//! Locale guessing and token stream production.
//!
//! Text is case-folded through compatibility decomposition (NFKD) and
//! lowercased before any analysis; control and format characters are removed
//! and combining marks are stripped from the emitted tokens. Token order is
//! preserved.
//!
//! Japanese goes through a morphological analyzer when the
//! `tokenizer-lindera` feature is enabled; every other locale (and `ja`
//! without the feature) uses the Unicode word segmenter.

use unicode_normalization::UnicodeNormalization;
use unicode_normalization::char::is_combining_mark;
use unicode_segmentation::UnicodeSegmentation;

/// Guess the locale of `text`, falling back to `preferred`.
///
/// Any hiragana or katakana → `ja`. Any hangul → `ko`. Han with no kana or
/// hangul → `zh` when `preferred` starts with `zh`, else `ja`. Otherwise the
/// preferred locale is returned unchanged.
pub fn guess_locale(text: &str, preferred: &str) -> String {
    let folded = case_fold(text);

    let mut has_kana = false;
    let mut has_hangul = false;
    let mut has_han = false;
    for c in folded.chars() {
        if is_kana(c) {
            has_kana = true;
            break;
        }
        if is_hangul(c) {
            has_hangul = true;
        } else if is_han(c) {
            has_han = true;
        }
    }

    if has_kana {
        return "ja".to_string();
    }
    if has_hangul {
        return "ko".to_string();
    }
    if has_han {
        return if preferred.starts_with("zh") {
            "zh".to_string()
        } else {
            "ja".to_string()
        };
    }
    preferred.to_string()
}

/// Tokenize `text` for `locale` into an ordered sequence of tokens.
///
/// Duplicates are preserved here; callers that index without positions apply
/// [`dedup_tokens`] afterwards.
pub fn tokenize(text: &str, locale: &str) -> Vec<String> {
    let folded = case_fold(text);

    #[cfg(feature = "tokenizer-lindera")]
    if locale == "ja" {
        if let Some(tokens) = morphology::surface_forms(&folded) {
            return tokens
                .into_iter()
                .filter_map(|t| clean_token(&t))
                .collect();
        }
    }
    #[cfg(not(feature = "tokenizer-lindera"))]
    let _ = locale;

    folded
        .unicode_words()
        .filter_map(clean_token)
        .collect()
}

/// NFKD + lowercase, with control and format characters removed and
/// surrounding whitespace trimmed.
pub fn case_fold(text: &str) -> String {
    let folded: String = text
        .nfkd()
        .filter(|c| !c.is_control() && !is_format_char(*c))
        .flat_map(char::to_lowercase)
        .collect();
    folded.trim().to_string()
}

/// Insertion-order dedup capped at `max_tokens`, then sorted ascending.
///
/// Used when the index records no positions: the sorted, unique token list
/// keeps MATCH plans stable across documents with reordered words.
pub fn dedup_tokens(tokens: Vec<String>, max_tokens: usize) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for token in tokens {
        if out.len() >= max_tokens {
            break;
        }
        if seen.insert(token.clone()) {
            out.push(token);
        }
    }
    out.sort_unstable();
    out
}

/// Strip combining marks and drop the token when nothing word-like remains.
fn clean_token(token: &str) -> Option<String> {
    let stripped: String = token.chars().filter(|c| !is_combining_mark(*c)).collect();
    if stripped.chars().any(char::is_alphanumeric) {
        Some(stripped)
    } else {
        None
    }
}

fn is_kana(c: char) -> bool {
    matches!(c,
        '\u{3040}'..='\u{309F}'        // hiragana
        | '\u{30A0}'..='\u{30FF}'      // katakana
        | '\u{31F0}'..='\u{31FF}'      // katakana phonetic extensions
        | '\u{FF66}'..='\u{FF9D}'      // halfwidth katakana
    )
}

fn is_hangul(c: char) -> bool {
    matches!(c,
        '\u{AC00}'..='\u{D7AF}'        // syllables
        | '\u{1100}'..='\u{11FF}'      // jamo
        | '\u{3130}'..='\u{318F}'      // compatibility jamo
    )
}

fn is_han(c: char) -> bool {
    matches!(c,
        '\u{4E00}'..='\u{9FFF}'        // unified ideographs
        | '\u{3400}'..='\u{4DBF}'      // extension A
        | '\u{F900}'..='\u{FAFF}'      // compatibility ideographs
    )
}

/// Unicode Cf characters commonly embedded in copied text (zero-width
/// spaces/joiners, directional marks, BOM, soft hyphen). `char::is_control`
/// only covers Cc.
fn is_format_char(c: char) -> bool {
    matches!(c,
        '\u{00AD}'
        | '\u{061C}'
        | '\u{180E}'
        | '\u{200B}'..='\u{200F}'
        | '\u{202A}'..='\u{202E}'
        | '\u{2060}'..='\u{2064}'
        | '\u{2066}'..='\u{206F}'
        | '\u{FEFF}'
        | '\u{FFF9}'..='\u{FFFB}'
    )
}

#[cfg(feature = "tokenizer-lindera")]
mod morphology {
    //! Feature-gated Japanese morphological analysis.
    //!
    //! The analyzer is built once on first use. A missing or broken
    //! dictionary downgrades `ja` to the Unicode segmenter instead of
    //! failing the request.

    use std::sync::OnceLock;

    use lindera::dictionary::{DictionaryKind, load_dictionary_from_kind};
    use lindera::mode::Mode;
    use lindera::segmenter::Segmenter;
    use lindera::tokenizer::Tokenizer;
    use tracing::warn;

    static TOKENIZER: OnceLock<Option<Tokenizer>> = OnceLock::new();

    pub(super) fn surface_forms(text: &str) -> Option<Vec<String>> {
        let tokenizer = TOKENIZER
            .get_or_init(|| match load_dictionary_from_kind(DictionaryKind::IPADIC) {
                Ok(dictionary) => {
                    Some(Tokenizer::new(Segmenter::new(Mode::Normal, dictionary, None)))
                }
                Err(e) => {
                    warn!("morphological dictionary unavailable: {e}");
                    None
                }
            })
            .as_ref()?;

        match tokenizer.tokenize(text) {
            Ok(mut tokens) => Some(tokens.iter_mut().map(|t| t.text.to_string()).collect()),
            Err(e) => {
                warn!("morphological tokenize failed: {e}");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guesses_japanese_from_kana() {
        assert_eq!(guess_locale("こんにちは world", "en"), "ja");
        assert_eq!(guess_locale("カタカナ", "en"), "ja");
    }

    #[test]
    fn guesses_korean_from_hangul() {
        assert_eq!(guess_locale("안녕하세요", "en"), "ko");
    }

    #[test]
    fn han_only_depends_on_preference() {
        assert_eq!(guess_locale("漢字", "zh-CN"), "zh");
        assert_eq!(guess_locale("漢字", "zh"), "zh");
        assert_eq!(guess_locale("漢字", "en"), "ja");
    }

    #[test]
    fn plain_text_keeps_preference() {
        assert_eq!(guess_locale("hello world", "en"), "en");
        assert_eq!(guess_locale("bonjour", "fr"), "fr");
    }

    #[test]
    fn case_fold_lowercases_and_trims() {
        assert_eq!(case_fold("  Hello WORLD  "), "hello world");
    }

    #[test]
    fn case_fold_decomposes_compatibility_forms() {
        // Fullwidth "ＡＢＣ" decomposes to "abc" under NFKD + lowercase.
        assert_eq!(case_fold("ＡＢＣ"), "abc");
    }

    #[test]
    fn case_fold_strips_format_chars() {
        assert_eq!(case_fold("zero\u{200B}width"), "zerowidth");
    }

    #[test]
    fn tokenize_splits_words_and_drops_punctuation() {
        let tokens = tokenize("Hello, world! (again)", "en");
        assert_eq!(tokens, vec!["hello", "world", "again"]);
    }

    #[test]
    fn tokenize_preserves_order_and_duplicates() {
        let tokens = tokenize("b a b c", "en");
        assert_eq!(tokens, vec!["b", "a", "b", "c"]);
    }

    #[test]
    fn tokenize_strips_combining_marks() {
        // "é" as e + U+0301 survives as plain "e".
        let tokens = tokenize("cafe\u{0301}", "fr");
        assert_eq!(tokens, vec!["cafe"]);
    }

    #[test]
    fn tokenize_handles_cjk_without_feature() {
        let tokens = tokenize("漢字テスト", "ja");
        assert!(!tokens.is_empty());
    }

    #[test]
    fn dedup_tokens_caps_and_sorts() {
        let tokens = vec![
            "c".to_string(),
            "a".to_string(),
            "c".to_string(),
            "b".to_string(),
        ];
        assert_eq!(dedup_tokens(tokens, 10), vec!["a", "b", "c"]);

        let many = vec!["z".to_string(), "y".to_string(), "x".to_string()];
        assert_eq!(dedup_tokens(many, 2), vec!["y", "z"]);
    }

    #[test]
    fn empty_input_yields_no_tokens() {
        assert!(tokenize("", "en").is_empty());
        assert!(tokenize("!!! ---", "en").is_empty());
    }
}
