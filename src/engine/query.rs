//! Query compilation: raw user text → FTS expression + post-filter phrases.
//!
//! The input is split into quoted and bare pieces. Quoted pieces become
//! native phrases when the index records positions; on positionless indexes
//! they degrade to an AND of their tokens plus a post-filter phrase that
//! `search` applies to the stored token text (pseudo-phrase matching).

use super::tokenizer;

/// Compilation result handed to the search path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledQuery {
    /// FTS `MATCH` expression. Empty when the input had no usable tokens.
    pub fts_query: String,
    /// Token sequences that must appear in-order and contiguous in the
    /// stored tokens of each candidate. Only produced on positionless
    /// indexes for quoted pieces of two or more tokens.
    pub filtering_phrases: Vec<Vec<String>>,
}

impl CompiledQuery {
    pub fn empty() -> Self {
        Self {
            fts_query: String::new(),
            filtering_phrases: Vec::new(),
        }
    }
}

/// Compile `raw` into an FTS expression.
///
/// `max_tokens` caps the total token count across all pieces;
/// `support_phrase` says whether the target index records positions.
pub fn make_fts_query(
    raw: &str,
    locale: &str,
    max_tokens: usize,
    support_phrase: bool,
) -> CompiledQuery {
    let mut expressions: Vec<String> = Vec::new();
    let mut filtering_phrases: Vec<Vec<String>> = Vec::new();
    let mut remaining = max_tokens;

    for piece in split_pieces(raw) {
        if remaining == 0 {
            break;
        }
        let mut tokens = tokenizer::tokenize(&piece.text, locale);
        if tokens.is_empty() {
            continue;
        }
        tokens.truncate(remaining);
        remaining -= tokens.len();

        if piece.quoted {
            if support_phrase {
                expressions.push(quote_phrase(&tokens));
            } else {
                expressions.push(and_chain(&tokens));
                if tokens.len() >= 2 {
                    filtering_phrases.push(tokens);
                }
            }
        } else {
            expressions.push(and_chain(&tokens));
        }
    }

    if expressions.is_empty() {
        return CompiledQuery::empty();
    }

    CompiledQuery {
        fts_query: expressions.join(" AND "),
        filtering_phrases,
    }
}

/// `true` when `phrase` appears as an in-order contiguous subsequence of
/// `doc_tokens`.
pub fn contains_phrase(doc_tokens: &[String], phrase: &[String]) -> bool {
    if phrase.is_empty() {
        return true;
    }
    if phrase.len() > doc_tokens.len() {
        return false;
    }
    doc_tokens
        .windows(phrase.len())
        .any(|window| window.iter().zip(phrase).all(|(a, b)| a == b))
}

// ── Piece scanning ────────────────────────────────────────────────────────────

struct Piece {
    text: String,
    quoted: bool,
}

/// Split the raw query into quoted (`"..."`, non-empty) and bare
/// (whitespace-delimited) pieces, in input order.
fn split_pieces(input: &str) -> Vec<Piece> {
    let mut pieces = Vec::new();
    let mut rest = input;

    loop {
        rest = rest.trim_start();
        if rest.is_empty() {
            break;
        }
        if let Some(after_quote) = rest.strip_prefix('"') {
            if let Some(end) = after_quote.find('"') {
                if end > 0 {
                    pieces.push(Piece {
                        text: after_quote[..end].to_string(),
                        quoted: true,
                    });
                }
                rest = &after_quote[end + 1..];
                continue;
            }
            // Unterminated quote: treat the remainder as one bare piece per
            // whitespace word.
            rest = after_quote;
            continue;
        }
        let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
        pieces.push(Piece {
            text: rest[..end].to_string(),
            quoted: false,
        });
        rest = &rest[end..];
    }

    pieces
}

// ── FTS expression building ───────────────────────────────────────────────────

fn quote_token(token: &str) -> String {
    format!("\"{}\"", token.replace('"', "\"\""))
}

fn quote_phrase(tokens: &[String]) -> String {
    format!("\"{}\"", tokens.join(" ").replace('"', "\"\""))
}

fn and_chain(tokens: &[String]) -> String {
    tokens
        .iter()
        .map(|t| quote_token(t))
        .collect::<Vec<_>>()
        .join(" AND ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toks(words: &[&str]) -> Vec<String> {
        words.iter().map(|w| w.to_string()).collect()
    }

    #[test]
    fn empty_input_compiles_to_empty() {
        assert_eq!(make_fts_query("", "en", 5, true), CompiledQuery::empty());
        assert_eq!(make_fts_query("   ", "en", 5, true), CompiledQuery::empty());
        assert_eq!(make_fts_query("!!!", "en", 5, true), CompiledQuery::empty());
    }

    #[test]
    fn bare_words_become_and_chain() {
        let q = make_fts_query("hello world", "en", 5, true);
        assert_eq!(q.fts_query, "\"hello\" AND \"world\"");
        assert!(q.filtering_phrases.is_empty());
    }

    #[test]
    fn quoted_piece_with_positions_is_native_phrase() {
        let q = make_fts_query("\"alpha beta\" gamma", "en", 5, true);
        assert_eq!(q.fts_query, "\"alpha beta\" AND \"gamma\"");
        assert!(q.filtering_phrases.is_empty());
    }

    #[test]
    fn quoted_piece_without_positions_gets_post_filter() {
        let q = make_fts_query("\"alpha beta\" gamma", "en", 5, false);
        assert_eq!(q.fts_query, "\"alpha\" AND \"beta\" AND \"gamma\"");
        assert_eq!(q.filtering_phrases, vec![toks(&["alpha", "beta"])]);
    }

    #[test]
    fn single_token_quote_needs_no_post_filter() {
        let q = make_fts_query("\"alpha\"", "en", 5, false);
        assert_eq!(q.fts_query, "\"alpha\"");
        assert!(q.filtering_phrases.is_empty());
    }

    #[test]
    fn token_cap_applies_across_pieces() {
        let q = make_fts_query("one two three four", "en", 2, true);
        assert_eq!(q.fts_query, "\"one\" AND \"two\"");
    }

    #[test]
    fn empty_quotes_are_skipped() {
        let q = make_fts_query("\"\" hello", "en", 5, true);
        assert_eq!(q.fts_query, "\"hello\"");
    }

    #[test]
    fn unterminated_quote_degrades_to_bare_words() {
        let q = make_fts_query("\"alpha beta", "en", 5, true);
        assert_eq!(q.fts_query, "\"alpha\" AND \"beta\"");
    }

    #[test]
    fn query_text_is_case_folded() {
        let q = make_fts_query("Hello WORLD", "en", 5, true);
        assert_eq!(q.fts_query, "\"hello\" AND \"world\"");
    }

    #[test]
    fn contains_phrase_checks_contiguous_order() {
        let doc = toks(&["alpha", "beta", "gamma"]);
        assert!(contains_phrase(&doc, &toks(&["alpha", "beta"])));
        assert!(contains_phrase(&doc, &toks(&["beta", "gamma"])));
        assert!(contains_phrase(&doc, &toks(&["alpha", "beta", "gamma"])));
        assert!(!contains_phrase(&doc, &toks(&["alpha", "gamma"])));
        assert!(!contains_phrase(&doc, &toks(&["beta", "alpha"])));
        assert!(!contains_phrase(&doc, &toks(&["alpha", "beta", "gamma", "delta"])));
        assert!(contains_phrase(&doc, &[]));
    }
}
