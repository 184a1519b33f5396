//! Tokenizer for query and snippet text.

use regex::Regex;
use std::sync::OnceLock;

use super::errors::{ParseError, ParseResult};

/// One lexical token.
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    /// Capital-initial identifier: variable, entity type or function name.
    Name(String),
    /// Lowercase-initial identifier: relation type, or the keyword `is`.
    Word(String),
    /// String literal, quotes stripped.
    Str(String),
    /// Numeric literal.
    Number(serde_json::Number),
    /// `%(name)s` bound-parameter placeholder.
    Param(String),
    Comma,
    LParen,
    RParen,
    Question,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl Token {
    /// Human-readable rendering for error messages.
    pub fn describe(&self) -> String {
        match self {
            Token::Name(s) | Token::Word(s) => format!("`{}`", s),
            Token::Str(s) => format!("\"{}\"", s),
            Token::Number(n) => n.to_string(),
            Token::Param(p) => format!("%({})s", p),
            Token::Comma => "`,`".into(),
            Token::LParen => "`(`".into(),
            Token::RParen => "`)`".into(),
            Token::Question => "`?`".into(),
            Token::Eq => "`=`".into(),
            Token::Ne => "`!=`".into(),
            Token::Lt => "`<`".into(),
            Token::Le => "`<=`".into(),
            Token::Gt => "`>`".into(),
            Token::Ge => "`>=`".into(),
        }
    }
}

struct Patterns {
    whitespace: Regex,
    param: Regex,
    name: Regex,
    word: Regex,
    number: Regex,
    string: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| Patterns {
        whitespace: Regex::new(r"^\s+").unwrap(),
        param: Regex::new(r"^%\(([A-Za-z_][A-Za-z0-9_]*)\)s").unwrap(),
        name: Regex::new(r"^[A-Z][A-Za-z0-9_]*").unwrap(),
        word: Regex::new(r"^[a-z][a-z0-9_]*").unwrap(),
        number: Regex::new(r"^-?[0-9]+(\.[0-9]+)?").unwrap(),
        string: Regex::new(r#"^"([^"]*)"|^'([^']*)'"#).unwrap(),
    })
}

/// Tokenizes query text, returning tokens with their byte offsets.
pub fn tokenize(input: &str) -> ParseResult<Vec<(Token, usize)>> {
    let p = patterns();
    let mut tokens = Vec::new();
    let mut offset = 0;

    while offset < input.len() {
        let rest = &input[offset..];
        if let Some(m) = p.whitespace.find(rest) {
            offset += m.end();
            continue;
        }
        if let Some(caps) = p.param.captures(rest) {
            tokens.push((Token::Param(caps[1].to_string()), offset));
            offset += caps[0].len();
            continue;
        }
        if let Some(caps) = p.string.captures(rest) {
            let text = caps
                .get(1)
                .or_else(|| caps.get(2))
                .map(|m| m.as_str())
                .unwrap_or("");
            tokens.push((Token::Str(text.to_string()), offset));
            offset += caps[0].len();
            continue;
        }
        if let Some(m) = p.number.find(rest) {
            // `-` alone would not match; the full match is a valid JSON number.
            let number: serde_json::Number = m
                .as_str()
                .parse::<f64>()
                .ok()
                .and_then(|_| serde_json::from_str(m.as_str()).ok())
                .ok_or(ParseError::UnexpectedCharacter { position: offset })?;
            tokens.push((Token::Number(number), offset));
            offset += m.end();
            continue;
        }
        if let Some(m) = p.name.find(rest) {
            tokens.push((Token::Name(m.as_str().to_string()), offset));
            offset += m.end();
            continue;
        }
        if let Some(m) = p.word.find(rest) {
            tokens.push((Token::Word(m.as_str().to_string()), offset));
            offset += m.end();
            continue;
        }

        let (token, len) = match rest.as_bytes() {
            [b'<', b'=', ..] => (Token::Le, 2),
            [b'>', b'=', ..] => (Token::Ge, 2),
            [b'!', b'=', ..] => (Token::Ne, 2),
            [b',', ..] => (Token::Comma, 1),
            [b'(', ..] => (Token::LParen, 1),
            [b')', ..] => (Token::RParen, 1),
            [b'?', ..] => (Token::Question, 1),
            [b'=', ..] => (Token::Eq, 1),
            [b'<', ..] => (Token::Lt, 1),
            [b'>', ..] => (Token::Gt, 1),
            _ => return Err(ParseError::UnexpectedCharacter { position: offset }),
        };
        tokens.push((token, offset));
        offset += len;
    }

    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_relation() {
        let tokens = tokenize("X in_state S, S name \"published\"").unwrap();
        let kinds: Vec<&Token> = tokens.iter().map(|(t, _)| t).collect();
        assert_eq!(kinds[0], &Token::Name("X".into()));
        assert_eq!(kinds[1], &Token::Word("in_state".into()));
        assert_eq!(kinds[3], &Token::Comma);
        assert_eq!(kinds.last().unwrap(), &&Token::Str("published".into()));
    }

    #[test]
    fn test_tokenize_param_and_operator() {
        let tokens = tokenize("U eid %(u)s, X age >= 18").unwrap();
        assert!(tokens.iter().any(|(t, _)| *t == Token::Param("u".into())));
        assert!(tokens.iter().any(|(t, _)| *t == Token::Ge));
    }

    #[test]
    fn test_tokenize_optional_marker() {
        let tokens = tokenize("X wf_info_for W?").unwrap();
        assert_eq!(tokens.last().unwrap().0, Token::Question);
    }

    #[test]
    fn test_reject_unknown_character() {
        let err = tokenize("X @ Y").unwrap_err();
        assert_eq!(err, ParseError::UnexpectedCharacter { position: 2 });
    }
}
