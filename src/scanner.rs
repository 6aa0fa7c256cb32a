// File: src/scanner.rs
//
// On-demand scanner for Cinder source text.
// Produces one token per call; lexemes borrow the source string, so the
// source must outlive every token derived from it.

use clap::ValueEnum;

/// Token types produced by the scanner.
///
/// Keyword tokens are what the dialect tables map *to*; a dialect never adds
/// new token types, it only adds spellings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    // Single-character punctuation.
    LeftParen,
    RightParen,
    LeftBrace,
    RightBrace,
    Comma,
    Dot,
    Minus,
    Plus,
    Semicolon,
    Slash,
    Star,

    // One- or two-character operators.
    Bang,
    BangEqual,
    Equal,
    EqualEqual,
    Greater,
    GreaterEqual,
    Less,
    LessEqual,

    // Literals.
    Identifier,
    String,
    Number,

    // Keywords.
    And,
    Class,
    Else,
    False,
    For,
    Fun,
    If,
    Nil,
    Or,
    Print,
    Return,
    True,
    Var,
    While,

    /// Reserved. Scans as a keyword in the casual dialect but has no parse
    /// rule, so any use is rejected at compile time.
    Sizeof,

    /// The lexeme of an error token is the error message itself.
    Error,
    Eof,
}

/// A single token. `lexeme` points into the scanned source.
#[derive(Debug, Clone, Copy)]
pub struct Token<'src> {
    pub kind: TokenKind,
    pub lexeme: &'src str,
    pub line: usize,
}

/// Keyword table selection. Chosen once at startup and applied for the whole
/// process; mixing tables mid-run is not supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum Dialect {
    /// The canonical keyword set.
    #[default]
    Standard,
    /// Adds natural-language spellings: action, store, say, give, is, matches.
    Natural,
    /// Adds casual spellings: do, divide, is, issameas, give, howbig.
    Casual,
}

impl std::fmt::Display for Dialect {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(match self {
            Dialect::Standard => "standard",
            Dialect::Natural => "natural",
            Dialect::Casual => "casual",
        })
    }
}

const STANDARD_KEYWORDS: &[(&str, TokenKind)] = &[
    ("and", TokenKind::And),
    ("class", TokenKind::Class),
    ("else", TokenKind::Else),
    ("false", TokenKind::False),
    ("for", TokenKind::For),
    ("fun", TokenKind::Fun),
    ("if", TokenKind::If),
    ("nil", TokenKind::Nil),
    ("or", TokenKind::Or),
    ("print", TokenKind::Print),
    ("return", TokenKind::Return),
    ("true", TokenKind::True),
    ("var", TokenKind::Var),
    ("while", TokenKind::While),
];

const NATURAL_KEYWORDS: &[(&str, TokenKind)] = &[
    ("action", TokenKind::Fun),
    ("store", TokenKind::Var),
    ("say", TokenKind::Print),
    ("give", TokenKind::Return),
    ("is", TokenKind::Equal),
    ("matches", TokenKind::EqualEqual),
];

const CASUAL_KEYWORDS: &[(&str, TokenKind)] = &[
    ("do", TokenKind::While),
    ("divide", TokenKind::Slash),
    ("is", TokenKind::Equal),
    ("issameas", TokenKind::EqualEqual),
    ("give", TokenKind::Return),
    ("howbig", TokenKind::Sizeof),
];

/// Streaming scanner over a source string.
pub struct Scanner<'src> {
    source: &'src str,
    /// Byte offset of the first character of the token being scanned.
    start: usize,
    /// Byte offset of the next character to consume.
    current: usize,
    line: usize,
    dialect: Dialect,
}

impl<'src> Scanner<'src> {
    pub fn new(source: &'src str, dialect: Dialect) -> Self {
        Scanner { source, start: 0, current: 0, line: 1, dialect }
    }

    /// Scans and returns the next token, consuming leading whitespace and
    /// line comments first.
    pub fn scan_token(&mut self) -> Token<'src> {
        self.skip_whitespace();
        self.start = self.current;

        if self.is_at_end() {
            return self.make_token(TokenKind::Eof);
        }

        let c = self.advance();
        if is_alpha(c) {
            return self.identifier();
        }
        if c.is_ascii_digit() {
            return self.number();
        }

        match c {
            b'(' => self.make_token(TokenKind::LeftParen),
            b')' => self.make_token(TokenKind::RightParen),
            b'{' => self.make_token(TokenKind::LeftBrace),
            b'}' => self.make_token(TokenKind::RightBrace),
            b';' => self.make_token(TokenKind::Semicolon),
            b',' => self.make_token(TokenKind::Comma),
            b'.' => self.make_token(TokenKind::Dot),
            b'-' => self.make_token(TokenKind::Minus),
            b'+' => self.make_token(TokenKind::Plus),
            b'/' => self.make_token(TokenKind::Slash),
            b'*' => self.make_token(TokenKind::Star),
            b'!' => {
                let kind = if self.match_byte(b'=') { TokenKind::BangEqual } else { TokenKind::Bang };
                self.make_token(kind)
            }
            b'=' => {
                let kind =
                    if self.match_byte(b'=') { TokenKind::EqualEqual } else { TokenKind::Equal };
                self.make_token(kind)
            }
            b'<' => {
                let kind = if self.match_byte(b'=') { TokenKind::LessEqual } else { TokenKind::Less };
                self.make_token(kind)
            }
            b'>' => {
                let kind =
                    if self.match_byte(b'=') { TokenKind::GreaterEqual } else { TokenKind::Greater };
                self.make_token(kind)
            }
            b'"' => self.string(),
            _ => self.error_token("Unexpected character."),
        }
    }

    fn is_at_end(&self) -> bool {
        self.current >= self.source.len()
    }

    fn advance(&mut self) -> u8 {
        let c = self.source.as_bytes()[self.current];
        self.current += 1;
        c
    }

    fn peek(&self) -> u8 {
        if self.is_at_end() {
            b'\0'
        } else {
            self.source.as_bytes()[self.current]
        }
    }

    fn peek_next(&self) -> u8 {
        if self.current + 1 >= self.source.len() {
            b'\0'
        } else {
            self.source.as_bytes()[self.current + 1]
        }
    }

    fn match_byte(&mut self, expected: u8) -> bool {
        if self.is_at_end() || self.peek() != expected {
            return false;
        }
        self.current += 1;
        true
    }

    fn make_token(&self, kind: TokenKind) -> Token<'src> {
        Token { kind, lexeme: &self.source[self.start..self.current], line: self.line }
    }

    fn error_token(&self, message: &'static str) -> Token<'src> {
        Token { kind: TokenKind::Error, lexeme: message, line: self.line }
    }

    fn skip_whitespace(&mut self) {
        loop {
            match self.peek() {
                b' ' | b'\r' | b'\t' => {
                    self.advance();
                }
                b'\n' => {
                    self.line += 1;
                    self.advance();
                }
                b'/' => {
                    if self.peek_next() == b'/' {
                        while self.peek() != b'\n' && !self.is_at_end() {
                            self.advance();
                        }
                    } else {
                        return;
                    }
                }
                _ => return,
            }
        }
    }

    fn identifier(&mut self) -> Token<'src> {
        while is_alpha(self.peek()) || self.peek().is_ascii_digit() {
            self.advance();
        }
        self.make_token(self.identifier_kind())
    }

    /// Post-classifies an identifier lexeme against the active keyword
    /// tables. Dialect spellings are checked first so a dialect may shadow
    /// nothing from the standard table but still extend it.
    fn identifier_kind(&self) -> TokenKind {
        let lexeme = &self.source[self.start..self.current];

        let extras = match self.dialect {
            Dialect::Standard => &[][..],
            Dialect::Natural => NATURAL_KEYWORDS,
            Dialect::Casual => CASUAL_KEYWORDS,
        };
        for &(word, kind) in extras {
            if word == lexeme {
                return kind;
            }
        }
        for &(word, kind) in STANDARD_KEYWORDS {
            if word == lexeme {
                return kind;
            }
        }
        TokenKind::Identifier
    }

    fn number(&mut self) -> Token<'src> {
        while self.peek().is_ascii_digit() {
            self.advance();
        }

        // A fractional part needs a digit after the dot, otherwise the dot
        // is left for the next token.
        if self.peek() == b'.' && self.peek_next().is_ascii_digit() {
            self.advance();
            while self.peek().is_ascii_digit() {
                self.advance();
            }
        }

        self.make_token(TokenKind::Number)
    }

    fn string(&mut self) -> Token<'src> {
        while self.peek() != b'"' && !self.is_at_end() {
            if self.peek() == b'\n' {
                self.line += 1;
            }
            self.advance();
        }

        if self.is_at_end() {
            return self.error_token("Unterminated string.");
        }

        self.advance(); // Closing quote.
        self.make_token(TokenKind::String)
    }
}

fn is_alpha(c: u8) -> bool {
    c.is_ascii_alphabetic() || c == b'_'
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan_all(source: &str, dialect: Dialect) -> Vec<(TokenKind, String)> {
        let mut scanner = Scanner::new(source, dialect);
        let mut tokens = Vec::new();
        loop {
            let token = scanner.scan_token();
            let done = token.kind == TokenKind::Eof;
            tokens.push((token.kind, token.lexeme.to_string()));
            if done {
                break;
            }
        }
        tokens
    }

    #[test]
    fn punctuation_and_operators() {
        let kinds: Vec<TokenKind> =
            scan_all("(){};,.-+/*! != = == < <= > >=", Dialect::Standard)
                .into_iter()
                .map(|(k, _)| k)
                .collect();
        assert_eq!(
            kinds,
            vec![
                TokenKind::LeftParen,
                TokenKind::RightParen,
                TokenKind::LeftBrace,
                TokenKind::RightBrace,
                TokenKind::Semicolon,
                TokenKind::Comma,
                TokenKind::Dot,
                TokenKind::Minus,
                TokenKind::Plus,
                TokenKind::Slash,
                TokenKind::Star,
                TokenKind::Bang,
                TokenKind::BangEqual,
                TokenKind::Equal,
                TokenKind::EqualEqual,
                TokenKind::Less,
                TokenKind::LessEqual,
                TokenKind::Greater,
                TokenKind::GreaterEqual,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn number_without_trailing_fraction() {
        let tokens = scan_all("123.foo", Dialect::Standard);
        assert_eq!(tokens[0], (TokenKind::Number, "123".to_string()));
        assert_eq!(tokens[1].0, TokenKind::Dot);
        assert_eq!(tokens[2].0, TokenKind::Identifier);
    }

    #[test]
    fn strings_may_span_lines() {
        let mut scanner = Scanner::new("\"a\nb\" x", Dialect::Standard);
        let s = scanner.scan_token();
        assert_eq!(s.kind, TokenKind::String);
        assert_eq!(s.lexeme, "\"a\nb\"");
        // The token after the string reports the updated line.
        let x = scanner.scan_token();
        assert_eq!(x.line, 2);
    }

    #[test]
    fn unterminated_string_is_an_error_token() {
        let tokens = scan_all("\"oops", Dialect::Standard);
        assert_eq!(tokens[0], (TokenKind::Error, "Unterminated string.".to_string()));
    }

    #[test]
    fn comments_run_to_end_of_line() {
        let tokens = scan_all("// nothing here\n42", Dialect::Standard);
        assert_eq!(tokens[0].0, TokenKind::Number);
    }

    #[test]
    fn keywords_are_dialect_sensitive() {
        assert_eq!(scan_all("say", Dialect::Standard)[0].0, TokenKind::Identifier);
        assert_eq!(scan_all("say", Dialect::Natural)[0].0, TokenKind::Print);
        assert_eq!(scan_all("issameas", Dialect::Casual)[0].0, TokenKind::EqualEqual);
        assert_eq!(scan_all("howbig", Dialect::Casual)[0].0, TokenKind::Sizeof);
        // Standard keywords survive in every dialect.
        assert_eq!(scan_all("while", Dialect::Casual)[0].0, TokenKind::While);
    }

    #[test]
    fn line_counting() {
        let mut scanner = Scanner::new("a\nb\n\nc", Dialect::Standard);
        assert_eq!(scanner.scan_token().line, 1);
        assert_eq!(scanner.scan_token().line, 2);
        assert_eq!(scanner.scan_token().line, 4);
    }
}
