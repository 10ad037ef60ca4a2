//! The lexer: source text to a stream of tokens.
//!
//! Newlines are statement separators, so they are real tokens, except
//! inside parentheses and brackets where they are insignificant and
//! suppressed at the source.

use strum_macros::{Display, EnumString};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, Display)]
pub enum TokenType {
    // Single-character tokens.
    LeftParen,
    RightParen,
    LeftBracket,
    RightBracket,
    Comma,
    Dot,
    Colon,
    Semicolon,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Caret,
    Hash,

    // One or more character tokens.
    Bang,
    BangEqual,
    Equal,
    EqualEqual,
    Greater,
    GreaterEqual,
    Less,
    LessEqual,
    PlusEqual,
    MinusEqual,
    StarEqual,
    SlashEqual,
    PercentEqual,
    Ellipsis,

    // Literals.
    Identifier,
    String,
    Number,

    // Keywords.
    And,
    As,
    Begin,
    Break,
    Class,
    Continue,
    Do,
    Elif,
    Else,
    End,
    Ensure,
    Except,
    False,
    For,
    Fun,
    If,
    Import,
    In,
    Is,
    Null,
    Or,
    Print,
    Raise,
    Return,
    Super,
    Then,
    This,
    True,
    Try,
    Var,
    While,

    Newline,
    Error,
    Eof,
}

static KEYWORDS: phf::Map<&'static str, TokenType> = phf::phf_map! {
    "and" => TokenType::And,
    "as" => TokenType::As,
    "begin" => TokenType::Begin,
    "break" => TokenType::Break,
    "class" => TokenType::Class,
    "continue" => TokenType::Continue,
    "do" => TokenType::Do,
    "elif" => TokenType::Elif,
    "else" => TokenType::Else,
    "end" => TokenType::End,
    "ensure" => TokenType::Ensure,
    "except" => TokenType::Except,
    "false" => TokenType::False,
    "for" => TokenType::For,
    "fun" => TokenType::Fun,
    "if" => TokenType::If,
    "import" => TokenType::Import,
    "in" => TokenType::In,
    "is" => TokenType::Is,
    "null" => TokenType::Null,
    "or" => TokenType::Or,
    "print" => TokenType::Print,
    "raise" => TokenType::Raise,
    "return" => TokenType::Return,
    "super" => TokenType::Super,
    "then" => TokenType::Then,
    "this" => TokenType::This,
    "true" => TokenType::True,
    "try" => TokenType::Try,
    "var" => TokenType::Var,
    "while" => TokenType::While,
};

#[derive(Debug, Clone, Copy)]
pub struct Token<'a> {
    pub token_type: TokenType,
    pub value: &'a str,
    pub line: u32,
}

impl<'a> Token<'a> {
    pub fn synthetic(token_type: TokenType) -> Token<'a> {
        Token {
            token_type,
            value: "",
            line: 0,
        }
    }
}

pub struct Scanner<'a> {
    source: &'a str,
    start: usize,
    current: usize,
    line: u32,
    // Newlines are insignificant while inside ( ) or [ ].
    bracket_depth: usize,
}

impl<'a> Scanner<'a> {
    pub fn new(source: &'a str) -> Scanner<'a> {
        Scanner {
            source,
            start: 0,
            current: 0,
            line: 1,
            bracket_depth: 0,
        }
    }

    pub fn scan_token(&mut self) -> Token<'a> {
        self.skip_whitespace();
        self.start = self.current;

        if self.is_at_end() {
            return self.make_token(TokenType::Eof);
        }

        let c = self.advance();
        match c {
            b'(' => {
                self.bracket_depth += 1;
                self.make_token(TokenType::LeftParen)
            }
            b')' => {
                self.bracket_depth = self.bracket_depth.saturating_sub(1);
                self.make_token(TokenType::RightParen)
            }
            b'[' => {
                self.bracket_depth += 1;
                self.make_token(TokenType::LeftBracket)
            }
            b']' => {
                self.bracket_depth = self.bracket_depth.saturating_sub(1);
                self.make_token(TokenType::RightBracket)
            }
            b',' => self.make_token(TokenType::Comma),
            b':' => self.make_token(TokenType::Colon),
            b';' => self.make_token(TokenType::Semicolon),
            b'^' => self.make_token(TokenType::Caret),
            b'#' => self.make_token(TokenType::Hash),
            b'.' => {
                if self.match_byte(b'.') {
                    if self.match_byte(b'.') {
                        self.make_token(TokenType::Ellipsis)
                    } else {
                        self.error_token("Unexpected '..'.")
                    }
                } else {
                    self.make_token(TokenType::Dot)
                }
            }
            b'+' => self.two_byte_token(b'=', TokenType::PlusEqual, TokenType::Plus),
            b'-' => self.two_byte_token(b'=', TokenType::MinusEqual, TokenType::Minus),
            b'*' => self.two_byte_token(b'=', TokenType::StarEqual, TokenType::Star),
            b'/' => self.two_byte_token(b'=', TokenType::SlashEqual, TokenType::Slash),
            b'%' => self.two_byte_token(b'=', TokenType::PercentEqual, TokenType::Percent),
            b'!' => self.two_byte_token(b'=', TokenType::BangEqual, TokenType::Bang),
            b'=' => self.two_byte_token(b'=', TokenType::EqualEqual, TokenType::Equal),
            b'<' => self.two_byte_token(b'=', TokenType::LessEqual, TokenType::Less),
            b'>' => self.two_byte_token(b'=', TokenType::GreaterEqual, TokenType::Greater),
            b'\n' => {
                self.line += 1;
                self.make_token(TokenType::Newline)
            }
            b'"' => self.string(),
            c if c.is_ascii_digit() => self.number(),
            c if c == b'_' || c.is_ascii_alphabetic() => self.identifier(),
            _ => self.error_token("Unexpected character."),
        }
    }

    fn skip_whitespace(&mut self) {
        loop {
            match self.peek() {
                Some(b' ') | Some(b'\t') | Some(b'\r') => {
                    self.advance();
                }
                Some(b'\n') if self.bracket_depth > 0 => {
                    self.line += 1;
                    self.advance();
                }
                Some(b'/') if self.peek_next() == Some(b'/') => {
                    while let Some(c) = self.peek() {
                        if c == b'\n' {
                            break;
                        }
                        self.advance();
                    }
                }
                _ => return,
            }
        }
    }

    fn string(&mut self) -> Token<'a> {
        while let Some(c) = self.peek() {
            match c {
                b'"' => break,
                b'\n' => return self.error_token("Unterminated string."),
                b'\\' => {
                    self.advance();
                    if self.peek().is_some() {
                        self.advance();
                    }
                }
                _ => {
                    self.advance();
                }
            }
        }
        if self.is_at_end() {
            return self.error_token("Unterminated string.");
        }
        self.advance(); // closing quote
        self.make_token(TokenType::String)
    }

    fn number(&mut self) -> Token<'a> {
        while self.peek().map_or(false, |c| c.is_ascii_digit()) {
            self.advance();
        }
        if self.peek() == Some(b'.') && self.peek_next().map_or(false, |c| c.is_ascii_digit()) {
            self.advance();
            while self.peek().map_or(false, |c| c.is_ascii_digit()) {
                self.advance();
            }
        }
        if matches!(self.peek(), Some(b'e') | Some(b'E')) {
            let mut lookahead = self.current + 1;
            if matches!(self.source.as_bytes().get(lookahead), Some(b'+') | Some(b'-')) {
                lookahead += 1;
            }
            if self
                .source
                .as_bytes()
                .get(lookahead)
                .map_or(false, |c| c.is_ascii_digit())
            {
                while self.current < lookahead {
                    self.advance();
                }
                while self.peek().map_or(false, |c| c.is_ascii_digit()) {
                    self.advance();
                }
            }
        }
        self.make_token(TokenType::Number)
    }

    fn identifier(&mut self) -> Token<'a> {
        while self
            .peek()
            .map_or(false, |c| c == b'_' || c.is_ascii_alphanumeric())
        {
            self.advance();
        }
        let value = &self.source[self.start..self.current];
        let token_type = KEYWORDS
            .get(value)
            .copied()
            .unwrap_or(TokenType::Identifier);
        self.make_token(token_type)
    }

    fn two_byte_token(&mut self, second: u8, matched: TokenType, single: TokenType) -> Token<'a> {
        if self.match_byte(second) {
            self.make_token(matched)
        } else {
            self.make_token(single)
        }
    }

    fn make_token(&self, token_type: TokenType) -> Token<'a> {
        Token {
            token_type,
            value: &self.source[self.start..self.current],
            line: if token_type == TokenType::Newline {
                self.line - 1
            } else {
                self.line
            },
        }
    }

    fn error_token(&self, message: &'static str) -> Token<'a> {
        Token {
            token_type: TokenType::Error,
            value: message,
            line: self.line,
        }
    }

    fn is_at_end(&self) -> bool {
        self.current >= self.source.len()
    }

    fn advance(&mut self) -> u8 {
        let byte = self.source.as_bytes()[self.current];
        self.current += 1;
        byte
    }

    fn match_byte(&mut self, expected: u8) -> bool {
        if self.peek() == Some(expected) {
            self.current += 1;
            true
        } else {
            false
        }
    }

    fn peek(&self) -> Option<u8> {
        self.source.as_bytes().get(self.current).copied()
    }

    fn peek_next(&self) -> Option<u8> {
        self.source.as_bytes().get(self.current + 1).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan_all(source: &str) -> Vec<TokenType> {
        let mut scanner = Scanner::new(source);
        let mut tokens = vec![];
        loop {
            let token = scanner.scan_token();
            let done = token.token_type == TokenType::Eof;
            tokens.push(token.token_type);
            if done {
                break;
            }
        }
        tokens
    }

    #[test]
    fn scans_operators_and_keywords() {
        assert_eq!(
            scan_all("var x = 1 + 2"),
            vec![
                TokenType::Var,
                TokenType::Identifier,
                TokenType::Equal,
                TokenType::Number,
                TokenType::Plus,
                TokenType::Number,
                TokenType::Eof
            ]
        );
    }

    #[test]
    fn compound_assignment_tokens() {
        assert_eq!(
            scan_all("x += 1"),
            vec![
                TokenType::Identifier,
                TokenType::PlusEqual,
                TokenType::Number,
                TokenType::Eof
            ]
        );
    }

    #[test]
    fn keywords_resolve_through_map() {
        assert_eq!(scan_all("fun end"), vec![TokenType::Fun, TokenType::End, TokenType::Eof]);
        assert_eq!(
            scan_all("try except ensure raise"),
            vec![
                TokenType::Try,
                TokenType::Except,
                TokenType::Ensure,
                TokenType::Raise,
                TokenType::Eof
            ]
        );
    }

    #[test]
    fn newlines_separate_statements_but_not_inside_brackets() {
        assert_eq!(
            scan_all("a\nb"),
            vec![
                TokenType::Identifier,
                TokenType::Newline,
                TokenType::Identifier,
                TokenType::Eof
            ]
        );
        assert_eq!(
            scan_all("f(\n1,\n2\n)"),
            vec![
                TokenType::Identifier,
                TokenType::LeftParen,
                TokenType::Number,
                TokenType::Comma,
                TokenType::Number,
                TokenType::RightParen,
                TokenType::Eof
            ]
        );
    }

    #[test]
    fn tracks_lines() {
        let mut scanner = Scanner::new("a\nb");
        assert_eq!(scanner.scan_token().line, 1);
        assert_eq!(scanner.scan_token().line, 1); // the newline itself
        assert_eq!(scanner.scan_token().line, 2);
    }

    #[test]
    fn string_with_escapes_scans_as_one_token() {
        let mut scanner = Scanner::new(r#""a\"b""#);
        let token = scanner.scan_token();
        assert_eq!(token.token_type, TokenType::String);
        assert_eq!(token.value, r#""a\"b""#);
    }

    #[test]
    fn unterminated_string_is_an_error() {
        let mut scanner = Scanner::new("\"abc");
        assert_eq!(scanner.scan_token().token_type, TokenType::Error);
    }

    #[test]
    fn numbers_with_fraction_and_exponent() {
        assert_eq!(scan_all("1 2.5 1e3 1.5e-2"), vec![
            TokenType::Number,
            TokenType::Number,
            TokenType::Number,
            TokenType::Number,
            TokenType::Eof
        ]);
    }
}
