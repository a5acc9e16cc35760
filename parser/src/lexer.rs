//! Lexer for Malang source text.
//!
//! Implements [`Iterator`] over [`Token`]s and tracks byte offset, line,
//! and column for every token it produces. Unrecognized input becomes a
//! [`TokenKind::Error`] token rather than stopping the stream, so the
//! parser decides how to report it.
//!
//! # Comment syntax
//!
//! | Syntax   | Kind          | Notes                        |
//! |----------|---------------|------------------------------|
//! | `// …`   | Line comment  | Runs to end of line          |
//! | `/* … */`| Block comment | Nestable (`/* /* */ */`)     |
//!
//! Comments are consumed as whitespace; they never reach the parser.

use crate::span::{Pos, Span};
use crate::token::{Token, TokenKind};

pub struct Lexer<'a> {
    bytes: &'a [u8],
    pos: Pos,
    finished: bool,
}

impl<'a> Lexer<'a> {
    pub fn new(source: &'a str) -> Self {
        Self {
            bytes: source.as_bytes(),
            pos: Pos::origin(),
            finished: false,
        }
    }

    // ── byte cursor ────────────────────────────────────────────────

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos.offset).copied()
    }

    fn peek_ahead(&self, n: usize) -> Option<u8> {
        self.bytes.get(self.pos.offset + n).copied()
    }

    fn advance(&mut self) -> Option<u8> {
        let byte = self.peek()?;
        self.pos.offset += 1;
        if byte == b'\n' {
            self.pos.line += 1;
            self.pos.column = 1;
        } else {
            self.pos.column += 1;
        }
        Some(byte)
    }

    fn advance_if(&mut self, expected: u8) -> bool {
        if self.peek() == Some(expected) {
            self.advance();
            true
        } else {
            false
        }
    }

    // ── whitespace and comments ────────────────────────────────────

    fn skip_trivia(&mut self) -> Result<(), Token> {
        loop {
            match self.peek() {
                Some(b' ') | Some(b'\t') | Some(b'\r') | Some(b'\n') => {
                    self.advance();
                }
                Some(b'/') if self.peek_ahead(1) == Some(b'/') => {
                    while let Some(byte) = self.peek() {
                        if byte == b'\n' {
                            break;
                        }
                        self.advance();
                    }
                }
                Some(b'/') if self.peek_ahead(1) == Some(b'*') => {
                    let start = self.pos;
                    self.advance();
                    self.advance();
                    let mut depth = 1usize;
                    loop {
                        match (self.peek(), self.peek_ahead(1)) {
                            (Some(b'/'), Some(b'*')) => {
                                self.advance();
                                self.advance();
                                depth += 1;
                            }
                            (Some(b'*'), Some(b'/')) => {
                                self.advance();
                                self.advance();
                                depth -= 1;
                                if depth == 0 {
                                    break;
                                }
                            }
                            (Some(_), _) => {
                                self.advance();
                            }
                            (None, _) => {
                                return Err(Token::new(
                                    TokenKind::Error(
                                        "unterminated block comment".to_string(),
                                    ),
                                    Span::new(start, self.pos),
                                ));
                            }
                        }
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    // ── token producers ────────────────────────────────────────────

    fn lex_number(&mut self) -> Token {
        let start = self.pos;
        while matches!(self.peek(), Some(b'0'..=b'9')) {
            self.advance();
        }

        // A real requires a digit after the dot, so `21.double()` lexes
        // as integer / dot / identifier.
        let mut is_real = false;
        if self.peek() == Some(b'.')
            && matches!(self.peek_ahead(1), Some(b'0'..=b'9'))
        {
            is_real = true;
            self.advance();
            while matches!(self.peek(), Some(b'0'..=b'9')) {
                self.advance();
            }
        }
        if matches!(self.peek(), Some(b'e') | Some(b'E')) {
            let mut lookahead = 1;
            if matches!(self.peek_ahead(1), Some(b'+') | Some(b'-')) {
                lookahead = 2;
            }
            if matches!(self.peek_ahead(lookahead), Some(b'0'..=b'9')) {
                is_real = true;
                for _ in 0..=lookahead {
                    self.advance();
                }
                while matches!(self.peek(), Some(b'0'..=b'9')) {
                    self.advance();
                }
            }
        }

        let text = &self.bytes[start.offset..self.pos.offset];
        // SAFETY-free: the scanned range is ASCII digits, `.`, `e`, `+`, `-`.
        let text = std::str::from_utf8(text).unwrap_or("");
        let span = Span::new(start, self.pos);
        if is_real {
            match text.parse::<f64>() {
                Ok(value) => Token::new(TokenKind::Real(value), span),
                Err(_) => Token::new(
                    TokenKind::Error(format!("malformed real literal `{text}`")),
                    span,
                ),
            }
        } else {
            match text.parse::<i64>() {
                Ok(value) => Token::new(TokenKind::Integer(value), span),
                Err(_) => Token::new(
                    TokenKind::Error(format!(
                        "integer literal `{text}` out of range"
                    )),
                    span,
                ),
            }
        }
    }

    fn lex_identifier(&mut self) -> Token {
        let start = self.pos;
        while matches!(
            self.peek(),
            Some(b'a'..=b'z') | Some(b'A'..=b'Z') | Some(b'0'..=b'9') | Some(b'_')
        ) {
            self.advance();
        }
        let text = std::str::from_utf8(&self.bytes[start.offset..self.pos.offset])
            .unwrap_or("");
        let span = Span::new(start, self.pos);
        let kind = match text {
            "fn" => TokenKind::KwFn,
            "class" => TokenKind::KwClass,
            "extend" => TokenKind::KwExtend,
            "if" => TokenKind::KwIf,
            "else" => TokenKind::KwElse,
            "while" => TokenKind::KwWhile,
            "return" => TokenKind::KwReturn,
            "true" => TokenKind::KwTrue,
            "false" => TokenKind::KwFalse,
            _ => TokenKind::Identifier(text.to_string()),
        };
        Token::new(kind, span)
    }

    fn lex_escape(&mut self) -> Result<char, String> {
        match self.advance() {
            Some(b'n') => Ok('\n'),
            Some(b't') => Ok('\t'),
            Some(b'r') => Ok('\r'),
            Some(b'0') => Ok('\0'),
            Some(b'\\') => Ok('\\'),
            Some(b'\'') => Ok('\''),
            Some(b'"') => Ok('"'),
            Some(other) => Err(format!("unknown escape `\\{}`", other as char)),
            None => Err("unterminated escape".to_string()),
        }
    }

    fn lex_string(&mut self) -> Token {
        let start = self.pos;
        self.advance(); // opening quote
        let mut text = String::new();
        loop {
            match self.peek() {
                None | Some(b'\n') => {
                    return Token::new(
                        TokenKind::Error("unterminated string".to_string()),
                        Span::new(start, self.pos),
                    );
                }
                Some(b'"') => {
                    self.advance();
                    return Token::new(
                        TokenKind::Str(text),
                        Span::new(start, self.pos),
                    );
                }
                Some(b'\\') => {
                    self.advance();
                    match self.lex_escape() {
                        Ok(c) => text.push(c),
                        Err(message) => {
                            return Token::new(
                                TokenKind::Error(message),
                                Span::new(start, self.pos),
                            );
                        }
                    }
                }
                Some(_) => {
                    // Multi-byte UTF-8 sequences pass through byte by byte.
                    let byte_start = self.pos.offset;
                    self.advance();
                    while self
                        .peek()
                        .is_some_and(|b| b & 0b1100_0000 == 0b1000_0000)
                    {
                        self.advance();
                    }
                    if let Ok(chunk) = std::str::from_utf8(
                        &self.bytes[byte_start..self.pos.offset],
                    ) {
                        text.push_str(chunk);
                    }
                }
            }
        }
    }

    fn lex_char(&mut self) -> Token {
        let start = self.pos;
        self.advance(); // opening quote
        let c = match self.peek() {
            None => {
                return Token::new(
                    TokenKind::Error("unterminated character".to_string()),
                    Span::new(start, self.pos),
                );
            }
            Some(b'\\') => {
                self.advance();
                match self.lex_escape() {
                    Ok(c) => c,
                    Err(message) => {
                        return Token::new(
                            TokenKind::Error(message),
                            Span::new(start, self.pos),
                        );
                    }
                }
            }
            Some(_) => {
                let byte_start = self.pos.offset;
                self.advance();
                while self
                    .peek()
                    .is_some_and(|b| b & 0b1100_0000 == 0b1000_0000)
                {
                    self.advance();
                }
                match std::str::from_utf8(&self.bytes[byte_start..self.pos.offset])
                {
                    Ok(chunk) => match chunk.chars().next() {
                        Some(c) => c,
                        None => {
                            return Token::new(
                                TokenKind::Error("empty character".to_string()),
                                Span::new(start, self.pos),
                            );
                        }
                    },
                    Err(_) => {
                        return Token::new(
                            TokenKind::Error("invalid UTF-8".to_string()),
                            Span::new(start, self.pos),
                        );
                    }
                }
            }
        };
        if !self.advance_if(b'\'') {
            return Token::new(
                TokenKind::Error("unterminated character".to_string()),
                Span::new(start, self.pos),
            );
        }
        Token::new(TokenKind::CharLit(c), Span::new(start, self.pos))
    }

    fn lex_token(&mut self) -> Token {
        if let Err(error) = self.skip_trivia() {
            return error;
        }

        let start = self.pos;
        let Some(byte) = self.peek() else {
            return Token::new(TokenKind::Eof, Span::point(start));
        };

        match byte {
            b'0'..=b'9' => self.lex_number(),
            b'a'..=b'z' | b'A'..=b'Z' | b'_' => self.lex_identifier(),
            b'"' => self.lex_string(),
            b'\'' => self.lex_char(),
            _ => {
                self.advance();
                let kind = match byte {
                    b'@' => TokenKind::At,
                    b'+' => TokenKind::Plus,
                    b'-' => {
                        if self.advance_if(b'>') {
                            TokenKind::Arrow
                        } else {
                            TokenKind::Minus
                        }
                    }
                    b'*' => TokenKind::Star,
                    b'/' => TokenKind::Slash,
                    b'%' => TokenKind::Percent,
                    b'<' => {
                        if self.advance_if(b'<') {
                            TokenKind::Shl
                        } else if self.advance_if(b'=') {
                            TokenKind::Le
                        } else {
                            TokenKind::Lt
                        }
                    }
                    b'>' => {
                        if self.advance_if(b'>') {
                            TokenKind::Shr
                        } else if self.advance_if(b'=') {
                            TokenKind::Ge
                        } else {
                            TokenKind::Gt
                        }
                    }
                    b'&' => {
                        if self.advance_if(b'&') {
                            TokenKind::AndAnd
                        } else {
                            TokenKind::Amp
                        }
                    }
                    b'|' => {
                        if self.advance_if(b'|') {
                            TokenKind::OrOr
                        } else {
                            TokenKind::Pipe
                        }
                    }
                    b'^' => TokenKind::Caret,
                    b'~' => TokenKind::Tilde,
                    b'!' => {
                        if self.advance_if(b'=') {
                            TokenKind::BangEq
                        } else {
                            TokenKind::Bang
                        }
                    }
                    b'=' => {
                        if self.advance_if(b'=') {
                            TokenKind::EqEq
                        } else {
                            TokenKind::Equals
                        }
                    }
                    b':' => TokenKind::Colon,
                    b'(' => TokenKind::LParen,
                    b')' => TokenKind::RParen,
                    b'[' => TokenKind::LBracket,
                    b']' => TokenKind::RBracket,
                    b'{' => TokenKind::LBrace,
                    b'}' => TokenKind::RBrace,
                    b',' => TokenKind::Comma,
                    b'.' => TokenKind::Dot,
                    b';' => TokenKind::Semicolon,
                    other => TokenKind::Error(format!(
                        "unexpected character `{}`",
                        other as char
                    )),
                };
                Token::new(kind, Span::new(start, self.pos))
            }
        }
    }
}

impl Iterator for Lexer<'_> {
    type Item = Token;

    fn next(&mut self) -> Option<Token> {
        if self.finished {
            return None;
        }
        let token = self.lex_token();
        if token.is_eof() {
            self.finished = true;
        }
        Some(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        Lexer::new(source).map(|t| t.kind).collect()
    }

    #[test]
    fn declaration_tokens() {
        assert_eq!(kinds("a := 10"), vec![
            TokenKind::Identifier("a".to_string()),
            TokenKind::Colon,
            TokenKind::Equals,
            TokenKind::Integer(10),
            TokenKind::Eof,
        ]);
    }

    #[test]
    fn fn_signature_tokens() {
        assert_eq!(kinds("fn fib(n: int) -> int"), vec![
            TokenKind::KwFn,
            TokenKind::Identifier("fib".to_string()),
            TokenKind::LParen,
            TokenKind::Identifier("n".to_string()),
            TokenKind::Colon,
            TokenKind::Identifier("int".to_string()),
            TokenKind::RParen,
            TokenKind::Arrow,
            TokenKind::Identifier("int".to_string()),
            TokenKind::Eof,
        ]);
    }

    #[test]
    fn method_call_on_integer_literal() {
        // The dot must not start a real literal here.
        assert_eq!(kinds("21.double()"), vec![
            TokenKind::Integer(21),
            TokenKind::Dot,
            TokenKind::Identifier("double".to_string()),
            TokenKind::LParen,
            TokenKind::RParen,
            TokenKind::Eof,
        ]);
    }

    #[test]
    fn real_literals() {
        assert_eq!(kinds("3.14 1e3 2.5e-1"), vec![
            TokenKind::Real(3.14),
            TokenKind::Real(1e3),
            TokenKind::Real(2.5e-1),
            TokenKind::Eof,
        ]);
    }

    #[test]
    fn operators_longest_match() {
        assert_eq!(kinds("<< <= < == = != ! && & -> -"), vec![
            TokenKind::Shl,
            TokenKind::Le,
            TokenKind::Lt,
            TokenKind::EqEq,
            TokenKind::Equals,
            TokenKind::BangEq,
            TokenKind::Bang,
            TokenKind::AndAnd,
            TokenKind::Amp,
            TokenKind::Arrow,
            TokenKind::Minus,
            TokenKind::Eof,
        ]);
    }

    #[test]
    fn string_escapes() {
        assert_eq!(kinds(r#""he\"llo\n""#), vec![
            TokenKind::Str("he\"llo\n".to_string()),
            TokenKind::Eof,
        ]);
    }

    #[test]
    fn char_literals() {
        assert_eq!(kinds(r"'a' '\n' '\''"), vec![
            TokenKind::CharLit('a'),
            TokenKind::CharLit('\n'),
            TokenKind::CharLit('\''),
            TokenKind::Eof,
        ]);
    }

    #[test]
    fn comments_are_trivia() {
        let source = "1 // line\n/* block /* nested */ */ 2";
        assert_eq!(kinds(source), vec![
            TokenKind::Integer(1),
            TokenKind::Integer(2),
            TokenKind::Eof,
        ]);
    }

    #[test]
    fn spans_track_lines() {
        let tokens: Vec<Token> = Lexer::new("a\n  b").collect();
        assert_eq!(tokens[0].span.start.line, 1);
        assert_eq!(tokens[1].span.start.line, 2);
        assert_eq!(tokens[1].span.start.column, 3);
    }

    #[test]
    fn unterminated_string_is_an_error_token() {
        let last_real = kinds("\"oops").remove(0);
        assert!(matches!(last_real, TokenKind::Error(_)));
    }
}
