//! The lexer: character stream to token stream.
//!
//! Whitespace is skipped but newlines are significant and produce their own
//! token, because the grammar uses them as statement separators. String
//! interpolation is spliced here: inside a string literal, `%(` ends the
//! literal with an [`TokenKind::Interpolation`] token carrying the prefix
//! read so far, ordinary tokenization resumes for the embedded expression,
//! and the `)` that balances it re-enters string lexing. The string
//!
//! ```text
//! "a + b = %(a) + %(b)"
//! ```
//!
//! therefore lexes as `Interpolation("a + b = ")`, `Ident(a)`,
//! `Interpolation(" + ")`, `Ident(b)`, `Str("")`.
//!
//! Lexical errors are recorded as diagnostics and tokenization continues, so
//! the parser can report several problems in one pass.

/// Token types. Keywords are their own kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Not,
    Assign,
    Gt,
    Lt,
    Gte,
    Lte,
    Eq,
    Neq,
    Comma,
    Semicolon,
    /// `|`, separating constructors and match equations.
    Guard,
    LeftParen,
    RightParen,
    LeftBrace,
    RightBrace,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    /// `::`, module member access.
    Member,

    Ident,
    Number,
    /// A plain string literal, or the tail of an interpolated string.
    Str,
    /// A string literal prefix ending in `%(`.
    Interpolation,
    Newline,

    Data,
    Debug,
    Else,
    False,
    Fn,
    If,
    Import,
    Let,
    Match,
    True,
    While,

    /// Produced when the input could not be tokenized; the diagnostic has
    /// already been recorded.
    Error,
    Eof,
}

/// Literal payload carried by a token.
#[derive(Debug, Clone, PartialEq)]
pub enum TokenValue {
    None,
    Number(f64),
    Str(String),
}

/// One token: kind, raw lexeme, 1-based source line, and literal payload.
#[derive(Debug, Clone)]
pub struct Token {
    pub kind: TokenKind,
    pub lexeme: String,
    pub line: u32,
    pub value: TokenValue,
}

impl Token {
    pub(crate) fn synthetic(kind: TokenKind) -> Self {
        Self {
            kind,
            lexeme: String::new(),
            line: 0,
            value: TokenValue::None,
        }
    }

    /// The string payload. Panics if this token has none.
    pub(crate) fn string_value(&self) -> &str {
        match &self.value {
            TokenValue::Str(s) => s,
            _ => panic!("token has no string payload: {self:?}"),
        }
    }

    /// The number payload. Panics if this token has none.
    pub(crate) fn number_value(&self) -> f64 {
        match self.value {
            TokenValue::Number(n) => n,
            _ => panic!("token has no number payload: {self:?}"),
        }
    }
}

/// Interpolated expressions may nest this many levels deep.
const MAX_INTERPOLATION_NESTING: usize = 8;

/// A single-pass lexer over one module's source.
pub struct Lexer<'src> {
    source: &'src [u8],
    token_start: usize,
    pos: usize,
    line: u32,
    /// Unbalanced-paren counts of the interpolations in progress, innermost
    /// last. A `)` that brings the innermost count to zero resumes string
    /// lexing instead of producing a token.
    interpolations: Vec<u32>,
    diagnostics: Vec<(u32, String)>,
}

impl<'src> Lexer<'src> {
    #[must_use]
    pub fn new(source: &'src str) -> Self {
        // Skip a UTF-8 BOM if present.
        let source = source.strip_prefix('\u{feff}').unwrap_or(source);
        Self {
            source: source.as_bytes(),
            token_start: 0,
            pos: 0,
            line: 1,
            interpolations: Vec::new(),
            diagnostics: Vec::new(),
        }
    }

    /// Lexical errors recorded since the last call, as `(line, message)`.
    pub fn take_diagnostics(&mut self) -> Vec<(u32, String)> {
        std::mem::take(&mut self.diagnostics)
    }

    /// Produces the next token. Returns `Eof` forever once exhausted.
    pub fn next_token(&mut self) -> Token {
        while let Some(c) = self.advance() {
            self.token_start = self.pos - 1;
            match c {
                b' ' | b'\r' | b'\t' => {}
                b'\n' => {
                    // Report the newline on the line it ends.
                    return self.make_token_on_line(TokenKind::Newline, self.line - 1);
                }
                b',' => return self.make_token(TokenKind::Comma),
                b';' => return self.make_token(TokenKind::Semicolon),
                b'|' => return self.make_token(TokenKind::Guard),
                b'(' => {
                    if let Some(depth) = self.interpolations.last_mut() {
                        *depth += 1;
                    }
                    return self.make_token(TokenKind::LeftParen);
                }
                b')' => {
                    if let Some(depth) = self.interpolations.last_mut() {
                        *depth -= 1;
                        if *depth == 0 {
                            // End of an interpolated expression: the rest of
                            // the enclosing string follows.
                            self.interpolations.pop();
                            return self.read_string();
                        }
                    }
                    return self.make_token(TokenKind::RightParen);
                }
                b'{' => return self.make_token(TokenKind::LeftBrace),
                b'}' => return self.make_token(TokenKind::RightBrace),
                b'+' => return self.make_token(TokenKind::Plus),
                b'-' => return self.make_token(TokenKind::Minus),
                b'*' => return self.make_token(TokenKind::Star),
                b'%' => return self.make_token(TokenKind::Percent),
                b'!' => {
                    let kind = if self.match_char(b'=') { TokenKind::Neq } else { TokenKind::Not };
                    return self.make_token(kind);
                }
                b'>' => {
                    let kind = if self.match_char(b'=') { TokenKind::Gte } else { TokenKind::Gt };
                    return self.make_token(kind);
                }
                b'<' => {
                    let kind = if self.match_char(b'=') { TokenKind::Lte } else { TokenKind::Lt };
                    return self.make_token(kind);
                }
                b'=' => {
                    let kind = if self.match_char(b'=') { TokenKind::Eq } else { TokenKind::Assign };
                    return self.make_token(kind);
                }
                b'/' => {
                    if self.match_char(b'/') {
                        self.skip_line_comment();
                    } else {
                        return self.make_token(TokenKind::Slash);
                    }
                }
                b'"' => return self.read_string(),
                b':' => {
                    if self.match_char(b':') {
                        return self.make_token(TokenKind::Member);
                    }
                    return self.invalid_character(b':');
                }
                c if is_name_start(c) => return self.read_name(),
                c if c.is_ascii_digit() => return self.read_number(),
                c => return self.invalid_character(c),
            }
        }

        self.token_start = self.pos;
        self.make_token(TokenKind::Eof)
    }

    fn invalid_character(&mut self, c: u8) -> Token {
        self.error(format!("Invalid character '{}'.", c as char));
        Token {
            kind: TokenKind::Error,
            lexeme: String::new(),
            line: self.line,
            value: TokenValue::None,
        }
    }

    /// Finishes lexing a string, either from its opening quote or when
    /// resuming after an interpolated expression.
    fn read_string(&mut self) -> Token {
        let mut buffer: Vec<u8> = Vec::new();
        let mut kind = TokenKind::Str;

        loop {
            let Some(c) = self.advance() else {
                self.error("Unterminated string.".to_string());
                break;
            };
            match c {
                b'"' => break,
                b'%' => {
                    if self.match_char(b'(') {
                        if self.interpolations.len() < MAX_INTERPOLATION_NESTING {
                            self.interpolations.push(1);
                            kind = TokenKind::Interpolation;
                            break;
                        }
                        self.error(format!(
                            "Interpolation may only nest {MAX_INTERPOLATION_NESTING} levels deep."
                        ));
                    } else {
                        self.error("Expected '(' after '%'.".to_string());
                    }
                }
                b'\\' => match self.advance() {
                    Some(b'"') => buffer.push(b'"'),
                    Some(b'%') => buffer.push(b'%'),
                    Some(b'\\') => buffer.push(b'\\'),
                    Some(b'n') => buffer.push(b'\n'),
                    Some(b'r') => buffer.push(b'\r'),
                    Some(c) => self.error(format!("Invalid escape character '{}'.", c as char)),
                    None => {
                        self.error("Unterminated string.".to_string());
                        break;
                    }
                },
                c => buffer.push(c),
            }
        }

        let contents = String::from_utf8_lossy(&buffer).into_owned();
        let mut token = self.make_token(kind);
        token.value = TokenValue::Str(contents);
        token
    }

    fn read_name(&mut self) -> Token {
        while self.peek().is_some_and(|c| is_name_start(c) || c.is_ascii_digit()) {
            self.pos += 1;
        }
        let kind = match self.lexeme() {
            "data" => TokenKind::Data,
            "debug" => TokenKind::Debug,
            "else" => TokenKind::Else,
            "false" => TokenKind::False,
            "fn" => TokenKind::Fn,
            "if" => TokenKind::If,
            "import" => TokenKind::Import,
            "let" => TokenKind::Let,
            "match" => TokenKind::Match,
            "true" => TokenKind::True,
            "while" => TokenKind::While,
            _ => TokenKind::Ident,
        };
        self.make_token(kind)
    }

    fn read_number(&mut self) -> Token {
        while self.peek().is_some_and(|c| c.is_ascii_digit()) {
            self.pos += 1;
        }
        // A decimal point only counts with digits after it.
        if self.peek() == Some(b'.') && self.peek_next().is_some_and(|c| c.is_ascii_digit()) {
            self.pos += 1;
            while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                self.pos += 1;
            }
        }
        let number = self
            .lexeme()
            .parse::<f64>()
            .expect("number lexeme parses as f64");
        let mut token = self.make_token(TokenKind::Number);
        token.value = TokenValue::Number(number);
        token
    }

    fn skip_line_comment(&mut self) {
        while self.peek().is_some_and(|c| c != b'\n') {
            self.pos += 1;
        }
    }

    fn make_token(&self, kind: TokenKind) -> Token {
        self.make_token_on_line(kind, self.line)
    }

    fn make_token_on_line(&self, kind: TokenKind, line: u32) -> Token {
        let lexeme =
            String::from_utf8_lossy(&self.source[self.token_start..self.pos]).into_owned();
        Token {
            kind,
            lexeme,
            line,
            value: TokenValue::None,
        }
    }

    fn lexeme(&self) -> &str {
        std::str::from_utf8(&self.source[self.token_start..self.pos])
            .expect("lexeme spans whole UTF-8 characters")
    }

    fn error(&mut self, message: String) {
        self.diagnostics.push((self.line, message));
    }

    fn advance(&mut self) -> Option<u8> {
        let c = self.source.get(self.pos).copied()?;
        self.pos += 1;
        if c == b'\n' {
            self.line += 1;
        }
        Some(c)
    }

    fn match_char(&mut self, expected: u8) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn peek(&self) -> Option<u8> {
        self.source.get(self.pos).copied()
    }

    fn peek_next(&self) -> Option<u8> {
        self.source.get(self.pos + 1).copied()
    }
}

fn is_name_start(c: u8) -> bool {
    c.is_ascii_alphabetic() || c == b'_'
}
