//! The lexer: source text to a token stream ending in `Eof`.
//!
//! Scanning never fails fatally. Malformed input (unterminated string,
//! unknown escape, bad numeric literal, stray character) produces an
//! `Error` token carrying the diagnostic text, and scanning continues
//! from the next plausible boundary. Whitespace and comments are
//! discarded; block comments do not nest.
//!
//! String interpolation `"a${x}b"` is flattened into the stream as
//! `StrPart("a") InterpStart <tokens of x> InterpEnd Str("b")`, so the
//! parser reconstructs the piece/expression list without re-lexing.

use std::collections::VecDeque;

use crate::pos::{FileId, Pos};
use crate::token::{Token, TokenKind};

/// Lexes an entire source buffer. The result always ends with `Eof`.
pub fn tokenize(src: &str, file: FileId) -> Vec<Token> {
    let mut lexer = Lexer::new(src, file);
    let mut tokens = Vec::new();
    loop {
        let token = lexer.next_token();
        let done = matches!(token.kind, TokenKind::Eof);
        tokens.push(token);
        if done {
            return tokens;
        }
    }
}

pub struct Lexer<'a> {
    src: &'a str,
    pos: usize,
    line: u32,
    col: u32,
    file: FileId,
    /// Tokens produced ahead of time by interpolated-string scanning.
    pending: VecDeque<Token>,
}

impl<'a> Lexer<'a> {
    pub fn new(src: &'a str, file: FileId) -> Self {
        Self {
            src,
            pos: 0,
            line: 1,
            col: 1,
            file,
            pending: VecDeque::new(),
        }
    }

    fn with_start(src: &'a str, file: FileId, line: u32, col: u32) -> Self {
        Self {
            src,
            pos: 0,
            line,
            col,
            file,
            pending: VecDeque::new(),
        }
    }

    pub fn next_token(&mut self) -> Token {
        if let Some(token) = self.pending.pop_front() {
            return token;
        }

        self.skip_ws_and_comments();

        // Comment scanning can queue an error token.
        if let Some(token) = self.pending.pop_front() {
            return token;
        }

        let pos = self.here();
        let Some(ch) = self.peek_char() else {
            return self.token(TokenKind::Eof, pos);
        };

        if is_ident_start(ch) {
            return self.lex_ident_or_keyword(pos);
        }
        if ch.is_ascii_digit() {
            return self.lex_number(pos);
        }
        if ch == '"' {
            return self.lex_string(pos);
        }

        self.lex_operator(pos, ch)
    }

    fn lex_ident_or_keyword(&mut self, pos: Pos) -> Token {
        let start = self.pos;
        self.bump_char();
        while let Some(ch) = self.peek_char() {
            if is_ident_continue(ch) {
                self.bump_char();
            } else {
                break;
            }
        }
        let text = &self.src[start..self.pos];
        let kind = TokenKind::keyword_from_str(text)
            .unwrap_or_else(|| TokenKind::Ident(text.to_string()));
        self.token(kind, pos)
    }

    fn lex_number(&mut self, pos: Pos) -> Token {
        let start = self.pos;

        let mut base = 10u32;
        let mut prefix_len = 0usize;
        if self.peek_char() == Some('0') {
            match self.peek_nth_char(1) {
                Some('x') | Some('X') => {
                    base = 16;
                    self.bump_char();
                    self.bump_char();
                    prefix_len = 2;
                }
                Some('b') | Some('B') => {
                    base = 2;
                    self.bump_char();
                    self.bump_char();
                    prefix_len = 2;
                }
                _ => {}
            }
        }

        let mut seen_digit = false;
        while let Some(ch) = self.peek_char() {
            if ch == '_' {
                self.bump_char();
                continue;
            }
            if ch.to_digit(base).is_some() {
                seen_digit = true;
                self.bump_char();
                continue;
            }
            break;
        }

        if !seen_digit {
            return self.token(
                TokenKind::Error("expected digits after numeric base prefix".to_string()),
                pos,
            );
        }

        // Float tail only for base-10 literals. A `.` is part of the
        // number only when a digit follows, so `0..10` stays a range.
        if base == 10 {
            let is_float = match (self.peek_char(), self.peek_nth_char(1)) {
                (Some('.'), Some(next)) if next.is_ascii_digit() => true,
                (Some('e') | Some('E'), _) => true,
                _ => false,
            };
            if is_float {
                if self.peek_char() == Some('.') {
                    self.bump_char();
                    while let Some(ch) = self.peek_char() {
                        if ch.is_ascii_digit() || ch == '_' {
                            self.bump_char();
                        } else {
                            break;
                        }
                    }
                }
                if matches!(self.peek_char(), Some('e') | Some('E')) {
                    self.bump_char();
                    if matches!(self.peek_char(), Some('+') | Some('-')) {
                        self.bump_char();
                    }
                    let mut has_exp_digit = false;
                    while let Some(ch) = self.peek_char() {
                        if ch.is_ascii_digit() || ch == '_' {
                            has_exp_digit |= ch.is_ascii_digit();
                            self.bump_char();
                        } else {
                            break;
                        }
                    }
                    if !has_exp_digit {
                        return self
                            .token(TokenKind::Error("expected exponent digits".to_string()), pos);
                    }
                }

                let raw = &self.src[start..self.pos];
                let cooked: String = raw.chars().filter(|c| *c != '_').collect();
                return match cooked.parse::<f64>() {
                    Ok(value) => self.token(TokenKind::Float(value), pos),
                    Err(_) => {
                        self.token(TokenKind::Error("invalid float literal".to_string()), pos)
                    }
                };
            }
        }

        let raw_digits = &self.src[start + prefix_len..self.pos];
        let digits: String = raw_digits.chars().filter(|c| *c != '_').collect();
        match i64::from_str_radix(&digits, base) {
            Ok(value) => self.token(TokenKind::Int(value), pos),
            Err(_) => self.token(TokenKind::Error("invalid integer literal".to_string()), pos),
        }
    }

    fn lex_string(&mut self, pos: Pos) -> Token {
        // Consume the opening quote.
        self.bump_char();

        let mut piece = String::new();
        // Each piece carries its own start position so the stream
        // stays position-monotonic through interpolations.
        let mut piece_pos = pos;
        let mut out: Vec<Token> = Vec::new();

        loop {
            let Some(ch) = self.peek_char() else {
                return self.token(
                    TokenKind::Error("unterminated string literal".to_string()),
                    pos,
                );
            };

            if ch == '"' {
                self.bump_char();
                break;
            }

            if ch == '\\' {
                let esc_pos = self.here();
                self.bump_char();
                match self.scan_escape() {
                    Ok(decoded) => piece.push(decoded),
                    Err(message) => {
                        // Skip to the closing quote so scanning resumes
                        // at a plausible boundary.
                        self.skip_to_string_end();
                        return self.token(TokenKind::Error(message), esc_pos);
                    }
                }
                continue;
            }

            if ch == '$' && self.peek_nth_char(1) == Some('{') {
                let interp_pos = self.here();
                out.push(Token {
                    kind: TokenKind::StrPart(std::mem::take(&mut piece)),
                    pos: piece_pos,
                });
                self.bump_char(); // $
                self.bump_char(); // {
                out.push(Token {
                    kind: TokenKind::InterpStart,
                    pos: interp_pos,
                });

                let inner_pos = self.here();
                let inner_start = self.pos;
                if let Err(message) = self.skip_interpolation_expr() {
                    return self.token(TokenKind::Error(message), interp_pos);
                }
                let inner_src = &self.src[inner_start..self.pos];

                // Lex the embedded expression inline; nested strings
                // (and nested interpolations) recurse naturally.
                let mut inner =
                    Lexer::with_start(inner_src, self.file, inner_pos.line, inner_pos.col);
                loop {
                    let token = inner.next_token();
                    if matches!(token.kind, TokenKind::Eof) {
                        break;
                    }
                    out.push(token);
                }

                let end_pos = self.here();
                self.bump_char(); // consume '}'
                out.push(Token {
                    kind: TokenKind::InterpEnd,
                    pos: end_pos,
                });
                piece_pos = self.here();
                continue;
            }

            piece.push(ch);
            self.bump_char();
        }

        // The final piece is a plain string token, which also covers
        // strings with no interpolation at all.
        out.push(Token {
            kind: TokenKind::Str(piece),
            pos: piece_pos,
        });

        let first = out.remove(0);
        self.pending.extend(out);
        first
    }

    /// Decodes one escape after the backslash: `\n \r \t \\ \" \0 \xNN`.
    fn scan_escape(&mut self) -> Result<char, String> {
        let Some(esc) = self.peek_char() else {
            return Err("unterminated escape".to_string());
        };
        self.bump_char();
        Ok(match esc {
            'n' => '\n',
            'r' => '\r',
            't' => '\t',
            '\\' => '\\',
            '"' => '"',
            '0' => '\0',
            'x' => {
                let hi = self.peek_char().ok_or("unterminated \\xNN escape")?;
                let lo = self.peek_nth_char(1).ok_or("unterminated \\xNN escape")?;
                if !hi.is_ascii_hexdigit() || !lo.is_ascii_hexdigit() {
                    return Err("invalid \\xNN escape".to_string());
                }
                self.bump_char();
                self.bump_char();
                let value = (hi.to_digit(16).unwrap() * 16 + lo.to_digit(16).unwrap()) as u8;
                value as char
            }
            other => return Err(format!("unknown escape `\\{other}`")),
        })
    }

    fn skip_to_string_end(&mut self) {
        while let Some(ch) = self.peek_char() {
            self.bump_char();
            if ch == '"' {
                return;
            }
            if ch == '\\' && self.peek_char().is_some() {
                self.bump_char();
            }
        }
    }

    /// Advances past an interpolation expression, stopping at the `}`
    /// that closes it (which remains unconsumed). Tracks brace nesting
    /// and skips string literals, including nested interpolations.
    fn skip_interpolation_expr(&mut self) -> Result<(), String> {
        let mut depth = 0i64;
        loop {
            let Some(ch) = self.peek_char() else {
                return Err("unterminated `${...}` in string".to_string());
            };
            match ch {
                '}' if depth == 0 => return Ok(()),
                '}' => {
                    depth -= 1;
                    self.bump_char();
                }
                '{' => {
                    depth += 1;
                    self.bump_char();
                }
                '"' => {
                    self.bump_char();
                    self.skip_nested_string()?;
                }
                _ => self.bump_char(),
            }
        }
    }

    fn skip_nested_string(&mut self) -> Result<(), String> {
        loop {
            let Some(ch) = self.peek_char() else {
                return Err("unterminated string literal".to_string());
            };
            if ch == '"' {
                self.bump_char();
                return Ok(());
            }
            if ch == '\\' {
                self.bump_char();
                if self.peek_char().is_some() {
                    self.bump_char();
                }
                continue;
            }
            if ch == '$' && self.peek_nth_char(1) == Some('{') {
                self.bump_char();
                self.bump_char();
                self.skip_interpolation_expr()?;
                if self.peek_char() == Some('}') {
                    self.bump_char();
                }
                continue;
            }
            self.bump_char();
        }
    }

    /// Greedy max-munch over one-, two-, and three-character operators.
    fn lex_operator(&mut self, pos: Pos, ch: char) -> Token {
        use TokenKind::*;
        let kind = match ch {
            '(' => self.single(LParen),
            ')' => self.single(RParen),
            '{' => self.single(LBrace),
            '}' => self.single(RBrace),
            '[' => self.single(LBracket),
            ']' => self.single(RBracket),
            ',' => self.single(Comma),
            ';' => self.single(Semi),
            '+' => self.single(Plus),
            '*' => self.single(Star),
            '/' => self.single(Slash),
            '%' => self.single(Percent),
            '^' => self.single(Caret),
            '~' => self.single(Tilde),
            '.' => {
                self.bump_char();
                if self.peek_char() == Some('.') {
                    self.bump_char();
                    if self.peek_char() == Some('=') {
                        self.bump_char();
                        DotDotEq
                    } else {
                        DotDot
                    }
                } else {
                    Dot
                }
            }
            ':' => {
                self.bump_char();
                if self.peek_char() == Some(':') {
                    self.bump_char();
                    ColonColon
                } else {
                    Colon
                }
            }
            '-' => {
                self.bump_char();
                if self.peek_char() == Some('>') {
                    self.bump_char();
                    Arrow
                } else {
                    Minus
                }
            }
            '=' => {
                self.bump_char();
                match self.peek_char() {
                    Some('=') => {
                        self.bump_char();
                        EqEq
                    }
                    Some('>') => {
                        self.bump_char();
                        FatArrow
                    }
                    _ => Assign,
                }
            }
            '!' => {
                self.bump_char();
                if self.peek_char() == Some('=') {
                    self.bump_char();
                    NotEq
                } else {
                    Bang
                }
            }
            '<' => {
                self.bump_char();
                match self.peek_char() {
                    Some('=') => {
                        self.bump_char();
                        LtEq
                    }
                    Some('<') => {
                        self.bump_char();
                        Shl
                    }
                    _ => Lt,
                }
            }
            '>' => {
                self.bump_char();
                match self.peek_char() {
                    Some('=') => {
                        self.bump_char();
                        GtEq
                    }
                    Some('>') => {
                        self.bump_char();
                        Shr
                    }
                    _ => Gt,
                }
            }
            '&' => {
                self.bump_char();
                if self.peek_char() == Some('&') {
                    self.bump_char();
                    AndAnd
                } else {
                    Amp
                }
            }
            '|' => {
                self.bump_char();
                if self.peek_char() == Some('|') {
                    self.bump_char();
                    OrOr
                } else {
                    Pipe
                }
            }
            '?' => {
                self.bump_char();
                match self.peek_char() {
                    Some('.') => {
                        self.bump_char();
                        QuestionDot
                    }
                    Some(':') => {
                        self.bump_char();
                        QuestionColon
                    }
                    _ => Question,
                }
            }
            other => {
                self.bump_char();
                Error(format!("unexpected character `{other}`"))
            }
        };
        self.token(kind, pos)
    }

    fn single(&mut self, kind: TokenKind) -> TokenKind {
        self.bump_char();
        kind
    }

    fn skip_ws_and_comments(&mut self) {
        loop {
            while self.peek_char().is_some_and(|c| c.is_whitespace()) {
                self.bump_char();
            }
            if self.peek_str("//") {
                while let Some(ch) = self.peek_char() {
                    self.bump_char();
                    if ch == '\n' {
                        break;
                    }
                }
                continue;
            }
            if self.peek_str("/*") {
                let pos = self.here();
                self.bump_char();
                self.bump_char();
                let mut closed = false;
                while self.peek_char().is_some() {
                    if self.peek_str("*/") {
                        self.bump_char();
                        self.bump_char();
                        closed = true;
                        break;
                    }
                    self.bump_char();
                }
                if !closed {
                    self.pending.push_back(Token {
                        kind: TokenKind::Error("unterminated block comment".to_string()),
                        pos,
                    });
                }
                continue;
            }
            break;
        }
    }

    fn bump_char(&mut self) {
        let Some(ch) = self.peek_char() else {
            return;
        };
        self.pos += ch.len_utf8();
        if ch == '\n' {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
    }

    fn peek_char(&self) -> Option<char> {
        self.src[self.pos..].chars().next()
    }

    fn peek_nth_char(&self, n: usize) -> Option<char> {
        self.src[self.pos..].chars().nth(n)
    }

    fn peek_str(&self, s: &str) -> bool {
        self.src[self.pos..].starts_with(s)
    }

    fn here(&self) -> Pos {
        Pos::new(self.file, self.line, self.col)
    }

    fn token(&self, kind: TokenKind, pos: Pos) -> Token {
        Token { kind, pos }
    }
}

fn is_ident_start(ch: char) -> bool {
    #[cfg(feature = "unicode")]
    {
        ch == '_' || unicode_ident::is_xid_start(ch)
    }
    #[cfg(not(feature = "unicode"))]
    {
        ch == '_' || ch.is_ascii_alphabetic()
    }
}

fn is_ident_continue(ch: char) -> bool {
    #[cfg(feature = "unicode")]
    {
        ch == '_' || unicode_ident::is_xid_continue(ch)
    }
    #[cfg(not(feature = "unicode"))]
    {
        ch == '_' || ch.is_ascii_alphanumeric()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<TokenKind> {
        tokenize(src, FileId(0)).into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn empty_source_is_one_eof_token() {
        assert_eq!(kinds(""), vec![TokenKind::Eof]);
    }

    #[test]
    fn lexes_function_header() {
        use TokenKind::*;
        assert_eq!(
            kinds("fn main() i64 {"),
            vec![
                KwFn,
                Ident("main".to_string()),
                LParen,
                RParen,
                Ident("i64".to_string()),
                LBrace,
                Eof
            ]
        );
    }

    #[test]
    fn max_munch_prefers_longest_operator() {
        use TokenKind::*;
        assert_eq!(
            kinds("a ..= b .. c"),
            vec![
                Ident("a".to_string()),
                DotDotEq,
                Ident("b".to_string()),
                DotDot,
                Ident("c".to_string()),
                Eof
            ]
        );
        assert_eq!(kinds("?. ?: ?"), vec![QuestionDot, QuestionColon, Question, Eof]);
        assert_eq!(kinds("<< <= <"), vec![Shl, LtEq, Lt, Eof]);
    }

    #[test]
    fn range_after_int_is_not_a_float() {
        use TokenKind::*;
        assert_eq!(
            kinds("0..10"),
            vec![Int(0), DotDot, Int(10), Eof]
        );
    }

    #[test]
    fn lexes_numeric_bases_and_floats() {
        use TokenKind::*;
        assert_eq!(kinds("0xFF"), vec![Int(255), Eof]);
        assert_eq!(kinds("0b101"), vec![Int(5), Eof]);
        assert_eq!(kinds("1_000"), vec![Int(1000), Eof]);
        assert_eq!(kinds("2.5"), vec![Float(2.5), Eof]);
        assert_eq!(kinds("1e3"), vec![Float(1000.0), Eof]);
    }

    #[test]
    fn tracks_line_and_column() {
        let tokens = tokenize("fn\n  x", FileId(0));
        assert_eq!(tokens[0].pos.line, 1);
        assert_eq!(tokens[0].pos.col, 1);
        assert_eq!(tokens[1].pos.line, 2);
        assert_eq!(tokens[1].pos.col, 3);
    }

    #[test]
    fn decodes_string_escapes() {
        assert_eq!(
            kinds(r#""a\n\t\x41\0\"""#),
            vec![TokenKind::Str("a\n\tA\0\"".to_string()), TokenKind::Eof]
        );
    }

    #[test]
    fn unknown_escape_is_an_error_token_and_scanning_continues() {
        let tokens = kinds(r#""bad \q escape" 7"#);
        assert!(matches!(tokens[0], TokenKind::Error(_)));
        assert!(tokens.contains(&TokenKind::Int(7)));
    }

    #[test]
    fn unterminated_string_is_an_error_token() {
        let tokens = kinds("\"abc");
        assert!(matches!(tokens[0], TokenKind::Error(_)));
    }

    #[test]
    fn unterminated_block_comment_is_an_error_token() {
        let tokens = kinds("/* never closed");
        assert!(matches!(tokens[0], TokenKind::Error(_)));
    }

    #[test]
    fn comments_are_discarded() {
        assert_eq!(
            kinds("1 // line\n/* block */ 2"),
            vec![TokenKind::Int(1), TokenKind::Int(2), TokenKind::Eof]
        );
    }

    #[test]
    fn interpolation_produces_framing_tokens() {
        use TokenKind::*;
        assert_eq!(
            kinds(r#""a${x}b""#),
            vec![
                StrPart("a".to_string()),
                InterpStart,
                Ident("x".to_string()),
                InterpEnd,
                Str("b".to_string()),
                Eof
            ]
        );
    }

    #[test]
    fn interpolation_lexes_inner_expression_tokens() {
        use TokenKind::*;
        assert_eq!(
            kinds(r#""v=${1 + 2}""#),
            vec![
                StrPart("v=".to_string()),
                InterpStart,
                Int(1),
                Plus,
                Int(2),
                InterpEnd,
                Str(String::new()),
                Eof
            ]
        );
    }

    #[test]
    fn nested_interpolated_strings_lex() {
        use TokenKind::*;
        let tokens = kinds(r#""x${ "y${z}w" }t""#);
        // Outer: StrPart("x") InterpStart ... InterpEnd Str("t").
        assert_eq!(tokens[0], StrPart("x".to_string()));
        assert_eq!(tokens[1], InterpStart);
        assert_eq!(tokens[2], StrPart("y".to_string()));
        assert_eq!(tokens[3], InterpStart);
        assert_eq!(tokens[4], Ident("z".to_string()));
        assert_eq!(tokens[5], InterpEnd);
        assert_eq!(tokens[6], Str("w".to_string()));
        assert_eq!(tokens[7], InterpEnd);
        assert_eq!(tokens[8], Str("t".to_string()));
    }

    #[test]
    fn stray_character_is_an_error_token() {
        let tokens = kinds("a # b");
        assert_eq!(tokens[0], TokenKind::Ident("a".to_string()));
        assert!(matches!(tokens[1], TokenKind::Error(_)));
        assert_eq!(tokens[2], TokenKind::Ident("b".to_string()));
    }
}
