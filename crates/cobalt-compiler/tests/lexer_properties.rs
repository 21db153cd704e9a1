//! Property tests for the lexer and the pipeline's determinism.

use cobalt_compiler::lexer::tokenize;
use cobalt_compiler::pos::FileId;
use cobalt_compiler::token::TokenKind;
use proptest::prelude::*;

/// Token texts that survive a lex/re-render round trip when joined by
/// whitespace.
fn renderable_token() -> impl Strategy<Value = String> {
    prop_oneof![
        "[a-z_][a-z0-9_]{0,8}".prop_map(|s| s),
        any::<u16>().prop_map(|n| n.to_string()),
        Just("==".to_string()),
        Just("!=".to_string()),
        Just("<=".to_string()),
        Just(">=".to_string()),
        Just("&&".to_string()),
        Just("||".to_string()),
        Just("..".to_string()),
        Just("..=".to_string()),
        Just("?.".to_string()),
        Just("->".to_string()),
        Just("=>".to_string()),
        Just("::".to_string()),
        Just("<<".to_string()),
        Just(">>".to_string()),
        Just("(".to_string()),
        Just(")".to_string()),
        Just("{".to_string()),
        Just("}".to_string()),
        Just("+".to_string()),
        Just("*".to_string()),
        Just(",".to_string()),
    ]
}

fn render(kind: &TokenKind) -> Option<String> {
    match kind {
        TokenKind::Ident(name) => Some(name.clone()),
        TokenKind::Int(v) => Some(v.to_string()),
        other => other.fixed_text().map(|s| s.to_string()),
    }
}

proptest! {
    /// Re-emitting token text with whitespace in between reproduces
    /// the original source modulo whitespace.
    #[test]
    fn token_round_trip(tokens in proptest::collection::vec(renderable_token(), 0..40)) {
        let source = tokens.join(" ");
        let lexed = tokenize(&source, FileId(0));
        let mut rendered = Vec::new();
        for token in &lexed {
            match &token.kind {
                TokenKind::Eof => break,
                kind => match render(kind) {
                    Some(text) => rendered.push(text),
                    None => prop_assert!(false, "unrenderable token {kind:?} from {source:?}"),
                },
            }
        }
        prop_assert_eq!(rendered.join(" "), source);
    }

    /// The lexer is total: arbitrary input produces a token stream
    /// ending in exactly one `Eof`, never a panic.
    #[test]
    fn lexer_never_panics(source in ".*") {
        let tokens = tokenize(&source, FileId(0));
        prop_assert!(!tokens.is_empty());
        prop_assert_eq!(&tokens.last().unwrap().kind, &TokenKind::Eof);
        prop_assert_eq!(
            tokens.iter().filter(|t| matches!(t.kind, TokenKind::Eof)).count(),
            1
        );
    }

    /// Positions on tokens are monotonically non-decreasing.
    #[test]
    fn token_positions_are_monotonic(source in "[ -~\n]{0,120}") {
        let tokens = tokenize(&source, FileId(0));
        let mut last = (1u32, 0u32);
        for token in &tokens {
            let here = (token.pos.line, token.pos.col);
            prop_assert!(
                here.0 > last.0 || (here.0 == last.0 && here.1 >= last.1),
                "position went backwards in {source:?}"
            );
            last = here;
        }
    }

    /// Compiling the same trivial program twice is byte-identical.
    #[test]
    fn compilation_is_deterministic(value in any::<i16>()) {
        let src = format!("fn main() i64 {{ return {value} }}");
        let a = cobalt_compiler::compile_source("p.cb", &src).expect("compile");
        let b = cobalt_compiler::compile_source("p.cb", &src).expect("compile");
        prop_assert_eq!(a, b);
    }
}
