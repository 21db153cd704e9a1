//! The parser: token stream to AST.
//!
//! Declarations and statements are recursive descent; expressions use
//! Pratt binding powers. On an unexpected token the parser records one
//! diagnostic and resynchronizes to the next statement starter or
//! matching close delimiter at the current nesting depth.

use crate::ast::*;
use crate::diag::{DiagKind, Diagnostic};
use crate::pos::Pos;
use crate::token::{Token, TokenKind};

/// Parses a whole token stream. Diagnostics are accumulated; the
/// returned program holds whatever parsed cleanly.
pub fn parse(tokens: Vec<Token>) -> (Program, Vec<Diagnostic>) {
    let (items, ast, diags) = parse_file(tokens, Ast::new());
    (Program { items, ast }, diags)
}

/// Parses one file's tokens into an existing arena, so a multi-file
/// compilation shares a single id space.
pub fn parse_file(tokens: Vec<Token>, ast: Ast) -> (Vec<Item>, Ast, Vec<Diagnostic>) {
    let mut parser = Parser::new(tokens);
    parser.ast = ast;
    let items = parser.parse_items();
    (items, parser.ast, parser.diags)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    ast: Ast,
    diags: Vec<Diagnostic>,
}

/// Marker for "a diagnostic was already recorded; resynchronize".
struct Recover;

type PResult<T> = Result<T, Recover>;

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Self {
            tokens,
            pos: 0,
            ast: Ast::new(),
            diags: Vec::new(),
        }
    }

    // ----- token plumbing -----

    fn peek(&self) -> &TokenKind {
        &self.tokens[self.pos].kind
    }

    fn peek_nth(&self, n: usize) -> &TokenKind {
        let idx = (self.pos + n).min(self.tokens.len() - 1);
        &self.tokens[idx].kind
    }

    fn here(&self) -> Pos {
        self.tokens[self.pos].pos
    }

    fn bump(&mut self) -> Token {
        let token = self.tokens[self.pos].clone();
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        token
    }

    fn at(&self, kind: &TokenKind) -> bool {
        self.peek() == kind
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.at(kind) {
            self.bump();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: &TokenKind) -> PResult<Token> {
        if self.at(kind) {
            return Ok(self.bump());
        }
        Err(self.error_here(format!(
            "expected {}, found {}",
            kind.describe(),
            self.peek().describe()
        )))
    }

    fn expect_ident(&mut self) -> PResult<(String, Pos)> {
        match self.peek().clone() {
            TokenKind::Ident(name) => {
                let token = self.bump();
                Ok((name, token.pos))
            }
            other => Err(self.error_here(format!(
                "expected identifier, found {}",
                other.describe()
            ))),
        }
    }

    fn error_here(&mut self, message: impl Into<String>) -> Recover {
        let pos = self.here();
        self.diags
            .push(Diagnostic::new(DiagKind::Syntax, message, pos));
        Recover
    }

    /// Reports an error token from the lexer once, then steps past it.
    fn take_lex_error(&mut self) {
        if let TokenKind::Error(message) = self.peek().clone() {
            let pos = self.here();
            self.diags
                .push(Diagnostic::new(DiagKind::Lexical, message, pos));
            self.bump();
        }
    }

    /// Skips to the next statement/item starter or a close delimiter
    /// at the current nesting depth.
    fn resync(&mut self) {
        let mut depth = 0i32;
        loop {
            match self.peek() {
                TokenKind::Eof => return,
                TokenKind::LBrace | TokenKind::LParen | TokenKind::LBracket => {
                    depth += 1;
                    self.bump();
                }
                TokenKind::RBrace | TokenKind::RParen | TokenKind::RBracket => {
                    if depth == 0 {
                        return;
                    }
                    depth -= 1;
                    self.bump();
                }
                TokenKind::Semi if depth == 0 => {
                    self.bump();
                    return;
                }
                kind if depth == 0 && is_starter(kind) => return,
                _ => {
                    self.bump();
                }
            }
        }
    }

    // ----- items -----

    fn parse_items(&mut self) -> Vec<Item> {
        let mut items = Vec::new();
        loop {
            self.take_lex_error();
            if matches!(self.peek(), TokenKind::Eof) {
                return items;
            }
            match self.parse_item() {
                Ok(item) => items.push(item),
                Err(Recover) => self.resync(),
            }
        }
    }

    fn parse_item(&mut self) -> PResult<Item> {
        let is_pub = self.eat(&TokenKind::KwPub);
        match self.peek() {
            TokenKind::KwFn => Ok(Item::Function(self.parse_fn_decl(is_pub)?)),
            TokenKind::KwStruct => Ok(Item::Struct(self.parse_struct_decl(is_pub)?)),
            TokenKind::KwEnum => Ok(Item::Enum(self.parse_enum_decl(is_pub)?)),
            TokenKind::KwImpl => Ok(Item::Impl(self.parse_impl_block()?)),
            TokenKind::KwTrait => Ok(Item::Trait(self.parse_trait_decl()?)),
            TokenKind::KwUnion => Ok(Item::Union(self.parse_union_decl()?)),
            TokenKind::KwType => Ok(Item::TypeAlias(self.parse_type_alias()?)),
            TokenKind::KwTest => Ok(Item::Test(self.parse_test_decl()?)),
            TokenKind::KwImport => Ok(Item::Import(self.parse_import_decl()?)),
            TokenKind::KwComptime => Ok(Item::Comptime(self.parse_comptime_block()?)),
            TokenKind::KwVar | TokenKind::KwConst => Ok(Item::Global(self.parse_global_decl()?)),
            other => {
                let msg = format!("expected declaration, found {}", other.describe());
                Err(self.error_here(msg))
            }
        }
    }

    fn parse_fn_decl(&mut self, is_pub: bool) -> PResult<FnDecl> {
        let pos = self.expect(&TokenKind::KwFn)?.pos;
        let (name, _) = self.expect_ident()?;
        self.expect(&TokenKind::LParen)?;
        let params = self.parse_param_list()?;
        self.expect(&TokenKind::RParen)?;
        // The result type is written directly before the body; absent
        // (or `void`) means no value.
        let ret = if self.at(&TokenKind::LBrace) {
            None
        } else {
            Some(self.parse_type()?)
        };
        let body = self.parse_block()?;
        Ok(FnDecl {
            name,
            is_pub,
            params,
            ret,
            body,
            pos,
        })
    }

    fn parse_param_list(&mut self) -> PResult<Vec<ParamDecl>> {
        let mut params = Vec::new();
        while !self.at(&TokenKind::RParen) {
            let (name, pos) = self.expect_ident()?;
            // `self` in an impl method carries no annotation; the
            // checker supplies the receiver type.
            let ty = if name == "self" && !self.at(&TokenKind::Colon) {
                self.ast.alloc_type_ref(TypeRefKind::Named("Self".to_string()), pos)
            } else {
                self.expect(&TokenKind::Colon)?;
                self.parse_type()?
            };
            params.push(ParamDecl { name, ty, pos });
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        Ok(params)
    }

    fn parse_struct_decl(&mut self, is_pub: bool) -> PResult<StructDecl> {
        let pos = self.expect(&TokenKind::KwStruct)?.pos;
        let (name, _) = self.expect_ident()?;
        self.expect(&TokenKind::LBrace)?;
        let fields = self.parse_field_list()?;
        self.expect(&TokenKind::RBrace)?;
        Ok(StructDecl {
            name,
            is_pub,
            fields,
            pos,
        })
    }

    fn parse_field_list(&mut self) -> PResult<Vec<FieldDecl>> {
        let mut fields = Vec::new();
        while !self.at(&TokenKind::RBrace) {
            let (name, pos) = self.expect_ident()?;
            self.expect(&TokenKind::Colon)?;
            let ty = self.parse_type()?;
            fields.push(FieldDecl { name, ty, pos });
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        Ok(fields)
    }

    fn parse_enum_decl(&mut self, is_pub: bool) -> PResult<EnumDecl> {
        let pos = self.expect(&TokenKind::KwEnum)?.pos;
        let (name, _) = self.expect_ident()?;
        self.expect(&TokenKind::LBrace)?;
        let mut variants = Vec::new();
        while !self.at(&TokenKind::RBrace) {
            let (vname, vpos) = self.expect_ident()?;
            let payload = if self.eat(&TokenKind::LParen) {
                let mut tys = Vec::new();
                while !self.at(&TokenKind::RParen) {
                    tys.push(self.parse_type()?);
                    if !self.eat(&TokenKind::Comma) {
                        break;
                    }
                }
                self.expect(&TokenKind::RParen)?;
                VariantPayload::Tuple(tys)
            } else if self.eat(&TokenKind::LBrace) {
                let fields = self.parse_field_list()?;
                self.expect(&TokenKind::RBrace)?;
                VariantPayload::Struct(fields)
            } else {
                VariantPayload::Unit
            };
            variants.push(VariantDecl {
                name: vname,
                payload,
                pos: vpos,
            });
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        self.expect(&TokenKind::RBrace)?;
        Ok(EnumDecl {
            name,
            is_pub,
            variants,
            pos,
        })
    }

    fn parse_impl_block(&mut self) -> PResult<ImplBlock> {
        let pos = self.expect(&TokenKind::KwImpl)?.pos;
        let (first, _) = self.expect_ident()?;
        let (trait_name, type_name) = if self.eat(&TokenKind::KwFor) {
            let (ty, _) = self.expect_ident()?;
            (Some(first), ty)
        } else {
            (None, first)
        };
        self.expect(&TokenKind::LBrace)?;
        let mut methods = Vec::new();
        while !self.at(&TokenKind::RBrace) {
            let is_pub = self.eat(&TokenKind::KwPub);
            methods.push(self.parse_fn_decl(is_pub)?);
        }
        self.expect(&TokenKind::RBrace)?;
        Ok(ImplBlock {
            trait_name,
            type_name,
            methods,
            pos,
        })
    }

    fn parse_trait_decl(&mut self) -> PResult<TraitDecl> {
        let pos = self.expect(&TokenKind::KwTrait)?.pos;
        let (name, _) = self.expect_ident()?;
        self.expect(&TokenKind::LBrace)?;
        let mut methods = Vec::new();
        while !self.at(&TokenKind::RBrace) {
            let mpos = self.expect(&TokenKind::KwFn)?.pos;
            let (mname, _) = self.expect_ident()?;
            self.expect(&TokenKind::LParen)?;
            let params = self.parse_param_list()?;
            self.expect(&TokenKind::RParen)?;
            let ret = if self.at(&TokenKind::Semi) || self.at(&TokenKind::KwFn) || self.at(&TokenKind::RBrace) {
                None
            } else {
                Some(self.parse_type()?)
            };
            self.eat(&TokenKind::Semi);
            methods.push(TraitMethod {
                name: mname,
                params,
                ret,
                pos: mpos,
            });
        }
        self.expect(&TokenKind::RBrace)?;
        Ok(TraitDecl { name, methods, pos })
    }

    fn parse_union_decl(&mut self) -> PResult<UnionDecl> {
        let pos = self.expect(&TokenKind::KwUnion)?.pos;
        let (name, _) = self.expect_ident()?;
        self.expect(&TokenKind::LBrace)?;
        let fields = self.parse_field_list()?;
        self.expect(&TokenKind::RBrace)?;
        Ok(UnionDecl { name, fields, pos })
    }

    fn parse_type_alias(&mut self) -> PResult<AliasDecl> {
        let pos = self.expect(&TokenKind::KwType)?.pos;
        let (name, _) = self.expect_ident()?;
        self.expect(&TokenKind::Assign)?;
        let ty = self.parse_type()?;
        self.eat(&TokenKind::Semi);
        Ok(AliasDecl { name, ty, pos })
    }

    fn parse_test_decl(&mut self) -> PResult<TestDecl> {
        let pos = self.expect(&TokenKind::KwTest)?.pos;
        let name = match self.peek().clone() {
            TokenKind::Str(name) => {
                self.bump();
                name
            }
            other => {
                let msg = format!("expected test name string, found {}", other.describe());
                return Err(self.error_here(msg));
            }
        };
        let body = self.parse_block()?;
        Ok(TestDecl { name, body, pos })
    }

    fn parse_import_decl(&mut self) -> PResult<ImportDecl> {
        let pos = self.expect(&TokenKind::KwImport)?.pos;
        let path = match self.peek().clone() {
            TokenKind::Str(path) => {
                self.bump();
                path
            }
            other => {
                let msg = format!("expected import path string, found {}", other.describe());
                return Err(self.error_here(msg));
            }
        };
        let alias = if self.eat(&TokenKind::KwAs) {
            Some(self.expect_ident()?.0)
        } else {
            None
        };
        self.eat(&TokenKind::Semi);
        Ok(ImportDecl { path, alias, pos })
    }

    fn parse_comptime_block(&mut self) -> PResult<ComptimeBlock> {
        let pos = self.expect(&TokenKind::KwComptime)?.pos;
        let body = self.parse_block()?;
        Ok(ComptimeBlock { body, pos })
    }

    fn parse_global_decl(&mut self) -> PResult<GlobalDecl> {
        let pos = self.here();
        let is_mutable = match self.peek() {
            TokenKind::KwVar => true,
            TokenKind::KwConst => false,
            other => {
                let msg = format!("expected `var` or `const`, found {}", other.describe());
                return Err(self.error_here(msg));
            }
        };
        self.bump();
        let (name, _) = self.expect_ident()?;
        let ty = if self.eat(&TokenKind::Colon) {
            Some(self.parse_type()?)
        } else {
            None
        };
        self.expect(&TokenKind::Assign)?;
        let init = self.parse_expr()?;
        self.eat(&TokenKind::Semi);
        Ok(GlobalDecl {
            name,
            is_mutable,
            ty,
            init,
            pos,
        })
    }

    // ----- statements -----

    fn parse_block(&mut self) -> PResult<StmtId> {
        let pos = self.expect(&TokenKind::LBrace)?.pos;
        let mut stmts = Vec::new();
        loop {
            self.take_lex_error();
            if self.at(&TokenKind::RBrace) || self.at(&TokenKind::Eof) {
                break;
            }
            if self.eat(&TokenKind::Semi) {
                continue;
            }
            match self.parse_stmt() {
                Ok(stmt) => stmts.push(stmt),
                Err(Recover) => self.resync(),
            }
        }
        self.expect(&TokenKind::RBrace)?;
        Ok(self.ast.alloc_stmt(StmtKind::Block(stmts), pos))
    }

    fn parse_stmt(&mut self) -> PResult<StmtId> {
        let pos = self.here();
        match self.peek() {
            TokenKind::KwVar | TokenKind::KwConst => self.parse_var_stmt(),
            TokenKind::KwReturn => {
                self.bump();
                let value = if self.at(&TokenKind::Semi)
                    || self.at(&TokenKind::RBrace)
                    || stmt_follows(self.peek())
                {
                    None
                } else {
                    Some(self.parse_expr()?)
                };
                self.eat(&TokenKind::Semi);
                Ok(self.ast.alloc_stmt(StmtKind::Return(value), pos))
            }
            TokenKind::KwIf => self.parse_if_stmt(),
            TokenKind::KwWhile => {
                self.bump();
                let cond = self.parse_expr_no_struct()?;
                let body = self.parse_block()?;
                Ok(self.ast.alloc_stmt(StmtKind::While { cond, body }, pos))
            }
            TokenKind::KwFor => {
                self.bump();
                let (binding, _) = self.expect_ident()?;
                self.expect(&TokenKind::KwIn)?;
                let iter = self.parse_expr_no_struct()?;
                let body = self.parse_block()?;
                Ok(self
                    .ast
                    .alloc_stmt(StmtKind::For { binding, iter, body }, pos))
            }
            TokenKind::KwSwitch => self.parse_switch_stmt(),
            TokenKind::KwLoop => {
                self.bump();
                let body = self.parse_block()?;
                Ok(self.ast.alloc_stmt(StmtKind::Loop { body }, pos))
            }
            TokenKind::KwDefer => {
                self.bump();
                let expr = self.parse_expr()?;
                self.eat(&TokenKind::Semi);
                Ok(self.ast.alloc_stmt(StmtKind::Defer(expr), pos))
            }
            TokenKind::KwTry => {
                self.bump();
                let try_block = self.parse_block()?;
                self.expect(&TokenKind::KwCatch)?;
                self.expect(&TokenKind::LParen)?;
                let (catch_name, _) = self.expect_ident()?;
                self.expect(&TokenKind::RParen)?;
                let catch_block = self.parse_block()?;
                Ok(self.ast.alloc_stmt(
                    StmtKind::TryCatch {
                        try_block,
                        catch_name,
                        catch_block,
                    },
                    pos,
                ))
            }
            TokenKind::KwThrow => {
                self.bump();
                let expr = self.parse_expr()?;
                self.eat(&TokenKind::Semi);
                Ok(self.ast.alloc_stmt(StmtKind::Throw(expr), pos))
            }
            TokenKind::KwBreak => {
                self.bump();
                self.eat(&TokenKind::Semi);
                Ok(self.ast.alloc_stmt(StmtKind::Break, pos))
            }
            TokenKind::KwContinue => {
                self.bump();
                self.eat(&TokenKind::Semi);
                Ok(self.ast.alloc_stmt(StmtKind::Continue, pos))
            }
            TokenKind::LBrace => self.parse_block(),
            _ => {
                let expr = self.parse_expr()?;
                self.eat(&TokenKind::Semi);
                Ok(self.ast.alloc_stmt(StmtKind::Expr(expr), pos))
            }
        }
    }

    fn parse_var_stmt(&mut self) -> PResult<StmtId> {
        let pos = self.here();
        let is_mutable = matches!(self.peek(), TokenKind::KwVar);
        self.bump();
        let (name, name_pos) = self.expect_ident()?;
        let ty = if self.eat(&TokenKind::Colon) {
            Some(self.parse_type()?)
        } else {
            None
        };
        let init = if self.eat(&TokenKind::Assign) {
            Some(self.parse_expr()?)
        } else {
            None
        };
        if !is_mutable && init.is_none() {
            self.diags.push(Diagnostic::new(
                DiagKind::Syntax,
                "`const` bindings require an initializer",
                name_pos,
            ));
        }
        self.eat(&TokenKind::Semi);
        Ok(self.ast.alloc_stmt(
            StmtKind::Var {
                name,
                is_mutable,
                ty,
                init,
            },
            pos,
        ))
    }

    fn parse_if_stmt(&mut self) -> PResult<StmtId> {
        let pos = self.expect(&TokenKind::KwIf)?.pos;
        let cond = self.parse_expr_no_struct()?;
        let then_block = self.parse_block()?;
        let else_block = if self.eat(&TokenKind::KwElse) {
            Some(if self.at(&TokenKind::KwIf) {
                self.parse_if_stmt()?
            } else {
                self.parse_block()?
            })
        } else {
            None
        };
        Ok(self.ast.alloc_stmt(
            StmtKind::If {
                cond,
                then_block,
                else_block,
            },
            pos,
        ))
    }

    fn parse_switch_stmt(&mut self) -> PResult<StmtId> {
        let pos = self.expect(&TokenKind::KwSwitch)?.pos;
        let scrutinee = self.parse_expr_no_struct()?;
        self.expect(&TokenKind::LBrace)?;
        let mut arms = Vec::new();
        while !self.at(&TokenKind::RBrace) {
            let arm_pos = self.here();
            let pattern = self.parse_pattern()?;
            self.expect(&TokenKind::FatArrow)?;
            let body = if self.at(&TokenKind::LBrace) {
                self.parse_block()?
            } else {
                let expr = self.parse_expr()?;
                let stmt = self.ast.alloc_stmt(StmtKind::Expr(expr), arm_pos);
                self.ast.alloc_stmt(StmtKind::Block(vec![stmt]), arm_pos)
            };
            arms.push(SwitchArm {
                pattern,
                body,
                pos: arm_pos,
            });
            self.eat(&TokenKind::Comma);
        }
        self.expect(&TokenKind::RBrace)?;
        Ok(self.ast.alloc_stmt(StmtKind::Switch { scrutinee, arms }, pos))
    }

    fn parse_pattern(&mut self) -> PResult<Pattern> {
        let pos = self.here();
        match self.peek().clone() {
            TokenKind::Ident(name) if name == "_" => {
                self.bump();
                Ok(Pattern::Wildcard)
            }
            TokenKind::Int(_) | TokenKind::Str(_) | TokenKind::KwTrue | TokenKind::KwFalse => {
                let expr = self.parse_primary(false)?;
                Ok(Pattern::Literal(expr))
            }
            TokenKind::Minus => {
                let expr = self.parse_expr()?;
                Ok(Pattern::Literal(expr))
            }
            TokenKind::Ident(first) => {
                self.bump();
                // `Enum.Variant(bindings)` or a bare variant name.
                let (enum_name, variant) = if self.eat(&TokenKind::Dot) {
                    let (variant, _) = self.expect_ident()?;
                    (Some(first), variant)
                } else {
                    (None, first)
                };
                let mut bindings = Vec::new();
                if self.eat(&TokenKind::LParen) {
                    while !self.at(&TokenKind::RParen) {
                        bindings.push(self.expect_ident()?.0);
                        if !self.eat(&TokenKind::Comma) {
                            break;
                        }
                    }
                    self.expect(&TokenKind::RParen)?;
                }
                Ok(Pattern::Variant {
                    enum_name,
                    variant,
                    bindings,
                })
            }
            other => {
                let msg = format!("expected pattern, found {}", other.describe());
                self.diags.push(Diagnostic::new(DiagKind::Syntax, msg, pos));
                Err(Recover)
            }
        }
    }

    // ----- expressions -----

    fn parse_expr(&mut self) -> PResult<ExprId> {
        self.parse_expr_bp(0, true)
    }

    /// Expression in a position where `{` starts a block, not a struct
    /// literal (if/while/for/switch headers).
    fn parse_expr_no_struct(&mut self) -> PResult<ExprId> {
        self.parse_expr_bp(0, false)
    }

    fn parse_expr_bp(&mut self, min_bp: u8, allow_struct: bool) -> PResult<ExprId> {
        let mut lhs = self.parse_prefix(allow_struct)?;

        loop {
            lhs = self.parse_postfix(lhs, allow_struct)?;

            // Ternary and elvis sit at assignment precedence.
            match self.peek() {
                TokenKind::Question if 2 >= min_bp => {
                    let pos = self.ast.expr(lhs).pos;
                    self.bump();
                    let then_expr = self.parse_expr_bp(0, true)?;
                    self.expect(&TokenKind::Colon)?;
                    let else_expr = self.parse_expr_bp(1, allow_struct)?;
                    lhs = self.ast.alloc_expr(
                        ExprKind::Ternary {
                            cond: lhs,
                            then_expr,
                            else_expr,
                        },
                        pos,
                    );
                    continue;
                }
                TokenKind::QuestionColon if 2 >= min_bp => {
                    let pos = self.ast.expr(lhs).pos;
                    self.bump();
                    let fallback = self.parse_expr_bp(1, allow_struct)?;
                    lhs = self.ast.alloc_expr(
                        ExprKind::Elvis {
                            value: lhs,
                            fallback,
                        },
                        pos,
                    );
                    continue;
                }
                TokenKind::Assign if 2 >= min_bp => {
                    let pos = self.ast.expr(lhs).pos;
                    self.bump();
                    let value = self.parse_expr_bp(1, allow_struct)?;
                    lhs = self
                        .ast
                        .alloc_expr(ExprKind::Assign { target: lhs, value }, pos);
                    continue;
                }
                _ => {}
            }

            // `as` / `is` bind tighter than comparison, looser than
            // additive, and take a type operand.
            if matches!(self.peek(), TokenKind::KwAs | TokenKind::KwIs) && 13 >= min_bp {
                let is_cast = matches!(self.peek(), TokenKind::KwAs);
                let pos = self.ast.expr(lhs).pos;
                self.bump();
                let ty = self.parse_type()?;
                lhs = self.ast.alloc_expr(
                    if is_cast {
                        ExprKind::Cast { expr: lhs, ty }
                    } else {
                        ExprKind::TypeTest { expr: lhs, ty }
                    },
                    pos,
                );
                continue;
            }

            // Range operators are right-associative.
            if matches!(self.peek(), TokenKind::DotDot | TokenKind::DotDotEq) && 12 >= min_bp {
                let inclusive = matches!(self.peek(), TokenKind::DotDotEq);
                let pos = self.ast.expr(lhs).pos;
                self.bump();
                let hi = self.parse_expr_bp(11, allow_struct)?;
                lhs = self.ast.alloc_expr(
                    ExprKind::Range {
                        lo: lhs,
                        hi,
                        inclusive,
                    },
                    pos,
                );
                continue;
            }

            let (l_bp, r_bp, op) = match self.peek() {
                TokenKind::OrOr => (3, 4, BinaryOp::Or),
                TokenKind::AndAnd => (5, 6, BinaryOp::And),
                TokenKind::EqEq => (7, 8, BinaryOp::Eq),
                TokenKind::NotEq => (7, 8, BinaryOp::Ne),
                TokenKind::Lt => (9, 10, BinaryOp::Lt),
                TokenKind::LtEq => (9, 10, BinaryOp::Le),
                TokenKind::Gt => (9, 10, BinaryOp::Gt),
                TokenKind::GtEq => (9, 10, BinaryOp::Ge),
                TokenKind::Pipe => (15, 16, BinaryOp::BitOr),
                TokenKind::Caret => (17, 18, BinaryOp::BitXor),
                TokenKind::Amp => (19, 20, BinaryOp::BitAnd),
                TokenKind::Shl => (21, 22, BinaryOp::Shl),
                TokenKind::Shr => (21, 22, BinaryOp::Shr),
                TokenKind::Plus => (23, 24, BinaryOp::Add),
                TokenKind::Minus => (23, 24, BinaryOp::Sub),
                TokenKind::Star => (25, 26, BinaryOp::Mul),
                TokenKind::Slash => (25, 26, BinaryOp::Div),
                TokenKind::Percent => (25, 26, BinaryOp::Rem),
                _ => break,
            };
            if l_bp < min_bp {
                break;
            }
            let pos = self.ast.expr(lhs).pos;
            self.bump();
            let right = self.parse_expr_bp(r_bp, allow_struct)?;
            lhs = self.ast.alloc_expr(
                ExprKind::Binary {
                    op,
                    left: lhs,
                    right,
                },
                pos,
            );
        }

        Ok(lhs)
    }

    fn parse_prefix(&mut self, allow_struct: bool) -> PResult<ExprId> {
        let pos = self.here();
        let op = match self.peek() {
            TokenKind::Minus => Some(UnaryOp::Neg),
            TokenKind::Bang => Some(UnaryOp::Not),
            TokenKind::Tilde => Some(UnaryOp::BitNot),
            _ => None,
        };
        if let Some(op) = op {
            self.bump();
            let expr = self.parse_prefix(allow_struct)?;
            let expr = self.parse_postfix(expr, allow_struct)?;
            return Ok(self.ast.alloc_expr(ExprKind::Unary { op, expr }, pos));
        }
        self.parse_primary(allow_struct)
    }

    fn parse_postfix(&mut self, mut expr: ExprId, allow_struct: bool) -> PResult<ExprId> {
        loop {
            match self.peek() {
                TokenKind::LParen => {
                    let pos = self.ast.expr(expr).pos;
                    let args = self.parse_call_args()?;
                    expr = self
                        .ast
                        .alloc_expr(ExprKind::Call { callee: expr, args }, pos);
                }
                TokenKind::Dot => {
                    let pos = self.ast.expr(expr).pos;
                    self.bump();
                    let (name, _) = self.expect_ident()?;
                    if self.at(&TokenKind::LParen) {
                        let args = self.parse_call_args()?;
                        expr = self.ast.alloc_expr(
                            ExprKind::MethodCall {
                                recv: expr,
                                method: name,
                                args,
                            },
                            pos,
                        );
                    } else {
                        expr = self
                            .ast
                            .alloc_expr(ExprKind::Field { base: expr, name }, pos);
                    }
                }
                TokenKind::QuestionDot => {
                    let pos = self.ast.expr(expr).pos;
                    self.bump();
                    if self.eat(&TokenKind::LBracket) {
                        let index = self.parse_expr()?;
                        self.expect(&TokenKind::RBracket)?;
                        expr = self
                            .ast
                            .alloc_expr(ExprKind::OptionalIndex { base: expr, index }, pos);
                    } else {
                        let (name, _) = self.expect_ident()?;
                        expr = self
                            .ast
                            .alloc_expr(ExprKind::OptionalField { base: expr, name }, pos);
                    }
                }
                TokenKind::LBracket => {
                    let pos = self.ast.expr(expr).pos;
                    self.bump();
                    let index = self.parse_expr()?;
                    self.expect(&TokenKind::RBracket)?;
                    // `e[a..b]` is a slice, not an index of a range.
                    expr = match self.ast.expr(index).kind.clone() {
                        ExprKind::Range {
                            lo,
                            hi,
                            inclusive: false,
                        } => self.ast.alloc_expr(
                            ExprKind::Slice {
                                base: expr,
                                start: lo,
                                end: hi,
                            },
                            pos,
                        ),
                        _ => self
                            .ast
                            .alloc_expr(ExprKind::Index { base: expr, index }, pos),
                    };
                }
                TokenKind::LBrace if allow_struct => {
                    // Struct literal only directly after a type name,
                    // and only when the brace opens a `.field` list.
                    let is_init = matches!(self.ast.expr(expr).kind, ExprKind::Ident(_))
                        && matches!(self.peek_nth(1), TokenKind::Dot | TokenKind::RBrace);
                    if !is_init {
                        break;
                    }
                    let (name, pos) = match &self.ast.expr(expr).kind {
                        ExprKind::Ident(name) => (name.clone(), self.ast.expr(expr).pos),
                        _ => unreachable!("checked above"),
                    };
                    let ty = self.ast.alloc_type_ref(TypeRefKind::Named(name), pos);
                    let fields = self.parse_struct_init_fields()?;
                    expr = self.ast.alloc_expr(
                        ExprKind::StructInit {
                            ty,
                            fields,
                            heap: false,
                        },
                        pos,
                    );
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    fn parse_struct_init_fields(&mut self) -> PResult<Vec<(String, ExprId)>> {
        self.expect(&TokenKind::LBrace)?;
        let mut fields = Vec::new();
        while !self.at(&TokenKind::RBrace) {
            self.expect(&TokenKind::Dot)?;
            let (name, _) = self.expect_ident()?;
            self.expect(&TokenKind::Assign)?;
            let value = self.parse_expr()?;
            fields.push((name, value));
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        self.expect(&TokenKind::RBrace)?;
        Ok(fields)
    }

    fn parse_call_args(&mut self) -> PResult<Vec<ExprId>> {
        self.expect(&TokenKind::LParen)?;
        let mut args = Vec::new();
        while !self.at(&TokenKind::RParen) {
            args.push(self.parse_expr()?);
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        self.expect(&TokenKind::RParen)?;
        Ok(args)
    }

    fn parse_primary(&mut self, allow_struct: bool) -> PResult<ExprId> {
        let pos = self.here();
        match self.peek().clone() {
            TokenKind::Int(v) => {
                self.bump();
                Ok(self.ast.alloc_expr(ExprKind::IntLit(v), pos))
            }
            TokenKind::Float(v) => {
                self.bump();
                Ok(self.ast.alloc_expr(ExprKind::FloatLit(v), pos))
            }
            TokenKind::Str(s) => {
                self.bump();
                Ok(self.ast.alloc_expr(ExprKind::StrLit(s), pos))
            }
            TokenKind::StrPart(_) => self.parse_interp_string(pos),
            TokenKind::KwTrue => {
                self.bump();
                Ok(self.ast.alloc_expr(ExprKind::BoolLit(true), pos))
            }
            TokenKind::KwFalse => {
                self.bump();
                Ok(self.ast.alloc_expr(ExprKind::BoolLit(false), pos))
            }
            TokenKind::KwNull => {
                self.bump();
                Ok(self.ast.alloc_expr(ExprKind::NullLit, pos))
            }
            TokenKind::Ident(name) => {
                self.bump();
                Ok(self.ast.alloc_expr(ExprKind::Ident(name), pos))
            }
            TokenKind::LParen => {
                self.bump();
                let expr = self.parse_expr()?;
                self.expect(&TokenKind::RParen)?;
                Ok(expr)
            }
            TokenKind::LBracket => {
                self.bump();
                let mut items = Vec::new();
                while !self.at(&TokenKind::RBracket) {
                    items.push(self.parse_expr()?);
                    if !self.eat(&TokenKind::Comma) {
                        break;
                    }
                }
                self.expect(&TokenKind::RBracket)?;
                Ok(self.ast.alloc_expr(ExprKind::ArrayInit { items }, pos))
            }
            TokenKind::KwNew => {
                self.bump();
                let ty = self.parse_type()?;
                let fields = if self.at(&TokenKind::LBrace) {
                    self.parse_struct_init_fields()?
                } else {
                    Vec::new()
                };
                Ok(self.ast.alloc_expr(
                    ExprKind::StructInit {
                        ty,
                        fields,
                        heap: true,
                    },
                    pos,
                ))
            }
            TokenKind::Pipe | TokenKind::OrOr => self.parse_lambda(pos),
            TokenKind::Error(message) => {
                self.bump();
                self.diags
                    .push(Diagnostic::new(DiagKind::Lexical, message, pos));
                Err(Recover)
            }
            other => {
                let _ = allow_struct;
                let msg = format!("expected expression, found {}", other.describe());
                Err(self.error_here(msg))
            }
        }
    }

    fn parse_lambda(&mut self, pos: Pos) -> PResult<ExprId> {
        let mut params = Vec::new();
        if self.eat(&TokenKind::OrOr) {
            // `||` is an empty parameter list.
        } else {
            self.expect(&TokenKind::Pipe)?;
            while !self.at(&TokenKind::Pipe) {
                let (name, ppos) = self.expect_ident()?;
                let ty = if self.eat(&TokenKind::Colon) {
                    Some(self.parse_type()?)
                } else {
                    None
                };
                params.push(LambdaParam {
                    name,
                    ty,
                    pos: ppos,
                });
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
            self.expect(&TokenKind::Pipe)?;
        }
        let ret = if self.at(&TokenKind::LBrace) {
            None
        } else {
            Some(self.parse_type()?)
        };
        let body = self.parse_block()?;
        Ok(self
            .ast
            .alloc_expr(ExprKind::Lambda { params, ret, body }, pos))
    }

    fn parse_interp_string(&mut self, pos: Pos) -> PResult<ExprId> {
        let mut parts = Vec::new();
        loop {
            match self.peek().clone() {
                TokenKind::StrPart(text) => {
                    self.bump();
                    if !text.is_empty() {
                        parts.push(InterpPart::Text(text));
                    }
                    self.expect(&TokenKind::InterpStart)?;
                    let expr = self.parse_expr()?;
                    self.expect(&TokenKind::InterpEnd)?;
                    parts.push(InterpPart::Expr(expr));
                }
                TokenKind::Str(text) => {
                    self.bump();
                    if !text.is_empty() {
                        parts.push(InterpPart::Text(text));
                    }
                    return Ok(self.ast.alloc_expr(ExprKind::InterpString { parts }, pos));
                }
                other => {
                    let msg = format!(
                        "expected string continuation, found {}",
                        other.describe()
                    );
                    return Err(self.error_here(msg));
                }
            }
        }
    }

    // ----- types -----

    fn parse_type(&mut self) -> PResult<TypeRefId> {
        let pos = self.here();
        match self.peek().clone() {
            TokenKind::Star => {
                self.bump();
                let inner = self.parse_type()?;
                Ok(self.ast.alloc_type_ref(TypeRefKind::Ptr(inner), pos))
            }
            TokenKind::Question => {
                self.bump();
                let inner = self.parse_type()?;
                Ok(self.ast.alloc_type_ref(TypeRefKind::Optional(inner), pos))
            }
            TokenKind::LBracket => {
                self.bump();
                if self.eat(&TokenKind::RBracket) {
                    let elem = self.parse_type()?;
                    return Ok(self.ast.alloc_type_ref(TypeRefKind::Slice(elem), pos));
                }
                let len = match self.peek().clone() {
                    TokenKind::Int(v) if v >= 0 => {
                        self.bump();
                        v as u32
                    }
                    other => {
                        let msg =
                            format!("expected array length integer, found {}", other.describe());
                        return Err(self.error_here(msg));
                    }
                };
                self.expect(&TokenKind::RBracket)?;
                let elem = self.parse_type()?;
                Ok(self
                    .ast
                    .alloc_type_ref(TypeRefKind::Array { len, elem }, pos))
            }
            TokenKind::KwFn => {
                self.bump();
                self.expect(&TokenKind::LParen)?;
                let mut params = Vec::new();
                while !self.at(&TokenKind::RParen) {
                    params.push(self.parse_type()?);
                    if !self.eat(&TokenKind::Comma) {
                        break;
                    }
                }
                self.expect(&TokenKind::RParen)?;
                let ret = if self.at(&TokenKind::LBrace)
                    || self.at(&TokenKind::Comma)
                    || self.at(&TokenKind::RParen)
                    || self.at(&TokenKind::Gt)
                    || self.at(&TokenKind::RBracket)
                    || self.at(&TokenKind::Assign)
                {
                    None
                } else {
                    Some(self.parse_type()?)
                };
                Ok(self
                    .ast
                    .alloc_type_ref(TypeRefKind::Function { params, ret }, pos))
            }
            TokenKind::Ident(name) => {
                self.bump();
                if self.at(&TokenKind::Lt) {
                    self.bump();
                    let mut args = Vec::new();
                    while !self.at(&TokenKind::Gt) {
                        args.push(self.parse_type()?);
                        if !self.eat(&TokenKind::Comma) {
                            break;
                        }
                    }
                    self.expect(&TokenKind::Gt)?;
                    return Ok(self
                        .ast
                        .alloc_type_ref(TypeRefKind::Generic { name, args }, pos));
                }
                Ok(self.ast.alloc_type_ref(TypeRefKind::Named(name), pos))
            }
            other => {
                let msg = format!("expected type, found {}", other.describe());
                Err(self.error_here(msg))
            }
        }
    }
}

fn is_starter(kind: &TokenKind) -> bool {
    matches!(
        kind,
        TokenKind::KwFn
            | TokenKind::KwVar
            | TokenKind::KwConst
            | TokenKind::KwReturn
            | TokenKind::KwIf
            | TokenKind::KwWhile
            | TokenKind::KwFor
            | TokenKind::KwSwitch
            | TokenKind::KwLoop
            | TokenKind::KwDefer
            | TokenKind::KwTry
            | TokenKind::KwThrow
            | TokenKind::KwBreak
            | TokenKind::KwContinue
            | TokenKind::KwStruct
            | TokenKind::KwEnum
            | TokenKind::KwImpl
            | TokenKind::KwTrait
            | TokenKind::KwUnion
            | TokenKind::KwType
            | TokenKind::KwTest
            | TokenKind::KwImport
            | TokenKind::KwComptime
            | TokenKind::KwPub
    )
}

/// Tokens that can only begin a new statement, used to end a bare
/// `return` without a semicolon.
fn stmt_follows(kind: &TokenKind) -> bool {
    matches!(
        kind,
        TokenKind::KwVar
            | TokenKind::KwConst
            | TokenKind::KwReturn
            | TokenKind::KwIf
            | TokenKind::KwWhile
            | TokenKind::KwFor
            | TokenKind::KwSwitch
            | TokenKind::KwLoop
            | TokenKind::KwDefer
            | TokenKind::KwTry
            | TokenKind::KwThrow
            | TokenKind::KwBreak
            | TokenKind::KwContinue
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::tokenize;
    use crate::pos::FileId;

    fn parse_ok(src: &str) -> Program {
        let (program, diags) = parse(tokenize(src, FileId(0)));
        assert!(diags.is_empty(), "unexpected diagnostics: {diags:?}");
        program
    }

    fn parse_err(src: &str) -> Vec<Diagnostic> {
        let (_, diags) = parse(tokenize(src, FileId(0)));
        diags
    }

    #[test]
    fn parses_empty_source() {
        let program = parse_ok("");
        assert!(program.items.is_empty());
    }

    #[test]
    fn parses_constant_return() {
        let program = parse_ok("fn main() i64 { return 42 }");
        assert_eq!(program.items.len(), 1);
        let Item::Function(f) = &program.items[0] else {
            panic!("expected function");
        };
        assert_eq!(f.name, "main");
        assert!(f.ret.is_some());
    }

    #[test]
    fn precedence_puts_mul_above_add() {
        let program = parse_ok("fn main() i64 { return 1 + 2 * 3 }");
        let Item::Function(f) = &program.items[0] else {
            panic!("expected function");
        };
        let StmtKind::Block(stmts) = &program.ast.stmt(f.body).kind else {
            panic!("expected block");
        };
        let StmtKind::Return(Some(expr)) = &program.ast.stmt(stmts[0]).kind else {
            panic!("expected return");
        };
        let ExprKind::Binary { op, right, .. } = &program.ast.expr(*expr).kind else {
            panic!("expected binary");
        };
        assert_eq!(*op, BinaryOp::Add);
        assert!(matches!(
            program.ast.expr(*right).kind,
            ExprKind::Binary {
                op: BinaryOp::Mul,
                ..
            }
        ));
    }

    #[test]
    fn assignment_is_right_associative() {
        let program = parse_ok("fn f() { a = b = 1 }");
        let Item::Function(f) = &program.items[0] else {
            panic!("expected function");
        };
        let StmtKind::Block(stmts) = &program.ast.stmt(f.body).kind else {
            panic!("expected block");
        };
        let StmtKind::Expr(expr) = &program.ast.stmt(stmts[0]).kind else {
            panic!("expected expr stmt");
        };
        let ExprKind::Assign { value, .. } = &program.ast.expr(*expr).kind else {
            panic!("expected assign");
        };
        assert!(matches!(
            program.ast.expr(*value).kind,
            ExprKind::Assign { .. }
        ));
    }

    #[test]
    fn cast_binds_between_comparison_and_additive() {
        // `a + b as i64 < c` parses as `(a + (b as i64)) < c`.
        let program = parse_ok("fn f() { x = a + b as i64 < c }");
        let Item::Function(f) = &program.items[0] else {
            panic!()
        };
        let StmtKind::Block(stmts) = &program.ast.stmt(f.body).kind else {
            panic!()
        };
        let StmtKind::Expr(e) = &program.ast.stmt(stmts[0]).kind else {
            panic!()
        };
        let ExprKind::Assign { value, .. } = &program.ast.expr(*e).kind else {
            panic!()
        };
        let ExprKind::Binary { op, left, .. } = &program.ast.expr(*value).kind else {
            panic!("expected comparison at top")
        };
        assert_eq!(*op, BinaryOp::Lt);
        let ExprKind::Binary { op: add, right, .. } = &program.ast.expr(*left).kind else {
            panic!("expected addition under comparison")
        };
        assert_eq!(*add, BinaryOp::Add);
        assert!(matches!(program.ast.expr(*right).kind, ExprKind::Cast { .. }));
    }

    #[test]
    fn parses_struct_decl_and_dot_field_literal() {
        let program = parse_ok(
            "struct Foo { name: string, field_name: string }\n\
             fn main() i64 { var f = Foo{ .name = \"n\", .field_name = \"fn\" }\n return 0 }",
        );
        assert_eq!(program.items.len(), 2);
    }

    #[test]
    fn if_condition_does_not_eat_block_as_struct_literal() {
        let program = parse_ok("fn f(n: i64) i64 { if (n <= 1) { return n } return 2 }");
        let Item::Function(f) = &program.items[0] else {
            panic!()
        };
        let StmtKind::Block(stmts) = &program.ast.stmt(f.body).kind else {
            panic!()
        };
        assert_eq!(stmts.len(), 2);
        assert!(matches!(
            program.ast.stmt(stmts[0]).kind,
            StmtKind::If { .. }
        ));
    }

    #[test]
    fn parses_enum_with_payloads() {
        let program = parse_ok(
            "enum Shape { Point, Circle(f64), Rect { w: f64, h: f64 } }",
        );
        let Item::Enum(e) = &program.items[0] else {
            panic!()
        };
        assert_eq!(e.variants.len(), 3);
        assert!(matches!(e.variants[0].payload, VariantPayload::Unit));
        assert!(matches!(e.variants[1].payload, VariantPayload::Tuple(_)));
        assert!(matches!(e.variants[2].payload, VariantPayload::Struct(_)));
    }

    #[test]
    fn parses_switch_with_patterns() {
        let program = parse_ok(
            "fn f(s: Shape) i64 { switch s { Shape.Circle(r) => { return 1 } _ => { return 0 } } }",
        );
        let Item::Function(f) = &program.items[0] else {
            panic!()
        };
        let StmtKind::Block(stmts) = &program.ast.stmt(f.body).kind else {
            panic!()
        };
        let StmtKind::Switch { arms, .. } = &program.ast.stmt(stmts[0]).kind else {
            panic!("expected switch")
        };
        assert_eq!(arms.len(), 2);
        assert!(matches!(
            &arms[0].pattern,
            Pattern::Variant { bindings, .. } if bindings.len() == 1
        ));
        assert!(matches!(arms[1].pattern, Pattern::Wildcard));
    }

    #[test]
    fn parses_new_generic_and_method_calls() {
        let program = parse_ok(
            "fn main() i64 { var items = new List<*Item>\n items.push(new Item{ .name = \"x\", .value = 1 })\n var r = items.get(0)\n return 0 }",
        );
        assert_eq!(program.items.len(), 1);
    }

    #[test]
    fn parses_slice_expression() {
        let program = parse_ok("fn main() i64 { var s = \"hello\"\n println(s[0..1])\n return 0 }");
        assert_eq!(program.items.len(), 1);
    }

    #[test]
    fn parses_defer_try_catch_throw() {
        let program = parse_ok(
            "fn f() { defer cleanup()\n try { risky() } catch (e) { println(e) } throw 1 }",
        );
        assert_eq!(program.items.len(), 1);
    }

    #[test]
    fn parses_for_range_and_collection() {
        parse_ok("fn f() { for i in 0..10 { } for x in items { } }");
    }

    #[test]
    fn parses_trait_impl_union_alias_test_import_comptime() {
        let program = parse_ok(
            "trait Printable { fn print(self) }\n\
             impl Printable for Foo { fn print(self) { } }\n\
             union Raw { i: i64, f: f64 }\n\
             type Alias = *Foo\n\
             test \"smoke\" { }\n\
             import \"lib\" as lib\n\
             comptime { const X = 1 }",
        );
        assert_eq!(program.items.len(), 7);
    }

    #[test]
    fn parses_interpolated_string_expression() {
        let program = parse_ok("fn f(x: i64) string { return \"v=${x}!\" }");
        let Item::Function(f) = &program.items[0] else {
            panic!()
        };
        let StmtKind::Block(stmts) = &program.ast.stmt(f.body).kind else {
            panic!()
        };
        let StmtKind::Return(Some(e)) = &program.ast.stmt(stmts[0]).kind else {
            panic!()
        };
        let ExprKind::InterpString { parts } = &program.ast.expr(*e).kind else {
            panic!("expected interpolated string")
        };
        assert_eq!(parts.len(), 3);
    }

    #[test]
    fn unexpected_token_reports_and_recovers() {
        let diags = parse_err("fn f() { var = 3 }\nfn g() i64 { return 1 }");
        assert!(!diags.is_empty());
        let (program, _) = parse(tokenize(
            "fn f() { var = 3 }\nfn g() i64 { return 1 }",
            FileId(0),
        ));
        // The second function still parses after resynchronization.
        assert!(program
            .items
            .iter()
            .any(|i| matches!(i, Item::Function(f) if f.name == "g")));
    }

    #[test]
    fn optional_and_pointer_types_parse() {
        parse_ok("fn f(a: ?*Foo, b: []i64, c: [4]u8, d: fn(i64) bool) { }");
    }

    #[test]
    fn ternary_and_elvis_parse_at_assignment_precedence() {
        parse_ok("fn f(a: bool, b: i64) i64 { return a ? b : 0 }");
        parse_ok("fn f(a: ?i64) i64 { return a ?: 0 }");
    }
}
