// Statement parser.
//
// The grammar is line-oriented: a statement is either a property
// `[Name(args)]` or a node placement `Name(args)~#out, ...`, ended by a
// newline or semicolon. On an unexpected token the parser reports a
// SyntaxError and resynchronizes at the next end-of-statement.

use std::path::Path;

use crate::ast::{Arg, NodeStmt, PropertyStmt, SyntaxTree};
use crate::error::{Diagnostics, ErrorKind};
use crate::lexer::{Lexeme, Token};
use crate::types;


struct Parser<'a> {
    lexemes: &'a [Lexeme],
    path: &'a Path,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&'a Token> {
        self.lexemes.get(self.pos).map(|l| &l.tok)
    }

    fn line(&self) -> usize {
        self.lexemes
            .get(self.pos)
            .or_else(|| self.lexemes.last())
            .map(|l| l.line)
            .unwrap_or(1)
    }

    fn bump(&mut self) -> Option<&'a Token> {
        let tok = self.peek();
        self.pos += 1;
        tok
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn error(&self, diags: &mut Diagnostics, message: &str) {
        diags.add(ErrorKind::Syntax, self.path, self.line(), message);
    }

    // Skip to just past the next end-of-statement.
    fn resync(&mut self) {
        while let Some(tok) = self.bump() {
            if *tok == Token::Eos {
                break;
            }
        }
    }

    fn expect(&mut self, expected: &Token, diags: &mut Diagnostics) -> bool {
        if self.eat(expected) {
            true
        } else {
            self.error(diags, &format!("expected {:?}", expected));
            false
        }
    }

    // A parenthesized, comma-separated argument list.
    fn args(&mut self, diags: &mut Diagnostics) -> Option<Vec<Arg>> {
        if !self.expect(&Token::LParen, diags) {
            return None;
        }
        let mut out = Vec::new();
        if self.eat(&Token::RParen) {
            return Some(out);
        }
        loop {
            let arg = match self.peek() {
                Some(Token::IntLit(v)) => Arg::Literal(types::LitValue::Int(*v)),
                Some(Token::FloatLit(v)) => Arg::Literal(types::LitValue::Float(*v)),
                Some(Token::StrLit(v)) => Arg::Literal(types::LitValue::Str(v.clone())),
                Some(Token::BoolLit(v)) => Arg::Literal(types::LitValue::Bool(*v)),
                Some(Token::Wire(name)) => Arg::Wire(name.clone()),
                Some(Token::Name(name)) => Arg::Name(name.clone()),
                Some(tok) if types::from_lex(tok).is_some() => {
                    Arg::Type(types::from_lex(tok).unwrap())
                }
                _ => {
                    self.error(diags, "expected an argument");
                    return None;
                }
            };
            self.pos += 1;
            out.push(arg);
            if self.eat(&Token::RParen) {
                return Some(out);
            }
            if !self.expect(&Token::Comma, diags) {
                return None;
            }
        }
    }

    // The `~#a, #b` output list. Trailing outputs may be left unnamed.
    fn outputs(&mut self, diags: &mut Diagnostics) -> Option<Vec<String>> {
        let mut out = Vec::new();
        if !self.eat(&Token::Output) {
            return Some(out);
        }
        loop {
            match self.peek() {
                Some(Token::Wire(name)) => {
                    out.push(name.clone());
                    self.pos += 1;
                }
                _ => {
                    self.error(diags, "expected a wire name after '~'");
                    return None;
                }
            }
            if !self.eat(&Token::Comma) {
                return Some(out);
            }
        }
    }

    fn property(&mut self, diags: &mut Diagnostics) -> Option<PropertyStmt> {
        let line = self.line();
        self.pos += 1; // '['
        let name = match self.peek() {
            Some(Token::Name(name)) => {
                self.pos += 1;
                name.clone()
            }
            _ => {
                self.error(diags, "expected a property name");
                return None;
            }
        };
        let args = self.args(diags)?;
        if !self.expect(&Token::RProperty, diags) {
            return None;
        }
        Some(PropertyStmt { name, args, line })
    }

    fn node(&mut self, diags: &mut Diagnostics) -> Option<NodeStmt> {
        let line = self.line();
        let name = match self.peek() {
            Some(Token::Name(name)) => {
                self.pos += 1;
                name.clone()
            }
            _ => {
                self.error(diags, "expected a node name");
                return None;
            }
        };
        let args = self.args(diags)?;
        let outputs = self.outputs(diags)?;
        Some(NodeStmt {
            name,
            args,
            outputs,
            line,
        })
    }

    fn run(&mut self, diags: &mut Diagnostics) -> SyntaxTree {
        let mut tree = SyntaxTree::default();
        while let Some(tok) = self.peek() {
            match tok {
                Token::Eos => {
                    self.pos += 1;
                }
                Token::LProperty => match self.property(diags) {
                    Some(stmt) => {
                        tree.properties.push(stmt);
                        if !self.eat(&Token::Eos) && self.peek().is_some() {
                            self.error(diags, "expected end of statement");
                            self.resync();
                        }
                    }
                    None => self.resync(),
                },
                Token::Name(_) => match self.node(diags) {
                    Some(stmt) => {
                        tree.nodes.push(stmt);
                        if !self.eat(&Token::Eos) && self.peek().is_some() {
                            self.error(diags, "expected end of statement");
                            self.resync();
                        }
                    }
                    None => self.resync(),
                },
                tok => {
                    self.error(diags, &format!("unexpected token {:?}", tok));
                    self.resync();
                }
            }
        }
        tree
    }
}


pub fn parse(lexemes: &[Lexeme], path: &Path, diags: &mut Diagnostics) -> SyntaxTree {
    Parser {
        lexemes,
        path,
        pos: 0,
    }
    .run(diags)
}
