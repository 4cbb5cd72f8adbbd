// Tokenizer for the sheet source format.
//
// Statements are terminated by newlines or semicolons, so both come out
// as end-of-statement tokens. Errors are collected into the diagnostic
// sink and lexing continues where possible, except for an unterminated
// string which ends the stream.

use std::path::Path;

use regex::Regex;

use crate::error::{Diagnostics, ErrorKind};


#[derive(Clone, Debug, PartialEq)]
pub enum Token {
    Name(String),

    // Declared-type keywords.
    KwExecution,
    KwInteger,
    KwFloat,
    KwString,
    KwBoolean,

    // Literals.
    IntLit(i64),
    FloatLit(f64),
    StrLit(String),
    BoolLit(bool),

    // Statement symbols.
    Wire(String), // #name
    Output,       // ~
    Comma,
    Or, // |

    // End of statement: newline or semicolon.
    Eos,

    // Collection brackets.
    LParen,
    RParen,
    LProperty,
    RProperty,
    LArray,
    RArray,
}


#[derive(Clone, Debug, PartialEq)]
pub struct Lexeme {
    pub tok: Token,
    pub line: usize,
}


lazy_static! {
    static ref HEX_REGEX: Regex = Regex::new(r"^0[xX][0-9a-fA-F]+$").unwrap();
    static ref OCTAL_REGEX: Regex = Regex::new(r"^0[0-7]+$").unwrap();
    static ref INT_REGEX: Regex = Regex::new(r"^-?[0-9]+$").unwrap();
    static ref FLOAT_REGEX: Regex = Regex::new(r"^-?[0-9]*\.[0-9]+$").unwrap();
}


fn is_name_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

fn is_number_char(c: char) -> bool {
    c.is_ascii_hexdigit() || c == '.' || c == 'x' || c == 'X'
}


// Classify a word that starts with a digit or a minus sign.
fn number_token(word: &str) -> Option<Token> {
    if HEX_REGEX.is_match(word) {
        i64::from_str_radix(&word[2..], 16).ok().map(Token::IntLit)
    } else if OCTAL_REGEX.is_match(word) {
        i64::from_str_radix(&word[1..], 8).ok().map(Token::IntLit)
    } else if INT_REGEX.is_match(word) {
        word.parse().ok().map(Token::IntLit)
    } else if FLOAT_REGEX.is_match(word) {
        word.parse().ok().map(Token::FloatLit)
    } else {
        None
    }
}

fn name_token(word: &str) -> Token {
    match word {
        "Execution" => Token::KwExecution,
        "Integer" => Token::KwInteger,
        "Float" => Token::KwFloat,
        "String" => Token::KwString,
        "Boolean" => Token::KwBoolean,
        "true" => Token::BoolLit(true),
        "false" => Token::BoolLit(false),
        _ => Token::Name(String::from(word)),
    }
}


pub struct Lexer<'a> {
    source: &'a [u8],
    path: &'a Path,
    pos: usize,
    line: usize,
}

impl<'a> Lexer<'a> {
    pub fn new(source: &'a str, path: &'a Path) -> Lexer<'a> {
        Lexer {
            source: source.as_bytes(),
            path,
            pos: 0,
            line: 1,
        }
    }

    fn peek(&self) -> Option<u8> {
        self.source.get(self.pos).copied()
    }

    fn take_while(&mut self, pred: fn(char) -> bool) -> String {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if pred(c as char) {
                self.pos += 1;
            } else {
                break;
            }
        }
        String::from_utf8_lossy(&self.source[start..self.pos]).into_owned()
    }

    // A string literal, starting at the opening quote. The raw bytes
    // are collected as-is and decoded as UTF-8 in one go at the
    // closing quote, so multi-byte sequences survive intact. Returns
    // None and reports if the literal crosses end-of-input.
    fn string_literal(&mut self, diags: &mut Diagnostics) -> Option<String> {
        self.pos += 1; // opening quote
        let mut raw: Vec<u8> = Vec::new();
        loop {
            match self.peek() {
                None => {
                    diags.add(
                        ErrorKind::Lex,
                        self.path,
                        self.line,
                        "unterminated string literal",
                    );
                    return None;
                }
                Some(b'"') => {
                    self.pos += 1;
                    return match String::from_utf8(raw) {
                        Ok(text) => Some(text),
                        Err(error) => {
                            diags.add(
                                ErrorKind::Lex,
                                self.path,
                                self.line,
                                "string literal is not valid UTF-8",
                            );
                            Some(
                                String::from_utf8_lossy(error.as_bytes())
                                    .into_owned(),
                            )
                        }
                    };
                }
                Some(b'\\') => {
                    self.pos += 1;
                    let escape = self.peek();
                    self.pos += 1;
                    match escape {
                        Some(b'n') => raw.push(b'\n'),
                        Some(b't') => raw.push(b'\t'),
                        Some(b'\\') => raw.push(b'\\'),
                        Some(b'"') => raw.push(b'"'),
                        other => {
                            diags.add(
                                ErrorKind::Lex,
                                self.path,
                                self.line,
                                &format!(
                                    "unknown escape sequence \\{}",
                                    other.map(|c| c as char).unwrap_or(' ')
                                ),
                            );
                        }
                    }
                }
                Some(b'\n') => {
                    diags.add(
                        ErrorKind::Lex,
                        self.path,
                        self.line,
                        "unterminated string literal",
                    );
                    return None;
                }
                Some(byte) => {
                    raw.push(byte);
                    self.pos += 1;
                }
            }
        }
    }

    pub fn run(mut self, diags: &mut Diagnostics) -> Vec<Lexeme> {
        let mut out = Vec::new();
        while let Some(c) = self.peek() {
            let line = self.line;
            let tok = match c {
                b'\n' => {
                    self.pos += 1;
                    self.line += 1;
                    Some(Token::Eos)
                }
                b' ' | b'\t' | b'\r' => {
                    self.pos += 1;
                    None
                }
                b';' => {
                    self.pos += 1;
                    Some(Token::Eos)
                }
                b'~' => {
                    self.pos += 1;
                    Some(Token::Output)
                }
                b',' => {
                    self.pos += 1;
                    Some(Token::Comma)
                }
                b'|' => {
                    self.pos += 1;
                    Some(Token::Or)
                }
                b'(' => {
                    self.pos += 1;
                    Some(Token::LParen)
                }
                b')' => {
                    self.pos += 1;
                    Some(Token::RParen)
                }
                b'[' => {
                    self.pos += 1;
                    Some(Token::LProperty)
                }
                b']' => {
                    self.pos += 1;
                    Some(Token::RProperty)
                }
                b'{' => {
                    self.pos += 1;
                    Some(Token::LArray)
                }
                b'}' => {
                    self.pos += 1;
                    Some(Token::RArray)
                }
                b'"' => match self.string_literal(diags) {
                    Some(s) => Some(Token::StrLit(s)),
                    None => return out,
                },
                b'#' => {
                    self.pos += 1;
                    let name = self.take_while(is_name_char);
                    if name.is_empty() {
                        diags.add(
                            ErrorKind::Lex,
                            self.path,
                            line,
                            "expected a wire name after '#'",
                        );
                        None
                    } else {
                        Some(Token::Wire(name))
                    }
                }
                c if (c as char).is_ascii_digit() || c == b'-' => {
                    self.pos += 1;
                    let rest = self.take_while(is_number_char);
                    let word = format!("{}{}", (c as char), rest);
                    match number_token(&word) {
                        Some(tok) => Some(tok),
                        None => {
                            diags.add(
                                ErrorKind::Lex,
                                self.path,
                                line,
                                &format!("invalid numeric literal '{}'", word),
                            );
                            None
                        }
                    }
                }
                c if is_name_start(c as char) => {
                    let word = self.take_while(is_name_char);
                    Some(name_token(&word))
                }
                c => {
                    self.pos += 1;
                    diags.add(
                        ErrorKind::Lex,
                        self.path,
                        line,
                        &format!("invalid character '{}'", c as char),
                    );
                    None
                }
            };
            if let Some(tok) = tok {
                out.push(Lexeme { tok, line });
            }
        }
        out
    }
}

pub fn lex(source: &str, path: &Path, diags: &mut Diagnostics) -> Vec<Lexeme> {
    Lexer::new(source, path).run(diags)
}
