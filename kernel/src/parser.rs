//! S-expression reader for kernel terms.
//!
//! The same syntax `Term`'s `Display` prints: de Bruijn indices are integers,
//! `Prop`/`Type` are sorts, any other symbol is a constant, and compound forms
//! are `(lam T b)`, `(pi T b)`, `(-> A B)`, `(app f a ...)`, `(let T v b)`,
//! `(sort l)`, `(const name l ...)` and `(? n)` for metavariables.

use crate::ast::{Level, MetaId, Term};
use std::fmt;
use std::iter::Peekable;
use std::str::Chars;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("Unexpected EOF")]
    UnexpectedEof,
    #[error("Unexpected character: {0}")]
    UnexpectedChar(char),
    #[error("Expected {0}")]
    Expected(String),
    #[error("Unknown token: {0}")]
    UnknownToken(String),
    #[error("Integer literal too large: {0}")]
    IntOverflow(String),
}

#[derive(Debug, PartialEq, Eq)]
enum Token {
    LParen,
    RParen,
    Symbol(String),
    Int(usize),
}

struct Lexer<'a> {
    chars: Peekable<Chars<'a>>,
}

impl<'a> Lexer<'a> {
    fn new(input: &'a str) -> Self {
        Lexer {
            chars: input.chars().peekable(),
        }
    }

    fn next_token(&mut self) -> Option<Result<Token, ParseError>> {
        self.skip_trivia();
        let c = self.chars.next()?;
        match c {
            '(' => Some(Ok(Token::LParen)),
            ')' => Some(Ok(Token::RParen)),
            c if c.is_ascii_digit() => {
                let mut s = String::new();
                s.push(c);
                while let Some(&c) = self.chars.peek() {
                    if c.is_ascii_digit() {
                        s.push(c);
                        self.chars.next();
                    } else {
                        break;
                    }
                }
                Some(s.parse().map(Token::Int).map_err(|_| ParseError::IntOverflow(s)))
            }
            c => {
                let mut s = String::new();
                s.push(c);
                while let Some(&c) = self.chars.peek() {
                    if !c.is_whitespace() && c != '(' && c != ')' && c != ';' {
                        s.push(c);
                        self.chars.next();
                    } else {
                        break;
                    }
                }
                Some(Ok(Token::Symbol(s)))
            }
        }
    }

    /// Whitespace and `;` line comments.
    fn skip_trivia(&mut self) {
        while let Some(&c) = self.chars.peek() {
            if c.is_whitespace() {
                self.chars.next();
            } else if c == ';' {
                while let Some(c) = self.chars.next() {
                    if c == '\n' {
                        break;
                    }
                }
            } else {
                break;
            }
        }
    }
}

/// A raw s-expression, before it is read as a term or a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sexp {
    Atom(String),
    Int(usize),
    List(Vec<Sexp>),
}

impl Sexp {
    pub fn as_atom(&self) -> Option<&str> {
        match self {
            Sexp::Atom(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<usize> {
        match self {
            Sexp::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Sexp]> {
        match self {
            Sexp::List(items) => Some(items),
            _ => None,
        }
    }

    /// `(head ...)` with an atom head.
    pub fn head(&self) -> Option<&str> {
        self.as_list().and_then(|items| items.first()).and_then(Sexp::as_atom)
    }
}

impl fmt::Display for Sexp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Sexp::Atom(s) => write!(f, "{}", s),
            Sexp::Int(n) => write!(f, "{}", n),
            Sexp::List(items) => {
                write!(f, "(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, ")")
            }
        }
    }
}

pub struct Parser<'a> {
    lexer: Lexer<'a>,
}

impl<'a> Parser<'a> {
    pub fn new(input: &'a str) -> Self {
        Parser {
            lexer: Lexer::new(input),
        }
    }

    /// Next s-expression, or `None` at end of input.
    pub fn next_sexp(&mut self) -> Result<Option<Sexp>, ParseError> {
        match self.lexer.next_token() {
            None => Ok(None),
            Some(token) => self.sexp_from(token?).map(Some),
        }
    }

    pub fn parse_sexp(&mut self) -> Result<Sexp, ParseError> {
        self.next_sexp()?.ok_or(ParseError::UnexpectedEof)
    }

    pub fn parse_term(&mut self) -> Result<Arc<Term>, ParseError> {
        let sexp = self.parse_sexp()?;
        term_from_sexp(&sexp)
    }

    fn sexp_from(&mut self, token: Token) -> Result<Sexp, ParseError> {
        match token {
            Token::Int(n) => Ok(Sexp::Int(n)),
            Token::Symbol(s) => Ok(Sexp::Atom(s)),
            Token::RParen => Err(ParseError::UnexpectedChar(')')),
            Token::LParen => {
                let mut items = Vec::new();
                loop {
                    match self.lexer.next_token() {
                        None => return Err(ParseError::UnexpectedEof),
                        Some(token) => match token? {
                            Token::RParen => return Ok(Sexp::List(items)),
                            other => items.push(self.sexp_from(other)?),
                        },
                    }
                }
            }
        }
    }
}

/// Read every s-expression in `input`.
pub fn parse_sexps(input: &str) -> Result<Vec<Sexp>, ParseError> {
    let mut parser = Parser::new(input);
    let mut out = Vec::new();
    while let Some(sexp) = parser.next_sexp()? {
        out.push(sexp);
    }
    Ok(out)
}

pub fn parse_term(input: &str) -> Result<Arc<Term>, ParseError> {
    let mut parser = Parser::new(input);
    let term = parser.parse_term()?;
    match parser.next_sexp()? {
        None => Ok(term),
        Some(extra) => Err(ParseError::UnknownToken(extra.to_string())),
    }
}

fn expect_args<'s>(items: &'s [Sexp], form: &str, arity: usize) -> Result<&'s [Sexp], ParseError> {
    let args = &items[1..];
    if args.len() != arity {
        return Err(ParseError::Expected(format!(
            "{} arguments to {}",
            arity, form
        )));
    }
    Ok(args)
}

pub fn term_from_sexp(sexp: &Sexp) -> Result<Arc<Term>, ParseError> {
    match sexp {
        Sexp::Int(n) => Ok(Term::var(*n)),
        Sexp::Atom(s) => match s.as_str() {
            "Prop" => Ok(Term::prop()),
            "Type" => Ok(Term::sort(Level::of_nat(1))),
            _ => Ok(Term::constant(s.clone())),
        },
        Sexp::List(items) => {
            let head = sexp
                .head()
                .ok_or_else(|| ParseError::Expected("form name".to_string()))?;
            match head {
                "lam" => {
                    let args = expect_args(items, head, 2)?;
                    Ok(Term::lam(term_from_sexp(&args[0])?, term_from_sexp(&args[1])?))
                }
                "pi" => {
                    let args = expect_args(items, head, 2)?;
                    Ok(Term::pi(term_from_sexp(&args[0])?, term_from_sexp(&args[1])?))
                }
                "->" => {
                    let args = expect_args(items, head, 2)?;
                    Ok(Term::arrow(term_from_sexp(&args[0])?, term_from_sexp(&args[1])?))
                }
                "let" => {
                    let args = expect_args(items, head, 3)?;
                    Ok(Arc::new(Term::LetE(
                        term_from_sexp(&args[0])?,
                        term_from_sexp(&args[1])?,
                        term_from_sexp(&args[2])?,
                    )))
                }
                "app" => {
                    if items.len() < 3 {
                        return Err(ParseError::Expected("function and arguments to app".to_string()));
                    }
                    let f = term_from_sexp(&items[1])?;
                    let args = items[2..]
                        .iter()
                        .map(term_from_sexp)
                        .collect::<Result<Vec<_>, _>>()?;
                    Ok(Term::apps(f, args))
                }
                "sort" => {
                    let args = expect_args(items, head, 1)?;
                    Ok(Term::sort(level_from_sexp(&args[0])?))
                }
                "const" => {
                    let name = items
                        .get(1)
                        .and_then(Sexp::as_atom)
                        .ok_or_else(|| ParseError::Expected("constant name".to_string()))?;
                    let levels = items[2..]
                        .iter()
                        .map(level_from_sexp)
                        .collect::<Result<Vec<_>, _>>()?;
                    Ok(Arc::new(Term::Const(name.to_string(), levels)))
                }
                "?" => {
                    let args = expect_args(items, head, 1)?;
                    let id = args[0]
                        .as_int()
                        .ok_or_else(|| ParseError::Expected("metavariable number".to_string()))?;
                    Ok(Term::meta(MetaId(id)))
                }
                other => Err(ParseError::UnknownToken(other.to_string())),
            }
        }
    }
}

pub fn level_from_sexp(sexp: &Sexp) -> Result<Level, ParseError> {
    match sexp {
        Sexp::Int(n) => Ok(Level::of_nat(*n)),
        Sexp::Atom(name) => Ok(Level::Param(name.clone())),
        Sexp::List(items) => match sexp.head() {
            Some("succ") => {
                let args = expect_args(items, "succ", 1)?;
                Ok(level_from_sexp(&args[0])?.succ())
            }
            Some(form @ ("max" | "imax")) => {
                let args = expect_args(items, form, 2)?;
                let a = Box::new(level_from_sexp(&args[0])?);
                let b = Box::new(level_from_sexp(&args[1])?);
                Ok(if form == "max" {
                    Level::Max(a, b)
                } else {
                    Level::IMax(a, b)
                })
            }
            Some(other) => Err(ParseError::UnknownToken(other.to_string())),
            None => Err(ParseError::Expected("level".to_string())),
        },
    }
}
