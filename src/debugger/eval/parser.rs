//! Parser for the adapter's extended expression mini-language:
//!
//! ```text
//! expr   := ARRAY_EXPR | SIMPLE_EXPR
//! ARRAY_EXPR  := ("by" | "wo" | "dwo") "(" identifier ")" [ "," param ] [ "," param ]
//! SIMPLE_EXPR := identifier [ "," format ]
//! param  := count:int | format
//! format := 'h' | 'd' | 'u' | 'b' | 'c'
//! ```
//!
//! Anything outside this grammar is handed to the engine's own (MASM)
//! evaluator untouched.

use chumsky::error::Rich;
use chumsky::prelude::{any, choice, end, just};
use chumsky::{IterParser, Parser, extra};

type Err<'a> = extra::Err<Rich<'a, char>>;

/// Element width of an array read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    Byte,
    Word,
    Dword,
}

impl Width {
    pub fn element_size(self) -> usize {
        match self {
            Width::Byte => 1,
            Width::Word => 2,
            Width::Dword => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Format {
    #[default]
    Hex,
    Signed,
    Unsigned,
    Binary,
    Char,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvalExpr {
    /// Typed memory read at the address the identifier evaluates to.
    Array {
        width: Width,
        base: String,
        count: Option<u32>,
        format: Format,
    },
    /// Engine-evaluated scalar with an optional format flag.
    Simple {
        expression: String,
        format: Option<Format>,
    },
}

/// Inputs recognizably in the extended grammar but malformed. Each variant
/// maps to the literal diagnostic returned as the evaluate result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExprError {
    InvalidPrefix,
    MissingParen,
    InvalidParameter,
    InvalidFormat,
    CharRequiresBytes,
}

impl ExprError {
    pub fn diagnostic(self) -> &'static str {
        match self {
            ExprError::InvalidPrefix => "<Invalid data type prefix>",
            ExprError::MissingParen => "<Missing closing parenthesis>",
            ExprError::InvalidParameter => "<Invalid parameter>",
            ExprError::InvalidFormat => "<Invalid format>",
            ExprError::CharRequiresBytes => "<Char format (c) can only be applied to bytes (by)>",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParseResult {
    Parsed(EvalExpr),
    Malformed(ExprError),
    /// Not in the extended grammar; let the engine evaluator try.
    Foreign,
}

enum Raw<'a> {
    Call {
        prefix: &'a str,
        base: &'a str,
        closed: bool,
        params: Vec<&'a str>,
    },
    Plain {
        expression: &'a str,
        params: Vec<&'a str>,
    },
}

fn token<'a>() -> impl Parser<'a, &'a str, &'a str, Err<'a>> + Clone {
    any()
        .filter(|c: &char| {
            c.is_ascii_alphanumeric() || matches!(*c, '_' | '!' | '@' | '$' | '?')
        })
        .repeated()
        .at_least(1)
        .to_slice()
        .padded()
        .labelled("identifier")
}

fn raw<'a>() -> impl Parser<'a, &'a str, Raw<'a>, Err<'a>> {
    let params = just(',')
        .padded()
        .ignore_then(token())
        .repeated()
        .collect::<Vec<_>>();

    let call = token()
        .then(
            just('(')
                .padded()
                .ignore_then(token())
                .then(just(')').padded().or_not()),
        )
        .then(params.clone())
        .then_ignore(end())
        .map(|((prefix, (base, close)), params)| Raw::Call {
            prefix,
            base,
            closed: close.is_some(),
            params,
        });

    let plain = token()
        .then(params)
        .then_ignore(end())
        .map(|(expression, params)| Raw::Plain { expression, params });

    choice((call, plain))
}

fn format_flag(param: &str) -> Result<Format, ExprError> {
    match param {
        "h" => Ok(Format::Hex),
        "d" => Ok(Format::Signed),
        "u" => Ok(Format::Unsigned),
        "b" => Ok(Format::Binary),
        "c" => Ok(Format::Char),
        _ => Err(ExprError::InvalidFormat),
    }
}

fn analyze(raw: Raw) -> Result<EvalExpr, ExprError> {
    match raw {
        Raw::Call {
            prefix,
            base,
            closed,
            params,
        } => {
            let width = match prefix {
                "by" => Width::Byte,
                "wo" => Width::Word,
                "dwo" => Width::Dword,
                _ => return Err(ExprError::InvalidPrefix),
            };
            if !closed {
                return Err(ExprError::MissingParen);
            }

            let mut count = None;
            let mut format = None;
            for param in params {
                if param.chars().all(|c| c.is_ascii_digit()) {
                    if count.is_some() {
                        return Err(ExprError::InvalidParameter);
                    }
                    count = Some(param.parse().map_err(|_| ExprError::InvalidParameter)?);
                } else if param.len() == 1 {
                    if format.is_some() {
                        return Err(ExprError::InvalidParameter);
                    }
                    format = Some(format_flag(param)?);
                } else {
                    return Err(ExprError::InvalidParameter);
                }
            }

            let format = format.unwrap_or_default();
            if format == Format::Char && width != Width::Byte {
                return Err(ExprError::CharRequiresBytes);
            }

            Ok(EvalExpr::Array {
                width,
                base: base.to_string(),
                count,
                format,
            })
        }
        Raw::Plain { expression, params } => {
            let format = match params.as_slice() {
                [] => None,
                [param] => Some(format_flag(param)?),
                _ => return Err(ExprError::InvalidParameter),
            };
            Ok(EvalExpr::Simple {
                expression: expression.to_string(),
                format,
            })
        }
    }
}

pub fn parse(input: &str) -> ParseResult {
    match raw().parse(input).into_result() {
        Ok(raw) => match analyze(raw) {
            Ok(expr) => ParseResult::Parsed(expr),
            Err(err) => ParseResult::Malformed(err),
        },
        Err(_) => ParseResult::Foreign,
    }
}
