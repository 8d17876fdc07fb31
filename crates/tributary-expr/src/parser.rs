use winnow::ascii::{digit1, multispace0};
use winnow::combinator::{alt, opt};
use winnow::error::{ContextError, ErrMode, StrContext, StrContextValue};
use winnow::token::take_while;
use winnow::{ModalResult, Parser};

use tributary_types::TributaryError;

use crate::ast::*;

const KEYWORDS: &[&str] = &["and", "or", "not", "true", "false"];

fn make_cut_error(desc: &'static str) -> ErrMode<ContextError<StrContext>> {
    let mut e = ContextError::new();
    e.push(StrContext::Expected(StrContextValue::Description(desc)));
    ErrMode::Cut(e)
}

fn backtrack() -> ErrMode<ContextError<StrContext>> {
    ErrMode::Backtrack(ContextError::new())
}

/// Whitespace consumer (including newlines).
fn ws<'i>(input: &mut &'i str) -> ModalResult<&'i str> {
    multispace0.parse_next(input)
}

/// Parse an identifier: [A-Za-z_][A-Za-z0-9_]*
fn identifier<'i>(input: &mut &'i str) -> ModalResult<&'i str> {
    (
        take_while(1, |c: char| c.is_ascii_alphabetic() || c == '_'),
        take_while(0.., |c: char| c.is_ascii_alphanumeric() || c == '_'),
    )
        .take()
        .parse_next(input)
}

/// Consume `kw` only when it is a whole word, leaving the input untouched otherwise.
fn eat_keyword(input: &mut &str, kw: &str) -> bool {
    let start = *input;
    match identifier.parse_next(input) {
        Ok(word) if word == kw => true,
        _ => {
            *input = start;
            false
        }
    }
}

/// Consume a symbolic operator such as `&&`.
fn eat_symbol(input: &mut &str, symbol: &str) -> bool {
    if let Some(rest) = input.strip_prefix(symbol) {
        *input = rest;
        true
    } else {
        false
    }
}

/// Parse a number: optional '-', digits, optional fraction.
fn number(input: &mut &str) -> ModalResult<f64> {
    let s: &str = (opt('-'), digit1, opt(('.', digit1)))
        .take()
        .parse_next(input)?;
    s.parse().map_err(|_| backtrack())
}

fn compare_op(input: &mut &str) -> ModalResult<CompareOp> {
    alt((
        ">=".value(CompareOp::Ge),
        "<=".value(CompareOp::Le),
        "==".value(CompareOp::Eq),
        "!=".value(CompareOp::Ne),
        ">".value(CompareOp::Gt),
        "<".value(CompareOp::Lt),
    ))
    .parse_next(input)
}

/// Identifier, boolean literal, or a rejected keyword.
fn word(input: &mut &str) -> ModalResult<Expr> {
    let start = *input;
    let id = identifier.parse_next(input)?;
    match id {
        "true" => Ok(Expr::Bool(true)),
        "false" => Ok(Expr::Bool(false)),
        kw if KEYWORDS.contains(&kw) => {
            *input = start;
            Err(backtrack())
        }
        other => Ok(Expr::Ident(other.to_string())),
    }
}

fn parenthesized(input: &mut &str) -> ModalResult<Expr> {
    let _ = '('.parse_next(input)?;
    let inner = or_expr.parse_next(input)?;
    let _ = ws.parse_next(input)?;
    if !eat_symbol(input, ")") {
        return Err(make_cut_error("closing ')'"));
    }
    Ok(inner)
}

fn primary(input: &mut &str) -> ModalResult<Expr> {
    let _ = ws.parse_next(input)?;
    alt((parenthesized, number.map(Expr::Number), word))
        .context(StrContext::Expected(StrContextValue::Description("operand")))
        .parse_next(input)
}

/// primary ( op primary )?
fn comparison(input: &mut &str) -> ModalResult<Expr> {
    let left = primary.parse_next(input)?;
    let before_op = *input;
    let _ = ws.parse_next(input)?;
    match opt(compare_op).parse_next(input)? {
        Some(op) => {
            let right = primary
                .parse_next(input)
                .map_err(|_| make_cut_error("operand after comparison operator"))?;
            Ok(Expr::Compare {
                op,
                left: Box::new(left),
                right: Box::new(right),
            })
        }
        None => {
            *input = before_op;
            Ok(left)
        }
    }
}

/// ( 'not' | '!' ) unary | comparison
fn unary(input: &mut &str) -> ModalResult<Expr> {
    let _ = ws.parse_next(input)?;
    let negated = if input.starts_with('!') && !input.starts_with("!=") {
        *input = &input[1..];
        true
    } else {
        eat_keyword(input, "not")
    };
    if negated {
        let inner = unary.parse_next(input)?;
        return Ok(Expr::Not(Box::new(inner)));
    }
    comparison.parse_next(input)
}

/// unary ( ( 'and' | '&&' ) unary )*
fn and_expr(input: &mut &str) -> ModalResult<Expr> {
    let mut left = unary.parse_next(input)?;
    loop {
        let before = *input;
        let _ = ws.parse_next(input)?;
        if eat_symbol(input, "&&") || eat_keyword(input, "and") {
            let right = unary
                .parse_next(input)
                .map_err(|_| make_cut_error("operand after 'and'"))?;
            left = Expr::And(Box::new(left), Box::new(right));
        } else {
            *input = before;
            return Ok(left);
        }
    }
}

/// and_expr ( ( 'or' | '||' ) and_expr )*
fn or_expr(input: &mut &str) -> ModalResult<Expr> {
    let mut left = and_expr.parse_next(input)?;
    loop {
        let before = *input;
        let _ = ws.parse_next(input)?;
        if eat_symbol(input, "||") || eat_keyword(input, "or") {
            let right = and_expr
                .parse_next(input)
                .map_err(|_| make_cut_error("operand after 'or'"))?;
            left = Expr::Or(Box::new(left), Box::new(right));
        } else {
            *input = before;
            return Ok(left);
        }
    }
}

fn syntax_error(source: &str, remaining: &str, message: impl Into<String>) -> TributaryError {
    TributaryError::ExpressionError {
        expression: source.to_string(),
        offset: source.len() - remaining.len(),
        message: message.into(),
    }
}

/// Parse a condition expression into an [`Expr`].
///
/// Grammar:
/// ```text
/// Or         ::= And ( ('or' | '||') And )*
/// And        ::= Unary ( ('and' | '&&') Unary )*
/// Unary      ::= ('not' | '!') Unary | Comparison
/// Comparison ::= Primary ( ('<' | '<=' | '>' | '>=' | '==' | '!=') Primary )?
/// Primary    ::= Number | 'true' | 'false' | Identifier | '(' Or ')'
/// ```
pub fn parse(source: &str) -> std::result::Result<Expr, TributaryError> {
    if source.trim().is_empty() {
        return Err(syntax_error(source, source, "empty expression"));
    }

    let mut remaining = source;
    let expr = or_expr
        .parse_next(&mut remaining)
        .map_err(|e| syntax_error(source, remaining, format!("{e}")))?;

    let _ = ws
        .parse_next(&mut remaining)
        .map_err(|e| syntax_error(source, remaining, format!("{e}")))?;
    if !remaining.is_empty() {
        let snippet: String = remaining.chars().take(20).collect();
        return Err(syntax_error(
            source,
            remaining,
            format!("unexpected trailing input '{snippet}'"),
        ));
    }
    Ok(expr)
}
