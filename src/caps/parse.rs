//! Textual caps parser using winnow.
//!
//! Parses descriptions like:
//!
//! ```text
//! video/raw, format={I420, NV12}, width=[16, 4096], framerate=30/1
//! audio/raw, rate=(int)48000; audio/encoded
//! format=A
//! ANY
//! ```
//!
//! # Syntax
//!
//! - Structures are separated by `;`
//! - A structure is an optional media type name followed by `, field=value` pairs
//! - Values are scalars, `[min, max]` ranges or `{a, b, c}` lists
//! - Scalars are integers, fractions (`30/1`), booleans, quoted or bare strings
//! - A scalar may carry a type cast: `(int)`, `(string)`, `(fraction)`, `(boolean)`

use super::{Caps, CapsValue, Fraction, Structure, Value};
use super::value::is_bare_char;
use crate::error::{Error, Result};
use winnow::Parser;
use winnow::ascii::multispace0;
use winnow::combinator::{alt, delimited, opt, separated};
use winnow::error::ContextError;
use winnow::token::{take_till, take_while};

type WResult<T> = std::result::Result<T, ContextError>;

/// Parse a caps description.
///
/// # Example
///
/// ```rust
/// use sluice::caps::parse_caps;
///
/// let caps = parse_caps("audio/raw, rate=[8000, 48000]; audio/encoded").unwrap();
/// assert_eq!(caps.size(), 2);
/// ```
pub fn parse_caps(input: &str) -> Result<Caps> {
    caps.parse(input.trim())
        .map_err(|e| Error::CapsParse(format!("{e}")))
}

fn caps(input: &mut &str) -> WResult<Caps> {
    let special = opt(alt(("ANY", "EMPTY", "NONE"))).parse_next(input)?;
    match special {
        Some("ANY") => return Ok(Caps::new_any()),
        Some(_) => return Ok(Caps::new_empty()),
        None => {}
    }

    let structures: Vec<Structure> = separated(1.., structure, ws(';')).parse_next(input)?;
    let _ = multispace0.parse_next(input)?;

    let mut out = Caps::new_empty();
    for s in structures {
        out.append_structure(s);
    }
    Ok(out)
}

/// Wrap a single-character separator in optional whitespace.
fn ws<'a>(c: char) -> impl Parser<&'a str, char, ContextError> {
    delimited(multispace0, c, multispace0)
}

fn structure(input: &mut &str) -> WResult<Structure> {
    let _ = multispace0.parse_next(input)?;

    // The name is optional; a leading `key=` means the structure is unnamed.
    let checkpoint = *input;
    let mut s = match name.parse_next(input) {
        Ok(n) if !input.trim_start().starts_with('=') => Structure::new(n),
        _ => {
            *input = checkpoint;
            let (key, value) = field.parse_next(input)?;
            Structure::new("").field(key, value)
        }
    };

    loop {
        let checkpoint = *input;
        if ws(',').parse_next(input).is_err() {
            *input = checkpoint;
            break;
        }
        let (key, value) = field.parse_next(input)?;
        s.set(key, value);
    }
    Ok(s)
}

fn name<'a>(input: &mut &'a str) -> WResult<&'a str> {
    take_while(1.., |c: char| c.is_alphanumeric() || matches!(c, '/' | '-' | '_' | '.' | '+'))
        .parse_next(input)
}

fn field(input: &mut &str) -> WResult<(String, CapsValue<Value>)> {
    let key: &str = take_while(1.., |c: char| c.is_alphanumeric() || matches!(c, '-' | '_' | '.'))
        .parse_next(input)?;
    let _ = ws('=').parse_next(input)?;
    let value = alt((range, list, scalar.map(CapsValue::Fixed))).parse_next(input)?;
    Ok((key.to_string(), value))
}

fn range(input: &mut &str) -> WResult<CapsValue<Value>> {
    let _ = '['.parse_next(input)?;
    let _ = multispace0.parse_next(input)?;
    let min = scalar.parse_next(input)?;
    let _ = ws(',').parse_next(input)?;
    let max = scalar.parse_next(input)?;
    let _ = multispace0.parse_next(input)?;
    let _ = ']'.parse_next(input)?;

    let rangeable = matches!(
        (&min, &max),
        (Value::Int(_), Value::Int(_)) | (Value::Fraction(_), Value::Fraction(_))
    );
    if !rangeable || min > max {
        return Err(ContextError::new());
    }
    if min == max {
        return Ok(CapsValue::Fixed(min));
    }
    Ok(CapsValue::Range { min, max })
}

fn list(input: &mut &str) -> WResult<CapsValue<Value>> {
    let _ = '{'.parse_next(input)?;
    let _ = multispace0.parse_next(input)?;
    let values: Vec<Value> = separated(1.., scalar, ws(',')).parse_next(input)?;
    let _ = multispace0.parse_next(input)?;
    let _ = '}'.parse_next(input)?;

    if values.iter().any(|v| v.kind() != values[0].kind()) {
        return Err(ContextError::new());
    }
    Ok(CapsValue::from(values))
}

fn scalar(input: &mut &str) -> WResult<Value> {
    let cast = opt(delimited(
        '(',
        take_while(1.., |c: char| c.is_ascii_alphabetic()),
        ')',
    ))
    .parse_next(input)?;

    let (token, quoted) = alt((
        quoted_string.map(|s| (s, true)),
        take_while(1.., is_bare_char).map(|s: &str| (s.to_string(), false)),
    ))
    .parse_next(input)?;

    match cast {
        Some("string" | "str" | "s") => Ok(Value::Str(token)),
        Some("int" | "i") => token
            .parse()
            .map(Value::Int)
            .map_err(|_| ContextError::new()),
        Some("fraction") => parse_fraction(&token)
            .map(Value::Fraction)
            .ok_or_else(ContextError::new),
        Some("boolean" | "bool" | "b") => match token.as_str() {
            "true" | "yes" | "1" => Ok(Value::Bool(true)),
            "false" | "no" | "0" => Ok(Value::Bool(false)),
            _ => Err(ContextError::new()),
        },
        Some(_) => Err(ContextError::new()),
        None if quoted => Ok(Value::Str(token)),
        None => Ok(classify(token)),
    }
}

fn quoted_string(input: &mut &str) -> WResult<String> {
    delimited('"', take_till(0.., '"'), '"')
        .map(|s: &str| s.to_string())
        .parse_next(input)
}

fn parse_fraction(token: &str) -> Option<Fraction> {
    let (num, den) = token.split_once('/')?;
    let num: i32 = num.parse().ok()?;
    let den: i32 = den.parse().ok()?;
    Fraction::new(num, den).ok()
}

/// Infer the type of an uncast bare token.
fn classify(token: String) -> Value {
    if let Ok(v) = token.parse::<i64>() {
        return Value::Int(v);
    }
    if let Some(f) = parse_fraction(&token) {
        return Value::Fraction(f);
    }
    match token.as_str() {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        _ => Value::Str(token),
    }
}
