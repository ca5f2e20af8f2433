//! # Query Parser Module
//!
//! This module parses tag query strings into [`TagQueryExpr`] trees.
//! It supports boolean logic with `AND`, `OR` and `NOT` (or `-`), implicit conjunction
//! by juxtaposition, parenthesized grouping, tag references optionally prefixed by a
//! tag-type symbol, and pseudo-tag invocations.
//!
//! ## Supported Expressions
//!
//! - **Tag**: a label made of alphanumeric characters and `_`, e.g. `cat`.
//! - **Typed tag**: a single tag-type symbol immediately followed by a label, e.g. `%cat`.
//! - **Pseudo-tag**: the `#` marker followed by a name, e.g. `#no_tags`, optionally with an
//!   argument: `#ext:png`, `#name:"IMG_\d+"`. A quoted argument may be followed by `i`
//!   (case-insensitive) or `s` (case-sensitive).
//!
//! Whether a pseudo-tag name actually exists is not checked here; see
//! [`crate::pseudo_tag::PseudoTagRegistry::validate`].
//!
//! ## Example Usage
//!
//! ```rust
//! # use pictag::parser::parse_query;
//! # use pictag::query::TagQueryExpr;
//! let input = "cat (cute OR NOT dog) -#no_file";
//! assert_eq!(
//!     TagQueryExpr::tag("cat")
//!         .and(TagQueryExpr::tag("cute").or(TagQueryExpr::not(TagQueryExpr::tag("dog"))))
//!         .and(TagQueryExpr::not(TagQueryExpr::flag("no_file"))),
//!     parse_query(input).unwrap()
//! );
//! ```

use crate::query::{PseudoTagArg, TagQueryExpr};
use nom::{
    IResult, Parser,
    branch::alt,
    bytes::complete::{tag as t, take_while1},
    character::complete::{char, multispace0, one_of, satisfy},
    combinator::{cut, not, opt, verify},
    multi::many0,
    sequence::{delimited, preceded, terminated},
};
use std::fmt::Display;
use thiserror::Error;

/// Marks the start of a pseudo-tag invocation.
pub const PSEUDO_TAG_MARKER: char = '#';

/// Characters with a meaning of their own in the query language.
pub const RESERVED_CHARS: [char; 6] = [PSEUDO_TAG_MARKER, '(', ')', '"', ':', '-'];

const KEYWORDS: [&str; 3] = ["AND", "OR", "NOT"];

/// Maximum number of groups and negations a query may nest.
pub const MAX_NESTING: usize = 64;

/// Whether `c` may appear in a tag label.
pub fn is_label_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// Whether `c` may be used as a tag-type symbol.
pub fn is_type_symbol(c: char) -> bool {
    !c.is_whitespace() && !is_label_char(c) && !RESERVED_CHARS.contains(&c)
}

/// Whether `word` is one of the query language's keywords.
pub fn is_keyword(word: &str) -> bool {
    KEYWORDS.contains(&word)
}

// <query>   ::= <or>
// <or>      ::= <and> { "OR" <and> }
// <and>     ::= <unary> { ["AND"] <unary> }
// <unary>   ::= ("NOT" | "-") <unary> | <atom>
// <atom>    ::= "(" <query> ")" | <pseudo> | [<symbol>] <label>
// <pseudo>  ::= "#" <name> [ ":" <arg> ]
// <arg>     ::= '"' <escaped> '"' ["i" | "s"] | <token>
pub fn parse_query(input: &str) -> Result<TagQueryExpr, ParseErrorDetail> {
    let (rest, query) = or_expr(input, 0).map_err(|e| match e {
        nom::Err::Error(e) | nom::Err::Failure(e) => e,
        nom::Err::Incomplete(_) => ParseErrorDetail::new(ParseErrorKind::ExpectedExpr, input),
    })?;

    let rest = rest.trim_start();
    if rest.starts_with(')') {
        return Err(ParseErrorDetail::new(
            ParseErrorKind::UnbalancedParenthesis,
            rest,
        ));
    }
    if !rest.is_empty() {
        return Err(ParseErrorDetail::new(ParseErrorKind::UnexpectedToken, rest));
    }

    Ok(query)
}

// `depth` counts the groups and negations enclosing the current position.
fn or_expr(input: &str, depth: usize) -> IResult<&str, TagQueryExpr, ParseErrorDetail> {
    let (input, init) = and_expr(input, depth)?;
    many0(preceded(ws(keyword("OR")), |i| and_expr(i, depth)))
        .parse(input)
        .map(|(input, rest)| {
            let expr = rest.into_iter().fold(init, |acc, e| acc.or(e));
            (input, expr)
        })
}

fn and_expr(input: &str, depth: usize) -> IResult<&str, TagQueryExpr, ParseErrorDetail> {
    let (input, init) = unary_expr(input, depth)?;
    many0(preceded(opt(ws(keyword("AND"))), |i| unary_expr(i, depth)))
        .parse(input)
        .map(|(input, rest)| {
            let expr = rest.into_iter().fold(init, |acc, e| acc.and(e));
            (input, expr)
        })
}

fn unary_expr(input: &str, depth: usize) -> IResult<&str, TagQueryExpr, ParseErrorDetail> {
    let (input, negated) = opt(ws(alt((keyword("NOT"), t("-"))))).parse(input)?;
    match negated {
        Some(_) => {
            let depth = nested(input, depth)?;
            let (input, expr) = cut(|i| unary_expr(i, depth)).parse(input)?;
            Ok((input, TagQueryExpr::not(expr)))
        }
        None => atom(input, depth),
    }
}

fn atom(input: &str, depth: usize) -> IResult<&str, TagQueryExpr, ParseErrorDetail> {
    ws(alt((move |i| paren_expr(i, depth), pseudo_tag, tag_ref))).parse(input)
}

fn paren_expr(input: &str, depth: usize) -> IResult<&str, TagQueryExpr, ParseErrorDetail> {
    let (input, _) = char('(').parse(input)?;
    let depth = nested(input, depth)?;

    let (rest, expr) = match or_expr(input, depth) {
        Ok(ok) => ok,
        Err(nom::Err::Error(_)) => {
            return Err(nom::Err::Failure(ParseErrorDetail::new(
                ParseErrorKind::ExpectedExpr,
                input,
            )));
        }
        Err(e) => return Err(e),
    };

    match ws(char::<_, ParseErrorDetail>(')')).parse(rest) {
        Ok((rest, _)) => Ok((rest, expr)),
        Err(_) => Err(nom::Err::Failure(ParseErrorDetail::new(
            ParseErrorKind::UnbalancedParenthesis,
            rest,
        ))),
    }
}

/// Enters one more level of nesting, failing past [`MAX_NESTING`].
fn nested(input: &str, depth: usize) -> Result<usize, nom::Err<ParseErrorDetail>> {
    if depth >= MAX_NESTING {
        return Err(nom::Err::Failure(ParseErrorDetail::new(
            ParseErrorKind::TooDeep,
            input,
        )));
    }
    Ok(depth + 1)
}

fn tag_ref(input: &str) -> IResult<&str, TagQueryExpr, ParseErrorDetail> {
    let (input, symbol) = opt(satisfy(is_type_symbol)).parse(input)?;
    let (input, label) = label(input)?;

    Ok((
        input,
        TagQueryExpr::Tag {
            label: label.to_string(),
            symbol,
        },
    ))
}

fn pseudo_tag(input: &str) -> IResult<&str, TagQueryExpr, ParseErrorDetail> {
    let (input, _) = char(PSEUDO_TAG_MARKER).parse(input)?;
    let (input, name) = cut(take_while1(is_label_char)).parse(input)?;
    let (input, arg) = opt(preceded(char(':'), cut(pseudo_tag_arg))).parse(input)?;

    Ok((
        input,
        TagQueryExpr::PseudoTag {
            name: name.to_string(),
            arg,
        },
    ))
}

fn pseudo_tag_arg(input: &str) -> IResult<&str, PseudoTagArg, ParseErrorDetail> {
    alt((quoted_arg, bare_arg)).parse(input)
}

fn quoted_arg(input: &str) -> IResult<&str, PseudoTagArg, ParseErrorDetail> {
    let (body, _) = char('"').parse(input)?;

    let mut pattern = String::new();
    let mut chars = body.char_indices();
    let end = loop {
        match chars.next() {
            Some((i, '"')) => break i,
            Some((_, '\\')) => match chars.next() {
                Some((_, c @ ('"' | '\\'))) => pattern.push(c),
                // Other escapes are left to the regex engine.
                Some((_, c)) => {
                    pattern.push('\\');
                    pattern.push(c);
                }
                None => break body.len() + 1,
            },
            Some((_, c)) => pattern.push(c),
            None => break body.len() + 1,
        }
    };
    if end > body.len() {
        return Err(nom::Err::Failure(ParseErrorDetail::new(
            ParseErrorKind::UnterminatedString,
            input,
        )));
    }

    let (rest, flag) = terminated(opt(one_of("is")), not(satisfy(is_label_char)))
        .parse(&body[end + 1..])?;

    Ok((
        rest,
        PseudoTagArg {
            pattern,
            case_sensitive: flag.map(|f| f == 's'),
        },
    ))
}

fn bare_arg(input: &str) -> IResult<&str, PseudoTagArg, ParseErrorDetail> {
    take_while1(|c: char| !c.is_whitespace() && c != '(' && c != ')' && c != '"')
        .parse(input)
        .map(|(rest, pattern)| (rest, PseudoTagArg::new(pattern)))
}

fn label(input: &str) -> IResult<&str, &str, ParseErrorDetail> {
    verify(take_while1(is_label_char), |label: &str| !is_keyword(label)).parse(input)
}

fn keyword<'a>(
    word: &'static str,
) -> impl Parser<&'a str, Output = &'a str, Error = ParseErrorDetail> {
    terminated(t(word), not(satisfy(is_label_char)))
}

fn ws<'a, F: 'a>(inner: F) -> impl Parser<&'a str, Output = F::Output, Error = F::Error>
where
    F: Parser<&'a str>,
    F::Error: nom::error::ParseError<&'a str>,
{
    delimited(multispace0, inner, multispace0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseErrorKind {
    UnexpectedToken,
    UnbalancedParenthesis,
    ExpectedExpr,
    UnterminatedString,
    TooDeep,
}

impl Display for ParseErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParseErrorKind::UnexpectedToken => write!(f, "unexpected token"),
            ParseErrorKind::UnbalancedParenthesis => write!(f, "unbalanced parenthesis"),
            ParseErrorKind::ExpectedExpr => write!(f, "expected an expression"),
            ParseErrorKind::UnterminatedString => write!(f, "unterminated string"),
            ParseErrorKind::TooDeep => write!(f, "query is nested too deeply"),
        }
    }
}

/// A parse failure and the remaining input at the point where it occurred.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{kind} at '{location}'")]
pub struct ParseErrorDetail {
    pub kind: ParseErrorKind,
    pub location: String,
}

impl ParseErrorDetail {
    fn new(kind: ParseErrorKind, location: &str) -> Self {
        Self {
            kind,
            location: location.to_string(),
        }
    }
}

impl nom::error::ParseError<&str> for ParseErrorDetail {
    fn from_error_kind(input: &str, _kind: nom::error::ErrorKind) -> Self {
        let kind = if input.trim().is_empty() {
            ParseErrorKind::ExpectedExpr
        } else {
            ParseErrorKind::UnexpectedToken
        };
        ParseErrorDetail::new(kind, input)
    }

    fn append(_input: &str, _kind: nom::error::ErrorKind, other: Self) -> Self {
        other
    }
}

#[cfg(test)]
mod tests {
    use super::{MAX_NESTING, ParseErrorKind, is_type_symbol, parse_query};
    use crate::query::{PseudoTagArg, TagQueryExpr};

    #[test]
    fn test_parse_query_expr() {
        let input = "cat AND (cute OR NOT dog) AND #ext:png";

        assert_eq!(
            TagQueryExpr::tag("cat")
                .and(TagQueryExpr::tag("cute").or(TagQueryExpr::not(TagQueryExpr::tag("dog"))))
                .and(TagQueryExpr::pattern("ext", PseudoTagArg::new("png"))),
            parse_query(input).unwrap()
        );
    }

    #[test]
    fn test_implicit_and_binds_tighter_than_or() {
        assert_eq!(
            TagQueryExpr::tag("a")
                .and(TagQueryExpr::tag("b"))
                .or(TagQueryExpr::tag("c")),
            parse_query("a b OR c").unwrap()
        );
    }

    #[test]
    fn test_minus_is_negation() {
        assert_eq!(
            TagQueryExpr::tag("a").and(TagQueryExpr::not(TagQueryExpr::tag("b"))),
            parse_query("a -b").unwrap()
        );
        assert_eq!(
            TagQueryExpr::not(TagQueryExpr::not(TagQueryExpr::tag("b"))),
            parse_query("NOT -b").unwrap()
        );
    }

    #[test]
    fn test_keywords_need_word_boundary() {
        assert_eq!(
            TagQueryExpr::tag("ORANGE").and(TagQueryExpr::tag("NOTE")),
            parse_query("ORANGE NOTE").unwrap()
        );
    }

    #[test]
    fn test_typed_tag() {
        assert!(is_type_symbol('%'));
        assert!(!is_type_symbol('#'));
        assert!(!is_type_symbol('a'));

        assert_eq!(
            TagQueryExpr::typed_tag('%', "alice").or(TagQueryExpr::typed_tag('@', "paris")),
            parse_query("%alice OR @paris").unwrap()
        );
    }

    #[test]
    fn test_pseudo_tag_arguments() {
        assert_eq!(
            TagQueryExpr::flag("no_tags"),
            parse_query("#no_tags").unwrap()
        );
        assert_eq!(
            TagQueryExpr::pattern(
                "name",
                PseudoTagArg::new(r"IMG \d+ \x").with_case_sensitive(false)
            ),
            parse_query(r#"#name:"IMG \d+ \\x"i"#).unwrap()
        );
        assert_eq!(
            TagQueryExpr::pattern(
                "path",
                PseudoTagArg::new(r#"/home/"me""#).with_case_sensitive(true)
            ),
            parse_query(r#"#path:"/home/\"me\""s"#).unwrap()
        );
        assert_eq!(
            TagQueryExpr::pattern("similar_to", PseudoTagArg::new("/pics/a.png"))
                .and(TagQueryExpr::tag("cat")),
            parse_query("(#similar_to:/pics/a.png) cat").unwrap()
        );
    }

    #[test]
    fn test_unknown_pseudo_tag_is_not_a_syntax_error() {
        assert_eq!(
            TagQueryExpr::flag("unknown_pseudo"),
            parse_query("#unknown_pseudo").unwrap()
        );
    }

    #[test]
    fn test_syntax_errors() {
        assert_eq!(
            ParseErrorKind::ExpectedExpr,
            parse_query("(").unwrap_err().kind
        );
        assert_eq!(
            ParseErrorKind::UnbalancedParenthesis,
            parse_query("(a OR b").unwrap_err().kind
        );
        assert_eq!(
            ParseErrorKind::UnbalancedParenthesis,
            parse_query("a OR b)").unwrap_err().kind
        );
        assert_eq!(
            ParseErrorKind::ExpectedExpr,
            parse_query("()").unwrap_err().kind
        );
        assert_eq!(
            ParseErrorKind::UnterminatedString,
            parse_query(r#"#name:"abc"#).unwrap_err().kind
        );
        assert!(parse_query("").is_err());
        assert!(parse_query("a AND").is_err());
        assert!(parse_query("a OR OR b").is_err());
        assert!(parse_query("NOT").is_err());
        assert!(parse_query("#").is_err());
        assert!(parse_query("#name:").is_err());
        assert!(parse_query("a $").is_err());
    }

    #[test]
    fn test_nesting_is_bounded() {
        let deep = format!("{}a{}", "(".repeat(500), ")".repeat(500));
        assert_eq!(ParseErrorKind::TooDeep, parse_query(&deep).unwrap_err().kind);

        let negations = format!("{}a", "-".repeat(20_000));
        assert_eq!(
            ParseErrorKind::TooDeep,
            parse_query(&negations).unwrap_err().kind
        );

        let unclosed = "(".repeat(20_000);
        assert_eq!(ParseErrorKind::TooDeep, parse_query(&unclosed).unwrap_err().kind);
    }

    #[test]
    fn test_nesting_up_to_the_limit() {
        let depth = MAX_NESTING - 1;
        let query = format!("{}a{}", "(".repeat(depth), ")".repeat(depth));
        assert_eq!(TagQueryExpr::tag("a"), parse_query(&query).unwrap());

        let query = format!("{}a", "NOT ".repeat(MAX_NESTING));
        assert!(parse_query(&query).is_ok());
    }
}
