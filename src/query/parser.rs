use std::str::FromStr;
use nom::{
    IResult, Parser,
    branch::alt,
    bytes::complete::{tag, take_while1},
    character::complete::{char, i64 as signed, multispace0, multispace1},
    combinator::{all_consuming, eof, map, opt, peek},
    multi::separated_list1,
    sequence::{delimited, pair, preceded, terminated},
};
use crate::core::error::{Error, ErrorKind, Result};
use crate::query::key::SearchKey;

/// Parse the textual form of a search key.
///
/// Examples:
/// - `"42"` -> scan id 42
/// - `"-1"` -> most recent run
/// - `"-5:"`, `"-5:-2"`, `"-9::2"` -> slices into past runs
/// - `"a3f9"` -> uid prefix
/// - `"[1, -1, -3:]"` -> several keys
pub fn parse_key(input: &str) -> Result<SearchKey> {
    all_consuming(delimited(multispace0, key, multispace0))
        .parse(input)
        .map(|(_, key)| key)
        .map_err(|e| {
            Error::new(
                ErrorKind::Parse,
                format!("Could not parse search key {:?}: {}", input, e),
            )
        })
}

impl FromStr for SearchKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        parse_key(s)
    }
}

fn key(input: &str) -> IResult<&str, SearchKey> {
    alt((list_key, slice_key, int_key, uid_key)).parse(input)
}

fn list_key(input: &str) -> IResult<&str, SearchKey> {
    map(
        delimited(
            pair(char('['), multispace0),
            separated_list1(delimited(multispace0, char(','), multispace0), key),
            pair(multispace0, char(']')),
        ),
        SearchKey::Many,
    )
    .parse(input)
}

fn number(input: &str) -> IResult<&str, i64> {
    signed(input)
}

fn slice_key(input: &str) -> IResult<&str, SearchKey> {
    map(
        (
            opt(number),
            char(':'),
            opt(number),
            opt(preceded(char(':'), opt(number))),
        ),
        |(start, _, stop, step)| SearchKey::slice(start, stop, step.flatten()),
    )
    .parse(input)
}

fn boundary(input: &str) -> IResult<&str, &str> {
    peek(alt((eof, tag(","), tag("]"), multispace1))).parse(input)
}

fn int_key(input: &str) -> IResult<&str, SearchKey> {
    map(terminated(number, boundary), SearchKey::Int).parse(input)
}

fn uid_key(input: &str) -> IResult<&str, SearchKey> {
    map(
        take_while1(|c: char| c.is_ascii_alphanumeric() || c == '-'),
        |uid: &str| SearchKey::Uid(uid.to_string()),
    )
    .parse(input)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integers() {
        assert_eq!(parse_key("42").unwrap(), SearchKey::Int(42));
        assert_eq!(parse_key(" -1 ").unwrap(), SearchKey::Int(-1));
    }

    #[test]
    fn test_slices() {
        assert_eq!(parse_key("-5:").unwrap(), SearchKey::slice(Some(-5), None, None));
        assert_eq!(parse_key("-5:-2").unwrap(), SearchKey::slice(Some(-5), Some(-2), None));
        assert_eq!(parse_key("-9::2").unwrap(), SearchKey::slice(Some(-9), None, Some(2)));
        assert_eq!(parse_key(":").unwrap(), SearchKey::slice(None, None, None));
    }

    #[test]
    fn test_uids_that_start_with_digits() {
        assert_eq!(parse_key("12ab").unwrap(), SearchKey::Uid("12ab".to_string()));
        let full = "f26efc1d-8263-46c8-a560-7bf73d2786e1";
        assert_eq!(parse_key(full).unwrap(), SearchKey::Uid(full.to_string()));
    }

    #[test]
    fn test_lists_nest() {
        let parsed: SearchKey = "[1, -1, [-3:], abc]".parse().unwrap();
        assert_eq!(
            parsed,
            SearchKey::Many(vec![
                SearchKey::Int(1),
                SearchKey::Int(-1),
                SearchKey::Many(vec![SearchKey::slice(Some(-3), None, None)]),
                SearchKey::Uid("abc".to_string()),
            ])
        );
    }

    #[test]
    fn test_garbage_is_a_parse_error() {
        for bad in ["", "1.5", "[1,", "a b"] {
            let err = parse_key(bad).unwrap_err();
            assert_eq!(err.kind, ErrorKind::Parse, "input {:?}", bad);
        }
    }
}
