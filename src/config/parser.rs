//! Generic parser for the block-structured configuration grammar.
//!
//! The format is a small subset of HCL (blocks, quoted labels, `key = value`
//! attributes, arbitrary nesting) — there is no HCL crate available, and the
//! grammar actually in use here is narrow enough that a hand-written `nom`
//! parser is the better fit anyway, the same call the changer status parser
//! makes for `mtx`'s output format.

use nom::{
    branch::alt,
    bytes::complete::{escaped_transform, tag, take_while, take_while1},
    character::complete::{char, digit1, multispace0, none_of},
    combinator::{map, map_res, opt, recognize, value},
    multi::many0,
    sequence::{delimited, preceded, terminated, tuple},
};

use crate::parsing::{parse_complete, IResult};

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Str(String),
    Int(u64),
    Ident(String),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) | Value::Ident(s) => Some(s),
            Value::Int(_) => None,
        }
    }

    pub fn as_int(&self) -> Option<u64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Item {
    Attr { key: String, value: Value },
    Block { name: String, label: Option<String>, body: Vec<Item> },
}

/// Parse a complete config document into a flat list of top-level items.
pub fn parse_document(text: &str) -> Result<Vec<Item>, anyhow::Error> {
    parse_complete("config", text, document)
}

fn document(i: &str) -> IResult<&str, Vec<Item>> {
    terminated(items, ws)(i)
}

fn items(i: &str) -> IResult<&str, Vec<Item>> {
    many0(preceded(ws, item))(i)
}

fn item(i: &str) -> IResult<&str, Item> {
    alt((block, attr))(i)
}

fn attr(i: &str) -> IResult<&str, Item> {
    let (i, key) = identifier(i)?;
    let (i, _) = ws(i)?;
    let (i, _) = char('=')(i)?;
    let (i, _) = ws(i)?;
    let (i, value) = value(i)?;
    Ok((i, Item::Attr { key: key.to_string(), value }))
}

fn block(i: &str) -> IResult<&str, Item> {
    let (i, name) = identifier(i)?;
    let (i, _) = ws(i)?;
    let (i, label) = opt(terminated(quoted_string, ws))(i)?;
    let (i, body) = delimited(char('{'), items, preceded(ws, char('}')))(i)?;
    Ok((
        i,
        Item::Block {
            name: name.to_string(),
            label,
            body,
        },
    ))
}

fn value(i: &str) -> IResult<&str, Value> {
    alt((
        map(quoted_string, Value::Str),
        map(uint, Value::Int),
        map(identifier, |s: &str| Value::Ident(s.to_string())),
    ))(i)
}

fn uint(i: &str) -> IResult<&str, u64> {
    map_res(recognize(digit1), str::parse)(i)
}

fn identifier(i: &str) -> IResult<&str, &str> {
    take_while1(|c: char| c.is_alphanumeric() || c == '_' || c == '-' || c == '.')(i)
}

fn quoted_string(i: &str) -> IResult<&str, String> {
    delimited(
        char('"'),
        map(
            opt(escaped_transform(
                none_of("\"\\"),
                '\\',
                alt((value('"', char('"')), value('\\', char('\\')))),
            )),
            |s| s.unwrap_or_default(),
        ),
        char('"'),
    )(i)
}

/// Whitespace, newlines, and `#`/`//` line comments.
fn ws(i: &str) -> IResult<&str, ()> {
    let (i, _) = multispace0(i)?;
    let (i, _) = many0(tuple((comment, multispace0)))(i)?;
    Ok((i, ()))
}

fn comment(i: &str) -> IResult<&str, &str> {
    let (i, _) = alt((tag("#"), tag("//")))(i)?;
    take_while(|c| c != '\n')(i)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_flat_attrs() {
        let items = parse_document(r#"chunkstore { type = "kv" path = "/tmp/x" }"#).unwrap();
        assert_eq!(items.len(), 1);
        match &items[0] {
            Item::Block { name, label, body } => {
                assert_eq!(name, "chunkstore");
                assert_eq!(*label, None);
                assert_eq!(body.len(), 2);
            }
            _ => panic!("expected block"),
        }
    }

    #[test]
    fn parses_labeled_nested_blocks() {
        let text = r#"
            library "lib0" {
              changer "/dev/sg0" { type = "mtx" }
              drive "/dev/nst0" { type = "write" slot = 3 group = "default" }
            }
        "#;
        let items = parse_document(text).unwrap();
        let Item::Block { name, label, body } = &items[0] else {
            panic!("expected block");
        };
        assert_eq!(name, "library");
        assert_eq!(label.as_deref(), Some("lib0"));
        assert_eq!(body.len(), 2);
    }

    #[test]
    fn ignores_comments() {
        let text = "# top comment\nchunkstore { type = \"kv\" path = \"/tmp\" } // trailing\n";
        let items = parse_document(text).unwrap();
        assert_eq!(items.len(), 1);
    }

    #[test]
    fn rejects_unterminated_block() {
        assert!(parse_document("chunkstore { type = \"kv\"").is_err());
    }
}
