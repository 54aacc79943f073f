//! Small `nom` helpers shared by the text-format parsers in this crate
//! (changer status output, the config file grammar, human-readable
//! durations). Kept separate so each parser module only pulls in the
//! combinators it actually needs.

use nom::{
    bytes::complete::{take_while, take_while1},
    character::complete::digit1,
    combinator::{all_consuming, map_res, recognize},
    error::{ContextError, VerboseError},
};

pub type IResult<I, O, E = VerboseError<I>> = Result<(I, O), nom::Err<E>>;

pub fn parse_error<'a>(i: &'a str, context: &'static str) -> nom::Err<VerboseError<&'a str>> {
    let err = VerboseError { errors: Vec::new() };
    let err = VerboseError::add_context(i, context, err);
    nom::Err::Error(err)
}

/// Zero or more spaces/tabs (not newlines).
pub fn multispace0(i: &str) -> IResult<&str, &str> {
    take_while(|c| c == ' ' || c == '\t')(i)
}

/// One or more spaces/tabs (not newlines).
pub fn multispace1(i: &str) -> IResult<&str, &str> {
    take_while1(|c| c == ' ' || c == '\t')(i)
}

/// Parse an unsigned 64 bit integer.
pub fn parse_u64(i: &str) -> IResult<&str, u64> {
    map_res(recognize(digit1), str::parse)(i)
}

/// Parse complete input, producing a human-readable error with context on failure.
pub fn parse_complete<'a, F, O>(what: &str, i: &'a str, parser: F) -> Result<O, anyhow::Error>
where
    F: FnMut(&'a str) -> IResult<&'a str, O>,
{
    match all_consuming(parser)(i) {
        Err(nom::Err::Error(err)) | Err(nom::Err::Failure(err)) => {
            anyhow::bail!(
                "unable to parse {} - {}",
                what,
                nom::error::convert_error(i, err)
            );
        }
        Err(err) => anyhow::bail!("unable to parse {} - {}", what, err),
        Ok((_, data)) => Ok(data),
    }
}
