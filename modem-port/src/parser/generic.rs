use nom::{
    branch::alt,
    bytes::complete::tag,
    character::complete::{digit0, multispace0, one_of, u16 as decimal},
    combinator::{all_consuming, eof, map, map_opt, rest, value, verify},
    sequence::{preceded, terminated, tuple},
    IResult,
};

use super::{ParserVerdict, ResponseClassifier};
use crate::{
    error::{ConnectionError, ResponseError},
    helpers::{LossyStr, SliceExt},
};

#[derive(Debug, Clone, PartialEq, Eq)]
enum FinalCode {
    Ok,
    Connect,
    Error(ResponseError),
}

/// Classifier for the standard V.25ter / 3GPP final result codes.
///
/// The reply is complete once its last line, framed as `\r\n<CODE>\r\n`, is
/// one of:
/// - `OK` and `CONNECT[ <rate>]` (success)
/// - `+CME ERROR: <n>` and `+CMS ERROR: <n>`
/// - `ERROR` and `COMMAND NOT SUPPORT`
/// - `NO CARRIER`, `BUSY`, `NO ANSWER` and `NO DIALTONE`
#[derive(Debug, Default, Clone, Copy)]
pub struct GenericAtClassifier;

fn extended_error<'a>(
    prefix: &'static str,
    numeric: fn(u16) -> ResponseError,
) -> impl FnMut(&'a [u8]) -> IResult<&'a [u8], FinalCode> {
    preceded(
        tuple((tag(prefix), multispace0)),
        alt((
            map(terminated(decimal, eof), move |n| FinalCode::Error(numeric(n))),
            map(verify(rest, |r: &[u8]| !r.is_empty()), |r: &[u8]| {
                FinalCode::Error(ResponseError::Custom(
                    String::from_utf8_lossy(r).into_owned(),
                ))
            }),
        )),
    )
}

fn connection_failure(i: &[u8]) -> IResult<&[u8], FinalCode> {
    map(
        alt((
            tag("NO CARRIER"),
            tag("BUSY"),
            tag("NO ANSWER"),
            tag("NO DIALTONE"),
        )),
        |code: &[u8]| {
            FinalCode::Error(ResponseError::Connection(
                ConnectionError::from_result_code(code).unwrap_or(ConnectionError::Unknown),
            ))
        },
    )(i)
}

/// Matches a final result code line without its line endings.
fn final_code(i: &[u8]) -> IResult<&[u8], FinalCode> {
    all_consuming(alt((
        value(FinalCode::Ok, tag("OK")),
        value(
            FinalCode::Connect,
            tuple((tag("CONNECT"), multispace0, digit0)),
        ),
        extended_error("+CME ERROR:", ResponseError::CmeError),
        extended_error("+CMS ERROR:", ResponseError::CmsError),
        value(
            FinalCode::Error(ResponseError::Error),
            alt((tag("ERROR"), tag("COMMAND NOT SUPPORT"))),
        ),
        connection_failure,
    )))(i)
}

/// Strip one trailing and one leading `\r\n`.
fn clean(buf: &[u8]) -> &[u8] {
    let buf = buf.strip_suffix(b"\r\n").unwrap_or(buf);
    buf.strip_prefix(b"\r\n").unwrap_or(buf)
}

impl ResponseClassifier for GenericAtClassifier {
    fn classify(&mut self, buf: &[u8]) -> ParserVerdict {
        let Some(body) = buf.strip_suffix(b"\r\n") else {
            return ParserVerdict::Incomplete;
        };
        let Some(start) = body.rfind(b"\r\n") else {
            return ParserVerdict::Incomplete;
        };

        match final_code(&body[start + 2..]) {
            Ok((_, FinalCode::Ok)) => ParserVerdict::Matched(clean(&buf[..start]).to_vec()),
            Ok((_, FinalCode::Connect)) => ParserVerdict::Matched(clean(buf).to_vec()),
            Ok((_, FinalCode::Error(e))) => {
                debug!("Got error reply {:?}: {}", LossyStr(buf), e);
                ParserVerdict::MatchedError(e)
            }
            Err(_) => ParserVerdict::Incomplete,
        }
    }
}

/// Classifier for numeric result codes, as sent after `ATV0`.
///
/// Information text lines end in `\r\n`; the final result is a single digit
/// followed by `\r`:
/// - `0` (OK), `1` and `5` (CONNECT) succeed
/// - `4` is ERROR; `3`, `6`, `7` and `8` are connection failures
/// - `+CME ERROR: <n>` and `+CMS ERROR: <n>` lines end the reply as well
///
/// `2` (RING) is unsolicited and never ends a reply. Numeric replies have no
/// line break between the echo and the first line, so use it with echo
/// removal off and the modem in `ATE0`.
#[derive(Debug, Default, Clone, Copy)]
pub struct NumericAtClassifier;

/// Matches a numeric result code, with its trailing `\r`.
fn numeric_code(i: &[u8]) -> IResult<&[u8], u32> {
    all_consuming(terminated(
        map_opt(one_of("0123456789"), |c: char| c.to_digit(10)),
        tag("\r"),
    ))(i)
}

fn extended_error_line(i: &[u8]) -> IResult<&[u8], FinalCode> {
    all_consuming(alt((
        extended_error("+CME ERROR:", ResponseError::CmeError),
        extended_error("+CMS ERROR:", ResponseError::CmsError),
    )))(i)
}

impl ResponseClassifier for NumericAtClassifier {
    fn classify(&mut self, buf: &[u8]) -> ParserVerdict {
        if let Some(body) = buf.strip_suffix(b"\r\n") {
            let start = body.rfind(b"\r\n").map_or(0, |pos| pos + 2);
            return match extended_error_line(&body[start..]) {
                Ok((_, FinalCode::Error(e))) => {
                    debug!("Got error reply {:?}: {}", LossyStr(buf), e);
                    ParserVerdict::MatchedError(e)
                }
                _ => ParserVerdict::Incomplete,
            };
        }

        let start = buf.rfind(b"\n").map_or(0, |pos| pos + 1);
        let Ok((_, code)) = numeric_code(&buf[start..]) else {
            return ParserVerdict::Incomplete;
        };
        let text = &buf[..start];
        let text = text.strip_suffix(b"\r\n").unwrap_or(text);

        let error = match code {
            0 | 1 | 5 => return ParserVerdict::Matched(clean(text).to_vec()),
            2 => return ParserVerdict::Incomplete,
            3 => ResponseError::Connection(ConnectionError::NoCarrier),
            4 => ResponseError::Error,
            6 => ResponseError::Connection(ConnectionError::NoDialtone),
            7 => ResponseError::Connection(ConnectionError::Busy),
            8 => ResponseError::Connection(ConnectionError::NoAnswer),
            other => ResponseError::Custom(format!("result code {other}")),
        };
        debug!("Got error reply {:?}: {}", LossyStr(buf), error);
        ParserVerdict::MatchedError(error)
    }
}
