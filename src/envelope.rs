//! Parsers for the envelope-bearing commands: HELO/EHLO, MAIL FROM (with
//! ESMTP parameters), and RCPT TO. These operate on the argument string
//! already split out by [`crate::command::parse_command`].

use std::collections::HashMap;

#[derive(Debug, PartialEq, Eq)]
pub enum HeloError {
    MissingArgument,
}

/// Extracts the HELO/EHLO domain: everything up to the first space in the
/// command argument, required to be non-empty.
pub fn parse_helo_domain(arg: &str) -> Result<&str, HeloError> {
    let domain = arg.split(' ').next().unwrap_or("");
    if domain.is_empty() {
        Err(HeloError::MissingArgument)
    } else {
        Ok(domain)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum MailFromError {
    /// Doesn't match `FROM:<address>[ params]`, or the params tail parses
    /// to zero tokens despite being present — preserved intentionally, see
    /// the "trailing space, no KEY=VALUE" ambiguity this crate keeps.
    BadSyntax,
    /// A `SIZE=` parameter declared a message larger than the configured
    /// ceiling.
    SizeExceeded,
}

pub struct ParsedMailFrom {
    pub address: String,
    pub params: HashMap<String, String>,
}

/// Parses a `MAIL` command argument of the form `FROM:<address>[ params]`.
///
/// `address` admits either a bare run of non-`>` bytes (with `\>` treated
/// as an escaped, non-terminating `>`) or a quoted local part, `"…"@domain`,
/// where an embedded `>` does not terminate the address. `max_message_bytes`
/// is the ceiling a `SIZE=` parameter is checked against.
pub fn parse_mail_from(arg: &str, max_message_bytes: u64) -> Result<ParsedMailFrom, MailFromError> {
    // `str::get` (unlike range indexing) returns `None` instead of
    // panicking when byte offset 5 isn't a char boundary, which a
    // multi-byte UTF-8 argument (legal under 8BITMIME) can hit.
    let prefix = arg.get(..5).ok_or(MailFromError::BadSyntax)?;
    if !prefix.eq_ignore_ascii_case("from:") {
        return Err(MailFromError::BadSyntax);
    }
    let rest = &arg[5..];
    let (address, tail) = scan_bracketed_address(rest).ok_or(MailFromError::BadSyntax)?;
    if address.is_empty() {
        return Err(MailFromError::BadSyntax);
    }

    let params = if tail.trim().is_empty() {
        HashMap::new()
    } else {
        parse_esmtp_params(tail.trim()).ok_or(MailFromError::BadSyntax)?
    };

    if let Some(size) = params.get("SIZE") {
        // Per spec, SIZE is a signed 32-bit integer; a value that doesn't
        // fit is a syntax error, not an oversize message. A negative value
        // doesn't exceed max_message_bytes either, so it isn't a 552 — it's
        // simply not a size the ceiling check rejects.
        let size: i32 = size.parse().map_err(|_| MailFromError::BadSyntax)?;
        if size >= 0 && size as u64 > max_message_bytes {
            return Err(MailFromError::SizeExceeded);
        }
    }

    Ok(ParsedMailFrom {
        address: address.to_string(),
        params,
    })
}

/// Scans `<address>` off the front of `rest`, returning the address text
/// (without the brackets) and whatever follows the closing `>`. Handles an
/// escaped `\>` inside the address and a quoted local part where an
/// embedded `>` doesn't terminate the scan.
///
/// Quotes are paired up left-to-right before the scan starts: a `>` is only
/// shielded when it falls strictly between a quote and its matching close.
/// A lone, unmatched `"` (no closing quote anywhere in the argument) is just
/// an ordinary non-`>` byte under the `(\>|[^>])+` alternative, not the start
/// of an unterminated quoted span — otherwise an address like `a"b@ex` with
/// a stray quote would never find its terminating `>` and would be rejected
/// as malformed even though it's in the accepted language.
fn scan_bracketed_address(rest: &str) -> Option<(&str, &str)> {
    let rest = rest.strip_prefix('<')?;
    let bytes = rest.as_bytes();

    let quote_positions: Vec<usize> = bytes
        .iter()
        .enumerate()
        .filter(|&(_, &b)| b == b'"')
        .map(|(i, _)| i)
        .collect();
    let quoted_ranges: Vec<(usize, usize)> = quote_positions
        .chunks_exact(2)
        .map(|pair| (pair[0], pair[1]))
        .collect();
    let shielded = |i: usize| quoted_ranges.iter().any(|&(s, e)| i > s && i < e);

    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' if i + 1 < bytes.len() && bytes[i + 1] == b'>' => {
                i += 2;
            }
            b'>' if !shielded(i) => {
                return Some((&rest[..i], &rest[i + 1..]));
            }
            _ => {
                i += 1;
            }
        }
    }
    None
}

/// Parses a whitespace-separated sequence of `KEY=VALUE` tokens into a
/// case-folded (uppercased key) map. Returns `None` if no token parses,
/// matching the source behaviour where a non-empty-but-unparseable params
/// tail rejects the whole command.
fn parse_esmtp_params(s: &str) -> Option<HashMap<String, String>> {
    let mut params = HashMap::new();
    for token in s.split_whitespace() {
        let (key, value) = token.split_once('=')?;
        if key.is_empty()
            || !key.chars().all(|c| c.is_ascii_alphanumeric())
            || !value.chars().all(|c| c.is_ascii_alphanumeric())
        {
            return None;
        }
        params.insert(key.to_ascii_uppercase(), value.to_string());
    }
    if params.is_empty() {
        None
    } else {
        Some(params)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum RcptToError {
    BadSyntax,
}

/// Extracts the RCPT TO address: the argument must begin (case
/// insensitively) with `TO:`; the remainder is stripped of surrounding
/// `<>` and spaces and handed to the address policy unvalidated.
pub fn parse_rcpt_to(arg: &str) -> Result<String, RcptToError> {
    // Same char-boundary hazard as `parse_mail_from`'s `FROM:` prefix check.
    let prefix = arg.get(..3).ok_or(RcptToError::BadSyntax)?;
    if !prefix.eq_ignore_ascii_case("to:") {
        return Err(RcptToError::BadSyntax);
    }
    let address = arg[3..].trim_matches(|c| c == '<' || c == '>' || c == ' ');
    if address.is_empty() {
        return Err(RcptToError::BadSyntax);
    }
    Ok(address.to_string())
}
