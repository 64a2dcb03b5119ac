//! Wire-line command parsing: split a CRLF-stripped SMTP line into an
//! uppercased 4-letter verb and a trailing argument, per the fixed-width
//! verb framing RFC 821 implementations use.

/// The verbs this server recognises at all (whether or not it implements
/// them). Consulted before per-state dispatch so the "any state" handlers
/// (NOOP/RSET/QUIT/VRFY/unimplemented-family) short-circuit state handling.
pub const RECOGNIZED_VERBS: &[&str] = &[
    "HELO", "EHLO", "MAIL", "RCPT", "DATA", "RSET", "SEND", "SOML", "SAML", "VRFY", "EXPN", "HELP",
    "NOOP", "QUIT", "TURN",
];

pub fn is_recognized(verb: &str) -> bool {
    RECOGNIZED_VERBS.contains(&verb)
}

/// Outcome of parsing one wire line.
#[derive(Debug, PartialEq, Eq)]
pub enum ParsedCommand {
    /// An empty line — replied to with `500 Speak up`, not treated as
    /// malformed.
    Empty,
    /// A line that can't be a command under the fixed-width verb rules.
    Malformed,
    /// A 4-letter verb, optionally followed by an argument.
    Command { verb: String, arg: String },
}

/// Parses a single CRLF-stripped line per the fixed-width SMTP command
/// grammar:
///
/// - empty → [`ParsedCommand::Empty`]
/// - length 1-3 or exactly 5 → [`ParsedCommand::Malformed`]
/// - length 4 → verb only, no argument
/// - length >= 6 → byte 4 must be a single space; verb is the first 4
///   bytes uppercased, argument is the remainder trimmed of surrounding
///   spaces
pub fn parse_command(line: &str) -> ParsedCommand {
    let bytes = line.as_bytes();
    match bytes.len() {
        0 => ParsedCommand::Empty,
        1..=3 => ParsedCommand::Malformed,
        4 => ParsedCommand::Command {
            verb: line.to_ascii_uppercase(),
            arg: String::new(),
        },
        5 => ParsedCommand::Malformed,
        _ => {
            if bytes[4] != b' ' {
                return ParsedCommand::Malformed;
            }
            ParsedCommand::Command {
                verb: line[..4].to_ascii_uppercase(),
                arg: line[5..].trim().to_string(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_line() {
        assert_eq!(parse_command(""), ParsedCommand::Empty);
    }

    #[test]
    fn lengths_one_to_three_are_malformed() {
        assert_eq!(parse_command("A"), ParsedCommand::Malformed);
        assert_eq!(parse_command("AB"), ParsedCommand::Malformed);
        assert_eq!(parse_command("ABC"), ParsedCommand::Malformed);
    }

    #[test]
    fn length_four_is_verb_only() {
        assert_eq!(
            parse_command("NOOP"),
            ParsedCommand::Command {
                verb: "NOOP".to_string(),
                arg: String::new(),
            }
        );
        assert_eq!(
            parse_command("quit"),
            ParsedCommand::Command {
                verb: "QUIT".to_string(),
                arg: String::new(),
            }
        );
    }

    #[test]
    fn length_five_is_malformed() {
        assert_eq!(parse_command("HELOx"), ParsedCommand::Malformed);
    }

    #[test]
    fn length_six_plus_requires_space_at_index_four() {
        assert_eq!(
            parse_command("HELO x"),
            ParsedCommand::Command {
                verb: "HELO".to_string(),
                arg: "x".to_string(),
            }
        );
        assert_eq!(parse_command("HELOxy"), ParsedCommand::Malformed);
    }

    #[test]
    fn verb_is_uppercased_argument_is_trimmed() {
        assert_eq!(
            parse_command("mail FROM:<a@b>  "),
            ParsedCommand::Command {
                verb: "MAIL".to_string(),
                arg: "FROM:<a@b>".to_string(),
            }
        );
    }

    #[test]
    fn recognized_set_is_case_insensitive_by_construction() {
        for verb in RECOGNIZED_VERBS {
            assert!(is_recognized(verb));
            assert!(!is_recognized(&verb.to_lowercase()));
        }
        assert!(!is_recognized("BDAT"));
    }
}
