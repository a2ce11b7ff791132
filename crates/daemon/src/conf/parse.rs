//! Parser for the daemon's INI-like configuration grammar.
//!
//! ```text
//! line        ::= ws decl ws comment? EOL
//! decl        ::= section | param | ""
//! section     ::= '[' name ']'
//! param       ::= name ws '=' ws value
//! value       ::= bare-value | '"' quoted-value '"'
//! name        ::= [A-Za-z0-9_]{1,255}
//! comment     ::= '#' chars-until-EOL
//! ```
//!
//! A parameter line outside any section is an error. All errors carry a
//! one-based line/column pointer into the source.

use std::fmt;

/// Maximum length of a section or parameter name.
const MAX_NAME_LENGTH: usize = 255;

/// Maximum length of a parameter value.
const MAX_VALUE_LENGTH: usize = 8191;

/// A configuration parse failure, locating the offending character.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfParseError {
    /// One-based line of the error.
    pub line: usize,
    /// One-based column of the error.
    pub column: usize,
    /// What went wrong.
    pub message: String,
}

impl fmt::Display for ConfParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}: {}", self.line, self.column, self.message)
    }
}

impl std::error::Error for ConfParseError {}

/// Callback invoked for every parameter/value pair, with its section.
/// Returning an error message aborts the parse at the parameter's
/// location.
pub(crate) type ParamCallback<'a> =
    dyn FnMut(&str, &str, &str) -> Result<(), String> + 'a;

struct LineParser<'a> {
    bytes: &'a [u8],
    pos: usize,
}

enum Declaration {
    Section(String),
    Param { name: String, value: String },
    Empty,
}

impl<'a> LineParser<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn error(&self, message: impl Into<String>) -> (usize, String) {
        (self.pos, message.into())
    }

    /// Consumes spaces and tabs.
    fn skip_whitespace(&mut self) {
        while matches!(self.peek(), Some(b' ' | b'\t')) {
            self.pos += 1;
        }
    }

    /// Reads a section or parameter name. Empty names are legal here and
    /// signal "no name at this position".
    fn parse_name(&mut self) -> Result<String, (usize, String)> {
        let start = self.pos;
        while let Some(byte) = self.peek() {
            if !byte.is_ascii_alphanumeric() && byte != b'_' {
                break;
            }
            self.pos += 1;
            if self.pos - start > MAX_NAME_LENGTH {
                return Err(self.error("Names can be no more than 255 characters long"));
            }
        }
        Ok(String::from_utf8_lossy(&self.bytes[start..self.pos]).into_owned())
    }

    /// Reads an unquoted value, which may contain any character except
    /// `#`, `"`, and whitespace.
    fn parse_bare_value(&mut self) -> Result<String, (usize, String)> {
        let start = self.pos;
        while let Some(byte) = self.peek() {
            if matches!(byte, b'#' | b'"' | b' ' | b'\t') {
                break;
            }
            self.pos += 1;
            if self.pos - start > MAX_VALUE_LENGTH {
                return Err(self.error("Values can be no more than 8191 characters long"));
            }
        }

        if self.pos == start {
            return Err(self.error("Unquoted values must contain at least one character"));
        }
        Ok(String::from_utf8_lossy(&self.bytes[start..self.pos]).into_owned())
    }

    /// Reads a double-quoted value with `\"` and `\\` escapes. The opening
    /// quote has already been observed.
    fn parse_quoted_value(&mut self) -> Result<String, (usize, String)> {
        self.pos += 1;

        let mut value = Vec::new();
        let mut escaped = false;
        loop {
            match self.peek() {
                None => return Err(self.error("'\"' expected")),
                Some(byte) => {
                    if escaped {
                        escaped = false;
                        value.push(byte);
                    } else if byte == b'\\' {
                        escaped = true;
                    } else if byte == b'"' {
                        self.pos += 1;
                        break;
                    } else {
                        value.push(byte);
                    }
                    self.pos += 1;

                    if value.len() > MAX_VALUE_LENGTH {
                        return Err(
                            self.error("Values can be no more than 8191 characters long")
                        );
                    }
                }
            }
        }

        Ok(String::from_utf8_lossy(&value).into_owned())
    }

    /// Reads a `[section]` header if one starts here.
    fn parse_section(&mut self) -> Result<Option<String>, (usize, String)> {
        if self.peek() != Some(b'[') {
            return Ok(None);
        }
        self.pos += 1;

        let name = self.parse_name()?;
        if name.is_empty() {
            return Err(self.error("Section names must contain at least one character"));
        }

        if self.peek() != Some(b']') {
            return Err(self.error("']' expected"));
        }
        self.pos += 1;

        Ok(Some(name))
    }

    /// Reads a `name = value` pair if one starts here.
    fn parse_param(&mut self) -> Result<Option<(String, String)>, (usize, String)> {
        let name = self.parse_name()?;
        if name.is_empty() {
            return Ok(None);
        }

        self.skip_whitespace();
        if self.peek() != Some(b'=') {
            return Err(self.error("'=' expected"));
        }
        self.pos += 1;
        self.skip_whitespace();

        let value = if self.peek() == Some(b'"') {
            self.parse_quoted_value()?
        } else {
            self.parse_bare_value()?
        };

        Ok(Some((name, value)))
    }

    fn parse_declaration(
        &mut self,
    ) -> Result<Declaration, (usize, String)> {
        if let Some(section) = self.parse_section()? {
            return Ok(Declaration::Section(section));
        }
        if let Some((name, value)) = self.parse_param()? {
            return Ok(Declaration::Param { name, value });
        }
        Ok(Declaration::Empty)
    }

    /// Consumes a trailing comment, if present.
    fn skip_comment(&mut self) {
        if self.peek() == Some(b'#') {
            self.pos = self.bytes.len();
        }
    }
}

/// Parses a whole configuration buffer, invoking the callback for every
/// parameter.
pub(crate) fn parse(data: &[u8], callback: &mut ParamCallback<'_>) -> Result<(), ConfParseError> {
    let mut section: Option<String> = None;

    for (index, raw_line) in data.split(|&byte| byte == b'\n').enumerate() {
        let line_number = index + 1;
        let line = raw_line.strip_suffix(b"\r").unwrap_or(raw_line);

        let fail = |(offset, message): (usize, String)| ConfParseError {
            line: line_number,
            column: offset + 1,
            message,
        };

        let mut parser = LineParser::new(line);
        parser.skip_whitespace();

        let decl_start = parser.pos;
        match parser.parse_declaration().map_err(fail)? {
            Declaration::Section(name) => section = Some(name),
            Declaration::Param { name, value } => {
                let Some(current) = section.as_deref() else {
                    return Err(ConfParseError {
                        line: line_number,
                        column: decl_start + 1,
                        message: "Parameters must have a corresponding section".into(),
                    });
                };
                callback(current, &name, &value).map_err(|message| ConfParseError {
                    line: line_number,
                    column: decl_start + 1,
                    message,
                })?;
            }
            Declaration::Empty => {}
        }

        parser.skip_whitespace();
        parser.skip_comment();
        if parser.pos != line.len() {
            return Err(fail(parser.error("Expected end of line")));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(data: &str) -> Result<Vec<(String, String, String)>, ConfParseError> {
        let mut seen = Vec::new();
        parse(data.as_bytes(), &mut |section, name, value| {
            seen.push((section.to_owned(), name.to_owned(), value.to_owned()));
            Ok(())
        })?;
        Ok(seen)
    }

    #[test]
    fn parses_sections_parameters_and_comments() {
        let seen = collect(
            "# guacd configuration\n\
             [server]\n\
             bind_host = localhost   # trailing comment\n\
             bind_port = 4822\n\
             \n\
             [daemon]\n\
             log_level = debug\n",
        )
        .expect("parse");

        assert_eq!(
            seen,
            vec![
                ("server".into(), "bind_host".into(), "localhost".into()),
                ("server".into(), "bind_port".into(), "4822".into()),
                ("daemon".into(), "log_level".into(), "debug".into()),
            ]
        );
    }

    #[test]
    fn quoted_values_support_escapes() {
        let seen = collect(
            "[daemon]\n\
             pid_file = \"/var/run/spaced dir/guacd.pid\"\n\
             motd = \"say \\\"hi\\\" \\\\ done\"\n",
        )
        .expect("parse");

        assert_eq!(seen[0].2, "/var/run/spaced dir/guacd.pid");
        assert_eq!(seen[1].2, "say \"hi\" \\ done");
    }

    #[test]
    fn parameter_outside_section_is_an_error() {
        let err = collect("bind_host = localhost\n").expect_err("no section");
        assert_eq!(err.line, 1);
        assert_eq!(err.column, 1);
        assert_eq!(err.message, "Parameters must have a corresponding section");
    }

    #[test]
    fn unterminated_section_reports_position() {
        let err = collect("[server\n").expect_err("missing bracket");
        assert_eq!(err.line, 1);
        assert_eq!(err.column, 8);
        assert_eq!(err.message, "']' expected");
    }

    #[test]
    fn missing_equals_is_an_error() {
        let err = collect("[server]\nbind_host localhost\n").expect_err("missing equals");
        assert_eq!(err.line, 2);
        assert_eq!(err.message, "'=' expected");
    }

    #[test]
    fn empty_unquoted_value_is_an_error() {
        let err = collect("[server]\nbind_host =\n").expect_err("empty value");
        assert_eq!(err.line, 2);
        assert_eq!(err.message, "Unquoted values must contain at least one character");
    }

    #[test]
    fn unterminated_quote_is_an_error() {
        let err = collect("[server]\nbind_host = \"open\n").expect_err("open quote");
        assert_eq!(err.message, "'\"' expected");
    }

    #[test]
    fn garbage_after_declaration_is_an_error() {
        let err = collect("[server] trailing\n").expect_err("trailing");
        assert_eq!(err.line, 1);
        assert_eq!(err.message, "Expected end of line");
    }

    #[test]
    fn callback_errors_point_at_the_parameter() {
        let err = parse(b"[server]\n   unknown = 1\n", &mut |_, _, _| {
            Err("Invalid parameter or section name".into())
        })
        .expect_err("callback rejection");
        assert_eq!(err.line, 2);
        assert_eq!(err.column, 4);
        assert_eq!(err.message, "Invalid parameter or section name");
    }

    #[test]
    fn crlf_line_endings_are_accepted() {
        let seen = collect("[server]\r\nbind_port = 4822\r\n").expect("parse");
        assert_eq!(seen.len(), 1);
    }

    #[test]
    fn overlong_names_are_rejected() {
        let long = "x".repeat(256);
        let err = collect(&format!("[{long}]\n")).expect_err("long name");
        assert_eq!(err.message, "Names can be no more than 255 characters long");
    }
}
