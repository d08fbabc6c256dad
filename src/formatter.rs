use std::borrow::Cow;

use rustpython_parser::{ast::Suite, lexer::lex, Mode, Parse, Tok};

use crate::config::FormatterConfig;
use crate::error::FormatError;

/// Deterministic source reformatting. Implementations either return the
/// canonical text or fail; they never return partially formatted output.
pub trait SourceFormatter: Send + Sync {
    fn format(&self, source: &str) -> Result<String, FormatError>;
}

pub fn build_formatter(config: &FormatterConfig) -> Result<Box<dyn SourceFormatter>, FormatError> {
    Ok(match config {
        FormatterConfig::Lexical => Box::new(LexicalFormatter),
        FormatterConfig::Command { command } => Box::new(CommandFormatter::new(command)?),
    })
}

/// Whitespace, comment and quote normalization driven by the Python lexer.
/// Input that does not parse as a module is rejected, and so is any result
/// that would not parse.
#[derive(Debug, Default, Clone, Copy)]
pub struct LexicalFormatter;

impl SourceFormatter for LexicalFormatter {
    fn format(&self, source: &str) -> Result<String, FormatError> {
        let source = source.replace("\r\n", "\n");
        Suite::parse(&source, "<test>").map_err(|e| FormatError::Unparsable(e.to_string()))?;

        let strings = string_spans(&source)?;
        let requoted = requote(&source, &strings);
        let formatted = layout(&requoted, &strings);
        Suite::parse(&formatted, "<test>").map_err(|e| FormatError::Unparsable(e.to_string()))?;
        Ok(formatted)
    }
}

fn string_spans(source: &str) -> Result<Vec<(usize, usize)>, FormatError> {
    let mut spans = Vec::new();
    for token in lex(source, Mode::Module) {
        let (tok, range) = token.map_err(|e| FormatError::Unparsable(format!("{e:?}")))?;
        if let Tok::String { .. } = tok {
            spans.push((usize::from(range.start()), usize::from(range.end())));
        }
    }
    Ok(spans)
}

// Quote swaps keep every literal the same length, so spans stay valid.
// A literal touching another quote (`''"b"`) is left alone: swapping it
// would fuse the two into a triple-quote opener.
fn requote(source: &str, strings: &[(usize, usize)]) -> String {
    let is_quote = |c: Option<char>| matches!(c, Some('\'' | '"'));
    let mut out = String::with_capacity(source.len());
    let mut cursor = 0;
    for &(start, end) in strings {
        out.push_str(&source[cursor..start]);
        let literal = &source[start..end];
        if is_quote(source[..start].chars().next_back()) || is_quote(source[end..].chars().next()) {
            out.push_str(literal);
        } else {
            out.push_str(&prefer_double_quotes(literal));
        }
        cursor = end;
    }
    out.push_str(&source[cursor..]);
    out
}

fn prefer_double_quotes(literal: &str) -> Cow<'_, str> {
    let Some(prefix_len) = literal.find(['\'', '"']) else {
        return Cow::Borrowed(literal);
    };
    let (prefix, rest) = literal.split_at(prefix_len);
    let (quote, inner) = if rest.len() >= 6 && rest.starts_with("'''") && rest.ends_with("'''") {
        ("\"\"\"", &rest[3..rest.len() - 3])
    } else if rest.len() >= 2 && rest.starts_with('\'') && rest.ends_with('\'') {
        ("\"", &rest[1..rest.len() - 1])
    } else {
        return Cow::Borrowed(literal);
    };
    if inner.contains(['"', '\\']) {
        return Cow::Borrowed(literal);
    }
    Cow::Owned(format!("{prefix}{quote}{inner}{quote}"))
}

fn layout(source: &str, strings: &[(usize, usize)]) -> String {
    let continues_string = |offset: usize| strings.iter().any(|&(s, e)| s < offset && offset < e);
    let in_literal = |offset: usize| strings.iter().any(|&(s, e)| s <= offset && offset < e);

    let mut lines: Vec<(String, bool)> = Vec::new();
    let mut offset = 0;
    for raw in source.split('\n') {
        let start = offset;
        let end = start + raw.len();
        offset = end + 1;

        let trimmable = !in_literal(end);
        let line = if continues_string(start) {
            (if trimmable { raw.trim_end() } else { raw }).to_owned()
        } else {
            code_line(raw, start, trimmable, &in_literal)
        };
        let blank = !continues_string(start) && line.is_empty();
        lines.push((line, blank));
    }

    let mut out = String::with_capacity(source.len());
    let mut pending_blank = false;
    for (line, blank) in lines {
        if blank {
            pending_blank = !out.is_empty();
            continue;
        }
        if pending_blank {
            out.push('\n');
            pending_blank = false;
        }
        out.push_str(&line);
        out.push('\n');
    }
    out
}

fn code_line(raw: &str, start: usize, trimmable: bool, in_literal: &dyn Fn(usize) -> bool) -> String {
    let hash = raw
        .char_indices()
        .find(|&(i, c)| c == '#' && !in_literal(start + i))
        .map(|(i, _)| i);
    let Some(hash) = hash else {
        return (if trimmable { raw.trim_end() } else { raw }).to_owned();
    };

    let (code, comment) = raw.split_at(hash);
    let comment = normalize_comment(comment.trim_end());
    if code.trim().is_empty() {
        format!("{code}{comment}")
    } else {
        format!("{}  {}", code.trim_end(), comment)
    }
}

fn normalize_comment(comment: &str) -> Cow<'_, str> {
    let body = &comment[1..];
    if body.is_empty() || body.starts_with([' ', '\t', '!', ':', '#']) {
        Cow::Borrowed(comment)
    } else {
        Cow::Owned(format!("# {body}"))
    }
}

/// Pipes source through an external formatter such as `black -q -`.
#[derive(Debug, Clone)]
pub struct CommandFormatter {
    command: String,
    program: String,
    args: Vec<String>,
}

impl CommandFormatter {
    pub fn new(command: &str) -> Result<Self, FormatError> {
        let mut tokens = shell_words::split(command)
            .map_err(|e| FormatError::InvalidCommand(format!("{command}: {e}")))?
            .into_iter();
        let program = tokens
            .next()
            .ok_or_else(|| FormatError::InvalidCommand("empty formatter command".to_owned()))?;
        Ok(Self {
            command: command.to_owned(),
            program,
            args: tokens.collect(),
        })
    }
}

impl SourceFormatter for CommandFormatter {
    fn format(&self, source: &str) -> Result<String, FormatError> {
        let output = duct::cmd(&self.program, &self.args)
            .stdin_bytes(source.as_bytes())
            .stdout_capture()
            .stderr_capture()
            .unchecked()
            .run()?;
        if !output.status.success() {
            return Err(FormatError::Command {
                command: self.command.clone(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            });
        }
        String::from_utf8(output.stdout).map_err(|e| FormatError::Command {
            command: self.command.clone(),
            stderr: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn format(source: &str) -> String {
        LexicalFormatter.format(source).unwrap()
    }

    #[test]
    fn rejects_invalid_source() {
        let err = LexicalFormatter.format("def test_x(:\n").unwrap_err();
        assert!(matches!(err, FormatError::Unparsable(_)));
        // Indented continuation with a decorator cannot stand alone.
        assert!(LexicalFormatter.format("@dec\n    def test_x(self):\n        pass").is_err());
    }

    #[test]
    fn prefers_double_quotes_when_safe() {
        let source = "def test_q():\n    a = 'x'\n    b = 'say \"hi\"'\n    c = r'\\d+'\n    d = f'{a}'\n";
        assert_eq!(
            format(source),
            "def test_q():\n    a = \"x\"\n    b = 'say \"hi\"'\n    c = r'\\d+'\n    d = f\"{a}\"\n"
        );
    }

    #[test]
    fn converts_triple_single_quotes() {
        assert_eq!(
            format("def test_doc():\n    '''doc'''\n"),
            "def test_doc():\n    \"\"\"doc\"\"\"\n"
        );
    }

    #[test]
    fn normalizes_comments() {
        let source = "def test_c():\n    #leading\n    x = 1 # trailing\n    y = 2#tight\n    #!keep\n";
        assert_eq!(
            format(source),
            "def test_c():\n    # leading\n    x = 1  # trailing\n    y = 2  # tight\n    #!keep\n"
        );
    }

    #[test]
    fn hash_inside_strings_is_not_a_comment() {
        let source = "def test_h():\n    s = \"a#b\"  # real\n";
        assert_eq!(format(source), source);
    }

    #[test]
    fn trims_whitespace_and_blank_lines_outside_strings() {
        let source = "\n\ndef test_w():   \n    x = 1\n\n\n\n    y = \"\"\"keep   \n\n\n   lines\"\"\"\n\n\n";
        assert_eq!(
            format(source),
            "def test_w():\n    x = 1\n\n    y = \"\"\"keep   \n\n\n   lines\"\"\"\n"
        );
    }

    #[test]
    fn adjacent_literals_are_not_fused() {
        let source = "def test_concat():\n    x = ''\"b\"\n    y = \"a\"''\n    assert x == 'b'\n";
        let formatted = format(source);
        assert_eq!(
            formatted,
            "def test_concat():\n    x = ''\"b\"\n    y = \"a\"''\n    assert x == \"b\"\n"
        );
        assert!(Suite::parse(&formatted, "<test>").is_ok());
        assert_eq!(format(&formatted), formatted);
    }

    #[test]
    fn converts_crlf() {
        assert_eq!(format("def test_n():\r\n    pass\r\n"), "def test_n():\n    pass\n");
    }

    #[test]
    fn formatting_is_idempotent() {
        let samples = [
            "def test_a(): assert True",
            "def test_b():\n    x = {'k': 'v'}  #note\n\n\n    return x\n",
            "@pytest.mark.parametrize('a', [1,2])\ndef test_c(a):\n    '''Doc.\n\n    More.'''\n    assert a\n",
            "def test_d(self):\n        self.assertEqual(f'{1}', '1')   \n",
        ];
        for sample in samples {
            let once = format(sample);
            assert_eq!(format(&once), once, "not a fixed point for {sample:?}");
        }
    }

    #[cfg(unix)]
    #[test]
    fn command_formatter_uses_stdout() {
        let formatter = CommandFormatter::new("cat").unwrap();
        assert_eq!(formatter.format("x = 1\n").unwrap(), "x = 1\n");
    }

    #[cfg(unix)]
    #[test]
    fn command_formatter_fails_on_nonzero_exit() {
        let formatter = CommandFormatter::new("sh -c 'cat >/dev/null; echo nope >&2; exit 3'").unwrap();
        match formatter.format("x = 1\n").unwrap_err() {
            FormatError::Command { stderr, .. } => assert_eq!(stderr, "nope"),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn empty_command_is_rejected() {
        assert!(matches!(
            CommandFormatter::new("  "),
            Err(FormatError::InvalidCommand(_))
        ));
    }
}
