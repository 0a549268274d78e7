//! Tagged service-message grammar shared by the runner's stdout and stdin.
//!
//! Lines look like `##tool["command"]` or `##tool["command",{key:"value"}]`.
//! Parsing is pure string work decoupled from any process I/O.

/// One parsed service message. `args` is the raw blob between the braces,
/// without them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceMessage<'a> {
    pub command: &'a str,
    pub args: Option<&'a str>,
}

/// Matches `line` against the tagged grammar for `prefix`. The tag may start
/// anywhere in the line; trailing content after the closing bracket is
/// ignored. Returns `None` for anything that is not a service message.
pub fn parse_line<'a>(prefix: &str, line: &'a str) -> Option<ServiceMessage<'a>> {
    let start = line.find(prefix)?;
    let rest = line[start + prefix.len()..].strip_prefix("[\"")?;
    let quote = rest.find('"')?;
    let command = &rest[..quote];
    if command.is_empty() {
        return None;
    }

    let tail = &rest[quote + 1..];
    if tail.starts_with(']') {
        return Some(ServiceMessage {
            command,
            args: None,
        });
    }

    let blob = tail.strip_prefix(',')?.trim_start().strip_prefix('{')?;
    let end = blob.rfind("}]")?;
    Some(ServiceMessage {
        command,
        args: Some(&blob[..end]),
    })
}

/// Serializes an outbound command line. Values are double-quoted with
/// embedded quotes substituted by a backtick (the wire format does not
/// support escaping); absent values are emitted as `null`.
pub fn format_command(prefix: &str, command: &str, args: &[(&str, Option<&str>)]) -> String {
    let mut out = String::with_capacity(prefix.len() + command.len() + 16);
    out.push_str(prefix);
    out.push_str("[\"");
    out.push_str(command);
    out.push('"');

    if !args.is_empty() {
        out.push_str(",{");
        for (i, (key, value)) in args.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            out.push_str(key);
            out.push(':');
            match value {
                Some(v) => {
                    out.push('"');
                    out.push_str(&v.replace('"', "`"));
                    out.push('"');
                }
                None => out.push_str("null"),
            }
        }
        out.push('}');
    }

    out.push(']');
    out
}

/// Extracts a quoted string field (e.g. `"filename":"..."`) from an args
/// blob, undoing JSON-style backslash escapes produced by the runner.
pub fn string_field(args: &str, key: &str) -> Option<String> {
    let needle = format!("\"{key}\"");
    let at = args.find(&needle)?;
    let rest = args[at + needle.len()..].trim_start();
    let rest = rest.strip_prefix(':')?.trim_start().strip_prefix('"')?;

    let mut out = String::new();
    let mut chars = rest.chars();
    while let Some(c) = chars.next() {
        match c {
            '"' => return Some(out),
            '\\' => match chars.next()? {
                'n' => out.push('\n'),
                'r' => out.push('\r'),
                't' => out.push('\t'),
                other => out.push(other),
            },
            other => out.push(other),
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const PREFIX: &str = "##dotMemory";

    #[test]
    fn parses_a_message_without_args() {
        let msg = parse_line(PREFIX, "##dotMemory[\"connected\"]").expect("parse");
        assert_eq!(msg.command, "connected");
        assert_eq!(msg.args, None);
    }

    #[test]
    fn parses_a_message_with_args() {
        let line = "##dotMemory[\"snapshot-saved\",{\"filename\":\"/tmp/a.dmw\"}]";
        let msg = parse_line(PREFIX, line).expect("parse");
        assert_eq!(msg.command, "snapshot-saved");
        assert_eq!(msg.args, Some("\"filename\":\"/tmp/a.dmw\""));
    }

    #[test]
    fn tag_may_start_mid_line() {
        let line = "some noise ##dotMemory[\"connected\",{}] trailing";
        let msg = parse_line(PREFIX, line).expect("parse");
        assert_eq!(msg.command, "connected");
        assert_eq!(msg.args, Some(""));
    }

    #[test]
    fn rejects_non_protocol_lines() {
        assert!(parse_line(PREFIX, "plain output line").is_none());
        assert!(parse_line(PREFIX, "##dotMemory no brackets").is_none());
        assert!(parse_line(PREFIX, "##dotMemory[\"\"]").is_none());
        assert!(parse_line(PREFIX, "##dotMemory[\"cmd\",no-braces]").is_none());
    }

    #[test]
    fn formats_without_args() {
        assert_eq!(
            format_command("##dotTrace", "disconnect", &[]),
            "##dotTrace[\"disconnect\"]"
        );
    }

    #[test]
    fn formats_args_with_quote_substitution_and_null() {
        let line = format_command(
            "##dotMemory",
            "get-snapshot",
            &[("name", Some("say \"hi\"")), ("tag", None)],
        );
        assert_eq!(
            line,
            "##dotMemory[\"get-snapshot\",{name:\"say `hi`\",tag:null}]"
        );
    }

    #[test]
    fn round_trips_through_the_parser() {
        let line = format_command("##tool", "start", &[("mode", Some("full"))]);
        let msg = parse_line("##tool", &line).expect("parse");
        assert_eq!(msg.command, "start");
        assert_eq!(msg.args, Some("mode:\"full\""));
    }

    #[test]
    fn extracts_string_fields_with_unescaping() {
        let args = r#""filename":"C:\\snapshots\\app.dmw","extra":"x""#;
        assert_eq!(
            string_field(args, "filename").as_deref(),
            Some("C:\\snapshots\\app.dmw")
        );
        assert_eq!(string_field(args, "extra").as_deref(), Some("x"));
        assert!(string_field(args, "missing").is_none());
    }
}
