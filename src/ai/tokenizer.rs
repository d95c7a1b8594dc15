//! Model reply parsing
//!
//! A reply is split into trimmed, non-blank lines. Lines starting with `#`
//! are commentary; every other line is one action:
//!
//! ```text
//! tether swipe 100 900 100 200 --duration 300
//! └─────┘ └───┘ └────────────┘ └────────────┘
//! program  cmd   positionals    flags
//! ```

use crate::protocol::{Command, Flags};

use super::prompt::{COMMENT_PREFIX, PROGRAM_WORD};

/// One parsed reply line.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplyLine {
    /// Shown to the user verbatim, never executed.
    Comment(String),
    Action(Action),
}

/// An executable command extracted from a reply line.
#[derive(Debug, Clone, PartialEq)]
pub struct Action {
    /// The line as the model wrote it.
    pub line: String,
    pub cmd: String,
    pub args: Vec<String>,
    pub flags: Flags,
}

impl Action {
    /// Wire command with a fresh id.
    pub fn to_command(&self) -> Command {
        Command::new(self.cmd.clone(), self.args.clone(), self.flags.clone())
    }
}

/// Trimmed non-blank lines of `text`.
pub fn parse_lines(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

/// Classify every line of a reply. Lines with no command word are dropped.
pub fn parse_reply(text: &str) -> Vec<ReplyLine> {
    parse_lines(text)
        .into_iter()
        .filter_map(|line| {
            if line.starts_with(COMMENT_PREFIX) {
                Some(ReplyLine::Comment(line))
            } else {
                parse_action(&line).map(ReplyLine::Action)
            }
        })
        .collect()
}

/// Split on whitespace, honoring single- and double-quoted spans.
///
/// A quote only closes on the same character that opened it. Quotes are
/// removed from the output.
pub fn tokenize(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut quote: Option<char> = None;

    for c in line.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => current.push(c),
            None if c == '"' || c == '\'' => {
                quote = Some(c);
                in_token = true;
            }
            None if c.is_whitespace() => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            None => {
                current.push(c);
                in_token = true;
            }
        }
    }
    if in_token {
        tokens.push(current);
    }
    tokens
}

/// Separate `--flag [value]` pairs from positionals.
///
/// The token after a flag is its value unless it is itself a flag; a flag
/// without a value is `"true"`.
pub fn split_flags(tokens: &[String]) -> (Vec<String>, Flags) {
    let mut args = Vec::new();
    let mut flags = Flags::new();

    let mut i = 0;
    while i < tokens.len() {
        match tokens[i].strip_prefix("--") {
            Some(key) => {
                match tokens.get(i + 1).filter(|next| !next.starts_with("--")) {
                    Some(value) => {
                        flags.insert(key.to_string(), value.clone());
                        i += 2;
                    }
                    None => {
                        flags.insert(key.to_string(), "true".to_string());
                        i += 1;
                    }
                }
            }
            None => {
                args.push(tokens[i].clone());
                i += 1;
            }
        }
    }
    (args, flags)
}

/// Parse one action line. `None` if the line holds no command word.
pub fn parse_action(line: &str) -> Option<Action> {
    let tokens = tokenize(line);
    let mut rest = tokens.as_slice();
    if rest.first().map(String::as_str) == Some(PROGRAM_WORD) {
        rest = &rest[1..];
    }

    let (cmd, rest) = rest.split_first()?;
    let (args, flags) = split_flags(rest);
    Some(Action {
        line: line.to_string(),
        cmd: cmd.clone(),
        args,
        flags,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quoted_positional_and_flags() {
        let action = parse_action(r#"open "a b" --x 1 --y"#).unwrap();
        assert_eq!(action.cmd, "open");
        assert_eq!(action.args, vec!["a b".to_string()]);
        assert_eq!(action.flags.get("x").map(String::as_str), Some("1"));
        assert_eq!(action.flags.get("y").map(String::as_str), Some("true"));
        assert_eq!(action.flags.len(), 2);
    }

    #[test]
    fn test_program_word_is_dropped() {
        let action = parse_action("tether sms send +1234567890 \"I'm on my way\"").unwrap();
        assert_eq!(action.cmd, "sms");
        assert_eq!(action.args, vec!["send", "+1234567890", "I'm on my way"]);
        assert!(action.flags.is_empty());
    }

    #[test]
    fn test_flag_followed_by_flag() {
        let action = parse_action("tether notifs --clear-all --app slack").unwrap();
        assert_eq!(action.flags["clear-all"], "true");
        assert_eq!(action.flags["app"], "slack");
        assert!(action.args.is_empty());
    }

    #[test]
    fn test_tokenize_quotes_and_whitespace() {
        assert_eq!(
            tokenize("  type  'say \"hi\"'\tnow "),
            vec!["type", "say \"hi\"", "now"]
        );
        assert_eq!(tokenize(r#"clipboard set """#), vec!["clipboard", "set", ""]);
        assert!(tokenize("   ").is_empty());
    }

    #[test]
    fn test_bare_program_word_is_not_an_action() {
        assert_eq!(parse_action("tether"), None);
        assert_eq!(parse_action(""), None);
    }

    #[test]
    fn test_parse_reply_classifies_lines() {
        let reply = "\n  tether key home \r\n# cannot map to tether commands: no such app\n\n tether dnd on";
        let lines = parse_reply(reply);
        assert_eq!(lines.len(), 3);
        assert!(matches!(&lines[0], ReplyLine::Action(a) if a.cmd == "key" && a.args == ["home"]));
        assert!(
            matches!(&lines[1], ReplyLine::Comment(c) if c == "# cannot map to tether commands: no such app")
        );
        assert!(matches!(&lines[2], ReplyLine::Action(a) if a.line == "tether dnd on"));
    }
}
