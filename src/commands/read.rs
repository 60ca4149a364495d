use async_trait::async_trait;

use super::{Command, CommandResult, Session, print_json};
use crate::consts::DEFAULT_READ_MAX;

pub struct ReadCommand;

/// Split `<topic> [max] [latest]` into its parts.
fn parse_args(args: &str) -> Result<(&str, usize, bool), String> {
    let mut parts = args.split_whitespace();
    let topic = parts.next().ok_or("usage: /read <topic> [max] [latest]")?;
    let mut max = DEFAULT_READ_MAX;
    let mut from_beginning = true;
    for part in parts {
        match part {
            "latest" | "--latest" => from_beginning = false,
            n => max = n.parse().map_err(|_| format!("not a count: '{n}'"))?,
        }
    }
    Ok((topic, max, from_beginning))
}

#[async_trait]
impl Command for ReadCommand {
    fn name(&self) -> &str {
        "/read"
    }

    fn usage(&self) -> &str {
        "<topic> [max] [latest]"
    }

    fn description(&self) -> &str {
        "read messages from the beginning, or the last N per partition"
    }

    async fn execute(&self, args: &str, session: &Session<'_>) -> CommandResult {
        let (topic, max, from_beginning) = match parse_args(args) {
            Ok(parsed) => parsed,
            Err(e) => {
                println!("{e}");
                return CommandResult::Handled;
            }
        };
        match session
            .calculator
            .read_messages(topic, max, from_beginning)
            .await
        {
            Ok(messages) => print_json(&messages),
            Err(e) => println!("error: {e}"),
        }
        CommandResult::Handled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_only_uses_defaults() {
        assert_eq!(
            parse_args("math-replies"),
            Ok(("math-replies", DEFAULT_READ_MAX, true))
        );
    }

    #[test]
    fn count_and_latest_in_any_order() {
        assert_eq!(parse_args("t 5 latest"), Ok(("t", 5, false)));
        assert_eq!(parse_args("t latest 5"), Ok(("t", 5, false)));
    }

    #[test]
    fn bad_input() {
        assert!(parse_args("").is_err());
        assert!(parse_args("t -3").is_err());
    }
}
