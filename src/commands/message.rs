use async_trait::async_trait;

use super::{Command, CommandResult, Session, print_json};

/// `/message`: plain text to the string topic.
pub struct MessageCommand;

#[async_trait]
impl Command for MessageCommand {
    fn name(&self) -> &str {
        "/message"
    }

    fn aliases(&self) -> &[&str] {
        &["/msg"]
    }

    fn usage(&self) -> &str {
        "[key=<key>] <text>"
    }

    fn description(&self) -> &str {
        "send text to the string topic"
    }

    async fn execute(&self, args: &str, session: &Session<'_>) -> CommandResult {
        let (key, text) = split_key(args);
        if text.is_empty() {
            println!("usage: /message [key=<key>] <text>");
            return CommandResult::Handled;
        }
        match session.calculator.send_message(key, text).await {
            Ok(metadata) => print_json(&metadata),
            Err(e) => println!("error: {e}"),
        }
        CommandResult::Handled
    }
}

/// `/json`: a [`Message`](crate::wire::Message) to the JSON topic.
pub struct JsonCommand;

#[async_trait]
impl Command for JsonCommand {
    fn name(&self) -> &str {
        "/json"
    }

    fn usage(&self) -> &str {
        "<sender> <content>"
    }

    fn description(&self) -> &str {
        "send a JSON message with a fresh id to the JSON topic"
    }

    async fn execute(&self, args: &str, session: &Session<'_>) -> CommandResult {
        let Some((sender, content)) = args
            .split_once(char::is_whitespace)
            .map(|(sender, content)| (sender, content.trim()))
            .filter(|(_, content)| !content.is_empty())
        else {
            println!("usage: /json <sender> <content>");
            return CommandResult::Handled;
        };
        match session.calculator.send_json(content, sender).await {
            Ok((message, _)) => print_json(&message),
            Err(e) => println!("error: {e}"),
        }
        CommandResult::Handled
    }
}

/// Peel a leading `key=<key>` off the arguments.
fn split_key(args: &str) -> (Option<&str>, &str) {
    match args.strip_prefix("key=") {
        Some(rest) => match rest.split_once(char::is_whitespace) {
            Some((key, text)) => (Some(key), text.trim()),
            None => (Some(rest), ""),
        },
        None => (None, args),
    }
}
