use async_trait::async_trait;

use super::{Command, CommandResult, Session};

pub struct ReplyCommand;

#[async_trait]
impl Command for ReplyCommand {
    fn name(&self) -> &str {
        "/reply"
    }

    fn usage(&self) -> &str {
        "<correlation-id>"
    }

    fn description(&self) -> &str {
        "look up the reply for an earlier /async request"
    }

    async fn execute(&self, args: &str, session: &Session<'_>) -> CommandResult {
        if args.is_empty() {
            println!("usage: /reply <correlation-id>");
            return CommandResult::Handled;
        }
        match session.calculator.find_reply(args).await {
            Ok(Some(reply)) => match reply.outcome() {
                Ok(result) => println!("=> {result}"),
                Err(error) => println!("error: {error}"),
            },
            Ok(None) => println!("  no reply for {args} yet"),
            Err(e) => println!("error: {e}"),
        }
        CommandResult::Handled
    }
}
