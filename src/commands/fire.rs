use async_trait::async_trait;

use super::{Command, CommandResult, Session, print_json};

/// `/async`: send without waiting.
pub struct AsyncCommand;

#[async_trait]
impl Command for AsyncCommand {
    fn name(&self) -> &str {
        "/async"
    }

    fn usage(&self) -> &str {
        "<expression>"
    }

    fn description(&self) -> &str {
        "send a calculation without waiting; fetch it later with /reply"
    }

    async fn execute(&self, args: &str, session: &Session<'_>) -> CommandResult {
        if args.is_empty() {
            println!("usage: /async <expression>");
            return CommandResult::Handled;
        }
        print_json(&session.calculator.calculate_async(args));
        CommandResult::Handled
    }
}
