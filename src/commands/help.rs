use async_trait::async_trait;

use super::{Command, CommandResult, Session};

/// Listed like any other command; the registry prints the text itself.
pub struct HelpCommand;

#[async_trait]
impl Command for HelpCommand {
    fn name(&self) -> &str {
        "/help"
    }

    fn aliases(&self) -> &[&str] {
        &["/h", "/?"]
    }

    fn description(&self) -> &str {
        "show available commands"
    }

    async fn execute(&self, _args: &str, _session: &Session<'_>) -> CommandResult {
        CommandResult::Handled
    }
}
