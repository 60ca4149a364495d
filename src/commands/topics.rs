use async_trait::async_trait;

use super::{Command, CommandResult, Session};

pub struct TopicsCommand;

#[async_trait]
impl Command for TopicsCommand {
    fn name(&self) -> &str {
        "/topics"
    }

    fn description(&self) -> &str {
        "list topics (internal ones hidden)"
    }

    async fn execute(&self, _args: &str, session: &Session<'_>) -> CommandResult {
        match session.calculator.list_topics().await {
            Ok(topics) if topics.is_empty() => println!("  no topics"),
            Ok(topics) => {
                for topic in topics {
                    println!("  {topic}");
                }
            }
            Err(e) => println!("error: {e}"),
        }
        CommandResult::Handled
    }
}
