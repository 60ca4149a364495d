use async_trait::async_trait;

use super::{Command, CommandResult, Session};
use crate::consts::format_number;

pub struct InfoCommand;

#[async_trait]
impl Command for InfoCommand {
    fn name(&self) -> &str {
        "/info"
    }

    fn usage(&self) -> &str {
        "<topic>"
    }

    fn description(&self) -> &str {
        "show offsets and message counts per partition"
    }

    async fn execute(&self, args: &str, session: &Session<'_>) -> CommandResult {
        if args.is_empty() {
            println!("usage: /info <topic>");
            return CommandResult::Handled;
        }
        match session.calculator.topic_info(args).await {
            Ok(ranges) if ranges.is_empty() => println!("  topic '{args}' has no partitions"),
            Ok(ranges) => {
                println!("  {:>9}  {:>12}  {:>12}  {:>12}", "partition", "begin", "end", "messages");
                for r in ranges {
                    println!(
                        "  {:>9}  {:>12}  {:>12}  {:>12}",
                        r.partition,
                        r.begin_offset,
                        r.end_offset,
                        format_number(r.message_count.max(0) as u64),
                    );
                }
            }
            Err(e) => println!("error: {e}"),
        }
        CommandResult::Handled
    }
}
