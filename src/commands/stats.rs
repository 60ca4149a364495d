use async_trait::async_trait;

use super::{Command, CommandResult, Session};
use crate::consts::format_number;

pub struct StatsCommand;

#[async_trait]
impl Command for StatsCommand {
    fn name(&self) -> &str {
        "/stats"
    }

    fn description(&self) -> &str {
        "show in-flight calls and worker counters"
    }

    async fn execute(&self, _args: &str, session: &Session<'_>) -> CommandResult {
        let broker = session.calculator.broker();
        println!(
            "  listener   {}",
            if broker.is_ready() { "ready" } else { "not ready" }
        );
        println!("  in flight  {}", broker.in_flight());
        println!("  database   {}", session.db_path);
        match session.worker_stats {
            Some(stats) => {
                println!("  consumed   {}", format_number(stats.consumed));
                println!("  replied    {}", format_number(stats.replied));
                println!("  eval errs  {}", format_number(stats.evaluation_errors));
                println!("  lost       {}", format_number(stats.delivery_losses));
            }
            None => println!("  worker     not running in this process"),
        }
        CommandResult::Handled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::tests::{session, test_calculator};
    use crate::worker::StatsSnapshot;

    #[tokio::test]
    async fn prints_with_and_without_worker() {
        let calculator = test_calculator().await;
        let mut s = session(&calculator);
        assert_eq!(StatsCommand.execute("", &s).await, CommandResult::Handled);
        s.worker_stats = Some(StatsSnapshot {
            consumed: 1_200,
            ..StatsSnapshot::default()
        });
        assert_eq!(StatsCommand.execute("", &s).await, CommandResult::Handled);
    }
}
