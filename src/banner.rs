//! Startup banner and session summary display.

use crate::consts::{AUTHOR, HOMEPAGE, REPO, format_number};
use crate::worker::StatsSnapshot;

/// Session configuration for display in the startup banner.
pub struct BannerInfo<'a> {
    pub database: &'a str,
    pub request_topic: &'a str,
    pub reply_topic: &'a str,
    pub timeout_secs: u64,
    pub worker: &'a str,
}

/// Print the startup banner with session info.
pub fn print_banner(info: &BannerInfo) {
    println!(
        r#"
   ╔═══════════════════════════════════════╗
   ║            C O U R I E R              ║
   ║    every question finds its answer    ║
   ╚═══════════════════════════════════════╝

   version   {}
   by        {}
   home      {}
   repo      {}
   database  {}
   requests  {}
   replies   {}
   timeout   {}s
   worker    {}

   type an expression, or /help
"#,
        env!("CARGO_PKG_VERSION"),
        AUTHOR,
        HOMEPAGE,
        REPO,
        info.database,
        info.request_topic,
        info.reply_topic,
        info.timeout_secs,
        info.worker,
    );
}

/// Print the session summary (worker totals + farewell).
pub fn print_session_summary(stats: Option<StatsSnapshot>) {
    if let Some(stats) = stats.filter(|s| s.consumed > 0) {
        println!(
            "session: {:>6} requests, {:>6} replies, {:>6} lost",
            format_number(stats.consumed),
            format_number(stats.replied),
            format_number(stats.delivery_losses),
        );
    }
    println!("goodbye.");
}
