//! Project-wide constants.

use std::path::PathBuf;
use std::time::Duration;

pub const AUTHOR: &str = env!("CARGO_PKG_AUTHORS");
pub const HOMEPAGE: &str = env!("CARGO_PKG_HOMEPAGE");
pub const REPO: &str = env!("CARGO_PKG_REPOSITORY");

pub const REQUEST_TOPIC: &str = "math-requests";
pub const REPLY_TOPIC: &str = "math-replies";

/// Where `message` sends plain text.
pub const STRING_TOPIC: &str = "string-messages";

/// Where `json` sends [`Message`](crate::wire::Message) records.
pub const JSON_TOPIC: &str = "json-messages";

/// Consumer group the reply worker commits under.
pub const DEFAULT_WORKER_GROUP: &str = "math-consumer-group";

/// Consumer group of the broker's reply listener.
pub const DEFAULT_REPLY_GROUP: &str = "math-reply-consumer";

pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(30);

/// Partitions given to topics the application creates itself.
pub const DEFAULT_PARTITIONS: u32 = 3;

/// Messages returned by `read` when no count is given.
pub const DEFAULT_READ_MAX: usize = 10;

/// Database name used when `--db` is not given.
pub const DB_FILE: &str = "courier.db";

/// Default database path: `~/.courier/courier.db`, or the working
/// directory when there is no home. One file holds the log and config.
pub fn default_db_path() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".courier"))
        .unwrap_or_default()
        .join(DB_FILE)
}

/// Format a number with comma separators (e.g. 1,234,567).
pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + s.len() / 3);
    for (i, c) in s.chars().enumerate() {
        if i > 0 && (s.len() - i).is_multiple_of(3) {
            result.push(',');
        }
        result.push(c);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consts_from_cargo_toml() {
        assert!(AUTHOR.contains("Assaf Sapir"));
        assert!(HOMEPAGE.contains("sapir.io"));
        assert!(REPO.contains("github.com/assapir/courier"));
    }

    #[test]
    fn default_db_path_ends_with_file_name() {
        assert!(default_db_path().ends_with(DB_FILE));
    }

    #[test]
    fn format_number_small() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
    }

    #[test]
    fn format_number_groups_thousands() {
        assert_eq!(format_number(1_000), "1,000");
        assert_eq!(format_number(123_456), "123,456");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }
}
