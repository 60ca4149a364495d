//! Terminal spinner shown while a call waits for its reply.

use std::io::Write;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

const FRAMES: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"];

const INTERVAL: Duration = Duration::from_millis(80);

/// Writes to stderr so results on stdout stay clean. Shows whole seconds
/// waited once the first one has passed.
pub struct Spinner {
    handle: JoinHandle<()>,
    cancel: watch::Sender<bool>,
}

impl Spinner {
    pub fn start(message: &str) -> Self {
        let (cancel_tx, mut cancel_rx) = watch::channel(false);
        let message = message.to_string();

        let handle = tokio::spawn(async move {
            let started = Instant::now();
            let mut i = 0;
            loop {
                let frame = FRAMES[i % FRAMES.len()];
                eprint!("\x1b[2K\r{}", render(frame, &message, started.elapsed()));
                let _ = std::io::stderr().flush();

                tokio::select! {
                    _ = tokio::time::sleep(INTERVAL) => {}
                    _ = cancel_rx.changed() => break,
                }
                i += 1;
            }
            eprint!("\x1b[2K\r");
            let _ = std::io::stderr().flush();
        });

        Self {
            handle,
            cancel: cancel_tx,
        }
    }

    /// Stop the spinner and clear its line.
    pub async fn stop(self) {
        let _ = self.cancel.send(true);
        let _ = self.handle.await;
    }
}

fn render(frame: &str, message: &str, elapsed: Duration) -> String {
    match elapsed.as_secs() {
        0 => format!("{frame} {message}"),
        secs => format!("{frame} {message} ({secs}s)"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_are_single_braille_chars() {
        for frame in FRAMES {
            assert_eq!(frame.chars().count(), 1);
        }
    }

    #[test]
    fn render_adds_seconds_after_the_first() {
        assert_eq!(render("⠋", "waiting", Duration::from_millis(300)), "⠋ waiting");
        assert_eq!(render("⠋", "waiting", Duration::from_secs(4)), "⠋ waiting (4s)");
    }

    #[tokio::test]
    async fn starts_and_stops() {
        let spinner = Spinner::start("waiting for reply");
        tokio::time::sleep(Duration::from_millis(100)).await;
        spinner.stop().await;
    }
}
