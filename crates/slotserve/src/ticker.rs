use std::time::Duration;

use flume::Receiver;
use tokio::task::JoinHandle;

const FRAMES: [char; 4] = ['|', '/', '-', '\\'];

/// Emits spinner frames at a fixed period until dropped.
#[derive(Debug)]
pub struct Ticker {
    frames: Receiver<char>,
    handle: JoinHandle<()>,
}

impl Ticker {
    pub fn spawn(period: Duration) -> Self {
        let (sender, frames) = flume::bounded(1);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            for frame in FRAMES.iter().cycle() {
                interval.tick().await;
                if sender.send_async(*frame).await.is_err() {
                    break;
                }
            }
        });
        Self { frames, handle }
    }

    pub async fn next(&self) -> Option<char> {
        self.frames.recv_async().await.ok()
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Next frame of an optional ticker; pending forever if there is none.
pub async fn next_frame(ticker: &Option<Ticker>) -> Option<char> {
    match ticker {
        Some(ticker) => ticker.next().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_cycle_in_order() {
        let ticker = Ticker::spawn(Duration::from_millis(1));
        let mut frames = vec![];
        for _ in 0..6 {
            frames.extend(ticker.next().await);
        }
        assert_eq!(frames, vec!['|', '/', '-', '\\', '|', '/']);
    }

    #[tokio::test]
    async fn no_ticker_never_ticks() {
        let waited = tokio::time::timeout(Duration::from_millis(20), next_frame(&None)).await;
        assert!(waited.is_err());
    }
}
