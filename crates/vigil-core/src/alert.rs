//! Alert raised when a frame contains a face that was not accepted.

use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

const PLAYER_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Fire-and-forget unauthorised-face signal. Implementations never fail.
pub trait Notifier {
    fn notify_unauthorised(&self);
}

impl<T: Notifier + ?Sized> Notifier for Arc<T> {
    fn notify_unauthorised(&self) {
        (**self).notify_unauthorised()
    }
}

impl<T: Notifier + ?Sized> Notifier for Box<T> {
    fn notify_unauthorised(&self) {
        (**self).notify_unauthorised()
    }
}

/// Does nothing.
pub struct NoopNotifier;

impl Notifier for NoopNotifier {
    fn notify_unauthorised(&self) {}
}

/// Plays an audio asset through an external player command.
///
/// `player` is split on whitespace, so arguments can be given
/// (e.g. `"ffplay -nodisp -autoexit -loglevel quiet"`); the asset path is
/// appended last. Playback is waited on for at most `timeout`; a player
/// still running after that is killed. Every failure is logged and swallowed.
pub struct SoundNotifier {
    asset: PathBuf,
    player: String,
    timeout: Duration,
}

impl SoundNotifier {
    pub fn new(asset: impl Into<PathBuf>, player: impl Into<String>, timeout: Duration) -> Self {
        Self {
            asset: asset.into(),
            player: player.into(),
            timeout,
        }
    }

    fn play(&self) -> Result<(), String> {
        if !self.asset.is_file() {
            return Err(format!("alert sound not found at {}", self.asset.display()));
        }

        let mut argv = self.player.split_whitespace();
        let program = argv.next().ok_or_else(|| "no alert player configured".to_string())?;

        let mut child = Command::new(program)
            .args(argv)
            .arg(&self.asset)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| format!("failed to start {}: {e}", self.player))?;

        let started = Instant::now();
        loop {
            match child.try_wait() {
                Ok(Some(status)) if status.success() => return Ok(()),
                Ok(Some(status)) => return Err(format!("{} exited with {status}", self.player)),
                Ok(None) if started.elapsed() >= self.timeout => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(format!(
                        "{} still playing after {:?}; stopped",
                        self.player, self.timeout
                    ));
                }
                Ok(None) => std::thread::sleep(PLAYER_POLL_INTERVAL),
                Err(e) => return Err(format!("waiting for {}: {e}", self.player)),
            }
        }
    }
}

impl Notifier for SoundNotifier {
    fn notify_unauthorised(&self) {
        tracing::warn!(asset = %self.asset.display(), "unauthorised face detected, sounding alert");
        if let Err(reason) = self.play() {
            tracing::warn!(%reason, "alert playback skipped");
        }
    }
}

/// Test double that counts notifications.
#[cfg(test)]
pub(crate) mod testing {
    use super::Notifier;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Default)]
    pub struct CountingNotifier {
        count: AtomicUsize,
    }

    impl CountingNotifier {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn count(&self) -> usize {
            self.count.load(Ordering::SeqCst)
        }
    }

    impl Notifier for CountingNotifier {
        fn notify_unauthorised(&self) {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }
}
