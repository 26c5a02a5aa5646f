use crate::session::PackageIdentity;
use crossbeam_channel::{Receiver, Sender};
use std::sync::Arc;

/// Trait for receiving session and extraction notifications.
///
/// All methods take `&self` (not `&mut self`) because notifications arrive
/// from the extraction worker thread as well as from the caller's thread.
/// They are never invoked while the unpacker holds an internal lock, so an
/// implementation may query the unpacker's state.
pub trait UnpackEvents: Send + Sync {
    /// Called when the opened package changes (`None` after a failed open).
    fn package_info_changed(&self, _identity: Option<&PackageIdentity>) {}

    /// Called whenever the extraction progress is recomputed.
    fn progress_changed(&self, _percent: u8) {}

    /// Called when the human-readable status line changes.
    fn status_changed(&self, _message: &str) {}

    /// Called once per run when it reaches a terminal state.
    fn extraction_finished(&self, _success: bool, _message: &str) {}
}

impl<T: UnpackEvents + ?Sized> UnpackEvents for Arc<T> {
    fn package_info_changed(&self, identity: Option<&PackageIdentity>) {
        (**self).package_info_changed(identity);
    }

    fn progress_changed(&self, percent: u8) {
        (**self).progress_changed(percent);
    }

    fn status_changed(&self, message: &str) {
        (**self).status_changed(message);
    }

    fn extraction_finished(&self, success: bool, message: &str) {
        (**self).extraction_finished(success, message);
    }
}

/// A no-op implementation that discards all notifications.
pub struct SilentEvents;

impl UnpackEvents for SilentEvents {}

/// A notification forwarded by [`ChannelEvents`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnpackEvent {
    PackageInfoChanged(Option<PackageIdentity>),
    ProgressChanged(u8),
    StatusChanged(String),
    ExtractionFinished { success: bool, message: String },
}

/// Forwards every notification into a channel.
///
/// Lets a UI loop (or a test) consume notifications at its own pace instead
/// of being called back on the worker thread. Notifications sent after the
/// receiver is dropped are discarded.
#[derive(Debug, Clone)]
pub struct ChannelEvents {
    sender: Sender<UnpackEvent>,
}

impl ChannelEvents {
    /// Creates a listener and the receiving end of its unbounded queue.
    #[must_use]
    pub fn new() -> (Self, Receiver<UnpackEvent>) {
        let (sender, receiver) = crossbeam_channel::unbounded();
        (Self { sender }, receiver)
    }

    fn send(&self, event: UnpackEvent) {
        let _ = self.sender.send(event);
    }
}

impl UnpackEvents for ChannelEvents {
    fn package_info_changed(&self, identity: Option<&PackageIdentity>) {
        self.send(UnpackEvent::PackageInfoChanged(identity.cloned()));
    }

    fn progress_changed(&self, percent: u8) {
        self.send(UnpackEvent::ProgressChanged(percent));
    }

    fn status_changed(&self, message: &str) {
        self.send(UnpackEvent::StatusChanged(message.to_owned()));
    }

    fn extraction_finished(&self, success: bool, message: &str) {
        self.send(UnpackEvent::ExtractionFinished {
            success,
            message: message.to_owned(),
        });
    }
}

/// Console reporter using an indicatif progress bar.
///
/// The bar tracks the percentage; status lines become the bar message and the
/// terminal message is printed once the bar is cleared.
#[cfg(feature = "cli")]
pub struct ConsoleEvents {
    bar: indicatif::ProgressBar,
}

#[cfg(feature = "cli")]
impl ConsoleEvents {
    pub fn new() -> Self {
        let bar = indicatif::ProgressBar::new(100);
        bar.set_draw_target(indicatif::ProgressDrawTarget::stderr());
        bar.set_style(
            indicatif::ProgressStyle::default_bar()
                .template("{bar:40.cyan/blue} {pos:>3}% {msg} [{elapsed_precise}]")
                .unwrap_or_else(|_| indicatif::ProgressStyle::default_bar())
                .progress_chars("━╸─"),
        );
        Self { bar }
    }
}

#[cfg(feature = "cli")]
impl Default for ConsoleEvents {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "cli")]
impl UnpackEvents for ConsoleEvents {
    fn progress_changed(&self, percent: u8) {
        self.bar.set_position(percent.into());
    }

    fn status_changed(&self, message: &str) {
        self.bar.set_message(message.to_owned());
    }

    fn extraction_finished(&self, _success: bool, message: &str) {
        self.bar.finish_and_clear();
        eprintln!("{message}");
    }
}
