//! Subscriber side of the callback contract.
//!
//! Every callback becomes a [`CallbackFrame`] pushed into a channel; the
//! WebSocket handler drains the channel into JSON text frames. When the
//! socket goes away the receiver is dropped and further deliveries fail
//! with [`CallbackError::Disconnected`].

use serde::Serialize;
use tokio::sync::mpsc;

use updater_core::{CallbackError, UpdateItemInfo, UpdaterCallback};

/// One event as sent to the subscriber.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum CallbackFrame {
    StatusChange { update: UpdateItemInfo },
    DownloadProgressChange { update: UpdateItemInfo },
    InstallProgress { update: UpdateItemInfo },
    #[serde(rename_all = "camelCase")]
    UpdateCheckCompleted { new_updates: bool },
    ImportStarted,
    ImportCompleted { update: Option<UpdateItemInfo> },
}

/// Subscriber that forwards callbacks into a channel.
pub struct ChannelSubscriber {
    tx: mpsc::UnboundedSender<CallbackFrame>,
}

impl ChannelSubscriber {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<CallbackFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn push(&self, frame: CallbackFrame) -> Result<(), CallbackError> {
        self.tx.send(frame).map_err(|_| CallbackError::Disconnected)
    }
}

impl UpdaterCallback for ChannelSubscriber {
    fn on_status_change(&self, update: &UpdateItemInfo) -> Result<(), CallbackError> {
        self.push(CallbackFrame::StatusChange {
            update: update.clone(),
        })
    }

    fn on_download_progress_change(&self, update: &UpdateItemInfo) -> Result<(), CallbackError> {
        self.push(CallbackFrame::DownloadProgressChange {
            update: update.clone(),
        })
    }

    fn on_install_progress(&self, update: &UpdateItemInfo) -> Result<(), CallbackError> {
        self.push(CallbackFrame::InstallProgress {
            update: update.clone(),
        })
    }

    fn on_update_check_completed(&self, new_updates: bool) -> Result<(), CallbackError> {
        self.push(CallbackFrame::UpdateCheckCompleted { new_updates })
    }

    fn on_import_started(&self) -> Result<(), CallbackError> {
        self.push(CallbackFrame::ImportStarted)
    }

    fn on_import_completed(&self, update: Option<&UpdateItemInfo>) -> Result<(), CallbackError> {
        self.push(CallbackFrame::ImportCompleted {
            update: update.cloned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frames_are_tagged() {
        let json = serde_json::to_value(CallbackFrame::UpdateCheckCompleted { new_updates: true })
            .unwrap();
        assert_eq!(json["event"], "updateCheckCompleted");
        assert_eq!(json["newUpdates"], true);

        let json = serde_json::to_value(CallbackFrame::ImportCompleted { update: None }).unwrap();
        assert_eq!(json["event"], "importCompleted");
        assert!(json["update"].is_null());

        let json = serde_json::to_value(CallbackFrame::ImportStarted).unwrap();
        assert_eq!(json["event"], "importStarted");
    }

    #[test]
    fn test_closed_channel_is_disconnected() {
        let (subscriber, rx) = ChannelSubscriber::new();
        assert!(subscriber.on_import_started().is_ok());

        drop(rx);
        assert_eq!(
            subscriber.on_import_started(),
            Err(CallbackError::Disconnected)
        );
    }
}
