pub mod telegram;

use crate::dashboard::RenderedDashboard;
use crate::files::{self, FileDescriptor};
use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

/// Identifies the single live dashboard message on the remote side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteMessageRef {
    pub channel_id: String,
    pub message_id: String,
}

/// Remote-control actions a user can trigger from the dashboard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandKind {
    Refresh,
    Terminate,
    Close,
    /// Send the file with this id (see [`FileDescriptor::id`]).
    Download(String),
}

impl CommandKind {
    fn verb(&self) -> &'static str {
        match self {
            CommandKind::Refresh => "refresh",
            CommandKind::Terminate => "kill",
            CommandKind::Close => "exit",
            CommandKind::Download(_) => "dl",
        }
    }
}

/// A button on the dashboard. Adapters decide how the command is carried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionButton {
    pub label: String,
    pub command: CommandKind,
}

impl ActionButton {
    pub fn new(label: impl Into<String>, command: CommandKind) -> Self {
        Self {
            label: label.into(),
            command,
        }
    }
}

/// A command event delivered by a channel listener (or by the local signal handler).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundCommand {
    pub kind: CommandKind,
    /// The dashboard message the action was pressed on, when the channel knows it.
    pub source: Option<RemoteMessageRef>,
}

impl InboundCommand {
    pub fn new(kind: CommandKind) -> Self {
        Self { kind, source: None }
    }
}

/// Errors from the remote channel. All of them are transient from the loop's
/// point of view: retried with backoff, then skipped for the cycle.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("network error: {0}")]
    Network(String),

    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    /// Edit rejected because the content is identical to what is shown.
    #[error("message is not modified")]
    NotModified,

    /// The dashboard message can no longer be edited (deleted or too old).
    #[error("dashboard message is gone or can no longer be edited")]
    MessageGone,

    #[error("file error: {0}")]
    File(#[from] std::io::Error),

    #[error("channel API error: {0}")]
    Api(String),
}

/// Outbound side of a remote messaging channel.
#[async_trait]
pub trait RemoteChannel: Send + Sync {
    /// Human-readable adapter name (e.g. "telegram").
    fn name(&self) -> &str;

    /// Post a new dashboard message (`target == None`) or edit the existing one.
    async fn push_or_edit(
        &self,
        target: Option<&RemoteMessageRef>,
        view: &RenderedDashboard,
    ) -> Result<RemoteMessageRef, ChannelError>;

    /// Upload a local file to the channel.
    async fn send_file(&self, file: &FileDescriptor, caption: &str) -> Result<(), ChannelError>;

    /// Post a plain message that is not the dashboard (e.g. "File not found").
    async fn send_notice(&self, text: &str) -> Result<(), ChannelError>;

    /// Files that can be offered for download, most recently modified first.
    fn list_downloadable_files(
        &self,
        directory: &Path,
        limit: usize,
        include_hidden: bool,
    ) -> Vec<FileDescriptor> {
        match files::list_recent(directory, limit, include_hidden) {
            Ok(found) => found,
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    dir = %directory.display(),
                    "failed to list downloadable files"
                );
                Vec::new()
            }
        }
    }
}

/// Receiving end of the inbound command queue.
///
/// Listeners push into the bounded sender; the reconciliation loop is the only
/// consumer and drains it once per tick and whenever a command arrives between
/// ticks.
pub struct CommandInbox {
    rx: mpsc::Receiver<InboundCommand>,
}

impl CommandInbox {
    /// Create a bounded queue. Returns the sender for listeners and the inbox.
    pub fn bounded(capacity: usize) -> (mpsc::Sender<InboundCommand>, Self) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (tx, Self { rx })
    }

    /// Take every command already queued, without waiting.
    pub fn poll_inbound_commands(&mut self) -> Vec<InboundCommand> {
        let mut drained = Vec::new();
        while let Ok(cmd) = self.rx.try_recv() {
            drained.push(cmd);
        }
        drained
    }

    /// Wait for the next command. Returns `None` once every sender is gone.
    pub async fn recv(&mut self) -> Option<InboundCommand> {
        self.rx.recv().await
    }
}

/// Encode a command as button callback data: `<verb>:<session>[:<file-id>]`.
pub fn encode_callback(command: &CommandKind, session: &str) -> String {
    match command {
        CommandKind::Download(id) => format!("{}:{session}:{id}", command.verb()),
        other => format!("{}:{session}", other.verb()),
    }
}

/// Decode callback data into the command and the session it targets.
pub fn decode_callback(data: &str) -> Option<(CommandKind, &str)> {
    let mut parts = data.splitn(3, ':');
    let verb = parts.next()?;
    let session = parts.next().filter(|s| !s.is_empty())?;
    let extra = parts.next();

    let kind = match (verb, extra) {
        ("refresh", None) => CommandKind::Refresh,
        ("kill", None) => CommandKind::Terminate,
        ("exit", None) => CommandKind::Close,
        ("dl", Some(id)) if !id.is_empty() => CommandKind::Download(id.to_string()),
        _ => return None,
    };
    Some((kind, session))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_callback_verbs() {
        assert_eq!(encode_callback(&CommandKind::Refresh, "ab12cd34"), "refresh:ab12cd34");
        assert_eq!(encode_callback(&CommandKind::Terminate, "ab12cd34"), "kill:ab12cd34");
        assert_eq!(encode_callback(&CommandKind::Close, "ab12cd34"), "exit:ab12cd34");
        assert_eq!(
            encode_callback(&CommandKind::Download("0f3a9b1c".into()), "ab12cd34"),
            "dl:ab12cd34:0f3a9b1c"
        );
    }

    #[test]
    fn test_decode_callback_recovers_command_and_session() {
        for kind in [
            CommandKind::Refresh,
            CommandKind::Terminate,
            CommandKind::Close,
            CommandKind::Download("deadbeef".into()),
        ] {
            let data = encode_callback(&kind, "s1");
            assert_eq!(decode_callback(&data), Some((kind, "s1")));
        }
    }

    #[test]
    fn test_decode_callback_rejects_malformed_data() {
        assert_eq!(decode_callback(""), None);
        assert_eq!(decode_callback("refresh"), None);
        assert_eq!(decode_callback("refresh:"), None);
        assert_eq!(decode_callback("dl:s1"), None);
        assert_eq!(decode_callback("dl:s1:"), None);
        assert_eq!(decode_callback("kill:s1:extra"), None);
        assert_eq!(decode_callback("files:s1"), None);
    }

    #[tokio::test]
    async fn test_inbox_drains_queued_commands_in_order() {
        let (tx, mut inbox) = CommandInbox::bounded(8);
        tx.send(InboundCommand::new(CommandKind::Refresh)).await.unwrap();
        tx.send(InboundCommand::new(CommandKind::Terminate)).await.unwrap();

        let drained = inbox.poll_inbound_commands();
        let kinds: Vec<CommandKind> = drained.into_iter().map(|c| c.kind).collect();
        assert_eq!(kinds, vec![CommandKind::Refresh, CommandKind::Terminate]);
        assert!(inbox.poll_inbound_commands().is_empty());
    }

    #[tokio::test]
    async fn test_inbox_recv_ends_when_senders_dropped() {
        let (tx, mut inbox) = CommandInbox::bounded(1);
        tx.send(InboundCommand::new(CommandKind::Close)).await.unwrap();
        drop(tx);
        assert_eq!(
            inbox.recv().await.map(|c| c.kind),
            Some(CommandKind::Close)
        );
        assert_eq!(inbox.recv().await, None);
    }
}
