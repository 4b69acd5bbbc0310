//! Telegram implementation of [`RemoteChannel`] on top of teloxide.
//!
//! The dashboard is one HTML message with an inline keyboard. Button presses
//! come back as callback queries carrying `<verb>:<session>[:<file-id>]`; the
//! listener forwards the ones addressed to this session into the command inbox.

use super::{
    decode_callback, encode_callback, ActionButton, ChannelError, InboundCommand,
    RemoteChannel, RemoteMessageRef,
};
use crate::dashboard::RenderedDashboard;
use crate::files::FileDescriptor;
use async_trait::async_trait;
use teloxide::dispatching::ShutdownToken;
use teloxide::prelude::*;
use teloxide::types::{
    InlineKeyboardButton, InlineKeyboardMarkup, InputFile, MessageId, ParseMode,
};
use teloxide::{ApiError, RequestError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const SESSION_EXPIRED: &str = "Session expired or invalid";

impl From<RequestError> for ChannelError {
    fn from(e: RequestError) -> Self {
        match e {
            RequestError::RetryAfter(secs) => ChannelError::RateLimited {
                retry_after: secs.duration(),
            },
            RequestError::Api(ApiError::MessageNotModified) => ChannelError::NotModified,
            RequestError::Api(ApiError::MessageToEditNotFound)
            | RequestError::Api(ApiError::MessageCantBeEdited) => ChannelError::MessageGone,
            RequestError::Network(e) => ChannelError::Network(e.to_string()),
            other => ChannelError::Api(other.to_string()),
        }
    }
}

pub struct TelegramChannel {
    bot: Bot,
    chat_id: ChatId,
    session_id: String,
}

impl TelegramChannel {
    pub fn new(token: &str, chat_id: i64, session_id: impl Into<String>) -> Self {
        Self {
            bot: Bot::new(token),
            chat_id: ChatId(chat_id),
            session_id: session_id.into(),
        }
    }

    /// Username of the bot behind the token. Used by the connectivity check.
    pub async fn bot_username(&self) -> Result<String, ChannelError> {
        let me = self.bot.get_me().await?;
        Ok(me.username.clone().unwrap_or_default())
    }

    fn keyboard(&self, rows: &[Vec<ActionButton>]) -> InlineKeyboardMarkup {
        InlineKeyboardMarkup::new(rows.iter().map(|row| {
            row.iter()
                .map(|b| {
                    InlineKeyboardButton::callback(
                        b.label.clone(),
                        encode_callback(&b.command, &self.session_id),
                    )
                })
                .collect::<Vec<_>>()
        }))
    }

    /// Start receiving button presses. Commands for this session go to `tx`.
    pub fn spawn_listener(&self, tx: mpsc::Sender<InboundCommand>) -> ListenerHandle {
        let session = self.session_id.clone();
        let handler = Update::filter_callback_query().endpoint(move |bot: Bot, q: CallbackQuery| {
            let tx = tx.clone();
            let session = session.clone();
            async move { handle_callback(bot, q, &session, &tx).await }
        });

        let mut dispatcher = Dispatcher::builder(self.bot.clone(), handler)
            .default_handler(|_| async {})
            .build();
        let shutdown = dispatcher.shutdown_token();
        let task = tokio::spawn(async move {
            dispatcher.dispatch().await;
        });

        tracing::info!(session = %self.session_id, "telegram listener started");
        ListenerHandle { shutdown, task }
    }
}

fn parse_ref(reference: &RemoteMessageRef) -> Result<(ChatId, MessageId), ChannelError> {
    let chat = reference
        .channel_id
        .parse::<i64>()
        .map_err(|_| ChannelError::Api(format!("bad chat id {:?}", reference.channel_id)))?;
    let message = reference
        .message_id
        .parse::<i32>()
        .map_err(|_| ChannelError::Api(format!("bad message id {:?}", reference.message_id)))?;
    Ok((ChatId(chat), MessageId(message)))
}

async fn handle_callback(
    bot: Bot,
    q: CallbackQuery,
    session: &str,
    tx: &mpsc::Sender<InboundCommand>,
) -> ResponseResult<()> {
    let decoded = q.data.as_deref().and_then(decode_callback);

    let kind = match decoded {
        Some((kind, target)) if target == session => kind,
        Some((_, target)) => {
            tracing::debug!(target, "callback for another session");
            bot.answer_callback_query(q.id.clone())
                .text(SESSION_EXPIRED)
                .show_alert(true)
                .await?;
            return Ok(());
        }
        None => {
            tracing::debug!(data = ?q.data, "unrecognised callback data");
            bot.answer_callback_query(q.id.clone()).await?;
            return Ok(());
        }
    };

    bot.answer_callback_query(q.id.clone()).await?;

    let source = q.message.as_ref().map(|m| RemoteMessageRef {
        channel_id: m.chat().id.0.to_string(),
        message_id: m.id().0.to_string(),
    });
    let command = InboundCommand { kind, source };
    if let Err(e) = tx.try_send(command) {
        tracing::warn!(error = %e, "command inbox full or closed, dropping command");
    }
    Ok(())
}

/// Running listener. Stop it with [`ListenerHandle::shutdown`].
pub struct ListenerHandle {
    shutdown: ShutdownToken,
    task: JoinHandle<()>,
}

impl ListenerHandle {
    pub async fn shutdown(self) {
        match self.shutdown.shutdown() {
            Ok(done) => done.await,
            Err(_) => self.task.abort(),
        }
        tracing::debug!("telegram listener stopped");
    }
}

#[async_trait]
impl RemoteChannel for TelegramChannel {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn push_or_edit(
        &self,
        target: Option<&RemoteMessageRef>,
        view: &RenderedDashboard,
    ) -> Result<RemoteMessageRef, ChannelError> {
        let keyboard = self.keyboard(&view.buttons);

        if let Some(reference) = target {
            let (chat, message) = parse_ref(reference)?;
            self.bot
                .edit_message_text(chat, message, &view.body)
                .parse_mode(ParseMode::Html)
                .reply_markup(keyboard)
                .await?;
            return Ok(reference.clone());
        }

        let sent = self
            .bot
            .send_message(self.chat_id, &view.body)
            .parse_mode(ParseMode::Html)
            .reply_markup(keyboard)
            .await?;
        Ok(RemoteMessageRef {
            channel_id: sent.chat.id.0.to_string(),
            message_id: sent.id.0.to_string(),
        })
    }

    async fn send_file(&self, file: &FileDescriptor, caption: &str) -> Result<(), ChannelError> {
        if !file.path.is_file() {
            return Err(ChannelError::File(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{} no longer exists", file.path.display()),
            )));
        }
        self.bot
            .send_document(self.chat_id, InputFile::file(&file.path))
            .caption(caption)
            .await?;
        Ok(())
    }

    async fn send_notice(&self, text: &str) -> Result<(), ChannelError> {
        self.bot.send_message(self.chat_id, text).await?;
        Ok(())
    }
}
