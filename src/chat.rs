//! Модель входящих событий и исходящих ответов, не привязанная к teloxide.

use async_trait::async_trait;
use thiserror::Error;

use crate::router::Command;
use crate::storage::UserProfile;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error(transparent)]
    Telegram(#[from] teloxide::RequestError),
    #[error("{0}")]
    Other(String),
}

/// Ссылка на ранее отправленное сообщение (для правки/удаления).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageRef {
    pub chat_id: i64,
    pub message_id: i32,
}

#[derive(Debug, Clone)]
pub enum Input {
    Command(Command),
    /// `keyboard`: payloads кнопок нажатого сообщения, чтобы понять, что это за сообщение.
    Callback { id: String, data: String, message: Option<MessageRef>, keyboard: Vec<String> },
    Text(String),
}

#[derive(Debug, Clone)]
pub struct Incoming {
    pub chat_id: i64,
    pub from: UserProfile,
    pub input: Input,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Button {
    pub label: String,
    pub payload: String,
}

impl Button {
    pub fn new(label: impl Into<String>, payload: impl Into<String>) -> Self {
        Self { label: label.into(), payload: payload.into() }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Markup {
    #[default]
    None,
    Inline(Vec<Vec<Button>>),
    /// Постоянная клавиатура под полем ввода.
    MainMenu(Vec<Vec<String>>),
}

/// Лимит подписи к фото в Telegram, считается по видимому тексту.
pub const CAPTION_LIMIT: usize = 1024;

/// Текст всегда в HTML.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reply {
    pub text: String,
    pub photo_url: Option<String>,
    pub markup: Markup,
}

impl Reply {
    pub fn text(text: impl Into<String>) -> Self {
        Self { text: text.into(), ..Default::default() }
    }

    pub fn photo(mut self, url: Option<String>) -> Self {
        self.photo_url = url;
        self
    }

    pub fn buttons(mut self, rows: Vec<Vec<Button>>) -> Self {
        self.markup = if rows.is_empty() { Markup::None } else { Markup::Inline(rows) };
        self
    }

    pub fn menu(mut self, rows: Vec<Vec<String>>) -> Self {
        self.markup = Markup::MainMenu(rows);
        self
    }

    pub fn without_photo(&self) -> Self {
        Self { photo_url: None, ..self.clone() }
    }

    pub fn fits_caption(&self) -> bool {
        visible_len(&self.text) <= CAPTION_LIMIT
    }
}

/// Длина текста так, как её считает Telegram: без тегов, сущность за один символ.
pub fn visible_len(html: &str) -> usize {
    let mut len = 0;
    let mut in_tag = false;
    let mut in_entity = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' if in_tag => in_tag = false,
            _ if in_tag => {}
            '&' => {
                in_entity = true;
                len += 1;
            }
            ';' if in_entity => in_entity = false,
            _ if in_entity => {}
            _ => len += 1,
        }
    }
    len
}

#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn send(&self, chat_id: i64, reply: &Reply) -> Result<(), TransportError>;

    /// Только текст и inline-кнопки.
    async fn edit(&self, target: MessageRef, reply: &Reply) -> Result<(), TransportError>;

    async fn delete(&self, target: MessageRef) -> Result<(), TransportError>;

    async fn answer_callback(&self, callback_id: &str, text: &str, alert: bool) -> Result<(), TransportError>;
}
