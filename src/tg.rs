use std::sync::Arc;

use async_trait::async_trait;
use teloxide::{
    dispatching::{Dispatcher, UpdateFilterExt},
    prelude::*,
    types::{
        CallbackQuery, CallbackQueryId, InlineKeyboardButton, InlineKeyboardButtonKind, InlineKeyboardMarkup, InputFile, KeyboardButton,
        KeyboardMarkup, MessageId, ParseMode, ReplyMarkup, User,
    },
    utils::command::BotCommands,
};

use crate::chat::{ChatTransport, Incoming, Input, Markup, MessageRef, Reply, TransportError};
use crate::router::{Command, Router};
use crate::storage::UserProfile;

pub async fn run(bot: Bot, router: Arc<Router<Bot>>) {
    if let Err(e) = bot.set_my_commands(Command::bot_commands()).await {
        tracing::warn!(error = %e, "failed to register bot commands");
    }

    let handler = dptree::entry()
        .branch(
            Update::filter_message()
                .branch(dptree::entry().filter_command::<Command>().endpoint({
                    let router = router.clone();
                    move |msg: Message, cmd: Command| {
                        let router = router.clone();
                        async move { dispatch(&router, incoming(&msg, Input::Command(cmd))).await }
                    }
                }))
                .branch({
                    let router = router.clone();
                    dptree::endpoint(move |msg: Message| {
                        let router = router.clone();
                        async move {
                            let Some(text) = message_text_any(&msg) else { return Ok(()) };
                            dispatch(&router, incoming(&msg, Input::Text(text))).await
                        }
                    })
                }),
        )
        .branch(Update::filter_callback_query().endpoint({
            let router = router.clone();
            move |q: CallbackQuery| {
                let router = router.clone();
                async move {
                    let Some(event) = callback_incoming(q) else { return Ok(()) };
                    dispatch(&router, event).await
                }
            }
        }));

    tracing::info!("bot started");
    Dispatcher::builder(bot, handler)
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;
}

async fn dispatch(router: &Router<Bot>, event: Incoming) -> ResponseResult<()> {
    let chat_id = event.chat_id;
    match router.handle(event).await {
        Ok(()) => Ok(()),
        Err(TransportError::Telegram(e)) => Err(e),
        Err(e) => {
            tracing::warn!(chat_id, error = %e, "failed to answer");
            Ok(())
        }
    }
}

/* ====== Update -> Incoming ====== */

fn profile(user: &User) -> UserProfile {
    UserProfile {
        user_id: user.id.0 as i64,
        first_name: user.first_name.clone(),
        last_name: user.last_name.clone(),
        handle: user.username.clone(),
    }
}

fn incoming(msg: &Message, input: Input) -> Incoming {
    // в личке from есть всегда; для каналов берём сам чат
    let from = msg.from.as_ref().map(profile).unwrap_or_else(|| UserProfile {
        user_id: msg.chat.id.0,
        first_name: msg.chat.first_name().unwrap_or_default().to_string(),
        last_name: None,
        handle: msg.chat.username().map(str::to_string),
    });
    Incoming { chat_id: msg.chat.id.0, from, input }
}

fn callback_incoming(q: CallbackQuery) -> Option<Incoming> {
    let data = q.data?;
    let message = q.message.as_ref().map(|m| MessageRef { chat_id: m.chat().id.0, message_id: m.id().0 });
    let keyboard = q
        .message
        .as_ref()
        .and_then(|m| m.regular_message())
        .and_then(|m| m.reply_markup())
        .map(callback_payloads)
        .unwrap_or_default();
    let from = profile(&q.from);
    Some(Incoming {
        chat_id: message.map(|m| m.chat_id).unwrap_or(from.user_id),
        from,
        input: Input::Callback { id: q.id.0, data, message, keyboard },
    })
}

fn callback_payloads(markup: &InlineKeyboardMarkup) -> Vec<String> {
    markup
        .inline_keyboard
        .iter()
        .flatten()
        .filter_map(|b| match &b.kind {
            InlineKeyboardButtonKind::CallbackData(data) => Some(data.clone()),
            _ => None,
        })
        .collect()
}

fn message_text_any(msg: &Message) -> Option<String> {
    if let Some(t) = msg.text() {
        return Some(t.to_string());
    }
    if let Some(c) = msg.caption() {
        return Some(c.to_string());
    }
    None
}

/* ====== Reply -> Telegram ====== */

fn inline_keyboard(markup: &Markup) -> Option<InlineKeyboardMarkup> {
    match markup {
        Markup::Inline(rows) => Some(InlineKeyboardMarkup::new(rows.iter().map(|row| {
            row.iter()
                .map(|b| InlineKeyboardButton::callback(b.label.clone(), b.payload.clone()))
                .collect::<Vec<_>>()
        }))),
        _ => None,
    }
}

fn reply_markup(markup: &Markup) -> Option<ReplyMarkup> {
    match markup {
        Markup::None => None,
        Markup::Inline(_) => inline_keyboard(markup).map(ReplyMarkup::InlineKeyboard),
        Markup::MainMenu(rows) => {
            let rows = rows
                .iter()
                .map(|row| row.iter().map(|label| KeyboardButton::new(label.clone())).collect::<Vec<_>>());
            Some(ReplyMarkup::Keyboard(KeyboardMarkup::new(rows).resize_keyboard()))
        }
    }
}

#[async_trait]
impl ChatTransport for Bot {
    async fn send(&self, chat_id: i64, reply: &Reply) -> Result<(), TransportError> {
        let chat = ChatId(chat_id);
        let markup = reply_markup(&reply.markup);

        if let Some(url) = &reply.photo_url {
            let bytes = fetch_image(url).await?;
            let photo = self.send_photo(chat, InputFile::memory(bytes).file_name("poster.jpg"));
            if reply.fits_caption() {
                let mut req = photo.caption(reply.text.clone()).parse_mode(ParseMode::Html);
                if let Some(m) = markup {
                    req = req.reply_markup(m);
                }
                req.await?;
                return Ok(());
            }
            // HTML не режем: постер отдельно, текст с кнопками следом
            photo.await?;
        }

        let mut req = self.send_message(chat, reply.text.clone()).parse_mode(ParseMode::Html);
        if let Some(m) = markup {
            req = req.reply_markup(m);
        }
        req.await?;
        Ok(())
    }

    async fn edit(&self, target: MessageRef, reply: &Reply) -> Result<(), TransportError> {
        let mut req = self
            .edit_message_text(ChatId(target.chat_id), MessageId(target.message_id), reply.text.clone())
            .parse_mode(ParseMode::Html);
        if let Some(kb) = inline_keyboard(&reply.markup) {
            req = req.reply_markup(kb);
        }
        req.await?;
        Ok(())
    }

    async fn delete(&self, target: MessageRef) -> Result<(), TransportError> {
        self.delete_message(ChatId(target.chat_id), MessageId(target.message_id)).await?;
        Ok(())
    }

    async fn answer_callback(&self, callback_id: &str, text: &str, alert: bool) -> Result<(), TransportError> {
        let mut req = self.answer_callback_query(CallbackQueryId(callback_id.to_owned()));
        if !text.is_empty() {
            req = req.text(text).show_alert(alert);
        }
        req.await?;
        Ok(())
    }
}

/* ====== Загрузка постера байтами (устойчиво к редиректам/CDN) ====== */
async fn fetch_image(url: &str) -> Result<Vec<u8>, TransportError> {
    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(15))
        .user_agent("Mozilla/5.0 (compatible; movie-suggester-bot/0.1)")
        .build()
        .map_err(other)?;
    let resp = client
        .get(url)
        .header(reqwest::header::ACCEPT, "image/*")
        .send()
        .await
        .map_err(other)?;
    if !resp.status().is_success() {
        return Err(other(format!("poster status {}", resp.status())));
    }
    if let Some(ct) = resp.headers().get(reqwest::header::CONTENT_TYPE) {
        let ct = ct.to_str().unwrap_or("");
        if !ct.starts_with("image/") {
            return Err(other(format!("unexpected content-type: {ct}")));
        }
    }
    let bytes = resp.bytes().await.map_err(other)?;
    Ok(bytes.to_vec())
}

fn other<E: std::fmt::Display>(e: E) -> TransportError {
    TransportError::Other(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::Button;
    use wiremock::matchers::path;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn inline_rows_keep_layout() {
        let markup = Markup::Inline(vec![
            vec![Button::new("Драма", "genre_18"), Button::new("Комедия", "genre_35")],
            vec![Button::new("Ужасы", "genre_27")],
        ]);
        let kb = inline_keyboard(&markup).unwrap();
        assert_eq!(kb.inline_keyboard.len(), 2);
        assert_eq!(kb.inline_keyboard[0].len(), 2);
        assert_eq!(kb.inline_keyboard[1][0].text, "Ужасы");
    }

    #[test]
    fn main_menu_is_a_reply_keyboard() {
        let markup = Markup::MainMenu(vec![vec!["🎬 Подобрать фильм".into()]]);
        assert!(matches!(reply_markup(&markup), Some(ReplyMarkup::Keyboard(_))));
        assert!(inline_keyboard(&markup).is_none());
        assert!(reply_markup(&Markup::None).is_none());
    }

    #[test]
    fn pressed_keyboard_yields_callback_payloads() {
        let kb = InlineKeyboardMarkup::new(vec![
            vec![
                InlineKeyboardButton::callback("🎬 Амели", "fav_show_11"),
                InlineKeyboardButton::callback("🗑", "fav_rem_11"),
            ],
            vec![InlineKeyboardButton::url("TMDB", "https://www.themoviedb.org".parse().unwrap())],
        ]);
        assert_eq!(callback_payloads(&kb), vec!["fav_show_11", "fav_rem_11"]);
    }

    #[tokio::test]
    async fn poster_download_rejects_non_images() {
        let server = MockServer::start().await;
        Mock::given(path("/ok.jpg"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(vec![0xff, 0xd8], "image/jpeg"))
            .mount(&server)
            .await;
        Mock::given(path("/page.html"))
            .respond_with(ResponseTemplate::new(200).set_body_raw("<html>", "text/html"))
            .mount(&server)
            .await;

        let ok = fetch_image(&format!("{}/ok.jpg", server.uri())).await.unwrap();
        assert_eq!(ok, vec![0xff, 0xd8]);
        assert!(fetch_image(&format!("{}/page.html", server.uri())).await.is_err());
        assert!(fetch_image(&format!("{}/missing.jpg", server.uri())).await.is_err());
    }
}
