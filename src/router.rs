use std::time::Duration;

use once_cell::sync::Lazy;
use rand::{seq::SliceRandom, Rng};
use regex::Regex;
use teloxide::utils::command::BotCommands;
use thiserror::Error;
use unicode_segmentation::UnicodeSegmentation;

use crate::chat::{visible_len, Button, ChatTransport, Incoming, Input, MessageRef, Reply, TransportError, CAPTION_LIMIT};
use crate::genres::{GenreCache, GenreMap};
use crate::session::{Flow, MovieSnapshot, Sessions};
use crate::storage::{AddOutcome, FavoritesStore, RemoveOutcome, UserProfile};
use crate::tmdb::{Movie, MovieDetails, TmdbClient};

/* ====== Команды ====== */
#[derive(BotCommands, Clone, Debug, PartialEq, Eq)]
#[command(rename_rule = "lowercase", description = "Команды:")]
pub enum Command {
    #[command(description = "начать")]
    Start,
    #[command(description = "помощь")]
    Help,
    #[command(description = "фильм по жанру")]
    Genre,
    #[command(description = "фильм дня")]
    Daily,
    #[command(description = "избранное")]
    Favorites,
    #[command(description = "панель администратора")]
    Admin,
    #[command(description = "статистика (админ)")]
    Stats,
    #[command(description = "рассылка всем: /broadcast текст (админ)")]
    Broadcast(String),
    #[command(description = "отменить текущее действие")]
    Cancel,
}

/* ====== Callback-кнопки ======
   genre_<id>: выбрать жанр
   genre_next: ещё фильм того же жанра
   fav_add_<id>: добавить в избранное
   fav_rem_<id>: убрать из избранного
   fav_show_<id>: карточка фильма из избранного
   admin_stats / admin_broadcast
*/
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    SelectGenre(u32),
    AnotherInGenre,
    AddFavorite(u64),
    RemoveFavorite(u64),
    ShowMovie(u64),
    AdminStats,
    AdminBroadcast,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PayloadError {
    #[error("unknown callback payload {0:?}")]
    Unknown(String),
    #[error("malformed id in callback payload {0:?}")]
    BadId(String),
}

static PAYLOAD_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(genre|fav_add|fav_rem|fav_show)_(.+)$").expect("static regex"));

impl Action {
    pub fn parse(data: &str) -> Result<Self, PayloadError> {
        match data {
            "genre_next" => return Ok(Action::AnotherInGenre),
            "admin_stats" => return Ok(Action::AdminStats),
            "admin_broadcast" => return Ok(Action::AdminBroadcast),
            _ => {}
        }
        let caps = PAYLOAD_RE.captures(data).ok_or_else(|| PayloadError::Unknown(data.to_string()))?;
        let bad = || PayloadError::BadId(data.to_string());
        let id = &caps[2];
        Ok(match &caps[1] {
            "genre" => Action::SelectGenre(id.parse().map_err(|_| bad())?),
            "fav_add" => Action::AddFavorite(id.parse().map_err(|_| bad())?),
            "fav_rem" => Action::RemoveFavorite(id.parse().map_err(|_| bad())?),
            _ => Action::ShowMovie(id.parse().map_err(|_| bad())?),
        })
    }

    pub fn payload(&self) -> String {
        match self {
            Action::SelectGenre(id) => format!("genre_{id}"),
            Action::AnotherInGenre => "genre_next".to_string(),
            Action::AddFavorite(id) => format!("fav_add_{id}"),
            Action::RemoveFavorite(id) => format!("fav_rem_{id}"),
            Action::ShowMovie(id) => format!("fav_show_{id}"),
            Action::AdminStats => "admin_stats".to_string(),
            Action::AdminBroadcast => "admin_broadcast".to_string(),
        }
    }
}

/* ====== Тексты ====== */
const MENU_GENRE: &str = "🎬 Подобрать фильм";
const MENU_DAILY: &str = "☀️ Фильм дня";
const MENU_FAVORITES: &str = "⭐ Избранное";
const MENU_SEARCH: &str = "🔍 Поиск";

const ADMIN_ONLY: &str = "⛔ Эта команда доступна только администратору.";
const TRY_LATER: &str = "Сервис фильмов сейчас недоступен 😕 Попробуйте позже.";
const SOMETHING_WRONG: &str = "Что-то пошло не так. Попробуйте ещё раз.";
const GENRES_UNAVAILABLE: &str = "Не удалось загрузить список жанров. Попробуйте позже.";
const PICK_GENRE_FIRST: &str = "Сначала выберите жанр";
const SEARCH_HINT: &str = "Чтобы найти фильм, просто напишите его название.";
const EMPTY_FAVORITES: &str = "Избранное пусто. Добавляйте фильмы кнопкой «➕ В избранное».";
const FAVORITES_UNAVAILABLE: &str = "Не удалось загрузить избранное. Попробуйте позже.";
const UNKNOWN_COMMAND: &str = "Не знаю такой команды. Список команд: /help";
const BROADCAST_PROMPT: &str = "Пришлите текст рассылки одним сообщением. Отмена: /cancel";
const BROADCAST_USAGE: &str = "Использование: /broadcast текст сообщения";

const SEARCH_LIMIT: usize = 5;
const OVERVIEW_LIMIT: usize = 500;
const CAST_LIMIT: usize = 5;
const RECOMMENDATIONS_LIMIT: usize = 3;
const DAILY_PAGES: u32 = 5;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub sent: usize,
    pub failed: usize,
}

/// Разбирает входящее событие с учётом текущего сценария пользователя.
///
/// Сценарии хранятся здесь же, в `Sessions`; хранилище и TMDB внешние.
pub struct Router<T> {
    transport: T,
    catalog: TmdbClient,
    genres: GenreCache,
    store: FavoritesStore,
    sessions: Sessions,
    admin_id: i64,
    broadcast_delay: Duration,
}

impl<T: ChatTransport> Router<T> {
    pub fn new(transport: T, catalog: TmdbClient, genres: GenreCache, store: FavoritesStore, admin_id: i64) -> Self {
        Self {
            transport,
            catalog,
            genres,
            store,
            sessions: Sessions::new(),
            admin_id,
            broadcast_delay: Duration::from_millis(100),
        }
    }

    pub fn with_broadcast_delay(mut self, delay: Duration) -> Self {
        self.broadcast_delay = delay;
        self
    }

    pub async fn handle(&self, event: Incoming) -> Result<(), TransportError> {
        if let Err(e) = self.store.ensure_user(&event.from).await {
            // ошибка уже в логе хранилища; отвечаем пользователю всё равно
            tracing::debug!(user_id = event.from.user_id, error = %e, "continuing without user row");
        }

        let Incoming { chat_id, from, input } = event;
        match input {
            Input::Command(cmd) => self.on_command(chat_id, &from, cmd).await,
            Input::Callback { id, data, message, keyboard } => {
                let chat_id = message.map(|m| m.chat_id).unwrap_or(chat_id);
                self.on_callback(chat_id, from.user_id, &id, &data, message, &keyboard).await
            }
            Input::Text(text) => self.on_text(chat_id, &from, &text).await,
        }
    }

    fn is_admin(&self, user_id: i64) -> bool {
        user_id == self.admin_id
    }

    /* ====== Команды ====== */
    async fn on_command(&self, chat: i64, from: &UserProfile, cmd: Command) -> Result<(), TransportError> {
        let user_id = from.user_id;
        if cmd == Command::Cancel {
            let text = match self.sessions.reset(user_id).await {
                Flow::AwaitingBroadcast => "Рассылка отменена.",
                Flow::BrowsingGenre { .. } => "Ок, начнём сначала: /genre",
                Flow::Idle => "Нечего отменять.",
            };
            return self.say(chat, text).await;
        }

        // любая другая команда обрывает начатый сценарий
        self.sessions.reset(user_id).await;

        match cmd {
            Command::Start => {
                let text = format!(
                    "Привет, <b>{}</b>! 👋\n\n\
                     Я подбираю фильмы. Пользуйтесь кнопками ниже или просто напишите название фильма.\n\n\
                     /genre - фильм по жанру\n/daily - фильм дня\n/favorites - избранное",
                    html_escape(&from.first_name)
                );
                let menu = vec![
                    vec![MENU_GENRE.to_string(), MENU_DAILY.to_string()],
                    vec![MENU_FAVORITES.to_string(), MENU_SEARCH.to_string()],
                ];
                self.transport.send(chat, &Reply::text(text).menu(menu)).await
            }
            Command::Help => self.say(chat, &html_escape(&Command::descriptions().to_string())).await,
            Command::Genre => self.send_genre_keyboard(chat).await,
            Command::Daily => self.send_daily(chat).await,
            Command::Favorites => {
                let view = self.favorites_view(user_id).await;
                self.transport.send(chat, &view).await
            }
            Command::Admin if self.is_admin(user_id) => {
                let buttons = vec![
                    vec![Button::new("📊 Статистика", Action::AdminStats.payload())],
                    vec![Button::new("📢 Рассылка", Action::AdminBroadcast.payload())],
                ];
                self.transport.send(chat, &Reply::text("<b>Панель администратора</b>").buttons(buttons)).await
            }
            Command::Stats if self.is_admin(user_id) => self.send_stats(chat).await,
            Command::Broadcast(text) if self.is_admin(user_id) => {
                if text.trim().is_empty() {
                    self.say(chat, BROADCAST_USAGE).await
                } else {
                    self.run_broadcast(chat, text.trim()).await
                }
            }
            Command::Admin | Command::Stats | Command::Broadcast(_) => {
                tracing::warn!(user_id, "admin command from non-admin");
                self.say(chat, ADMIN_ONLY).await
            }
            Command::Cancel => Ok(()),
        }
    }

    /* ====== Свободный текст ====== */
    async fn on_text(&self, chat: i64, from: &UserProfile, text: &str) -> Result<(), TransportError> {
        let user_id = from.user_id;
        let text = text.trim();
        if text.is_empty() {
            return Ok(());
        }

        if self.sessions.get(user_id).await == Flow::AwaitingBroadcast {
            self.sessions.reset(user_id).await;
            if !self.is_admin(user_id) {
                return self.say(chat, ADMIN_ONLY).await;
            }
            return self.run_broadcast(chat, text).await;
        }

        match text {
            MENU_GENRE => self.on_command(chat, from, Command::Genre).await,
            MENU_DAILY => self.on_command(chat, from, Command::Daily).await,
            MENU_FAVORITES => self.on_command(chat, from, Command::Favorites).await,
            MENU_SEARCH => self.say(chat, SEARCH_HINT).await,
            t if t.starts_with('/') => self.say(chat, UNKNOWN_COMMAND).await,
            query => {
                self.sessions.reset(user_id).await;
                self.send_search(chat, query).await
            }
        }
    }

    /* ====== Кнопки ====== */
    async fn on_callback(
        &self,
        chat: i64,
        user_id: i64,
        callback_id: &str,
        data: &str,
        message: Option<MessageRef>,
        keyboard: &[String],
    ) -> Result<(), TransportError> {
        let action = match Action::parse(data) {
            Ok(a) => a,
            Err(e) => {
                tracing::warn!(user_id, error = %e, "bad callback payload");
                return self.transport.answer_callback(callback_id, SOMETHING_WRONG, true).await;
            }
        };

        match action {
            Action::SelectGenre(genre_id) => {
                self.transport.answer_callback(callback_id, "", false).await?;
                self.show_genre_pick(chat, user_id, genre_id, message).await
            }
            Action::AnotherInGenre => match self.sessions.get(user_id).await.genre_id() {
                Some(genre_id) => {
                    self.transport.answer_callback(callback_id, "", false).await?;
                    self.show_genre_pick(chat, user_id, genre_id, None).await
                }
                None => {
                    self.transport.answer_callback(callback_id, PICK_GENRE_FIRST, false).await?;
                    self.send_genre_keyboard(chat).await
                }
            },
            Action::AddFavorite(movie_id) => self.add_favorite(callback_id, user_id, movie_id).await,
            Action::RemoveFavorite(movie_id) => {
                // править на месте можно только сам список; карточка с постером текстом не редактируется
                let list = message.filter(|_| keyboard.iter().any(|p| p.starts_with("fav_show_")));
                self.remove_favorite(callback_id, user_id, movie_id, list).await
            }
            Action::ShowMovie(movie_id) => {
                self.transport.answer_callback(callback_id, "", false).await?;
                match self.catalog.movie_detail(movie_id).await {
                    Some(details) => {
                        let card = movie_card(&details.movie, Some(&details), None);
                        let buttons = vec![vec![Button::new("🗑 Убрать из избранного", Action::RemoveFavorite(movie_id).payload())]];
                        self.send_card(chat, Reply::text(card).photo(details.movie.poster_url()).buttons(buttons)).await
                    }
                    None => self.say(chat, TRY_LATER).await,
                }
            }
            Action::AdminStats | Action::AdminBroadcast if !self.is_admin(user_id) => {
                tracing::warn!(user_id, "admin button from non-admin");
                self.transport.answer_callback(callback_id, ADMIN_ONLY, true).await
            }
            Action::AdminStats => {
                self.transport.answer_callback(callback_id, "", false).await?;
                self.send_stats(chat).await
            }
            Action::AdminBroadcast => {
                self.sessions.set(user_id, Flow::AwaitingBroadcast).await;
                self.transport.answer_callback(callback_id, "", false).await?;
                self.say(chat, BROADCAST_PROMPT).await
            }
        }
    }

    /* ====== Жанры ====== */
    async fn send_genre_keyboard(&self, chat: i64) -> Result<(), TransportError> {
        let genres = self.genres.get().await;
        if genres.is_empty() {
            return self.say(chat, GENRES_UNAVAILABLE).await;
        }
        self.transport
            .send(chat, &Reply::text("Выберите жанр:").buttons(genre_keyboard(&genres)))
            .await
    }

    /// Случайный фильм жанра; переводит пользователя в `BrowsingGenre`.
    async fn show_genre_pick(
        &self,
        chat: i64,
        user_id: i64,
        genre_id: u32,
        status: Option<MessageRef>,
    ) -> Result<(), TransportError> {
        let genre_name = self.genres.name_of(genre_id).await.unwrap_or_else(|| "неизвестный жанр".to_string());
        if let Some(msg) = status {
            let text = format!("Ищу фильм в жанре <b>{}</b>…", html_escape(&genre_name));
            if let Err(e) = self.transport.edit(msg, &Reply::text(text)).await {
                tracing::warn!(error = %e, "could not edit genre message");
            }
        }

        let flow = self.sessions.get(user_id).await;
        let previous = flow.last_shown().filter(|_| flow.genre_id() == Some(genre_id)).map(|m| m.movie_id);

        let Some(movies) = self.catalog.discover_by_genre(genre_id, 1).await else {
            self.sessions.reset(user_id).await;
            return self.say(chat, TRY_LATER).await;
        };
        let Some(movie) = pick_random(&movies, previous) else {
            self.sessions.reset(user_id).await;
            let text = format!("Не нашёл фильмов в жанре <b>{}</b>.", html_escape(&genre_name));
            return self.say(chat, &text).await;
        };

        let details = self.catalog.movie_detail(movie.id).await;
        let card = movie_card(movie, details.as_ref(), None);
        let buttons = vec![
            vec![Button::new("➕ В избранное", Action::AddFavorite(movie.id).payload())],
            vec![Button::new("🔄 Ещё из этого жанра", Action::AnotherInGenre.payload())],
        ];

        self.sessions
            .set(
                user_id,
                Flow::BrowsingGenre {
                    genre_id,
                    last_shown: MovieSnapshot { movie_id: movie.id, title: movie.name().to_string() },
                },
            )
            .await;

        self.send_card(chat, Reply::text(card).photo(movie.poster_url()).buttons(buttons)).await?;

        if let Some(msg) = status {
            if let Err(e) = self.transport.delete(msg).await {
                tracing::warn!(error = %e, "could not delete genre message");
            }
        }
        Ok(())
    }

    /* ====== Фильм дня ====== */
    async fn send_daily(&self, chat: i64) -> Result<(), TransportError> {
        let page = rand::thread_rng().gen_range(1..=DAILY_PAGES);
        let Some(movies) = self.catalog.popular(page).await else {
            return self.say(chat, TRY_LATER).await;
        };
        let Some(movie) = pick_random(&movies, None) else {
            return self.say(chat, "Не удалось подобрать фильм дня. Попробуйте позже.").await;
        };

        let details = self.catalog.movie_detail(movie.id).await;
        let card = movie_card(movie, details.as_ref(), Some("☀️ <b>Фильм дня</b>"));
        let buttons = vec![vec![Button::new("➕ В избранное", Action::AddFavorite(movie.id).payload())]];
        self.send_card(chat, Reply::text(card).photo(movie.poster_url()).buttons(buttons)).await
    }

    /* ====== Поиск по тексту ====== */
    async fn send_search(&self, chat: i64, query: &str) -> Result<(), TransportError> {
        let q = html_escape(query);
        let Some(results) = self.catalog.search(query, 1).await else {
            return self.say(chat, &format!("Не удалось выполнить поиск «{q}». Попробуйте позже.")).await;
        };
        if results.is_empty() {
            return self.say(chat, &format!("Ничего не нашёл по запросу «{q}» 😕")).await;
        }

        let shown = &results[..results.len().min(SEARCH_LIMIT)];
        let mut text = format!("🔍 Результаты по запросу «{q}»:\n");
        for (i, m) in shown.iter().enumerate() {
            text.push_str(&format!("\n<b>{}. {}</b>\n", i + 1, html_escape(&m.display_title())));
            if !m.overview.trim().is_empty() {
                text.push_str(&html_escape(&clip(m.overview.trim(), 100)));
                text.push('\n');
            }
        }
        if results.len() > SEARCH_LIMIT {
            text.push_str(&format!("\n<i>Показаны первые {SEARCH_LIMIT}, уточните запрос, если нужного нет.</i>"));
        }

        let buttons = shown
            .iter()
            .map(|m| vec![Button::new(format!("➕ {}", clip(&m.display_title(), 40)), Action::AddFavorite(m.id).payload())])
            .collect();
        self.transport.send(chat, &Reply::text(text).buttons(buttons)).await
    }

    /* ====== Избранное ====== */
    async fn favorites_view(&self, user_id: i64) -> Reply {
        let list = match self.store.list_favorites(user_id).await {
            Ok(list) => list,
            Err(_) => return Reply::text(FAVORITES_UNAVAILABLE),
        };
        if list.is_empty() {
            return Reply::text(EMPTY_FAVORITES);
        }

        let lines: Vec<String> = list.iter().map(|f| format!("• {}", html_escape(&f.title))).collect();
        let text = format!("<b>⭐ Избранное ({}):</b>\n{}", list.len(), lines.join("\n"));
        // две колонки: карточка | удалить
        let rows = list
            .iter()
            .map(|f| {
                vec![
                    Button::new(format!("🎬 {}", clip(&f.title, 40)), Action::ShowMovie(f.movie_id).payload()),
                    Button::new("🗑", Action::RemoveFavorite(f.movie_id).payload()),
                ]
            })
            .collect();
        Reply::text(text).buttons(rows)
    }

    async fn add_favorite(&self, callback_id: &str, user_id: i64, movie_id: u64) -> Result<(), TransportError> {
        let flow = self.sessions.get(user_id).await;
        let title = match flow.title_for(movie_id) {
            Some(title) => title.to_string(),
            None => match self.catalog.movie_detail(movie_id).await {
                Some(details) => details.movie.name().to_string(),
                None => {
                    return self
                        .transport
                        .answer_callback(callback_id, "Не удалось получить данные о фильме.", true)
                        .await
                }
            },
        };

        match self.store.add_favorite(user_id, movie_id, &title).await {
            Ok(AddOutcome::Added) => {
                let text = format!("Добавлено в избранное: {}", clip(&title, 150));
                self.transport.answer_callback(callback_id, &text, false).await
            }
            Ok(AddOutcome::AlreadyExists) => {
                self.transport.answer_callback(callback_id, "Этот фильм уже в избранном.", true).await
            }
            Err(_) => self.transport.answer_callback(callback_id, SOMETHING_WRONG, true).await,
        }
    }

    async fn remove_favorite(
        &self,
        callback_id: &str,
        user_id: i64,
        movie_id: u64,
        list_message: Option<MessageRef>,
    ) -> Result<(), TransportError> {
        match self.store.remove_favorite(user_id, movie_id).await {
            Ok(RemoveOutcome::Removed) => {
                self.transport.answer_callback(callback_id, "Удалено", false).await?;
                if let Some(msg) = list_message {
                    let view = self.favorites_view(user_id).await;
                    if let Err(e) = self.transport.edit(msg, &view).await {
                        tracing::warn!(error = %e, "could not refresh favorites message");
                    }
                }
                Ok(())
            }
            Ok(RemoveOutcome::NotFound) => {
                self.transport.answer_callback(callback_id, "Этого фильма нет в избранном.", true).await
            }
            Err(_) => self.transport.answer_callback(callback_id, SOMETHING_WRONG, true).await,
        }
    }

    /* ====== Админка ====== */
    async fn send_stats(&self, chat: i64) -> Result<(), TransportError> {
        let users = self.store.count_users().await;
        let favorites = self.store.count_favorites().await;
        let text = format!("📊 <b>Статистика бота</b>\n👤 Пользователей: {users}\n⭐ Фильмов в избранном: {favorites}");
        self.say(chat, &text).await
    }

    async fn run_broadcast(&self, chat: i64, text: &str) -> Result<(), TransportError> {
        let recipients = self.store.all_user_ids().await;
        if recipients.is_empty() {
            return self.say(chat, "Некому отправлять: пользователей пока нет.").await;
        }
        self.say(chat, &format!("Начинаю рассылку на {} пользователей…", recipients.len())).await?;

        let report = self.broadcast_to(&recipients, text).await;
        let summary = format!(
            "Рассылка завершена.\n✅ Доставлено: {}\n❌ Не доставлено: {}",
            report.sent, report.failed
        );
        self.say(chat, &summary).await
    }

    /// Строго по очереди с паузой между отправками: лимиты Telegram.
    /// Ошибка одного получателя не прерывает остальных.
    pub async fn broadcast_to(&self, recipients: &[i64], text: &str) -> BroadcastReport {
        let message = Reply::text(format!("📢 <b>Сообщение от администратора</b>\n\n{}", html_escape(text)));
        let mut report = BroadcastReport::default();
        for (i, &user_id) in recipients.iter().enumerate() {
            if i > 0 && !self.broadcast_delay.is_zero() {
                tokio::time::sleep(self.broadcast_delay).await;
            }
            match self.transport.send(user_id, &message).await {
                Ok(()) => report.sent += 1,
                Err(e) => {
                    tracing::warn!(user_id, error = %e, "broadcast delivery failed");
                    report.failed += 1;
                }
            }
        }
        tracing::info!(sent = report.sent, failed = report.failed, "broadcast finished");
        report
    }

    /* ====== Отправка ====== */
    async fn say(&self, chat: i64, text: &str) -> Result<(), TransportError> {
        self.transport.send(chat, &Reply::text(text)).await
    }

    /// С постером, а если Telegram его не принял, то текстом.
    async fn send_card(&self, chat: i64, reply: Reply) -> Result<(), TransportError> {
        match self.transport.send(chat, &reply).await {
            Err(e) if reply.photo_url.is_some() => {
                tracing::warn!(error = %e, "failed to send poster, falling back to text");
                self.transport.send(chat, &reply.without_photo()).await
            }
            other => other,
        }
    }
}

/* ====== Вспомогательные ====== */

fn genre_keyboard(genres: &GenreMap) -> Vec<Vec<Button>> {
    let mut sorted: Vec<(&u32, &String)> = genres.iter().collect();
    sorted.sort_by(|a, b| a.1.cmp(b.1).then(a.0.cmp(b.0)));
    sorted
        .chunks(2)
        .map(|row| {
            row.iter()
                .map(|(id, name)| Button::new(capitalize(name), Action::SelectGenre(**id).payload()))
                .collect()
        })
        .collect()
}

/// Случайный фильм, по возможности не тот, что показывали только что.
fn pick_random(movies: &[Movie], exclude: Option<u64>) -> Option<&Movie> {
    let fresh: Vec<&Movie> = movies.iter().filter(|m| Some(m.id) != exclude).collect();
    let mut rng = rand::thread_rng();
    if fresh.is_empty() {
        movies.choose(&mut rng)
    } else {
        fresh.choose(&mut rng).copied()
    }
}

/// Карточка фильма. Описание урезается так, чтобы вся карточка влезла
/// в подпись к постеру.
fn movie_card(m: &Movie, details: Option<&MovieDetails>, headline: Option<&str>) -> String {
    let mut head = String::new();
    if let Some(h) = headline {
        head.push_str(h);
        head.push_str("\n\n");
    }
    head.push_str(&format!("🎬 <b>{}</b>", html_escape(m.name())));
    if let Some(y) = m.year() {
        head.push_str(&format!(" ({y})"));
    }
    head.push('\n');
    if m.vote_average > 0.0 {
        head.push_str(&format!("\n⭐ Рейтинг: {:.1}/10", m.vote_average));
    }

    let mut tail = String::new();
    if let Some(d) = details {
        let genres = d.genre_names();
        if !genres.is_empty() {
            head.push_str(&format!("\n🎭 Жанры: {}", html_escape(&genres.join(", "))));
        }
        if let Some(minutes) = d.runtime.filter(|m| *m > 0) {
            head.push_str(&format!("\n⏱ {minutes} мин."));
        }
        if let Some(director) = d.director() {
            head.push_str(&format!("\n🎥 Режиссёр: {}", html_escape(director)));
        }
        let cast = d.top_cast(CAST_LIMIT);
        if !cast.is_empty() {
            head.push_str(&format!("\n👥 В ролях: {}", html_escape(&cast.join(", "))));
        }
        let similar = d.recommended_titles(RECOMMENDATIONS_LIMIT);
        if !similar.is_empty() {
            tail = format!("\n\n🍿 Похожие: {}", html_escape(&similar.join(", ")));
        }
    }

    let overview = m.overview.trim();
    let body = if overview.is_empty() {
        "<i>нет описания</i>".to_string()
    } else {
        // "\n\n" перед описанием и "…" после обрезки
        let room = CAPTION_LIMIT.saturating_sub(visible_len(&head) + visible_len(&tail) + 3);
        format!("<i>{}</i>", html_escape(&clip(overview, room.min(OVERVIEW_LIMIT))))
    };
    format!("{head}\n\n{body}{tail}")
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

/// Обрезка по графемам, чтобы не рвать эмодзи и составные символы.
fn clip(s: &str, max: usize) -> String {
    let mut graphemes = s.graphemes(true);
    let head: String = graphemes.by_ref().take(max).collect();
    if graphemes.next().is_some() {
        head + "…"
    } else {
        head
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::Markup;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashSet;
    use std::sync::Mutex;
    use tempfile::TempDir;
    use wiremock::matchers::{path, path_regex, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const ADMIN: i64 = 1;
    const USER: i64 = 500;

    #[derive(Default)]
    struct RecordingTransport {
        failing: HashSet<i64>,
        reject_photos: bool,
        sent: Mutex<Vec<(i64, Reply)>>,
        attempts: Mutex<Vec<i64>>,
        edits: Mutex<Vec<(MessageRef, Reply)>>,
        deleted: Mutex<Vec<MessageRef>>,
        answers: Mutex<Vec<(String, bool)>>,
    }

    #[async_trait]
    impl ChatTransport for RecordingTransport {
        async fn send(&self, chat_id: i64, reply: &Reply) -> Result<(), TransportError> {
            self.attempts.lock().unwrap().push(chat_id);
            if self.failing.contains(&chat_id) {
                return Err(TransportError::Other("bot was blocked by the user".into()));
            }
            if self.reject_photos && reply.photo_url.is_some() {
                return Err(TransportError::Other("wrong file identifier".into()));
            }
            self.sent.lock().unwrap().push((chat_id, reply.clone()));
            Ok(())
        }

        async fn edit(&self, target: MessageRef, reply: &Reply) -> Result<(), TransportError> {
            self.edits.lock().unwrap().push((target, reply.clone()));
            Ok(())
        }

        async fn delete(&self, target: MessageRef) -> Result<(), TransportError> {
            self.deleted.lock().unwrap().push(target);
            Ok(())
        }

        async fn answer_callback(&self, _id: &str, text: &str, alert: bool) -> Result<(), TransportError> {
            self.answers.lock().unwrap().push((text.to_string(), alert));
            Ok(())
        }
    }

    impl RecordingTransport {
        fn texts(&self) -> Vec<String> {
            self.sent.lock().unwrap().iter().map(|(_, r)| r.text.clone()).collect()
        }

        fn last(&self) -> Reply {
            self.sent.lock().unwrap().last().map(|(_, r)| r.clone()).unwrap()
        }

        fn last_answer(&self) -> (String, bool) {
            self.answers.lock().unwrap().last().cloned().unwrap()
        }
    }

    struct Harness {
        _dir: TempDir,
        server: MockServer,
        router: Router<RecordingTransport>,
    }

    async fn harness(transport: RecordingTransport) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let server = MockServer::start().await;
        let catalog = TmdbClient::with_base_url("k".into(), server.uri());
        let store = FavoritesStore::open(dir.path().join("bot.db")).await.unwrap();
        let router = Router::new(transport, catalog.clone(), GenreCache::new(catalog), store, ADMIN)
            .with_broadcast_delay(Duration::ZERO);
        Harness { _dir: dir, server, router }
    }

    fn profile(user_id: i64) -> UserProfile {
        UserProfile { user_id, first_name: format!("u{user_id}"), last_name: None, handle: None }
    }

    fn command(user_id: i64, cmd: Command) -> Incoming {
        Incoming { chat_id: user_id, from: profile(user_id), input: Input::Command(cmd) }
    }

    fn text(user_id: i64, t: &str) -> Incoming {
        Incoming { chat_id: user_id, from: profile(user_id), input: Input::Text(t.into()) }
    }

    fn press(user_id: i64, data: &str) -> Incoming {
        press_on(user_id, data, None, Vec::new())
    }

    fn press_on(user_id: i64, data: &str, message: Option<MessageRef>, keyboard: Vec<String>) -> Incoming {
        Incoming {
            chat_id: user_id,
            from: profile(user_id),
            input: Input::Callback { id: "cb".into(), data: data.into(), message, keyboard },
        }
    }

    fn movie_json(id: u64, title: &str) -> serde_json::Value {
        json!({"id": id, "title": title, "overview": "Описание", "release_date": "2001-01-01",
               "vote_average": 7.5, "poster_path": format!("/{id}.jpg")})
    }

    async fn mount_genres(server: &MockServer) {
        Mock::given(path("/genre/movie/list"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "genres": [{"id": 35, "name": "комедия"}, {"id": 18, "name": "драма"}, {"id": 27, "name": "ужасы"}]
            })))
            .mount(server)
            .await;
    }

    async fn mount_any_detail(server: &MockServer) {
        Mock::given(path_regex(r"^/movie/\d+$"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": 1, "title": "Деталь",
                "credits": {"cast": [{"name": "Актёр"}], "crew": [{"name": "Режиссёр", "job": "Director"}]}
            })))
            .mount(server)
            .await;
    }

    fn inline_payloads(reply: &Reply) -> Vec<String> {
        match &reply.markup {
            Markup::Inline(rows) => rows.iter().flatten().map(|b| b.payload.clone()).collect(),
            _ => Vec::new(),
        }
    }

    #[test]
    fn parses_callback_payloads() {
        assert_eq!(Action::parse("genre_35"), Ok(Action::SelectGenre(35)));
        assert_eq!(Action::parse("genre_next"), Ok(Action::AnotherInGenre));
        assert_eq!(Action::parse("fav_add_603"), Ok(Action::AddFavorite(603)));
        assert_eq!(Action::parse("fav_rem_603"), Ok(Action::RemoveFavorite(603)));
        assert_eq!(Action::parse("fav_show_7"), Ok(Action::ShowMovie(7)));
        assert_eq!(Action::parse("admin_stats"), Ok(Action::AdminStats));
        assert_eq!(Action::parse("admin_broadcast"), Ok(Action::AdminBroadcast));

        assert!(matches!(Action::parse("fav_add_abc"), Err(PayloadError::BadId(_))));
        assert!(matches!(Action::parse("genre_-1"), Err(PayloadError::BadId(_))));
        assert!(matches!(Action::parse("show:1"), Err(PayloadError::Unknown(_))));
        assert_eq!(Action::parse(&Action::RemoveFavorite(9).payload()), Ok(Action::RemoveFavorite(9)));
    }

    #[test]
    fn clips_by_graphemes() {
        assert_eq!(clip("абв", 5), "абв");
        assert_eq!(clip("абвгд", 3), "абв…");
        assert_eq!(clip("👍🏽👍🏽👍🏽", 2), "👍🏽👍🏽…");
    }

    #[test]
    fn genre_keyboard_is_sorted_two_per_row() {
        let genres: GenreMap = [(35, "комедия"), (18, "драма"), (27, "ужасы")]
            .into_iter()
            .map(|(id, n)| (id, n.to_string()))
            .collect();
        let rows = genre_keyboard(&genres);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0][0], Button::new("Драма", "genre_18"));
        assert_eq!(rows[0][1], Button::new("Комедия", "genre_35"));
        assert_eq!(rows[1], vec![Button::new("Ужасы", "genre_27")]);
    }

    #[tokio::test]
    async fn browsing_a_genre_keeps_the_genre_until_reset() {
        let h = harness(RecordingTransport::default()).await;
        mount_genres(&h.server).await;
        mount_any_detail(&h.server).await;
        Mock::given(path("/discover/movie"))
            .and(query_param("with_genres", "35"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "results": [movie_json(1, "Первый"), movie_json(2, "Второй")]
            })))
            .expect(2)
            .mount(&h.server)
            .await;
        Mock::given(path("/movie/popular"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"results": [movie_json(3, "Хит")]})))
            .mount(&h.server)
            .await;

        let status = MessageRef { chat_id: USER, message_id: 10 };
        h.router.handle(press_on(USER, "genre_35", Some(status), Vec::new())).await.unwrap();
        let first = h.router.sessions.get(USER).await;
        assert_eq!(first.genre_id(), Some(35));
        let first_id = first.last_shown().unwrap().movie_id;
        assert!(inline_payloads(&h.router.transport.last()).contains(&"genre_next".to_string()));
        assert_eq!(h.router.transport.edits.lock().unwrap()[0].0, status);
        assert_eq!(h.router.transport.deleted.lock().unwrap().as_slice(), &[status]);

        h.router.handle(press(USER, "genre_next")).await.unwrap();
        let second = h.router.sessions.get(USER).await;
        assert_eq!(second.genre_id(), Some(35));
        assert_ne!(second.last_shown().unwrap().movie_id, first_id);

        h.router.handle(command(USER, Command::Daily)).await.unwrap();
        assert_eq!(h.router.sessions.get(USER).await, Flow::Idle);
        assert!(h.router.transport.last().text.contains("Фильм дня"));

        h.router.handle(press(USER, "genre_next")).await.unwrap();
        assert_eq!(h.router.transport.last_answer().0, PICK_GENRE_FIRST);
        assert_eq!(h.router.transport.last().text, "Выберите жанр:");
        assert_eq!(h.router.sessions.get(USER).await, Flow::Idle);
    }

    #[tokio::test]
    async fn free_text_runs_a_search() {
        let h = harness(RecordingTransport::default()).await;
        let results: Vec<_> = (1..=7).map(|i| movie_json(i, &format!("Matrix {i}"))).collect();
        Mock::given(path("/search/movie"))
            .and(query_param("query", "Matrix"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"results": results})))
            .expect(1)
            .mount(&h.server)
            .await;
        for p in ["/discover/movie", "/movie/popular", "/genre/movie/list"] {
            Mock::given(path(p)).respond_with(ResponseTemplate::new(200)).expect(0).mount(&h.server).await;
        }

        h.router.handle(text(USER, "Matrix")).await.unwrap();

        let reply = h.router.transport.last();
        assert!(reply.text.contains("Matrix 5"));
        assert!(!reply.text.contains("Matrix 6"));
        assert!(reply.text.contains("Показаны первые 5"));
        assert_eq!(
            inline_payloads(&reply),
            (1..=5).map(|i| format!("fav_add_{i}")).collect::<Vec<_>>()
        );
    }

    #[tokio::test]
    async fn unknown_slash_text_is_not_searched() {
        let h = harness(RecordingTransport::default()).await;
        Mock::given(path("/search/movie")).respond_with(ResponseTemplate::new(200)).expect(0).mount(&h.server).await;

        h.router.handle(text(USER, "/frobnicate")).await.unwrap();
        assert_eq!(h.router.transport.last().text, UNKNOWN_COMMAND);
    }

    #[tokio::test]
    async fn catalog_outage_is_reported_not_fatal() {
        let h = harness(RecordingTransport::default()).await;
        Mock::given(path("/search/movie")).respond_with(ResponseTemplate::new(503)).mount(&h.server).await;
        Mock::given(path("/movie/popular")).respond_with(ResponseTemplate::new(500)).mount(&h.server).await;
        Mock::given(path("/genre/movie/list")).respond_with(ResponseTemplate::new(401)).mount(&h.server).await;

        h.router.handle(text(USER, "Matrix")).await.unwrap();
        assert!(h.router.transport.last().text.starts_with("Не удалось выполнить поиск"));

        h.router.handle(command(USER, Command::Daily)).await.unwrap();
        assert_eq!(h.router.transport.last().text, TRY_LATER);

        h.router.handle(command(USER, Command::Genre)).await.unwrap();
        assert_eq!(h.router.transport.last().text, GENRES_UNAVAILABLE);
    }

    #[tokio::test]
    async fn add_favorite_reuses_the_shown_title() {
        let h = harness(RecordingTransport::default()).await;
        mount_genres(&h.server).await;
        Mock::given(path("/discover/movie"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"results": [movie_json(11, "Амели")]})))
            .mount(&h.server)
            .await;
        // один раз для карточки, не для добавления
        Mock::given(path("/movie/11"))
            .respond_with(ResponseTemplate::new(200).set_body_json(movie_json(11, "Амели")))
            .expect(1)
            .mount(&h.server)
            .await;
        Mock::given(path("/movie/77"))
            .respond_with(ResponseTemplate::new(200).set_body_json(movie_json(77, "Сталкер")))
            .expect(1)
            .mount(&h.server)
            .await;

        h.router.handle(press(USER, "genre_35")).await.unwrap();
        h.router.handle(press(USER, "fav_add_11")).await.unwrap();
        assert_eq!(h.router.transport.last_answer(), ("Добавлено в избранное: Амели".to_string(), false));

        h.router.handle(press(USER, "fav_add_11")).await.unwrap();
        assert_eq!(h.router.transport.last_answer(), ("Этот фильм уже в избранном.".to_string(), true));

        h.router.handle(press(USER, "fav_add_77")).await.unwrap();
        assert_eq!(h.router.transport.last_answer().0, "Добавлено в избранное: Сталкер");

        let titles: Vec<String> =
            h.router.store.list_favorites(USER).await.unwrap().into_iter().map(|f| f.title).collect();
        assert_eq!(titles, vec!["Сталкер", "Амели"]);
    }

    #[tokio::test]
    async fn unresolvable_movie_is_not_added() {
        let h = harness(RecordingTransport::default()).await;
        Mock::given(path("/movie/404")).respond_with(ResponseTemplate::new(404)).mount(&h.server).await;

        h.router.handle(press(USER, "fav_add_404")).await.unwrap();
        assert_eq!(h.router.transport.last_answer(), ("Не удалось получить данные о фильме.".to_string(), true));
        assert!(h.router.store.list_favorites(USER).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn malformed_payload_gets_generic_answer() {
        let h = harness(RecordingTransport::default()).await;
        h.router.handle(press(USER, "fav_add_abc")).await.unwrap();
        assert_eq!(h.router.transport.last_answer(), (SOMETHING_WRONG.to_string(), true));
        assert!(h.router.transport.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn removing_a_favorite_refreshes_the_list() {
        let h = harness(RecordingTransport::default()).await;
        h.router.handle(command(USER, Command::Favorites)).await.unwrap();
        assert_eq!(h.router.transport.last().text, EMPTY_FAVORITES);

        h.router.store.add_favorite(USER, 1, "Первый").await.unwrap();
        h.router.store.add_favorite(USER, 2, "Второй").await.unwrap();

        h.router.handle(command(USER, Command::Favorites)).await.unwrap();
        let list = h.router.transport.last();
        assert!(list.text.contains("Избранное (2)"));
        assert_eq!(inline_payloads(&list), vec!["fav_show_2", "fav_rem_2", "fav_show_1", "fav_rem_1"]);

        let msg = MessageRef { chat_id: USER, message_id: 42 };
        h.router.handle(press_on(USER, "fav_rem_2", Some(msg), inline_payloads(&list))).await.unwrap();
        assert_eq!(h.router.transport.last_answer(), ("Удалено".to_string(), false));
        let (target, refreshed) = h.router.transport.edits.lock().unwrap().last().cloned().unwrap();
        assert_eq!(target, msg);
        assert_eq!(inline_payloads(&refreshed), vec!["fav_show_1", "fav_rem_1"]);

        h.router.handle(press_on(USER, "fav_rem_2", Some(msg), inline_payloads(&refreshed))).await.unwrap();
        assert_eq!(h.router.transport.last_answer(), ("Этого фильма нет в избранном.".to_string(), true));
        assert_eq!(h.router.transport.edits.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn removing_from_a_movie_card_leaves_the_card_alone() {
        let h = harness(RecordingTransport::default()).await;
        Mock::given(path("/movie/1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(movie_json(1, "Первый")))
            .mount(&h.server)
            .await;
        h.router.handle(command(USER, Command::Favorites)).await.unwrap();
        h.router.store.add_favorite(USER, 1, "Первый").await.unwrap();

        h.router.handle(press(USER, "fav_show_1")).await.unwrap();
        let card = h.router.transport.last();
        assert!(card.photo_url.is_some());
        assert_eq!(inline_payloads(&card), vec!["fav_rem_1"]);

        let card_msg = MessageRef { chat_id: USER, message_id: 77 };
        h.router.handle(press_on(USER, "fav_rem_1", Some(card_msg), inline_payloads(&card))).await.unwrap();

        assert_eq!(h.router.transport.last_answer(), ("Удалено".to_string(), false));
        assert!(h.router.transport.edits.lock().unwrap().is_empty());
        assert!(h.router.store.list_favorites(USER).await.unwrap().is_empty());
    }

    #[test]
    fn long_card_still_fits_a_caption() {
        let movie = Movie {
            id: 1,
            title: "Очень длинный фильм".into(),
            original_title: String::new(),
            overview: "Том & Джерри <снова> ".repeat(200),
            poster_path: Some("/p.jpg".into()),
            release_date: Some("1999-01-01".into()),
            vote_average: 8.0,
        };
        let card = movie_card(&movie, None, Some("☀️ <b>Фильм дня</b>"));

        assert!(visible_len(&card) <= CAPTION_LIMIT, "{}", visible_len(&card));
        assert!(card.ends_with("…</i>"));
        assert!(card.contains("Том &amp; Джерри &lt;снова&gt;"));
        assert!(!card.contains("&am…"));
    }

    #[test]
    fn short_overview_is_kept_whole() {
        let movie: Movie = serde_json::from_value(movie_json(2, "Короткий")).unwrap();
        let card = movie_card(&movie, None, None);
        assert!(card.contains("<i>Описание</i>"));
        assert!(card.starts_with("🎬 <b>Короткий</b> (2001)"));
    }

    #[tokio::test]
    async fn broken_store_does_not_silence_the_bot() {
        let h = harness(RecordingTransport::default()).await;
        let db = h._dir.path().join("bot.db");
        std::fs::remove_file(&db).unwrap();
        std::fs::create_dir(&db).unwrap();

        h.router.handle(command(USER, Command::Help)).await.unwrap();
        assert!(h.router.transport.last().text.contains("/favorites"));

        h.router.handle(command(USER, Command::Favorites)).await.unwrap();
        assert_eq!(h.router.transport.last().text, FAVORITES_UNAVAILABLE);
    }

    #[tokio::test]
    async fn poster_failure_falls_back_to_text() {
        let h = harness(RecordingTransport { reject_photos: true, ..Default::default() }).await;
        mount_any_detail(&h.server).await;
        Mock::given(path("/movie/popular"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"results": [movie_json(3, "Хит")]})))
            .mount(&h.server)
            .await;

        h.router.handle(command(USER, Command::Daily)).await.unwrap();
        let card = h.router.transport.last();
        assert!(card.photo_url.is_none());
        assert!(card.text.contains("Хит"));
        assert!(card.text.contains("Режиссёр"));
    }

    #[tokio::test]
    async fn broadcast_survives_a_failed_recipient() {
        let transport = RecordingTransport { failing: HashSet::from([202]), ..Default::default() };
        let h = harness(transport).await;

        let report = h.router.broadcast_to(&[101, 202, 303], "Привет <всем>").await;

        assert_eq!(report, BroadcastReport { sent: 2, failed: 1 });
        assert_eq!(h.router.transport.attempts.lock().unwrap().as_slice(), &[101, 202, 303]);
        assert!(h.router.transport.texts()[0].contains("Привет &lt;всем&gt;"));
    }

    #[tokio::test]
    async fn broadcast_button_consumes_next_text() {
        let transport = RecordingTransport { failing: HashSet::from([202]), ..Default::default() };
        let h = harness(transport).await;
        for id in [101, 202] {
            h.router.store.ensure_user(&profile(id)).await.unwrap();
        }

        h.router.handle(press(ADMIN, "admin_broadcast")).await.unwrap();
        assert_eq!(h.router.sessions.get(ADMIN).await, Flow::AwaitingBroadcast);
        assert_eq!(h.router.transport.last().text, BROADCAST_PROMPT);

        h.router.handle(text(ADMIN, "Новые фильмы!")).await.unwrap();
        assert_eq!(h.router.sessions.get(ADMIN).await, Flow::Idle);
        // админ тоже получатель: 1, 101 доставлены, 202 нет
        let summary = h.router.transport.last().text;
        assert!(summary.contains("Доставлено: 2"), "{summary}");
        assert!(summary.contains("Не доставлено: 1"), "{summary}");
    }

    #[tokio::test]
    async fn cancel_aborts_pending_broadcast() {
        let h = harness(RecordingTransport::default()).await;
        h.router.store.ensure_user(&profile(101)).await.unwrap();

        h.router.handle(press(ADMIN, "admin_broadcast")).await.unwrap();
        h.router.handle(command(ADMIN, Command::Cancel)).await.unwrap();
        assert_eq!(h.router.sessions.get(ADMIN).await, Flow::Idle);
        assert_eq!(h.router.transport.last().text, "Рассылка отменена.");
        assert!(!h.router.transport.attempts.lock().unwrap().contains(&101));

        h.router.handle(command(ADMIN, Command::Cancel)).await.unwrap();
        assert_eq!(h.router.transport.last().text, "Нечего отменять.");
    }

    #[tokio::test]
    async fn admin_features_are_gated() {
        let h = harness(RecordingTransport::default()).await;

        h.router.handle(command(USER, Command::Stats)).await.unwrap();
        assert_eq!(h.router.transport.last().text, ADMIN_ONLY);

        h.router.handle(command(USER, Command::Broadcast("спам".into()))).await.unwrap();
        assert_eq!(h.router.transport.last().text, ADMIN_ONLY);
        assert!(!h.router.transport.texts().iter().any(|t| t.contains("спам")));

        h.router.handle(press(USER, "admin_broadcast")).await.unwrap();
        assert_eq!(h.router.transport.last_answer(), (ADMIN_ONLY.to_string(), true));
        assert_eq!(h.router.sessions.get(USER).await, Flow::Idle);
    }

    #[tokio::test]
    async fn admin_sees_stats_and_can_broadcast_inline() {
        let h = harness(RecordingTransport::default()).await;
        h.router.store.ensure_user(&profile(101)).await.unwrap();
        h.router.store.add_favorite(101, 5, "Фильм").await.unwrap();

        h.router.handle(command(ADMIN, Command::Admin)).await.unwrap();
        assert_eq!(inline_payloads(&h.router.transport.last()), vec!["admin_stats", "admin_broadcast"]);

        h.router.handle(press(ADMIN, "admin_stats")).await.unwrap();
        let stats = h.router.transport.last().text;
        assert!(stats.contains("Пользователей: 2"), "{stats}");
        assert!(stats.contains("в избранном: 1"), "{stats}");

        h.router.handle(command(ADMIN, Command::Broadcast("  ".into()))).await.unwrap();
        assert_eq!(h.router.transport.last().text, BROADCAST_USAGE);

        h.router.handle(command(ADMIN, Command::Broadcast("Привет".into()))).await.unwrap();
        assert!(h.router.transport.last().text.contains("Доставлено: 2"));
    }

    #[tokio::test]
    async fn every_event_registers_the_user() {
        let h = harness(RecordingTransport::default()).await;
        h.router.handle(command(USER, Command::Start)).await.unwrap();
        h.router.handle(command(USER, Command::Help)).await.unwrap();

        assert_eq!(h.router.store.all_user_ids().await, vec![USER]);
        let start = h.router.transport.sent.lock().unwrap()[0].1.clone();
        assert!(matches!(start.markup, Markup::MainMenu(_)));
        assert!(h.router.transport.last().text.contains("/favorites"));
    }

    #[tokio::test]
    async fn menu_buttons_act_like_commands() {
        let h = harness(RecordingTransport::default()).await;
        mount_genres(&h.server).await;

        h.router.handle(text(USER, MENU_GENRE)).await.unwrap();
        assert_eq!(h.router.transport.last().text, "Выберите жанр:");

        h.router.handle(text(USER, MENU_SEARCH)).await.unwrap();
        assert_eq!(h.router.transport.last().text, SEARCH_HINT);
    }
}
