use std::{collections::HashMap, sync::Arc};

use tokio::sync::RwLock;

/// Фильм, который пользователь видит прямо сейчас; хватает, чтобы добавить
/// его в избранное без повторного запроса в TMDB.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MovieSnapshot {
    pub movie_id: u64,
    pub title: String,
}

/// Активный многошаговый сценарий пользователя.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Flow {
    #[default]
    Idle,
    BrowsingGenre { genre_id: u32, last_shown: MovieSnapshot },
    /// Только для админа: следующий текст уйдёт в рассылку.
    AwaitingBroadcast,
}

impl Flow {
    pub fn genre_id(&self) -> Option<u32> {
        match self {
            Flow::BrowsingGenre { genre_id, .. } => Some(*genre_id),
            _ => None,
        }
    }

    pub fn last_shown(&self) -> Option<&MovieSnapshot> {
        match self {
            Flow::BrowsingGenre { last_shown, .. } => Some(last_shown),
            _ => None,
        }
    }

    /// Название показанного фильма, если это именно он.
    pub fn title_for(&self, movie_id: u64) -> Option<&str> {
        self.last_shown().filter(|m| m.movie_id == movie_id).map(|m| m.title.as_str())
    }
}

/// user_id -> flow. Живёт только в памяти процесса.
#[derive(Clone, Default)]
pub struct Sessions {
    inner: Arc<RwLock<HashMap<i64, Flow>>>,
}

impl Sessions {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, user_id: i64) -> Flow {
        self.inner.read().await.get(&user_id).cloned().unwrap_or_default()
    }

    pub async fn set(&self, user_id: i64, flow: Flow) {
        if flow == Flow::Idle {
            self.reset(user_id).await;
        } else {
            self.inner.write().await.insert(user_id, flow);
        }
    }

    /// Возвращает то, что было до сброса.
    pub async fn reset(&self, user_id: i64) -> Flow {
        self.inner.write().await.remove(&user_id).unwrap_or_default()
    }
}
