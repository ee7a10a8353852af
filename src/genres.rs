use std::{collections::HashMap, sync::Arc};

use moka::future::Cache;

use crate::tmdb::{CatalogError, TmdbClient};

pub type GenreMap = HashMap<u32, String>;

/// Кэш справочника жанров на всё время жизни процесса.
///
/// Заполняется целиком при первом обращении; неудачная или пустая загрузка
/// не кэшируется, поэтому следующий вызов повторит запрос.
#[derive(Clone)]
pub struct GenreCache {
    catalog: TmdbClient,
    cache: Cache<(), Arc<GenreMap>>,
}

impl GenreCache {
    pub fn new(catalog: TmdbClient) -> Self {
        Self { catalog, cache: Cache::builder().initial_capacity(1).build() }
    }

    pub async fn get(&self) -> Arc<GenreMap> {
        let loaded = self
            .cache
            .try_get_with((), async {
                match self.catalog.list_genres().await {
                    Some(genres) if !genres.is_empty() => {
                        tracing::info!(count = genres.len(), "genres cached");
                        Ok(Arc::new(genres))
                    }
                    _ => Err(CatalogError::Empty),
                }
            })
            .await;

        match loaded {
            Ok(genres) => genres,
            Err(e) => {
                tracing::warn!(error = %e, "failed to load genres");
                Arc::new(GenreMap::new())
            }
        }
    }

    pub async fn name_of(&self, genre_id: u32) -> Option<String> {
        self.get().await.get(&genre_id).cloned()
    }

    #[allow(dead_code)]
    pub async fn invalidate(&self) {
        self.cache.invalidate(&()).await;
    }

    #[cfg(test)]
    pub fn is_populated(&self) -> bool {
        self.cache.contains_key(&())
    }
}
