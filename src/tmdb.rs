use std::collections::HashMap;

use reqwest::Client;
use serde::{de::DeserializeOwned, Deserialize};
use thiserror::Error;

pub const DEFAULT_BASE_URL: &str = "https://api.themoviedb.org/3";
pub const IMAGE_BASE_URL: &str = "https://image.tmdb.org/t/p/w500";
const LANGUAGE: &str = "ru-RU";

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("catalog returned no data")]
    Empty,
}

#[derive(Clone)]
pub struct TmdbClient {
    api_key: String,
    base_url: String,
    http: Client,
}

impl TmdbClient {
    pub fn new(api_key: String) -> Self {
        Self::with_base_url(api_key, DEFAULT_BASE_URL)
    }

    pub fn with_base_url(api_key: String, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { api_key, base_url, http: Client::new() }
    }

    /// Справочник жанров: id -> локализованное название.
    pub async fn list_genres(&self) -> Option<HashMap<u32, String>> {
        let data: GenresResp = self.fetch("/genre/movie/list", "").await?;
        Some(data.genres.into_iter().map(|g| (g.id, g.name)).collect())
    }

    /// Популярные фильмы жанра, страница `page`.
    pub async fn discover_by_genre(&self, genre_id: u32, page: u32) -> Option<Vec<Movie>> {
        let extra = format!("&with_genres={genre_id}&sort_by=popularity.desc&page={page}");
        let data: Page<Movie> = self.fetch("/discover/movie", &extra).await?;
        Some(data.results)
    }

    pub async fn search(&self, query: &str, page: u32) -> Option<Vec<Movie>> {
        let extra = format!("&query={}&page={page}", urlencoding::encode(query));
        let data: Page<Movie> = self.fetch("/search/movie", &extra).await?;
        Some(data.results)
    }

    /// Детали фильма вместе с титрами и рекомендациями (один запрос).
    pub async fn movie_detail(&self, movie_id: u64) -> Option<MovieDetails> {
        let path = format!("/movie/{movie_id}");
        self.fetch(&path, "&append_to_response=credits,recommendations").await
    }

    pub async fn popular(&self, page: u32) -> Option<Vec<Movie>> {
        let data: Page<Movie> = self.fetch("/movie/popular", &format!("&page={page}")).await?;
        Some(data.results)
    }

    /// Любой сбой (сеть, 4xx/5xx, битый JSON) схлопывается в `None`.
    async fn fetch<T: DeserializeOwned>(&self, path: &str, extra_query: &str) -> Option<T> {
        match self.get_json(path, extra_query).await {
            Ok(v) => Some(v),
            Err(e) => {
                tracing::warn!(%path, error = %e, "tmdb request failed");
                None
            }
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str, extra_query: &str) -> Result<T, CatalogError> {
        let url = format!(
            "{}{}?api_key={}&language={}&include_adult=false{}",
            self.base_url,
            path,
            urlencoding::encode(&self.api_key),
            LANGUAGE,
            extra_query
        );
        tracing::debug!(%path, "tmdb request");
        let resp = self.http.get(url).send().await?.error_for_status()?;
        Ok(resp.json::<T>().await?)
    }
}

pub fn poster_url(poster_path: Option<&str>) -> Option<String> {
    poster_path
        .filter(|p| !p.trim().is_empty())
        .map(|p| format!("{IMAGE_BASE_URL}{p}"))
}

/* ======= DTOs ======= */

#[derive(Deserialize, Debug)]
struct GenresResp {
    #[serde(default)]
    genres: Vec<Genre>,
}

#[derive(Deserialize, Debug)]
struct Page<T> {
    #[serde(default = "Vec::new")]
    results: Vec<T>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct Genre {
    pub id: u32,
    pub name: String,
}

#[derive(Deserialize, Debug, Clone)]
pub struct Movie {
    pub id: u64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub original_title: String,
    #[serde(default)]
    pub overview: String,
    pub poster_path: Option<String>,
    pub release_date: Option<String>,
    #[serde(default)]
    pub vote_average: f64,
}

impl Movie {
    pub fn year(&self) -> Option<&str> {
        self.release_date.as_deref().and_then(|d| d.get(..4))
    }

    /// Локализованное название, а если его нет, то оригинальное.
    pub fn name(&self) -> &str {
        if self.title.trim().is_empty() { &self.original_title } else { &self.title }
    }

    /// Название для кнопок и списков: «Title (1999)».
    pub fn display_title(&self) -> String {
        let title = self.name();
        match self.year() {
            Some(y) => format!("{title} ({y})"),
            None => title.to_string(),
        }
    }

    pub fn poster_url(&self) -> Option<String> {
        poster_url(self.poster_path.as_deref())
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct MovieDetails {
    #[serde(flatten)]
    pub movie: Movie,
    #[serde(default)]
    pub genres: Vec<Genre>,
    pub runtime: Option<u32>,
    #[serde(default)]
    pub credits: Credits,
    pub recommendations: Option<Recommendations>,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct Credits {
    #[serde(default)]
    pub cast: Vec<CastMember>,
    #[serde(default)]
    pub crew: Vec<CrewMember>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct CastMember {
    pub name: String,
}

#[derive(Deserialize, Debug, Clone)]
pub struct CrewMember {
    pub name: String,
    #[serde(default)]
    pub job: String,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct Recommendations {
    #[serde(default)]
    pub results: Vec<Movie>,
}

impl MovieDetails {
    pub fn director(&self) -> Option<&str> {
        self.credits.crew.iter().find(|c| c.job == "Director").map(|c| c.name.as_str())
    }

    pub fn top_cast(&self, n: usize) -> Vec<&str> {
        self.credits.cast.iter().take(n).map(|c| c.name.as_str()).collect()
    }

    pub fn genre_names(&self) -> Vec<&str> {
        self.genres.iter().map(|g| g.name.as_str()).collect()
    }

    pub fn recommended_titles(&self, n: usize) -> Vec<String> {
        self.recommendations
            .as_ref()
            .map(|r| r.results.iter().take(n).map(Movie::display_title).collect())
            .unwrap_or_default()
    }
}
