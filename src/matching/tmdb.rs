//! TMDB metadata provider.

use async_trait::async_trait;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use reqwest::Client;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::num::NonZeroU32;
use std::time::Duration;
use tracing::debug;

use crate::config::TmdbConfig;
use crate::error::MatchError;
use crate::model::Film;
use crate::retry::{RetryPolicy, with_retry};

/// Full record for one film, with crew ids for directors whose names the
/// provider left out.
#[derive(Debug, Clone, PartialEq)]
pub struct FilmDetails {
    pub film: Film,
    pub director_ids: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Person {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub imdb_id: Option<String>,
}

/// Read-only film metadata oracle.
#[async_trait]
pub trait MetadataProvider: Send + Sync {
    /// Candidate films for a title. Candidates carry provider ids and are not
    /// yet persisted.
    async fn search_films(&self, title: &str, year: Option<i32>) -> Result<Vec<Film>, MatchError>;

    async fn get_film_details(&self, tmdb_id: u64) -> Result<FilmDetails, MatchError>;

    async fn get_person_details(&self, person_id: u64) -> Result<Person, MatchError>;
}

/// Film ids for provider-backed films are derived from the provider id so
/// repeated resolution of the same film lands on the same record.
pub fn film_id_for(tmdb_id: u64) -> String {
    format!("tmdb-{tmdb_id}")
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<MovieSummary>,
}

#[derive(Debug, Deserialize)]
struct MovieSummary {
    id: u64,
    title: String,
    #[serde(default)]
    release_date: Option<String>,
    #[serde(default)]
    overview: Option<String>,
    #[serde(default)]
    poster_path: Option<String>,
    #[serde(default)]
    backdrop_path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MovieDetails {
    id: u64,
    title: String,
    #[serde(default)]
    release_date: Option<String>,
    #[serde(default)]
    overview: Option<String>,
    #[serde(default)]
    poster_path: Option<String>,
    #[serde(default)]
    backdrop_path: Option<String>,
    #[serde(default)]
    runtime: Option<u32>,
    #[serde(default)]
    imdb_id: Option<String>,
    #[serde(default)]
    genres: Vec<Genre>,
    #[serde(default)]
    credits: Option<Credits>,
}

#[derive(Debug, Deserialize)]
struct Genre {
    name: String,
}

#[derive(Debug, Deserialize)]
struct Credits {
    #[serde(default)]
    crew: Vec<CrewMember>,
}

#[derive(Debug, Deserialize)]
struct CrewMember {
    id: u64,
    #[serde(default)]
    name: String,
    #[serde(default)]
    job: String,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    status_message: String,
}

fn release_year(date: Option<&str>) -> Option<i32> {
    date.and_then(|d| d.split('-').next()).and_then(|y| y.parse().ok())
}

pub struct TmdbClient {
    client: Client,
    limiter: DefaultDirectRateLimiter,
    retry: RetryPolicy,
    base_url: String,
    image_base_url: String,
    api_key: String,
    language: String,
}

impl TmdbClient {
    /// Builds a client with the key read from the configured environment
    /// variable.
    pub fn from_config(config: &TmdbConfig) -> Result<Self, MatchError> {
        let api_key = std::env::var(&config.api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty())
            .ok_or(MatchError::NotConfigured("TMDB API key"))?;
        Self::new(config, api_key)
    }

    pub fn new(config: &TmdbConfig, api_key: String) -> Result<Self, MatchError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        let per_minute = NonZeroU32::new(config.requests_per_minute).unwrap_or(NonZeroU32::MIN);
        Ok(Self {
            client,
            limiter: RateLimiter::direct(Quota::per_minute(per_minute)),
            retry: RetryPolicy::fixed(3, vec![Duration::from_secs(1), Duration::from_secs(4)]),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            image_base_url: config.image_base_url.trim_end_matches('/').to_string(),
            api_key,
            language: config.language.clone(),
        })
    }

    async fn get<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> Result<T, MatchError> {
        let url = format!("{}{}", self.base_url, path);
        with_retry(&self.retry, path, |attempt| {
            let url = url.clone();
            async move {
                self.limiter.until_ready().await;
                debug!(path, attempt, "TMDB request");
                let resp = self
                    .client
                    .get(&url)
                    .query(&[("api_key", self.api_key.as_str()), ("language", self.language.as_str())])
                    .query(query)
                    .send()
                    .await?;
                let status = resp.status();
                if !status.is_success() {
                    let message = resp
                        .json::<ErrorBody>()
                        .await
                        .map(|b| b.status_message)
                        .unwrap_or_default();
                    return Err(MatchError::ProviderStatus {
                        status: status.as_u16(),
                        message,
                    });
                }
                Ok(resp.json::<T>().await?)
            }
        })
        .await
    }

    fn image(&self, size: &str, path: Option<String>) -> Option<String> {
        path.filter(|p| !p.is_empty())
            .map(|p| format!("{}/{}{}", self.image_base_url, size, p))
    }

    fn summary_to_film(&self, m: MovieSummary) -> Film {
        Film {
            id: film_id_for(m.id),
            year: release_year(m.release_date.as_deref()),
            title: m.title,
            synopsis: m.overview.filter(|o| !o.is_empty()),
            poster_url: self.image("w500", m.poster_path),
            backdrop_url: self.image("w1280", m.backdrop_path),
            tmdb_id: Some(m.id),
            ..Film::default()
        }
    }
}

#[async_trait]
impl MetadataProvider for TmdbClient {
    async fn search_films(&self, title: &str, year: Option<i32>) -> Result<Vec<Film>, MatchError> {
        let mut query = vec![("query", title.to_string()), ("include_adult", "false".to_string())];
        if let Some(year) = year {
            query.push(("year", year.to_string()));
        }
        let response: SearchResponse = self.get("/search/movie", &query).await?;
        Ok(response.results.into_iter().map(|m| self.summary_to_film(m)).collect())
    }

    async fn get_film_details(&self, tmdb_id: u64) -> Result<FilmDetails, MatchError> {
        let path = format!("/movie/{tmdb_id}");
        let m: MovieDetails = self
            .get(&path, &[("append_to_response", "credits".to_string())])
            .await?;

        let directors: Vec<&CrewMember> = m
            .credits
            .as_ref()
            .map(|c| c.crew.iter().filter(|p| p.job == "Director").collect())
            .unwrap_or_default();
        let film = Film {
            id: film_id_for(m.id),
            title: m.title.clone(),
            year: release_year(m.release_date.as_deref()),
            directors: directors
                .iter()
                .filter(|d| !d.name.is_empty())
                .map(|d| d.name.clone())
                .collect(),
            genres: m.genres.iter().map(|g| g.name.clone()).collect(),
            poster_url: self.image("w500", m.poster_path.clone()),
            backdrop_url: self.image("w1280", m.backdrop_path.clone()),
            synopsis: m.overview.clone().filter(|o| !o.is_empty()),
            runtime_minutes: m.runtime.filter(|r| *r > 0),
            tmdb_id: Some(m.id),
            imdb_id: m.imdb_id.clone().filter(|i| !i.is_empty()),
            metadata_checked_at: None,
        };
        Ok(FilmDetails {
            film,
            director_ids: directors.iter().map(|d| d.id).collect(),
        })
    }

    async fn get_person_details(&self, person_id: u64) -> Result<Person, MatchError> {
        self.get(&format!("/person/{person_id}"), &[]).await
    }
}
