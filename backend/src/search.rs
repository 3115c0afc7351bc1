use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::{
    config::SearchSettings,
    models::{Coordinate, Destination},
};

#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    #[error("suggestion request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("suggestion service answered with status {0}")]
    Status(u16),
    #[error("malformed suggestion payload: {0}")]
    Malformed(String),
    #[error("no API key configured for the suggestion service")]
    MissingKey,
}

/// Destination suggestion collaborator: free text plus an optional location
/// bias in, candidate destinations out.
#[async_trait]
pub trait SuggestionService: Send + Sync {
    async fn suggest(
        &self,
        query: &str,
        near: Option<Coordinate>,
    ) -> Result<Vec<Destination>, SearchError>;
}

/// Gemini `generateContent` client constrained to a JSON array schema.
pub struct GeminiSuggestions {
    http: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
    max_results: usize,
}

impl GeminiSuggestions {
    pub fn new(settings: &SearchSettings) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: settings.endpoint.trim_end_matches('/').to_string(),
            model: settings.model.clone(),
            api_key: settings.api_key.clone(),
            max_results: settings.max_results,
        }
    }

    fn prompt(&self, query: &str, near: Option<Coordinate>) -> String {
        let location = near
            .map(|c| format!("Lat: {}, Lng: {}. ", c.lat, c.lng))
            .unwrap_or_default();
        format!(
            "Suggest {} real places for: \"{query}\". {location}Prefer places in the same state as the user. JSON: name, address, lat, lng.",
            self.max_results
        )
    }
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Content,
}

#[derive(Debug, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    #[serde(default)]
    text: Option<String>,
}

#[async_trait]
impl SuggestionService for GeminiSuggestions {
    async fn suggest(
        &self,
        query: &str,
        near: Option<Coordinate>,
    ) -> Result<Vec<Destination>, SearchError> {
        let api_key = self.api_key.as_deref().ok_or(SearchError::MissingKey)?;
        let body = json!({
            "contents": [{"parts": [{"text": self.prompt(query, near)}]}],
            "generationConfig": {
                "responseMimeType": "application/json",
                "responseSchema": {
                    "type": "ARRAY",
                    "items": {
                        "type": "OBJECT",
                        "properties": {
                            "lat": {"type": "NUMBER"},
                            "lng": {"type": "NUMBER"},
                            "name": {"type": "STRING"},
                            "address": {"type": "STRING"}
                        },
                        "required": ["lat", "lng", "name", "address"]
                    }
                }
            }
        });

        let response = self
            .http
            .post(format!(
                "{}/models/{}:generateContent",
                self.endpoint, self.model
            ))
            .header("x-goog-api-key", api_key)
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(SearchError::Status(status.as_u16()));
        }

        let payload: GenerateResponse = response.json().await?;
        let text = payload
            .candidates
            .into_iter()
            .flat_map(|c| c.content.parts)
            .find_map(|p| p.text)
            .ok_or_else(|| SearchError::Malformed("response has no text part".to_string()))?;
        let mut suggestions: Vec<Destination> =
            serde_json::from_str(&text).map_err(|e| SearchError::Malformed(e.to_string()))?;
        suggestions.truncate(self.max_results);
        Ok(suggestions)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SearchOutcome {
    Suggestions(Vec<Destination>),
    /// Query too short or already matching the selected destination.
    Cleared,
    /// A newer query was submitted while this one was pending.
    Superseded,
}

/// Debounced destination search. Each call takes a sequence number; results
/// of anything but the latest call are dropped.
pub struct DestinationSearch {
    service: Arc<dyn SuggestionService>,
    latest: AtomicU64,
    debounce: Duration,
    min_query_len: usize,
    max_results: usize,
}

impl DestinationSearch {
    pub fn new(service: Arc<dyn SuggestionService>, settings: &SearchSettings) -> Self {
        Self {
            service,
            latest: AtomicU64::new(0),
            debounce: settings.debounce,
            min_query_len: settings.min_query_len,
            max_results: settings.max_results,
        }
    }

    pub async fn search(
        &self,
        query: &str,
        near: Option<Coordinate>,
        selected: Option<&Destination>,
    ) -> SearchOutcome {
        let seq = self.latest.fetch_add(1, Ordering::AcqRel) + 1;

        if selected.is_some_and(|d| d.name == query) || query.chars().count() < self.min_query_len
        {
            return SearchOutcome::Cleared;
        }

        tokio::time::sleep(self.debounce).await;
        if !self.is_latest(seq) {
            return SearchOutcome::Superseded;
        }

        let suggestions = match self.service.suggest(query, near).await {
            Ok(mut suggestions) => {
                suggestions.truncate(self.max_results);
                suggestions
            }
            Err(err) => {
                tracing::warn!("destination suggestions for {query:?} failed: {err}");
                Vec::new()
            }
        };

        if !self.is_latest(seq) {
            tracing::debug!("dropping stale suggestions for {query:?}");
            return SearchOutcome::Superseded;
        }
        SearchOutcome::Suggestions(suggestions)
    }

    fn is_latest(&self, seq: u64) -> bool {
        self.latest.load(Ordering::Acquire) == seq
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use wiremock::{
        matchers::{header, method, path},
        Mock, MockServer, ResponseTemplate,
    };

    #[derive(Default)]
    struct RecordingService {
        queries: Mutex<Vec<String>>,
        fail: bool,
    }

    #[async_trait]
    impl SuggestionService for RecordingService {
        async fn suggest(
            &self,
            query: &str,
            _near: Option<Coordinate>,
        ) -> Result<Vec<Destination>, SearchError> {
            self.queries.lock().unwrap().push(query.to_string());
            if self.fail {
                return Err(SearchError::Status(500));
            }
            Ok((0..8_u8)
                .map(|i| Destination {
                    lat: -23.5 - f64::from(i) * 0.01,
                    lng: -46.6,
                    name: format!("{query} {i}"),
                    address: Some("Sao Paulo".to_string()),
                })
                .collect())
        }
    }

    fn search_with(service: Arc<RecordingService>) -> Arc<DestinationSearch> {
        Arc::new(DestinationSearch::new(service, &SearchSettings::default()))
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_query_clears_without_calling_service() {
        let service = Arc::new(RecordingService::default());
        let search = search_with(service.clone());

        assert_eq!(search.search("ib", None, None).await, SearchOutcome::Cleared);
        assert!(service.queries.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_selected_destination_name_clears() {
        let service = Arc::new(RecordingService::default());
        let search = search_with(service.clone());
        let selected = Destination {
            lat: 0.0,
            lng: 0.0,
            name: "Ibirapuera".to_string(),
            address: None,
        };

        let outcome = search.search("Ibirapuera", None, Some(&selected)).await;
        assert_eq!(outcome, SearchOutcome::Cleared);
    }

    #[tokio::test(start_paused = true)]
    async fn test_results_capped_at_five() {
        let service = Arc::new(RecordingService::default());
        let search = search_with(service.clone());

        match search.search("Ibirapuera", None, None).await {
            SearchOutcome::Suggestions(found) => assert_eq!(found.len(), 5),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_newer_query_supersedes_pending_one() {
        let service = Arc::new(RecordingService::default());
        let search = search_with(service.clone());

        let stale = {
            let search = search.clone();
            tokio::spawn(async move { search.search("Ibira", None, None).await })
        };
        tokio::time::sleep(Duration::from_millis(300)).await;
        let fresh = search.search("Ibirapuera", None, None).await;

        assert_eq!(stale.await.unwrap(), SearchOutcome::Superseded);
        assert!(matches!(fresh, SearchOutcome::Suggestions(_)));
        assert_eq!(*service.queries.lock().unwrap(), vec!["Ibirapuera"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_service_failure_yields_empty_suggestions() {
        let service = Arc::new(RecordingService {
            fail: true,
            ..RecordingService::default()
        });
        let search = search_with(service);

        assert_eq!(
            search.search("Ibirapuera", None, None).await,
            SearchOutcome::Suggestions(Vec::new())
        );
    }

    #[tokio::test]
    async fn test_gemini_client_parses_text_part() {
        let server = MockServer::start().await;
        let suggestions = r#"[{"name": "Parque Ibirapuera", "address": "Av. Pedro Alvares Cabral", "lat": -23.5874, "lng": -46.6576}]"#;
        Mock::given(method("POST"))
            .and(path("/models/gemini-3-flash-preview:generateContent"))
            .and(header("x-goog-api-key", "secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "candidates": [{"content": {"parts": [{"text": suggestions}]}}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = GeminiSuggestions::new(&SearchSettings {
            endpoint: server.uri(),
            api_key: Some("secret".to_string()),
            ..SearchSettings::default()
        });
        let found = client
            .suggest("ibirapuera", Some(Coordinate::new(-23.55, -46.63)))
            .await
            .unwrap();

        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "Parque Ibirapuera");
        assert_eq!(found[0].address.as_deref(), Some("Av. Pedro Alvares Cabral"));
    }

    #[tokio::test]
    async fn test_gemini_client_requires_key() {
        let client = GeminiSuggestions::new(&SearchSettings::default());
        assert!(matches!(
            client.suggest("ibirapuera", None).await,
            Err(SearchError::MissingKey)
        ));
    }
}
