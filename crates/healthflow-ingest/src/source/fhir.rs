//! FHIR R4 REST source
//!
//! Reads the patient resource directly and searches the other resource types
//! by subject reference. Search responses are `searchset` bundles; only entry
//! resources of the queried type are returned.

use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use super::{QueryKind, RecordSource, SourceError, SourceResult, SubRecordQuery};
use crate::config::FhirConfig;

const FHIR_JSON: &str = "application/fhir+json";

/// HTTP client for a FHIR server
#[derive(Clone)]
pub struct FhirRecordSource {
    client: Client,
    base: Url,
    subject_type: String,
}

impl FhirRecordSource {
    /// Create a source from configuration
    ///
    /// Per-query deadlines are enforced by the fetcher; the client only bounds
    /// connection setup.
    pub fn new(config: &FhirConfig) -> SourceResult<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(config.user_agent.clone())
            .build()?;

        let mut base = Url::parse(&config.base_url)
            .map_err(|e| SourceError::InvalidUrl(format!("{}: {}", config.base_url, e)))?;
        base.path_segments_mut()
            .map_err(|_| SourceError::InvalidUrl(format!("{}: not a base URL", config.base_url)))?
            .pop_if_empty();

        Ok(Self {
            client,
            base,
            subject_type: "Patient".to_string(),
        })
    }

    /// Resource type used in `subject=` references (defaults to `Patient`)
    pub fn with_subject_type(mut self, subject_type: impl Into<String>) -> Self {
        self.subject_type = subject_type.into();
        self
    }

    pub fn base_url(&self) -> &str {
        self.base.as_str().trim_end_matches('/')
    }

    /// Append path segments to the base URL, percent-encoding each one
    ///
    /// A segment can never add path levels: `/`, `?` and `#` are escaped, and
    /// empty or dot segments are refused.
    fn endpoint(&self, segments: &[&str]) -> SourceResult<Url> {
        if let Some(bad) = segments.iter().find(|s| s.is_empty() || **s == "." || **s == "..") {
            return Err(SourceError::InvalidUrl(format!("invalid path segment '{}'", bad)));
        }

        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| SourceError::InvalidUrl(format!("{}: not a base URL", self.base)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn get_json(&self, request: reqwest::RequestBuilder) -> SourceResult<Option<Value>> {
        let response = request.header(reqwest::header::ACCEPT, FHIR_JSON).send().await?;
        let status = response.status();

        if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
            return Ok(None);
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SourceError::Status {
                status: status.as_u16(),
                body: truncate(&body, 512),
            });
        }

        let bytes = response.bytes().await?;
        let value = serde_json::from_slice(&bytes)
            .map_err(|e| SourceError::Malformed(format!("invalid JSON body: {}", e)))?;
        Ok(Some(value))
    }

    async fn read(&self, entity_key: &str, query: &SubRecordQuery) -> SourceResult<Vec<Value>> {
        let url = self.endpoint(&[&query.record_type, entity_key])?;
        debug!(url = %url, "FHIR read");

        match self.get_json(self.client.get(url)).await? {
            Some(resource) => Ok(vec![resource]),
            None => Ok(Vec::new()),
        }
    }

    async fn search(&self, entity_key: &str, query: &SubRecordQuery) -> SourceResult<Vec<Value>> {
        let url = self.endpoint(&[&query.record_type])?;
        let subject = format!("{}/{}", self.subject_type, entity_key);
        let count = query.limit.to_string();
        debug!(url = %url, subject = %subject, count = query.limit, "FHIR search");

        let request = self
            .client
            .get(url)
            .query(&[("subject", subject.as_str()), ("_count", count.as_str())]);

        let Some(bundle) = self.get_json(request).await? else {
            return Ok(Vec::new());
        };

        extract_entries(&bundle, &query.record_type)
    }
}

/// Pull `entry[].resource` values of `record_type` out of a search-set bundle
fn extract_entries(bundle: &Value, record_type: &str) -> SourceResult<Vec<Value>> {
    if bundle.get("resourceType").and_then(Value::as_str) != Some("Bundle") {
        return Err(SourceError::Malformed(format!(
            "expected a Bundle for {} search",
            record_type
        )));
    }

    let Some(entries) = bundle.get("entry") else {
        return Ok(Vec::new());
    };

    let entries = entries
        .as_array()
        .ok_or_else(|| SourceError::Malformed("Bundle.entry is not an array".to_string()))?;

    Ok(entries
        .iter()
        .filter_map(|entry| entry.get("resource"))
        .filter(|resource| resource.get("resourceType").and_then(Value::as_str) == Some(record_type))
        .cloned()
        .collect())
}

fn truncate(body: &str, max: usize) -> String {
    match body.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &body[..idx]),
        None => body.to_string(),
    }
}

#[async_trait]
impl RecordSource for FhirRecordSource {
    async fn fetch(&self, entity_key: &str, query: &SubRecordQuery) -> SourceResult<Vec<Value>> {
        match query.kind {
            QueryKind::Read => self.read(entity_key, query).await,
            QueryKind::SubjectSearch => self.search(entity_key, query).await,
        }
    }

    async fn status(&self) -> String {
        let request = match self.endpoint(&["metadata"]) {
            Ok(url) => self.client.get(url),
            Err(e) => return format!("Error connecting to FHIR server: {}", e),
        };

        match self.get_json(request).await {
            Ok(Some(capability)) => {
                let name = capability
                    .get("name")
                    .or_else(|| capability.pointer("/software/name"))
                    .and_then(Value::as_str)
                    .unwrap_or("FHIR server");
                let status = capability
                    .get("status")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown");
                format!("Connected to {} - {}", name, status)
            },
            Ok(None) => "Error connecting to FHIR server: capability statement not found".to_string(),
            Err(e) => format!("Error connecting to FHIR server: {}", e),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_extract_entries_filters_by_type() {
        let bundle = json!({
            "resourceType": "Bundle",
            "type": "searchset",
            "entry": [
                {"resource": {"resourceType": "Observation", "id": "o1"}},
                {"resource": {"resourceType": "OperationOutcome", "id": "warn"}},
                {"search": {"mode": "include"}},
                {"resource": {"resourceType": "Observation", "id": "o2"}}
            ]
        });

        let records = extract_entries(&bundle, "Observation").unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1]["id"], "o2");
    }

    #[test]
    fn test_extract_entries_without_entry_is_empty() {
        let bundle = json!({"resourceType": "Bundle", "type": "searchset", "total": 0});
        assert!(extract_entries(&bundle, "Condition").unwrap().is_empty());
    }

    #[test]
    fn test_extract_entries_rejects_non_bundle() {
        let outcome = json!({"resourceType": "OperationOutcome"});
        assert!(matches!(
            extract_entries(&outcome, "Condition"),
            Err(SourceError::Malformed(_))
        ));
    }

    #[test]
    fn test_truncate_long_bodies() {
        assert_eq!(truncate("abc", 10), "abc");
        assert_eq!(truncate("abcdef", 3), "abc...");
    }

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let config = FhirConfig {
            base_url: "http://fhir.local/baseR4/".to_string(),
            timeout_secs: 2,
            user_agent: "test".to_string(),
        };
        let source = FhirRecordSource::new(&config).unwrap();
        assert_eq!(source.base_url(), "http://fhir.local/baseR4");
    }

    fn local_source() -> FhirRecordSource {
        FhirRecordSource::new(&FhirConfig {
            base_url: "http://fhir.local/baseR4".to_string(),
            timeout_secs: 2,
            user_agent: "test".to_string(),
        })
        .unwrap()
    }

    #[test]
    fn test_endpoint_escapes_entity_key() {
        let source = local_source();

        let url = source.endpoint(&["Patient", "123/../999"]).unwrap();
        assert_eq!(url.path(), "/baseR4/Patient/123%2F..%2F999");

        let url = source.endpoint(&["Patient", "999?x=1#frag"]).unwrap();
        assert_eq!(url.path(), "/baseR4/Patient/999%3Fx=1%23frag");
        assert!(url.query().is_none());
        assert!(url.fragment().is_none());
    }

    #[test]
    fn test_endpoint_rejects_dot_and_empty_segments() {
        let source = local_source();
        for key in ["..", ".", ""] {
            assert!(matches!(
                source.endpoint(&["Patient", key]),
                Err(SourceError::InvalidUrl(_))
            ));
        }
    }

    #[test]
    fn test_invalid_base_url_is_rejected() {
        let config = FhirConfig {
            base_url: "not a url".to_string(),
            timeout_secs: 2,
            user_agent: "test".to_string(),
        };
        assert!(matches!(
            FhirRecordSource::new(&config),
            Err(SourceError::InvalidUrl(_))
        ));
    }
}
