//! Disease Pool
//!
//! Draws condition names for new cases without repeating one until every
//! entry in the list has been used, then starts the cycle over.

use crate::error::SourceError;
use async_trait::async_trait;
use rand::{Rng, seq::IndexedRandom};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;
use tracing::{info, warn};

/// The bundled pool, grouped one category per line: primary care,
/// cardio/respiratory, abdominal, neuro, infectious, trauma and rare conditions.
pub const DEFAULT_DISEASE_LIST: &str = include_str!("../data/doencas.txt");

/// Used when the configured list cannot be fetched or parses to nothing.
pub const FALLBACK_DISEASES: &[&str] = &[
    "Apendicite Aguda",
    "Pneumonia Comunitária",
    "Infarto Agudo do Miocárdio",
    "Dengue com Sinais de Alarme",
    "Cetoacidose Diabética",
    "Pielonefrite Aguda",
];

pub const DEFAULT_DELIMITER: char = ';';

/// Where the raw disease list comes from.
#[async_trait]
pub trait DiseaseSource: Send + Sync {
    /// Returns the raw, still delimited, list text.
    async fn fetch(&self) -> Result<String, SourceError>;

    /// The delimiter separating entries in the raw text.
    fn delimiter(&self) -> char {
        DEFAULT_DELIMITER
    }
}

/// Reads the list from a local file.
pub struct FileDiseaseSource {
    path: PathBuf,
    delimiter: char,
}

impl FileDiseaseSource {
    pub fn new(path: impl Into<PathBuf>, delimiter: char) -> Self {
        Self {
            path: path.into(),
            delimiter,
        }
    }
}

#[async_trait]
impl DiseaseSource for FileDiseaseSource {
    async fn fetch(&self) -> Result<String, SourceError> {
        tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| SourceError(format!("failed to read {}: {}", self.path.display(), e)))
    }

    fn delimiter(&self) -> char {
        self.delimiter
    }
}

/// Downloads the list from a URL.
pub struct HttpDiseaseSource {
    client: reqwest::Client,
    url: String,
    delimiter: char,
}

impl HttpDiseaseSource {
    pub fn new(url: impl Into<String>, delimiter: char) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            delimiter,
        }
    }
}

#[async_trait]
impl DiseaseSource for HttpDiseaseSource {
    async fn fetch(&self) -> Result<String, SourceError> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| SourceError(format!("request for {} failed: {}", self.url, e)))?;
        if !response.status().is_success() {
            return Err(SourceError(format!(
                "HTTP {} for {}",
                response.status(),
                self.url
            )));
        }
        response
            .text()
            .await
            .map_err(|e| SourceError(format!("failed to read {}: {}", self.url, e)))
    }

    fn delimiter(&self) -> char {
        self.delimiter
    }
}

/// Serves [`DEFAULT_DISEASE_LIST`]. Used when no list is configured.
pub struct BuiltinDiseaseSource;

#[async_trait]
impl DiseaseSource for BuiltinDiseaseSource {
    async fn fetch(&self) -> Result<String, SourceError> {
        Ok(DEFAULT_DISEASE_LIST.to_string())
    }
}

/// Picks the right source for a configured location: URLs are downloaded,
/// anything else is read as a file path.
pub fn source_for(location: &str, delimiter: char) -> Box<dyn DiseaseSource> {
    if location.starts_with("http://") || location.starts_with("https://") {
        Box::new(HttpDiseaseSource::new(location, delimiter))
    } else {
        Box::new(FileDiseaseSource::new(location, delimiter))
    }
}

/// Splits a delimited list, trimming entries and dropping empty ones.
pub fn parse_list(raw: &str, delimiter: char) -> Vec<String> {
    raw.split(delimiter)
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(str::to_string)
        .collect()
}

/// The pool state. It is part of the persisted session, so a resumed session
/// keeps its place in the cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DiseasePool {
    pub all_diseases: Vec<String>,
    pub used_diseases: BTreeSet<String>,
}

impl DiseasePool {
    pub fn new(all_diseases: Vec<String>) -> Self {
        Self {
            all_diseases,
            used_diseases: BTreeSet::new(),
        }
    }

    pub fn is_loaded(&self) -> bool {
        !self.all_diseases.is_empty()
    }

    /// Loads the list from `source` unless it is already loaded. A failing or
    /// empty source falls back to [`FALLBACK_DISEASES`].
    pub async fn ensure_loaded(&mut self, source: &dyn DiseaseSource) {
        if self.is_loaded() {
            return;
        }
        let diseases = match source.fetch().await {
            Ok(raw) => parse_list(&raw, source.delimiter()),
            Err(e) => {
                warn!(error = %e, "Failed to load disease list. Using the built-in list.");
                Vec::new()
            }
        };
        self.all_diseases = if diseases.is_empty() {
            FALLBACK_DISEASES.iter().map(|d| d.to_string()).collect()
        } else {
            diseases
        };
        self.normalize();
        info!(count = self.all_diseases.len(), "Disease list loaded");
    }

    /// Drops used entries that are not part of the list.
    pub fn normalize(&mut self) {
        let all = &self.all_diseases;
        self.used_diseases.retain(|d| all.contains(d));
    }

    /// Draws an unused disease uniformly at random and marks it used. When
    /// every disease has been used the cycle restarts first. Returns `None`
    /// only if the pool holds no diseases at all.
    pub fn draw<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Option<String> {
        if !self.is_loaded() {
            return None;
        }
        let mut available = self.available();
        if available.is_empty() {
            info!("Every disease has been used. Restarting the cycle.");
            self.used_diseases.clear();
            available = self.available();
        }
        let picked = available.choose(rng)?.to_string();
        self.used_diseases.insert(picked.clone());
        Some(picked)
    }

    /// Loads the pool if needed, then draws.
    pub async fn get_next<R: Rng + ?Sized>(
        &mut self,
        source: &dyn DiseaseSource,
        rng: &mut R,
    ) -> Option<String> {
        self.ensure_loaded(source).await;
        self.draw(rng)
    }

    fn available(&self) -> Vec<&str> {
        self.all_diseases
            .iter()
            .filter(|d| !self.used_diseases.contains(*d))
            .map(String::as_str)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{SeedableRng, rngs::StdRng};
    use std::collections::HashSet;

    struct FailingSource;

    #[async_trait]
    impl DiseaseSource for FailingSource {
        async fn fetch(&self) -> Result<String, SourceError> {
            Err(SourceError("offline".to_string()))
        }
    }

    struct StaticSource(&'static str, char);

    #[async_trait]
    impl DiseaseSource for StaticSource {
        async fn fetch(&self) -> Result<String, SourceError> {
            Ok(self.0.to_string())
        }

        fn delimiter(&self) -> char {
            self.1
        }
    }

    #[test]
    fn test_parse_list_trims_and_drops_empty() {
        let parsed = parse_list(" Asma ;; Gota;\n Sepse \n;", ';');
        assert_eq!(parsed, vec!["Asma", "Gota", "Sepse"]);
    }

    #[test]
    fn test_two_entry_pool_cycles() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut pool = DiseasePool::new(vec!["A".into(), "B".into()]);

        let first = pool.draw(&mut rng).unwrap();
        let second = pool.draw(&mut rng).unwrap();
        let drawn: HashSet<_> = [first.clone(), second].into_iter().collect();
        assert_eq!(drawn, HashSet::from(["A".to_string(), "B".to_string()]));

        // Third draw restarts the cycle and may repeat either entry.
        let third = pool.draw(&mut rng).unwrap();
        assert!(third == "A" || third == "B");
        assert_eq!(pool.used_diseases.len(), 1);
    }

    #[test]
    fn test_no_repeat_within_pool_size_window() {
        let diseases: Vec<String> = (0..7).map(|i| format!("D{i}")).collect();
        let mut pool = DiseasePool::new(diseases);
        let mut rng = StdRng::seed_from_u64(42);

        // Windows aligned to cycle boundaries never repeat.
        for _ in 0..5 {
            let window: HashSet<String> = (0..7).map(|_| pool.draw(&mut rng).unwrap()).collect();
            assert_eq!(window.len(), 7);
        }
    }

    #[test]
    fn test_draw_on_empty_pool() {
        let mut pool = DiseasePool::default();
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(pool.draw(&mut rng), None);
    }

    #[test]
    fn test_normalize_keeps_used_subset_of_all() {
        let mut pool = DiseasePool::new(vec!["A".into()]);
        pool.used_diseases.insert("A".into());
        pool.used_diseases.insert("Z".into());
        pool.normalize();
        assert_eq!(pool.used_diseases, BTreeSet::from(["A".to_string()]));
    }

    #[tokio::test]
    async fn test_failing_source_uses_fallback() {
        let mut pool = DiseasePool::default();
        let mut rng = StdRng::seed_from_u64(3);

        let picked = pool.get_next(&FailingSource, &mut rng).await.unwrap();

        assert_eq!(pool.all_diseases.len(), FALLBACK_DISEASES.len());
        assert!(FALLBACK_DISEASES.contains(&picked.as_str()));
    }

    #[tokio::test]
    async fn test_builtin_source_serves_full_pool() {
        let mut pool = DiseasePool::default();
        pool.ensure_loaded(&BuiltinDiseaseSource).await;

        assert_eq!(pool.all_diseases.len(), 43);
        let unique: HashSet<&String> = pool.all_diseases.iter().collect();
        assert_eq!(unique.len(), 43);
        assert_eq!(pool.all_diseases[0], "Hipertensão (Crise ou Descontrole)");
        assert!(pool.all_diseases.contains(&"Leptospirose".to_string()));
        assert_eq!(pool.all_diseases.last().map(String::as_str), Some("Lúpus (LES)"));
    }

    #[tokio::test]
    async fn test_empty_source_uses_fallback() {
        let mut pool = DiseasePool::default();
        pool.ensure_loaded(&StaticSource(" ; ;", ';')).await;
        assert_eq!(pool.all_diseases.len(), FALLBACK_DISEASES.len());
    }

    #[tokio::test]
    async fn test_loads_only_once() {
        let mut pool = DiseasePool::default();
        pool.ensure_loaded(&StaticSource("Asma|Gota", '|')).await;
        pool.ensure_loaded(&StaticSource("Sepse", ';')).await;
        assert_eq!(pool.all_diseases, vec!["Asma", "Gota"]);
    }

    #[tokio::test]
    async fn test_file_source_reads_list() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doencas.txt");
        std::fs::write(&path, "Asma;Gota;Sepse").unwrap();

        let source = source_for(path.to_str().unwrap(), ';');
        let raw = source.fetch().await.unwrap();
        assert_eq!(parse_list(&raw, source.delimiter()).len(), 3);
    }
}
