//! Knowledge-base retrieval for answers backed by internal documents.

use std::collections::HashMap;

use async_trait::async_trait;
use xchat_types::Source;

use crate::GatewayError;

/// Ranked document search. Results carry a snippet of the passage that
/// matched, ready for a `reference` block.
#[async_trait]
pub trait Retriever: Send + Sync {
    /// Up to `top_k` sources for `query`, best first. Nothing matching is an
    /// empty list, not an error.
    async fn search(&self, query: &str, top_k: usize) -> Result<Vec<Source>, GatewayError>;
}

/// Stub retriever for wiring without a document index.
pub struct NullRetriever;

#[async_trait]
impl Retriever for NullRetriever {
    async fn search(&self, _query: &str, _top_k: usize) -> Result<Vec<Source>, GatewayError> {
        Err(GatewayError::SourceUnavailable(
            "NullRetriever has no document index".into(),
        ))
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Document {
    pub title: String,
    pub url: Option<String>,
    pub text: String,
}

impl Document {
    pub fn new(title: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            url: None,
            text: text.into(),
        }
    }

    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }
}

type TermVector = HashMap<String, f32>;

struct Indexed {
    doc: Document,
    terms: TermVector,
}

/// Cosine similarity over normalized term-frequency vectors. Ties keep
/// corpus order.
pub struct InMemoryRetriever {
    docs: Vec<Indexed>,
}

impl InMemoryRetriever {
    pub fn new(documents: impl IntoIterator<Item = Document>) -> Self {
        let docs = documents
            .into_iter()
            .map(|doc| {
                let terms = embed(&format!("{} {}", doc.title, doc.text));
                Indexed { doc, terms }
            })
            .collect();
        Self { docs }
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }
}

#[async_trait]
impl Retriever for InMemoryRetriever {
    async fn search(&self, query: &str, top_k: usize) -> Result<Vec<Source>, GatewayError> {
        let q = embed(query);
        if q.is_empty() {
            return Ok(Vec::new());
        }
        let mut scored: Vec<(f32, &Indexed)> = self
            .docs
            .iter()
            .map(|d| (cosine(&q, &d.terms), d))
            .filter(|(score, _)| *score > 0.0)
            .collect();
        scored.sort_by(|a, b| b.0.total_cmp(&a.0));
        tracing::debug!(query, candidates = scored.len(), top_k, "document search");

        Ok(scored
            .into_iter()
            .take(top_k)
            .map(|(_, d)| Source {
                title: d.doc.title.clone(),
                url: d.doc.url.clone(),
                snippet: best_passage(&d.doc.text, &q),
            })
            .collect())
    }
}

const STOPWORDS: [&str; 14] = [
    "the", "and", "what", "for", "are", "our", "how", "with", "about", "does", "can", "you", "tell", "show",
];

fn tokens(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .filter(|t| !t.is_ascii() || t.len() >= 3)
        .filter(|t| !STOPWORDS.contains(&t.as_str()))
}

/// L2-normalized term frequencies.
fn embed(text: &str) -> TermVector {
    let mut v = TermVector::new();
    for token in tokens(text) {
        *v.entry(token).or_insert(0.0) += 1.0;
    }
    let norm: f32 = v.values().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in v.values_mut() {
            *x /= norm;
        }
    }
    v
}

fn cosine(a: &TermVector, b: &TermVector) -> f32 {
    a.iter()
        .filter_map(|(term, x)| b.get(term).map(|y| x * y))
        .sum()
}

/// The sentence sharing the most terms with the query. The earliest wins a
/// tie.
fn best_passage(text: &str, query: &TermVector) -> Option<String> {
    let mut best: Option<(usize, &str)> = None;
    for sentence in text.split('.').map(str::trim).filter(|s| !s.is_empty()) {
        let hits = tokens(sentence).filter(|t| query.contains_key(t)).count();
        if best.map_or(true, |(h, _)| hits > h) {
            best = Some((hits, sentence));
        }
    }
    best.map(|(_, s)| format!("...{s}..."))
}

/// A small handbook and policy corpus for the demo server and CLI.
pub fn demo_corpus() -> InMemoryRetriever {
    InMemoryRetriever::new([
        Document::new(
            "2025 Employee Handbook (v2.1)",
            "Core hours for all employees are 10:00 AM to 3:00 PM local time. \
             Overtime must be approved in advance by your manager. \
             Annual leave requests go through the HR portal.",
        )
        .url("https://wiki.example.com/handbook"),
        Document::new(
            "Remote Work Policy",
            "Up to 3 days of remote work per week may be granted subject to manager approval. \
             Remote employees must be reachable during core hours. \
             Equipment for remote work is provided on request.",
        )
        .url("https://wiki.example.com/remote-policy"),
        Document::new(
            "Travel and Expense Policy",
            "Expenses above 500 USD need a receipt and director sign-off. \
             Claims are reimbursed within 14 days of submission.",
        )
        .url("https://wiki.example.com/expenses"),
        Document::new(
            "Data Retention Policy",
            "Customer records are retained for 7 years. \
             Chat transcripts are deleted after 90 days unless flagged for review.",
        )
        .url("https://wiki.example.com/data-retention"),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn best_match_comes_first_with_its_passage() {
        let corpus = demo_corpus();
        let hits = corpus.search("What is the remote work policy?", 3).await.unwrap();
        assert_eq!(hits[0].title, "Remote Work Policy");
        assert_eq!(hits[0].url.as_deref(), Some("https://wiki.example.com/remote-policy"));
        assert!(hits[0].snippet.as_deref().unwrap().contains("3 days of remote work"));
        // The other policies only share "policy".
        assert_eq!(hits.len(), 3);
        assert!(hits.iter().all(|h| h.title != "2025 Employee Handbook (v2.1)"));
    }

    #[tokio::test]
    async fn top_k_bounds_the_result() {
        let corpus = demo_corpus();
        assert_eq!(corpus.search("policy", 1).await.unwrap().len(), 1);
        assert!(corpus.search("policy", 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unrelated_or_empty_queries_match_nothing() {
        let corpus = demo_corpus();
        assert!(corpus.search("quarterly revenue forecast", 3).await.unwrap().is_empty());
        assert!(corpus.search("what is the", 3).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn null_retriever_is_unavailable() {
        let err = NullRetriever.search("policy", 3).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn embedding_is_normalized() {
        let v = embed("remote remote work");
        let norm: f32 = v.values().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-6);
        assert!(embed("a an of").is_empty());
    }
}
