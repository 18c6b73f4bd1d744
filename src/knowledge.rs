//! Read-through knowledge-base lookup.
//!
//! Documents are answered by a chat-completion model rather than a vector
//! index: the corpus (or a token-budgeted partition of it) is placed in the
//! prompt wholesale. Failures never propagate into the call — the tool
//! result is always a caller-visible string.

use std::num::NonZeroUsize;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use futures::future::join_all;
use lru::LruCache;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

use crate::config::RealtimeConfig;
use crate::types::KnowledgeBaseRef;

/// Upper bound on estimated tokens per completion group.
pub const MAX_GROUP_TOKENS: usize = 30_000;

const DOCUMENT_CACHE_SIZE: usize = 10;
const LOOKUP_TIMEOUT_SECS: u64 = 180;

const QUERY_SYSTEM_PROMPT: &str = "\
- You are a helpful assistant that answers a user's question using the documents you have access to.
- Be concise and to the point
- You will be given a query and a set of documents.
- You will need to answer the query using the information in the documents only.
- If you cannot answer the query using the documents, you should say so
- Only return the answer, do not include any other text";

const CONSOLIDATE_SYSTEM_PROMPT: &str = "\
- You are given several partial answers to the same query, each produced from a different set of documents.
- Combine them into a single concise answer.
- Drop partial answers that say the documents do not contain the information, unless none of them do.
- Only return the answer, do not include any other text";

#[derive(Debug, Clone)]
pub struct Document {
    pub name: String,
    pub text: String,
}

/// Where documents come from; the call store implements this.
#[async_trait]
pub trait DocumentSource: Send + Sync {
    async fn documents(&self, knowledge_base_ids: &[Uuid]) -> Result<Vec<Document>>;
}

/// Chat-completions client for the lookup and consolidation passes.
pub struct ChatClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl ChatClient {
    pub fn new(config: &RealtimeConfig) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(LOOKUP_TIMEOUT_SECS))
                .build()
                .expect("Failed to build chat HTTP client"),
            base_url: config.chat_url.clone(),
            api_key: config.api_key.clone(),
            model: config.chat_model.clone(),
        }
    }

    pub async fn complete(&self, system: &str, user: &str) -> Result<String> {
        let body = json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": user},
            ],
        });
        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .context("Chat completion request failed")?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            bail!("Chat completion returned {status}: {text}");
        }
        let payload: Value = response
            .json()
            .await
            .context("Chat completion returned invalid JSON")?;
        payload["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_string)
            .context("Chat completion missing content")
    }
}

/// Rough token estimate; only relative sizes matter for packing.
fn estimate_tokens(text: &str) -> usize {
    text.len() / 4
}

/// Greedily pack documents, sorted ascending by token count, into groups of
/// at most [`MAX_GROUP_TOKENS`]. An oversized document gets its own group.
fn pack_documents(documents: &[Document]) -> Vec<Vec<&Document>> {
    let mut sorted: Vec<&Document> = documents.iter().collect();
    sorted.sort_by_key(|d| estimate_tokens(&d.text));

    let mut groups: Vec<Vec<&Document>> = Vec::new();
    let mut current: Vec<&Document> = Vec::new();
    let mut current_tokens = 0;
    for doc in sorted {
        let tokens = estimate_tokens(&doc.text);
        if !current.is_empty() && current_tokens + tokens > MAX_GROUP_TOKENS {
            groups.push(std::mem::take(&mut current));
            current_tokens = 0;
        }
        current_tokens += tokens;
        current.push(doc);
    }
    if !current.is_empty() {
        groups.push(current);
    }
    groups
}

fn group_prompt(query: &str, documents: &[&Document]) -> String {
    let documents_fmt = documents
        .iter()
        .map(|d| format!("#### {}\n{}", d.name, d.text))
        .collect::<Vec<_>>()
        .join("\n");
    format!("### Documents\n{documents_fmt}\n\n### Query\n{query}")
}

/// Shared across calls; the cache is keyed by the sorted join of KB ids and
/// guarded by a mutex.
pub struct KnowledgeService {
    source: Arc<dyn DocumentSource>,
    chat: ChatClient,
    cache: Mutex<LruCache<String, Arc<Vec<Document>>>>,
}

impl KnowledgeService {
    pub fn new(source: Arc<dyn DocumentSource>, chat: ChatClient) -> Self {
        Self {
            source,
            chat,
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(DOCUMENT_CACHE_SIZE).expect("nonzero cache size"),
            )),
        }
    }

    /// Answer a query against the agent's knowledge bases. Never fails into
    /// the call: errors come back as readable strings for the model.
    pub async fn query(&self, query: &str, knowledge_bases: &[KnowledgeBaseRef]) -> String {
        if knowledge_bases.is_empty() {
            return "No documents found".to_string();
        }
        let ids: Vec<Uuid> = knowledge_bases.iter().map(|kb| kb.id).collect();
        let documents = match self.documents(&ids).await {
            Ok(documents) => documents,
            Err(e) => {
                warn!("Failed to load knowledge-base documents: {e:#}");
                return "Unable to access the documents at this time".to_string();
            }
        };
        if documents.is_empty() {
            return "No documents found".to_string();
        }

        let groups = pack_documents(&documents);
        let lookups = groups.iter().map(|group| {
            let prompt = group_prompt(query, group);
            async move { self.chat.complete(QUERY_SYSTEM_PROMPT, &prompt).await }
        });
        let answers: Vec<String> = join_all(lookups)
            .await
            .into_iter()
            .filter_map(|result| match result {
                Ok(answer) => Some(answer),
                Err(e) => {
                    warn!("Document lookup failed: {e:#}");
                    None
                }
            })
            .collect();

        match answers.len() {
            0 => "Unable to query the documents at this time".to_string(),
            1 => answers.into_iter().next().expect("one answer"),
            _ => {
                let combined = answers
                    .iter()
                    .enumerate()
                    .map(|(i, a)| format!("#### Partial answer {}\n{}", i + 1, a))
                    .collect::<Vec<_>>()
                    .join("\n");
                let user = format!("### Partial answers\n{combined}\n\n### Query\n{query}");
                match self.chat.complete(CONSOLIDATE_SYSTEM_PROMPT, &user).await {
                    Ok(answer) => answer,
                    Err(e) => {
                        warn!("Answer consolidation failed: {e:#}");
                        answers.join("\n")
                    }
                }
            }
        }
    }

    async fn documents(&self, ids: &[Uuid]) -> Result<Arc<Vec<Document>>> {
        let mut sorted_ids: Vec<String> = ids.iter().map(Uuid::to_string).collect();
        sorted_ids.sort();
        let cache_key = sorted_ids.join("-");

        if let Some(documents) = self.cache.lock().await.get(&cache_key) {
            return Ok(Arc::clone(documents));
        }
        let documents = Arc::new(self.source.documents(ids).await?);
        self.cache
            .lock()
            .await
            .put(cache_key, Arc::clone(&documents));
        Ok(documents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(name: &str, tokens: usize) -> Document {
        Document {
            name: name.to_string(),
            text: "x".repeat(tokens * 4),
        }
    }

    #[test]
    fn test_packing_splits_at_budget() {
        // 10k, 12k, and 15k token documents under a 30k cap partition into
        // [10k, 12k] and [15k].
        let documents = vec![doc("c", 15_000), doc("a", 10_000), doc("b", 12_000)];
        let groups = pack_documents(&documents);
        assert_eq!(groups.len(), 2);
        assert_eq!(
            groups[0].iter().map(|d| d.name.as_str()).collect::<Vec<_>>(),
            vec!["a", "b"]
        );
        assert_eq!(
            groups[1].iter().map(|d| d.name.as_str()).collect::<Vec<_>>(),
            vec!["c"]
        );
    }

    #[test]
    fn test_packing_single_group() {
        let documents = vec![doc("a", 100), doc("b", 200)];
        let groups = pack_documents(&documents);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].len(), 2);
    }

    #[test]
    fn test_oversized_document_gets_own_group() {
        let documents = vec![doc("big", 40_000), doc("small", 10)];
        let groups = pack_documents(&documents);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0][0].name, "small");
        assert_eq!(groups[1][0].name, "big");
    }

    #[test]
    fn test_group_prompt_shape() {
        let d = doc("manual", 4);
        let prompt = group_prompt("how?", &[&d]);
        assert!(prompt.starts_with("### Documents\n#### manual\n"));
        assert!(prompt.ends_with("### Query\nhow?"));
    }

    struct EmptySource;

    #[async_trait]
    impl DocumentSource for EmptySource {
        async fn documents(&self, _ids: &[Uuid]) -> Result<Vec<Document>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_no_knowledge_bases() {
        let service = KnowledgeService::new(
            Arc::new(EmptySource),
            ChatClient::new(&RealtimeConfig::default()),
        );
        assert_eq!(service.query("q", &[]).await, "No documents found");
        // empty corpus behaves the same
        let kb = KnowledgeBaseRef {
            id: Uuid::new_v4(),
            name: "empty".to_string(),
        };
        assert_eq!(service.query("q", &[kb]).await, "No documents found");
    }
}
