use crate::config::MemoryConfig;

/// A retrieved context fragment. Advisory only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snippet {
    pub source: String,
    pub content: String,
}

/// Read-only retrieval contract consumed by Builder prompts. The vector
/// backend lives behind this seam; retrieval failures are never fatal to an
/// attempt.
pub trait MemoryRetriever: Send + Sync {
    fn retrieve_context(
        &self,
        project_id: &str,
        run_id: &str,
        task_type: &str,
        budget_chars: usize,
    ) -> impl std::future::Future<Output = Result<Vec<Snippet>, String>> + Send;
}

/// Retrieval disabled: always returns nothing.
pub struct NullMemory;

impl MemoryRetriever for NullMemory {
    async fn retrieve_context(
        &self,
        _project_id: &str,
        _run_id: &str,
        _task_type: &str,
        _budget_chars: usize,
    ) -> Result<Vec<Snippet>, String> {
        Ok(vec![])
    }
}

/// Scripted retriever for executor tests.
pub struct StaticMemory {
    pub snippets: Vec<Snippet>,
}

impl MemoryRetriever for StaticMemory {
    async fn retrieve_context(
        &self,
        _project_id: &str,
        _run_id: &str,
        _task_type: &str,
        budget_chars: usize,
    ) -> Result<Vec<Snippet>, String> {
        Ok(clamp_to_budget(self.snippets.clone(), budget_chars))
    }
}

/// Truncate a snippet list to a character budget, dropping whole snippets
/// once the budget is spent.
pub fn clamp_to_budget(snippets: Vec<Snippet>, budget_chars: usize) -> Vec<Snippet> {
    let mut used = 0usize;
    let mut kept = Vec::new();
    for snippet in snippets {
        let len = snippet.content.chars().count();
        if used + len > budget_chars {
            break;
        }
        used += len;
        kept.push(snippet);
    }
    kept
}

/// Whether retrieval should run at all for this configuration.
pub fn retrieval_enabled(config: &MemoryConfig) -> bool {
    config.enable_memory && config.sot_retrieval_enabled
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snippet(content: &str) -> Snippet {
        Snippet {
            source: "ledger".to_string(),
            content: content.to_string(),
        }
    }

    #[test]
    fn clamp_drops_whole_snippets_past_budget() {
        let snippets = vec![snippet("aaaa"), snippet("bbbb"), snippet("cccc")];
        let kept = clamp_to_budget(snippets, 9);
        assert_eq!(kept.len(), 2);
    }

    #[tokio::test]
    async fn null_memory_returns_nothing() {
        let retriever = NullMemory;
        let snippets = retriever
            .retrieve_context("proj", "r1", "builder", 1_000)
            .await
            .unwrap();
        assert!(snippets.is_empty());
    }

    #[test]
    fn retrieval_gating() {
        let mut config = MemoryConfig::default();
        assert!(!retrieval_enabled(&config));
        config.enable_memory = true;
        assert!(retrieval_enabled(&config));
        config.sot_retrieval_enabled = false;
        assert!(!retrieval_enabled(&config));
    }
}
