//! Adapter contracts for external collaborators the tools call into.
//! Concrete backends (embedding index, OCR service) live outside the core.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Embedding search over the pre-indexed knowledge corpus.
#[async_trait]
pub trait KnowledgeIndex: Send + Sync {
    async fn search(&self, query: &str, category: Option<&str>)
        -> chasqui_core::Result<KnowledgeAnswer>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeAnswer {
    pub found: bool,
    pub answer: String,
    pub chunks_used: i64,
    pub cost: f64,
}

/// OCR over a customer-supplied image (vouchers, ids, invoices).
#[async_trait]
pub trait OcrAdapter: Send + Sync {
    async fn extract(
        &self,
        image_url: &str,
        document_type: &str,
        purpose: Option<&str>,
    ) -> chasqui_core::Result<OcrText>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrText {
    pub text: String,
    pub context: String,
}
