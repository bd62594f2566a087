//! Wire types for the embedding APIs.

use serde::{Deserialize, Serialize};

use crate::error::EmbedError;

/// Body of an Ollama `POST /api/embed` call.
#[derive(Debug, Clone, Serialize)]
pub struct OllamaEmbedRequest<'a> {
    /// Model name.
    pub model: &'a str,
    /// Texts to embed.
    pub input: &'a [&'a str],
}

/// Ollama's answer: one vector per input, in input order.
#[derive(Debug, Clone, Deserialize)]
pub struct OllamaEmbedResponse {
    /// Vectors.
    pub embeddings: Vec<Vec<f32>>,
}

/// Body of an OpenAI-compatible `POST /v1/embeddings` call.
#[derive(Debug, Clone, Serialize)]
pub struct OpenAiEmbedRequest<'a> {
    /// Model name.
    pub model: &'a str,
    /// Texts to embed.
    pub input: &'a [&'a str],
}

/// One item of an OpenAI-compatible response.
#[derive(Debug, Clone, Deserialize)]
pub struct OpenAiEmbedding {
    /// The vector.
    pub embedding: Vec<f32>,
    /// Position of the input it belongs to.
    pub index: usize,
}

/// OpenAI-compatible answer. Items may arrive in any order.
#[derive(Debug, Clone, Deserialize)]
pub struct OpenAiEmbedResponse {
    /// Vectors tagged with their input index.
    pub data: Vec<OpenAiEmbedding>,
}

impl OllamaEmbedResponse {
    /// Vectors in input order, checked against the number of inputs.
    ///
    /// # Errors
    ///
    /// [`EmbedError::ParseError`] when the count differs.
    pub fn into_vectors(self, expected: usize) -> Result<Vec<Vec<f32>>, EmbedError> {
        if self.embeddings.len() != expected {
            return Err(EmbedError::ParseError(format!(
                "expected {expected} embeddings, got {}",
                self.embeddings.len()
            )));
        }
        Ok(self.embeddings)
    }
}

impl OpenAiEmbedResponse {
    /// Vectors reordered by `index`, checked against the number of inputs.
    ///
    /// # Errors
    ///
    /// [`EmbedError::ParseError`] for a wrong count, or an index that is out
    /// of range or repeated.
    pub fn into_vectors(self, expected: usize) -> Result<Vec<Vec<f32>>, EmbedError> {
        if self.data.len() != expected {
            return Err(EmbedError::ParseError(format!(
                "expected {expected} embeddings, got {}",
                self.data.len()
            )));
        }
        let mut slots: Vec<Option<Vec<f32>>> = vec![None; expected];
        for item in self.data {
            let slot = slots.get_mut(item.index).ok_or_else(|| {
                EmbedError::ParseError(format!("embedding index {} out of range", item.index))
            })?;
            if slot.replace(item.embedding).is_some() {
                return Err(EmbedError::ParseError(format!(
                    "embedding index {} repeated",
                    item.index
                )));
            }
        }
        slots
            .into_iter()
            .map(|s| s.ok_or_else(|| EmbedError::ParseError("missing embedding index".into())))
            .collect()
    }
}
