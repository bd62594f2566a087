//! Procedures: named, ordered step lists ("what I know how to do").

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::{RecallError, Result};
use crate::model::entity::normalize_labels;
use crate::types::{Embedding, Timestamp, require_text, scoped_id, validate_id};

/// One step of a procedure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    /// 1-based position.
    pub order: u32,
    /// What to do.
    pub content: String,
    /// Whether the step may be skipped.
    pub optional: bool,
}

impl Step {
    /// A required step. `order` is assigned when the procedure is built.
    #[must_use]
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            order: 0,
            content: content.into(),
            optional: false,
        }
    }

    /// A skippable step.
    #[must_use]
    pub fn optional(content: impl Into<String>) -> Self {
        Self {
            optional: true,
            ..Self::new(content)
        }
    }
}

/// A stored procedure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Procedure {
    /// `context:slug(name)` unless given explicitly.
    pub id: String,
    /// Procedure name.
    pub name: String,
    /// What the procedure achieves.
    pub description: String,
    /// Steps numbered 1..=n.
    pub steps: Vec<Step>,
    /// Embedding of name, description and steps.
    pub embedding: Embedding,
    /// Deduplicated labels.
    pub labels: BTreeSet<String>,
    /// Namespace tag.
    pub context: Option<String>,
    /// Staleness multiplier, reset to 1.0 on access.
    pub decay_weight: f32,
    /// Number of reads and search hits.
    pub access_count: u64,
    /// When first stored.
    pub created_at: Timestamp,
    /// Last read or search hit.
    pub accessed_at: Timestamp,
}

impl Procedure {
    /// Record an access.
    pub fn touch(&mut self, at: Timestamp) {
        self.access_count += 1;
        self.accessed_at = at;
        self.decay_weight = 1.0;
    }

    /// Step text joined for lexical indexing.
    #[must_use]
    pub fn steps_text(&self) -> String {
        join_steps(&self.steps)
    }
}

/// Caller input for creating or replacing a procedure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcedureDraft {
    /// Explicit id; derived from context and name when absent.
    pub id: Option<String>,
    /// Name.
    pub name: String,
    /// Description.
    pub description: String,
    /// Steps in order; `order` values are ignored and renumbered.
    pub steps: Vec<Step>,
    /// Labels.
    pub labels: Vec<String>,
    /// Namespace tag.
    pub context: Option<String>,
    /// Precomputed embedding.
    pub embedding: Option<Embedding>,
}

impl ProcedureDraft {
    /// Start a draft.
    #[must_use]
    pub fn new(name: impl Into<String>, description: impl Into<String>, steps: Vec<Step>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            steps,
            ..Self::default()
        }
    }

    /// Set the namespace.
    #[must_use]
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Set labels.
    #[must_use]
    pub fn with_labels<I, S>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.labels = labels.into_iter().map(Into::into).collect();
        self
    }

    /// Supply an embedding.
    #[must_use]
    pub fn with_embedding(mut self, embedding: Embedding) -> Self {
        self.embedding = Some(embedding);
        self
    }

    /// Name, description and at least one non-blank step are required.
    ///
    /// # Errors
    ///
    /// Returns [`RecallError::Validation`] on the first missing piece.
    pub fn validate(&self) -> Result<()> {
        require_text("procedure name", &self.name)?;
        require_text("procedure description", &self.description)?;
        if let Some(id) = &self.id {
            validate_id(id)?;
        }
        if self.steps.is_empty() {
            return Err(RecallError::validation("procedure needs at least one step"));
        }
        for (i, step) in self.steps.iter().enumerate() {
            require_text(&format!("step {}", i + 1), &step.content)?;
        }
        Ok(())
    }

    /// The id this draft will be stored under.
    ///
    /// # Errors
    ///
    /// Returns [`RecallError::Validation`] if no usable id can be derived.
    pub fn resolve_id(&self) -> Result<String> {
        match &self.id {
            Some(id) => Ok(id.clone()),
            None => scoped_id(self.context.as_deref(), &self.name),
        }
    }

    /// `"{name}. {description}. {steps...}"`.
    #[must_use]
    pub fn embedding_text(&self) -> String {
        format!(
            "{}. {}. {}",
            self.name,
            self.description,
            join_steps(&self.steps)
        )
    }

    /// Materialize with steps renumbered from 1.
    #[must_use]
    pub fn into_procedure(self, id: String, embedding: Embedding, now: Timestamp) -> Procedure {
        let steps = self
            .steps
            .into_iter()
            .zip(1u32..)
            .map(|(step, order)| Step {
                order,
                content: step.content.trim().to_string(),
                optional: step.optional,
            })
            .collect();
        Procedure {
            id,
            name: self.name.trim().to_string(),
            description: self.description,
            steps,
            embedding,
            labels: normalize_labels(self.labels),
            context: self.context,
            decay_weight: 1.0,
            access_count: 0,
            created_at: now,
            accessed_at: now,
        }
    }
}

fn join_steps(steps: &[Step]) -> String {
    steps
        .iter()
        .map(|s| s.content.trim())
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::now;

    fn deploy() -> ProcedureDraft {
        ProcedureDraft::new(
            "Deploy Service",
            "Ship a new build",
            vec![
                Step::new("run tests"),
                Step::optional("notify channel"),
                Step::new("push tag"),
            ],
        )
    }

    #[test]
    fn steps_are_renumbered() {
        let mut draft = deploy();
        draft.steps[0].order = 9;
        let p = draft.into_procedure("deploy-service".into(), Embedding(vec![1.0]), now());
        let orders: Vec<u32> = p.steps.iter().map(|s| s.order).collect();
        assert_eq!(orders, vec![1, 2, 3]);
        assert!(p.steps[1].optional);
    }

    #[test]
    fn embedding_text_joins_everything() {
        assert_eq!(
            deploy().embedding_text(),
            "Deploy Service. Ship a new build. run tests notify channel push tag"
        );
    }

    #[test]
    fn validation() {
        assert!(deploy().validate().is_ok());
        assert!(ProcedureDraft::new("x", "y", vec![]).validate().is_err());
        assert!(ProcedureDraft::new("x", "", vec![Step::new("a")]).validate().is_err());
        assert!(
            ProcedureDraft::new("x", "y", vec![Step::new("a"), Step::new(" ")])
                .validate()
                .is_err()
        );
    }

    #[test]
    fn id_from_context_and_name() {
        assert_eq!(
            deploy().with_context("ops").resolve_id().expect("id"),
            "ops:deploy-service"
        );
    }
}
