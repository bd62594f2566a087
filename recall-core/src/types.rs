//! Core type definitions shared by every engine.
//!
//! Validated-range numerics ([`Limit`], [`Depth`]), the warning-carrying
//! [`Outcome`], embeddings, timestamps and id helpers.

use std::fmt;
use std::ops::RangeInclusive;

use chrono::{DateTime, NaiveDateTime, Utc};
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};

use crate::error::{RecallError, Result};

// ---------------------------------------------------------------------------
// Timestamps
// ---------------------------------------------------------------------------

/// Wall-clock timestamp used for every record.
pub type Timestamp = DateTime<Utc>;

const TS_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6fZ";

/// Format a timestamp as fixed-width RFC 3339 with microseconds.
///
/// Fixed width keeps lexicographic order equal to chronological order, which
/// the store relies on for range filters.
#[must_use]
pub fn format_ts(ts: &Timestamp) -> String {
    ts.format(TS_FORMAT).to_string()
}

/// Parse a timestamp produced by [`format_ts`].
///
/// # Errors
///
/// Returns [`RecallError::Serialization`] on malformed input.
pub fn parse_ts(s: &str) -> Result<Timestamp> {
    NaiveDateTime::parse_from_str(s, TS_FORMAT)
        .map(|naive| naive.and_utc())
        .map_err(|e| RecallError::Serialization(format!("bad timestamp {s:?}: {e}")))
}

/// Current time truncated to microsecond precision.
///
/// Truncation makes a value read back from the store compare equal to the
/// value that was written.
#[must_use]
pub fn now() -> Timestamp {
    let t = Utc::now();
    let micros = t.timestamp_micros();
    DateTime::from_timestamp_micros(micros).unwrap_or(t)
}

/// An optional inclusive time window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    /// Earliest timestamp to include.
    pub start: Option<Timestamp>,
    /// Latest timestamp to include.
    pub end: Option<Timestamp>,
}

impl TimeRange {
    /// Build a range, rejecting `start > end`.
    ///
    /// # Errors
    ///
    /// Returns [`RecallError::Validation`] when the bounds are inverted.
    pub fn new(start: Option<Timestamp>, end: Option<Timestamp>) -> Result<Self> {
        let range = Self { start, end };
        range.validate()?;
        Ok(range)
    }

    /// Reject inverted bounds on a range built field by field.
    ///
    /// # Errors
    ///
    /// Returns [`RecallError::Validation`] when `start > end`.
    pub fn validate(&self) -> Result<()> {
        if let (Some(s), Some(e)) = (self.start, self.end) {
            if s > e {
                return Err(RecallError::validation(format!(
                    "time range start {} is after end {}",
                    format_ts(&s),
                    format_ts(&e)
                )));
            }
        }
        Ok(())
    }

    /// Whether `ts` lies within the range, bounds inclusive.
    #[must_use]
    pub fn contains(&self, ts: &Timestamp) -> bool {
        self.start.is_none_or(|s| *ts >= s) && self.end.is_none_or(|e| *ts <= e)
    }

    /// True when neither bound is set.
    #[must_use]
    pub fn is_unbounded(&self) -> bool {
        self.start.is_none() && self.end.is_none()
    }
}

// ---------------------------------------------------------------------------
// Validated numerics
// ---------------------------------------------------------------------------

/// A result-count limit that has been checked against an allowed range.
///
/// Out-of-range values are rejected, never clamped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Limit(usize);

impl Limit {
    /// Validate `value` against `range`.
    ///
    /// # Errors
    ///
    /// Returns [`RecallError::Validation`] when `value` is outside `range`.
    pub fn within(value: usize, range: RangeInclusive<usize>) -> Result<Self> {
        if range.contains(&value) {
            Ok(Self(value))
        } else {
            Err(RecallError::validation(format!(
                "limit {value} out of range {}..={}",
                range.start(),
                range.end()
            )))
        }
    }

    /// The validated value.
    #[must_use]
    pub fn get(self) -> usize {
        self.0
    }

    /// Scale the limit, saturating. Used for candidate windows.
    #[must_use]
    pub fn scaled(self, factor: usize) -> usize {
        self.0.saturating_mul(factor.max(1))
    }
}

/// A graph hop count checked against an administrative cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Depth(u32);

impl Depth {
    /// Validate `value` against `min..=cap`.
    ///
    /// # Errors
    ///
    /// Returns [`RecallError::Validation`] when `value` is outside the range.
    pub fn within(value: u32, min: u32, cap: u32) -> Result<Self> {
        if (min..=cap).contains(&value) {
            Ok(Self(value))
        } else {
            Err(RecallError::validation(format!(
                "depth {value} out of range {min}..={cap}"
            )))
        }
    }

    /// The validated value.
    #[must_use]
    pub fn get(self) -> u32 {
        self.0
    }
}

// ---------------------------------------------------------------------------
// Embeddings & scores
// ---------------------------------------------------------------------------

/// A dense vector embedding for semantic similarity search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding(pub Vec<f32>);

impl Embedding {
    /// Number of components.
    #[must_use]
    pub fn dimensions(&self) -> usize {
        self.0.len()
    }

    /// Cosine similarity with another embedding, 0.0 on length mismatch or
    /// zero vectors.
    #[must_use]
    pub fn cosine_similarity(&self, other: &Self) -> f32 {
        crate::embedding::cosine_similarity(&self.0, &other.0)
    }

    /// Little-endian `f32` blob for storage.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        self.0.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    /// Decode a blob written by [`Embedding::to_bytes`].
    ///
    /// # Errors
    ///
    /// Returns [`RecallError::Serialization`] when the blob length is not a
    /// multiple of four.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() % 4 != 0 {
            return Err(RecallError::Serialization(format!(
                "embedding blob of {} bytes is not f32-aligned",
                bytes.len()
            )));
        }
        Ok(Self(
            bytes
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
        ))
    }
}

/// Fused relevance score produced by reciprocal rank fusion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FusedScore(pub OrderedFloat<f64>);

impl FusedScore {
    /// Raw score value.
    #[must_use]
    pub fn value(self) -> f64 {
        self.0.into_inner()
    }
}

impl fmt::Display for FusedScore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.6}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Whether an upsert created a new record or replaced an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertAction {
    /// No record with this id existed.
    Created,
    /// An existing record was overwritten.
    Updated,
}

/// An upserted value paired with what happened to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Upserted<T> {
    /// The stored value, as read back after the write.
    pub value: T,
    /// Created or updated.
    pub action: UpsertAction,
}

/// A non-fatal problem encountered while completing an operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Warning {
    /// An episode could not be linked to one of its entities.
    LinkFailed {
        /// Episode being linked.
        episode_id: String,
        /// Entity that could not be linked.
        entity_id: String,
        /// Why the link failed.
        reason: String,
    },
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LinkFailed {
                episode_id,
                entity_id,
                reason,
            } => write!(f, "could not link {episode_id} to {entity_id}: {reason}"),
        }
    }
}

/// A primary value plus any soft failures that happened along the way.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome<T> {
    /// The result of the operation.
    pub value: T,
    /// Non-fatal problems, in the order they occurred.
    pub warnings: Vec<Warning>,
}

impl<T> Outcome<T> {
    /// An outcome with no warnings.
    pub fn clean(value: T) -> Self {
        Self {
            value,
            warnings: Vec::new(),
        }
    }

    /// Whether nothing was skipped.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }

    /// Transform the value, keeping the warnings.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        Outcome {
            value: f(self.value),
            warnings: self.warnings,
        }
    }
}

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

const MAX_ID_LEN: usize = 256;

/// Reduce a name to `[a-z0-9-]`, with whitespace and underscores becoming `-`.
///
/// Runs of `-` collapse and leading/trailing `-` are trimmed.
#[must_use]
pub fn slugify(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.trim().chars().flat_map(char::to_lowercase) {
        let mapped = match c {
            'a'..='z' | '0'..='9' => Some(c),
            '-' | '_' => Some('-'),
            c if c.is_whitespace() => Some('-'),
            _ => None,
        };
        if let Some(m) = mapped {
            if m == '-' && (out.is_empty() || out.ends_with('-')) {
                continue;
            }
            out.push(m);
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    out
}

/// Build a context-scoped id `context:slug(name)`.
///
/// # Errors
///
/// Returns [`RecallError::Validation`] if the name has no usable characters.
pub fn scoped_id(context: Option<&str>, name: &str) -> Result<String> {
    let slug = slugify(name);
    if slug.is_empty() {
        return Err(RecallError::validation(format!(
            "name {name:?} has no characters usable in an id"
        )));
    }
    Ok(match context {
        Some(ctx) if !ctx.is_empty() => format!("{ctx}:{slug}"),
        _ => slug,
    })
}

/// Check a caller-supplied id.
///
/// # Errors
///
/// Returns [`RecallError::Validation`] for empty, over-long or
/// whitespace-containing ids.
pub fn validate_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(RecallError::validation("id must not be empty"));
    }
    if id.len() > MAX_ID_LEN {
        return Err(RecallError::validation(format!(
            "id longer than {MAX_ID_LEN} bytes"
        )));
    }
    if id.chars().any(char::is_whitespace) {
        return Err(RecallError::validation(format!(
            "id {id:?} contains whitespace"
        )));
    }
    Ok(())
}

/// Reject empty or whitespace-only required text.
///
/// # Errors
///
/// Returns [`RecallError::Validation`] naming `field`.
pub fn require_text(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        Err(RecallError::validation(format!("{field} must not be empty")))
    } else {
        Ok(())
    }
}

/// Truncate `text` to at most `max_chars` characters on a char boundary.
#[must_use]
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn slugify_rules() {
        assert_eq!(slugify("Auth Token  Refresh"), "auth-token-refresh");
        assert_eq!(slugify("  --Hello_World!! "), "hello-world");
        assert_eq!(slugify("v2.0 release"), "v20-release");
        assert_eq!(slugify("???"), "");
    }

    #[test]
    fn scoped_id_uses_context() {
        assert_eq!(
            scoped_id(Some("proj"), "Token Bug").expect("valid"),
            "proj:token-bug"
        );
        assert_eq!(scoped_id(None, "Token Bug").expect("valid"), "token-bug");
        assert!(scoped_id(Some("proj"), "!!!").is_err());
    }

    #[test]
    fn limit_rejects_instead_of_clamping() {
        assert_eq!(Limit::within(5, 1..=50).expect("in range").get(), 5);
        assert!(Limit::within(0, 1..=50).is_err());
        assert!(Limit::within(51, 1..=50).is_err());
        assert_eq!(Limit::within(5, 1..=50).expect("ok").scaled(2), 10);
    }

    #[test]
    fn depth_range() {
        assert!(Depth::within(0, 0, 10).is_ok());
        assert!(Depth::within(11, 0, 10).is_err());
        assert!(Depth::within(0, 1, 20).is_err());
    }

    #[test]
    fn time_range_inclusive() {
        let t0 = now();
        let t1 = t0 + Duration::seconds(10);
        let range = TimeRange::new(Some(t0), Some(t1)).expect("ordered");
        assert!(range.contains(&t0));
        assert!(range.contains(&t1));
        assert!(!range.contains(&(t1 + Duration::microseconds(1))));
        assert!(TimeRange::new(Some(t1), Some(t0)).is_err());
    }

    #[test]
    fn timestamp_format_is_sortable() {
        let a = now();
        let b = a + Duration::milliseconds(1500);
        let (sa, sb) = (format_ts(&a), format_ts(&b));
        assert_eq!(sa.len(), sb.len());
        assert!(sa < sb);
        assert_eq!(parse_ts(&sa).expect("parse"), a);
    }

    #[test]
    fn embedding_bytes() {
        let e = Embedding(vec![1.0, -0.5, 0.25]);
        assert_eq!(Embedding::from_bytes(&e.to_bytes()).expect("decode"), e);
        assert!(Embedding::from_bytes(&[0, 1, 2]).is_err());
    }

    #[test]
    fn truncation_respects_chars() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("hi", 10), "hi");
    }
}
