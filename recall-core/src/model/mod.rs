//! Knowledge graph model: entities, relations, episodes and procedures.
//!
//! Every searchable memory type implements [`Memory`], which lets the
//! retrieval engine and the store move records around as a single
//! [`Record`] enum while callers work with concrete types.

pub mod entity;
pub mod episode;
pub mod procedure;
pub mod relation;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::{Embedding, Timestamp};

pub use entity::{Entity, EntityDraft, EntityPatch};
pub use episode::{Episode, EpisodeDraft};
pub use procedure::{Procedure, ProcedureDraft, Step};
pub use relation::{Direction, Relation};

/// The three searchable memory types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryKind {
    /// Facts about named things.
    Entity,
    /// Timestamped experiences.
    Episode,
    /// Step-based know-how.
    Procedure,
}

impl MemoryKind {
    /// Every kind, in a stable order.
    pub const ALL: [Self; 3] = [Self::Entity, Self::Episode, Self::Procedure];

    /// Stable lowercase name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Entity => "entity",
            Self::Episode => "episode",
            Self::Procedure => "procedure",
        }
    }

    /// Fields matched by the lexical stream.
    #[must_use]
    pub fn lexical_fields(self) -> &'static [&'static str] {
        match self {
            Self::Entity => &["name", "content"],
            Self::Episode => &["content"],
            Self::Procedure => &["name", "description", "steps"],
        }
    }
}

impl fmt::Display for MemoryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stored memory of any kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Record {
    /// An entity.
    Entity(Entity),
    /// An episode.
    Episode(Episode),
    /// A procedure.
    Procedure(Procedure),
}

impl Record {
    /// The record's id.
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::Entity(e) => &e.id,
            Self::Episode(e) => &e.id,
            Self::Procedure(p) => &p.id,
        }
    }

    /// Which kind of memory this is.
    #[must_use]
    pub fn kind(&self) -> MemoryKind {
        match self {
            Self::Entity(_) => MemoryKind::Entity,
            Self::Episode(_) => MemoryKind::Episode,
            Self::Procedure(_) => MemoryKind::Procedure,
        }
    }

    /// The record's embedding.
    #[must_use]
    pub fn embedding(&self) -> &Embedding {
        match self {
            Self::Entity(e) => &e.embedding,
            Self::Episode(e) => &e.embedding,
            Self::Procedure(p) => &p.embedding,
        }
    }

    /// Apply an access in memory, mirroring what the store does on read.
    pub fn touch(&mut self, at: Timestamp) {
        match self {
            Self::Entity(e) => e.touch(at),
            Self::Episode(e) => e.touch(at),
            Self::Procedure(p) => p.touch(at),
        }
    }
}

/// A concrete memory type that can travel as a [`Record`].
pub trait Memory: Sized + Send + Sync + 'static {
    /// The kind tag for this type.
    const KIND: MemoryKind;

    /// The record's id.
    fn id(&self) -> &str;

    /// Unwrap a record of the matching kind.
    fn from_record(record: Record) -> Option<Self>;

    /// Wrap into a record.
    fn into_record(self) -> Record;
}

macro_rules! impl_memory {
    ($ty:ty, $variant:ident) => {
        impl Memory for $ty {
            const KIND: MemoryKind = MemoryKind::$variant;

            fn id(&self) -> &str {
                &self.id
            }

            fn from_record(record: Record) -> Option<Self> {
                match record {
                    Record::$variant(v) => Some(v),
                    _ => None,
                }
            }

            fn into_record(self) -> Record {
                Record::$variant(self)
            }
        }
    };
}

impl_memory!(Entity, Entity);
impl_memory!(Episode, Episode);
impl_memory!(Procedure, Procedure);
