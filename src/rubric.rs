//! Rubric dimensions and the catalogs that group them.
//!
//! A [`RubricCatalog`] is an ordered, duplicate-free list of [`Dimension`]s.
//! Insertion order is display order: reports, CSV exports and the CLI all
//! iterate a catalog front to back.

use std::path::Path;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// =============================================================================
// ERRORS
// =============================================================================

#[derive(Debug, Error)]
pub enum RubricError {
    #[error("dimension name must not be empty")]
    EmptyName,
    #[error("dimension {name:?} has an invalid scale {min}..={max}")]
    InvalidScale { name: String, min: i64, max: i64 },
    #[error("duplicate dimension {0:?}")]
    DuplicateDimension(String),
    #[error("unknown dimension {0:?}")]
    UnknownDimension(String),
    #[error("unknown catalog {0:?} (expected one of: instructor, resume, qa)")]
    UnknownCatalog(String),
    #[error("catalog json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("failed to read catalog {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

// =============================================================================
// DIMENSION
// =============================================================================

/// A named scoring criterion with an inclusive integer scale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Dimension {
    name: String,
    description: String,
    scale_min: i64,
    scale_max: i64,
}

impl Dimension {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        scale_min: i64,
        scale_max: i64,
    ) -> Result<Self, RubricError> {
        let name = name.into().trim().to_string();
        if name.is_empty() {
            return Err(RubricError::EmptyName);
        }
        if scale_min > scale_max {
            return Err(RubricError::InvalidScale {
                name,
                min: scale_min,
                max: scale_max,
            });
        }
        Ok(Self {
            name,
            description: description.into(),
            scale_min,
            scale_max,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Rubric text: a one-line summary followed by per-level anchors.
    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn scale_min(&self) -> i64 {
        self.scale_min
    }

    pub fn scale_max(&self) -> i64 {
        self.scale_max
    }

    pub fn in_range(&self, value: i64) -> bool {
        (self.scale_min..=self.scale_max).contains(&value)
    }
}

/// Wire shape for catalog files. Validated through [`Dimension::new`].
#[derive(Deserialize)]
struct DimensionDef {
    name: String,
    #[serde(default)]
    description: String,
    scale_min: i64,
    scale_max: i64,
}

impl TryFrom<DimensionDef> for Dimension {
    type Error = RubricError;

    fn try_from(def: DimensionDef) -> Result<Self, Self::Error> {
        Dimension::new(def.name, def.description, def.scale_min, def.scale_max)
    }
}

// =============================================================================
// CATALOG
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct RubricCatalog {
    dimensions: Vec<Dimension>,
}

impl RubricCatalog {
    pub fn new(dimensions: Vec<Dimension>) -> Result<Self, RubricError> {
        for (i, dim) in dimensions.iter().enumerate() {
            if dimensions[..i].iter().any(|d| d.name == dim.name) {
                return Err(RubricError::DuplicateDimension(dim.name.clone()));
            }
        }
        Ok(Self { dimensions })
    }

    /// Ad-hoc catalog for grading a single dimension.
    pub fn single(dimension: Dimension) -> Self {
        Self {
            dimensions: vec![dimension],
        }
    }

    /// Replace the dimension with the same name, or append it.
    pub fn with_dimension(mut self, dimension: Dimension) -> Self {
        match self.dimensions.iter_mut().find(|d| d.name == dimension.name) {
            Some(slot) => *slot = dimension,
            None => self.dimensions.push(dimension),
        }
        self
    }

    pub fn get(&self, name: &str) -> Result<&Dimension, RubricError> {
        self.dimensions
            .iter()
            .find(|d| d.name == name)
            .ok_or_else(|| RubricError::UnknownDimension(name.to_string()))
    }

    /// Keep only the named dimensions, preserving catalog order.
    pub fn subset<S: AsRef<str>>(&self, names: &[S]) -> Result<Self, RubricError> {
        for name in names {
            self.get(name.as_ref())?;
        }
        let dimensions = self
            .dimensions
            .iter()
            .filter(|d| names.iter().any(|n| n.as_ref() == d.name))
            .cloned()
            .collect();
        Ok(Self { dimensions })
    }

    pub fn iter(&self) -> impl Iterator<Item = &Dimension> {
        self.dimensions.iter()
    }

    pub fn as_slice(&self) -> &[Dimension] {
        &self.dimensions
    }

    pub fn names(&self) -> Vec<&str> {
        self.dimensions.iter().map(|d| d.name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.dimensions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dimensions.is_empty()
    }

    /// Parse a JSON array of `{name, description, scale_min, scale_max}`.
    pub fn from_json_str(json: &str) -> Result<Self, RubricError> {
        let defs: Vec<DimensionDef> = serde_json::from_str(json)?;
        let dimensions = defs
            .into_iter()
            .map(Dimension::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(dimensions)
    }
}

impl<'a> IntoIterator for &'a RubricCatalog {
    type Item = &'a Dimension;
    type IntoIter = std::slice::Iter<'a, Dimension>;

    fn into_iter(self) -> Self::IntoIter {
        self.dimensions.iter()
    }
}

pub fn load_catalog(path: &Path) -> Result<RubricCatalog, RubricError> {
    let json = std::fs::read_to_string(path).map_err(|source| RubricError::Io {
        path: path.display().to_string(),
        source,
    })?;
    RubricCatalog::from_json_str(&json)
}

// =============================================================================
// BUILT-IN CATALOGS
// =============================================================================

static INSTRUCTOR: Lazy<RubricCatalog> = Lazy::new(|| {
    RubricCatalog::from_json_str(include_str!("catalogs/instructor.json"))
        .expect("embedded instructor catalog is valid")
});

static RESUME: Lazy<RubricCatalog> = Lazy::new(|| {
    RubricCatalog::from_json_str(include_str!("catalogs/resume.json"))
        .expect("embedded resume catalog is valid")
});

static QA_PAIR: Lazy<RubricCatalog> = Lazy::new(|| {
    RubricCatalog::from_json_str(include_str!("catalogs/qa.json"))
        .expect("embedded qa catalog is valid")
});

/// Fifteen teaching-quality dimensions for lecture transcripts, scored 1 to 5.
pub fn instructor() -> RubricCatalog {
    INSTRUCTOR.clone()
}

/// Five hiring dimensions comparing a resume to a job description, scored 0 to 3.
pub fn resume() -> RubricCatalog {
    RESUME.clone()
}

/// Correctness, Comprehensiveness and Readability of a question/answer pair, scored 0 to 3.
pub fn qa_pair() -> RubricCatalog {
    QA_PAIR.clone()
}

pub const BUILTIN_CATALOGS: &[&str] = &["instructor", "resume", "qa"];

pub fn builtin(slug: &str) -> Result<RubricCatalog, RubricError> {
    match slug {
        "instructor" => Ok(instructor()),
        "resume" => Ok(resume()),
        "qa" => Ok(qa_pair()),
        other => Err(RubricError::UnknownCatalog(other.to_string())),
    }
}
