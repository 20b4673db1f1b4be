//! Newtype domain identifiers.
//!
//! Every remote record is addressed by an opaque [`EntityRef`]; every CLI
//! invocation is tagged with a [`RunId`]. Keeping them as distinct newtypes
//! prevents passing a ref where a run id (or a plain name) is expected.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Macro for String-wrapped newtypes.
// Generates: struct, new() returning Option<Self>, as_str(), Display.
// ---------------------------------------------------------------------------
macro_rules! string_id {
    (
        $(#[$attr:meta])*
        $name:ident
    ) => {
        $(#[$attr])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Creates a new identifier, returning `None` if the value is empty.
            pub fn new(value: impl Into<String>) -> Option<Self> {
                let v = value.into();
                if v.trim().is_empty() { None } else { Some(Self(v)) }
            }

            /// Returns the identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

string_id! {
    /// Opaque locator for a persisted remote record.
    ///
    /// Rally hands these out either as absolute URLs
    /// (`https://rally1.rallydev.com/slm/webservice/v2.0/project/1234`) or as
    /// relative refs (`/project/1234`). Both forms are accepted everywhere a
    /// ref is consumed. A ref is immutable once obtained.
    EntityRef
}

impl EntityRef {
    /// Builds a relative ref `/<type>/<id>`.
    pub(crate) fn from_path(type_name: &str, id: u64) -> Self {
        Self(format!("/{type_name}/{id}"))
    }

    /// Returns the trailing object id segment when it is numeric.
    pub fn object_id(&self) -> Option<&str> {
        let last = self.segments().last()?;
        last.chars().all(|c| c.is_ascii_digit()).then_some(last)
    }

    /// Returns the type segment preceding the object id (e.g. `project`).
    pub fn type_segment(&self) -> Option<&str> {
        let mut segments = self.segments().rev();
        let id = segments.next()?;
        if !id.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }
        segments.next()
    }

    /// Returns `true` if this ref is an absolute URL rather than a path.
    pub fn is_absolute(&self) -> bool {
        self.0.starts_with("http://") || self.0.starts_with("https://")
    }

    fn segments(&self) -> impl DoubleEndedIterator<Item = &str> {
        let trimmed = self.0.trim_end_matches(".js");
        let path = trimmed.split(['?', '#']).next().unwrap_or(trimmed);
        path.split('/').filter(|s| !s.is_empty())
    }
}

// ---------------------------------------------------------------------------
// Run identity
// ---------------------------------------------------------------------------

/// Identifies a single CLI invocation.
///
/// Generated fresh for every run; propagated through spans so all remote calls
/// issued by one run can be correlated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(Uuid);

impl RunId {
    /// Generates a new random run identifier.
    pub fn new_random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
