#![forbid(unsafe_code)]

//! Resource identities and id synthesis.
//!
//! Synthesized ids have the shape `<category>_<unix-millis>_<counter>_<random>`.
//! The counter is per generator and strictly increasing, so two ids from the
//! same registry never collide even when the wall clock is coarse. The random
//! suffix only serves to keep ids from different registries apart in logs.

use std::fmt;
use std::rc::Rc;

use web_time::{SystemTime, UNIX_EPOCH};

/// Identity of one registry entry.
///
/// Cheap to clone; backed by a shared string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(Rc<str>);

impl ResourceId {
    /// Wrap a caller-supplied id.
    #[must_use]
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(Rc::from(id.as_ref()))
    }

    /// The id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourceId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ResourceId {
    fn from(value: String) -> Self {
        Self(Rc::from(value))
    }
}

impl AsRef<str> for ResourceId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Produces unique ids for one registry.
#[derive(Debug, Clone)]
pub struct IdGenerator {
    category: Rc<str>,
    counter: u64,
}

impl IdGenerator {
    /// Create a generator whose ids start with `category`.
    #[must_use]
    pub fn new(category: &str) -> Self {
        Self {
            category: Rc::from(category),
            counter: 0,
        }
    }

    /// Category tag used as the id prefix.
    #[must_use]
    pub fn category(&self) -> &str {
        &self.category
    }

    /// Number of ids produced so far.
    #[must_use]
    pub fn issued(&self) -> u64 {
        self.counter
    }

    /// Synthesize the next id.
    pub fn next_id(&mut self) -> ResourceId {
        let category = Rc::clone(&self.category);
        self.next_id_with_prefix(&category)
    }

    /// Synthesize the next id under another prefix. Shares the counter with
    /// [`next_id`](Self::next_id).
    pub fn next_id_with_prefix(&mut self, prefix: &str) -> ResourceId {
        self.counter = self.counter.wrapping_add(1);
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        let random = uuid::Uuid::new_v4().as_u128() as u32;
        ResourceId::from(format!(
            "{}_{}_{}_{:08x}",
            prefix, millis, self.counter, random
        ))
    }
}
