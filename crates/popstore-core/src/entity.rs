//! Entity value type and the small identifiers it is built from.

use serde::{Deserialize, Serialize};
use slotmap::new_key_type;
use std::{borrow::Borrow, collections::BTreeMap, fmt};

new_key_type! {
    /// Stable handle for a live entity backed by a generational slot map.
    pub struct EntityHandle;
}

/// Discrete simulation clock (cycles processed since the store was opened).
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
pub struct Cycle(pub u64);

impl Cycle {
    /// Returns the next sequential cycle.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Resets the cycle counter back to zero.
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }

    /// True when this cycle lands on `interval`. An interval of zero never matches.
    #[must_use]
    pub const fn is_boundary(self, interval: u64) -> bool {
        interval != 0 && self.0 % interval == 0
    }
}

impl fmt::Display for Cycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Index of a declared population partition.
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
pub struct PopulationId(pub u32);

impl PopulationId {
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl From<u32> for PopulationId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl fmt::Display for PopulationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Caller-assigned identity, unique across every population of a store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Builds the `<cycle>_<suffix>` form drivers use for offspring, e.g. `120_a3`.
    #[must_use]
    pub fn compound(cycle: Cycle, suffix: impl fmt::Display) -> Self {
        Self(format!("{}_{suffix}", cycle.0))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for EntityId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for EntityId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for EntityId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for EntityId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Domain-specific value attached to an entity. The store never inspects these.
///
/// Serialized untagged. Non-finite floats, which JSON numbers cannot carry,
/// are written as `{"$float": "NaN" | "inf" | "-inf"}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum MetaValue {
    Flag(bool),
    Int(i64),
    Float(#[serde(with = "float_repr")] f64),
    Text(String),
}

mod float_repr {
    use serde::{Deserialize, Deserializer, Serialize, Serializer, de::Error as _};

    #[derive(Serialize, Deserialize)]
    #[serde(untagged)]
    enum Repr<'a> {
        Number(f64),
        Special {
            #[serde(rename = "$float")]
            special: std::borrow::Cow<'a, str>,
        },
    }

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_finite() {
            return serializer.serialize_f64(*value);
        }
        let special = if value.is_nan() {
            "NaN"
        } else if value.is_sign_positive() {
            "inf"
        } else {
            "-inf"
        };
        Repr::Special {
            special: special.into(),
        }
        .serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        match Repr::deserialize(deserializer)? {
            Repr::Number(value) => Ok(value),
            Repr::Special { special } => match special.as_ref() {
                "NaN" => Ok(f64::NAN),
                "inf" => Ok(f64::INFINITY),
                "-inf" => Ok(f64::NEG_INFINITY),
                other => Err(D::Error::custom(format!("unknown float marker `{other}`"))),
            },
        }
    }
}

impl From<bool> for MetaValue {
    fn from(value: bool) -> Self {
        Self::Flag(value)
    }
}

impl From<i64> for MetaValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for MetaValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for MetaValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_owned())
    }
}

impl From<String> for MetaValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

/// Open metadata slot (phase markers, magnitudes and the like).
pub type Metadata = BTreeMap<String, MetaValue>;

/// A single simulation agent.
///
/// `id` and `population` are maintained by the store: mutate `energy`,
/// `depth` and `metadata` in place, and move an entity between populations
/// only through the store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Entity {
    pub(crate) id: EntityId,
    pub(crate) population: PopulationId,
    pub energy: f64,
    pub depth: u32,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: Metadata,
}

impl Entity {
    /// Creates an entity whose depth mirrors its population id.
    #[must_use]
    pub fn new(id: impl Into<EntityId>, population: PopulationId, energy: f64) -> Self {
        Self {
            id: id.into(),
            population,
            energy,
            depth: population.0,
            metadata: Metadata::new(),
        }
    }

    #[must_use]
    pub fn with_depth(mut self, depth: u32) -> Self {
        self.depth = depth;
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    #[must_use]
    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<MetaValue>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn id(&self) -> &EntityId {
        &self.id
    }

    /// Population the entity currently belongs to.
    #[must_use]
    pub fn population(&self) -> PopulationId {
        self.population
    }

    #[must_use]
    pub fn meta(&self, key: &str) -> Option<&MetaValue> {
        self.metadata.get(key)
    }

    /// Energy accepted by `add_agent`: finite and not negative.
    #[must_use]
    pub fn has_valid_energy(&self) -> bool {
        self.energy.is_finite() && self.energy >= 0.0
    }
}
