//! Storage keys.
//!
//! A [`StorageKey`] is the untyped identity of one stored value slot: either a
//! type identity plus an ordered list of [`Discriminator`]s, or an explicit
//! URI. [`Key<T>`] pins the value type stored under a key so reads and writes
//! stay type safe, and [`StateKey`] lets a marker type name one logical piece
//! of state together with its default.

use std::any::TypeId;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Extra value splitting one type identity into several slots.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Discriminator {
    Int(i64),
    UInt(u64),
    Bool(bool),
    Str(String),
    Uuid(Uuid),
}

impl fmt::Display for Discriminator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::UInt(v) => write!(f, "{v}u"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::Str(v) => write!(f, "{v:?}"),
            Self::Uuid(v) => write!(f, "{v}"),
        }
    }
}

impl From<i64> for Discriminator {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for Discriminator {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<u64> for Discriminator {
    fn from(v: u64) -> Self {
        Self::UInt(v)
    }
}

impl From<u32> for Discriminator {
    fn from(v: u32) -> Self {
        Self::UInt(u64::from(v))
    }
}

impl From<usize> for Discriminator {
    fn from(v: usize) -> Self {
        Self::UInt(u64::try_from(v).unwrap_or(u64::MAX))
    }
}

impl From<bool> for Discriminator {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<&str> for Discriminator {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for Discriminator {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

impl From<Uuid> for Discriminator {
    fn from(v: Uuid) -> Self {
        Self::Uuid(v)
    }
}

#[derive(Clone)]
enum Identity {
    Typed {
        type_id: TypeId,
        type_name: &'static str,
        discriminators: Vec<Discriminator>,
    },
    Uri(String),
}

impl PartialEq for Identity {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (
                Self::Typed {
                    type_id: a,
                    discriminators: da,
                    ..
                },
                Self::Typed {
                    type_id: b,
                    discriminators: db,
                    ..
                },
            ) => a == b && da == db,
            (Self::Uri(a), Self::Uri(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Identity {}

impl Hash for Identity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Self::Typed {
                type_id,
                discriminators,
                ..
            } => {
                state.write_u8(0);
                type_id.hash(state);
                discriminators.hash(state);
            }
            Self::Uri(uri) => {
                state.write_u8(1);
                uri.hash(state);
            }
        }
    }
}

/// Opaque, compound, hashable identity of a stored value.
///
/// Cloning is cheap: the identity is shared.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct StorageKey(Arc<Identity>);

impl StorageKey {
    /// Key identified by the type `M` alone.
    #[must_use]
    pub fn of<M: ?Sized + 'static>() -> Self {
        Self::with_discriminators::<M, Discriminator>(std::iter::empty())
    }

    /// Key identified by the type `M` and an ordered list of discriminators.
    #[must_use]
    pub fn with_discriminators<M, D>(discriminators: impl IntoIterator<Item = D>) -> Self
    where
        M: ?Sized + 'static,
        D: Into<Discriminator>,
    {
        Self(Arc::new(Identity::Typed {
            type_id: TypeId::of::<M>(),
            type_name: std::any::type_name::<M>(),
            discriminators: discriminators.into_iter().map(Into::into).collect(),
        }))
    }

    /// Key identified by an explicit URI.
    #[must_use]
    pub fn uri(uri: impl Into<String>) -> Self {
        Self(Arc::new(Identity::Uri(uri.into())))
    }

    /// Returns a new key with `discriminator` appended.
    ///
    /// URI keys have no discriminators; the discriminator is appended to the
    /// URI as a path segment instead.
    #[must_use]
    pub fn push(&self, discriminator: impl Into<Discriminator>) -> Self {
        let discriminator = discriminator.into();
        match self.0.as_ref() {
            Identity::Typed {
                type_id,
                type_name,
                discriminators,
            } => {
                let mut discriminators = discriminators.clone();
                discriminators.push(discriminator);
                Self(Arc::new(Identity::Typed {
                    type_id: *type_id,
                    type_name: *type_name,
                    discriminators,
                }))
            }
            Identity::Uri(uri) => {
                let segment = match discriminator {
                    Discriminator::Str(s) => s,
                    other => other.to_string(),
                };
                Self::uri(format!("{}/{segment}", uri.trim_end_matches('/')))
            }
        }
    }

    /// The explicit URI, if this is a URI key.
    #[must_use]
    pub fn as_uri(&self) -> Option<&str> {
        match self.0.as_ref() {
            Identity::Uri(uri) => Some(uri),
            Identity::Typed { .. } => None,
        }
    }

    /// Discriminators of a typed key (empty for URI keys).
    #[must_use]
    pub fn discriminators(&self) -> &[Discriminator] {
        match self.0.as_ref() {
            Identity::Typed { discriminators, .. } => discriminators,
            Identity::Uri(_) => &[],
        }
    }

    /// Readable name of the identifying type, with module paths stripped.
    #[must_use]
    pub fn type_name(&self) -> Option<String> {
        match self.0.as_ref() {
            Identity::Typed { type_name, .. } => Some(short_type_name(type_name)),
            Identity::Uri(_) => None,
        }
    }
}

impl fmt::Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.as_ref() {
            Identity::Uri(uri) => f.write_str(uri),
            Identity::Typed {
                type_name,
                discriminators,
                ..
            } => {
                f.write_str(&short_type_name(type_name))?;
                if !discriminators.is_empty() {
                    f.write_str("[")?;
                    for (idx, d) in discriminators.iter().enumerate() {
                        if idx > 0 {
                            f.write_str(", ")?;
                        }
                        write!(f, "{d}")?;
                    }
                    f.write_str("]")?;
                }
                Ok(())
            }
        }
    }
}

impl fmt::Debug for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StorageKey({self})")
    }
}

/// Strips module paths from a `std::any::type_name` rendering.
///
/// `core::option::Option<alloc::vec::Vec<u8>>` becomes `Option<Vec<u8>>`.
pub(crate) fn short_type_name(full: &str) -> String {
    let mut out = String::with_capacity(full.len());
    let mut segment_start = 0;
    let mut chars = full.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            ':' if chars.peek() == Some(&':') => {
                chars.next();
                out.truncate(segment_start);
            }
            c if c.is_alphanumeric() || c == '_' => out.push(c),
            c => {
                out.push(c);
                segment_start = out.len();
            }
        }
    }
    out
}

/// A storage key that fixes the type of the value stored under it.
pub struct Key<T> {
    storage: StorageKey,
    _value: PhantomData<fn() -> T>,
}

impl<T> Key<T> {
    /// Key identified by the marker type `M`.
    #[must_use]
    pub fn new<M: ?Sized + 'static>() -> Self {
        Self::from_storage_key(StorageKey::of::<M>())
    }

    /// Key identified by an explicit URI.
    #[must_use]
    pub fn uri(uri: impl Into<String>) -> Self {
        Self::from_storage_key(StorageKey::uri(uri))
    }

    /// Wraps an untyped key.
    ///
    /// Two `Key`s with different value types over the same storage key will
    /// observe `ValueTypeMismatch` on read.
    #[must_use]
    pub const fn from_storage_key(storage: StorageKey) -> Self {
        Self {
            storage,
            _value: PhantomData,
        }
    }

    /// Returns this key with `discriminator` appended.
    #[must_use]
    pub fn with(&self, discriminator: impl Into<Discriminator>) -> Self {
        Self::from_storage_key(self.storage.push(discriminator))
    }

    /// The untyped identity.
    #[must_use]
    pub const fn storage_key(&self) -> &StorageKey {
        &self.storage
    }
}

impl<T> Clone for Key<T> {
    fn clone(&self) -> Self {
        Self::from_storage_key(self.storage.clone())
    }
}

impl<T> PartialEq for Key<T> {
    fn eq(&self, other: &Self) -> bool {
        self.storage == other.storage
    }
}

impl<T> Eq for Key<T> {}

impl<T> Hash for Key<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.storage.hash(state);
    }
}

impl<T> fmt::Debug for Key<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key<{}>({})", short_type_name(std::any::type_name::<T>()), self.storage)
    }
}

impl<T> From<Key<T>> for StorageKey {
    fn from(key: Key<T>) -> Self {
        key.storage
    }
}

/// A marker type naming one logical piece of state.
///
/// ```
/// use statecraft::StateKey;
///
/// struct Counter;
///
/// impl StateKey for Counter {
///     type Value = i64;
///     fn default_value() -> i64 {
///         0
///     }
/// }
///
/// assert_eq!(Counter::key(), Counter::key());
/// ```
pub trait StateKey: 'static {
    /// Type of the stored value.
    type Value: Clone + Send + Sync + 'static;

    /// Value returned when nothing has been stored yet.
    fn default_value() -> Self::Value;

    /// The typed key, identified by the marker type itself.
    #[must_use]
    fn key() -> Key<Self::Value> {
        Key::new::<Self>()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::hash_map::DefaultHasher;
    use std::collections::HashSet;

    use super::*;

    fn hash_of<T: Hash>(value: &T) -> u64 {
        let mut hasher = DefaultHasher::new();
        value.hash(&mut hasher);
        hasher.finish()
    }

    #[test]
    fn same_type_keys_are_equal_and_hash_equal() {
        let a = StorageKey::of::<i32>();
        let b = StorageKey::of::<i32>();
        assert_eq!(a, b);
        assert_eq!(hash_of(&a), hash_of(&b));
    }

    #[test]
    fn different_types_differ() {
        assert_ne!(StorageKey::of::<i32>(), StorageKey::of::<String>());
    }

    #[test]
    fn discriminators_split_identity() {
        let one = StorageKey::with_discriminators::<i32, _>([1]);
        let two = StorageKey::with_discriminators::<i32, _>([2]);
        assert_ne!(one, two);
        assert_ne!(one, StorageKey::of::<i32>());
        assert_eq!(one, StorageKey::of::<i32>().push(1));
    }

    #[test]
    fn discriminator_order_matters() {
        let ab = StorageKey::of::<u8>().push("a").push("b");
        let ba = StorageKey::of::<u8>().push("b").push("a");
        assert_ne!(ab, ba);
    }

    #[test]
    fn uri_keys_compare_by_uri() {
        assert_eq!(StorageKey::uri("app://goal"), StorageKey::uri("app://goal"));
        assert_ne!(StorageKey::uri("app://goal"), StorageKey::uri("app://step"));
        assert_ne!(StorageKey::uri("app://goal"), StorageKey::of::<String>());
    }

    #[test]
    fn uri_push_appends_segment() {
        let key = StorageKey::uri("app://users/").push("ada").push(7);
        assert_eq!(key.as_uri(), Some("app://users/ada/7"));
    }

    #[test]
    fn display_strips_module_paths() {
        let key = StorageKey::of::<Option<Vec<String>>>().push(3).push("x");
        assert_eq!(key.to_string(), "Option<Vec<String>>[3, \"x\"]");
        assert_eq!(format!("{key:?}"), "StorageKey(Option<Vec<String>>[3, \"x\"])");
    }

    #[test]
    fn short_type_name_handles_nesting() {
        assert_eq!(
            short_type_name(
                "std::collections::hash::map::HashMap<alloc::string::String, \
                 (u8, core::option::Option<i32>)>"
            ),
            "HashMap<String, (u8, Option<i32>)>"
        );
        assert_eq!(short_type_name("i64"), "i64");
    }

    struct Goal;
    struct Step;

    impl StateKey for Goal {
        type Value = i64;
        fn default_value() -> i64 {
            0
        }
    }

    impl StateKey for Step {
        type Value = i64;
        fn default_value() -> i64 {
            1
        }
    }

    #[test]
    fn marker_types_with_same_value_type_are_distinct() {
        assert_ne!(Goal::key(), Step::key());
        let set: HashSet<StorageKey> = [Goal::key().into(), Step::key().into(), Goal::key().into()]
            .into_iter()
            .collect();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn typed_key_with_discriminator() {
        let base = Key::<i64>::new::<Goal>();
        assert_ne!(base.with(1), base.with(2));
        assert_eq!(base.with(1).storage_key().discriminators(), &[Discriminator::Int(1)]);
    }
}
