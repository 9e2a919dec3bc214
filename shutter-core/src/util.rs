use crossbeam::atomic::AtomicCell;
use rand::{distributions::Alphanumeric, thread_rng, Rng};
use std::{
    fmt::{Debug, Display},
    hash::Hash,
    marker::PhantomData,
};

pub type IdType = u64;
static ID_COUNTER: AtomicCell<IdType> = AtomicCell::new(1);

/// Identifies something for the lifetime of the process.
pub struct Id<T> {
    value: IdType,
    kind: PhantomData<T>,
}

impl<T> Id<T> {
    pub fn new() -> Self {
        Self {
            value: ID_COUNTER.fetch_add(1),
            kind: PhantomData,
        }
    }

    pub fn value(&self) -> IdType {
        self.value
    }
}

/// Generates a random alphanumeric string of a given length
pub fn random_string(length: usize) -> String {
    let mut rng = thread_rng();

    (0..length).map(|_| rng.sample(Alphanumeric) as char).collect()
}

impl<T> Debug for Id<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Id({})", self.value)
    }
}

impl<T> Display for Id<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.value)
    }
}

impl<T> Clone for Id<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Id<T> {}

impl<T> PartialEq for Id<T> {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}

impl<T> Eq for Id<T> {}

impl<T> Hash for Id<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.value.hash(state);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    struct Marker;

    #[test]
    fn ids_are_unique() {
        let first: Id<Marker> = Id::new();
        let second: Id<Marker> = Id::new();

        assert_ne!(first, second);
        assert_eq!(first, first);
    }

    #[test]
    fn random_strings_are_alphanumeric() {
        let value = random_string(64);

        assert_eq!(value.len(), 64);
        assert!(value.chars().all(|c| c.is_ascii_alphanumeric()));
    }
}
