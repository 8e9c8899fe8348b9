//! The name registry maps unique entity names to indices.

use std::collections::HashMap;

use log::debug;

/// The kind of entity a name refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NameKind {
    /// An output device.
    Sink,
    /// A capture device.
    Source,
    /// A cached sample.
    Sample,
}

/// Maps `(kind, name)` pairs to entity indices, enforcing uniqueness.
#[derive(Debug, Default)]
pub struct NameReg {
    entries: HashMap<(NameKind, String), u32>,
}

impl NameReg {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a name for an entity and returns the name actually used.
    ///
    /// If the name is taken and `fail` is set, registration is refused.
    /// Otherwise a numeric suffix is appended until a free name is found.
    pub fn register(
        &mut self,
        kind: NameKind,
        name: &str,
        index: u32,
        fail: bool,
    ) -> Option<String> {
        let key = (kind, name.to_string());
        if !self.entries.contains_key(&key) {
            self.entries.insert(key, index);
            return Some(name.to_string());
        }

        if fail {
            debug!("name {:?} already registered", name);
            return None;
        }

        for n in 2.. {
            let candidate = format!("{}.{}", name, n);
            let key = (kind, candidate.clone());
            if !self.entries.contains_key(&key) {
                self.entries.insert(key, index);
                return Some(candidate);
            }
        }

        unreachable!()
    }

    /// Resolves a name to an index.
    pub fn get(&self, kind: NameKind, name: &str) -> Option<u32> {
        self.entries.get(&(kind, name.to_string())).copied()
    }

    /// Removes a name.
    pub fn unregister(&mut self, kind: NameKind, name: &str) -> bool {
        self.entries.remove(&(kind, name.to_string())).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_unique_per_kind() {
        let mut reg = NameReg::new();

        assert_eq!(
            reg.register(NameKind::Sink, "output", 0, false),
            Some("output".into())
        );
        assert_eq!(
            reg.register(NameKind::Sink, "output", 1, false),
            Some("output.2".into())
        );
        assert_eq!(reg.register(NameKind::Sink, "output", 2, true), None);

        // The same name is free under a different kind.
        assert_eq!(
            reg.register(NameKind::Source, "output", 3, true),
            Some("output".into())
        );

        assert_eq!(reg.get(NameKind::Sink, "output"), Some(0));
        assert_eq!(reg.get(NameKind::Sink, "output.2"), Some(1));

        reg.unregister(NameKind::Sink, "output");
        assert_eq!(reg.get(NameKind::Sink, "output"), None);
    }
}
