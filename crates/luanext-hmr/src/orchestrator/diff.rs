use std::collections::BTreeMap;

use crate::runtime::ModuleId;

/// Module id -> compiled factory body
pub type ModuleCodeMap = BTreeMap<ModuleId, String>;

/// Modules of `next` whose code differs from `previous`
///
/// A module missing from `previous` counts as changed. Modules that
/// disappeared are not reported: nothing can require them anymore.
pub fn changed_modules(previous: &ModuleCodeMap, next: &ModuleCodeMap) -> ModuleCodeMap {
    next.iter()
        .filter(|(id, code)| previous.get(*id) != Some(*code))
        .map(|(id, code)| (id.clone(), code.clone()))
        .collect()
}

/// Content hash of a whole code map, independent of insertion order
pub fn content_hash(code: &ModuleCodeMap) -> blake3::Hash {
    let mut hasher = blake3::Hasher::new();
    for (id, body) in code {
        hasher.update(id.as_bytes());
        hasher.update(&[0]);
        hasher.update(body.as_bytes());
        hasher.update(&[0]);
    }
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(entries: &[(&str, &str)]) -> ModuleCodeMap {
        entries
            .iter()
            .map(|(id, code)| (id.to_string(), code.to_string()))
            .collect()
    }

    #[test]
    fn test_first_build_changes_everything() {
        let next = map(&[("a", "1"), ("b", "2")]);
        assert_eq!(changed_modules(&ModuleCodeMap::new(), &next), next);
    }

    #[test]
    fn test_only_differing_code_is_reported() {
        let previous = map(&[("a", "1"), ("b", "2"), ("gone", "x")]);
        let next = map(&[("a", "1"), ("b", "3"), ("new", "4")]);

        let delta = changed_modules(&previous, &next);
        assert_eq!(delta, map(&[("b", "3"), ("new", "4")]));
    }

    #[test]
    fn test_hash_tracks_content() {
        let a = map(&[("a", "1")]);
        let b = map(&[("a", "2")]);
        assert_eq!(content_hash(&a), content_hash(&a.clone()));
        assert_ne!(content_hash(&a), content_hash(&b));
        // Field boundaries are part of the hash
        assert_ne!(
            content_hash(&map(&[("ab", "c")])),
            content_hash(&map(&[("a", "bc")]))
        );
    }
}
