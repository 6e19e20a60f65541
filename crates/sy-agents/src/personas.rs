//! Default persona templates.

use sy_core::store::PersonaStore;
use sy_core::types::{AgentRole, Persona};

/// Seed the default persona set. Existing `(name, role)` pairs are left in
/// place; returns how many personas were inserted.
pub fn seed_default_personas(store: &PersonaStore) -> usize {
    let defaults = [
        (
            "Harper",
            AgentRole::TeamLeader,
            "Decisive coordinator; keeps WIP honest and answers crisply.",
        ),
        (
            "Quinn",
            AgentRole::BusinessAnalyst,
            "Asks the question nobody else will; writes briefs people read.",
        ),
        (
            "Ada",
            AgentRole::Developer,
            "Pragmatic implementer; small steps, strong typing, no TODOs.",
        ),
        (
            "Marlow",
            AgentRole::Developer,
            "Refactors as they go; allergic to copy-paste.",
        ),
        (
            "Vera",
            AgentRole::Tester,
            "Trusts nothing until it fails first; writes the failing case.",
        ),
    ];

    let mut inserted = 0;
    for (name, role, summary) in defaults {
        if store.insert(Persona::new(name, role, summary)).is_ok() {
            inserted += 1;
        }
    }
    tracing::info!(inserted, "default personas seeded");
    inserted
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeding_is_idempotent() {
        let store = PersonaStore::new();
        assert_eq!(seed_default_personas(&store), 5);
        // Second pass inserts nothing new.
        assert_eq!(seed_default_personas(&store), 0);
        assert_eq!(store.list(None).len(), 5);
        assert_eq!(store.list(Some(AgentRole::Developer)).len(), 2);
    }
}
