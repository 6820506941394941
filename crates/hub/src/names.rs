// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Session name generation: lowercase, hyphenated, collision-checked by
//! the session manager.

use rand::seq::IndexedRandom;
use rand::Rng;

const ADJECTIVES: &[&str] = &[
    "amber", "bold", "brave", "brisk", "calm", "clever", "crisp", "deft", "eager", "fleet",
    "gentle", "glad", "keen", "lively", "lucid", "merry", "mild", "nimble", "plucky", "quiet",
    "rapid", "sly", "spry", "steady", "stout", "swift", "tidy", "vivid", "warm", "wise",
];

const NOUNS: &[&str] = &[
    "badger", "bison", "crane", "dingo", "falcon", "gecko", "heron", "ibis", "jackal", "kestrel",
    "lemur", "lynx", "marmot", "marten", "newt", "otter", "owl", "petrel", "plover", "puffin",
    "quail", "raven", "shrew", "stoat", "swift", "tern", "vole", "wren", "yak", "zebu",
];

/// Generate a candidate session name. Uniqueness is the caller's problem.
pub fn random_name() -> String {
    let mut rng = rand::rng();
    let adjective = ADJECTIVES.choose(&mut rng).unwrap_or(&"brave");
    let noun = NOUNS.choose(&mut rng).unwrap_or(&"otter");
    format!("{adjective}-{noun}")
}

/// Generate a candidate with a short random suffix, for when the plain
/// adjective-noun space is exhausted.
pub fn random_name_suffixed() -> String {
    let mut rng = rand::rng();
    let n: u16 = rng.random_range(100..1000);
    format!("{}-{n}", random_name())
}

/// Whether a caller-supplied name is acceptable as a session name.
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 63
        && name.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !name.starts_with('-')
        && !name.ends_with('-')
}

#[cfg(test)]
#[path = "names_tests.rs"]
mod tests;
