//! Human-friendly worker names.

use rand::seq::SliceRandom;

const ADJECTIVES: &[&str] = &[
    "amber", "brisk", "calm", "dapper", "eager", "fuzzy", "gentle", "hardy", "idle", "jolly", "keen", "lively",
    "mellow", "nimble", "odd", "plucky", "quiet", "rapid", "steady", "tidy", "upbeat", "vivid", "witty", "zesty",
];

const NOUNS: &[&str] = &[
    "badger", "condor", "dingo", "egret", "ferret", "gecko", "heron", "ibis", "jackal", "koala", "lemur", "marmot",
    "newt", "otter", "panda", "quail", "raven", "stoat", "tapir", "urchin", "vole", "walrus", "yak", "zebu",
];

/// `adjective_noun`, e.g. `plucky_otter`.
pub fn generate_name() -> String {
    let mut rng = rand::thread_rng();
    let adjective = ADJECTIVES.choose(&mut rng).copied().unwrap_or("plain");
    let noun = NOUNS.choose(&mut rng).copied().unwrap_or("worker");
    format!("{adjective}_{noun}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_adjective_noun() {
        for _ in 0..50 {
            let name = generate_name();
            let (adjective, noun) = name.split_once('_').unwrap();
            assert!(ADJECTIVES.contains(&adjective));
            assert!(NOUNS.contains(&noun));
        }
    }
}
