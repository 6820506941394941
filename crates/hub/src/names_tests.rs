// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use yare::parameterized;

use super::*;

#[test]
fn generated_names_are_valid() {
    for _ in 0..64 {
        let name = random_name();
        assert!(is_valid_name(&name), "invalid generated name: {name}");
        let suffixed = random_name_suffixed();
        assert!(is_valid_name(&suffixed), "invalid suffixed name: {suffixed}");
    }
}

#[parameterized(
    plain = { "calm-heron", true },
    digits = { "calm-heron-2", true },
    empty = { "", false },
    uppercase = { "Calm-Heron", false },
    leading_hyphen = { "-heron", false },
    trailing_hyphen = { "heron-", false },
    spaces = { "calm heron", false },
)]
fn name_validation(name: &str, ok: bool) {
    assert_eq!(is_valid_name(name), ok);
}
