use rand::seq::SliceRandom;
use rand::Rng;

use crate::config::PasswordPolicy;

const LOWER: &[u8] = b"abcdefghijklmnopqrstuvwxyz";
const UPPER: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ";
const SPECIAL: &[u8] = b"!@#$%&*";
const NUMERIC: &[u8] = b"0123456789";

/// Generate a password meeting the policy minimums, remainder from the full alphabet.
///
/// When the minimums exceed `length` the minimums win and the password grows.
pub fn generate_password(policy: &PasswordPolicy) -> String {
    let mut rng = rand::thread_rng();
    let all: Vec<u8> = [LOWER, UPPER, SPECIAL, NUMERIC].concat();

    let mut chars: Vec<u8> = Vec::with_capacity(policy.length);
    for (count, set) in [
        (policy.min_special, SPECIAL),
        (policy.min_numeric, NUMERIC),
        (policy.min_upper, UPPER),
    ] {
        for _ in 0..count {
            chars.push(set[rng.gen_range(0..set.len())]);
        }
    }

    let required = policy.min_special + policy.min_numeric + policy.min_upper;
    for _ in 0..policy.length.saturating_sub(required) {
        chars.push(all[rng.gen_range(0..all.len())]);
    }

    chars.shuffle(&mut rng);
    String::from_utf8(chars).unwrap_or_default()
}
