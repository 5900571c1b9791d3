use rand::distributions::Alphanumeric;
use rand::Rng;

/// Generate a prefixed random identifier, e.g. `W3kf8a1q920x`.
///
/// Used for node and job identities; task identities are derived, not
/// generated.
pub fn generate_id(prefix: &str) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(12)
        .map(char::from)
        .collect();
    format!("{prefix}{suffix}")
}

#[cfg(test)]
mod tests {
    use super::generate_id;

    #[test]
    fn ids_are_prefixed_and_unique() {
        let a = generate_id("J");
        let b = generate_id("J");
        assert!(a.starts_with('J'));
        assert_eq!(a.len(), 13);
        assert_ne!(a, b);
    }
}
