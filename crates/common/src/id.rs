//! Connection identifier generation.
//!
//! Identifiers are 37-byte strings: a single type-prefix byte followed by
//! the lowercase canonical form of a freshly generated UUIDv4. The
//! identifier is the primary routing key for a connection and is stable for
//! the lifetime of the entity it names.

use uuid::Uuid;

/// Prefix byte of identifiers naming worker processes.
pub const WORKER_PREFIX: char = '$';

/// Prefix byte of identifiers naming users attached to a worker.
pub const USER_PREFIX: char = '@';

/// Total length in bytes of a generated identifier.
pub const ID_LENGTH: usize = 37;

/// Generates a new identifier with the given type prefix.
pub fn generate(prefix: char) -> String {
    let mut id = String::with_capacity(ID_LENGTH);
    id.push(prefix);
    id.push_str(&Uuid::new_v4().hyphenated().to_string());
    id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers_have_fixed_shape() {
        let id = generate(WORKER_PREFIX);
        assert_eq!(id.len(), ID_LENGTH);
        assert!(id.starts_with('$'));

        /* The UUID body is lowercase canonical form */
        let body = &id[1..];
        assert_eq!(body.len(), 36);
        assert!(
            body.chars()
                .all(|c| (c.is_ascii_hexdigit() && !c.is_ascii_uppercase()) || c == '-')
        );
        assert_eq!(body.matches('-').count(), 4);
    }

    #[test]
    fn identifiers_are_unique() {
        let a = generate(USER_PREFIX);
        let b = generate(USER_PREFIX);
        assert!(a.starts_with('@'));
        assert_ne!(a, b);
    }
}
