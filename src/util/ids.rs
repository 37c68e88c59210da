//! Identifier helpers.

use uuid::Uuid;

/// Generate a random identifier for consumers and records.
#[must_use]
pub fn generate_id() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_unique() {
        assert_ne!(generate_id(), generate_id());
    }
}
