//! Message identifiers.

use chrono::Utc;
use uuid::Uuid;

/// A message identifier.
pub type MessageId = String;

/// Generate a unique message ID.
///
/// The format is `YYYYMMDDHHMMSS-<uuid>`: sortable by second, unique by the
/// random suffix.
#[must_use]
pub fn generate_message_id() -> MessageId {
    format!(
        "{}-{}",
        Utc::now().format("%Y%m%d%H%M%S"),
        Uuid::new_v4().simple()
    )
}

/// Generate a unique connection ID.
#[must_use]
pub fn generate_connection_id() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unique_message_ids() {
        let id1 = generate_message_id();
        let id2 = generate_message_id();
        assert_ne!(id1, id2);
        assert_eq!(id1.find('-'), Some(14));
    }

    #[test]
    fn test_connection_id_is_uuid() {
        let id = generate_connection_id();
        assert!(Uuid::parse_str(&id).is_ok());
    }
}
