use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Process-unique peer identity.
///
/// Generated once at startup and immutable for the process lifetime. The
/// derived `Ord` compares the underlying 128-bit value numerically, which is
/// the total order the leader election ranks peers by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(Uuid);

impl PeerId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Numeric form used when ranking peers.
    pub fn as_u128(&self) -> u128 {
        self.0.as_u128()
    }

    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_are_unique() {
        let id1 = PeerId::generate();
        let id2 = PeerId::generate();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_ordering_matches_numeric_value() {
        let low = PeerId::from_uuid(Uuid::from_u128(1));
        let high = PeerId::from_uuid(Uuid::from_u128(u128::MAX));
        assert!(low < high);
        assert_eq!(low.as_u128(), 1);
    }

    #[test]
    fn test_display_roundtrip() {
        let id = PeerId::generate();
        let parsed: Uuid = id.to_string().parse().unwrap();
        assert_eq!(PeerId::from_uuid(parsed), id);
    }

    #[test]
    fn test_serde_roundtrip() {
        let id = PeerId::generate();
        let json = serde_json::to_string(&id).unwrap();
        let back: PeerId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
    }
}
