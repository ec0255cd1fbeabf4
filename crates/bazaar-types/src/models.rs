use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The subject of a chat thread: a marketplace product, an accommodation
/// listing, or nothing for a general conversation. A product-scoped thread and
/// a listing-less thread between the same two users are distinct threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum ListingRef {
    Product(Uuid),
    Accommodation(Uuid),
    None,
}

impl ListingRef {
    pub fn product_id(&self) -> Option<Uuid> {
        match self {
            Self::Product(id) => Some(*id),
            _ => None,
        }
    }

    pub fn accommodation_id(&self) -> Option<Uuid> {
        match self {
            Self::Accommodation(id) => Some(*id),
            _ => None,
        }
    }

    /// Rebuild the tagged form from the two nullable listing columns.
    /// Both set is unrepresentable at the schema level; product wins if a
    /// corrupt row slips through.
    pub fn from_columns(product: Option<Uuid>, accommodation: Option<Uuid>) -> Self {
        match (product, accommodation) {
            (Some(id), _) => Self::Product(id),
            (None, Some(id)) => Self::Accommodation(id),
            (None, None) => Self::None,
        }
    }
}
