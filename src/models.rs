use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Domain Models
// ============================================================================

/// A forum post as the rest of the application stores it.
/// Content is taken as-is; nothing here validates it.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Post {
    pub id: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

impl Post {
    pub fn new(id: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            body: body.into(),
            created_at: Utc::now(),
        }
    }
}
