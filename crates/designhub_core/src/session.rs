//! Developer identity carried by every catalog and publish call.

use std::fmt::{Display, Formatter};
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeveloperId(Uuid);

impl DeveloperId {
    pub fn new(id: Uuid) -> Self {
        Self(id)
    }

    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(self) -> Uuid {
        self.0
    }
}

impl Display for DeveloperId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for DeveloperId {
    type Err = uuid::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(value).map(Self)
    }
}

/// An authenticated developer working against the hub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeveloperSession {
    pub id: DeveloperId,
    pub display_name: String,
}

impl DeveloperSession {
    pub fn new(id: DeveloperId, display_name: &str) -> Self {
        Self {
            id,
            display_name: display_name.to_string(),
        }
    }
}
