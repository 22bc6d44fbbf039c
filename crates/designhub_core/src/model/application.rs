//! Application roots.

use crate::model::id::AppId;
use once_cell::sync::Lazy;
use regex::Regex;

static NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_]{0,63}$").expect("valid name regex"));

/// Name under which hub-level artifacts (data stores) are addressed.
pub const HUB_APP_NAME: &str = "sys";

/// Returns whether `name` is legal for applications, artifacts, members and folders.
pub fn is_valid_name(name: &str) -> bool {
    NAME_RE.is_match(name)
}

/// A named container of entities, services and views.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Application {
    pub id: AppId,
    pub name: String,
    pub owner: String,
}

impl Application {
    pub fn new(id: AppId, name: &str, owner: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
            owner: owner.to_string(),
        }
    }
}
