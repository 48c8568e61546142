use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

pub const DEFAULT_DATABASE_ID: &str = "(default)";

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DatabaseId {
    project_id: String,
    database: String,
}

impl DatabaseId {
    pub fn new(project_id: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            database: database.into(),
        }
    }

    pub fn default(project_id: impl Into<String>) -> Self {
        Self::new(project_id, DEFAULT_DATABASE_ID)
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn is_default_database(&self) -> bool {
        self.database == DEFAULT_DATABASE_ID
    }

    /// `projects/{project}/databases/{database}`
    pub fn database_name(&self) -> String {
        format!("projects/{}/databases/{}", self.project_id, self.database)
    }

    pub fn documents_root(&self) -> String {
        format!("{}/documents", self.database_name())
    }

    pub fn compare(&self, other: &Self) -> Ordering {
        self.project_id
            .cmp(&other.project_id)
            .then_with(|| self.database.cmp(&other.database))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_resource_names() {
        let db = DatabaseId::default("project");
        assert!(db.is_default_database());
        assert_eq!(db.database_name(), "projects/project/databases/(default)");
        assert_eq!(
            db.documents_root(),
            "projects/project/databases/(default)/documents"
        );
    }
}
