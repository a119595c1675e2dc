//! Remote addressing for memory entries

use super::types::Scope;

/// Collection holding entries of the global scope
pub const GLOBAL_COLLECTION: &str = "memory_global";
/// Collection holding per-project entries, nested as `project/entries/key`
pub const PROJECT_COLLECTION: &str = "memory_projects";

/// Every collection a pull has to scan
pub const MEMORY_COLLECTIONS: [&str; 2] = [GLOBAL_COLLECTION, PROJECT_COLLECTION];

/// Where an entry lives in the remote store
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RemoteAddress {
    Global(String),
    Project { project_id: String, key: String },
}

impl RemoteAddress {
    pub fn new(scope: &Scope, key: &str) -> Self {
        match scope {
            Scope::Global => RemoteAddress::Global(key.to_string()),
            Scope::Project(project_id) => RemoteAddress::Project {
                project_id: project_id.clone(),
                key: key.to_string(),
            },
        }
    }

    pub fn collection(&self) -> &'static str {
        match self {
            RemoteAddress::Global(_) => GLOBAL_COLLECTION,
            RemoteAddress::Project { .. } => PROJECT_COLLECTION,
        }
    }

    pub fn doc_path(&self) -> String {
        match self {
            RemoteAddress::Global(key) => key.clone(),
            RemoteAddress::Project { project_id, key } => {
                format!("{}/entries/{}", project_id, key)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_address() {
        let addr = RemoteAddress::new(&Scope::Global, "theme");
        assert_eq!(addr.collection(), "memory_global");
        assert_eq!(addr.doc_path(), "theme");
    }

    #[test]
    fn test_project_address_nests_entries() {
        let addr = RemoteAddress::new(&Scope::Project("p1".to_string()), "notes");
        assert_eq!(addr.collection(), "memory_projects");
        assert_eq!(addr.doc_path(), "p1/entries/notes");
    }
}
