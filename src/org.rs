//! Management hierarchy traversal
//!
//! Each level returns the records it collected and the caller concatenates
//! them; nothing is accumulated through shared state.

use crate::directory::{DirectoryClient, DirectoryObject, ObjectFilter};
use crate::{ObjectKind, ProcessorError};
use futures::future::BoxFuture;
use futures::FutureExt;

/// One user found under a manager
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OrgEntry {
    /// The report
    pub object: DirectoryObject,
    /// Direct manager id
    pub manager_id: String,
    /// 1 for direct reports
    pub depth: u32,
}

/// Collect every transitive report of `manager_id`, depth-first.
///
/// `ancestors` is the chain of managers above the current level; an id that
/// reappears in its own chain is not descended into again.
pub fn collect_reports<'a, C>(
    client: &'a C,
    manager_id: String,
    depth: u32,
    ancestors: Vec<String>,
) -> BoxFuture<'a, Result<Vec<OrgEntry>, ProcessorError>>
where
    C: DirectoryClient + ?Sized,
{
    async move {
        let direct = client
            .list_objects(ObjectKind::User, &ObjectFilter::DirectReportsOf(manager_id.clone()))
            .await?;

        let mut chain = ancestors;
        chain.push(manager_id.clone());

        let mut collected = Vec::new();
        for object in direct {
            if chain.contains(&object.id) {
                tracing::warn!(manager = %manager_id, report = %object.id, "Management cycle, not descending");
                continue;
            }
            let below = collect_reports(client, object.id.clone(), depth + 1, chain.clone()).await?;
            collected.push(OrgEntry {
                object,
                manager_id: manager_id.clone(),
                depth,
            });
            collected.extend(below);
        }
        Ok(collected)
    }
    .boxed()
}

/// Transitive reports of `root`, direct reports at depth 1
pub async fn reports_of<C>(client: &C, root: &str) -> Result<Vec<OrgEntry>, ProcessorError>
where
    C: DirectoryClient + ?Sized,
{
    collect_reports(client, root.to_string(), 1, Vec::new()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{user, InMemoryDirectory};

    fn ids(entries: &[OrgEntry]) -> Vec<(&str, u32)> {
        entries.iter().map(|e| (e.object.id.as_str(), e.depth)).collect()
    }

    #[tokio::test]
    async fn test_collects_transitive_reports_depth_first() {
        let directory = InMemoryDirectory::new("src");
        directory
            .insert("ceo", user("ceo"))
            .insert_report("cto", user("cto"), "ceo")
            .insert_report("dev1", user("dev1"), "cto")
            .insert_report("dev2", user("dev2"), "cto")
            .insert_report("cfo", user("cfo"), "ceo");

        let entries = reports_of(&directory, "ceo").await.unwrap();

        assert_eq!(
            ids(&entries),
            vec![("cfo", 1), ("cto", 1), ("dev1", 2), ("dev2", 2)]
        );
        assert_eq!(entries[2].manager_id, "cto");
    }

    #[tokio::test]
    async fn test_management_cycle_terminates() {
        let directory = InMemoryDirectory::new("src");
        directory
            .insert_report("a", user("a"), "b")
            .insert_report("b", user("b"), "a");

        let entries = reports_of(&directory, "a").await.unwrap();
        assert_eq!(ids(&entries), vec![("b", 1)]);
    }

    #[tokio::test]
    async fn test_listing_failure_propagates() {
        let directory = InMemoryDirectory::new("src");
        directory.fail_listing(ProcessorError::Directory("throttled".into()));
        assert!(reports_of(&directory, "ceo").await.is_err());
    }
}
