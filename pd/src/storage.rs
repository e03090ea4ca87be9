//! Store access from async code
//!
//! `PlanStore` is synchronous SQLite. Workers call it through `blocking` so a
//! slow write never parks a tokio worker thread.

use planstore::{PlanStore, StoreError};

/// Run a store call on tokio's blocking pool
///
/// A call that panics surfaces as an I/O error.
pub async fn blocking<T, F>(store: &PlanStore, f: F) -> Result<T, StoreError>
where
    F: FnOnce(&PlanStore) -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    let store = store.clone();
    tokio::task::spawn_blocking(move || f(&store))
        .await
        .map_err(|e| StoreError::Io(std::io::Error::other(e)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_blocking_runs_store_call() {
        let dir = TempDir::new().unwrap();
        let store = PlanStore::open(dir.path()).unwrap();
        let plan = blocking(&store, |s| s.create_plan("Off thread", None, Map::new()))
            .await
            .unwrap();
        assert_eq!(store.get_tree(plan.id).unwrap().title, "Off thread");
    }

    #[tokio::test]
    async fn test_blocking_errors_pass_through() {
        let dir = TempDir::new().unwrap();
        let store = PlanStore::open(dir.path()).unwrap();
        let err = blocking(&store, |s| s.get_tree(99)).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_blocking_panic_is_an_error() {
        let dir = TempDir::new().unwrap();
        let store = PlanStore::open(dir.path()).unwrap();
        let err = blocking(&store, |_| -> Result<(), StoreError> { panic!("store call blew up") })
            .await
            .unwrap_err();
        assert!(err.is_persistence());
    }
}
