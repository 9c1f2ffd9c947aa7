//! ServiceAccount lookup against the cluster API.

use std::future::Future;

use k8s_openapi::api::core::v1::ServiceAccount;

/// Lookup seam used by the mutation engine. Not-found and transport failures
/// are surfaced uniformly; the engine denies on either.
pub trait ServiceAccounts {
    fn get(
        &self,
        namespace: &str,
        name: &str,
    ) -> impl Future<Output = anyhow::Result<ServiceAccount>> + Send;
}

/// Production implementation backed by the in-cluster API connection.
#[derive(Clone)]
pub struct ClusterServiceAccounts {
    client: kube::Client,
}

impl ClusterServiceAccounts {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }
}

impl ServiceAccounts for ClusterServiceAccounts {
    async fn get(&self, namespace: &str, name: &str) -> anyhow::Result<ServiceAccount> {
        let accounts: kube::Api<ServiceAccount> =
            kube::Api::namespaced(self.client.clone(), namespace);
        Ok(accounts.get(name).await?)
    }
}
