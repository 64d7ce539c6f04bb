//! Client for the managed cluster's own membership API
//!
//! Membership components (`pd`, `master`) answer member and leader queries;
//! the placement driver also owns the store registry of data-holding
//! components. The default implementation speaks JSON over HTTP.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use tidemark_common::crd::MemberType;
use tidemark_common::Error;

/// A member as reported by the membership API
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Member {
    /// Member id
    pub id: String,
    /// Member name; empty while the member is still joining
    #[serde(default)]
    pub name: String,
    /// Advertised client URLs
    #[serde(default)]
    pub client_urls: Vec<String>,
    /// Liveness as seen by the leader
    #[serde(default)]
    pub alive: bool,
}

/// A store as reported by the placement driver
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StoreInfo {
    /// Store id
    pub id: u64,
    /// Advertised address, `<pod>.<peer-service>.<namespace>.svc:<port>`
    pub address: String,
    /// State name (Up, Offline, Down, Tombstone)
    pub state: String,
}

impl StoreInfo {
    /// Pod name encoded in the advertised address
    pub fn pod_name(&self) -> &str {
        let host = self.address.split(':').next().unwrap_or_default();
        host.split('.').next().unwrap_or_default()
    }
}

#[derive(Deserialize)]
struct MembersResponse {
    #[serde(default)]
    members: Vec<Member>,
}

#[derive(Deserialize)]
struct StoresResponse {
    #[serde(default)]
    stores: Vec<StoreInfo>,
}

/// Queries against one cluster's membership API
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MembershipClient: Send + Sync {
    /// All members, healthy or not
    async fn get_members(&self) -> Result<Vec<Member>, Error>;

    /// The current leader
    async fn get_leader(&self) -> Result<Member, Error>;

    /// All registered stores, including tombstones
    async fn get_stores(&self) -> Result<Vec<StoreInfo>, Error>;

    /// Ask the cluster to drain and remove a store; idempotent
    async fn delete_store(&self, id: u64) -> Result<(), Error>;

    /// Remove a member from the group by name; idempotent
    async fn delete_member(&self, name: &str) -> Result<(), Error>;
}

/// Builds membership clients per cluster component
#[cfg_attr(test, automock)]
pub trait MembershipClientFactory: Send + Sync {
    /// Client for the membership API served by `member` of `cluster`
    fn client(
        &self,
        namespace: &str,
        cluster: &str,
        member: MemberType,
        tls: bool,
    ) -> Arc<dyn MembershipClient>;
}

/// JSON-over-HTTP membership client
pub struct HttpMembershipClient {
    http: reqwest::Client,
    base_url: String,
}

impl HttpMembershipClient {
    /// Client for the API rooted at `base_url`
    pub fn new(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v1/{}", self.base_url, path)
    }

    fn map_err(&self, e: reqwest::Error) -> Error {
        Error::membership(&self.base_url, e.to_string())
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, Error> {
        let url = self.url(path);
        debug!(%url, "querying membership api");
        self.http
            .get(&url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| self.map_err(e))?
            .json()
            .await
            .map_err(|e| self.map_err(e))
    }

    async fn delete(&self, path: &str) -> Result<(), Error> {
        let response = self
            .http
            .delete(self.url(path))
            .send()
            .await
            .map_err(|e| self.map_err(e))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        response.error_for_status().map_err(|e| self.map_err(e))?;
        Ok(())
    }
}

#[async_trait]
impl MembershipClient for HttpMembershipClient {
    async fn get_members(&self) -> Result<Vec<Member>, Error> {
        let response: MembersResponse = self.get_json("members").await?;
        Ok(response.members)
    }

    async fn get_leader(&self) -> Result<Member, Error> {
        self.get_json("leader").await
    }

    async fn get_stores(&self) -> Result<Vec<StoreInfo>, Error> {
        let response: StoresResponse = self.get_json("stores").await?;
        Ok(response.stores)
    }

    async fn delete_store(&self, id: u64) -> Result<(), Error> {
        self.delete(&format!("stores/{id}")).await
    }

    async fn delete_member(&self, name: &str) -> Result<(), Error> {
        self.delete(&format!("members/{name}")).await
    }
}

/// Factory addressing each component through its client Service
pub struct HttpMembershipClientFactory {
    http: reqwest::Client,
}

impl HttpMembershipClientFactory {
    /// Factory with a shared connection pool and request timeout
    pub fn new(timeout: Duration) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::internal_with_context("membership", e.to_string()))?;
        Ok(Self { http })
    }
}

/// Base URL of the membership API served by `member` of `cluster`
pub fn membership_base_url(namespace: &str, cluster: &str, member: MemberType, tls: bool) -> String {
    let scheme = if tls { "https" } else { "http" };
    format!(
        "{scheme}://{cluster}-{member}.{namespace}:{}",
        member.client_port()
    )
}

impl MembershipClientFactory for HttpMembershipClientFactory {
    fn client(
        &self,
        namespace: &str,
        cluster: &str,
        member: MemberType,
        tls: bool,
    ) -> Arc<dyn MembershipClient> {
        Arc::new(HttpMembershipClient::new(
            self.http.clone(),
            membership_base_url(namespace, cluster, member, tls),
        ))
    }
}
