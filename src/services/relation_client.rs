//! Relation service client
//!
//! Presence announcements need the friend list of the user coming online or
//! going offline. The relation service owns that data; this module only asks.

use crate::error::AppError;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

#[async_trait]
pub trait RelationService: Send + Sync {
    async fn get_friend_list(&self, user_id: Uuid) -> Result<Vec<Uuid>, AppError>;
}

#[derive(Debug, Deserialize)]
struct FriendListResponse {
    friend_ids: Vec<Uuid>,
}

/// HTTP client for `GET {base}/api/v1/relations/{user_id}/friends`.
#[derive(Clone)]
pub struct HttpRelationClient {
    http: reqwest::Client,
    base_url: String,
}

impl HttpRelationClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, AppError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::StartServer(format!("Failed to build relation client: {}", e)))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl RelationService for HttpRelationClient {
    async fn get_friend_list(&self, user_id: Uuid) -> Result<Vec<Uuid>, AppError> {
        let url = format!("{}/api/v1/relations/{}/friends", self.base_url, user_id);

        let response = self.http.get(&url).send().await.map_err(|e| {
            tracing::error!(user_id = %user_id, error = %e, "relation-service request failed");
            AppError::Relation(e.to_string())
        })?;

        let status = response.status();
        if !status.is_success() {
            tracing::error!(
                user_id = %user_id,
                status = %status,
                "relation-service get_friend_list failed"
            );
            return Err(AppError::Relation(format!(
                "relation-service returned {}",
                status
            )));
        }

        let body: FriendListResponse = response
            .json()
            .await
            .map_err(|e| AppError::Relation(format!("invalid friend list: {}", e)))?;
        Ok(body.friend_ids)
    }
}

/// Fixed friend graph, for tests and local runs without a relation service.
#[derive(Debug, Default, Clone)]
pub struct StaticRelations {
    friends: HashMap<Uuid, Vec<Uuid>>,
}

impl StaticRelations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a mutual friendship.
    pub fn befriend(mut self, a: Uuid, b: Uuid) -> Self {
        self.friends.entry(a).or_default().push(b);
        self.friends.entry(b).or_default().push(a);
        self
    }
}

#[async_trait]
impl RelationService for StaticRelations {
    async fn get_friend_list(&self, user_id: Uuid) -> Result<Vec<Uuid>, AppError> {
        Ok(self.friends.get(&user_id).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_relations_are_mutual() {
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let relations = StaticRelations::new().befriend(a, b).befriend(a, c);

        let mut friends_of_a = relations.get_friend_list(a).await.unwrap();
        friends_of_a.sort();
        let mut expected = vec![b, c];
        expected.sort();

        assert_eq!(friends_of_a, expected);
        assert_eq!(relations.get_friend_list(b).await.unwrap(), vec![a]);
        assert!(relations.get_friend_list(Uuid::new_v4()).await.unwrap().is_empty());
    }

    #[test]
    fn test_base_url_trailing_slash_is_trimmed() {
        let client =
            HttpRelationClient::new("http://relations:8080/", Duration::from_millis(500)).unwrap();
        assert_eq!(client.base_url, "http://relations:8080");
    }
}
