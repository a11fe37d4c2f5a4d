use std::path::{Path, PathBuf};
use log::info;
use serde::Deserialize;
use thiserror::Error;
use uuid::Uuid;

use crate::config::ProfileConfig;

#[derive(Debug, Error)]
pub enum ProfileError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("profile API returned status {0}")]
    Api(u16),

    #[error("profile has no picture to use as source image")]
    NoImage,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// What the lookup service knows about a profile
#[derive(Debug, Clone, Deserialize)]
pub struct ProfileInfo {
    #[serde(rename = "profile_pic_url")]
    pub image_url: Option<String>,
    #[serde(rename = "full_name")]
    pub display_name: Option<String>,
}

/// Client for the remote profile-lookup service. A submission may
/// name a profile URL instead of a local image; the profile picture
/// then becomes the job's source image.
pub struct ProfileClient {
    http: reqwest::Client,
    cfg: ProfileConfig,
}

impl ProfileClient {
    pub fn new(cfg: ProfileConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            cfg,
        }
    }

    /// Look up a profile, preferring a recent cached result on the
    /// service side
    pub async fn lookup(&self, profile_url: &str) -> Result<ProfileInfo, ProfileError> {
        let response = self
            .http
            .get(&self.cfg.endpoint)
            .bearer_auth(&self.cfg.api_key)
            .query(&[
                ("linkedin_profile_url", profile_url),
                ("use_cache", "if-recent"),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ProfileError::Api(status.as_u16()));
        }

        let info: ProfileInfo = response.json().await?;
        info!(
            "Profile lookup for {}: name={:?}, picture={}",
            profile_url,
            info.display_name,
            info.image_url.is_some()
        );
        Ok(info)
    }

    /// Download the profile picture into the upload directory and
    /// return its local path
    pub async fn fetch_image(&self, info: &ProfileInfo, upload_dir: &Path) -> Result<PathBuf, ProfileError> {
        let image_url = info.image_url.as_deref().ok_or(ProfileError::NoImage)?;

        let response = self.http.get(image_url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ProfileError::Api(status.as_u16()));
        }
        let bytes = response.bytes().await?;

        let local = upload_dir.join(format!("profile_{}.jpg", Uuid::new_v4()));
        tokio::fs::write(&local, &bytes).await?;
        info!("Fetched profile image to {}", local.display());
        Ok(local)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer, endpoint_path: &str) -> ProfileClient {
        ProfileClient::new(ProfileConfig {
            endpoint: format!("{}{}", server.uri(), endpoint_path),
            api_key: "token".to_string(),
        })
    }

    #[tokio::test]
    async fn test_lookup_parses_profile_fields() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v2/linkedin"))
            .and(header("authorization", "Bearer token"))
            .and(query_param("linkedin_profile_url", "https://example.com/in/ada"))
            .and(query_param("use_cache", "if-recent"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "full_name": "Ada Lovelace",
                "profile_pic_url": "https://img.example/ada.jpg",
                "occupation": "Engineer"
            })))
            .mount(&server)
            .await;

        let client = client_for(&server, "/api/v2/linkedin");
        let info = client.lookup("https://example.com/in/ada").await.unwrap();
        assert_eq!(info.display_name.as_deref(), Some("Ada Lovelace"));
        assert_eq!(info.image_url.as_deref(), Some("https://img.example/ada.jpg"));
    }

    #[tokio::test]
    async fn test_lookup_non_200_is_api_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = client_for(&server, "/api/v2/linkedin");
        let err = client.lookup("https://example.com/in/nobody").await.unwrap_err();
        assert!(matches!(err, ProfileError::Api(404)));
    }

    #[tokio::test]
    async fn test_fetch_image_writes_to_upload_dir() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ada.jpg"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"jpegdata".to_vec()))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let client = client_for(&server, "/api/v2/linkedin");
        let info = ProfileInfo {
            image_url: Some(format!("{}/ada.jpg", server.uri())),
            display_name: Some("Ada".to_string()),
        };

        let local = client.fetch_image(&info, dir.path()).await.unwrap();
        assert!(local.starts_with(dir.path()));
        assert_eq!(std::fs::read(&local).unwrap(), b"jpegdata");
    }

    #[tokio::test]
    async fn test_fetch_image_without_picture_fails() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let client = client_for(&server, "/api/v2/linkedin");
        let info = ProfileInfo {
            image_url: None,
            display_name: None,
        };
        let err = client.fetch_image(&info, dir.path()).await.unwrap_err();
        assert!(matches!(err, ProfileError::NoImage));
    }
}
