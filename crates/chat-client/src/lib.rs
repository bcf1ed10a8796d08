use anyhow::Result;
use reqwest::Client;
use serde::{Deserialize, Serialize};

#[derive(Clone)]
pub struct Mattermost {
    client: Client,
    base_url: String,
    token: String,
    pub bot_user_id: String,
}

#[derive(Deserialize)]
struct UserResponse {
    id: String,
}

#[derive(Deserialize)]
struct PostResponse {
    id: String,
}

#[derive(Serialize)]
struct PostRequest<'a> {
    channel_id: &'a str,
    message: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    root_id: Option<&'a str>,
}

impl Mattermost {
    pub async fn new(url: &str, token: &str) -> Result<Self> {
        let client = Client::builder().build()?;
        let base_url = format!("{}/api/v4", url);

        let resp: UserResponse = client
            .get(format!("{}/users/me", base_url))
            .header("Authorization", format!("Bearer {}", token))
            .send()
            .await?
            .json()
            .await?;

        Ok(Self {
            client,
            base_url,
            token: token.to_string(),
            bot_user_id: resp.id,
        })
    }

    fn auth_header(&self) -> String {
        format!("Bearer {}", self.token)
    }

    /// Post a message to a channel, returns the post ID. A fresh thread
    /// anchor on the first ask attempt.
    pub async fn post(&self, channel_id: &str, message: &str) -> Result<String> {
        let resp: PostResponse = self
            .client
            .post(format!("{}/posts", self.base_url))
            .header("Authorization", self.auth_header())
            .json(&PostRequest { channel_id, message, root_id: None })
            .send()
            .await?
            .json()
            .await?;

        Ok(resp.id)
    }

    /// Post a reply in a thread, returns post ID. Used for ask retries.
    pub async fn post_in_thread(&self, channel_id: &str, root_id: &str, message: &str) -> Result<String> {
        let resp: PostResponse = self
            .client
            .post(format!("{}/posts", self.base_url))
            .header("Authorization", self.auth_header())
            .json(&PostRequest { channel_id, message, root_id: Some(root_id) })
            .send()
            .await?
            .json()
            .await?;

        Ok(resp.id)
    }
}
