use async_trait::async_trait;
use lightning_channel::watchtower::{PenaltyNotice, WatchTower, WatchTowerError};
use log::debug;
use reqwest::Client;
use url::Url;

/// Posts each penalty notice as JSON to `<url>/penalty`
#[derive(Clone, Debug)]
pub struct HttpWatchTower {
    client: Client,
    endpoint: String,
}

impl HttpWatchTower {
    pub fn new(url: &Url) -> Self {
        let endpoint = format!("{}/penalty", url.as_str().trim_end_matches('/'));
        HttpWatchTower { client: Client::new(), endpoint }
    }
}

#[async_trait]
impl WatchTower for HttpWatchTower {
    async fn notify(&self, notice: &PenaltyNotice) -> Result<(), WatchTowerError> {
        let res = self
            .client
            .post(&self.endpoint)
            .json(notice)
            .send()
            .await
            .map_err(|e| WatchTowerError::Unreachable(e.to_string()))?;
        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(WatchTowerError::Refused(format!("{} {}", status, body)));
        }
        debug!(
            "watch tower has penalty for {} commitment {}",
            notice.channel_id, notice.commitment_number
        );
        Ok(())
    }
}
