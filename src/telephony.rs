//! Telephony provider REST client.
//!
//! Thin form-encoded calls against the provider's account-scoped API: end or
//! redirect live calls, play DTMF, send SMS, and place outbound calls that
//! connect a media stream back to this server. Everything except SMS (whose
//! returned id is persisted) is fire-and-forget with logged errors at the
//! call sites.

use anyhow::{bail, Context, Result};
use serde_json::Value;

use crate::config::TelephonyConfig;

pub struct TelephonyClient {
    http: reqwest::Client,
    base_url: String,
    account_sid: String,
    auth_token: String,
}

impl TelephonyClient {
    pub fn new(config: &TelephonyConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            account_sid: config.account_sid.clone(),
            auth_token: config.auth_token.clone(),
        }
    }

    /// End a live call.
    pub async fn hang_up(&self, call_sid: &str) -> Result<()> {
        self.update_call(call_sid, &[("Status", "completed")]).await
    }

    /// Redirect a live call to another number instead of hanging up.
    pub async fn transfer(&self, call_sid: &str, to_number: &str) -> Result<()> {
        let twiml = format!("<Response><Dial><Number>{to_number}</Number></Dial></Response>");
        self.update_call(call_sid, &[("Twiml", &twiml)]).await
    }

    /// Play DTMF digits on a live call.
    pub async fn send_dtmf(&self, call_sid: &str, digits: &str) -> Result<()> {
        let twiml = format!(r#"<Response><Play digits="{digits}" /></Response>"#);
        self.update_call(call_sid, &[("Twiml", &twiml)]).await
    }

    /// Send an SMS; returns the provider message sid.
    pub async fn send_sms(
        &self,
        from_number: &str,
        to_number: &str,
        body: &str,
        status_callback: &str,
    ) -> Result<String> {
        let url = format!(
            "{}/2010-04-01/Accounts/{}/Messages.json",
            self.base_url, self.account_sid
        );
        let payload = self
            .post_form(
                &url,
                &[
                    ("From", from_number),
                    ("To", to_number),
                    ("Body", body),
                    ("StatusCallback", status_callback),
                ],
            )
            .await?;
        payload["sid"]
            .as_str()
            .map(str::to_string)
            .context("Message response missing sid")
    }

    /// Place an outbound call whose answer leg opens a media stream against
    /// `stream_url`. Returns the provider call sid.
    pub async fn start_call(
        &self,
        to_number: &str,
        from_number: &str,
        stream_url: &str,
        status_callback: &str,
    ) -> Result<String> {
        let twiml = format!(
            r#"<?xml version="1.0" encoding="UTF-8"?><Response><Connect><Stream url="{stream_url}" /></Connect></Response>"#
        );
        let url = format!(
            "{}/2010-04-01/Accounts/{}/Calls.json",
            self.base_url, self.account_sid
        );
        let payload = self
            .post_form(
                &url,
                &[
                    ("To", to_number),
                    ("From", from_number),
                    ("Twiml", &twiml),
                    ("StatusCallback", status_callback),
                    ("StatusCallbackEvent", "initiated ringing answered completed"),
                ],
            )
            .await?;
        payload["sid"]
            .as_str()
            .map(str::to_string)
            .context("Call response missing sid")
    }

    async fn update_call(&self, call_sid: &str, form: &[(&str, &str)]) -> Result<()> {
        let url = format!(
            "{}/2010-04-01/Accounts/{}/Calls/{}.json",
            self.base_url, self.account_sid, call_sid
        );
        self.post_form(&url, form).await.map(|_| ())
    }

    async fn post_form(&self, url: &str, form: &[(&str, &str)]) -> Result<Value> {
        let response = self
            .http
            .post(url)
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(form)
            .send()
            .await
            .context("Provider request failed")?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            bail!("Provider returned {status}: {text}");
        }
        response
            .json()
            .await
            .context("Provider returned invalid JSON")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_construction() {
        let client = TelephonyClient::new(&TelephonyConfig {
            base_url: "https://api.example.com/".to_string(),
            account_sid: "AC123".to_string(),
            auth_token: "secret".to_string(),
            from_number: "+15550100".to_string(),
            webhook_secret: None,
        });
        assert_eq!(client.base_url, "https://api.example.com");
    }
}
