//! Chat LLM client.
//!
//! One blocking-style operation: `invoke(prompt) → content`, over an
//! OpenAI-compatible chat-completions endpoint. The answer path uses the
//! configured model with a generous output-token ceiling so long roster
//! answers are not cut off; the temporal-intent path may use a smaller
//! model.

use anyhow::{anyhow, bail, Result};
use std::time::Duration;

use crate::config::LlmConfig;

#[derive(Clone)]
pub struct ChatClient {
    client: reqwest::Client,
    api_base: String,
    api_key: String,
    model: String,
    intent_model: String,
    max_tokens: u32,
    temperature: f64,
}

impl ChatClient {
    pub fn new(config: &LlmConfig, api_key: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: config.model.clone(),
            intent_model: config
                .intent_model
                .clone()
                .unwrap_or_else(|| config.model.clone()),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
        })
    }

    /// Answer-generation call with the full output budget.
    pub async fn invoke(&self, prompt: &str) -> Result<String> {
        self.call(&self.model, prompt, self.max_tokens).await
    }

    /// Short structured call used by the temporal-intent parser.
    pub async fn invoke_intent(&self, prompt: &str) -> Result<String> {
        self.call(&self.intent_model, prompt, 512).await
    }

    async fn call(&self, model: &str, prompt: &str, max_tokens: u32) -> Result<String> {
        let body = serde_json::json!({
            "model": model,
            "messages": [{"role": "user", "content": prompt}],
            "max_tokens": max_tokens,
            "temperature": self.temperature,
        });

        let response = self
            .client
            .post(format!("{}/chat/completions", self.api_base))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            bail!("chat API error {}: {}", status, detail);
        }

        let json: serde_json::Value = response.json().await?;
        json.get("choices")
            .and_then(|c| c.as_array())
            .and_then(|c| c.first())
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| anyhow!("chat response missing choices[0].message.content"))
    }
}
