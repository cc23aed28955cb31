//! static chat configuration, loaded once and handed to the orchestrator.

pub const DEFAULT_BASE_URL: &str = "https://api.siliconflow.cn";
pub const DEFAULT_MODEL: &str = "Qwen/Qwen2.5-7B-Instruct";

const CHAT_COMPLETIONS_PATH: &str = "/chat/completions";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChatConfig {
    /// sent as `Authorization: Bearer <api_key>`.
    pub api_key: String,
    /// openai-compatible base url, with or without the trailing `/v1`.
    pub base_url: String,
    /// model identifier, sent verbatim as the payload's `model` string.
    pub model: String,
    /// prepended to every payload as a `system` message, never stored in history.
    pub system_prompt: Option<String>,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            system_prompt: None,
        }
    }
}

impl ChatConfig {
    /// reads `OPENAI_API_KEY`, `LLM_BASE_URL`, `LLM_MODEL` and
    /// `LLM_SYSTEM_PROMPT`, falling back to defaults for unset values.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        Self {
            api_key: lookup("OPENAI_API_KEY").unwrap_or_default(),
            base_url: non_empty("LLM_BASE_URL").unwrap_or(defaults.base_url),
            model: non_empty("LLM_MODEL").unwrap_or(defaults.model),
            system_prompt: non_empty("LLM_SYSTEM_PROMPT"),
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = api_key.into();
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    /// full chat-completions url. the base is normalized to end in `/v1`
    /// unless it already names the completions endpoint.
    pub fn endpoint(&self) -> String {
        let base = self.base_url.trim().trim_end_matches('/');
        if base.ends_with(CHAT_COMPLETIONS_PATH) {
            return base.to_string();
        }
        if base.ends_with("/v1") {
            format!("{base}{CHAT_COMPLETIONS_PATH}")
        } else {
            format!("{base}/v1{CHAT_COMPLETIONS_PATH}")
        }
    }

    /// request headers for every completion call.
    pub fn headers(&self) -> Vec<(String, String)> {
        vec![
            ("Authorization".to_string(), format!("Bearer {}", self.api_key)),
            ("Content-Type".to_string(), "application/json".to_string()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    #[test]
    fn endpoint_normalizes_base() {
        let cfg = ChatConfig::default();
        assert_eq!(cfg.endpoint(), "https://api.siliconflow.cn/v1/chat/completions");

        let cfg = cfg.with_base_url("http://localhost:8080/v1/");
        assert_eq!(cfg.endpoint(), "http://localhost:8080/v1/chat/completions");

        let cfg = cfg.with_base_url("https://proxy.local/openai/v1/chat/completions");
        assert_eq!(cfg.endpoint(), "https://proxy.local/openai/v1/chat/completions");
    }

    #[test]
    fn headers_carry_bearer_token() {
        let cfg = ChatConfig::default().with_api_key("sk-test");
        assert_eq!(
            cfg.headers(),
            vec![
                ("Authorization".to_string(), "Bearer sk-test".to_string()),
                ("Content-Type".to_string(), "application/json".to_string()),
            ]
        );
    }

    #[test]
    fn lookup_falls_back_to_defaults() {
        let vars: HashMap<&str, &str> =
            HashMap::from([("OPENAI_API_KEY", "sk-env"), ("LLM_MODEL", "  ")]);
        let cfg = ChatConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(cfg.api_key, "sk-env");
        assert_eq!(cfg.model, DEFAULT_MODEL);
        assert_eq!(cfg.base_url, DEFAULT_BASE_URL);
        assert_eq!(cfg.system_prompt, None);
    }
}
