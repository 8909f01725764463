//! 调用方身份解析与匿名化

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// 匿名化后保留的十六进制字符数
const ANONYMIZED_LEN: usize = 16;

/// SHA-256 后取前 16 位十六进制；空输入返回空串
pub fn anonymize(value: &str) -> String {
    if value.is_empty() {
        return String::new();
    }
    let mut hasher = Sha256::new();
    hasher.update(value.as_bytes());
    let mut hex = format!("{:x}", hasher.finalize());
    hex.truncate(ANONYMIZED_LEN);
    hex
}

/// 账号信息分类
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountInfo {
    /// 例如 `api_key`、`oauth`、`email`
    pub kind: String,
    pub value: String,
}

/// 上游凭据的描述信息（由凭据管理层提供）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthInfo {
    pub id: String,
    pub index: String,
    pub provider: String,
    #[serde(default)]
    pub account: Option<AccountInfo>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
}

impl AuthInfo {
    fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

/// 解析用于统计的 source 标识
///
/// 优先级：provider 专属稳定标识 > 账号信息（api_key 类匿名化）>
/// 元数据 email > 匿名化的 api_key 属性 > 匿名化的调用方 key > 空串。
pub fn resolve_usage_source(auth: Option<&AuthInfo>, caller_api_key: &str) -> String {
    if let Some(auth) = auth {
        let provider = auth.provider.trim();
        if provider.eq_ignore_ascii_case("gemini-cli") {
            let id = auth.id.trim();
            if !id.is_empty() {
                return id.to_string();
            }
        }
        if provider.eq_ignore_ascii_case("vertex") {
            if let Some(project) = auth
                .metadata_str("project_id")
                .or_else(|| auth.metadata_str("project"))
            {
                return project.to_string();
            }
        }
        if let Some(account) = auth.account.as_ref().filter(|a| !a.value.is_empty()) {
            if account.kind == "api_key" {
                return anonymize(&account.value);
            }
            return account.value.trim().to_string();
        }
        if let Some(email) = auth.metadata_str("email") {
            return email.to_string();
        }
        if let Some(key) = auth
            .attributes
            .get("api_key")
            .map(|k| k.trim())
            .filter(|k| !k.is_empty())
        {
            return anonymize(key);
        }
    }

    let caller = caller_api_key.trim();
    if !caller.is_empty() {
        return anonymize(caller);
    }
    String::new()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn auth(provider: &str) -> AuthInfo {
        AuthInfo {
            id: "auth-1".into(),
            index: "0".into(),
            provider: provider.into(),
            ..Default::default()
        }
    }

    #[test]
    fn anonymize_is_deterministic_and_fixed_length() {
        assert_eq!(anonymize("abc"), "ba7816bf8f01cfea");
        assert_eq!(anonymize("abc"), anonymize("abc"));
        assert_eq!(anonymize("sk-very-long-secret-key-0123456789").len(), 16);
        assert_eq!(anonymize(""), "");
    }

    #[test]
    fn gemini_cli_uses_auth_id() {
        assert_eq!(resolve_usage_source(Some(&auth("gemini-cli")), "key"), "auth-1");
    }

    #[test]
    fn vertex_prefers_project_id_then_project() {
        let mut vertex = auth("vertex");
        vertex.metadata = json!({"project": "p2", "project_id": "  p1 "})
            .as_object()
            .cloned()
            .unwrap_or_default();
        assert_eq!(resolve_usage_source(Some(&vertex), ""), "p1");

        vertex.metadata.remove("project_id");
        assert_eq!(resolve_usage_source(Some(&vertex), ""), "p2");
    }

    #[test]
    fn account_info_is_anonymized_only_for_api_keys() {
        let mut a = auth("claude");
        a.account = Some(AccountInfo {
            kind: "api_key".into(),
            value: "abc".into(),
        });
        assert_eq!(resolve_usage_source(Some(&a), ""), "ba7816bf8f01cfea");

        a.account = Some(AccountInfo {
            kind: "oauth".into(),
            value: " user@example.com ".into(),
        });
        assert_eq!(resolve_usage_source(Some(&a), ""), "user@example.com");
    }

    #[test]
    fn falls_back_through_email_attribute_and_caller_key() {
        let mut a = auth("openai");
        a.metadata.insert("email".into(), json!("dev@example.com"));
        assert_eq!(resolve_usage_source(Some(&a), "caller"), "dev@example.com");

        a.metadata.clear();
        a.attributes.insert("api_key".into(), "abc".into());
        assert_eq!(resolve_usage_source(Some(&a), "caller"), "ba7816bf8f01cfea");

        a.attributes.clear();
        assert_eq!(resolve_usage_source(Some(&a), "abc"), "ba7816bf8f01cfea");
        assert_eq!(resolve_usage_source(None, "abc"), "ba7816bf8f01cfea");
        assert_eq!(resolve_usage_source(None, "   "), "");
    }
}
