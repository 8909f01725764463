//! Response Parser - 从上游响应中提取 token 使用量
//!
//! 每种上游格式用一张"形状表"描述：usage 节点的候选位置，
//! 以及每个 token 字段的候选路径（按顺序，命中第一个存在的路径）。
//!
//! 支持的格式：
//! - OpenAI（chat completions / responses）
//! - Codex（`response.usage`）
//! - Claude
//! - Gemini / Vertex
//! - Gemini CLI
//! - Antigravity
//!
//! 解析失败一律视为"未找到"，不会返回错误。

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 规范化后的 token 使用量
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UsageDetail {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub reasoning_tokens: u64,
    #[serde(default)]
    pub cached_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

impl UsageDetail {
    /// 补全 total_tokens
    ///
    /// total 为 0 时取 input + output + reasoning；仍为 0 时再计入 cached。
    /// 对已补全的值重复调用不会改变结果。
    pub fn normalized(mut self) -> Self {
        if self.total_tokens == 0 {
            self.total_tokens = self
                .input_tokens
                .saturating_add(self.output_tokens)
                .saturating_add(self.reasoning_tokens);
        }
        if self.total_tokens == 0 {
            self.total_tokens = self.cached_tokens;
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// 合并同一流中先后出现的两次 usage
    ///
    /// Claude 在 message_start 给出输入、在 message_delta 给出输出，
    /// 各字段取较大值；total 不小于 input + output。
    pub fn merge(self, next: Self) -> Self {
        let input_tokens = self.input_tokens.max(next.input_tokens);
        let output_tokens = self.output_tokens.max(next.output_tokens);
        Self {
            input_tokens,
            output_tokens,
            reasoning_tokens: self.reasoning_tokens.max(next.reasoning_tokens),
            cached_tokens: self.cached_tokens.max(next.cached_tokens),
            total_tokens: self
                .total_tokens
                .max(next.total_tokens)
                .max(input_tokens.saturating_add(output_tokens)),
        }
        .normalized()
    }
}

/// 上游线协议格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WireFormat {
    OpenAi,
    Codex,
    Claude,
    Gemini,
    GeminiCli,
    Antigravity,
    Vertex,
}

impl WireFormat {
    /// 根据 provider 名称推断格式
    pub fn from_provider(provider: &str) -> Option<Self> {
        match provider.trim().to_ascii_lowercase().as_str() {
            "openai" | "openai-compatibility" | "openrouter" | "qwen" | "iflow" => {
                Some(Self::OpenAi)
            }
            "codex" => Some(Self::Codex),
            "claude" | "anthropic" => Some(Self::Claude),
            "gemini" | "aistudio" => Some(Self::Gemini),
            "gemini-cli" => Some(Self::GeminiCli),
            "antigravity" => Some(Self::Antigravity),
            "vertex" => Some(Self::Vertex),
            _ => None,
        }
    }

    fn shape(self) -> &'static UsageShape {
        match self {
            Self::OpenAi => &OPENAI_SHAPE,
            Self::Codex => &CODEX_SHAPE,
            Self::Claude => &CLAUDE_SHAPE,
            Self::Gemini | Self::Vertex => &GEMINI_SHAPE,
            Self::GeminiCli => &GEMINI_CLI_SHAPE,
            Self::Antigravity => &ANTIGRAVITY_SHAPE,
        }
    }
}

/// cached 字段的取值规则
#[derive(Debug, Clone, Copy)]
enum CachedRule {
    /// 第一个存在的路径
    FirstPresent,
    /// 第一个非零值（Claude: cache_read 为 0 时回退到 cache_creation）
    FirstNonZero,
}

/// total 字段的取值规则
#[derive(Debug, Clone, Copy)]
enum TotalRule {
    /// 使用上游声明值，为 0 时推导
    Declared,
    /// 恒为 input + output
    InputPlusOutput,
}

/// 一种上游格式的 usage 布局（JSON Pointer，相对于 usage 节点）
struct UsageShape {
    nodes: &'static [&'static str],
    input: &'static [&'static str],
    output: &'static [&'static str],
    reasoning: &'static [&'static str],
    cached: &'static [&'static str],
    total: &'static [&'static str],
    cached_rule: CachedRule,
    total_rule: TotalRule,
}

const OPENAI_SHAPE: UsageShape = UsageShape {
    nodes: &["/usage"],
    input: &["/prompt_tokens", "/input_tokens"],
    output: &["/completion_tokens", "/output_tokens"],
    reasoning: &[
        "/completion_tokens_details/reasoning_tokens",
        "/output_tokens_details/reasoning_tokens",
    ],
    cached: &[
        "/prompt_tokens_details/cached_tokens",
        "/input_tokens_details/cached_tokens",
    ],
    total: &["/total_tokens"],
    cached_rule: CachedRule::FirstPresent,
    total_rule: TotalRule::Declared,
};

const CODEX_SHAPE: UsageShape = UsageShape {
    nodes: &["/response/usage"],
    input: &["/input_tokens"],
    output: &["/output_tokens"],
    reasoning: &["/output_tokens_details/reasoning_tokens"],
    cached: &["/input_tokens_details/cached_tokens"],
    total: &["/total_tokens"],
    cached_rule: CachedRule::FirstPresent,
    total_rule: TotalRule::Declared,
};

const CLAUDE_SHAPE: UsageShape = UsageShape {
    nodes: &["/usage", "/message/usage"],
    input: &["/input_tokens"],
    output: &["/output_tokens"],
    reasoning: &[],
    cached: &["/cache_read_input_tokens", "/cache_creation_input_tokens"],
    total: &[],
    cached_rule: CachedRule::FirstNonZero,
    total_rule: TotalRule::InputPlusOutput,
};

const GEMINI_SHAPE: UsageShape = UsageShape {
    nodes: &["/usageMetadata", "/usage_metadata"],
    input: &["/promptTokenCount"],
    output: &["/candidatesTokenCount"],
    reasoning: &["/thoughtsTokenCount"],
    cached: &["/cachedContentTokenCount"],
    total: &["/totalTokenCount"],
    cached_rule: CachedRule::FirstPresent,
    total_rule: TotalRule::Declared,
};

const GEMINI_CLI_SHAPE: UsageShape = UsageShape {
    nodes: &[
        "/response/usageMetadata",
        "/response/usage_metadata",
        "/usage_metadata",
    ],
    ..GEMINI_SHAPE
};

const ANTIGRAVITY_SHAPE: UsageShape = UsageShape {
    nodes: &["/response/usageMetadata", "/usageMetadata", "/usage_metadata"],
    ..GEMINI_SHAPE
};

/// 读取为非负整数；浮点数截断，负数与非数字视为不存在
fn as_count(value: &Value) -> Option<u64> {
    value
        .as_u64()
        .or_else(|| value.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
}

fn first_present(node: &Value, paths: &[&str]) -> u64 {
    paths
        .iter()
        .find_map(|p| node.pointer(p).filter(|v| !v.is_null()))
        .and_then(as_count)
        .unwrap_or(0)
}

fn first_non_zero(node: &Value, paths: &[&str]) -> u64 {
    paths
        .iter()
        .filter_map(|p| node.pointer(p).and_then(as_count))
        .find(|v| *v > 0)
        .unwrap_or(0)
}

impl UsageShape {
    fn locate<'a>(&self, root: &'a Value) -> Option<&'a Value> {
        self.nodes
            .iter()
            .find_map(|p| root.pointer(p).filter(|v| !v.is_null()))
    }

    fn extract(&self, node: &Value) -> UsageDetail {
        let input_tokens = first_present(node, self.input);
        let output_tokens = first_present(node, self.output);
        let reasoning_tokens = first_present(node, self.reasoning);
        let cached_tokens = match self.cached_rule {
            CachedRule::FirstPresent => first_present(node, self.cached),
            CachedRule::FirstNonZero => first_non_zero(node, self.cached),
        };
        let total_tokens = match self.total_rule {
            TotalRule::Declared => match first_present(node, self.total) {
                0 => input_tokens
                    .saturating_add(output_tokens)
                    .saturating_add(reasoning_tokens),
                declared => declared,
            },
            TotalRule::InputPlusOutput => input_tokens.saturating_add(output_tokens),
        };
        UsageDetail {
            input_tokens,
            output_tokens,
            reasoning_tokens,
            cached_tokens,
            total_tokens,
        }
    }
}

/// 从已解析的 JSON 文档中提取使用量
pub fn usage_from_value(format: WireFormat, root: &Value) -> Option<UsageDetail> {
    let shape = format.shape();
    let node = shape.locate(root)?;
    Some(shape.extract(node))
}

/// 解析非流式响应体
pub fn parse_usage(format: WireFormat, body: &[u8]) -> Option<UsageDetail> {
    let root: Value = serde_json::from_slice(body).ok()?;
    usage_from_value(format, &root)
}

/// 解析单行 SSE 数据
///
/// 容忍 `data:` 前缀、`[DONE]` 结束标记和 `event:` 等非数据行。
pub fn parse_stream_usage(format: WireFormat, line: &[u8]) -> Option<UsageDetail> {
    let payload = json_payload(line)?;
    parse_usage(format, payload)
}

/// 从一行 SSE 中取出 JSON 负载
pub fn json_payload(line: &[u8]) -> Option<&[u8]> {
    let mut trimmed = line.trim_ascii();
    if trimmed.is_empty() || trimmed == b"[DONE]" || trimmed.starts_with(b"event:") {
        return None;
    }
    if let Some(rest) = trimmed.strip_prefix(b"data:") {
        trimmed = rest.trim_ascii();
    }
    if trimmed.first() != Some(&b'{') {
        return None;
    }
    Some(trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(format: WireFormat, value: Value) -> Option<UsageDetail> {
        parse_usage(format, value.to_string().as_bytes())
    }

    #[test]
    fn test_merge_keeps_fields_from_both_events() {
        let start = UsageDetail {
            input_tokens: 25,
            output_tokens: 1,
            total_tokens: 26,
            ..Default::default()
        };
        let delta = UsageDetail {
            output_tokens: 15,
            total_tokens: 15,
            ..Default::default()
        };
        let merged = start.merge(delta);
        assert_eq!(
            (merged.input_tokens, merged.output_tokens, merged.total_tokens),
            (25, 15, 40)
        );

        let declared = UsageDetail {
            input_tokens: 3,
            output_tokens: 2,
            reasoning_tokens: 4,
            total_tokens: 9,
            ..Default::default()
        };
        assert_eq!(declared.merge(declared), declared);
    }

    #[test]
    fn test_openai_chat_usage() {
        let detail = parse(
            WireFormat::OpenAi,
            json!({"usage": {"prompt_tokens": 1, "completion_tokens": 2}}),
        )
        .expect("usage");
        assert_eq!(detail.input_tokens, 1);
        assert_eq!(detail.output_tokens, 2);
        assert_eq!(detail.total_tokens, 3);
    }

    #[test]
    fn test_openai_declared_total_and_details() {
        let detail = parse(
            WireFormat::OpenAi,
            json!({"usage": {
                "prompt_tokens": 100,
                "completion_tokens": 50,
                "total_tokens": 170,
                "prompt_tokens_details": {"cached_tokens": 40},
                "completion_tokens_details": {"reasoning_tokens": 20}
            }}),
        )
        .expect("usage");
        assert_eq!(detail.total_tokens, 170);
        assert_eq!(detail.cached_tokens, 40);
        assert_eq!(detail.reasoning_tokens, 20);
    }

    #[test]
    fn test_openai_responses_fallback_fields() {
        let detail = parse(
            WireFormat::OpenAi,
            json!({"usage": {
                "input_tokens": 10,
                "output_tokens": 5,
                "input_tokens_details": {"cached_tokens": 2},
                "output_tokens_details": {"reasoning_tokens": 3}
            }}),
        )
        .expect("usage");
        assert_eq!(detail.input_tokens, 10);
        assert_eq!(detail.output_tokens, 5);
        assert_eq!(detail.cached_tokens, 2);
        assert_eq!(detail.reasoning_tokens, 3);
        assert_eq!(detail.total_tokens, 18);
    }

    #[test]
    fn test_openai_null_usage_is_not_found() {
        assert!(parse(WireFormat::OpenAi, json!({"usage": null, "choices": []})).is_none());
        assert!(parse(WireFormat::OpenAi, json!({"choices": []})).is_none());
    }

    #[test]
    fn test_codex_usage() {
        let detail = parse(
            WireFormat::Codex,
            json!({"type": "response.completed", "response": {"usage": {
                "input_tokens": 20,
                "output_tokens": 10,
                "total_tokens": 30,
                "input_tokens_details": {"cached_tokens": 5},
                "output_tokens_details": {"reasoning_tokens": 4}
            }}}),
        )
        .expect("usage");
        assert_eq!(detail.total_tokens, 30);
        assert_eq!(detail.cached_tokens, 5);
        assert_eq!(detail.reasoning_tokens, 4);

        assert!(parse(WireFormat::Codex, json!({"usage": {"input_tokens": 1}})).is_none());
    }

    #[test]
    fn test_claude_cached_falls_back_to_creation() {
        let detail = parse(
            WireFormat::Claude,
            json!({"usage": {
                "input_tokens": 7,
                "output_tokens": 3,
                "cache_read_input_tokens": 0,
                "cache_creation_input_tokens": 12
            }}),
        )
        .expect("usage");
        assert_eq!(detail.cached_tokens, 12);
        // Claude 的 total 恒为 input + output
        assert_eq!(detail.total_tokens, 10);

        let read = parse(
            WireFormat::Claude,
            json!({"usage": {"input_tokens": 1, "output_tokens": 1, "cache_read_input_tokens": 4, "cache_creation_input_tokens": 9}}),
        )
        .expect("usage");
        assert_eq!(read.cached_tokens, 4);
    }

    #[test]
    fn test_gemini_usage_and_snake_case_node() {
        let detail = parse(
            WireFormat::Gemini,
            json!({"usageMetadata": {
                "promptTokenCount": 8,
                "candidatesTokenCount": 4,
                "thoughtsTokenCount": 2,
                "cachedContentTokenCount": 1
            }}),
        )
        .expect("usage");
        assert_eq!(detail.reasoning_tokens, 2);
        assert_eq!(detail.cached_tokens, 1);
        assert_eq!(detail.total_tokens, 14);

        let snake = parse(
            WireFormat::Vertex,
            json!({"usage_metadata": {"promptTokenCount": 1, "candidatesTokenCount": 1, "totalTokenCount": 9}}),
        )
        .expect("usage");
        assert_eq!(snake.total_tokens, 9);
    }

    #[test]
    fn test_gemini_cli_and_antigravity_wrappers() {
        let wrapped = json!({"response": {"usageMetadata": {"promptTokenCount": 3, "candidatesTokenCount": 2}}});
        assert_eq!(
            parse(WireFormat::GeminiCli, wrapped.clone()).map(|d| d.total_tokens),
            Some(5)
        );
        assert_eq!(
            parse(WireFormat::Antigravity, wrapped.clone()).map(|d| d.total_tokens),
            Some(5)
        );
        // Gemini 只看顶层
        assert!(parse(WireFormat::Gemini, wrapped).is_none());

        let top = json!({"usageMetadata": {"promptTokenCount": 1}});
        assert!(parse(WireFormat::GeminiCli, top.clone()).is_none());
        assert!(parse(WireFormat::Antigravity, top).is_some());
    }

    #[test]
    fn test_malformed_json_is_not_found() {
        assert!(parse_usage(WireFormat::OpenAi, b"{not json").is_none());
        assert!(parse_usage(WireFormat::Claude, b"").is_none());
    }

    #[test]
    fn test_stream_line_handling() {
        let line = br#"data: {"usage":{"prompt_tokens":2,"completion_tokens":3}}"#;
        assert_eq!(
            parse_stream_usage(WireFormat::OpenAi, line).map(|d| d.total_tokens),
            Some(5)
        );
        assert!(parse_stream_usage(WireFormat::OpenAi, b"data: [DONE]").is_none());
        assert!(parse_stream_usage(WireFormat::OpenAi, b"[DONE]").is_none());
        assert!(parse_stream_usage(WireFormat::Claude, b"event: message_delta").is_none());
        assert!(parse_stream_usage(WireFormat::Claude, b": keep-alive").is_none());
        assert!(parse_stream_usage(WireFormat::Claude, b"   ").is_none());
    }

    #[test]
    fn test_normalized_is_idempotent() {
        let detail = UsageDetail {
            input_tokens: 3,
            output_tokens: 4,
            reasoning_tokens: 5,
            ..Default::default()
        }
        .normalized();
        assert_eq!(detail.total_tokens, 12);
        assert_eq!(detail.normalized(), detail);

        let cached_only = UsageDetail {
            cached_tokens: 6,
            ..Default::default()
        }
        .normalized();
        assert_eq!(cached_only.total_tokens, 6);

        let declared = UsageDetail {
            input_tokens: 1,
            total_tokens: 100,
            ..Default::default()
        };
        assert_eq!(declared.normalized().total_tokens, 100);
    }

    #[test]
    fn test_wire_format_from_provider() {
        assert_eq!(WireFormat::from_provider("Gemini-CLI"), Some(WireFormat::GeminiCli));
        assert_eq!(WireFormat::from_provider("aistudio"), Some(WireFormat::Gemini));
        assert_eq!(WireFormat::from_provider("anthropic"), Some(WireFormat::Claude));
        assert_eq!(WireFormat::from_provider("mystery"), None);
    }
}
