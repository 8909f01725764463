//! SSE 使用量过滤器
//!
//! 只让终止块携带 usageMetadata：非终止块中的 usageMetadata 被改名为
//! `proxyUsageMetadata`；"有 finishReason 但无 usage" 的块会被丢弃，其 traceId
//! 记入关联表，等待同一 traceId 下真正携带 usage 的块原样透传。
//!
//! 关联表在所有并发流之间共享，每个条目由一个一次性定时器在 TTL 后清除。

use std::borrow::Cow;
use std::collections::HashMap;
use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;

use crate::proxy::log_codes::flt;

/// 关联条目存活时间
pub const STOP_CHUNK_TTL: Duration = Duration::from_secs(10 * 60);

/// 非终止块中 usageMetadata 改名后的键
pub const SHADOW_USAGE_KEY: &str = "proxyUsageMetadata";

const USAGE_KEY: &str = "usageMetadata";
const FINISH_REASON_POINTERS: [&str; 2] = [
    "/candidates/0/finishReason",
    "/response/candidates/0/finishReason",
];

#[derive(Debug, Clone, Copy)]
struct Entry {
    expires_at: Instant,
    generation: u64,
}

type EntryMap = HashMap<String, Entry>;

fn read_entries(entries: &RwLock<EntryMap>) -> RwLockReadGuard<'_, EntryMap> {
    entries.read().unwrap_or_else(|e| {
        log::warn!("关联表锁已毒化，使用恢复值: {e}");
        e.into_inner()
    })
}

fn write_entries(entries: &RwLock<EntryMap>) -> RwLockWriteGuard<'_, EntryMap> {
    entries.write().unwrap_or_else(|e| {
        log::warn!("关联表锁已毒化，使用恢复值: {e}");
        e.into_inner()
    })
}

/// traceId 关联表
#[derive(Debug)]
pub struct CorrelationMemory {
    entries: Arc<RwLock<EntryMap>>,
    generation: AtomicU64,
    ttl: Duration,
}

impl Default for CorrelationMemory {
    fn default() -> Self {
        Self::new(STOP_CHUNK_TTL)
    }
}

impl CorrelationMemory {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            generation: AtomicU64::new(0),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// 记住一个 traceId，TTL 后自动清除
    pub fn remember(&self, trace_id: &str) {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let entry = Entry {
            expires_at: Instant::now() + self.ttl,
            generation,
        };

        let has_runtime = tokio::runtime::Handle::try_current().is_ok();
        {
            let mut guard = write_entries(&self.entries);
            if !has_runtime {
                // 没有运行时就没有定时器，写入时顺带清理过期条目
                let now = Instant::now();
                guard.retain(|_, e| e.expires_at > now);
            }
            guard.insert(trace_id.to_string(), entry);
        }

        if has_runtime {
            self.schedule_eviction(trace_id.to_string(), generation);
        }
    }

    fn schedule_eviction(&self, key: String, generation: u64) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let entries = Arc::downgrade(&self.entries);
        let ttl = self.ttl;
        handle.spawn(async move {
            tokio::time::sleep(ttl).await;
            let Some(entries) = entries.upgrade() else {
                return;
            };
            let mut guard = write_entries(&entries);
            // 同一 traceId 被再次记住时只有最新的定时器生效
            if guard.get(&key).is_some_and(|e| e.generation == generation) {
                guard.remove(&key);
            }
        });
    }

    /// 存在且未过期
    pub fn contains(&self, trace_id: &str) -> bool {
        let now = Instant::now();
        read_entries(&self.entries)
            .get(trace_id)
            .is_some_and(|e| e.expires_at > now)
    }

    /// 若存在则移除并返回 true
    pub fn take(&self, trace_id: &str) -> bool {
        if !read_entries(&self.entries).contains_key(trace_id) {
            return false;
        }
        let now = Instant::now();
        write_entries(&self.entries)
            .remove(trace_id)
            .is_some_and(|e| e.expires_at > now)
    }

    /// 当前未过期条目数
    pub fn len(&self) -> usize {
        let now = Instant::now();
        read_entries(&self.entries)
            .values()
            .filter(|e| e.expires_at > now)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    fn raw_len(&self) -> usize {
        read_entries(&self.entries).len()
    }
}

/// 单行处理结果
enum LineAction {
    Keep,
    Drop,
    Rewrite(Vec<u8>),
}

/// SSE 使用量过滤器
#[derive(Debug, Default)]
pub struct UsageFilter {
    memory: CorrelationMemory,
}

impl UsageFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_memory(memory: CorrelationMemory) -> Self {
        Self { memory }
    }

    pub fn memory(&self) -> &CorrelationMemory {
        &self.memory
    }

    /// 重写一段 SSE 负载
    ///
    /// 没有任何改动时返回借用的原始字节。没有 `data:` 行的负载按单个 JSON 文档处理，
    /// 这种情况下不会丢弃内容。
    pub fn filter<'a>(&self, payload: &'a [u8]) -> Cow<'a, [u8]> {
        if payload.is_empty() {
            return Cow::Borrowed(payload);
        }

        let mut out: Option<Vec<u8>> = None;
        let mut found_data = false;
        let mut start = 0usize;

        for line in payload.split(|b| *b == b'\n') {
            let line_start = start;
            start += line.len() + 1;
            let has_newline = start <= payload.len();

            let action = match data_index(line) {
                Some(data_idx) => {
                    found_data = true;
                    self.process_data_line(line, data_idx)
                }
                None => LineAction::Keep,
            };

            if out.is_none() && !matches!(action, LineAction::Keep) {
                out = Some(payload[..line_start].to_vec());
            }
            let Some(buf) = out.as_mut() else {
                continue;
            };
            match action {
                LineAction::Keep => {
                    buf.extend_from_slice(line);
                    if has_newline {
                        buf.push(b'\n');
                    }
                }
                LineAction::Drop => {}
                LineAction::Rewrite(bytes) => {
                    buf.extend_from_slice(&bytes);
                    if has_newline {
                        buf.push(b'\n');
                    }
                }
            }
        }

        if let Some(buf) = out {
            return Cow::Owned(buf);
        }
        if found_data {
            return Cow::Borrowed(payload);
        }

        // 无 data: 行，按原始 JSON 处理
        match self.apply_rule(payload.trim_ascii(), false) {
            LineAction::Rewrite(bytes) => Cow::Owned(bytes),
            LineAction::Keep | LineAction::Drop => Cow::Borrowed(payload),
        }
    }

    fn process_data_line(&self, line: &[u8], data_idx: usize) -> LineAction {
        let raw = line[data_idx + 5..].trim_ascii();
        match self.apply_rule(raw, true) {
            LineAction::Rewrite(json) => {
                let mut rebuilt = Vec::with_capacity(data_idx + 6 + json.len() + 1);
                rebuilt.extend_from_slice(&line[..data_idx]);
                rebuilt.extend_from_slice(b"data: ");
                rebuilt.extend_from_slice(&json);
                if line.ends_with(b"\r") {
                    rebuilt.push(b'\r');
                }
                LineAction::Rewrite(rebuilt)
            }
            other => other,
        }
    }

    fn apply_rule(&self, raw: &[u8], allow_drop: bool) -> LineAction {
        if raw.first() != Some(&b'{') {
            return LineAction::Keep;
        }
        // 快速路径：两个关键字都没有就不必解析
        if !contains(raw, USAGE_KEY.as_bytes()) && !contains(raw, b"finishReason") {
            return LineAction::Keep;
        }
        let root = match serde_json::from_slice::<Value>(raw) {
            Ok(root @ Value::Object(_)) => root,
            _ => return LineAction::Keep,
        };

        let terminal = is_terminal(&root);
        let has_usage = has_usage_metadata(&root);
        let trace_id = root
            .get("traceId")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty());

        if terminal && !has_usage {
            if let Some(trace_id) = trace_id {
                self.memory.remember(trace_id);
                log::debug!("[{}] 终止块缺少 usage，记住 traceId={trace_id}", flt::STOP_WITHOUT_USAGE);
                return if allow_drop {
                    LineAction::Drop
                } else {
                    LineAction::Keep
                };
            }
        }

        if has_usage {
            if let Some(trace_id) = trace_id {
                if self.memory.take(trace_id) {
                    log::debug!("[{}] traceId={trace_id} 的 usage 块原样透传", flt::CORRELATED_USAGE);
                    return LineAction::Keep;
                }
            }
        }

        if terminal || !has_usage {
            return LineAction::Keep;
        }

        match rename_usage(raw) {
            Some(json) => {
                log::debug!("[{}] 非终止块 usageMetadata 已改名", flt::USAGE_RENAMED);
                LineAction::Rewrite(json)
            }
            None => LineAction::Keep,
        }
    }
}

/// `data:` 行中 "data:" 的起始位置（允许前导空白）
fn data_index(line: &[u8]) -> Option<usize> {
    let lead = line.len() - line.trim_ascii_start().len();
    line[lead..].starts_with(b"data:").then_some(lead)
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

/// finishReason 存在且非空白
fn is_terminal(root: &Value) -> bool {
    FINISH_REASON_POINTERS
        .iter()
        .find_map(|p| root.pointer(p).filter(|v| !v.is_null()))
        .is_some_and(|reason| match reason.as_str() {
            Some(s) => !s.trim().is_empty(),
            None => true,
        })
}

fn has_usage_metadata(root: &Value) -> bool {
    ["/usageMetadata", "/response/usageMetadata"]
        .iter()
        .any(|p| root.pointer(p).is_some_and(|v| !v.is_null()))
}

/// 跳过字符串，`raw[i]` 必须是 `"`，返回闭合引号之后的位置
fn string_end(raw: &[u8], i: usize) -> Option<usize> {
    let mut j = i + 1;
    while j < raw.len() {
        match raw[j] {
            b'\\' => j += 2,
            b'"' => return Some(j + 1),
            _ => j += 1,
        }
    }
    None
}

/// 跳过一个 JSON 值，返回其后的位置
fn value_end(raw: &[u8], i: usize) -> Option<usize> {
    match raw.get(i)? {
        b'"' => string_end(raw, i),
        b'{' | b'[' => {
            let mut depth = 0usize;
            let mut j = i;
            while j < raw.len() {
                match raw[j] {
                    b'"' => {
                        j = string_end(raw, j)?;
                        continue;
                    }
                    b'{' | b'[' => depth += 1,
                    b'}' | b']' => {
                        depth -= 1;
                        if depth == 0 {
                            return Some(j + 1);
                        }
                    }
                    _ => {}
                }
                j += 1;
            }
            None
        }
        _ => {
            let len = raw[i..]
                .iter()
                .position(|b| matches!(b, b',' | b'}' | b']') || b.is_ascii_whitespace())
                .unwrap_or(raw.len() - i);
            Some(i + len)
        }
    }
}

fn skip_ws(raw: &[u8], mut i: usize) -> usize {
    while raw.get(i).is_some_and(u8::is_ascii_whitespace) {
        i += 1;
    }
    i
}

/// 对象的直接成员：(键的字节区间, 值的起始位置)，`raw[start]` 必须是 `{`
fn object_members(raw: &[u8], start: usize) -> Option<Vec<(Range<usize>, usize)>> {
    let mut members = Vec::new();
    let mut i = skip_ws(raw, start + 1);
    if raw.get(i) == Some(&b'}') {
        return Some(members);
    }
    loop {
        if raw.get(i) != Some(&b'"') {
            return None;
        }
        let key_end = string_end(raw, i)?;
        let colon = skip_ws(raw, key_end);
        if raw.get(colon) != Some(&b':') {
            return None;
        }
        let value_start = skip_ws(raw, colon + 1);
        members.push((i..key_end, value_start));
        i = skip_ws(raw, value_end(raw, value_start)?);
        match raw.get(i)? {
            b',' => i = skip_ws(raw, i + 1),
            b'}' => return Some(members),
            _ => return None,
        }
    }
}

fn key_is(raw: &[u8], key: &Range<usize>, name: &str) -> bool {
    raw[key.start + 1..key.end - 1] == *name.as_bytes()
}

/// 非 null 的 usageMetadata 键区间
fn usage_key_spans(raw: &[u8], start: usize, spans: &mut Vec<Range<usize>>) -> Option<()> {
    for (key, value_start) in object_members(raw, start)? {
        if key_is(raw, &key, USAGE_KEY) && !raw[value_start..].starts_with(b"null") {
            spans.push(key);
        } else if key_is(raw, &key, "response") && raw.get(value_start) == Some(&b'{') {
            usage_key_spans(raw, value_start, spans)?;
        }
    }
    Some(())
}

/// 在原始字节上把 usageMetadata 键改名为影子键，其余字节保持不变
fn rename_usage(raw: &[u8]) -> Option<Vec<u8>> {
    let mut spans = Vec::new();
    usage_key_spans(raw, 0, &mut spans)?;
    if spans.is_empty() {
        return None;
    }
    spans.sort_by_key(|span| span.start);

    let shadow = format!("\"{SHADOW_USAGE_KEY}\"");
    let mut out = Vec::with_capacity(raw.len() + spans.len() * 5);
    let mut cursor = 0;
    for span in spans {
        out.extend_from_slice(&raw[cursor..span.start]);
        out.extend_from_slice(shadow.as_bytes());
        cursor = span.end;
    }
    out.extend_from_slice(&raw[cursor..]);
    Some(out)
}
