//! 对话模型：消息、工具调用与双视图历史
//!
//! Message 的序列化格式与 OpenAI 兼容 chat 接口一致（role / content / tool_calls / tool_call_id）。
//! Conversation 同时维护「可见」与「完整」两条只追加的历史；任务 system 消息的位置作为显式边界记录，
//! 集成模式据此裁掉注入的示例上下文，而不是按角色扫描。

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Deserializer, Serialize};

/// 消息角色（与 LLM API 一致）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
}

/// 结构化内容片段：文本或图片引用
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

/// 消息内容：纯文本，或文本 + 图片的片段列表
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    /// 拼接所有文本片段
    pub fn as_text(&self) -> String {
        match self {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    ContentPart::ImageUrl { .. } => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    /// 对每段文本做变换，图片片段原样保留
    pub fn map_text(&self, f: impl Fn(&str) -> String) -> Self {
        match self {
            MessageContent::Text(text) => MessageContent::Text(f(text)),
            MessageContent::Parts(parts) => MessageContent::Parts(
                parts
                    .iter()
                    .map(|p| match p {
                        ContentPart::Text { text } => ContentPart::Text { text: f(text) },
                        other => other.clone(),
                    })
                    .collect(),
            ),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    /// 模型给出的 JSON 字符串，原样保存，执行前再解析
    #[serde(default)]
    pub arguments: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type", default = "function_kind")]
    pub kind: String,
    pub function: FunctionCall,
}

fn function_kind() -> String {
    "function".to_string()
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: function_kind(),
            function: FunctionCall {
                name: name.into(),
                arguments: arguments.into(),
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.function.name
    }
}

/// 单条消息
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<MessageContent>,
    #[serde(
        default,
        skip_serializing_if = "Vec::is_empty",
        deserialize_with = "null_as_empty"
    )]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<Vec<ToolCall>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<ToolCall>>::deserialize(deserializer)?.unwrap_or_default())
}

impl Message {
    fn with_text(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: Some(MessageContent::Text(content.into())),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::with_text(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::with_text(Role::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::with_text(Role::System, content)
    }

    pub fn assistant_with_tool_calls(content: Option<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.map(MessageContent::Text),
            tool_calls,
            tool_call_id: None,
        }
    }

    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: Some(MessageContent::Text(content.into())),
            tool_calls: Vec::new(),
            tool_call_id: Some(tool_call_id.into()),
        }
    }

    /// 带图片的 user 消息（url 可以是 http(s) 地址或 data URI）
    pub fn user_with_image(text: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: Some(MessageContent::Parts(vec![
                ContentPart::Text { text: text.into() },
                ContentPart::ImageUrl {
                    image_url: ImageUrl { url: url.into() },
                },
            ])),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    /// 文本内容；无内容时为空串
    pub fn content_text(&self) -> String {
        self.content.as_ref().map(|c| c.as_text()).unwrap_or_default()
    }
}

/// 一条推理线的对话：visible 只含推理过程，full 额外含注入的示例、任务 system 消息与图片
#[derive(Clone, Debug, Default)]
pub struct Conversation {
    visible: Vec<Message>,
    full: Vec<Message>,
    boundary: Option<usize>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    /// 仅追加到完整历史（示例链、图片等注入上下文）
    pub fn push_context(&mut self, msg: Message) {
        self.full.push(msg);
    }

    /// 追加任务 system 消息并记为边界
    pub fn begin_task(&mut self, system: Message) {
        self.boundary = Some(self.full.len());
        self.full.push(system);
    }

    /// 两条历史同步追加
    pub fn push(&mut self, msg: Message) {
        self.visible.push(msg.clone());
        self.full.push(msg);
    }

    pub fn visible(&self) -> &[Message] {
        &self.visible
    }

    pub fn full(&self) -> &[Message] {
        &self.full
    }

    pub fn boundary(&self) -> Option<usize> {
        self.boundary
    }

    /// 从任务 system 消息开始的历史（不含之前注入的示例）
    pub fn transcript(&self) -> &[Message] {
        let start = self.boundary.unwrap_or(0).min(self.full.len());
        &self.full[start..]
    }
}

/// 修复工具调用配对，返回修复后的副本（原对话保持只追加）
///
/// - 没有得到 tool 回复的 assistant tool call 转为文本 `Tool call: name(args)`；
/// - 找不到尚未回复的 tool call 的 tool 消息（孤立或重复回复）转为 user 文本 `Tool result: ...`。
///
/// 修复结果已满足配对约束，再次修复不会产生变化。
pub fn repair_tool_pairing(messages: &[Message]) -> Vec<Message> {
    let mut pending: HashMap<&str, (usize, usize)> = HashMap::new();
    let mut answered: HashSet<(usize, usize)> = HashSet::new();
    let mut orphans: HashSet<usize> = HashSet::new();

    for (i, msg) in messages.iter().enumerate() {
        match msg.role {
            Role::Assistant => {
                for (j, call) in msg.tool_calls.iter().enumerate() {
                    pending.insert(call.id.as_str(), (i, j));
                }
            }
            Role::Tool => match msg.tool_call_id.as_deref().and_then(|id| pending.remove(id)) {
                Some(position) => {
                    answered.insert(position);
                }
                None => {
                    orphans.insert(i);
                }
            },
            _ => {}
        }
    }

    messages
        .iter()
        .enumerate()
        .map(|(i, msg)| {
            if orphans.contains(&i) {
                return Message::user(format!("Tool result: {}", msg.content_text()));
            }
            if msg.role != Role::Assistant || msg.tool_calls.is_empty() {
                return msg.clone();
            }
            let unmatched: Vec<&ToolCall> = msg
                .tool_calls
                .iter()
                .enumerate()
                .filter(|(j, _)| !answered.contains(&(i, *j)))
                .map(|(_, c)| c)
                .collect();
            if unmatched.is_empty() {
                return msg.clone();
            }

            let mut text = msg.content_text();
            for call in &unmatched {
                if !text.is_empty() {
                    text.push('\n');
                }
                text.push_str(&format!(
                    "Tool call: {}({})",
                    call.function.name, call.function.arguments
                ));
            }
            let kept = msg
                .tool_calls
                .iter()
                .enumerate()
                .filter(|(j, _)| answered.contains(&(i, *j)))
                .map(|(_, c)| c.clone())
                .collect();
            Message {
                role: Role::Assistant,
                content: Some(MessageContent::Text(text)),
                tool_calls: kept,
                tool_call_id: None,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairing_holds(messages: &[Message]) -> bool {
        let mut pending = HashSet::new();
        for m in messages {
            match m.role {
                Role::Assistant => {
                    for c in &m.tool_calls {
                        pending.insert(c.id.clone());
                    }
                }
                Role::Tool => match &m.tool_call_id {
                    Some(id) if pending.remove(id) => {}
                    _ => return false,
                },
                _ => {}
            }
        }
        pending.is_empty()
    }

    #[test]
    fn test_tool_call_wire_format() {
        let msg = Message::assistant_with_tool_calls(
            None,
            vec![ToolCall::new("call_1", "python", r#"{"code":"print(1)"}"#)],
        );
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["role"], "assistant");
        assert!(json.get("content").is_none());
        assert_eq!(json["tool_calls"][0]["type"], "function");
        assert_eq!(json["tool_calls"][0]["function"]["name"], "python");
        assert_eq!(
            json["tool_calls"][0]["function"]["arguments"],
            r#"{"code":"print(1)"}"#
        );
    }

    #[test]
    fn test_null_tool_calls_deserialize() {
        let msg: Message =
            serde_json::from_str(r#"{"role":"assistant","content":"hi","tool_calls":null}"#).unwrap();
        assert!(msg.tool_calls.is_empty());
        assert_eq!(msg.content_text(), "hi");
    }

    #[test]
    fn test_image_message_parts() {
        let msg = Message::user_with_image("Here is the image:", "data:image/png;base64,AAA");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["content"][0]["type"], "text");
        assert_eq!(json["content"][1]["type"], "image_url");
        assert_eq!(json["content"][1]["image_url"]["url"], "data:image/png;base64,AAA");
        assert_eq!(msg.content_text(), "Here is the image:");
    }

    #[test]
    fn test_transcript_starts_at_boundary() {
        let mut conv = Conversation::new();
        conv.push_context(Message::system("example task"));
        conv.push_context(Message::assistant("example step"));
        conv.begin_task(Message::system("current task"));
        conv.push(Message::user("next step"));
        conv.push(Message::system("a later notice"));
        conv.push(Message::assistant("answer"));

        assert_eq!(conv.full().len(), 6);
        assert_eq!(conv.visible().len(), 3);
        let transcript = conv.transcript();
        assert_eq!(transcript.len(), 4);
        assert_eq!(transcript[0].content_text(), "current task");
        assert_eq!(transcript[1].content_text(), "next step");
    }

    #[test]
    fn test_repair_converts_unmatched_call() {
        let messages = vec![
            Message::system("task"),
            Message::assistant_with_tool_calls(
                Some("thinking".to_string()),
                vec![
                    ToolCall::new("a", "python", r#"{"code":"1"}"#),
                    ToolCall::new("b", "wolfram", r#"{"query":"x"}"#),
                ],
            ),
            Message::tool("a", "1"),
        ];
        let repaired = repair_tool_pairing(&messages);
        assert!(pairing_holds(&repaired));
        assert_eq!(repaired[1].tool_calls.len(), 1);
        assert_eq!(repaired[1].tool_calls[0].id, "a");
        assert!(repaired[1]
            .content_text()
            .contains(r#"Tool call: wolfram({"query":"x"})"#));
        assert!(pairing_holds(&repaired));
    }

    #[test]
    fn test_repair_converts_orphan_and_duplicate_results() {
        let messages = vec![
            Message::tool("ghost", "stray"),
            Message::assistant_with_tool_calls(None, vec![ToolCall::new("a", "python", "{}")]),
            Message::tool("a", "first"),
            Message::tool("a", "second"),
        ];
        let repaired = repair_tool_pairing(&messages);
        assert!(pairing_holds(&repaired));
        assert_eq!(repaired[0].role, Role::User);
        assert_eq!(repaired[0].content_text(), "Tool result: stray");
        assert_eq!(repaired[2].role, Role::Tool);
        assert_eq!(repaired[3].role, Role::User);
    }

    #[test]
    fn test_repair_is_idempotent() {
        let messages = vec![
            Message::assistant_with_tool_calls(None, vec![ToolCall::new("x", "python", "{}")]),
            Message::user("continue"),
            Message::assistant_with_tool_calls(None, vec![ToolCall::new("y", "python", "{}")]),
            Message::tool("y", "ok"),
            Message::tool("z", "orphan"),
        ];
        let once = repair_tool_pairing(&messages);
        let twice = repair_tool_pairing(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_repair_leaves_valid_conversation_untouched() {
        let messages = vec![
            Message::user_with_image("look", "http://img"),
            Message::assistant_with_tool_calls(None, vec![ToolCall::new("a", "python", "{}")]),
            Message::tool("a", "ok"),
            Message::assistant("done"),
        ];
        assert_eq!(repair_tool_pairing(&messages), messages);
    }
}
