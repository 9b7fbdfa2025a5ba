//! 工具 Schema：由参数类型经 schemars 自动生成 function 描述符
//!
//! 模型看到的只有参数 schema；沙箱、运行 id、凭据等环境上下文由注册表注入，不出现在这里。

use schemars::{schema_for, JsonSchema};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// OpenAI 风格的 function 工具描述
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    #[serde(rename = "type", default = "default_kind")]
    pub kind: String,
    pub function: FunctionSpec,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FunctionSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "empty_parameters")]
    pub parameters: Value,
}

fn default_kind() -> String {
    "function".to_string()
}

fn empty_parameters() -> Value {
    serde_json::json!({ "type": "object", "properties": {} })
}

impl ToolSpec {
    pub fn function(name: &str, description: &str, parameters: Value) -> Self {
        Self {
            kind: default_kind(),
            function: FunctionSpec {
                name: name.to_string(),
                description: description.to_string(),
                parameters,
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.function.name
    }
}

/// 参数类型的 JSON Schema（去掉 `$schema` 与 `title`，只保留模型需要的部分）
pub fn parameters_schema<T: JsonSchema>() -> Value {
    let mut schema = serde_json::to_value(schema_for!(T)).unwrap_or_else(|_| empty_parameters());
    if let Some(obj) = schema.as_object_mut() {
        obj.remove("$schema");
        obj.remove("title");
    }
    schema
}

/// 以逗号拼接工具名，用于日志与 prompt
pub fn tool_names(tools: &[ToolSpec]) -> String {
    tools.iter().map(|t| t.name()).collect::<Vec<_>>().join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[allow(dead_code)]
    #[derive(JsonSchema)]
    struct LookupArgs {
        /// 要查询的内容
        query: String,
        limit: Option<u32>,
    }

    #[test]
    fn test_parameters_schema_lists_required_fields() {
        let schema = parameters_schema::<LookupArgs>();
        assert_eq!(schema["type"], "object");
        assert!(schema.get("$schema").is_none());
        assert!(schema.get("title").is_none());
        assert!(schema["properties"]["query"].is_object());
        let required = schema["required"].as_array().unwrap();
        assert_eq!(required, &vec![Value::from("query")]);
    }

    #[test]
    fn test_tool_spec_wire_format() {
        let spec = ToolSpec::function("lookup", "Look something up", parameters_schema::<LookupArgs>());
        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["type"], "function");
        assert_eq!(json["function"]["name"], "lookup");
        assert_eq!(tool_names(&[spec.clone(), spec]), "lookup, lookup");
    }
}
