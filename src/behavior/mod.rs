//! 行为：由语句组成、在 Agent 的行为引擎中异步运行的脚本
//!
//! 行为只能读写自己的局部变量；修改 Agent 状态要通过 SetAgentState 语句，
//! 它会给所属 Agent 发送 SetState 消息，由 mailbox 串行处理。

pub mod vm;

use serde::{Deserialize, Serialize};

pub use vm::BehaviorVm;

/// 单条语句
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Statement {
    /// 设置局部变量
    Set { key: String, value: serde_json::Value },
    /// 写 Agent 状态（经 SetState 消息）
    SetAgentState { key: String, value: serde_json::Value },
    /// 向 scope 通道输出文本，`{key}` 会被局部变量替换
    Emit { text: String },
    Log { text: String },
    Sleep { millis: u64 },
    /// 以错误终止本次运行
    Fail { reason: String },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Behavior {
    pub urn: String,
    pub statements: Vec<Statement>,
}

impl Behavior {
    pub fn new(urn: impl Into<String>) -> Self {
        Self {
            urn: urn.into(),
            statements: Vec::new(),
        }
    }

    pub fn then(mut self, statement: Statement) -> Self {
        self.statements.push(statement);
        self
    }
}

/// `{key}` 占位符替换
pub(crate) fn interpolate(text: &str, variables: &crate::actors::Parameters) -> String {
    let mut out = text.to_string();
    for (key, value) in variables {
        let placeholder = format!("{{{}}}", key);
        if out.contains(&placeholder) {
            let rendered = match value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            out = out.replace(&placeholder, &rendered);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actors::Parameters;

    #[test]
    fn test_statements_deserialize_from_json() {
        let json = r#"[{"op":"set","key":"n","value":3},{"op":"emit","text":"n={n}"},{"op":"sleep","millis":5}]"#;
        let statements: Vec<Statement> = serde_json::from_str(json).unwrap();
        assert_eq!(statements.len(), 3);
        assert!(matches!(statements[2], Statement::Sleep { millis: 5 }));
    }

    #[test]
    fn test_interpolate() {
        let mut vars = Parameters::new();
        vars.insert("name".into(), serde_json::json!("alice"));
        vars.insert("n".into(), serde_json::json!(3));
        assert_eq!(interpolate("{name} has {n} twins", &vars), "alice has 3 twins");
        assert_eq!(interpolate("{missing}", &vars), "{missing}");
    }
}
