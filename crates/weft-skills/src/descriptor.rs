use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Declared parameter of a skill.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    pub kind: ParamKind,
    pub required: bool,
}

impl ParamSpec {
    pub fn required(name: &str, kind: ParamKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            required: true,
        }
    }

    pub fn optional(name: &str, kind: ParamKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            required: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamKind {
    String,
    Integer,
    Boolean,
    /// A string that will be resolved against the skill's filesystem scope.
    Path,
}

impl ParamKind {
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            ParamKind::String | ParamKind::Path => value.is_string(),
            ParamKind::Integer => value.is_i64() || value.is_u64(),
            ParamKind::Boolean => value.is_boolean(),
        }
    }
}

/// Sandbox policy a skill runs under. Unset fields fall back to the global
/// sandbox config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SandboxProfile {
    /// Outbound network permitted. None = inherit the global default.
    pub network: Option<bool>,
    /// Filesystem confinement: a directory (relative to the workspace root)
    /// the skill may not escape. None = no filesystem access at all.
    pub fs_scope: Option<String>,
    /// Wall-clock timeout override in seconds.
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillDescriptor {
    /// Unique name, also the `ToolRequest.name` on the wire.
    pub name: String,
    pub description: String,
    pub params: Vec<ParamSpec>,
    pub sandbox: SandboxProfile,
    /// Marks arguments for aggressive masking in the audit redactor.
    pub secret_sensitive: bool,
}

impl SkillDescriptor {
    /// JSON-schema-shaped parameter description for the model gateway and
    /// the MCP `tools/list` face.
    pub fn input_schema(&self) -> Value {
        let mut properties = serde_json::Map::new();
        let mut required = Vec::new();
        for p in &self.params {
            let ty = match p.kind {
                ParamKind::String | ParamKind::Path => "string",
                ParamKind::Integer => "integer",
                ParamKind::Boolean => "boolean",
            };
            properties.insert(p.name.clone(), serde_json::json!({ "type": ty }));
            if p.required {
                required.push(Value::String(p.name.clone()));
            }
        }
        serde_json::json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }

    /// Validate an argument object against the declared parameters.
    pub fn validate(&self, args: &Value) -> Result<(), String> {
        let Some(map) = args.as_object() else {
            return Err("arguments must be a JSON object".to_string());
        };

        for p in &self.params {
            match map.get(&p.name) {
                None if p.required => return Err(format!("missing required param: {}", p.name)),
                None => {}
                Some(v) if !p.kind.matches(v) => {
                    return Err(format!("param {} has the wrong type", p.name));
                }
                Some(_) => {}
            }
        }

        for key in map.keys() {
            if !self.params.iter().any(|p| &p.name == key) {
                return Err(format!("unknown param: {key}"));
            }
        }

        Ok(())
    }
}
