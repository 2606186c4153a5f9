//! ExecutionDescriptor — spec §3 "ExecutionDescriptor" (one per supported format).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::manifest::NodeTier;

/// Dispatch format tag for the `CALL_SERVICE`/`LLM_CALL` dispatch path,
/// covering HTTP connectors, LLM providers, tool-protocol calls, native and
/// Wasm execution, and the embedded-script format spec §3 requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceFormat {
    EmbeddedScript,
    Native,
    Container,
    Wasm,
    Http,
    Grpc,
    ToolProtocol,
    Connector,
    LlmCall,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformBinary {
    pub platform: String,
    pub url: String,
    pub sha256: String,
    #[serde(default)]
    pub flash_address: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpAuth {
    pub scheme: String,
    #[serde(default)]
    pub vault_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FewShotExample {
    pub label: String,
    pub input_json: String,
    pub output_json: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DynamicSlot {
    pub slot_id: String,
    /// "vault" | "runtime" — resolved at runtime only, never baked into the prompt.
    pub source_type: String,
    pub source_key: String,
}

/// One execution descriptor per supported format (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "format", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionDescriptor {
    EmbeddedScript {
        code: String,
        allowed_modules: Vec<String>,
        hard_timeout_ms: u64,
        compatible_tiers: Vec<NodeTier>,
    },
    Native {
        binaries: Vec<PlatformBinary>,
        invocation_abi: String,
        args_template: Vec<String>,
        required_env: Vec<String>,
        compatible_tiers: Vec<NodeTier>,
    },
    Container {
        image: String,
        tag: String,
        env: BTreeMap<String, String>,
        secret_env_var: BTreeMap<String, String>,
        volumes: Vec<String>,
        invocation_protocol: String,
        #[serde(default)]
        http_port: Option<u16>,
        #[serde(default)]
        cpu_limit_millis: Option<u32>,
        #[serde(default)]
        memory_limit_mb: Option<u32>,
        compatible_tiers: Vec<NodeTier>,
    },
    Wasm {
        binary_url: String,
        sha256: String,
        memory_pages: u32,
        exported_function: String,
        abi: String,
        compatible_tiers: Vec<NodeTier>,
    },
    Http {
        url_template: String,
        method: String,
        #[serde(default)]
        auth: Option<HttpAuth>,
        request_mapping: BTreeMap<String, String>,
        response_mapping: BTreeMap<String, String>,
        output_field_map: BTreeMap<String, String>,
        headers: BTreeMap<String, String>,
        compatible_tiers: Vec<NodeTier>,
    },
    Grpc {
        host: String,
        port: u16,
        service: String,
        method: String,
        proto_url: String,
        #[serde(default)]
        tls_cert: Option<String>,
        io_mappings: BTreeMap<String, String>,
        compatible_tiers: Vec<NodeTier>,
    },
    ToolProtocol {
        server_name: String,
        tool_name: String,
        io_mappings: BTreeMap<String, String>,
        compatible_tiers: Vec<NodeTier>,
    },
    Connector {
        connector_type: String,
        operation_kind: String,
        config_template: serde_json::Value,
        io_mappings: BTreeMap<String, String>,
        compatible_tiers: Vec<NodeTier>,
    },
    LlmCall {
        provider: String,
        model: String,
        system_prompt: String,
        prompt_template: String,
        #[serde(default)]
        few_shot_examples: Vec<FewShotExample>,
        #[serde(default)]
        dynamic_slots: Vec<DynamicSlot>,
        max_tokens: u32,
        temperature: f32,
        input_slot_mapping: BTreeMap<String, String>,
        output_field_mapping: BTreeMap<String, String>,
        vault_path: String,
        timeout_ms: u64,
        compatible_tiers: Vec<NodeTier>,
    },
}

impl ExecutionDescriptor {
    pub fn format(&self) -> ServiceFormat {
        match self {
            ExecutionDescriptor::EmbeddedScript { .. } => ServiceFormat::EmbeddedScript,
            ExecutionDescriptor::Native { .. } => ServiceFormat::Native,
            ExecutionDescriptor::Container { .. } => ServiceFormat::Container,
            ExecutionDescriptor::Wasm { .. } => ServiceFormat::Wasm,
            ExecutionDescriptor::Http { .. } => ServiceFormat::Http,
            ExecutionDescriptor::Grpc { .. } => ServiceFormat::Grpc,
            ExecutionDescriptor::ToolProtocol { .. } => ServiceFormat::ToolProtocol,
            ExecutionDescriptor::Connector { .. } => ServiceFormat::Connector,
            ExecutionDescriptor::LlmCall { .. } => ServiceFormat::LlmCall,
        }
    }

    pub fn compatible_tiers(&self) -> &[NodeTier] {
        match self {
            ExecutionDescriptor::EmbeddedScript { compatible_tiers, .. }
            | ExecutionDescriptor::Native { compatible_tiers, .. }
            | ExecutionDescriptor::Container { compatible_tiers, .. }
            | ExecutionDescriptor::Wasm { compatible_tiers, .. }
            | ExecutionDescriptor::Http { compatible_tiers, .. }
            | ExecutionDescriptor::Grpc { compatible_tiers, .. }
            | ExecutionDescriptor::ToolProtocol { compatible_tiers, .. }
            | ExecutionDescriptor::Connector { compatible_tiers, .. }
            | ExecutionDescriptor::LlmCall { compatible_tiers, .. } => compatible_tiers,
        }
    }

    pub fn is_compatible_with(&self, tier: NodeTier) -> bool {
        self.compatible_tiers()
            .iter()
            .any(|t| *t == tier || *t == NodeTier::Any)
            || tier == NodeTier::Any
    }
}
