//! Built-in service catalogue seeded into every fresh registry (spec §4.A).
//!
//! These mirror the shape of action/tool calls the SVM dispatches (an HTTP
//! connector call and an LLM call), lifted into proper manifests so the
//! compiler's resolver has something real to resolve against.

use std::collections::BTreeMap;

use llmir_core::{
    BehaviouralContract, ExecutionDescriptor, NodeRequirements, NodeTier, Port, PortType, RetryPolicy,
    ServiceManifest,
};

fn http_notify_manifest() -> ServiceManifest {
    ServiceManifest {
        id: "core.http-notify".to_owned(),
        version: semver::Version::new(1, 0, 0),
        category: "connector".to_owned(),
        inputs: vec![
            Port { name: "url".to_owned(), semantic_type: PortType::String, required: true, default: None },
            Port { name: "body".to_owned(), semantic_type: PortType::Object, required: false, default: None },
        ],
        outputs: vec![Port {
            name: "status_code".to_owned(),
            semantic_type: PortType::Number,
            required: true,
            default: None,
        }],
        descriptors: vec![ExecutionDescriptor::Http {
            url_template: "{{url}}".to_owned(),
            method: "POST".to_owned(),
            auth: None,
            request_mapping: BTreeMap::from([("body".to_owned(), "$.body".to_owned())]),
            response_mapping: BTreeMap::new(),
            output_field_map: BTreeMap::from([("status_code".to_owned(), "$.status".to_owned())]),
            headers: BTreeMap::new(),
            compatible_tiers: vec![NodeTier::Central, NodeTier::Linux],
        }],
        node_requirements: NodeRequirements {
            tiers: vec![NodeTier::Central, NodeTier::Linux],
            needs_internet: true,
            ..Default::default()
        },
        contract: BehaviouralContract {
            deterministic: false,
            idempotent: false,
            has_external_side_effects: true,
            nominal_latency_ms: Some(300),
            hard_timeout_ms: 5_000,
            retry_policy: RetryPolicy { max_attempts: 3, backoff_base_ms: 1_000 },
        },
        preconditions: Vec::new(),
        postconditions: Vec::new(),
        safety_constraints: Vec::new(),
        requires_human_confirmation: false,
        reversible: true,
        trusted: true,
        signature: None,
    }
}

fn llm_summarize_manifest() -> ServiceManifest {
    ServiceManifest {
        id: "core.llm-summarize".to_owned(),
        version: semver::Version::new(1, 0, 0),
        category: "llm".to_owned(),
        inputs: vec![Port { name: "text".to_owned(), semantic_type: PortType::String, required: true, default: None }],
        outputs: vec![Port {
            name: "summary".to_owned(),
            semantic_type: PortType::String,
            required: true,
            default: None,
        }],
        descriptors: vec![ExecutionDescriptor::LlmCall {
            provider: "anthropic".to_owned(),
            model: "claude-haiku".to_owned(),
            system_prompt: "Summarize the provided text in two sentences.".to_owned(),
            prompt_template: "{{text}}".to_owned(),
            few_shot_examples: Vec::new(),
            dynamic_slots: Vec::new(),
            max_tokens: 256,
            temperature: 0.2,
            input_slot_mapping: BTreeMap::from([("text".to_owned(), "$.text".to_owned())]),
            output_field_mapping: BTreeMap::from([("summary".to_owned(), "$.summary".to_owned())]),
            vault_path: "secret/data/llm/anthropic".to_owned(),
            timeout_ms: 15_000,
            compatible_tiers: vec![NodeTier::Central, NodeTier::Linux],
        }],
        node_requirements: NodeRequirements {
            tiers: vec![NodeTier::Central, NodeTier::Linux],
            needs_vault: true,
            needs_internet: true,
            ..Default::default()
        },
        contract: BehaviouralContract {
            deterministic: false,
            idempotent: true,
            has_external_side_effects: false,
            nominal_latency_ms: Some(1_200),
            hard_timeout_ms: 20_000,
            retry_policy: RetryPolicy { max_attempts: 2, backoff_base_ms: 2_000 },
        },
        preconditions: Vec::new(),
        postconditions: Vec::new(),
        safety_constraints: Vec::new(),
        requires_human_confirmation: false,
        reversible: true,
        trusted: true,
        signature: None,
    }
}

fn gpio_actuate_manifest() -> ServiceManifest {
    ServiceManifest {
        id: "core.gpio-actuate".to_owned(),
        version: semver::Version::new(1, 0, 0),
        category: "action".to_owned(),
        inputs: vec![Port { name: "pin".to_owned(), semantic_type: PortType::Number, required: true, default: None }],
        outputs: vec![Port { name: "state".to_owned(), semantic_type: PortType::Boolean, required: true, default: None }],
        descriptors: vec![ExecutionDescriptor::EmbeddedScript {
            code: "gpio_write(pin, true)".to_owned(),
            allowed_modules: vec!["gpio".to_owned()],
            hard_timeout_ms: 500,
            compatible_tiers: vec![NodeTier::Mcu],
        }],
        node_requirements: NodeRequirements { tiers: vec![NodeTier::Mcu], ..Default::default() },
        contract: BehaviouralContract {
            deterministic: true,
            idempotent: false,
            has_external_side_effects: true,
            nominal_latency_ms: Some(5),
            hard_timeout_ms: 500,
            retry_policy: RetryPolicy { max_attempts: 1, backoff_base_ms: 0 },
        },
        preconditions: Vec::new(),
        postconditions: Vec::new(),
        safety_constraints: Vec::new(),
        requires_human_confirmation: true,
        reversible: true,
        trusted: true,
        signature: None,
    }
}

pub fn builtin_manifests() -> Vec<ServiceManifest> {
    vec![http_notify_manifest(), llm_summarize_manifest(), gpio_actuate_manifest()]
}

/// Minimal valid manifest for unit tests, compatible only with `MCU` tier.
#[cfg(test)]
pub fn test_manifest(id: &str, version: &str) -> ServiceManifest {
    ServiceManifest {
        id: id.to_owned(),
        version: semver::Version::parse(version).unwrap(),
        category: "test".to_owned(),
        inputs: vec![Port { name: "in".to_owned(), semantic_type: PortType::Any, required: true, default: None }],
        outputs: vec![Port { name: "out".to_owned(), semantic_type: PortType::Any, required: true, default: None }],
        descriptors: vec![ExecutionDescriptor::EmbeddedScript {
            code: "noop()".to_owned(),
            allowed_modules: Vec::new(),
            hard_timeout_ms: 100,
            compatible_tiers: vec![NodeTier::Mcu],
        }],
        node_requirements: NodeRequirements { tiers: vec![NodeTier::Mcu], ..Default::default() },
        contract: BehaviouralContract {
            deterministic: true,
            idempotent: true,
            has_external_side_effects: false,
            nominal_latency_ms: Some(1),
            hard_timeout_ms: 100,
            retry_policy: RetryPolicy::default(),
        },
        preconditions: Vec::new(),
        postconditions: Vec::new(),
        safety_constraints: Vec::new(),
        requires_human_confirmation: false,
        reversible: true,
        trusted: false,
        signature: None,
    }
}
