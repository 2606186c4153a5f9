//! Register-based interpreter (spec Component G "Semantic Virtual
//! Machine") executing an `llmir_core::Artifact`'s instruction stream.
//! Service dispatch switches on `ExecutionDescriptor` rather than a single
//! HTTP-shaped record, so the same interpreter can reach HTTP connectors,
//! tool-protocol calls, and LLM providers through one opcode vocabulary.

use anyhow::{anyhow, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use llmir_core::{Artifact, DispatchMetadata, ExecutionDescriptor, IrInstruction, Opcode, PredicateOperator};

use crate::collab::{ApprovalGate, AuditSink, CancellationBus, NodeDispatcher, SecretResolver};
use crate::fallback::{FallbackEngine, FallbackStrategy};
use crate::physical::PhysicalActionHandler;
use crate::priority::PriorityArbiter;

pub type Registers = HashMap<u8, Value>;

pub struct Interpreter {
    http: reqwest::Client,
    fallback: FallbackEngine,
    secrets: Arc<dyn SecretResolver>,
    audit: Arc<dyn AuditSink>,
    dispatcher: Arc<dyn NodeDispatcher>,
    priority: PriorityArbiter,
    physical: PhysicalActionHandler,
    dispatcher_http_url: String,
}

impl Interpreter {
    pub fn new(
        http: reqwest::Client,
        dispatcher_http_url: impl Into<String>,
        node_id: impl Into<String>,
        secrets: Arc<dyn SecretResolver>,
        audit: Arc<dyn AuditSink>,
        dispatcher: Arc<dyn NodeDispatcher>,
        cancellation: Arc<dyn CancellationBus>,
        approvals: Arc<dyn ApprovalGate>,
    ) -> Self {
        let dispatcher_http_url = dispatcher_http_url.into();
        let node_id = node_id.into();
        let fallback = FallbackEngine::new(http.clone(), dispatcher_http_url.clone(), node_id);
        let physical = PhysicalActionHandler::new(cancellation, approvals);
        Self { http, fallback, secrets, audit, dispatcher, priority: PriorityArbiter::new(), physical, dispatcher_http_url }
    }

    /// Execute every instruction in `artifact.instruction_order`, returning
    /// the final register file and the wall-clock duration in milliseconds.
    /// This is the monolithic path (spec §4.G "Monolithic path"); the
    /// distributed path in [`crate::distributed`] drives [`Self::step`]
    /// directly over a single slice's order so it can interleave sync-point
    /// draining between instructions.
    pub async fn execute(&self, artifact: &Artifact) -> Result<(Registers, u64)> {
        let workflow_id = artifact.metadata.workflow_id.clone();
        info!("[Interp] executing workflow={workflow_id} ({} instructions)", artifact.instruction_order.len());

        let mut regs: Registers = HashMap::new();
        let start = Instant::now();
        let order = &artifact.instruction_order;
        let mut ip = 0usize;

        while ip < order.len() {
            ip = self.step(artifact, order, ip, &mut regs).await?;
        }

        let elapsed = start.elapsed().as_millis() as u64;
        info!("[Interp] workflow={workflow_id} done in {elapsed}ms");
        let report = serde_json::to_value(&regs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect::<serde_json::Map<_, _>>()).unwrap_or(Value::Null);
        self.dispatcher.report_execution_result(&workflow_id, &report).await.ok();
        Ok((regs, elapsed))
    }

    /// Execute the instruction at `order[ip]` against `artifact`, mutating
    /// `regs` in place, and return the next `ip` within `order` (`order.len()`
    /// signals termination, e.g. on `RETURN`). Exposed so the distributed
    /// executor can drain sync-points between steps while running the
    /// central slice's own order (spec §4.G "Distributed path").
    pub async fn step(&self, artifact: &Artifact, order: &[u32], ip: usize, regs: &mut Registers) -> Result<usize> {
        let workflow_id = artifact.metadata.workflow_id.clone();
        let workflow_version = Some(artifact.metadata.workflow_version);
        let idx = order[ip];
        let instr = artifact.instruction(idx).ok_or_else(|| anyhow!("missing instruction #{idx}"))?;
        debug!("[Interp] ip={ip} opcode={:?} dest={:?}", instr.opcode, instr.dest);
        let instr_start = Instant::now();

        let next_ip = match instr.opcode {
            Opcode::LoadResource => {
                let result = self.load_resource_with_fallback(instr, &workflow_id).await?;
                if let Some(dest) = instr.dest {
                    regs.insert(dest, result.clone());
                }
                self.audit
                    .record(self.event(&workflow_id, workflow_version, instr, "LOAD_RESOURCE", None, Some(&result), instr_start))
                    .await
                    .ok();
                ip + 1
            }

            Opcode::StoreMemory => {
                let src = self.read_src(instr, regs, 0)?;
                if let Some(dest) = instr.dest {
                    regs.insert(dest, src);
                }
                ip + 1
            }

            Opcode::CallService => {
                let _permit = self.acquire_priority_permit(instr).await?;
                let input = self.read_src(instr, regs, 0).ok();
                let result = self.call_service_with_fallback(instr, input.as_ref(), &workflow_id).await?;
                if let Some(dest) = instr.dest {
                    regs.insert(dest, result.clone());
                }
                self.audit
                    .record(self.event(&workflow_id, workflow_version, instr, "CALL_SERVICE", input.as_ref(), Some(&result), instr_start))
                    .await
                    .ok();
                ip + 1
            }

            Opcode::CallAction => {
                let _permit = self.acquire_priority_permit(instr).await?;
                let result = self.call_action_with_fallback(instr, &workflow_id, regs).await?;
                if let Some(dest) = instr.dest {
                    regs.insert(dest, result.clone());
                }
                self.audit
                    .record(self.event(&workflow_id, workflow_version, instr, "CALL_ACTION", None, Some(&result), instr_start))
                    .await
                    .ok();
                ip + 1
            }

            Opcode::CallTool => {
                let input = self.read_src(instr, regs, 0).ok();
                let result = self.call_tool_with_fallback(instr, input.as_ref(), &workflow_id).await?;
                if let Some(dest) = instr.dest {
                    regs.insert(dest, result);
                }
                ip + 1
            }

            Opcode::LlmCall => {
                let input = self.read_src(instr, regs, 0).ok();
                let result = self.llm_call_with_fallback(instr, input.as_ref(), &workflow_id).await?;
                if let Some(dest) = instr.dest {
                    regs.insert(dest, result.clone());
                }
                self.audit
                    .record(self.event(&workflow_id, workflow_version, instr, "LLM_CALL", input.as_ref(), Some(&result), instr_start))
                    .await
                    .ok();
                ip + 1
            }

            Opcode::Branch => {
                let cond = self.read_src(instr, regs, 0).ok();
                if is_truthy(cond.as_ref()) {
                    self.resolve_ip(order, instr.target_instruction)
                } else {
                    ip + 1
                }
            }

            Opcode::Jump => self.resolve_ip(order, instr.target_instruction),

            Opcode::Loop => self.run_loop_body(artifact, instr, idx, regs)?,

            Opcode::Return => order.len(),

            Opcode::Transform => {
                let src = self.read_src(instr, regs, 0).unwrap_or(Value::Null);
                let result = apply_transform(&src, &instr.operands);
                if let Some(dest) = instr.dest {
                    regs.insert(dest, result);
                }
                ip + 1
            }

            Opcode::Validate => {
                let src = self.read_src(instr, regs, 0).unwrap_or(Value::Null);
                if let Some(dest) = instr.dest {
                    regs.insert(dest, src);
                }
                ip + 1
            }

            Opcode::Aggregate | Opcode::Filter | Opcode::Trigger => {
                let src = self.read_src(instr, regs, 0).unwrap_or(Value::Null);
                if let Some(dest) = instr.dest {
                    regs.insert(dest, src);
                }
                ip + 1
            }

            Opcode::ParallelSpawn => self.run_parallel_group(artifact, order, ip, &workflow_id, regs).await?,

            Opcode::ParallelMerge => ip + 1,
        };

        Ok(next_ip)
    }

    fn event(
        &self,
        workflow_id: &str,
        workflow_version: Option<u32>,
        instr: &IrInstruction,
        event_type: &str,
        input: Option<&Value>,
        output: Option<&Value>,
        start: Instant,
    ) -> crate::audit::AuditEvent {
        // AuditSink::record consumes an AuditEvent, but only AuditChain can
        // mint self-consistent hash-linked ones; build it through a throwaway
        // chain segment keyed by workflow so call sites stay simple.
        let mut scratch = crate::audit::AuditChain::new(instr.service_id.clone().unwrap_or_else(|| "node".into()), None);
        scratch.append(
            workflow_id,
            workflow_version,
            Some(instr.index.to_string()),
            event_type,
            input,
            output,
            start.elapsed().as_millis() as u64,
            None,
        )
    }

    async fn acquire_priority_permit(&self, instr: &IrInstruction) -> Result<Option<crate::priority::PriorityPermit>> {
        let Some(policy) = &instr.priority_policy else { return Ok(None) };
        let key = instr.service_id.as_deref().unwrap_or("resource_default");
        match self.priority.acquire(key, policy).await {
            Ok(permit) => Ok(Some(permit)),
            Err(e) => {
                warn!("[Interp] priority arbitration for \"{key}\": {e} — triggering fallback");
                Err(e)
            }
        }
    }

    // ── Fallback-aware wrappers ───────────────────────────────────────────

    async fn load_resource_with_fallback(&self, instr: &IrInstruction, workflow_id: &str) -> Result<Value> {
        let (strategy, cfg) = FallbackEngine::strategy_for(&instr.operands);
        match strategy {
            FallbackStrategy::RetryWithBackoff => self.retry_backoff(&cfg, || self.exec_load_resource(instr)).await,
            _ => match self.exec_load_resource(instr).await {
                Ok(v) => Ok(v),
                Err(e) => self.fallback.apply_simple(strategy, &cfg, e, workflow_id, instr.service_id.as_deref().unwrap_or("")).await,
            },
        }
    }

    async fn call_service_with_fallback(&self, instr: &IrInstruction, input: Option<&Value>, workflow_id: &str) -> Result<Value> {
        let enriched = self.inject_vault_credentials(instr).await;
        let (strategy, cfg) = FallbackEngine::strategy_for(&instr.operands);
        match strategy {
            FallbackStrategy::RetryWithBackoff => self.retry_backoff(&cfg, || self.exec_call_service(instr, enriched.as_ref().or(input))).await,
            _ => match self.exec_call_service(instr, enriched.as_ref().or(input)).await {
                Ok(v) => Ok(v),
                Err(e) => self.fallback.apply_simple(strategy, &cfg, e, workflow_id, instr.service_id.as_deref().unwrap_or("")).await,
            },
        }
    }

    async fn call_action_with_fallback(&self, instr: &IrInstruction, workflow_id: &str, regs: &mut Registers) -> Result<Value> {
        let (strategy, cfg) = FallbackEngine::strategy_for(&instr.operands);
        match strategy {
            FallbackStrategy::RetryWithBackoff => self.retry_backoff(&cfg, || self.exec_call_action(instr, workflow_id, regs)).await,
            _ => match self.exec_call_action(instr, workflow_id, regs).await {
                Ok(v) => Ok(v),
                Err(e) => self.fallback.apply_simple(strategy, &cfg, e, workflow_id, instr.service_id.as_deref().unwrap_or("")).await,
            },
        }
    }

    async fn call_tool_with_fallback(&self, instr: &IrInstruction, input: Option<&Value>, workflow_id: &str) -> Result<Value> {
        let (strategy, cfg) = FallbackEngine::strategy_for(&instr.operands);
        match strategy {
            FallbackStrategy::RetryWithBackoff => self.retry_backoff(&cfg, || self.exec_call_tool(instr, input)).await,
            _ => match self.exec_call_tool(instr, input).await {
                Ok(v) => Ok(v),
                Err(e) => self.fallback.apply_simple(strategy, &cfg, e, workflow_id, instr.service_id.as_deref().unwrap_or("")).await,
            },
        }
    }

    async fn llm_call_with_fallback(&self, instr: &IrInstruction, input: Option<&Value>, workflow_id: &str) -> Result<Value> {
        self.inject_vault_credentials(instr).await;
        let (strategy, cfg) = FallbackEngine::strategy_for(&instr.operands);
        match strategy {
            FallbackStrategy::RetryWithBackoff => self.retry_backoff(&cfg, || self.exec_llm_call(instr, input)).await,
            _ => match self.exec_llm_call(instr, input).await {
                Ok(v) => Ok(v),
                Err(e) => self.fallback.apply_simple(strategy, &cfg, e, workflow_id, instr.service_id.as_deref().unwrap_or("")).await,
            },
        }
    }

    async fn retry_backoff<F, Fut>(&self, cfg: &crate::fallback::InstructionFallbackConfig, f: F) -> Result<Value>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<Value>>,
    {
        let max = cfg.max_attempts.max(1) as usize;
        let base_ms = cfg.backoff_base_ms;
        let mut last_err = None;
        for attempt in 1..=max {
            if attempt > 1 {
                let wait_ms = base_ms * (1u64 << (attempt - 2).min(6));
                tokio::time::sleep(std::time::Duration::from_millis(wait_ms)).await;
            }
            match f().await {
                Ok(v) => return Ok(v),
                Err(e) => {
                    warn!("[Interp] RETRY_WITH_BACKOFF attempt {attempt}/{max} failed: {e}");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow!("retry exhausted")))
    }

    async fn inject_vault_credentials(&self, instr: &IrInstruction) -> Option<Value> {
        let vault_path = instr.dispatch_metadata.as_ref()?.credentials_vault_path.as_deref()?;
        match self.secrets.fetch_secret(vault_path).await {
            Ok(secret) => Some(serde_json::json!({ "__vault_token": secret.value })),
            Err(e) => {
                warn!("[Interp] vault: failed to resolve \"{vault_path}\": {e}");
                None
            }
        }
    }

    // ── Opcode handlers ────────────────────────────────────────────────────

    async fn exec_load_resource(&self, instr: &IrInstruction) -> Result<Value> {
        if let Some(ExecutionDescriptor::Http { url_template, .. }) = instr.dispatch_metadata.as_ref().map(|d| &d.selected_descriptor) {
            let resp = self.http.get(url_template).send().await?;
            return Ok(resp.json().await.unwrap_or(Value::Null));
        }
        Ok(instr.operands.clone())
    }

    async fn exec_call_service(&self, instr: &IrInstruction, input: Option<&Value>) -> Result<Value> {
        let dm = instr.dispatch_metadata.as_ref().ok_or_else(|| anyhow!("CALL_SERVICE #{} missing dispatch_metadata", instr.index))?;

        match &dm.selected_descriptor {
            ExecutionDescriptor::Http { url_template, method, headers, output_field_map, .. } => {
                let method_upper = method.to_uppercase();
                let mut req = match method_upper.as_str() {
                    "POST" | "PUT" | "PATCH" => self
                        .http
                        .request(reqwest::Method::from_bytes(method_upper.as_bytes())?, url_template)
                        .json(&input.cloned().unwrap_or(Value::Null)),
                    _ => self.http.get(url_template),
                };
                for (k, v) in headers {
                    req = req.header(k, v);
                }
                let resp = req.send().await?;
                let status = resp.status();
                if !status.is_success() {
                    return Err(anyhow!("CALL_SERVICE {url_template} -> HTTP {status}"));
                }
                let body: Value = resp.json().await.unwrap_or(Value::Null);
                if output_field_map.is_empty() {
                    Ok(body)
                } else {
                    let mut mapped = serde_json::Map::new();
                    for (key, path) in output_field_map {
                        mapped.insert(key.clone(), json_path_get(&body, path));
                    }
                    Ok(Value::Object(mapped))
                }
            }
            ExecutionDescriptor::Connector { .. } => self.exec_connector(dm, input).await,
            ExecutionDescriptor::ToolProtocol { .. } => self.exec_call_tool(instr, input).await,
            ExecutionDescriptor::LlmCall { .. } => self.exec_llm_call(instr, input).await,
            other => {
                warn!("[Interp] CALL_SERVICE format {:?} not supported at runtime — returning null", other.format());
                Ok(Value::Null)
            }
        }
    }

    async fn exec_connector(&self, dm: &DispatchMetadata, input: Option<&Value>) -> Result<Value> {
        let ExecutionDescriptor::Connector { connector_type, operation_kind, .. } = &dm.selected_descriptor else {
            return Ok(Value::Null);
        };
        debug!("[Interp] connector dispatch type={connector_type} op={operation_kind}");
        let url = format!("{}/api/connectors/{}/{}", self.dispatcher_http_url, connector_type, operation_kind);
        let resp = self.http.post(&url).json(&input.cloned().unwrap_or(Value::Null)).send().await?;
        Ok(resp.json().await.unwrap_or(Value::Null))
    }

    async fn exec_call_action(&self, instr: &IrInstruction, workflow_id: &str, regs: &mut Registers) -> Result<Value> {
        let operands = instr.physical_action_operands()?;
        let dm = instr.dispatch_metadata.clone();
        let http = self.http.clone();
        let dispatcher_http_url = self.dispatcher_http_url.clone();

        let outcome = self
            .physical
            .execute(workflow_id, instr.index, &operands, move |payload| async move {
                match dm.as_ref().map(|d| &d.selected_descriptor) {
                    Some(ExecutionDescriptor::Http { url_template, .. }) => {
                        let resp = http.post(url_template).json(&payload).send().await?;
                        if !resp.status().is_success() {
                            return Err(anyhow!("CALL_ACTION {url_template} -> HTTP {}", resp.status()));
                        }
                        Ok(resp.json().await.unwrap_or(Value::Null))
                    }
                    _ => {
                        let url = format!("{dispatcher_http_url}/api/actuators/dispatch");
                        let resp = http.post(&url).json(&payload).send().await?;
                        Ok(resp.json().await.unwrap_or(Value::Null))
                    }
                }
            })
            .await?;

        let result = outcome.as_value();

        // A cancellation never executed — the postcondition only applies
        // to an action that actually fired.
        if matches!(outcome, crate::physical::PhysicalOutcome::Cancelled) {
            return Ok(result);
        }

        if let Some(postcondition) = &operands.postcondition {
            if let Some(dest) = instr.dest {
                regs.insert(dest, result.clone());
            }
            if !crate::physical::evaluate_postcondition(postcondition, regs) {
                warn!("[Interp] CALL_ACTION #{} postcondition failed", instr.index);
                if let Some(fallback_idx) = operands.postcondition_fallback {
                    debug!("[Interp] postcondition fallback targets instruction #{fallback_idx}");
                }
                return Err(anyhow!("postcondition failed for physical action \"{}\"", operands.target));
            }
        }

        Ok(result)
    }

    async fn exec_call_tool(&self, instr: &IrInstruction, input: Option<&Value>) -> Result<Value> {
        let dm = instr.dispatch_metadata.as_ref().ok_or_else(|| anyhow!("CALL_TOOL #{} missing dispatch_metadata", instr.index))?;
        let ExecutionDescriptor::ToolProtocol { server_name, tool_name, .. } = &dm.selected_descriptor else {
            return Ok(Value::Null);
        };

        let url = format!("{}/mcp/{}", self.dispatcher_http_url, server_name);
        let call = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "tools/call",
            "params": { "name": tool_name, "arguments": input.cloned().unwrap_or(Value::Null) },
        });
        let resp = self.http.post(&url).json(&call).send().await?;
        let body: Value = resp.json().await.unwrap_or(Value::Null);
        Ok(body.get("result").cloned().unwrap_or(body))
    }

    async fn exec_llm_call(&self, instr: &IrInstruction, input: Option<&Value>) -> Result<Value> {
        let dm = instr.dispatch_metadata.as_ref().ok_or_else(|| anyhow!("LLM_CALL #{} missing dispatch_metadata", instr.index))?;
        let ExecutionDescriptor::LlmCall { provider, model, system_prompt, prompt_template, few_shot_examples, dynamic_slots, max_tokens, temperature, .. } =
            &dm.selected_descriptor
        else {
            return Err(anyhow!("LLM_CALL #{} dispatch_metadata is not an LLM descriptor", instr.index));
        };

        let few_shot: Vec<Value> = few_shot_examples
            .iter()
            .map(|ex| {
                serde_json::json!({
                    "input": serde_json::from_str::<Value>(&ex.input_json).unwrap_or(Value::Null),
                    "output": serde_json::from_str::<Value>(&ex.output_json).unwrap_or(Value::Null),
                    "label": ex.label,
                })
            })
            .collect();

        let mut resolved_slots = serde_json::Map::new();
        for slot in dynamic_slots {
            let value = match slot.source_type.as_str() {
                "vault" => match self.secrets.fetch_secret(&slot.source_key).await {
                    Ok(secret) => Value::String(secret.value),
                    Err(e) => {
                        warn!("[Interp] dynamic_slot \"{}\": vault fetch failed: {e}", slot.slot_id);
                        Value::Null
                    }
                },
                "runtime" => extract_dot_path(input.unwrap_or(&Value::Null), &slot.source_key),
                other => {
                    warn!("[Interp] dynamic_slot \"{}\": unknown source_type \"{other}\"", slot.slot_id);
                    Value::Null
                }
            };
            resolved_slots.insert(slot.slot_id.clone(), value);
        }

        let url = format!("{}/api/llm/generate", self.dispatcher_http_url);
        let payload = serde_json::json!({
            "userIntent": input.cloned().unwrap_or(Value::Null),
            "systemPrompt": system_prompt,
            "promptTemplate": prompt_template,
            "model": model,
            "provider": provider,
            "temperature": temperature,
            "maxTokens": max_tokens,
            "fewShotExamples": few_shot,
            "dynamicSlots": resolved_slots,
        });

        let resp = self.http.post(&url).json(&payload).send().await?;
        if !resp.status().is_success() {
            return Err(anyhow!("LLM_CALL -> HTTP {}", resp.status()));
        }
        Ok(resp.json().await.unwrap_or(Value::Null))
    }

    // ── Control flow helpers ───────────────────────────────────────────────

    fn read_src(&self, instr: &IrInstruction, regs: &Registers, n: usize) -> Result<Value> {
        let idx = instr.src.get(n).copied().ok_or_else(|| anyhow!("instruction #{} has no src[{n}]", instr.index))?;
        regs.get(&idx).cloned().ok_or_else(|| anyhow!("register R{idx} is undefined"))
    }

    fn resolve_ip(&self, order: &[u32], target_instr_idx: Option<u32>) -> usize {
        let Some(target) = target_instr_idx else { return order.len() };
        order.iter().position(|&i| i == target).unwrap_or(order.len())
    }

    fn run_loop_body(&self, artifact: &Artifact, instr: &IrInstruction, idx: u32, regs: &mut Registers) -> Result<usize> {
        let lo = instr.loop_operands.as_ref().ok_or_else(|| anyhow!("LOOP instruction #{idx} missing loop_operands"))?;
        let order = &artifact.instruction_order;
        let max_iter = lo.clamped_max_iterations().max(1) as usize;
        let body_start = self.resolve_ip(order, Some(lo.body_start_index));
        let exit_ip = self.resolve_ip(order, Some(lo.exit_index));
        let wall_clock_start = Instant::now();

        let mut iter = 0usize;
        let mut body_ip = body_start;

        loop {
            if iter >= max_iter {
                warn!("[Interp] LOOP #{idx} hit max_iterations={max_iter} — breaking");
                break;
            }
            if loop_timeout_exceeded(wall_clock_start.elapsed().as_millis() as u64, lo.timeout_ms) {
                return match lo.fallback_instruction {
                    Some(fallback_idx) => {
                        warn!("[Interp] LOOP #{idx} exceeded timeout_ms={} after iter={iter} — jumping to fallback #{fallback_idx}", lo.timeout_ms);
                        Ok(self.resolve_ip(order, Some(fallback_idx)))
                    }
                    None => Err(anyhow!("LoopNonConvergence: LOOP #{idx} exceeded timeout_ms={} after iter={iter} with no fallback_instruction", lo.timeout_ms)),
                };
            }
            if let Some(pred) = &lo.convergence_predicate {
                let reg_val = regs.get(&pred.register).cloned().unwrap_or(Value::Null);
                if eval_predicate(&reg_val, pred.operator, &pred.value) {
                    debug!("[Interp] LOOP #{idx} converged at iter={iter}");
                    break;
                }
            }

            let body_idx = *order.get(body_ip).ok_or_else(|| anyhow!("LOOP body_ip out of bounds"))?;
            let body_instr = artifact.instruction(body_idx).ok_or_else(|| anyhow!("LOOP body instruction #{body_idx} missing"))?;
            if matches!(body_instr.opcode, Opcode::Return) {
                break;
            }
            // Bounded inline execution only advances the register touched by
            // STORE_MEMORY/TRANSFORM-shaped bodies; service calls within a
            // loop body run through the main dispatch loop on the next pass.
            if let (Opcode::StoreMemory, Some(dest)) = (body_instr.opcode, body_instr.dest) {
                if let Ok(v) = self.read_src(body_instr, regs, 0) {
                    regs.insert(dest, v);
                }
            }

            body_ip += 1;
            if body_ip >= exit_ip {
                body_ip = body_start;
                iter += 1;
            }
        }

        Ok(exit_ip)
    }

    async fn run_parallel_group(&self, artifact: &Artifact, order: &[u32], ip: usize, workflow_id: &str, regs: &mut Registers) -> Result<usize> {
        let mut parallel_instrs: Vec<&IrInstruction> = Vec::new();
        let mut merge_ip = ip + 1;
        let mut nesting = 1usize;
        let mut scan_ip = ip + 1;

        while scan_ip < order.len() {
            let scan_idx = order[scan_ip];
            if let Some(scan_instr) = artifact.instruction(scan_idx) {
                match scan_instr.opcode {
                    Opcode::ParallelSpawn => nesting += 1,
                    Opcode::ParallelMerge => {
                        nesting -= 1;
                        if nesting == 0 {
                            merge_ip = scan_ip;
                            break;
                        }
                    }
                    Opcode::LlmCall => parallel_instrs.push(scan_instr),
                    _ => {}
                }
            }
            scan_ip += 1;
        }

        info!("[Interp] PARALLEL_SPAWN: {} concurrent LLM_CALLs for workflow={workflow_id}", parallel_instrs.len());

        let inputs: Vec<Option<Value>> = parallel_instrs.iter().map(|instr| self.read_src(instr, regs, 0).ok()).collect();
        let futures: Vec<_> = parallel_instrs.iter().zip(inputs.iter()).map(|(instr, input)| self.llm_call_with_fallback(instr, input.as_ref(), workflow_id)).collect();
        let results = futures_util::future::join_all(futures).await;

        for (instr, result) in parallel_instrs.into_iter().zip(results) {
            let Some(dest) = instr.dest else { continue };
            match result {
                Ok(v) => {
                    regs.insert(dest, v);
                }
                Err(e) => {
                    warn!("[Interp] PARALLEL_SPAWN: LLM_CALL dest={dest} failed: {e}");
                    regs.insert(dest, Value::Null);
                }
            }
        }

        Ok(merge_ip + 1)
    }
}

// ── Free helpers ───────────────────────────────────────────────────────────

pub fn is_truthy(val: Option<&Value>) -> bool {
    match val {
        None => false,
        Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Array(a)) => !a.is_empty(),
        Some(Value::Object(o)) => !o.is_empty(),
    }
}

/// LOOP wall-clock guard (spec §4.G bounded-loop handler): `timeout_ms=0`
/// disables the check (defensive default for hand-built instructions; a
/// compiled artifact always has `timeout_ms>0` per LOOP-004).
fn loop_timeout_exceeded(elapsed_ms: u64, timeout_ms: u64) -> bool {
    timeout_ms > 0 && elapsed_ms > timeout_ms
}

fn eval_predicate(val: &Value, operator: PredicateOperator, expected: &Value) -> bool {
    match operator {
        PredicateOperator::Eq => val == expected,
        PredicateOperator::Ne => val != expected,
        PredicateOperator::Truthy => is_truthy(Some(val)),
        PredicateOperator::Exists => !matches!(val, Value::Null),
        PredicateOperator::Lt => cmp_f64(val, expected, |a, b| a < b),
        PredicateOperator::Le => cmp_f64(val, expected, |a, b| a <= b),
        PredicateOperator::Gt => cmp_f64(val, expected, |a, b| a > b),
        PredicateOperator::Ge => cmp_f64(val, expected, |a, b| a >= b),
    }
}

fn cmp_f64(a: &Value, b: &Value, f: impl Fn(f64, f64) -> bool) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(av), Some(bv)) => f(av, bv),
        _ => false,
    }
}

fn json_path_get(root: &Value, path: &str) -> Value {
    let mut cur = root;
    for part in path.trim_start_matches("$.").split('.') {
        match cur.get(part) {
            Some(v) => cur = v,
            None => return Value::Null,
        }
    }
    cur.clone()
}

fn extract_dot_path(root: &Value, path: &str) -> Value {
    json_path_get(root, path)
}

fn apply_transform(src: &Value, operands: &Value) -> Value {
    if let Some(path_str) = operands.get("path").and_then(|v| v.as_str()) {
        return json_path_get(src, path_str);
    }
    if let Some(tmpl) = operands.get("template").and_then(|v| v.as_str()) {
        let obj = src.as_object().cloned().unwrap_or_default();
        let mut out = tmpl.to_owned();
        for (k, v) in &obj {
            let placeholder = format!("{{{{{k}}}}}");
            let val_str = v.as_str().map(str::to_owned).unwrap_or_else(|| v.to_string());
            out = out.replace(&placeholder, &val_str);
        }
        return Value::String(out);
    }
    src.clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::{InMemoryApprovalGate, InMemoryAuditSink, InMemoryCancellationBus, InMemoryNodeDispatcher, InMemorySecretResolver};
    use llmir_core::ArtifactMetadata;
    use std::collections::BTreeMap;

    fn interpreter() -> Interpreter {
        Interpreter::new(
            reqwest::Client::new(),
            "http://localhost:9999",
            "test-node",
            Arc::new(InMemorySecretResolver::new(Default::default())),
            Arc::new(InMemoryAuditSink::default()),
            Arc::new(InMemoryNodeDispatcher::default()),
            Arc::new(InMemoryCancellationBus::default()),
            Arc::new(InMemoryApprovalGate::default()),
        )
    }

    fn trivial_artifact(instructions: BTreeMap<u32, IrInstruction>, order: Vec<u32>, output_register: u8) -> Artifact {
        Artifact {
            instructions,
            instruction_order: order,
            dependency_graph: BTreeMap::new(),
            resource_table: BTreeMap::new(),
            parallel_groups: Vec::new(),
            schemas: BTreeMap::new(),
            input_registers: Vec::new(),
            output_register,
            distribution_plan: None,
            metadata: ArtifactMetadata {
                compiled_at: chrono::DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z").unwrap().with_timezone(&chrono::Utc),
                compiler_version: "0.1.0".into(),
                workflow_id: "wf-test".into(),
                workflow_version: 1,
                source: "test".into(),
            },
        }
    }

    #[tokio::test]
    async fn store_memory_then_branch_takes_true_arm() {
        let mut instr0 = IrInstruction::new(0, Opcode::StoreMemory);
        instr0.operands = serde_json::json!(true);
        instr0.dest = Some(0);
        instr0.src = vec![]; // STORE_MEMORY normally sources from a prior register; synth literal below

        // Synthesize src by writing directly via a LOAD_RESOURCE-style literal load.
        let mut load = IrInstruction::new(0, Opcode::LoadResource);
        load.operands = serde_json::json!(true);
        load.dest = Some(0);

        let mut branch = IrInstruction::new(1, Opcode::Branch);
        branch.src = vec![0];
        branch.target_instruction = Some(3);

        let mut false_arm = IrInstruction::new(2, Opcode::Return);
        false_arm.dest = Some(1);

        let mut true_arm = IrInstruction::new(3, Opcode::Return);
        true_arm.dest = Some(1);

        let mut instructions = BTreeMap::new();
        instructions.insert(0, load);
        instructions.insert(1, branch);
        instructions.insert(2, false_arm);
        instructions.insert(3, true_arm);

        let artifact = trivial_artifact(instructions, vec![0, 1, 2, 3], 1);
        let interp = interpreter();
        let (regs, _elapsed) = interp.execute(&artifact).await.unwrap();
        assert_eq!(regs.get(&0), Some(&Value::Bool(true)));
    }

    #[test]
    fn is_truthy_handles_falsy_json_values() {
        assert!(!is_truthy(None));
        assert!(!is_truthy(Some(&Value::Null)));
        assert!(is_truthy(Some(&serde_json::json!("non-empty"))));
        assert!(!is_truthy(Some(&serde_json::json!(""))));
        assert!(is_truthy(Some(&serde_json::json!(1))));
        assert!(!is_truthy(Some(&serde_json::json!(0))));
    }

    #[test]
    fn apply_transform_extracts_dot_path() {
        let src = serde_json::json!({"user": {"id": 42}});
        let operands = serde_json::json!({"path": "user.id"});
        assert_eq!(apply_transform(&src, &operands), serde_json::json!(42));
    }

    #[test]
    fn loop_with_never_satisfied_predicate_terminates_after_max_iterations() {
        use llmir_core::{ConvergencePredicate, LoopOperands, PredicateOperator};

        let mut loop_instr = IrInstruction::new(0, Opcode::Loop);
        loop_instr.loop_operands = Some(LoopOperands {
            iterator_register: 0,
            max_iterations: 5,
            timeout_ms: u64::MAX,
            body_start_index: 1,
            exit_index: 2,
            // Register 9 is never written, so `exists` never holds — the loop
            // can only terminate via the max_iterations cap.
            convergence_predicate: Some(ConvergencePredicate { register: 9, operator: PredicateOperator::Exists, value: Value::Null }),
            fallback_instruction: None,
        });
        let mut body = IrInstruction::new(1, Opcode::StoreMemory);
        body.dest = Some(0);
        body.operands = serde_json::json!(1);
        let mut exit = IrInstruction::new(2, Opcode::Return);
        exit.src = vec![0];

        let mut instructions = BTreeMap::new();
        instructions.insert(0, loop_instr);
        instructions.insert(1, body);
        instructions.insert(2, exit);
        let artifact = trivial_artifact(instructions, vec![0, 1, 2], 0);
        let interp = interpreter();

        let next_ip = interp.run_loop_body(&artifact, artifact.instruction(0).unwrap(), 0, &mut HashMap::new()).unwrap();
        assert_eq!(next_ip, 2, "loop must hand control to the exit instruction, never looping past max_iterations");
    }

    #[test]
    fn loop_timeout_guard_respects_disabled_and_exceeded_cases() {
        assert!(!loop_timeout_exceeded(10_000, 0), "timeout_ms=0 must disable the guard");
        assert!(!loop_timeout_exceeded(40, 50), "under the deadline must not trip");
        assert!(loop_timeout_exceeded(60, 50), "past the deadline must trip");
    }

}
