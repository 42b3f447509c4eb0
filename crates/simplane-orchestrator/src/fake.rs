//! Scripted in-memory orchestrator
//!
//! Behaves like a cluster that never runs anything on its own: tests decide
//! what each unit reports by queueing states, and can inject outages,
//! submission failures and hanging calls.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;

use crate::compiler::{compile_unit, compile_upload};
use crate::{
    upload_unit_name, AncillaryRef, NodeInfo, Orchestrator, OrchestratorError, ScopeSpec,
    UnitHandle, UnitSpec, UnitState, UploadSpec,
};

#[derive(Debug)]
struct FakeUnit {
    current: UnitState,
    queued: VecDeque<UnitState>,
    output: Option<String>,
}

impl FakeUnit {
    fn new() -> Self {
        Self {
            current: UnitState::waiting(),
            queued: VecDeque::new(),
            output: None,
        }
    }
}

#[derive(Debug, Default)]
struct State {
    scopes: BTreeMap<String, (ScopeSpec, u32)>,
    units: BTreeMap<(String, String), FakeUnit>,
    submitted: Vec<UnitSpec>,
    uploads: Vec<UploadSpec>,
    ancillary: Vec<AncillaryRef>,
    nodes: Vec<NodeInfo>,
    fail_submissions: bool,
    unavailable: bool,
    hanging: BTreeSet<String>,
    calls: BTreeMap<&'static str, u32>,
}

/// In-memory [`Orchestrator`] driven by test scripts
#[derive(Debug, Default)]
pub struct FakeOrchestrator {
    state: Mutex<State>,
}

impl FakeOrchestrator {
    /// Create an empty cluster
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record a call and fail if the cluster is scripted to be down
    fn enter(&self, operation: &'static str) -> Result<(), OrchestratorError> {
        let mut state = self.lock();
        *state.calls.entry(operation).or_default() += 1;
        if state.unavailable {
            return Err(OrchestratorError::Unavailable(format!(
                "{operation}: connection refused"
            )));
        }
        Ok(())
    }

    fn hangs(&self, name: &str) -> bool {
        self.lock().hanging.contains(name)
    }

    /// Replace the node list
    pub fn set_nodes(&self, nodes: Vec<NodeInfo>) {
        self.lock().nodes = nodes;
    }

    /// Make every call fail as if the API server were unreachable
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    /// Make unit submissions fail
    pub fn fail_submissions(&self, fail: bool) {
        self.lock().fail_submissions = fail;
    }

    /// Make state and output queries for `unit_name` never return
    pub fn hang_unit(&self, unit_name: &str) {
        self.lock().hanging.insert(unit_name.to_string());
    }

    /// Set what a unit reports right now, dropping any queued states
    ///
    /// Creates the unit if it does not exist.
    pub fn set_unit_state(&self, scope: &str, name: &str, unit_state: UnitState) {
        let mut state = self.lock();
        let unit = state
            .units
            .entry((scope.to_string(), name.to_string()))
            .or_insert_with(FakeUnit::new);
        unit.queued.clear();
        unit.current = unit_state;
    }

    /// Queue states returned by successive `unit_state` calls
    ///
    /// Once the queue drains the last state keeps being reported.
    pub fn script_unit(&self, scope: &str, name: &str, states: Vec<UnitState>) {
        let mut state = self.lock();
        let unit = state
            .units
            .entry((scope.to_string(), name.to_string()))
            .or_insert_with(FakeUnit::new);
        unit.queued.extend(states);
    }

    /// Set the output a unit's execution has printed
    pub fn set_output(&self, scope: &str, name: &str, output: impl Into<String>) {
        let mut state = self.lock();
        let unit = state
            .units
            .entry((scope.to_string(), name.to_string()))
            .or_insert_with(FakeUnit::new);
        unit.output = Some(output.into());
    }

    /// Forget a unit, as the orchestrator does after the finished TTL
    pub fn remove_unit(&self, scope: &str, name: &str) {
        self.lock()
            .units
            .remove(&(scope.to_string(), name.to_string()));
    }

    /// Add an ancillary object directly
    pub fn add_ancillary(&self, ancillary: AncillaryRef) {
        self.lock().ancillary.push(ancillary);
    }

    /// Ancillary objects currently present
    pub fn ancillary(&self) -> Vec<AncillaryRef> {
        self.lock().ancillary.clone()
    }

    /// Last applied spec for a scope
    pub fn scope(&self, name: &str) -> Option<ScopeSpec> {
        self.lock().scopes.get(name).map(|(spec, _)| spec.clone())
    }

    /// Number of times a scope has been applied
    pub fn scope_applies(&self, name: &str) -> u32 {
        self.lock().scopes.get(name).map_or(0, |(_, n)| *n)
    }

    /// Number of distinct scopes
    pub fn scope_count(&self) -> usize {
        self.lock().scopes.len()
    }

    /// Units accepted so far, in submission order
    pub fn submitted(&self) -> Vec<UnitSpec> {
        self.lock().submitted.clone()
    }

    /// Upload units accepted so far
    pub fn uploads(&self) -> Vec<UploadSpec> {
        self.lock().uploads.clone()
    }

    /// Number of calls made to an operation, by trait method name
    pub fn calls(&self, operation: &str) -> u32 {
        self.lock().calls.get(operation).copied().unwrap_or(0)
    }
}

#[async_trait]
impl Orchestrator for FakeOrchestrator {
    async fn ensure_scope(&self, scope: &ScopeSpec) -> Result<(), OrchestratorError> {
        self.enter("ensure_scope")?;
        let mut state = self.lock();
        let entry = state
            .scopes
            .entry(scope.name.clone())
            .or_insert_with(|| (scope.clone(), 0));
        entry.0 = scope.clone();
        entry.1 += 1;
        Ok(())
    }

    async fn submit_unit(&self, unit: &UnitSpec) -> Result<UnitHandle, OrchestratorError> {
        self.enter("submit_unit")?;
        let compiled = compile_unit(unit)?;

        let mut state = self.lock();
        if !state.scopes.contains_key(&unit.scope) {
            return Err(OrchestratorError::not_found("namespace", &unit.scope));
        }
        if state.fail_submissions {
            return Err(OrchestratorError::Unavailable(
                "admission webhook rejected the unit".to_string(),
            ));
        }

        let now = Utc::now();
        let ancillary: Vec<String> = compiled
            .payload
            .iter()
            .filter_map(|cm| cm.metadata.name.clone())
            .collect();
        for name in &ancillary {
            state.ancillary.push(AncillaryRef {
                scope: unit.scope.clone(),
                name: name.clone(),
                job_id: Some(unit.job_id),
                created_at: Some(now),
            });
        }
        state
            .units
            .entry((unit.scope.clone(), unit.name.clone()))
            .or_insert_with(FakeUnit::new);
        state.submitted.push(unit.clone());

        Ok(UnitHandle {
            scope: unit.scope.clone(),
            name: unit.name.clone(),
            ancillary,
        })
    }

    async fn unit_state(&self, scope: &str, name: &str) -> Result<UnitState, OrchestratorError> {
        self.enter("unit_state")?;
        if self.hangs(name) {
            std::future::pending::<()>().await;
        }
        let mut state = self.lock();
        match state.units.get_mut(&(scope.to_string(), name.to_string())) {
            Some(unit) => {
                if let Some(next) = unit.queued.pop_front() {
                    unit.current = next;
                }
                Ok(unit.current)
            }
            None => Ok(UnitState::missing()),
        }
    }

    async fn read_recent_output(
        &self,
        scope: &str,
        unit_name: &str,
        max_lines: u32,
    ) -> Result<String, OrchestratorError> {
        self.enter("read_recent_output")?;
        if self.hangs(unit_name) {
            std::future::pending::<()>().await;
        }
        let state = self.lock();
        let output = state
            .units
            .get(&(scope.to_string(), unit_name.to_string()))
            .and_then(|u| u.output.clone())
            .ok_or_else(|| OrchestratorError::not_found("pod", unit_name))?;

        let lines: Vec<&str> = output.lines().collect();
        let skip = lines.len().saturating_sub(max_lines as usize);
        Ok(lines[skip..].join("\n"))
    }

    async fn list_ancillary(&self) -> Result<Vec<AncillaryRef>, OrchestratorError> {
        self.enter("list_ancillary")?;
        Ok(self.lock().ancillary.clone())
    }

    async fn delete_ancillary(&self, scope: &str, name: &str) -> Result<(), OrchestratorError> {
        self.enter("delete_ancillary")?;
        self.lock()
            .ancillary
            .retain(|a| !(a.scope == scope && a.name == name));
        Ok(())
    }

    async fn submit_upload(&self, upload: &UploadSpec) -> Result<(), OrchestratorError> {
        self.enter("submit_upload")?;
        compile_upload(upload)?;
        let mut state = self.lock();
        let name = upload_unit_name(&upload.job_id);
        let key = (upload.scope.clone(), name);
        if state.units.contains_key(&key) {
            return Ok(());
        }
        state.units.insert(key, FakeUnit::new());
        state.uploads.push(upload.clone());
        Ok(())
    }

    async fn list_nodes(&self) -> Result<Vec<NodeInfo>, OrchestratorError> {
        self.enter("list_nodes")?;
        Ok(self.lock().nodes.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use uuid::Uuid;

    fn scope() -> ScopeSpec {
        ScopeSpec {
            name: "acme".to_string(),
            tenant_id: "acme".to_string(),
            cpu_limit: 10,
            memory_limit_gi: 20,
            pod_cap: 2,
            volume_size_gi: 10,
        }
    }

    fn unit(payload: Option<Vec<u8>>) -> UnitSpec {
        let job_id = Uuid::new_v4();
        UnitSpec {
            scope: "acme".to_string(),
            name: format!("sim-{}", job_id.simple()),
            job_id,
            cpu_request: 1,
            memory_gi: 1,
            env: BTreeMap::new(),
            config_file: payload.as_ref().map(|_| "grid.sumocfg".to_string()),
            payload,
            config_suffix: ".sumocfg".to_string(),
            scenarios_dir: "/scenarios".to_string(),
            image: "sumo".to_string(),
            deadline: Duration::from_secs(60),
            finished_ttl: Duration::from_secs(60),
            node_selector: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn story_scripted_states_play_in_order_then_stick() {
        let fake = FakeOrchestrator::new();
        fake.ensure_scope(&scope()).await.unwrap();
        let spec = unit(None);
        fake.submit_unit(&spec).await.unwrap();
        fake.script_unit(
            "acme",
            &spec.name,
            vec![UnitState::active(), UnitState::succeeded()],
        );

        assert_eq!(
            fake.unit_state("acme", &spec.name).await.unwrap(),
            UnitState::active()
        );
        assert_eq!(
            fake.unit_state("acme", &spec.name).await.unwrap(),
            UnitState::succeeded()
        );
        assert_eq!(
            fake.unit_state("acme", &spec.name).await.unwrap(),
            UnitState::succeeded()
        );
        assert_eq!(fake.calls("unit_state"), 3);
    }

    #[tokio::test]
    async fn story_submission_needs_a_scope_and_records_payload_chunks() {
        let fake = FakeOrchestrator::new();
        let spec = unit(Some(b"PK".to_vec()));
        assert!(fake.submit_unit(&spec).await.unwrap_err().is_not_found());

        fake.ensure_scope(&scope()).await.unwrap();
        let handle = fake.submit_unit(&spec).await.unwrap();
        assert_eq!(handle.ancillary.len(), 1);
        assert_eq!(fake.ancillary()[0].job_id, Some(spec.job_id));
    }

    #[tokio::test]
    async fn test_outage_fails_every_call() {
        let fake = FakeOrchestrator::new();
        fake.set_unavailable(true);
        assert!(fake.list_nodes().await.unwrap_err().is_retryable());
        assert!(fake.unit_state("acme", "sim-x").await.is_err());
    }

    #[tokio::test]
    async fn test_output_is_tailed() {
        let fake = FakeOrchestrator::new();
        fake.set_output("acme", "sim-x", "a\nb\nc");
        assert_eq!(
            fake.read_recent_output("acme", "sim-x", 2).await.unwrap(),
            "b\nc"
        );
        assert!(fake
            .read_recent_output("acme", "sim-y", 2)
            .await
            .unwrap_err()
            .is_not_found());
    }
}
