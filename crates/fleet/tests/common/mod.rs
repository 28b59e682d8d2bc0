//! In-memory cluster client and connector shared by the integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use fleet::{
    ClientError, ClusterClient, ClusterSnapshot, Connector, GuestType, MigrateOptions, Node,
    Profile, RemoteTaskStatus, Vm, VmStatus,
};

// =============================================================================
// Fixtures
// =============================================================================

pub fn node(name: &str) -> Node {
    Node {
        name: name.to_string(),
        online: true,
        cpu_usage: 0.25,
        memory_used: 4 << 30,
        memory_total: 16 << 30,
        uptime: 86_400,
        version: "pve-manager/8.2.4".to_string(),
        source_profile: String::new(),
    }
}

pub fn vm(id: u32, node: &str, status: VmStatus) -> Vm {
    Vm {
        id,
        name: format!("guest-{id}"),
        node: node.to_string(),
        guest: GuestType::Qemu,
        status,
        uptime: if status == VmStatus::Running { 3_600 } else { 0 },
        source_profile: String::new(),
    }
}

pub fn snapshot(nodes: &[&str], vms: Vec<Vm>) -> ClusterSnapshot {
    ClusterSnapshot {
        cluster_name: Some("test".to_string()),
        nodes: nodes.iter().map(|n| node(n)).collect(),
        vms,
    }
}

pub fn profile(name: &str) -> Profile {
    let mut profile = Profile::new(name, format!("https://{name}.example.com:8006")).with_group("homelab");
    profile.user = "root".to_string();
    profile.password = Some("secret".to_string());
    profile
}

// =============================================================================
// Fake cluster
// =============================================================================

/// How a status or refresh call misbehaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Fault {
    #[default]
    None,
    /// Never returns.
    Hang,
    Panic,
}

/// Cluster whose lifecycle calls mutate an in-memory guest list.
#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<ClusterSnapshot>,
    refresh_error: Mutex<Option<ClientError>>,
    refresh_fault: Mutex<Fault>,
    op_error: Mutex<Option<ClientError>>,
    /// When set, lifecycle calls succeed but leave guest state unchanged.
    frozen: Mutex<bool>,
    op_delay: Mutex<Duration>,
    calls: Mutex<Vec<String>>,
    status_polls: AtomicUsize,
    status_fault: Mutex<Fault>,
    /// Exit status reported by remote tasks. Guest state is left alone
    /// when it is not "OK".
    task_exit: Mutex<Option<String>>,
    /// Remote task polls that report "running" before the task stops.
    task_running_polls: AtomicUsize,
    task_polls: AtomicUsize,
}

impl FakeCluster {
    pub fn new(snapshot: ClusterSnapshot) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(snapshot),
            ..Self::default()
        })
    }

    pub fn fail_refresh(&self, error: Option<ClientError>) {
        *self.refresh_error.lock().unwrap() = error;
    }

    pub fn set_refresh_fault(&self, fault: Fault) {
        *self.refresh_fault.lock().unwrap() = fault;
    }

    pub fn set_status_fault(&self, fault: Fault) {
        *self.status_fault.lock().unwrap() = fault;
    }

    /// Make remote tasks stop with this exit status instead of "OK".
    pub fn fail_remote_tasks(&self, exit_status: &str) {
        *self.task_exit.lock().unwrap() = Some(exit_status.to_string());
    }

    /// Keep each remote task running for this many status polls.
    pub fn set_task_running_polls(&self, polls: usize) {
        self.task_running_polls.store(polls, Ordering::SeqCst);
    }

    pub fn task_polls(&self) -> usize {
        self.task_polls.load(Ordering::SeqCst)
    }

    pub fn fail_operations(&self, error: Option<ClientError>) {
        *self.op_error.lock().unwrap() = error;
    }

    pub fn freeze(&self) {
        *self.frozen.lock().unwrap() = true;
    }

    pub fn set_op_delay(&self, delay: Duration) {
        *self.op_delay.lock().unwrap() = delay;
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn status_polls(&self) -> usize {
        self.status_polls.load(Ordering::SeqCst)
    }

    pub fn guest(&self, id: u32) -> Option<Vm> {
        self.state.lock().unwrap().vms.iter().find(|v| v.id == id).cloned()
    }

    async fn lifecycle(&self, call: &str, vm: &Vm, apply: impl FnOnce(&mut Vec<Vm>)) -> Result<String, ClientError> {
        self.calls.lock().unwrap().push(format!("{call}:{}", vm.id));
        let delay = *self.op_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = self.op_error.lock().unwrap().clone() {
            return Err(err);
        }
        let remote_failure = self.task_exit.lock().unwrap().is_some();
        if !*self.frozen.lock().unwrap() && !remote_failure {
            apply(&mut self.state.lock().unwrap().vms);
        }
        Ok(format!("UPID:{}:{call}:{}", vm.node, vm.id))
    }
}

fn set_status(vms: &mut [Vm], id: u32, status: VmStatus, uptime: u64) {
    if let Some(vm) = vms.iter_mut().find(|v| v.id == id) {
        vm.status = status;
        vm.uptime = uptime;
    }
}

#[async_trait]
impl ClusterClient for FakeCluster {
    async fn cluster_resources(&self) -> Result<ClusterSnapshot, ClientError> {
        let fault = *self.refresh_fault.lock().unwrap();
        match fault {
            Fault::None => {}
            Fault::Hang => std::future::pending::<()>().await,
            Fault::Panic => panic!("resource listing bug"),
        }
        if let Some(err) = self.refresh_error.lock().unwrap().clone() {
            return Err(err);
        }
        Ok(self.state.lock().unwrap().clone())
    }

    async fn vm_status(&self, node: &str, vmid: u32) -> Result<Vm, ClientError> {
        self.status_polls.fetch_add(1, Ordering::SeqCst);
        let fault = *self.status_fault.lock().unwrap();
        match fault {
            Fault::None => {}
            Fault::Hang => std::future::pending::<()>().await,
            Fault::Panic => panic!("status decode bug"),
        }
        self.state
            .lock()
            .unwrap()
            .vms
            .iter()
            .find(|v| v.id == vmid && v.node == node)
            .cloned()
            .ok_or_else(|| ClientError::NotFound(format!("{node}/{vmid}")))
    }

    async fn task_status(&self, _node: &str, _upid: &str) -> Result<RemoteTaskStatus, ClientError> {
        self.task_polls.fetch_add(1, Ordering::SeqCst);
        let still_running = self
            .task_running_polls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if still_running {
            return Ok(RemoteTaskStatus {
                running: true,
                exit_status: None,
            });
        }
        let exit_status = self
            .task_exit
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| "OK".to_string());
        Ok(RemoteTaskStatus {
            running: false,
            exit_status: Some(exit_status),
        })
    }

    async fn start_vm(&self, vm: &Vm) -> Result<String, ClientError> {
        let id = vm.id;
        self.lifecycle("start", vm, |vms| set_status(vms, id, VmStatus::Running, 1)).await
    }

    async fn shutdown_vm(&self, vm: &Vm) -> Result<String, ClientError> {
        let id = vm.id;
        self.lifecycle("shutdown", vm, |vms| set_status(vms, id, VmStatus::Stopped, 0)).await
    }

    async fn stop_vm(&self, vm: &Vm) -> Result<String, ClientError> {
        let id = vm.id;
        self.lifecycle("stop", vm, |vms| set_status(vms, id, VmStatus::Stopped, 0)).await
    }

    async fn restart_vm(&self, vm: &Vm) -> Result<String, ClientError> {
        let id = vm.id;
        self.lifecycle("restart", vm, |vms| set_status(vms, id, VmStatus::Running, 1)).await
    }

    async fn reset_vm(&self, vm: &Vm) -> Result<String, ClientError> {
        let id = vm.id;
        self.lifecycle("reset", vm, |vms| set_status(vms, id, VmStatus::Running, 1)).await
    }

    async fn migrate_vm(&self, vm: &Vm, options: &MigrateOptions) -> Result<String, ClientError> {
        let id = vm.id;
        let target = options.target_node.clone();
        self.lifecycle("migrate", vm, move |vms| {
            if let Some(vm) = vms.iter_mut().find(|v| v.id == id) {
                vm.node = target;
            }
        })
        .await
    }

    async fn delete_vm(&self, vm: &Vm, _force: bool) -> Result<String, ClientError> {
        let id = vm.id;
        self.lifecycle("delete", vm, |vms| vms.retain(|v| v.id != id)).await
    }
}

// =============================================================================
// Fake connector
// =============================================================================

/// What connecting a profile does.
#[derive(Clone)]
pub enum Behavior {
    Connect(Arc<FakeCluster>),
    Fail(ClientError),
    /// Never settles.
    Hang,
    Panic,
}

#[derive(Default)]
pub struct FakeConnector {
    behaviors: Mutex<HashMap<String, Behavior>>,
    attempts: AtomicUsize,
}

impl FakeConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set(&self, profile: &str, behavior: Behavior) {
        self.behaviors
            .lock()
            .unwrap()
            .insert(profile.to_string(), behavior);
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, profile: &Profile) -> Result<Arc<dyn ClusterClient>, ClientError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let behavior = self
            .behaviors
            .lock()
            .unwrap()
            .get(&profile.name)
            .cloned()
            .unwrap_or_else(|| Behavior::Fail(ClientError::Unreachable(profile.addr.clone())));

        match behavior {
            Behavior::Connect(cluster) => Ok(cluster as Arc<dyn ClusterClient>),
            Behavior::Fail(err) => Err(err),
            Behavior::Hang => std::future::pending().await,
            Behavior::Panic => panic!("connector bug for {}", profile.name),
        }
    }
}
