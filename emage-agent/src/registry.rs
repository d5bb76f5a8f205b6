//! Agent registry: one live agent per base station, and the embedding API around it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use emage_core::{AgentCore, AgentOps, EnbId, LocalEvent, OpsError, Trigger, TriggerKind};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::connection::{self, ControllerConfig, Link, ReportOutcome};
use crate::error::AgentError;

struct Agent {
    core: Arc<AgentCore>,
    link: Arc<Link>,
    task: Mutex<Option<JoinHandle<()>>>,
    /// Held by `start` until `init` has returned and the session task is spawned.
    starting: tokio::sync::Mutex<()>,
    initialized: AtomicBool,
}

/// Cheap handle to a started agent, for the technology layer that started it.
#[derive(Clone)]
pub struct AgentHandle {
    core: Arc<AgentCore>,
    link: Arc<Link>,
}

impl AgentHandle {
    pub fn enb_id(&self) -> EnbId {
        self.core.enb_id()
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_connected()
    }

    pub fn has_trigger(&self, trigger_id: i32, kind: TriggerKind) -> bool {
        self.core.triggers().is_active(trigger_id, kind)
    }

    /// Triggers of `kind` currently armed on this agent.
    pub fn armed(&self, kind: TriggerKind) -> Vec<Trigger> {
        self.core.triggers().armed(kind)
    }

    /// See [`Registry::report`].
    pub async fn report<F>(
        &self,
        trigger_id: i32,
        event: LocalEvent,
        build: F,
    ) -> Result<ReportOutcome, AgentError>
    where
        F: FnOnce() -> Vec<u8>,
    {
        match self.core.prepare_report(trigger_id, event, build) {
            Some(report) => self.link.send_report(&report).await,
            None => Ok(ReportOutcome::Skipped),
        }
    }
}

/// Owns every agent in the process. Create one at startup; call [`Registry::stop`] on the way
/// out so each technology layer sees its `release`.
pub struct Registry {
    agents: Mutex<HashMap<EnbId, Arc<Agent>>>,
    config: ControllerConfig,
}

impl Registry {
    /// `config` is used by [`Registry::start`]; [`Registry::start_with`] overrides it per agent.
    pub fn new(config: ControllerConfig) -> Self {
        Self {
            agents: Mutex::new(HashMap::new()),
            config,
        }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    fn agents(&self) -> MutexGuard<'_, HashMap<EnbId, Arc<Agent>>> {
        self.agents.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn agent(&self, enb_id: EnbId) -> Result<Arc<Agent>, AgentError> {
        self.agents()
            .get(&enb_id)
            .cloned()
            .ok_or(AgentError::NotFound(enb_id))
    }

    /// Register an agent for `enb_id`, run the technology `init` and start the controller
    /// session. If `init` fails the agent is removed again and its error returned.
    pub async fn start(
        &self,
        ops: Arc<dyn AgentOps>,
        enb_id: EnbId,
    ) -> Result<AgentHandle, AgentError> {
        self.start_with(ops, enb_id, self.config.clone()).await
    }

    pub async fn start_with(
        &self,
        ops: Arc<dyn AgentOps>,
        enb_id: EnbId,
        config: ControllerConfig,
    ) -> Result<AgentHandle, AgentError> {
        let agent = Arc::new(Agent {
            core: Arc::new(AgentCore::new(enb_id, ops.clone())),
            link: Arc::new(Link::new(enb_id, config.report_buffer)),
            task: Mutex::new(None),
            starting: tokio::sync::Mutex::new(()),
            initialized: AtomicBool::new(false),
        });
        // Not shared yet, so this never waits.
        let starting = agent.starting.lock().await;
        {
            let mut agents = self.agents();
            if agents.contains_key(&enb_id) {
                return Err(AgentError::AlreadyExists(enb_id));
            }
            agents.insert(enb_id, agent.clone());
        }

        let init = tokio::task::spawn_blocking(move || ops.init())
            .await
            .unwrap_or_else(|e| Err(OpsError::Failed(e.to_string())));
        if let Err(e) = init {
            warn!(enb_id, error = %e, "technology init failed, agent not started");
            let mut agents = self.agents();
            if agents.get(&enb_id).is_some_and(|a| Arc::ptr_eq(a, &agent)) {
                agents.remove(&enb_id);
            }
            return Err(AgentError::Init(e));
        }
        agent.initialized.store(true, Ordering::Release);

        {
            // Spawn under the map lock so a concurrent terminate either sees the task or
            // has already removed the agent.
            let agents = self.agents();
            if !agents.get(&enb_id).is_some_and(|a| Arc::ptr_eq(a, &agent)) {
                // Terminated during init; the terminating caller runs release.
                return Err(AgentError::NotFound(enb_id));
            }
            let task = tokio::spawn(connection::run(
                agent.core.clone(),
                agent.link.clone(),
                config.clone(),
                agent.link.closed(),
            ));
            *agent.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);
        }
        drop(starting);
        info!(enb_id, controller = %config.addr, "agent started");
        Ok(AgentHandle {
            core: agent.core.clone(),
            link: agent.link.clone(),
        })
    }

    /// Stop the agent's session, wait for its loop to exit, run the technology `release`
    /// and drop its triggers. An agent still in `init` is terminated once `init` returns;
    /// if `init` failed there is nothing to release and `NotFound` is returned.
    pub async fn terminate(&self, enb_id: EnbId) -> Result<(), AgentError> {
        let agent = self
            .agents()
            .remove(&enb_id)
            .ok_or(AgentError::NotFound(enb_id))?;

        agent.link.close();
        drop(agent.starting.lock().await);
        if !agent.initialized.load(Ordering::Acquire) {
            return Err(AgentError::NotFound(enb_id));
        }
        let task = agent
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(enb_id, error = %e, "session loop ended abnormally");
            }
        }
        agent.link.detach().await;

        let core = agent.core.clone();
        match tokio::task::spawn_blocking(move || core.ops().release()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(enb_id, error = %e, "technology release failed"),
            Err(e) => warn!(enb_id, error = %e, "technology release panicked"),
        }
        agent.core.triggers().clear();
        info!(enb_id, "agent terminated");
        Ok(())
    }

    /// Terminate every agent. Safe to call more than once.
    pub async fn stop(&self) {
        let ids: Vec<EnbId> = self.agents().keys().copied().collect();
        for enb_id in ids {
            // Another caller may have terminated it in between.
            let _ = self.terminate(enb_id).await;
        }
    }

    pub fn contains(&self, enb_id: EnbId) -> bool {
        self.agents().contains_key(&enb_id)
    }

    pub fn is_connected(&self, enb_id: EnbId) -> bool {
        self.agent(enb_id).is_ok_and(|a| a.link.is_connected())
    }

    /// Peek the trigger table before doing any work a report would need.
    pub fn has_trigger(&self, enb_id: EnbId, trigger_id: i32, kind: TriggerKind) -> bool {
        self.agent(enb_id)
            .is_ok_and(|a| a.core.triggers().is_active(trigger_id, kind))
    }

    /// Triggers of `kind` currently armed on `enb_id`.
    pub fn armed(&self, enb_id: EnbId, kind: TriggerKind) -> Vec<Trigger> {
        self.agent(enb_id)
            .map(|a| a.core.triggers().armed(kind))
            .unwrap_or_default()
    }

    /// Install a trigger locally, typically an agent-scheduled one with a negative id.
    pub fn arm_trigger(&self, enb_id: EnbId, trigger: Trigger) -> Result<(), AgentError> {
        self.agent(enb_id)?.core.triggers().arm(trigger)?;
        Ok(())
    }

    pub fn disarm_trigger(&self, enb_id: EnbId, trigger_id: i32) -> Result<(), AgentError> {
        self.agent(enb_id)?.core.triggers().disarm(trigger_id)?;
        Ok(())
    }

    /// Send a payload to the agent's controller.
    pub async fn send(&self, enb_id: EnbId, payload: &[u8]) -> Result<(), AgentError> {
        let agent = self.agent(enb_id)?;
        agent.link.send(payload).await
    }

    /// Report a local event under `trigger_id`. If no matching trigger is armed nothing is
    /// built and `Skipped` is returned; if the agent is offline the report is buffered.
    pub async fn report<F>(
        &self,
        enb_id: EnbId,
        trigger_id: i32,
        event: LocalEvent,
        build: F,
    ) -> Result<ReportOutcome, AgentError>
    where
        F: FnOnce() -> Vec<u8>,
    {
        let agent = self.agent(enb_id)?;
        AgentHandle {
            core: agent.core.clone(),
            link: agent.link.clone(),
        }
        .report(trigger_id, event, build)
        .await
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        // Without `stop` the loops would outlive the registry; release is skipped here.
        for agent in self.agents().values() {
            agent.link.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use emage_core::OpsResult;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[derive(Default)]
    struct Counters {
        init: AtomicUsize,
        init_done: AtomicUsize,
        release: AtomicUsize,
        init_done_at_release: AtomicUsize,
    }

    struct TestOps {
        counters: Arc<Counters>,
        fail_init: bool,
        fail_release: bool,
        init_delay: Duration,
    }

    impl TestOps {
        fn new(counters: Arc<Counters>) -> Self {
            Self {
                counters,
                fail_init: false,
                fail_release: false,
                init_delay: Duration::ZERO,
            }
        }
    }

    impl AgentOps for TestOps {
        fn init(&self) -> Result<(), OpsError> {
            self.counters.init.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(self.init_delay);
            self.counters.init_done.fetch_add(1, Ordering::SeqCst);
            if self.fail_init {
                return Err(OpsError::Code(-19));
            }
            Ok(())
        }

        fn release(&self) -> Result<(), OpsError> {
            let done = self.counters.init_done.load(Ordering::SeqCst);
            self.counters.init_done_at_release.store(done, Ordering::SeqCst);
            self.counters.release.fetch_add(1, Ordering::SeqCst);
            if self.fail_release {
                return Err(OpsError::Code(-1));
            }
            Ok(())
        }

        fn enb_setup_request(&self) -> OpsResult {
            Ok(None)
        }

        fn cell_setup_request(&self, _cell_id: u16) -> OpsResult {
            Ok(None)
        }
    }

    /// Points at a port nothing listens on, so agents stay disconnected.
    fn offline_registry() -> Registry {
        Registry::new(ControllerConfig {
            addr: "127.0.0.1:1".to_string(),
            reconnect_initial: Duration::from_millis(20),
            reconnect_max: Duration::from_millis(50),
            report_buffer: 5,
            ..ControllerConfig::default()
        })
    }

    #[tokio::test]
    async fn start_twice_is_rejected() {
        let reg = offline_registry();
        let counters = Arc::new(Counters::default());
        reg.start(Arc::new(TestOps::new(counters.clone())), 1)
            .await
            .unwrap();
        assert!(matches!(
            reg.start(Arc::new(TestOps::new(counters.clone())), 1).await,
            Err(AgentError::AlreadyExists(1))
        ));
        assert_eq!(counters.init.load(Ordering::SeqCst), 1);
        assert!(!reg.is_connected(1));
        reg.stop().await;
    }

    #[tokio::test]
    async fn failed_init_rolls_back() {
        let reg = offline_registry();
        let counters = Arc::new(Counters::default());
        let mut ops = TestOps::new(counters.clone());
        ops.fail_init = true;
        assert!(matches!(
            reg.start(Arc::new(ops), 4).await,
            Err(AgentError::Init(OpsError::Code(-19)))
        ));
        assert!(!reg.contains(4));
        // The id is free again.
        reg.start(Arc::new(TestOps::new(counters)), 4).await.unwrap();
        reg.stop().await;
    }

    #[tokio::test]
    async fn terminate_clears_triggers_even_if_release_fails() {
        let reg = offline_registry();
        let counters = Arc::new(Counters::default());
        let mut ops = TestOps::new(counters.clone());
        ops.fail_release = true;
        reg.start(Arc::new(ops), 2).await.unwrap();
        for id in [1, 2, -3] {
            reg.arm_trigger(2, Trigger::new(id, TriggerKind::CellStats, None))
                .unwrap();
        }
        assert!(reg.has_trigger(2, -3, TriggerKind::CellStats));

        reg.terminate(2).await.unwrap();
        assert_eq!(counters.release.load(Ordering::SeqCst), 1);
        for id in [1, 2, -3] {
            assert!(!reg.has_trigger(2, id, TriggerKind::CellStats));
        }
        assert!(matches!(
            reg.terminate(2).await,
            Err(AgentError::NotFound(2))
        ));
    }

    #[tokio::test]
    async fn handle_keeps_cleared_table_after_terminate() {
        let reg = offline_registry();
        let handle = reg
            .start(Arc::new(TestOps::new(Arc::default())), 6)
            .await
            .unwrap();
        reg.arm_trigger(6, Trigger::new(10, TriggerKind::RrcMeas, None))
            .unwrap();
        assert!(handle.has_trigger(10, TriggerKind::RrcMeas));
        reg.terminate(6).await.unwrap();
        assert!(!handle.has_trigger(10, TriggerKind::RrcMeas));
    }

    #[tokio::test]
    async fn report_gate_and_offline_buffering() {
        let reg = offline_registry();
        reg.start(Arc::new(TestOps::new(Arc::default())), 1)
            .await
            .unwrap();
        let builds = AtomicUsize::new(0);
        let build = || {
            builds.fetch_add(1, Ordering::SeqCst);
            vec![1, 2, 3]
        };
        let event = LocalEvent::new(TriggerKind::RrcMeas, Some(3));

        assert_eq!(
            reg.report(1, 10, event, build).await.unwrap(),
            ReportOutcome::Skipped
        );
        assert_eq!(builds.load(Ordering::SeqCst), 0);

        reg.arm_trigger(1, Trigger::new(10, TriggerKind::RrcMeas, Some(3)))
            .unwrap();
        assert_eq!(
            reg.report(1, 10, event, build).await.unwrap(),
            ReportOutcome::Buffered
        );
        assert_eq!(
            reg.report(1, 10, LocalEvent::new(TriggerKind::RrcMeas, Some(4)), build)
                .await
                .unwrap(),
            ReportOutcome::Skipped
        );
        assert_eq!(builds.load(Ordering::SeqCst), 1);
        assert!(matches!(
            reg.send(1, b"raw").await,
            Err(AgentError::NotConnected)
        ));
        reg.stop().await;
    }

    async fn wait_for(cond: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    #[tokio::test]
    async fn terminate_during_init_releases_after_init() {
        let reg = offline_registry();
        let counters = Arc::new(Counters::default());
        let mut ops = TestOps::new(counters.clone());
        ops.init_delay = Duration::from_millis(200);

        let (started, terminated) = tokio::join!(reg.start(Arc::new(ops), 3), async {
            wait_for(|| counters.init.load(Ordering::SeqCst) == 1).await;
            reg.terminate(3).await
        });
        assert!(matches!(started, Err(AgentError::NotFound(3))));
        terminated.unwrap();
        assert_eq!(counters.release.load(Ordering::SeqCst), 1);
        assert_eq!(counters.init_done_at_release.load(Ordering::SeqCst), 1);
        assert!(!reg.contains(3));
    }

    #[tokio::test]
    async fn terminate_during_failed_init_releases_nothing() {
        let reg = offline_registry();
        let counters = Arc::new(Counters::default());
        let mut ops = TestOps::new(counters.clone());
        ops.init_delay = Duration::from_millis(200);
        ops.fail_init = true;

        let (started, terminated) = tokio::join!(reg.start(Arc::new(ops), 3), async {
            wait_for(|| counters.init.load(Ordering::SeqCst) == 1).await;
            reg.terminate(3).await
        });
        assert!(matches!(started, Err(AgentError::Init(_))));
        assert!(matches!(terminated, Err(AgentError::NotFound(3))));
        assert_eq!(counters.release.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let reg = offline_registry();
        let counters = Arc::new(Counters::default());
        for id in 1..=3 {
            reg.start(Arc::new(TestOps::new(counters.clone())), id)
                .await
                .unwrap();
        }
        reg.stop().await;
        reg.stop().await;
        assert_eq!(counters.release.load(Ordering::SeqCst), 3);
        assert!(!reg.contains(1));
        assert!(matches!(
            reg.send(1, b"x").await,
            Err(AgentError::NotFound(1))
        ));
        assert!(reg.armed(2, TriggerKind::CellStats).is_empty());
    }
}
