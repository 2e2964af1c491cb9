//! Wires the core components and the support skills into a ready-to-run desk.

use std::sync::Arc;

use switchyard_core::{
    BlueprintRegistry, CapabilityRoute, CapabilityTable, CircuitBreakers, CoreConfig, CoreResult,
    ExecutionPlanner, FreshnessPolicy, IdempotencyLedger, IntentRouter, KvStore, ModelProvider,
    Orchestrator, PlanExecutor, ProviderRouter, RateLimiters, RetryExecutor, RouterConfig,
    SessionStore, SharedSink, ToolDispatcher,
};

use crate::classifier::KeywordClassifier;
use crate::handoff::HandoffQueue;
use crate::knowledge::{KnowledgeProvider, StaticKnowledgeBase};
use crate::model::MockModelProvider;
use crate::tools::{support_tools, SupportBackend};

pub const PRIMARY_MODEL: &str = "mock-primary";
pub const SECONDARY_MODEL: &str = "mock-secondary";
pub const HELP_CENTER: &str = "help-center";

/// Mock model pair plus the help-center knowledge provider.
pub fn default_providers() -> Vec<Arc<dyn ModelProvider>> {
    vec![
        Arc::new(MockModelProvider::new(PRIMARY_MODEL)),
        Arc::new(MockModelProvider::new(SECONDARY_MODEL)),
        Arc::new(KnowledgeProvider::new(
            HELP_CENTER,
            Arc::new(StaticKnowledgeBase::help_center()),
            FreshnessPolicy::default(),
        )),
    ]
}

/// Routes used when the configuration declares none.
pub fn default_routes() -> Vec<CapabilityRoute> {
    vec![
        CapabilityRoute {
            capability: "support.reply".into(),
            providers: vec![PRIMARY_MODEL.into(), SECONDARY_MODEL.into()],
            ..CapabilityRoute::default()
        },
        CapabilityRoute {
            capability: "knowledge.search".into(),
            providers: vec![HELP_CENTER.into()],
            ..CapabilityRoute::default()
        },
    ]
}

pub struct SupportDesk {
    pub orchestrator: Arc<Orchestrator>,
    pub backend: Arc<SupportBackend>,
    pub handoffs: Arc<HandoffQueue>,
    pub breakers: Arc<CircuitBreakers>,
    pub providers: Arc<ProviderRouter>,
}

impl SupportDesk {
    pub fn build(config: &CoreConfig, store: Arc<dyn KvStore>, events: SharedSink) -> CoreResult<Self> {
        Self::assemble(config, store, events, default_providers())
    }

    /// Like [`SupportDesk::build`] with an explicit provider set.
    pub fn assemble(
        config: &CoreConfig,
        store: Arc<dyn KvStore>,
        events: SharedSink,
        providers: Vec<Arc<dyn ModelProvider>>,
    ) -> CoreResult<Self> {
        config.check()?;
        let breakers = CircuitBreakers::shared(config.breaker.clone(), events.clone());
        let retry = RetryExecutor::new(breakers.clone())
            .with_limits(RateLimiters::shared(config.rate_limit.clone()));

        let backend = Arc::new(SupportBackend::demo());
        let tools = ToolDispatcher::new(
            Arc::new(support_tools(backend.clone())),
            retry.clone(),
            IdempotencyLedger::new(store.clone()),
            config.retry.clone(),
        );

        let mut router_config = config.router.clone();
        if router_config.routes.is_empty() {
            router_config = RouterConfig {
                routes: default_routes(),
                ..router_config
            };
        }
        let mut router = ProviderRouter::new(
            router_config,
            config.guardrails.clone(),
            retry.clone(),
            config.retry.clone(),
            events.clone(),
        );
        for provider in providers {
            router.register(provider);
        }
        let router = Arc::new(router);

        let blueprints = BlueprintRegistry::default_blueprint();
        let capabilities = CapabilityTable::support_defaults();
        blueprints.check_capabilities(&capabilities)?;

        let planner = ExecutionPlanner::new(config.planner.clone(), Arc::new(blueprints), capabilities);
        let executor = PlanExecutor::new(
            router.clone(),
            Arc::new(tools),
            events.clone(),
            config.planner.max_parallelism,
        );
        let intents = IntentRouter::new(Arc::new(KeywordClassifier::new()), retry, config.intent.clone());
        let handoffs = Arc::new(HandoffQueue::new());
        let orchestrator = Orchestrator::new(
            SessionStore::new(store),
            intents,
            planner,
            executor,
            handoffs.clone(),
            events,
            config.session.clone(),
        );

        tracing::info!(target: "switchyard::skills", app = %config.app_name, capabilities = ?router.capabilities(), "support desk ready");
        Ok(Self {
            orchestrator: Arc::new(orchestrator),
            backend,
            handoffs,
            breakers,
            providers: router,
        })
    }
}
